#![allow(dead_code)]

use std::env;
use std::ffi::{OsStr, OsString};
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use conductor::{
    Conductor, ConductorConfig, ConductorError, ExecutionContext, Executor, ExecutorRef,
    Instruction, InstructionPath, LocalEnvironment, MemoryStore, PlanningContext, Variables,
};

pub const TIMEOUT: Duration = Duration::from_secs(10);

static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

fn env_lock() -> MutexGuard<'static, ()> {
    match ENV_LOCK.get_or_init(|| Mutex::new(())).lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// RAII guard for test-only env var mutation, serialized with a global lock.
#[must_use]
pub struct EnvVarGuard {
    key: String,
    old: Option<OsString>,
    _lock: MutexGuard<'static, ()>,
}

impl EnvVarGuard {
    pub fn set<K: Into<String>, V: AsRef<OsStr>>(key: K, value: V) -> Self {
        let key = key.into();
        let lock = env_lock();
        let old = env::var_os(&key);
        env::set_var(&key, value);
        Self {
            key,
            old,
            _lock: lock,
        }
    }
}

impl Drop for EnvVarGuard {
    fn drop(&mut self) {
        match &self.old {
            Some(v) => env::set_var(&self.key, v),
            None => env::remove_var(&self.key),
        }
    }
}

pub fn unique_test_temp_dir(label: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let dir = env::temp_dir().join(format!(
        "conductor-{label}-{}-{nanos}",
        std::process::id()
    ));
    std::fs::create_dir_all(&dir).expect("failed to create temp dir");
    dir
}

pub fn path(raw: &str) -> InstructionPath {
    InstructionPath::parse(raw).expect("valid instruction path")
}

type PlanFn =
    dyn Fn(&mut dyn PlanningContext, &Variables) -> Result<(), ConductorError> + Send + Sync;
type BodyFn = dyn Fn(&ExecutionContext) -> anyhow::Result<()> + Send + Sync;

/// Executor assembled from closures.
pub struct Scripted {
    plan: Box<PlanFn>,
    body: Box<BodyFn>,
}

impl Executor for Scripted {
    fn plan(
        &self,
        planning: &mut dyn PlanningContext,
        variables: &Variables,
    ) -> Result<(), ConductorError> {
        (self.plan)(planning, variables)
    }

    fn execute(&self, context: &ExecutionContext) -> anyhow::Result<()> {
        (self.body)(context)
    }
}

pub fn scripted<P, B>(name: &str, plan: P, body: B) -> ExecutorRef
where
    P: Fn(&mut dyn PlanningContext, &Variables) -> Result<(), ConductorError>
        + Send
        + Sync
        + 'static,
    B: Fn(&ExecutionContext) -> anyhow::Result<()> + Send + Sync + 'static,
{
    ExecutorRef::new(
        name,
        Arc::new(Scripted {
            plan: Box::new(plan),
            body: Box::new(body),
        }),
    )
}

pub fn instruction(raw: &str, executor: &ExecutorRef) -> Instruction {
    let p = path(raw);
    let id = p.name().unwrap_or("root").to_string();
    Instruction::new(p, id, executor.clone())
}

pub fn conductor_with(environment: LocalEnvironment) -> (Conductor, Arc<MemoryStore>) {
    conductor::logging::init_for_tests();
    let store = Arc::new(MemoryStore::new());
    let conductor = Conductor::new(
        store.clone(),
        Arc::new(environment),
        ConductorConfig::default(),
    )
    .expect("conductor should build");
    (conductor, store)
}

pub fn conductor() -> (Conductor, Arc<MemoryStore>) {
    conductor_with(LocalEnvironment::new())
}

pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// A latch a test opens to let instruction bodies continue.
#[derive(Default)]
pub struct Gate {
    open: Mutex<bool>,
    changed: Condvar,
}

impl Gate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn open(&self) {
        *self.open.lock().unwrap() = true;
        self.changed.notify_all();
    }

    /// Wait until opened or the body's execution is cancelled.
    pub fn wait(&self, context: &ExecutionContext) -> bool {
        let deadline = Instant::now() + TIMEOUT;
        let mut open = self.open.lock().unwrap();
        while !*open {
            if context.is_cancelled() || Instant::now() >= deadline {
                return false;
            }
            open = self
                .changed
                .wait_timeout(open, Duration::from_millis(10))
                .unwrap()
                .0;
        }
        true
    }
}
