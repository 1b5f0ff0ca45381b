//! One run of an instruction body on a dedicated worker thread.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use crate::conductor::Shared;
use crate::context::ExecutionContext;
use crate::coordinator;
use crate::environment::Environment;
use crate::error::ConductorError;
use crate::events::{now_ms, EventStream, OutputEvent};
use crate::path::InstructionPath;
use crate::procedure::{Executor, Instruction};
use crate::storage::{persist_yaml, record_name, Location};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ExecutionId(u64);

impl ExecutionId {
    pub(crate) fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionPhase {
    Created,
    Running,
    Completed,
    Stopped,
}

/// Cooperative cancellation for one execution.
///
/// Set while holding the conductor lock and followed by a notify, so a slot
/// wait loop that checked the token under the lock cannot miss it.
#[derive(Debug, Clone, Default)]
pub(crate) struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub(crate) fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Set once the worker has released every slot and closed every resource.
#[derive(Debug, Clone, Default)]
pub(crate) struct Completion(Arc<AtomicBool>);

impl Completion {
    fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub(crate) struct StartRequest<'a> {
    pub(crate) shared: &'a Arc<Shared>,
    pub(crate) id: ExecutionId,
    pub(crate) instruction: &'a Instruction,
    pub(crate) environment: &'a Arc<dyn Environment>,
    pub(crate) events: &'a Arc<EventStream>,
}

pub(crate) struct Execution {
    id: ExecutionId,
    path: InstructionPath,
    phase: ExecutionPhase,
    cancel: CancellationToken,
    completion: Completion,
    worker: Option<JoinHandle<()>>,
    location: Arc<dyn Location>,
}

impl Execution {
    /// Locate storage, persist the instruction record and launch the worker.
    ///
    /// Runs under the conductor lock; the worker blocks on that lock before it
    /// touches any slot.
    pub(crate) fn start(request: StartRequest<'_>) -> Result<Self, ConductorError> {
        let StartRequest {
            shared,
            id,
            instruction,
            environment,
            events,
        } = request;
        let path = instruction.path().clone();

        let location = shared
            .storage
            .locate_storage(&path)
            .map_err(|err| ConductorError::storage(path.to_string(), err))?;
        persist_yaml(
            location.as_ref(),
            &record_name(instruction.id()),
            &instruction.record(),
        )
        .map_err(|err| ConductorError::storage(location.describe(), err))?;

        let cancel = CancellationToken::default();
        let completion = Completion::default();
        let context = ExecutionContext::new(
            Arc::clone(shared),
            id,
            instruction.clone(),
            Arc::clone(&location),
            Arc::clone(environment),
            Arc::clone(events),
            cancel.clone(),
        );
        let worker = Worker {
            context,
            executor: Arc::clone(instruction.executor().executor()),
            completion: completion.clone(),
        };
        let handle = std::thread::Builder::new()
            .name(format!("instruction{path}"))
            .spawn(move || worker.run())
            .map_err(|err| {
                ConductorError::conductor(format!("failed to spawn worker for '{path}': {err}"))
            })?;

        info!(path = %path, execution = %id, "execution started");
        events.emit(OutputEvent::ExecutionStarted {
            ts_ms: now_ms(),
            path: path.clone(),
            execution: id,
        });
        Ok(Self {
            id,
            path,
            phase: ExecutionPhase::Running,
            cancel,
            completion,
            worker: Some(handle),
            location,
        })
    }

    pub(crate) fn id(&self) -> ExecutionId {
        self.id
    }

    pub(crate) fn completion(&self) -> Completion {
        self.completion.clone()
    }

    pub(crate) fn phase(&self) -> ExecutionPhase {
        if self.phase == ExecutionPhase::Running && self.completion.is_set() {
            ExecutionPhase::Completed
        } else {
            self.phase
        }
    }

    /// First half of `stop`, under the lock: signal the worker. The caller
    /// notifies waiters once its critical section ends.
    pub(crate) fn cancel(mut self) -> PendingStop {
        self.cancel.cancel();
        self.phase = ExecutionPhase::Stopped;
        debug!(path = %self.path, execution = %self.id, "execution cancelled");
        PendingStop {
            id: self.id,
            path: self.path,
            worker: self.worker.take(),
            location: self.location,
        }
    }
}

/// Second half of `stop`, run without the lock held.
#[must_use]
pub(crate) struct PendingStop {
    id: ExecutionId,
    path: InstructionPath,
    worker: Option<JoinHandle<()>>,
    location: Arc<dyn Location>,
}

impl PendingStop {
    /// Join the worker and delete the location's contents.
    pub(crate) fn finish(mut self) {
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!(path = %self.path, execution = %self.id, "worker thread panicked");
            }
        }
        if let Err(err) = self.location.clear() {
            error!(path = %self.path, "failed to clear execution storage: {err:#}");
        }
        debug!(path = %self.path, execution = %self.id, "execution stopped");
    }
}

struct Worker {
    context: ExecutionContext,
    executor: Arc<dyn Executor>,
    completion: Completion,
}

impl Worker {
    fn run(self) {
        let started = Instant::now();
        let span = self.context.span();
        let outcome = span.in_scope(|| {
            panic::catch_unwind(AssertUnwindSafe(|| self.executor.execute(&self.context)))
        });
        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(format!("{err:#}")),
            Err(payload) => Some(format!(
                "instruction body panicked: {}",
                panic_message(payload.as_ref())
            )),
        };
        let close_error = self.release();

        let path = self.context.path().clone();
        let execution = self.context.execution_id();
        let cancelled = self.context.is_cancelled();
        let message = match (&failure, &close_error) {
            (Some(body), Some(close)) => Some(format!("{body}; {close}")),
            (Some(body), None) => Some(body.clone()),
            (None, Some(close)) => Some(close.to_string()),
            (None, None) => None,
        };
        match &message {
            Some(message) if cancelled => {
                debug!(path = %path, execution = %execution, "cancelled run ended: {message}");
            }
            Some(message) => {
                error!(path = %path, execution = %execution, "execution failed: {message}");
                self.context.emit(OutputEvent::ExecutionFailed {
                    ts_ms: now_ms(),
                    path: path.clone(),
                    message: message.clone(),
                });
            }
            None => info!(path = %path, execution = %execution, "execution finished"),
        }
        self.context.emit(OutputEvent::ExecutionFinished {
            ts_ms: now_ms(),
            path,
            execution,
            success: message.is_none(),
            elapsed_ms: started.elapsed().as_millis(),
        });

        let shared = self.context.shared();
        {
            let _state = shared.lock();
            self.completion.set();
        }
        shared.notify_all();
    }

    /// Release every slot and close every resource.
    fn release(&self) -> Option<ConductorError> {
        let shared = self.context.shared();
        {
            let mut state = shared.lock();
            coordinator::terminate_if_current(
                &mut state,
                self.context.path(),
                self.context.execution_id(),
            );
        }
        shared.notify_all();

        let failures = self.context.close_resources();
        let close_error = ConductorError::from_close_failures(failures);
        if let Some(err) = &close_error {
            error!(path = %self.context.path(), "{err}");
        }
        close_error
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
