//! The session root: owns the shared monitor, the join pool and the
//! generation chain, and serialises every transition.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use tracing::{error, info, warn};

use crate::config::ConductorConfig;
use crate::environment::EnvironmentService;
use crate::error::ConductorError;
use crate::generation::{self, ConductorState, Output, PlannedProcedure};
use crate::procedure::Procedure;
use crate::storage::StorageConfiguration;
use crate::worker_pool::WorkerPool;

/// State shared by the conductor, every worker and every dependency handle.
///
/// One mutex guards all coordinators and slots; the condition variable is
/// notified after every change a blocked `acquire` or `prepare` could be
/// waiting for.
pub(crate) struct Shared {
    state: Mutex<ConductorState>,
    changed: Condvar,
    pub(crate) storage: Arc<dyn StorageConfiguration>,
}

impl Shared {
    pub(crate) fn lock(&self) -> MutexGuard<'_, ConductorState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn wait<'a>(
        &self,
        guard: MutexGuard<'a, ConductorState>,
    ) -> MutexGuard<'a, ConductorState> {
        self.changed
            .wait(guard)
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn wait_timeout<'a>(
        &self,
        guard: MutexGuard<'a, ConductorState>,
        timeout: Duration,
    ) -> MutexGuard<'a, ConductorState> {
        match self.changed.wait_timeout(guard, timeout) {
            Ok((guard, _)) => guard,
            Err(poisoned) => poisoned.into_inner().0,
        }
    }

    pub(crate) fn notify_all(&self) {
        self.changed.notify_all();
    }
}

/// Conducts one procedure at a time, superseding it live.
///
/// ```no_run
/// use std::sync::Arc;
/// use conductor::{Conductor, ConductorConfig, LocalEnvironment, MemoryStore, Procedure};
///
/// let conductor = Conductor::new(
///     Arc::new(MemoryStore::new()),
///     Arc::new(LocalEnvironment::new()),
///     ConductorConfig::default(),
/// )?;
/// let output = conductor.conduct(Procedure::new("empty", Vec::new())?)?;
/// assert!(output.procedure().is_some());
/// conductor.clear()?;
/// # Ok::<(), anyhow::Error>(())
/// ```
pub struct Conductor {
    shared: Arc<Shared>,
    environments: Arc<dyn EnvironmentService>,
    pool: WorkerPool,
    transitions: Mutex<()>,
}

impl Conductor {
    pub fn new(
        storage: Arc<dyn StorageConfiguration>,
        environments: Arc<dyn EnvironmentService>,
        config: ConductorConfig,
    ) -> Result<Self, ConductorError> {
        config.validate()?;
        let pool = WorkerPool::new("conductor-join", config.max_join_workers)
            .map_err(|err| ConductorError::conductor(format!("{err:#}")))?;
        Ok(Self {
            shared: Arc::new(Shared {
                state: Mutex::new(ConductorState::new(config.retained_generations)),
                changed: Condvar::new(),
                storage,
            }),
            environments,
            pool,
            transitions: Mutex::new(()),
        })
    }

    /// The current generation.
    pub fn output(&self) -> Output {
        generation::current_output(&self.shared)
    }

    /// Supersede the current generation with one conducting `procedure`.
    ///
    /// Instructions whose configuration is unchanged keep their running
    /// execution. On error the current generation stays in place.
    pub fn conduct(&self, procedure: impl Into<Arc<Procedure>>) -> Result<Output, ConductorError> {
        let procedure = procedure.into();
        let _transition = self
            .transitions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let id = procedure.id().to_string();
        info!(procedure = %id, "conducting procedure");
        PlannedProcedure::plan(
            procedure,
            self.environments.as_ref(),
            self.shared.storage.as_ref(),
        )
        .and_then(|planned| generation::succeed(&self.shared, &self.pool, Some(planned)))
        .map_err(|source| {
            error!(procedure = %id, "unable to conduct procedure: {source}");
            ConductorError::Conduct {
                procedure: id,
                source: Box::new(source),
            }
        })
    }

    /// Stop every execution and supersede the current generation with an
    /// empty one.
    pub fn clear(&self) -> Result<Output, ConductorError> {
        let _transition = self
            .transitions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        info!("clearing conductor");
        generation::succeed(&self.shared, &self.pool, None).map_err(|source| {
            error!("unable to clear conductor: {source}");
            ConductorError::Clear {
                source: Box::new(source),
            }
        })
    }
}

impl Drop for Conductor {
    fn drop(&mut self) {
        if self.output().procedure().is_some() {
            if let Err(err) = self.clear() {
                warn!("conductor dropped without a clean stop: {err}");
            }
        }
    }
}
