use std::any::Any;
use std::sync::{Arc, Mutex};

use tracing::{info_span, Span};

use crate::conductor::Shared;
use crate::coordinator::ExecutionCoordinator;
use crate::environment::{Environment, Resource, SharedValue};
use crate::error::ConductorError;
use crate::events::{now_ms, EventStream, OutputEvent};
use crate::execution::{CancellationToken, ExecutionId};
use crate::path::{DependencyKind, InstructionPath, ProductPath, ProductionId, ResourceId};
use crate::procedure::{Instruction, Variables};
use crate::slot::{self, DependencyHandle, SlotAddress};
use crate::storage::Location;

/// What an instruction body sees of the conductor while it runs.
///
/// Every call first checks that this execution is still the coordinator's
/// current one; a stopped or removed execution gets `Cancelled`/`Removed`
/// instead of touching slots that now belong to a successor.
pub struct ExecutionContext {
    shared: Arc<Shared>,
    execution: ExecutionId,
    instruction: Instruction,
    variables: Variables,
    location: Arc<dyn Location>,
    environment: Arc<dyn Environment>,
    events: Arc<EventStream>,
    cancel: CancellationToken,
    resources: Mutex<Vec<Box<dyn Resource>>>,
}

impl ExecutionContext {
    pub(crate) fn new(
        shared: Arc<Shared>,
        execution: ExecutionId,
        instruction: Instruction,
        location: Arc<dyn Location>,
        environment: Arc<dyn Environment>,
        events: Arc<EventStream>,
        cancel: CancellationToken,
    ) -> Self {
        let variables = Variables::new(
            environment.globals().clone(),
            instruction.variables().clone(),
        );
        Self {
            shared,
            execution,
            instruction,
            variables,
            location,
            environment,
            events,
            cancel,
            resources: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> &str {
        self.instruction.id()
    }

    pub fn path(&self) -> &InstructionPath {
        self.instruction.path()
    }

    pub fn execution_id(&self) -> ExecutionId {
        self.execution
    }

    pub fn instruction(&self) -> &Instruction {
        &self.instruction
    }

    pub fn location(&self) -> &dyn Location {
        self.location.as_ref()
    }

    pub fn variables(&self) -> &Variables {
        &self.variables
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// `Err(Cancelled)` once this execution has been asked to stop.
    pub fn check_cancelled(&self) -> Result<(), ConductorError> {
        if self.is_cancelled() {
            return Err(ConductorError::Cancelled(self.path().clone()));
        }
        Ok(())
    }

    /// Span carrying this instruction's path and execution. The worker runs
    /// the body inside it, so body logs are attributed without extra fields.
    pub fn span(&self) -> Span {
        info_span!("instruction", path = %self.path(), execution = %self.execution)
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    /// Emit on the stream of whichever generation runs this execution now.
    pub(crate) fn emit(&self, event: OutputEvent) {
        let live = self.shared.lock().events_for(self.path(), self.execution);
        live.unwrap_or_else(|| Arc::clone(&self.events)).emit(event);
    }

    fn with_coordinator<R>(
        &self,
        f: impl FnOnce(&mut ExecutionCoordinator) -> Result<R, ConductorError>,
    ) -> Result<R, ConductorError> {
        self.check_cancelled()?;
        let mut state = self.shared.lock();
        match state.coordinator_mut(self.path()) {
            Some(coordinator) if coordinator.execution_id() == Some(self.execution) => {
                f(coordinator)
            }
            _ => Err(ConductorError::Removed(self.path().clone())),
        }
    }

    /// Obtain an environment resource; it is closed when this execution ends.
    pub fn acquire_resource(
        &self,
        resource: impl Into<ResourceId>,
    ) -> Result<SharedValue, ConductorError> {
        let resource = resource.into();
        self.check_cancelled()?;
        if !self.environment.provides_resource(&resource) {
            return Err(ConductorError::MissingResource {
                path: self.path().clone(),
                resource,
            });
        }
        let acquired = self.environment.provide_resource(&resource).map_err(|err| {
            ConductorError::conductor(format!(
                "instruction '{}' failed to acquire resource '{resource}': {err:#}",
                self.path()
            ))
        })?;
        let value = acquired.value();
        self.resources
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(acquired);
        Ok(value)
    }

    /// Close every acquired resource, collecting every failure.
    pub(crate) fn close_resources(&self) -> Vec<anyhow::Error> {
        let resources = std::mem::take(
            &mut *self
                .resources
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        let mut failures = Vec::new();
        for mut resource in resources {
            if let Err(err) = resource.close() {
                failures.push(err.context(format!("closing resource '{}'", resource.id())));
            }
        }
        failures
    }

    pub fn acquire_condition(
        &self,
        production: impl Into<ProductionId>,
    ) -> Result<DependencyHandle, ConductorError> {
        self.acquire_primary(DependencyKind::Condition, production.into())
    }

    pub fn acquire_result(
        &self,
        production: impl Into<ProductionId>,
    ) -> Result<DependencyHandle, ConductorError> {
        self.acquire_primary(DependencyKind::Result, production.into())
    }

    fn acquire_primary(
        &self,
        kind: DependencyKind,
        production: ProductionId,
    ) -> Result<DependencyHandle, ConductorError> {
        let registration = self.with_coordinator(|coordinator| {
            coordinator
                .incoming()
                .primary(kind, &production)
                .cloned()
                .ok_or_else(|| ConductorError::UndeclaredDependency {
                    path: self.path().clone(),
                    kind,
                    production: production.clone(),
                })
        })?;
        slot::acquire(&self.shared, &registration, self.path(), &self.cancel)
    }

    /// Acquire `production` from every instruction this one declared an
    /// additional result requirement on, in declaration order.
    pub fn acquire_additional_results(
        &self,
        production: impl Into<ProductionId>,
    ) -> Result<Vec<DependencyHandle>, ConductorError> {
        let production = production.into();
        let registrations = self.with_coordinator(|coordinator| {
            let registrations = coordinator.incoming().additional(&production);
            if registrations.is_empty() {
                return Err(ConductorError::UndeclaredDependency {
                    path: self.path().clone(),
                    kind: DependencyKind::Result,
                    production: production.clone(),
                });
            }
            Ok(registrations)
        })?;
        let mut handles = Vec::with_capacity(registrations.len());
        for registration in &registrations {
            handles.push(slot::acquire(
                &self.shared,
                registration,
                self.path(),
                &self.cancel,
            )?);
        }
        Ok(handles)
    }

    fn own_slot(
        &self,
        kind: DependencyKind,
        production: ProductionId,
    ) -> Result<SlotAddress, ConductorError> {
        self.with_coordinator(|coordinator| {
            if !coordinator.plan().prepares(kind, &production) {
                return Err(ConductorError::conductor(format!(
                    "instruction '{}' did not declare that it prepares {kind} '{production}'",
                    self.path()
                )));
            }
            Ok(SlotAddress {
                producer: self.path().clone(),
                kind,
                production,
            })
        })
    }

    /// Hand `value` to every consumer of the condition, one at a time, and
    /// block until all of them are done with it.
    pub fn prepare_condition<T: Any + Send + Sync>(
        &self,
        production: impl Into<ProductionId>,
        value: T,
    ) -> Result<(), ConductorError> {
        let address = self.own_slot(DependencyKind::Condition, production.into())?;
        slot::prepare(&self.shared, &address, Arc::new(value), &self.cancel)
    }

    /// Publish the result and block until every registered consumer has read
    /// it. The value stays queryable afterwards.
    pub fn prepare_result<T: Any + Send + Sync>(
        &self,
        production: impl Into<ProductionId>,
        value: T,
    ) -> Result<(), ConductorError> {
        let address = self.own_slot(DependencyKind::Result, production.into())?;
        slot::prepare(&self.shared, &address, Arc::new(value), &self.cancel)?;
        self.emit(OutputEvent::ResultObserved {
            ts_ms: now_ms(),
            product: address.product(),
            complete: true,
        });
        Ok(())
    }

    /// Report an intermediate value of a result; visible to result queries
    /// only, never to consumers.
    pub fn observe_partial_result<T: Any + Send + Sync>(
        &self,
        production: impl Into<ProductionId>,
        value: T,
    ) -> Result<(), ConductorError> {
        let production = production.into();
        let value: SharedValue = Arc::new(value);
        self.with_coordinator(|coordinator| {
            let retained = coordinator
                .result_slot_mut(&production)
                .and_then(|slot| slot.retained_result_mut())
                .ok_or_else(|| undeclared_result(self.path(), &production))?;
            retained.partial = Some(value);
            Ok(())
        })?;
        self.emit(OutputEvent::ResultObserved {
            ts_ms: now_ms(),
            product: ProductPath::new(self.path().clone(), production),
            complete: false,
        });
        Ok(())
    }

    /// Persist bytes belonging to a result in this execution's location and
    /// attach the resource name to the result.
    pub fn set_result_data(
        &self,
        production: impl Into<ProductionId>,
        name: &str,
        contents: &[u8],
    ) -> Result<(), ConductorError> {
        let production = production.into();
        let resource = format!("{production}.{name}");
        self.with_coordinator(|coordinator| {
            let retained = coordinator
                .result_slot_mut(&production)
                .and_then(|slot| slot.retained_result_mut())
                .ok_or_else(|| undeclared_result(self.path(), &production))?;
            self.location
                .persist(&resource, contents)
                .map_err(|err| ConductorError::storage(self.location.describe(), err))?;
            if !retained.data.contains(&resource) {
                retained.data.push(resource.clone());
            }
            Ok(())
        })
    }
}

fn undeclared_result(path: &InstructionPath, production: &ProductionId) -> ConductorError {
    ConductorError::conductor(format!(
        "instruction '{path}' did not declare that it prepares result '{production}'"
    ))
}
