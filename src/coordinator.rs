//! Per-path execution coordinators and the invalidation cascade.
//!
//! A coordinator outlives individual procedures: it is moved from one
//! generation to the next while its path stays in the procedure, and decides
//! whether the running execution can be kept or has to be replaced.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::{debug, error, info};

use crate::bundle::{IncomingDependencies, OutgoingBundle};
use crate::conductor::Shared;
use crate::environment::{Environment, SharedValue};
use crate::events::{now_ms, EventStream, OutputEvent};
use crate::execution::{
    Completion, Execution, ExecutionId, ExecutionPhase, PendingStop, StartRequest,
};
use crate::generation::{ConductorState, Counters};
use crate::path::{DependencyKind, InstructionPath, ProductPath, ProductionId};
use crate::planning::{Consumption, DependencyPlan};
use crate::procedure::Instruction;
use crate::slot::{OutgoingSlot, Registration};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UpdateStatus {
    Valid,
    Invalid,
}

/// The latest value of a result as seen by output queries.
#[derive(Clone)]
pub struct ResultSnapshot {
    pub product: ProductPath,
    pub value: SharedValue,
    /// `false` while only a partial value has been observed.
    pub complete: bool,
    pub data: Vec<String>,
}

impl std::fmt::Debug for ResultSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultSnapshot")
            .field("product", &self.product)
            .field("complete", &self.complete)
            .field("data", &self.data)
            .finish_non_exhaustive()
    }
}

pub(crate) type CoordinatorMap = BTreeMap<InstructionPath, ExecutionCoordinator>;

pub(crate) struct ExecutionCoordinator {
    path: InstructionPath,
    instruction: Option<Instruction>,
    environment: Option<Arc<dyn Environment>>,
    plan: DependencyPlan,
    status: UpdateStatus,
    epoch: u64,
    conditions: OutgoingBundle,
    results: OutgoingBundle,
    incoming: IncomingDependencies,
    execution: Option<Execution>,
}

impl ExecutionCoordinator {
    pub(crate) fn new(path: InstructionPath, epoch: u64) -> Self {
        Self {
            conditions: OutgoingBundle::conditions(path.clone()),
            results: OutgoingBundle::results(path.clone()),
            path,
            instruction: None,
            environment: None,
            plan: DependencyPlan::default(),
            status: UpdateStatus::Invalid,
            epoch,
            incoming: IncomingDependencies::default(),
            execution: None,
        }
    }

    #[cfg(test)]
    pub(crate) fn status(&self) -> UpdateStatus {
        self.status
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch
    }

    pub(crate) fn plan(&self) -> &DependencyPlan {
        &self.plan
    }

    pub(crate) fn incoming(&self) -> &IncomingDependencies {
        &self.incoming
    }

    pub(crate) fn execution_id(&self) -> Option<ExecutionId> {
        self.execution.as_ref().map(Execution::id)
    }

    pub(crate) fn phase(&self) -> Option<ExecutionPhase> {
        self.execution.as_ref().map(Execution::phase)
    }

    pub(crate) fn completion(&self) -> Option<Completion> {
        self.execution.as_ref().map(Execution::completion)
    }

    pub(crate) fn outgoing_mut(
        &mut self,
        kind: DependencyKind,
        production: &ProductionId,
    ) -> Option<&mut OutgoingSlot> {
        match kind {
            DependencyKind::Condition => self.conditions.get_mut(production),
            DependencyKind::Result => self.results.get_mut(production),
        }
    }

    pub(crate) fn result_slot_mut(
        &mut self,
        production: &ProductionId,
    ) -> Option<&mut OutgoingSlot> {
        self.results.get_mut(production)
    }

    pub(crate) fn result_snapshot(&self, production: &ProductionId) -> Option<ResultSnapshot> {
        let retained = self.results.get(production)?.retained_result()?;
        let (value, complete) = match (&retained.complete, &retained.partial) {
            (_, Some(partial)) => (Arc::clone(partial), false),
            (Some(complete), None) => (Arc::clone(complete), true),
            (None, None) => return None,
        };
        Some(ResultSnapshot {
            product: ProductPath::new(self.path.clone(), production.clone()),
            value,
            complete,
            data: retained.data.clone(),
        })
    }

    /// Rebuild outgoing slots from the current plan.
    pub(crate) fn update_outgoing(&mut self) {
        self.conditions.update(&self.plan);
        self.results.update(&self.plan);
    }

    /// Detach the execution of an invalid coordinator so it can be stopped.
    pub(crate) fn cancel_stale(&mut self) -> Option<PendingStop> {
        if self.status == UpdateStatus::Valid {
            return None;
        }
        let execution = self.execution.take()?;
        debug!(path = %self.path, phase = ?execution.phase(), "stopping stale execution");
        Some(execution.cancel())
    }
}

/// Record the new configuration; an incompatible one (or a coordinator that
/// still has to restart) invalidates the coordinator and its consumers.
pub(crate) fn update_instruction(
    map: &mut CoordinatorMap,
    instruction: Instruction,
    environment: Arc<dyn Environment>,
    plan: DependencyPlan,
    counters: &mut Counters,
) {
    let path = instruction.path().clone();
    let Some(coordinator) = map.get_mut(&path) else {
        return;
    };
    let compatible = coordinator
        .instruction
        .as_ref()
        .is_some_and(|old| old.is_compatible_with(&instruction))
        && coordinator.plan == plan;
    let restart = !compatible || coordinator.status == UpdateStatus::Invalid;
    coordinator.instruction = Some(instruction);
    coordinator.environment = Some(environment);
    coordinator.plan = plan;
    if restart {
        mark_invalidated(map, &path, counters);
    }
}

/// Invalidate `root` and everything downstream of it.
pub(crate) fn mark_invalidated(
    map: &mut CoordinatorMap,
    root: &InstructionPath,
    counters: &mut Counters,
) {
    let mut visited = BTreeSet::new();
    let mut pending = vec![root.clone()];
    while let Some(path) = pending.pop() {
        if !visited.insert(path.clone()) {
            continue;
        }
        let Some(coordinator) = map.get_mut(&path) else {
            continue;
        };
        if coordinator.status == UpdateStatus::Valid {
            debug!(path = %path, "coordinator invalidated");
        }
        coordinator.status = UpdateStatus::Invalid;
        coordinator.epoch = counters.epoch();
        pending.extend(coordinator.conditions.invalidate());
        pending.extend(coordinator.results.invalidate());
        let registrations = coordinator.incoming.take_all();
        for registration in &registrations {
            if let Some(slot) = producer_slot(map, registration) {
                slot.remove_consumer(registration.token);
            }
        }
    }
}

fn producer_slot<'a>(
    map: &'a mut CoordinatorMap,
    registration: &Registration,
) -> Option<&'a mut OutgoingSlot> {
    let address = &registration.address;
    map.get_mut(&address.producer)?
        .outgoing_mut(address.kind, &address.production)
}

fn register(
    map: &mut CoordinatorMap,
    consumer: &InstructionPath,
    producer: &InstructionPath,
    kind: DependencyKind,
    production: &ProductionId,
) -> Option<Registration> {
    let slot = map.get_mut(producer)?.outgoing_mut(kind, production)?;
    let token = slot.add_consumer(consumer);
    Some(Registration {
        address: slot.address().clone(),
        token,
    })
}

/// Register `path` on every producer its plan consumes from. Registrations
/// that are still needed keep their token; the rest are dropped.
pub(crate) fn update_incoming(map: &mut CoordinatorMap, path: &InstructionPath) {
    let Some(consumption) = map.get(path).map(|c| c.plan.consumption.clone()) else {
        return;
    };
    let parent = path.parent().unwrap_or_else(InstructionPath::root);
    let mut incoming = IncomingDependencies::default();
    match &consumption {
        Consumption::Nothing => {}
        Consumption::Condition(production) => {
            incoming.condition = register(map, path, &parent, DependencyKind::Condition, production);
        }
        Consumption::Results {
            primary,
            additional,
        } => {
            if let Some(production) = primary {
                incoming.result = register(map, path, &parent, DependencyKind::Result, production);
            }
            for product in additional {
                incoming.additional.extend(register(
                    map,
                    path,
                    &product.instruction,
                    DependencyKind::Result,
                    &product.production,
                ));
            }
        }
    }

    let Some(coordinator) = map.get_mut(path) else {
        return;
    };
    let previous = std::mem::replace(&mut coordinator.incoming, incoming);
    let stale: Vec<Registration> = previous
        .iter()
        .filter(|r| !coordinator.incoming.contains(r))
        .cloned()
        .collect();
    for registration in &stale {
        if let Some(slot) = producer_slot(map, registration) {
            slot.remove_consumer(registration.token);
        }
    }
}

/// Start a fresh execution unless the coordinator is still valid.
///
/// On failure the coordinator stays invalid so the next conduct retries, and
/// nobody is left waiting on its slots.
pub(crate) fn execute(
    map: &mut CoordinatorMap,
    path: &InstructionPath,
    shared: &Arc<Shared>,
    counters: &mut Counters,
    events: &Arc<EventStream>,
) {
    let Some(coordinator) = map.get_mut(path) else {
        return;
    };
    if coordinator.status == UpdateStatus::Valid {
        return;
    }
    debug_assert!(
        coordinator.execution.is_none(),
        "stale execution must be stopped first"
    );
    coordinator.conditions.reopen();
    coordinator.results.reopen();
    let (Some(instruction), Some(environment)) =
        (coordinator.instruction.as_ref(), coordinator.environment.as_ref())
    else {
        return;
    };

    let started = Execution::start(StartRequest {
        shared,
        id: counters.execution(),
        instruction,
        environment,
        events,
    });
    match started {
        Ok(execution) => {
            coordinator.execution = Some(execution);
            coordinator.status = UpdateStatus::Valid;
        }
        Err(err) => {
            error!(path = %path, "failed to start execution: {err}");
            coordinator.conditions.terminate();
            coordinator.results.terminate();
            let registrations: Vec<Registration> = coordinator.incoming.iter().cloned().collect();
            retire(map, &registrations);
            events.emit(OutputEvent::ExecutionFailed {
                ts_ms: now_ms(),
                path: path.clone(),
                message: err.to_string(),
            });
        }
    }
}

fn retire(map: &mut CoordinatorMap, registrations: &[Registration]) {
    for registration in registrations {
        if let Some(slot) = producer_slot(map, registration) {
            slot.retire_consumer(registration.token);
        }
    }
}

/// Take the coordinator at `path` out of the map: its consumers are
/// invalidated, its slots terminated and its execution cancelled.
pub(crate) fn remove(
    map: &mut CoordinatorMap,
    path: &InstructionPath,
    counters: &mut Counters,
) -> Option<PendingStop> {
    let coordinator = map.get_mut(path)?;
    coordinator.conditions.terminate();
    coordinator.results.terminate();
    mark_invalidated(map, path, counters);
    let mut coordinator = map.remove(path)?;
    coordinator.instruction = None;
    coordinator.environment = None;
    info!(path = %path, "instruction removed");
    coordinator.execution.take().map(Execution::cancel)
}

/// Called by a worker once its body returned: if it is still the current
/// execution, release every consumer of its slots and every slot it consumed.
pub(crate) fn terminate_if_current(
    state: &mut ConductorState,
    path: &InstructionPath,
    execution: ExecutionId,
) {
    let map = state.live_coordinators_mut();
    let Some(coordinator) = map.get_mut(path) else {
        return;
    };
    if coordinator.execution_id() != Some(execution) {
        return;
    }
    coordinator.conditions.terminate();
    coordinator.results.terminate();
    let registrations: Vec<Registration> = coordinator.incoming.iter().cloned().collect();
    retire(map, &registrations);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planning::{Evaluation, Production};
    use crate::slot::{DependencyState, Grant};

    fn path(raw: &str) -> InstructionPath {
        InstructionPath::parse(raw).unwrap()
    }

    fn coordinator(
        map: &mut CoordinatorMap,
        counters: &mut Counters,
        raw: &str,
        plan: DependencyPlan,
    ) {
        let mut c = ExecutionCoordinator::new(path(raw), counters.epoch());
        c.plan = plan;
        c.status = UpdateStatus::Valid;
        map.insert(path(raw), c);
    }

    fn produces_result(id: &str) -> DependencyPlan {
        DependencyPlan {
            productions: vec![Production::Result { id: id.into() }],
            ..DependencyPlan::default()
        }
    }

    fn consumes_result(id: &str, produces: Option<&str>) -> DependencyPlan {
        DependencyPlan {
            productions: produces
                .map(|p| vec![Production::Result { id: p.into() }])
                .unwrap_or_default(),
            consumption: Consumption::Results {
                primary: Some(id.into()),
                additional: Vec::new(),
            },
            ..DependencyPlan::default()
        }
    }

    fn wire(map: &mut CoordinatorMap) {
        let paths: Vec<InstructionPath> = map.keys().cloned().collect();
        for p in &paths {
            map.get_mut(p).unwrap().update_outgoing();
        }
        for p in &paths {
            update_incoming(map, p);
        }
    }

    #[test]
    fn invalidation_cascades_downstream_only() {
        let mut map = CoordinatorMap::new();
        let mut counters = Counters::default();
        coordinator(&mut map, &mut counters, "/a", produces_result("r"));
        coordinator(&mut map, &mut counters, "/a/b", consumes_result("r", Some("s")));
        coordinator(&mut map, &mut counters, "/a/b/c", consumes_result("s", None));
        coordinator(&mut map, &mut counters, "/z", DependencyPlan::default());
        wire(&mut map);
        let epoch_before = map[&path("/a")].epoch();

        mark_invalidated(&mut map, &path("/a/b"), &mut counters);

        assert_eq!(map[&path("/a")].status(), UpdateStatus::Valid);
        assert_eq!(map[&path("/a")].epoch(), epoch_before);
        assert_eq!(map[&path("/a/b")].status(), UpdateStatus::Invalid);
        assert_eq!(map[&path("/a/b/c")].status(), UpdateStatus::Invalid);
        assert_eq!(map[&path("/z")].status(), UpdateStatus::Valid);
        assert!(map[&path("/a/b")].incoming().is_empty());
        let slot = map.get_mut(&path("/a")).unwrap().result_slot_mut(&"r".into()).unwrap();
        assert_eq!(slot.consumer_paths().count(), 0, "b unregistered from a");
    }

    #[test]
    fn rewiring_keeps_surviving_registrations() {
        let mut map = CoordinatorMap::new();
        let mut counters = Counters::default();
        coordinator(&mut map, &mut counters, "/a", produces_result("r"));
        coordinator(&mut map, &mut counters, "/a/b", consumes_result("r", None));
        wire(&mut map);
        let before = map[&path("/a/b")].incoming().result.clone().unwrap();

        wire(&mut map);

        let after = map[&path("/a/b")].incoming().result.clone().unwrap();
        assert_eq!(before, after);
        let slot = map.get_mut(&path("/a")).unwrap().result_slot_mut(&"r".into()).unwrap();
        assert_eq!(slot.consumer_paths().count(), 1);
    }

    #[test]
    fn dropped_requirements_are_unregistered() {
        let mut map = CoordinatorMap::new();
        let mut counters = Counters::default();
        coordinator(&mut map, &mut counters, "/a", produces_result("r"));
        coordinator(&mut map, &mut counters, "/a/b", consumes_result("r", None));
        wire(&mut map);

        map.get_mut(&path("/a/b")).unwrap().plan = DependencyPlan::default();
        wire(&mut map);

        assert!(map[&path("/a/b")].incoming().is_empty());
        let slot = map.get_mut(&path("/a")).unwrap().result_slot_mut(&"r".into()).unwrap();
        assert_eq!(slot.consumer_paths().count(), 0);
    }

    #[test]
    fn removing_a_producer_releases_its_consumers() {
        let mut map = CoordinatorMap::new();
        let mut counters = Counters::default();
        coordinator(
            &mut map,
            &mut counters,
            "/a",
            DependencyPlan {
                productions: vec![Production::Condition {
                    id: "c".into(),
                    evaluation: Evaluation::Serial,
                }],
                ..DependencyPlan::default()
            },
        );
        coordinator(
            &mut map,
            &mut counters,
            "/a/b",
            DependencyPlan {
                consumption: Consumption::Condition("c".into()),
                ..DependencyPlan::default()
            },
        );
        wire(&mut map);
        let registration = map[&path("/a/b")].incoming().condition.clone().unwrap();
        {
            let slot = producer_slot(&mut map, &registration).unwrap();
            assert_eq!(slot.state_of(registration.token), Some(DependencyState::Waiting));
            slot.begin_round(Arc::new(1u8)).unwrap();
            assert!(matches!(slot.try_acquire(registration.token), Grant::Granted { .. }));
        }

        assert!(remove(&mut map, &path("/a"), &mut counters).is_none());

        assert!(!map.contains_key(&path("/a")));
        assert!(producer_slot(&mut map, &registration).is_none());
        assert_eq!(map[&path("/a/b")].status(), UpdateStatus::Invalid);
    }

    #[test]
    fn result_snapshot_prefers_partial_values() {
        let mut map = CoordinatorMap::new();
        let mut counters = Counters::default();
        coordinator(&mut map, &mut counters, "/a", produces_result("r"));
        wire(&mut map);
        let a = map.get_mut(&path("/a")).unwrap();
        assert!(a.result_snapshot(&"r".into()).is_none());

        let slot = a.result_slot_mut(&"r".into()).unwrap();
        let (round, _) = slot.begin_round(Arc::new(1u32)).unwrap();
        slot.end_round(round, true);
        let snapshot = a.result_snapshot(&"r".into()).unwrap();
        assert!(snapshot.complete);

        a.result_slot_mut(&"r".into())
            .unwrap()
            .retained_result_mut()
            .unwrap()
            .partial = Some(Arc::new(2u32));
        let snapshot = a.result_snapshot(&"r".into()).unwrap();
        assert!(!snapshot.complete);
        assert_eq!(snapshot.value.downcast_ref::<u32>(), Some(&2));
    }
}
