//! The chain of execution plan generations.
//!
//! Exactly one generation is current. A transition plans the new procedure
//! without touching any state, then under the shared lock moves surviving
//! coordinators into the successor, rewires every dependency and cancels
//! stale executions. Stale workers are joined with the lock released before
//! the successor starts its own executions.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::conductor::Shared;
use crate::coordinator::{self, CoordinatorMap, ExecutionCoordinator, ResultSnapshot};
use crate::environment::{Environment, EnvironmentService};
use crate::error::ConductorError;
use crate::events::{now_ms, EventStream, OutputEvent};
use crate::execution::{Completion, ExecutionId, ExecutionPhase};
use crate::path::{InstructionPath, ProductPath};
use crate::planning::{plan_procedure, DependencyPlan};
use crate::procedure::Procedure;
use crate::slot::{OutgoingSlot, SlotAddress};
use crate::storage::{persist_yaml, record_name, Location, StorageConfiguration};
use crate::worker_pool::WorkerPool;

/// Monotonic identifiers handed out under the shared lock.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    next_epoch: u64,
    next_execution: u64,
    next_generation: u64,
}

impl Counters {
    pub(crate) fn epoch(&mut self) -> u64 {
        self.next_epoch += 1;
        self.next_epoch
    }

    pub(crate) fn execution(&mut self) -> ExecutionId {
        self.next_execution += 1;
        ExecutionId::new(self.next_execution)
    }

    fn generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }
}

struct PersistedRecord {
    location: Arc<dyn Location>,
    name: String,
}

impl PersistedRecord {
    fn same_as(&self, other: &PersistedRecord) -> bool {
        self.name == other.name && self.location.describe() == other.location.describe()
    }
}

pub(crate) struct Generation {
    id: u64,
    procedure: Option<Arc<Procedure>>,
    events: Arc<EventStream>,
    /// Live coordinators; empty once the generation is superseded.
    coordinators: CoordinatorMap,
    /// Coordinator epochs at the moment this generation was superseded.
    retained: BTreeMap<InstructionPath, u64>,
    prior: Option<u64>,
    successor: Option<u64>,
    record: Option<PersistedRecord>,
    completions: Arc<[Completion]>,
}

impl Generation {
    fn cleared(id: u64, prior: Option<u64>) -> Self {
        Self {
            id,
            procedure: None,
            events: Arc::new(EventStream::new()),
            coordinators: CoordinatorMap::new(),
            retained: BTreeMap::new(),
            prior,
            successor: None,
            record: None,
            completions: Arc::from(Vec::new()),
        }
    }
}

pub(crate) struct ConductorState {
    current: Generation,
    /// Oldest first.
    superseded: VecDeque<Generation>,
    counters: Counters,
    retention: usize,
}

impl ConductorState {
    pub(crate) fn new(retention: usize) -> Self {
        Self {
            current: Generation::cleared(0, None),
            superseded: VecDeque::new(),
            counters: Counters::default(),
            retention,
        }
    }

    fn generation(&self, id: u64) -> Option<&Generation> {
        if self.current.id == id {
            return Some(&self.current);
        }
        self.superseded.iter().find(|g| g.id == id)
    }

    pub(crate) fn live_coordinators_mut(&mut self) -> &mut CoordinatorMap {
        &mut self.current.coordinators
    }

    pub(crate) fn coordinator_mut(
        &mut self,
        path: &InstructionPath,
    ) -> Option<&mut ExecutionCoordinator> {
        self.current.coordinators.get_mut(path)
    }

    /// The stream of the generation that currently owns `execution`, which
    /// differs from the one that started it once the execution was kept by a
    /// successor.
    pub(crate) fn events_for(
        &self,
        path: &InstructionPath,
        execution: ExecutionId,
    ) -> Option<Arc<EventStream>> {
        let coordinator = self.current.coordinators.get(path)?;
        (coordinator.execution_id() == Some(execution)).then(|| Arc::clone(&self.current.events))
    }

    pub(crate) fn outgoing_mut(&mut self, address: &SlotAddress) -> Option<&mut OutgoingSlot> {
        self.coordinator_mut(&address.producer)?
            .outgoing_mut(address.kind, &address.production)
    }

    /// The live coordinator at `path`, if generation `id` may still speak for
    /// it: either `id` is current or the coordinator was not invalidated since
    /// `id` was superseded.
    fn coordinator_for(&self, id: u64, path: &InstructionPath) -> Option<&ExecutionCoordinator> {
        let coordinator = self.current.coordinators.get(path)?;
        if self.current.id == id {
            return Some(coordinator);
        }
        let epoch = self.generation(id)?.retained.get(path)?;
        (*epoch == coordinator.epoch()).then_some(coordinator)
    }

    fn output(&self, shared: &Arc<Shared>, generation: &Generation) -> Output {
        Output {
            shared: Arc::clone(shared),
            id: generation.id,
            procedure: generation.procedure.clone(),
            events: Arc::clone(&generation.events),
            completions: Arc::clone(&generation.completions),
        }
    }
}

pub(crate) fn current_output(shared: &Arc<Shared>) -> Output {
    let state = shared.lock();
    state.output(shared, &state.current)
}

/// Everything a successor needs that can be computed without the lock.
pub(crate) struct PlannedProcedure {
    procedure: Arc<Procedure>,
    environment: Arc<dyn Environment>,
    plans: BTreeMap<InstructionPath, DependencyPlan>,
    location: Arc<dyn Location>,
}

impl PlannedProcedure {
    /// Open the environment, plan every instruction and validate that the
    /// procedure resolves.
    pub(crate) fn plan(
        procedure: Arc<Procedure>,
        environments: &dyn EnvironmentService,
        storage: &dyn StorageConfiguration,
    ) -> Result<Self, ConductorError> {
        let environment = environments
            .open_environment(&procedure)
            .map_err(|source| ConductorError::Environment {
                procedure: procedure.id().to_string(),
                source,
            })?;
        let plans = plan_procedure(&procedure, environment.as_ref())?;
        let root = procedure.path();
        let location = storage
            .locate_storage(&root)
            .map_err(|err| ConductorError::storage(root.to_string(), err))?;
        debug!(
            procedure = %procedure.id(),
            instructions = plans.len(),
            "procedure planned"
        );
        Ok(Self {
            procedure,
            environment,
            plans,
            location,
        })
    }
}

/// Replace the current generation with one conducting `next`, or with an
/// empty one when `next` is `None`.
pub(crate) fn succeed(
    shared: &Arc<Shared>,
    pool: &WorkerPool,
    next: Option<PlannedProcedure>,
) -> Result<Output, ConductorError> {
    let (id, prior_events, prior_id, stops) = {
        let mut guard = shared.lock();
        let ConductorState {
            current: prior,
            superseded,
            counters,
            retention,
        } = &mut *guard;

        let record = match &next {
            Some(planned) => {
                let record = PersistedRecord {
                    location: Arc::clone(&planned.location),
                    name: record_name(planned.procedure.id()),
                };
                persist_yaml(
                    record.location.as_ref(),
                    &record.name,
                    &planned.procedure.record(),
                )
                .map_err(|err| ConductorError::storage(record.location.describe(), err))?;
                Some(record)
            }
            None => None,
        };
        if let Some(old) = prior.record.take() {
            if !record.as_ref().is_some_and(|new| new.same_as(&old)) {
                if let Err(err) = old.location.remove(&old.name) {
                    warn!(
                        location = %old.location.describe(),
                        "failed to clear procedure record: {err:#}"
                    );
                }
            }
        }

        let id = counters.generation();
        prior.retained = prior
            .coordinators
            .iter()
            .map(|(path, c)| (path.clone(), c.epoch()))
            .collect();
        let mut map = std::mem::take(&mut prior.coordinators);
        let mut stops = Vec::new();

        let removed: Vec<InstructionPath> = map
            .keys()
            .filter(|path| {
                next.as_ref()
                    .map_or(true, |planned| !planned.procedure.contains(path))
            })
            .cloned()
            .collect();
        for path in &removed {
            stops.extend(coordinator::remove(&mut map, path, counters));
        }

        let mut successor = Generation::cleared(id, Some(prior.id));
        successor.record = record;
        if let Some(PlannedProcedure {
            procedure,
            environment,
            mut plans,
            ..
        }) = next
        {
            for path in procedure.instruction_paths() {
                if !map.contains_key(path) {
                    let fresh = ExecutionCoordinator::new(path.clone(), counters.epoch());
                    map.insert(path.clone(), fresh);
                }
            }
            for instruction in procedure.instructions() {
                let plan = plans.remove(instruction.path()).unwrap_or_default();
                coordinator::update_instruction(
                    &mut map,
                    instruction.clone(),
                    Arc::clone(&environment),
                    plan,
                    counters,
                );
            }
            for path in procedure.instruction_paths() {
                if let Some(c) = map.get_mut(path) {
                    c.update_outgoing();
                }
            }
            for path in procedure.instruction_paths() {
                coordinator::update_incoming(&mut map, path);
            }
            stops.extend(
                map.values_mut()
                    .filter_map(ExecutionCoordinator::cancel_stale),
            );
            successor.procedure = Some(procedure);
        }
        successor.coordinators = map;

        prior.successor = Some(id);
        let prior_events = Arc::clone(&prior.events);
        let prior_id = prior.id;
        let prior = std::mem::replace(prior, successor);
        superseded.push_back(prior);
        while superseded.len() > *retention {
            if let Some(dropped) = superseded.pop_front() {
                debug!(generation = dropped.id, "generation dropped from chain");
            }
        }
        (id, prior_events, prior_id, stops)
    };
    shared.notify_all();

    for stop in stops {
        stop.finish();
    }

    let output = {
        let mut guard = shared.lock();
        let ConductorState {
            current, counters, ..
        } = &mut *guard;
        let paths: Vec<InstructionPath> = current
            .procedure
            .as_ref()
            .map(|p| p.instruction_paths().cloned().collect())
            .unwrap_or_default();
        for path in &paths {
            coordinator::execute(
                &mut current.coordinators,
                path,
                shared,
                counters,
                &current.events,
            );
        }
        let completions: Vec<Completion> = current
            .coordinators
            .values()
            .filter_map(ExecutionCoordinator::completion)
            .collect();
        current.completions = Arc::from(completions);
        guard.output(shared, &guard.current)
    };
    shared.notify_all();

    schedule_join(shared, pool, &output);
    info!(
        generation = id,
        procedure = output.procedure().map(Procedure::id).unwrap_or("<cleared>"),
        "generation started"
    );
    prior_events.emit(OutputEvent::Succeeded {
        ts_ms: now_ms(),
        generation: prior_id,
        successor: id,
    });
    Ok(output)
}

fn schedule_join(shared: &Arc<Shared>, pool: &WorkerPool, output: &Output) {
    let shared = Arc::clone(shared);
    let completions = Arc::clone(&output.completions);
    let events = Arc::clone(&output.events);
    let generation = output.id;
    let submitted = pool.submit(move || {
        let mut state = shared.lock();
        while !completions.iter().all(Completion::is_set) {
            state = shared.wait(state);
        }
        drop(state);
        info!(generation, "generation completed");
        events.emit(OutputEvent::Completed {
            ts_ms: now_ms(),
            generation,
        });
    });
    if let Err(err) = submitted {
        error!(generation, "failed to schedule generation join: {err:#}");
    }
}

/// A view on one generation. Outputs stay usable after their generation is
/// superseded; queries then answer only for results that did not change.
#[derive(Clone)]
pub struct Output {
    shared: Arc<Shared>,
    id: u64,
    procedure: Option<Arc<Procedure>>,
    events: Arc<EventStream>,
    completions: Arc<[Completion]>,
}

impl Output {
    pub fn generation(&self) -> u64 {
        self.id
    }

    /// `None` for a cleared generation.
    pub fn procedure(&self) -> Option<&Procedure> {
        self.procedure.as_deref()
    }

    pub fn events(&self) -> &EventStream {
        &self.events
    }

    /// The generation this one superseded, while it is still retained.
    pub fn prior(&self) -> Option<Output> {
        let state = self.shared.lock();
        let prior = state.generation(self.id)?.prior?;
        let generation = state.generation(prior)?;
        Some(state.output(&self.shared, generation))
    }

    /// The generation that superseded this one, while it is still retained.
    pub fn successor(&self) -> Option<Output> {
        let state = self.shared.lock();
        let successor = state.generation(self.id)?.successor?;
        let generation = state.generation(successor)?;
        Some(state.output(&self.shared, generation))
    }

    /// The latest complete or partial value of a result.
    pub fn resolve_result(&self, product: &ProductPath) -> Option<ResultSnapshot> {
        let state = self.shared.lock();
        state
            .coordinator_for(self.id, &product.instruction)?
            .result_snapshot(&product.production)
    }

    pub fn execution_id(&self, path: &InstructionPath) -> Option<ExecutionId> {
        let state = self.shared.lock();
        state.coordinator_for(self.id, path)?.execution_id()
    }

    pub fn phase(&self, path: &InstructionPath) -> Option<ExecutionPhase> {
        let state = self.shared.lock();
        state.coordinator_for(self.id, path)?.phase()
    }

    /// Block until every execution of this generation has completed.
    /// Returns `false` on timeout.
    pub fn await_completion(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.lock();
        loop {
            if self.completions.iter().all(Completion::is_set) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = self.shared.wait_timeout(state, deadline - now);
        }
    }
}

impl std::fmt::Debug for Output {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Output")
            .field("generation", &self.id)
            .field("procedure", &self.procedure.as_ref().map(|p| p.id().to_string()))
            .finish_non_exhaustive()
    }
}
