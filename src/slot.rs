//! Dependency slots: the rendezvous between one producer and its registered
//! consumers for one production.
//!
//! Every slot lives inside its producer's coordinator and is only touched
//! while the conductor's shared lock is held. Blocking operations wait on the
//! shared condition variable and look the slot up again after every wake, so
//! a slot that disappears (producer removed or invalidated) is observed
//! instead of dangling.
//!
//! Invariants:
//! - a condition has at most one `Acquired` consumer at any instant
//! - `prepare` returns only once every consumer registered when it began is
//!   `Done` (or no longer registered)
//! - a handle that was closed, or whose entry moved on, never reads again

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::conductor::Shared;
use crate::environment::SharedValue;
use crate::error::ConductorError;
use crate::execution::CancellationToken;
use crate::path::{DependencyKind, InstructionPath, ProductPath, ProductionId};
use crate::planning::Evaluation;

static NEXT_REGISTRATION: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyState {
    Waiting,
    Acquired,
    Done,
}

/// Identifies one outgoing slot.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotAddress {
    pub producer: InstructionPath,
    pub kind: DependencyKind,
    pub production: ProductionId,
}

impl SlotAddress {
    pub(crate) fn preparation_failed(&self) -> ConductorError {
        ConductorError::DependencyPreparationFailed {
            producer: self.producer.clone(),
            kind: self.kind,
            production: self.production.clone(),
        }
    }

    pub(crate) fn closed(&self) -> ConductorError {
        ConductorError::ClosedDependency {
            producer: self.producer.clone(),
            kind: self.kind,
            production: self.production.clone(),
        }
    }

    pub(crate) fn cancelled_preparation(&self) -> ConductorError {
        ConductorError::CancelledPreparation {
            producer: self.producer.clone(),
            kind: self.kind,
            production: self.production.clone(),
        }
    }

    pub fn product(&self) -> ProductPath {
        ProductPath::new(self.producer.clone(), self.production.clone())
    }
}

impl fmt::Display for SlotAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}{}", self.kind, self.producer, self.production)
    }
}

/// A consumer's registration on an outgoing slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Registration {
    pub(crate) address: SlotAddress,
    pub(crate) token: u64,
}

#[derive(Debug)]
struct ConsumerEntry {
    consumer: InstructionPath,
    token: u64,
    state: DependencyState,
    /// Round in which the entry last acquired.
    round: u64,
    /// Set when the consumer's own execution ended; never reset.
    retired: bool,
}

/// Latest result values, kept after the round for queries and late readers.
#[derive(Debug, Default, Clone)]
pub(crate) struct RetainedResult {
    pub(crate) complete: Option<SharedValue>,
    pub(crate) partial: Option<SharedValue>,
    pub(crate) data: Vec<String>,
}

#[derive(Debug)]
enum Policy {
    Condition(Evaluation),
    Result(RetainedResult),
}

pub(crate) enum Grant {
    Granted { round: u64, value: SharedValue },
    Pending,
    Failed,
    Unregistered,
}

/// One outgoing condition or result of an instruction.
#[derive(Debug)]
pub(crate) struct OutgoingSlot {
    address: SlotAddress,
    policy: Policy,
    consumers: Vec<ConsumerEntry>,
    current: Option<SharedValue>,
    round: u64,
    preparing: bool,
    terminated: bool,
}

impl OutgoingSlot {
    pub(crate) fn condition(
        producer: InstructionPath,
        production: ProductionId,
        evaluation: Evaluation,
    ) -> Self {
        Self::new(
            SlotAddress {
                producer,
                kind: DependencyKind::Condition,
                production,
            },
            Policy::Condition(evaluation),
        )
    }

    pub(crate) fn result(producer: InstructionPath, production: ProductionId) -> Self {
        Self::new(
            SlotAddress {
                producer,
                kind: DependencyKind::Result,
                production,
            },
            Policy::Result(RetainedResult::default()),
        )
    }

    fn new(address: SlotAddress, policy: Policy) -> Self {
        Self {
            address,
            policy,
            consumers: Vec::new(),
            current: None,
            round: 0,
            preparing: false,
            terminated: false,
        }
    }

    pub(crate) fn address(&self) -> &SlotAddress {
        &self.address
    }

    pub(crate) fn set_evaluation(&mut self, evaluation: Evaluation) {
        if let Policy::Condition(current) = &mut self.policy {
            *current = evaluation;
        }
    }

    /// Register `consumer`, keeping an existing registration.
    pub(crate) fn add_consumer(&mut self, consumer: &InstructionPath) -> u64 {
        if let Some(entry) = self.consumers.iter().find(|e| &e.consumer == consumer) {
            return entry.token;
        }
        let token = NEXT_REGISTRATION.fetch_add(1, Ordering::Relaxed);
        let state = if self.terminated && self.retained().is_none() {
            DependencyState::Done
        } else {
            DependencyState::Waiting
        };
        self.consumers.push(ConsumerEntry {
            consumer: consumer.clone(),
            token,
            state,
            round: 0,
            retired: false,
        });
        token
    }

    pub(crate) fn remove_consumer(&mut self, token: u64) {
        self.consumers.retain(|e| e.token != token);
    }

    #[cfg(test)]
    pub(crate) fn state_of(&self, token: u64) -> Option<DependencyState> {
        self.entry(token).map(|e| e.state)
    }

    fn entry(&self, token: u64) -> Option<&ConsumerEntry> {
        self.consumers.iter().find(|e| e.token == token)
    }

    fn entry_mut(&mut self, token: u64) -> Option<&mut ConsumerEntry> {
        self.consumers.iter_mut().find(|e| e.token == token)
    }

    fn retained(&self) -> Option<&SharedValue> {
        match &self.policy {
            Policy::Result(retained) => retained.complete.as_ref(),
            Policy::Condition(_) => None,
        }
    }

    pub(crate) fn retained_result(&self) -> Option<&RetainedResult> {
        match &self.policy {
            Policy::Result(retained) => Some(retained),
            Policy::Condition(_) => None,
        }
    }

    pub(crate) fn retained_result_mut(&mut self) -> Option<&mut RetainedResult> {
        match &mut self.policy {
            Policy::Result(retained) => Some(retained),
            Policy::Condition(_) => None,
        }
    }

    /// One acquisition attempt for the consumer holding `token`.
    pub(crate) fn try_acquire(&mut self, token: u64) -> Grant {
        let Some(position) = self.consumers.iter().position(|e| e.token == token) else {
            return Grant::Unregistered;
        };
        let round = self.round;
        let entry = &self.consumers[position];
        if entry.state == DependencyState::Done {
            // Done until the next round begins, or for good once terminated.
            return if self.terminated {
                Grant::Failed
            } else {
                Grant::Pending
            };
        }
        let value = match &self.policy {
            Policy::Condition(evaluation) => {
                if entry.state == DependencyState::Acquired {
                    return match &self.current {
                        Some(value) if entry.round == round => Grant::Granted {
                            round,
                            value: Arc::clone(value),
                        },
                        _ => Grant::Pending,
                    };
                }
                let Some(value) = &self.current else {
                    return Grant::Pending;
                };
                if self
                    .consumers
                    .iter()
                    .any(|e| e.state == DependencyState::Acquired)
                {
                    return Grant::Pending;
                }
                if *evaluation == Evaluation::Ordered {
                    let next = self
                        .consumers
                        .iter()
                        .position(|e| e.state == DependencyState::Waiting && !e.retired);
                    if next != Some(position) {
                        return Grant::Pending;
                    }
                }
                Arc::clone(value)
            }
            Policy::Result(retained) => match self.current.as_ref().or(retained.complete.as_ref()) {
                Some(value) => Arc::clone(value),
                None => return Grant::Pending,
            },
        };
        let entry = &mut self.consumers[position];
        entry.state = DependencyState::Acquired;
        entry.round = round;
        Grant::Granted { round, value }
    }

    /// Whether the handle identified by `token` and `round` may still read.
    pub(crate) fn is_open(&self, token: u64, round: u64) -> bool {
        self.entry(token)
            .is_some_and(|e| e.state == DependencyState::Acquired && e.round == round)
    }

    /// Close the handle; a no-op if it is already closed.
    pub(crate) fn close(&mut self, token: u64, round: u64) -> bool {
        match self.entry_mut(token) {
            Some(entry) if entry.state == DependencyState::Acquired && entry.round == round => {
                entry.state = DependencyState::Done;
                true
            }
            _ => false,
        }
    }

    /// Publish `value` for a new round and return the registrations the
    /// round has to wait for.
    pub(crate) fn begin_round(
        &mut self,
        value: SharedValue,
    ) -> Result<(u64, Vec<u64>), ConductorError> {
        if self.preparing {
            return Err(ConductorError::conductor(format!(
                "{} is already being prepared",
                self.address
            )));
        }
        self.preparing = true;
        self.round += 1;
        self.current = Some(value);
        let mut snapshot = Vec::with_capacity(self.consumers.len());
        for entry in self.consumers.iter_mut().filter(|e| !e.retired) {
            if entry.state == DependencyState::Done {
                entry.state = DependencyState::Waiting;
            }
            snapshot.push(entry.token);
        }
        Ok((self.round, snapshot))
    }

    pub(crate) fn round_released(&self, snapshot: &[u64]) -> bool {
        snapshot.iter().all(|token| {
            self.entry(*token)
                .map_or(true, |e| e.state == DependencyState::Done)
        })
    }

    /// Retire the round's value. Results keep it when the round completed.
    pub(crate) fn end_round(&mut self, round: u64, completed: bool) {
        if self.round != round {
            return;
        }
        self.preparing = false;
        let value = self.current.take();
        if let (Policy::Result(retained), true, Some(value)) = (&mut self.policy, completed, value) {
            retained.complete = Some(value);
            retained.partial = None;
        }
    }

    /// Producer side: the owning execution ended. No consumer stays blocked.
    pub(crate) fn terminate(&mut self) {
        self.current = None;
        self.preparing = false;
        self.terminated = true;
        let keep_results = self.retained().is_some();
        for entry in &mut self.consumers {
            let keep = keep_results && entry.state != DependencyState::Done;
            if !keep {
                entry.state = DependencyState::Done;
            }
        }
    }

    /// A fresh execution of the producer is about to start.
    pub(crate) fn reopen(&mut self) {
        self.terminated = false;
        self.preparing = false;
        for entry in self.consumers.iter_mut().filter(|e| !e.retired) {
            if entry.state == DependencyState::Done {
                entry.state = DependencyState::Waiting;
            }
        }
    }

    /// Producer side: the producer's configuration is no longer trusted.
    /// Returns the consumers that now have to be invalidated as well.
    pub(crate) fn invalidate(&mut self) -> Vec<InstructionPath> {
        self.current = None;
        self.preparing = false;
        if let Policy::Result(retained) = &mut self.policy {
            *retained = RetainedResult::default();
        }
        let mut consumers = Vec::with_capacity(self.consumers.len());
        for mut entry in self.consumers.drain(..) {
            entry.state = DependencyState::Waiting;
            consumers.push(entry.consumer);
        }
        consumers
    }

    /// Consumer side: the consumer's own execution ended.
    pub(crate) fn retire_consumer(&mut self, token: u64) {
        if let Some(entry) = self.entry_mut(token) {
            entry.state = DependencyState::Done;
            entry.retired = true;
        }
    }

    #[cfg(test)]
    pub(crate) fn consumer_paths(&self) -> impl Iterator<Item = &InstructionPath> {
        self.consumers.iter().map(|e| &e.consumer)
    }
}

/// Block until the consumer holding `registration` is granted the value.
pub(crate) fn acquire(
    shared: &Arc<Shared>,
    registration: &Registration,
    consumer: &InstructionPath,
    cancel: &CancellationToken,
) -> Result<DependencyHandle, ConductorError> {
    let address = &registration.address;
    let mut state = shared.lock();
    loop {
        if cancel.is_cancelled() {
            return Err(ConductorError::Cancelled(consumer.clone()));
        }
        let grant = match state.outgoing_mut(address) {
            Some(slot) => slot.try_acquire(registration.token),
            None => Grant::Failed,
        };
        match grant {
            Grant::Granted { round, value } => {
                drop(state);
                shared.notify_all();
                tracing::debug!(%consumer, slot = %address, round, "acquired dependency");
                return Ok(DependencyHandle {
                    shared: Arc::clone(shared),
                    address: address.clone(),
                    token: registration.token,
                    round,
                    value,
                });
            }
            Grant::Failed => return Err(address.preparation_failed()),
            // An invalidated producer dropped the registration; the consumer
            // is about to be stopped, so keep waiting for the cancellation.
            Grant::Pending | Grant::Unregistered => {}
        }
        state = shared.wait(state);
    }
}

/// Publish `value` on the slot at `address` and block until every consumer
/// registered now has finished with it.
pub(crate) fn prepare(
    shared: &Shared,
    address: &SlotAddress,
    value: SharedValue,
    cancel: &CancellationToken,
) -> Result<(), ConductorError> {
    let mut state = shared.lock();
    if cancel.is_cancelled() {
        return Err(address.cancelled_preparation());
    }
    let (round, snapshot) = match state.outgoing_mut(address) {
        Some(slot) => slot.begin_round(value)?,
        None => return Err(address.cancelled_preparation()),
    };
    shared.notify_all();
    tracing::debug!(slot = %address, round, consumers = snapshot.len(), "prepared dependency");

    let outcome = loop {
        if cancel.is_cancelled() {
            break Err(address.cancelled_preparation());
        }
        match state.outgoing_mut(address) {
            Some(slot) if slot.round_released(&snapshot) => break Ok(()),
            Some(_) => {}
            None => break Err(address.cancelled_preparation()),
        }
        state = shared.wait(state);
    };

    if let Some(slot) = state.outgoing_mut(address) {
        slot.end_round(round, outcome.is_ok());
    }
    drop(state);
    shared.notify_all();
    outcome
}

/// Read access to one acquired condition or result.
///
/// Closing (explicitly or by dropping) moves the consumer to `Done`, which is
/// what lets the producer's `prepare` return.
pub struct DependencyHandle {
    shared: Arc<Shared>,
    address: SlotAddress,
    token: u64,
    round: u64,
    value: SharedValue,
}

impl DependencyHandle {
    pub fn address(&self) -> &SlotAddress {
        &self.address
    }

    pub fn kind(&self) -> DependencyKind {
        self.address.kind
    }

    /// `Acquired` while the handle may read, `Done` from then on.
    pub fn state(&self) -> DependencyState {
        let mut state = self.shared.lock();
        match state.outgoing_mut(&self.address) {
            Some(slot) if slot.is_open(self.token, self.round) => DependencyState::Acquired,
            _ => DependencyState::Done,
        }
    }

    pub fn value(&self) -> Result<SharedValue, ConductorError> {
        let mut state = self.shared.lock();
        match state.outgoing_mut(&self.address) {
            Some(slot) if slot.is_open(self.token, self.round) => Ok(Arc::clone(&self.value)),
            _ => Err(self.address.closed()),
        }
    }

    /// Typed read of the value.
    pub fn value_as<T: Send + Sync + 'static>(&self) -> Result<Arc<T>, ConductorError> {
        let value = self.value()?;
        value.downcast::<T>().map_err(|_| {
            ConductorError::conductor(format!(
                "{} does not hold a value of type {}",
                self.address,
                std::any::type_name::<T>()
            ))
        })
    }

    pub fn close(&self) {
        let closed = {
            let mut state = self.shared.lock();
            state
                .outgoing_mut(&self.address)
                .is_some_and(|slot| slot.close(self.token, self.round))
        };
        if closed {
            self.shared.notify_all();
        }
    }
}

impl Drop for DependencyHandle {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for DependencyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DependencyHandle")
            .field("address", &self.address)
            .field("round", &self.round)
            .finish_non_exhaustive()
    }
}
