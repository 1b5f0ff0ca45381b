//! Per-instruction sets of dependency slots.

use std::collections::BTreeMap;

use crate::path::{DependencyKind, InstructionPath, ProductionId};
use crate::planning::{DependencyPlan, Evaluation};
use crate::slot::{OutgoingSlot, Registration};

/// The outgoing conditions or outgoing results of one instruction.
#[derive(Debug)]
pub(crate) struct OutgoingBundle {
    producer: InstructionPath,
    kind: DependencyKind,
    slots: BTreeMap<ProductionId, OutgoingSlot>,
}

impl OutgoingBundle {
    pub(crate) fn conditions(producer: InstructionPath) -> Self {
        Self {
            producer,
            kind: DependencyKind::Condition,
            slots: BTreeMap::new(),
        }
    }

    pub(crate) fn results(producer: InstructionPath) -> Self {
        Self {
            producer,
            kind: DependencyKind::Result,
            slots: BTreeMap::new(),
        }
    }

    /// Keep slots still declared by `plan`, create new ones, terminate and
    /// drop the rest.
    pub(crate) fn update(&mut self, plan: &DependencyPlan) {
        let declared: BTreeMap<ProductionId, Evaluation> = match self.kind {
            DependencyKind::Condition => plan
                .conditions()
                .map(|(id, evaluation)| (id.clone(), evaluation))
                .collect(),
            DependencyKind::Result => plan
                .results()
                .map(|id| (id.clone(), Evaluation::default()))
                .collect(),
        };

        self.slots.retain(|production, slot| {
            let keep = declared.contains_key(production);
            if !keep {
                slot.terminate();
            }
            keep
        });
        for (production, evaluation) in declared {
            match self.slots.get_mut(&production) {
                Some(slot) => slot.set_evaluation(evaluation),
                None => {
                    let slot = match self.kind {
                        DependencyKind::Condition => OutgoingSlot::condition(
                            self.producer.clone(),
                            production.clone(),
                            evaluation,
                        ),
                        DependencyKind::Result => {
                            OutgoingSlot::result(self.producer.clone(), production.clone())
                        }
                    };
                    self.slots.insert(production, slot);
                }
            }
        }
    }

    pub(crate) fn get(&self, production: &ProductionId) -> Option<&OutgoingSlot> {
        self.slots.get(production)
    }

    pub(crate) fn get_mut(&mut self, production: &ProductionId) -> Option<&mut OutgoingSlot> {
        self.slots.get_mut(production)
    }

    pub(crate) fn terminate(&mut self) {
        for slot in self.slots.values_mut() {
            slot.terminate();
        }
    }

    pub(crate) fn reopen(&mut self) {
        for slot in self.slots.values_mut() {
            slot.reopen();
        }
    }

    /// Invalidate every slot; returns the consumers that were registered.
    pub(crate) fn invalidate(&mut self) -> Vec<InstructionPath> {
        let mut consumers = Vec::new();
        for slot in self.slots.values_mut() {
            consumers.extend(slot.invalidate());
        }
        consumers
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }
}

/// The registrations an instruction holds on its producers' slots.
#[derive(Debug, Default)]
pub(crate) struct IncomingDependencies {
    pub(crate) condition: Option<Registration>,
    pub(crate) result: Option<Registration>,
    pub(crate) additional: Vec<Registration>,
}

impl IncomingDependencies {
    pub(crate) fn iter(&self) -> impl Iterator<Item = &Registration> {
        self.condition
            .iter()
            .chain(self.result.iter())
            .chain(self.additional.iter())
    }

    pub(crate) fn contains(&self, registration: &Registration) -> bool {
        self.iter().any(|r| r == registration)
    }

    /// The primary registration for `kind` on `production`.
    pub(crate) fn primary(
        &self,
        kind: DependencyKind,
        production: &ProductionId,
    ) -> Option<&Registration> {
        let registration = match kind {
            DependencyKind::Condition => self.condition.as_ref(),
            DependencyKind::Result => self.result.as_ref(),
        }?;
        (&registration.address.production == production).then_some(registration)
    }

    pub(crate) fn additional(&self, production: &ProductionId) -> Vec<Registration> {
        self.additional
            .iter()
            .filter(|r| &r.address.production == production)
            .cloned()
            .collect()
    }

    pub(crate) fn take_all(&mut self) -> Vec<Registration> {
        let mut out = Vec::new();
        out.extend(self.condition.take());
        out.extend(self.result.take());
        out.append(&mut self.additional);
        out
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.condition.is_none() && self.result.is_none() && self.additional.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planning::Production;
    use crate::slot::SlotAddress;

    fn path(raw: &str) -> InstructionPath {
        InstructionPath::parse(raw).unwrap()
    }

    fn plan(productions: Vec<Production>) -> DependencyPlan {
        DependencyPlan {
            productions,
            ..DependencyPlan::default()
        }
    }

    #[test]
    fn update_keeps_existing_slots_and_drops_undeclared_ones() {
        let mut bundle = OutgoingBundle::conditions(path("/a"));
        bundle.update(&plan(vec![
            Production::Condition {
                id: "one".into(),
                evaluation: Evaluation::Serial,
            },
            Production::Condition {
                id: "two".into(),
                evaluation: Evaluation::Serial,
            },
            Production::Result { id: "data".into() },
        ]));
        assert_eq!(bundle.len(), 2);
        let token = bundle
            .get_mut(&"one".into())
            .unwrap()
            .add_consumer(&path("/a/b"));

        bundle.update(&plan(vec![Production::Condition {
            id: "one".into(),
            evaluation: Evaluation::Ordered,
        }]));
        assert_eq!(bundle.len(), 1);
        let kept = bundle.get(&"one".into()).unwrap();
        assert!(
            kept.state_of(token).is_some(),
            "registration survives the update"
        );
    }

    #[test]
    fn incoming_lookup_matches_kind_and_production() {
        let registration = |kind, producer: &str, production: &str, token| Registration {
            address: SlotAddress {
                producer: path(producer),
                kind,
                production: production.into(),
            },
            token,
        };
        let mut incoming = IncomingDependencies {
            condition: None,
            result: Some(registration(DependencyKind::Result, "/a", "data", 1)),
            additional: vec![
                registration(DependencyKind::Result, "/x", "table", 2),
                registration(DependencyKind::Result, "/y", "table", 3),
            ],
        };

        assert!(incoming
            .primary(DependencyKind::Result, &"data".into())
            .is_some());
        assert!(incoming
            .primary(DependencyKind::Condition, &"data".into())
            .is_none());
        assert_eq!(incoming.additional(&"table".into()).len(), 2);
        assert_eq!(incoming.take_all().len(), 3);
        assert!(incoming.is_empty());
    }
}
