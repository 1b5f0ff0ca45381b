//! Planning: turning each instruction's declarations into an explicit
//! `DependencyPlan`, then checking the whole procedure resolves.

use std::collections::{BTreeMap, BTreeSet};

use crate::environment::Environment;
use crate::error::ConductorError;
use crate::path::{DependencyKind, InstructionPath, ProductPath, ProductionId, ResourceId};
use crate::procedure::{Instruction, Procedure, Variables};

/// Callbacks an `Executor::plan` uses to declare its dependencies.
pub trait PlanningContext {
    /// Consume the named condition prepared by the parent instruction.
    fn declare_condition_requirement(&mut self, production: ProductionId)
        -> Result<(), ConductorError>;

    /// Consume the named result prepared by the parent instruction.
    fn declare_result_requirement(&mut self, production: ProductionId)
        -> Result<(), ConductorError>;

    /// Consume a result prepared by any other instruction.
    fn declare_additional_result_requirement(
        &mut self,
        product: ProductPath,
    ) -> Result<(), ConductorError>;

    fn declare_resource_requirement(&mut self, resource: ResourceId)
        -> Result<(), ConductorError>;

    fn prepares_condition(
        &mut self,
        production: ProductionId,
        evaluation: Evaluation,
    ) -> Result<(), ConductorError>;

    fn prepares_result(&mut self, production: ProductionId) -> Result<(), ConductorError>;
}

/// How a condition is handed to its consumers within one round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Evaluation {
    /// Any waiting consumer may take it, one holder at a time.
    #[default]
    Serial,
    /// One holder at a time, granted in registration order.
    Ordered,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Production {
    Condition {
        id: ProductionId,
        evaluation: Evaluation,
    },
    Result {
        id: ProductionId,
    },
}

impl Production {
    pub fn id(&self) -> &ProductionId {
        match self {
            Production::Condition { id, .. } | Production::Result { id } => id,
        }
    }

    pub fn kind(&self) -> DependencyKind {
        match self {
            Production::Condition { .. } => DependencyKind::Condition,
            Production::Result { .. } => DependencyKind::Result,
        }
    }
}

/// What an instruction consumes. A condition and results are mutually
/// exclusive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Consumption {
    #[default]
    Nothing,
    Condition(ProductionId),
    Results {
        primary: Option<ProductionId>,
        additional: Vec<ProductPath>,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyPlan {
    pub productions: Vec<Production>,
    pub consumption: Consumption,
    pub resources: Vec<ResourceId>,
}

impl DependencyPlan {
    pub fn prepares(&self, kind: DependencyKind, production: &ProductionId) -> bool {
        self.productions
            .iter()
            .any(|p| p.kind() == kind && p.id() == production)
    }

    pub fn conditions(&self) -> impl Iterator<Item = (&ProductionId, Evaluation)> {
        self.productions.iter().filter_map(|p| match p {
            Production::Condition { id, evaluation } => Some((id, *evaluation)),
            Production::Result { .. } => None,
        })
    }

    pub fn results(&self) -> impl Iterator<Item = &ProductionId> {
        self.productions.iter().filter_map(|p| match p {
            Production::Result { id } => Some(id),
            Production::Condition { .. } => None,
        })
    }
}

struct Planner<'a> {
    path: &'a InstructionPath,
    plan: DependencyPlan,
}

const MIXED_REQUIREMENTS: &str = "cannot depend on results and conditions at the same time";

fn conflict(path: &InstructionPath, message: &str) -> ConductorError {
    ConductorError::conductor(format!("instruction '{path}': {message}"))
}

impl Planner<'_> {
    fn declare_production(&mut self, production: Production) -> Result<(), ConductorError> {
        if self
            .plan
            .productions
            .iter()
            .any(|p| p.kind() == production.kind() && p.id() == production.id())
        {
            let message = format!(
                "{} '{}' is prepared more than once",
                production.kind(),
                production.id()
            );
            return Err(conflict(self.path, &message));
        }
        self.plan.productions.push(production);
        Ok(())
    }
}

impl PlanningContext for Planner<'_> {
    fn declare_condition_requirement(
        &mut self,
        production: ProductionId,
    ) -> Result<(), ConductorError> {
        match &mut self.plan.consumption {
            consumption @ Consumption::Nothing => {
                *consumption = Consumption::Condition(production);
                Ok(())
            }
            Consumption::Condition(_) => Err(conflict(
                self.path,
                "cannot declare multiple primary condition requirements",
            )),
            Consumption::Results { .. } => Err(conflict(self.path, MIXED_REQUIREMENTS)),
        }
    }

    fn declare_result_requirement(
        &mut self,
        production: ProductionId,
    ) -> Result<(), ConductorError> {
        match &mut self.plan.consumption {
            consumption @ Consumption::Nothing => {
                *consumption = Consumption::Results {
                    primary: Some(production),
                    additional: Vec::new(),
                };
                Ok(())
            }
            Consumption::Results {
                primary: Some(_), ..
            } => Err(conflict(
                self.path,
                "cannot declare multiple primary result requirements",
            )),
            Consumption::Results { primary, .. } => {
                *primary = Some(production);
                Ok(())
            }
            Consumption::Condition(_) => Err(conflict(self.path, MIXED_REQUIREMENTS)),
        }
    }

    fn declare_additional_result_requirement(
        &mut self,
        product: ProductPath,
    ) -> Result<(), ConductorError> {
        if &product.instruction == self.path {
            return Err(conflict(self.path, "cannot depend on its own results"));
        }
        match &mut self.plan.consumption {
            consumption @ Consumption::Nothing => {
                *consumption = Consumption::Results {
                    primary: None,
                    additional: vec![product],
                };
                Ok(())
            }
            Consumption::Results { additional, .. } => {
                if !additional.contains(&product) {
                    additional.push(product);
                }
                Ok(())
            }
            Consumption::Condition(_) => Err(conflict(self.path, MIXED_REQUIREMENTS)),
        }
    }

    fn declare_resource_requirement(&mut self, resource: ResourceId) -> Result<(), ConductorError> {
        if !self.plan.resources.contains(&resource) {
            self.plan.resources.push(resource);
        }
        Ok(())
    }

    fn prepares_condition(
        &mut self,
        production: ProductionId,
        evaluation: Evaluation,
    ) -> Result<(), ConductorError> {
        self.declare_production(Production::Condition {
            id: production,
            evaluation,
        })
    }

    fn prepares_result(&mut self, production: ProductionId) -> Result<(), ConductorError> {
        self.declare_production(Production::Result { id: production })
    }
}

/// Run an instruction's planning callbacks.
pub fn plan_instruction(
    instruction: &Instruction,
    variables: &Variables,
) -> Result<DependencyPlan, ConductorError> {
    let mut planner = Planner {
        path: instruction.path(),
        plan: DependencyPlan::default(),
    };
    instruction
        .executor()
        .executor()
        .plan(&mut planner, variables)?;
    Ok(planner.plan)
}

/// Plan every instruction and check that every declared dependency and
/// resource can be satisfied.
pub(crate) fn plan_procedure(
    procedure: &Procedure,
    environment: &dyn Environment,
) -> Result<BTreeMap<InstructionPath, DependencyPlan>, ConductorError> {
    let mut plans = BTreeMap::new();
    for instruction in procedure.instructions() {
        let variables = Variables::new(
            environment.globals().clone(),
            instruction.variables().clone(),
        );
        let plan = plan_instruction(instruction, &variables)?;
        plans.insert(instruction.path().clone(), plan);
    }

    for instruction in procedure.instructions() {
        let path = instruction.path();
        let plan = &plans[path];
        for (producer, kind, production) in required_productions(path, plan) {
            let satisfied = plans
                .get(&producer)
                .is_some_and(|p| p.prepares(kind, production));
            if !satisfied {
                return Err(ConductorError::MissingDependency {
                    consumer: path.clone(),
                    producer,
                    kind,
                    production: production.clone(),
                });
            }
        }
        let mut seen = BTreeSet::new();
        for resource in &plan.resources {
            if seen.insert(resource) && !environment.provides_resource(resource) {
                return Err(ConductorError::MissingResource {
                    path: path.clone(),
                    resource: resource.clone(),
                });
            }
        }
    }
    Ok(plans)
}

/// Producer path, kind and production for every dependency a plan consumes.
/// Primary requirements resolve against the logical parent.
pub(crate) fn required_productions<'a>(
    path: &InstructionPath,
    plan: &'a DependencyPlan,
) -> Vec<(InstructionPath, DependencyKind, &'a ProductionId)> {
    let parent = path.parent().unwrap_or_else(InstructionPath::root);
    match &plan.consumption {
        Consumption::Nothing => Vec::new(),
        Consumption::Condition(production) => {
            vec![(parent, DependencyKind::Condition, production)]
        }
        Consumption::Results {
            primary,
            additional,
        } => {
            let mut out = Vec::new();
            if let Some(production) = primary {
                out.push((parent, DependencyKind::Result, production));
            }
            for product in additional {
                out.push((
                    product.instruction.clone(),
                    DependencyKind::Result,
                    &product.production,
                ));
            }
            out
        }
    }
}
