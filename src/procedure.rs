//! The procedure data model the conductor consumes.
//!
//! A `Procedure` is an already-validated tree of `Instruction`s in
//! parent-first order. Each instruction names the `Executor` that plans and
//! runs it plus the variables it was configured with.

use anyhow::{anyhow, Result};
use serde::de::DeserializeOwned;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use crate::context::ExecutionContext;
use crate::error::ConductorError;
use crate::path::InstructionPath;
use crate::planning::PlanningContext;
use crate::storage::{InstructionRecord, ProcedureRecord};

pub type VariableMap = BTreeMap<String, Value>;

/// Domain behavior of an instruction.
///
/// `plan` declares what the instruction prepares and consumes; it runs once per
/// generation before anything starts. `execute` runs once per execution on a
/// dedicated worker and returns when the instruction is logically finished.
pub trait Executor: Send + Sync {
    fn plan(
        &self,
        _planning: &mut dyn PlanningContext,
        _variables: &Variables,
    ) -> Result<(), ConductorError> {
        Ok(())
    }

    fn execute(&self, context: &ExecutionContext) -> Result<()>;
}

/// An executor plus the stable name used for configuration comparison.
#[derive(Clone)]
pub struct ExecutorRef {
    name: String,
    executor: Arc<dyn Executor>,
}

impl ExecutorRef {
    pub fn new(name: impl Into<String>, executor: Arc<dyn Executor>) -> Self {
        Self {
            name: name.into(),
            executor,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn executor(&self) -> &Arc<dyn Executor> {
        &self.executor
    }
}

impl fmt::Debug for ExecutorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutorRef")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct Instruction {
    path: InstructionPath,
    id: String,
    executor: ExecutorRef,
    variables: VariableMap,
}

impl Instruction {
    pub fn new(path: InstructionPath, id: impl Into<String>, executor: ExecutorRef) -> Self {
        Self {
            path,
            id: id.into(),
            executor,
            variables: VariableMap::new(),
        }
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }

    pub fn with_variables(mut self, variables: VariableMap) -> Self {
        self.variables = variables;
        self
    }

    pub fn path(&self) -> &InstructionPath {
        &self.path
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn executor(&self) -> &ExecutorRef {
        &self.executor
    }

    pub fn variables(&self) -> &VariableMap {
        &self.variables
    }

    /// Same id, same executor, same variables. The only test used to decide
    /// whether a running execution survives a re-plan.
    pub fn is_compatible_with(&self, other: &Instruction) -> bool {
        self.id == other.id
            && self.executor.name == other.executor.name
            && self.variables == other.variables
    }

    /// SHA-256 over the configuration that `is_compatible_with` compares.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.id.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.executor.name.as_bytes());
        hasher.update([0u8]);
        // BTreeMap keeps the key order stable.
        let variables = serde_json::to_vec(&self.variables).unwrap_or_default();
        hasher.update(&variables);
        hasher
            .finalize()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }

    pub fn record(&self) -> InstructionRecord {
        InstructionRecord {
            path: self.path.clone(),
            id: self.id.clone(),
            executor: self.executor.name.clone(),
            variables: self.variables.clone(),
            fingerprint: self.fingerprint(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Procedure {
    id: String,
    instructions: Vec<Instruction>,
    index: HashMap<InstructionPath, usize>,
}

impl Procedure {
    /// Build a procedure from instructions listed parent-first.
    pub fn new(id: impl Into<String>, instructions: Vec<Instruction>) -> Result<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(anyhow!("procedure id must not be empty"));
        }
        let mut index = HashMap::new();
        for (position, instruction) in instructions.iter().enumerate() {
            let path = instruction.path();
            if path.is_root() {
                return Err(anyhow!(
                    "procedure '{id}': instruction '{}' cannot live at the root path",
                    instruction.id()
                ));
            }
            if index.contains_key(path) {
                return Err(anyhow!("procedure '{id}': duplicate instruction path '{path}'"));
            }
            if let Some(parent) = path.parent() {
                if !parent.is_root() && !index.contains_key(&parent) {
                    return Err(anyhow!(
                        "procedure '{id}': instruction '{path}' appears before its parent '{parent}'"
                    ));
                }
            }
            index.insert(path.clone(), position);
        }
        Ok(Self {
            id,
            instructions,
            index,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn path(&self) -> InstructionPath {
        InstructionPath::root()
    }

    pub fn instruction(&self, path: &InstructionPath) -> Option<&Instruction> {
        self.index.get(path).map(|i| &self.instructions[*i])
    }

    pub fn contains(&self, path: &InstructionPath) -> bool {
        self.index.contains_key(path)
    }

    /// Instructions in dependency-safe (parent-first) order.
    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    pub fn instruction_paths(&self) -> impl Iterator<Item = &InstructionPath> {
        self.instructions.iter().map(Instruction::path)
    }

    pub fn record(&self) -> ProcedureRecord {
        ProcedureRecord {
            id: self.id.clone(),
            instructions: self.instructions.iter().map(Instruction::record).collect(),
        }
    }
}

/// Resolved variables for one instruction: its own values over the
/// environment's globals.
#[derive(Debug, Clone, Default)]
pub struct Variables {
    globals: VariableMap,
    locals: VariableMap,
}

impl Variables {
    pub fn new(globals: VariableMap, locals: VariableMap) -> Self {
        Self { globals, locals }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.locals.get(name).or_else(|| self.globals.get(name))
    }

    pub fn get_as<T: DeserializeOwned>(&self, name: &str) -> Result<T> {
        let value = self
            .get(name)
            .ok_or_else(|| anyhow!("variable '{name}' is not defined"))?;
        serde_json::from_value(value.clone())
            .map_err(|err| anyhow!("variable '{name}' has an unexpected type: {err}"))
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .locals
            .keys()
            .chain(self.globals.keys())
            .map(String::as_str)
            .collect();
        names.sort_unstable();
        names.dedup();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Noop;

    impl Executor for Noop {
        fn execute(&self, _context: &ExecutionContext) -> Result<()> {
            Ok(())
        }
    }

    fn noop(name: &str) -> ExecutorRef {
        ExecutorRef::new(name, Arc::new(Noop))
    }

    fn path(raw: &str) -> InstructionPath {
        InstructionPath::parse(raw).unwrap()
    }

    #[test]
    fn compatibility_compares_id_executor_and_variables() {
        let a = Instruction::new(path("/a"), "a", noop("noop")).with_variable("n", 1);
        let same = Instruction::new(path("/a"), "a", noop("noop")).with_variable("n", 1);
        let changed = Instruction::new(path("/a"), "a", noop("noop")).with_variable("n", 2);
        let other_executor = Instruction::new(path("/a"), "a", noop("other")).with_variable("n", 1);

        assert!(a.is_compatible_with(&same));
        assert_eq!(a.fingerprint(), same.fingerprint());
        assert!(!a.is_compatible_with(&changed));
        assert_ne!(a.fingerprint(), changed.fingerprint());
        assert!(!a.is_compatible_with(&other_executor));
    }

    #[test]
    fn procedure_rejects_orphans_and_duplicates() {
        let orphan = Procedure::new(
            "p",
            vec![Instruction::new(path("/a/b"), "b", noop("noop"))],
        )
        .unwrap_err();
        assert!(orphan.to_string().contains("before its parent"), "{orphan:#}");

        let duplicate = Procedure::new(
            "p",
            vec![
                Instruction::new(path("/a"), "a", noop("noop")),
                Instruction::new(path("/a"), "a2", noop("noop")),
            ],
        )
        .unwrap_err();
        assert!(duplicate.to_string().contains("duplicate"), "{duplicate:#}");
    }

    #[test]
    fn variables_prefer_locals_over_globals() {
        let mut globals = VariableMap::new();
        globals.insert("n".to_string(), json!(1));
        globals.insert("g".to_string(), json!("global"));
        let mut locals = VariableMap::new();
        locals.insert("n".to_string(), json!(5));

        let vars = Variables::new(globals, locals);
        assert_eq!(vars.get_as::<u32>("n").unwrap(), 5);
        assert_eq!(vars.get_as::<String>("g").unwrap(), "global");
        assert_eq!(vars.names(), vec!["g", "n"]);
        let err = vars.get_as::<u32>("missing").unwrap_err();
        assert!(err.to_string().contains("not defined"), "{err:#}");
    }
}
