//! Procedure conductor.
//!
//! A procedure is a tree of instructions addressed by path. Each instruction
//! runs on its own worker thread and talks to its neighbours only through
//! dependency slots: conditions (one holder at a time, cleared after each
//! round) and results (read by every consumer, retained after the round).
//! Conducting a new procedure supersedes the running one live: instructions
//! whose configuration did not change keep running, everything downstream of
//! a change is stopped and restarted.
//!
//! Invariants:
//! - a condition has at most one holder at any instant
//! - `prepare` returns only after every consumer registered at its start is done
//! - a closed dependency handle never reads again
//! - invalidation reaches every transitive consumer and nothing upstream
//! - every resource an execution acquired is closed when it ends

pub mod bundle;
pub mod conductor;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod environment;
pub mod error;
pub mod events;
pub mod execution;
pub mod generation;
pub mod logging;
pub mod path;
pub mod planning;
pub mod procedure;
pub mod slot;
pub mod storage;
pub mod worker_pool;

pub use conductor::Conductor;
pub use config::ConductorConfig;
pub use context::ExecutionContext;
pub use coordinator::ResultSnapshot;
pub use environment::{
    Environment, EnvironmentService, LocalEnvironment, Resource, SharedResource, SharedValue,
};
pub use error::ConductorError;
pub use events::{EventStream, OutputEvent};
pub use execution::{ExecutionId, ExecutionPhase};
pub use generation::Output;
pub use path::{DependencyKind, InstructionPath, ProductPath, ProductionId, ResourceId};
pub use planning::{Evaluation, PlanningContext};
pub use procedure::{Executor, ExecutorRef, Instruction, Procedure, VariableMap, Variables};
pub use slot::{DependencyHandle, DependencyState, SlotAddress};
pub use storage::{FileSystemStore, Location, MemoryStore, StorageConfiguration};
