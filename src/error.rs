//! Error taxonomy for conducting.
//!
//! Planning misuse and generation transitions surface synchronously to the
//! caller of `conduct`/`clear`. Dependency failures surface on the worker of
//! the instruction that hit them and end that run only.

use thiserror::Error;

use crate::path::{DependencyKind, InstructionPath, ProductionId, ResourceId};

#[derive(Debug, Error)]
pub enum ConductorError {
    /// Planning or configuration misuse.
    #[error("{0}")]
    Conductor(String),

    #[error(
        "instruction '{consumer}' requires {kind} '{production}' which '{producer}' does not prepare"
    )]
    MissingDependency {
        consumer: InstructionPath,
        producer: InstructionPath,
        kind: DependencyKind,
        production: ProductionId,
    },

    #[error("instruction '{path}' did not declare a {kind} requirement on '{production}'")]
    UndeclaredDependency {
        path: InstructionPath,
        kind: DependencyKind,
        production: ProductionId,
    },

    #[error("environment does not provide resource '{resource}' required by '{path}'")]
    MissingResource {
        path: InstructionPath,
        resource: ResourceId,
    },

    #[error("failed to prepare {kind} '{production}' from instruction '{producer}'")]
    DependencyPreparationFailed {
        producer: InstructionPath,
        kind: DependencyKind,
        production: ProductionId,
    },

    #[error("{kind} '{production}' from instruction '{producer}' is closed")]
    ClosedDependency {
        producer: InstructionPath,
        kind: DependencyKind,
        production: ProductionId,
    },

    #[error("cancelled preparation of {kind} '{production}' at instruction '{producer}'")]
    CancelledPreparation {
        producer: InstructionPath,
        kind: DependencyKind,
        production: ProductionId,
    },

    #[error("execution of instruction '{0}' was cancelled")]
    Cancelled(InstructionPath),

    #[error("instruction '{0}' is no longer conducted")]
    Removed(InstructionPath),

    #[error("failed to open environment for procedure '{procedure}': {source:#}")]
    Environment {
        procedure: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("storage failure at '{location}': {source:#}")]
    Storage {
        location: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("{} resource(s) failed to close: {first:#}", .suppressed.len() + 1)]
    ResourceClose {
        #[source]
        first: anyhow::Error,
        suppressed: Vec<anyhow::Error>,
    },

    #[error("unable to conduct procedure '{procedure}': {source}")]
    Conduct {
        procedure: String,
        #[source]
        source: Box<ConductorError>,
    },

    #[error("unable to clear conductor: {source}")]
    Clear {
        #[source]
        source: Box<ConductorError>,
    },
}

impl ConductorError {
    pub fn conductor(message: impl Into<String>) -> Self {
        ConductorError::Conductor(message.into())
    }

    pub fn storage(location: impl Into<String>, source: anyhow::Error) -> Self {
        ConductorError::Storage {
            location: location.into(),
            source,
        }
    }

    /// Fold a list of close failures into one error, keeping every failure.
    pub fn from_close_failures(mut failures: Vec<anyhow::Error>) -> Option<Self> {
        if failures.is_empty() {
            return None;
        }
        let first = failures.remove(0);
        Some(ConductorError::ResourceClose {
            first,
            suppressed: failures,
        })
    }

    /// The innermost error, unwrapping `Conduct`/`Clear` transition wrappers.
    pub fn root(&self) -> &ConductorError {
        match self {
            ConductorError::Conduct { source, .. } | ConductorError::Clear { source } => {
                source.root()
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn close_failures_keep_every_cause() {
        let err = ConductorError::from_close_failures(vec![
            anyhow!("socket"),
            anyhow!("file"),
            anyhow!("lease"),
        ])
        .expect("failures should fold into an error");
        match &err {
            ConductorError::ResourceClose { first, suppressed } => {
                assert_eq!(first.to_string(), "socket");
                assert_eq!(suppressed.len(), 2);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.to_string().starts_with("3 resource(s)"), "{err}");
        assert!(ConductorError::from_close_failures(Vec::new()).is_none());
    }

    #[test]
    fn root_unwraps_transition_errors() {
        let inner = ConductorError::conductor("duplicate declaration");
        let err = ConductorError::Conduct {
            procedure: "p".to_string(),
            source: Box::new(inner),
        };
        assert!(matches!(err.root(), ConductorError::Conductor(_)));
        assert!(
            err.to_string().contains("duplicate declaration"),
            "msg was: {err}"
        );
    }
}
