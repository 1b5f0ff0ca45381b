use std::env;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

use crate::error::ConductorError;

pub const MAX_JOIN_WORKERS_ENV: &str = "CONDUCTOR_MAX_JOIN_WORKERS";
pub const RETAINED_GENERATIONS_ENV: &str = "CONDUCTOR_RETAINED_GENERATIONS";

/// Tuning for a `Conductor`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConductorConfig {
    /// Upper bound on threads joining generations in the background.
    pub max_join_workers: usize,
    /// How many superseded generations stay queryable.
    pub retained_generations: usize,
}

impl Default for ConductorConfig {
    fn default() -> Self {
        Self {
            max_join_workers: 4,
            retained_generations: 8,
        }
    }
}

impl ConductorConfig {
    /// Defaults overridden by `CONDUCTOR_MAX_JOIN_WORKERS` and
    /// `CONDUCTOR_RETAINED_GENERATIONS`.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            max_join_workers: positive_env(MAX_JOIN_WORKERS_ENV)?
                .unwrap_or(defaults.max_join_workers),
            retained_generations: positive_env(RETAINED_GENERATIONS_ENV)?
                .unwrap_or(defaults.retained_generations),
        })
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let config: Self =
            serde_yaml::from_str(raw).context("failed to parse conductor config YAML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConductorError> {
        if self.max_join_workers == 0 {
            return Err(ConductorError::conductor(
                "max_join_workers must be >= 1",
            ));
        }
        if self.retained_generations == 0 {
            return Err(ConductorError::conductor(
                "retained_generations must be >= 1",
            ));
        }
        Ok(())
    }
}

fn positive_env(name: &str) -> Result<Option<usize>> {
    let Some(v) = env::var(name).ok() else {
        return Ok(None);
    };
    let parsed: usize = v
        .trim()
        .parse()
        .map_err(|_| anyhow!("invalid {name}: '{v}' (must be a positive integer)"))?;
    if parsed == 0 {
        return Err(anyhow!("invalid {name}: '{v}' (must be a positive integer)"));
    }
    Ok(Some(parsed))
}
