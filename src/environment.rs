//! Environment collaborators: global variables and shared resources handed
//! to executions.

use anyhow::{anyhow, Result};
use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::path::ResourceId;
use crate::procedure::{Procedure, VariableMap};

pub type SharedValue = Arc<dyn Any + Send + Sync>;

/// A resource acquired by one execution and closed exactly once when that
/// execution ends.
pub trait Resource: Send {
    fn id(&self) -> &ResourceId;

    fn value(&self) -> SharedValue;

    fn close(&mut self) -> Result<()>;
}

pub trait Environment: Send + Sync {
    fn globals(&self) -> &VariableMap;

    fn provides_resource(&self, resource: &ResourceId) -> bool;

    fn provide_resource(&self, resource: &ResourceId) -> Result<Box<dyn Resource>>;
}

/// Builds the environment a procedure is conducted against.
pub trait EnvironmentService: Send + Sync {
    fn open_environment(&self, procedure: &Procedure) -> Result<Arc<dyn Environment>>;
}

type Provider = Arc<dyn Fn() -> Result<Box<dyn Resource>> + Send + Sync>;

/// In-process environment: a fixed set of globals plus resource factories.
#[derive(Default, Clone)]
pub struct LocalEnvironment {
    globals: VariableMap,
    providers: BTreeMap<ResourceId, Provider>,
}

impl LocalEnvironment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_global(
        mut self,
        name: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.globals.insert(name.into(), value.into());
        self
    }

    pub fn with_provider<F>(mut self, resource: impl Into<ResourceId>, provider: F) -> Self
    where
        F: Fn() -> Result<Box<dyn Resource>> + Send + Sync + 'static,
    {
        self.providers.insert(resource.into(), Arc::new(provider));
        self
    }

    /// Provide the same shared value to every execution; closing is a no-op.
    pub fn with_shared_value(self, resource: impl Into<ResourceId>, value: SharedValue) -> Self {
        let resource = resource.into();
        let id = resource.clone();
        self.with_provider(resource, move || {
            Ok(Box::new(SharedResource::new(id.clone(), Arc::clone(&value))) as Box<dyn Resource>)
        })
    }
}

impl Environment for LocalEnvironment {
    fn globals(&self) -> &VariableMap {
        &self.globals
    }

    fn provides_resource(&self, resource: &ResourceId) -> bool {
        self.providers.contains_key(resource)
    }

    fn provide_resource(&self, resource: &ResourceId) -> Result<Box<dyn Resource>> {
        let provider = self
            .providers
            .get(resource)
            .ok_or_else(|| anyhow!("environment does not provide resource '{resource}'"))?;
        provider()
    }
}

impl EnvironmentService for LocalEnvironment {
    fn open_environment(&self, _procedure: &Procedure) -> Result<Arc<dyn Environment>> {
        Ok(Arc::new(self.clone()))
    }
}

type CloseHook = Box<dyn FnMut() -> Result<()> + Send>;

/// A resource wrapping a shared value with an optional close hook.
pub struct SharedResource {
    id: ResourceId,
    value: SharedValue,
    on_close: Option<CloseHook>,
}

impl SharedResource {
    pub fn new(id: ResourceId, value: SharedValue) -> Self {
        Self {
            id,
            value,
            on_close: None,
        }
    }

    pub fn on_close<F>(mut self, hook: F) -> Self
    where
        F: FnMut() -> Result<()> + Send + 'static,
    {
        self.on_close = Some(Box::new(hook));
        self
    }
}

impl Resource for SharedResource {
    fn id(&self) -> &ResourceId {
        &self.id
    }

    fn value(&self) -> SharedValue {
        Arc::clone(&self.value)
    }

    fn close(&mut self) -> Result<()> {
        match self.on_close.take() {
            Some(mut hook) => hook(),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn local_environment_provides_registered_resources_only() {
        let env = LocalEnvironment::new()
            .with_global("region", "eu")
            .with_shared_value("db", Arc::new(42u32));

        assert!(env.provides_resource(&"db".into()));
        assert!(!env.provides_resource(&"queue".into()));
        assert_eq!(env.globals()["region"], "eu");

        let resource = env.provide_resource(&"db".into()).unwrap();
        assert_eq!(resource.value().downcast_ref::<u32>(), Some(&42));

        let err = env.provide_resource(&"queue".into()).err().unwrap();
        assert!(err.to_string().contains("'queue'"), "{err:#}");
    }

    #[test]
    fn shared_resource_runs_close_hook_once() {
        let closes = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&closes);
        let mut resource = SharedResource::new("r".into(), Arc::new(())).on_close(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        resource.close().unwrap();
        resource.close().unwrap();
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }
}
