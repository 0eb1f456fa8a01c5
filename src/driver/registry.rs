//! Type registry — maps instance type names to driver factories.

use super::Driver;
use crate::core::error::{EngineError, Result};
use std::collections::HashMap;
use std::sync::Arc;

/// Produces the driver for one instance type.
pub trait DriverFactory: Send + Sync {
    fn create(&self) -> Arc<dyn Driver>;
}

impl<F> DriverFactory for F
where
    F: Fn() -> Arc<dyn Driver> + Send + Sync,
{
    fn create(&self) -> Arc<dyn Driver> {
        self()
    }
}

/// Hands out one shared driver for every lookup.
struct SharedDriver(Arc<dyn Driver>);

impl DriverFactory for SharedDriver {
    fn create(&self) -> Arc<dyn Driver> {
        Arc::clone(&self.0)
    }
}

/// Registry of instance types known to a run.
#[derive(Default, Clone)]
pub struct Registry {
    factories: HashMap<String, Arc<dyn DriverFactory>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory for `type_name`, replacing any earlier one.
    pub fn register(&mut self, type_name: &str, factory: Arc<dyn DriverFactory>) -> &mut Self {
        self.factories.insert(type_name.to_string(), factory);
        self
    }

    /// Register a single driver instance shared by all instances of the type.
    pub fn register_driver(&mut self, type_name: &str, driver: Arc<dyn Driver>) -> &mut Self {
        self.register(type_name, Arc::new(SharedDriver(driver)))
    }

    pub fn lookup(&self, type_name: &str) -> Option<Arc<dyn DriverFactory>> {
        self.factories.get(type_name).cloned()
    }

    /// Create the driver for an instance, failing with `UnknownType`.
    pub fn driver_for(&self, instance: &str, type_name: &str) -> Result<Arc<dyn Driver>> {
        self.lookup(type_name)
            .map(|f| f.create())
            .ok_or_else(|| EngineError::UnknownType {
                instance: instance.to_string(),
                type_name: type_name.to_string(),
            })
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.factories.contains_key(type_name)
    }

    /// Registered type names, sorted.
    pub fn type_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("types", &self.type_names())
            .finish()
    }
}
