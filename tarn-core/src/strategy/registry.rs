//! Strategy registry
//!
//! Maps class names to constructors. Binaries register every strategy they
//! ship at startup; configs reference strategies by these names, so no
//! code is loaded at runtime.

use super::Strategy;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Constructor: build a strategy from its config params.
pub type StrategyCtor =
    Arc<dyn Fn(&serde_json::Value) -> anyhow::Result<Box<dyn Strategy>> + Send + Sync>;

/// The registry. Cloning shares the underlying table.
#[derive(Clone, Default)]
pub struct StrategyRegistry {
    ctors: Arc<RwLock<HashMap<String, StrategyCtor>>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor under a class name. Last registration wins.
    pub fn register<F>(&self, name: impl Into<String>, ctor: F)
    where
        F: Fn(&serde_json::Value) -> anyhow::Result<Box<dyn Strategy>> + Send + Sync + 'static,
    {
        let name = name.into();
        debug!(%name, "strategy class registered");
        self.ctors.write().insert(name, Arc::new(ctor));
    }

    /// Instantiate a strategy by class name.
    pub fn create(
        &self,
        name: &str,
        params: &serde_json::Value,
    ) -> anyhow::Result<Box<dyn Strategy>> {
        let ctor = self
            .ctors
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unknown strategy class `{}`", name))?;
        ctor(params)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.ctors.read().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.ctors.read().keys().cloned().collect();
        names.sort();
        names
    }
}
