//! Pluggable processing units and their registry.
//!
//! A unit decides whether it applies to an item and, if so, returns the
//! item's children. Units never publish and never touch job counters; the
//! dispatcher owns both.

pub mod node;

pub use node::NodeWorker;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::model::{Metadata, NodePayload, WorkData, WorkItem};

#[async_trait]
pub trait WorkerUnit<P: WorkData, M: WorkData>: Send + Sync {
    /// Registry name, also used in logs and fault records.
    fn name(&self) -> &str;

    /// Pure predicate: does this unit handle `item`?
    fn accepts(&self, item: &WorkItem<P, M>) -> bool;

    /// Produce the children of `item`, in order. May persist derived data.
    async fn process(&self, item: &WorkItem<P, M>) -> Result<Vec<WorkItem<P, M>>>;
}

/// Builds one worker unit.
pub type WorkerFactory<P, M> = fn() -> Arc<dyn WorkerUnit<P, M>>;

/// Name → factory mapping, populated by explicit `register` calls.
pub struct WorkerRegistry<P, M> {
    factories: HashMap<String, WorkerFactory<P, M>>,
}

impl<P: WorkData, M: WorkData> WorkerRegistry<P, M> {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register `factory` under `name` (matched case-insensitively).
    pub fn register(&mut self, name: &str, factory: WorkerFactory<P, M>) -> &mut Self {
        self.factories.insert(name.to_lowercase(), factory);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(&name.to_lowercase())
    }

    /// Instantiate the named units, keeping the given order.
    pub fn build(&self, names: &[String]) -> Result<Vec<Arc<dyn WorkerUnit<P, M>>>> {
        names
            .iter()
            .map(|name| {
                self.factories
                    .get(&name.to_lowercase())
                    .map(|factory| factory())
                    .ok_or_else(|| Error::Config(format!("unknown worker: {name}")))
            })
            .collect()
    }
}

impl<P: WorkData, M: WorkData> Default for WorkerRegistry<P, M> {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerRegistry<NodePayload, Metadata> {
    /// Registry with the built-in tree units.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(NodeWorker::NAME, node_worker);
        registry
    }
}

fn node_worker() -> Arc<dyn WorkerUnit<NodePayload, Metadata>> {
    Arc::new(NodeWorker)
}
