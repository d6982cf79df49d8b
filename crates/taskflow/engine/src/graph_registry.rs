//! Graph registry: stores and retrieves workflow graphs
//!
//! Workflow graphs are immutable once registered. To modify, register
//! a new version. The registry tracks all versions by name.

use std::collections::HashMap;
use std::sync::Arc;
use taskflow_types::{WorkflowError, WorkflowGraph, WorkflowGraphId, WorkflowResult};

/// Registry of workflow graphs
#[derive(Clone, Debug, Default)]
pub struct GraphRegistry {
    /// All registered graphs, keyed by ID
    graphs: HashMap<WorkflowGraphId, Arc<WorkflowGraph>>,
    /// Index by name → list of graph IDs, oldest first
    by_name: HashMap<String, Vec<WorkflowGraphId>>,
}

impl GraphRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a workflow graph
    ///
    /// Validates the graph before storing. Returns the graph ID.
    pub fn register(&mut self, graph: WorkflowGraph) -> WorkflowResult<WorkflowGraphId> {
        graph.validate()?;

        if self.graphs.contains_key(&graph.id) {
            return Err(WorkflowError::ValidationError(format!(
                "Workflow graph '{}' is already registered; register a new version instead",
                graph.id
            )));
        }

        let id = graph.id.clone();
        let name = graph.name.clone();
        let version = graph.version;

        self.graphs.insert(id.clone(), Arc::new(graph));
        self.by_name.entry(name).or_default().push(id.clone());

        tracing::info!(graph_id = %id, version, "Workflow graph registered");
        Ok(id)
    }

    /// Get a graph by ID
    pub fn get(&self, id: &WorkflowGraphId) -> WorkflowResult<Arc<WorkflowGraph>> {
        self.graphs
            .get(id)
            .cloned()
            .ok_or_else(|| WorkflowError::GraphNotFound(id.clone()))
    }

    /// Get the most recently registered graph with this name
    pub fn get_latest_by_name(&self, name: &str) -> Option<Arc<WorkflowGraph>> {
        self.by_name
            .get(name)
            .and_then(|ids| ids.last())
            .and_then(|id| self.graphs.get(id))
            .cloned()
    }

    /// Get all versions of a graph by name, oldest first
    pub fn get_versions_by_name(&self, name: &str) -> Vec<Arc<WorkflowGraph>> {
        self.by_name
            .get(name)
            .map(|ids| ids.iter().filter_map(|id| self.graphs.get(id).cloned()).collect())
            .unwrap_or_default()
    }

    /// Total number of registered graphs
    pub fn count(&self) -> usize {
        self.graphs.len()
    }

    /// Check if a graph exists
    pub fn contains(&self, id: &WorkflowGraphId) -> bool {
        self.graphs.contains_key(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskflow_types::Step;

    fn make_valid_graph(name: &str) -> WorkflowGraph {
        WorkflowGraph::new(name, "review")
            .with_step(Step::action("review", "Review", ["v1"]).then("done"))
            .unwrap()
            .with_step(Step::terminal("done"))
            .unwrap()
    }

    #[test]
    fn test_register_and_get() {
        let mut registry = GraphRegistry::new();
        let id = registry.register(make_valid_graph("Review")).unwrap();

        let retrieved = registry.get(&id).unwrap();
        assert_eq!(retrieved.name, "Review");
        assert_eq!(registry.count(), 1);
        assert!(registry.contains(&id));
    }

    #[test]
    fn test_register_invalid() {
        let mut registry = GraphRegistry::new();
        let graph = WorkflowGraph::new("Empty", "start");
        assert!(registry.register(graph).is_err());
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn test_register_same_id_twice() {
        let mut registry = GraphRegistry::new();
        registry
            .register(make_valid_graph("Review").with_id("review"))
            .unwrap();
        let result = registry.register(make_valid_graph("Review").with_id("review"));
        assert!(matches!(result, Err(WorkflowError::ValidationError(_))));
    }

    #[test]
    fn test_get_not_found() {
        let registry = GraphRegistry::new();
        assert!(matches!(
            registry.get(&WorkflowGraphId::new("missing")),
            Err(WorkflowError::GraphNotFound(_))
        ));
    }

    #[test]
    fn test_versions() {
        let mut registry = GraphRegistry::new();
        registry.register(make_valid_graph("Review")).unwrap();
        let v2 = registry
            .register(make_valid_graph("Review").with_version(2))
            .unwrap();

        let latest = registry.get_latest_by_name("Review").unwrap();
        assert_eq!(latest.id, v2);
        assert_eq!(latest.version, 2);
        assert_eq!(registry.get_versions_by_name("Review").len(), 2);
        assert!(registry.get_latest_by_name("Other").is_none());
    }
}
