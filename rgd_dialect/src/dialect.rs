//! A trait seam between this crate's concrete rendering and the deployment engine, so `engine`
//! depends only on the capability ("render a graph to the cluster dialect"), not on this crate's
//! internal document shape.

use api::ResourceGraph;

use crate::document::{render, ResourceGraphDefinition};
use crate::error::Result;

/// Renders resource graphs into the cluster-side wire dialect.
pub trait SchemaDialect: Send + Sync {
    /// Renders a graph into its wire document.
    fn render(&self, graph: &ResourceGraph) -> Result<ResourceGraphDefinition>;

    /// Renders a graph straight to YAML, the form a `kubectl apply -f -` or GitOps pipeline
    /// consumes.
    fn to_yaml(&self, graph: &ResourceGraph) -> Result<String> {
        let doc = self.render(graph)?;
        Ok(serde_yaml::to_string(&doc)?)
    }
}

/// The only dialect this crate implements today.
#[derive(Debug, Default, Clone, Copy)]
pub struct ClusterDialect;

impl SchemaDialect for ClusterDialect {
    fn render(&self, graph: &ResourceGraph) -> Result<ResourceGraphDefinition> {
        render(graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use api::{Schema, Value};
    use indexmap::IndexMap;
    use std::sync::Arc;

    #[test]
    fn cluster_dialect_renders_empty_graph_to_yaml() {
        let graph = ResourceGraph {
            resources: IndexMap::new(),
            schema: Schema {
                api_version: "example.com/v1alpha1".into(),
                kind: "Widget".into(),
                spec: Value::Null,
                status: Value::Null,
            },
            status: Arc::new(|_s, _r| Value::Null),
        };
        let yaml = ClusterDialect.to_yaml(&graph).unwrap();
        assert!(yaml.contains("ResourceGraphDefinition"));
    }
}
