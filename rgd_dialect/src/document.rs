//! The cluster-side wire document (component C5): a `ResourceGraphDefinition` shaped the way the
//! cluster controller reads it off the API server, with every embedded reference/expression
//! rewritten to the `${...}` token dialect and resources ordered per the dependency resolver.

use api::{ResourceGraph, ResourceId};
use graph_builder::DependencyGraph;
use serde::Serialize;
use serde_json::Value as Json;

use crate::error::Result;
use crate::expr;

/// One resource's wire-ready template: the id it is addressed by within the graph, and the
/// manifest with every placeholder rewritten to a token.
#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceTemplate {
    /// The deterministic or user-supplied id assigned by the graph builder.
    pub id: ResourceId,
    /// The rendered manifest (apiVersion/kind plus the resource's own fields).
    pub template: Json,
}

/// The schema section of the document: the group/version/kind instances are addressed under, the
/// declared spec shape, and the declared (placeholder-bearing) status shape.
#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SchemaSection {
    /// apiVersion instances are addressed under.
    pub api_version: String,
    /// Kind instances are addressed as.
    pub kind: String,
    /// The declared spec shape.
    pub spec: Json,
    /// The evaluated status shape with static (schema-only) fields dropped and every remaining
    /// field's resource references rendered as `${...}` tokens.
    pub status: Json,
}

/// The full document this crate emits.
#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceGraphDefinition {
    /// Always `"resourcegraph.example.com/v1alpha1"`-style; fixed by this crate, not the caller.
    pub api_version: String,
    /// Always `"ResourceGraphDefinition"`.
    pub kind: String,
    /// The schema section.
    pub schema: SchemaSection,
    /// Resources, in dependency (topological) order — not declaration order — so the cluster
    /// controller can apply the document top-to-bottom without its own resolution pass.
    pub resources: Vec<ResourceTemplate>,
}

/// The apiVersion this crate stamps every emitted document with.
pub const DOCUMENT_API_VERSION: &str = "resourcegraph.example.com/v1alpha1";
/// The kind this crate stamps every emitted document with.
pub const DOCUMENT_KIND: &str = "ResourceGraphDefinition";

/// Renders a complete [`ResourceGraph`] into a [`ResourceGraphDefinition`].
///
/// Resource ids follow the dependency resolver's (C3) deterministic assignment and the resource
/// list itself is ordered by [`DependencyGraph::topological_order`], so re-rendering the same
/// graph twice produces byte-identical JSON (Testable Property 1).
pub fn render(graph: &ResourceGraph) -> Result<ResourceGraphDefinition> {
    let dag = DependencyGraph::build(&graph.resources)?;
    let order = dag.topological_order();

    let mut resources = Vec::with_capacity(order.len());
    for id in &order {
        let entry = &graph.resources[id];
        let mut template = serde_json::Map::new();
        template.insert("apiVersion".to_string(), Json::String(entry.api_version.clone()));
        template.insert("kind".to_string(), Json::String(entry.kind.clone()));
        if let Json::Object(body) = expr::render_value(&entry.manifest) {
            template.extend(body);
        }
        resources.push(ResourceTemplate {
            id: id.clone(),
            template: Json::Object(template),
        });
    }

    let schema = SchemaSection {
        api_version: graph.schema.api_version.clone(),
        kind: graph.schema.kind.clone(),
        spec: expr::render_value(&graph.schema.spec),
        status: render_status(&graph.status_shape()),
    };

    Ok(ResourceGraphDefinition {
        api_version: DOCUMENT_API_VERSION.to_string(),
        kind: DOCUMENT_KIND.to_string(),
        schema,
        resources,
    })
}

/// Renders the evaluated status shape, dropping every top-level field whose value mentions only
/// schema references (or no references at all): those are *static* and are instead hydrated
/// directly by the engine (C8) rather than round-tripped through the cluster controller. A field
/// that mentions any resource reference is *dynamic* and is emitted as a `${...}` expression, per
/// the static/dynamic status split in §4.5 and Testable Property 10.
fn render_status(status: &api::Value) -> Json {
    match status {
        api::Value::Object(fields) => {
            let mut out = serde_json::Map::with_capacity(fields.len());
            for (name, value) in fields {
                if expr::is_dynamic(value) {
                    out.insert(name.clone(), expr::render_value(value));
                }
            }
            Json::Object(out)
        }
        other => expr::render_value(other),
    }
}
