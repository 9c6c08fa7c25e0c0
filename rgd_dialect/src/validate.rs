//! Schema-validation front-end (§6's "CLI / env / files" external-interfaces list names this as
//! a collaborator this crate only defines the seam for): a trait an embedder can implement to
//! check a graph's declared spec/status shape before it is rendered or deployed. The core ships a
//! permissive default that only checks structural shape — real schema semantics (required fields,
//! types, enums) are out of scope per §1's "does not validate resource semantics beyond
//! structural shape and reference well-formedness".

use api::{ResourceGraph, Value};
use thiserror::Error;

/// Raised by a [`SchemaValidator`] when a declared schema shape fails its check.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("schema validation failed at {field_path}: {reason}")]
pub struct ValidationError {
    /// The offending top-level field (`"spec"` or `"status"`).
    pub field_path: String,
    /// Why it failed.
    pub reason: String,
}

/// A schema-validation front-end. Object-safe so embedders can box their own implementation.
pub trait SchemaValidator: Send + Sync {
    /// Checks a graph's declared schema shape, independent of whether it renders or deploys
    /// cleanly — this runs before either.
    fn validate(&self, graph: &ResourceGraph) -> Result<(), ValidationError>;
}

/// The permissive default: confirms the declared spec/status are either absent (`Value::Null`,
/// the shape every constructor in this workspace uses for "not yet filled in") or an object —
/// catching a builder that wired a scalar or array in by mistake without attempting real JSON
/// Schema semantics.
#[derive(Debug, Default, Clone, Copy)]
pub struct StructuralSchemaValidator;

impl SchemaValidator for StructuralSchemaValidator {
    fn validate(&self, graph: &ResourceGraph) -> Result<(), ValidationError> {
        check_shape("spec", &graph.schema.spec)?;
        check_shape("status", &graph.schema.status)
    }
}

fn check_shape(field_path: &str, value: &Value) -> Result<(), ValidationError> {
    match value {
        Value::Object(_) | Value::Null => Ok(()),
        other => Err(ValidationError {
            field_path: field_path.to_string(),
            reason: format!("expected an object shape, got {other:?}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use api::Schema;
    use indexmap::IndexMap;
    use std::sync::Arc;

    fn graph_with(spec: Value, status: Value) -> ResourceGraph {
        ResourceGraph {
            resources: IndexMap::new(),
            schema: Schema {
                api_version: "example.com/v1alpha1".into(),
                kind: "Widget".into(),
                spec,
                status,
            },
            status: Arc::new(|_s, _r| Value::Null),
        }
    }

    #[test]
    fn null_and_object_shapes_pass() {
        let validator = StructuralSchemaValidator;
        assert!(validator.validate(&graph_with(Value::Null, Value::Null)).is_ok());
        assert!(validator.validate(&graph_with(Value::Object(IndexMap::new()), Value::Null)).is_ok());
    }

    #[test]
    fn scalar_spec_shape_fails() {
        let validator = StructuralSchemaValidator;
        let err = validator.validate(&graph_with(Value::Int(1), Value::Null)).unwrap_err();
        assert_eq!(err.field_path, "spec");
    }
}
