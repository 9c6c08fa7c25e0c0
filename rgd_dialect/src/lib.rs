#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]
//! Rgd_dialect renders a [`api::ResourceGraph`] into the cluster-side wire dialect (component C5):
//! a `ResourceGraphDefinition` document in which every embedded reference and expression has been
//! rewritten from this workspace's own representation to `${...}` tokens.

pub mod dialect;
pub mod document;
pub mod error;
pub mod expr;
pub mod validate;

pub use dialect::{ClusterDialect, SchemaDialect};
pub use document::{render, ResourceGraphDefinition, ResourceTemplate, SchemaSection};
pub use error::{Error, Result};
pub use validate::{SchemaValidator, StructuralSchemaValidator, ValidationError};
