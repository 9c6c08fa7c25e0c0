#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]
//! Api contains the reference/expression primitives and the resource-graph data model shared by
//! every other crate in this workspace.

pub mod error;
pub mod model;
pub mod value;

pub use error::{Error, Result};
pub use model::{
    DeployedResource, DeployedStatus, ResourceEntry, ResourceGraph, Schema, WatchConnectionState,
};
pub use value::{
    ExprArg, Expression, FieldPath, PathSegment, Reference, ResourceId, TemplatePart, TypeTag, Value,
};
