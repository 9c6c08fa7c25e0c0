#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]
//! Graph_builder turns user builder closures into a [`api::ResourceGraph`]: the proxy-style
//! field-reference layer (C2), the composition context (C10), and the dependency resolver (C3).

pub mod compose;
pub mod dag;
pub mod error;
pub mod handle;

pub use compose::{Composer, DeferredStep};
pub use dag::{DependencyGraph, Level};
pub use error::{Error, Result};
pub use handle::ResourceHandle;
