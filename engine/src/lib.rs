#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]

//! Engine runs a [`api::ResourceGraph`] against a live cluster (component C6), resolves and
//! evaluates the references/expressions embedded in it (C4), watches the cluster's events for the
//! resources it deploys (C7), hydrates the graph's aggregate status (C8), and exposes both of
//! those as one of two [`factory::Factory`] facades (C9).

use is_terminal::IsTerminal;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::prelude::*;

pub mod backoff;
pub mod deploy;
pub mod error;
pub mod eval;
pub mod events;
pub mod factory;
pub mod progress;
pub mod resolve;
pub mod state;
pub mod status;
pub mod util;
pub mod watch;

#[cfg(test)]
pub mod testing;

pub use backoff::{BackoffPolicy, RetryPolicy};
pub use deploy::{DeployFailure, DeployOptions, Deployer, Instance, RollbackOutcome};
pub use error::{Error, Result};
pub use events::{Dedup, EventKind, Priority};
pub use factory::{ClusterFactory, DirectFactory, Factory, FactoryOptions, IntoFactory, OrchestratorScope};
pub use progress::{ProgressEvent, ProgressKind, ProgressSink};
pub use resolve::Resolver;
pub use state::{DeployedMap, DeployedRecord};
pub use status::{Hydrator, StatusValue};
pub use watch::{Connection, WatchOptions, WatchSet};

/// Installs a global `tracing` subscriber: an `EnvFilter` defaulting to `info` when
/// `RUST_LOG`/`RUST_LOG_TARGET` is unset, emitting human-readable output on a terminal and
/// structured JSON otherwise. Mirrors the teacher's `startup` wiring, minus the parts (CLI
/// parsing, the Prometheus HTTP listener) that belong to an embedding binary rather than this
/// crate — per §6 there is no CLI/env/file configuration layer at this level, only this one
/// piece of ambient process setup.
pub fn init_tracing() -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info")).map_err(Error::TracingConfig)?;
    let collector = tracing_subscriber::Registry::default()
        .with(env_filter)
        .with(if std::io::stdout().is_terminal() {
            Some(tracing_subscriber::fmt::layer())
        } else {
            None
        })
        .with(if std::io::stdout().is_terminal() {
            None
        } else {
            Some(tracing_subscriber::fmt::layer().json())
        });
    tracing::subscriber::set_global_default(collector).map_err(Error::Tracing)
}
