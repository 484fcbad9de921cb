//! The relay sits between relaylet nodes and a backend sidecar.
//!
//! Nodes post pod lifecycle requests to the relay. The relay works out which
//! auxiliary objects each container needs, forwards the request through a
//! [`backend::BackendExecutor`], and keeps the last status the backend
//! reported for every pod in a [`cache::StatusCache`] so that finished pods do
//! not have to be polled on the backend again.
//!
//! # Example
//! ```rust,no_run
//! use relay::config::Config;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_file(std::path::Path::new("/etc/relaylet/relay.yaml"))?;
//!     relay::start(config, CancellationToken::new()).await
//! }
//! ```

#![warn(missing_docs)]

pub mod backend;
pub mod cache;
pub mod config;
pub mod error;
mod relay;
pub mod resolver;
pub mod server;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

pub use crate::relay::{uid_from_body, DeleteOutcome, Relay};

/// Run a relay configured by `config` until `shutdown` is cancelled.
///
/// Restores the status cache from the data root, starts the tombstone sweeper
/// and serves the relay API.
pub async fn start(config: config::Config, shutdown: CancellationToken) -> anyhow::Result<()> {
    let cache = Arc::new(cache::StatusCache::load(&config.data_root_folder)?);
    let backend = backend::from_config(&config)?;
    info!(
        backend = ?config.sidecar_service,
        sidecar = %config.sidecar_endpoint()?,
        "Starting relay"
    );

    let sweeper = tokio::spawn(cache::sweep_tombstones(cache.clone(), shutdown.clone()));
    let relay = Relay::new(cache, backend, &config);
    let served = server::serve(relay, &config, shutdown.clone()).await;

    shutdown.cancel();
    if let Err(e) = sweeper.await {
        tracing::warn!(error = %e, "Tombstone sweeper ended abnormally");
    }
    served
}
