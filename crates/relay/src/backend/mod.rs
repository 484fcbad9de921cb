//! The contract between the relay and whatever actually runs the pods.
//!
//! The relay never talks to a backend directly. It goes through a
//! [`BackendExecutor`], picked once at startup by [`from_config`].
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use hyper::body::Bytes;
use k8s_openapi::api::core::v1::Pod as KubePod;
use relay_api::{LogRequest, PodStatus, RetrievedPodData};
use thiserror::Error;

use crate::config::{BackendKind, Config};

mod sidecar;

pub use sidecar::{BatchSchedulerExecutor, ContainerHostExecutor, SidecarClient};

/// A failed backend call.
#[derive(Error, Debug)]
pub enum BackendError {
    /// The backend could not be reached or the exchange broke off.
    #[error("backend unreachable: {0}")]
    Transport(#[from] reqwest::Error),
    /// The backend answered with an unexpected status code.
    #[error("backend returned {code}: {body}")]
    Status {
        /// HTTP status code returned by the backend.
        code: u16,
        /// Response body, as text.
        body: String,
    },
    /// The backend's answer could not be decoded.
    #[error("unable to decode backend response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// A raw backend answer, passed through to the node untouched.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackendReply {
    /// HTTP status code.
    pub status: u16,
    /// Response body.
    pub body: Bytes,
}

impl BackendReply {
    /// Whether the status code is 2xx.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Log bytes as the backend produces them.
pub type LogStream = BoxStream<'static, Result<Bytes, BackendError>>;

/// Something that runs pods on behalf of the relay.
///
/// Every call carries the session id of the node request that caused it.
#[async_trait]
pub trait BackendExecutor: Send + Sync {
    /// Start the pod described by `data`.
    async fn create(
        &self,
        data: &[RetrievedPodData],
        session: &str,
    ) -> Result<BackendReply, BackendError>;

    /// Stop and forget `pod`.
    async fn delete(&self, pod: &KubePod, session: &str) -> Result<BackendReply, BackendError>;

    /// Current status of `pods`. An empty slice is a valid request.
    async fn status(&self, pods: &[KubePod], session: &str)
        -> Result<Vec<PodStatus>, BackendError>;

    /// Stream the logs selected by `request`.
    async fn logs(&self, request: &LogRequest, session: &str) -> Result<LogStream, BackendError>;

    /// Check that the backend answers at all.
    async fn ping(&self, session: &str) -> Result<BackendReply, BackendError>;
}

/// Build the executor selected by `config`.
pub fn from_config(config: &Config) -> anyhow::Result<Arc<dyn BackendExecutor>> {
    let client = SidecarClient::new(&config.sidecar_endpoint()?)?;
    let executor: Arc<dyn BackendExecutor> = match config.sidecar_service {
        BackendKind::ContainerHost => Arc::new(ContainerHostExecutor::new(client)),
        BackendKind::BatchScheduler => Arc::new(BatchSchedulerExecutor::new(client)),
    };
    Ok(executor)
}
