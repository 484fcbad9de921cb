//! Executors that reach the backend through an HTTP sidecar.
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::Pod as KubePod;
use relay_api::session::SESSION_HEADER;
use relay_api::{LogRequest, PodStatus, RetrievedPodData};
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, instrument};
use url::Url;

use super::{BackendError, BackendExecutor, BackendReply, LogStream};

/// HTTP client for a backend sidecar.
#[derive(Clone, Debug)]
pub struct SidecarClient {
    client: Client,
    base: String,
}

impl SidecarClient {
    /// A client for the sidecar listening at `endpoint`.
    pub fn new(endpoint: &Url) -> anyhow::Result<Self> {
        Ok(SidecarClient {
            client: Client::builder().build()?,
            base: endpoint.as_str().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base, path)
    }

    async fn send<T: Serialize + ?Sized>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: &T,
        session: &str,
    ) -> Result<reqwest::Response, BackendError> {
        debug!(path, session, "Calling sidecar");
        Ok(self
            .client
            .request(method, self.url(path))
            .header(SESSION_HEADER, session)
            .json(body)
            .send()
            .await?)
    }

    async fn reply<T: Serialize + ?Sized>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: &T,
        session: &str,
    ) -> Result<BackendReply, BackendError> {
        let response = self.send(method, path, body, session).await?;
        let status = response.status().as_u16();
        let body = response.bytes().await?;
        Ok(BackendReply { status, body })
    }

    /// POST `data` to the sidecar's `path`.
    pub async fn create(
        &self,
        path: &str,
        data: &[RetrievedPodData],
        session: &str,
    ) -> Result<BackendReply, BackendError> {
        self.reply(reqwest::Method::POST, path, data, session).await
    }

    /// POST `pod` to the sidecar's delete endpoint.
    pub async fn delete(&self, pod: &KubePod, session: &str) -> Result<BackendReply, BackendError> {
        self.reply(reqwest::Method::POST, "delete", pod, session)
            .await
    }

    /// Ask the sidecar for the status of `pods`.
    pub async fn status(
        &self,
        pods: &[KubePod],
        session: &str,
    ) -> Result<Vec<PodStatus>, BackendError> {
        let reply = self
            .reply(reqwest::Method::GET, "status", pods, session)
            .await?;
        if !reply.is_success() {
            return Err(BackendError::Status {
                code: reply.status,
                body: String::from_utf8_lossy(&reply.body).into_owned(),
            });
        }
        Ok(serde_json::from_slice(&reply.body)?)
    }

    /// Open a log stream on the sidecar.
    pub async fn logs(
        &self,
        request: &LogRequest,
        session: &str,
    ) -> Result<LogStream, BackendError> {
        let response = self
            .send(reqwest::Method::GET, "getLogs", request, session)
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Status {
                code: status.as_u16(),
                body,
            });
        }
        Ok(response.bytes_stream().map_err(BackendError::from).boxed())
    }

    /// Send an empty status request, the cheapest call every sidecar serves.
    pub async fn ping(&self, session: &str) -> Result<BackendReply, BackendError> {
        let empty: [KubePod; 0] = [];
        self.reply(reqwest::Method::GET, "status", &empty[..], session)
            .await
    }
}

/// A backend that runs each container directly on a container host.
#[derive(Clone, Debug)]
pub struct ContainerHostExecutor {
    client: SidecarClient,
}

impl ContainerHostExecutor {
    /// Wrap a sidecar client.
    pub fn new(client: SidecarClient) -> Self {
        ContainerHostExecutor { client }
    }
}

#[async_trait]
impl BackendExecutor for ContainerHostExecutor {
    #[instrument(level = "info", skip(self, data))]
    async fn create(
        &self,
        data: &[RetrievedPodData],
        session: &str,
    ) -> Result<BackendReply, BackendError> {
        self.client.create("create", data, session).await
    }

    async fn delete(&self, pod: &KubePod, session: &str) -> Result<BackendReply, BackendError> {
        self.client.delete(pod, session).await
    }

    async fn status(
        &self,
        pods: &[KubePod],
        session: &str,
    ) -> Result<Vec<PodStatus>, BackendError> {
        self.client.status(pods, session).await
    }

    async fn logs(&self, request: &LogRequest, session: &str) -> Result<LogStream, BackendError> {
        self.client.logs(request, session).await
    }

    async fn ping(&self, session: &str) -> Result<BackendReply, BackendError> {
        self.client.ping(session).await
    }
}

/// A backend that turns pods into batch scheduler jobs.
///
/// Identical to [`ContainerHostExecutor`] except that jobs are submitted rather
/// than created.
#[derive(Clone, Debug)]
pub struct BatchSchedulerExecutor {
    client: SidecarClient,
}

impl BatchSchedulerExecutor {
    /// Wrap a sidecar client.
    pub fn new(client: SidecarClient) -> Self {
        BatchSchedulerExecutor { client }
    }
}

#[async_trait]
impl BackendExecutor for BatchSchedulerExecutor {
    #[instrument(level = "info", skip(self, data))]
    async fn create(
        &self,
        data: &[RetrievedPodData],
        session: &str,
    ) -> Result<BackendReply, BackendError> {
        self.client.create("submit", data, session).await
    }

    async fn delete(&self, pod: &KubePod, session: &str) -> Result<BackendReply, BackendError> {
        self.client.delete(pod, session).await
    }

    async fn status(
        &self,
        pods: &[KubePod],
        session: &str,
    ) -> Result<Vec<PodStatus>, BackendError> {
        self.client.status(pods, session).await
    }

    async fn logs(&self, request: &LogRequest, session: &str) -> Result<LogStream, BackendError> {
        self.client.logs(request, session).await
    }

    async fn ping(&self, session: &str) -> Result<BackendReply, BackendError> {
        self.client.ping(session).await
    }
}
