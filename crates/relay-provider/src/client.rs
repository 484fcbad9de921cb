//! HTTP client for the relay.
use std::path::PathBuf;

use futures::stream::BoxStream;
use futures::StreamExt;
use hyper::body::Bytes;
use k8s_openapi::api::core::v1::Pod as KubePod;
use relay_api::session::{new_session, SESSION_HEADER};
use relay_api::{CreateRequest, LogRequest, PodIdentity, PodStatus};
use reqwest::{Certificate, Client, Identity, Method, Response};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::config::Config;

/// A failed call to the relay.
#[derive(Error, Debug)]
pub enum ClientError {
    /// The token file could not be read.
    #[error("unable to read token file {}: {source}", path.display())]
    Token {
        /// The token file.
        path: PathBuf,
        /// Why it could not be read.
        source: std::io::Error,
    },
    /// The relay could not be reached or the exchange broke off.
    #[error("relay unreachable: {0}")]
    Transport(#[from] reqwest::Error),
    /// The relay answered with a non-2xx status code.
    #[error("relay returned {code}: {body}")]
    Status {
        /// HTTP status code.
        code: u16,
        /// Response body, as text.
        body: String,
    },
    /// The relay's answer could not be decoded.
    #[error("unable to decode relay response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Log bytes streamed back from the relay.
pub type LogStream = BoxStream<'static, Result<Bytes, reqwest::Error>>;

/// Talks to one relay. Cheap to clone.
#[derive(Clone, Debug)]
pub struct RelayClient {
    client: Client,
    base: String,
    token_file: Option<PathBuf>,
}

impl RelayClient {
    /// A client for the relay described by `config`.
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let mut builder = Client::builder();
        if config.tls.enabled {
            if let Some(ca) = &config.tls.ca_cert_file {
                let pem = std::fs::read(ca)
                    .map_err(|e| anyhow::anyhow!("unable to read CA {}: {}", ca.display(), e))?;
                builder = builder.add_root_certificate(Certificate::from_pem(&pem)?);
            }
            if let (Some(cert), Some(key)) = (&config.tls.cert_file, &config.tls.key_file) {
                let cert = std::fs::read(cert)
                    .map_err(|e| anyhow::anyhow!("unable to read {}: {}", cert.display(), e))?;
                let key = std::fs::read(key)
                    .map_err(|e| anyhow::anyhow!("unable to read {}: {}", key.display(), e))?;
                builder = builder.identity(client_identity(&cert, &key)?);
            }
        }
        Ok(RelayClient {
            client: builder.build()?,
            base: config.relay_endpoint()?.as_str().trim_end_matches('/').to_string(),
            token_file: config.token_file.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base, path)
    }

    // The token is rotated underneath us, so it is never cached.
    async fn token(&self) -> Result<Option<String>, ClientError> {
        match &self.token_file {
            Some(path) => tokio::fs::read_to_string(path)
                .await
                .map(|t| Some(t.trim().to_string()))
                .map_err(|source| ClientError::Token {
                    path: path.clone(),
                    source,
                }),
            None => Ok(None),
        }
    }

    async fn send<T: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: &T,
        operation: &str,
    ) -> Result<Response, ClientError> {
        let session = new_session(operation);
        debug!(path, %session, "Calling relay");
        let mut request = self
            .client
            .request(method, self.url(path))
            .header(SESSION_HEADER, session)
            .json(body);
        if let Some(token) = self.token().await? {
            request = request.bearer_auth(token);
        }
        Ok(request.send().await?)
    }

    async fn checked<T: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: &T,
        operation: &str,
    ) -> Result<Bytes, ClientError> {
        let response = self.send(method, path, body, operation).await?;
        let status = response.status();
        let body = response.bytes().await?;
        if !status.is_success() {
            return Err(ClientError::Status {
                code: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }
        Ok(body)
    }

    /// Probe the relay. Returns the status code and body whatever the code.
    pub async fn ping(&self) -> Result<(u16, String), ClientError> {
        let response = self.send(Method::POST, "pinglink", &(), "Ping").await?;
        let status = response.status().as_u16();
        Ok((status, response.text().await?))
    }

    /// Ask the relay to start a pod. The raw body is returned since backends
    /// do not all answer with JSON.
    pub async fn create(&self, request: &CreateRequest) -> Result<Bytes, ClientError> {
        self.checked(Method::POST, "create", request, "Create").await
    }

    /// Ask the relay to stop and forget `pod`.
    pub async fn delete(&self, pod: &KubePod) -> Result<Vec<PodIdentity>, ClientError> {
        let body = self.checked(Method::DELETE, "delete", pod, "Delete").await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Current status of `pods`.
    pub async fn status(&self, pods: &[KubePod]) -> Result<Vec<PodStatus>, ClientError> {
        let body = self.checked(Method::GET, "status", pods, "Status").await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Open a log stream.
    pub async fn logs(&self, request: &LogRequest) -> Result<LogStream, ClientError> {
        let response = self.send(Method::GET, "getLogs", request, "GetLogs").await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Status {
                code: status.as_u16(),
                body,
            });
        }
        Ok(response.bytes_stream().boxed())
    }

    /// Ask the relay to drop whatever it caches for `uid`.
    pub async fn update_cache(&self, uid: &str) -> Result<(), ClientError> {
        self.checked(Method::POST, "updateCache", uid, "UpdateCache")
            .await?;
        Ok(())
    }
}

#[cfg(feature = "rustls-tls")]
fn client_identity(cert: &[u8], key: &[u8]) -> anyhow::Result<Identity> {
    let mut pem = cert.to_vec();
    pem.extend_from_slice(key);
    Ok(Identity::from_pem(&pem)?)
}

#[cfg(not(feature = "rustls-tls"))]
fn client_identity(cert: &[u8], key: &[u8]) -> anyhow::Result<Identity> {
    Ok(Identity::from_pkcs8_pem(cert, key)?)
}
