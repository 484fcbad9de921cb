//! The relay operations, independent of how requests reach them.
use std::path::PathBuf;
use std::sync::Arc;

use http::StatusCode;
use k8s_openapi::api::core::v1::Pod as KubePod;
use relay_api::{
    CreateRequest, LogRequest, PodIdentity, PodStatus, RetrievedContainer, RetrievedPodData,
};
use tracing::{debug, error, info, instrument, warn};

use crate::backend::{BackendExecutor, BackendReply, LogStream};
use crate::cache::StatusCache;
use crate::config::Config;
use crate::error::RelayError;
use crate::resolver::{self, Available};

/// Phases for which a cached status is never trusted.
const ALWAYS_REFRESH_PHASES: [&str; 2] = ["Running", "Pending"];

/// The answer to a delete, returned whether or not anything was cached.
#[derive(Debug, PartialEq, Eq)]
pub struct DeleteOutcome {
    /// The backend's status code, or 500 if it could not be reached.
    pub status: StatusCode,
    /// The deleted pod.
    pub pods: Vec<PodIdentity>,
}

/// Forwards pod lifecycle requests to a backend and remembers what the
/// backend last said about each pod.
#[derive(Clone)]
pub struct Relay {
    cache: Arc<StatusCache>,
    backend: Arc<dyn BackendExecutor>,
    export_pod_data: bool,
    data_root: PathBuf,
}

impl Relay {
    /// A relay in front of `backend`, caching into `cache`.
    pub fn new(
        cache: Arc<StatusCache>,
        backend: Arc<dyn BackendExecutor>,
        config: &Config,
    ) -> Self {
        Relay {
            cache,
            backend,
            export_pod_data: config.export_pod_data,
            data_root: config.data_root_folder.clone(),
        }
    }

    /// The status cache.
    pub fn cache(&self) -> &Arc<StatusCache> {
        &self.cache
    }

    /// Forward a create to the backend, passing its answer through untouched.
    #[instrument(
        level = "info",
        skip(self, request),
        fields(pod = ?request.pod.metadata.name, uid = ?request.pod.metadata.uid)
    )]
    pub async fn create(
        &self,
        request: CreateRequest,
        session: &str,
    ) -> Result<BackendReply, RelayError> {
        info!("Received create call");
        let data = if self.export_pod_data {
            let resolution = resolver::resolve(
                &request.pod,
                Available {
                    config_maps: &request.config_maps,
                    secrets: &request.secrets,
                    projected_volume_maps: &request.projected_volume_maps,
                },
                &self.data_root,
            );
            if !resolution.missing.is_empty() {
                warn!(
                    missing = resolution.missing.len(),
                    "Create proceeds with unresolved references"
                );
            }
            RetrievedPodData {
                containers: resolution.containers,
                pod: request.pod,
            }
        } else {
            RetrievedPodData {
                containers: bare_containers(&request.pod),
                pod: request.pod,
            }
        };

        let reply = self.backend.create(&[data], session).await.map_err(|e| {
            error!(error = %e, "Backend create failed");
            RelayError::from(e)
        })?;
        if !reply.is_success() {
            warn!(status = reply.status, "Backend rejected create");
        }
        Ok(reply)
    }

    /// Evict `pod` from the cache and forward the delete.
    ///
    /// Deleting a pod twice gives the same kind of answer both times.
    #[instrument(
        level = "info",
        skip(self, pod),
        fields(pod = ?pod.metadata.name, uid = ?pod.metadata.uid)
    )]
    pub async fn delete(&self, pod: KubePod, session: &str) -> DeleteOutcome {
        info!("Received delete call");
        let identity = PodIdentity::from(&pod);
        if self.cache.evict_deleted(&identity.uid).is_none() {
            debug!("Pod had no cached status");
        }

        let status = match self.backend.delete(&pod, session).await {
            Ok(reply) => {
                StatusCode::from_u16(reply.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
            Err(e) => {
                error!(error = %e, "Backend delete failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        DeleteOutcome {
            status,
            pods: vec![identity],
        }
    }

    /// Statuses for `pods`, refreshed from the backend where the cache cannot
    /// be trusted. An empty `pods` returns every cached status.
    ///
    /// A pod must be refreshed when it is Running or Pending, or when nothing
    /// is cached for it yet. If the backend fails, nothing is cached and the
    /// whole call fails.
    #[instrument(level = "debug", skip(self, pods), fields(pods = pods.len()))]
    pub async fn status(
        &self,
        pods: Vec<KubePod>,
        session: &str,
    ) -> Result<Vec<PodStatus>, RelayError> {
        if pods.is_empty() {
            return Ok(self.cache.snapshot());
        }

        let refresh: Vec<KubePod> = pods
            .iter()
            .filter(|pod| self.must_refresh(pod))
            .cloned()
            .collect();
        debug!(
            refresh = refresh.len(),
            cached = pods.len() - refresh.len(),
            "Partitioned status request"
        );

        if !refresh.is_empty() {
            let fresh = self.backend.status(&refresh, session).await.map_err(|e| {
                error!(error = %e, "Backend status failed");
                RelayError::from(e)
            })?;
            self.cache.put(fresh);
        }

        Ok(pods
            .iter()
            .filter_map(|pod| pod.metadata.uid.as_deref())
            .filter_map(|uid| self.cache.get(uid))
            .collect())
    }

    fn must_refresh(&self, pod: &KubePod) -> bool {
        let phase = pod
            .status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .unwrap_or_default();
        let uid = pod.metadata.uid.as_deref().unwrap_or_default();
        ALWAYS_REFRESH_PHASES.contains(&phase) || !self.cache.contains(uid)
    }

    /// Open a log stream for the requested container.
    ///
    /// Requests with contradictory options never reach the backend.
    #[instrument(
        level = "info",
        skip(self, request),
        fields(pod = %request.pod_name, container = %request.container_name)
    )]
    pub async fn logs(&self, request: LogRequest, session: &str) -> Result<LogStream, RelayError> {
        request.validate().map_err(|e| {
            warn!(error = %e, "Rejecting log request");
            RelayError::from(e)
        })?;
        Ok(self.backend.logs(&request, session).await?)
    }

    /// Forget the cached status for `uid`.
    pub fn update_cache(&self, uid: &str) {
        match self.cache.evict(uid) {
            Some(_) => info!(uid, "Evicted cached status"),
            None => debug!(uid, "Nothing cached to evict"),
        }
    }

    /// Whether the backend answers.
    pub async fn ping(&self, session: &str) -> StatusCode {
        match self.backend.ping(session).await {
            Ok(reply) if reply.is_success() => StatusCode::OK,
            Ok(reply) => {
                warn!(status = reply.status, "Backend ping was rejected");
                StatusCode::SERVICE_UNAVAILABLE
            }
            Err(e) => {
                warn!(error = %e, "Backend unreachable");
                StatusCode::SERVICE_UNAVAILABLE
            }
        }
    }
}

fn bare_containers(pod: &KubePod) -> Vec<RetrievedContainer> {
    pod.spec
        .iter()
        .flat_map(|spec| spec.containers.iter().chain(spec.init_containers.iter().flatten()))
        .map(|c| RetrievedContainer {
            name: c.name.clone(),
            ..Default::default()
        })
        .collect()
}

/// Pull a pod UID out of an update-cache body.
///
/// Accepts a pod object, a JSON string or a bare UID.
pub fn uid_from_body(body: &[u8]) -> Option<String> {
    let uid = match serde_json::from_slice::<serde_json::Value>(body) {
        Ok(serde_json::Value::String(uid)) => uid,
        Ok(value @ serde_json::Value::Object(_)) => value
            .pointer("/metadata/uid")
            .or_else(|| value.get("UID"))
            .and_then(|v| v.as_str())?
            .to_string(),
        _ => String::from_utf8_lossy(body).trim().to_string(),
    };
    if uid.is_empty() {
        None
    } else {
        Some(uid)
    }
}
