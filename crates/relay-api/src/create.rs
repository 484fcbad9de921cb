//! Payloads for creating a pod on the remote backend.
use k8s_openapi::api::core::v1::{ConfigMap, Pod as KubePod, Secret};
use serde::{Deserialize, Serialize};

/// A create request sent by a node to the relay.
///
/// Carries the pod together with every auxiliary object the node collected
/// for it. The relay decides which of them each container actually needs.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct CreateRequest {
    /// The pod to create.
    pub pod: KubePod,
    /// Config maps referenced by the pod's volumes.
    #[serde(default, rename = "configmaps")]
    pub config_maps: Vec<ConfigMap>,
    /// Secrets referenced by the pod's volumes.
    #[serde(default)]
    pub secrets: Vec<Secret>,
    /// One config map per projected volume, named after the volume. Keys are
    /// file paths inside the volume, values are file contents.
    #[serde(default, rename = "projectedvolumesmaps")]
    pub projected_volume_maps: Vec<ConfigMap>,
}

/// The objects a single container mounts.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct RetrievedContainer {
    /// Container name.
    pub name: String,
    /// Config maps mounted by this container.
    #[serde(default, rename = "configMaps")]
    pub config_maps: Vec<ConfigMap>,
    /// Projected volume maps mounted by this container.
    #[serde(default, rename = "projectedvolumemaps")]
    pub projected_volume_maps: Vec<ConfigMap>,
    /// Secrets mounted by this container.
    #[serde(default)]
    pub secrets: Vec<Secret>,
    /// Conventional host paths for emptyDir volumes.
    ///
    /// Kept for older sidecars; newer ones derive their own paths.
    #[serde(default, rename = "emptyDirs")]
    pub empty_dirs: Vec<String>,
}

/// A pod plus its per-container bundles, as handed to the backend.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct RetrievedPodData {
    /// The pod being created.
    pub pod: KubePod,
    /// One entry per container.
    #[serde(default, rename = "container")]
    pub containers: Vec<RetrievedContainer>,
}

/// What a backend answers to a successful create.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct CreateResponse {
    /// The UID of the created pod.
    #[serde(default, rename = "PodUID")]
    pub pod_uid: String,
    /// The backend's identifier for the job running the pod.
    #[serde(default, rename = "PodJID")]
    pub pod_jid: String,
}
