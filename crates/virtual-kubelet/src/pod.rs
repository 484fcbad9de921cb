//! `pod` is a collection of utilities surrounding the Kubernetes pod API.
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{
    Container as KubeContainer, Pod as KubePod, PodStatus as KubePodStatus, Volume as KubeVolume,
};
use kube::api::{Api, Patch, PatchParams};
use tracing::{debug, warn};

/// A Kubernetes Pod
///
/// This is a new type around the k8s_openapi Pod definition
/// providing convenient accessor methods
#[derive(Default, Debug, Clone)]
pub struct Pod(KubePod);

impl Pod {
    /// Construct a new Pod
    pub fn new(inner: KubePod) -> Self {
        Self(inner)
    }

    /// Get the name of the pod. Empty if the pod has no name yet.
    pub fn name(&self) -> &str {
        self.0.metadata.name.as_deref().unwrap_or_default()
    }

    /// Get the pod's namespace
    ///
    /// Returns "default" if no namespace was explictily set
    pub fn namespace(&self) -> &str {
        self.0.metadata.namespace.as_deref().unwrap_or("default")
    }

    /// Get the pod's UID. Empty if the pod was never stored by the API server.
    pub fn uid(&self) -> &str {
        self.0.metadata.uid.as_deref().unwrap_or_default()
    }

    /// The `namespace:name` key used to index pods.
    pub fn key(&self) -> String {
        pod_key(self.namespace(), self.name())
    }

    /// Get the pod volumes
    pub fn volumes(&self) -> &[KubeVolume] {
        self.0
            .spec
            .as_ref()
            .and_then(|s| s.volumes.as_deref())
            .unwrap_or_default()
    }

    /// Get the pod's ip
    pub fn pod_ip(&self) -> Option<&str> {
        self.0.status.as_ref()?.pod_ip.as_deref()
    }

    /// Get the pod's labels
    pub fn labels(&self) -> &BTreeMap<String, String> {
        self.0.metadata.labels.as_ref().unwrap_or(&EMPTY_MAP)
    }

    /// Get the pod's annotations
    pub fn annotations(&self) -> &BTreeMap<String, String> {
        self.0.metadata.annotations.as_ref().unwrap_or(&EMPTY_MAP)
    }

    /// Get a specific annotation from the pod
    pub fn get_annotation(&self, key: &str) -> Option<&str> {
        Some(self.annotations().get(key)?.as_str())
    }

    /// Set an annotation on the local copy of the pod.
    pub fn set_annotation(&mut self, key: &str, value: &str) {
        self.0
            .metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(key.to_string(), value.to_string());
    }

    /// Get the deletionTimestamp if it exists
    pub fn deletion_timestamp(&self) -> Option<&DateTime<Utc>> {
        self.0.metadata.deletion_timestamp.as_ref().map(|t| &t.0)
    }

    /// Get a pod's containers
    pub fn containers(&self) -> &[KubeContainer] {
        self.0
            .spec
            .as_ref()
            .map(|s| s.containers.as_slice())
            .unwrap_or_default()
    }

    /// Get a pod's init containers
    pub fn init_containers(&self) -> &[KubeContainer] {
        self.0
            .spec
            .as_ref()
            .and_then(|s| s.init_containers.as_deref())
            .unwrap_or_default()
    }

    /// The pod's status as last recorded on this copy.
    pub fn status(&self) -> Option<&KubePodStatus> {
        self.0.status.as_ref()
    }

    /// The pod's phase, if a status has been recorded.
    pub fn phase(&self) -> Option<&str> {
        self.0.status.as_ref()?.phase.as_deref()
    }

    /// Replace the pod's status.
    pub fn set_status(&mut self, status: KubePodStatus) {
        self.0.status = Some(status);
    }

    /// Turn the Pod into the Kubernetes API version of a Pod
    pub fn into_kube_pod(self) -> KubePod {
        self.0
    }

    /// Turn a reference to a Pod into a reference to the Kubernetes API version of a Pod
    pub fn as_kube_pod(&self) -> &KubePod {
        &self.0
    }
}

impl std::convert::From<KubePod> for Pod {
    fn from(api_pod: KubePod) -> Self {
        Self(api_pod)
    }
}

impl<'a> std::convert::From<&'a Pod> for &'a KubePod {
    fn from(pod: &'a Pod) -> Self {
        &pod.0
    }
}

impl std::convert::From<Pod> for KubePod {
    fn from(pod: Pod) -> Self {
        pod.0
    }
}

/// Generates a unique human readable key for storing a handle to a pod in a
/// hash.
pub fn pod_key<N: AsRef<str>, T: AsRef<str>>(namespace: N, pod_name: T) -> String {
    format!("{}:{}", namespace.as_ref(), pod_name.as_ref())
}

/// Write the status carried by `pod` to the API server.
///
/// The job annotations a provider sets travel along with the status.
pub async fn patch_status(client: &kube::Client, pod: &Pod) -> anyhow::Result<()> {
    let status = match pod.status() {
        Some(s) => s,
        None => {
            debug!(pod = %pod.key(), "Pod has no status to patch");
            return Ok(());
        }
    };
    let patch = serde_json::json!({
        "metadata": { "annotations": pod.annotations() },
        "status": status,
    });
    let api: Api<KubePod> = Api::namespaced(client.clone(), pod.namespace());
    match api
        .patch_status(pod.name(), &PatchParams::default(), &Patch::Merge(&patch))
        .await
    {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(e)) if e.code == 404 => {
            warn!(pod = %pod.key(), "Pod disappeared before its status could be patched");
            Ok(())
        }
        Err(e) => Err(anyhow::anyhow!(
            "unable to patch status of pod {}: {}",
            pod.key(),
            e
        )),
    }
}

static EMPTY_MAP: BTreeMap<String, String> = BTreeMap::new();

#[cfg(test)]
mod test {
    use super::*;
    use k8s_openapi::api::core::v1::PodSpec;
    use kube::api::ObjectMeta;

    #[test]
    fn accessors_tolerate_missing_fields() {
        let pod = Pod::default();
        assert_eq!(pod.name(), "");
        assert_eq!(pod.namespace(), "default");
        assert!(pod.containers().is_empty());
        assert!(pod.init_containers().is_empty());
        assert!(pod.volumes().is_empty());
        assert!(pod.phase().is_none());
        assert_eq!(pod.key(), "default:");
    }

    #[test]
    fn annotations_round_trip_on_the_local_copy() {
        let mut pod = Pod::from(KubePod {
            metadata: ObjectMeta {
                name: Some("p1".to_string()),
                namespace: Some("ns".to_string()),
                uid: Some("u1".to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![KubeContainer {
                    name: "c1".to_string(),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        });
        pod.set_annotation("relaylet.io/job-id", "42");
        assert_eq!(pod.get_annotation("relaylet.io/job-id"), Some("42"));
        assert_eq!(pod.key(), "ns:p1");
        assert_eq!(pod.uid(), "u1");
        assert_eq!(pod.containers()[0].name, "c1");
    }
}
