//! Status entries reported by the backend and cached by the relay.
use k8s_openapi::api::core::v1::{ContainerStatus, Pod as KubePod};
use serde::{Deserialize, Serialize};

/// The last known state of one pod on the backend.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct PodStatus {
    /// Pod name.
    #[serde(default, rename = "name")]
    pub pod_name: String,
    /// Pod UID, the key the relay caches by.
    #[serde(default, rename = "UID")]
    pub pod_uid: String,
    /// Pod namespace.
    #[serde(default, rename = "namespace")]
    pub pod_namespace: String,
    /// Backend job identifier, if the backend reports one.
    #[serde(default, rename = "JID")]
    pub job_id: String,
    /// Main container statuses.
    #[serde(default)]
    pub containers: Vec<ContainerStatus>,
    /// Init container statuses.
    #[serde(default, rename = "initContainers")]
    pub init_containers: Vec<ContainerStatus>,
}

/// Name, UID and namespace of a pod. This is what the relay returns from a delete.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct PodIdentity {
    /// Pod name.
    #[serde(default)]
    pub name: String,
    /// Pod UID.
    #[serde(default, rename = "UID")]
    pub uid: String,
    /// Pod namespace.
    #[serde(default)]
    pub namespace: String,
}

impl From<&KubePod> for PodIdentity {
    fn from(pod: &KubePod) -> Self {
        PodIdentity {
            name: pod.metadata.name.clone().unwrap_or_default(),
            uid: pod.metadata.uid.clone().unwrap_or_default(),
            namespace: pod
                .metadata
                .namespace
                .clone()
                .unwrap_or_else(|| "default".to_string()),
        }
    }
}

impl From<&PodStatus> for PodIdentity {
    fn from(status: &PodStatus) -> Self {
        PodIdentity {
            name: status.pod_name.clone(),
            uid: status.pod_uid.clone(),
            namespace: status.pod_namespace.clone(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    #[test]
    fn status_reads_wire_names() {
        let status: PodStatus = serde_json::from_str(
            r#"{"name": "p1", "UID": "u1", "namespace": "ns", "JID": "7",
                "containers": [{"name": "c1", "image": "", "imageID": "", "ready": true, "restartCount": 0}]}"#,
        )
        .unwrap();
        assert_eq!(status.pod_uid, "u1");
        assert_eq!(status.job_id, "7");
        assert_eq!(status.containers.len(), 1);
        assert!(status.init_containers.is_empty());
    }

    #[test]
    fn identity_defaults_namespace() {
        let pod = KubePod {
            metadata: ObjectMeta {
                name: Some("p1".to_string()),
                uid: Some("u1".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let identity = PodIdentity::from(&pod);
        assert_eq!(identity.namespace, "default");
        assert_eq!(identity.uid, "u1");
    }
}
