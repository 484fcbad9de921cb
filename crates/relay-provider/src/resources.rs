//! Collects the objects a pod's volumes reference so they can travel with
//! the create request.
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    ConfigMap, KeyToPath, ProjectedVolumeSource, Secret, ServiceAccount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, PostParams};
use serde_json::json;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};
use virtual_kubelet::Pod;

use crate::config::Config;

/// Config map whose contents `KubernetesApiCaCrt` replaces.
pub const KUBE_ROOT_CA: &str = "kube-root-ca.crt";
// One hundred years. Remote jobs cannot refresh their tokens.
const TOKEN_EXPIRATION_SECONDS: i64 = 100 * 365 * 24 * 60 * 60;

/// Where referenced objects come from.
#[async_trait]
pub trait ObjectSource: Send + Sync {
    /// The config map `name`, or `None` if it does not exist.
    async fn config_map(&self, namespace: &str, name: &str) -> anyhow::Result<Option<ConfigMap>>;

    /// The secret `name`, or `None` if it does not exist.
    async fn secret(&self, namespace: &str, name: &str) -> anyhow::Result<Option<Secret>>;

    /// A token for the pod's service account, bound to the pod.
    async fn service_account_token(
        &self,
        pod: &Pod,
        audience: Option<&str>,
    ) -> anyhow::Result<String>;
}

/// Reads referenced objects from the Kubernetes API.
#[derive(Clone)]
pub struct KubeObjectSource {
    client: kube::Client,
}

impl KubeObjectSource {
    /// Wrap a client.
    pub fn new(client: kube::Client) -> Self {
        KubeObjectSource { client }
    }
}

#[async_trait]
impl ObjectSource for KubeObjectSource {
    async fn config_map(&self, namespace: &str, name: &str) -> anyhow::Result<Option<ConfigMap>> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(found) => Ok(Some(found)),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn secret(&self, namespace: &str, name: &str) -> anyhow::Result<Option<Secret>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(found) => Ok(Some(found)),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn service_account_token(
        &self,
        pod: &Pod,
        audience: Option<&str>,
    ) -> anyhow::Result<String> {
        let account = pod
            .as_kube_pod()
            .spec
            .as_ref()
            .and_then(|s| s.service_account_name.as_deref())
            .unwrap_or("default");
        let request = json!({
            "apiVersion": "authentication.k8s.io/v1",
            "kind": "TokenRequest",
            "spec": {
                "audiences": audience.into_iter().collect::<Vec<_>>(),
                "expirationSeconds": TOKEN_EXPIRATION_SECONDS,
                "boundObjectRef": {
                    "apiVersion": "v1",
                    "kind": "Pod",
                    "name": pod.name(),
                    "uid": pod.uid(),
                },
            },
        });
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), pod.namespace());
        let response: serde_json::Value = api
            .create_subresource(
                "token",
                account,
                &PostParams::default(),
                serde_json::to_vec(&request)?,
            )
            .await?;
        response
            .pointer("/status/token")
            .and_then(serde_json::Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("token request for {} returned no token", account))
    }
}

/// Collection gave up.
#[derive(Error, Debug)]
pub enum CollectError {
    /// A referenced object never showed up.
    #[error("timed out waiting for {0}")]
    Timeout(String),
}

/// The objects collected for one pod.
#[derive(Clone, Debug, Default)]
pub struct Collected {
    /// Config maps mounted as volumes.
    pub config_maps: Vec<ConfigMap>,
    /// Secrets mounted as volumes.
    pub secrets: Vec<Secret>,
    /// One synthetic config map per projected volume.
    pub projected_volume_maps: Vec<ConfigMap>,
}

/// How [`collect`] behaves.
#[derive(Clone, Debug)]
pub struct CollectOptions {
    /// Build projected volumes.
    pub projected_volumes: bool,
    /// Replacement contents for `kube-root-ca.crt`.
    pub kube_root_ca: Option<String>,
    /// Time between lookups of a missing object.
    pub poll_interval: Duration,
    /// Give up after this long.
    pub timeout: Duration,
}

impl From<&Config> for CollectOptions {
    fn from(config: &Config) -> Self {
        CollectOptions {
            projected_volumes: !config.disable_projected_volumes,
            kube_root_ca: config.kubernetes_api_ca_crt.clone(),
            poll_interval: config.volume_poll_interval(),
            timeout: config.volume_wait_timeout(),
        }
    }
}

/// Fetch everything `pod`'s volumes reference.
///
/// Missing objects are looked up again until `opts.timeout` passes, since they
/// are often created right after the pod. Optional references that do not
/// exist are skipped.
pub async fn collect(
    source: &dyn ObjectSource,
    pod: &Pod,
    opts: &CollectOptions,
) -> Result<Collected, CollectError> {
    let deadline = Instant::now() + opts.timeout;
    let namespace = pod.namespace();
    let mut collected = Collected::default();

    for volume in pod.volumes() {
        if let Some(cm) = &volume.config_map {
            let name = cm.name.as_deref().unwrap_or_default();
            let what = format!("config map {}", name);
            let optional = cm.optional.unwrap_or(false);
            let found = wait_for(deadline, opts.poll_interval, &what, optional, move || {
                source.config_map(namespace, name)
            })
            .await?;
            collected.config_maps.extend(found);
        } else if let Some(secret) = &volume.secret {
            let name = secret.secret_name.as_deref().unwrap_or_default();
            let what = format!("secret {}", name);
            let optional = secret.optional.unwrap_or(false);
            let found = wait_for(deadline, opts.poll_interval, &what, optional, move || {
                source.secret(namespace, name)
            })
            .await?;
            collected.secrets.extend(found);
        } else if let Some(projected) = &volume.projected {
            if !opts.projected_volumes {
                debug!(volume = %volume.name, "Projected volumes are disabled");
                continue;
            }
            let name = volume.name.as_str();
            let what = format!("projected volume {}", name);
            let found = wait_for(deadline, opts.poll_interval, &what, false, move || {
                projected_map(source, pod, name, projected, opts)
            })
            .await?;
            collected.projected_volume_maps.extend(found);
        } else if volume.empty_dir.is_some() {
            debug!(volume = %volume.name, "emptyDir needs nothing collected");
        } else {
            warn!(volume = %volume.name, "Unsupported volume type, ignoring");
        }
    }
    Ok(collected)
}

async fn wait_for<T, F, Fut>(
    deadline: Instant,
    poll: Duration,
    what: &str,
    optional: bool,
    mut fetch: F,
) -> Result<Option<T>, CollectError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<Option<T>>>,
{
    loop {
        match fetch().await {
            Ok(Some(found)) => return Ok(Some(found)),
            Ok(None) if optional => {
                debug!(what, "Optional object does not exist");
                return Ok(None);
            }
            Ok(None) => debug!(what, "Referenced object does not exist yet"),
            Err(e) => warn!(error = %e, what, "Unable to fetch referenced object"),
        }
        if Instant::now() + poll > deadline {
            return Err(CollectError::Timeout(what.to_string()));
        }
        tokio::time::sleep(poll).await;
    }
}

// `None` means a referenced object is missing and the whole volume must wait.
async fn projected_map(
    source: &dyn ObjectSource,
    pod: &Pod,
    volume_name: &str,
    projected: &ProjectedVolumeSource,
    opts: &CollectOptions,
) -> anyhow::Result<Option<ConfigMap>> {
    let namespace = pod.namespace();
    let mut data = BTreeMap::new();

    for projection in projected.sources.iter().flatten() {
        if let Some(token) = &projection.service_account_token {
            let value = source
                .service_account_token(pod, token.audience.as_deref())
                .await?;
            data.insert(token.path.clone(), value);
        }

        if let Some(cm) = &projection.config_map {
            let name = cm.name.as_deref().unwrap_or_default();
            match (&opts.kube_root_ca, name) {
                (Some(ca), KUBE_ROOT_CA) => {
                    let items = cm.items.iter().flatten();
                    let paths: Vec<&str> = items.map(|i| i.path.as_str()).collect();
                    if paths.is_empty() {
                        data.insert("ca.crt".to_string(), ca.clone());
                    }
                    for path in paths {
                        data.insert(path.to_string(), ca.clone());
                    }
                }
                _ => match source.config_map(namespace, name).await? {
                    Some(found) => {
                        project(&mut data, cm.items.as_deref(), found.data.unwrap_or_default())
                    }
                    None if cm.optional.unwrap_or(false) => {}
                    None => return Ok(None),
                },
            }
        }

        if let Some(secret) = &projection.secret {
            let name = secret.name.as_deref().unwrap_or_default();
            match source.secret(namespace, name).await? {
                Some(found) => {
                    let decoded = found
                        .data
                        .unwrap_or_default()
                        .into_iter()
                        .map(|(k, v)| (k, String::from_utf8_lossy(&v.0).into_owned()))
                        .collect();
                    project(&mut data, secret.items.as_deref(), decoded)
                }
                None if secret.optional.unwrap_or(false) => {}
                None => return Ok(None),
            }
        }

        if let Some(downward) = &projection.downward_api {
            for item in downward.items.iter().flatten() {
                let field = item.field_ref.as_ref().map(|f| f.field_path.as_str());
                let value = match field {
                    Some("metadata.name") => pod.name(),
                    Some("metadata.namespace") => pod.namespace(),
                    Some("metadata.uid") => pod.uid(),
                    other => {
                        warn!(
                            field = ?other,
                            path = %item.path,
                            "Unsupported downward API field, skipping"
                        );
                        continue;
                    }
                };
                data.insert(item.path.clone(), value.to_string());
            }
        }
    }

    Ok(Some(ConfigMap {
        metadata: ObjectMeta {
            name: Some(volume_name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    }))
}

// With no items every key is projected under its own name.
fn project(
    data: &mut BTreeMap<String, String>,
    items: Option<&[KeyToPath]>,
    mut values: BTreeMap<String, String>,
) {
    match items {
        Some(items) => {
            for item in items {
                match values.remove(&item.key) {
                    Some(value) => {
                        data.insert(item.path.clone(), value);
                    }
                    None => warn!(key = %item.key, "Projected key does not exist"),
                }
            }
        }
        None => data.append(&mut values),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use k8s_openapi::api::core::v1::{
        ConfigMapProjection, ConfigMapVolumeSource, DownwardAPIProjection, DownwardAPIVolumeFile,
        ObjectFieldSelector, Pod as KubePod, PodSpec, ServiceAccountTokenProjection, Volume,
        VolumeProjection,
    };
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeSource {
        config_maps: HashMap<String, ConfigMap>,
        // Lookups that fail before the config maps appear.
        misses: usize,
        lookups: AtomicUsize,
    }

    impl FakeSource {
        fn with_config_map(name: &str, entries: &[(&str, &str)]) -> Self {
            let mut source = FakeSource::default();
            source.config_maps.insert(
                name.to_string(),
                ConfigMap {
                    metadata: ObjectMeta {
                        name: Some(name.to_string()),
                        ..Default::default()
                    },
                    data: Some(
                        entries
                            .iter()
                            .map(|(k, v)| (k.to_string(), v.to_string()))
                            .collect(),
                    ),
                    ..Default::default()
                },
            );
            source
        }
    }

    #[async_trait]
    impl ObjectSource for FakeSource {
        async fn config_map(
            &self,
            _namespace: &str,
            name: &str,
        ) -> anyhow::Result<Option<ConfigMap>> {
            if self.lookups.fetch_add(1, Ordering::SeqCst) < self.misses {
                return Ok(None);
            }
            Ok(self.config_maps.get(name).cloned())
        }

        async fn secret(&self, _namespace: &str, _name: &str) -> anyhow::Result<Option<Secret>> {
            Ok(None)
        }

        async fn service_account_token(
            &self,
            pod: &Pod,
            _audience: Option<&str>,
        ) -> anyhow::Result<String> {
            Ok(format!("token-for-{}", pod.uid()))
        }
    }

    fn pod(volumes: Vec<Volume>) -> Pod {
        Pod::from(KubePod {
            metadata: ObjectMeta {
                name: Some("p1".to_string()),
                namespace: Some("ns".to_string()),
                uid: Some("u1".to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                volumes: Some(volumes),
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    fn config_map_volume(name: &str, optional: bool) -> Volume {
        Volume {
            name: "vol".to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: Some(name.to_string()),
                optional: Some(optional),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn opts() -> CollectOptions {
        CollectOptions {
            projected_volumes: true,
            kube_root_ca: None,
            poll_interval: Duration::from_millis(10),
            timeout: Duration::from_millis(100),
        }
    }

    #[tokio::test]
    async fn collects_config_maps_that_appear_late() {
        let mut source = FakeSource::with_config_map("settings", &[("a", "1")]);
        source.misses = 2;
        let collected = collect(&source, &pod(vec![config_map_volume("settings", false)]), &opts())
            .await
            .unwrap();
        assert_eq!(collected.config_maps.len(), 1);
        assert_eq!(source.lookups.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn missing_config_maps_time_out() {
        let source = FakeSource::default();
        let err = collect(&source, &pod(vec![config_map_volume("absent", false)]), &opts())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "timed out waiting for config map absent");
    }

    #[tokio::test]
    async fn missing_optional_config_maps_are_skipped() {
        let source = FakeSource::default();
        let collected = collect(&source, &pod(vec![config_map_volume("absent", true)]), &opts())
            .await
            .unwrap();
        assert!(collected.config_maps.is_empty());
        assert_eq!(source.lookups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn builds_projected_volumes() {
        let source = FakeSource::with_config_map("app", &[("x", "1"), ("y", "2")]);
        let projected = Volume {
            name: "kube-api-access".to_string(),
            projected: Some(ProjectedVolumeSource {
                sources: Some(vec![
                    VolumeProjection {
                        service_account_token: Some(ServiceAccountTokenProjection {
                            path: "token".to_string(),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                    VolumeProjection {
                        config_map: Some(ConfigMapProjection {
                            name: Some(KUBE_ROOT_CA.to_string()),
                            items: Some(vec![KeyToPath {
                                key: "ca.crt".to_string(),
                                path: "ca.crt".to_string(),
                                ..Default::default()
                            }]),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                    VolumeProjection {
                        config_map: Some(ConfigMapProjection {
                            name: Some("app".to_string()),
                            items: Some(vec![KeyToPath {
                                key: "y".to_string(),
                                path: "conf/y".to_string(),
                                ..Default::default()
                            }]),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                    VolumeProjection {
                        downward_api: Some(DownwardAPIProjection {
                            items: Some(vec![
                                DownwardAPIVolumeFile {
                                    path: "namespace".to_string(),
                                    field_ref: Some(ObjectFieldSelector {
                                        field_path: "metadata.namespace".to_string(),
                                        ..Default::default()
                                    }),
                                    ..Default::default()
                                },
                                DownwardAPIVolumeFile {
                                    path: "labels".to_string(),
                                    field_ref: Some(ObjectFieldSelector {
                                        field_path: "metadata.labels".to_string(),
                                        ..Default::default()
                                    }),
                                    ..Default::default()
                                },
                            ]),
                        }),
                        ..Default::default()
                    },
                ]),
                ..Default::default()
            }),
            ..Default::default()
        };
        let mut opts = opts();
        opts.kube_root_ca = Some("CA".to_string());

        let collected = collect(&source, &pod(vec![projected]), &opts).await.unwrap();
        let map = &collected.projected_volume_maps[0];
        assert_eq!(map.metadata.name.as_deref(), Some("kube-api-access"));
        let data = map.data.as_ref().unwrap();
        assert_eq!(data["token"], "token-for-u1");
        assert_eq!(data["ca.crt"], "CA");
        assert_eq!(data["conf/y"], "2");
        assert_eq!(data["namespace"], "ns");
        assert!(!data.contains_key("labels"));
        assert!(!data.contains_key("x"));
    }

    #[tokio::test]
    async fn disabled_projected_volumes_are_skipped() {
        let source = FakeSource::default();
        let projected = Volume {
            name: "kube-api-access".to_string(),
            projected: Some(ProjectedVolumeSource::default()),
            ..Default::default()
        };
        let mut opts = opts();
        opts.projected_volumes = false;
        let collected = collect(&source, &pod(vec![projected]), &opts).await.unwrap();
        assert!(collected.projected_volume_maps.is_empty());
    }
}
