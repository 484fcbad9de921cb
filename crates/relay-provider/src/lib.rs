//! A virtual kubelet provider that runs pods by handing them to a relay.
//!
//! The provider keeps a local table of the pods bound to its node. Creates
//! and deletes are answered from that table straight away and forwarded to
//! the relay on tasks of their own. A status loop folds what the relay
//! reports back into the table, and a health loop keeps the node's Ready
//! condition in line with whether the relay answers.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use relay_provider::config::Config;
//! use relay_provider::resources::KubeObjectSource;
//! use relay_provider::RelayProvider;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let kubeconfig = kube::Config::infer().await?;
//! let client = kube::Client::try_from(kubeconfig)?;
//! let objects = Arc::new(KubeObjectSource::new(client));
//! let provider = RelayProvider::new(Config::from_env()?, objects)?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node as KubeNode, PodStatus as KubePodStatus};
use relay_api::{ContainerLogOpts, CreateRequest, CreateResponse, LogRequest};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use virtual_kubelet::log::{Options, Sender};
use virtual_kubelet::node::Builder;
use virtual_kubelet::provider::{NodeNotifier, PodNotifier, Provider, ProviderError};
use virtual_kubelet::Pod;

pub mod client;
pub mod config;
mod loops;
pub mod resources;
pub mod status;

use client::RelayClient;
use config::Config;
use resources::{CollectError, CollectOptions, ObjectSource};

/// Annotation recording the backend's job id for a pod.
pub const JOB_ID_ANNOTATION: &str = "relaylet.io/job-id";
/// Annotation overriding the IP reported for a pod.
pub const POD_IP_ANNOTATION: &str = "relaylet.io/pod-ip";
/// Reason given to pods whose referenced objects never appeared.
pub const MISSING_OBJECTS_REASON: &str = "ConfigMaps/Secrets not found";

#[derive(Clone, Debug)]
struct TrackedPod {
    pod: Pod,
    // Set once the relay accepted the create. Only created pods are polled.
    created: bool,
}

/// Runs pods on a relay. Cheap to clone.
#[derive(Clone)]
pub struct RelayProvider {
    shared: Arc<Shared>,
}

struct Shared {
    config: Config,
    client: RelayClient,
    objects: Arc<dyn ObjectSource>,
    collect: CollectOptions,
    // Keyed by `namespace:name`.
    pods: RwLock<HashMap<String, TrackedPod>>,
    notifier: Mutex<Option<PodNotifier>>,
}

impl RelayProvider {
    /// A provider talking to the relay in `config`, reading referenced
    /// objects from `objects`.
    pub fn new(config: Config, objects: Arc<dyn ObjectSource>) -> anyhow::Result<Self> {
        let client = RelayClient::new(&config)?;
        let collect = CollectOptions::from(&config);
        Ok(RelayProvider {
            shared: Arc::new(Shared {
                config,
                client,
                objects,
                collect,
                pods: RwLock::new(HashMap::new()),
                notifier: Mutex::new(None),
            }),
        })
    }

    fn client(&self) -> &RelayClient {
        &self.shared.client
    }

    fn pod_ip<'a>(&'a self, pod: &'a Pod) -> &'a str {
        pod.get_annotation(POD_IP_ANNOTATION)
            .unwrap_or(&self.shared.config.pod_ip)
    }

    fn notify(&self, pod: Pod) {
        let notifier = match self.shared.notifier.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        match notifier {
            Some(notifier) => notifier.notify(pod),
            None => debug!(pod = %pod.key(), "No pod notifier registered yet"),
        }
    }

    /// Run the remote half of a create: collect referenced objects, then
    /// hand the pod to the relay.
    ///
    /// The pod may be deleted at any point while this runs. Results are only
    /// written back if the same pod is still tracked.
    #[instrument(level = "info", skip(self, pod), fields(pod = %pod.key(), uid = %pod.uid()))]
    async fn remote_create(&self, pod: Pod) {
        let objects = self.shared.objects.as_ref();
        let collected = match resources::collect(objects, &pod, &self.shared.collect).await {
            Ok(collected) => collected,
            Err(CollectError::Timeout(what)) => {
                warn!(%what, "Referenced objects never appeared");
                let message = format!("timed out waiting for {}", what);
                self.fail_if_tracked(&pod, MISSING_OBJECTS_REASON, &message).await;
                return;
            }
        };

        if !self.is_tracked(&pod).await {
            info!("Pod was deleted before creation, abandoning");
            return;
        }

        let request = CreateRequest {
            pod: pod.as_kube_pod().clone(),
            config_maps: collected.config_maps,
            secrets: collected.secrets,
            projected_volume_maps: collected.projected_volume_maps,
        };
        match self.client().create(&request).await {
            Ok(body) => {
                let job_id = match serde_json::from_slice::<CreateResponse>(&body) {
                    Ok(response)
                        if response.pod_uid == pod.uid() && !response.pod_jid.is_empty() =>
                    {
                        Some(response.pod_jid)
                    }
                    Ok(_) => None,
                    Err(e) => {
                        debug!(error = %e, "Create response carried no job id");
                        None
                    }
                };
                self.mark_created(&pod, job_id).await;
            }
            Err(e) => {
                error!(error = %e, "Relay create failed");
                self.fail_if_tracked(&pod, "ProviderCreateFailed", &e.to_string())
                    .await;
            }
        }
    }

    async fn is_tracked(&self, pod: &Pod) -> bool {
        let pods = self.shared.pods.read().await;
        matches!(pods.get(&pod.key()), Some(t) if t.pod.uid() == pod.uid())
    }

    async fn mark_created(&self, pod: &Pod, job_id: Option<String>) {
        let updated = {
            let mut pods = self.shared.pods.write().await;
            match pods.get_mut(&pod.key()) {
                Some(tracked) if tracked.pod.uid() == pod.uid() => {
                    tracked.created = true;
                    job_id.map(|jid| {
                        tracked.pod.set_annotation(JOB_ID_ANNOTATION, &jid);
                        tracked.pod.clone()
                    })
                }
                _ => {
                    info!("Pod was deleted while the relay created it");
                    None
                }
            }
        };
        if let Some(pod) = updated {
            self.notify(pod);
        }
    }

    // The tracked check and the write happen under one lock, so a delete
    // racing the create either removes the pod first or sees the failure.
    async fn fail_if_tracked(&self, pod: &Pod, reason: &str, message: &str) {
        let failed = {
            let mut pods = self.shared.pods.write().await;
            match pods.get_mut(&pod.key()) {
                Some(tracked) if tracked.pod.uid() == pod.uid() => {
                    let mut status = tracked.pod.status().cloned().unwrap_or_default();
                    status::fail(&mut status, reason, message);
                    tracked.pod.set_status(status);
                    Some(tracked.pod.clone())
                }
                _ => None,
            }
        };
        match failed {
            Some(pod) => self.notify(pod),
            None => info!(
                reason,
                "Pod was deleted before creation completed, not marking it failed"
            ),
        }
    }

    async fn remote_delete(&self, pod: Pod) {
        match self.client().delete(pod.as_kube_pod()).await {
            Ok(deleted) => debug!(pod = %pod.key(), count = deleted.len(), "Relay deleted pod"),
            Err(e) => error!(error = %e, pod = %pod.key(), "Relay delete failed"),
        }
    }

    /// Ask the relay for the status of every created pod and fold the
    /// answers into the local table. Changed pods are pushed.
    ///
    /// Statuses for pods this node no longer tracks make the relay drop them
    /// from its cache.
    pub async fn reconcile(&self) -> anyhow::Result<()> {
        let pods: Vec<_> = {
            let table = self.shared.pods.read().await;
            table
                .values()
                .filter(|t| t.created)
                .map(|t| t.pod.as_kube_pod().clone())
                .collect()
        };
        if pods.is_empty() {
            return Ok(());
        }

        let statuses = self.client().status(&pods).await?;
        let mut changed = Vec::new();
        let mut untracked = Vec::new();
        {
            let mut table = self.shared.pods.write().await;
            for remote in statuses {
                match table.values_mut().find(|t| t.pod.uid() == remote.pod_uid) {
                    Some(tracked) => {
                        let mut status = tracked.pod.status().cloned().unwrap_or_default();
                        if status::apply_remote_status(&mut status, &remote) {
                            tracked.pod.set_status(status);
                            changed.push(tracked.pod.clone());
                        }
                    }
                    None => untracked.push(remote.pod_uid),
                }
            }
        }

        for pod in changed {
            debug!(pod = %pod.key(), phase = ?pod.phase(), "Pod status changed");
            self.notify(pod);
        }
        for uid in untracked {
            info!(%uid, "Relay reported a pod this node does not track");
            if let Err(e) = self.client().update_cache(&uid).await {
                warn!(error = %e, %uid, "Unable to evict untracked pod from the relay");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Provider for RelayProvider {
    async fn node(&self, builder: &mut Builder) -> anyhow::Result<()> {
        let resources = &self.shared.config.resources;
        for (key, value) in [
            ("cpu", &resources.cpu),
            ("memory", &resources.memory),
            ("pods", &resources.pods),
        ] {
            builder.add_capacity(key, value);
            builder.add_allocatable(key, value);
        }
        Ok(())
    }

    #[instrument(level = "info", skip(self, pod), fields(pod = %pod.key()))]
    async fn create_pod(&self, pod: Pod) -> anyhow::Result<()> {
        let mut pod = pod;
        let status = status::initial_status(&pod, self.pod_ip(&pod));
        pod.set_status(status);
        {
            let mut pods = self.shared.pods.write().await;
            pods.insert(
                pod.key(),
                TrackedPod {
                    pod: pod.clone(),
                    created: false,
                },
            );
        }
        info!(phase = ?pod.phase(), "Accepted pod");
        self.notify(pod.clone());

        let provider = self.clone();
        tokio::spawn(async move { provider.remote_create(pod).await });
        Ok(())
    }

    async fn update_pod(&self, pod: Pod) -> anyhow::Result<()> {
        let mut pods = self.shared.pods.write().await;
        match pods.get_mut(&pod.key()) {
            Some(tracked) if tracked.pod.uid() == pod.uid() => {
                // Only metadata may change on a running pod. Our status and
                // annotations win over what the API server has.
                let mut updated = pod;
                for (key, value) in tracked.pod.annotations() {
                    if key.starts_with("relaylet.io/") {
                        updated.set_annotation(key, value);
                    }
                }
                if let Some(status) = tracked.pod.status() {
                    updated.set_status(status.clone());
                }
                tracked.pod = updated;
                Ok(())
            }
            _ => Err(ProviderError::PodNotFound {
                pod_name: pod.name().to_string(),
            }
            .into()),
        }
    }

    #[instrument(level = "info", skip(self, pod), fields(pod = %pod.key(), uid = %pod.uid()))]
    async fn delete_pod(&self, pod: Pod) -> anyhow::Result<()> {
        let removed = {
            let mut pods = self.shared.pods.write().await;
            match pods.get(&pod.key()) {
                Some(tracked) if tracked.pod.uid() == pod.uid() => pods.remove(&pod.key()),
                _ => None,
            }
        };
        let mut local = match removed {
            Some(tracked) => tracked.pod,
            None => {
                return Err(ProviderError::PodNotFound {
                    pod_name: pod.name().to_string(),
                }
                .into())
            }
        };

        let mut status = local.status().cloned().unwrap_or_default();
        status::terminate_all(&mut status);
        local.set_status(status);
        info!("Deleted pod");
        self.notify(local.clone());

        let provider = self.clone();
        tokio::spawn(async move { provider.remote_delete(local).await });
        Ok(())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> anyhow::Result<Pod> {
        let pods = self.shared.pods.read().await;
        pods.get(&virtual_kubelet::pod::pod_key(namespace, name))
            .map(|t| t.pod.clone())
            .ok_or_else(|| {
                ProviderError::PodNotFound {
                    pod_name: name.to_string(),
                }
                .into()
            })
    }

    async fn get_pod_status(&self, namespace: &str, name: &str) -> anyhow::Result<KubePodStatus> {
        let pod = self.get_pod(namespace, name).await?;
        Ok(pod.status().cloned().unwrap_or_default())
    }

    async fn get_pods(&self) -> anyhow::Result<Vec<Pod>> {
        let pods = self.shared.pods.read().await;
        Ok(pods.values().map(|t| t.pod.clone()).collect())
    }

    async fn restore_pods(&self, pods: Vec<Pod>) -> anyhow::Result<()> {
        let mut table = self.shared.pods.write().await;
        for mut pod in pods {
            if pod.status().and_then(|s| s.phase.as_ref()).is_none() {
                let status = status::initial_status(&pod, self.pod_ip(&pod));
                pod.set_status(status);
            }
            debug!(pod = %pod.key(), "Restored pod");
            table.insert(pod.key(), TrackedPod { pod, created: true });
        }
        Ok(())
    }

    async fn logs(
        &self,
        namespace: String,
        pod_name: String,
        container_name: String,
        sender: Sender,
    ) -> anyhow::Result<()> {
        let pod = self.get_pod(&namespace, &pod_name).await?;
        let known = pod
            .containers()
            .iter()
            .chain(pod.init_containers())
            .any(|c| c.name == container_name);
        if !known {
            return Err(ProviderError::ContainerNotFound {
                pod_name,
                container_name,
            }
            .into());
        }

        let request = LogRequest {
            namespace,
            pod_uid: pod.uid().to_string(),
            pod_name,
            container_name,
            opts: log_opts(sender.options()),
        };
        request.validate()?;
        let chunks = self.client().logs(&request).await?;
        tokio::spawn(async move {
            if let Err(e) = virtual_kubelet::log::stream(chunks, sender).await {
                warn!(error = %e, "Log stream ended abnormally");
            }
        });
        Ok(())
    }

    fn notify_pods(&self, notifier: PodNotifier, shutdown: CancellationToken) {
        match self.shared.notifier.lock() {
            Ok(mut guard) => *guard = Some(notifier),
            Err(poisoned) => *poisoned.into_inner() = Some(notifier),
        }
        let interval = self.shared.config.status_interval();
        tokio::spawn(loops::status_loop(self.clone(), interval, shutdown));
    }

    fn notify_node_status(
        &self,
        node: KubeNode,
        notifier: NodeNotifier,
        shutdown: CancellationToken,
    ) {
        let interval = self.shared.config.health_interval();
        tokio::spawn(loops::health_loop(self.clone(), node, notifier, interval, shutdown));
    }
}

fn log_opts(opts: &Options) -> ContainerLogOpts {
    ContainerLogOpts {
        tail: opts.tail.unwrap_or_default(),
        limit_bytes: opts.limit_bytes.unwrap_or_default(),
        timestamps: opts.timestamps,
        follow: opts.follow,
        previous: opts.previous,
        since_seconds: opts.since_seconds.unwrap_or_default(),
        since_time: opts.since_time,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn log_options_map_unset_values_to_zero() {
        let opts = log_opts(&Options {
            tail: Some(10),
            follow: true,
            ..Default::default()
        });
        assert_eq!(opts.tail, 10);
        assert_eq!(opts.limit_bytes, 0);
        assert!(opts.follow);
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn conflicting_log_options_are_rejected() {
        let opts = log_opts(&Options {
            tail: Some(10),
            limit_bytes: Some(100),
            ..Default::default()
        });
        assert!(opts.validate().is_err());
    }
}
