//! Runs a virtual kubelet with a specific handler (called a `Provider`).
use std::collections::HashSet;
use std::convert::TryFrom;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{Node as KubeNode, Pod as KubePod};
use kube::api::{Api, DeleteParams, ListParams};
use kube_runtime::watcher;
use tokio::signal::ctrl_c;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::node;
use crate::pod::{self, Pod};
use crate::provider::{NodeNotifier, PodNotifier, Provider, ProviderError};
use crate::webserver::start as start_webserver;

/// A virtual kubelet backed by a given `Provider`.
///
/// The kubelet registers its node, watches the pods bound to it and hands
/// them to the provider. It serves the kubelet API for logs, and writes back
/// the pod and node status the provider reports through its notifiers.
///
/// The Provider supplies all of the backend-specific logic. Only one instance
/// of a Provider runs per kubelet.
pub struct Kubelet<P> {
    provider: Arc<P>,
    kube_config: kube::Config,
    config: Box<Config>,
}

impl<P: Provider> Kubelet<P> {
    /// Create a new Kubelet with a provider, a kubernetes configuration,
    /// and a kubelet configuration
    pub async fn new(
        provider: P,
        kube_config: kube::Config,
        config: Config,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            provider: Arc::new(provider),
            kube_config,
            config: Box::new(config),
        })
    }

    /// Begin answering requests for the Kubelet.
    ///
    /// Runs until SIGINT, or until `shutdown` is cancelled, or until one of
    /// the kubelet's own tasks fails.
    pub async fn start(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let client = kube::Client::try_from(self.kube_config.clone())?;

        let node = node::register(&client, &self.config, self.provider.as_ref()).await?;

        let pods = list_node_pods(&client, &self.config.node_name).await?;
        info!(count = pods.len(), "Restoring pods already bound to this node");
        self.provider.restore_pods(pods).await?;

        let (pod_notifier, pod_updates) = PodNotifier::channel();
        let (node_notifier, node_updates) = NodeNotifier::channel();
        self.provider.notify_pods(pod_notifier, shutdown.clone());
        self.provider
            .notify_node_status(node, node_notifier, shutdown.clone());

        let webserver = start_webserver(
            self.provider.clone(),
            &self.config.server_config,
            shutdown.clone(),
        );
        let pod_patcher = patch_pods(client.clone(), pod_updates, shutdown.clone());
        let node_patcher = patch_node(client.clone(), node_updates, shutdown.clone());
        let watcher = watch_pods(
            client.clone(),
            self.config.node_name.clone(),
            self.provider.clone(),
            shutdown.clone(),
        );

        let result = tokio::select! {
            res = ctrl_c() => {
                warn!("Caught keyboard interrupt.");
                res.map_err(anyhow::Error::from)
            }
            _ = shutdown.cancelled() => Ok(()),
            res = webserver => {
                error!(result = ?res, "Webserver task completed");
                res
            }
            res = watcher => {
                error!(result = ?res, "Pod watcher completed");
                res
            }
            _ = pod_patcher => Ok(()),
            _ = node_patcher => Ok(()),
        };
        shutdown.cancel();
        result
    }
}

// We cannot `#[derive(Clone)]` because that would place the
// unnecessary `P: Clone` constraint.
impl<P> Clone for Kubelet<P> {
    fn clone(&self) -> Self {
        Self {
            provider: self.provider.clone(),
            kube_config: self.kube_config.clone(),
            config: self.config.clone(),
        }
    }
}

fn node_params(node_name: &str) -> ListParams {
    ListParams::default().fields(&format!("spec.nodeName={}", node_name))
}

async fn list_node_pods(client: &kube::Client, node_name: &str) -> anyhow::Result<Vec<Pod>> {
    let api: Api<KubePod> = Api::all(client.clone());
    let pods = api.list(&node_params(node_name)).await?;
    Ok(pods
        .items
        .into_iter()
        .map(Pod::from)
        .filter(|p| p.deletion_timestamp().is_none())
        .collect())
}

/// Writes every pod status the provider reports back to the API server.
async fn patch_pods(
    client: kube::Client,
    mut updates: UnboundedReceiver<Pod>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            update = updates.recv() => match update {
                Some(pod) => {
                    if let Err(e) = pod::patch_status(&client, &pod).await {
                        error!(error = %e, pod = %pod.key(), "Failed to patch pod status");
                    }
                }
                None => break,
            }
        }
    }
}

/// Writes every node update the provider reports back to the API server.
async fn patch_node(
    client: kube::Client,
    mut updates: UnboundedReceiver<KubeNode>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            update = updates.recv() => match update {
                Some(node) => {
                    if let Err(e) = node::patch_status(&client, &node).await {
                        error!(error = %e, "Failed to patch node status");
                    }
                }
                None => break,
            }
        }
    }
}

async fn watch_pods<P: Provider>(
    client: kube::Client,
    node_name: String,
    provider: Arc<P>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let api: Api<KubePod> = Api::all(client.clone());
    let mut events = watcher(api, node_params(&node_name)).boxed();
    let mut dispatcher = Dispatcher::new(provider, client);
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            event = events.next() => event,
        };
        match event {
            Some(Ok(event)) => dispatcher.handle(event).await,
            Some(Err(e)) => {
                warn!(error = %e, "Pod watch failed, restarting");
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            }
            None => anyhow::bail!("pod watch ended"),
        }
    }
}

/// Turns cluster pod events into provider calls.
struct Dispatcher<P> {
    provider: Arc<P>,
    client: kube::Client,
    // UIDs already removed from the API server.
    removed: HashSet<String>,
}

impl<P: Provider> Dispatcher<P> {
    fn new(provider: Arc<P>, client: kube::Client) -> Self {
        Dispatcher {
            provider,
            client,
            removed: HashSet::new(),
        }
    }

    async fn handle(&mut self, event: watcher::Event<KubePod>) {
        match event {
            watcher::Event::Applied(pod) => self.apply(Pod::from(pod)).await,
            watcher::Event::Deleted(pod) => self.deleted(Pod::from(pod)).await,
            watcher::Event::Restarted(pods) => {
                for pod in pods {
                    self.apply(Pod::from(pod)).await;
                }
            }
        }
    }

    async fn apply(&mut self, pod: Pod) {
        if pod.deletion_timestamp().is_some() {
            return self.terminate(pod).await;
        }
        let result = match self.provider.get_pod(pod.namespace(), pod.name()).await {
            Ok(existing) if existing.uid() == pod.uid() => {
                self.provider.update_pod(pod.clone()).await
            }
            Ok(existing) => {
                info!(pod = %pod.key(), "Pod was recreated, replacing the old one");
                if let Err(e) = self.provider.delete_pod(existing).await {
                    warn!(error = %e, pod = %pod.key(), "Failed to delete replaced pod");
                }
                self.provider.create_pod(pod.clone()).await
            }
            Err(e) if ProviderError::is_pod_not_found(&e) => {
                self.provider.create_pod(pod.clone()).await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            error!(error = %e, pod = %pod.key(), "Provider failed to handle pod");
        }
    }

    async fn terminate(&mut self, pod: Pod) {
        if self.removed.contains(pod.uid()) {
            return;
        }
        match self.provider.delete_pod(pod.clone()).await {
            Ok(()) => debug!(pod = %pod.key(), "Provider deleted pod"),
            Err(e) if ProviderError::is_pod_not_found(&e) => {
                debug!(pod = %pod.key(), "Provider no longer tracks pod")
            }
            Err(e) => error!(error = %e, pod = %pod.key(), "Provider failed to delete pod"),
        }

        let api: Api<KubePod> = Api::namespaced(self.client.clone(), pod.namespace());
        let params = DeleteParams {
            grace_period_seconds: Some(0),
            ..Default::default()
        };
        match api.delete(pod.name(), &params).await {
            Ok(_) => {
                info!(pod = %pod.key(), "Pod removed from the API server");
                self.removed.insert(pod.uid().to_string());
            }
            Err(kube::Error::Api(e)) if e.code == 404 => {
                self.removed.insert(pod.uid().to_string());
            }
            Err(e) => warn!(error = %e, pod = %pod.key(), "Failed to remove pod"),
        }
    }

    async fn deleted(&mut self, pod: Pod) {
        self.removed.remove(pod.uid());
        match self.provider.get_pod(pod.namespace(), pod.name()).await {
            Ok(existing) if existing.uid() == pod.uid() => {
                if let Err(e) = self.provider.delete_pod(pod.clone()).await {
                    error!(error = %e, pod = %pod.key(), "Provider failed to delete pod");
                }
            }
            _ => debug!(pod = %pod.key(), "Deleted pod is not tracked"),
        }
    }
}
