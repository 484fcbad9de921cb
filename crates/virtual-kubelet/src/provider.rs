//! Traits and types needed to create backend providers for a virtual kubelet
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node as KubeNode, PodStatus as KubePodStatus};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::log::Sender;
use crate::node::Builder;
use crate::pod::Pod;

/// A back-end for a virtual kubelet.
///
/// The primary responsibility of a Provider is to run a workload somewhere
/// else (or schedule it on an external executor) and then monitor it,
/// reporting what it sees back through the notifiers it is handed.
///
/// Every method is called from the kubelet's control loop, so `create_pod`,
/// `update_pod` and `delete_pod` must return quickly and push long running
/// work onto tasks of their own.
///
/// **Note**: this trait is defined using [async-trait](https://crates.io/crates/async-trait).
///
/// # Example
/// ```rust
/// use async_trait::async_trait;
/// use k8s_openapi::api::core::v1::{Node as KubeNode, PodStatus as KubePodStatus};
/// use tokio_util::sync::CancellationToken;
/// use virtual_kubelet::pod::Pod;
/// use virtual_kubelet::provider::{NodeNotifier, PodNotifier, Provider};
///
/// struct MyProvider;
///
/// #[async_trait]
/// impl Provider for MyProvider {
///     async fn create_pod(&self, pod: Pod) -> anyhow::Result<()> {
///         todo!("Implement Provider::create_pod")
///     }
///
///     // Implement the rest of the methods ...
///     # async fn update_pod(&self, pod: Pod) -> anyhow::Result<()> { todo!() }
///     # async fn delete_pod(&self, pod: Pod) -> anyhow::Result<()> { todo!() }
///     # async fn get_pod(&self, namespace: &str, name: &str) -> anyhow::Result<Pod> { todo!() }
///     # async fn get_pod_status(&self, namespace: &str, name: &str) -> anyhow::Result<KubePodStatus> { todo!() }
///     # async fn get_pods(&self) -> anyhow::Result<Vec<Pod>> { todo!() }
///     # async fn logs(&self, namespace: String, pod: String, container: String, sender: virtual_kubelet::log::Sender) -> anyhow::Result<()> { todo!() }
///     # fn notify_pods(&self, notifier: PodNotifier, shutdown: CancellationToken) {}
///     # fn notify_node_status(&self, node: KubeNode, notifier: NodeNotifier, shutdown: CancellationToken) {}
/// }
/// ```
#[async_trait]
pub trait Provider: Send + Sync + 'static {
    /// Allows provider to populate node information.
    async fn node(&self, _builder: &mut Builder) -> anyhow::Result<()> {
        Ok(())
    }

    /// Given a Pod definition, start the workload.
    async fn create_pod(&self, pod: Pod) -> anyhow::Result<()>;

    /// Given an updated Pod definition, update the given workload.
    async fn update_pod(&self, pod: Pod) -> anyhow::Result<()>;

    /// Given the definition of a deleted Pod, remove the workload.
    ///
    /// Returns [`ProviderError::PodNotFound`] for pods the provider does not
    /// know about.
    async fn delete_pod(&self, pod: Pod) -> anyhow::Result<()>;

    /// Look a pod up by namespace and name.
    async fn get_pod(&self, namespace: &str, name: &str) -> anyhow::Result<Pod>;

    /// The last known status of a pod.
    async fn get_pod_status(&self, namespace: &str, name: &str) -> anyhow::Result<KubePodStatus>;

    /// Every pod the provider currently tracks.
    async fn get_pods(&self) -> anyhow::Result<Vec<Pod>>;

    /// Adopt pods that were already bound to this node when the kubelet
    /// started. They are not created again.
    async fn restore_pods(&self, _pods: Vec<Pod>) -> anyhow::Result<()> {
        Ok(())
    }

    /// Given a Pod, get back the logs for the associated workload.
    async fn logs(
        &self,
        namespace: String,
        pod: String,
        container: String,
        sender: Sender,
    ) -> anyhow::Result<()>;

    /// Execute a given command on a workload and then return the result.
    ///
    /// The default implementation of this returns a message that this feature is
    /// not available. Override this only when there is an implementation.
    async fn exec(&self, _pod: Pod, _command: String) -> anyhow::Result<Vec<String>> {
        Err(NotImplementedError.into())
    }

    /// Start reporting pod status changes through `notifier` until `shutdown`
    /// is cancelled.
    fn notify_pods(&self, notifier: PodNotifier, shutdown: CancellationToken);

    /// Start reporting the state of `node` through `notifier` until
    /// `shutdown` is cancelled.
    fn notify_node_status(
        &self,
        node: KubeNode,
        notifier: NodeNotifier,
        shutdown: CancellationToken,
    );
}

/// Hands pods whose status changed back to the kubelet.
#[derive(Clone)]
pub struct PodNotifier(Arc<dyn Fn(Pod) + Send + Sync>);

impl PodNotifier {
    /// Wrap a callback.
    pub fn new<F: Fn(Pod) + Send + Sync + 'static>(f: F) -> Self {
        PodNotifier(Arc::new(f))
    }

    /// A notifier that feeds a channel, and the receiving end of that channel.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Pod>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let notifier = PodNotifier::new(move |pod| {
            // The receiver only goes away on shutdown.
            let _ = tx.send(pod);
        });
        (notifier, rx)
    }

    /// Report `pod`.
    pub fn notify(&self, pod: Pod) {
        (self.0)(pod)
    }
}

impl std::fmt::Debug for PodNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PodNotifier")
    }
}

/// Hands node updates back to the kubelet.
#[derive(Clone)]
pub struct NodeNotifier(Arc<dyn Fn(KubeNode) + Send + Sync>);

impl NodeNotifier {
    /// Wrap a callback.
    pub fn new<F: Fn(KubeNode) + Send + Sync + 'static>(f: F) -> Self {
        NodeNotifier(Arc::new(f))
    }

    /// A notifier that feeds a channel, and the receiving end of that channel.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<KubeNode>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let notifier = NodeNotifier::new(move |node| {
            let _ = tx.send(node);
        });
        (notifier, rx)
    }

    /// Report `node`.
    pub fn notify(&self, node: KubeNode) {
        (self.0)(node)
    }
}

impl std::fmt::Debug for NodeNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("NodeNotifier")
    }
}

/// A Provider error
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Pod was not found
    #[error("cannot find pod {}", pod_name)]
    PodNotFound {
        /// The pod's name
        pod_name: String,
    },
    /// Container was not found
    #[error("cannot find container {} in pod {}", container_name, pod_name)]
    ContainerNotFound {
        /// The container's pod's name
        pod_name: String,
        /// The container's name
        container_name: String,
    },
}

impl ProviderError {
    /// Whether `error` is a [`ProviderError::PodNotFound`].
    pub fn is_pod_not_found(error: &anyhow::Error) -> bool {
        matches!(
            error.downcast_ref::<ProviderError>(),
            Some(ProviderError::PodNotFound { .. })
        )
    }
}

/// A specific operation is not implemented
#[derive(Error, Debug)]
#[error("Operation not supported")]
pub struct NotImplementedError;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn recognises_missing_pods_through_anyhow() {
        let err: anyhow::Error = ProviderError::PodNotFound {
            pod_name: "p1".to_string(),
        }
        .into();
        assert!(ProviderError::is_pod_not_found(&err));
        assert!(!ProviderError::is_pod_not_found(&anyhow::anyhow!("boom")));
    }

    #[tokio::test]
    async fn channel_notifiers_deliver_in_order() {
        let (notifier, mut rx) = PodNotifier::channel();
        let mut first = Pod::default();
        first.set_annotation("n", "1");
        let mut second = Pod::default();
        second.set_annotation("n", "2");
        notifier.notify(first);
        notifier.clone().notify(second);
        assert_eq!(rx.recv().await.unwrap().get_annotation("n"), Some("1"));
        assert_eq!(rx.recv().await.unwrap().get_annotation("n"), Some("2"));
    }
}
