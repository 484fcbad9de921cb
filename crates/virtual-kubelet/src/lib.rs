//! A crate for building [virtual kubelets](https://virtual-kubelet.io/): nodes
//! whose pods run somewhere other than the node itself.
//!
//! The crate provides the [`Provider`] trait for declaring a backend as well as
//! the [`Kubelet`] type which takes a [`Provider`], registers the node and
//! feeds it the pods scheduled there.
//!
//! # Example
//! ```rust,no_run
//! use k8s_openapi::api::core::v1::{Node as KubeNode, PodStatus as KubePodStatus};
//! use tokio_util::sync::CancellationToken;
//! use virtual_kubelet::provider::{NodeNotifier, PodNotifier};
//! use virtual_kubelet::{config::Config, Kubelet, Pod, Provider};
//!
//! struct MyProvider;
//!
//! #[async_trait::async_trait]
//! impl Provider for MyProvider {
//!     async fn create_pod(&self, pod: Pod) -> anyhow::Result<()> {
//!         todo!("Implement Provider::create_pod")
//!     }
//!
//!     // Implement the rest of the methods
//!     # async fn update_pod(&self, pod: Pod) -> anyhow::Result<()> { todo!() }
//!     # async fn delete_pod(&self, pod: Pod) -> anyhow::Result<()> { todo!() }
//!     # async fn get_pod(&self, namespace: &str, name: &str) -> anyhow::Result<Pod> { todo!() }
//!     # async fn get_pod_status(&self, namespace: &str, name: &str) -> anyhow::Result<KubePodStatus> { todo!() }
//!     # async fn get_pods(&self) -> anyhow::Result<Vec<Pod>> { todo!() }
//!     # async fn logs(&self, namespace: String, pod: String, container: String, sender: virtual_kubelet::log::Sender) -> anyhow::Result<()> { todo!() }
//!     # fn notify_pods(&self, notifier: PodNotifier, shutdown: CancellationToken) {}
//!     # fn notify_node_status(&self, node: KubeNode, notifier: NodeNotifier, shutdown: CancellationToken) {}
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let kubeconfig = kube::Config::infer().await?;
//!     let config = Config::default_config(&"0.0.0.0".parse()?)?;
//!     let kubelet = Kubelet::new(MyProvider, kubeconfig, config).await?;
//!     kubelet.start(CancellationToken::new()).await
//! }
//! ```

#![warn(missing_docs)]

pub mod config;
mod kubelet;
pub mod log;
pub mod node;
pub mod pod;
pub mod provider;
mod webserver;

pub use self::kubelet::Kubelet;

#[doc(inline)]
pub use pod::Pod;
#[doc(inline)]
pub use provider::Provider;
