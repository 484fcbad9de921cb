use std::sync::Arc;

use relay_provider::config::Config as ProviderConfig;
use relay_provider::resources::KubeObjectSource;
use relay_provider::RelayProvider;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use virtual_kubelet::config::Config;
use virtual_kubelet::Kubelet;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::new_from_flags(env!("CARGO_PKG_VERSION"))?;
    let provider_config = ProviderConfig::from_env()?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(provider_config.log_level()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    // Read the environment. Note that this tries a KubeConfig file first, then
    // falls back on an in-cluster configuration.
    let kubeconfig = kube::Config::infer().await?;
    let client = kube::Client::try_from(kubeconfig.clone())?;

    // The provider is responsible for all the "back end" logic. Here that
    // means forwarding pods to the relay.
    let provider = RelayProvider::new(provider_config, Arc::new(KubeObjectSource::new(client)))?;
    let kubelet = Kubelet::new(provider, kubeconfig, config).await?;
    kubelet.start(CancellationToken::new()).await
}
