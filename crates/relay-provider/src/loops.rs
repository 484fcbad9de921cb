//! The provider's background loops.
use std::time::Duration;

use k8s_openapi::api::core::v1::Node as KubeNode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use virtual_kubelet::node::{condition, set_condition};
use virtual_kubelet::provider::NodeNotifier;

use crate::client::ClientError;
use crate::RelayProvider;

/// Annotation carrying the body of the last successful relay ping.
pub const PING_RESPONSE_ANNOTATION: &str = "relaylet.io/ping-response";
/// Node condition carrying the outcome of the last relay ping.
pub const RELAY_CONNECTIVITY: &str = "RelayConnectivity";

/// Poll the relay for pod statuses every `interval` until `shutdown`.
pub(crate) async fn status_loop(
    provider: RelayProvider,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if let Err(e) = provider.reconcile().await {
            warn!(error = %e, "Status reconciliation failed, retrying on the next tick");
        }
    }
    debug!("Status loop stopped");
}

/// Ping the relay every `interval` and report the node's health through
/// `notifier` until `shutdown`.
pub(crate) async fn health_loop(
    provider: RelayProvider,
    mut node: KubeNode,
    notifier: NodeNotifier,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let outcome = provider.client().ping().await;
        apply_ping(&mut node, &outcome);
        notifier.notify(node.clone());
    }
    debug!("Health loop stopped");
}

/// Update `node`'s conditions and annotations from a ping outcome.
pub(crate) fn apply_ping(node: &mut KubeNode, outcome: &Result<(u16, String), ClientError>) {
    let (ready, response, message) = match outcome {
        Ok((code, body)) if (200..300).contains(code) => (
            true,
            body.clone(),
            format!("Ping successful with code {}. Response: {}", code, body),
        ),
        Ok((code, body)) => {
            warn!(code, "Relay ping was rejected");
            (
                false,
                String::new(),
                format!("Ping failed with code {}. Response: {}", code, body),
            )
        }
        Err(e) => {
            warn!(error = %e, "Relay unreachable");
            (false, String::new(), format!("Ping failed: {}", e))
        }
    };

    let was_ready = node
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|c| c.iter().find(|c| c.type_ == "Ready"))
        .map(|c| c.status == "True");
    if was_ready != Some(ready) {
        info!(ready, "Node readiness changed");
    }

    let (reason, ready_message) = if ready {
        ("KubeletReady", "relay is reachable")
    } else {
        ("RelayUnreachable", "relay is not reachable")
    };
    set_condition(node, condition("Ready", ready, reason, ready_message));
    set_condition(
        node,
        condition(
            "NetworkUnavailable",
            !ready,
            if ready { "RouteCreated" } else { "RelayUnreachable" },
            "",
        ),
    );
    set_condition(
        node,
        condition(
            RELAY_CONNECTIVITY,
            ready,
            if ready {
                "RelayPingSuccessful"
            } else {
                "RelayPingFailed"
            },
            &message,
        ),
    );
    node.metadata
        .annotations
        .get_or_insert_with(Default::default)
        .insert(PING_RESPONSE_ANNOTATION.to_string(), response);
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use k8s_openapi::api::core::v1::{
        ConfigMap, Container, ContainerState, ContainerStateRunning, ContainerStatus,
        Pod as KubePod, PodSpec, Secret,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use relay_api::PodStatus;
    use virtual_kubelet::provider::{PodNotifier, Provider};
    use virtual_kubelet::Pod;
    use warp::http::StatusCode;
    use warp::Filter;

    use crate::config::Config;
    use crate::resources::ObjectSource;
    use crate::TrackedPod;

    struct NoObjects;

    #[async_trait]
    impl ObjectSource for NoObjects {
        async fn config_map(&self, _: &str, _: &str) -> anyhow::Result<Option<ConfigMap>> {
            Ok(None)
        }

        async fn secret(&self, _: &str, _: &str) -> anyhow::Result<Option<Secret>> {
            Ok(None)
        }

        async fn service_account_token(&self, _: &Pod, _: Option<&str>) -> anyhow::Result<String> {
            Ok(String::new())
        }
    }

    // Answers /status with 500 for the first `failures` calls, then reports
    // every pod in `uids` with a running container. /pinglink answers 503.
    fn serve_relay(
        failures: usize,
        uids: Vec<&'static str>,
        calls: Arc<AtomicUsize>,
    ) -> SocketAddr {
        let status = warp::path!("status").map(move || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < failures {
                let empty: Vec<PodStatus> = Vec::new();
                return warp::reply::with_status(
                    warp::reply::json(&empty),
                    StatusCode::INTERNAL_SERVER_ERROR,
                );
            }
            let statuses: Vec<_> = uids
                .iter()
                .map(|uid| PodStatus {
                    pod_uid: uid.to_string(),
                    containers: vec![ContainerStatus {
                        name: "c1".to_string(),
                        state: Some(ContainerState {
                            running: Some(ContainerStateRunning::default()),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }],
                    ..Default::default()
                })
                .collect();
            warp::reply::with_status(warp::reply::json(&statuses), StatusCode::OK)
        });
        let ping = warp::path!("pinglink")
            .map(|| warp::reply::with_status("backend down", StatusCode::SERVICE_UNAVAILABLE));
        let (addr, server) = warp::serve(status.or(ping)).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(server);
        addr
    }

    fn provider(addr: SocketAddr) -> RelayProvider {
        let config = Config {
            relay_port: addr.port(),
            ..Default::default()
        };
        RelayProvider::new(config, Arc::new(NoObjects)).unwrap()
    }

    fn pod(name: &str, uid: &str) -> Pod {
        Pod::from(KubePod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                uid: Some(uid.to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "c1".to_string(),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn reconcile_skips_the_relay_without_created_pods() {
        let calls = Arc::new(AtomicUsize::new(0));
        let addr = serve_relay(0, vec!["u1"], calls.clone());
        let provider = provider(addr);

        provider.reconcile().await.unwrap();

        let pending = pod("p1", "u1");
        provider.shared.pods.write().await.insert(
            pending.key(),
            TrackedPod {
                pod: pending,
                created: false,
            },
        );
        provider.reconcile().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn status_loop_survives_a_failed_tick() {
        let calls = Arc::new(AtomicUsize::new(0));
        let addr = serve_relay(1, vec!["u1"], calls.clone());
        let provider = provider(addr);
        let (notifier, mut updates) = PodNotifier::channel();
        *provider.shared.notifier.lock().unwrap() = Some(notifier);
        provider.restore_pods(vec![pod("p1", "u1")]).await.unwrap();

        let shutdown = CancellationToken::new();
        let running = tokio::spawn(status_loop(
            provider.clone(),
            Duration::from_millis(20),
            shutdown.clone(),
        ));

        let updated = tokio::time::timeout(Duration::from_secs(5), updates.recv())
            .await
            .expect("no pod update after the failed tick")
            .unwrap();
        assert_eq!(updated.phase(), Some("Running"));
        assert!(calls.load(Ordering::SeqCst) >= 2);

        shutdown.cancel();
        running.await.unwrap();
    }

    #[tokio::test]
    async fn health_loop_reports_an_unhealthy_relay() {
        let addr = serve_relay(0, vec![], Arc::new(AtomicUsize::new(0)));
        let (notifier, mut nodes) = NodeNotifier::channel();
        let shutdown = CancellationToken::new();
        let running = tokio::spawn(health_loop(
            provider(addr),
            KubeNode::default(),
            notifier,
            Duration::from_secs(3600),
            shutdown.clone(),
        ));

        let node = tokio::time::timeout(Duration::from_secs(5), nodes.recv())
            .await
            .expect("health loop pushed no node")
            .unwrap();
        assert_eq!(status(&node, "Ready"), "False");
        assert_eq!(status(&node, RELAY_CONNECTIVITY), "False");

        shutdown.cancel();
        running.await.unwrap();
    }

    fn status(node: &KubeNode, type_: &str) -> String {
        node.status
            .as_ref()
            .and_then(|s| s.conditions.as_ref())
            .and_then(|c| c.iter().find(|c| c.type_ == type_))
            .map(|c| c.status.clone())
            .unwrap()
    }

    fn annotation(node: &KubeNode) -> &str {
        node.metadata.annotations.as_ref().unwrap()[PING_RESPONSE_ANNOTATION].as_str()
    }

    #[test]
    fn successful_ping_marks_node_ready() {
        let mut node = KubeNode::default();
        apply_ping(&mut node, &Ok((200, "0".to_string())));
        assert_eq!(status(&node, "Ready"), "True");
        assert_eq!(status(&node, "NetworkUnavailable"), "False");
        assert_eq!(status(&node, RELAY_CONNECTIVITY), "True");
        assert_eq!(annotation(&node), "0");
    }

    #[test]
    fn rejected_ping_marks_node_not_ready() {
        let mut node = KubeNode::default();
        apply_ping(&mut node, &Ok((200, "0".to_string())));
        apply_ping(&mut node, &Ok((503, "Backend unreachable".to_string())));
        assert_eq!(status(&node, "Ready"), "False");
        assert_eq!(status(&node, RELAY_CONNECTIVITY), "False");
        assert_eq!(annotation(&node), "");
        let conditions = node.status.as_ref().unwrap().conditions.as_ref().unwrap();
        assert_eq!(conditions.iter().filter(|c| c.type_ == "Ready").count(), 1);
    }

    #[test]
    fn unreachable_relay_marks_node_not_ready() {
        let mut node = KubeNode::default();
        let err = ClientError::Status {
            code: 0,
            body: String::new(),
        };
        apply_ping(&mut node, &Err(err));
        assert_eq!(status(&node, "Ready"), "False");
        let message = node
            .status
            .as_ref()
            .and_then(|s| s.conditions.as_ref())
            .and_then(|c| c.iter().find(|c| c.type_ == RELAY_CONNECTIVITY))
            .and_then(|c| c.message.clone())
            .unwrap();
        assert!(message.starts_with("Ping failed:"));
    }
}
