//! `node` contains wrappers around the Kubernetes node API, containing ways to
//! create and update the virtual node.
use std::collections::BTreeMap;

use chrono::prelude::*;
use k8s_openapi::api::core::v1::{
    DaemonEndpoint, Node as KubeNode, NodeAddress, NodeCondition, NodeDaemonEndpoints, NodeSpec,
    NodeStatus, NodeSystemInfo, Taint as KubeTaint,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::error::ErrorResponse;
use kube::Error;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::provider::Provider;

const KUBELET_VERSION: &str = env!("CARGO_PKG_VERSION");

macro_rules! retry {
    ($action:expr, times: $num_times:expr, error: $on_err:expr) => {{
        let mut n = 0u8;
        let mut duration = std::time::Duration::from_millis(100);
        loop {
            n += 1;
            let result = $action;
            match result {
                Ok(_) => break result,
                Err(ref e) => {
                    if $on_err(e, n) {
                        break result;
                    };
                    tokio::time::sleep(duration).await;
                    duration *= (n + 1) as u32;
                    if n == $num_times {
                        break result;
                    }
                }
            }
        }
    }};
    ($action:expr, times: $num_times:expr, log_error: $log:expr) => {
        retry!($action, times: $num_times, error: |e, _| { $log(e); false })
    };
    ($action:expr, times: $num_times:expr) => {
        retry!($action, times: $num_times, error: |_, _| { false })
    };
    ($action:expr, times: $num_times:expr, break_on: $matches:pat) => {
        retry!($action, times: $num_times, error: |e, _| { matches!(e, $matches) })
    };
}

/// Register the node with the API server.
///
/// An existing node of the same name is taken over: its status is replaced by
/// the freshly built one. Returns the node as stored by the API server.
pub async fn register<P: Provider>(
    client: &kube::Client,
    config: &Config,
    provider: &P,
) -> anyhow::Result<KubeNode> {
    let node_client: Api<KubeNode> = Api::all(client.clone());

    let mut builder = Node::builder();
    builder.set_name(&config.node_name);
    builder.add_annotation("node.alpha.kubernetes.io/ttl", "0");
    node_labels_definition(config, &mut builder);
    for taint in &config.node_taints {
        builder.add_taint(&taint.effect, &taint.key, &taint.value);
    }

    builder.add_capacity("pods", &config.max_pods.to_string());
    builder.add_allocatable("pods", &config.max_pods.to_string());

    let ts = Utc::now();
    builder.add_condition("Ready", "True", &ts, "KubeletReady", "kubelet is ready");
    for (type_, reason, message) in HEALTHY_CONDITIONS {
        builder.add_condition(type_, "False", &ts, reason, message);
    }

    builder.add_address("InternalIP", &format!("{}", config.node_ip));
    builder.add_address("Hostname", &config.hostname);
    builder.set_port(config.server_config.port as i32);

    if let Err(e) = provider.node(&mut builder).await {
        warn!(error = %e, "Provider node annotation error");
    }
    let node = builder.build().into_inner();

    match retry!(node_client.get(&config.node_name).await, times: 4, break_on: &Error::Api(ErrorResponse { code: 404, .. }))
    {
        Ok(_) => {
            info!(node = %config.node_name, "Node already exists, taking it over");
            patch_status(client, &node).await?;
            Ok(node_client.get(&config.node_name).await?)
        }
        Err(Error::Api(ErrorResponse { code: 404, .. })) => {
            let created = retry!(
                node_client.create(&PostParams::default(), &node).await,
                times: 4,
                log_error: |e| debug!(error = %e, "Node could not be created. Retrying...")
            )
            .map_err(|e| anyhow::anyhow!("exhausted retries creating node: {}", e))?;
            info!(node = %config.node_name, "Successfully created node");
            Ok(created)
        }
        Err(e) => Err(anyhow::anyhow!(
            "exhausted retries when trying to talk to API: {}",
            e
        )),
    }
}

/// Write the status and annotations of `node` to the API server.
///
/// This doubles as the node heartbeat.
pub async fn patch_status(client: &kube::Client, node: &KubeNode) -> anyhow::Result<()> {
    let name = node
        .metadata
        .name
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("node has no name"))?;
    let node_client: Api<KubeNode> = Api::all(client.clone());

    if let Some(annotations) = &node.metadata.annotations {
        let patch = serde_json::json!({ "metadata": { "annotations": annotations } });
        node_client
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| anyhow::anyhow!("Unable to patch node annotations: {}", e))?;
    }

    let mut status = node.status.clone().unwrap_or_default();
    let now = Time(Utc::now());
    for condition in status.conditions.iter_mut().flatten() {
        condition.last_heartbeat_time = Some(now.clone());
    }
    let patch = serde_json::json!({ "status": status });
    retry!(
        node_client
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await,
        times: 4,
        log_error: |e| error!(error = %e, "Unable to patch node status")
    )
    .map_err(|e| anyhow::anyhow!("Unable to patch node status: {}", e))?;
    Ok(())
}

/// Conditions that report a healthy node when `False`.
const HEALTHY_CONDITIONS: [(&str, &str, &str); 4] = [
    (
        "MemoryPressure",
        "KubeletHasSufficientMemory",
        "kubelet has sufficient memory available",
    ),
    (
        "DiskPressure",
        "KubeletHasNoDiskPressure",
        "kubelet has no disk pressure",
    ),
    (
        "PIDPressure",
        "KubeletHasSufficientPID",
        "kubelet has sufficient PID available",
    ),
    (
        "NetworkUnavailable",
        "RouteCreated",
        "RouteController created a route",
    ),
];

/// Insert or replace the condition of the same type on `node`.
///
/// The transition time is kept when the condition's status did not change.
pub fn set_condition(node: &mut KubeNode, mut condition: NodeCondition) {
    let conditions = node
        .status
        .get_or_insert_with(Default::default)
        .conditions
        .get_or_insert_with(Vec::new);
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => {
            if existing.status == condition.status {
                condition.last_transition_time = existing.last_transition_time.clone();
            }
            *existing = condition;
        }
        None => conditions.push(condition),
    }
}

/// Build a node condition stamped with the current time.
pub fn condition(type_: &str, status: bool, reason: &str, message: &str) -> NodeCondition {
    let now = Time(Utc::now());
    NodeCondition {
        type_: type_.to_string(),
        status: if status { "True" } else { "False" }.to_string(),
        last_heartbeat_time: Some(now.clone()),
        last_transition_time: Some(now),
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
    }
}

/// Labels the runtime owns. User supplied values for these are dropped.
const MANAGED_LABELS: [&str; 5] = [
    "beta.kubernetes.io/os",
    "kubernetes.io/hostname",
    "kubernetes.io/os",
    "kubernetes.io/role",
    "type",
];

/// Labels under `kubernetes.io` that users may still set.
const ALLOWED_KUBERNETES_LABELS: [&str; 8] = [
    "beta.kubernetes.io/arch",
    "beta.kubernetes.io/instance-type",
    "failure-domain.beta.kubernetes.io/region",
    "failure-domain.beta.kubernetes.io/zone",
    "failure-domain.kubernetes.io/region",
    "failure-domain.kubernetes.io/zone",
    "kubernetes.io/arch",
    "kubernetes.io/instance-type",
];

fn label_allowed(key: &str) -> bool {
    !key.contains("kubernetes.io")
        || key.starts_with("kubelet.kubernetes.io")
        || key.starts_with("node.kubernetes.io")
        || ALLOWED_KUBERNETES_LABELS.contains(&key)
}

/// Apply the runtime labels plus whichever `--node-labels` are permitted.
fn node_labels_definition(config: &Config, builder: &mut Builder) {
    builder.add_label("beta.kubernetes.io/os", "linux");
    builder.add_label("kubernetes.io/os", "linux");
    builder.add_label("kubernetes.io/role", "agent");
    builder.add_label("type", "virtual-kubelet");
    builder.add_label("kubernetes.io/hostname", &config.hostname);

    for (key, value) in &config.node_labels {
        if MANAGED_LABELS.contains(&key.as_str()) {
            warn!(label = %key, "Ignoring node label managed by the runtime");
        } else if !label_allowed(key) {
            warn!(label = %key, "Ignoring node label in a restricted namespace");
        } else {
            builder.add_label(key, value);
        }
    }
}

/// The virtual node as it is registered with the API server.
pub struct Node(KubeNode);

impl Node {
    /// Start describing a node.
    pub fn builder() -> Builder {
        Builder::default()
    }

    /// The underlying API object.
    pub fn into_inner(self) -> KubeNode {
        self.0
    }
}

impl Default for Node {
    fn default() -> Node {
        Node::builder().build()
    }
}

/// Accumulates the pieces of a [`Node`]. Providers receive one during
/// registration to advertise their capacity.
pub struct Builder {
    name: String,
    port: i32,
    annotations: BTreeMap<String, String>,
    labels: BTreeMap<String, String>,
    taints: Vec<KubeTaint>,
    capacity: BTreeMap<String, Quantity>,
    allocatable: BTreeMap<String, Quantity>,
    conditions: Vec<NodeCondition>,
    addresses: Vec<NodeAddress>,
}

impl Default for Builder {
    fn default() -> Self {
        Builder {
            name: "virtual-kubelet".to_string(),
            port: 10250,
            annotations: BTreeMap::new(),
            labels: BTreeMap::new(),
            taints: Vec::new(),
            capacity: BTreeMap::new(),
            allocatable: BTreeMap::new(),
            conditions: Vec::new(),
            addresses: Vec::new(),
        }
    }
}

impl Builder {
    /// Name the node is registered under.
    pub fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
    }

    /// Kubelet API port published in the node's daemon endpoints.
    pub fn set_port(&mut self, port: i32) {
        self.port = port;
    }

    /// Add a node annotation.
    pub fn add_annotation(&mut self, key: &str, value: &str) {
        self.annotations.insert(key.to_string(), value.to_string());
    }

    /// Add a node label.
    pub fn add_label(&mut self, key: &str, value: &str) {
        self.labels.insert(key.to_string(), value.to_string());
    }

    /// Add a taint with the given effect.
    pub fn add_taint(&mut self, effect: &str, key: &str, value: &str) {
        self.taints.push(KubeTaint {
            effect: effect.to_string(),
            key: key.to_string(),
            value: Some(value.to_string()),
            time_added: None,
        });
    }

    /// Advertise `value` of resource `key` as node capacity.
    pub fn add_capacity(&mut self, key: &str, value: &str) {
        self.capacity.insert(key.to_string(), Quantity(value.to_string()));
    }

    /// Advertise `value` of resource `key` as schedulable.
    pub fn add_allocatable(&mut self, key: &str, value: &str) {
        self.allocatable.insert(key.to_string(), Quantity(value.to_string()));
    }

    /// Add a condition observed at `timestamp`.
    pub fn add_condition(
        &mut self,
        type_: &str,
        status: &str,
        timestamp: &DateTime<Utc>,
        reason: &str,
        message: &str,
    ) {
        let mut c = condition(type_, status == "True", reason, message);
        c.last_heartbeat_time = Some(Time(*timestamp));
        c.last_transition_time = Some(Time(*timestamp));
        self.conditions.push(c);
    }

    /// Add an address such as `InternalIP` or `Hostname`.
    pub fn add_address(&mut self, type_: &str, address: &str) {
        self.addresses.push(NodeAddress {
            type_: type_.to_string(),
            address: address.to_string(),
        });
    }

    /// Finish the node.
    pub fn build(self) -> Node {
        let node_info = NodeSystemInfo {
            architecture: "amd64".to_string(),
            operating_system: "linux".to_string(),
            kubelet_version: KUBELET_VERSION.to_string(),
            kube_proxy_version: "v1.22.0".to_string(),
            container_runtime_version: "relay".to_string(),
            ..Default::default()
        };
        Node(KubeNode {
            metadata: ObjectMeta {
                name: Some(self.name),
                annotations: Some(self.annotations),
                labels: Some(self.labels),
                ..Default::default()
            },
            spec: Some(NodeSpec {
                taints: Some(self.taints),
                ..Default::default()
            }),
            status: Some(NodeStatus {
                node_info: Some(node_info),
                capacity: Some(self.capacity),
                allocatable: Some(self.allocatable),
                daemon_endpoints: Some(NodeDaemonEndpoints {
                    kubelet_endpoint: Some(DaemonEndpoint { port: self.port }),
                }),
                conditions: Some(self.conditions),
                addresses: Some(self.addresses),
                ..Default::default()
            }),
        })
    }
}
