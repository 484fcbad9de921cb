//! Configuration for a virtual kubelet
//!
//! The best way to configure the kubelet is by using [`Config::default_config`]
//! or by turning on the "cli" feature and using [`Config::new_from_flags`].

use std::collections::HashMap;
use std::net::{IpAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};

#[cfg(feature = "cli")]
use structopt::StructOpt;

const DEFAULT_PORT: u16 = 10250;
const DEFAULT_MAX_PODS: u16 = 110;
const DEFAULT_TAINT: &str = "virtual-node.relaylet.io/no-schedule=true:NoSchedule";

/// The configuration needed for a virtual kubelet to run properly.
///
/// Use [`Config::default_config`] to generate a config with all of the
/// default values set.
#[derive(Clone, Debug)]
pub struct Config {
    /// The ip address the node is exposed on
    pub node_ip: IpAddr,
    /// The hostname of the node
    pub hostname: String,
    /// The node's name
    pub node_name: String,
    /// The kubelet API server configuration
    pub server_config: ServerConfig,
    /// The directory where the kubelet stores its data
    pub data_dir: PathBuf,
    /// Labels to add when registering the node in the cluster
    pub node_labels: HashMap<String, String>,
    /// Taints to add when registering the node in the cluster
    pub node_taints: Vec<Taint>,
    /// The maximum pods for this kubelet (reported to apiserver)
    pub max_pods: u16,
}

/// The configuration for the kubelet API server.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// The ip address the server is running on
    pub addr: IpAddr,
    /// The port the server is running on
    pub port: u16,
    /// Path to the TLS certificate. The server falls back to plain HTTP when
    /// either file is missing.
    pub cert_file: PathBuf,
    /// Path to the TLS private key.
    pub private_key_file: PathBuf,
}

/// A node taint given as `key=value:Effect`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Taint {
    /// Taint key
    pub key: String,
    /// Taint value, possibly empty
    pub value: String,
    /// One of `NoSchedule`, `PreferNoSchedule` or `NoExecute`
    pub effect: String,
}

impl std::str::FromStr for Taint {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (pair, effect) = s
            .rsplit_once(':')
            .ok_or_else(|| anyhow::anyhow!("taint '{}' has no effect", s))?;
        match effect {
            "NoSchedule" | "PreferNoSchedule" | "NoExecute" => (),
            other => anyhow::bail!("invalid taint effect '{}'", other),
        }
        let (key, value) = split_one_label(pair)
            .ok_or_else(|| anyhow::anyhow!("taint '{}' has no key", s))?;
        Ok(Taint {
            key,
            value,
            effect: effect.to_string(),
        })
    }
}

impl Config {
    /// Returns a Config object set with all of the defaults.
    ///
    /// The preferred_ip_family argument takes an IpAddr that is either V4 or
    /// V6 to indicate the preferred IP family to use for defaults
    pub fn default_config(preferred_ip_family: &IpAddr) -> anyhow::Result<Self> {
        let hostname = default_hostname()?;
        let data_dir = default_data_dir()?;
        Ok(Config {
            node_ip: default_node_ip(&hostname, preferred_ip_family)?,
            node_name: sanitize_hostname(&hostname),
            node_labels: HashMap::new(),
            node_taints: vec![DEFAULT_TAINT.parse()?],
            hostname,
            max_pods: DEFAULT_MAX_PODS,
            server_config: ServerConfig {
                addr: unspecified(preferred_ip_family),
                port: DEFAULT_PORT,
                cert_file: default_cert_path(&data_dir),
                private_key_file: default_key_path(&data_dir),
            },
            data_dir,
        })
    }

    /// Parses all command line flags and sets the proper defaults. The version
    /// of your application should be passed to set the proper version for the CLI
    #[cfg(any(feature = "cli", feature = "docs"))]
    pub fn new_from_flags(version: &str) -> anyhow::Result<Self> {
        let app = Opts::clap().version(version);
        let opts = Opts::from_clap(&app.get_matches());
        opts.into_config()
    }
}

/// CLI options that can be configured for the virtual kubelet
#[derive(StructOpt, Clone, Debug)]
#[cfg(any(feature = "cli", feature = "docs"))]
#[structopt(
    name = "relaylet-node",
    about = "A virtual kubelet that runs pods through a relay"
)]
pub struct Opts {
    #[structopt(
        short = "a",
        long = "addr",
        default_value = "0.0.0.0",
        env = "RELAYLET_ADDRESS",
        help = "The address the kubelet API should listen on"
    )]
    addr: IpAddr,

    #[structopt(
        short = "p",
        long = "port",
        default_value = "10250",
        env = "RELAYLET_PORT",
        help = "The port the kubelet API should listen on"
    )]
    port: u16,

    #[structopt(
        long = "max-pods",
        default_value = "110",
        env = "MAX_PODS",
        help = "The maximum pods for this kubelet (reported to apiserver)"
    )]
    max_pods: u16,

    #[structopt(
        long = "tls-cert-file",
        env = "TLS_CERT_FILE",
        help = "The path to the kubelet TLS certificate. Defaults to $RELAYLET_DATA_DIR/config/relaylet.crt"
    )]
    tls_cert_file: Option<PathBuf>,

    #[structopt(
        long = "tls-private-key-file",
        env = "TLS_PRIVATE_KEY_FILE",
        help = "The path to the kubelet TLS key. Defaults to $RELAYLET_DATA_DIR/config/relaylet.key"
    )]
    tls_private_key_file: Option<PathBuf>,

    #[structopt(
        short = "n",
        long = "node-ip",
        env = "RELAYLET_NODE_IP",
        help = "The IP address of the node registered with the Kubernetes master. Defaults to the IP address of the node name in DNS"
    )]
    node_ip: Option<IpAddr>,

    #[structopt(
        long = "node-labels",
        env = "NODE_LABELS",
        use_delimiter = true,
        help = "Labels to add when registering the node in the cluster.
        Labels must be key=value pairs separated by ','."
    )]
    node_labels: Vec<String>,

    #[structopt(
        long = "node-taints",
        env = "NODE_TAINTS",
        use_delimiter = true,
        help = "Taints to add when registering the node, as key=value:Effect separated by ','.
        Defaults to virtual-node.relaylet.io/no-schedule=true:NoSchedule"
    )]
    node_taints: Vec<Taint>,

    #[structopt(
        long = "hostname",
        env = "RELAYLET_HOSTNAME",
        help = "The hostname for this node, defaults to the hostname of this machine"
    )]
    hostname: Option<String>,

    #[structopt(
        long = "node-name",
        env = "RELAYLET_NODE_NAME",
        help = "The name for this node in Kubernetes, defaults to the hostname of this machine"
    )]
    node_name: Option<String>,

    #[structopt(
        long = "data-dir",
        env = "RELAYLET_DATA_DIR",
        help = "The data path for relaylet storage. Defaults to $HOME/.relaylet"
    )]
    data_dir: Option<PathBuf>,
}

#[cfg(any(feature = "cli", feature = "docs"))]
impl Opts {
    fn into_config(self) -> anyhow::Result<Config> {
        let hostname = match self.hostname {
            Some(h) => h,
            None => default_hostname()?,
        };
        let node_ip = match self.node_ip {
            Some(ip) => ip,
            None => default_node_ip(&hostname, &self.addr)?,
        };
        let node_name = self
            .node_name
            .unwrap_or_else(|| sanitize_hostname(&hostname));
        let node_labels = self
            .node_labels
            .iter()
            .filter_map(|i| split_one_label(i))
            .collect();
        let node_taints = if self.node_taints.is_empty() {
            vec![DEFAULT_TAINT.parse()?]
        } else {
            self.node_taints
        };
        let data_dir = match self.data_dir {
            Some(d) => d,
            None => default_data_dir()?,
        };
        let cert_file = self
            .tls_cert_file
            .unwrap_or_else(|| default_cert_path(&data_dir));
        let private_key_file = self
            .tls_private_key_file
            .unwrap_or_else(|| default_key_path(&data_dir));

        Ok(Config {
            node_ip,
            node_name,
            node_labels,
            node_taints,
            hostname,
            data_dir,
            max_pods: self.max_pods,
            server_config: ServerConfig {
                addr: self.addr,
                port: self.port,
                cert_file,
                private_key_file,
            },
        })
    }
}

fn unspecified(family: &IpAddr) -> IpAddr {
    match family {
        IpAddr::V4(_) => IpAddr::from([0, 0, 0, 0]),
        IpAddr::V6(_) => IpAddr::from([0u16; 8]),
    }
}

fn default_hostname() -> anyhow::Result<String> {
    hostname::get()?
        .into_string()
        .map_err(|_| anyhow::anyhow!("invalid utf-8 hostname string"))
}

fn default_data_dir() -> anyhow::Result<PathBuf> {
    Ok(dirs::home_dir()
        .ok_or_else(|| anyhow::anyhow!("Unable to get home directory"))?
        .join(".relaylet"))
}

// Kubernetes names must be lowercase.
fn sanitize_hostname(hostname: &str) -> String {
    hostname.to_lowercase()
}

// Look the node name up in DNS, the same first step the Kubernetes kubelet takes.
fn default_node_ip(hostname: &str, preferred_ip_family: &IpAddr) -> anyhow::Result<IpAddr> {
    // The resolver wants a socket address; any port will do.
    let with_port = format!("{}:80", hostname);
    Ok(with_port
        .to_socket_addrs()?
        .find(|i| {
            !i.ip().is_loopback()
                && !i.ip().is_multicast()
                && !i.ip().is_unspecified()
                && is_same_ip_family(&i.ip(), preferred_ip_family)
        })
        .ok_or_else(|| {
            anyhow::anyhow!(
                "unable to find default IP address for node. Please specify a node IP manually"
            )
        })?
        .ip())
}

fn default_key_path(data_dir: &Path) -> PathBuf {
    data_dir.join("config/relaylet.key")
}

fn default_cert_path(data_dir: &Path) -> PathBuf {
    data_dir.join("config/relaylet.crt")
}

fn is_same_ip_family(first: &IpAddr, second: &IpAddr) -> bool {
    match first {
        IpAddr::V4(_) => second.is_ipv4(),
        IpAddr::V6(_) => second.is_ipv6(),
    }
}

fn split_one_label(in_string: &str) -> Option<(String, String)> {
    let mut splitter = in_string.splitn(2, '=');

    match splitter.next() {
        Some("") | None => None,
        Some(key) => match splitter.next() {
            Some(val) => Some((key.to_string(), val.to_string())),
            None => Some((key.to_string(), String::new())),
        },
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_taints() {
        let taint: Taint = DEFAULT_TAINT.parse().unwrap();
        assert_eq!(taint.key, "virtual-node.relaylet.io/no-schedule");
        assert_eq!(taint.value, "true");
        assert_eq!(taint.effect, "NoSchedule");

        let bare: Taint = "dedicated:NoExecute".parse().unwrap();
        assert_eq!(bare.value, "");

        assert!("key=value".parse::<Taint>().is_err());
        assert!("key=value:Sometimes".parse::<Taint>().is_err());
        assert!("=value:NoSchedule".parse::<Taint>().is_err());
    }

    #[test]
    fn splits_labels() {
        assert_eq!(
            split_one_label("a=b=c"),
            Some(("a".to_string(), "b=c".to_string()))
        );
        assert_eq!(split_one_label("a"), Some(("a".to_string(), String::new())));
        assert_eq!(split_one_label(""), None);
    }
}
