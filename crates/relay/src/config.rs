//! Configuration for the relay.
//!
//! A relay is configured from a YAML file, see [`Config::from_file`]. With the
//! "cli" feature, [`Config::new_from_flags`] also reads the command line and
//! environment, which take precedence over the file.
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer, Serialize};
#[cfg(feature = "cli")]
use structopt::StructOpt;
use url::Url;

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_SIDECAR_URL: &str = "http://127.0.0.1";
const DEFAULT_SIDECAR_PORT: u16 = 4000;
/// Where the config file is looked for when no path is given.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/relaylet/relay.yaml";

/// Which kind of backend sits behind the sidecar.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub enum BackendKind {
    /// Containers run directly on a container host.
    #[serde(rename = "container-host", alias = "docker")]
    ContainerHost,
    /// Pods become jobs of a batch scheduler.
    #[serde(rename = "batch-scheduler", alias = "slurm")]
    BatchScheduler,
}

impl Default for BackendKind {
    fn default() -> Self {
        BackendKind::ContainerHost
    }
}

impl std::str::FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "container-host" | "docker" => Ok(BackendKind::ContainerHost),
            "batch-scheduler" | "slurm" => Ok(BackendKind::BatchScheduler),
            other => Err(anyhow::anyhow!("unknown backend kind '{}'", other)),
        }
    }
}

/// TLS settings for the relay's own listener.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct TlsConfig {
    /// Serve HTTPS instead of HTTP.
    #[serde(default, rename = "Enabled")]
    pub enabled: bool,
    /// Server certificate.
    #[serde(default, rename = "CertFile")]
    pub cert_file: Option<PathBuf>,
    /// Server private key.
    #[serde(default, rename = "KeyFile")]
    pub key_file: Option<PathBuf>,
    /// When set, clients must present a certificate signed by this CA.
    #[serde(default, rename = "CACertFile")]
    pub ca_cert_file: Option<PathBuf>,
}

/// The configuration needed for a relay to run.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct Config {
    /// The address the relay listens on.
    #[serde(
        default = "default_address",
        rename = "Address",
        alias = "InterlinkAddress",
        deserialize_with = "address"
    )]
    pub address: IpAddr,
    /// The port the relay listens on.
    #[serde(
        default = "default_port",
        rename = "Port",
        alias = "InterlinkPort",
        deserialize_with = "port"
    )]
    pub port: u16,
    /// Base URL of the backend sidecar, without the port.
    #[serde(default = "default_sidecar_url", rename = "SidecarURL")]
    pub sidecar_url: String,
    /// Port of the backend sidecar.
    #[serde(default = "default_sidecar_port", rename = "SidecarPort", deserialize_with = "port")]
    pub sidecar_port: u16,
    /// Which backend the sidecar fronts.
    #[serde(default, rename = "SidecarService")]
    pub sidecar_service: BackendKind,
    /// Resolve and forward config maps, secrets and projected volumes.
    #[serde(default = "default_true", rename = "ExportPodData")]
    pub export_pod_data: bool,
    /// Root folder for the status cache and conventional emptyDir paths.
    #[serde(default = "default_data_root", rename = "DataRootFolder")]
    pub data_root_folder: PathBuf,
    /// Log at debug level.
    #[serde(default, rename = "VerboseLogging")]
    pub verbose_logging: bool,
    /// Log errors only. Wins over `verbose_logging`.
    #[serde(default, rename = "ErrorsOnlyLogging")]
    pub errors_only_logging: bool,
    /// TLS for the relay listener.
    #[serde(default, rename = "TLS")]
    pub tls: TlsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            address: default_address(),
            port: DEFAULT_PORT,
            sidecar_url: DEFAULT_SIDECAR_URL.to_string(),
            sidecar_port: DEFAULT_SIDECAR_PORT,
            sidecar_service: BackendKind::default(),
            export_pod_data: true,
            data_root_folder: default_data_root(),
            verbose_logging: false,
            errors_only_logging: false,
            tls: TlsConfig::default(),
        }
    }
}

impl Config {
    /// Read a config from the YAML file at `path`. Missing keys take their
    /// defaults.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("unable to read config {}: {}", path.display(), e))?;
        Self::from_yaml(&raw)
    }

    /// Parse a config from YAML text.
    pub fn from_yaml(raw: &str) -> anyhow::Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Config::default());
        }
        Ok(serde_yaml::from_str(raw)?)
    }

    /// The sidecar endpoint, `sidecar_url` joined with `sidecar_port`.
    pub fn sidecar_endpoint(&self) -> anyhow::Result<Url> {
        let mut url = Url::parse(&self.sidecar_url)?;
        url.set_port(Some(self.sidecar_port))
            .map_err(|_| anyhow::anyhow!("sidecar URL {} cannot carry a port", self.sidecar_url))?;
        Ok(url)
    }

    /// The log filter directive implied by the logging flags.
    pub fn log_level(&self) -> &'static str {
        if self.errors_only_logging {
            "error"
        } else if self.verbose_logging {
            "debug"
        } else {
            "info"
        }
    }

    /// Parses the command line and environment, then the config file they
    /// point at. Flags and environment override values from the file.
    #[cfg(feature = "cli")]
    pub fn new_from_flags(version: &str) -> anyhow::Result<Self> {
        let app = Opts::clap().version(version);
        let opts = Opts::from_clap(&app.get_matches());
        opts.into_config()
    }
}

/// CLI options for the relay.
#[derive(StructOpt, Clone, Debug)]
#[cfg(feature = "cli")]
#[structopt(
    name = "relaylet-relay",
    about = "Relays pod lifecycle requests from relaylet nodes to a backend sidecar"
)]
pub struct Opts {
    #[structopt(
        short = "c",
        long = "config",
        env = "RELAYLET_RELAY_CONFIG",
        help = "The path to the relay config file. Defaults to /etc/relaylet/relay.yaml"
    )]
    config: Option<PathBuf>,

    #[structopt(
        short = "a",
        long = "address",
        env = "RELAY_ADDRESS",
        help = "The address the relay should listen on"
    )]
    address: Option<IpAddr>,

    #[structopt(
        short = "p",
        long = "port",
        env = "RELAY_PORT",
        help = "The port the relay should listen on"
    )]
    port: Option<u16>,

    #[structopt(
        long = "sidecar-url",
        env = "SIDECAR_URL",
        help = "The base URL of the backend sidecar"
    )]
    sidecar_url: Option<String>,

    #[structopt(
        long = "sidecar-port",
        env = "SIDECAR_PORT",
        help = "The port of the backend sidecar"
    )]
    sidecar_port: Option<u16>,

    #[structopt(
        long = "backend",
        env = "RELAY_BACKEND",
        help = "The backend behind the sidecar: container-host or batch-scheduler"
    )]
    backend: Option<BackendKind>,

    #[structopt(
        long = "data-root",
        env = "RELAY_DATA_ROOT",
        help = "The folder for the status cache"
    )]
    data_root: Option<PathBuf>,

    #[structopt(short = "v", long = "verbose", help = "Log at debug level")]
    verbose: bool,

    #[structopt(long = "errors-only", help = "Only log errors")]
    errors_only: bool,
}

#[cfg(feature = "cli")]
impl Opts {
    fn into_config(self) -> anyhow::Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(path)?,
            None => {
                let path = Path::new(DEFAULT_CONFIG_PATH);
                if path.exists() {
                    Config::from_file(path)?
                } else {
                    Config::default()
                }
            }
        };
        if let Some(address) = self.address {
            config.address = address;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(url) = self.sidecar_url {
            config.sidecar_url = url;
        }
        if let Some(port) = self.sidecar_port {
            config.sidecar_port = port;
        }
        if let Some(backend) = self.backend {
            config.sidecar_service = backend;
        }
        if let Some(root) = self.data_root {
            config.data_root_folder = root;
        }
        config.verbose_logging |= self.verbose;
        config.errors_only_logging |= self.errors_only;
        Ok(config)
    }
}

fn default_address() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_sidecar_url() -> String {
    DEFAULT_SIDECAR_URL.to_string()
}

fn default_sidecar_port() -> u16 {
    DEFAULT_SIDECAR_PORT
}

fn default_true() -> bool {
    true
}

fn default_data_root() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".relaylet"))
        .unwrap_or_else(|| PathBuf::from(".relaylet"))
}

// Ports are written both as numbers and as quoted strings in existing files.
fn port<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Port {
        Number(u16),
        Text(String),
    }
    match Port::deserialize(deserializer)? {
        Port::Number(n) => Ok(n),
        Port::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

// Addresses may carry a scheme, e.g. "http://0.0.0.0".
fn address<'de, D>(deserializer: D) -> Result<IpAddr, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    let host = raw
        .trim()
        .trim_start_matches("http://")
        .trim_start_matches("https://")
        .trim_end_matches('/');
    host.parse().map_err(serde::de::Error::custom)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = Config::from_yaml("").unwrap();
        assert_eq!(config, Config::default());
        assert!(config.export_pod_data);
        assert_eq!(config.log_level(), "info");
    }

    #[test]
    fn reads_legacy_keys_and_quoted_ports() {
        let config = Config::from_yaml(
            r#"
InterlinkAddress: "http://0.0.0.0"
InterlinkPort: "3000"
SidecarURL: "http://localhost"
SidecarPort: "4000"
SidecarService: "slurm"
ExportPodData: false
DataRootFolder: "/tmp/relay"
ErrorsOnlyLogging: true
VerboseLogging: true
"#,
        )
        .unwrap();
        assert_eq!(config.port, 3000);
        assert_eq!(config.sidecar_service, BackendKind::BatchScheduler);
        assert!(!config.export_pod_data);
        assert_eq!(config.data_root_folder, PathBuf::from("/tmp/relay"));
        assert_eq!(config.log_level(), "error");
        assert_eq!(
            config.sidecar_endpoint().unwrap().as_str(),
            "http://localhost:4000/"
        );
    }

    #[test]
    fn backend_kind_parses_from_flags() {
        assert_eq!(
            "docker".parse::<BackendKind>().unwrap(),
            BackendKind::ContainerHost
        );
        assert!("k8s".parse::<BackendKind>().is_err());
    }
}
