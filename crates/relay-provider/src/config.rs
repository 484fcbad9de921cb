//! Configuration for the relay provider.
//!
//! The provider reads a YAML file, by default `/etc/relaylet/node.yaml` or
//! whatever `RELAYLET_NODE_CONFIG` points at. Missing keys take defaults.
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use url::Url;

const DEFAULT_RELAY_URL: &str = "http://127.0.0.1";
const DEFAULT_RELAY_PORT: u16 = 3000;
const DEFAULT_POD_IP: &str = "127.0.0.1";
const DEFAULT_HEALTH_INTERVAL_SECS: u64 = 30;
const DEFAULT_STATUS_INTERVAL_SECS: u64 = 5;
const DEFAULT_VOLUME_WAIT_TIMEOUT_SECS: u64 = 300;
const DEFAULT_VOLUME_POLL_INTERVAL_SECS: u64 = 2;

/// Where the config file is looked for when `RELAYLET_NODE_CONFIG` is unset.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/relaylet/node.yaml";
/// Environment variable naming the config file.
pub const CONFIG_PATH_ENV: &str = "RELAYLET_NODE_CONFIG";

/// TLS settings for calls to the relay.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct TlsConfig {
    /// Verify the relay against `ca_cert_file` and present a client
    /// certificate if one is configured.
    #[serde(default, rename = "Enabled")]
    pub enabled: bool,
    /// Client certificate.
    #[serde(default, rename = "CertFile")]
    pub cert_file: Option<PathBuf>,
    /// Client private key.
    #[serde(default, rename = "KeyFile")]
    pub key_file: Option<PathBuf>,
    /// CA that signed the relay's certificate.
    #[serde(default, rename = "CACertFile")]
    pub ca_cert_file: Option<PathBuf>,
}

/// Capacity the node advertises to the scheduler.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct Resources {
    /// CPU quantity, e.g. "100".
    #[serde(default = "default_cpu", rename = "CPU")]
    pub cpu: String,
    /// Memory quantity, e.g. "128Gi".
    #[serde(default = "default_memory", rename = "Memory")]
    pub memory: String,
    /// Pod count.
    #[serde(default = "default_pods", rename = "Pods")]
    pub pods: String,
}

impl Default for Resources {
    fn default() -> Self {
        Resources {
            cpu: default_cpu(),
            memory: default_memory(),
            pods: default_pods(),
        }
    }
}

/// Everything the relay provider needs to run.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct Config {
    /// Base URL of the relay, without the port.
    #[serde(default = "default_relay_url", rename = "RelayURL", alias = "InterlinkURL")]
    pub relay_url: String,
    /// Port of the relay.
    #[serde(
        default = "default_relay_port",
        rename = "RelayPort",
        alias = "InterlinkPort",
        deserialize_with = "port"
    )]
    pub relay_port: u16,
    /// File holding the bearer token sent to the relay. Read on every call.
    #[serde(default, rename = "VKTokenFile")]
    pub token_file: Option<PathBuf>,
    /// Pod IP reported for pods without a `relaylet.io/pod-ip` annotation.
    #[serde(default = "default_pod_ip", rename = "PodIP")]
    pub pod_ip: String,
    /// Do not build projected volumes before a create.
    #[serde(default, rename = "DisableProjectedVolumes")]
    pub disable_projected_volumes: bool,
    /// Replaces the contents of `kube-root-ca.crt` in projected volumes.
    #[serde(default, rename = "KubernetesApiCaCrt")]
    pub kubernetes_api_ca_crt: Option<String>,
    /// Seconds between relay pings.
    #[serde(default = "default_health_interval", rename = "HealthIntervalSeconds")]
    pub health_interval_secs: u64,
    /// Seconds between status reconciliations.
    #[serde(default = "default_status_interval", rename = "StatusIntervalSeconds")]
    pub status_interval_secs: u64,
    /// How long a create waits for the objects its volumes reference.
    #[serde(default = "default_volume_wait_timeout", rename = "VolumeWaitTimeoutSeconds")]
    pub volume_wait_timeout_secs: u64,
    /// Seconds between lookups of a missing referenced object.
    #[serde(default = "default_volume_poll_interval", rename = "VolumePollIntervalSeconds")]
    pub volume_poll_interval_secs: u64,
    /// Capacity advertised on the node.
    #[serde(default, rename = "Resources")]
    pub resources: Resources,
    /// Log at debug level.
    #[serde(default, rename = "VerboseLogging")]
    pub verbose_logging: bool,
    /// Log errors only. Wins over `verbose_logging`.
    #[serde(default, rename = "ErrorsOnlyLogging")]
    pub errors_only_logging: bool,
    /// TLS for relay calls.
    #[serde(default, rename = "TLS")]
    pub tls: TlsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            relay_url: default_relay_url(),
            relay_port: DEFAULT_RELAY_PORT,
            token_file: None,
            pod_ip: default_pod_ip(),
            disable_projected_volumes: false,
            kubernetes_api_ca_crt: None,
            health_interval_secs: DEFAULT_HEALTH_INTERVAL_SECS,
            status_interval_secs: DEFAULT_STATUS_INTERVAL_SECS,
            volume_wait_timeout_secs: DEFAULT_VOLUME_WAIT_TIMEOUT_SECS,
            volume_poll_interval_secs: DEFAULT_VOLUME_POLL_INTERVAL_SECS,
            resources: Resources::default(),
            verbose_logging: false,
            errors_only_logging: false,
            tls: TlsConfig::default(),
        }
    }
}

impl Config {
    /// Read the config file named by `RELAYLET_NODE_CONFIG`, falling back to
    /// [`DEFAULT_CONFIG_PATH`]. A missing default file yields the defaults.
    pub fn from_env() -> anyhow::Result<Self> {
        match std::env::var_os(CONFIG_PATH_ENV) {
            Some(path) => Self::from_file(Path::new(&path)),
            None => {
                let path = Path::new(DEFAULT_CONFIG_PATH);
                if path.exists() {
                    Self::from_file(path)
                } else {
                    Ok(Config::default())
                }
            }
        }
    }

    /// Read a config from the YAML file at `path`.
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

    /// The relay endpoint, `relay_url` joined with `relay_port`.
    pub fn relay_endpoint(&self) -> anyhow::Result<Url> {
        let mut url = Url::parse(&self.relay_url)?;
        url.set_port(Some(self.relay_port))
            .map_err(|_| anyhow::anyhow!("relay URL {} cannot carry a port", self.relay_url))?;
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

    pub(crate) fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs.max(1))
    }

    pub(crate) fn status_interval(&self) -> Duration {
        Duration::from_secs(self.status_interval_secs.max(1))
    }

    pub(crate) fn volume_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.volume_wait_timeout_secs)
    }

    pub(crate) fn volume_poll_interval(&self) -> Duration {
        Duration::from_secs(self.volume_poll_interval_secs.max(1))
    }
}

fn default_relay_url() -> String {
    DEFAULT_RELAY_URL.to_string()
}

fn default_relay_port() -> u16 {
    DEFAULT_RELAY_PORT
}

fn default_pod_ip() -> String {
    DEFAULT_POD_IP.to_string()
}

fn default_health_interval() -> u64 {
    DEFAULT_HEALTH_INTERVAL_SECS
}

fn default_status_interval() -> u64 {
    DEFAULT_STATUS_INTERVAL_SECS
}

fn default_volume_wait_timeout() -> u64 {
    DEFAULT_VOLUME_WAIT_TIMEOUT_SECS
}

fn default_volume_poll_interval() -> u64 {
    DEFAULT_VOLUME_POLL_INTERVAL_SECS
}

fn default_cpu() -> String {
    "100".to_string()
}

fn default_memory() -> String {
    "128Gi".to_string()
}

fn default_pods() -> String {
    "100".to_string()
}

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

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = Config::from_yaml("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.relay_endpoint().unwrap().as_str(), "http://127.0.0.1:3000/");
        assert_eq!(config.volume_wait_timeout(), Duration::from_secs(300));
        assert_eq!(config.volume_poll_interval(), Duration::from_secs(2));
    }

    #[test]
    fn reads_legacy_keys() {
        let config = Config::from_yaml(
            r#"
InterlinkURL: "https://relay.example.org"
InterlinkPort: "8443"
VKTokenFile: /opt/token
PodIP: 10.0.0.7
Resources:
  CPU: "8"
TLS:
  Enabled: true
  CACertFile: /etc/relaylet/ca.crt
"#,
        )
        .unwrap();
        assert_eq!(
            config.relay_endpoint().unwrap().as_str(),
            "https://relay.example.org:8443/"
        );
        assert_eq!(config.token_file, Some(PathBuf::from("/opt/token")));
        assert_eq!(config.pod_ip, "10.0.0.7");
        assert_eq!(config.resources.cpu, "8");
        assert_eq!(config.resources.memory, "128Gi");
        assert!(config.tls.enabled);
    }

    #[test]
    fn errors_only_wins() {
        let config = Config {
            verbose_logging: true,
            errors_only_logging: true,
            ..Default::default()
        };
        assert_eq!(config.log_level(), "error");
    }
}
