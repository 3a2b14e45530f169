use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::discovery::{MaxRetries, RetryPolicy, SrvQuery};
use crate::pacing::Pacing;

/// Largest buffer a `Vec` may hold.
const MAX_TEST_BYTES: usize = isize::MAX as usize;

/// Top-level configuration for the conntest agent.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Port the probe server listens on, bound to all interfaces. Default: 8080.
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Destination probed when discovery is disabled. Default: "127.0.0.1:8080".
    #[serde(default = "default_dest_host")]
    pub dest_host: String,

    /// Base interval between test rounds. Default: 5s.
    #[serde(default = "default_wait_time", with = "humantime_serde")]
    pub wait_time: Duration,

    /// Upper bound of the random jitter added to `wait_time`. Default: 5s.
    #[serde(default = "default_rand_time", with = "humantime_serde")]
    pub rand_time: Duration,

    /// Payload size for discovery cycles. Default: 10.
    #[serde(default = "default_short_test_bytes")]
    pub short_test_bytes: usize,

    /// Payload size for single-destination tests. Default: 10000.
    #[serde(default = "default_long_test_bytes")]
    pub long_test_bytes: usize,

    /// Number of rounds to run; 0 runs forever. Default: 0.
    #[serde(default)]
    pub times_to_send: u64,

    /// Reporting node name. Falls back to `NODE_NAME` when empty.
    #[serde(default)]
    pub node_name: String,

    /// Upper bound on a single probe. Unset means a silent peer can hold a
    /// probe indefinitely.
    #[serde(default, with = "humantime_serde")]
    pub probe_timeout: Option<Duration>,

    /// Peer discovery configuration.
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Prometheus exposition server configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// SRV-based peer discovery configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryConfig {
    /// Probe discovered peers. When false only `dest_host` is probed.
    /// Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// SRV service label. Default: "tcp".
    #[serde(default = "default_srv_service")]
    pub service: String,

    /// SRV protocol label. Default: "tcp".
    #[serde(default = "default_srv_protocol")]
    pub protocol: String,

    /// SRV domain. Default: "conntest".
    #[serde(default = "default_srv_name")]
    pub name: String,

    /// Wait between failed lookups. Default: 5s.
    #[serde(default = "default_retry_interval", with = "humantime_serde")]
    pub retry_interval: Duration,

    /// Consecutive failures tolerated; -1 is unlimited. Default: -1.
    #[serde(default = "default_max_retries")]
    pub max_retries: i64,
}

/// Prometheus metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Listen address. Default: ":9990".
    #[serde(default = "default_metrics_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_listen_port() -> u16 {
    8080
}

fn default_dest_host() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_wait_time() -> Duration {
    Duration::from_secs(5)
}

fn default_rand_time() -> Duration {
    Duration::from_secs(5)
}

fn default_short_test_bytes() -> usize {
    10
}

fn default_long_test_bytes() -> usize {
    10_000
}

fn default_true() -> bool {
    true
}

fn default_srv_service() -> String {
    "tcp".to_string()
}

fn default_srv_protocol() -> String {
    "tcp".to_string()
}

fn default_srv_name() -> String {
    "conntest".to_string()
}

fn default_retry_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_max_retries() -> i64 {
    -1
}

fn default_metrics_addr() -> String {
    ":9990".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
            dest_host: default_dest_host(),
            wait_time: default_wait_time(),
            rand_time: default_rand_time(),
            short_test_bytes: default_short_test_bytes(),
            long_test_bytes: default_long_test_bytes(),
            times_to_send: 0,
            node_name: String::new(),
            probe_timeout: None,
            discovery: DiscoveryConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            service: default_srv_service(),
            protocol: default_srv_protocol(),
            name: default_srv_name(),
            retry_interval: default_retry_interval(),
            max_retries: default_max_retries(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            addr: default_metrics_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        Self::from_yaml(&data).with_context(|| format!("parsing config file {}", path.display()))
    }

    /// Parse and validate configuration from YAML text.
    pub fn from_yaml(data: &str) -> Result<Self> {
        let cfg: Config = serde_yaml::from_str(data)?;
        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.listen_port == 0 {
            bail!("listen_port must be positive");
        }

        // A frame is the payload plus one delimiter byte in a single buffer.
        if self.short_test_bytes >= MAX_TEST_BYTES {
            bail!("short_test_bytes must be below {MAX_TEST_BYTES}");
        }

        if self.long_test_bytes >= MAX_TEST_BYTES {
            bail!("long_test_bytes must be below {MAX_TEST_BYTES}");
        }

        if self.metrics.addr.is_empty() {
            bail!("metrics.addr is required");
        }

        if let Some(timeout) = self.probe_timeout {
            if timeout.is_zero() {
                bail!("probe_timeout must be positive when set");
            }
        }

        if self.discovery.enabled {
            if self.discovery.service.is_empty()
                || self.discovery.protocol.is_empty()
                || self.discovery.name.is_empty()
            {
                bail!("discovery.service, discovery.protocol and discovery.name are required");
            }

            MaxRetries::from_config(self.discovery.max_retries)
                .context("invalid discovery.max_retries")?;
        } else if self.dest_host.is_empty() {
            bail!("dest_host is required when discovery is disabled");
        }

        Ok(())
    }

    /// Resolve the reporting node name from config or `NODE_NAME`.
    pub fn resolve_node_name(&self) -> Result<String> {
        crate::identity::resolve_node_name(&self.node_name)
    }

    /// Inter-round sleep policy.
    pub fn pacing(&self) -> Pacing {
        Pacing::new(self.wait_time, self.rand_time)
    }
}

impl DiscoveryConfig {
    pub fn query(&self) -> SrvQuery {
        SrvQuery::new(&self.service, &self.protocol, &self.name)
    }

    pub fn retry_policy(&self) -> Result<RetryPolicy> {
        Ok(RetryPolicy {
            interval: self.retry_interval,
            max_retries: MaxRetries::from_config(self.max_retries)?,
        })
    }
}
