//! Startup configuration: listener addresses, persistence, rate limiting
//! and logging, loaded from a YAML file with sane defaults.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use serde::{Deserialize, Serialize};

fn default_external_listeners() -> Vec<SocketAddr> {
    vec!["0.0.0.0:80".parse().unwrap()]
}

fn default_internal_listeners() -> Vec<SocketAddr> {
    Vec::new()
}

fn default_management_listeners() -> Vec<SocketAddr> {
    vec!["127.0.0.1:8040".parse().unwrap()]
}

fn default_state_file() -> PathBuf {
    PathBuf::from("/var/lib/vhostlb/state.json")
}

fn default_max_rps() -> f64 {
    100.0
}

fn default_rps_headers() -> Vec<String> {
    vec!["X-Rate-Header".to_string()]
}

fn default_enforce_rate_limit() -> bool {
    false
}

fn default_save_interval() -> std::time::Duration {
    std::time::Duration::from_secs(10)
}

fn default_maintenance_interval() -> std::time::Duration {
    std::time::Duration::from_secs(2)
}

fn default_monitoring_interval() -> std::time::Duration {
    std::time::Duration::from_secs(10)
}

fn default_env() -> String {
    "dev".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Top-level load-balancer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StartupConfig {
    /// Listeners that rewrite `X-Forwarded-*` (public-facing).
    pub external_listeners: Vec<SocketAddr>,
    /// Listeners that do not rewrite `X-Forwarded-*` (trusted upstreams).
    pub internal_listeners: Vec<SocketAddr>,
    /// The management HTTP API's bind addresses.
    pub management_listeners: Vec<SocketAddr>,
    /// Where the routing table and stats snapshot is persisted.
    pub state_file: PathBuf,
    /// Directory to check for operator-supplied static responses before the
    /// compiled-in defaults.
    pub static_dir: Option<PathBuf>,
    /// setuid target after binding privileged ports, if running as root.
    pub uid: Option<u32>,
    /// setgid target after binding privileged ports, if running as root.
    pub gid: Option<u32>,
    /// Requests/second allowance per rate-limit token.
    pub max_rps: f64,
    /// Header names consulted to build the rate-limit token, in order.
    pub rps_headers: Vec<String>,
    /// If true, a request over its rate allowance gets a 420 instead of
    /// just being logged. Off by default, matching the original's shipped
    /// behavior of tracking abuse without rejecting it.
    pub enforce_rate_limit: bool,
    #[serde(with = "humantime_serde")]
    pub save_interval: std::time::Duration,
    #[serde(with = "humantime_serde")]
    pub maintenance_interval: std::time::Duration,
    #[serde(with = "humantime_serde")]
    pub monitoring_interval: std::time::Duration,
    /// "dev" or "prod"; controls pretty vs JSON logging.
    pub env: String,
    pub log_level: String,
}

impl Default for StartupConfig {
    fn default() -> Self {
        Self {
            external_listeners: default_external_listeners(),
            internal_listeners: default_internal_listeners(),
            management_listeners: default_management_listeners(),
            state_file: default_state_file(),
            static_dir: None,
            uid: None,
            gid: None,
            max_rps: default_max_rps(),
            rps_headers: default_rps_headers(),
            enforce_rate_limit: default_enforce_rate_limit(),
            save_interval: default_save_interval(),
            maintenance_interval: default_maintenance_interval(),
            monitoring_interval: default_monitoring_interval(),
            env: default_env(),
            log_level: default_log_level(),
        }
    }
}

impl StartupConfig {
    pub fn is_prod(&self) -> bool {
        self.env.eq_ignore_ascii_case("prod")
    }
}

const DEFAULT_CONFIG_PATH: &str = "config.yaml";

/// Loads configuration from `path` if given, else `./config.yaml`, else
/// falls back to built-in defaults and logs once that it did so.
pub fn load(path: Option<&std::path::Path>) -> anyhow::Result<StartupConfig> {
    let candidate = path.map(PathBuf::from).unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    if !candidate.exists() {
        if path.is_some() {
            // An explicitly-requested file that doesn't exist is a hard error.
            anyhow::bail!("config file {} does not exist", candidate.display());
        }
        tracing::warn!(
            component = "config",
            event = "config_file_missing",
            path = %candidate.display(),
            "no config file found, using built-in defaults"
        );
        return Ok(StartupConfig::default());
    }

    let raw = std::fs::read_to_string(&candidate)
        .with_context(|| format!("reading config file {}", candidate.display()))?;
    let cfg: StartupConfig = serde_yaml::from_str(&raw)
        .with_context(|| format!("parsing config file {}", candidate.display()))?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_path_falls_back_to_defaults() {
        let cfg = load(None).unwrap();
        assert_eq!(cfg.env, "dev");
        assert!(!cfg.is_prod());
    }

    #[test]
    fn explicit_missing_path_is_an_error() {
        let bogus = PathBuf::from("/nonexistent/vhostlb-config.yaml");
        assert!(load(Some(&bogus)).is_err());
    }

    #[test]
    fn parses_a_minimal_yaml_document() {
        let dir = std::env::temp_dir().join(format!("vhostlb-cfg-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.yaml");
        std::fs::write(&path, "env: prod\nmax_rps: 50.0\n").unwrap();

        let cfg = load(Some(&path)).unwrap();
        assert!(cfg.is_prod());
        assert_eq!(cfg.max_rps, 50.0);

        std::fs::remove_dir_all(&dir).ok();
    }
}
