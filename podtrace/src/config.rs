use serde::Deserialize;
use std::fs;
use std::path::PathBuf;

use podtrace_common::AlertThresholds;

const DEFAULT_CONFIG_PATH: &str = "/etc/podtrace/podtrace.toml";
const ENV_CONFIG_PATH: &str = "PODTRACE_CONFIG";

/// Top-level configuration, loaded via `toml::from_str` with `serde(default)`
/// on every field. A missing or unparsable file falls back to
/// [`Config::default`] rather than aborting startup.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub alert_thresholds: AlertThresholdsConfig,
    #[serde(default)]
    pub protocols: ProtocolConfig,
    #[serde(default)]
    pub targets: TargetConfig,
    #[serde(default)]
    pub cgroup: CgroupConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Loads configuration from the file named by `PODTRACE_CONFIG`, or
    /// `/etc/podtrace/podtrace.toml` if unset. Defaults apply if the file is
    /// missing or fails to parse.
    pub fn load() -> Self {
        let path =
            std::env::var(ENV_CONFIG_PATH).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let path = PathBuf::from(path);
        match fs::read_to_string(&path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_default(),
            Err(_) => Config::default(),
        }
    }

    pub fn thresholds(&self) -> AlertThresholds {
        AlertThresholds {
            warn_pct: self.alert_thresholds.warn_pct,
            crit_pct: self.alert_thresholds.crit_pct,
            emerg_pct: self.alert_thresholds.emerg_pct,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AlertThresholdsConfig {
    #[serde(default = "default_warn_pct")]
    pub warn_pct: u32,
    #[serde(default = "default_crit_pct")]
    pub crit_pct: u32,
    #[serde(default = "default_emerg_pct")]
    pub emerg_pct: u32,
}

impl Default for AlertThresholdsConfig {
    fn default() -> Self {
        Self {
            warn_pct: default_warn_pct(),
            crit_pct: default_crit_pct(),
            emerg_pct: default_emerg_pct(),
        }
    }
}

fn default_warn_pct() -> u32 {
    AlertThresholds::DEFAULT.warn_pct
}
fn default_crit_pct() -> u32 {
    AlertThresholds::DEFAULT.crit_pct
}
fn default_emerg_pct() -> u32 {
    AlertThresholds::DEFAULT.emerg_pct
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProtocolConfig {
    #[serde(default = "default_grpc_port")]
    pub grpc_port: u16,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            grpc_port: default_grpc_port(),
        }
    }
}

fn default_grpc_port() -> u16 {
    podtrace_common::DEFAULT_GRPC_PORT
}

/// Userspace library paths the uprobes above attach into. Any entry left
/// unset is skipped with a warning rather than failing startup, since not
/// every deployment runs every instrumented client library.
#[derive(Debug, Deserialize, Clone)]
pub struct TargetConfig {
    #[serde(default)]
    pub libpq: Option<String>,
    #[serde(default)]
    pub libmysqlclient: Option<String>,
    #[serde(default)]
    pub libsqlite3: Option<String>,
    #[serde(default)]
    pub libhiredis: Option<String>,
    #[serde(default)]
    pub libmemcached: Option<String>,
    #[serde(default)]
    pub librdkafka: Option<String>,
    #[serde(default)]
    pub libc: Option<String>,
    #[serde(default)]
    pub fastcgi_target: Option<String>,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            libpq: Some("/usr/lib/x86_64-linux-gnu/libpq.so.5".to_string()),
            libmysqlclient: Some("/usr/lib/x86_64-linux-gnu/libmysqlclient.so.21".to_string()),
            libsqlite3: Some("/usr/lib/x86_64-linux-gnu/libsqlite3.so.0".to_string()),
            libhiredis: Some("/usr/lib/x86_64-linux-gnu/libhiredis.so.0.14".to_string()),
            libmemcached: Some("/usr/lib/x86_64-linux-gnu/libmemcached.so.11".to_string()),
            librdkafka: Some("/usr/lib/x86_64-linux-gnu/librdkafka.so.1".to_string()),
            libc: Some("/usr/lib/x86_64-linux-gnu/libc.so.6".to_string()),
            fastcgi_target: Some("/usr/sbin/php-fpm8.2".to_string()),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CgroupConfig {
    #[serde(default = "default_cgroup_root")]
    pub root: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for CgroupConfig {
    fn default() -> Self {
        Self {
            root: default_cgroup_root(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

fn default_cgroup_root() -> String {
    "/sys/fs/cgroup".to_string()
}

fn default_poll_interval_ms() -> u64 {
    2_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_events_file")]
    pub events_file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            events_file: default_events_file(),
        }
    }
}

fn default_events_file() -> Option<String> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn parse_config_defaults() {
        let toml = r#"[alert_thresholds]
warn_pct = 70
crit_pct = 85
emerg_pct = 95
[protocols]
grpc_port = 50052
[cgroup]
root = "/sys/fs/cgroup"
poll_interval_ms = 1000
"#;
        let cfg: Config = toml::from_str(toml).unwrap();
        assert_eq!(cfg.alert_thresholds.warn_pct, 70);
        assert_eq!(cfg.protocols.grpc_port, 50052);
        assert_eq!(cfg.cgroup.poll_interval_ms, 1000);
    }

    #[test]
    fn defaults_match_shared_thresholds() {
        let cfg = Config::default();
        let t = cfg.thresholds();
        assert_eq!(t, AlertThresholds::DEFAULT);
    }

    #[test]
    fn env_override() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[protocols]\ngrpc_port = 9999").unwrap();
        unsafe {
            std::env::set_var(ENV_CONFIG_PATH, file.path());
        }
        let cfg = Config::load();
        assert_eq!(cfg.protocols.grpc_port, 9999);
        unsafe {
            std::env::remove_var(ENV_CONFIG_PATH);
        }
    }
}
