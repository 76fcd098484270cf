use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration for devgate
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener and routing configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// App discovery and lifecycle settings
    #[serde(default)]
    pub apps: AppsConfig,

    /// Local certificate authority settings
    #[serde(default)]
    pub tls: TlsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address for both listeners (default: 127.0.0.1)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Plain HTTP port (default: 9280)
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// HTTPS port (default: 9283, set to 0 to disable)
    #[serde(default = "default_https_port")]
    pub https_port: u16,

    /// Top-level domains routed to apps, e.g. `blog.test` -> `blog`
    #[serde(default = "default_domains")]
    pub domains: Vec<String>,

    /// Include captured app output in start failure responses
    #[serde(default)]
    pub debug: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            http_port: default_http_port(),
            https_port: default_https_port(),
            domains: default_domains(),
            debug: false,
        }
    }
}

impl ServerConfig {
    pub fn tls_enabled(&self) -> bool {
        self.https_port > 0
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppsConfig {
    /// Directory holding one entry per app (default: ~/.devgate)
    #[serde(default = "default_apps_dir")]
    pub dir: PathBuf,

    /// Command used to launch directory apps. `$PORT` is substituted.
    #[serde(default = "default_command")]
    pub command: String,

    /// Stop apps after this many seconds without traffic
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Maximum time for an app to start accepting connections
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,

    /// Grace period in seconds between SIGTERM and SIGKILL
    #[serde(default = "default_stop_grace_period")]
    pub stop_grace_period_secs: u64,

    /// How often the idle reaper wakes up
    #[serde(default = "default_reap_interval")]
    pub reap_interval_secs: u64,

    /// Initial readiness probe interval in milliseconds (doubles up to 500ms)
    #[serde(default = "default_ready_poll_interval")]
    pub ready_poll_interval_ms: u64,

    /// Number of stdout/stderr lines kept per app for diagnostics
    #[serde(default = "default_output_tail_lines")]
    pub output_tail_lines: usize,
}

impl Default for AppsConfig {
    fn default() -> Self {
        Self {
            dir: default_apps_dir(),
            command: default_command(),
            idle_timeout_secs: default_idle_timeout(),
            startup_timeout_secs: default_startup_timeout(),
            stop_grace_period_secs: default_stop_grace_period(),
            reap_interval_secs: default_reap_interval(),
            ready_poll_interval_ms: default_ready_poll_interval(),
            output_tail_lines: default_output_tail_lines(),
        }
    }
}

impl AppsConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn stop_grace_period(&self) -> Duration {
        Duration::from_secs(self.stop_grace_period_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }

    pub fn ready_poll_interval(&self) -> Duration {
        Duration::from_millis(self.ready_poll_interval_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TlsConfig {
    /// Directory holding the root certificate and key
    #[serde(default = "default_ca_dir")]
    pub ca_dir: PathBuf,

    /// Lifetime of issued leaf certificates in days
    #[serde(default = "default_leaf_validity_days")]
    pub leaf_validity_days: u64,

    /// Lifetime of a newly generated root certificate in days
    #[serde(default = "default_ca_validity_days")]
    pub ca_validity_days: u64,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            ca_dir: default_ca_dir(),
            leaf_validity_days: default_leaf_validity_days(),
            ca_validity_days: default_ca_validity_days(),
        }
    }
}

impl TlsConfig {
    pub fn leaf_validity(&self) -> Duration {
        Duration::from_secs(self.leaf_validity_days.saturating_mul(SECS_PER_DAY))
    }

    pub fn ca_validity(&self) -> Duration {
        Duration::from_secs(self.ca_validity_days.saturating_mul(SECS_PER_DAY))
    }
}

const SECS_PER_DAY: u64 = 24 * 60 * 60;
/// Longest leaf lifetime browsers accept for a locally trusted root
const MAX_LEAF_VALIDITY_DAYS: u64 = 825;
const MAX_CA_VALIDITY_DAYS: u64 = 100 * 365;
const MAX_STARTUP_TIMEOUT_SECS: u64 = 60 * 60;

// Default value functions
fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_http_port() -> u16 {
    9280
}

fn default_https_port() -> u16 {
    9283
}

fn default_domains() -> Vec<String> {
    vec!["test".to_string()]
}

fn default_apps_dir() -> PathBuf {
    dirs_next::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".devgate")
}

fn default_command() -> String {
    "bundle exec puma --bind tcp://127.0.0.1:$PORT".to_string()
}

fn default_idle_timeout() -> u64 {
    900 // 15 minutes
}

fn default_startup_timeout() -> u64 {
    30
}

fn default_stop_grace_period() -> u64 {
    5
}

fn default_reap_interval() -> u64 {
    10
}

fn default_ready_poll_interval() -> u64 {
    50
}

fn default_output_tail_lines() -> usize {
    50
}

fn default_ca_dir() -> PathBuf {
    dirs_next::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("devgate")
}

fn default_leaf_validity_days() -> u64 {
    30
}

fn default_ca_validity_days() -> u64 {
    3650
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.server.http_port == 0 {
            errors.push("server.http_port must be greater than 0".to_string());
        }
        if self.server.http_port == self.server.https_port {
            errors.push("server.http_port and server.https_port must differ".to_string());
        }
        if self.server.domains.is_empty() {
            errors.push("server.domains must list at least one domain".to_string());
        }
        for domain in &self.server.domains {
            let trimmed = domain.trim_matches('.');
            if trimmed.is_empty()
                || !trimmed
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
            {
                errors.push(format!("server.domains: invalid domain '{}'", domain));
            }
        }

        match shell_words::split(&self.apps.command) {
            Ok(words) if words.is_empty() => errors.push("apps.command must not be empty".to_string()),
            Ok(_) => {}
            Err(e) => errors.push(format!("apps.command: {}", e)),
        }
        if !(1..=MAX_STARTUP_TIMEOUT_SECS).contains(&self.apps.startup_timeout_secs) {
            errors.push(format!(
                "apps.startup_timeout_secs must be between 1 and {}",
                MAX_STARTUP_TIMEOUT_SECS
            ));
        }
        if self.apps.reap_interval_secs == 0 {
            errors.push("apps.reap_interval_secs must be greater than 0".to_string());
        }
        if self.apps.ready_poll_interval_ms == 0 {
            errors.push("apps.ready_poll_interval_ms must be greater than 0".to_string());
        }

        if !(1..=MAX_LEAF_VALIDITY_DAYS).contains(&self.tls.leaf_validity_days) {
            errors.push(format!(
                "tls.leaf_validity_days must be between 1 and {}",
                MAX_LEAF_VALIDITY_DAYS
            ));
        }
        if !(1..=MAX_CA_VALIDITY_DAYS).contains(&self.tls.ca_validity_days) {
            errors.push(format!(
                "tls.ca_validity_days must be between 1 and {}",
                MAX_CA_VALIDITY_DAYS
            ));
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }

    /// Domains normalized to lowercase without surrounding dots
    pub fn normalized_domains(&self) -> Vec<String> {
        self.server
            .domains
            .iter()
            .map(|d| d.trim_matches('.').to_ascii_lowercase())
            .collect()
    }
}
