use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::pool::{PoolEndpoint, MAX_MESSAGE_BYTES};

pub const DEFAULT_POOL_ADDRESS: &str = "127.0.0.1";
pub const DEFAULT_POOL_PORT: u16 = 5000;
pub const DEFAULT_TICKS_PER_SECOND: u32 = 10;
pub const DEFAULT_CACHE_DIR: &str = "cache";

/// Display metadata the node announces to the pool.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeMeta {
    pub name: String,
    pub description: String,
    pub version: String,
    pub picture: Option<String>,
}

impl Default for NodeMeta {
    fn default() -> Self {
        Self {
            name: "OpenAgents Node".to_string(),
            description: "A new OpenAgents Node".to_string(),
            version: "0.0.1".to_string(),
            picture: None,
        }
    }
}

impl NodeMeta {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_picture(mut self, picture: impl Into<String>) -> Self {
        self.picture = Some(picture.into());
        self
    }

    /// Apply `NODE_NAME`, `NODE_DESCRIPTION`, `NODE_VERSION` and
    /// `NODE_PICTURE` overrides.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(name) = non_empty(lookup("NODE_NAME")) {
            self.name = name;
        }
        if let Some(description) = non_empty(lookup("NODE_DESCRIPTION")) {
            self.description = description;
        }
        if let Some(version) = non_empty(lookup("NODE_VERSION")) {
            self.version = version;
        }
        if let Some(picture) = non_empty(lookup("NODE_PICTURE")) {
            self.picture = Some(picture);
        }
    }
}

/// Pool connection settings read from configuration.
///
/// Unset fields fall back to the defaults when the endpoint is resolved.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub address: Option<String>,
    pub port: Option<u16>,
    pub ssl: Option<bool>,
    pub auth_token: Option<String>,
}

impl std::fmt::Debug for PoolConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolConfig")
            .field("address", &self.address)
            .field("port", &self.port)
            .field("ssl", &self.ssl)
            .field("auth_token_set", &self.auth_token.is_some())
            .finish()
    }
}

/// Timer settings of the runtime loops.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeTimings {
    /// Cadence of the announce loop in milliseconds.
    pub announce_interval_ms: u64,
    /// Cadence at which new runners get a poll task, in milliseconds.
    pub scheduler_interval_ms: u64,
    /// Lifetime of a local job lock in milliseconds.
    pub lock_ttl_ms: u64,
    /// Long-poll budget for pending jobs in milliseconds.
    pub poll_wait_ms: u64,
    /// Pause after a failed poll cycle in milliseconds.
    pub error_backoff_ms: u64,
    /// Server-side wait per sub-job status call in milliseconds.
    pub sub_job_wait_ms: u64,
    /// Pause between sub-job status calls in milliseconds.
    pub sub_job_poll_interval_ms: u64,
    /// How long shutdown waits for spawned tasks before aborting them, in
    /// milliseconds.
    pub shutdown_grace_ms: u64,
}

impl Default for RuntimeTimings {
    fn default() -> Self {
        Self {
            announce_interval_ms: 5_000,
            scheduler_interval_ms: 1_000,
            lock_ttl_ms: 60_000,
            poll_wait_ms: 60_000,
            error_backoff_ms: 5_000,
            sub_job_wait_ms: 1_000,
            sub_job_poll_interval_ms: 100,
            shutdown_grace_ms: 30_000,
        }
    }
}

impl RuntimeTimings {
    pub fn announce_interval(&self) -> Duration {
        Duration::from_millis(self.announce_interval_ms)
    }

    pub fn scheduler_interval(&self) -> Duration {
        Duration::from_millis(self.scheduler_interval_ms)
    }

    pub fn lock_ttl(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.lock_ttl_ms as i64)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }

    pub fn sub_job_poll_interval(&self) -> Duration {
        Duration::from_millis(self.sub_job_poll_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Configuration of a node process.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub meta: NodeMeta,
    pub pool: PoolConfig,
    /// Root directory of the local cache tier.
    pub cache_dir: PathBuf,
    /// Tick-loop rate; `None` uses the default of 10 per second.
    pub ticks_per_second: Option<u32>,
    pub timings: RuntimeTimings,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            meta: NodeMeta::default(),
            pool: PoolConfig::default(),
            cache_dir: PathBuf::from(DEFAULT_CACHE_DIR),
            ticks_per_second: None,
            timings: RuntimeTimings::default(),
        }
    }
}

impl NodeConfig {
    pub fn new(meta: NodeMeta) -> Self {
        Self {
            meta,
            ..Default::default()
        }
    }

    /// Build a configuration from the process environment.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok());
        config
    }

    /// Overlay values from a key lookup (normally the environment).
    ///
    /// Reads `POOL_ADDRESS`, `POOL_PORT`, `POOL_SSL`, `NODE_TOKEN`, `NODE_TPS`,
    /// `CACHE_PATH` and the node metadata keys. Unparseable numbers are
    /// ignored with a warning.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        self.meta.apply_overrides(&lookup);

        if let Some(address) = non_empty(lookup("POOL_ADDRESS")) {
            self.pool.address = Some(address);
        }
        if let Some(port) = non_empty(lookup("POOL_PORT")) {
            match port.parse() {
                Ok(port) => self.pool.port = Some(port),
                Err(err) => tracing::warn!(%port, "ignoring POOL_PORT: {err}"),
            }
        }
        if let Some(ssl) = non_empty(lookup("POOL_SSL")) {
            self.pool.ssl = Some(ssl == "true");
        }
        if let Some(token) = non_empty(lookup("NODE_TOKEN")) {
            self.pool.auth_token = Some(token);
        }
        if let Some(tps) = non_empty(lookup("NODE_TPS")) {
            match tps.parse::<u32>() {
                Ok(tps) if tps > 0 => self.ticks_per_second = Some(tps),
                Ok(_) => tracing::warn!("ignoring NODE_TPS of zero"),
                Err(err) => tracing::warn!(%tps, "ignoring NODE_TPS: {err}"),
            }
        }
        if let Some(path) = non_empty(lookup("CACHE_PATH")) {
            self.cache_dir = PathBuf::from(path);
        }
    }

    pub fn with_pool_address(mut self, address: impl Into<String>) -> Self {
        self.pool.address = Some(address.into());
        self
    }

    pub fn with_pool_port(mut self, port: u16) -> Self {
        self.pool.port = Some(port);
        self
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.pool.auth_token = Some(token.into());
        self
    }

    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = dir.into();
        self
    }

    pub fn with_timings(mut self, timings: RuntimeTimings) -> Self {
        self.timings = timings;
        self
    }

    /// Resolve the pool endpoint: explicit option, then configuration, then
    /// default.
    pub fn resolve_endpoint(&self, options: &StartOptions) -> PoolEndpoint {
        PoolEndpoint {
            address: options
                .pool_address
                .clone()
                .or_else(|| self.pool.address.clone())
                .unwrap_or_else(|| DEFAULT_POOL_ADDRESS.to_string()),
            port: options
                .pool_port
                .or(self.pool.port)
                .unwrap_or(DEFAULT_POOL_PORT),
            ssl: options.pool_ssl.or(self.pool.ssl).unwrap_or(false),
            auth_token: self.pool.auth_token.clone(),
            max_message_bytes: MAX_MESSAGE_BYTES,
        }
    }

    /// Resolve the tick-loop interval with the same precedence.
    pub fn resolve_tick_interval(&self, options: &StartOptions) -> Duration {
        if let Some(interval) = options.tick_interval {
            return interval;
        }
        let tps = self
            .ticks_per_second
            .filter(|tps| *tps > 0)
            .unwrap_or(DEFAULT_TICKS_PER_SECOND);
        Duration::from_secs_f64(1.0 / f64::from(tps))
    }
}

/// Explicit arguments to [`NodeRuntime::start`](crate::runtime::NodeRuntime::start).
#[derive(Clone, Debug, Default)]
pub struct StartOptions {
    pub pool_address: Option<String>,
    pub pool_port: Option<u16>,
    pub pool_ssl: Option<bool>,
    pub tick_interval: Option<Duration>,
}

impl StartOptions {
    pub fn with_pool(mut self, address: impl Into<String>, port: u16) -> Self {
        self.pool_address = Some(address.into());
        self.pool_port = Some(port);
        self
    }

    pub fn with_ssl(mut self, ssl: bool) -> Self {
        self.pool_ssl = Some(ssl);
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = Some(interval);
        self
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_endpoint_defaults() {
        let endpoint = NodeConfig::default().resolve_endpoint(&StartOptions::default());
        assert_eq!(endpoint.address, DEFAULT_POOL_ADDRESS);
        assert_eq!(endpoint.port, DEFAULT_POOL_PORT);
        assert!(!endpoint.ssl);
        assert_eq!(endpoint.max_message_bytes, 20 * 1024 * 1024);
    }

    #[test]
    fn test_explicit_options_beat_configuration() {
        let mut config = NodeConfig::default();
        config.apply_overrides(lookup(&[
            ("POOL_ADDRESS", "pool.internal"),
            ("POOL_PORT", "6000"),
            ("POOL_SSL", "true"),
        ]));

        let from_config = config.resolve_endpoint(&StartOptions::default());
        assert_eq!(from_config.authority(), "pool.internal:6000");
        assert!(from_config.ssl);

        let explicit = StartOptions::default()
            .with_pool("10.0.0.2", 7000)
            .with_ssl(false);
        let resolved = config.resolve_endpoint(&explicit);
        assert_eq!(resolved.authority(), "10.0.0.2:7000");
        assert!(!resolved.ssl);
    }

    #[test]
    fn test_meta_overrides_applied_at_read() {
        let mut config = NodeConfig::new(NodeMeta::new("Tool Selector").with_version("1.2.0"));
        config.apply_overrides(lookup(&[("NODE_NAME", "renamed"), ("NODE_DESCRIPTION", "")]));
        assert_eq!(config.meta.name, "renamed");
        assert_eq!(config.meta.description, "A new OpenAgents Node");
        assert_eq!(config.meta.version, "1.2.0");
    }

    #[test]
    fn test_tick_interval_from_tps() {
        let mut config = NodeConfig::default();
        assert_eq!(
            config.resolve_tick_interval(&StartOptions::default()),
            Duration::from_millis(100)
        );

        config.apply_overrides(lookup(&[("NODE_TPS", "4")]));
        assert_eq!(
            config.resolve_tick_interval(&StartOptions::default()),
            Duration::from_millis(250)
        );

        config.apply_overrides(lookup(&[("NODE_TPS", "fast")]));
        assert_eq!(config.ticks_per_second, Some(4));

        let explicit = StartOptions::default().with_tick_interval(Duration::from_millis(20));
        assert_eq!(config.resolve_tick_interval(&explicit), Duration::from_millis(20));
    }

    #[test]
    fn test_token_and_cache_path_from_env() {
        let mut config = NodeConfig::default();
        config.apply_overrides(lookup(&[("NODE_TOKEN", "abc"), ("CACHE_PATH", "/tmp/node-cache")]));
        assert_eq!(config.pool.auth_token.as_deref(), Some("abc"));
        assert_eq!(config.cache_dir, PathBuf::from("/tmp/node-cache"));
        assert!(!format!("{:?}", config.pool).contains("abc"));
    }

    #[test]
    fn test_config_deserializes_with_defaults() {
        let config: NodeConfig =
            serde_json::from_str(r#"{"meta":{"name":"n"},"timings":{"lock_ttl_ms":5}}"#).unwrap();
        assert_eq!(config.meta.name, "n");
        assert_eq!(config.meta.version, "0.0.1");
        assert_eq!(config.timings.lock_ttl_ms, 5);
        assert_eq!(config.timings.poll_wait_ms, 60_000);
        assert_eq!(config.cache_dir, PathBuf::from("cache"));
    }
}
