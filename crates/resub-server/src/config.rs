use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, time::Duration};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Subscription engine limits and timers
    #[serde(default)]
    pub subscriptions: SubscriptionSettings,
    /// Notification payload compression
    #[serde(default)]
    pub compression: CompressionSettings,
    /// Multi-instance coordination through a shared store
    #[serde(default)]
    pub distributed: DistributedConfig,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.server.port == 0 {
            return Err("server.port must be > 0".into());
        }
        let lvl = self.logging.level.to_ascii_lowercase();
        let valid_levels = ["trace", "debug", "info", "warn", "error", "off"];
        if !valid_levels.contains(&lvl.as_str()) {
            return Err(format!("logging.level must be one of {valid_levels:?}"));
        }

        let subs = &self.subscriptions;
        if subs.max_subscriptions_per_connection == 0 {
            return Err("subscriptions.max_subscriptions_per_connection must be > 0".into());
        }
        if subs.subscription_cleanup_interval_secs == 0 {
            return Err("subscriptions.subscription_cleanup_interval_secs must be > 0".into());
        }
        if subs.max_concurrent_deliveries == 0 {
            return Err("subscriptions.max_concurrent_deliveries must be > 0".into());
        }
        if subs.max_queued_deliveries == 0 {
            return Err("subscriptions.max_queued_deliveries must be > 0".into());
        }
        if subs.delivery_timeout_ms == 0 {
            return Err("subscriptions.delivery_timeout_ms must be > 0".into());
        }
        if subs.list_page_size == 0 || subs.list_page_size > subs.max_list_page_size {
            return Err(
                "subscriptions.list_page_size must be > 0 and <= max_list_page_size".into(),
            );
        }

        if self.compression.compression_level > 9 {
            return Err("compression.compression_level must be between 0 and 9".into());
        }

        let dist = &self.distributed;
        if dist.enabled {
            if dist.redis_url.is_empty() {
                return Err("distributed.enabled=true requires distributed.redis_url".into());
            }
            if dist.heartbeat_interval_secs == 0 {
                return Err("distributed.heartbeat_interval_secs must be > 0".into());
            }
            if dist.instance_timeout_secs <= dist.heartbeat_interval_secs {
                return Err(
                    "distributed.instance_timeout_secs must be greater than heartbeat_interval_secs"
                        .into(),
                );
            }
        }
        Ok(())
    }

    pub fn addr(&self) -> SocketAddr {
        use std::net::{IpAddr, Ipv4Addr};
        let host: IpAddr = self
            .server
            .host
            .parse()
            .unwrap_or(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)));
        SocketAddr::from((host, self.server.port))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    8090
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionSettings {
    /// Master switch; when off every subscribe call is rejected
    #[serde(default = "default_true")]
    pub enable_subscriptions: bool,

    #[serde(default = "default_max_per_connection")]
    pub max_subscriptions_per_connection: usize,

    /// Idle time after which a subscription is swept
    #[serde(default = "default_subscription_ttl_secs")]
    pub subscription_ttl_secs: u64,

    #[serde(default = "default_cleanup_interval_secs")]
    pub subscription_cleanup_interval_secs: u64,

    /// Upper bound on deliveries running at the same time across all connections
    #[serde(default = "default_max_concurrent_deliveries")]
    pub max_concurrent_deliveries: usize,

    /// Jobs waiting on one connection's worker; further notifications are dropped
    #[serde(default = "default_max_queued_deliveries")]
    pub max_queued_deliveries: usize,

    /// Budget for one delivery attempt (payload read, transform, send)
    #[serde(default = "default_delivery_timeout_ms")]
    pub delivery_timeout_ms: u64,

    #[serde(default = "default_list_page_size")]
    pub list_page_size: usize,

    #[serde(default = "default_max_list_page_size")]
    pub max_list_page_size: usize,
}

fn default_true() -> bool {
    true
}
fn default_max_per_connection() -> usize {
    100
}
fn default_subscription_ttl_secs() -> u64 {
    3600
}
fn default_cleanup_interval_secs() -> u64 {
    300
}
fn default_max_concurrent_deliveries() -> usize {
    64
}
fn default_max_queued_deliveries() -> usize {
    1024
}
fn default_delivery_timeout_ms() -> u64 {
    5000
}
fn default_list_page_size() -> usize {
    50
}
fn default_max_list_page_size() -> usize {
    500
}

impl SubscriptionSettings {
    pub fn subscription_ttl(&self) -> Duration {
        Duration::from_secs(self.subscription_ttl_secs)
    }
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.subscription_cleanup_interval_secs)
    }
    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms)
    }
}

impl Default for SubscriptionSettings {
    fn default() -> Self {
        Self {
            enable_subscriptions: true,
            max_subscriptions_per_connection: default_max_per_connection(),
            subscription_ttl_secs: default_subscription_ttl_secs(),
            subscription_cleanup_interval_secs: default_cleanup_interval_secs(),
            max_concurrent_deliveries: default_max_concurrent_deliveries(),
            max_queued_deliveries: default_max_queued_deliveries(),
            delivery_timeout_ms: default_delivery_timeout_ms(),
            list_page_size: default_list_page_size(),
            max_list_page_size: default_max_list_page_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionSettings {
    #[serde(default = "default_true")]
    pub enable_websocket_compression: bool,

    /// Serialized payloads above this many bytes are compressed
    #[serde(default = "default_compression_threshold")]
    pub compression_threshold: usize,

    /// gzip level, 0-9
    #[serde(default = "default_compression_level")]
    pub compression_level: u32,
}

fn default_compression_threshold() -> usize {
    1024
}
fn default_compression_level() -> u32 {
    6
}

impl Default for CompressionSettings {
    fn default() -> Self {
        Self {
            enable_websocket_compression: true,
            compression_threshold: default_compression_threshold(),
            compression_level: default_compression_level(),
        }
    }
}

/// Distributed coordination configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributedConfig {
    /// Default: false (single-instance deployments)
    #[serde(default)]
    pub enabled: bool,

    /// Redis connection URL (e.g., "redis://localhost:6379")
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Generated at startup when not set
    #[serde(default)]
    pub server_instance_id: Option<String>,

    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,

    /// Instances silent for longer than this are considered dead
    #[serde(default = "default_instance_timeout_secs")]
    pub instance_timeout_secs: u64,

    #[serde(default = "default_redis_pool_size")]
    pub pool_size: usize,

    /// Ceiling for the reconnect backoff of the change listener
    #[serde(default = "default_max_reconnect_backoff_secs")]
    pub max_reconnect_backoff_secs: u64,
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}
fn default_heartbeat_interval_secs() -> u64 {
    10
}
fn default_instance_timeout_secs() -> u64 {
    30
}
fn default_redis_pool_size() -> usize {
    8
}
fn default_max_reconnect_backoff_secs() -> u64 {
    60
}

impl DistributedConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
    pub fn instance_timeout(&self) -> Duration {
        Duration::from_secs(self.instance_timeout_secs)
    }
    pub fn max_reconnect_backoff(&self) -> Duration {
        Duration::from_secs(self.max_reconnect_backoff_secs)
    }
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            redis_url: default_redis_url(),
            server_instance_id: None,
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            instance_timeout_secs: default_instance_timeout_secs(),
            pool_size: default_redis_pool_size(),
            max_reconnect_backoff_secs: default_max_reconnect_backoff_secs(),
        }
    }
}

pub mod loader {
    use super::AppConfig;
    use config::{Config, Environment, File};
    use std::path::PathBuf;

    pub fn load_config(path: Option<&str>) -> Result<AppConfig, String> {
        let mut builder = Config::builder();
        match path {
            Some(p) => {
                let pathbuf = PathBuf::from(p);
                if pathbuf.exists() {
                    builder = builder.add_source(File::from(pathbuf));
                }
            }
            None => {
                let default_path = PathBuf::from("resub.toml");
                if default_path.exists() {
                    builder = builder.add_source(File::from(default_path));
                }
            }
        }
        // Environment variable overrides, e.g., RESUB__SERVER__PORT=9090
        builder = builder.add_source(
            Environment::with_prefix("RESUB")
                .try_parsing(true)
                .separator("__"),
        );
        let cfg = builder
            .build()
            .map_err(|e| format!("config build error: {e}"))?;
        let merged: AppConfig = cfg
            .try_deserialize()
            .map_err(|e| format!("config deserialize error: {e}"))?;
        merged.validate()?;
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = AppConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.subscriptions.delivery_timeout(), Duration::from_secs(5));
        assert_eq!(cfg.compression.compression_threshold, 1024);
        assert!(!cfg.distributed.enabled);
    }

    #[test]
    fn rejects_zero_subscription_cap() {
        let mut cfg = AppConfig::default();
        cfg.subscriptions.max_subscriptions_per_connection = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_zero_delivery_queue() {
        let mut cfg = AppConfig::default();
        cfg.subscriptions.max_queued_deliveries = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_instance_timeout_not_above_heartbeat() {
        let mut cfg = AppConfig::default();
        cfg.distributed.enabled = true;
        cfg.distributed.heartbeat_interval_secs = 10;
        cfg.distributed.instance_timeout_secs = 10;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn partial_config_falls_back_to_defaults() {
        let cfg: AppConfig = from_json(
            r#"{"subscriptions": {"max_subscriptions_per_connection": 3}, "compression": {"compression_level": 9}}"#,
        );
        assert_eq!(cfg.subscriptions.max_subscriptions_per_connection, 3);
        assert_eq!(cfg.subscriptions.subscription_ttl_secs, 3600);
        assert_eq!(cfg.subscriptions.max_queued_deliveries, 1024);
        assert_eq!(cfg.compression.compression_level, 9);
        assert!(cfg.validate().is_ok());
    }

    fn from_json(json: &str) -> AppConfig {
        serde_json::from_str(json).unwrap()
    }
}
