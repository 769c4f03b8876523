//! Gateway configuration loading.
//!
//! TOML is the sole config source; no environment variable overrides.
//! Default config path: `/etc/sensor-gateway/gateway.toml`.
//!
//! # Required fields
//! - `schema_version = 1`
//! - `server.url`
//! - `queue.root_dir`

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/sensor-gateway/gateway.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config: {0}")]
    Read(#[from] std::io::Error),
    #[error("cannot parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

// ---------------------------------------------------------------------------
// Resolved config types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub schema_version: u32,
    pub server: ServerConfig,
    pub queue: QueueConfig,
    pub export: ExportConfig,
    pub distributor: DistributorConfig,
    pub status: StatusConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// WebSocket URL of the server endpoint.
    pub url: String,
    pub reconnect_delay: Duration,
    pub outputs_count: usize,
    pub resend_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Directory holding the index journal and the buffer files.
    pub root_dir: String,
    /// Soft cap on the directory size; `None` = unbounded.
    pub bytes_limit: Option<u64>,
    pub never_drop_oldest: bool,
    pub disable_gc: bool,
}

#[derive(Debug, Clone)]
pub struct ExportConfig {
    pub active_count: usize,
    pub acquire_timeout: Duration,
    pub send_failed_delay: Duration,
}

#[derive(Debug, Clone)]
pub struct DistributorConfig {
    pub dead_timeout: Duration,
    pub idle_timeout: Duration,
    pub queue_capacity: usize,
    pub batch_size: usize,
    pub threshold: u32,
}

#[derive(Debug, Clone)]
pub struct StatusConfig {
    pub idle_duration: Duration,
    pub wait_timeout: Duration,
    pub repeat_timeout: Duration,
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    schema_version: Option<u32>,
    server: Option<RawServerConfig>,
    queue: Option<RawQueueConfig>,
    export: Option<RawExportConfig>,
    distributor: Option<RawDistributorConfig>,
    status: Option<RawStatusConfig>,
}

#[derive(Debug, Deserialize)]
struct RawServerConfig {
    url: Option<String>,
    reconnect_delay_secs: Option<u64>,
    outputs_count: Option<usize>,
    resend_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawQueueConfig {
    root_dir: Option<String>,
    bytes_limit: Option<u64>,
    never_drop_oldest: Option<bool>,
    disable_gc: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct RawExportConfig {
    active_count: Option<usize>,
    acquire_timeout_secs: Option<u64>,
    send_failed_delay_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawDistributorConfig {
    dead_timeout_secs: Option<u64>,
    idle_timeout_secs: Option<u64>,
    queue_capacity: Option<usize>,
    batch_size: Option<usize>,
    threshold: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct RawStatusConfig {
    idle_secs: Option<u64>,
    wait_ms: Option<u64>,
    repeat_secs: Option<u64>,
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

pub fn load_config() -> Result<GatewayConfig, ConfigError> {
    load_config_from(Path::new(DEFAULT_CONFIG_PATH))
}

pub fn load_config_from(path: &Path) -> Result<GatewayConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    parse_config(&contents)
}

pub fn parse_config(contents: &str) -> Result<GatewayConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(contents)?;

    let schema_version = raw
        .schema_version
        .ok_or_else(|| ConfigError::Invalid("schema_version is required".into()))?;
    if schema_version != 1 {
        return Err(ConfigError::Invalid(format!(
            "unsupported schema_version {schema_version}"
        )));
    }

    let raw_server = raw
        .server
        .ok_or_else(|| ConfigError::Invalid("[server] section is required".into()))?;
    let url = raw_server
        .url
        .filter(|u| !u.trim().is_empty())
        .ok_or_else(|| ConfigError::Invalid("server.url is required".into()))?;
    if !url.starts_with("ws://") && !url.starts_with("wss://") {
        return Err(ConfigError::Invalid(format!(
            "server.url must be a ws:// or wss:// URL, got '{url}'"
        )));
    }

    let raw_queue = raw
        .queue
        .ok_or_else(|| ConfigError::Invalid("[queue] section is required".into()))?;
    let root_dir = raw_queue
        .root_dir
        .filter(|d| !d.trim().is_empty())
        .ok_or_else(|| ConfigError::Invalid("queue.root_dir is required".into()))?;

    let raw_export = raw.export;
    let raw_distributor = raw.distributor;
    let raw_status = raw.status;

    let config = GatewayConfig {
        schema_version,
        server: ServerConfig {
            url,
            reconnect_delay: Duration::from_secs(
                raw_server.reconnect_delay_secs.unwrap_or(10),
            ),
            outputs_count: raw_server.outputs_count.unwrap_or(4).max(1),
            resend_timeout: Duration::from_secs(raw_server.resend_timeout_secs.unwrap_or(10)),
        },
        queue: QueueConfig {
            root_dir,
            bytes_limit: raw_queue.bytes_limit,
            never_drop_oldest: raw_queue.never_drop_oldest.unwrap_or(false),
            disable_gc: raw_queue.disable_gc.unwrap_or(false),
        },
        export: ExportConfig {
            active_count: raw_export
                .as_ref()
                .and_then(|e| e.active_count)
                .unwrap_or(10)
                .max(1),
            acquire_timeout: Duration::from_secs(
                raw_export
                    .as_ref()
                    .and_then(|e| e.acquire_timeout_secs)
                    .unwrap_or(5),
            ),
            send_failed_delay: Duration::from_secs(
                raw_export
                    .as_ref()
                    .and_then(|e| e.send_failed_delay_secs)
                    .unwrap_or(5),
            ),
        },
        distributor: DistributorConfig {
            dead_timeout: Duration::from_secs(
                raw_distributor
                    .as_ref()
                    .and_then(|d| d.dead_timeout_secs)
                    .unwrap_or(10),
            ),
            idle_timeout: Duration::from_secs(
                raw_distributor
                    .as_ref()
                    .and_then(|d| d.idle_timeout_secs)
                    .unwrap_or(5),
            ),
            queue_capacity: raw_distributor
                .as_ref()
                .and_then(|d| d.queue_capacity)
                .unwrap_or(1000),
            batch_size: raw_distributor
                .as_ref()
                .and_then(|d| d.batch_size)
                .unwrap_or(30),
            threshold: raw_distributor
                .as_ref()
                .and_then(|d| d.threshold)
                .unwrap_or(10),
        },
        status: StatusConfig {
            idle_duration: Duration::from_secs(
                raw_status.as_ref().and_then(|s| s.idle_secs).unwrap_or(1800),
            ),
            wait_timeout: Duration::from_millis(
                raw_status.as_ref().and_then(|s| s.wait_ms).unwrap_or(1000),
            ),
            repeat_timeout: Duration::from_secs(
                raw_status.as_ref().and_then(|s| s.repeat_secs).unwrap_or(300),
            ),
        },
    };

    Ok(config)
}
