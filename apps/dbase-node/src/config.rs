use std::env;
use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

use crate::transport::chunk::ChunkConfig;

pub const DEFAULT_RELAY_URL: &str = "ws://127.0.0.1:8000";
pub const DEFAULT_STORE_DIR: &str = "peer_store";

/// dbase node configuration, assembled from `DBASE_*` variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Relay base url; the channel connects to `{relay_url}/ws/{peer_id}`.
    pub relay_url: String,
    /// TURN credential endpoint. `None` means public STUN only.
    pub credentials_url: Option<String>,
    pub signaling: SignalingConfig,
    pub chunk: ChunkConfig,
    pub transfer: TransferConfig,
    pub store_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalingConfig {
    pub heartbeat_interval: Duration,
    pub reconnect_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub connect_timeout: Duration,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(5),
            max_reconnect_attempts: 10,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferConfig {
    pub retries: u32,
    pub open_poll_attempts: u32,
    pub open_poll_interval: Duration,
    /// Data channel buffered-amount ceiling before a send waits.
    pub high_watermark: usize,
    pub backpressure_timeout: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            retries: 3,
            open_poll_attempts: 10,
            open_poll_interval: Duration::from_millis(500),
            high_watermark: 1024 * 1024,
            backpressure_timeout: Duration::from_secs(30),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            relay_url: DEFAULT_RELAY_URL.to_string(),
            credentials_url: None,
            signaling: SignalingConfig::default(),
            chunk: ChunkConfig::default(),
            transfer: TransferConfig::default(),
            store_dir: PathBuf::from(DEFAULT_STORE_DIR),
        }
    }
}

impl Config {
    /// Load configuration from environment variables. Call `dotenvy::dotenv()` first
    /// if a `.env` file should be honoured.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let signaling = SignalingConfig {
            heartbeat_interval: env_secs(
                "DBASE_HEARTBEAT_SECS",
                defaults.signaling.heartbeat_interval,
            ),
            reconnect_delay: env_secs("DBASE_RECONNECT_DELAY_SECS", defaults.signaling.reconnect_delay),
            max_reconnect_attempts: env_usize(
                "DBASE_MAX_RECONNECT_ATTEMPTS",
                defaults.signaling.max_reconnect_attempts as usize,
                0,
            ) as u32,
            connect_timeout: env_secs("DBASE_CONNECT_TIMEOUT_SECS", defaults.signaling.connect_timeout),
        };
        let transfer = TransferConfig {
            retries: env_usize("DBASE_SEND_RETRIES", defaults.transfer.retries as usize, 1) as u32,
            open_poll_attempts: env_usize(
                "DBASE_OPEN_POLL_ATTEMPTS",
                defaults.transfer.open_poll_attempts as usize,
                1,
            ) as u32,
            open_poll_interval: Duration::from_millis(env_usize(
                "DBASE_OPEN_POLL_INTERVAL_MS",
                defaults.transfer.open_poll_interval.as_millis() as usize,
                1,
            ) as u64),
            high_watermark: env_usize("DBASE_HIGH_WATERMARK_BYTES", defaults.transfer.high_watermark, 1),
            backpressure_timeout: env_secs(
                "DBASE_BACKPRESSURE_TIMEOUT_SECS",
                defaults.transfer.backpressure_timeout,
            ),
        };

        Self {
            relay_url: env_string("DBASE_RELAY_URL").unwrap_or(defaults.relay_url),
            credentials_url: env_string("DBASE_TURN_CREDENTIALS_URL"),
            signaling,
            chunk: ChunkConfig::from_env(),
            transfer,
            store_dir: env_string("DBASE_STORE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.store_dir),
        }
    }
}

fn env_string(var: &str) -> Option<String> {
    env::var(var)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_secs(var: &str, default: Duration) -> Duration {
    Duration::from_secs(env_usize(var, default.as_secs() as usize, 1) as u64)
}

/// Reads a numeric variable, falling back to `default` when it is missing,
/// unparsable or below `min`.
pub(crate) fn env_usize(var: &str, default: usize, min: usize) -> usize {
    match env::var(var) {
        Ok(value) => match value.trim().parse::<usize>() {
            Ok(parsed) if parsed >= min => parsed,
            Ok(parsed) => {
                warn!(
                    target: "dbase::config",
                    var, parsed, min, default, "config value below minimum; using default"
                );
                default
            }
            Err(err) => {
                warn!(
                    target: "dbase::config",
                    var,
                    error = %err,
                    default,
                    "failed to parse config value from env; using default"
                );
                default
            }
        },
        Err(_) => default,
    }
}

#[cfg(test)]
pub(crate) static ENV_MUTEX: std::sync::LazyLock<std::sync::Mutex<()>> =
    std::sync::LazyLock::new(|| std::sync::Mutex::new(()));

#[cfg(test)]
mod tests {
    use super::*;

    const VARS: &[&str] = &[
        "DBASE_RELAY_URL",
        "DBASE_TURN_CREDENTIALS_URL",
        "DBASE_SEND_RETRIES",
        "DBASE_OPEN_POLL_INTERVAL_MS",
        "DBASE_MAX_CHUNK_BYTES",
        "DBASE_STORE_DIR",
    ];

    fn clear_vars() {
        for var in VARS {
            unsafe {
                env::remove_var(var);
            }
        }
    }

    #[test]
    fn defaults_without_env() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_vars();
        let config = Config::from_env();
        assert_eq!(config.relay_url, DEFAULT_RELAY_URL);
        assert_eq!(config.credentials_url, None);
        assert_eq!(config.transfer.retries, 3);
        assert_eq!(config.transfer.open_poll_attempts, 10);
        assert_eq!(config.signaling.max_reconnect_attempts, 10);
        assert_eq!(config.chunk.max_chunk_bytes, 16 * 1024);
    }

    #[test]
    fn env_overrides_and_bad_values_fall_back() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_vars();
        unsafe {
            env::set_var("DBASE_RELAY_URL", "wss://relay.example");
            env::set_var("DBASE_TURN_CREDENTIALS_URL", "  ");
            env::set_var("DBASE_SEND_RETRIES", "5");
            env::set_var("DBASE_OPEN_POLL_INTERVAL_MS", "not-a-number");
            env::set_var("DBASE_MAX_CHUNK_BYTES", "8");
            env::set_var("DBASE_STORE_DIR", "/tmp/dbase");
        }
        let config = Config::from_env();
        assert_eq!(config.relay_url, "wss://relay.example");
        assert_eq!(config.credentials_url, None);
        assert_eq!(config.transfer.retries, 5);
        assert_eq!(config.transfer.open_poll_interval, Duration::from_millis(500));
        assert_eq!(config.chunk.max_chunk_bytes, 16 * 1024);
        assert_eq!(config.store_dir, PathBuf::from("/tmp/dbase"));
        clear_vars();
    }
}
