//! Mixnode configuration
//!
//! All recognized options with their defaults. Everything is
//! hot-reloadable over the admin channel except `pool_size` and
//! `worker_threads`, which size structures at boot.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{MixnodeError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MixnodeConfig {
    /// Transport listen address
    pub listen_addr: SocketAddr,
    /// Directory holding keys.bin, relays.bin and the admin socket
    pub state_dir: PathBuf,
    /// Admin control socket; defaults to `<state_dir>/mixnode.sock`
    pub admin_socket_path: Option<PathBuf>,

    /// Number of frames in the buffer pool (boot-only)
    pub pool_size: usize,
    /// Pipeline worker tasks (boot-only)
    pub worker_threads: usize,

    /// Max packets per worker dequeue
    pub batch_size: usize,
    /// Ingress queue depth
    pub max_queue_depth: usize,
    /// Token-bucket refill rate
    pub target_throughput_pps: u64,
    /// Poisson distribution mean
    pub mean_delay_ms: u64,
    /// Delay clamp lower bound
    pub min_delay_ms: u64,
    /// Delay clamp upper bound
    pub max_delay_ms: u64,
    /// Key epoch length; scopes the replay set
    pub replay_window_secs: u64,
    /// Backpressure wait on the buffer pool
    pub acquire_timeout_ms: u64,
    /// Rate-limiter wait before an egress drop
    pub egress_timeout_ms: u64,
    /// Protocol gating: lowest accepted minor version
    pub min_supported_minor: u8,
    /// Relay table eviction
    pub relay_idle_timeout_secs: u64,
    /// Idle transport connection timeout
    pub connection_timeout_ms: u64,
    /// Bounded cooperative shutdown drain
    pub shutdown_window_secs: u64,
}

impl Default for MixnodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:9600".parse().expect("valid default addr"),
            state_dir: PathBuf::from("state"),
            admin_socket_path: None,
            pool_size: 1024,
            worker_threads: 4,
            batch_size: 256,
            max_queue_depth: 10_000,
            target_throughput_pps: 25_000,
            mean_delay_ms: 500,
            min_delay_ms: 50,
            max_delay_ms: 2000,
            replay_window_secs: 3600,
            acquire_timeout_ms: 50,
            egress_timeout_ms: 10,
            min_supported_minor: 0,
            relay_idle_timeout_secs: 900,
            connection_timeout_ms: 30_000,
            shutdown_window_secs: 5,
        }
    }
}

impl MixnodeConfig {
    /// Load from a JSON file; unknown fields are rejected by validation of
    /// the values, missing fields take defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| MixnodeError::Config(format!("read {}: {e}", path.display())))?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| MixnodeError::Config(format!("parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.pool_size == 0 {
            return Err(MixnodeError::Config("pool_size must be positive".into()));
        }
        if self.worker_threads == 0 {
            return Err(MixnodeError::Config(
                "worker_threads must be positive".into(),
            ));
        }
        if self.batch_size == 0 {
            return Err(MixnodeError::Config("batch_size must be positive".into()));
        }
        if self.max_queue_depth == 0 {
            return Err(MixnodeError::Config(
                "max_queue_depth must be positive".into(),
            ));
        }
        if self.target_throughput_pps == 0 {
            return Err(MixnodeError::Config(
                "target_throughput_pps must be positive".into(),
            ));
        }
        if self.mean_delay_ms == 0 {
            return Err(MixnodeError::Config("mean_delay_ms must be positive".into()));
        }
        if self.min_delay_ms > self.mean_delay_ms || self.mean_delay_ms > self.max_delay_ms {
            return Err(MixnodeError::Config(
                "delay bounds must satisfy min <= mean <= max".into(),
            ));
        }
        if self.replay_window_secs == 0 {
            return Err(MixnodeError::Config(
                "replay_window_secs must be positive".into(),
            ));
        }
        if self.min_supported_minor > 0x0F {
            return Err(MixnodeError::Config(
                "min_supported_minor must fit in a nibble".into(),
            ));
        }
        Ok(())
    }

    pub fn admin_socket(&self) -> PathBuf {
        self.admin_socket_path
            .clone()
            .unwrap_or_else(|| self.state_dir.join("mixnode.sock"))
    }

    pub fn keys_path(&self) -> PathBuf {
        self.state_dir.join("keys.bin")
    }

    pub fn relays_path(&self) -> PathBuf {
        self.state_dir.join("relays.bin")
    }

    pub fn mean_delay(&self) -> Duration {
        Duration::from_millis(self.mean_delay_ms)
    }

    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn egress_timeout(&self) -> Duration {
        Duration::from_millis(self.egress_timeout_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn shutdown_window(&self) -> Duration {
        Duration::from_secs(self.shutdown_window_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        MixnodeConfig::default().validate().unwrap();
    }

    #[test]
    fn test_delay_bounds_validation() {
        let above_mean = MixnodeConfig {
            min_delay_ms: 600,
            ..MixnodeConfig::default()
        };
        assert!(above_mean.validate().is_err());

        let below_mean = MixnodeConfig {
            max_delay_ms: 400,
            ..MixnodeConfig::default()
        };
        assert!(below_mean.validate().is_err());
    }

    #[test]
    fn test_zero_sizes_rejected() {
        let no_pool = MixnodeConfig {
            pool_size: 0,
            ..MixnodeConfig::default()
        };
        assert!(no_pool.validate().is_err());

        let no_workers = MixnodeConfig {
            worker_threads: 0,
            ..MixnodeConfig::default()
        };
        assert!(no_workers.validate().is_err());
    }

    #[test]
    fn test_load_partial_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"mean_delay_ms": 250, "pool_size": 64}"#).unwrap();

        let config = MixnodeConfig::load(&path).unwrap();
        assert_eq!(config.mean_delay_ms, 250);
        assert_eq!(config.pool_size, 64);
        // Untouched fields keep defaults
        assert_eq!(config.max_queue_depth, 10_000);
    }

    #[test]
    fn test_load_invalid_json_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{nonsense").unwrap();
        assert!(matches!(
            MixnodeConfig::load(&path),
            Err(MixnodeError::Config(_))
        ));
    }

    #[test]
    fn test_admin_socket_defaults_into_state_dir() {
        let config = MixnodeConfig::default();
        assert_eq!(config.admin_socket(), PathBuf::from("state/mixnode.sock"));
    }
}
