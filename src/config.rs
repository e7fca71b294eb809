//! Static control-plane configuration
//!
//! Loaded once at startup from an optional YAML file; anything missing falls
//! back to the defaults below. Nothing here is renegotiated at runtime.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::Error;

/// Top-level configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ControlPlaneConfig {
    /// Sidecar proxy settings
    pub envoy: EnvoySettings,
    /// Capture harvesting settings
    pub collector: CollectorSettings,
    /// Session/entry store settings
    pub store: StoreSettings,
    /// Session lifecycle timing
    pub session: SessionSettings,
    /// HTTP surface settings
    pub api: ApiSettings,
}

impl ControlPlaneConfig {
    /// Load configuration from a YAML file
    pub fn from_file(path: &Path) -> Result<Self, Error> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::internal_with_context(
                "load_config",
                format!("failed to read {}: {}", path.display(), e),
            )
        })?;
        Self::from_yaml(&raw)
    }

    /// Parse configuration from YAML text
    pub fn from_yaml(raw: &str) -> Result<Self, Error> {
        serde_yaml::from_str(raw).map_err(|e| Error::serialization(e.to_string()))
    }
}

/// Sidecar proxy settings
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct EnvoySettings {
    /// Proxy image reference
    pub image: String,
    /// Name of the injected container
    pub container_name: String,
    /// Inbound listener port traffic is redirected to
    pub listener_port: u16,
    /// Admin listener port
    pub admin_port: u16,
    /// Directory inside the sidecar where capture files are written
    pub tap_dir: String,
    /// Per-capture byte ceiling for buffered request/response bodies
    pub max_buffered_bytes: u64,
    /// Proxy log level
    pub log_level: String,
    /// CPU request
    pub cpu_request: String,
    /// Memory request
    pub memory_request: String,
    /// CPU limit
    pub cpu_limit: String,
    /// Memory limit
    pub memory_limit: String,
}

impl Default for EnvoySettings {
    fn default() -> Self {
        Self {
            image: "envoyproxy/envoy:v1.28.3".to_string(),
            container_name: "envoy".to_string(),
            listener_port: 15006,
            admin_port: 9901,
            tap_dir: "/var/log/envoy/taps".to_string(),
            max_buffered_bytes: 2 * 1024 * 1024,
            log_level: "info".to_string(),
            cpu_request: "50m".to_string(),
            memory_request: "128Mi".to_string(),
            cpu_limit: "1".to_string(),
            memory_limit: "512Mi".to_string(),
        }
    }
}

/// Capture harvesting settings
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct CollectorSettings {
    /// Label key selecting a service's pods (`<key>=<service>`)
    pub pod_label_key: String,
    /// Attempts at reading a capture file that comes back empty
    pub read_retry_max: u32,
    /// Fixed sleep between read attempts, in milliseconds
    pub read_retry_sleep_ms: u64,
    /// Attempts for a transiently failing exec
    pub exec_retry_max: u32,
    /// Base sleep between exec attempts, in milliseconds
    pub exec_retry_sleep_ms: u64,
    /// Body ceiling in characters; longer bodies are truncated and flagged
    pub max_body_bytes: usize,
    /// Maximum capture files read concurrently per pod
    pub concurrency: usize,
    /// Local directory for raw capture exports
    pub export_dir: PathBuf,
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self {
            pod_label_key: "app".to_string(),
            read_retry_max: 5,
            read_retry_sleep_ms: 300,
            exec_retry_max: 3,
            exec_retry_sleep_ms: 500,
            max_body_bytes: crate::MAX_BODY_BYTES,
            concurrency: 18,
            export_dir: PathBuf::from("./tap-export"),
        }
    }
}

impl CollectorSettings {
    /// Sleep between read attempts
    pub fn read_retry_sleep(&self) -> Duration {
        Duration::from_millis(self.read_retry_sleep_ms)
    }

    /// Base sleep between exec attempts
    pub fn exec_retry_sleep(&self) -> Duration {
        Duration::from_millis(self.exec_retry_sleep_ms)
    }
}

/// Which store backend to use
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackendKind {
    /// Process-local store; sessions do not survive restarts
    #[default]
    Memory,
    /// Redis store (requires the `redis` feature)
    Redis,
}

/// Session/entry store settings
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct StoreSettings {
    /// Backend selection
    pub backend: StoreBackendKind,
    /// Redis connection URL
    pub redis_url: String,
    /// TTL refreshed on every session write, in seconds
    pub session_ttl_secs: u64,
    /// TTL on entry lists and processed-file markers, in seconds
    pub entry_ttl_secs: u64,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            backend: StoreBackendKind::Memory,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            session_ttl_secs: crate::DEFAULT_STORE_TTL.as_secs(),
            entry_ttl_secs: crate::DEFAULT_STORE_TTL.as_secs(),
        }
    }
}

impl StoreSettings {
    /// Session record TTL
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    /// Entry/marker TTL
    pub fn entry_ttl(&self) -> Duration {
        Duration::from_secs(self.entry_ttl_secs)
    }
}

/// Session lifecycle timing
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionSettings {
    /// Duration applied when a caller passes none and `apply_default_duration` is set
    pub default_duration_secs: u64,
    /// Arm an auto-stop with `default_duration_secs` when no duration is given
    pub apply_default_duration: bool,
    /// Hard ceiling for "wait until ready" after inject/remove
    pub rollout_timeout_secs: u64,
    /// Best-effort ceiling for "rollout has started"
    pub rollout_start_timeout_secs: u64,
    /// Poll interval for rollout waits, in milliseconds
    pub poll_interval_ms: u64,
    /// Attempt ceiling for conflict retries
    pub conflict_max_attempts: u32,
    /// Initial conflict backoff (doubled per attempt), in milliseconds
    pub conflict_backoff_ms: u64,
    /// Background harvest period, in seconds
    pub auto_collect_interval_secs: u64,
    /// Sessions younger than this are skipped by the background harvest, in seconds
    pub auto_collect_min_age_secs: u64,
    /// Tear down cluster state left behind by sessions no longer in the store
    pub reconcile_orphans: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            default_duration_secs: 600,
            apply_default_duration: false,
            rollout_timeout_secs: 300,
            rollout_start_timeout_secs: 30,
            poll_interval_ms: 1000,
            conflict_max_attempts: 3,
            conflict_backoff_ms: 1000,
            auto_collect_interval_secs: 30,
            auto_collect_min_age_secs: 20,
            reconcile_orphans: false,
        }
    }
}

impl SessionSettings {
    /// Ceiling for the synchronous readiness wait
    pub fn rollout_timeout(&self) -> Duration {
        Duration::from_secs(self.rollout_timeout_secs)
    }

    /// Ceiling for the rollout-started wait
    pub fn rollout_start_timeout(&self) -> Duration {
        Duration::from_secs(self.rollout_start_timeout_secs)
    }

    /// Poll interval for rollout waits
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Conflict retry policy for cluster writes
    pub fn conflict_retry(&self) -> crate::retry::RetryConfig {
        crate::retry::RetryConfig::conflict_with(
            self.conflict_max_attempts,
            Duration::from_millis(self.conflict_backoff_ms),
        )
    }

    /// Background harvest period
    pub fn auto_collect_interval(&self) -> Duration {
        Duration::from_secs(self.auto_collect_interval_secs)
    }

    /// Minimum session age for background harvest
    pub fn auto_collect_min_age(&self) -> Duration {
        Duration::from_secs(self.auto_collect_min_age_secs)
    }
}

/// HTTP surface settings
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ApiSettings {
    /// Listen address
    pub bind_address: String,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            bind_address: format!("0.0.0.0:{}", crate::DEFAULT_API_PORT),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = ControlPlaneConfig::default();
        assert_eq!(config.envoy.image, "envoyproxy/envoy:v1.28.3");
        assert_eq!(config.envoy.listener_port, 15006);
        assert_eq!(config.envoy.admin_port, 9901);
        assert_eq!(config.envoy.max_buffered_bytes, 2_097_152);
        assert_eq!(config.collector.max_body_bytes, 10_240);
        assert_eq!(config.store.session_ttl(), Duration::from_secs(7 * 24 * 3600));
        assert_eq!(config.session.rollout_timeout(), Duration::from_secs(300));
        assert!(!config.session.reconcile_orphans);
    }

    #[test]
    fn partial_yaml_overrides_only_given_fields() {
        let yaml = r#"
envoy:
  image: registry.local/envoy:v1.30.0
  listenerPort: 16000
collector:
  readRetryMax: 2
store:
  backend: redis
  redisUrl: redis://redis.infra:6379
session:
  reconcileOrphans: true
"#;
        let config = ControlPlaneConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.envoy.image, "registry.local/envoy:v1.30.0");
        assert_eq!(config.envoy.listener_port, 16000);
        assert_eq!(config.envoy.admin_port, 9901);
        assert_eq!(config.collector.read_retry_max, 2);
        assert_eq!(config.collector.concurrency, 18);
        assert_eq!(config.store.backend, StoreBackendKind::Redis);
        assert!(config.session.reconcile_orphans);
    }

    #[test]
    fn malformed_yaml_is_a_serialization_error() {
        let err = ControlPlaneConfig::from_yaml("envoy: [not, a, map]").unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));
    }

    #[test]
    fn config_file_loads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meshtap.yaml");
        std::fs::write(&path, "api:\n  bindAddress: 127.0.0.1:9000\n").unwrap();

        let config = ControlPlaneConfig::from_file(&path).unwrap();
        assert_eq!(config.api.bind_address, "127.0.0.1:9000");
    }
}
