//! Recording session aggregate

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::rules::{merge_recording_rules, InterceptionRule, PathMethodRule};

/// Lifecycle status of a session
///
/// Transitions only move forward (RECORDING → STOPPING → STOPPED); ERROR is
/// reachable from anywhere.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    /// Sidecar injected, traffic flowing through it
    Recording,
    /// Teardown in progress
    Stopping,
    /// Torn down
    Stopped,
    /// A step failed; see the error message
    Error,
}

impl SessionStatus {
    fn rank(self) -> u8 {
        match self {
            Self::Recording => 0,
            Self::Stopping => 1,
            Self::Stopped => 2,
            Self::Error => 3,
        }
    }

    /// Whether moving from `self` to `next` keeps the lifecycle monotonic
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        next == Self::Error || (self != Self::Error && next.rank() >= self.rank())
    }

    /// True for STOPPED and ERROR
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Error)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Recording => write!(f, "RECORDING"),
            Self::Stopping => write!(f, "STOPPING"),
            Self::Stopped => write!(f, "STOPPED"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}

/// What a session does to the traffic it sees
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    /// Capture only
    #[default]
    Recording,
    /// Capture everything matched, short-circuit intercepted paths
    Hybrid,
    /// Short-circuit only (capturing intercepted exchanges is optional)
    Interception,
}

impl SessionKind {
    /// Prefix of generated session ids
    pub fn id_prefix(self) -> &'static str {
        match self {
            Self::Recording => "rec",
            Self::Hybrid => "hyb",
            Self::Interception => "int",
        }
    }

    /// Prefix of the config object name
    pub fn config_prefix(self) -> &'static str {
        match self {
            Self::Recording => "envoy-tap",
            Self::Hybrid => "envoy-hybrid",
            Self::Interception => "envoy-intercept",
        }
    }
}

/// One recording and/or interception session against a service
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RecordingSession {
    /// Globally unique id
    pub session_id: String,
    /// Session flavour
    #[serde(default)]
    pub kind: SessionKind,
    /// Target namespace
    pub namespace: String,
    /// Target service
    pub service_name: String,
    /// Target deployment
    pub deployment_name: String,
    /// Config object holding the proxy document
    pub config_object_name: String,
    /// Service target port before redirection; the only value written back on restore
    pub original_port: i32,
    /// Port traffic was redirected to
    pub proxy_port: i32,
    /// Lifecycle status
    pub status: SessionStatus,
    /// Effective recording rules (requested plus intercepted paths)
    #[serde(default)]
    pub recording_rules: Vec<PathMethodRule>,
    /// Recording rules the caller asked for, independent of interception
    #[serde(default)]
    pub requested_recording_rules: Vec<PathMethodRule>,
    /// Active interception rules
    #[serde(default)]
    pub interception_rules: Vec<InterceptionRule>,
    /// Capture intercepted exchanges (always true for recording and hybrid)
    #[serde(default = "default_true")]
    pub tap_enabled: bool,
    /// Capture file prefix inside the tap directory
    #[serde(default)]
    pub tap_prefix: String,
    /// Start time
    pub started_at: DateTime<Utc>,
    /// Time the session reached STOPPED or ERROR
    #[serde(default)]
    pub stopped_at: Option<DateTime<Utc>>,
    /// Requested duration
    #[serde(default)]
    pub duration_seconds: Option<u64>,
    /// When the auto-stop fires
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    /// Failure description when status is ERROR
    #[serde(default)]
    pub error_message: Option<String>,
}

fn default_true() -> bool {
    true
}

impl RecordingSession {
    /// Whether the session is still capturing
    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Recording
    }

    /// Recompute the effective recording rules from the requested rules and
    /// the interception rules (when captured)
    pub fn refresh_recording_rules(&mut self) {
        self.recording_rules = if self.tap_enabled {
            merge_recording_rules(&self.requested_recording_rules, &self.interception_rules)
        } else {
            merge_recording_rules(&self.requested_recording_rules, &[])
        };
    }

    /// True once nothing is left for the sidecar to do
    pub fn has_no_rules(&self) -> bool {
        self.requested_recording_rules.is_empty() && self.interception_rules.is_empty()
    }
}

/// Generate a session id: `<prefix>-YYYYMMDD-HHMMSS-<8 hex>`
pub fn generate_session_id(kind: SessionKind, now: DateTime<Utc>) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "{}-{}-{}",
        kind.id_prefix(),
        now.format("%Y%m%d-%H%M%S"),
        &suffix[..8]
    )
}

/// Name of the config object for a session, valid as a Kubernetes object name
pub fn config_object_name(kind: SessionKind, session_id: &str) -> String {
    let mut name = format!("{}-{}", kind.config_prefix(), session_id.to_ascii_lowercase());
    name.truncate(crate::MAX_OBJECT_NAME_LEN);
    name.trim_end_matches('-').to_string()
}
