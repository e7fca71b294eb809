//! Session request and view types

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::model::{InterceptionRule, PathMethodRule, RecordingSession};
use crate::sidecar::{DeploymentHealth, ServiceHealth};

/// Start a record-only session
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StartRecordingRequest {
    /// Target namespace
    pub namespace: String,
    /// Target service
    pub service_name: String,
    /// Deployment behind the service; defaults to the service name
    #[serde(default)]
    pub deployment_name: Option<String>,
    /// Paths to capture
    pub rules: Vec<PathMethodRule>,
    /// Auto-stop after this many seconds
    #[serde(default)]
    pub duration_seconds: Option<u64>,
}

/// Start a session that records and intercepts at once
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StartHybridRequest {
    /// Target namespace
    pub namespace: String,
    /// Target service
    pub service_name: String,
    /// Deployment behind the service; defaults to the service name
    #[serde(default)]
    pub deployment_name: Option<String>,
    /// Paths to capture in addition to the intercepted ones
    #[serde(default)]
    pub recording_rules: Vec<PathMethodRule>,
    /// Paths to answer with a mock
    #[serde(default)]
    pub interception_rules: Vec<InterceptionRule>,
    /// Auto-stop after this many seconds
    #[serde(default)]
    pub duration_seconds: Option<u64>,
}

/// Start (or extend) an interception session
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StartInterceptionRequest {
    /// Target namespace
    pub namespace: String,
    /// Target service
    pub service_name: String,
    /// Deployment behind the service; defaults to the service name
    #[serde(default)]
    pub deployment_name: Option<String>,
    /// Paths to answer with a mock
    pub rules: Vec<InterceptionRule>,
    /// Also capture the intercepted exchanges
    #[serde(default)]
    pub tap_enabled: bool,
    /// Auto-stop after this many seconds
    #[serde(default)]
    pub duration_seconds: Option<u64>,
}

/// A session together with live counters and workload health
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatusView {
    /// Stored session record
    #[serde(flatten)]
    pub session: RecordingSession,
    /// Entries stored so far
    pub entry_count: usize,
    /// Rollout health of the target deployment
    pub deployment_status: DeploymentHealth,
    /// Presence of the target service
    pub service_status: ServiceHealth,
}

/// Body of the add/replace interception-rule calls
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InterceptionRulesRequest {
    /// Rules to add or install
    pub rules: Vec<InterceptionRule>,
}

/// Body of the remove interception-rule call
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RuleKeysRequest {
    /// (path, method) pairs to remove
    pub rules: Vec<PathMethodRule>,
}

/// Where a raw export went
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExportSummary {
    /// Exported session
    pub session_id: String,
    /// Local directory holding the files
    pub directory: PathBuf,
    /// Number of files written
    pub files: usize,
}

/// Outcome of re-arming persisted sessions at startup
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Sessions whose auto-stop was re-armed
    pub rearmed: usize,
    /// Sessions already past expiry and stopped
    pub stopped: usize,
}
