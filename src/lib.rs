//! meshtap - traffic recording and interception control plane
//!
//! meshtap attaches an Envoy sidecar to a running Kubernetes workload,
//! redirects the workload's Service through it, and then either records the
//! exchanges that match a set of rules, answers them with canned responses,
//! or both. Captured exchanges are harvested out of the sidecars into a
//! session store, and every session is torn down again by restoring the
//! Service's original target port.
//!
//! # Architecture
//!
//! - Nothing is cached across operations: every cluster edit re-reads the
//!   object and writes it back under an optimistic-concurrency retry
//! - Session state lives in a TTL store (in-memory, or Redis with the
//!   `redis` feature) so abandoned sessions expire on their own
//! - Auto-stop timers are per-session cancellable tasks
//!
//! # Modules
//!
//! - [`render`] - Envoy bootstrap rendering (record / intercept / hybrid)
//! - [`cluster`] - Mockable seam over the cluster API
//! - [`sidecar`] - Sidecar injection, traffic redirection, rollout waits
//! - [`collector`] - Capture harvesting and parsing
//! - [`store`] - Session and entry persistence
//! - [`scheduler`] - Auto-stop timers
//! - [`session`] - Session lifecycle and background sweeps
//! - [`api`] - HTTP surface
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod api;
pub mod cluster;
pub mod collector;
pub mod config;
pub mod error;
pub mod kube_utils;
pub mod model;
pub mod render;
pub mod retry;
pub mod scheduler;
pub mod session;
pub mod sidecar;
pub mod store;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================

/// Stored request/response bodies are truncated beyond this many characters
pub const MAX_BODY_BYTES: usize = 10 * 1024;

/// Default TTL of session records, entry lists and processed-file markers
pub const DEFAULT_STORE_TTL: std::time::Duration = std::time::Duration::from_secs(7 * 24 * 3600);

/// Default port of the HTTP API
pub const DEFAULT_API_PORT: u16 = 8105;

/// Kubernetes object names and label values are capped at this length
pub const MAX_OBJECT_NAME_LEN: usize = 63;
