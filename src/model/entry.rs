//! Captured request/response records

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One captured exchange, immutable once stored
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RecordedEntry {
    /// Session the entry belongs to
    pub recording_id: String,
    /// Harvest time
    pub timestamp: DateTime<Utc>,
    /// Namespace of the pod
    pub namespace: String,
    /// Service name
    pub service_name: String,
    /// Pod the capture came from
    pub pod: String,
    /// Capture file the entry was parsed from
    #[serde(default)]
    pub source_file: String,
    /// `:path` pseudo-header
    pub path: Option<String>,
    /// `:method` pseudo-header
    pub method: Option<String>,
    /// `:status` pseudo-header
    pub status: Option<u16>,
    /// All request headers
    #[serde(default)]
    pub request_headers: BTreeMap<String, String>,
    /// All response headers
    #[serde(default)]
    pub response_headers: BTreeMap<String, String>,
    /// Request body, at most the size ceiling
    pub request_body: Option<String>,
    /// Response body, at most the size ceiling
    pub response_body: Option<String>,
    /// Request body was cut at the ceiling
    #[serde(default)]
    pub request_truncated: bool,
    /// Response body was cut at the ceiling
    #[serde(default)]
    pub response_truncated: bool,
    /// Original request body length
    pub request_bytes: Option<usize>,
    /// Original response body length
    pub response_bytes: Option<usize>,
    /// `x-request-id`, or the trace id of `traceparent`
    pub correlation_id: Option<String>,
    /// Raw `traceparent` header
    pub traceparent: Option<String>,
}
