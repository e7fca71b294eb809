//! Capture file parsing
//!
//! Envoy writes one JSON document per tapped exchange. Depending on the sink
//! settings the trace sits under `http_buffered_trace` or
//! `http_streamed_trace`, and headers come either as `headers: [..]` or
//! wrapped as `headers: { headers: [..] }`.

use std::collections::BTreeMap;

use chrono::Utc;
use serde_json::Value;
use tracing::warn;

use crate::model::RecordedEntry;
use crate::{Error, Result};

/// Where a capture came from
#[derive(Clone, Debug)]
pub struct CaptureOrigin<'a> {
    /// Session the capture belongs to
    pub recording_id: &'a str,
    /// Pod namespace
    pub namespace: &'a str,
    /// Target service
    pub service_name: &'a str,
    /// Pod the file was read from
    pub pod: &'a str,
    /// Path of the file inside the pod
    pub source_file: &'a str,
}

/// Parse one capture document into an entry, truncating bodies to
/// `max_body_bytes` characters
pub fn parse_capture(
    raw: &str,
    origin: &CaptureOrigin<'_>,
    max_body_bytes: usize,
) -> Result<RecordedEntry> {
    let root: Value = serde_json::from_str(raw)?;
    let trace = root
        .get("http_buffered_trace")
        .or_else(|| root.get("http_streamed_trace"))
        .ok_or_else(|| Error::serialization("capture has no http trace"))?;

    let request = trace.get("request").unwrap_or(&Value::Null);
    let response = trace.get("response").unwrap_or(&Value::Null);

    let request_headers = parse_headers(request.get("headers"));
    let response_headers = parse_headers(response.get("headers"));

    let status = response_headers.get(":status").and_then(|s| {
        let parsed = s.trim().parse::<u16>().ok();
        if parsed.is_none() {
            warn!(file = %origin.source_file, status = %s, "Unparsable :status in capture");
        }
        parsed
    });

    let traceparent = request_headers.get("traceparent").cloned();
    let correlation_id = request_headers
        .get("x-request-id")
        .cloned()
        .or_else(|| traceparent.as_deref().and_then(trace_id));

    let (request_body, request_truncated, request_bytes) = body(request, max_body_bytes);
    let (response_body, response_truncated, response_bytes) = body(response, max_body_bytes);

    Ok(RecordedEntry {
        recording_id: origin.recording_id.to_string(),
        timestamp: Utc::now(),
        namespace: origin.namespace.to_string(),
        service_name: origin.service_name.to_string(),
        pod: origin.pod.to_string(),
        source_file: origin.source_file.to_string(),
        path: request_headers.get(":path").cloned(),
        method: request_headers.get(":method").cloned(),
        status,
        request_body,
        response_body,
        request_truncated,
        response_truncated,
        request_bytes,
        response_bytes,
        correlation_id,
        traceparent,
        request_headers,
        response_headers,
    })
}

fn parse_headers(node: Option<&Value>) -> BTreeMap<String, String> {
    let items = match node {
        Some(Value::Array(items)) => items,
        Some(Value::Object(obj)) => match obj.get("headers") {
            Some(Value::Array(items)) => items,
            _ => return BTreeMap::new(),
        },
        _ => return BTreeMap::new(),
    };

    items
        .iter()
        .filter_map(|h| {
            let key = h.get("key")?.as_str()?;
            let value = h.get("value").and_then(Value::as_str).unwrap_or_default();
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

/// Body text cut to `max_chars` characters, truncated flag and original byte length
fn body(message: &Value, max_chars: usize) -> (Option<String>, bool, Option<usize>) {
    let Some(text) = message
        .get("body")
        .and_then(|b| b.get("as_string"))
        .and_then(Value::as_str)
    else {
        return (None, false, None);
    };

    let len = text.len();
    match text.char_indices().nth(max_chars) {
        None => (Some(text.to_string()), false, Some(len)),
        Some((cut, _)) => (Some(text[..cut].to_string()), true, Some(len)),
    }
}

/// Trace id of a W3C `traceparent` (`00-<trace id>-<span id>-<flags>`)
fn trace_id(traceparent: &str) -> Option<String> {
    let mut parts = traceparent.trim().split('-');
    let _version = parts.next()?;
    let id = parts.next()?;
    (id.len() == 32 && id.chars().all(|c| c.is_ascii_hexdigit())).then(|| id.to_string())
}
