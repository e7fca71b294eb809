//! Recording and interception rules

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Body served by an interception rule that was given none
pub const DEFAULT_MOCK_BODY: &str =
    r#"{"status":0,"msg":"Service temporarily unavailable due to interception rule","data":null}"#;

/// Content type used when a mock response names none
pub const DEFAULT_MOCK_CONTENT_TYPE: &str = "application/json;charset=UTF-8";

/// Status served when a mock response carries one outside [200, 600)
pub const FALLBACK_MOCK_STATUS: u16 = 500;

/// Prefix-match recording trigger
///
/// Two rules are the same rule when their path and upper-cased method match.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq, Hash)]
pub struct PathMethodRule {
    /// Path prefix to record
    pub path: String,
    /// HTTP method
    pub method: String,
}

impl PathMethodRule {
    /// Create a rule, normalizing the method to upper case
    pub fn new(path: impl Into<String>, method: impl AsRef<str>) -> Self {
        Self {
            path: path.into(),
            method: method.as_ref().to_ascii_uppercase(),
        }
    }

    /// Identity used for deduplication
    pub fn key(&self) -> (String, String) {
        (self.path.clone(), self.method.to_ascii_uppercase())
    }

    /// Copy with the method normalized
    pub fn normalized(&self) -> Self {
        Self::new(self.path.clone(), &self.method)
    }
}

/// Canned response served instead of forwarding to the application
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct MockResponse {
    /// HTTP status; re-validated to [200, 600) at render time
    pub status_code: u16,
    /// Content type; defaults to JSON when absent
    pub content_type: Option<String>,
    /// Extra response headers
    pub headers: BTreeMap<String, String>,
    /// Response body; an empty body is replaced by [`DEFAULT_MOCK_BODY`]
    pub body: String,
}

impl MockResponse {
    /// Status code to serve, with out-of-range values folded to 500
    pub fn effective_status(&self) -> u16 {
        if (200..600).contains(&self.status_code) {
            self.status_code
        } else {
            FALLBACK_MOCK_STATUS
        }
    }

    /// Content type to serve
    ///
    /// An explicit content type wins, then a `content-type` entry in the
    /// headers (any case), then the JSON default.
    pub fn effective_content_type(&self) -> String {
        if let Some(ct) = self.content_type.as_deref().filter(|ct| !ct.trim().is_empty()) {
            return ct.to_string();
        }
        self.headers
            .iter()
            .find(|(k, v)| k.eq_ignore_ascii_case("content-type") && !v.trim().is_empty())
            .map(|(_, v)| v.clone())
            .unwrap_or_else(|| DEFAULT_MOCK_CONTENT_TYPE.to_string())
    }

    /// Body to serve, with blank bodies replaced by the default stub
    pub fn effective_body(&self) -> String {
        let body = self.body.trim();
        if body.is_empty() {
            DEFAULT_MOCK_BODY.to_string()
        } else {
            body.to_string()
        }
    }
}

/// Short-circuit rule: requests matching path, method and (optionally) one of
/// the match tokens get the mock response without reaching the application.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InterceptionRule {
    /// Service the rule was written for
    #[serde(default)]
    pub service_name: String,
    /// Exact request path
    pub path: String,
    /// HTTP method
    pub method: String,
    /// Substrings of the `baggage` request header; any one matching is enough.
    /// Empty means the rule applies to every matching request.
    #[serde(default)]
    pub match_tokens: Vec<String>,
    /// Response to serve
    #[serde(default)]
    pub mock_response: MockResponse,
}

impl InterceptionRule {
    /// The (path, method) this rule intercepts, as a recording rule
    pub fn as_recording_rule(&self) -> PathMethodRule {
        PathMethodRule::new(self.path.clone(), &self.method)
    }

    /// Whether this rule targets the given path and method
    pub fn matches(&self, path: &str, method: &str) -> bool {
        self.path == path && self.method.eq_ignore_ascii_case(method)
    }
}

/// Merge recording rules with the (path, method) of every interception rule.
///
/// Keeps first-seen order and drops duplicates, so intercepted requests are
/// always recorded exactly once.
pub fn merge_recording_rules(
    recording: &[PathMethodRule],
    interception: &[InterceptionRule],
) -> Vec<PathMethodRule> {
    let mut seen = std::collections::HashSet::new();
    recording
        .iter()
        .map(PathMethodRule::normalized)
        .chain(interception.iter().map(InterceptionRule::as_recording_rule))
        .filter(|rule| seen.insert(rule.key()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn intercept(path: &str, method: &str) -> InterceptionRule {
        InterceptionRule {
            service_name: "orders".to_string(),
            path: path.to_string(),
            method: method.to_string(),
            match_tokens: vec![],
            mock_response: MockResponse::default(),
        }
    }

    #[test]
    fn rule_identity_ignores_method_case() {
        assert_eq!(
            PathMethodRule::new("/api", "get"),
            PathMethodRule::new("/api", "GET")
        );
        assert_ne!(
            PathMethodRule::new("/api", "GET"),
            PathMethodRule::new("/api/v2", "GET")
        );
    }

    #[test]
    fn merge_dedups_and_keeps_order() {
        let recording = vec![
            PathMethodRule::new("/api", "GET"),
            PathMethodRule::new("/api", "get"),
            PathMethodRule::new("/orders", "POST"),
        ];
        let interception = vec![intercept("/orders", "post"), intercept("/pay", "PUT")];

        let merged = merge_recording_rules(&recording, &interception);
        assert_eq!(
            merged,
            vec![
                PathMethodRule::new("/api", "GET"),
                PathMethodRule::new("/orders", "POST"),
                PathMethodRule::new("/pay", "PUT"),
            ]
        );
    }

    #[test]
    fn merged_set_covers_every_interception_rule() {
        let interception = vec![
            intercept("/a", "GET"),
            intercept("/b", "delete"),
            intercept("/a", "GET"),
        ];
        let merged = merge_recording_rules(&[], &interception);
        for rule in &interception {
            assert!(merged.contains(&rule.as_recording_rule()));
        }
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn mock_status_outside_range_folds_to_500() {
        for (given, served) in [(999, 500), (0, 500), (199, 500), (600, 500), (200, 200), (599, 599)] {
            let resp = MockResponse {
                status_code: given,
                ..Default::default()
            };
            assert_eq!(resp.effective_status(), served, "status {}", given);
        }
    }

    #[test]
    fn mock_content_type_resolution() {
        let mut resp = MockResponse::default();
        assert_eq!(resp.effective_content_type(), DEFAULT_MOCK_CONTENT_TYPE);

        resp.headers
            .insert("Content-Type".to_string(), "text/plain".to_string());
        assert_eq!(resp.effective_content_type(), "text/plain");

        resp.content_type = Some("application/xml".to_string());
        assert_eq!(resp.effective_content_type(), "application/xml");
    }

    #[test]
    fn blank_mock_body_gets_stub() {
        let resp = MockResponse {
            body: "   ".to_string(),
            ..Default::default()
        };
        assert_eq!(resp.effective_body(), DEFAULT_MOCK_BODY);
    }

    #[test]
    fn interception_rule_deserializes_with_defaults() {
        let rule: InterceptionRule =
            serde_json::from_str(r#"{"path":"/pay","method":"post"}"#).unwrap();
        assert!(rule.match_tokens.is_empty());
        assert_eq!(rule.mock_response.effective_status(), 500);
        assert!(rule.matches("/pay", "POST"));
    }
}
