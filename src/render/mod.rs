//! Proxy configuration rendering
//!
//! Turns (application port, recording rules, interception rules) into the
//! Envoy bootstrap document pushed into the session's config object. One
//! template serves every variant:
//!
//! - record-only: capture filter, catch-all forward route
//! - intercept-only: direct-response routes ahead of the forward route, no
//!   capture filter (unless the caller asks for intercepted exchanges to be captured)
//! - hybrid: both; every intercepted (path, method) is folded into the
//!   capture rules so mocked exchanges are still recorded
//!
//! The capture match block differs structurally between one rule (a direct
//! `http_request_headers_match`) and several (`or_match`, which Envoy only
//! accepts with two or more entries).

use minijinja::{context, Environment};
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::EnvoySettings;
use crate::model::{merge_recording_rules, InterceptionRule, PathMethodRule};
use crate::{Error, Result};

/// Envoy bootstrap template
const ENVOY_TEMPLATE: &str = include_str!("templates/envoy.yaml");

/// Capture prefix for recording and hybrid sessions
pub const RECORD_TAP_PREFIX: &str = "rec-";
/// Capture prefix for intercepted exchanges captured by interception sessions
pub const INTERCEPT_TAP_PREFIX: &str = "fi-";

/// Inputs of one render
#[derive(Clone, Debug)]
pub struct RenderRequest<'a> {
    /// Port the application listens on (the service's original target port)
    pub app_port: i32,
    /// Paths to capture (prefix match)
    pub recording_rules: &'a [PathMethodRule],
    /// Paths to short-circuit with a mock response
    pub interception_rules: &'a [InterceptionRule],
    /// Emit the capture filter
    pub tap_enabled: bool,
    /// Full capture path prefix; defaults to `<tap_dir>/rec-`
    pub tap_path_prefix: Option<String>,
}

impl<'a> RenderRequest<'a> {
    /// Record-only document
    pub fn record(app_port: i32, recording_rules: &'a [PathMethodRule]) -> Self {
        Self {
            app_port,
            recording_rules,
            interception_rules: &[],
            tap_enabled: true,
            tap_path_prefix: None,
        }
    }

    /// Intercept-only document without a capture filter
    pub fn intercept(app_port: i32, interception_rules: &'a [InterceptionRule]) -> Self {
        Self {
            app_port,
            recording_rules: &[],
            interception_rules,
            tap_enabled: false,
            tap_path_prefix: None,
        }
    }

    /// Record + intercept document
    pub fn hybrid(
        app_port: i32,
        recording_rules: &'a [PathMethodRule],
        interception_rules: &'a [InterceptionRule],
    ) -> Self {
        Self {
            app_port,
            recording_rules,
            interception_rules,
            tap_enabled: true,
            tap_path_prefix: None,
        }
    }

    /// Enable capturing with an explicit path prefix
    pub fn with_tap(mut self, tap_path_prefix: impl Into<String>) -> Self {
        self.tap_enabled = true;
        self.tap_path_prefix = Some(tap_path_prefix.into());
        self
    }
}

/// A rendered document plus the capture rules it ended up with
#[derive(Clone, Debug, PartialEq)]
pub struct RenderedConfig {
    /// Envoy bootstrap YAML
    pub document: String,
    /// Effective capture rules (after hybrid merge); empty when capture is off
    pub recording_rules: Vec<PathMethodRule>,
}

#[derive(Debug, Serialize)]
struct HeaderView {
    key: String,
    value: String,
}

#[derive(Debug, Serialize)]
struct InterceptView {
    name: String,
    path: String,
    method: String,
    status: u16,
    body: String,
    content_type: String,
    headers: Vec<HeaderView>,
    token_contains: Option<String>,
    token_regex: Option<String>,
}

/// Renders Envoy bootstrap documents for sessions
pub struct ConfigRenderer {
    settings: EnvoySettings,
    env: Environment<'static>,
}

impl ConfigRenderer {
    /// Create a renderer for the given sidecar settings
    pub fn new(settings: EnvoySettings) -> Result<Self> {
        let mut env = Environment::new();
        env.set_trim_blocks(true);
        env.set_lstrip_blocks(true);
        env.add_filter("yaml_str", yaml_str);
        env.add_template("envoy", ENVOY_TEMPLATE)?;
        Ok(Self { settings, env })
    }

    /// Default capture prefix for recording sessions
    pub fn record_tap_prefix(&self) -> String {
        format!("{}/{}", self.settings.tap_dir.trim_end_matches('/'), RECORD_TAP_PREFIX)
    }

    /// Default capture prefix for intercepted exchanges
    pub fn intercept_tap_prefix(&self) -> String {
        format!("{}/{}", self.settings.tap_dir.trim_end_matches('/'), INTERCEPT_TAP_PREFIX)
    }

    /// Render a document
    ///
    /// Rejects an empty rule set, recording rules without capture, blank
    /// paths/methods and invalid ports before anything is rendered.
    pub fn render(&self, request: &RenderRequest<'_>) -> Result<RenderedConfig> {
        validate(request)?;

        let tap_rules = if request.tap_enabled {
            merge_recording_rules(request.recording_rules, request.interception_rules)
        } else {
            Vec::new()
        };

        let intercepts: Vec<InterceptView> = request
            .interception_rules
            .iter()
            .enumerate()
            .map(|(idx, rule)| intercept_view(idx, rule))
            .collect();

        let tap_path_prefix = request
            .tap_path_prefix
            .clone()
            .unwrap_or_else(|| self.record_tap_prefix());

        let template = self.env.get_template("envoy")?;
        let document = template.render(context! {
            admin_port => self.settings.admin_port,
            listener_port => self.settings.listener_port,
            app_port => request.app_port,
            max_buffered_bytes => self.settings.max_buffered_bytes,
            tap_enabled => request.tap_enabled,
            tap_rules => &tap_rules,
            tap_path_prefix => tap_path_prefix,
            intercepts => intercepts,
        })?;

        // A document that does not parse back would crash-loop the sidecar
        serde_yaml::from_str::<serde_yaml::Value>(&document)
            .map_err(|e| Error::render(format!("rendered document is not valid YAML: {}", e)))?;

        debug!(
            app_port = request.app_port,
            recording_rules = tap_rules.len(),
            interception_rules = request.interception_rules.len(),
            tap_enabled = request.tap_enabled,
            "Rendered proxy config"
        );

        Ok(RenderedConfig {
            document,
            recording_rules: tap_rules,
        })
    }
}

fn validate(request: &RenderRequest<'_>) -> Result<()> {
    if request.recording_rules.is_empty() && request.interception_rules.is_empty() {
        return Err(Error::validation(
            "at least one recording or interception rule is required",
        ));
    }
    if !request.tap_enabled && !request.recording_rules.is_empty() {
        return Err(Error::validation(
            "recording rules require the capture filter to be enabled",
        ));
    }
    if !(1..=65535).contains(&request.app_port) {
        return Err(Error::validation(format!(
            "application port {} is out of range",
            request.app_port
        )));
    }

    let pairs = request
        .recording_rules
        .iter()
        .map(|r| (r.path.as_str(), r.method.as_str()))
        .chain(
            request
                .interception_rules
                .iter()
                .map(|r| (r.path.as_str(), r.method.as_str())),
        );
    for (path, method) in pairs {
        if path.trim().is_empty() {
            return Err(Error::validation("rule path must not be empty"));
        }
        if method.trim().is_empty() {
            return Err(Error::validation(format!(
                "rule for path {} has no method",
                path
            )));
        }
    }
    Ok(())
}

fn intercept_view(idx: usize, rule: &InterceptionRule) -> InterceptView {
    let mock = &rule.mock_response;

    let status = mock.effective_status();
    if status != mock.status_code {
        warn!(
            service = %rule.service_name,
            path = %rule.path,
            status = mock.status_code,
            "Invalid mock status for interception rule, defaulting to 500"
        );
    }
    if mock.body.trim().is_empty() {
        warn!(
            service = %rule.service_name,
            path = %rule.path,
            "Empty mock body for interception rule, using fallback JSON"
        );
    }

    let tokens: Vec<&str> = rule
        .match_tokens
        .iter()
        .map(|t| t.as_str())
        .filter(|t| !t.is_empty())
        .collect();
    let (token_contains, token_regex) = match tokens.as_slice() {
        [] => (None, None),
        [single] => (Some(single.to_string()), None),
        many => {
            let alternatives: Vec<String> = many.iter().map(|t| escape_regex(t)).collect();
            (None, Some(format!(".*(?:{}).*", alternatives.join("|"))))
        }
    };

    let method = rule.method.to_ascii_uppercase();
    InterceptView {
        name: format!(
            "intercept-{}-{}{}",
            idx,
            method.to_ascii_lowercase(),
            sanitize_path(&rule.path)
        ),
        path: rule.path.clone(),
        method,
        status,
        body: mock.effective_body(),
        content_type: mock.effective_content_type(),
        headers: mock
            .headers
            .iter()
            .filter(|(k, _)| !k.eq_ignore_ascii_case("content-type"))
            .map(|(k, v)| HeaderView {
                key: k.clone(),
                value: v.clone(),
            })
            .collect(),
        token_contains,
        token_regex,
    }
}

/// Make a value safe inside a double-quoted YAML scalar
///
/// Double quotes fold to single quotes, line breaks and tabs become spaces,
/// and backslashes are doubled so YAML escape processing returns them intact.
pub fn yaml_str(value: String) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push('\''),
            '\n' | '\r' | '\t' => out.push(' '),
            c if c.is_control() => {}
            c => out.push(c),
        }
    }
    out
}

/// Escape regex metacharacters so a token matches literally
pub fn escape_regex(token: &str) -> String {
    let mut out = String::with_capacity(token.len());
    for c in token.chars() {
        if matches!(
            c,
            '\\' | '.' | '+' | '*' | '?' | '|' | '[' | ']' | '(' | ')' | '^' | '$' | '{' | '}'
        ) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Route-name fragment for a path: `/api/v1/orders` → `-api-v1-orders`
fn sanitize_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len() + 1);
    out.push('-');
    let mut last_dash = true;
    for c in path.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    let trimmed = out.trim_end_matches('-');
    if trimmed.is_empty() {
        "-root".to_string()
    } else {
        trimmed.to_string()
    }
}
