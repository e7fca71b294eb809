//! Domain types shared by every component
//!
//! Sessions, the rules they apply, and the entries they capture. All of these
//! are persisted as JSON, so field names are camelCase on the wire.

mod entry;
mod rules;
mod session;

pub use entry::RecordedEntry;
pub use rules::{
    merge_recording_rules, InterceptionRule, MockResponse, PathMethodRule,
    DEFAULT_MOCK_BODY, DEFAULT_MOCK_CONTENT_TYPE, FALLBACK_MOCK_STATUS,
};
pub use session::{
    config_object_name, generate_session_id, RecordingSession, SessionKind, SessionStatus,
};
