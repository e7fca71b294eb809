//! Error types for the meshtap control plane

use thiserror::Error;

/// Context string used when an internal error has no more specific origin
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for meshtap operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube client error
        #[from]
        source: kube::Error,
    },

    /// Optimistic-concurrency retries on a cluster object were exhausted
    #[error("conflict on {resource} persisted after {attempts} attempts")]
    Conflict {
        /// Object that kept conflicting (e.g. `deployment/default/orders`)
        resource: String,
        /// Number of write attempts made
        attempts: u32,
    },

    /// A session, service, deployment, pod or container does not exist
    #[error("{kind} not found: {name}")]
    NotFound {
        /// Kind of the missing thing
        kind: String,
        /// Name or identifier that was looked up
        name: String,
    },

    /// Caller input rejected before any cluster mutation
    #[error("validation error: {0}")]
    Validation(String),

    /// Remote command execution inside a pod failed
    #[error("exec in pod {pod} failed: {message}")]
    Exec {
        /// Pod the command was executed in
        pod: String,
        /// Failure description
        message: String,
    },

    /// A bounded wait exceeded its deadline
    #[error("{operation} timed out: {message}")]
    Timeout {
        /// Operation that was waiting
        operation: String,
        /// What was being waited for
        message: String,
    },

    /// Proxy configuration template failed to render
    #[error("render error: {0}")]
    Render(String),

    /// Session/entry store failure
    #[error("store error: {0}")]
    Store(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Internal error with the operation it happened in
    #[error("internal error in {context}: {message}")]
    Internal {
        /// Operation context
        context: String,
        /// Error message
        message: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a not-found error for the given kind and name
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create an exec error for the given pod
    pub fn exec(pod: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Exec {
            pod: pod.into(),
            message: message.into(),
        }
    }

    /// Create a timeout error for the given operation
    pub fn timeout(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a render error with the given message
    pub fn render(msg: impl Into<String>) -> Self {
        Self::Render(msg.into())
    }

    /// Create a store error with the given message
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create an internal error without a specific context
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::internal_with_context(UNKNOWN_CONTEXT, msg)
    }

    /// Create an internal error tagged with the operation it happened in
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            context: context.into(),
            message: msg.into(),
        }
    }

    /// True when the API server rejected a write because of a stale resourceVersion
    /// (or a concurrent create of the same name)
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(ae) } if ae.code == 409)
    }

    /// True for not-found errors, whether ours or the API server's
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 404,
            _ => false,
        }
    }

    /// True when a remote exec failure is worth retrying
    ///
    /// Exec channels fail transiently while the websocket upgrade races a
    /// restarting container.
    pub fn is_retryable_exec(&self) -> bool {
        match self {
            Error::Exec { message, .. } => {
                let msg = message.to_ascii_lowercase();
                !is_container_missing_message(&msg)
                    && (msg.contains("handshake")
                        || msg.contains("exec failure")
                        || msg.contains("connection")
                        || msg.contains("upgrade")
                        || msg.contains("websocket"))
            }
            Error::Kube { source } => !matches!(source, kube::Error::Api(ae) if ae.code < 500),
            _ => false,
        }
    }

    /// True when an exec failed because the target container is not present
    pub fn is_container_missing(&self) -> bool {
        match self {
            Error::Exec { message, .. } => {
                is_container_missing_message(&message.to_ascii_lowercase())
            }
            Error::Kube {
                source: kube::Error::Api(ae),
            } => is_container_missing_message(&ae.message.to_ascii_lowercase()),
            _ => false,
        }
    }
}

fn is_container_missing_message(msg: &str) -> bool {
    msg.contains("container") && (msg.contains("not found") || msg.contains("is not valid"))
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<minijinja::Error> for Error {
    fn from(e: minijinja::Error) -> Self {
        Error::Render(e.to_string())
    }
}

#[cfg(test)]
pub(crate) fn api_error(code: u16, reason: &str) -> Error {
    Error::Kube {
        source: kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: format!("{} ({})", reason, code),
            reason: reason.to_string(),
            code,
        }),
    }
}
