//! Error types for Machina
//!
//! Errors are structured with fields to aid debugging on a live host or
//! cluster. Each variant carries the context needed to tell which node,
//! command or file was involved.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for Machina operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// A node matched more than one custom pool
    #[error("node {node} belongs to {count} custom roles, cannot proceed with this node")]
    AmbiguousPool {
        /// Name of the node
        node: String,
        /// Number of custom pools that matched
        count: usize,
    },

    /// Host capability probe failed
    #[error("capability probe failed: {message}")]
    Probe {
        /// Description of what failed
        message: String,
    },

    /// An external host command failed
    #[error("error running {command}: {message}")]
    Command {
        /// The command line that was run
        command: String,
        /// Exit status and bounded stderr excerpt
        message: String,
    },

    /// Host filesystem error
    #[error("io error [{context}]: {source}")]
    Io {
        /// What was being done (usually includes the path)
        context: String,
        /// The underlying io error
        #[source]
        source: std::io::Error,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The document kind being parsed (if known)
        kind: Option<String>,
    },

    /// Validation error for resource specs
    #[error("validation error for {resource}: {message}")]
    Validation {
        /// Name of the resource with invalid configuration
        resource: String,
        /// Description of what's invalid
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "workqueue", "writer")
        context: String,
    },
}

impl Error {
    /// Create an ambiguous pool membership error
    pub fn ambiguous_pool(node: impl Into<String>, count: usize) -> Self {
        Self::AmbiguousPool {
            node: node.into(),
            count,
        }
    }

    /// Create a capability probe error
    pub fn probe(msg: impl Into<String>) -> Self {
        Self::Probe {
            message: msg.into(),
        }
    }

    /// Create a command failure error
    pub fn command(command: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Command {
            command: command.into(),
            message: msg.into(),
        }
    }

    /// Create an io error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error for a named document kind
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
        }
    }

    /// Create a validation error for a named resource
    pub fn validation_for(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Ambiguous pools, probe failures, serialization and validation errors
    /// need a config or host fix. Command and io failures may be transient.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => {
                !matches!(source, kube::Error::Api(ae) if (400..500).contains(&ae.code))
            }
            Error::AmbiguousPool { .. } => false,
            Error::Probe { .. } => false,
            Error::Command { .. } => true,
            Error::Io { .. } => true,
            Error::Serialization { .. } => false,
            Error::Validation { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// True if this is a Kubernetes 404
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube { source } if is_not_found(source))
    }

    /// True if this is a Kubernetes optimistic concurrency conflict (409)
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Kube { source } if is_conflict(source))
    }

    /// Get the context if this error has one
    pub fn context(&self) -> Option<&str> {
        match self {
            Error::Io { context, .. } => Some(context),
            Error::Internal { context, .. } => Some(context),
            _ => None,
        }
    }
}

/// Check whether a kube error is a 404
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

/// Check whether a kube error is a 409 conflict
pub fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16) -> Error {
        Error::from(kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "boom".to_string(),
            reason: "Test".to_string(),
            code,
        }))
    }

    /// Story: a node in two custom pools is a configuration problem an admin
    /// must resolve, so the controller must not spin retrying it.
    #[test]
    fn story_ambiguous_pool_is_permanent() {
        let err = Error::ambiguous_pool("worker-3", 2);
        assert!(err.to_string().contains("worker-3"));
        assert!(err.to_string().contains("2 custom roles"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn command_errors_are_retryable() {
        let err = Error::command("podman pull quay.io/x", "exit status 125");
        assert!(err.is_retryable());
        assert!(err.to_string().starts_with("error running podman pull"));
    }

    #[test]
    fn probe_and_parse_errors_are_not_retryable() {
        assert!(!Error::probe("rpm-ostree missing").is_retryable());
        assert!(!Error::serialization_for_kind("rpm-ostree --version", "bad yaml").is_retryable());
        assert!(!Error::validation_for("infra", "bad selector").is_retryable());
    }

    #[test]
    fn kube_status_codes_are_classified() {
        assert!(api_error(404).is_not_found());
        assert!(!api_error(404).is_conflict());
        assert!(api_error(409).is_conflict());
        assert!(!api_error(409).is_retryable());
        assert!(api_error(503).is_retryable());
    }

    #[test]
    fn io_error_keeps_context() {
        let err = Error::io(
            "reading /sys/fs/selinux/enforce",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert_eq!(err.context(), Some("reading /sys/fs/selinux/enforce"));
        assert!(err.to_string().contains("[reading /sys/fs/selinux/enforce]"));
    }

    #[test]
    fn internal_error_default_context() {
        let err = Error::internal("unexpected state");
        assert_eq!(err.context(), Some(UNKNOWN_CONTEXT));
        assert!(err.to_string().contains("[unknown]"));
    }
}
