//! Error types for the control plane.

use serde::Serialize;
use thiserror::Error;

/// Error taxonomy exposed to callers.
///
/// Every [`ControlError`] maps to exactly one kind. Only
/// [`ErrorKind::BackendUnavailable`] and [`ErrorKind::Timeout`] are transient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    ValidationFailed,
    NotFound,
    InvalidState,
    Conflict,
    CapacityExceeded,
    BackendUnavailable,
    UnsupportedOperation,
    Timeout,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ValidationFailed => "ValidationFailed",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::InvalidState => "InvalidState",
            ErrorKind::Conflict => "Conflict",
            ErrorKind::CapacityExceeded => "CapacityExceeded",
            ErrorKind::BackendUnavailable => "BackendUnavailable",
            ErrorKind::UnsupportedOperation => "UnsupportedOperation",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::Internal => "Internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur in adapters, the connection registry and the
/// lifecycle managers. Each variant names the entity it concerns.
#[derive(Error, Debug, Clone)]
pub enum ControlError {
    /// Bad input shape or values.
    #[error("Validation failed for {entity}: {reason}")]
    ValidationFailed { entity: String, reason: String },

    /// Unknown id or uuid.
    #[error("{entity} not found")]
    NotFound { entity: String },

    /// Transition is illegal from the current state.
    #[error("Invalid state for {entity}: {reason}")]
    InvalidState { entity: String, reason: String },

    /// Competing claim on the entity (e.g. disk already attached).
    #[error("Conflict on {entity}: {reason}")]
    Conflict { entity: String, reason: String },

    /// The backend cannot satisfy the resource request.
    #[error("Capacity exceeded on {entity}: {reason}")]
    CapacityExceeded { entity: String, reason: String },

    /// Transient transport or credential failure.
    #[error("Backend unavailable for {entity}: {reason}")]
    BackendUnavailable { entity: String, reason: String },

    /// The adapter variant lacks the capability.
    #[error("Unsupported operation on {entity}: {reason}")]
    UnsupportedOperation { entity: String, reason: String },

    /// No adapter exists for the host's virtualization tag.
    #[error("Unsupported hypervisor type '{tag}' for host {entity}")]
    UnsupportedHypervisorType { entity: String, tag: String },

    /// A remote call exceeded its deadline.
    #[error("Timed out after {timeout_ms}ms waiting on {entity}")]
    Timeout { entity: String, timeout_ms: u64 },

    /// Malformed connection or credential configuration.
    #[error("Invalid configuration for {entity}: {reason}")]
    Configuration { entity: String, reason: String },

    /// Internal error.
    #[error("Internal error on {entity}: {reason}")]
    Internal { entity: String, reason: String },
}

impl ControlError {
    pub fn validation(entity: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ValidationFailed { entity: entity.into(), reason: reason.into() }
    }

    pub fn not_found(entity: impl Into<String>) -> Self {
        Self::NotFound { entity: entity.into() }
    }

    pub fn invalid_state(entity: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidState { entity: entity.into(), reason: reason.into() }
    }

    pub fn conflict(entity: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Conflict { entity: entity.into(), reason: reason.into() }
    }

    pub fn capacity(entity: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::CapacityExceeded { entity: entity.into(), reason: reason.into() }
    }

    pub fn unavailable(entity: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::BackendUnavailable { entity: entity.into(), reason: reason.into() }
    }

    pub fn unsupported(entity: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::UnsupportedOperation { entity: entity.into(), reason: reason.into() }
    }

    pub fn configuration(entity: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Configuration { entity: entity.into(), reason: reason.into() }
    }

    pub fn internal(entity: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Internal { entity: entity.into(), reason: reason.into() }
    }

    /// Taxonomy kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ControlError::ValidationFailed { .. } => ErrorKind::ValidationFailed,
            ControlError::NotFound { .. } => ErrorKind::NotFound,
            ControlError::InvalidState { .. } => ErrorKind::InvalidState,
            ControlError::Conflict { .. } => ErrorKind::Conflict,
            ControlError::CapacityExceeded { .. } => ErrorKind::CapacityExceeded,
            ControlError::BackendUnavailable { .. } => ErrorKind::BackendUnavailable,
            ControlError::UnsupportedOperation { .. }
            | ControlError::UnsupportedHypervisorType { .. } => ErrorKind::UnsupportedOperation,
            ControlError::Timeout { .. } => ErrorKind::Timeout,
            ControlError::Configuration { .. } | ControlError::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// The entity (VM, disk, host, attachment) the error is about.
    pub fn entity(&self) -> &str {
        match self {
            ControlError::ValidationFailed { entity, .. }
            | ControlError::NotFound { entity }
            | ControlError::InvalidState { entity, .. }
            | ControlError::Conflict { entity, .. }
            | ControlError::CapacityExceeded { entity, .. }
            | ControlError::BackendUnavailable { entity, .. }
            | ControlError::UnsupportedOperation { entity, .. }
            | ControlError::UnsupportedHypervisorType { entity, .. }
            | ControlError::Timeout { entity, .. }
            | ControlError::Configuration { entity, .. }
            | ControlError::Internal { entity, .. } => entity,
        }
    }

    /// Whether the manager may retry the failed call.
    pub fn is_transient(&self) -> bool {
        matches!(self.kind(), ErrorKind::BackendUnavailable | ErrorKind::Timeout)
    }

    /// The same error attributed to another entity. Adapter errors name the
    /// host or backend uuid; managers re-attribute them to their own records.
    pub fn with_entity(self, entity: impl Into<String>) -> Self {
        let entity = entity.into();
        match self {
            ControlError::ValidationFailed { reason, .. } => ControlError::ValidationFailed { entity, reason },
            ControlError::NotFound { .. } => ControlError::NotFound { entity },
            ControlError::InvalidState { reason, .. } => ControlError::InvalidState { entity, reason },
            ControlError::Conflict { reason, .. } => ControlError::Conflict { entity, reason },
            ControlError::CapacityExceeded { reason, .. } => ControlError::CapacityExceeded { entity, reason },
            ControlError::BackendUnavailable { reason, .. } => ControlError::BackendUnavailable { entity, reason },
            ControlError::UnsupportedOperation { reason, .. } => ControlError::UnsupportedOperation { entity, reason },
            ControlError::Timeout { timeout_ms, .. } => ControlError::Timeout { entity, timeout_ms },
            ControlError::Internal { reason, .. } => ControlError::Internal { entity, reason },
            // Configuration problems belong to the host, not the record
            other @ (ControlError::UnsupportedHypervisorType { .. } | ControlError::Configuration { .. }) => other,
        }
    }
}

/// Result type alias for control plane operations.
pub type Result<T> = std::result::Result<T, ControlError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_unavailable_and_timeout_are_transient() {
        assert!(ControlError::unavailable("host-1", "refused").is_transient());
        assert!(ControlError::Timeout { entity: "vm-1".into(), timeout_ms: 10 }.is_transient());
        assert!(!ControlError::not_found("vm-1").is_transient());
        assert!(!ControlError::conflict("disk-1", "attached").is_transient());
        assert!(!ControlError::capacity("host-1", "no memory").is_transient());
    }

    #[test]
    fn test_with_entity_keeps_kind() {
        let err = ControlError::Timeout { entity: "host-1".into(), timeout_ms: 30 }.with_entity("vm-7");
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(err.entity(), "vm-7");

        let cfg = ControlError::configuration("host-1", "no key").with_entity("vm-7");
        assert_eq!(cfg.entity(), "host-1");
    }

    #[test]
    fn test_error_identifies_kind_and_entity() {
        let err = ControlError::UnsupportedHypervisorType {
            entity: "host-9".into(),
            tag: "xen".into(),
        };
        assert_eq!(err.kind(), ErrorKind::UnsupportedOperation);
        assert_eq!(err.entity(), "host-9");
        assert!(err.to_string().contains("xen"));
    }
}
