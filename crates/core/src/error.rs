use std::fmt;

/// Malformed input attributable to one field of the value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid value for field `{field}`: {reason}")]
pub struct ValidationError {
    pub field: String,
    pub reason: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self { field: field.into(), reason: reason.to_string() }
    }
}

/// Errors surfaced by reconciler operations.
///
/// An unmet dependency is not an error: the object simply becomes pending.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("{kind} `{key}`: {source}")]
    Validation {
        kind: &'static str,
        key: String,
        #[source]
        source: ValidationError,
    },
    /// The device rejected a valid, dependency-satisfied command.
    #[error("{kind} `{key}`: {cause:#}")]
    Device {
        kind: &'static str,
        key: String,
        cause: anyhow::Error,
    },
    /// Programming error; fatal to the single operation only.
    #[error("{kind} `{key}`: inconsistent state: {reason}")]
    Inconsistent {
        kind: &'static str,
        key: String,
        reason: String,
    },
}

impl ReconcileError {
    pub fn inconsistent(kind: &'static str, key: impl Into<String>, reason: impl Into<String>) -> Self {
        ReconcileError::Inconsistent { kind, key: key.into(), reason: reason.into() }
    }

    pub fn key(&self) -> &str {
        match self {
            ReconcileError::Validation { key, .. } => key,
            ReconcileError::Device { key, .. } => key,
            ReconcileError::Inconsistent { key, .. } => key,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ReconcileError::Validation { kind, .. } => kind,
            ReconcileError::Device { kind, .. } => kind,
            ReconcileError::Inconsistent { kind, .. } => kind,
        }
    }

    /// Offending field for validation errors.
    pub fn field(&self) -> Option<&str> {
        match self {
            ReconcileError::Validation { source, .. } => Some(source.field.as_str()),
            _ => None,
        }
    }
}
