//! Typed errors shared by matching, resolution, behaviors and validation.
//!
//! Every error carries a stable machine-readable code, a message and, where it
//! makes sense, the configuration fragment that caused it so callers can point
//! at the exact stub, response or predicate that failed.

use serde::ser::{Serialize, SerializeMap, Serializer};
use serde_json::Value;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, ImposterError>;

/// Error kinds surfaced by the imposter core.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ImposterError {
    /// Structurally or semantically invalid configuration.
    #[error("{message}")]
    Validation {
        message: String,
        fragment: Option<Value>,
        data: Option<String>,
    },
    /// User code threw, produced unusable output, or injection is disabled.
    #[error("{message}")]
    Injection {
        message: String,
        fragment: Option<Value>,
        data: Option<String>,
    },
    /// Unknown resource, e.g. a consumed proxy resolution key.
    #[error("{message}")]
    MissingResource {
        message: String,
        fragment: Option<Value>,
    },
    /// The proxy destination could not be reached or answered badly.
    #[error("{message}")]
    InvalidProxy { message: String, data: Option<String> },
    /// Listener-level conflict such as a port already in use.
    #[error("{message}")]
    ResourceConflict { message: String },
    /// Listener-level permission failure such as binding a privileged port.
    #[error("{message}")]
    InsufficientAccess { message: String },
}

impl ImposterError {
    pub fn validation(message: impl Into<String>) -> Self {
        ImposterError::Validation {
            message: message.into(),
            fragment: None,
            data: None,
        }
    }

    pub fn validation_with_source(message: impl Into<String>, source: Value) -> Self {
        ImposterError::Validation {
            message: message.into(),
            fragment: Some(source),
            data: None,
        }
    }

    pub fn injection(message: impl Into<String>, source: Value, data: impl Into<String>) -> Self {
        ImposterError::Injection {
            message: message.into(),
            fragment: Some(source),
            data: Some(data.into()),
        }
    }

    pub fn injection_disallowed(message: impl Into<String>, source: Value) -> Self {
        ImposterError::Injection {
            message: message.into(),
            fragment: Some(source),
            data: None,
        }
    }

    pub fn missing_resource(message: impl Into<String>, source: Value) -> Self {
        ImposterError::MissingResource {
            message: message.into(),
            fragment: Some(source),
        }
    }

    pub fn invalid_proxy(message: impl Into<String>, data: impl Into<String>) -> Self {
        ImposterError::InvalidProxy {
            message: message.into(),
            data: Some(data.into()),
        }
    }

    pub fn resource_conflict(message: impl Into<String>) -> Self {
        ImposterError::ResourceConflict {
            message: message.into(),
        }
    }

    pub fn insufficient_access(message: impl Into<String>) -> Self {
        ImposterError::InsufficientAccess {
            message: message.into(),
        }
    }

    /// Stable machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            ImposterError::Validation { .. } => "bad data",
            ImposterError::Injection { .. } => "invalid injection",
            ImposterError::MissingResource { .. } => "no such resource",
            ImposterError::InvalidProxy { .. } => "invalid proxy",
            ImposterError::ResourceConflict { .. } => "resource conflict",
            ImposterError::InsufficientAccess { .. } => "insufficient access",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            ImposterError::Validation { message, .. }
            | ImposterError::Injection { message, .. }
            | ImposterError::MissingResource { message, .. }
            | ImposterError::InvalidProxy { message, .. }
            | ImposterError::ResourceConflict { message }
            | ImposterError::InsufficientAccess { message } => message,
        }
    }

    /// The configuration fragment the error refers to, if any.
    pub fn source_fragment(&self) -> Option<&Value> {
        match self {
            ImposterError::Validation { fragment, .. }
            | ImposterError::Injection { fragment, .. }
            | ImposterError::MissingResource { fragment, .. } => fragment.as_ref(),
            _ => None,
        }
    }

    pub fn data(&self) -> Option<&str> {
        match self {
            ImposterError::Validation { data, .. }
            | ImposterError::Injection { data, .. }
            | ImposterError::InvalidProxy { data, .. } => data.as_deref(),
            _ => None,
        }
    }

    /// Attach a source fragment when the error does not carry one yet.
    pub fn or_source(mut self, fragment: &Value) -> Self {
        match &mut self {
            ImposterError::Validation { fragment: slot, .. }
            | ImposterError::Injection { fragment: slot, .. }
            | ImposterError::MissingResource { fragment: slot, .. } => {
                if slot.is_none() {
                    *slot = Some(fragment.clone());
                }
            }
            _ => {}
        }
        self
    }

    pub fn is_injection(&self) -> bool {
        matches!(self, ImposterError::Injection { .. })
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, ImposterError::Validation { .. })
    }

    pub fn is_missing_resource(&self) -> bool {
        matches!(self, ImposterError::MissingResource { .. })
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

impl Serialize for ImposterError {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("code", self.code())?;
        map.serialize_entry("message", self.message())?;
        if let Some(source) = self.source_fragment() {
            map.serialize_entry("source", source)?;
        }
        if let Some(data) = self.data() {
            map.serialize_entry("data", data)?;
        }
        map.end()
    }
}
