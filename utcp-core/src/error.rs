//! Error taxonomy shared by the core runtime and every protocol crate.
//!
//! Each error kind carries a stable `UTCP_E###` code so callers and logs can
//! identify failures without parsing prose. Transport adapters build their
//! internal errors with `anyhow` and convert at the contract boundary via
//! `From<anyhow::Error>`.

use std::fmt::Display;

use thiserror::Error;

pub type UtcpResult<T> = Result<T, UtcpError>;

#[derive(Debug, Error)]
pub enum UtcpError {
    /// A record failed validation inside a serializer.
    #[error("[UTCP_E001] invalid {type_name}: {message}")]
    SerializerValidation { type_name: String, message: String },

    /// A discriminator tag has no registered implementation.
    #[error("[UTCP_E002] no {registry} implementation registered for type '{tag}' (available: {available})")]
    UnknownTag {
        registry: &'static str,
        tag: String,
        available: String,
    },

    /// A referenced variable could not be resolved through any source.
    #[error("[UTCP_E003] variable '{name}' referenced in call template configuration not found; add it to the environment variables or to your UTCP configuration")]
    VariableNotFound { name: String },

    #[error("[UTCP_E004] manual '{0}' already registered; use a different name or deregister the existing manual")]
    DuplicateManual(String),

    #[error("[UTCP_E005] tool not found: {0}")]
    UnknownTool(String),

    /// Failure originating from a transport adapter.
    #[error("[UTCP_E006] transport error: {0:#}")]
    Transport(#[from] anyhow::Error),

    #[error("[UTCP_E007] {0}")]
    InvalidArgument(String),

    #[error("[UTCP_E008] configuration error: {0}")]
    Configuration(String),
}

impl UtcpError {
    /// Stable identifying code, e.g. `UTCP_E003`.
    pub fn code(&self) -> &'static str {
        match self {
            Self::SerializerValidation { .. } => "UTCP_E001",
            Self::UnknownTag { .. } => "UTCP_E002",
            Self::VariableNotFound { .. } => "UTCP_E003",
            Self::DuplicateManual(_) => "UTCP_E004",
            Self::UnknownTool(_) => "UTCP_E005",
            Self::Transport(_) => "UTCP_E006",
            Self::InvalidArgument(_) => "UTCP_E007",
            Self::Configuration(_) => "UTCP_E008",
        }
    }

    /// Helper for serializer failures; keeps the offending type in the message.
    pub fn validation(type_name: impl Into<String>, message: impl Display) -> Self {
        Self::SerializerValidation {
            type_name: type_name.into(),
            message: message.to_string(),
        }
    }

    pub fn variable_not_found(name: impl Into<String>) -> Self {
        Self::VariableNotFound { name: name.into() }
    }
}

impl From<std::io::Error> for UtcpError {
    fn from(err: std::io::Error) -> Self {
        Self::Transport(anyhow::Error::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(UtcpError::validation("Tool", "boom").code(), "UTCP_E001");
        assert_eq!(UtcpError::variable_not_found("ns_KEY").code(), "UTCP_E003");
        assert_eq!(UtcpError::DuplicateManual("m".into()).code(), "UTCP_E004");
        assert_eq!(UtcpError::UnknownTool("m.t".into()).code(), "UTCP_E005");
    }

    #[test]
    fn variable_not_found_names_the_variable() {
        let err = UtcpError::variable_not_found("m__one_KEY");
        let message = err.to_string();
        assert!(message.contains("[UTCP_E003]"));
        assert!(message.contains("m__one_KEY"));
    }

    #[test]
    fn transport_errors_preserve_the_underlying_message() {
        let err: UtcpError = anyhow::anyhow!("connection reset by peer").into();
        assert!(err.to_string().contains("connection reset by peer"));
        assert_eq!(err.code(), "UTCP_E006");
    }
}
