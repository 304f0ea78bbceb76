//! Error types for the IoT Hub MQTT transport
//!
//! Synchronous failures (bad identity, unknown devices, option errors) are
//! returned as [`TransportError`]. Failures of individual messages never show
//! up here: they are reported through [`crate::transport::ClientContext::send_complete`].

use crate::config::ConfigError;
use crate::credentials::CredentialError;
use crate::transport::mqtt::wire::WireError;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Main error type for transport operations
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("Device identity does not match the transport session")]
    IdentityMismatch,

    #[error("Transport already has device registered by id: {device_id}")]
    AlreadyRegistered { device_id: String },

    #[error("Transport session has been destroyed")]
    Closed,

    #[error("Wire error: {0}")]
    Wire(#[from] WireError),

    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl TransportError {
    /// Create invalid argument error
    pub fn invalid_argument<S: Into<String>>(message: S) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

static SECRET_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(sharedaccesskey|sig|password|token|key)([=:])\s*[^;&\s]+")
        .expect("secret pattern is a valid regex")
});

static SAS_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"SharedAccessSignature\s+\S+").expect("sas pattern is a valid regex")
});

/// Mask credential material before it reaches a log line.
///
/// Covers connection strings (`SharedAccessKey=...`), SAS tokens and the
/// usual `password=` / `token=` shapes found in lower-layer error texts.
pub fn redact_secrets(message: &str) -> String {
    let masked = SAS_PATTERN.replace_all(message, "SharedAccessSignature ***");
    SECRET_PATTERN
        .replace_all(&masked, "${1}${2}***")
        .into_owned()
}
