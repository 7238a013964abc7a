use std::time::Duration;

use thiserror::Error;

use crate::{marshal::MarshalError, providers::ProviderError};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failures surfaced by connections, requests and the connector
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("'{name}' is not connected: {reason}")]
    Connectivity { name: String, reason: String },
    #[error("Request on '{name}' received no reply within {timeout:?}")]
    RequestTimeout { name: String, timeout: Duration },
    #[error("Remote operation on '{name}' failed: {reason}")]
    RemoteOperation { name: String, reason: String },
    #[error(transparent)]
    Marshalling(#[from] MarshalError),
    /// Never returned; corrected values are logged with this as the message
    #[error("Invalid configuration, corrected: {0}")]
    Configuration(String),
    #[error("{0}")]
    LifecycleViolation(String),
    #[error("Response from '{response}' does not belong to a request on '{request}'")]
    ForeignResponse { request: String, response: String },
}

impl Error {
    pub(crate) fn remote(name: &str, source: ProviderError) -> Self {
        Error::RemoteOperation {
            name: name.to_owned(),
            reason: source.to_string(),
        }
    }
    pub(crate) fn not_connected(name: &str, reason: impl Into<String>) -> Self {
        Error::Connectivity {
            name: name.to_owned(),
            reason: reason.into(),
        }
    }
}
