//! Error taxonomy for the protocol engine.
//!
//! Local failures (I/O, timeouts, decode) and protocol-level error replies
//! are kept apart: an error reply from the peer is data on the wire and is
//! carried as a [`ServiceError`], which the client call engine surfaces as
//! [`Error::Service`].

use std::fmt;

use thiserror::Error;

use crate::wire::Parameters;

/// Standard varlink error name for a call to an unregistered method.
pub const ERROR_METHOD_NOT_FOUND: &str = "org.varlink.service.MethodNotFound";

/// Standard varlink error name for a malformed or mismatched call.
pub const ERROR_INVALID_PARAMETER: &str = "org.varlink.service.InvalidParameter";

/// An error reply, as sent or received over the wire.
///
/// Carries the dotted error name and the detail parameters of the reply.
/// The `Display` rendering is the error name followed by the JSON-rendered
/// parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceError {
    pub name: String,
    pub parameters: Parameters,
}

impl ServiceError {
    pub fn new<S: Into<String>>(name: S, parameters: Parameters) -> Self {
        ServiceError {
            name: name.into(),
            parameters,
        }
    }

    /// `org.varlink.service.MethodNotFound` with the offending method name.
    pub fn method_not_found(method: &str) -> Self {
        let mut parameters = Parameters::new();
        parameters.insert("method".into(), method.into());
        ServiceError::new(ERROR_METHOD_NOT_FOUND, parameters)
    }

    /// `org.varlink.service.InvalidParameter` with a description of the
    /// offending parameter or condition.
    pub fn invalid_parameter<D: fmt::Display>(detail: D) -> Self {
        let mut parameters = Parameters::new();
        parameters.insert("parameter".into(), detail.to_string().into());
        ServiceError::new(ERROR_INVALID_PARAMETER, parameters)
    }
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} {}",
            self.name,
            serde_json::Value::Object(self.parameters.clone())
        )
    }
}

impl std::error::Error for ServiceError {}

/// Errors produced by the framing layer, the codec and the call engines.
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("read timeout expired")]
    Timeout,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("invalid varlink address URI: {0}")]
    InvalidAddress(String),

    /// An error reply received in response to a call.
    #[error(transparent)]
    Service(#[from] ServiceError),
}

pub type Result<T> = std::result::Result<T, Error>;
