//! Error types shared by the connection, pool and transport layers
//!
//! Every failure a caller can observe is one variant of [`Error`]. Connection
//! level failures are classified with [`Error::is_retryable`] before the
//! transport decides whether to try another node.

use hyper::HeaderMap;
use serde_json::Value;
use thiserror::Error;

/// Errors produced by searchpool
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid setup: bad protocol, unknown role, unknown strategy name, ...
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Low-level network failure talking to a node
    #[error("Connection error: {0}")]
    Connection(String),

    /// The per-request timeout elapsed before a response arrived
    #[error("Timeout error: {0}")]
    Timeout(String),

    /// The caller cancelled the request, or it was shed before completion
    #[error("Request aborted: {0}")]
    RequestAborted(String),

    /// The pool had no usable connection for this request
    #[error("No living connections: {message}")]
    NoLivingConnections {
        message: String,
        #[source]
        last_error: Option<Box<Error>>,
    },

    /// The node answered with a non-success status
    #[error(transparent)]
    Response(#[from] Box<ResponseError>),

    /// A payload could not be encoded
    #[error("Serialization error: {message}")]
    Serialization { message: String, data: String },

    /// A payload could not be decoded
    #[error("Deserialization error: {message}")]
    Deserialization { message: String, data: String },

    /// The cluster is not a supported distribution
    #[error("Not compatible: {0}")]
    NotCompatible(String),

    /// The request path contains bytes that cannot be sent unescaped
    #[error("Request path contains unescaped characters: {0}")]
    InvalidPath(String),

    #[error("HTTP error: {0}")]
    Http(#[from] hyper::http::Error),
}

impl Error {
    /// Whether the transport may retry this failure on another connection
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Connection(_) | Error::Timeout(_))
    }

    /// Short kind name, used in events and log fields
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Configuration(_) => "ConfigurationError",
            Error::Connection(_) => "ConnectionError",
            Error::Timeout(_) => "TimeoutError",
            Error::RequestAborted(_) => "RequestAbortedError",
            Error::NoLivingConnections { .. } => "NoLivingConnectionsError",
            Error::Response(_) => "ResponseError",
            Error::Serialization { .. } => "SerializationError",
            Error::Deserialization { .. } => "DeserializationError",
            Error::NotCompatible(_) => "NotCompatibleError",
            Error::InvalidPath(_) => "InvalidPathError",
            Error::Http(_) => "HttpError",
        }
    }

    pub(crate) fn no_living_connections(last_error: Option<Error>) -> Self {
        Error::NoLivingConnections {
            message: "There are no living connections".to_string(),
            last_error: last_error.map(Box::new),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// A structured error answer from a node
#[derive(Debug, Clone)]
pub struct ResponseError {
    message: String,
    status: u16,
    headers: HeaderMap,
    body: Value,
}

impl ResponseError {
    /// Build the error from a response, deriving a readable message from
    /// the `error.root_cause` chain when the body carries one
    pub fn new(status: u16, headers: HeaderMap, body: Value) -> Self {
        let message = Self::build_message(&body);
        Self {
            message,
            status,
            headers,
            body,
        }
    }

    fn build_message(body: &Value) -> String {
        let error = match body.get("error") {
            Some(error) => error,
            None => return "Response Error".to_string(),
        };
        let error_type = match error.get("type").and_then(Value::as_str) {
            Some(t) => t,
            None => return "Response Error".to_string(),
        };

        match error.get("root_cause").and_then(Value::as_array) {
            Some(causes) => {
                let joined = causes
                    .iter()
                    .map(|cause| {
                        format!(
                            "[{}] Reason: {}",
                            cause.get("type").and_then(Value::as_str).unwrap_or_default(),
                            cause.get("reason").and_then(Value::as_str).unwrap_or_default()
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("; ");
                format!("{}: {}", error_type, joined)
            }
            None => error_type.to_string(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// The `status` field of the body when numeric, else the HTTP status
    pub fn status_code(&self) -> u16 {
        self.body
            .get("status")
            .and_then(Value::as_u64)
            .and_then(|s| u16::try_from(s).ok())
            .unwrap_or(self.status)
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Value {
        &self.body
    }
}

impl std::fmt::Display for ResponseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Response error: {}", self.message)
    }
}

impl std::error::Error for ResponseError {}

impl From<ResponseError> for Error {
    fn from(err: ResponseError) -> Self {
        Error::Response(Box::new(err))
    }
}
