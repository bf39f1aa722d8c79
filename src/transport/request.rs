use bytes::Bytes;
use hyper::{HeaderMap, Method};
use serde_json::Value;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Body of a logical request
#[derive(Debug, Clone)]
pub enum RequestBody {
    /// Serialized as JSON
    Json(Value),
    /// Sent as is, declared as JSON
    Text(String),
    /// Sent as is, no content type implied
    Bytes(Bytes),
    /// Newline-delimited entries for bulk endpoints
    NdJson(Vec<Value>),
}

/// One logical request, independent of the node it ends up on
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub method: Method,
    pub path: String,
    pub body: Option<RequestBody>,
    /// Object or already encoded string
    pub querystring: Option<Value>,
}

impl TransportRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
            querystring: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn head(path: impl Into<String>) -> Self {
        Self::new(Method::HEAD, path)
    }

    pub fn with_body(mut self, body: RequestBody) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_json(self, body: Value) -> Self {
        self.with_body(RequestBody::Json(body))
    }

    pub fn with_querystring(mut self, querystring: Value) -> Self {
        self.querystring = Some(querystring);
        self
    }
}

/// Per-call overrides of the transport defaults
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub request_timeout: Option<Duration>,
    pub max_retries: Option<u32>,
    /// Statuses that are not turned into errors
    pub ignore: Vec<u16>,
    pub headers: HeaderMap,
    pub querystring: Option<Value>,
    /// Force body compression on or off
    pub compression: Option<bool>,
    pub opaque_id: Option<String>,
    /// Opaque value surfaced in the response metadata
    pub context: Option<Value>,
    /// Explicit request id instead of a generated one
    pub id: Option<u32>,
    pub abort: Option<CancellationToken>,
}
