use bytes::Bytes;
use flate2::read::{GzDecoder, ZlibDecoder};
use flate2::write::GzEncoder;
use flate2::Compression;
use hyper::header::{CONTENT_ENCODING, WARNING};
use hyper::HeaderMap;
use serde::Serialize;
use serde_json::Value;
use std::io::{Read, Write};

use crate::error::{Error, Result};
use crate::lb::SniffReason;
use crate::pool::ConnectionSnapshot;

/// Decoded response body
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ResponseBody {
    Json(Value),
    Text(String),
    /// Outcome of a HEAD request
    Bool(bool),
}

impl ResponseBody {
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            ResponseBody::Json(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ResponseBody::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn into_value(self) -> Value {
        match self {
            ResponseBody::Json(value) => value,
            ResponseBody::Text(text) => Value::String(text),
            ResponseBody::Bool(b) => Value::Bool(b),
        }
    }
}

/// What happened on the way to a response
#[derive(Debug, Clone, Serialize)]
pub struct RequestMeta {
    pub context: Option<Value>,
    pub name: String,
    pub request_id: u32,
    /// The connection that produced the response
    pub connection: Option<ConnectionSnapshot>,
    /// Retries performed before this response
    pub attempts: u32,
    /// Topology discovery started by this request, if any
    pub sniff: Option<SniffReason>,
}

#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub body: ResponseBody,
    pub status_code: u16,
    pub headers: HeaderMap,
    pub warnings: Option<Vec<String>>,
    pub meta: RequestMeta,
}

/// Inflate a body according to its `content-encoding`, refusing to grow past `limit` bytes
pub(crate) fn decode_body(headers: &HeaderMap, body: Bytes, limit: u64) -> Result<Bytes> {
    let encoding = headers
        .get(CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_ascii_lowercase());

    let limit_len = usize::try_from(limit).unwrap_or(usize::MAX);
    let mut out = Vec::with_capacity(body.len().saturating_mul(2).min(limit_len));
    // One byte past the limit is enough to tell an oversized body apart
    let cap = limit.saturating_add(1);
    let inflated = match encoding.as_deref() {
        Some("gzip") | Some("x-gzip") => {
            GzDecoder::new(body.as_ref()).take(cap).read_to_end(&mut out)
        }
        Some("deflate") => ZlibDecoder::new(body.as_ref()).take(cap).read_to_end(&mut out),
        _ => return Ok(body),
    };

    inflated.map_err(|e| Error::Deserialization {
        message: format!("Failed to decompress response: {}", e),
        data: String::from_utf8_lossy(&body).into_owned(),
    })?;
    if out.len() as u64 > limit {
        return Err(Error::RequestAborted(format!(
            "The decompressed response is bigger than the maximum allowed buffer ({})",
            limit
        )));
    }
    Ok(Bytes::from(out))
}

pub(crate) fn gzip(body: &[u8]) -> Result<Bytes> {
    let fail = |e: std::io::Error| Error::Serialization {
        message: format!("Failed to compress request body: {}", e),
        data: String::new(),
    };
    let mut encoder = GzEncoder::new(Vec::with_capacity(body.len() / 2), Compression::default());
    encoder.write_all(body).map_err(fail)?;
    encoder.finish().map(Bytes::from).map_err(fail)
}

/// Split `warning` headers on commas that are not inside a quoted section
pub(crate) fn parse_warnings(headers: &HeaderMap) -> Option<Vec<String>> {
    let mut warnings = Vec::new();
    for value in headers.get_all(WARNING) {
        let value = match value.to_str() {
            Ok(v) => v,
            Err(_) => continue,
        };

        let mut current = String::new();
        let mut quoted = false;
        for c in value.chars() {
            match c {
                '"' => {
                    quoted = !quoted;
                    current.push(c);
                }
                ',' if !quoted => {
                    let trimmed = current.trim();
                    if !trimmed.is_empty() {
                        warnings.push(trimmed.to_string());
                    }
                    current.clear();
                }
                _ => current.push(c),
            }
        }
        let trimmed = current.trim();
        if !trimmed.is_empty() {
            warnings.push(trimmed.to_string());
        }
    }

    if warnings.is_empty() {
        None
    } else {
        Some(warnings)
    }
}
