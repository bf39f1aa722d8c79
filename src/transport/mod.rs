//! Request orchestration
//!
//! [`Transport::request`] runs one logical request end to end:
//!
//! 1. admission control (memory circuit breaker)
//! 2. connection selection through the pool, node filter and node selector
//! 3. the exchange itself
//! 4. outcome classification: network failures and 502/503/504 mark the
//!    connection dead and retry on another one while the retry budget lasts,
//!    anything else marks it alive
//!
//! Topology discovery ("sniffing") runs on an interval, on start, or after a
//! connection fault, and reconciles the pool with the node list the cluster
//! reports. At most one sniff runs at a time.

mod request;
mod response;

pub use request::{RequestBody, RequestOptions, TransportRequest};
pub use response::{ApiResponse, RequestMeta, ResponseBody};

use bytes::Bytes;
use hyper::header::{
    HeaderName, HeaderValue, ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_TYPE, USER_AGENT,
};
use hyper::{HeaderMap, Method};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::error::{Error, ResponseError, Result};
use crate::events::{Event, RequestEvent, SniffEvent};
use crate::lb::{is_unavailable_status, NodeFilter, NodeSelector, SniffReason, DEFAULT_SNIFF_ENDPOINT};
use crate::pool::{
    now_millis, Connection, ConnectionPool, GetConnectionOptions, MemoryCircuitBreaker,
    MemoryCircuitBreakerConfig, RequestParams, DEFAULT_MAX_RESPONSE_SIZE,
};
use crate::serializer::Serializer;

const REQUEST_ID_MASK: u32 = 0x7FFF_FFFF;

/// Delay before the sniff requested on start
const SNIFF_ON_START_DELAY: Duration = Duration::from_millis(10);

const X_OPAQUE_ID: HeaderName = HeaderName::from_static("x-opaque-id");

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Outgoing body compression
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    Gzip,
}

impl std::str::FromStr for Compression {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "gzip" => Ok(Compression::Gzip),
            other => Err(Error::Configuration(format!("Invalid compression: '{}'", other))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub max_retries: u32,
    pub request_timeout: Duration,
    /// `None` disables periodic sniffing
    pub sniff_interval: Option<Duration>,
    pub sniff_on_start: bool,
    pub sniff_on_connection_fault: bool,
    pub sniff_endpoint: String,
    pub node_filter: NodeFilter,
    pub node_selector: NodeSelector,
    /// Advertise that compressed responses are accepted
    pub suggest_compression: bool,
    /// Compress request bodies
    pub compression: Option<Compression>,
    /// Sent with every request
    pub headers: HeaderMap,
    pub opaque_id_prefix: Option<String>,
    pub memory_circuit_breaker: MemoryCircuitBreakerConfig,
    pub max_response_size: u64,
    pub name: String,
    /// Expected `version.distribution` of the cluster
    pub product_check: Option<String>,
    /// Default context surfaced in response metadata
    pub context: Option<Value>,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            request_timeout: Duration::from_secs(30),
            sniff_interval: None,
            sniff_on_start: false,
            sniff_on_connection_fault: false,
            sniff_endpoint: DEFAULT_SNIFF_ENDPOINT.to_string(),
            node_filter: NodeFilter::default(),
            node_selector: NodeSelector::default(),
            suggest_compression: false,
            compression: None,
            headers: HeaderMap::new(),
            opaque_id_prefix: None,
            memory_circuit_breaker: MemoryCircuitBreakerConfig::default(),
            max_response_size: DEFAULT_MAX_RESPONSE_SIZE,
            name: "searchpool".to_string(),
            product_check: None,
            context: None,
        }
    }
}

/// Next request id: a 31-bit counter that wraps to 0
pub fn next_request_id(current: u32) -> u32 {
    current.wrapping_add(1) & REQUEST_ID_MASK
}

struct TransportInner {
    pool: ConnectionPool,
    serializer: Serializer,
    options: TransportOptions,
    breaker: MemoryCircuitBreaker,
    user_agent: HeaderValue,
    request_counter: AtomicU32,
    /// Epoch milliseconds of the next interval sniff
    next_sniff: AtomicU64,
    is_sniffing: AtomicBool,
    compatible: OnceCell<()>,
}

/// Retrying, sniffing request executor on top of a [`ConnectionPool`].
///
/// Clone is cheap, clones share state.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<TransportInner>,
}

/// Body bytes ready to send plus the headers describing them
struct PreparedBody {
    bytes: Option<Bytes>,
    content_type: Option<&'static str>,
}

impl Transport {
    pub fn new(pool: ConnectionPool, serializer: Serializer, options: TransportOptions) -> Result<Self> {
        let breaker = MemoryCircuitBreaker::new(options.memory_circuit_breaker.clone())?;
        Self::with_breaker(pool, serializer, options, breaker)
    }

    /// Build a transport around an already configured breaker, e.g. one reading a custom
    /// [`MemoryGauge`](crate::pool::MemoryGauge). `options.memory_circuit_breaker` is ignored.
    pub fn with_breaker(
        pool: ConnectionPool,
        serializer: Serializer,
        options: TransportOptions,
        breaker: MemoryCircuitBreaker,
    ) -> Result<Self> {
        let user_agent = HeaderValue::from_str(&format!(
            "searchpool/{} (rust)",
            env!("CARGO_PKG_VERSION")
        ))
        .map_err(|e| Error::Configuration(format!("Invalid user agent: {}", e)))?;

        let next_sniff = options
            .sniff_interval
            .map(|interval| now_millis().saturating_add(duration_millis(interval)))
            .unwrap_or(0);

        let transport = Self {
            inner: Arc::new(TransportInner {
                pool,
                serializer,
                breaker,
                user_agent,
                request_counter: AtomicU32::new(0),
                next_sniff: AtomicU64::new(next_sniff),
                is_sniffing: AtomicBool::new(false),
                compatible: OnceCell::new(),
                options,
            }),
        };

        if transport.inner.options.sniff_on_start {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    let t = transport.clone();
                    handle.spawn(async move {
                        tokio::time::sleep(SNIFF_ON_START_DELAY).await;
                        if let Err(e) = t.sniff(SniffReason::SniffOnStart).await {
                            warn!(error = %e, "Sniff on start failed");
                        }
                    });
                }
                Err(_) => warn!("Sniff on start requested outside of a tokio runtime, skipping"),
            }
        }

        info!(
            name = %transport.inner.options.name,
            max_retries = transport.inner.options.max_retries,
            sniff_interval_ms = transport.inner.options.sniff_interval.map(duration_millis),
            "Transport initialized"
        );

        Ok(transport)
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.inner.pool
    }

    pub fn serializer(&self) -> &Serializer {
        &self.inner.serializer
    }

    pub fn options(&self) -> &TransportOptions {
        &self.inner.options
    }

    pub fn circuit_breaker(&self) -> &MemoryCircuitBreaker {
        &self.inner.breaker
    }

    pub fn is_sniffing(&self) -> bool {
        self.inner.is_sniffing.load(Ordering::SeqCst)
    }

    pub fn generate_request_id(&self) -> u32 {
        let previous = self
            .inner
            .request_counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(next_request_id(n)))
            .unwrap_or_default();
        next_request_id(previous)
    }

    /// Run one logical request with retries
    pub async fn request(&self, request: TransportRequest, options: RequestOptions) -> Result<ApiResponse> {
        let request_id = options.id.unwrap_or_else(|| self.generate_request_id());

        if let Some(product) = &self.inner.options.product_check {
            self.product_check(product).await?;
        }

        self.execute(request, options, request_id).await
    }

    async fn product_check(&self, expected: &str) -> Result<()> {
        self.inner
            .compatible
            .get_or_try_init(|| async {
                let id = self.generate_request_id();
                let response = self
                    .execute(TransportRequest::get("/"), RequestOptions::default(), id)
                    .await?;
                let distribution = response
                    .body
                    .as_json()
                    .and_then(|body| body.pointer("/version/distribution"))
                    .and_then(Value::as_str);

                if distribution == Some(expected) {
                    debug!(distribution = expected, "Product check passed");
                    Ok(())
                } else {
                    Err(Error::NotCompatible(format!(
                        "The client noticed that the server is not {} and will not work with this client",
                        expected
                    )))
                }
            })
            .await
            .map(|_| ())
    }

    fn prepare_body(&self, body: Option<RequestBody>) -> Result<PreparedBody> {
        const JSON: &str = "application/json";
        const NDJSON: &str = "application/x-ndjson";

        let (bytes, content_type) = match body {
            None => (None, None),
            Some(RequestBody::Json(value)) => {
                let text = self.inner.serializer.serialize(&value)?;
                (Some(Bytes::from(text)), Some(JSON))
            }
            Some(RequestBody::Text(text)) => (Some(Bytes::from(text)), Some(JSON)),
            Some(RequestBody::Bytes(bytes)) => (Some(bytes), None),
            Some(RequestBody::NdJson(items)) => {
                let text = self.inner.serializer.ndserialize(&items)?;
                (Some(Bytes::from(text)), Some(NDJSON))
            }
        };

        Ok(PreparedBody {
            bytes: bytes.filter(|b| !b.is_empty()),
            content_type,
        })
    }

    fn build_headers(
        &self,
        options: &RequestOptions,
        content_type: Option<&'static str>,
        compressed: bool,
    ) -> Result<HeaderMap> {
        let transport = &self.inner.options;
        let mut headers = transport.headers.clone();
        headers.insert(USER_AGENT, self.inner.user_agent.clone());

        for (name, value) in options.headers.iter() {
            headers.insert(name.clone(), value.clone());
        }

        if let Some(opaque_id) = &options.opaque_id {
            let full = format!(
                "{}{}",
                transport.opaque_id_prefix.as_deref().unwrap_or_default(),
                opaque_id
            );
            let value = HeaderValue::from_str(&full)
                .map_err(|e| Error::Configuration(format!("Invalid opaque id: {}", e)))?;
            headers.insert(X_OPAQUE_ID, value);
        }

        if let Some(content_type) = content_type {
            if !headers.contains_key(CONTENT_TYPE) {
                headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
            }
        }
        if transport.suggest_compression {
            headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip,deflate"));
        }
        if compressed {
            headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        }

        Ok(headers)
    }

    fn querystring(&self, request: Option<&Value>, options: Option<&Value>) -> Option<String> {
        let serializer = &self.inner.serializer;
        let parts: Vec<String> = [request, options]
            .into_iter()
            .map(|qs| serializer.qserialize(qs))
            .filter(|qs| !qs.is_empty())
            .collect();

        if parts.is_empty() {
            None
        } else {
            Some(parts.join("&"))
        }
    }

    /// Start an interval sniff if one is due. Only one caller wins the slot.
    fn maybe_sniff_on_interval(&self) -> bool {
        let interval = match self.inner.options.sniff_interval {
            Some(interval) => interval,
            None => return false,
        };

        let now = now_millis();
        let due = self.inner.next_sniff.load(Ordering::SeqCst);
        if now < due || self.is_sniffing() {
            return false;
        }

        let next = now.saturating_add(duration_millis(interval));
        if self
            .inner
            .next_sniff
            .compare_exchange(due, next, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }

        self.spawn_sniff(SniffReason::SniffInterval);
        true
    }

    fn spawn_sniff(&self, reason: SniffReason) {
        let transport = self.clone();
        tokio::spawn(async move {
            if let Err(e) = transport.sniff(reason).await {
                warn!(reason = %reason, error = %e, "Sniff failed");
            }
        });
    }

    fn emit_request(&self, event: RequestEvent) {
        self.inner.pool.events().emit(Event::Request(event));
    }

    fn emit_response(&self, event: RequestEvent) {
        self.inner.pool.events().emit(Event::Response(event));
    }

    async fn execute(
        &self,
        request: TransportRequest,
        options: RequestOptions,
        request_id: u32,
    ) -> Result<ApiResponse> {
        let transport = &self.inner.options;
        let name = transport.name.clone();
        let max_retries = options.max_retries.unwrap_or(transport.max_retries);
        let timeout = options.request_timeout.unwrap_or(transport.request_timeout);

        let prepared = self.prepare_body(request.body)?;
        let compress = options
            .compression
            .unwrap_or(transport.compression == Some(Compression::Gzip));
        let (body, compressed) = match prepared.bytes {
            Some(bytes) if compress => (Some(response::gzip(&bytes)?), true),
            other => (other, false),
        };
        let headers = self.build_headers(&options, prepared.content_type, compressed)?;
        let querystring = self.querystring(request.querystring.as_ref(), options.querystring.as_ref());

        let mut meta = RequestMeta {
            context: options.context.clone().or_else(|| transport.context.clone()),
            name: name.clone(),
            request_id,
            connection: None,
            attempts: 0,
            sniff: None,
        };
        let method_name = request.method.as_str().to_string();
        let is_head = request.method == Method::HEAD;
        let mut last_error: Option<Error> = None;

        loop {
            if options.abort.as_ref().is_some_and(|token| token.is_cancelled()) {
                return Err(Error::RequestAborted(
                    "Request has been aborted by the user".to_string(),
                ));
            }

            self.inner.breaker.check()?;

            if self.maybe_sniff_on_interval() {
                meta.sniff = Some(SniffReason::SniffInterval);
            }

            let mut selection =
                GetConnectionOptions::new(&transport.node_filter, &transport.node_selector);
            selection.request_id = Some(request_id);
            selection.name = Some(&name);
            let connection = match self.inner.pool.get_connection(selection) {
                Some(connection) => connection,
                None => return Err(Error::no_living_connections(last_error)),
            };
            meta.connection = Some(connection.snapshot());

            let mut event = RequestEvent {
                name: name.clone(),
                request_id,
                method: method_name.clone(),
                path: request.path.clone(),
                connection_id: Some(connection.id()),
                attempts: meta.attempts,
                status_code: None,
                error: None,
            };
            self.emit_request(event.clone());

            debug!(
                request_id,
                connection = %connection.id(),
                method = %method_name,
                path = %request.path,
                attempt = meta.attempts,
                "Sending request"
            );

            let response_budget = self.inner.breaker.response_budget(transport.max_response_size);
            let params = RequestParams {
                method: request.method.clone(),
                path: request.path.clone(),
                querystring: querystring.clone(),
                headers: headers.clone(),
                body: body.clone(),
                timeout: Some(timeout),
                max_response_size: Some(response_budget),
            };

            let reply = match connection.request(params, options.abort.clone()).await {
                Ok(reply) => reply,
                Err(e) if e.is_retryable() => {
                    event.error = Some(e.to_string());
                    self.emit_response(event);
                    self.inner.pool.mark_dead(&connection);
                    if transport.sniff_on_connection_fault {
                        meta.sniff = Some(SniffReason::SniffOnConnectionFault);
                        self.spawn_sniff(SniffReason::SniffOnConnectionFault);
                    }

                    if meta.attempts < max_retries {
                        meta.attempts += 1;
                        warn!(
                            request_id,
                            connection = %connection.id(),
                            error = %e,
                            attempt = meta.attempts,
                            "Request failed, retrying on another connection"
                        );
                        last_error = Some(e);
                        continue;
                    }

                    if self.inner.pool.alive_count() == 0 {
                        return Err(Error::no_living_connections(Some(e)));
                    }
                    return Err(e);
                }
                Err(e) => {
                    event.error = Some(e.to_string());
                    self.emit_response(event);
                    return Err(e);
                }
            };

            let (parts, payload) = reply.into_parts();
            let status = parts.status;
            let status_code = status.as_u16();
            let ignored = options.ignore.contains(&status_code);

            event.status_code = Some(status_code);

            if !ignored && is_unavailable_status(status) {
                self.inner.pool.mark_dead(&connection);
                if meta.attempts < max_retries {
                    self.emit_response(event);
                    meta.attempts += 1;
                    warn!(
                        request_id,
                        connection = %connection.id(),
                        status = status_code,
                        attempt = meta.attempts,
                        "Node unavailable, retrying on another connection"
                    );
                    last_error = Some(Error::from(ResponseError::new(
                        status_code,
                        parts.headers.clone(),
                        Value::Null,
                    )));
                    continue;
                }
            } else {
                self.inner.pool.mark_alive(&connection);
            }

            let payload = match response::decode_body(&parts.headers, payload, response_budget) {
                Ok(payload) => payload,
                Err(e) => {
                    event.error = Some(e.to_string());
                    self.emit_response(event);
                    return Err(e);
                }
            };

            let body = match self.decode_payload(&parts.headers, &payload, is_head, status_code) {
                Ok(body) => body,
                Err(e) => {
                    event.error = Some(e.to_string());
                    self.emit_response(event);
                    return Err(e);
                }
            };

            let warnings = response::parse_warnings(&parts.headers);
            meta.connection = Some(connection.snapshot());
            self.emit_response(event);

            let not_found_head = is_head && status_code == 404;
            if !ignored && !not_found_head && status_code >= 400 {
                debug!(request_id, status = status_code, "Request failed with a response error");
                return Err(ResponseError::new(status_code, parts.headers, body.into_value()).into());
            }

            let body = if not_found_head {
                ResponseBody::Bool(false)
            } else {
                body
            };

            return Ok(ApiResponse {
                body,
                status_code,
                headers: parts.headers,
                warnings,
                meta,
            });
        }
    }

    fn decode_payload(
        &self,
        headers: &HeaderMap,
        payload: &Bytes,
        is_head: bool,
        status_code: u16,
    ) -> Result<ResponseBody> {
        let is_json = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.contains("application/json"));

        if is_json && !is_head && !payload.is_empty() {
            let text = std::str::from_utf8(payload).map_err(|e| Error::Deserialization {
                message: e.to_string(),
                data: String::from_utf8_lossy(payload).into_owned(),
            })?;
            return Ok(ResponseBody::Json(self.inner.serializer.deserialize(text)?));
        }

        if is_head && status_code < 400 {
            return Ok(ResponseBody::Bool(true));
        }

        Ok(ResponseBody::Text(String::from_utf8_lossy(payload).into_owned()))
    }

    /// Ask the cluster for its nodes and reconcile the pool.
    ///
    /// Returns the urls the pool now holds. A sniff requested while another
    /// one runs returns an empty list immediately.
    pub fn sniff(&self, reason: SniffReason) -> BoxFuture<'static, Result<Vec<String>>> {
        let transport = self.clone();
        Box::pin(async move { transport.run_sniff(reason).await })
    }

    async fn run_sniff(&self, reason: SniffReason) -> Result<Vec<String>> {
        if self.inner.is_sniffing.swap(true, Ordering::SeqCst) {
            debug!(reason = %reason, "A sniff is already in progress");
            return Ok(Vec::new());
        }

        if let Some(interval) = self.inner.options.sniff_interval {
            self.inner
                .next_sniff
                .store(now_millis().saturating_add(duration_millis(interval)), Ordering::SeqCst);
        }

        let request_id = self.generate_request_id();
        debug!(reason = %reason, request_id, "Started sniffing request");

        let outcome = self.discover(request_id).await;
        self.inner.is_sniffing.store(false, Ordering::SeqCst);

        let (hosts, error) = match &outcome {
            Ok(hosts) => (hosts.clone(), None),
            Err(e) => (Vec::new(), Some(e.to_string())),
        };
        match &error {
            None => info!(reason = %reason, hosts = hosts.len(), "Sniffing completed"),
            Some(e) => warn!(reason = %reason, error = %e, "Sniffing failed"),
        }

        self.inner.pool.events().emit(Event::Sniff(SniffEvent {
            name: self.inner.options.name.clone(),
            request_id: Some(request_id),
            reason,
            hosts,
            error,
        }));

        outcome
    }

    async fn discover(&self, request_id: u32) -> Result<Vec<String>> {
        let endpoint = &self.inner.options.sniff_endpoint;
        let response = self
            .execute(TransportRequest::get(endpoint.as_str()), RequestOptions::default(), request_id)
            .await?;

        let protocol = response
            .meta
            .connection
            .as_ref()
            .and_then(|c| url::Url::parse(&c.url).ok())
            .map(|u| format!("{}:", u.scheme()))
            .unwrap_or_else(|| "http:".to_string());

        let nodes = response
            .body
            .as_json()
            .and_then(|body| body.get("nodes"))
            .cloned()
            .unwrap_or(Value::Null);

        let hosts = self.inner.pool.nodes_to_host(&nodes, &protocol)?;
        let urls = hosts.iter().map(|h| h.url.to_string()).collect();
        self.inner.pool.update(hosts)?;
        Ok(urls)
    }

    /// Find the connection a response came from, for callers holding a snapshot
    pub fn connection_for(&self, meta: &RequestMeta) -> Option<Arc<Connection>> {
        meta.connection
            .as_ref()
            .and_then(|snapshot| self.inner.pool.connection(&snapshot.id))
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("name", &self.inner.options.name)
            .field("pool", &self.inner.pool)
            .field("is_sniffing", &self.is_sniffing())
            .finish()
    }
}

fn duration_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
