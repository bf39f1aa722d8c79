//! Connection pool with dead-list tracking and resurrection
//!
//! This module provides:
//! - [`Connection`]: one node endpoint and its health counters
//! - [`ConnectionPool`]: the set of connections, the dead list ordered by
//!   resurrection deadline, topology reconciliation and resurrection
//! - [`MemoryCircuitBreaker`]: admission control used by the transport
//!
//! All membership and liveness changes go through one writer lock, so a
//! reader never observes a half-reconciled pool and the dead list is sorted
//! after every change.

pub mod circuit;
pub mod connection;
mod proxy;

pub use circuit::{
    CircuitStats, MemoryCircuitBreaker, MemoryCircuitBreakerConfig, MemoryGauge, ProcessMemory,
    DEFAULT_MAX_RESPONSE_SIZE,
};
pub use connection::{
    id_from_url, roles, AgentOptions, BasicAuth, Connection, ConnectionSnapshot,
    ConnectionStatus, NodeOptions, RequestParams, Roles, TlsOptions,
};

use hyper::HeaderMap;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{Error, Result};
use crate::events::{Event, EventBus, ResurrectEvent};
use crate::lb::{
    health, resurrect_backoff, NodeFilter, NodeSelector, NodesToHostFn, ResurrectStrategy,
    DEFAULT_RESURRECT_TIMEOUT, DEFAULT_RESURRECT_TIMEOUT_CUTOFF,
};

/// Default timeout of a resurrection probe
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(3);

/// Milliseconds since the epoch
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Pool-wide behaviour and the defaults every connection inherits
#[derive(Clone)]
pub struct PoolOptions {
    pub resurrect_strategy: ResurrectStrategy,
    pub ping_timeout: Duration,
    /// Base of the exponential resurrection backoff
    pub resurrect_timeout: Duration,
    /// Highest backoff exponent
    pub resurrect_timeout_cutoff: u32,
    pub auth: Option<BasicAuth>,
    pub tls: Option<TlsOptions>,
    pub proxy: Option<Url>,
    pub agent: Option<AgentOptions>,
    pub headers: HeaderMap,
    pub nodes_to_host: NodesToHostFn,
    pub events: EventBus,
    /// Reported in resurrection events
    pub name: String,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            resurrect_strategy: ResurrectStrategy::default(),
            ping_timeout: DEFAULT_PING_TIMEOUT,
            resurrect_timeout: DEFAULT_RESURRECT_TIMEOUT,
            resurrect_timeout_cutoff: DEFAULT_RESURRECT_TIMEOUT_CUTOFF,
            auth: None,
            tls: None,
            proxy: None,
            agent: None,
            headers: HeaderMap::new(),
            nodes_to_host: Arc::new(crate::lb::nodes_to_host),
            events: EventBus::new(),
            name: "searchpool".to_string(),
        }
    }
}

impl std::fmt::Debug for PoolOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolOptions")
            .field("resurrect_strategy", &self.resurrect_strategy)
            .field("ping_timeout", &self.ping_timeout)
            .field("resurrect_timeout", &self.resurrect_timeout)
            .field("resurrect_timeout_cutoff", &self.resurrect_timeout_cutoff)
            .field("proxy", &self.proxy.as_ref().map(id_from_url))
            .field("name", &self.name)
            .finish()
    }
}

/// Arguments of [`ConnectionPool::get_connection`]
pub struct GetConnectionOptions<'a> {
    pub filter: &'a NodeFilter,
    pub selector: &'a NodeSelector,
    /// Clock override in epoch milliseconds
    pub now: Option<u64>,
    pub request_id: Option<u32>,
    pub name: Option<&'a str>,
}

impl<'a> GetConnectionOptions<'a> {
    pub fn new(filter: &'a NodeFilter, selector: &'a NodeSelector) -> Self {
        Self {
            filter,
            selector,
            now: None,
            request_id: None,
            name: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ResurrectOptions {
    pub now: Option<u64>,
    pub request_id: Option<u32>,
    pub name: Option<String>,
}

#[derive(Default)]
struct PoolState {
    connections: Vec<Arc<Connection>>,
    /// Ids of dead members, ascending by resurrect deadline
    dead: Vec<String>,
}

impl PoolState {
    fn find(&self, id: &str) -> Option<&Arc<Connection>> {
        self.connections.iter().find(|c| c.id() == id)
    }

    fn sort_dead(&mut self) {
        let PoolState { connections, dead } = self;
        dead.sort_by_key(|id| {
            connections
                .iter()
                .find(|c| c.id() == *id)
                .map(|c| c.resurrect_timeout())
                .unwrap_or(0)
        });
    }
}

struct PoolInner {
    state: RwLock<PoolState>,
    options: PoolOptions,
    /// Connections with a resurrection probe in flight
    probing: Mutex<HashSet<String>>,
}

/// The set of node connections and their liveness.
///
/// Clone is cheap, clones share the same pool.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

enum Reconciled {
    Kept(Arc<Connection>, String),
    Created(Arc<Connection>),
}

impl ConnectionPool {
    pub fn new(options: PoolOptions) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                state: RwLock::new(PoolState::default()),
                options,
                probing: Mutex::new(HashSet::new()),
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, PoolState> {
        self.inner.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, PoolState> {
        self.inner.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn options(&self) -> &PoolOptions {
        &self.inner.options
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.options.events
    }

    pub fn resurrect_strategy(&self) -> ResurrectStrategy {
        self.inner.options.resurrect_strategy
    }

    /// Build a connection with the pool defaults filled in. It is not added.
    pub fn create_connection(&self, mut node: NodeOptions) -> Result<Connection> {
        let defaults = &self.inner.options;
        if node.auth.is_none() {
            node.auth = defaults.auth.clone();
        }
        if node.tls.is_none() {
            node.tls = defaults.tls.clone();
        }
        if node.proxy.is_none() {
            node.proxy = defaults.proxy.clone();
        }
        if node.agent.is_none() {
            node.agent = defaults.agent.clone();
        }
        for (name, value) in defaults.headers.iter() {
            if !node.headers.contains_key(name) {
                node.headers.insert(name.clone(), value.clone());
            }
        }
        Connection::new(node)
    }

    /// Create and add a connection. Fails if one with the same id exists.
    pub fn add_connection(&self, node: NodeOptions) -> Result<Arc<Connection>> {
        let id = node.resolved_id();
        let url_id = id_from_url(&node.url);

        let mut state = self.write();
        if state.find(&id).is_some() || state.find(&url_id).is_some() {
            return Err(Error::Configuration(format!(
                "Connection with id '{}' is already present",
                id
            )));
        }

        let connection = Arc::new(self.create_connection(node)?);
        state.connections.push(Arc::clone(&connection));
        debug!(connection = %id, size = state.connections.len(), "Connection added");
        Ok(connection)
    }

    pub fn add_url(&self, url: &str) -> Result<Arc<Connection>> {
        self.add_connection(NodeOptions::from_url(url)?)
    }

    /// Drop a connection from the pool and close it
    pub async fn remove_connection(&self, connection: &Arc<Connection>) {
        {
            let mut state = self.write();
            state.connections.retain(|c| !Arc::ptr_eq(c, connection));
            let id = connection.id();
            state.dead.retain(|d| *d != id);
            debug!(connection = %id, size = state.connections.len(), "Connection removed");
        }
        connection.close().await;
    }

    /// Close every connection and forget them
    pub async fn empty(&self) {
        let connections = {
            let mut state = self.write();
            state.dead.clear();
            std::mem::take(&mut state.connections)
        };
        info!(count = connections.len(), "Emptying the connection pool");

        let closing = connections
            .iter()
            .map(|connection| connection.close())
            .collect::<Vec<_>>();
        for close in closing {
            close.await;
        }
    }

    pub fn mark_alive(&self, connection: &Connection) {
        let mut state = self.write();
        Self::mark_alive_locked(&mut state, connection);
    }

    fn mark_alive_locked(state: &mut PoolState, connection: &Connection) {
        let id = connection.id();
        let was_dead = !connection.is_alive();
        state.dead.retain(|d| *d != id);
        connection.set_status(ConnectionStatus::Alive);
        connection.reset_dead_count();
        connection.set_resurrect_timeout(0);
        if was_dead {
            debug!(connection = %id, "Marking connection as alive");
        }
    }

    pub fn mark_dead(&self, connection: &Connection) {
        self.mark_dead_at(connection, now_millis());
    }

    /// Mark dead with an explicit clock, in epoch milliseconds
    pub fn mark_dead_at(&self, connection: &Connection, now: u64) {
        let options = &self.inner.options;
        let mut state = self.write();

        let id = connection.id();
        // A connection reconciled out in the meantime must not re-enter the dead list
        if state.find(&id).is_some() && !state.dead.contains(&id) {
            state.dead.push(id.clone());
        }

        let dead_count = connection.increment_dead_count();
        connection.set_status(ConnectionStatus::Dead);
        let backoff = resurrect_backoff(
            options.resurrect_timeout,
            dead_count,
            options.resurrect_timeout_cutoff,
        );
        connection.set_resurrect_timeout(now.saturating_add(backoff));
        state.sort_dead();

        warn!(
            connection = %id,
            dead_count,
            retry_in_ms = backoff,
            "Marking connection as dead"
        );
    }

    /// Pick a connection for a request.
    ///
    /// Resurrection runs first. When no connection is alive every connection
    /// becomes a candidate, so a dead one may be returned. `None` means the
    /// filtered candidate set is empty.
    pub fn get_connection(&self, options: GetConnectionOptions<'_>) -> Option<Arc<Connection>> {
        self.resurrect(ResurrectOptions {
            now: options.now,
            request_id: options.request_id,
            name: options.name.map(str::to_string),
        });

        let candidates: Vec<Arc<Connection>> = {
            let state = self.read();
            let none_alive = !state.connections.iter().any(|c| c.is_alive());
            state
                .connections
                .iter()
                .filter(|c| none_alive || c.is_alive())
                .filter(|c| options.filter.accepts(c))
                .cloned()
                .collect()
        };

        options.selector.select(&candidates)
    }

    /// The head of the dead list, if its deadline has passed and no probe
    /// is already running for it
    fn resurrect_candidate(&self, now: u64) -> Option<Arc<Connection>> {
        if self.inner.options.resurrect_strategy == ResurrectStrategy::None {
            return None;
        }

        let connection = {
            let state = self.read();
            let head = state.dead.first()?;
            Arc::clone(state.find(head)?)
        };

        if now < connection.resurrect_timeout() {
            return None;
        }

        let mut probing = self.inner.probing.lock().unwrap_or_else(PoisonError::into_inner);
        if !probing.insert(connection.id()) {
            return None;
        }
        Some(connection)
    }

    fn finish_probe(&self, connection: &Connection) {
        self.inner
            .probing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&connection.id());
    }

    /// Try to bring back the earliest dead connection.
    ///
    /// Optimistic resurrection happens inline. A ping probe runs on a spawned
    /// task and requires a tokio runtime; without one nothing happens.
    pub fn resurrect(&self, options: ResurrectOptions) {
        let now = options.now.unwrap_or_else(now_millis);
        let connection = match self.resurrect_candidate(now) {
            Some(connection) => connection,
            None => return,
        };

        match self.inner.options.resurrect_strategy {
            ResurrectStrategy::Ping => match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    let pool = self.clone();
                    handle.spawn(async move {
                        pool.probe(connection, options).await;
                    });
                }
                Err(_) => {
                    debug!(connection = %connection.id(), "No runtime to run a resurrection probe");
                    self.finish_probe(&connection);
                }
            },
            _ => {
                self.revive_optimistically(&connection, &options);
            }
        }
    }

    /// Like [`resurrect`](Self::resurrect) but waits for the outcome.
    /// Returns the connection tried and whether it is alive.
    pub async fn resurrect_and_wait(
        &self,
        options: ResurrectOptions,
    ) -> Option<(Arc<Connection>, bool)> {
        let now = options.now.unwrap_or_else(now_millis);
        let connection = self.resurrect_candidate(now)?;

        let alive = match self.inner.options.resurrect_strategy {
            ResurrectStrategy::Ping => self.probe(Arc::clone(&connection), options).await,
            _ => self.revive_optimistically(&connection, &options),
        };
        Some((connection, alive))
    }

    fn revive_optimistically(&self, connection: &Connection, options: &ResurrectOptions) -> bool {
        self.mark_alive(connection);
        self.finish_probe(connection);
        info!(connection = %connection.id(), "Optimistically resurrected connection");
        self.emit_resurrect(connection, options, true);
        true
    }

    async fn probe(&self, connection: Arc<Connection>, options: ResurrectOptions) -> bool {
        let alive = health::ping(&connection, self.inner.options.ping_timeout).await;
        if alive {
            info!(connection = %connection.id(), "Resurrection probe succeeded");
            self.mark_alive(&connection);
        } else {
            debug!(connection = %connection.id(), "Connection is still dead");
            self.mark_dead(&connection);
        }
        self.finish_probe(&connection);
        self.emit_resurrect(&connection, &options, alive);
        alive
    }

    fn emit_resurrect(&self, connection: &Connection, options: &ResurrectOptions, is_alive: bool) {
        self.inner.options.events.emit(Event::Resurrect(ResurrectEvent {
            strategy: self.inner.options.resurrect_strategy,
            name: options
                .name
                .clone()
                .unwrap_or_else(|| self.inner.options.name.clone()),
            request_id: options.request_id,
            is_alive,
            connection: connection.snapshot(),
        }));
    }

    /// Reconcile the pool against a fresh node list.
    ///
    /// Known connections (matched by id, then by url) are kept and marked
    /// alive, new ones are created, the rest are closed. New connections are
    /// built before anything changes, so a failure leaves the pool untouched.
    pub fn update(&self, nodes: Vec<NodeOptions>) -> Result<()> {
        let mut state = self.write();

        let mut plan: Vec<Reconciled> = Vec::with_capacity(nodes.len());
        let mut seen: HashSet<String> = HashSet::with_capacity(nodes.len());

        for node in nodes {
            let id = node.resolved_id();
            if !seen.insert(id.clone()) {
                continue;
            }

            let url_id = id_from_url(&node.url);
            let existing = state.find(&id).or_else(|| state.find(&url_id)).cloned();
            let existing = existing.filter(|c| {
                !plan.iter().any(|p| matches!(p, Reconciled::Kept(k, _) if Arc::ptr_eq(k, c)))
            });

            match existing {
                Some(connection) => plan.push(Reconciled::Kept(connection, id)),
                None => {
                    let connection = self.create_connection(node)?;
                    plan.push(Reconciled::Created(Arc::new(connection)));
                }
            }
        }

        let mut next = Vec::with_capacity(plan.len());
        for entry in plan {
            match entry {
                Reconciled::Kept(connection, id) => {
                    if connection.id() != id {
                        debug!(from = %connection.id(), to = %id, "Re-keying connection");
                        connection.set_id(&id);
                    }
                    Self::mark_alive_locked(&mut state, &connection);
                    next.push(connection);
                }
                Reconciled::Created(connection) => next.push(connection),
            }
        }

        let removed: Vec<Arc<Connection>> = state
            .connections
            .iter()
            .filter(|old| !next.iter().any(|c| Arc::ptr_eq(c, old)))
            .cloned()
            .collect();

        state.connections = next;
        state.dead.clear();
        let size = state.connections.len();
        drop(state);

        info!(size, removed = removed.len(), "Connection pool updated");

        if !removed.is_empty() {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    for connection in removed {
                        handle.spawn(async move { connection.close().await });
                    }
                }
                Err(_) => {
                    // Nothing can be awaited here, close without waiting for open requests
                    debug!(
                        count = removed.len(),
                        "No tokio runtime, closing removed connections immediately"
                    );
                    for connection in removed {
                        connection.release();
                    }
                }
            }
        }

        Ok(())
    }

    /// Map a node discovery answer with the configured mapping
    pub fn nodes_to_host(&self, nodes: &Value, protocol: &str) -> Result<Vec<NodeOptions>> {
        (self.inner.options.nodes_to_host)(nodes, protocol)
    }

    pub fn size(&self) -> usize {
        self.read().connections.len()
    }

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.read().connections.clone()
    }

    pub fn connection(&self, id: &str) -> Option<Arc<Connection>> {
        self.read().find(id).cloned()
    }

    pub fn dead_ids(&self) -> Vec<String> {
        self.read().dead.clone()
    }

    pub fn alive_count(&self) -> usize {
        self.read().connections.iter().filter(|c| c.is_alive()).count()
    }

    pub fn snapshot(&self) -> Vec<ConnectionSnapshot> {
        self.read().connections.iter().map(|c| c.snapshot()).collect()
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.read();
        f.debug_struct("ConnectionPool")
            .field("size", &state.connections.len())
            .field("dead", &state.dead)
            .field("options", &self.inner.options)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: u64 = 60_000;

    fn pool_with(strategy: ResurrectStrategy, urls: &[&str]) -> ConnectionPool {
        let pool = ConnectionPool::new(PoolOptions {
            resurrect_strategy: strategy,
            ..Default::default()
        });
        for url in urls {
            pool.add_url(url).unwrap();
        }
        pool
    }

    fn three_nodes() -> ConnectionPool {
        pool_with(
            ResurrectStrategy::Ping,
            &[
                "http://node-1:9200",
                "http://node-2:9200",
                "http://node-3:9200",
            ],
        )
    }

    fn node(url: &str, id: &str) -> NodeOptions {
        let mut node = NodeOptions::from_url(url).unwrap();
        node.id = Some(id.to_string());
        node
    }

    #[test]
    fn test_add_connection() {
        let pool = three_nodes();
        assert_eq!(pool.size(), 3);
        assert!(pool.connection("http://node-2:9200/").is_some());
    }

    #[test]
    fn test_add_duplicate_connection() {
        let pool = three_nodes();
        match pool.add_url("http://node-1:9200") {
            Err(Error::Configuration(msg)) => assert_eq!(
                msg,
                "Connection with id 'http://node-1:9200/' is already present"
            ),
            other => panic!("expected a configuration error, got {:?}", other.map(|c| c.id())),
        }
        assert_eq!(pool.size(), 3);
    }

    #[test]
    fn test_pool_defaults_are_inherited() {
        let pool = ConnectionPool::new(PoolOptions {
            auth: Some(BasicAuth {
                username: "admin".into(),
                password: "admin".into(),
            }),
            ..Default::default()
        });
        let conn = pool.add_url("http://node-1:9200").unwrap();
        assert!(conn.headers().contains_key(hyper::header::AUTHORIZATION));
    }

    #[test]
    fn test_mark_dead_and_alive() {
        let pool = three_nodes();
        let conn = pool.connection("http://node-1:9200/").unwrap();

        pool.mark_dead(&conn);
        assert_eq!(conn.status(), ConnectionStatus::Dead);
        assert_eq!(conn.dead_count(), 1);
        assert!(conn.resurrect_timeout() > 0);
        assert_eq!(pool.dead_ids(), vec![conn.id()]);

        pool.mark_alive(&conn);
        assert_eq!(conn.status(), ConnectionStatus::Alive);
        assert_eq!(conn.dead_count(), 0);
        assert_eq!(conn.resurrect_timeout(), 0);
        assert!(pool.dead_ids().is_empty());
    }

    #[test]
    fn test_mark_dead_twice_lists_once() {
        let pool = three_nodes();
        let conn = pool.connection("http://node-1:9200/").unwrap();
        pool.mark_dead(&conn);
        pool.mark_dead(&conn);
        assert_eq!(pool.dead_ids().len(), 1);
        assert_eq!(conn.dead_count(), 2);
    }

    #[test]
    fn test_backoff_scenario() {
        let pool = three_nodes();
        let conn = pool.connection("http://node-1:9200/").unwrap();
        let now = 1_000_000;

        pool.mark_dead_at(&conn, now);
        pool.mark_dead_at(&conn, now);
        pool.mark_dead_at(&conn, now);

        assert_eq!(conn.dead_count(), 3);
        assert_eq!(conn.resurrect_timeout(), now + MINUTE * 4);
    }

    #[test]
    fn test_backoff_is_monotonic_and_capped() {
        let pool = three_nodes();
        let conn = pool.connection("http://node-1:9200/").unwrap();
        let now = 1_000_000;

        let mut previous = 0;
        for _ in 0..10 {
            pool.mark_dead_at(&conn, now);
            let delta = conn.resurrect_timeout() - now;
            assert!(delta >= previous);
            assert!(delta <= MINUTE * 32);
            previous = delta;
        }
        assert_eq!(previous, MINUTE * 32);
    }

    #[test]
    fn test_dead_list_stays_sorted() {
        let pool = three_nodes();
        let c1 = pool.connection("http://node-1:9200/").unwrap();
        let c2 = pool.connection("http://node-2:9200/").unwrap();
        let c3 = pool.connection("http://node-3:9200/").unwrap();

        // c1 accumulates failures so its deadline moves furthest out
        pool.mark_dead_at(&c1, 1_000);
        pool.mark_dead_at(&c1, 1_000);
        pool.mark_dead_at(&c1, 1_000);
        pool.mark_dead_at(&c2, 2_000);
        pool.mark_dead_at(&c3, 500);

        let order = pool.dead_ids();
        let deadlines: Vec<u64> = order
            .iter()
            .map(|id| pool.connection(id).unwrap().resurrect_timeout())
            .collect();
        let mut sorted = deadlines.clone();
        sorted.sort();
        assert_eq!(deadlines, sorted);
        assert_eq!(order[0], c3.id());
        assert_eq!(order[2], c1.id());
    }

    #[test]
    fn test_mark_dead_ignores_non_members() {
        let pool = three_nodes();
        let outsider =
            Connection::new(NodeOptions::from_url("http://elsewhere:9200").unwrap()).unwrap();

        pool.mark_dead(&outsider);
        assert!(pool.dead_ids().is_empty());
        assert_eq!(outsider.status(), ConnectionStatus::Dead);
    }

    #[test]
    fn test_get_connection_skips_dead() {
        let pool = pool_with(
            ResurrectStrategy::None,
            &["http://node-1:9200", "http://node-2:9200"],
        );
        let c1 = pool.connection("http://node-1:9200/").unwrap();
        pool.mark_dead(&c1);

        let filter = NodeFilter::All;
        let selector = NodeSelector::round_robin();
        for _ in 0..4 {
            let conn = pool
                .get_connection(GetConnectionOptions::new(&filter, &selector))
                .unwrap();
            assert_eq!(conn.id(), "http://node-2:9200/");
        }
    }

    #[test]
    fn test_get_connection_all_dead_fallback() {
        let pool = pool_with(
            ResurrectStrategy::None,
            &["http://node-1:9200", "http://node-2:9200"],
        );
        for conn in pool.connections() {
            pool.mark_dead(&conn);
        }

        let filter = NodeFilter::All;
        let selector = NodeSelector::round_robin();
        let conn = pool.get_connection(GetConnectionOptions::new(&filter, &selector));
        assert_eq!(conn.unwrap().status(), ConnectionStatus::Dead);
    }

    #[test]
    fn test_get_connection_none_when_filtered_empty() {
        let pool = three_nodes();
        let selector = NodeSelector::round_robin();

        let nothing = NodeFilter::custom(|_| false);
        assert!(pool
            .get_connection(GetConnectionOptions::new(&nothing, &selector))
            .is_none());

        let empty = ConnectionPool::new(PoolOptions::default());
        assert!(empty
            .get_connection(GetConnectionOptions::new(&NodeFilter::All, &selector))
            .is_none());
    }

    #[test]
    fn test_get_connection_applies_default_filter() {
        let pool = three_nodes();
        for conn in pool.connections() {
            if conn.id() != "http://node-3:9200/" {
                conn.set_role(roles::CLUSTER_MANAGER, true).unwrap();
                conn.set_role(roles::DATA, false).unwrap();
                conn.set_role(roles::INGEST, false).unwrap();
            }
        }

        let filter = NodeFilter::Default;
        let selector = NodeSelector::round_robin();
        for _ in 0..3 {
            let conn = pool
                .get_connection(GetConnectionOptions::new(&filter, &selector))
                .unwrap();
            assert_eq!(conn.id(), "http://node-3:9200/");
        }
    }

    #[test]
    fn test_resurrect_none_strategy() {
        let pool = pool_with(ResurrectStrategy::None, &["http://node-1:9200"]);
        let conn = pool.connection("http://node-1:9200/").unwrap();
        pool.mark_dead_at(&conn, 0);

        pool.resurrect(ResurrectOptions {
            now: Some(u64::MAX),
            ..Default::default()
        });
        assert_eq!(conn.status(), ConnectionStatus::Dead);
    }

    #[test]
    fn test_resurrect_optimistic() {
        let pool = pool_with(
            ResurrectStrategy::Optimistic,
            &["http://node-1:9200", "http://node-2:9200"],
        );
        let conn = pool.connection("http://node-1:9200/").unwrap();
        pool.mark_dead_at(&conn, 1_000);
        let mut events = pool.events().subscribe();

        // Deadline not reached yet
        pool.resurrect(ResurrectOptions {
            now: Some(1_000 + MINUTE - 1),
            ..Default::default()
        });
        assert_eq!(conn.status(), ConnectionStatus::Dead);

        pool.resurrect(ResurrectOptions {
            now: Some(1_000 + MINUTE),
            request_id: Some(42),
            ..Default::default()
        });
        assert_eq!(conn.status(), ConnectionStatus::Alive);
        assert_eq!(conn.dead_count(), 0);
        assert!(pool.dead_ids().is_empty());

        match events.try_recv().unwrap() {
            Event::Resurrect(event) => {
                assert_eq!(event.strategy, ResurrectStrategy::Optimistic);
                assert_eq!(event.request_id, Some(42));
                assert!(event.is_alive);
                assert_eq!(event.connection.id, "http://node-1:9200/");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_get_connection_resurrects_first() {
        let pool = pool_with(ResurrectStrategy::Optimistic, &["http://node-1:9200"]);
        let conn = pool.connection("http://node-1:9200/").unwrap();
        pool.mark_dead_at(&conn, 0);

        let filter = NodeFilter::All;
        let selector = NodeSelector::round_robin();
        let mut options = GetConnectionOptions::new(&filter, &selector);
        options.now = Some(MINUTE);
        let picked = pool.get_connection(options).unwrap();
        assert!(picked.is_alive());
    }

    #[test]
    fn test_update_is_idempotent() {
        let pool = ConnectionPool::new(PoolOptions::default());
        let nodes = vec![
            node("http://127.0.0.1:9200", "a1"),
            node("http://127.0.0.1:9201", "a2"),
        ];

        pool.update(nodes.clone()).unwrap();
        let first = pool.connections();
        pool.update(nodes).unwrap();
        let second = pool.connections();

        assert_eq!(first.len(), 2);
        for (a, b) in first.iter().zip(second.iter()) {
            assert!(Arc::ptr_eq(a, b));
        }
    }

    #[test]
    fn test_update_matches_by_url_and_rekeys() {
        let pool = pool_with(ResurrectStrategy::Ping, &["http://127.0.0.1:9200"]);
        let original = pool.connection("http://127.0.0.1:9200/").unwrap();
        pool.mark_dead(&original);

        pool.update(vec![
            node("http://127.0.0.1:9200", "a1"),
            node("http://127.0.0.1:9201", "a2"),
        ])
        .unwrap();

        let rekeyed = pool.connection("a1").unwrap();
        assert!(Arc::ptr_eq(&original, &rekeyed));
        assert!(rekeyed.is_alive());
        assert_eq!(rekeyed.dead_count(), 0);
        assert_eq!(pool.size(), 2);
    }

    #[test]
    fn test_update_drops_missing_and_clears_dead() {
        let pool = ConnectionPool::new(PoolOptions::default());
        pool.update(vec![
            node("http://127.0.0.1:9200", "a1"),
            node("http://127.0.0.1:9201", "a2"),
        ])
        .unwrap();
        let a2 = pool.connection("a2").unwrap();
        pool.mark_dead(&a2);

        pool.update(vec![
            node("http://127.0.0.1:9201", "a2"),
            node("http://127.0.0.1:9202", "a3"),
        ])
        .unwrap();

        let ids: Vec<String> = pool.connections().iter().map(|c| c.id()).collect();
        assert_eq!(ids, vec!["a2", "a3"]);
        assert!(pool.dead_ids().is_empty());
        assert!(pool.connection("a1").is_none());
    }

    #[test]
    fn test_update_closes_removed_without_runtime() {
        let pool = pool_with(
            ResurrectStrategy::Ping,
            &["http://127.0.0.1:9200", "http://127.0.0.1:9201"],
        );
        let removed = pool.connection("http://127.0.0.1:9201/").unwrap();

        pool.update(vec![node("http://127.0.0.1:9200", "a1")]).unwrap();

        assert_eq!(pool.size(), 1);
        assert!(removed.is_closed());
        assert!(!pool.connection("a1").unwrap().is_closed());
    }

    #[test]
    fn test_update_failure_leaves_pool_untouched() {
        let pool = ConnectionPool::new(PoolOptions::default());
        pool.update(vec![node("http://127.0.0.1:9200", "a1")]).unwrap();

        let result = pool.update(vec![
            node("http://127.0.0.1:9201", "a2"),
            node("ftp://127.0.0.1:9202", "a3"),
        ]);
        assert!(matches!(result, Err(Error::Configuration(_))));

        let ids: Vec<String> = pool.connections().iter().map(|c| c.id()).collect();
        assert_eq!(ids, vec!["a1"]);
    }

    #[tokio::test]
    async fn test_empty() {
        let pool = three_nodes();
        let conn = pool.connection("http://node-1:9200/").unwrap();
        pool.mark_dead(&conn);

        pool.empty().await;
        assert_eq!(pool.size(), 0);
        assert!(pool.dead_ids().is_empty());
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_remove_connection() {
        let pool = three_nodes();
        let conn = pool.connection("http://node-2:9200/").unwrap();
        pool.mark_dead(&conn);

        pool.remove_connection(&conn).await;
        assert_eq!(pool.size(), 2);
        assert!(pool.dead_ids().is_empty());
        assert!(conn.is_closed());
    }

    #[test]
    fn test_custom_nodes_to_host() {
        let pool = ConnectionPool::new(PoolOptions {
            nodes_to_host: Arc::new(|_nodes: &Value, _protocol: &str| {
                Ok(vec![NodeOptions::from_url("http://fixed:9200")?])
            }),
            ..Default::default()
        });
        let hosts = pool.nodes_to_host(&serde_json::json!({}), "http:").unwrap();
        assert_eq!(hosts.len(), 1);
        assert_eq!(hosts[0].url.as_str(), "http://fixed:9200/");
    }

    #[test]
    fn test_snapshot() {
        let pool = three_nodes();
        let snapshot = pool.snapshot();
        assert_eq!(snapshot.len(), 3);
        assert!(snapshot.iter().all(|s| s.status == ConnectionStatus::Alive));
    }
}
