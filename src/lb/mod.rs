//! Node choice and node health
//!
//! Everything that decides *which* connection a request goes to, and when a
//! connection that failed may be tried again.
//!
//! # Components
//!
//! - [`NodeFilter`]: narrows the candidates. The default shields
//!   cluster-manager-only nodes from ordinary traffic.
//! - [`NodeSelector`]: picks one candidate. Round-robin, random, or a
//!   caller-supplied function.
//! - [`ResurrectStrategy`]: how a dead connection is brought back once its
//!   backoff has elapsed (`ping`, `optimistic`, `none`).
//! - [`nodes_to_host`]: turns a node discovery answer into node descriptors
//!   the pool can reconcile against.
//!
//! # Backoff
//!
//! A connection marked dead for the n-th consecutive time is not retried
//! before `base * 2^min(n - 1, cutoff)`. With the defaults (60s, 5) the wait
//! grows from one minute to a ceiling of 32 minutes.
//!
//! # Example Usage
//!
//! ```rust,no_run
//! use searchpool::lb::{NodeFilter, NodeSelector};
//! use searchpool::pool::{ConnectionPool, GetConnectionOptions, PoolOptions};
//!
//! # fn example() -> searchpool::Result<()> {
//! let pool = ConnectionPool::new(PoolOptions::default());
//! pool.add_url("http://search-1:9200")?;
//! pool.add_url("http://search-2:9200")?;
//!
//! let selector = NodeSelector::round_robin();
//! let filter = NodeFilter::Default;
//!
//! if let Some(conn) = pool.get_connection(GetConnectionOptions::new(&filter, &selector)) {
//!     println!("Selected node: {}", conn.id());
//! }
//! # Ok(())
//! # }
//! ```

pub mod filter;
pub mod health;
pub mod selector;
pub mod sniff;

pub use filter::{default_node_filter, NodeFilter};
pub use health::{
    is_unavailable_status, resurrect_backoff, ResurrectStrategy, DEFAULT_RESURRECT_TIMEOUT,
    DEFAULT_RESURRECT_TIMEOUT_CUTOFF,
};
pub use selector::NodeSelector;
pub use sniff::{nodes_to_host, NodesToHostFn, SniffReason, DEFAULT_SNIFF_ENDPOINT};
