//! Node selectors: round-robin, random, or a caller-supplied pick.

use rand::Rng;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::pool::Connection;

/// Caller-supplied selection function. Returns an index into the candidates.
pub type SelectorFn = Arc<dyn Fn(&[Arc<Connection>]) -> usize + Send + Sync>;

/// Picks one connection among the eligible candidates
#[derive(Clone)]
pub enum NodeSelector {
    /// Cursor-based rotation over the currently eligible list
    RoundRobin(Arc<AtomicUsize>),
    /// Uniform random pick
    Random,
    Custom(SelectorFn),
}

impl NodeSelector {
    pub fn round_robin() -> Self {
        NodeSelector::RoundRobin(Arc::new(AtomicUsize::new(0)))
    }

    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&[Arc<Connection>]) -> usize + Send + Sync + 'static,
    {
        NodeSelector::Custom(Arc::new(f))
    }

    /// Resolve a configured strategy name
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "round-robin" | "round_robin" => Ok(Self::round_robin()),
            "random" => Ok(NodeSelector::Random),
            other => Err(Error::Configuration(format!(
                "Invalid node selector: '{}'",
                other
            ))),
        }
    }

    /// Select a connection. Returns None only for an empty candidate list
    /// or a custom selector answering out of range.
    pub fn select(&self, candidates: &[Arc<Connection>]) -> Option<Arc<Connection>> {
        if candidates.is_empty() {
            return None;
        }

        let index = match self {
            NodeSelector::RoundRobin(cursor) => {
                // The cursor is never reset, it wraps over whatever is visible now
                cursor.fetch_add(1, Ordering::Relaxed) % candidates.len()
            }
            NodeSelector::Random => rand::thread_rng().gen_range(0..candidates.len()),
            NodeSelector::Custom(f) => f(candidates),
        };

        candidates.get(index).cloned()
    }
}

impl Default for NodeSelector {
    fn default() -> Self {
        Self::round_robin()
    }
}

impl fmt::Debug for NodeSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeSelector::RoundRobin(cursor) => f
                .debug_tuple("RoundRobin")
                .field(&cursor.load(Ordering::Relaxed))
                .finish(),
            NodeSelector::Random => f.write_str("Random"),
            NodeSelector::Custom(_) => f.write_str("Custom"),
        }
    }
}
