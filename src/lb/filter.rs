//! Node filters: which connections are eligible for a request.

use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::pool::{roles, Connection};

pub type FilterFn = Arc<dyn Fn(&Connection) -> bool + Send + Sync>;

/// Narrows the candidate set before selection
#[derive(Clone, Default)]
pub enum NodeFilter {
    /// Shields cluster-manager-only nodes from ordinary traffic
    #[default]
    Default,
    /// Every connection is eligible
    All,
    Custom(FilterFn),
}

impl NodeFilter {
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&Connection) -> bool + Send + Sync + 'static,
    {
        NodeFilter::Custom(Arc::new(f))
    }

    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "default" => Ok(NodeFilter::Default),
            "all" | "none" => Ok(NodeFilter::All),
            other => Err(Error::Configuration(format!(
                "Invalid node filter: '{}'",
                other
            ))),
        }
    }

    pub fn accepts(&self, connection: &Connection) -> bool {
        match self {
            NodeFilter::Default => default_node_filter(connection),
            NodeFilter::All => true,
            NodeFilter::Custom(f) => f(connection),
        }
    }
}

/// Reject nodes whose only role is cluster manager (or its legacy `master` name).
///
/// `data` and `ingest` must both be explicitly off; a role map that leaves
/// them out keeps the node.
pub fn default_node_filter(connection: &Connection) -> bool {
    let roles = connection.roles();
    let manager = roles.get(roles::CLUSTER_MANAGER) || roles.get(roles::MASTER);
    let off = |role: &str| roles.explicit(role) == Some(false);
    !(manager && off(roles::DATA) && off(roles::INGEST))
}

impl fmt::Debug for NodeFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeFilter::Default => f.write_str("Default"),
            NodeFilter::All => f.write_str("All"),
            NodeFilter::Custom(_) => f.write_str("Custom"),
        }
    }
}
