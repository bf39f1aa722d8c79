//! Sniff reasons and mapping of a `_nodes` answer to node descriptors.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::warn;
use url::Url;

use crate::error::{Error, Result};
use crate::pool::{NodeOptions, Roles};

pub const DEFAULT_SNIFF_ENDPOINT: &str = "_nodes/_all/http";

/// Why a topology discovery round was started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SniffReason {
    SniffOnStart,
    SniffInterval,
    SniffOnConnectionFault,
    Default,
}

impl fmt::Display for SniffReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SniffReason::SniffOnStart => "sniff-on-start",
            SniffReason::SniffInterval => "sniff-interval",
            SniffReason::SniffOnConnectionFault => "sniff-on-connection-fault",
            SniffReason::Default => "default",
        };
        f.write_str(s)
    }
}

/// Maps a node discovery answer into node descriptors
pub type NodesToHostFn = Arc<dyn Fn(&Value, &str) -> Result<Vec<NodeOptions>> + Send + Sync>;

/// Default mapping of a `_nodes/_all/http` answer.
///
/// `protocol` is the scheme of the node that answered (`http:` or `https:`).
/// Nodes without an `http.publish_address` are skipped.
pub fn nodes_to_host(nodes: &Value, protocol: &str) -> Result<Vec<NodeOptions>> {
    let nodes = match nodes.as_object() {
        Some(nodes) => nodes,
        None => return Ok(Vec::new()),
    };

    let protocol = protocol.trim_end_matches(':');
    let mut hosts = Vec::with_capacity(nodes.len());

    for (id, node) in nodes {
        let address = match node.pointer("/http/publish_address").and_then(Value::as_str) {
            Some(address) => address,
            None => {
                warn!(node_id = %id, "Sniffed node has no http publish address, skipping");
                continue;
            }
        };

        let address = if address.starts_with("http") {
            address.to_string()
        } else {
            format!("{}://{}", protocol, normalize_publish_address(address))
        };

        let url = Url::parse(&address).map_err(|e| {
            Error::Configuration(format!("Invalid publish address '{}': {}", address, e))
        })?;

        let role_names: Vec<&str> = node
            .get("roles")
            .and_then(Value::as_array)
            .map(|roles| roles.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();

        let mut options = NodeOptions::new(url);
        options.id = Some(id.clone());
        options.roles = Some(Roles::from_names(role_names));
        hosts.push(options);
    }

    Ok(hosts)
}

/// `hostname/ip:port` becomes `hostname:port`; a bare `/ip:port` keeps the ip
fn normalize_publish_address(address: &str) -> String {
    let (hostname, rest) = match address.split_once('/') {
        Some(parts) => parts,
        None => return address.to_string(),
    };

    let port = rest.rsplit_once(':').map(|(_, port)| port).unwrap_or_default();
    if hostname.is_empty() || port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
        return rest.to_string();
    }

    format!("{}:{}", hostname, port)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::roles;
    use serde_json::json;

    #[test]
    fn test_nodes_to_host_basic() {
        let nodes = json!({
            "a1": {
                "http": { "publish_address": "127.0.0.1:9200" },
                "roles": ["cluster_manager", "data", "ingest"]
            },
            "a2": {
                "http": { "publish_address": "127.0.0.1:9201" },
                "roles": ["cluster_manager"]
            }
        });

        let hosts = nodes_to_host(&nodes, "http:").unwrap();
        assert_eq!(hosts.len(), 2);

        assert_eq!(hosts[0].url.as_str(), "http://127.0.0.1:9200/");
        assert_eq!(hosts[0].id.as_deref(), Some("a1"));
        let r = hosts[0].roles.as_ref().unwrap();
        assert!(r.get(roles::CLUSTER_MANAGER) && r.get(roles::DATA) && r.get(roles::INGEST));

        let r = hosts[1].roles.as_ref().unwrap();
        assert!(r.get(roles::CLUSTER_MANAGER));
        assert!(!r.get(roles::DATA));
        assert!(!r.get(roles::INGEST));
        assert!(!r.get(roles::MASTER));
    }

    #[test]
    fn test_nodes_to_host_hostname_and_ip() {
        let nodes = json!({
            "a1": { "http": { "publish_address": "example.com/127.0.0.1:9200" }, "roles": [] }
        });

        let hosts = nodes_to_host(&nodes, "https:").unwrap();
        assert_eq!(hosts[0].url.as_str(), "https://example.com:9200/");
    }

    #[test]
    fn test_nodes_to_host_ipv6() {
        let nodes = json!({
            "a1": { "http": { "publish_address": "[::1]:9200" }, "roles": ["data"] },
            "a2": { "http": { "publish_address": "localhost/[::1]:9201" }, "roles": ["data"] }
        });

        let hosts = nodes_to_host(&nodes, "http:").unwrap();
        assert_eq!(hosts[0].url.as_str(), "http://[::1]:9200/");
        assert_eq!(hosts[1].url.as_str(), "http://localhost:9201/");
    }

    #[test]
    fn test_nodes_to_host_keeps_scheme() {
        let nodes = json!({
            "a1": { "http": { "publish_address": "http://10.0.0.5:9200" }, "roles": ["data"] }
        });

        let hosts = nodes_to_host(&nodes, "https:").unwrap();
        assert_eq!(hosts[0].url.as_str(), "http://10.0.0.5:9200/");
    }

    #[test]
    fn test_nodes_to_host_skips_nodes_without_http() {
        let nodes = json!({
            "a1": { "roles": ["data"] },
            "a2": { "http": { "publish_address": "127.0.0.1:9200" } }
        });

        let hosts = nodes_to_host(&nodes, "http:").unwrap();
        assert_eq!(hosts.len(), 1);
        assert_eq!(hosts[0].id.as_deref(), Some("a2"));
        // No roles array at all: every role is off
        assert!(!hosts[0].roles.as_ref().unwrap().get(roles::DATA));
    }

    #[test]
    fn test_normalize_publish_address() {
        assert_eq!(normalize_publish_address("10.0.0.1:9200"), "10.0.0.1:9200");
        assert_eq!(normalize_publish_address("node/10.0.0.1:9200"), "node:9200");
        assert_eq!(normalize_publish_address("/10.0.0.1:9200"), "10.0.0.1:9200");
    }

    #[test]
    fn test_sniff_reason_serialization() {
        let s = serde_json::to_string(&SniffReason::SniffOnConnectionFault).unwrap();
        assert_eq!(s, "\"SNIFF_ON_CONNECTION_FAULT\"");
        assert_eq!(SniffReason::SniffInterval.to_string(), "sniff-interval");
    }
}
