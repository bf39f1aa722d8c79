use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::events::Event;
use crate::lb::SniffReason;
use crate::pool::ConnectionPool;
use crate::serializer::Serializer;
use crate::transport::{ApiResponse, RequestOptions, Transport, TransportRequest};

/// Pool, serializer and transport wired from one [`Config`]
///
/// Clones share the same pool and transport.
#[derive(Clone, Debug)]
pub struct Client {
    config: Arc<Config>,
    transport: Transport,
}

impl Client {
    pub fn new(config: Config) -> Result<Self> {
        if config.nodes.is_empty() {
            return Err(Error::Configuration("Missing node(s) option".to_string()));
        }

        let pool = ConnectionPool::new(config.pool_options()?);
        for node in &config.nodes {
            pool.add_url(node)?;
        }

        let serializer = Serializer::new(config.poisoning_protection()?);
        let transport = Transport::new(pool, serializer, config.transport_options()?)?;

        info!(name = %config.name, nodes = config.nodes.len(), "Client created");

        Ok(Self {
            config: Arc::new(config),
            transport,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn pool(&self) -> &ConnectionPool {
        self.transport.pool()
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Receive request, response, sniff and resurrect events
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.pool().events().subscribe()
    }

    /// `HEAD /`: true when the cluster answers with a success status
    pub async fn ping(&self) -> Result<bool> {
        let response = self
            .transport
            .request(TransportRequest::head("/"), RequestOptions::default())
            .await?;
        Ok(response.body.as_bool().unwrap_or(false))
    }

    /// `GET /`
    pub async fn info(&self) -> Result<Value> {
        let response = self
            .transport
            .request(TransportRequest::get("/"), RequestOptions::default())
            .await?;
        Ok(response.body.into_value())
    }

    pub async fn send(&self, request: TransportRequest, options: RequestOptions) -> Result<ApiResponse> {
        self.transport.request(request, options).await
    }

    pub async fn sniff(&self) -> Result<Vec<String>> {
        self.transport.sniff(SniffReason::Default).await
    }

    /// Close every connection once its in-flight requests finish
    pub async fn close(&self) {
        self.pool().empty().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requires_nodes() {
        let err = Client::new(Config::new()).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_builds_pool_from_config() {
        let mut config = Config::with_nodes(["http://localhost:9200", "http://localhost:9201"]);
        config.node_selector = "random".into();
        let client = Client::new(config).unwrap();

        assert_eq!(client.pool().size(), 2);
        assert!(client.pool().connection("http://localhost:9201/").is_some());
        assert_eq!(client.transport().options().max_retries, 3);
    }

    #[test]
    fn test_invalid_node_url() {
        let config = Config::with_nodes(["ftp://localhost:21"]);
        assert!(matches!(Client::new(config), Err(Error::Configuration(_))));
    }

    #[tokio::test]
    async fn test_close_empties_pool() {
        let client = Client::new(Config::with_nodes(["http://localhost:9200"])).unwrap();
        client.close().await;
        assert_eq!(client.pool().size(), 0);
    }
}
