//! searchpool - connection pool and retrying transport for multi-node search clusters

pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod lb;
pub mod pool;
pub mod serializer;
pub mod transport;

pub use client::Client;
pub use config::Config;
pub use error::{Error, ResponseError, Result};
pub use pool::{Connection, ConnectionPool};
pub use serializer::Serializer;
pub use transport::Transport;
