//! Diagnostics command line
//!
//! ```bash
//! # Is the cluster reachable?
//! searchpool --node http://localhost:9200 ping
//!
//! # Arbitrary request, body as JSON
//! searchpool --node http://localhost:9200 request POST /logs/_search --body '{"size":1}'
//!
//! # Discover nodes and print the resulting pool
//! searchpool --config searchpool.yaml sniff
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hyper::Method;
use serde_json::Value;
use tracing::debug;

use crate::client::Client;
use crate::config;
use crate::transport::{RequestOptions, ResponseBody, TransportRequest};

#[derive(Parser, Debug)]
#[command(name = "searchpool")]
#[command(version, about = "Connection pool and retrying transport for search clusters", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file path
    #[arg(long, global = true, env = "SEARCHPOOL_CONFIG")]
    pub config: Option<String>,

    /// Node URL, repeatable. Replaces the configured nodes.
    #[arg(long = "node", global = true)]
    pub nodes: Vec<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "warn")]
    pub log_level: String,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// HEAD / against the cluster
    Ping,

    /// Send one request through the transport
    Request {
        /// HTTP method
        method: String,

        /// Path, e.g. /_cluster/health
        path: String,

        /// JSON body
        #[arg(long)]
        body: Option<String>,
    },

    /// Discover the cluster nodes and update the pool
    Sniff,

    /// Print the pool state
    Nodes,
}

/// Execute the parsed command line
pub async fn run(cli: Cli) -> Result<()> {
    let config = config::load_config(cli.config.as_deref(), &cli.nodes)?;
    debug!(nodes = ?config.nodes, "Configuration loaded");

    let client = Client::new(config).context("Failed to create client")?;

    let outcome = match cli.command {
        Commands::Ping => cmd_ping(&client).await,
        Commands::Request { method, path, body } => {
            cmd_request(&client, &method, &path, body.as_deref()).await
        }
        Commands::Sniff => cmd_sniff(&client).await,
        Commands::Nodes => cmd_nodes(&client),
    };

    client.close().await;
    outcome
}

async fn cmd_ping(client: &Client) -> Result<()> {
    let alive = client.ping().await.context("Ping failed")?;
    if alive {
        println!("ok");
        Ok(())
    } else {
        anyhow::bail!("Cluster did not answer the ping")
    }
}

async fn cmd_request(client: &Client, method: &str, path: &str, body: Option<&str>) -> Result<()> {
    let method: Method = method
        .to_ascii_uppercase()
        .parse()
        .context(format!("Invalid HTTP method: {}", method))?;

    let mut request = TransportRequest::new(method, path);
    if let Some(body) = body {
        let body: Value = serde_json::from_str(body).context("Body is not valid JSON")?;
        request = request.with_json(body);
    }

    let response = client
        .send(request, RequestOptions::default())
        .await
        .context("Request failed")?;

    if let Some(warnings) = &response.warnings {
        for warning in warnings {
            eprintln!("warning: {}", warning);
        }
    }

    match &response.body {
        ResponseBody::Json(value) => println!("{}", serde_json::to_string_pretty(value)?),
        ResponseBody::Text(text) => println!("{}", text),
        ResponseBody::Bool(b) => println!("{}", b),
    }
    Ok(())
}

async fn cmd_sniff(client: &Client) -> Result<()> {
    let hosts = client.sniff().await.context("Sniffing failed")?;
    for host in &hosts {
        println!("{}", host);
    }
    println!("{} node(s) discovered", hosts.len());
    Ok(())
}

fn cmd_nodes(client: &Client) -> Result<()> {
    let snapshot = client.pool().snapshot();
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}
