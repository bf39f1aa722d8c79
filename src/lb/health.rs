//! Resurrection strategies, dead-connection backoff and the ping check.

use hyper::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

use crate::error::{Error, Result};
use crate::pool::{Connection, RequestParams};

/// Default base delay before a dead connection may be retried
pub const DEFAULT_RESURRECT_TIMEOUT: Duration = Duration::from_secs(60);

/// Cap on the backoff exponent: the wait never exceeds base * 2^5
pub const DEFAULT_RESURRECT_TIMEOUT_CUTOFF: u32 = 5;

/// How a dead connection whose timeout has elapsed is brought back
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResurrectStrategy {
    /// Dead connections stay dead until the pool is updated
    None,
    /// Probe the node first, restore it only when it answers
    #[default]
    Ping,
    /// Restore it immediately and let the next request find out
    Optimistic,
}

impl ResurrectStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResurrectStrategy::None => "none",
            ResurrectStrategy::Ping => "ping",
            ResurrectStrategy::Optimistic => "optimistic",
        }
    }
}

impl FromStr for ResurrectStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(ResurrectStrategy::None),
            "ping" => Ok(ResurrectStrategy::Ping),
            "optimistic" => Ok(ResurrectStrategy::Optimistic),
            other => Err(Error::Configuration(format!(
                "Invalid resurrection strategy: '{}'",
                other
            ))),
        }
    }
}

impl std::fmt::Display for ResurrectStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backoff before the next resurrection attempt, in milliseconds.
///
/// `base * 2^min(dead_count - 1, cutoff)`: one failure waits `base`, and
/// the exponent stops growing at `cutoff`.
pub fn resurrect_backoff(base: Duration, dead_count: u32, cutoff: u32) -> u64 {
    let exponent = dead_count.saturating_sub(1).min(cutoff);
    let base_ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
    base_ms.saturating_mul(1u64 << exponent.min(63))
}

/// Statuses that mean the node is up but cannot serve
pub fn is_unavailable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT
    )
}

/// Probe a node with `HEAD /`. Any answer except 502/503/504 counts as alive.
pub async fn ping(connection: &Connection, timeout: Duration) -> bool {
    let params = RequestParams {
        method: Method::HEAD,
        path: "/".to_string(),
        timeout: Some(timeout),
        ..Default::default()
    };

    match connection.request(params, None).await {
        Ok(response) => {
            let alive = !is_unavailable_status(response.status());
            debug!(
                connection = %connection.id(),
                status = response.status().as_u16(),
                alive,
                "Resurrection probe answered"
            );
            alive
        }
        Err(e) => {
            debug!(connection = %connection.id(), error = %e, "Resurrection probe failed");
            false
        }
    }
}
