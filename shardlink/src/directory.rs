//! The last known set of candidate shards.

use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    probe::{ProbeError, Prober},
    rank::rank,
};

/// A candidate shard a client may relay through.
///
/// Identified by its `host:port` address string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Shard {
    /// The `host:port` the shard answers probes on.
    pub addr: String,
    /// Mean round-trip time of the last probe round.
    ///
    /// `None` until a probe round received at least one reply from this shard.
    #[serde(default)]
    pub rtt: Option<Duration>,
}

impl Shard {
    /// Creates an unmeasured shard.
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            rtt: None,
        }
    }

    /// The round-trip time in milliseconds, if measured.
    pub fn rtt_ms(&self) -> Option<f64> {
        self.rtt.map(|rtt| rtt.as_nanos() as f64 / 1e6)
    }
}

impl fmt::Display for Shard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.rtt {
            Some(rtt) => write!(f, "{} ({rtt:?})", self.addr),
            None => write!(f, "{} (unmeasured)", self.addr),
        }
    }
}

/// Holds the ranked shards of the last refresh.
///
/// Callers only ever get copies out; the stored list is replaced wholesale by
/// [`EndpointDirectory::refresh`].
#[derive(Debug, Default, Clone)]
pub struct EndpointDirectory {
    shards: Vec<Shard>,
}

impl EndpointDirectory {
    /// Creates an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Probes `raw`, ranks the result and stores it.
    ///
    /// When `connected` is false nothing is probed, an empty list is returned and the
    /// stored shards are left as they were.
    ///
    /// Any round-trip time carried in `raw` is discarded before probing, so a shard that
    /// does not answer this round ends up unmeasured rather than keeping an old value.
    pub async fn refresh(
        &mut self,
        connected: bool,
        prober: &Prober,
        raw: Vec<Shard>,
    ) -> Result<Vec<Shard>, ProbeError> {
        if !connected {
            debug!("not connected, skipping shard refresh");
            return Ok(Vec::new());
        }
        let fresh = raw.into_iter().map(|shard| Shard::new(shard.addr)).collect();
        let measured = prober.probe(fresh).await?;
        let ranked = rank(measured);
        debug!(shards = ranked.len(), "shard directory refreshed");
        self.shards = ranked.clone();
        Ok(ranked)
    }

    /// Looks up a shard by its address.
    pub fn find_by_addr(&self, addr: &str) -> Option<Shard> {
        self.shards.iter().find(|shard| shard.addr == addr).cloned()
    }

    /// Returns a copy of all shards, fastest first.
    pub fn shards(&self) -> Vec<Shard> {
        self.shards.clone()
    }

    /// How many shards are known?
    pub fn len(&self) -> usize {
        self.shards.len()
    }

    /// Are there any shards in this directory?
    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }
}
