//! The control channel the client drives.
//!
//! The control channel knows the available shards and negotiates relays with them.  Its
//! protocol is not part of this crate, implementations are provided through [`Tunnel`].

use std::{fmt, sync::Arc};

use n0_future::boxed::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::{directory::Shard, link::TransportKind};

/// Returned for both addresses when the control channel is not connected.
pub const ERROR_UNCONNECTED: &str = "ERROR_UNCONNECTED";

/// Returned for both addresses when the requested shard is not in the directory.
pub const ERROR_SHARD_NOT_FOUND: &str = "ERROR_SHARD_NOT_FOUND";

/// Marker contained in any address that signals a failed negotiation.
pub const ERROR_MARKER: &str = "ERROR";

/// Connectivity changes of the control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum TunnelEvent {
    /// The control channel is connected.
    Connected,
    /// The control channel lost its connection.
    Disconnected,
}

/// Callback invoked for every [`TunnelEvent`].
///
/// Handlers are invoked on whatever task the tunnel implementation chooses.  They must not
/// block, and must tolerate the same event being delivered more than once.
pub type EventHandler = Box<dyn Fn(TunnelEvent) + Send + Sync + 'static>;

/// The host and guest addresses of a negotiated relay.
///
/// A failed negotiation is signalled in-band: either address contains [`ERROR_MARKER`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, derive_more::Display)]
#[display("host={host} guest={guest}")]
#[serde(rename_all = "camelCase")]
pub struct RelayAddrs {
    /// The address the data link connects to.
    pub host: String,
    /// The address handed to the remote guest.
    pub guest: String,
}

impl RelayAddrs {
    /// Creates a new address pair.
    pub fn new(host: impl Into<String>, guest: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            guest: guest.into(),
        }
    }

    /// The pair returned when the control channel is not connected.
    pub fn unconnected() -> Self {
        Self::new(ERROR_UNCONNECTED, ERROR_UNCONNECTED)
    }

    /// The pair returned when the requested shard is unknown.
    pub fn shard_not_found() -> Self {
        Self::new(ERROR_SHARD_NOT_FOUND, ERROR_SHARD_NOT_FOUND)
    }

    /// Does either address signal an error?
    pub fn is_error(&self) -> bool {
        self.host.contains(ERROR_MARKER) || self.guest.contains(ERROR_MARKER)
    }
}

/// The control channel of the relay service.
pub trait Tunnel: fmt::Debug + Send + Sync + 'static {
    /// Starts connecting.
    ///
    /// Connectivity is reported through the handlers registered with
    /// [`Tunnel::subscribe`].
    fn start(&self) {}

    /// Registers a handler for connectivity changes.
    fn subscribe(&self, handler: EventHandler);

    /// Lists the shards currently offered by the service.
    ///
    /// An unreachable service yields an empty list.
    fn list_shards(&self) -> BoxFuture<Vec<Shard>>;

    /// Negotiates a relay through the shard at `shard_addr`.
    fn negotiate_relay(&self, shard_addr: &str, transport: TransportKind)
    -> BoxFuture<RelayAddrs>;
}

impl<T: Tunnel> Tunnel for Arc<T> {
    fn start(&self) {
        self.as_ref().start()
    }

    fn subscribe(&self, handler: EventHandler) {
        self.as_ref().subscribe(handler)
    }

    fn list_shards(&self) -> BoxFuture<Vec<Shard>> {
        self.as_ref().list_shards()
    }

    fn negotiate_relay(
        &self,
        shard_addr: &str,
        transport: TransportKind,
    ) -> BoxFuture<RelayAddrs> {
        self.as_ref().negotiate_relay(shard_addr, transport)
    }
}
