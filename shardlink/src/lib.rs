//! Shard selection and relay link supervision.
//!
//! A client of a relay service is handed a list of candidate shards by its control channel.
//! This crate measures the round-trip time to each shard, ranks them, and keeps a single
//! relayed data link to the shard the caller picks.
//!
//! - [`Prober`] runs one bounded probe round over an ephemeral UDP socket.
//! - [`rank`] orders shards by measured round-trip time.
//! - [`EndpointDirectory`] holds the last ranked set of shards.
//! - [`LinkSupervisor`] owns at most one active [`DataLink`].
//! - [`Client`] ties these together behind the [`Tunnel`] control channel.
//!
//! The control channel and the data-plane link are provided by the caller through the
//! [`Tunnel`] and [`LinkFactory`] traits.

#![cfg_attr(shardlink_docsrs, feature(doc_auto_cfg))]
#![deny(missing_docs, rustdoc::broken_intra_doc_links)]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]

pub mod client;
pub mod config;
pub mod defaults;
pub mod directory;
pub mod echo;
pub mod link;
pub mod probe;
pub mod rank;
pub mod tunnel;
mod util;

pub use self::{
    client::{Client, ClientStatus, ConnectionState, RequestRelayError},
    config::{Config, ConfigError},
    directory::{EndpointDirectory, Shard},
    echo::EchoServer,
    link::{
        DataLink, EstablishError, LinkFactory, LinkStatus, LinkSupervisor, SubPeerStatus,
        TransportKind, UnsupportedTransportError,
    },
    probe::{ProbeError, ProbeReport, Prober},
    rank::rank,
    tunnel::{EventHandler, RelayAddrs, Tunnel, TunnelEvent},
};
