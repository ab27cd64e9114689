//! Supervision of the relayed data link.
//!
//! At most one [`DataLink`] is active at any time.  Establishing a new link first stops the
//! current one, before the new link is even constructed.

use std::{
    fmt, io,
    net::{Ipv4Addr, SocketAddr},
    str::FromStr,
    time::{Duration, SystemTime},
};

use nested_enum_utils::common_fields;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use strum::IntoEnumIterator;
use tracing::{debug, info, instrument, warn};

use crate::util::resolve_ipv4;

/// The transports a data link can run over.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::AsRefStr,
    strum::EnumIter,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Plain UDP.
    Udp,
}

/// The transport name is not one of the [`TransportKind`]s.
#[derive(Debug, Snafu)]
#[snafu(display("Unsupported transport {transport:?}"))]
pub struct UnsupportedTransportError {
    transport: String,
    backtrace: Option<snafu::Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
}

impl UnsupportedTransportError {
    /// The rejected transport name.
    pub fn transport(&self) -> &str {
        &self.transport
    }
}

impl FromStr for TransportKind {
    type Err = UnsupportedTransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TransportKind::iter()
            .find(|kind| kind.as_ref().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnsupportedTransportSnafu { transport: s }.build())
    }
}

/// The status of one auxiliary peer connection of a data link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubPeerStatus {
    /// Address of the remote peer.
    pub remote_addr: SocketAddr,
    /// Local address of the socket talking to the peer.
    pub local_addr: SocketAddr,
    /// Last measured delay to the peer.
    pub delay: Duration,
    /// When the peer was last heard from.
    pub last_active: SystemTime,
}

/// An established relayed data path.
///
/// Implemented by the data plane.  [`LinkSupervisor`] calls [`DataLink::start`] once after
/// construction and [`DataLink::stop`] once before discarding the link.
pub trait DataLink: fmt::Debug + Send + 'static {
    /// Starts moving packets.
    fn start(&mut self) -> io::Result<()>;

    /// Stops the link and releases its sockets.
    fn stop(&mut self);

    /// The local address of the link socket.
    fn local_addr(&self) -> SocketAddr;

    /// Current delay over the link.
    fn delay(&self) -> Duration;

    /// Change of the delay since the previous measurement, in nanoseconds.
    ///
    /// Negative when the link got faster.
    fn delay_delta(&self) -> i64;

    /// The auxiliary peer connections maintained by the link, in link order.
    fn peers(&self) -> Vec<SubPeerStatus>;
}

/// Builds data links, one per successful relay negotiation.
pub trait LinkFactory: fmt::Debug + Send + Sync + 'static {
    /// Creates an unstarted link relaying to `host` for the shard at `shard`.
    ///
    /// `shard` is `None` when the shard address did not resolve.
    fn new_link(
        &self,
        transport: TransportKind,
        shard: Option<SocketAddr>,
        host: SocketAddr,
    ) -> Box<dyn DataLink>;
}

#[allow(missing_docs)]
#[common_fields({
    backtrace: Option<snafu::Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum EstablishError {
    #[snafu(display("Failed to resolve relay host {addr}"))]
    Resolve { addr: String, source: io::Error },
    #[snafu(display("Failed to start {transport} link to {host}"))]
    Start {
        transport: TransportKind,
        host: SocketAddr,
        source: io::Error,
    },
}

/// Summary of the active link, suitable for reporting.
///
/// Without an active link `established` is false and every other field is zeroed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkStatus {
    /// Is a link active?
    pub established: bool,
    /// Local address of the link socket, `0.0.0.0:0` without a link.
    pub local_addr: SocketAddr,
    /// Current link delay.
    pub delay: Duration,
    /// Change of the link delay in nanoseconds, negative when the link got faster.
    pub delay_delta: i64,
    /// The auxiliary peers of the link.
    pub peers: Vec<SubPeerStatus>,
}

impl Default for LinkStatus {
    fn default() -> Self {
        Self {
            established: false,
            local_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            delay: Duration::ZERO,
            delay_delta: 0,
            peers: Vec::new(),
        }
    }
}

/// The link held by an active [`LinkSupervisor`].
#[derive(Debug)]
pub struct ActiveLink {
    shard_addr: String,
    host: SocketAddr,
    transport: TransportKind,
    link: Box<dyn DataLink>,
}

impl ActiveLink {
    /// The address of the shard this link relays through.
    pub fn shard_addr(&self) -> &str {
        &self.shard_addr
    }

    /// The negotiated relay host.
    pub fn host(&self) -> SocketAddr {
        self.host
    }

    /// The transport the link runs over.
    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    fn status(&self) -> LinkStatus {
        LinkStatus {
            established: true,
            local_addr: self.link.local_addr(),
            delay: self.link.delay(),
            delay_delta: self.link.delay_delta(),
            peers: self.link.peers(),
        }
    }
}

/// The state of a [`LinkSupervisor`].
#[derive(Debug, Default)]
pub enum LinkState {
    /// No link.
    #[default]
    Idle,
    /// A started link.
    Active(ActiveLink),
}

/// Owns the single active data link.
#[derive(Debug)]
pub struct LinkSupervisor {
    factory: Box<dyn LinkFactory>,
    state: LinkState,
}

impl LinkSupervisor {
    /// Creates an idle supervisor building links with `factory`.
    pub fn new(factory: impl LinkFactory) -> Self {
        Self {
            factory: Box::new(factory),
            state: LinkState::Idle,
        }
    }

    /// Replaces the current link with a new link to `host_addr`.
    ///
    /// Any active link is stopped first, even when establishing the new link then fails.
    /// On failure the supervisor is idle.
    #[instrument(skip(self), fields(shard = %shard_addr))]
    pub async fn establish(
        &mut self,
        shard_addr: &str,
        host_addr: &str,
        transport: TransportKind,
    ) -> Result<(), EstablishError> {
        self.shutdown();

        let host = resolve_ipv4(host_addr).await.context(ResolveSnafu {
            addr: host_addr.to_string(),
        })?;
        let shard = match resolve_ipv4(shard_addr).await {
            Ok(shard) => Some(shard),
            Err(err) => {
                warn!("failed to resolve shard address: {err:#}");
                None
            }
        };

        let mut link = self.factory.new_link(transport, shard, host);
        link.start().context(StartSnafu { transport, host })?;
        info!(%host, %transport, "link established");
        self.state = LinkState::Active(ActiveLink {
            shard_addr: shard_addr.to_string(),
            host,
            transport,
            link,
        });
        Ok(())
    }

    /// Stops the active link, if any.
    pub fn shutdown(&mut self) {
        if let LinkState::Active(mut active) = std::mem::take(&mut self.state) {
            debug!(host = %active.host, "stopping link");
            active.link.stop();
        }
    }

    /// Returns the current state.
    pub fn state(&self) -> &LinkState {
        &self.state
    }

    /// Returns the active link, if any.
    pub fn active(&self) -> Option<&ActiveLink> {
        match &self.state {
            LinkState::Idle => None,
            LinkState::Active(active) => Some(active),
        }
    }

    /// Is a link active?
    pub fn is_active(&self) -> bool {
        matches!(self.state, LinkState::Active(_))
    }

    /// Summarises the current link.
    pub fn status(&self) -> LinkStatus {
        match &self.state {
            LinkState::Idle => LinkStatus::default(),
            LinkState::Active(active) => active.status(),
        }
    }
}

impl Drop for LinkSupervisor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Data link doubles for tests.
#[cfg(test)]
pub(crate) mod testing {
    use std::sync::{Arc, Mutex};

    use super::*;

    /// Shared log of link lifecycle calls, in call order.
    #[derive(Debug, Clone, Default)]
    pub(crate) struct LinkEvents(Arc<Mutex<Vec<String>>>);

    impl LinkEvents {
        fn push(&self, event: String) {
            self.0.lock().expect("poisoned").push(event);
        }

        pub(crate) fn take(&self) -> Vec<String> {
            std::mem::take(&mut *self.0.lock().expect("poisoned"))
        }
    }

    /// Builds [`RecordingLink`]s; links to port 0 fail to start.
    #[derive(Debug, Clone, Default)]
    pub(crate) struct RecordingFactory {
        pub(crate) events: LinkEvents,
    }

    impl LinkFactory for RecordingFactory {
        fn new_link(
            &self,
            transport: TransportKind,
            shard: Option<SocketAddr>,
            host: SocketAddr,
        ) -> Box<dyn DataLink> {
            self.events.push(format!("new {host}"));
            Box::new(RecordingLink {
                events: self.events.clone(),
                transport,
                shard,
                host,
            })
        }
    }

    #[derive(Debug)]
    pub(crate) struct RecordingLink {
        events: LinkEvents,
        transport: TransportKind,
        shard: Option<SocketAddr>,
        host: SocketAddr,
    }

    impl DataLink for RecordingLink {
        fn start(&mut self) -> io::Result<()> {
            if self.host.port() == 0 {
                return Err(io::Error::other("port 0"));
            }
            self.events.push(format!("start {} {}", self.transport, self.host));
            Ok(())
        }

        fn stop(&mut self) {
            self.events.push(format!("stop {}", self.host));
        }

        fn local_addr(&self) -> SocketAddr {
            SocketAddr::from((Ipv4Addr::LOCALHOST, 40000))
        }

        fn delay(&self) -> Duration {
            Duration::from_millis(12)
        }

        fn delay_delta(&self) -> i64 {
            -3_000_000
        }

        fn peers(&self) -> Vec<SubPeerStatus> {
            self.shard
                .map(|shard| SubPeerStatus {
                    remote_addr: shard,
                    local_addr: self.local_addr(),
                    delay: self.delay(),
                    last_active: SystemTime::UNIX_EPOCH,
                })
                .into_iter()
                .collect()
        }
    }
}
