//! The shard client.
//!
//! [`Client`] sequences the control channel, the probe rounds and the link supervisor.  Every
//! operation that needs the control channel checks [`Client::is_connected`] first and returns
//! right away when it is down.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use serde::Serialize;
use snafu::{ResultExt, Snafu};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::{
    config::Config,
    directory::{EndpointDirectory, Shard},
    link::{EstablishError, LinkFactory, LinkStatus, LinkSupervisor, TransportKind},
    probe::{ProbeError, Prober},
    tunnel::{RelayAddrs, Tunnel, TunnelEvent},
};

/// Whether the control channel is connected.
///
/// Written only by the event handler [`Client`] registers with its [`Tunnel`].
#[derive(Debug, Clone, Default)]
pub struct ConnectionState(Arc<AtomicBool>);

impl ConnectionState {
    /// Is the control channel connected?
    pub fn is_connected(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn handle_event(&self, event: TunnelEvent) {
        let connected = matches!(event, TunnelEvent::Connected);
        let was = self.0.swap(connected, Ordering::AcqRel);
        if was != connected {
            info!(%event, "control channel {event}");
        } else {
            debug!(%event, "repeated control channel event");
        }
    }
}

/// The relay was negotiated but the link to it could not be established.
///
/// Carries the negotiated pair, which the caller may still want to report.
#[derive(Debug, Snafu)]
#[snafu(display("Failed to establish link for relay {addrs}"))]
pub struct RequestRelayError {
    addrs: RelayAddrs,
    source: EstablishError,
    backtrace: Option<snafu::Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
}

impl RequestRelayError {
    /// The pair negotiated with the control channel.
    pub fn addrs(&self) -> &RelayAddrs {
        &self.addrs
    }

    /// Returns the negotiated pair.
    pub fn into_addrs(self) -> RelayAddrs {
        self.addrs
    }
}

/// Connectivity summary reported to the API layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ClientStatus {
    /// Is the control channel connected?
    pub connected: bool,
}

/// Picks shards and keeps a relayed link to one of them.
#[derive(Debug)]
pub struct Client {
    tunnel: Box<dyn Tunnel>,
    prober: Prober,
    connection: ConnectionState,
    directory: Mutex<EndpointDirectory>,
    supervisor: Mutex<LinkSupervisor>,
}

impl Client {
    /// Creates a client and subscribes to the connectivity events of `tunnel`.
    ///
    /// The client starts out disconnected.
    pub fn new(config: &Config, tunnel: impl Tunnel, links: impl LinkFactory) -> Self {
        let connection = ConnectionState::default();
        let state = connection.clone();
        tunnel.subscribe(Box::new(move |event: TunnelEvent| {
            state.handle_event(event)
        }));
        Self {
            tunnel: Box::new(tunnel),
            prober: config.prober(),
            connection,
            directory: Mutex::new(EndpointDirectory::new()),
            supervisor: Mutex::new(LinkSupervisor::new(links)),
        }
    }

    /// Starts the control channel.
    pub fn start(&self) {
        self.tunnel.start();
    }

    /// Is the control channel connected?
    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// Returns the connectivity summary.
    pub fn status(&self) -> ClientStatus {
        ClientStatus {
            connected: self.is_connected(),
        }
    }

    /// Fetches the shard list, probes and ranks it.
    ///
    /// Returns the shards fastest first.  Returns an empty list without touching the
    /// network when the control channel is down.
    #[instrument(skip_all)]
    pub async fn refresh_shards(&self) -> Result<Vec<Shard>, ProbeError> {
        let mut directory = self.directory.lock().await;
        if !self.is_connected() {
            return directory.refresh(false, &self.prober, Vec::new()).await;
        }
        let raw = self.tunnel.list_shards().await;
        debug!(shards = raw.len(), "shard list received");
        directory.refresh(self.is_connected(), &self.prober, raw).await
    }

    /// Negotiates a relay through the shard at `shard_addr` and links to it.
    ///
    /// The returned pair carries the in-band errors of the control channel:
    ///
    /// - [`RelayAddrs::unconnected`] when the control channel is down,
    /// - [`RelayAddrs::shard_not_found`] when `shard_addr` is not in the directory,
    /// - whatever the control channel answered otherwise.
    ///
    /// A link is only established when neither address signals an error.  Failing to
    /// establish that link is returned as an error, which still carries the pair.
    #[instrument(skip(self))]
    pub async fn request_relay(
        &self,
        shard_addr: &str,
        transport: TransportKind,
    ) -> Result<RelayAddrs, RequestRelayError> {
        if !self.is_connected() {
            debug!("not connected");
            return Ok(RelayAddrs::unconnected());
        }
        let Some(shard) = self.directory.lock().await.find_by_addr(shard_addr) else {
            debug!("shard not found");
            return Ok(RelayAddrs::shard_not_found());
        };

        let addrs = self.tunnel.negotiate_relay(&shard.addr, transport).await;
        if addrs.is_error() {
            warn!(%addrs, "relay negotiation failed");
            return Ok(addrs);
        }

        self.supervisor
            .lock()
            .await
            .establish(&shard.addr, &addrs.host, transport)
            .await
            .context(RequestRelaySnafu {
                addrs: addrs.clone(),
            })?;
        Ok(addrs)
    }

    /// Returns the status of the relayed link.
    pub async fn link_status(&self) -> LinkStatus {
        self.supervisor.lock().await.status()
    }

    /// Returns the shards of the last refresh, fastest first.
    pub async fn shards(&self) -> Vec<Shard> {
        self.directory.lock().await.shards()
    }

    /// Stops the relayed link, if any.
    pub async fn shutdown(&self) {
        self.supervisor.lock().await.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Mutex as StdMutex,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };

    use n0_future::boxed::BoxFuture;
    use n0_snafu::{Result, ResultExt};
    use tracing_test::traced_test;

    use super::*;
    use crate::{echo::EchoServer, link::testing::RecordingFactory, tunnel::EventHandler};

    #[derive(Default)]
    struct TestTunnelInner {
        shards: StdMutex<Vec<Shard>>,
        relay: StdMutex<Option<RelayAddrs>>,
        handlers: StdMutex<Vec<EventHandler>>,
        started: AtomicUsize,
        list_calls: AtomicUsize,
        negotiate_calls: AtomicUsize,
    }

    impl std::fmt::Debug for TestTunnelInner {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("TestTunnelInner")
                .field("shards", &self.shards)
                .field("relay", &self.relay)
                .finish_non_exhaustive()
        }
    }

    #[derive(Debug, Clone, Default)]
    struct TestTunnel(Arc<TestTunnelInner>);

    impl TestTunnel {
        fn emit(&self, event: TunnelEvent) {
            for handler in self.0.handlers.lock().expect("poisoned").iter() {
                handler(event);
            }
        }

        fn set_shards(&self, shards: Vec<Shard>) {
            *self.0.shards.lock().expect("poisoned") = shards;
        }

        fn set_relay(&self, relay: RelayAddrs) {
            *self.0.relay.lock().expect("poisoned") = Some(relay);
        }
    }

    impl Tunnel for TestTunnel {
        fn start(&self) {
            self.0.started.fetch_add(1, Ordering::SeqCst);
        }

        fn subscribe(&self, handler: EventHandler) {
            self.0.handlers.lock().expect("poisoned").push(handler);
        }

        fn list_shards(&self) -> BoxFuture<Vec<Shard>> {
            self.0.list_calls.fetch_add(1, Ordering::SeqCst);
            let shards = self.0.shards.lock().expect("poisoned").clone();
            Box::pin(async move { shards })
        }

        fn negotiate_relay(
            &self,
            _shard_addr: &str,
            _transport: TransportKind,
        ) -> BoxFuture<RelayAddrs> {
            self.0.negotiate_calls.fetch_add(1, Ordering::SeqCst);
            let relay = self
                .0
                .relay
                .lock()
                .expect("poisoned")
                .clone()
                .unwrap_or_else(|| RelayAddrs::new("ERROR_NO_RELAY", "ERROR_NO_RELAY"));
            Box::pin(async move { relay })
        }
    }

    fn test_config() -> Config {
        let mut config = Config::default();
        config.probe.window = Duration::from_millis(400);
        config
    }

    #[tokio::test]
    #[traced_test]
    async fn test_connection_events() {
        let tunnel = TestTunnel::default();
        let client = Client::new(&test_config(), tunnel.clone(), RecordingFactory::default());
        client.start();
        assert_eq!(tunnel.0.started.load(Ordering::SeqCst), 1);
        assert_eq!(client.status(), ClientStatus { connected: false });

        tunnel.emit(TunnelEvent::Connected);
        tunnel.emit(TunnelEvent::Connected);
        assert!(client.is_connected());

        tunnel.emit(TunnelEvent::Disconnected);
        assert_eq!(client.status(), ClientStatus { connected: false });
    }

    #[tokio::test]
    #[traced_test]
    async fn test_disconnected_fails_fast() -> Result {
        let tunnel = TestTunnel::default();
        tunnel.set_shards(vec![Shard::new("127.0.0.1:7001")]);
        let client = Client::new(&test_config(), tunnel.clone(), RecordingFactory::default());

        assert!(client.refresh_shards().await.e()?.is_empty());
        let addrs = client
            .request_relay("127.0.0.1:7001", TransportKind::Udp)
            .await
            .e()?;

        assert_eq!(addrs, RelayAddrs::unconnected());
        assert_eq!(tunnel.0.list_calls.load(Ordering::SeqCst), 0);
        assert_eq!(tunnel.0.negotiate_calls.load(Ordering::SeqCst), 0);
        assert!(!client.link_status().await.established);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn test_unknown_shard_is_not_negotiated() -> Result {
        let tunnel = TestTunnel::default();
        let client = Client::new(&test_config(), tunnel.clone(), RecordingFactory::default());
        tunnel.emit(TunnelEvent::Connected);

        let addrs = client
            .request_relay("127.0.0.1:7001", TransportKind::Udp)
            .await
            .e()?;

        assert_eq!(addrs, RelayAddrs::shard_not_found());
        assert_eq!(tunnel.0.negotiate_calls.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn test_refresh_ranks_by_rtt() -> Result {
        let slow = EchoServer::spawn_local_with_delay(Duration::from_millis(120))
            .await
            .e()?;
        let fast = EchoServer::spawn_local_with_delay(Duration::from_millis(10))
            .await
            .e()?;
        let slow_addr = slow.local_addr().to_string();
        let fast_addr = fast.local_addr().to_string();

        let tunnel = TestTunnel::default();
        tunnel.set_shards(vec![Shard::new(&slow_addr), Shard::new(&fast_addr)]);
        let client = Client::new(&test_config(), tunnel.clone(), RecordingFactory::default());
        tunnel.emit(TunnelEvent::Connected);

        let shards = client.refresh_shards().await.e()?;
        let order: Vec<_> = shards.iter().map(|s| s.addr.as_str()).collect();
        assert_eq!(order, [fast_addr.as_str(), slow_addr.as_str()]);
        assert!(shards.iter().all(|s| s.rtt.is_some()));
        assert_eq!(client.shards().await, shards);

        slow.shutdown().await;
        fast.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn test_request_relay_establishes_and_replaces() -> Result {
        let first = EchoServer::spawn_local().await.e()?;
        let second = EchoServer::spawn_local().await.e()?;
        let first_addr = first.local_addr().to_string();
        let second_addr = second.local_addr().to_string();

        let tunnel = TestTunnel::default();
        tunnel.set_shards(vec![Shard::new(&first_addr), Shard::new(&second_addr)]);
        let factory = RecordingFactory::default();
        let events = factory.events.clone();
        let client = Client::new(&test_config(), tunnel.clone(), factory);
        tunnel.emit(TunnelEvent::Connected);
        client.refresh_shards().await.e()?;

        // Negotiation failures are handed back without a link.
        let addrs = client
            .request_relay(&first_addr, TransportKind::Udp)
            .await
            .e()?;
        assert!(addrs.is_error());
        assert!(events.take().is_empty());

        tunnel.set_relay(RelayAddrs::new("127.0.0.1:9001", "127.0.0.1:9101"));
        let addrs = client
            .request_relay(&first_addr, TransportKind::Udp)
            .await
            .e()?;
        assert!(!addrs.is_error());

        // A link that fails to start still hands back the negotiated pair.
        tunnel.set_relay(RelayAddrs::new("127.0.0.1:0", "127.0.0.1:9100"));
        let err = client
            .request_relay(&first_addr, TransportKind::Udp)
            .await
            .unwrap_err();
        assert_eq!(
            err.addrs(),
            &RelayAddrs::new("127.0.0.1:0", "127.0.0.1:9100")
        );
        assert!(!client.link_status().await.established);
        assert_eq!(
            events.take(),
            [
                "new 127.0.0.1:9001",
                "start udp 127.0.0.1:9001",
                "stop 127.0.0.1:9001",
                "new 127.0.0.1:0",
            ]
        );

        tunnel.set_relay(RelayAddrs::new("127.0.0.1:9002", "127.0.0.1:9102"));
        client
            .request_relay(&second_addr, TransportKind::Udp)
            .await
            .e()?;

        assert_eq!(
            events.take(),
            ["new 127.0.0.1:9002", "start udp 127.0.0.1:9002"]
        );
        let status = client.link_status().await;
        assert!(status.established);
        assert_eq!(status.peers[0].remote_addr, second.local_addr());
        assert_eq!(tunnel.0.negotiate_calls.load(Ordering::SeqCst), 4);

        client.shutdown().await;
        assert_eq!(events.take(), ["stop 127.0.0.1:9002"]);
        assert!(!client.link_status().await.established);

        first.shutdown().await;
        second.shutdown().await;
        Ok(())
    }
}
