//! A UDP responder for shard probes.
//!
//! Shards echo every probe payload back to the sender unchanged, this is the shard side of
//! that exchange.  It can delay its replies to emulate a distant shard.

use std::{
    io,
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use n0_future::task::{self, AbortOnDropHandle, JoinSet};
use tokio::net::UdpSocket;
use tracing::{Instrument, debug, info_span, trace, warn};

use crate::probe::PROBE_PAYLOAD_LEN;

/// A running echo responder.
///
/// Dropping this stops the responder.
#[derive(Debug)]
pub struct EchoServer {
    local_addr: SocketAddr,
    task: AbortOnDropHandle<()>,
}

impl EchoServer {
    /// Binds to `bind_addr` and starts echoing probes after `delay`.
    pub async fn spawn(bind_addr: SocketAddr, delay: Duration) -> io::Result<Self> {
        let socket = UdpSocket::bind(bind_addr).await?;
        let local_addr = socket.local_addr()?;
        debug!(%local_addr, ?delay, "echo server listening");
        let task = task::spawn(
            run(Arc::new(socket), delay).instrument(info_span!("echo", %local_addr)),
        );
        Ok(Self {
            local_addr,
            task: AbortOnDropHandle::new(task),
        })
    }

    /// Starts an echo server on a random localhost port without delay.
    pub async fn spawn_local() -> io::Result<Self> {
        Self::spawn_local_with_delay(Duration::ZERO).await
    }

    /// Starts an echo server on a random localhost port which delays every reply.
    pub async fn spawn_local_with_delay(delay: Duration) -> io::Result<Self> {
        Self::spawn(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)), delay).await
    }

    /// The address probes should be sent to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Waits for the server to stop on its own, only happens on socket errors.
    pub async fn join(self) {
        let _ = self.task.await;
    }

    /// Stops the server.
    pub async fn shutdown(self) {
        self.task.abort();
        let _ = self.task.await;
    }
}

async fn run(socket: Arc<UdpSocket>, delay: Duration) {
    let mut buf = [0u8; 64];
    let mut replies = JoinSet::new();
    loop {
        tokio::select! {
            res = socket.recv_from(&mut buf) => {
                let (len, from) = match res {
                    Ok(res) => res,
                    Err(err) => {
                        warn!("echo socket read failed: {err:#}");
                        break;
                    }
                };
                if len != PROBE_PAYLOAD_LEN {
                    trace!(%from, len, "ignoring datagram that is not a probe");
                    continue;
                }
                let mut payload = [0u8; PROBE_PAYLOAD_LEN];
                payload.copy_from_slice(&buf[..len]);
                if delay.is_zero() {
                    reply(&socket, payload, from).await;
                } else {
                    let socket = socket.clone();
                    replies.spawn(async move {
                        tokio::time::sleep(delay).await;
                        reply(&socket, payload, from).await;
                    });
                }
            }
            Some(_) = replies.join_next(), if !replies.is_empty() => {}
        }
    }
}

async fn reply(socket: &UdpSocket, payload: [u8; PROBE_PAYLOAD_LEN], to: SocketAddr) {
    if let Err(err) = socket.send_to(&payload, to).await {
        warn!(%to, "failed to echo probe: {err:#}");
    }
}

#[cfg(test)]
mod tests {
    use n0_snafu::{Result, ResultExt};
    use tracing_test::traced_test;

    use super::*;

    #[tokio::test]
    #[traced_test]
    async fn test_echo_verbatim() -> Result {
        let echo = EchoServer::spawn_local().await.e()?;
        let client = UdpSocket::bind("127.0.0.1:0").await.e()?;

        // Not a probe, no reply expected.
        client.send_to(b"hello", echo.local_addr()).await.e()?;
        let payload = *b"\x00\x01\x02\x03\x04\x05\x06\x07";
        client.send_to(&payload, echo.local_addr()).await.e()?;

        let mut buf = [0u8; 64];
        let (len, from) = tokio::time::timeout(Duration::from_secs(1), client.recv_from(&mut buf))
            .await
            .e()?
            .e()?;
        assert_eq!(from, echo.local_addr());
        assert_eq!(&buf[..len], &payload);

        echo.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn test_echo_delay() -> Result {
        let delay = Duration::from_millis(100);
        let echo = EchoServer::spawn_local_with_delay(delay).await.e()?;
        let client = UdpSocket::bind("127.0.0.1:0").await.e()?;

        let start = tokio::time::Instant::now();
        client.send_to(&[0u8; 8], echo.local_addr()).await.e()?;
        let mut buf = [0u8; 64];
        tokio::time::timeout(Duration::from_secs(1), client.recv_from(&mut buf))
            .await
            .e()?
            .e()?;
        assert!(start.elapsed() >= delay);

        echo.shutdown().await;
        Ok(())
    }
}
