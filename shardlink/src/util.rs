//! Utilities used in [`shardlink`][`crate`]

use std::{future::Future, io, net::SocketAddr, time::Duration};

use crate::defaults::timeouts::DNS_TIMEOUT;

/// Resolves a `host:port` string to its first IPv4 socket address.
///
/// Probes and links are UDP over IPv4 only, IPv6 results are ignored.  Lookups taking
/// longer than [`DNS_TIMEOUT`] fail with [`io::ErrorKind::TimedOut`].
pub(crate) async fn resolve_ipv4(addr: &str) -> io::Result<SocketAddr> {
    with_dns_timeout(DNS_TIMEOUT, lookup_ipv4(addr)).await
}

async fn lookup_ipv4(addr: &str) -> io::Result<SocketAddr> {
    tokio::net::lookup_host(addr)
        .await?
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no IPv4 address for {addr}"),
            )
        })
}

pub(crate) async fn with_dns_timeout<T>(
    timeout: Duration,
    lookup: impl Future<Output = io::Result<T>>,
) -> io::Result<T> {
    tokio::time::timeout(timeout, lookup)
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "DNS lookup timed out"))?
}
