//! Round-trip time measurement of shards over UDP.
//!
//! A probe round works like this:
//!
//! - Binds one ephemeral UDP socket on `0.0.0.0:0`.
//! - Resolves the shard addresses concurrently, shards that fail to resolve are skipped.
//! - Sends the same timestamped payload [`PROBES_PER_SHARD`] times to every shard.
//! - A reader task turns every echoed payload into a [`ProbeSample`].
//! - Samples are collected until the window elapses or the reader stops.
//! - The round-trip time of a shard is the mean of its samples.
//!
//! The probe payload is [`PROBE_PAYLOAD_LEN`] bytes: the big-endian wall-clock time of the
//! round in nanoseconds since the Unix epoch.  The shard echoes it verbatim.
//!
//! The measured value is a full round trip, it is not halved.
//!
//! [`PROBES_PER_SHARD`]: crate::defaults::PROBES_PER_SHARD

use std::{
    collections::{BTreeMap, BTreeSet},
    future::Future,
    io,
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use n0_future::{
    join_all,
    task::{self, AbortOnDropHandle},
};
use nested_enum_utils::common_fields;
use snafu::{ResultExt, Snafu};
use tokio::{
    net::UdpSocket,
    sync::mpsc,
    time::{self, Instant},
};
use tracing::{Instrument, debug, debug_span, info_span, trace, warn};

use crate::{
    defaults::{PROBES_PER_SHARD, timeouts::PROBE_WINDOW},
    directory::Shard,
    util::resolve_ipv4,
};

/// Length of the probe payload.
pub const PROBE_PAYLOAD_LEN: usize = 8;

/// Samples buffered between the reader task and the collecting loop.
const SAMPLE_CHANNEL_CAPACITY: usize = 64;

#[allow(missing_docs)]
#[common_fields({
    backtrace: Option<snafu::Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum ProbeError {
    #[snafu(display("Failed to bind the probe socket"))]
    Bind { source: io::Error },
}

/// One echoed probe.
#[derive(Debug, Clone, Copy)]
struct ProbeSample {
    from: SocketAddr,
    elapsed: Duration,
}

/// Measures round-trip times to shards.
///
/// Every call to [`Prober::run`] or [`Prober::probe`] is one self-contained probe round:
/// the socket is bound at the start and closed at the end of the call.
#[derive(Debug, Clone)]
pub struct Prober {
    window: Duration,
    probes_per_shard: usize,
}

impl Default for Prober {
    fn default() -> Self {
        Self {
            window: PROBE_WINDOW,
            probes_per_shard: PROBES_PER_SHARD,
        }
    }
}

impl Prober {
    /// Creates a new prober.
    pub fn new(window: Duration, probes_per_shard: usize) -> Self {
        Self {
            window,
            probes_per_shard,
        }
    }

    /// Sets how long replies are collected once all probes are sent.
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Sets how many copies of the payload are sent to each shard.
    pub fn with_probes_per_shard(mut self, probes_per_shard: usize) -> Self {
        self.probes_per_shard = probes_per_shard;
        self
    }

    /// Returns the collection window.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Returns how many probes are sent to each shard.
    pub fn probes_per_shard(&self) -> usize {
        self.probes_per_shard
    }

    /// Runs a probe round and writes the measured round-trip times into `shards`.
    ///
    /// Shards that received no reply keep whatever round-trip time they had before.
    pub async fn probe(&self, mut shards: Vec<Shard>) -> Result<Vec<Shard>, ProbeError> {
        let report = self.run(&shards).await?;
        report.apply(&mut shards);
        Ok(shards)
    }

    /// Runs a single probe round.
    ///
    /// Only failing to bind the socket aborts the round.  Resolution and send failures are
    /// logged and only affect the shard they happened for.
    pub async fn run(&self, shards: &[Shard]) -> Result<ProbeReport, ProbeError> {
        self.run_inner(shards)
            .instrument(info_span!("probe", shards = shards.len()))
            .await
    }

    async fn run_inner(&self, shards: &[Shard]) -> Result<ProbeReport, ProbeError> {
        let socket = UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))
            .await
            .context(BindSnafu)?;
        let socket = Arc::new(socket);
        debug!(local_addr = ?socket.local_addr().ok(), "probe socket bound");

        let targets = resolve_targets(shards, resolve_ipv4).await;

        let (sample_tx, mut sample_rx) = mpsc::channel(SAMPLE_CHANNEL_CAPACITY);
        let reader = AbortOnDropHandle::new(task::spawn(
            read_samples(socket.clone(), sample_tx).instrument(debug_span!("probe.reader")),
        ));

        let payload = timestamp_payload(SystemTime::now());
        for (addr, dest) in &targets {
            for _ in 0..self.probes_per_shard {
                if let Err(err) = socket.send_to(&payload, dest).await {
                    warn!(%addr, %dest, "failed to send probe: {err:#}");
                    break;
                }
            }
        }
        trace!(targets = targets.len(), "probes sent");

        let deadline = Instant::now() + self.window;
        let mut samples: BTreeMap<SocketAddr, Vec<Duration>> = BTreeMap::new();
        loop {
            match time::timeout_at(deadline, sample_rx.recv()).await {
                Ok(Some(sample)) => {
                    trace!(from = %sample.from, elapsed = ?sample.elapsed, "probe sample");
                    samples.entry(sample.from).or_default().push(sample.elapsed);
                }
                Ok(None) => {
                    debug!("probe reader stopped before the window elapsed");
                    break;
                }
                Err(_) => {
                    trace!("probe window elapsed");
                    break;
                }
            }
        }
        drop(reader);
        drop(socket);

        let mut report = ProbeReport::default();
        for (addr, dest) in targets {
            if let Some(rtts) = samples.get(&dest) {
                report.samples.insert(addr, rtts.clone());
            }
        }
        debug!(answered = report.samples.len(), "probe round finished");
        Ok(report)
    }
}

/// Resolves the distinct shard addresses concurrently.
///
/// Shards that fail to resolve are logged and left out.
async fn resolve_targets<'a, F, Fut>(
    shards: &'a [Shard],
    resolve: F,
) -> BTreeMap<String, SocketAddr>
where
    F: Fn(&'a str) -> Fut,
    Fut: Future<Output = io::Result<SocketAddr>>,
{
    let addrs: BTreeSet<&str> = shards.iter().map(|shard| shard.addr.as_str()).collect();
    let lookups = addrs.into_iter().map(|addr| {
        let lookup = resolve(addr);
        async move { (addr, lookup.await) }
    });

    let mut targets = BTreeMap::new();
    for (addr, res) in join_all(lookups).await {
        match res {
            Ok(dest) => {
                targets.insert(addr.to_string(), dest);
            }
            Err(err) => {
                warn!(%addr, "failed to resolve shard address, skipping: {err:#}");
            }
        }
    }
    targets
}

/// Reads echoed probes until the socket fails or the collector goes away.
async fn read_samples(socket: Arc<UdpSocket>, samples: mpsc::Sender<ProbeSample>) {
    let mut buf = [0u8; 64];
    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(res) => res,
            Err(err) => {
                warn!("probe socket read failed: {err:#}");
                break;
            }
        };
        let Some(elapsed) = elapsed_since_payload(&buf[..len], SystemTime::now()) else {
            trace!(%from, len, "ignoring datagram that is not a probe reply");
            continue;
        };
        if samples.send(ProbeSample { from, elapsed }).await.is_err() {
            break;
        }
    }
}

/// The outcome of one probe round.
///
/// Holds the raw round-trip samples for every shard that answered, keyed by the shard
/// address.  Shards without replies are absent.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ProbeReport {
    samples: BTreeMap<String, Vec<Duration>>,
}

impl ProbeReport {
    /// Did the shard with this address answer at least once?
    pub fn contains(&self, addr: &str) -> bool {
        self.samples.contains_key(addr)
    }

    /// Number of replies received from this shard.
    pub fn sample_count(&self, addr: &str) -> usize {
        self.samples.get(addr).map(Vec::len).unwrap_or_default()
    }

    /// The mean round-trip time of this shard, if it answered.
    pub fn rtt(&self, addr: &str) -> Option<Duration> {
        self.samples.get(addr).and_then(|rtts| mean(rtts))
    }

    /// Returns an iterator over all shards that answered and their mean round-trip time.
    pub fn iter(&self) -> impl Iterator<Item = (&'_ str, Duration)> + '_ {
        self.samples
            .iter()
            .filter_map(|(addr, rtts)| mean(rtts).map(|rtt| (addr.as_str(), rtt)))
    }

    /// How many shards answered?
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Did no shard answer?
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Writes the measured round-trip times into `shards`.
    ///
    /// Shards absent from this report are left untouched.
    pub fn apply(&self, shards: &mut [Shard]) {
        for shard in shards {
            if let Some(rtt) = self.rtt(&shard.addr) {
                shard.rtt = Some(rtt);
            }
        }
    }
}

fn mean(rtts: &[Duration]) -> Option<Duration> {
    let count = u32::try_from(rtts.len()).ok().filter(|count| *count > 0)?;
    let total: Duration = rtts.iter().sum();
    Some(total / count)
}

/// Encodes `now` as a probe payload.
fn timestamp_payload(now: SystemTime) -> [u8; PROBE_PAYLOAD_LEN] {
    let nanos = now
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    u64::try_from(nanos).unwrap_or(u64::MAX).to_be_bytes()
}

/// Time elapsed between the timestamp in an echoed payload and `now`.
///
/// `None` for payloads of the wrong size and for timestamps later than `now`.
fn elapsed_since_payload(payload: &[u8], now: SystemTime) -> Option<Duration> {
    let payload: [u8; PROBE_PAYLOAD_LEN] = payload.try_into().ok()?;
    let sent = UNIX_EPOCH + Duration::from_nanos(u64::from_be_bytes(payload));
    now.duration_since(sent).ok()
}
