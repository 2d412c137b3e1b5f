//! The upstream proxy (C3): one configured upstream DNS endpoint, its pool
//! of warm connections, failure counter, and liveness probe loop.

mod pool;

use std::{
    fmt,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use futures::StreamExt;
use hickory_client::{
    client::AsyncClient,
    op::{Message, Query},
    proto::xfer::{DnsHandle, DnsRequest, DnsRequestOptions},
    rr::{DNSClass, Name, RecordType},
};
use rand::Rng;
use rustls::ClientConfig;
use serde::Deserialize;
use tokio::{sync::watch, task::JoinHandle, time::sleep};
use tracing::{debug, instrument, warn};

use crate::error::Error;
use pool::Pool;

pub(crate) use pool::Protocol;

const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(2);
const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(30);

/// The `upstream <addr>[...]` config entry (§6): an address, optionally
/// prefixed `tls://` to select TLS.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub(crate) struct UpstreamConfig {
    pub(crate) address: SocketAddr,
    pub(crate) use_tls: bool,
}

impl fmt::Display for UpstreamConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.use_tls {
            write!(f, "tls://{}", self.address)
        } else {
            write!(f, "{}", self.address)
        }
    }
}

impl TryFrom<String> for UpstreamConfig {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let (rest, use_tls) = match value.strip_prefix("tls://") {
            Some(rest) => (rest, true),
            None => (value.as_str(), false),
        };

        let address = rest.parse().map_err(|_| Error::InvalidConfig {
            context: "upstream".to_string(),
            message: format!("'{value}' is not a valid address"),
        })?;

        Ok(UpstreamConfig { address, use_tls })
    }
}

impl UpstreamConfig {
    /// The wire protocol actually used for a given call, accounting for
    /// `force_tcp` and the TLS toggle.
    pub(crate) fn protocol(&self, force_tcp: bool) -> Protocol {
        if self.use_tls {
            Protocol::TcpTls
        } else if force_tcp {
            Protocol::Tcp
        } else {
            Protocol::Udp
        }
    }
}

#[derive(Debug)]
struct ProbeState {
    in_flight: AtomicBool,
}

/// One upstream DNS resolver: address, connection pool, failure counter,
/// and probe loop (§4.3).
pub(crate) struct Proxy {
    pub(crate) config: UpstreamConfig,
    pool: Pool,
    failures: AtomicU32,
    probe: ProbeState,
    stop: watch::Sender<bool>,
    probe_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proxy")
            .field("config", &self.config)
            .field("failures", &self.failures.load(Ordering::Relaxed))
            .finish()
    }
}

impl Proxy {
    pub(crate) fn new(
        config: UpstreamConfig,
        tls_config: Option<Arc<ClientConfig>>,
        tls_servername: Option<String>,
        expire: Duration,
    ) -> Arc<Self> {
        let (stop, _) = watch::channel(false);

        Arc::new(Self {
            config,
            pool: Pool::new(tls_config, tls_servername, expire),
            failures: AtomicU32::new(0),
            probe: ProbeState {
                in_flight: AtomicBool::new(false),
            },
            stop,
            probe_task: std::sync::Mutex::new(None),
        })
    }

    /// Moves from `idle` to `probing`: starts the periodic health check and
    /// the pool reaper.
    pub(crate) fn start(self: &Arc<Self>) {
        self.pool.start_reaper(self.stop.subscribe());

        let proxy = Arc::clone(self);
        let mut stop_rx = self.stop.subscribe();
        let task = tokio::spawn(async move {
            loop {
                let jitter = rand::thread_rng().gen_range(0..1000);
                let interval = DEFAULT_PROBE_INTERVAL + Duration::from_millis(jitter);

                tokio::select! {
                    _ = sleep(interval) => proxy.check().await,
                    _ = stop_rx.changed() => break,
                }
            }
        });

        *self.probe_task.lock().unwrap() = Some(task);
    }

    /// Moves from `probing` to `stopped`: drains the pool and joins the
    /// probe/reaper tasks.
    pub(crate) async fn stop(&self) {
        let _ = self.stop.send(true);
        if let Some(task) = self.probe_task.lock().unwrap().take() {
            task.abort();
        }
        self.pool.drain().await;
    }

    /// Dials, or reuses, a warm connection for `proto`.
    #[instrument(skip(self), fields(upstream = %self.config))]
    pub(crate) async fn dial(&self, proto: Protocol) -> Result<AsyncClient, Error> {
        self.pool.dial(self.config.address, proto, DEFAULT_DIAL_TIMEOUT).await
    }

    /// Returns a connection to the pool for reuse.
    pub(crate) async fn yield_conn(&self, proto: Protocol, client: AsyncClient) {
        self.pool.yield_conn(proto, client).await;
    }

    /// Whether the failure counter has reached `threshold`. A threshold of
    /// zero means health-gating is disabled and this always returns false.
    pub(crate) fn down(&self, threshold: u32) -> bool {
        threshold != 0 && self.failures.load(Ordering::Relaxed) >= threshold
    }

    pub(crate) fn failures(&self) -> u32 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Triggers a single, non-blocking probe if one is not already running.
    pub(crate) fn healthcheck(self: &Arc<Self>) {
        if self
            .probe
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let proxy = Arc::clone(self);
        tokio::spawn(async move {
            proxy.check().await;
            proxy.probe.in_flight.store(false, Ordering::Release);
        });
    }

    /// Sends `. IN NS` with recursion disabled; any reply, including an
    /// error response code, resets the failure counter. Transport errors,
    /// empty replies, and timeouts increment it instead (§4.3).
    #[instrument(skip(self), fields(upstream = %self.config))]
    async fn check(&self) {
        let mut query = Query::query(Name::root(), RecordType::NS);
        query.set_query_class(DNSClass::IN);

        let mut message = Message::new();
        message.add_query(query);
        message.set_recursion_desired(false);

        let request = DnsRequest::new(message, DnsRequestOptions::default());
        let proto = self.config.protocol(false);

        let probe = async {
            let mut client = self.dial(proto).await.ok()?;
            client.send(request).next().await?.ok()
        };

        match tokio::time::timeout(DEFAULT_DIAL_TIMEOUT, probe).await {
            Ok(Some(_response)) => {
                self.failures.store(0, Ordering::Relaxed);
                debug!("probe succeeded");
            }
            _ => {
                let count = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(failures = count, "probe failed");
            }
        }
    }
}
