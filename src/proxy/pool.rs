use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use hickory_client::{
    client::AsyncClient,
    proto::{iocompat::AsyncIoTokioAsStd, rustls::tls_client_connect},
    tcp::TcpClientStream,
    udp::UdpClientStream,
};
use rustls::ClientConfig;
use tokio::{
    net::{TcpStream, UdpSocket},
    sync::{watch, Mutex},
    time::interval,
};
use tracing::{debug, trace};

use crate::error::Error;

const DEFAULT_EXPIRE: Duration = Duration::from_secs(10);
const REAP_INTERVAL: Duration = Duration::from_secs(5);

/// The transport a connection uses. `TcpTls` implies TCP framing over a
/// `rustls` session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) enum Protocol {
    Udp,
    Tcp,
    TcpTls,
}

struct Idle {
    client: AsyncClient,
    since: Instant,
}

type IdleMap = Arc<Mutex<HashMap<Protocol, Vec<Idle>>>>;

/// Warm connections keyed by protocol, reaped when idle past `expire`.
/// Guarded by a single `tokio::sync::Mutex`, never held across I/O: dialing
/// a fresh connection happens outside the lock.
pub(super) struct Pool {
    idle: IdleMap,
    tls_config: Option<Arc<ClientConfig>>,
    tls_servername: Option<String>,
    expire: Duration,
}

impl Pool {
    pub(super) fn new(
        tls_config: Option<Arc<ClientConfig>>,
        tls_servername: Option<String>,
        expire: Duration,
    ) -> Self {
        Self {
            idle: Arc::new(Mutex::new(HashMap::new())),
            tls_config,
            tls_servername,
            expire: if expire.is_zero() {
                DEFAULT_EXPIRE
            } else {
                expire
            },
        }
    }

    pub(super) async fn dial(
        &self,
        address: SocketAddr,
        proto: Protocol,
        dial_timeout: Duration,
    ) -> Result<AsyncClient, Error> {
        if let Some(client) = self.take_warm(proto).await {
            trace!(?proto, "reusing pooled connection");
            return Ok(client);
        }

        tokio::time::timeout(dial_timeout, self.connect(address, proto))
            .await
            .map_err(|_| Error::IoError {
                source: std::io::Error::new(std::io::ErrorKind::TimedOut, "dial timed out"),
            })?
    }

    async fn take_warm(&self, proto: Protocol) -> Option<AsyncClient> {
        let mut idle = self.idle.lock().await;
        idle.get_mut(&proto)
            .and_then(|conns| conns.pop())
            .map(|c| c.client)
    }

    pub(super) async fn yield_conn(&self, proto: Protocol, client: AsyncClient) {
        let mut idle = self.idle.lock().await;
        idle.entry(proto).or_default().push(Idle {
            client,
            since: Instant::now(),
        });
    }

    async fn connect(&self, address: SocketAddr, proto: Protocol) -> Result<AsyncClient, Error> {
        match proto {
            Protocol::Udp => {
                let stream = UdpClientStream::<UdpSocket>::new(address);
                let (client, bg) = AsyncClient::connect(stream).await?;
                tokio::spawn(bg);
                Ok(client)
            }
            Protocol::Tcp => {
                let (stream, sender) =
                    TcpClientStream::<AsyncIoTokioAsStd<TcpStream>>::new(address);
                let client = AsyncClient::new(stream, sender, None);
                let (client, bg) = client.await?;
                tokio::spawn(bg);
                Ok(client)
            }
            Protocol::TcpTls => {
                let tls_config = self.tls_config.clone().ok_or_else(|| Error::InvalidConfig {
                    context: "upstream".into(),
                    message: "tls:// upstream configured without a [tls] section".into(),
                })?;

                let server_name = self
                    .tls_servername
                    .clone()
                    .unwrap_or_else(|| address.ip().to_string());

                let (stream, sender) = tls_client_connect::<AsyncIoTokioAsStd<TcpStream>>(
                    address,
                    server_name,
                    tls_config,
                );
                let client = AsyncClient::new(Box::new(stream), sender, None);
                let (client, bg) = client.await?;
                tokio::spawn(bg);
                Ok(client)
            }
        }
    }

    /// Spawns the background reaper: sweeps every [`REAP_INTERVAL`], evicting
    /// connections idle longer than `expire`.
    pub(super) fn start_reaper(&self, mut stop_rx: watch::Receiver<bool>) {
        let idle = Arc::clone(&self.idle);
        let expire = self.expire;

        tokio::spawn(async move {
            let mut ticker = interval(REAP_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let mut idle = idle.lock().await;
                        let before: usize = idle.values().map(Vec::len).sum();
                        for conns in idle.values_mut() {
                            conns.retain(|c| c.since.elapsed() < expire);
                        }
                        let after: usize = idle.values().map(Vec::len).sum();
                        if before != after {
                            debug!(evicted = before - after, "reaped idle connections");
                        }
                    }
                    _ = stop_rx.changed() => break,
                }
            }
        });
    }

    pub(super) async fn drain(&self) {
        let mut idle = self.idle.lock().await;
        let total: usize = idle.values().map(Vec::len).sum();
        idle.clear();
        debug!(drained = total, "pool drained");
    }
}
