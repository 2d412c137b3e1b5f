//! The forward helper (C6): sends a prepared request through the proxy
//! pool under the current selection policy. Used both by the engine's own
//! step 6 and as a standalone entry for co-located plugins (§4.6).

use std::sync::Arc;

use futures::StreamExt;
use hickory_server::proto::{
    op::Message,
    xfer::{DnsHandle, DnsRequest, DnsRequestOptions},
};
use rand::Rng;
use tracing::{instrument, warn};

use crate::{
    engine::EngineError,
    policy::SelectionPolicy,
    proxy::{Protocol, Proxy},
};

/// Runs `request` through `proxies` in `policy` order, honoring the
/// down-skip / last-resort / single-EOF-retry / truncation-retry /
/// FormErr-on-mismatch semantics shared by §4.5 step 6 and §4.6.
#[instrument(skip(proxies, policy, request), fields(proxies = proxies.len()))]
pub(crate) async fn forward(
    proxies: &[Arc<Proxy>],
    policy: &SelectionPolicy,
    max_fails: u32,
    force_tcp: bool,
    request: &Message,
) -> Result<Message, EngineError> {
    if proxies.is_empty() {
        return Err(EngineError::NoEdge);
    }

    let order = policy.list(proxies.len());
    let mut candidates: Vec<usize> =
        order.iter().copied().filter(|&i| !proxies[i].down(max_fails)).collect();

    if candidates.is_empty() {
        // Open question in §9: masks partial outages, but preserved as the
        // documented last resort. Logged at warning level as required there.
        let idx = rand::thread_rng().gen_range(0..proxies.len());
        warn!(proxy = %proxies[idx].config, "all upstreams down, trying one at random as a last resort");
        candidates.push(idx);
    }

    let mut last_error: Option<String> = None;

    for idx in candidates {
        let proxy = &proxies[idx];
        let proto = proxy.config.protocol(force_tcp);

        match send_with_retry(proxy, proto, request).await {
            Ok(response) => {
                let response = match retry_truncated_over_tcp(proxy, proto, request, response).await {
                    Ok(r) => r,
                    Err(e) => {
                        proxy.healthcheck();
                        last_error = Some(e);
                        continue;
                    }
                };

                if response.queries() != request.queries() {
                    return Err(EngineError::FormErr);
                }

                return Ok(response);
            }
            Err(e) => {
                proxy.healthcheck();
                last_error = Some(e);
            }
        }
    }

    match last_error {
        Some(e) => Err(EngineError::ServerFailure(e)),
        None => Err(EngineError::NoHealthy),
    }
}

async fn send_message(client: &mut hickory_client::client::AsyncClient, request: &Message) -> Result<Message, String> {
    let dns_request = DnsRequest::new(request.clone(), DnsRequestOptions::default());

    client
        .send(dns_request)
        .next()
        .await
        .ok_or_else(|| "upstream closed the connection without a reply".to_string())?
        .map(|response| response.into_message())
        .map_err(|e| e.to_string())
}

fn is_eof(error: &str) -> bool {
    let lower = error.to_lowercase();
    lower.contains("eof") || lower.contains("connection reset") || lower.contains("broken pipe")
}

/// Dial/reuse, write, read one reply. A TCP connection that returns EOF on
/// read is discarded and redialed exactly once (§4.3 "Connection reuse
/// contract", §4.5 step 6).
async fn send_with_retry(
    proxy: &Arc<Proxy>,
    proto: Protocol,
    request: &Message,
) -> Result<Message, String> {
    let mut client = proxy.dial(proto).await.map_err(|e| e.to_string())?;

    match send_message(&mut client, request).await {
        Ok(response) => {
            proxy.yield_conn(proto, client).await;
            Ok(response)
        }
        Err(e) if proto == Protocol::Tcp && is_eof(&e) => {
            let mut client = proxy.dial(proto).await.map_err(|e| e.to_string())?;
            let response = send_message(&mut client, request).await?;
            proxy.yield_conn(proto, client).await;
            Ok(response)
        }
        Err(e) => Err(e),
    }
}

/// If a UDP reply came back truncated, retry once over TCP (§4.5 step 6).
async fn retry_truncated_over_tcp(
    proxy: &Arc<Proxy>,
    proto: Protocol,
    request: &Message,
    response: Message,
) -> Result<Message, String> {
    if proto == Protocol::Udp && response.header().truncated() {
        send_with_retry(proxy, Protocol::Tcp, request).await
    } else {
        Ok(response)
    }
}
