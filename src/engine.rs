//! The query engine (C5): the per-request decision procedure described in
//! §4.5 — filter, local hit, peer redirect, or forward.

use std::sync::{Arc, RwLock as StdRwLock};

use hickory_server::proto::{
    op::{Message, MessageType, OpCode, Query},
    rr::{DNSClass, Name, RData, Record, RecordType},
};
use thiserror::Error;
use tracing::{instrument, warn};

use crate::{
    forward,
    geo::{self, Point},
    policy::SelectionPolicy,
    proxy::Proxy,
    service_table::{closest, LocalServiceSet, ServiceTable},
};

/// Per-request failure modes (§7), distinct from the ambient [`crate::error::Error`].
#[derive(Debug, Error)]
pub(crate) enum EngineError {
    #[error("upstream reply did not match the request question")]
    FormErr,
    #[error("all upstreams failed: {0}")]
    ServerFailure(String),
    #[error("all upstreams are marked down and no transport error was captured")]
    NoHealthy,
    #[error("forward helper invoked before the engine was initialized")]
    NoEdge,
}

/// The outcome of [`Engine::resolve`] for a request the engine actually
/// handled (as opposed to one it could not answer at all, see `EngineError`).
pub(crate) enum Decision {
    /// A complete reply, ready to send to the client.
    Answer(Message),
    /// Not ours to answer — the caller should fall through to the next
    /// plugin in the host chain (or answer `Refused` if there is none).
    Yield,
}

/// The engine's configuration snapshot (§3 "Config snapshot"). Replaced
/// wholesale, never mutated field-by-field, so every in-flight request sees
/// a consistent view even across a reload.
#[derive(Clone, Debug)]
pub(crate) struct EngineConfig {
    pub(crate) base_domain: Name,
    pub(crate) except: Vec<Name>,
    pub(crate) max_fails: u32,
    pub(crate) force_tcp: bool,
    pub(crate) site_ip: std::net::IpAddr,
    pub(crate) site_point: Point,
}

impl EngineConfig {
    fn matches_base_domain(&self, name: &Name) -> bool {
        self.base_domain.zone_of(name)
    }

    fn is_ignored(&self, name: &Name) -> bool {
        self.except.iter().any(|except| except.zone_of(name))
    }
}

/// The query-resolution engine: owns the current config snapshot, the proxy
/// list, the selection policy, and pointers to the service table and local
/// service set (§3 "Ownership").
pub(crate) struct Engine {
    config: StdRwLock<Arc<EngineConfig>>,
    proxies: StdRwLock<Arc<Vec<Arc<Proxy>>>>,
    policy: SelectionPolicy,
    service_table: ServiceTable,
    local_services: LocalServiceSet,
}

impl Engine {
    pub(crate) fn new(
        config: EngineConfig,
        proxies: Vec<Arc<Proxy>>,
        policy: SelectionPolicy,
        service_table: ServiceTable,
        local_services: LocalServiceSet,
    ) -> Self {
        Self {
            config: StdRwLock::new(Arc::new(config)),
            proxies: StdRwLock::new(Arc::new(proxies)),
            policy,
            service_table,
            local_services,
        }
    }

    pub(crate) fn config(&self) -> Arc<EngineConfig> {
        self.config.read().unwrap().clone()
    }

    pub(crate) fn proxies(&self) -> Arc<Vec<Arc<Proxy>>> {
        self.proxies.read().unwrap().clone()
    }

    /// Swaps in a new config snapshot, matching how the service table and
    /// proxy list are swapped (§4.9).
    pub(crate) fn replace_config(&self, config: EngineConfig) {
        *self.config.write().unwrap() = Arc::new(config);
    }

    pub(crate) fn replace_proxies(&self, proxies: Vec<Arc<Proxy>>) {
        *self.proxies.write().unwrap() = Arc::new(proxies);
    }

    pub(crate) fn service_table(&self) -> &ServiceTable {
        &self.service_table
    }

    pub(crate) fn local_services(&self) -> &LocalServiceSet {
        &self.local_services
    }

    /// The §4.5 decision procedure.
    #[instrument(skip(self, request), fields(query = %request.queries().first().map(|q| q.name().to_string()).unwrap_or_default()))]
    pub(crate) async fn resolve(&self, request: &Message) -> Result<Decision, EngineError> {
        let Some(query) = request.queries().first().cloned() else {
            return Ok(Decision::Yield);
        };

        let config = self.config();

        // 1. Filter.
        if !config.matches_base_domain(query.name()) || config.is_ignored(query.name()) {
            return Ok(Decision::Yield);
        }

        // 2. Extract marker.
        let mut message = request.clone();
        let (marker, has_marker) = geo::extract_and_remove(&mut message);

        let service = service_name(query.name(), &config.base_domain);

        // 3. Local hit.
        if !has_marker && self.local_services.contains(&service).await {
            return Ok(Decision::Answer(synthesize_answer(
                &message, &query, config.site_ip,
            )));
        }

        // 4. Peer redirect.
        let (sites, found) = self.service_table.lookup(&service).await;
        if found && !sites.is_empty() {
            let from = marker.unwrap_or(config.site_point);
            if let Some(site) = closest(&sites, &from) {
                return Ok(Decision::Answer(synthesize_answer(&message, &query, site.ip)));
            }
        }

        // 5. No upstreams.
        let proxies = self.proxies();
        if proxies.is_empty() {
            return Ok(Decision::Yield);
        }

        // 6. Forward, with our own location marker inserted.
        let own_loc = geo::encode(query.name().clone(), config.site_point);
        geo::insert(&mut message, own_loc);

        match forward::forward(&proxies, &self.policy, config.max_fails, config.force_tcp, &message).await {
            Ok(mut response) => {
                response.set_id(request.id());
                response.set_message_type(MessageType::Response);
                Ok(Decision::Answer(response))
            }
            Err(EngineError::NoHealthy) => {
                warn!("no healthy upstream and nothing to forward to; yielding");
                Ok(Decision::Yield)
            }
            Err(e) => Err(e),
        }
    }
}

/// Strips `base_domain` off `name` and lower-cases what remains, yielding
/// the service name the way the service table and local set key on it.
fn service_name(name: &Name, base_domain: &Name) -> String {
    let name = name.to_string().trim_end_matches('.').to_lowercase();
    let base = base_domain.to_string().trim_end_matches('.').to_lowercase();

    let service = if base.is_empty() {
        name.as_str()
    } else {
        name.strip_suffix(&base).unwrap_or(&name)
    };

    service.trim_end_matches('.').to_string()
}

fn synthesize_answer(request: &Message, query: &Query, ip: std::net::IpAddr) -> Message {
    let rdata = match ip {
        std::net::IpAddr::V4(addr) => RData::A(addr.into()),
        std::net::IpAddr::V6(addr) => RData::AAAA(addr.into()),
    };
    let record_type = match ip {
        std::net::IpAddr::V4(_) => RecordType::A,
        std::net::IpAddr::V6(_) => RecordType::AAAA,
    };

    let mut answer = Record::from_rdata(query.name().clone(), 0, rdata);
    answer.set_dns_class(DNSClass::IN);
    answer.set_record_type(record_type);

    let mut response = Message::new();
    response.set_id(request.id());
    response.set_message_type(MessageType::Response);
    response.set_op_code(OpCode::Query);
    response.add_query(query.clone());
    response.add_answer(answer);
    response.set_authoritative(true);
    response.set_response_code(hickory_server::proto::op::ResponseCode::NoError);

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service_table::Site;
    use std::collections::HashMap;

    fn base() -> Name {
        Name::from_ascii("geo.example.").unwrap()
    }

    fn query_message(name: &str) -> Message {
        let mut message = Message::new();
        message.set_message_type(MessageType::Query);
        message.set_op_code(OpCode::Query);
        message.add_query(Query::query(Name::from_ascii(name).unwrap(), RecordType::A));
        message
    }

    fn engine_with(proxies: Vec<Arc<Proxy>>) -> Engine {
        Engine::new(
            EngineConfig {
                base_domain: base(),
                except: Vec::new(),
                max_fails: 2,
                force_tcp: false,
                site_ip: "55.0.0.1".parse().unwrap(),
                site_point: Point::new(55.0, 13.0),
            },
            proxies,
            SelectionPolicy::Random,
            ServiceTable::new(),
            LocalServiceSet::new(),
        )
    }

    #[tokio::test]
    async fn unmatched_domain_yields() {
        let engine = engine_with(vec![]);
        let message = query_message("foo.somewhere.else.");
        match engine.resolve(&message).await.unwrap() {
            Decision::Yield => {}
            _ => panic!("expected Yield"),
        }
    }

    #[tokio::test]
    async fn local_hit_answers_with_own_ip() {
        let engine = engine_with(vec![]);
        engine.local_services().add("foo".into()).await;

        let message = query_message("foo.geo.example.");
        match engine.resolve(&message).await.unwrap() {
            Decision::Answer(response) => {
                assert!(response.header().authoritative());
                let answer = response.answers().first().unwrap();
                assert_eq!(*answer.data().unwrap(), RData::A("55.0.0.1".parse().unwrap()));
            }
            Decision::Yield => panic!("expected an answer"),
        }
    }

    #[tokio::test]
    async fn peer_redirect_picks_closest_site() {
        let engine = engine_with(vec![]);

        let mut sites = std::collections::HashSet::new();
        sites.insert(Site {
            ip: "1.1.1.1".parse().unwrap(),
            coords: Point::new(0.0, 0.0),
        });
        sites.insert(Site {
            ip: "2.2.2.2".parse().unwrap(),
            coords: Point::new(60.0, 15.0),
        });

        let mut map = HashMap::new();
        map.insert("bar".to_string(), sites);
        engine.service_table().bulk_replace(map).await;

        let message = query_message("bar.geo.example.");
        match engine.resolve(&message).await.unwrap() {
            Decision::Answer(response) => {
                let answer = response.answers().first().unwrap();
                assert_eq!(
                    *answer.data().unwrap(),
                    RData::A("2.2.2.2".parse().unwrap())
                );
            }
            Decision::Yield => panic!("expected an answer"),
        }
    }

    #[tokio::test]
    async fn no_upstreams_yields_when_no_local_or_table_match() {
        let engine = engine_with(vec![]);
        let message = query_message("absent.geo.example.");
        match engine.resolve(&message).await.unwrap() {
            Decision::Yield => {}
            _ => panic!("expected Yield"),
        }
    }
}
