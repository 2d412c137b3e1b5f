//! The control API (C8): an `actix-web` surface exposing the two external
//! collaborators the engine treats as typed inputs (§4.8) plus a status
//! endpoint for operational visibility.

use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use actix_web::{dev, get, post, web, App, HttpResponse, HttpServer, Responder};
use serde::{Deserialize, Serialize};

use crate::{engine::Engine, service_table::SiteSet};

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub(crate) struct ApiConfig {
    pub(crate) address: SocketAddr,
}

#[derive(Clone)]
struct AppData {
    engine: Arc<Engine>,
}

#[post("/v1/services/table")]
async fn services_table(
    app_data: web::Data<AppData>,
    body: web::Json<HashMap<String, SiteSet>>,
) -> impl Responder {
    app_data.engine.service_table().bulk_replace(body.into_inner()).await;
    HttpResponse::Ok().finish()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum LocalServiceOp {
    Add,
    Remove,
    Replace,
}

#[derive(Debug, Deserialize)]
struct LocalServiceUpdate {
    op: LocalServiceOp,
    names: Vec<String>,
}

#[post("/v1/services/local")]
async fn services_local(
    app_data: web::Data<AppData>,
    body: web::Json<LocalServiceUpdate>,
) -> impl Responder {
    let LocalServiceUpdate { op, names } = body.into_inner();
    let local = app_data.engine.local_services();

    match op {
        LocalServiceOp::Add => {
            for name in names {
                local.add(name).await;
            }
        }
        LocalServiceOp::Remove => {
            for name in &names {
                local.remove(name).await;
            }
        }
        LocalServiceOp::Replace => {
            local.replace(names.into_iter().collect()).await;
        }
    }

    HttpResponse::Ok().finish()
}

#[derive(Serialize)]
struct ProxyStatus {
    upstream: String,
    failures: u32,
    down: bool,
}

#[derive(Serialize)]
struct StatusResponse {
    server_version: String,
    site_ip: std::net::IpAddr,
    proxies: Vec<ProxyStatus>,
    service_count: usize,
    local_service_count: usize,
}

#[get("/v1/status")]
async fn status(app_data: web::Data<AppData>) -> impl Responder {
    let config = app_data.engine.config();
    let max_fails = config.max_fails;

    let proxies = app_data
        .engine
        .proxies()
        .iter()
        .map(|proxy| ProxyStatus {
            upstream: proxy.config.to_string(),
            failures: proxy.failures(),
            down: proxy.down(max_fails),
        })
        .collect();

    let response = StatusResponse {
        server_version: env!("CARGO_PKG_VERSION").to_string(),
        site_ip: config.site_ip,
        proxies,
        service_count: app_data.engine.service_table().len().await,
        local_service_count: app_data.engine.local_services().snapshot().await.len(),
    };

    web::Json(response)
}

fn create_server(config: &ApiConfig, app_data: AppData) -> Option<(dev::Server, u16)> {
    tracing::info!(address = %config.address, "starting api server");

    let api_server = match HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(app_data.clone()))
            .service(services_table)
            .service(services_local)
            .service(status)
    })
    .disable_signals()
    .bind(config.address)
    {
        Ok(server) => server,
        Err(e) => {
            tracing::error!(error = %e, "failed to create api server");
            return None;
        }
    };

    let port = api_server.addrs().first().unwrap().port();

    Some((api_server.run(), port))
}

pub(crate) struct ApiServer {
    #[cfg(test)]
    pub(crate) port: u16,
    api_server: dev::ServerHandle,
}

impl ApiServer {
    pub(crate) fn new(config: &ApiConfig, engine: Arc<Engine>) -> Option<Self> {
        let data = AppData { engine };

        create_server(config, data).map(|(api_server, _port)| {
            let handle = api_server.handle();
            tokio::spawn(api_server);

            Self {
                #[cfg(test)]
                port: _port,
                api_server: handle,
            }
        })
    }

    pub(crate) async fn shutdown(self) {
        self.api_server.stop(!cfg!(test)).await;
    }
}
