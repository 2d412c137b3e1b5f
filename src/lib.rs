#![deny(unreachable_pub)]
mod api;
mod config;
mod engine;
mod error;
mod forward;
mod geo;
mod policy;
mod proxy;
mod server;
mod service_table;
mod tls;
mod watcher;

use std::{
    mem,
    path::{Path, PathBuf},
    sync::Arc,
};

pub use error::Error;
use tokio::sync::Mutex;

use crate::{
    api::ApiServer,
    config::Config,
    engine::{Engine, EngineConfig},
    proxy::Proxy,
    server::DnsServer,
    service_table::{LocalServiceSet, ServiceTable},
    watcher::{watch, WatchListener, Watcher},
};

/// Reads just the logging toggles out of the config file, so `main` can
/// build its `tracing` filter before the rest of startup runs (§4.10).
pub fn debug_flags(config_path: &Path) -> (bool, bool) {
    match Config::from_file(config_path) {
        Ok(config) => (config.dns_debug, config.service_debug),
        Err(_) => (false, false),
    }
}

fn engine_config(config: &Config) -> EngineConfig {
    EngineConfig {
        base_domain: config.base_domain.clone(),
        except: config.except.clone(),
        max_fails: config.max_fails,
        force_tcp: config.force_tcp,
        site_ip: config.site_ip,
        site_point: config.site_point,
    }
}

async fn build_proxies(config: &Config) -> Result<Vec<Arc<Proxy>>, Error> {
    let tls_config = config.tls_client_config()?;

    let proxies = config
        .upstream
        .iter()
        .map(|upstream| {
            let proxy = Proxy::new(
                *upstream,
                tls_config.clone(),
                config.tls_servername.clone(),
                config.expire,
            );
            proxy.start();
            proxy
        })
        .collect();

    Ok(proxies)
}

async fn stop_proxies(proxies: &[Arc<Proxy>]) {
    for proxy in proxies {
        proxy.stop().await;
    }
}

struct LockedOption<T> {
    inner: Arc<Mutex<Option<T>>>,
}

impl<T> Clone for LockedOption<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Default for LockedOption<T> {
    fn default() -> Self {
        Self {
            inner: Default::default(),
        }
    }
}

impl<T> LockedOption<T> {
    async fn take(&self) -> Option<T> {
        self.inner.lock().await.take()
    }

    async fn replace(&self, value: T) -> Option<T> {
        self.inner.lock().await.replace(value)
    }
}

/// The top-level process lifecycle: owns the engine, the hosting DNS
/// server, the optional control API, and the config file watcher. Mirrors
/// the teacher's `Server` shape, generalized from a zone/record store to the
/// geo-aware query engine.
#[derive(Clone)]
pub struct GeoEdge {
    engine: Arc<Engine>,
    current_config: Arc<Mutex<Config>>,
    dns_server: Arc<Mutex<DnsServer>>,
    api_server: LockedOption<ApiServer>,
    config_watcher: LockedOption<Watcher>,
}

struct ConfigWatcher {
    config_file: PathBuf,
    geoedge: GeoEdge,
}

impl WatchListener for ConfigWatcher {
    async fn event(&mut self, _: watcher::FileEvent) {
        match Config::from_file(&self.config_file) {
            Ok(config) => self.geoedge.update_config(config).await,
            Err(e) => {
                tracing::error!(error = %e, "failed to reload config");
            }
        }
    }
}

impl GeoEdge {
    pub async fn new(config_path: &Path) -> Result<Self, Error> {
        let config = Config::from_file(config_path)?;

        let proxies = build_proxies(&config).await?;
        let engine = Arc::new(Engine::new(
            engine_config(&config),
            proxies,
            config.policy.into(),
            ServiceTable::new(),
            LocalServiceSet::new(),
        ));

        let dns_server = DnsServer::new(&config.server, engine.clone()).await;

        let geoedge = Self {
            engine,
            dns_server: Arc::new(Mutex::new(dns_server)),
            api_server: Default::default(),
            config_watcher: Default::default(),
            current_config: Arc::new(Mutex::new(config.clone())),
        };

        if let Some(api_server) = config
            .api
            .as_ref()
            .and_then(|api_config| ApiServer::new(api_config, geoedge.engine.clone()))
        {
            geoedge.api_server.replace(api_server).await;
        }

        match watch(
            config_path,
            ConfigWatcher {
                config_file: config_path.to_owned(),
                geoedge: geoedge.clone(),
            },
        ) {
            Ok(watcher) => {
                geoedge.config_watcher.replace(watcher).await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to set up config file watcher, config changes will not be detected");
            }
        }

        Ok(geoedge)
    }

    pub async fn shutdown(&self) {
        tracing::info!("server shutting down");

        self.config_watcher.take().await;

        if let Some(api_server) = self.api_server.take().await {
            api_server.shutdown().await;
        }

        {
            let mut dns_server = self.dns_server.lock().await;
            dns_server.shutdown().await;
        }

        stop_proxies(&self.engine.proxies()).await;
    }

    async fn update_config(&self, config: Config) {
        let (restart_server, restart_api, old_config) = {
            let mut current = self.current_config.lock().await;
            let restart_server = current.server != config.server;
            let restart_api = current.api != config.api;

            let mut old_config = config.clone();
            mem::swap(&mut *current, &mut old_config);

            (restart_server, restart_api, old_config)
        };

        let new_proxies = match build_proxies(&config).await {
            Ok(proxies) => proxies,
            Err(e) => {
                tracing::error!(error = %e, "failed to build proxies from reloaded config, keeping previous upstreams");
                return;
            }
        };

        let old_proxies = self.engine.proxies();
        self.engine.replace_proxies(new_proxies);
        self.engine.replace_config(engine_config(&config));
        stop_proxies(&old_proxies).await;

        let _ = old_config;

        if restart_server {
            let mut dns_server = self.dns_server.lock().await;
            dns_server.restart(&config.server).await;
        }

        if restart_api {
            if let Some(old_api) = self.api_server.take().await {
                old_api.shutdown().await;
            }

            if let Some(api_server) = config
                .api
                .as_ref()
                .and_then(|api_config| ApiServer::new(api_config, self.engine.clone()))
            {
                self.api_server.replace(api_server).await;
            }
        }
    }
}
