//! Hosting the query engine behind a DNS server (C7): binds UDP/TCP sockets
//! and drives requests through [`Engine::resolve`] (§4.7).

mod handler;

use std::{sync::Arc, time::Duration};

use hickory_server::ServerFuture;
use serde::Deserialize;
use tokio::net::{TcpListener, UdpSocket};

use self::handler::Handler;
use crate::engine::Engine;

#[derive(Clone, Debug, PartialEq, Eq, Default, Deserialize)]
pub(crate) struct ServerConfig {
    #[serde(default)]
    pub(crate) port: Option<u16>,
}

/// Owns the bound sockets and the `ServerFuture` driving them. Swapped out
/// wholesale on a config reload that changes the port (§4.9).
pub(crate) struct DnsServer {
    engine: Arc<Engine>,
    server: ServerFuture<Handler>,
}

impl DnsServer {
    pub(crate) async fn new(server_config: &ServerConfig, engine: Arc<Engine>) -> Self {
        Self {
            engine: engine.clone(),
            server: Self::build_server(server_config, engine).await,
        }
    }

    pub(crate) async fn shutdown(&mut self) {
        tracing::debug!("shutting down dns service");

        if let Err(e) = self.server.shutdown_gracefully().await {
            tracing::error!(error = %e, "failure while shutting down dns server");
        }
    }

    pub(crate) async fn restart(&mut self, server_config: &ServerConfig) {
        tracing::debug!("restarting dns service");

        if let Err(e) = self.server.block_until_done().await {
            tracing::error!(error = %e, "failure while shutting down dns server");
        }

        self.server = Self::build_server(server_config, self.engine.clone()).await;
    }

    async fn build_server(server_config: &ServerConfig, engine: Arc<Engine>) -> ServerFuture<Handler> {
        let handler = Handler { engine };

        let port = server_config.port.unwrap_or(53);

        let mut server = ServerFuture::new(handler);

        match UdpSocket::bind(("0.0.0.0", port)).await {
            Ok(socket) => {
                tracing::info!("server listening on udp://0.0.0.0:{}", port);
                server.register_socket(socket);
            }
            Err(e) => tracing::error!(error = %e, "unable to open udp socket"),
        }

        match TcpListener::bind(("0.0.0.0", port)).await {
            Ok(socket) => {
                tracing::info!("server listening on tcp://0.0.0.0:{}", port);
                server.register_listener(socket, Duration::from_millis(500));
            }
            Err(e) => tracing::error!(error = %e, "unable to open tcp socket"),
        }

        server
    }
}
