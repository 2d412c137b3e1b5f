use std::{io, net::AddrParseError};

use thiserror::Error;

/// Top level, startup/ambient errors. Per-request failure modes live in
/// [`crate::engine::EngineError`] instead, since they are a much narrower
/// set and need to map onto specific DNS response codes.
#[derive(Debug, Error)]
pub enum Error {
    #[error("DNS protocol error: {source}")]
    DnsError {
        #[from]
        source: hickory_server::proto::error::ProtoError,
    },
    #[error("IO error: {source}")]
    IoError {
        #[from]
        source: io::Error,
    },
    #[error("Invalid address: {source}")]
    AddrError {
        #[from]
        source: AddrParseError,
    },
    #[error("Config file error: {source}")]
    ConfigParseError {
        #[from]
        source: figment::Error,
    },
    #[error("Failed to watch config file: {source}")]
    WatchError {
        #[from]
        source: notify::Error,
    },
    #[error("Yaml parse error: {source}")]
    YamlParseError {
        #[from]
        source: serde_yaml::Error,
    },
    #[error("TLS error: {source}")]
    TlsError {
        #[from]
        source: rustls::Error,
    },
    #[error("{context}: {message}")]
    InvalidConfig { context: String, message: String },
}
