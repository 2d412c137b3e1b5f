//! The raw shape of the YAML config file / environment overrides, before
//! it's resolved into the typed [`super::Config`] the rest of the crate uses.

use serde::Deserialize;

use crate::{
    api::ApiConfig, policy::SelectionPolicyConfig, proxy::UpstreamConfig, server::ServerConfig,
    tls::TlsConfig,
};

fn default_base_domain() -> String {
    ".".to_string()
}

fn default_max_fails() -> u32 {
    2
}

fn default_expire_secs() -> u64 {
    10
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub(super) struct SiteConfig {
    pub(super) ip: std::net::IpAddr,
    pub(super) lat: f64,
    pub(super) lon: f64,
}

#[derive(Debug, Deserialize)]
pub(super) struct ConfigFile {
    #[serde(default = "default_base_domain")]
    pub(super) base_domain: String,

    #[serde(default)]
    pub(super) upstream: Vec<UpstreamConfig>,

    #[serde(default)]
    pub(super) policy: SelectionPolicyConfig,

    #[serde(default)]
    pub(super) except: Vec<String>,

    #[serde(default = "default_max_fails")]
    pub(super) max_fails: u32,

    #[serde(default = "default_expire_secs")]
    pub(super) expire_secs: u64,

    #[serde(default)]
    pub(super) force_tcp: bool,

    #[serde(default)]
    pub(super) tls: Option<TlsConfig>,

    #[serde(default)]
    pub(super) tls_servername: Option<String>,

    #[serde(default)]
    pub(super) dns_debug: bool,

    #[serde(default)]
    pub(super) service_debug: bool,

    pub(super) site: SiteConfig,

    #[serde(default)]
    pub(super) server: ServerConfig,

    #[serde(default)]
    pub(super) api: Option<ApiConfig>,
}
