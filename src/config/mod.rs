//! Layered configuration (C9): a YAML file plus `GEOEDGE_`-prefixed
//! environment overrides, resolved into the typed values the rest of the
//! crate consumes, with live reload on file change (§4.9).

mod file;

use std::{
    net::IpAddr,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
    time::Duration,
};

use figment::{
    providers::{Env, Format, Yaml},
    value::{Uncased, UncasedStr},
    Figment,
};
use hickory_server::proto::rr::Name;

pub(crate) use crate::{api::ApiConfig, server::ServerConfig};
use crate::{
    error::Error,
    geo::Point,
    policy::SelectionPolicyConfig,
    proxy::UpstreamConfig,
    tls::TlsConfig,
};

fn map_env(key: &UncasedStr) -> Uncased<'_> {
    key.as_str()
        .split('_')
        .enumerate()
        .fold(String::new(), |mut key, (idx, part)| {
            if idx == 0 {
                key.push_str(&part.to_lowercase());
            } else {
                key.push_str(&part[0..1].to_uppercase());
                key.push_str(&part[1..].to_lowercase());
            }

            key
        })
        .into()
}

fn fqdn(name: &str) -> Result<Name, Error> {
    let mut name = Name::from_str(name)?;
    name.set_fqdn(true);
    Ok(name)
}

/// The resolved configuration snapshot (§3 "Config snapshot"): every option
/// in §6, replaced wholesale on reload.
#[derive(Clone, Debug)]
pub(crate) struct Config {
    pub(crate) config_file: PathBuf,
    pub(crate) base_domain: Name,
    pub(crate) upstream: Vec<UpstreamConfig>,
    pub(crate) policy: SelectionPolicyConfig,
    pub(crate) except: Vec<Name>,
    pub(crate) max_fails: u32,
    pub(crate) expire: Duration,
    pub(crate) force_tcp: bool,
    pub(crate) tls: Option<TlsConfig>,
    pub(crate) tls_servername: Option<String>,
    pub(crate) dns_debug: bool,
    pub(crate) service_debug: bool,
    pub(crate) site_ip: IpAddr,
    pub(crate) site_point: Point,
    pub(crate) server: ServerConfig,
    pub(crate) api: Option<ApiConfig>,
}

impl Config {
    pub(crate) fn from_file(config_file: &Path) -> Result<Config, Error> {
        let parsed: file::ConfigFile = Figment::new()
            .join(Env::prefixed("GEOEDGE_").map(map_env).lowercase(false))
            .join(Yaml::file_exact(config_file))
            .extract()?;

        let except = parsed
            .except
            .iter()
            .map(|s| fqdn(s))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Config {
            config_file: config_file.to_owned(),
            base_domain: fqdn(&parsed.base_domain)?,
            upstream: parsed.upstream,
            policy: parsed.policy,
            except,
            max_fails: parsed.max_fails,
            expire: Duration::from_secs(parsed.expire_secs),
            force_tcp: parsed.force_tcp,
            tls: parsed.tls,
            tls_servername: parsed.tls_servername,
            dns_debug: parsed.dns_debug,
            service_debug: parsed.service_debug,
            site_ip: parsed.site.ip,
            site_point: Point::new(parsed.site.lat, parsed.site.lon),
            server: parsed.server,
            api: parsed.api,
        })
    }

    /// The `rustls::ClientConfig` for `tcp-tls` upstreams, if TLS material is
    /// configured.
    pub(crate) fn tls_client_config(&self) -> Result<Option<Arc<rustls::ClientConfig>>, Error> {
        match &self.tls {
            Some(tls) => Ok(Some(Arc::new(crate::tls::build_client_config(tls)?))),
            None => Ok(None),
        }
    }
}

impl PartialEq for Config {
    /// Structural equality over the fields that matter for deciding whether
    /// a reload needs to rebuild anything (server bind address, API bind
    /// address): the rest (proxies, policy, engine knobs) are always
    /// re-applied wholesale on reload regardless.
    fn eq(&self, other: &Self) -> bool {
        self.server == other.server && self.api == other.api
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_minimal_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "base_domain: geo.example.\nsite:\n  ip: 10.0.0.1\n  lat: 55.0\n  lon: 13.0\n"
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.base_domain, fqdn("geo.example.").unwrap());
        assert_eq!(config.max_fails, 2);
        assert_eq!(config.expire, Duration::from_secs(10));
        assert_eq!(config.site_ip, "10.0.0.1".parse::<IpAddr>().unwrap());
    }
}
