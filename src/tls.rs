//! Loads the `tls <cert> <key> <ca>` configuration option (§6) into a
//! `rustls::ClientConfig` used for `tcp-tls` upstream connections: a client
//! certificate for mutual TLS, and a CA used to verify the upstream's
//! certificate instead of the public web PKI (edge sites trust their own
//! federation, not the internet's).

use std::{
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
};

use rustls::{pki_types::CertificateDer, ClientConfig, RootCertStore};
use serde::Deserialize;

use crate::error::Error;

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct TlsConfig {
    pub(crate) cert: PathBuf,
    pub(crate) key: PathBuf,
    pub(crate) ca: PathBuf,
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, Error> {
    let file = File::open(path)?;
    rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(Error::from)
}

fn load_key(path: &Path) -> Result<rustls::pki_types::PrivateKeyDer<'static>, Error> {
    let file = File::open(path)?;
    rustls_pemfile::private_key(&mut BufReader::new(file))?.ok_or_else(|| Error::InvalidConfig {
        context: "tls.key".into(),
        message: format!("no private key found in {}", path.display()),
    })
}

pub(crate) fn build_client_config(config: &TlsConfig) -> Result<ClientConfig, Error> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(&config.ca)? {
        roots.add(cert).map_err(|source| Error::TlsError { source })?;
    }

    let certs = load_certs(&config.cert)?;
    let key = load_key(&config.key)?;

    ClientConfig::builder()
        .with_root_certificates(roots)
        .with_client_auth_cert(certs, key)
        .map_err(|source| Error::TlsError { source })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_key_file_is_invalid_config() {
        let config = TlsConfig {
            cert: PathBuf::from("/nonexistent/cert.pem"),
            key: PathBuf::from("/nonexistent/key.pem"),
            ca: PathBuf::from("/nonexistent/ca.pem"),
        };

        assert!(build_client_config(&config).is_err());
    }
}
