//! Protocol listeners and the HTTP planes.

pub mod dns;
pub mod dynamic;
pub mod http;
pub mod smtp;

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use tokio_rustls::rustls::ServerConfig;

use crate::error::ServerError;

/// Liveness report from a listener task to the supervisor in `main`.
#[derive(Debug)]
pub enum ListenerEvent {
    Ready {
        listener: &'static str,
    },
    Failed {
        listener: &'static str,
        error: String,
    },
}

/// Load the certificate chain and private key into a rustls server config
/// shared by the HTTPS and SMTPS listeners.
pub fn load_tls_config(
    certificate_path: &Path,
    private_key_path: &Path,
) -> Result<ServerConfig, ServerError> {
    let mut cert_reader = BufReader::new(
        File::open(certificate_path)
            .map_err(|err| ServerError::Tls(format!("{}: {err}", certificate_path.display())))?,
    );
    let certs = rustls_pemfile::certs(&mut cert_reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| ServerError::Tls(format!("bad certificate chain: {err}")))?;

    let mut key_reader = BufReader::new(
        File::open(private_key_path)
            .map_err(|err| ServerError::Tls(format!("{}: {err}", private_key_path.display())))?,
    );
    let key = rustls_pemfile::private_key(&mut key_reader)
        .map_err(|err| ServerError::Tls(format!("bad private key: {err}")))?
        .ok_or_else(|| ServerError::Tls("no private key found".to_string()))?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|err| ServerError::Tls(err.to_string()))?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(config)
}
