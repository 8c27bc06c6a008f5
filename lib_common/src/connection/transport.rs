//! # Transport
//!
//! Opens the byte stream the engine runs the protocol over. Production uses
//! [`TlsServerConnector`]; anything implementing [`Connector`] (an in-memory
//! duplex pipe, for instance) can stand in for it.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use rustls::{ClientConfig, RootCertStore};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use super::error::ConnectionError;
use crate::configs::{ConfigError, ConnectionSettings};

/// A bidirectional byte stream the engine can own.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// # Connector
///
/// Produces a fresh stream for every connection attempt.
pub trait Connector: Send + Sync {
    fn connect(&self) -> BoxFuture<'_, Result<BoxedStream, ConnectionError>>;

    /// Human-readable target for log lines.
    fn describe(&self) -> String;
}

/// # TLS Server Connector
///
/// TCP connect followed by a rustls handshake, both under one timeout budget
/// each.
pub struct TlsServerConnector {
    host: String,
    port: u16,
    server_name: ServerName<'static>,
    connector: TlsConnector,
    connect_timeout: Duration,
}

impl TlsServerConnector {
    /// Builds the connector from the connection settings, loading the CA and
    /// optional client certificate up front so bad TLS material fails at
    /// startup instead of on every reconnect.
    pub fn from_settings(settings: &ConnectionSettings) -> Result<Self, ConnectionError> {
        let config = build_client_config(
            settings.server_ca_file.as_deref(),
            settings.client_cert_file.as_deref(),
            settings.client_key_file.as_deref(),
        )?;
        let server_name = ServerName::try_from(settings.server_host.clone()).map_err(|e| ConfigError::Invalid {
            field: "serverHost",
            reason: e.to_string(),
        })?;

        Ok(Self {
            host: settings.server_host.clone(),
            port: settings.server_port,
            server_name,
            connector: TlsConnector::from(Arc::new(config)),
            connect_timeout: settings.timings.connect_timeout(),
        })
    }
}

impl Connector for TlsServerConnector {
    fn connect(&self) -> BoxFuture<'_, Result<BoxedStream, ConnectionError>> {
        Box::pin(async move {
            let tcp = timeout(self.connect_timeout, TcpStream::connect((self.host.as_str(), self.port)))
                .await
                .map_err(|_| ConnectionError::Timeout("TCP connect"))??;
            tcp.set_nodelay(true)?;
            debug!(host = %self.host, port = self.port, "TCP connection established, starting TLS handshake");

            let tls = timeout(self.connect_timeout, self.connector.connect(self.server_name.clone(), tcp))
                .await
                .map_err(|_| ConnectionError::Timeout("TLS handshake"))?
                .map_err(|e| ConnectionError::Tls(e.to_string()))?;

            Ok(Box::new(tls) as BoxedStream)
        })
    }

    fn describe(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// # Build Client Config
///
/// Sets up the `rustls::ClientConfig` used for the server connection.
///
/// With a CA file only the certificates in that file are trusted, which pins
/// the deployment's own CA. Without one the system roots
/// (`rustls-native-certs`) plus the `webpki-roots` bundle are used. A client
/// certificate and key, when both given, enable mutual TLS.
pub fn build_client_config(
    ca_file: Option<&Path>,
    client_cert: Option<&Path>,
    client_key: Option<&Path>,
) -> Result<ClientConfig, ConfigError> {
    let mut root_store = RootCertStore::empty();

    match ca_file {
        Some(path) => {
            for cert in load_certs(path)? {
                root_store.add(cert).map_err(|e| tls_material(path, e))?;
            }
        }
        None => {
            let native_certs = rustls_native_certs::load_native_certs();
            for error in native_certs.errors {
                warn!("Error loading a native certificate: {}", error);
            }
            for cert in native_certs.certs {
                if let Err(e) = root_store.add(cert) {
                    debug!("Skipping unusable native certificate: {}", e);
                }
            }
            root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        }
    }

    let builder = ClientConfig::builder().with_root_certificates(root_store);

    match (client_cert, client_key) {
        (Some(cert_path), Some(key_path)) => {
            let certs = load_certs(cert_path)?;
            let key = load_private_key(key_path)?;
            builder.with_client_auth_cert(certs, key).map_err(|e| tls_material(key_path, e))
        }
        _ => Ok(builder.with_no_client_auth()),
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ConfigError> {
    let file = File::open(path).map_err(|e| tls_material(path, e))?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| tls_material(path, e))?;
    if certs.is_empty() {
        return Err(tls_material(path, "no certificates found"));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, ConfigError> {
    let file = File::open(path).map_err(|e| tls_material(path, e))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| tls_material(path, e))?
        .ok_or_else(|| tls_material(path, "no private key found"))
}

fn tls_material(path: &Path, reason: impl ToString) -> ConfigError {
    ConfigError::TlsMaterial { path: path.to_path_buf(), reason: reason.to_string() }
}
