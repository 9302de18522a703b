use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio_rustls::rustls::server::WebPkiClientVerifier;
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use super::{ClientAuthMode, WrappedStream};
use crate::error::ProxyError;

/// TLS wrapper configuration, sourced from the `tls_key`/`tls_cert`/`tls_ca`/`tls_auth`
/// CLI flags (§6). `client_id_override` corresponds to an operator-supplied identity that
/// takes precedence over the peer certificate's common name.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub key_path: PathBuf,
    pub cert_path: PathBuf,
    pub ca_path: Option<PathBuf>,
    pub client_auth: ClientAuthMode,
    pub client_id_override: Option<String>,
}

fn load_certs(path: &PathBuf) -> Result<Vec<CertificateDer<'static>>, ProxyError> {
    let bytes = std::fs::read(path)
        .map_err(|e| ProxyError::Config(format!("reading tls cert {path:?}: {e}")))?;
    rustls_pemfile::certs(&mut bytes.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ProxyError::Config(format!("parsing tls cert {path:?}: {e}")))
}

fn load_private_key(path: &PathBuf) -> Result<PrivateKeyDer<'static>, ProxyError> {
    let bytes = std::fs::read(path)
        .map_err(|e| ProxyError::Config(format!("reading tls key {path:?}: {e}")))?;
    rustls_pemfile::private_key(&mut bytes.as_slice())
        .map_err(|e| ProxyError::Config(format!("parsing tls key {path:?}: {e}")))?
        .ok_or_else(|| ProxyError::Config(format!("no private key found in {path:?}")))
}

fn build_server_config(cfg: &TlsConfig) -> Result<Arc<ServerConfig>, ProxyError> {
    let certs = load_certs(&cfg.cert_path)?;
    let key = load_private_key(&cfg.key_path)?;

    let builder = ServerConfig::builder();
    let server_config = if cfg.client_auth == ClientAuthMode::None {
        builder
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| ProxyError::Config(format!("building tls server config: {e}")))?
    } else {
        let ca_path = cfg.ca_path.as_ref().ok_or_else(|| {
            ProxyError::Config("tls_auth requires tls_ca to verify client certificates".into())
        })?;
        let mut store = RootCertStore::empty();
        for ca_cert in load_certs(ca_path)? {
            store
                .add(ca_cert)
                .map_err(|e| ProxyError::Config(format!("adding CA cert: {e}")))?;
        }
        let store = Arc::new(store);
        let verifier = match cfg.client_auth {
            ClientAuthMode::Request | ClientAuthMode::VerifyIfGiven => {
                WebPkiClientVerifier::builder(store)
                    .allow_unauthenticated()
                    .build()
            }
            _ => WebPkiClientVerifier::builder(store).build(),
        }
        .map_err(|e| ProxyError::Config(format!("building client verifier: {e}")))?;

        builder
            .with_client_cert_verifier(verifier)
            .with_single_cert(certs, key)
            .map_err(|e| ProxyError::Config(format!("building tls server config: {e}")))?
    };
    Ok(Arc::new(server_config))
}

/// Common-name extraction from the peer's leaf certificate, used as the derived
/// `clientID` when no override is configured.
fn common_name_of(der: &CertificateDer<'_>) -> Option<String> {
    let (_, cert) = x509_parser::parse_x509_certificate(der.as_ref()).ok()?;
    cert.subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(|s| s.to_string())
}

pub async fn wrap<S>(stream: S, cfg: &TlsConfig) -> Result<(WrappedStream, String), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let server_config = build_server_config(cfg)?;
    let acceptor = TlsAcceptor::from(server_config);
    let tls_stream = acceptor
        .accept(stream)
        .await
        .map_err(|e| ProxyError::Handshake {
            client_id: None,
            reason: format!("tls handshake failed: {e}"),
        })?;

    let client_id = if let Some(id) = &cfg.client_id_override {
        id.clone()
    } else {
        let (_, session) = tls_stream.get_ref();
        session
            .peer_certificates()
            .and_then(|certs| certs.first())
            .and_then(common_name_of)
            .ok_or_else(|| ProxyError::Handshake {
                client_id: None,
                reason: "no client certificate CN and no client_id_override configured".into(),
            })?
    };

    Ok((Box::new(tls_stream), client_id))
}

/// Database-side TLS context (§4.4): initiated on the upstream connection when the
/// database negotiates TLS, using the same `tls_db_sni`/`tls_ca`/`tls_key`/`tls_cert`/
/// `tls_auth` flags the client-facing listener uses. Presence of `sni` is what signals
/// the gateway to upgrade the plain TCP stream before speaking the wire protocol.
#[derive(Debug, Clone)]
pub struct DbTlsConfig {
    pub sni: String,
    pub ca_path: Option<PathBuf>,
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    pub client_auth: ClientAuthMode,
}

fn build_client_config(cfg: &DbTlsConfig) -> Result<Arc<ClientConfig>, ProxyError> {
    let mut store = RootCertStore::empty();
    if let Some(ca_path) = &cfg.ca_path {
        for ca_cert in load_certs(ca_path)? {
            store
                .add(ca_cert)
                .map_err(|e| ProxyError::Config(format!("adding database CA cert: {e}")))?;
        }
    } else {
        return Err(ProxyError::Config(
            "tls_db_sni requires tls_ca to verify the database's certificate".into(),
        ));
    }

    let builder = ClientConfig::builder().with_root_certificates(store);

    let client_config = match (&cfg.cert_path, &cfg.key_path) {
        (Some(cert_path), Some(key_path)) => {
            let certs = load_certs(cert_path)?;
            let key = load_private_key(key_path)?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| ProxyError::Config(format!("building database tls client config: {e}")))?
        }
        (None, None) if cfg.client_auth == ClientAuthMode::None => builder.with_no_client_auth(),
        _ => {
            return Err(ProxyError::Config(
                "tls_auth requires tls_key and tls_cert to present to the database".into(),
            ))
        }
    };
    Ok(Arc::new(client_config))
}

/// Upgrades an already-connected database stream to TLS as the client side.
pub async fn connect_db<S>(stream: S, cfg: &DbTlsConfig) -> Result<WrappedStream, ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let client_config = build_client_config(cfg)?;
    let connector = TlsConnector::from(client_config);
    let server_name = ServerName::try_from(cfg.sni.clone())
        .map_err(|e| ProxyError::Handshake {
            client_id: None,
            reason: format!("invalid tls_db_sni {:?}: {e}", cfg.sni),
        })?;
    let tls_stream = connector
        .connect(server_name, stream)
        .await
        .map_err(|e| ProxyError::Handshake {
            client_id: None,
            reason: format!("database tls handshake failed: {e}"),
        })?;
    Ok(Box::new(tls_stream))
}
