pub mod raw;
pub mod secure_session;
pub mod tls;

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::ProxyError;

/// Handshake deadline shared by all three wrappers (§4.2: "must enforce a handshake
/// deadline (default 30 s) and refuse to return a stream on deadline expiry").
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// A duplex byte stream, type-erased so the connection pipeline can hold whichever
/// wrapper variant produced it without being generic over it.
pub trait DuplexStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> DuplexStream for T {}

pub type WrappedStream = Box<dyn DuplexStream>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientAuthMode {
    None = 0,
    Request = 1,
    RequireAny = 2,
    VerifyIfGiven = 3,
    RequireAndVerify = 4,
}

impl ClientAuthMode {
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => ClientAuthMode::Request,
            2 => ClientAuthMode::RequireAny,
            3 => ClientAuthMode::VerifyIfGiven,
            4 => ClientAuthMode::RequireAndVerify,
            _ => ClientAuthMode::None,
        }
    }
}

/// The three interchangeable connection wrappers described in §4.2, modeled as a tagged
/// enum per REDESIGN FLAGS §9 ("no dynamic dispatch in the hot path required"): the
/// variant is chosen once at startup from CLI flags, not per-connection.
pub enum TransportWrapper {
    Raw(raw::RawConfig),
    Tls(Box<tls::TlsConfig>),
    SecureSession(secure_session::SecureSessionConfig),
}

impl TransportWrapper {
    /// `wrap(rawStream) -> (authenticatedStream, clientID) | Error`, uniform across all
    /// three variants and deadline-bounded by `HANDSHAKE_TIMEOUT`.
    pub async fn wrap<S>(&self, stream: S) -> Result<(WrappedStream, String), ProxyError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let fut = async {
            match self {
                TransportWrapper::Raw(cfg) => raw::wrap(stream, cfg).await,
                TransportWrapper::Tls(cfg) => tls::wrap(stream, cfg).await,
                TransportWrapper::SecureSession(cfg) => secure_session::wrap(stream, cfg).await,
            }
        };
        match tokio::time::timeout(HANDSHAKE_TIMEOUT, fut).await {
            Ok(result) => result,
            Err(_) => Err(ProxyError::Handshake {
                client_id: None,
                reason: "transport handshake exceeded deadline".to_string(),
            }),
        }
    }
}
