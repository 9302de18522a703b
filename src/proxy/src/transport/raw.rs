use tokio::io::{AsyncRead, AsyncWrite};

use super::WrappedStream;
use crate::error::ProxyError;

/// No transformation; the configured `client_id` stands in for an identity the wire
/// never carries. Only legal when the operator explicitly disables transport encryption
/// (`acraconnector_transport_encryption_disable`).
#[derive(Debug, Clone)]
pub struct RawConfig {
    pub client_id: String,
}

pub async fn wrap<S>(stream: S, cfg: &RawConfig) -> Result<(WrappedStream, String), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    Ok((Box::new(stream), cfg.client_id.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn wrap_passes_through_and_returns_static_client_id() {
        let (a, _b) = duplex(64);
        let cfg = RawConfig {
            client_id: "static-client".to_string(),
        };
        let (_, client_id) = wrap(a, &cfg).await.unwrap();
        assert_eq!(client_id, "static-client");
    }
}
