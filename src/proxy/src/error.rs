use thiserror::Error;

/// Error taxonomy for the gateway, one variant per the propagation rule it follows:
/// config/keystore-init errors abort startup, handshake/protocol errors close the
/// offending connection, censor denials become a client-visible error frame, decrypt
/// failures pass the cell through unchanged, poison detection runs its policy, and
/// system errors are fatal.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("keystore error for {kind}/{id}: {source}")]
    Keystore {
        kind: String,
        id: String,
        #[source]
        source: KeystoreError,
    },

    #[error("handshake failed for client {client_id:?}: {reason}")]
    Handshake {
        client_id: Option<String>,
        reason: String,
    },

    #[error("protocol error on connection {client_id}: {reason}")]
    Protocol { client_id: String, reason: String },

    #[error("query denied by censor for client {client_id}: {reason}")]
    CensorDenied { client_id: String, reason: String },

    #[error("cell at offset {offset} failed to decrypt: {reason}")]
    Decrypt { offset: usize, reason: String },

    #[error("poison record matched for client {client_id} at offset {offset}")]
    PoisonDetected { client_id: String, offset: usize },

    #[error("system error: {0}")]
    System(String),
}

impl ProxyError {
    /// Stable numeric event code logged alongside every error, per the error-handling
    /// design's "all errors are logged with a numeric event code" requirement.
    pub fn code(&self) -> u32 {
        match self {
            ProxyError::Config(_) => 1000,
            ProxyError::Keystore { .. } => 1100,
            ProxyError::Handshake { .. } => 1200,
            ProxyError::Protocol { .. } => 1300,
            ProxyError::CensorDenied { .. } => 1400,
            ProxyError::Decrypt { .. } => 1500,
            ProxyError::PoisonDetected { .. } => 1600,
            ProxyError::System(_) => 1700,
        }
    }

    /// Whether this error is connection-fatal (closes the offending connection but
    /// leaves the server running) as opposed to per-cell/non-fatal or process-fatal.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            ProxyError::Handshake { .. } | ProxyError::Protocol { .. }
        )
    }

    /// Whether this error must tear the whole server down (§7: "System-level errors ...
    /// are fatal").
    pub fn is_system_fatal(&self) -> bool {
        matches!(self, ProxyError::System(_))
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeystoreError {
    #[error("key not found")]
    NotFound,
    #[error("key material failed to decrypt or was malformed")]
    Corrupt,
    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for KeystoreError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::NotFound {
            KeystoreError::NotFound
        } else {
            KeystoreError::Io(e.to_string())
        }
    }
}

pub type ProxyResult<T> = Result<T, ProxyError>;
