use std::sync::Arc;

use common::metrics::metric_def::{PROXY_CENSOR_DENIED_TOTAL, PROXY_POISON_DETECTED_TOTAL};
use tokio::io::{split, AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{info, warn};
use x25519_dalek::StaticSecret;

use crate::censor::{Censor, Verdict};
use crate::decryptor::{self, KeyResolver, Mode, PoisonPolicy, ZONE_ID_LEN};
use crate::error::{ProxyError, ProxyResult};
use crate::keystore::{KeyKind, Keystore};
use crate::protocol::{ByteaFormat, Dialect, Frame};
use crate::server::ServerLifecycle;
use crate::transport::tls::DbTlsConfig;
use crate::transport::{TransportWrapper, WrappedStream};

/// Stable id under which the poison keypair's private half is stored (§4.5 poison policy).
pub const POISON_KEY_ID: &str = "poison";

/// Everything a connection needs that doesn't change across the lifetime of the server
/// process: shared, cloned cheaply (`Arc`) into every spawned connection task.
pub struct PipelineConfig {
    pub dialect: Dialect,
    pub bytea_format: ByteaFormat,
    pub decrypt_mode: Mode,
    pub poison_policy: PoisonPolicy,
    pub zonemode_enable: bool,
    pub db_addr: String,
    pub db_tls: Option<DbTlsConfig>,
    pub keystore: Arc<Keystore>,
    pub censor: Arc<Censor>,
    pub transport: Arc<TransportWrapper>,
}

fn static_secret_from(bytes: Vec<u8>) -> Result<StaticSecret, ProxyError> {
    let arr: [u8; 32] = bytes.as_slice().try_into().map_err(|_| ProxyError::System(
        "key material is not 32 bytes".to_string(),
    ))?;
    Ok(StaticSecret::from(arr))
}

/// Backs `decryptor::KeyResolver` with keystore lookups, per §4.5 step 1: the connection's
/// client key unless zone mode is on and the cell carries a recognized ZoneID header, in
/// which case the zone's private key takes precedence. Zone ids are opaque bytes; they're
/// hex-encoded to address the keystore's string-keyed file layout (§4.1).
struct KeystoreResolver {
    keystore: Arc<Keystore>,
    client_key: StaticSecret,
    zonemode_enable: bool,
}

impl KeyResolver for KeystoreResolver {
    fn client_key(&self) -> &StaticSecret {
        &self.client_key
    }

    fn zone_key(&self, zone_id: &[u8; ZONE_ID_LEN]) -> Option<StaticSecret> {
        if !self.zonemode_enable {
            return None;
        }
        let id = hex::encode(zone_id);
        self.keystore
            .get_private_key(KeyKind::ZonePrivate, &id)
            .ok()
            .and_then(|bytes| static_secret_from(bytes).ok())
    }
}

/// Handles one accepted connection end to end: wraps the raw stream, opens the upstream
/// database connection, resolves the connection's keys, and runs the two concurrent pumps
/// until either side closes or the server signals shutdown (§4.4 "Pipeline loop").
pub async fn handle_connection<S>(
    client_stream: S,
    cfg: Arc<PipelineConfig>,
    lifecycle: Arc<ServerLifecycle>,
) -> ProxyResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (wrapped, client_id) = cfg.transport.wrap(client_stream).await?;
    lifecycle.on_connect();
    let outcome = run_connection(wrapped, &cfg, &lifecycle, &client_id).await;
    lifecycle.on_disconnect();
    if let Err(ref e) = outcome {
        warn!(code = e.code(), client_id, "connection ended with error: {e}");
    } else {
        info!(client_id, "connection closed");
    }
    outcome
}

async fn run_connection(
    wrapped: crate::transport::WrappedStream,
    cfg: &Arc<PipelineConfig>,
    lifecycle: &Arc<ServerLifecycle>,
    client_id: &str,
) -> ProxyResult<()> {
    let client_key_bytes = cfg
        .keystore
        .get_private_key(KeyKind::ClientStoragePrivate, client_id)
        .map_err(|source| ProxyError::Keystore {
            kind: "ClientStoragePrivate".to_string(),
            id: client_id.to_string(),
            source,
        })?;
    let client_key = static_secret_from(client_key_bytes)?;

    let poison_key = if cfg.poison_policy.detect {
        match cfg.keystore.get_private_key(KeyKind::PoisonPrivate, POISON_KEY_ID) {
            Ok(bytes) => Some(static_secret_from(bytes)?),
            Err(_) => None, // poison detection is opportunistic: no keypair, no checks.
        }
    } else {
        None
    };

    let resolver = Arc::new(KeystoreResolver {
        keystore: cfg.keystore.clone(),
        client_key,
        zonemode_enable: cfg.zonemode_enable,
    });

    let db_tcp = TcpStream::connect(&cfg.db_addr)
        .await
        .map_err(|e| ProxyError::System(format!("connecting to database {}: {e}", cfg.db_addr)))?;
    let db_stream: WrappedStream = match &cfg.db_tls {
        Some(db_tls) => crate::transport::tls::connect_db(db_tcp, db_tls).await?,
        None => Box::new(db_tcp),
    };

    let (client_read, client_write) = split(wrapped);
    let (db_read, db_write) = split(db_stream);

    let mut client_reader = crate::protocol::Reader::new(cfg.dialect, client_read);
    let db_writer = crate::protocol::Writer::new(cfg.dialect, db_write);
    let mut db_reader = crate::protocol::Reader::new(cfg.dialect, db_read);
    let mut client_writer = crate::protocol::Writer::new(cfg.dialect, client_write);

    // A single writer task owns the client-bound half of the stream; both pumps send
    // their outbound frames (rewritten rows, censor denials) through it so there is
    // never more than one writer for the client stream at a time.
    let (out_tx, mut out_rx) = mpsc::channel::<Frame>(32);

    let mut shutdown_rx = lifecycle.subscribe_shutdown();

    let writer_task = async {
        while let Some(frame) = out_rx.recv().await {
            client_writer.write_frame(&frame).await?;
        }
        Ok::<(), ProxyError>(())
    };

    let client_to_db = pump_client_to_db(&mut client_reader, db_writer, cfg.censor.clone(), client_id.to_string(), out_tx.clone());
    let db_to_client = pump_db_to_client(
        &mut db_reader,
        out_tx,
        resolver,
        poison_key,
        cfg.decrypt_mode,
        cfg.bytea_format,
        cfg.poison_policy.clone(),
        lifecycle.clone(),
    );

    tokio::select! {
        res = writer_task => res,
        res = client_to_db => res,
        res = db_to_client => res,
        _ = shutdown_rx.changed() => Ok(()),
    }
}

async fn pump_client_to_db<R, W>(
    reader: &mut crate::protocol::Reader<R>,
    mut db_writer: crate::protocol::Writer<W>,
    censor: Arc<Censor>,
    client_id: String,
    out_tx: mpsc::Sender<Frame>,
) -> ProxyResult<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let frame = match reader.read_frame().await? {
            None => return Ok(()),
            Some(frame) => frame,
        };

        if frame.is_query() {
            if let Some(sql) = frame.sql_text() {
                match censor.inspect(&sql, &client_id) {
                    Verdict::Allow => db_writer.write_frame(&frame).await?,
                    Verdict::Deny(reason) => {
                        metrics::counter!(PROXY_CENSOR_DENIED_TOTAL).increment(1);
                        let denial = frame.censor_denied(&reason);
                        if out_tx.send(denial).await.is_err() {
                            return Ok(());
                        }
                        continue;
                    }
                }
                continue;
            }
        }
        db_writer.write_frame(&frame).await?;
    }
}

#[allow(clippy::too_many_arguments)]
async fn pump_db_to_client<R>(
    reader: &mut crate::protocol::Reader<R>,
    out_tx: mpsc::Sender<Frame>,
    resolver: Arc<KeystoreResolver>,
    poison_key: Option<StaticSecret>,
    mode: Mode,
    bytea_format: ByteaFormat,
    poison_policy: PoisonPolicy,
    lifecycle: Arc<ServerLifecycle>,
) -> ProxyResult<()>
where
    R: AsyncRead + Unpin,
{
    loop {
        let frame = match reader.read_frame().await? {
            None => return Ok(()),
            Some(frame) => frame,
        };

        if !frame.is_row() {
            if out_tx.send(frame).await.is_err() {
                return Ok(());
            }
            continue;
        }

        let mut poison_matched = false;
        let resolver_ref: &dyn KeyResolver = resolver.as_ref();
        let rewritten = frame.rewrite_row(bytea_format, |cell| {
            let outcome = decryptor::process(mode, cell, resolver_ref, poison_key.as_ref());
            if outcome.poison_matched {
                poison_matched = true;
            }
            outcome.output
        });

        if poison_matched {
            handle_poison_match(&poison_policy, &lifecycle).await;
        }

        if out_tx.send(rewritten).await.is_err() {
            return Ok(());
        }
    }
}

/// Runs the configured poison action exactly once per occurrence (§4.5 poison policy).
async fn handle_poison_match(policy: &PoisonPolicy, lifecycle: &Arc<ServerLifecycle>) {
    warn!(code = 1600, "poison record match detected");
    metrics::counter!(PROXY_POISON_DETECTED_TOTAL).increment(1);

    if !policy.detect {
        return;
    }

    if let Some(script) = &policy.run_script {
        match std::process::Command::new(script).spawn() {
            Ok(_) => info!("poison script launched: {script:?}"),
            Err(e) => warn!("failed to launch poison script {script:?}: {e}"),
        }
    }

    if policy.shutdown {
        lifecycle.signal_error(ProxyError::PoisonDetected {
            client_id: "-".to_string(),
            offset: 0,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decryptor::ClientOnlyResolver;
    use rand::rngs::OsRng;
    use x25519_dalek::PublicKey;

    #[test]
    fn client_only_resolver_ignores_zone_ids() {
        let sk = StaticSecret::random_from_rng(OsRng);
        let resolver = ClientOnlyResolver(&sk);
        assert!(resolver.zone_key(&[0u8; ZONE_ID_LEN]).is_none());
    }

    #[test]
    fn static_secret_from_rejects_wrong_length() {
        assert!(static_secret_from(vec![1, 2, 3]).is_err());
    }

    #[test]
    fn static_secret_from_accepts_32_bytes() {
        let sk = StaticSecret::random_from_rng(OsRng);
        let bytes = sk.to_bytes().to_vec();
        let parsed = static_secret_from(bytes).unwrap();
        let pk_a = PublicKey::from(&sk);
        let pk_b = PublicKey::from(&parsed);
        assert_eq!(pk_a.as_bytes(), pk_b.as_bytes());
    }
}
