use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};

use super::WrappedStream;
use crate::error::ProxyError;

/// Configuration for the mutually-authenticated session-key-exchange wrapper (§4.2,
/// §8 scenario 5). `known_peers` maps a claimed `clientID` to that peer's long-term
/// public key, as loaded from the keystore's `connector-transport`/`server-transport`
/// records; an id absent from this map fails the handshake closed.
#[derive(Clone)]
pub struct SecureSessionConfig {
    pub own_id: String,
    pub own_static_key: StaticSecret,
    pub known_peers: HashMap<String, PublicKey>,
}

const MAX_FRAME_LEN: usize = 1 << 20;

fn derive_keys(shared_secrets: &[[u8; 32]], transcript: &[u8]) -> ([u8; 32], [u8; 32], [u8; 32]) {
    let mut ikm = Vec::with_capacity(shared_secrets.len() * 32);
    for s in shared_secrets {
        ikm.extend_from_slice(s);
    }
    let hk = Hkdf::<Sha256>::new(Some(transcript), &ikm);
    let mut c2s = [0u8; 32];
    let mut s2c = [0u8; 32];
    let mut confirm = [0u8; 32];
    hk.expand(b"secure-session client-to-server", &mut c2s)
        .expect("32 bytes is a valid HKDF output length");
    hk.expand(b"secure-session server-to-client", &mut s2c)
        .expect("32 bytes is a valid HKDF output length");
    hk.expand(b"secure-session confirm", &mut confirm)
        .expect("32 bytes is a valid HKDF output length");
    (c2s, s2c, confirm)
}

fn confirm_tag(confirm_key: &[u8; 32], transcript: &[u8], label: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(confirm_key);
    hasher.update(transcript);
    hasher.update(label);
    hasher.finalize().into()
}

async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, bytes: &[u8]) -> Result<(), ProxyError> {
    let len = bytes.len() as u32;
    w.write_all(&len.to_be_bytes())
        .await
        .map_err(|e| handshake_err(format!("writing frame: {e}")))?;
    w.write_all(bytes)
        .await
        .map_err(|e| handshake_err(format!("writing frame body: {e}")))?;
    w.flush()
        .await
        .map_err(|e| handshake_err(format!("flushing frame: {e}")))
}

async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<Vec<u8>, ProxyError> {
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf)
        .await
        .map_err(|e| handshake_err(format!("reading frame length: {e}")))?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(handshake_err(format!(
            "frame of {len} bytes exceeds the {MAX_FRAME_LEN}-byte limit"
        )));
    }
    let mut body = vec![0u8; len];
    r.read_exact(&mut body)
        .await
        .map_err(|e| handshake_err(format!("reading frame body: {e}")))?;
    Ok(body)
}

fn handshake_err(reason: String) -> ProxyError {
    ProxyError::Handshake {
        client_id: None,
        reason,
    }
}

pub async fn wrap<S>(
    mut stream: S,
    cfg: &SecureSessionConfig,
) -> Result<(WrappedStream, String), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    // Message 1: client -> server: claimed client id, then its ephemeral public key.
    let id_frame = read_frame(&mut stream).await?;
    let client_id = String::from_utf8(id_frame)
        .map_err(|_| handshake_err("client id was not valid utf-8".to_string()))?;
    let peer_static = cfg.known_peers.get(&client_id).copied().ok_or_else(|| {
        handshake_err(format!(
            "no known transport key on file for client id {client_id:?}"
        ))
    })?;

    let client_ephemeral_frame = read_frame(&mut stream).await?;
    let client_ephemeral = parse_public_key(&client_ephemeral_frame)?;

    // Message 2: server -> client: server's ephemeral public key, then a confirm tag.
    let server_ephemeral_secret = EphemeralSecret::random_from_rng(OsRng);
    let server_ephemeral_public = PublicKey::from(&server_ephemeral_secret);
    write_frame(&mut stream, server_ephemeral_public.as_bytes()).await?;

    let ephemeral_shared = server_ephemeral_secret.diffie_hellman(&client_ephemeral);
    let static_shared = cfg.own_static_key.diffie_hellman(&peer_static);

    let mut transcript = Vec::new();
    transcript.extend_from_slice(client_id.as_bytes());
    transcript.extend_from_slice(client_ephemeral.as_bytes());
    transcript.extend_from_slice(server_ephemeral_public.as_bytes());
    transcript.extend_from_slice(cfg.own_id.as_bytes());

    let (c2s_key, s2c_key, confirm_key) = derive_keys(
        &[*ephemeral_shared.as_bytes(), *static_shared.as_bytes()],
        &transcript,
    );

    let server_confirm = confirm_tag(&confirm_key, &transcript, b"server");
    write_frame(&mut stream, &server_confirm).await?;

    // Message 3: client -> server confirmation, proving it derived the same keys.
    let client_confirm = read_frame(&mut stream).await?;
    let expected_client_confirm = confirm_tag(&confirm_key, &transcript, b"client");
    if client_confirm != expected_client_confirm {
        return Err(handshake_err(
            "client confirmation tag did not match; peer identity rejected".to_string(),
        ));
    }

    let (relay_inner, relay_app) = tokio::io::duplex(65536);
    tokio::spawn(run_relay(stream, relay_inner, c2s_key, s2c_key));

    Ok((Box::new(relay_app), client_id))
}

fn parse_public_key(bytes: &[u8]) -> Result<PublicKey, ProxyError> {
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| handshake_err("ephemeral public key was not 32 bytes".to_string()))?;
    Ok(PublicKey::from(arr))
}

/// Pumps ciphertext between the raw socket and a plaintext `tokio::io::duplex` half that
/// the rest of the pipeline reads/writes like any other stream. Each direction gets its
/// own key (from HKDF) and its own monotonically increasing nonce counter, so neither
/// direction's counter can cause a nonce reuse in the other's.
async fn run_relay<S>(
    raw: S,
    plaintext_side: tokio::io::DuplexStream,
    c2s_key: [u8; 32],
    s2c_key: [u8; 32],
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (raw_read, raw_write) = tokio::io::split(raw);
    let (plain_read, plain_write) = tokio::io::split(plaintext_side);

    let decrypt_cipher = ChaCha20Poly1305::new(Key::from_slice(&c2s_key));
    let encrypt_cipher = ChaCha20Poly1305::new(Key::from_slice(&s2c_key));

    let inbound = relay_decrypt(raw_read, plain_write, decrypt_cipher);
    let outbound = relay_encrypt(plain_read, raw_write, encrypt_cipher);
    let _ = tokio::join!(inbound, outbound);
}

async fn relay_decrypt<R, W>(mut raw_read: R, mut plain_write: W, cipher: ChaCha20Poly1305)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let counter = AtomicU64::new(0);
    loop {
        let frame = match read_frame(&mut raw_read).await {
            Ok(f) => f,
            Err(_) => break,
        };
        let nonce_value = counter.fetch_add(1, Ordering::SeqCst);
        let nonce = frame_nonce(nonce_value);
        match cipher.decrypt(&nonce, frame.as_slice()) {
            Ok(plaintext) => {
                if plain_write.write_all(&plaintext).await.is_err() {
                    break;
                }
            }
            Err(_) => break,
        }
    }
}

async fn relay_encrypt<R, W>(mut plain_read: R, mut raw_write: W, cipher: ChaCha20Poly1305)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let counter = AtomicU64::new(0);
    let mut buf = vec![0u8; 16384];
    loop {
        let n = match plain_read.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        let nonce_value = counter.fetch_add(1, Ordering::SeqCst);
        let nonce = frame_nonce(nonce_value);
        let ciphertext = match cipher.encrypt(&nonce, &buf[..n]) {
            Ok(c) => c,
            Err(_) => break,
        };
        if write_frame(&mut raw_write, &ciphertext).await.is_err() {
            break;
        }
    }
}

fn frame_nonce(counter: u64) -> Nonce {
    let mut bytes = [0u8; 12];
    bytes[4..].copy_from_slice(&counter.to_be_bytes());
    *Nonce::from_slice(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn handshake_fails_closed_for_an_unknown_peer_identity() {
        let (client_side, server_side) = tokio::io::duplex(4096);
        let server_static = StaticSecret::random_from_rng(OsRng);
        let cfg = SecureSessionConfig {
            own_id: "acra_server".to_string(),
            own_static_key: server_static,
            known_peers: HashMap::new(), // nobody is known, so every client is rejected.
        };

        let client_task = tokio::spawn(async move {
            let mut client_side = client_side;
            write_frame(&mut client_side, b"unregistered-client")
                .await
                .unwrap();
            let ephemeral = EphemeralSecret::random_from_rng(OsRng);
            let public = PublicKey::from(&ephemeral);
            write_frame(&mut client_side, public.as_bytes()).await.ok();
        });

        let result = wrap(server_side, &cfg).await;
        assert!(result.is_err());
        client_task.await.unwrap();
    }
}
