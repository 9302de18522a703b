use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use memchr::memmem;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};

/// Fixed 8-byte magic prefix opening every "AcraStruct" envelope (§3 `EncryptedCell`).
pub const MAGIC: &[u8; 8] = b"ACRASTRT";

/// Marker opening a ZoneID header that may precede a cell in the same row when zone mode
/// is on (§3 `Connection.zoneID`, §4.5 step 1: "if a ZoneID header was seen earlier in the
/// same row, use the zone private key"). The header is `ZONE_MARKER || zone id bytes`.
pub const ZONE_MARKER: &[u8; 4] = b"ZONE";
pub const ZONE_ID_LEN: usize = 12;
pub const ZONE_HEADER_LEN: usize = ZONE_MARKER.len() + ZONE_ID_LEN;

const WRAPPED_KEY_LEN: usize = 48; // 32-byte data key + 16-byte Poly1305 tag
const HEADER_TAG_LEN: usize = 16;
const LEN_FIELD_LEN: usize = 8;
/// magic + ephemeral pubkey + wrapped key + header tag + length field.
const HEADER_LEN: usize = 8 + 32 + WRAPPED_KEY_LEN + HEADER_TAG_LEN + LEN_FIELD_LEN;

fn zero_nonce() -> Nonce {
    *Nonce::from_slice(&[0u8; 12])
}

#[derive(Debug, PartialEq, Eq)]
pub enum CellError {
    /// Not enough bytes to even contain a fixed-size header: pass through unchanged,
    /// per §8 scenario 6 ("a magic prefix followed by a truncated header").
    Truncated,
    /// A full header parsed but the wrapped key or payload failed to authenticate.
    TagMismatch,
}

fn kek(shared: &x25519_dalek::SharedSecret) -> [u8; 32] {
    let hk = Hkdf::<Sha256>::new(None, shared.as_bytes());
    let mut out = [0u8; 32];
    hk.expand(b"acrastruct-kek", &mut out)
        .expect("32 bytes is a valid HKDF output length");
    out
}

fn header_tag(data_key: &[u8; 32], magic: &[u8], epk: &[u8], wrapped: &[u8]) -> [u8; HEADER_TAG_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(data_key);
    hasher.update(magic);
    hasher.update(epk);
    hasher.update(wrapped);
    let digest = hasher.finalize();
    let mut out = [0u8; HEADER_TAG_LEN];
    out.copy_from_slice(&digest[..HEADER_TAG_LEN]);
    out
}

/// Encrypts `plaintext` into a self-describing cell addressed to `recipient_pub`.
pub fn encrypt_cell(plaintext: &[u8], recipient_pub: &PublicKey) -> Vec<u8> {
    let esk = EphemeralSecret::random_from_rng(OsRng);
    let epk = PublicKey::from(&esk);
    let shared = esk.diffie_hellman(recipient_pub);
    let kek_bytes = kek(&shared);

    let mut data_key = [0u8; 32];
    rand::RngCore::fill_bytes(&mut OsRng, &mut data_key);

    let wrap_cipher = ChaCha20Poly1305::new(Key::from_slice(&kek_bytes));
    let wrapped = wrap_cipher
        .encrypt(&zero_nonce(), data_key.as_slice())
        .expect("wrapping a 32-byte data key cannot fail");

    let tag = header_tag(&data_key, MAGIC, epk.as_bytes(), &wrapped);

    let payload_cipher = ChaCha20Poly1305::new(Key::from_slice(&data_key));
    let ciphertext = payload_cipher
        .encrypt(&zero_nonce(), plaintext)
        .expect("encrypting an in-memory buffer cannot fail");

    let mut out = Vec::with_capacity(HEADER_LEN + ciphertext.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(epk.as_bytes());
    out.extend_from_slice(&wrapped);
    out.extend_from_slice(&tag);
    out.extend_from_slice(&(plaintext.len() as u64).to_be_bytes());
    out.extend_from_slice(&ciphertext);
    out
}

/// Wraps a cell with a ZoneID header in front of it, so a reader that recognizes zone mode
/// knows which zone key to resolve before it reaches the `MAGIC` prefix.
pub fn encrypt_zone_cell(plaintext: &[u8], zone_id: &[u8; ZONE_ID_LEN], recipient_pub: &PublicKey) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(ZONE_MARKER);
    out.extend_from_slice(zone_id);
    out.extend_from_slice(&encrypt_cell(plaintext, recipient_pub));
    out
}

/// Attempts to parse and decrypt a single cell starting at offset 0 of `input`.
/// Returns the plaintext and the number of input bytes the cell occupied.
pub fn try_decrypt_cell(
    input: &[u8],
    recipient_priv: &StaticSecret,
) -> Result<(Vec<u8>, usize), CellError> {
    if input.len() < HEADER_LEN {
        return Err(CellError::Truncated);
    }
    let epk_bytes: [u8; 32] = input[8..40].try_into().unwrap();
    let wrapped = &input[40..40 + WRAPPED_KEY_LEN];
    let tag = &input[40 + WRAPPED_KEY_LEN..40 + WRAPPED_KEY_LEN + HEADER_TAG_LEN];
    let len_field = &input[40 + WRAPPED_KEY_LEN + HEADER_TAG_LEN..HEADER_LEN];
    let payload_len = u64::from_be_bytes(len_field.try_into().unwrap()) as usize;

    let ciphertext_len = payload_len + 16; // AEAD tag trailer
    if input.len() < HEADER_LEN + ciphertext_len {
        return Err(CellError::Truncated);
    }

    let epk = PublicKey::from(epk_bytes);
    let shared = recipient_priv.diffie_hellman(&epk);
    let kek_bytes = kek(&shared);
    let wrap_cipher = ChaCha20Poly1305::new(Key::from_slice(&kek_bytes));
    let data_key_vec = wrap_cipher
        .decrypt(&zero_nonce(), wrapped)
        .map_err(|_| CellError::TagMismatch)?;
    let data_key: [u8; 32] = data_key_vec
        .as_slice()
        .try_into()
        .map_err(|_| CellError::TagMismatch)?;

    let expected_tag = header_tag(&data_key, MAGIC, &epk_bytes, wrapped);
    if expected_tag.as_slice() != tag {
        return Err(CellError::TagMismatch);
    }

    let ciphertext = &input[HEADER_LEN..HEADER_LEN + ciphertext_len];
    let payload_cipher = ChaCha20Poly1305::new(Key::from_slice(&data_key));
    let plaintext = payload_cipher
        .decrypt(&zero_nonce(), ciphertext)
        .map_err(|_| CellError::TagMismatch)?;

    Ok((plaintext, HEADER_LEN + ciphertext_len))
}

pub fn starts_with_magic(bytes: &[u8]) -> bool {
    bytes.len() >= MAGIC.len() && &bytes[..MAGIC.len()] == MAGIC
}

fn starts_with_zone_header(bytes: &[u8]) -> Option<&[u8; ZONE_ID_LEN]> {
    if bytes.len() < ZONE_HEADER_LEN || &bytes[..ZONE_MARKER.len()] != ZONE_MARKER {
        return None;
    }
    Some(bytes[ZONE_MARKER.len()..ZONE_HEADER_LEN].try_into().unwrap())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    WholeCell,
    InjectedCell,
}

#[derive(Debug, Clone)]
pub struct PoisonPolicy {
    pub detect: bool,
    pub shutdown: bool,
    pub run_script: Option<std::path::PathBuf>,
}

impl Default for PoisonPolicy {
    fn default() -> Self {
        PoisonPolicy {
            detect: true,
            shutdown: false,
            run_script: None,
        }
    }
}

pub struct DecryptOutcome {
    pub output: Vec<u8>,
    pub poison_matched: bool,
    pub cells_decrypted: usize,
}

/// Resolves which private key opens a cell, per §4.5 step 1. A plain cell (no ZoneID
/// header in front of it) always uses the connection's client key; a cell preceded by a
/// recognized ZoneID header uses that zone's private key instead. Kept as a trait so the
/// pipeline can back it with a keystore lookup (and treat cache misses as "unknown zone")
/// while the decryptor itself stays free of any keystore dependency.
pub trait KeyResolver {
    fn client_key(&self) -> &StaticSecret;
    fn zone_key(&self, zone_id: &[u8; ZONE_ID_LEN]) -> Option<StaticSecret>;
}

/// A resolver for connections with zone mode off, or for tests: every cell uses the
/// connection's client key and ZoneID headers are left untouched as ordinary bytes.
pub struct ClientOnlyResolver<'a>(pub &'a StaticSecret);

impl KeyResolver for ClientOnlyResolver<'_> {
    fn client_key(&self) -> &StaticSecret {
        self.0
    }

    fn zone_key(&self, _zone_id: &[u8; ZONE_ID_LEN]) -> Option<StaticSecret> {
        None
    }
}

/// Runs the decryptor over a column's raw bytes, resolving each cell's key via `resolver`
/// per §4.5 step 1. `poison_key`, if set, is checked against every successfully-*parsed*
/// header regardless of whether the primary decryption succeeded.
pub fn process(
    mode: Mode,
    input: &[u8],
    resolver: &dyn KeyResolver,
    poison_key: Option<&StaticSecret>,
) -> DecryptOutcome {
    match mode {
        Mode::WholeCell => process_whole_cell(input, resolver, poison_key),
        Mode::InjectedCell => process_injected_cell(input, resolver, poison_key),
    }
}

fn check_poison(input: &[u8], poison_key: Option<&StaticSecret>) -> bool {
    match poison_key {
        None => false,
        Some(key) => try_decrypt_cell(input, key).is_ok(),
    }
}

/// Resolves the key for the cell found at the start of `candidate`, after stripping a
/// ZoneID header if one is present. Returns the stripped candidate (cell bytes only), the
/// number of header bytes that preceded it, and the key to use — or `None` if a ZoneID
/// header was present but names an unknown zone, in which case the cell can't be opened.
fn resolve<'a>(candidate: &'a [u8], resolver: &dyn KeyResolver) -> (&'a [u8], usize, Option<StaticSecret>) {
    match starts_with_zone_header(candidate) {
        Some(zone_id) => {
            let key = resolver.zone_key(zone_id);
            (&candidate[ZONE_HEADER_LEN..], ZONE_HEADER_LEN, key)
        }
        None => (candidate, 0, Some(resolver.client_key().clone())),
    }
}

fn process_whole_cell(
    input: &[u8],
    resolver: &dyn KeyResolver,
    poison_key: Option<&StaticSecret>,
) -> DecryptOutcome {
    let (cell, header_len, key) = resolve(input, resolver);
    if !starts_with_magic(cell) {
        return DecryptOutcome {
            output: input.to_vec(),
            poison_matched: false,
            cells_decrypted: 0,
        };
    }
    let key = match key {
        Some(key) => key,
        None => {
            // Structurally a zone cell, but the zone is unknown: can't even attempt
            // decryption, but the poison key (always connection-scoped) is still checked.
            let poison_matched = check_poison(cell, poison_key);
            return DecryptOutcome {
                output: input.to_vec(),
                poison_matched,
                cells_decrypted: 0,
            };
        }
    };
    match try_decrypt_cell(cell, &key) {
        Ok((plaintext, consumed)) if header_len + consumed == input.len() => {
            let poison_matched = check_poison(cell, poison_key);
            DecryptOutcome {
                output: plaintext,
                poison_matched,
                cells_decrypted: 1,
            }
        }
        Ok(_) | Err(CellError::TagMismatch) => {
            // A full cell parsed but didn't consume the whole column, or the tag
            // didn't match this connection's key: leave the original bytes intact,
            // but a structurally valid header is still eligible for the poison check.
            let poison_matched = check_poison(cell, poison_key);
            DecryptOutcome {
                output: input.to_vec(),
                poison_matched,
                cells_decrypted: 0,
            }
        }
        Err(CellError::Truncated) => DecryptOutcome {
            output: input.to_vec(),
            poison_matched: false,
            cells_decrypted: 0,
        },
    }
}

fn process_injected_cell(
    input: &[u8],
    resolver: &dyn KeyResolver,
    poison_key: Option<&StaticSecret>,
) -> DecryptOutcome {
    let magic_finder = memmem::Finder::new(MAGIC);
    let zone_finder = memmem::Finder::new(ZONE_MARKER);
    let mut output = Vec::with_capacity(input.len());
    let mut cursor = 0usize;
    let mut poison_matched = false;
    let mut cells_decrypted = 0usize;

    while cursor < input.len() {
        let rest = &input[cursor..];
        let magic_at = magic_finder.find(rest);
        // A ZoneID header only counts when it sits directly in front of a cell's magic.
        let zone_at = zone_finder
            .find(rest)
            .filter(|&z| starts_with_zone_header(&rest[z..]).is_some());

        let candidate_offset = match (magic_at, zone_at) {
            (None, None) => {
                output.extend_from_slice(rest);
                break;
            }
            (Some(m), None) => m,
            (None, Some(z)) => z,
            (Some(m), Some(z)) => m.min(z),
        };

        let candidate_start = cursor + candidate_offset;
        output.extend_from_slice(&input[cursor..candidate_start]);
        let candidate = &input[candidate_start..];
        let (cell, header_len, key) = resolve(candidate, resolver);

        let key = match key {
            Some(key) => key,
            None => {
                if check_poison(cell, poison_key) {
                    poison_matched = true;
                }
                // Unknown zone: forward the header and keep scanning past it.
                output.extend_from_slice(&candidate[..header_len]);
                cursor = candidate_start + header_len;
                continue;
            }
        };

        match try_decrypt_cell(cell, &key) {
            Ok((plaintext, consumed)) => {
                if check_poison(cell, poison_key) {
                    poison_matched = true;
                }
                output.extend_from_slice(&candidate[..header_len]);
                output.extend_from_slice(&plaintext);
                cells_decrypted += 1;
                cursor = candidate_start + header_len + consumed;
            }
            Err(CellError::TagMismatch) => {
                if check_poison(cell, poison_key) {
                    poison_matched = true;
                }
                // Parsed structurally but this key can't open it: pass the header
                // through unchanged and advance past just the magic to keep scanning.
                output.extend_from_slice(&candidate[..header_len + MAGIC.len()]);
                cursor = candidate_start + header_len + MAGIC.len();
            }
            Err(CellError::Truncated) => {
                // Not enough bytes for even the fixed header: forward the rest
                // of the buffer unchanged, no decryption attempted.
                output.extend_from_slice(candidate);
                cursor = input.len();
            }
        }
    }

    DecryptOutcome {
        output,
        poison_matched,
        cells_decrypted,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keypair() -> (StaticSecret, PublicKey) {
        let sk = StaticSecret::random_from_rng(OsRng);
        let pk = PublicKey::from(&sk);
        (sk, pk)
    }

    #[test]
    fn whole_cell_round_trips() {
        let (sk, pk) = keypair();
        let cell = encrypt_cell(b"hello", &pk);
        let outcome = process(Mode::WholeCell, &cell, &ClientOnlyResolver(&sk), None);
        assert_eq!(outcome.output, b"hello");
        assert_eq!(outcome.cells_decrypted, 1);
    }

    #[test]
    fn plaintext_without_magic_passes_through_unchanged() {
        let (sk, _pk) = keypair();
        let plaintext = b"just a normal column value";
        let outcome = process(Mode::WholeCell, plaintext, &ClientOnlyResolver(&sk), None);
        assert_eq!(outcome.output, plaintext);
        assert_eq!(outcome.cells_decrypted, 0);
    }

    #[test]
    fn injected_cell_decrypts_in_the_middle_of_a_buffer() {
        let (sk, pk) = keypair();
        let cell = encrypt_cell(b"secret", &pk);
        let mut buf = b"prefix-".to_vec();
        buf.extend_from_slice(&cell);
        buf.extend_from_slice(b"-suffix");

        let outcome = process(Mode::InjectedCell, &buf, &ClientOnlyResolver(&sk), None);
        let mut expected = b"prefix-".to_vec();
        expected.extend_from_slice(b"secret");
        expected.extend_from_slice(b"-suffix");
        assert_eq!(outcome.output, expected);
        assert_eq!(outcome.cells_decrypted, 1);
    }

    #[test]
    fn truncated_injected_cell_is_forwarded_unchanged_without_decryption() {
        let (sk, _pk) = keypair();
        let mut buf = MAGIC.to_vec();
        buf.extend_from_slice(&[0u8; 3]); // header is far from complete
        let outcome = process(Mode::InjectedCell, &buf, &ClientOnlyResolver(&sk), None);
        assert_eq!(outcome.output, buf);
        assert_eq!(outcome.cells_decrypted, 0);
    }

    #[test]
    fn poison_key_match_is_reported_independently_of_the_connection_key() {
        let (_client_sk, client_pk) = keypair();
        let (poison_sk, poison_pk) = keypair();
        let (other_client_sk, _other_pk) = keypair();

        let cell = encrypt_cell(b"tripwire", &poison_pk);
        let outcome = process(
            Mode::WholeCell,
            &cell,
            &ClientOnlyResolver(&other_client_sk),
            Some(&poison_sk),
        );
        assert!(outcome.poison_matched);
        assert_eq!(outcome.cells_decrypted, 0); // the connection's own key can't open it

        let unrelated_cell = encrypt_cell(b"normal data", &client_pk);
        let outcome2 = process(
            Mode::WholeCell,
            &unrelated_cell,
            &ClientOnlyResolver(&other_client_sk),
            Some(&poison_sk),
        );
        assert!(!outcome2.poison_matched);
    }

    struct TestZoneResolver {
        client: StaticSecret,
        zone_id: [u8; ZONE_ID_LEN],
        zone_key: StaticSecret,
    }

    impl KeyResolver for TestZoneResolver {
        fn client_key(&self) -> &StaticSecret {
            &self.client
        }

        fn zone_key(&self, zone_id: &[u8; ZONE_ID_LEN]) -> Option<StaticSecret> {
            if zone_id == &self.zone_id {
                Some(self.zone_key.clone())
            } else {
                None
            }
        }
    }

    #[test]
    fn zone_header_selects_zone_key_over_client_key() {
        let (client_sk, _client_pk) = keypair();
        let (zone_sk, zone_pk) = keypair();
        let zone_id = [7u8; ZONE_ID_LEN];
        let resolver = TestZoneResolver {
            client: client_sk,
            zone_id,
            zone_key: zone_sk,
        };

        let cell = encrypt_zone_cell(b"zoned secret", &zone_id, &zone_pk);
        let outcome = process(Mode::WholeCell, &cell, &resolver, None);
        assert_eq!(outcome.output, b"zoned secret");
        assert_eq!(outcome.cells_decrypted, 1);
    }

    #[test]
    fn unknown_zone_id_leaves_cell_undecrypted() {
        let (client_sk, _client_pk) = keypair();
        let (_other_zone_sk, other_zone_pk) = keypair();
        let resolver = TestZoneResolver {
            client: client_sk,
            zone_id: [1u8; ZONE_ID_LEN],
            zone_key: StaticSecret::random_from_rng(OsRng),
        };

        let unknown_zone_id = [9u8; ZONE_ID_LEN];
        let cell = encrypt_zone_cell(b"secret", &unknown_zone_id, &other_zone_pk);
        let outcome = process(Mode::WholeCell, &cell, &resolver, None);
        assert_eq!(outcome.output, cell);
        assert_eq!(outcome.cells_decrypted, 0);
    }

    #[test]
    fn injected_mode_handles_mixed_zone_and_client_cells() {
        let (client_sk, client_pk) = keypair();
        let (zone_sk, zone_pk) = keypair();
        let zone_id = [3u8; ZONE_ID_LEN];
        let resolver = TestZoneResolver {
            client: client_sk,
            zone_id,
            zone_key: zone_sk,
        };

        let mut buf = b"a=".to_vec();
        buf.extend_from_slice(&encrypt_cell(b"client-val", &client_pk));
        buf.extend_from_slice(b",b=");
        buf.extend_from_slice(&encrypt_zone_cell(b"zone-val", &zone_id, &zone_pk));

        let outcome = process(Mode::InjectedCell, &buf, &resolver, None);
        let mut expected = b"a=".to_vec();
        expected.extend_from_slice(b"client-val");
        expected.extend_from_slice(b",b=");
        expected.extend_from_slice(b"zone-val");
        assert_eq!(outcome.output, expected);
        assert_eq!(outcome.cells_decrypted, 2);
    }
}
