use tokio::io::{AsyncRead, AsyncWrite};

use super::messages;
use crate::error::ProxyError;

/// Which textual encoding bytea columns use on the wire, selected by the
/// `pgsql_hex_bytea`/`pgsql_escape_bytea` CLI flags (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteaFormat {
    Hex,
    Escape,
}

/// A single PostgreSQL protocol message. `tag` is `None` only for the startup message,
/// which the pipeline forwards unexamined (§4.4).
#[derive(Debug, Clone)]
pub struct PgFrame {
    pub tag: Option<u8>,
    pub payload: Vec<u8>,
}

fn io_err(reason: String) -> ProxyError {
    ProxyError::Protocol {
        client_id: "-".to_string(),
        reason,
    }
}

pub struct PgReader<R> {
    inner: R,
    started: bool,
}

impl<R: AsyncRead + Unpin> PgReader<R> {
    pub fn new(inner: R) -> Self {
        PgReader {
            inner,
            started: false,
        }
    }

    pub async fn read_frame(&mut self) -> Result<Option<PgFrame>, ProxyError> {
        if !self.started {
            self.started = true;
            let body = messages::read_startup(&mut self.inner)
                .await
                .map_err(|e| io_err(format!("reading postgres startup message: {e}")))?;
            return Ok(Some(PgFrame { tag: None, payload: body }));
        }
        match messages::read_tagged(&mut self.inner)
            .await
            .map_err(|e| io_err(format!("reading postgres message: {e}")))?
        {
            None => Ok(None),
            Some((tag, payload)) => Ok(Some(PgFrame { tag: Some(tag), payload })),
        }
    }
}

pub struct PgWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> PgWriter<W> {
    pub fn new(inner: W) -> Self {
        PgWriter { inner }
    }

    pub async fn write_frame(&mut self, frame: &PgFrame) -> Result<(), ProxyError> {
        match frame.tag {
            None => messages::write_startup(&mut self.inner, &frame.payload).await,
            Some(tag) => messages::write_tagged(&mut self.inner, tag, &frame.payload).await,
        }
        .map_err(|e| io_err(format!("writing postgres message: {e}")))
    }
}

pub fn is_query_frame(frame: &PgFrame) -> bool {
    frame.tag == Some(b'Q')
}

pub fn extract_sql(frame: &PgFrame) -> Option<String> {
    if frame.tag != Some(b'Q') {
        return None;
    }
    let bytes = frame.payload.strip_suffix(&[0]).unwrap_or(&frame.payload);
    Some(String::from_utf8_lossy(bytes).into_owned())
}

pub fn is_row_frame(frame: &PgFrame) -> bool {
    frame.tag == Some(b'D')
}

/// Builds a minimal `ErrorResponse` ('E') carrying a censor-denial (SQLSTATE `42000`,
/// syntax_error_or_access_rule_violation — matching the MySQL side's `error_codes.rs`
/// choice of `42000` so both dialects report the same class for a denied query),
/// terminated by the required trailing NUL.
pub fn censor_denied_frame(reason: &str) -> PgFrame {
    let mut body = Vec::new();
    body.push(b'S');
    body.extend_from_slice(b"ERROR\0");
    body.push(b'C');
    body.extend_from_slice(b"42000\0");
    body.push(b'M');
    body.extend_from_slice(reason.as_bytes());
    body.push(0);
    body.push(0);
    PgFrame { tag: Some(b'E'), payload: body }
}

fn decode_bytea(value: &[u8], format: ByteaFormat) -> Option<Vec<u8>> {
    match format {
        ByteaFormat::Hex => {
            let digits = value.strip_prefix(b"\\x")?;
            hex::decode(digits).ok()
        }
        ByteaFormat::Escape => {
            let mut out = Vec::with_capacity(value.len());
            let mut i = 0;
            while i < value.len() {
                if value[i] != b'\\' {
                    out.push(value[i]);
                    i += 1;
                    continue;
                }
                if value.get(i + 1) == Some(&b'\\') {
                    out.push(b'\\');
                    i += 2;
                    continue;
                }
                let octal = value.get(i + 1..i + 4)?;
                if !octal.iter().all(|b| (b'0'..=b'7').contains(b)) {
                    return None;
                }
                let text = std::str::from_utf8(octal).ok()?;
                out.push(u8::from_str_radix(text, 8).ok()?);
                i += 4;
            }
            Some(out)
        }
    }
}

fn encode_bytea(raw: &[u8], format: ByteaFormat) -> Vec<u8> {
    match format {
        ByteaFormat::Hex => {
            let mut out = Vec::with_capacity(2 + raw.len() * 2);
            out.extend_from_slice(b"\\x");
            out.extend_from_slice(hex::encode(raw).as_bytes());
            out
        }
        ByteaFormat::Escape => {
            let mut out = Vec::with_capacity(raw.len());
            for &b in raw {
                if b == b'\\' {
                    out.extend_from_slice(b"\\\\");
                } else if !(32..127).contains(&b) {
                    out.extend_from_slice(format!("\\{b:03o}").as_bytes());
                } else {
                    out.push(b);
                }
            }
            out
        }
    }
}

/// Rewrites every field of a `DataRow` ('D') message, per §4.4's `rewriteRow`. Each field
/// is tried as a bytea literal in `bytea_format` first; fields that don't decode as bytea
/// (ordinary text columns, unless they happen to carry an injected-mode cell directly) are
/// handed to the rewriter as-is, so a cell embedded straight in a text column is still seen.
pub fn rewrite_row(frame: &PgFrame, bytea_format: ByteaFormat, mut rewrite_cell: impl FnMut(&[u8]) -> Vec<u8>) -> PgFrame {
    let body = &frame.payload;
    if body.len() < 2 {
        return frame.clone();
    }
    let field_count = i16::from_be_bytes([body[0], body[1]]).max(0) as usize;
    let mut out = Vec::with_capacity(body.len());
    out.extend_from_slice(&body[0..2]);
    let mut pos = 2usize;

    for _ in 0..field_count {
        if pos + 4 > body.len() {
            out.extend_from_slice(&body[pos..]);
            pos = body.len();
            break;
        }
        let field_len = i32::from_be_bytes(body[pos..pos + 4].try_into().unwrap());
        pos += 4;
        if field_len < 0 {
            out.extend_from_slice(&(-1i32).to_be_bytes());
            continue;
        }
        let field_len = field_len as usize;
        if pos + field_len > body.len() {
            out.extend_from_slice(&body[pos..]);
            pos = body.len();
            break;
        }
        let value = &body[pos..pos + field_len];
        pos += field_len;

        let final_bytes = match decode_bytea(value, bytea_format) {
            Some(raw) => encode_bytea(&rewrite_cell(&raw), bytea_format),
            None => rewrite_cell(value),
        };
        out.extend_from_slice(&(final_bytes.len() as i32).to_be_bytes());
        out.extend_from_slice(&final_bytes);
    }

    PgFrame { tag: frame.tag, payload: out }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_frame_is_recognized_and_sql_extracted() {
        let mut payload = b"SELECT 1".to_vec();
        payload.push(0);
        let frame = PgFrame { tag: Some(b'Q'), payload };
        assert!(is_query_frame(&frame));
        assert_eq!(extract_sql(&frame).as_deref(), Some("SELECT 1"));
    }

    #[test]
    fn hex_bytea_field_round_trips_through_rewrite() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&1i16.to_be_bytes());
        let hex_value = b"\\xdeadbeef";
        payload.extend_from_slice(&(hex_value.len() as i32).to_be_bytes());
        payload.extend_from_slice(hex_value);
        let frame = PgFrame { tag: Some(b'D'), payload };
        assert!(is_row_frame(&frame));

        let rewritten = rewrite_row(&frame, ByteaFormat::Hex, |raw| {
            assert_eq!(raw, [0xde, 0xad, 0xbe, 0xef]);
            vec![0x00, 0x01]
        });
        let field_len = i32::from_be_bytes(rewritten.payload[2..6].try_into().unwrap()) as usize;
        let field = &rewritten.payload[6..6 + field_len];
        assert_eq!(field, b"\\x0001");
    }

    #[test]
    fn null_field_passes_through_as_null() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&1i16.to_be_bytes());
        payload.extend_from_slice(&(-1i32).to_be_bytes());
        let frame = PgFrame { tag: Some(b'D'), payload };
        let rewritten = rewrite_row(&frame, ByteaFormat::Hex, |raw| raw.to_vec());
        assert_eq!(&rewritten.payload[2..6], &(-1i32).to_be_bytes());
    }

    #[test]
    fn censor_denied_frame_has_expected_sqlstate() {
        let frame = censor_denied_frame("denied");
        assert_eq!(frame.tag, Some(b'E'));
        let as_str = String::from_utf8_lossy(&frame.payload);
        assert!(as_str.contains("42000"));
    }
}
