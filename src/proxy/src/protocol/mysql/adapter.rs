use std::io::Write;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::ProxyError;
use crate::protocol::mysql::basic::{self, Command};
use crate::protocol::mysql::error_codes::ErrorKind;
use crate::protocol::mysql::packet::packet_reader::PacketReader;
use crate::protocol::mysql::packet::packet_writer::PacketWriter;
use crate::protocol::mysql::packet::writers::write_err_packet;

/// A single MySQL wire packet, already reassembled across any >16MB split (§3 `WireFrame`).
/// The opening handshake packets pass through this same type; they just never match
/// `Command::Query`/`Command::Prepare` so `is_query_frame` reports `false` for them.
#[derive(Debug, Clone)]
pub struct MySqlFrame {
    pub seq: u8,
    pub payload: Vec<u8>,
}

pub async fn read_frame<R>(reader: &mut PacketReader<R>) -> Result<Option<MySqlFrame>, ProxyError>
where
    R: AsyncRead + Unpin,
{
    match reader.next_async().await {
        Ok(Some((seq, packet))) => Ok(Some(MySqlFrame {
            seq,
            payload: packet.as_ref().to_vec(),
        })),
        Ok(None) => Ok(None),
        Err(e) => Err(ProxyError::Protocol {
            client_id: "-".to_string(),
            reason: format!("reading mysql packet: {e}"),
        }),
    }
}

pub async fn write_frame<W>(writer: &mut PacketWriter<W>, frame: &MySqlFrame) -> Result<(), ProxyError>
where
    W: AsyncWrite + Unpin,
{
    writer.set_seq(frame.seq);
    writer
        .write_all(&frame.payload)
        .map_err(|e| ProxyError::Protocol {
            client_id: "-".to_string(),
            reason: format!("buffering mysql packet: {e}"),
        })?;
    writer.end_packet().await.map_err(|e| ProxyError::Protocol {
        client_id: "-".to_string(),
        reason: format!("writing mysql packet: {e}"),
    })
}

pub async fn write_censor_denied<W>(
    writer: &mut PacketWriter<W>,
    seq: u8,
    reason: &str,
) -> Result<(), ProxyError>
where
    W: AsyncWrite + Unpin,
{
    writer.set_seq(seq);
    write_err_packet(ErrorKind::censor_denied(), reason.as_bytes(), writer)
        .await
        .map_err(|e| ProxyError::Protocol {
            client_id: "-".to_string(),
            reason: format!("writing censor-denied response: {e}"),
        })
}

/// Constructs a standalone censor-denied response frame, for the pipeline to hand to
/// `write_frame` directly without going through the `PacketWriter` helper above.
pub fn censor_denied_frame(seq: u8, reason: &str) -> MySqlFrame {
    let err = ErrorKind::censor_denied();
    let mut payload = Vec::with_capacity(9 + reason.len());
    payload.push(0xff);
    payload.extend_from_slice(&(err as u16).to_le_bytes());
    payload.push(b'#');
    payload.extend_from_slice(err.sqlstate());
    payload.extend_from_slice(reason.as_bytes());
    MySqlFrame { seq, payload }
}

pub fn is_query_frame(frame: &MySqlFrame) -> bool {
    matches!(
        basic::from_packet(&frame.payload),
        Ok((_, Command::Query(_))) | Ok((_, Command::Prepare(_)))
    )
}

pub fn extract_sql(frame: &MySqlFrame) -> Option<String> {
    match basic::from_packet(&frame.payload) {
        Ok((_, Command::Query(sql))) | Ok((_, Command::Prepare(sql))) => {
            Some(String::from_utf8_lossy(sql).into_owned())
        }
        _ => None,
    }
}

/// Text-protocol result set rows are the only packets whose first byte is none of the
/// reserved OK (0x00)/ERR (0xff)/EOF (0xfe, short) header bytes (§4.4).
pub fn is_row_frame(frame: &MySqlFrame) -> bool {
    match frame.payload.first() {
        None => false,
        Some(&0x00) | Some(&0xff) => false,
        Some(&0xfe) if frame.payload.len() <= 5 => false,
        Some(_) => true,
    }
}

/// Rewrites every length-encoded column value in a text-protocol row packet, per §4.4's
/// `rewriteRow(frame, cellRewriter) -> frame'`.
pub fn rewrite_row(frame: &MySqlFrame, mut rewrite_cell: impl FnMut(&[u8]) -> Vec<u8>) -> MySqlFrame {
    let mut input: &[u8] = frame.payload.as_slice();
    let mut out = Vec::with_capacity(frame.payload.len());
    while !input.is_empty() {
        match basic::read_length_encoded_string(input) {
            Ok((rest, value)) => {
                let rewritten = value.map(&mut rewrite_cell);
                basic::write_length_encoded_string(&mut out, rewritten.as_deref());
                input = rest;
            }
            Err(_) => {
                out.extend_from_slice(input);
                break;
            }
        }
    }
    MySqlFrame {
        seq: frame.seq,
        payload: out,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_frame_is_recognized_and_sql_extracted() {
        let mut payload = vec![0x03];
        payload.extend_from_slice(b"SELECT 1");
        let frame = MySqlFrame { seq: 0, payload };
        assert!(is_query_frame(&frame));
        assert_eq!(extract_sql(&frame).as_deref(), Some("SELECT 1"));
    }

    #[test]
    fn ok_packet_is_not_a_row_frame() {
        let frame = MySqlFrame {
            seq: 1,
            payload: vec![0x00, 0x00, 0x00, 0x02, 0x00, 0x00],
        };
        assert!(!is_row_frame(&frame));
    }

    #[test]
    fn row_frame_cells_round_trip_through_rewrite() {
        let mut payload = Vec::new();
        basic::write_length_encoded_string(&mut payload, Some(b"alice"));
        basic::write_length_encoded_string(&mut payload, Some(b"bob"));
        let frame = MySqlFrame { seq: 2, payload };
        assert!(is_row_frame(&frame));

        let rewritten = rewrite_row(&frame, |cell| cell.to_ascii_uppercase());
        let (rest, first) = basic::read_length_encoded_string(&rewritten.payload).unwrap();
        assert_eq!(first, Some(&b"ALICE"[..]));
        let (_, second) = basic::read_length_encoded_string(rest).unwrap();
        assert_eq!(second, Some(&b"BOB"[..]));
    }

    #[test]
    fn censor_denied_frame_carries_the_originating_sequence_number() {
        let frame = censor_denied_frame(7, "query denied");
        assert_eq!(frame.seq, 7);
        assert_eq!(frame.payload[0], 0xff);
    }
}
