use crate::protocol::mysql::constants::CommandCode as ComInfo;

use winnow::binary::{le_u32, le_u8};
use winnow::combinator::{alt, preceded, rest};
use winnow::prelude::*;
use winnow::token::{literal, take};
use winnow::{Parser, Partial};

/// Decoded MySQL command packet body, as dispatched on the first byte of a request frame.
///
/// Only the variants the censor and row decryptor need to recognize are kept; everything
/// else forwards to the database unexamined.
#[derive(Debug, PartialEq, Eq)]
pub enum Command<'a> {
    Query(&'a [u8]),
    Prepare(&'a [u8]),
    Quit,
    Ping,
    Other(u8),
}

pub fn from_packet(pkt: &[u8]) -> IResult<Partial<&[u8]>, Command<'_>> {
    alt((
        preceded(literal([ComInfo::ComQuery as u8]), rest).map(Command::Query),
        preceded(literal([ComInfo::ComStmtPrepare as u8]), rest).map(Command::Prepare),
        literal([ComInfo::ComQuit as u8]).map(|_| Command::Quit),
        literal([ComInfo::ComPing as u8]).map(|_| Command::Ping),
        take(1u8).map(|b: &[u8]| Command::Other(b[0])),
    ))
    .parse_peek(Partial::new(pkt))
}

/// Reads a MySQL length-encoded integer: https://dev.mysql.com/doc/dev/mysql-server/latest/page_protocol_basic_dt_integers.html
pub fn read_length_encoded_number(i: &[u8]) -> IResult<&[u8], Option<u64>> {
    let (i, b) = le_u8.parse_peek(i)?;
    let r_size: usize = match b {
        0xfb => return Ok((i, None)), // NULL column value
        0xfc => 2,
        0xfd => 3,
        0xfe => 8,
        _ => return Ok((i, Some(b as u64))),
    };
    let mut bytes = [0u8; 8];
    let (i, b) = take(r_size).parse_peek(i)?;
    bytes[..r_size].copy_from_slice(b);
    Ok((i, Some(u64::from_le_bytes(bytes))))
}

/// Reads a single length-encoded string column value from a text-protocol result row.
/// Returns `None` for a SQL NULL (the `0xfb` sentinel), `Some(bytes)` otherwise.
pub fn read_length_encoded_string(i: &[u8]) -> IResult<&[u8], Option<&[u8]>> {
    let (input, len) = read_length_encoded_number(i)?;
    match len {
        None => Ok((input, None)),
        Some(len) => {
            let (input, bytes) = take(len).parse_peek(input)?;
            Ok((input, Some(bytes)))
        }
    }
}

/// Writes a length-encoded integer using the same encoding `read_length_encoded_number` reads.
pub fn write_length_encoded_number(out: &mut Vec<u8>, n: u64) {
    match n {
        0..=250 => out.push(n as u8),
        251..=0xffff => {
            out.push(0xfc);
            out.extend_from_slice(&(n as u16).to_le_bytes());
        }
        0x1_0000..=0xff_ffff => {
            out.push(0xfd);
            out.extend_from_slice(&(n as u32).to_le_bytes()[..3]);
        }
        _ => {
            out.push(0xfe);
            out.extend_from_slice(&n.to_le_bytes());
        }
    }
}

/// Writes a length-encoded string column value; `None` encodes the SQL-NULL sentinel `0xfb`.
pub fn write_length_encoded_string(out: &mut Vec<u8>, value: Option<&[u8]>) {
    match value {
        None => out.push(0xfb),
        Some(bytes) => {
            write_length_encoded_number(out, bytes.len() as u64);
            out.extend_from_slice(bytes);
        }
    }
}

/// Reads the column-count length-encoded integer that opens a text-protocol resultset.
pub fn read_column_count(i: &[u8]) -> IResult<&[u8], u64> {
    let (i, n) = read_length_encoded_number(i)?;
    Ok((i, n.unwrap_or(0)))
}

pub fn skip_stmt_execute_header(i: &[u8]) -> IResult<&[u8], u32> {
    let (i, stmt) = le_u32.parse_peek(i)?;
    let (i, _flags) = take(1u8).parse_peek(i)?;
    let (i, _iterations) = le_u32.parse_peek(i)?;
    Ok((i, stmt))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_command_is_recognized() {
        let pkt = b"\x03SELECT 1";
        let (_, cmd) = from_packet(pkt).unwrap();
        assert_eq!(cmd, Command::Query(b"SELECT 1"));
    }

    #[test]
    fn quit_command_has_no_body() {
        let pkt = &[ComInfo::ComQuit as u8];
        let (_, cmd) = from_packet(pkt).unwrap();
        assert_eq!(cmd, Command::Quit);
    }

    #[test]
    fn length_encoded_number_round_trips_across_all_width_tiers() {
        for n in [0u64, 250, 251, 0xffff, 0x1_0000, 0xff_ffff, 0x1_0000_0000] {
            let mut buf = Vec::new();
            write_length_encoded_number(&mut buf, n);
            let (rest, parsed) = read_length_encoded_number(&buf).unwrap();
            assert!(rest.is_empty());
            assert_eq!(parsed, Some(n));
        }
    }

    #[test]
    fn length_encoded_string_round_trips_including_null() {
        let mut buf = Vec::new();
        write_length_encoded_string(&mut buf, Some(b"hello"));
        let (rest, parsed) = read_length_encoded_string(&buf).unwrap();
        assert!(rest.is_empty());
        assert_eq!(parsed, Some(&b"hello"[..]));

        let mut null_buf = Vec::new();
        write_length_encoded_string(&mut null_buf, None);
        let (_, parsed) = read_length_encoded_string(&null_buf).unwrap();
        assert_eq!(parsed, None);
    }
}
