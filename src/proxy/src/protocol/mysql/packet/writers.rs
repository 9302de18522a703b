use crate::protocol::mysql::error_codes::ErrorKind;
use crate::protocol::mysql::packet::packet_writer::PacketWriter;

use byteorder::{LittleEndian, WriteBytesExt};
use std::io::{self, Write};
use tokio::io::AsyncWrite;

/// Writes a server-authored `ERR_Packet`, used when the gateway itself must answer a
/// request instead of the database (censor denial, handshake failure before a backend
/// connection exists).
/// https://dev.mysql.com/doc/dev/mysql-server/latest/page_protocol_basic_err_packet.html
pub async fn write_err_packet<W: AsyncWrite + Unpin>(
    err: ErrorKind,
    msg: &[u8],
    w: &mut PacketWriter<W>,
) -> io::Result<()> {
    w.write_u8(0xff)?;
    w.write_u16::<LittleEndian>(err as u16)?;
    w.write_u8(b'#')?;
    w.write_all(err.sqlstate())?;
    w.write_all(msg)?;
    w.end_packet().await
}
