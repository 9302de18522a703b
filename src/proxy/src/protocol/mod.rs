pub mod mysql;
pub mod postgres;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::ProxyError;
use mysql::adapter::MySqlFrame;
use mysql::packet::packet_reader::PacketReader;
use mysql::packet::packet_writer::PacketWriter;
use postgres::adapter::{PgFrame, PgReader, PgWriter};

pub use postgres::adapter::ByteaFormat;

/// Which wire dialect a connection speaks, chosen once at startup per the
/// `mysql_enable`/`postgresql_enable` flags (§6) — never switched mid-connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    MySql,
    Postgres,
}

/// A decoded frame in either dialect (§3 `WireFrame`). The pipeline stays dialect-agnostic
/// by calling these accessors instead of matching on the wire format itself.
#[derive(Debug, Clone)]
pub enum Frame {
    MySql(MySqlFrame),
    Postgres(PgFrame),
}

impl Frame {
    pub fn is_query(&self) -> bool {
        match self {
            Frame::MySql(f) => mysql::adapter::is_query_frame(f),
            Frame::Postgres(f) => postgres::adapter::is_query_frame(f),
        }
    }

    pub fn sql_text(&self) -> Option<String> {
        match self {
            Frame::MySql(f) => mysql::adapter::extract_sql(f),
            Frame::Postgres(f) => postgres::adapter::extract_sql(f),
        }
    }

    pub fn is_row(&self) -> bool {
        match self {
            Frame::MySql(f) => mysql::adapter::is_row_frame(f),
            Frame::Postgres(f) => postgres::adapter::is_row_frame(f),
        }
    }

    pub fn rewrite_row(&self, bytea_format: ByteaFormat, rewrite_cell: impl FnMut(&[u8]) -> Vec<u8>) -> Frame {
        match self {
            Frame::MySql(f) => Frame::MySql(mysql::adapter::rewrite_row(f, rewrite_cell)),
            Frame::Postgres(f) => Frame::Postgres(postgres::adapter::rewrite_row(f, bytea_format, rewrite_cell)),
        }
    }

    pub fn censor_denied(&self, reason: &str) -> Frame {
        match self {
            Frame::MySql(f) => Frame::MySql(mysql::adapter::censor_denied_frame(f.seq, reason)),
            Frame::Postgres(_) => Frame::Postgres(postgres::adapter::censor_denied_frame(reason)),
        }
    }
}

/// A dialect-tagged frame reader, mirroring `transport::TransportWrapper`'s tagged-variant
/// shape: the variant is fixed for the lifetime of the connection, so no per-frame dynamic
/// dispatch is needed (REDESIGN FLAGS §9).
pub enum Reader<R> {
    MySql(PacketReader<R>),
    Postgres(PgReader<R>),
}

impl<R: AsyncRead + Unpin> Reader<R> {
    pub fn new(dialect: Dialect, inner: R) -> Self {
        match dialect {
            Dialect::MySql => Reader::MySql(PacketReader::new(inner)),
            Dialect::Postgres => Reader::Postgres(PgReader::new(inner)),
        }
    }

    pub async fn read_frame(&mut self) -> Result<Option<Frame>, ProxyError> {
        match self {
            Reader::MySql(r) => Ok(mysql::adapter::read_frame(r).await?.map(Frame::MySql)),
            Reader::Postgres(r) => Ok(r.read_frame().await?.map(Frame::Postgres)),
        }
    }
}

pub enum Writer<W> {
    MySql(PacketWriter<W>),
    Postgres(PgWriter<W>),
}

impl<W: AsyncWrite + Unpin> Writer<W> {
    pub fn new(dialect: Dialect, inner: W) -> Self {
        match dialect {
            Dialect::MySql => Writer::MySql(PacketWriter::new(inner)),
            Dialect::Postgres => Writer::Postgres(PgWriter::new(inner)),
        }
    }

    pub async fn write_frame(&mut self, frame: &Frame) -> Result<(), ProxyError> {
        match (self, frame) {
            (Writer::MySql(w), Frame::MySql(f)) => mysql::adapter::write_frame(w, f).await,
            (Writer::Postgres(w), Frame::Postgres(f)) => w.write_frame(f).await,
            (Writer::MySql(_), Frame::Postgres(_)) | (Writer::Postgres(_), Frame::MySql(_)) => {
                Err(ProxyError::Protocol {
                    client_id: "-".to_string(),
                    reason: "frame dialect does not match writer dialect".to_string(),
                })
            }
        }
    }
}
