use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// The one untagged message in the wire protocol: a 4-byte length (inclusive of itself)
/// followed by the body. Every later message carries a leading type-tag byte.
pub async fn read_startup<R: AsyncRead + Unpin>(r: &mut R) -> io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len < 4 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "startup message length field is shorter than itself",
        ));
    }
    let mut body = vec![0u8; len - 4];
    r.read_exact(&mut body).await?;
    Ok(body)
}

pub async fn write_startup<W: AsyncWrite + Unpin>(w: &mut W, body: &[u8]) -> io::Result<()> {
    let len = (body.len() + 4) as u32;
    w.write_all(&len.to_be_bytes()).await?;
    w.write_all(body).await?;
    w.flush().await
}

/// Reads one tagged message (tag byte, then 4-byte length inclusive of itself, then body).
/// Returns `None` on a clean EOF before any bytes of the next message arrive.
pub async fn read_tagged<R: AsyncRead + Unpin>(r: &mut R) -> io::Result<Option<(u8, Vec<u8>)>> {
    let mut tag_buf = [0u8; 1];
    match r.read_exact(&mut tag_buf).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len < 4 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "message length field is shorter than itself",
        ));
    }
    let mut body = vec![0u8; len - 4];
    r.read_exact(&mut body).await?;
    Ok(Some((tag_buf[0], body)))
}

pub async fn write_tagged<W: AsyncWrite + Unpin>(w: &mut W, tag: u8, body: &[u8]) -> io::Result<()> {
    let len = (body.len() + 4) as u32;
    w.write_all(&[tag]).await?;
    w.write_all(&len.to_be_bytes()).await?;
    w.write_all(body).await?;
    w.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tagged_message_round_trips() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        write_tagged(&mut a, b'Q', b"SELECT 1\0").await.unwrap();
        let (tag, body) = read_tagged(&mut b).await.unwrap().unwrap();
        assert_eq!(tag, b'Q');
        assert_eq!(body, b"SELECT 1\0");
    }

    #[tokio::test]
    async fn startup_message_round_trips() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        write_startup(&mut a, b"\x00\x03\x00\x00user\0postgres\0\0")
            .await
            .unwrap();
        let body = read_startup(&mut b).await.unwrap();
        assert_eq!(body, b"\x00\x03\x00\x00user\0postgres\0\0");
    }
}
