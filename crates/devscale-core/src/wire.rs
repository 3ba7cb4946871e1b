//! One-shot TCP message exchange: each connection carries a single
//! request and a single reply, read with one best-effort read each.

use std::io;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::proto::TCP_MSG_SIZE;

/// Read one message: a single read of up to [`TCP_MSG_SIZE`] bytes.
/// A connection closed before any payload arrives is an error.
pub async fn read_message(conn: &mut TcpStream) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; TCP_MSG_SIZE];
    let n = conn.read(&mut buf).await?;
    if n == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed before any payload",
        ));
    }
    buf.truncate(n);
    Ok(buf)
}

/// Write one message in full.
pub async fn write_message(conn: &mut TcpStream, data: &[u8]) -> io::Result<()> {
    conn.write_all(data).await?;
    conn.flush().await
}

/// Send a message and close the connection. Returns whether the peer got
/// the full message; a failed write is logged, not propagated.
pub async fn send_close(mut conn: TcpStream, data: &[u8]) -> bool {
    debug!(bytes = data.len(), "closing reply");
    match write_message(&mut conn, data).await {
        Ok(()) => true,
        Err(e) => {
            warn!(bytes = data.len(), error = %e, "reply write failed");
            false
        }
    }
}
