//! A pooled TCP connection with attached frame buffers.

use std::io;
use std::net::SocketAddr;

use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use linerpc_common::codec::read_frame;
use linerpc_common::Result;

/// Buffer size for each direction of a pooled connection.
pub const STREAM_BUF_SIZE: usize = 32 * 1024;

/// A byte-stream handle owned by the pool and loaned exclusively to one
/// caller at a time.
///
/// The stream is split so each direction gets its own 32 KiB buffer.
/// Dropping the connection closes the socket; "destroying" a connection is
/// exactly that.
pub struct PooledConn {
    reader: BufReader<OwnedReadHalf>,
    writer: BufWriter<OwnedWriteHalf>,
    peer: Option<SocketAddr>,
}

impl std::fmt::Debug for PooledConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConn")
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

impl PooledConn {
    pub fn new(stream: TcpStream) -> Self {
        let peer = stream.peer_addr().ok();
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: BufReader::with_capacity(STREAM_BUF_SIZE, read_half),
            writer: BufWriter::with_capacity(STREAM_BUF_SIZE, write_half),
            peer,
        }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Read one newline-terminated frame into `buf`. Returns the number of
    /// bytes read; zero means the peer closed the connection cleanly.
    pub async fn read_frame(&mut self, buf: &mut Vec<u8>) -> Result<usize> {
        read_frame(&mut self.reader, buf).await
    }

    /// Write one encoded frame and flush it to the socket.
    pub async fn write_frame(&mut self, data: &[u8]) -> Result<()> {
        self.writer.write_all(data).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Cheap liveness probe, run without blocking.
    ///
    /// An idle connection in this protocol has nothing to read: a
    /// would-block probe means the socket is open and quiet. EOF, stray
    /// bytes (the exchange is strictly serial, so leftovers mean a desynced
    /// peer) or any error classify the connection as dead.
    pub fn is_healthy(&self) -> bool {
        if !self.reader.buffer().is_empty() {
            return false;
        }
        let mut probe = [0u8; 1];
        match self.reader.get_ref().try_read(&mut probe) {
            Ok(0) => false,
            Ok(_) => false,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => true,
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt as _;
    use tokio::net::TcpListener;

    async fn pair() -> (PooledConn, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (PooledConn::new(client), server)
    }

    #[tokio::test]
    async fn test_frame_round_trip() {
        let (mut conn, mut server) = pair().await;

        conn.write_frame(b"{\"ping\":1}\n").await.unwrap();

        let mut got = [0u8; 11];
        tokio::io::AsyncReadExt::read_exact(&mut server, &mut got)
            .await
            .unwrap();
        assert_eq!(&got, b"{\"ping\":1}\n");

        server.write_all(b"{\"pong\":1}\n").await.unwrap();
        let mut buf = Vec::new();
        let n = conn.read_frame(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"{\"pong\":1}\n");
    }

    #[tokio::test]
    async fn test_read_frame_reports_eof() {
        let (mut conn, server) = pair().await;
        drop(server);
        let mut buf = Vec::new();
        let n = conn.read_frame(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_healthy_when_idle() {
        let (conn, _server) = pair().await;
        assert!(conn.is_healthy());
    }

    #[tokio::test]
    async fn test_unhealthy_after_peer_close() {
        let (conn, server) = pair().await;
        drop(server);
        // Give the FIN a moment to arrive.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!conn.is_healthy());
    }

    #[tokio::test]
    async fn test_unhealthy_with_unread_bytes() {
        let (conn, mut server) = pair().await;
        server.write_all(b"stray").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!conn.is_healthy());
    }
}
