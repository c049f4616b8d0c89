//! TCP frame stream and listener.

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};

use outrun_protocol::codec;

use crate::error::{Result, TransportError};

/// A connected byte stream carrying length-prefixed frames.
///
/// Reads and writes are independently usable from two tasks after
/// [`FrameStream::into_split`]; the RPC client runs one reader task per
/// connection and funnels writes through the other half.
pub struct FrameStream {
    stream: TcpStream,
    max_frame: usize,
}

impl FrameStream {
    /// Connects to the given address.
    ///
    /// `TCP_NODELAY` is set unconditionally: filesystem RPC is latency
    /// bound and frames are already batched at the protocol level.
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;

        Ok(Self {
            stream,
            max_frame: codec::DEFAULT_MAX_FRAME,
        })
    }

    /// Wraps an accepted stream.
    pub fn from_stream(stream: TcpStream) -> Result<Self> {
        stream.set_nodelay(true)?;

        Ok(Self {
            stream,
            max_frame: codec::DEFAULT_MAX_FRAME,
        })
    }

    /// Overrides the maximum accepted frame body size.
    #[must_use]
    pub const fn with_max_frame(mut self, max_frame: usize) -> Self {
        self.max_frame = max_frame;
        self
    }

    /// Sends one complete frame (length prefix included).
    pub async fn send(&mut self, frame: Bytes) -> Result<()> {
        self.stream.write_all(&frame).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Receives one frame body, with the length prefix stripped.
    pub async fn recv(&mut self) -> Result<Bytes> {
        recv_frame(&mut self.stream, self.max_frame).await
    }

    /// Splits into independently owned read and write halves.
    #[must_use]
    pub fn into_split(self) -> (FrameReader, FrameWriter) {
        let (read, write) = self.stream.into_split();

        (
            FrameReader {
                read,
                max_frame: self.max_frame,
            },
            FrameWriter { write },
        )
    }
}

/// Read half of a split [`FrameStream`].
pub struct FrameReader {
    read: OwnedReadHalf,
    max_frame: usize,
}

impl FrameReader {
    /// Receives one frame body, with the length prefix stripped.
    pub async fn recv(&mut self) -> Result<Bytes> {
        recv_frame(&mut self.read, self.max_frame).await
    }
}

/// Write half of a split [`FrameStream`].
pub struct FrameWriter {
    write: OwnedWriteHalf,
}

impl FrameWriter {
    /// Sends one complete frame (length prefix included).
    pub async fn send(&mut self, frame: Bytes) -> Result<()> {
        self.write.write_all(&frame).await?;
        self.write.flush().await?;
        Ok(())
    }
}

async fn recv_frame<R>(reader: &mut R, max_frame: usize) -> Result<Bytes>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];

    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(TransportError::Closed);
        }
        Err(e) => return Err(e.into()),
    }

    let len = codec::check_frame_len(u32::from_be_bytes(len_buf), max_frame)
        .map_err(|e| TransportError::Frame(e.to_string()))?;

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            TransportError::Frame("connection closed mid-frame".into())
        } else {
            TransportError::Io(e)
        }
    })?;

    Ok(Bytes::from(body))
}

/// Listener that hands out [`FrameStream`]s.
pub struct FrameListener {
    listener: TcpListener,
}

impl FrameListener {
    /// Binds to the given address.
    pub async fn bind(addr: impl ToSocketAddrs) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    /// Local address the listener is bound to.
    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts one connection.
    pub async fn accept(&self) -> Result<(FrameStream, std::net::SocketAddr)> {
        let (stream, peer) = self.listener.accept().await?;
        tracing::debug!(%peer, "accepted connection");
        Ok((FrameStream::from_stream(stream)?, peer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use outrun_protocol::{encode_request, Request};

    #[tokio::test]
    async fn test_frame_roundtrip_over_tcp() {
        let listener = FrameListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.recv().await.unwrap()
        });

        let mut client = FrameStream::connect(addr).await.unwrap();
        let frame = encode_request(
            5,
            &Request::Getattr {
                path: "/usr/bin/env".into(),
            },
        )
        .unwrap();
        client.send(frame.clone()).await.unwrap();

        let body = server.await.unwrap();
        assert_eq!(&frame[4..], &body[..]);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let listener = FrameListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut stream = stream.with_max_frame(64);
            stream.recv().await
        });

        let mut client = FrameStream::connect(addr).await.unwrap();
        client
            .send(Bytes::from_static(&[0x00, 0x01, 0x00, 0x00]))
            .await
            .unwrap();

        assert!(matches!(
            server.await.unwrap(),
            Err(TransportError::Frame(_))
        ));
    }

    #[tokio::test]
    async fn test_peer_close_reported() {
        let listener = FrameListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.recv().await
        });

        let client = FrameStream::connect(addr).await.unwrap();
        drop(client);

        assert!(matches!(server.await.unwrap(), Err(TransportError::Closed)));
    }
}
