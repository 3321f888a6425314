//
// Copyright 2017-2026 Hans W. Uhlig. All Rights Reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! Transport abstraction over cleartext and TLS connection sockets
//!
//! An accepted connection starts life as plain TCP; a TLS-configured worker
//! upgrades it in place once the handshake completes. All socket I/O goes
//! through [`TransportStream`] so the rest of the server never matches on
//! the transport.

use bytes::BytesMut;
use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;

/// A connection socket, exclusively owned by its worker
///
/// `Closed` doubles as the detached placeholder while the stream is being
/// upgraded to TLS; any I/O against it fails with `NotConnected`.
pub(crate) enum TransportStream {
    /// Plain TCP
    Tcp(TcpStream),
    /// TLS over TCP
    Tls(Box<TlsStream<TcpStream>>),
    /// Released or mid-upgrade
    Closed,
}

impl TransportStream {
    /// Read whatever is available in one read into `buf`
    ///
    /// Returns the number of bytes read; `0` means the peer performed an
    /// orderly close.
    pub(crate) async fn read_buf(&mut self, buf: &mut BytesMut) -> io::Result<usize> {
        match self {
            TransportStream::Tcp(stream) => stream.read_buf(buf).await,
            TransportStream::Tls(stream) => stream.read_buf(buf).await,
            TransportStream::Closed => Err(closed()),
        }
    }

    /// Write an entire buffer and flush it
    pub(crate) async fn send(&mut self, data: &[u8]) -> io::Result<()> {
        match self {
            TransportStream::Tcp(stream) => {
                stream.write_all(data).await?;
                stream.flush().await
            }
            TransportStream::Tls(stream) => {
                stream.write_all(data).await?;
                stream.flush().await
            }
            TransportStream::Closed => Err(closed()),
        }
    }

    /// Half-close: no further sends; reads still drain
    ///
    /// For TLS this also sends the `close_notify` alert.
    pub(crate) async fn shutdown_write(&mut self) -> io::Result<()> {
        match self {
            TransportStream::Tcp(stream) => stream.shutdown().await,
            TransportStream::Tls(stream) => stream.shutdown().await,
            TransportStream::Closed => Err(closed()),
        }
    }

    /// Release the socket; idempotent
    pub(crate) async fn close(&mut self) {
        match self {
            TransportStream::Tcp(stream) => {
                let _ = stream.shutdown().await;
            }
            TransportStream::Tls(stream) => {
                let _ = stream.shutdown().await;
            }
            TransportStream::Closed => {}
        }
        *self = TransportStream::Closed;
    }

    /// Peer address
    pub(crate) fn peer_addr(&self) -> io::Result<SocketAddr> {
        match self {
            TransportStream::Tcp(stream) => stream.peer_addr(),
            TransportStream::Tls(stream) => stream.get_ref().0.peer_addr(),
            TransportStream::Closed => Err(closed()),
        }
    }

    /// Local address
    pub(crate) fn local_addr(&self) -> io::Result<SocketAddr> {
        match self {
            TransportStream::Tcp(stream) => stream.local_addr(),
            TransportStream::Tls(stream) => stream.get_ref().0.local_addr(),
            TransportStream::Closed => Err(closed()),
        }
    }
}

impl std::fmt::Debug for TransportStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportStream::Tcp(_) => write!(f, "TransportStream::Tcp"),
            TransportStream::Tls(_) => write!(f, "TransportStream::Tls"),
            TransportStream::Closed => write!(f, "TransportStream::Closed"),
        }
    }
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "connection closed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_closed_stream_rejects_io() {
        let mut stream = TransportStream::Closed;
        let mut buf = BytesMut::new();

        assert!(stream.read_buf(&mut buf).await.is_err());
        assert!(stream.send(b"x").await.is_err());
        assert!(stream.peer_addr().is_err());

        // close on an already-closed stream is a no-op
        stream.close().await;
    }

    #[tokio::test]
    async fn test_tcp_roundtrip_and_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client_task = tokio::spawn(async move {
            let mut client = TcpStream::connect(addr).await.unwrap();
            client.write_all(b"ping").await.unwrap();
            let mut buf = [0u8; 4];
            client.read_exact(&mut buf).await.unwrap();
            buf
        });

        let (socket, _) = listener.accept().await.unwrap();
        let mut stream = TransportStream::Tcp(socket);
        assert!(stream.peer_addr().is_ok());
        assert!(stream.local_addr().is_ok());

        let mut buf = BytesMut::with_capacity(64);
        let n = stream.read_buf(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");

        stream.send(b"pong").await.unwrap();
        assert_eq!(&client_task.await.unwrap(), b"pong");

        stream.close().await;
        assert!(matches!(stream, TransportStream::Closed));
    }
}
