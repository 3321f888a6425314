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

//! Connection handle and out-of-band messaging
//!
//! [`Connection`] wraps the transport socket together with its metadata and
//! byte counters; it is owned by exactly one worker and handed to handler
//! callbacks as `&mut Connection`. Other parts of the application reach a
//! connection through its [`ConnectionControl`] handle, which feeds the
//! worker's mailbox; the socket itself is never shared.

use crate::error::{Result, ServerError};
use crate::tls::TlsContext;
use crate::transport::TransportStream;
use crate::types::{ConnectionCounters, ConnectionId};
use bytes::{Bytes, BytesMut};
use std::any::Any;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;

/// An opaque out-of-band message delivered to a worker's mailbox
///
/// The framework never inspects it; stateful handlers downcast in
/// `on_message`.
pub type Message = Box<dyn Any + Send>;

/// Control messages for a connection worker
pub(crate) enum ControlMessage {
    /// Write the payload to the connection from inside the worker
    Send(Bytes),
    /// Deliver an out-of-band message to the handler
    Message(Message),
    /// Gracefully close the connection
    Close,
}

impl std::fmt::Debug for ControlMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControlMessage::Send(data) => write!(f, "Send({} bytes)", data.len()),
            ControlMessage::Message(_) => write!(f, "Message(..)"),
            ControlMessage::Close => write!(f, "Close"),
        }
    }
}

/// Cloneable handle for reaching a connection from elsewhere in the
/// application
///
/// All operations go through the worker's mailbox and are applied in FIFO
/// order, serialized with the worker's socket reads.
#[derive(Debug, Clone)]
pub struct ConnectionControl {
    id: ConnectionId,
    tx: mpsc::Sender<ControlMessage>,
}

impl ConnectionControl {
    pub(crate) fn new(id: ConnectionId, tx: mpsc::Sender<ControlMessage>) -> Self {
        Self { id, tx }
    }

    /// The connection this handle controls
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue a payload for the worker to write to the connection
    pub async fn send(&self, data: Bytes) -> Result<()> {
        self.tx
            .send(ControlMessage::Send(data))
            .await
            .map_err(|_| ServerError::Closed)
    }

    /// Deliver an out-of-band message to the handler's `on_message`
    pub async fn message(&self, msg: Message) -> Result<()> {
        self.tx
            .send(ControlMessage::Message(msg))
            .await
            .map_err(|_| ServerError::Closed)
    }

    /// Request an orderly close
    pub async fn close(&self) -> Result<()> {
        self.tx
            .send(ControlMessage::Close)
            .await
            .map_err(|_| ServerError::Closed)
    }
}

/// Immutable facts about a connection
#[derive(Debug, Clone, Copy)]
pub struct ConnectionMeta {
    /// Connection ID
    pub id: ConnectionId,
    /// Peer address
    pub peer_addr: SocketAddr,
    /// Local address
    pub local_addr: SocketAddr,
}

/// A live connection, exclusively owned by its worker
pub struct Connection {
    stream: TransportStream,
    meta: ConnectionMeta,
    control_tx: mpsc::Sender<ControlMessage>,
    counters: Arc<ConnectionCounters>,
    read_buf: BytesMut,
    buffer_size: usize,
}

impl Connection {
    pub(crate) fn new(
        stream: TransportStream,
        meta: ConnectionMeta,
        control_tx: mpsc::Sender<ControlMessage>,
        counters: Arc<ConnectionCounters>,
        buffer_size: usize,
    ) -> Self {
        Self {
            stream,
            meta,
            control_tx,
            counters,
            read_buf: BytesMut::with_capacity(buffer_size),
            buffer_size,
        }
    }

    /// Connection metadata
    pub fn meta(&self) -> ConnectionMeta {
        self.meta
    }

    /// Connection ID
    pub fn id(&self) -> ConnectionId {
        self.meta.id
    }

    /// Peer address
    pub fn peer_addr(&self) -> SocketAddr {
        self.meta.peer_addr
    }

    /// Local address
    pub fn local_addr(&self) -> SocketAddr {
        self.meta.local_addr
    }

    /// Bytes read from the peer so far
    pub fn bytes_in(&self) -> u64 {
        self.counters.bytes_in()
    }

    /// Bytes written to the peer so far
    pub fn bytes_out(&self) -> u64 {
        self.counters.bytes_out()
    }

    /// A mailbox handle for this connection
    ///
    /// Clone it out of `on_connect` to let other parts of the application
    /// message or close this connection.
    pub fn control(&self) -> ConnectionControl {
        ConnectionControl::new(self.meta.id, self.control_tx.clone())
    }

    /// Write an entire payload to the peer
    pub async fn send(&mut self, data: &[u8]) -> Result<()> {
        self.stream.send(data).await.map_err(ServerError::Transport)?;
        self.counters.add_out(data.len() as u64);
        Ok(())
    }

    /// Half-close the write side; the peer sees EOF but can keep sending
    pub async fn shutdown_write(&mut self) -> Result<()> {
        self.stream
            .shutdown_write()
            .await
            .map_err(ServerError::Transport)
    }

    /// Read whatever is available in one read
    ///
    /// An empty result means the peer performed an orderly close.
    pub(crate) async fn recv(&mut self) -> std::io::Result<Bytes> {
        self.read_buf.reserve(self.buffer_size);
        let n = self.stream.read_buf(&mut self.read_buf).await?;
        if n == 0 {
            return Ok(Bytes::new());
        }
        self.counters.add_in(n as u64);
        Ok(self.read_buf.split().freeze())
    }

    /// Upgrade the stream to TLS; a no-op for cleartext transports
    pub(crate) async fn handshake(&mut self, tls: Option<&TlsContext>) -> std::io::Result<()> {
        let Some(context) = tls else {
            return Ok(());
        };

        match std::mem::replace(&mut self.stream, TransportStream::Closed) {
            TransportStream::Tcp(tcp) => {
                let stream = context.handshake(tcp).await?;
                self.stream = TransportStream::Tls(Box::new(stream));
                Ok(())
            }
            other => {
                self.stream = other;
                Ok(())
            }
        }
    }

    /// Release the socket; idempotent
    pub(crate) async fn close(&mut self) {
        self.stream.close().await;
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.meta.id)
            .field("peer_addr", &self.meta.peer_addr)
            .field("local_addr", &self.meta.local_addr)
            .field("stream", &self.stream)
            .finish()
    }
}
