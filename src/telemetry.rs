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

//! Lifecycle telemetry events
//!
//! The server emits a small, fixed set of events as fire-and-forget
//! notifications. Event names are contractual; payload fields are carried
//! on the enum variants. Install a custom [`TelemetrySink`] with
//! [`Server::with_telemetry`](crate::Server::with_telemetry) to forward
//! events into a metrics pipeline; the default [`LogSink`] routes them
//! through `tracing`.

use std::net::SocketAddr;
use std::time::Duration;

/// Why a connection ended (metadata on [`TelemetryEvent::ConnectionClose`])
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer closed the connection in an orderly fashion
    Peer,
    /// The handler asked for an orderly close
    Handler,
    /// The connection closed during server drain
    Shutdown,
    /// The connection terminated abnormally
    Error,
    /// The worker was forcibly stopped at the shutdown-timeout boundary
    Killed,
}

impl CloseReason {
    /// Short label for logs
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Peer => "peer",
            CloseReason::Handler => "handler",
            CloseReason::Shutdown => "shutdown",
            CloseReason::Error => "error",
            CloseReason::Killed => "killed",
        }
    }
}

/// A lifecycle telemetry event
#[derive(Debug, Clone)]
pub enum TelemetryEvent {
    /// The listen socket is bound and accepting
    ListenerStart {
        /// Actual bound port (resolved for ephemeral binds)
        port: u16,
        /// Transport label (`tcp` or `tls`)
        transport: &'static str,
    },
    /// The listen socket has been closed
    ListenerShutdown,
    /// An acceptor has (re)started
    AcceptorStart {
        /// Transport label
        transport: &'static str,
    },
    /// An accept attempt failed and will be retried
    AcceptorError {
        /// Description of the failure
        error: String,
    },
    /// A connection was accepted and handed to a worker
    ConnectionStart {
        /// Peer address
        remote_address: SocketAddr,
        /// Local address
        local_address: SocketAddr,
    },
    /// The transport handshake completed
    ConnectionReady {
        /// Time spent in the handshake
        handshake_time: Duration,
    },
    /// A connection ended
    ConnectionClose {
        /// Connection lifetime
        duration: Duration,
        /// Bytes read from the peer
        bytes_in: u64,
        /// Bytes written to the peer
        bytes_out: u64,
        /// Why the connection ended
        reason: CloseReason,
    },
}

impl TelemetryEvent {
    /// Contractual event name
    pub fn name(&self) -> &'static str {
        match self {
            TelemetryEvent::ListenerStart { .. } => "listener.start",
            TelemetryEvent::ListenerShutdown => "listener.shutdown",
            TelemetryEvent::AcceptorStart { .. } => "acceptor.start",
            TelemetryEvent::AcceptorError { .. } => "acceptor.error",
            TelemetryEvent::ConnectionStart { .. } => "connection.start",
            TelemetryEvent::ConnectionReady { .. } => "connection.ready",
            TelemetryEvent::ConnectionClose { .. } => "connection.close",
        }
    }
}

/// Subscriber for telemetry events
///
/// `emit` is called inline from acceptors and workers; implementations
/// must not block.
pub trait TelemetrySink: Send + Sync + 'static {
    /// Deliver one event
    fn emit(&self, event: TelemetryEvent);
}

/// Default sink that logs events through `tracing`
#[derive(Debug, Default)]
pub struct LogSink;

impl TelemetrySink for LogSink {
    fn emit(&self, event: TelemetryEvent) {
        match &event {
            TelemetryEvent::ListenerStart { port, transport } => {
                tracing::info!(event = event.name(), port, transport, "listener started");
            }
            TelemetryEvent::ListenerShutdown => {
                tracing::info!(event = event.name(), "listener shut down");
            }
            TelemetryEvent::AcceptorStart { transport } => {
                tracing::debug!(event = event.name(), transport, "acceptor started");
            }
            TelemetryEvent::AcceptorError { error } => {
                tracing::warn!(event = event.name(), error, "accept failed");
            }
            TelemetryEvent::ConnectionStart {
                remote_address,
                local_address,
            } => {
                tracing::debug!(
                    event = event.name(),
                    %remote_address,
                    %local_address,
                    "connection accepted"
                );
            }
            TelemetryEvent::ConnectionReady { handshake_time } => {
                tracing::debug!(event = event.name(), ?handshake_time, "connection ready");
            }
            TelemetryEvent::ConnectionClose {
                duration,
                bytes_in,
                bytes_out,
                reason,
            } => {
                tracing::debug!(
                    event = event.name(),
                    ?duration,
                    bytes_in,
                    bytes_out,
                    reason = reason.as_str(),
                    "connection closed"
                );
            }
        }
    }
}
