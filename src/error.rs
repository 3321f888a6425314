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

//! Error types for the socket server

use std::net::SocketAddr;
use thiserror::Error;

/// Result type for server operations
pub type Result<T> = std::result::Result<T, ServerError>;

/// Server error types
///
/// Configuration and bind failures surface synchronously from
/// [`Server::new`](crate::Server::new) and [`Server::start`](crate::Server::start).
/// The remaining variants are per-connection: they are delivered to the
/// handler's `on_error` callback and never escape the worker that hit them.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Invalid configuration (bad option values, unreadable TLS material)
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The OS refused the listen socket
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address the bind was attempted on
        addr: SocketAddr,
        /// Underlying OS error
        source: std::io::Error,
    },

    /// Transport handshake failed (TLS alert, bad certificate, peer hangup)
    #[error("handshake failed: {0}")]
    Handshake(#[source] std::io::Error),

    /// Mid-connection read or write failure
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// An operation exceeded its deadline
    #[error("operation timed out")]
    Timeout,

    /// A handler callback panicked
    #[error("handler panicked: {0}")]
    HandlerPanic(String),

    /// The connection has been closed
    #[error("connection closed")]
    Closed,

    /// The server is not running
    #[error("server not running")]
    NotRunning,

    /// The server has already been started
    #[error("server already running")]
    AlreadyRunning,
}

impl ServerError {
    /// Check if the error came out of the transport handshake
    pub fn is_handshake(&self) -> bool {
        matches!(self, ServerError::Handshake(_))
    }

    /// Check if the error is a configuration problem
    pub fn is_config(&self) -> bool {
        matches!(self, ServerError::Config(_))
    }

    /// Check if the error is a mid-connection transport failure
    pub fn is_transport(&self) -> bool {
        matches!(self, ServerError::Transport(_))
    }

    /// Check if the error is a handler crash
    pub fn is_crash(&self) -> bool {
        matches!(self, ServerError::HandlerPanic(_))
    }

    /// Check if the error is recoverable by retrying the operation
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ServerError::Timeout | ServerError::Closed | ServerError::Transport(_)
        )
    }
}
