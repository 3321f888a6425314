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

//! Quayside - Embeddable TCP/TLS socket server framework
//!
//! Quayside is the substrate that protocol libraries build on: it accepts
//! network connections on a configured port, hands each connection to an
//! application-supplied handler, and manages the full lifecycle from bind,
//! through steady-state acceptance under concurrency, to graceful drain and
//! shutdown. It is payload-agnostic and implements no protocol of its own.
//!
//! # Architecture
//!
//! ```text
//!     Server ── Listener
//!           ├── AcceptorPool
//!           │     └── AcceptorGroup × N   (default N=10)
//!           │           ├── Acceptor      (task)
//!           │           └── ConnectionSet (dynamic set of workers)
//!           └── ShutdownListener
//! ```
//!
//! A pool of acceptor groups competes for incoming connections, removing
//! the single-acceptor bottleneck. Each accepted connection is owned by
//! exactly one worker task, which performs the transport handshake
//! (cleartext or TLS behave identically from the handler's point of view)
//! and drives the handler's callbacks strictly serially. Shutdown closes
//! the listen socket first, gives live connections a bounded opportunity to
//! finish, and forcibly stops the rest at the budget boundary.
//!
//! # Quick Start
//!
//! ```no_run
//! use quayside::{Connection, ConnectionHandler, Directive, Server, ServerConfig};
//! use async_trait::async_trait;
//! use bytes::Bytes;
//! use std::sync::Arc;
//!
//! #[derive(Default)]
//! struct Echo;
//!
//! #[async_trait]
//! impl ConnectionHandler for Echo {
//!     async fn on_data(&mut self, data: Bytes, conn: &mut Connection) -> Directive {
//!         match conn.send(&data).await {
//!             Ok(()) => Directive::Continue,
//!             Err(e) => Directive::Error(e),
//!         }
//!     }
//! }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let server = Server::new(ServerConfig::default().with_port(4000))?;
//! server
//!     .start(Arc::new(|| Box::new(Echo::default()) as Box<dyn ConnectionHandler>))
//!     .await?;
//!
//! // ... later
//! server.stop().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Handlers
//!
//! Per-connection behaviour lives in a [`ConnectionHandler`]; a fresh
//! instance is created for each connection by a [`HandlerFactory`], and the
//! instance's own fields are its state. Every callback returns a
//! [`Directive`] steering the worker: keep reading (optionally with a
//! custom timeout), switch to a different handler for protocol upgrades,
//! close, or fail. Out-of-band messages reach a connection through its
//! [`ConnectionControl`] mailbox handle and arrive via `on_message`,
//! serialized with socket reads.

mod acceptor;
mod config;
mod connection;
mod error;
mod handler;
mod listener;
mod metrics;
mod server;
mod telemetry;
mod tls;
mod transport;
mod types;
mod worker;

pub use config::{ServerConfig, TlsConfig, TransportConfig};
pub use connection::{Connection, ConnectionControl, ConnectionMeta, Message};
pub use error::{Result, ServerError};
pub use handler::{ConnectionHandler, Directive, HandlerFactory};
pub use listener::ListenerInfo;
pub use metrics::{MetricsSnapshot, ServerMetrics};
pub use server::Server;
pub use telemetry::{CloseReason, LogSink, TelemetryEvent, TelemetrySink};
pub use types::{ConnectionId, WorkerState};
