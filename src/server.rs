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

//! The server: bind, steady-state acceptance, and graceful drain
//!
//! Startup order is strict: the listen socket is bound first, then the
//! acceptor pool is created, then the shutdown listener is armed. The drain
//! protocol runs in the opposite direction: the listen socket closes first
//! (new connects are refused immediately), existing workers are given
//! `on_shutdown` and up to the drain budget to finish, and stragglers are
//! forcibly stopped at the boundary.
//!
//! # Example
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
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = Server::new(ServerConfig::default().with_port(4000))?;
//!     server
//!         .start(Arc::new(|| Box::new(Echo::default()) as Box<dyn ConnectionHandler>))
//!         .await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     server.stop().await?;
//!     Ok(())
//! }
//! ```

use crate::acceptor::{AcceptorPool, PoolContext};
use crate::config::{ServerConfig, TransportConfig};
use crate::error::{Result, ServerError};
use crate::handler::HandlerFactory;
use crate::listener::{Listener, ListenerInfo};
use crate::metrics::ServerMetrics;
use crate::telemetry::{LogSink, TelemetryEvent, TelemetrySink};
use crate::tls::TlsContext;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Embeddable TCP/TLS socket server
///
/// A `Server` runs at most one bind/accept/drain cycle; create a new
/// instance to listen again. Multiple independent servers may run in one
/// process, each on its own port, with no shared state.
pub struct Server {
    config: ServerConfig,
    tls: Option<TlsContext>,
    telemetry: Arc<dyn TelemetrySink>,
    metrics: Arc<ServerMetrics>,
    running: AtomicBool,
    /// The shutdown signal; once raised it stays raised
    shutdown: CancellationToken,
    info: OnceLock<ListenerInfo>,
    pool: Mutex<Option<Arc<AcceptorPool>>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
    drain_budget: Arc<Mutex<Duration>>,
}

impl Server {
    /// Create a server from a configuration
    ///
    /// Validates the configuration and loads TLS material synchronously, so
    /// an unreadable certificate or key fails here rather than at bind time.
    pub fn new(config: ServerConfig) -> Result<Self> {
        config.validate().map_err(ServerError::Config)?;

        let tls = match &config.transport {
            TransportConfig::Tcp => None,
            TransportConfig::Tls(tls_config) => Some(TlsContext::from_config(tls_config)?),
        };

        let drain_budget = Arc::new(Mutex::new(config.shutdown_timeout));

        Ok(Self {
            config,
            tls,
            telemetry: Arc::new(LogSink),
            metrics: Arc::new(ServerMetrics::new()),
            running: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            info: OnceLock::new(),
            pool: Mutex::new(None),
            watcher: Mutex::new(None),
            drain_budget,
        })
    }

    /// Install a custom telemetry sink
    ///
    /// Must be called before `start`.
    pub fn with_telemetry(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = sink;
        self
    }

    /// Bind the listen socket and begin accepting connections
    ///
    /// The factory is invoked once per accepted connection to create its
    /// handler.
    pub async fn start(&self, factory: Arc<dyn HandlerFactory>) -> Result<()> {
        if self.shutdown.is_cancelled() || self.running.swap(true, Ordering::SeqCst) {
            return Err(ServerError::AlreadyRunning);
        }

        let transport = self.config.transport.label();
        let listener = match Listener::bind(self.config.bind_address, transport).await {
            Ok(listener) => listener,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        let info = listener.info();
        let _ = self.info.set(info);
        self.telemetry.emit(TelemetryEvent::ListenerStart {
            port: info.port(),
            transport,
        });
        tracing::info!(addr = %info.local_addr(), transport, "server listening");

        let accept_token = CancellationToken::new();
        let drain_token = CancellationToken::new();

        let ctx = Arc::new(PoolContext {
            config: self.config.clone(),
            factory,
            tls: self.tls.clone(),
            telemetry: self.telemetry.clone(),
            metrics: self.metrics.clone(),
            accept_token: accept_token.clone(),
            drain_token: drain_token.clone(),
            shutdown: self.shutdown.clone(),
            next_id: AtomicU64::new(1),
        });

        let pool = Arc::new(AcceptorPool::start(&ctx, &listener.socket()));
        *self.pool.lock().unwrap() = Some(pool.clone());

        let watcher = tokio::spawn(shutdown_listener(
            self.shutdown.clone(),
            accept_token,
            drain_token,
            pool,
            listener,
            self.telemetry.clone(),
            self.drain_budget.clone(),
        ));
        *self.watcher.lock().unwrap() = Some(watcher);

        Ok(())
    }

    /// Gracefully stop the server, draining within the configured budget
    pub async fn stop(&self) -> Result<()> {
        let budget = self.config.shutdown_timeout;
        self.stop_with_timeout(budget).await
    }

    /// Gracefully stop the server with an explicit drain budget
    pub async fn stop_with_timeout(&self, budget: Duration) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(ServerError::NotRunning);
        }

        *self.drain_budget.lock().unwrap() = budget;
        self.shutdown.cancel();

        let watcher = self.watcher.lock().unwrap().take();
        if let Some(handle) = watcher {
            let _ = handle.await;
        }
        *self.pool.lock().unwrap() = None;

        Ok(())
    }

    /// Facts about the bound listen socket, once `start` has succeeded
    pub fn listener_info(&self) -> Option<ListenerInfo> {
        self.info.get().copied()
    }

    /// Actual bound address, once `start` has succeeded
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.info.get().map(ListenerInfo::local_addr)
    }

    /// Check if the server is accepting connections
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst) && !self.shutdown.is_cancelled()
    }

    /// Number of live connections
    pub fn connection_count(&self) -> usize {
        self.pool
            .lock()
            .unwrap()
            .as_ref()
            .map(|pool| pool.connection_count())
            .unwrap_or(0)
    }

    /// Queue a payload to every live connection (best effort)
    ///
    /// Returns the number of workers that accepted the payload.
    pub async fn broadcast(&self, data: Bytes) -> usize {
        let pool = self.pool.lock().unwrap().clone();
        match pool {
            Some(pool) => pool.broadcast(data).await,
            None => 0,
        }
    }

    /// Get the server metrics
    pub fn metrics(&self) -> Arc<ServerMetrics> {
        self.metrics.clone()
    }

    /// Get the server configuration
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("bind_address", &self.config.bind_address)
            .field("transport", &self.config.transport.label())
            .field("running", &self.is_running())
            .field("connection_count", &self.connection_count())
            .finish()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if self.running.load(Ordering::SeqCst) && !self.shutdown.is_cancelled() {
            tracing::warn!("server dropped while still running");
            self.shutdown.cancel();
        }
    }
}

/// The armed shutdown listener: waits for the signal, then runs the drain
/// protocol to completion
async fn shutdown_listener(
    shutdown: CancellationToken,
    accept_token: CancellationToken,
    drain_token: CancellationToken,
    pool: Arc<AcceptorPool>,
    listener: Listener,
    telemetry: Arc<dyn TelemetrySink>,
    drain_budget: Arc<Mutex<Duration>>,
) {
    shutdown.cancelled().await;
    tracing::info!("server draining");

    // Step 1: unblock every acceptor and close the listen socket. New
    // connects are refused from here on.
    accept_token.cancel();
    pool.wait_acceptors().await;
    drop(listener);
    telemetry.emit(TelemetryEvent::ListenerShutdown);

    // Steps 2-4: give live workers their goodbye opportunity, wait out the
    // budget, then forcibly stop the rest.
    drain_token.cancel();
    let budget = *drain_budget.lock().unwrap();
    pool.drain(budget).await;

    tracing::info!("server shutdown complete");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::ConnectionHandler;
    use async_trait::async_trait;

    struct NoOp;

    #[async_trait]
    impl ConnectionHandler for NoOp {}

    fn noop_factory() -> Arc<dyn HandlerFactory> {
        Arc::new(|| Box::new(NoOp) as Box<dyn ConnectionHandler>)
    }

    #[tokio::test]
    async fn test_server_lifecycle() {
        let config = ServerConfig::new("127.0.0.1:0".parse().unwrap());
        let server = Server::new(config).unwrap();
        assert!(!server.is_running());
        assert!(server.listener_info().is_none());

        server.start(noop_factory()).await.unwrap();
        assert!(server.is_running());
        assert!(server.listener_info().unwrap().port() > 0);

        server.stop().await.unwrap();
        assert!(!server.is_running());
        assert_eq!(server.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_server_double_start() {
        let config = ServerConfig::new("127.0.0.1:0".parse().unwrap());
        let server = Server::new(config).unwrap();

        server.start(noop_factory()).await.unwrap();
        assert!(matches!(
            server.start(noop_factory()).await,
            Err(ServerError::AlreadyRunning)
        ));

        server.stop().await.unwrap();
        // a server runs at most once
        assert!(matches!(
            server.start(noop_factory()).await,
            Err(ServerError::AlreadyRunning)
        ));
    }

    #[tokio::test]
    async fn test_stop_when_not_running() {
        let config = ServerConfig::new("127.0.0.1:0".parse().unwrap());
        let server = Server::new(config).unwrap();
        assert!(matches!(server.stop().await, Err(ServerError::NotRunning)));
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let config = ServerConfig::new("127.0.0.1:0".parse().unwrap()).with_num_acceptors(0);
        assert!(matches!(Server::new(config), Err(ServerError::Config(_))));
    }

    #[tokio::test]
    async fn test_bind_conflict() {
        let first = Server::new(ServerConfig::new("127.0.0.1:0".parse().unwrap())).unwrap();
        first.start(noop_factory()).await.unwrap();
        let taken = first.local_addr().unwrap();

        let second = Server::new(ServerConfig::new(taken)).unwrap();
        assert!(matches!(
            second.start(noop_factory()).await,
            Err(ServerError::Bind { .. })
        ));

        first.stop().await.unwrap();
    }
}
