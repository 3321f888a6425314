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

//! Connection worker implementation
//!
//! One worker per accepted connection. The worker owns the socket, performs
//! the transport handshake, and then drives a single event loop over socket
//! reads, the mailbox, and the server's drain signal. Handler callbacks are
//! dispatched strictly serially: the loop resolves one event at a time and
//! invokes the callback outside the select, so no two callbacks on the same
//! connection ever overlap.
//!
//! State machine:
//!
//! ```text
//!   Handshaking ─► Running ─┬─► Closing ─► Terminated
//!        │                  │
//!        └──► Errored ──────┘
//! ```
//!
//! A handler panic is caught, converted into a `HandlerPanic` error, and
//! routed through the normal error path; it never takes the acceptor group
//! down.

use crate::connection::{Connection, ControlMessage};
use crate::error::ServerError;
use crate::handler::{ConnectionHandler, Directive};
use crate::metrics::ServerMetrics;
use crate::telemetry::{CloseReason, TelemetryEvent, TelemetrySink};
use crate::tls::TlsContext;
use crate::types::WorkerState;
use bytes::Bytes;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// Worker configuration
#[derive(Debug, Clone)]
pub(crate) struct WorkerConfig {
    /// Default timeout applied to each read
    pub read_timeout: Duration,
    /// Bound on the transport handshake
    pub handshake_timeout: Duration,
}

/// One event drawn from the worker's single logical queue
enum Event {
    Data(Bytes),
    PeerClosed,
    ReadError(std::io::Error),
    TimedOut,
    Control(ControlMessage),
    MailboxClosed,
    Drain,
}

/// How the loop decided to stop
enum Exit {
    Close,
    Error(ServerError),
}

/// Connection worker that manages a single connection's lifecycle
pub(crate) struct ConnectionWorker {
    connection: Connection,
    handler: Box<dyn ConnectionHandler>,
    config: WorkerConfig,
    current_timeout: Duration,
    control_rx: mpsc::Receiver<ControlMessage>,
    drain_token: CancellationToken,
    state: Arc<AtomicU8>,
    tls: Option<TlsContext>,
    telemetry: Arc<dyn TelemetrySink>,
    metrics: Arc<ServerMetrics>,
}

impl ConnectionWorker {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        connection: Connection,
        handler: Box<dyn ConnectionHandler>,
        config: WorkerConfig,
        control_rx: mpsc::Receiver<ControlMessage>,
        drain_token: CancellationToken,
        state: Arc<AtomicU8>,
        tls: Option<TlsContext>,
        telemetry: Arc<dyn TelemetrySink>,
        metrics: Arc<ServerMetrics>,
    ) -> Self {
        let current_timeout = config.read_timeout;
        Self {
            connection,
            handler,
            config,
            current_timeout,
            control_rx,
            drain_token,
            state,
            tls,
            telemetry,
            metrics,
        }
    }

    fn set_state(&self, state: WorkerState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    /// Run the worker to completion, returning why the connection ended
    pub(crate) async fn run(mut self) -> CloseReason {
        self.set_state(WorkerState::Handshaking);

        let handshake_start = Instant::now();
        let handshake = timeout(
            self.config.handshake_timeout,
            self.connection.handshake(self.tls.as_ref()),
        )
        .await;
        match handshake {
            Ok(Ok(())) => {
                self.telemetry.emit(TelemetryEvent::ConnectionReady {
                    handshake_time: handshake_start.elapsed(),
                });
            }
            Ok(Err(e)) => {
                self.metrics.handshake_error();
                return self.errored(ServerError::Handshake(e)).await;
            }
            Err(_) => {
                self.metrics.handshake_error();
                return self
                    .errored(ServerError::Handshake(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "handshake timed out",
                    )))
                    .await;
            }
        }

        self.set_state(WorkerState::Running);

        let result = catch(self.handler.on_connect(&mut self.connection)).await;
        let directive = self.directive_or_crash(result);
        if let Some(exit) = self.apply(directive) {
            return self.finish(exit, false).await;
        }

        self.event_loop().await
    }

    /// Main event loop; one callback at a time, FIFO across sources
    async fn event_loop(mut self) -> CloseReason {
        let mut drained = false;

        loop {
            let event = tokio::select! {
                res = timeout(self.current_timeout, self.connection.recv()) => match res {
                    Ok(Ok(data)) if data.is_empty() => Event::PeerClosed,
                    Ok(Ok(data)) => Event::Data(data),
                    Ok(Err(e)) => Event::ReadError(e),
                    Err(_) => Event::TimedOut,
                },
                msg = self.control_rx.recv() => match msg {
                    Some(msg) => Event::Control(msg),
                    None => Event::MailboxClosed,
                },
                _ = self.drain_token.cancelled(), if !drained => Event::Drain,
            };

            let exit = match event {
                Event::Data(data) => {
                    let result = catch(self.handler.on_data(data, &mut self.connection)).await;
                    let directive = self.directive_or_crash(result);
                    self.apply(directive)
                }
                Event::TimedOut => {
                    self.metrics.timeout_error();
                    let result = catch(self.handler.on_timeout(&mut self.connection)).await;
                    let directive = self.directive_or_crash(result);
                    self.apply(directive)
                }
                Event::PeerClosed => {
                    return self.closing(CloseReason::Peer).await;
                }
                Event::ReadError(e) => {
                    self.metrics.transport_error();
                    return self.errored(ServerError::Transport(e)).await;
                }
                Event::Control(ControlMessage::Send(data)) => {
                    match self.connection.send(&data).await {
                        Ok(()) => None,
                        Err(e) => {
                            self.metrics.transport_error();
                            return self.errored(e).await;
                        }
                    }
                }
                Event::Control(ControlMessage::Message(msg)) => {
                    let result =
                        catch(self.handler.on_message(msg, &mut self.connection)).await;
                    let directive = self.directive_or_crash(result);
                    self.apply(directive)
                }
                Event::Control(ControlMessage::Close) | Event::MailboxClosed => Some(Exit::Close),
                Event::Drain => {
                    drained = true;
                    let result = catch(self.handler.on_shutdown(&mut self.connection)).await;
                    let directive = self.directive_or_crash(result);
                    self.apply(directive)
                }
            };

            if let Some(exit) = exit {
                return self.finish(exit, drained).await;
            }
        }
    }

    /// Apply a continuation directive; `Some` means the loop is done
    fn apply(&mut self, directive: Directive) -> Option<Exit> {
        match directive {
            Directive::Continue => {
                self.current_timeout = self.config.read_timeout;
                None
            }
            Directive::ContinueWithTimeout(duration) => {
                self.current_timeout = duration;
                None
            }
            Directive::Switch(handler) => {
                self.handler = handler;
                self.current_timeout = self.config.read_timeout;
                None
            }
            Directive::Close => Some(Exit::Close),
            Directive::Error(e) => Some(Exit::Error(e)),
        }
    }

    fn directive_or_crash(
        &self,
        result: std::result::Result<Directive, String>,
    ) -> Directive {
        match result {
            Ok(directive) => directive,
            Err(message) => {
                self.metrics.handler_panic();
                Directive::Error(ServerError::HandlerPanic(message))
            }
        }
    }

    async fn finish(self, exit: Exit, drained: bool) -> CloseReason {
        match exit {
            Exit::Close => {
                let reason = if drained {
                    CloseReason::Shutdown
                } else {
                    CloseReason::Handler
                };
                self.close_quietly(reason).await
            }
            Exit::Error(e) => self.errored(e).await,
        }
    }

    /// Orderly close initiated by the peer; invokes `on_close` exactly once
    async fn closing(mut self, reason: CloseReason) -> CloseReason {
        self.set_state(WorkerState::Closing);

        if let Err(message) = catch(self.handler.on_close(&mut self.connection)).await {
            self.metrics.handler_panic();
            tracing::warn!(
                connection_id = %self.connection.id(),
                panic = %message,
                "handler panicked in on_close"
            );
        }

        self.connection.close().await;
        self.set_state(WorkerState::Terminated);
        reason
    }

    /// Orderly close initiated locally; `on_close` is not invoked
    async fn close_quietly(mut self, reason: CloseReason) -> CloseReason {
        self.set_state(WorkerState::Closing);
        self.connection.close().await;
        self.set_state(WorkerState::Terminated);
        reason
    }

    /// Abnormal termination; invokes `on_error` exactly once
    async fn errored(mut self, error: ServerError) -> CloseReason {
        self.set_state(WorkerState::Errored);
        tracing::debug!(
            connection_id = %self.connection.id(),
            error = %error,
            "connection terminating abnormally"
        );

        if let Err(message) = catch(self.handler.on_error(error, &mut self.connection)).await {
            self.metrics.handler_panic();
            tracing::warn!(
                connection_id = %self.connection.id(),
                panic = %message,
                "handler panicked in on_error"
            );
        }

        self.connection.close().await;
        self.set_state(WorkerState::Terminated);
        CloseReason::Error
    }
}

impl std::fmt::Debug for ConnectionWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionWorker")
            .field("connection", &self.connection)
            .field(
                "state",
                &WorkerState::from_u8(self.state.load(Ordering::Acquire)),
            )
            .finish()
    }
}

/// Run a handler callback, converting a panic into an error message
async fn catch<T>(fut: impl std::future::Future<Output = T>) -> std::result::Result<T, String> {
    AssertUnwindSafe(fut)
        .catch_unwind()
        .await
        .map_err(|payload| panic_message(payload.as_ref()))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}
