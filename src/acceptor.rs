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

//! Acceptor pool and per-group supervision
//!
//! The pool runs a fixed number of independent acceptor groups. Each group
//! owns one acceptor task plus the dynamic set of workers it has spawned;
//! acceptors compete for incoming connections on the shared listen socket,
//! which removes the single-acceptor bottleneck and bounds the blast radius
//! of any one group's failure.
//!
//! Supervision policy: an acceptor panic is restarted while the sliding
//! restart window permits, then escalates into a controlled server
//! shutdown. Worker failures never restart anything; connections are
//! disposable and the worker's own error path has already notified the
//! handler.

use crate::config::ServerConfig;
use crate::connection::{Connection, ConnectionMeta, ControlMessage};
use crate::handler::HandlerFactory;
use crate::metrics::ServerMetrics;
use crate::telemetry::{CloseReason, TelemetryEvent, TelemetrySink};
use crate::tls::TlsContext;
use crate::transport::TransportStream;
use crate::types::{ConnectionCounters, ConnectionId, WorkerState};
use crate::worker::{ConnectionWorker, WorkerConfig};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Delay before retrying a failed accept, to avoid a tight error loop
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Restart intensity for a group's acceptor
const MAX_ACCEPTOR_RESTARTS: usize = 3;
const ACCEPTOR_RESTART_WINDOW: Duration = Duration::from_secs(5);

/// State shared by every acceptor group of one server
pub(crate) struct PoolContext {
    pub config: ServerConfig,
    pub factory: Arc<dyn HandlerFactory>,
    pub tls: Option<TlsContext>,
    pub telemetry: Arc<dyn TelemetrySink>,
    pub metrics: Arc<ServerMetrics>,
    /// Raised during drain step 1; unblocks every acceptor
    pub accept_token: CancellationToken,
    /// Raised during drain step 3; delivers `on_shutdown` to live workers
    pub drain_token: CancellationToken,
    /// Escalation target: cancelling this drains the whole server
    pub shutdown: CancellationToken,
    /// Connection ID source, shared across groups so IDs are unique
    pub next_id: AtomicU64,
}

impl PoolContext {
    fn next_connection_id(&self) -> ConnectionId {
        ConnectionId::new(self.next_id.fetch_add(1, Ordering::SeqCst))
    }
}

/// A worker registered in its group's connection set
pub(crate) struct ConnectionEntry {
    control_tx: mpsc::Sender<ControlMessage>,
    abort_handle: tokio::task::AbortHandle,
    state: Arc<AtomicU8>,
    counters: Arc<ConnectionCounters>,
    started_at: Instant,
}

/// Sliding-window restart intensity tracker
pub(crate) struct RestartWindow {
    limit: usize,
    window: Duration,
    restarts: VecDeque<Instant>,
}

impl RestartWindow {
    pub(crate) fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            window,
            restarts: VecDeque::new(),
        }
    }

    /// Record a restart; returns `false` when the intensity is exceeded
    pub(crate) fn record(&mut self, now: Instant) -> bool {
        while let Some(front) = self.restarts.front() {
            if now.duration_since(*front) > self.window {
                self.restarts.pop_front();
            } else {
                break;
            }
        }
        self.restarts.push_back(now);
        self.restarts.len() <= self.limit
    }
}

/// A task that repeatedly accepts connections and spawns workers
struct Acceptor {
    ctx: Arc<PoolContext>,
    listener: Arc<TcpListener>,
    connections: Arc<DashMap<ConnectionId, ConnectionEntry>>,
    tracker: TaskTracker,
}

impl Acceptor {
    /// Accept loop; exits normally when the accept token is raised
    async fn run(self) {
        loop {
            let accepted = tokio::select! {
                _ = self.ctx.accept_token.cancelled() => break,
                res = self.listener.accept() => res,
            };

            match accepted {
                // a socket can win the race against the shutdown signal;
                // no worker may be spawned once the signal is raised
                Ok((socket, peer_addr)) if self.ctx.accept_token.is_cancelled() => {
                    tracing::debug!(%peer_addr, "dropping socket accepted during shutdown");
                    drop(socket);
                    break;
                }
                Ok((socket, peer_addr)) => self.spawn_worker(socket, peer_addr),
                Err(e) => {
                    self.ctx.metrics.accept_error();
                    self.ctx.telemetry.emit(TelemetryEvent::AcceptorError {
                        error: e.to_string(),
                    });
                    tracing::warn!(error = %e, "accept failed, retrying");
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                }
            }
        }
    }

    /// Hand an accepted socket to a fresh worker in this group
    fn spawn_worker(&self, socket: TcpStream, peer_addr: SocketAddr) {
        let local_addr = match socket.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                tracing::warn!(%peer_addr, error = %e, "dropping accepted socket");
                return;
            }
        };

        // atomic admission: acceptors in every group race for the same
        // slots, so the claim and the count must be one operation
        if !self
            .ctx
            .metrics
            .try_open_connection(self.ctx.config.max_connections as u64)
        {
            tracing::warn!(
                %peer_addr,
                limit = self.ctx.config.max_connections,
                "connection limit reached, rejecting connection"
            );
            drop(socket);
            return;
        }

        if let Err(e) = socket.set_nodelay(true) {
            tracing::debug!(%peer_addr, error = %e, "failed to set TCP_NODELAY");
        }

        let id = self.ctx.next_connection_id();
        let meta = ConnectionMeta {
            id,
            peer_addr,
            local_addr,
        };

        self.ctx.telemetry.emit(TelemetryEvent::ConnectionStart {
            remote_address: peer_addr,
            local_address: local_addr,
        });
        tracing::debug!(connection_id = %id, %peer_addr, "connection accepted");

        let (control_tx, control_rx) = mpsc::channel(self.ctx.config.mailbox_size);
        let counters = ConnectionCounters::new();
        let state = Arc::new(AtomicU8::new(WorkerState::Handshaking.as_u8()));

        let connection = Connection::new(
            TransportStream::Tcp(socket),
            meta,
            control_tx.clone(),
            counters.clone(),
            self.ctx.config.buffer_size,
        );
        let worker = ConnectionWorker::new(
            connection,
            self.ctx.factory.create(),
            WorkerConfig {
                read_timeout: self.ctx.config.read_timeout,
                handshake_timeout: self.ctx.config.handshake_timeout,
            },
            control_rx,
            self.ctx.drain_token.clone(),
            state.clone(),
            self.ctx.tls.clone(),
            self.ctx.telemetry.clone(),
            self.ctx.metrics.clone(),
        );

        // The worker waits for its registration before touching the socket,
        // so the group's connection set always sees it before the first read.
        let (ready_tx, ready_rx) = oneshot::channel::<()>();
        let connections = self.connections.clone();
        let telemetry = self.ctx.telemetry.clone();
        let metrics = self.ctx.metrics.clone();
        let worker_counters = counters.clone();
        let started_at = Instant::now();

        let handle = self.tracker.spawn(async move {
            let _ = ready_rx.await;
            let reason = worker.run().await;
            connections.remove(&id);
            let duration = started_at.elapsed();
            let bytes_in = worker_counters.bytes_in();
            let bytes_out = worker_counters.bytes_out();
            telemetry.emit(TelemetryEvent::ConnectionClose {
                duration,
                bytes_in,
                bytes_out,
                reason,
            });
            metrics.connection_closed(duration, bytes_in, bytes_out);
        });

        self.connections.insert(
            id,
            ConnectionEntry {
                control_tx,
                abort_handle: handle.abort_handle(),
                state,
                counters,
                started_at,
            },
        );
        let _ = ready_tx.send(());
    }
}

/// Supervises one acceptor and the dynamic set of workers it spawned
pub(crate) struct AcceptorGroup {
    connections: Arc<DashMap<ConnectionId, ConnectionEntry>>,
    tracker: TaskTracker,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    ctx: Arc<PoolContext>,
}

impl AcceptorGroup {
    pub(crate) fn spawn(ctx: Arc<PoolContext>, listener: Arc<TcpListener>) -> Self {
        let connections: Arc<DashMap<ConnectionId, ConnectionEntry>> = Arc::new(DashMap::new());
        let tracker = TaskTracker::new();

        let supervisor = tokio::spawn(supervise(
            ctx.clone(),
            listener,
            connections.clone(),
            tracker.clone(),
        ));

        Self {
            connections,
            tracker,
            supervisor: Mutex::new(Some(supervisor)),
            ctx,
        }
    }

    pub(crate) fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Queue a payload to every worker in this group (best effort)
    pub(crate) async fn broadcast(&self, data: &bytes::Bytes) -> usize {
        let senders: Vec<_> = self
            .connections
            .iter()
            .map(|entry| entry.control_tx.clone())
            .collect();

        let sends = senders
            .into_iter()
            .map(|tx| {
                let data = data.clone();
                async move { tx.send(ControlMessage::Send(data)).await.is_ok() }
            })
            .collect::<Vec<_>>();

        futures::future::join_all(sends)
            .await
            .into_iter()
            .filter(|ok| *ok)
            .count()
    }

    /// Wait for this group's acceptor supervisor to finish
    pub(crate) async fn wait_acceptor(&self) {
        let handle = self.supervisor.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Wait for this group's workers, then forcibly stop any stragglers
    ///
    /// Called after the drain token has been raised; the deadline is shared
    /// across groups, so the caller passes an absolute point in time.
    pub(crate) async fn drain(&self, deadline: Instant) {
        self.tracker.close();

        let budget = deadline.saturating_duration_since(Instant::now());
        if tokio::time::timeout(budget, self.tracker.wait()).await.is_ok() {
            return;
        }

        // Budget expired: brutal kill. Callbacks are not guaranteed past
        // this point; close telemetry is emitted from the shared counters.
        let ids: Vec<ConnectionId> = self.connections.iter().map(|e| *e.key()).collect();
        let mut killed = Vec::new();
        for id in ids {
            if let Some((id, entry)) = self.connections.remove(&id) {
                entry.abort_handle.abort();
                killed.push((id, entry));
            }
        }

        if !killed.is_empty() {
            tracing::warn!(
                count = killed.len(),
                "shutdown budget expired, forcibly closing connections"
            );
        }

        self.tracker.wait().await;

        for (id, entry) in killed {
            let state = WorkerState::from_u8(entry.state.load(Ordering::Acquire));
            tracing::debug!(connection_id = %id, %state, "connection forcibly closed");
            let duration = entry.started_at.elapsed();
            let bytes_in = entry.counters.bytes_in();
            let bytes_out = entry.counters.bytes_out();
            self.ctx.telemetry.emit(TelemetryEvent::ConnectionClose {
                duration,
                bytes_in,
                bytes_out,
                reason: CloseReason::Killed,
            });
            self.ctx
                .metrics
                .connection_closed(duration, bytes_in, bytes_out);
        }
    }
}

impl std::fmt::Debug for AcceptorGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcceptorGroup")
            .field("connection_count", &self.connection_count())
            .finish()
    }
}

/// Acceptor supervisor loop for one group
async fn supervise(
    ctx: Arc<PoolContext>,
    listener: Arc<TcpListener>,
    connections: Arc<DashMap<ConnectionId, ConnectionEntry>>,
    tracker: TaskTracker,
) {
    let mut window = RestartWindow::new(MAX_ACCEPTOR_RESTARTS, ACCEPTOR_RESTART_WINDOW);

    loop {
        ctx.telemetry.emit(TelemetryEvent::AcceptorStart {
            transport: ctx.config.transport.label(),
        });

        let acceptor = Acceptor {
            ctx: ctx.clone(),
            listener: listener.clone(),
            connections: connections.clone(),
            tracker: tracker.clone(),
        };

        let handle = tokio::spawn(acceptor.run());
        match handle.await {
            Ok(()) => break,
            Err(e) if e.is_panic() => {
                if window.record(Instant::now()) {
                    tracing::error!("acceptor panicked, restarting");
                    continue;
                }
                tracing::error!("acceptor restart intensity exceeded, shutting down server");
                ctx.shutdown.cancel();
                break;
            }
            Err(_) => break,
        }
    }
}

/// Fixed-size container of acceptor groups
pub(crate) struct AcceptorPool {
    groups: Vec<AcceptorGroup>,
}

impl AcceptorPool {
    /// Create `num_acceptors` groups, each with its own acceptor
    pub(crate) fn start(ctx: &Arc<PoolContext>, listener: &Arc<TcpListener>) -> Self {
        let groups = (0..ctx.config.num_acceptors)
            .map(|_| AcceptorGroup::spawn(ctx.clone(), listener.clone()))
            .collect();
        Self { groups }
    }

    pub(crate) fn connection_count(&self) -> usize {
        self.groups.iter().map(AcceptorGroup::connection_count).sum()
    }

    /// Queue a payload to every live connection (best effort); returns the
    /// number of workers that accepted it
    pub(crate) async fn broadcast(&self, data: bytes::Bytes) -> usize {
        let mut delivered = 0;
        for group in &self.groups {
            delivered += group.broadcast(&data).await;
        }
        delivered
    }

    /// Wait for every group's acceptor to exit (drain step 1)
    pub(crate) async fn wait_acceptors(&self) {
        for group in &self.groups {
            group.wait_acceptor().await;
        }
    }

    /// Drain all groups' workers within the shared budget (drain steps 2-4)
    pub(crate) async fn drain(&self, budget: Duration) {
        let deadline = Instant::now() + budget;
        let drains = self
            .groups
            .iter()
            .map(|group| group.drain(deadline))
            .collect::<Vec<_>>();
        futures::future::join_all(drains).await;
    }
}

impl std::fmt::Debug for AcceptorPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcceptorPool")
            .field("groups", &self.groups.len())
            .field("connection_count", &self.connection_count())
            .finish()
    }
}
