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

//! Aggregate server counters
//!
//! Everything here is a plain atomic, updated inline from acceptors and
//! workers. The active-connection counter doubles as the admission gate:
//! acceptors claim a slot through [`ServerMetrics::try_open_connection`]
//! before a worker exists, which keeps the configured connection limit
//! exact even with many acceptors racing on one listen socket.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Atomic counters covering the lifetime of one server
///
/// Shared behind an `Arc` with every acceptor and worker; reads never
/// block writers. [`ServerMetrics::snapshot`] collects the current values
/// into one plain struct for reporting.
#[derive(Debug)]
pub struct ServerMetrics {
    // Connection counts
    total_connections: AtomicU64,
    active_connections: AtomicU64,

    // Throughput
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,

    // Errors
    accept_errors: AtomicU64,
    handshake_errors: AtomicU64,
    transport_errors: AtomicU64,
    timeout_errors: AtomicU64,
    handler_panics: AtomicU64,

    // Timing (stored as nanoseconds)
    total_connection_duration_ns: AtomicU64,

    // Server start time
    started_at: Instant,
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerMetrics {
    /// Create a zeroed metrics instance
    pub fn new() -> Self {
        Self {
            total_connections: AtomicU64::new(0),
            active_connections: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            accept_errors: AtomicU64::new(0),
            handshake_errors: AtomicU64::new(0),
            transport_errors: AtomicU64::new(0),
            timeout_errors: AtomicU64::new(0),
            handler_panics: AtomicU64::new(0),
            total_connection_duration_ns: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    // Connection tracking

    /// Claim a connection slot, failing once `limit` slots are taken
    ///
    /// The claim is atomic: the counter is bumped first and rolled back if
    /// the limit was already reached, so concurrent acceptors can never
    /// admit more than `limit` connections between them. A successful
    /// claim must be released later through `connection_closed`.
    pub fn try_open_connection(&self, limit: u64) -> bool {
        let previous = self.active_connections.fetch_add(1, Ordering::SeqCst);
        if previous >= limit {
            self.active_connections.fetch_sub(1, Ordering::SeqCst);
            return false;
        }
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Release a connection slot and fold in the connection's totals
    pub fn connection_closed(&self, duration: Duration, bytes_in: u64, bytes_out: u64) {
        self.active_connections.fetch_sub(1, Ordering::SeqCst);
        self.bytes_received.fetch_add(bytes_in, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes_out, Ordering::Relaxed);
        self.total_connection_duration_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
    }

    /// Current number of live connections
    pub fn active_connections(&self) -> u64 {
        self.active_connections.load(Ordering::SeqCst)
    }

    /// Connections admitted since the server started
    pub fn total_connections(&self) -> u64 {
        self.total_connections.load(Ordering::Relaxed)
    }

    // Error tracking

    /// Count a failed accept attempt
    pub fn accept_error(&self) {
        self.accept_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a failed transport handshake
    pub fn handshake_error(&self) {
        self.handshake_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a mid-connection transport error
    pub fn transport_error(&self) {
        self.transport_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a read timeout
    pub fn timeout_error(&self) {
        self.timeout_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a handler panic
    pub fn handler_panic(&self) {
        self.handler_panics.fetch_add(1, Ordering::Relaxed);
    }

    // Snapshot

    /// Collect the current counter values into one struct
    ///
    /// Individual loads are not fenced against each other, so a snapshot
    /// taken while connections churn can be momentarily inconsistent
    /// between fields; that is fine for the reporting it feeds.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::SeqCst),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            accept_errors: self.accept_errors.load(Ordering::Relaxed),
            handshake_errors: self.handshake_errors.load(Ordering::Relaxed),
            transport_errors: self.transport_errors.load(Ordering::Relaxed),
            timeout_errors: self.timeout_errors.load(Ordering::Relaxed),
            handler_panics: self.handler_panics.load(Ordering::Relaxed),
            uptime: self.started_at.elapsed(),
            avg_connection_duration: self.average_connection_duration(),
        }
    }

    /// Mean lifetime of the connections that have finished
    ///
    /// Durations are recorded only at close, so the mean divides by the
    /// closed count, not the admitted count.
    fn average_connection_duration(&self) -> Duration {
        let total = self.total_connections.load(Ordering::Relaxed);
        let active = self.active_connections.load(Ordering::SeqCst);
        let closed = total.saturating_sub(active);
        if closed == 0 {
            return Duration::ZERO;
        }
        let total_ns = self.total_connection_duration_ns.load(Ordering::Relaxed);
        Duration::from_nanos(total_ns / closed)
    }
}

/// Counter values captured at one point in time
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    /// Connections admitted since the server started
    pub total_connections: u64,
    /// Live connections at capture time
    pub active_connections: u64,
    /// Total bytes sent
    pub bytes_sent: u64,
    /// Total bytes received
    pub bytes_received: u64,
    /// Failed accept attempts
    pub accept_errors: u64,
    /// Failed transport handshakes
    pub handshake_errors: u64,
    /// Mid-connection transport errors
    pub transport_errors: u64,
    /// Read timeouts
    pub timeout_errors: u64,
    /// Handler panics
    pub handler_panics: u64,
    /// Server uptime
    pub uptime: Duration,
    /// Mean lifetime of closed connections
    pub avg_connection_duration: Duration,
}

impl MetricsSnapshot {
    /// Sum of every error counter
    pub fn total_errors(&self) -> u64 {
        self.accept_errors
            + self.handshake_errors
            + self.transport_errors
            + self.timeout_errors
            + self.handler_panics
    }
}
