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

//! Core types shared across the server

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Identifies one connection for the life of its server; IDs count up
/// from 1 and are never reused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Create a new connection ID
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the underlying u64 value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Worker lifecycle state, representable as a u8 so it can live in an
/// atomic shared with the worker's group entry
///
/// A worker moves strictly forward through these states; `Errored` is the
/// abnormal exit from `Handshaking` or `Running`, and both paths end in
/// `Terminated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    /// Transport handshake in progress (a no-op for cleartext)
    Handshaking = 0,
    /// Handler callbacks are being dispatched
    Running = 1,
    /// Orderly close in progress
    Closing = 2,
    /// Abnormal termination in progress
    Errored = 3,
    /// Worker has finished; the socket is released
    Terminated = 4,
}

impl WorkerState {
    /// Convert from u8 (for atomic operations)
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Handshaking,
            1 => Self::Running,
            2 => Self::Closing,
            3 => Self::Errored,
            _ => Self::Terminated,
        }
    }

    /// Convert to u8 (for atomic operations)
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Check if the worker is in a terminal or terminating state
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closing | Self::Errored | Self::Terminated)
    }

    /// Check if the worker is still serving its connection
    pub fn is_active(self) -> bool {
        matches!(self, Self::Handshaking | Self::Running)
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Handshaking => write!(f, "handshaking"),
            Self::Running => write!(f, "running"),
            Self::Closing => write!(f, "closing"),
            Self::Errored => write!(f, "errored"),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}

/// Per-connection byte counters
///
/// Shared between the worker (which updates them) and its group entry, so
/// the close telemetry can be emitted even for a worker that had to be
/// forcibly stopped at the shutdown boundary.
#[derive(Debug, Default)]
pub struct ConnectionCounters {
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
}

impl ConnectionCounters {
    /// Create a zeroed counter pair behind an `Arc`
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Record bytes read from the peer
    pub fn add_in(&self, count: u64) {
        self.bytes_in.fetch_add(count, Ordering::Relaxed);
    }

    /// Record bytes written to the peer
    pub fn add_out(&self, count: u64) {
        self.bytes_out.fetch_add(count, Ordering::Relaxed);
    }

    /// Total bytes read from the peer
    pub fn bytes_in(&self) -> u64 {
        self.bytes_in.load(Ordering::Relaxed)
    }

    /// Total bytes written to the peer
    pub fn bytes_out(&self) -> u64 {
        self.bytes_out.load(Ordering::Relaxed)
    }
}
