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

//! The listen socket
//!
//! Exactly one `Listener` exists per running server. Acceptors share the
//! bound socket by reference; the `Listener` itself is dropped during drain
//! step 1, at which point the OS refuses further connects.

use crate::error::{Result, ServerError};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Facts about the bound listen socket
#[derive(Debug, Clone, Copy)]
pub struct ListenerInfo {
    local_addr: SocketAddr,
    transport: &'static str,
}

impl ListenerInfo {
    /// Actual bound address (resolved for ephemeral binds)
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Actual bound port
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Transport label (`tcp` or `tls`)
    pub fn transport(&self) -> &'static str {
        self.transport
    }
}

/// The bound listen socket, owned by the server while it runs
pub(crate) struct Listener {
    inner: Arc<TcpListener>,
    info: ListenerInfo,
}

impl Listener {
    /// Bind and mark the socket listenable; port `0` picks an ephemeral port
    pub(crate) async fn bind(addr: SocketAddr, transport: &'static str) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ServerError::Bind { addr, source })?;

        Ok(Self {
            inner: Arc::new(listener),
            info: ListenerInfo {
                local_addr,
                transport,
            },
        })
    }

    /// Shared handle for acceptors
    pub(crate) fn socket(&self) -> Arc<TcpListener> {
        self.inner.clone()
    }

    pub(crate) fn info(&self) -> ListenerInfo {
        self.info
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("local_addr", &self.info.local_addr)
            .field("transport", &self.info.transport)
            .finish()
    }
}
