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

//! Handler traits and continuation directives
//!
//! An application implements [`ConnectionHandler`] to define per-connection
//! behaviour, and hands the server a [`HandlerFactory`] that mints a fresh
//! handler instance for each accepted connection. Per-connection state is
//! simply the handler instance's own fields; the framework threads
//! `&mut self` through every callback and never inspects it.
//!
//! Each callback returns a [`Directive`] telling the worker what to do
//! next. Callbacks on one connection are invoked strictly serially; no two
//! callbacks ever overlap.
//!
//! # Example
//!
//! ```no_run
//! use quayside::{Connection, ConnectionHandler, Directive};
//! use async_trait::async_trait;
//! use bytes::Bytes;
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
//! ```

use crate::connection::{Connection, Message};
use crate::error::ServerError;
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

/// What the worker should do after a handler callback returns
pub enum Directive {
    /// Remain in the receive loop; the next read uses the default timeout
    Continue,
    /// Remain in the receive loop; the next read uses the given timeout
    ContinueWithTimeout(Duration),
    /// Hand this connection off to a different handler (protocol upgrade)
    Switch(Box<dyn ConnectionHandler>),
    /// Perform an orderly close
    Close,
    /// Terminate abnormally; the worker invokes `on_error` with this error
    Error(ServerError),
}

impl std::fmt::Debug for Directive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Directive::Continue => write!(f, "Continue"),
            Directive::ContinueWithTimeout(d) => write!(f, "ContinueWithTimeout({d:?})"),
            Directive::Switch(_) => write!(f, "Switch(..)"),
            Directive::Close => write!(f, "Close"),
            Directive::Error(e) => write!(f, "Error({e})"),
        }
    }
}

/// Per-connection event handler
///
/// All methods have default implementations, so a handler only implements
/// the callbacks it cares about. The handler instance is created by a
/// [`HandlerFactory`] after the worker owns the socket and the transport
/// handshake (if any) has completed.
#[async_trait]
pub trait ConnectionHandler: Send + 'static {
    /// Called once when the connection is ready, before any data is read
    async fn on_connect(&mut self, _conn: &mut Connection) -> Directive {
        Directive::Continue
    }

    /// Called for each non-empty read
    async fn on_data(&mut self, _data: Bytes, _conn: &mut Connection) -> Directive {
        Directive::Continue
    }

    /// Called when a read times out
    ///
    /// The default closes the connection.
    async fn on_timeout(&mut self, _conn: &mut Connection) -> Directive {
        Directive::Close
    }

    /// Called for each message delivered to the worker's mailbox
    async fn on_message(&mut self, _msg: Message, _conn: &mut Connection) -> Directive {
        Directive::Continue
    }

    /// Called once when the server begins draining and this connection is
    /// still alive
    ///
    /// This is the handler's opportunity to say goodbye. The default keeps
    /// the connection running until it finishes naturally or the drain
    /// budget expires.
    async fn on_shutdown(&mut self, _conn: &mut Connection) -> Directive {
        Directive::Continue
    }

    /// Called when the peer closed the connection in an orderly fashion
    async fn on_close(&mut self, _conn: &mut Connection) {}

    /// Called exactly once for any abnormal termination (handshake failure,
    /// transport error, handler crash, `Directive::Error`)
    async fn on_error(&mut self, _error: ServerError, _conn: &mut Connection) {}
}

/// Factory that creates one handler instance per accepted connection
///
/// Any `Fn() -> Box<dyn ConnectionHandler>` closure works as a factory;
/// application options are whatever the closure captures.
///
/// ```no_run
/// # use quayside::{ConnectionHandler, HandlerFactory};
/// # use std::sync::Arc;
/// # #[derive(Default)]
/// # struct Echo;
/// # #[async_trait::async_trait]
/// # impl ConnectionHandler for Echo {}
/// let factory: Arc<dyn HandlerFactory> =
///     Arc::new(|| Box::new(Echo::default()) as Box<dyn ConnectionHandler>);
/// ```
pub trait HandlerFactory: Send + Sync + 'static {
    /// Create a handler for a new connection
    fn create(&self) -> Box<dyn ConnectionHandler>;
}

impl<F> HandlerFactory for F
where
    F: Fn() -> Box<dyn ConnectionHandler> + Send + Sync + 'static,
{
    fn create(&self) -> Box<dyn ConnectionHandler> {
        (self)()
    }
}
