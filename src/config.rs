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

//! Server configuration
//!
//! All options are plain values fixed at startup. Use the builder pattern
//! methods to customize the configuration; `validate()` runs automatically
//! when the server is created.
//!
//! # Example
//!
//! ```
//! use quayside::ServerConfig;
//! use std::time::Duration;
//!
//! let config = ServerConfig::default()
//!     .with_port(0)
//!     .with_num_acceptors(4)
//!     .with_read_timeout(Duration::from_secs(30));
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Server configuration
///
/// The handler factory and telemetry sink are passed to the
/// [`Server`](crate::Server) directly; everything that is a plain value
/// lives here.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the listen socket to; port `0` picks an ephemeral port
    pub bind_address: SocketAddr,

    /// Transport the server speaks on accepted connections
    pub transport: TransportConfig,

    /// Number of acceptor groups competing for incoming connections
    pub num_acceptors: usize,

    /// Default timeout applied to each read
    ///
    /// A handler can override the next read's timeout with
    /// [`Directive::ContinueWithTimeout`](crate::Directive::ContinueWithTimeout).
    pub read_timeout: Duration,

    /// Bound on the transport handshake
    ///
    /// Keeps a peer that stalls mid-TLS-handshake from pinning a worker.
    pub handshake_timeout: Duration,

    /// Drain budget for graceful shutdown
    ///
    /// Connections still alive when the budget expires are forcibly closed.
    pub shutdown_timeout: Duration,

    /// Read buffer capacity per connection
    pub buffer_size: usize,

    /// Mailbox capacity per connection worker
    pub mailbox_size: usize,

    /// Maximum number of concurrent connections
    ///
    /// Accepted sockets over the limit are dropped immediately.
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:4000".parse().unwrap(),
            transport: TransportConfig::Tcp,
            num_acceptors: 10,
            read_timeout: Duration::from_secs(60),
            handshake_timeout: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(15),
            buffer_size: 8192,
            mailbox_size: 64,
            max_connections: 1024,
        }
    }
}

impl ServerConfig {
    /// Create a new configuration with the given bind address
    ///
    /// All other settings use their default values.
    pub fn new(bind_address: SocketAddr) -> Self {
        Self {
            bind_address,
            ..Default::default()
        }
    }

    /// Set the bind address
    pub fn with_bind_address(mut self, addr: SocketAddr) -> Self {
        self.bind_address = addr;
        self
    }

    /// Set the port, keeping the configured interface
    pub fn with_port(mut self, port: u16) -> Self {
        self.bind_address.set_port(port);
        self
    }

    /// Set the transport
    pub fn with_transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }

    /// Set the number of acceptor groups
    pub fn with_num_acceptors(mut self, count: usize) -> Self {
        self.num_acceptors = count;
        self
    }

    /// Set the default per-read timeout
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Set the handshake timeout
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Set the shutdown drain budget
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Set the per-connection read buffer capacity
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Set the per-worker mailbox capacity
    pub fn with_mailbox_size(mut self, size: usize) -> Self {
        self.mailbox_size = size;
        self
    }

    /// Set the maximum number of concurrent connections
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Validate the configuration
    ///
    /// Returns an error message if the configuration is invalid.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.num_acceptors == 0 {
            return Err("num_acceptors must be greater than 0".to_string());
        }

        if self.max_connections == 0 {
            return Err("max_connections must be greater than 0".to_string());
        }

        if self.buffer_size == 0 {
            return Err("buffer_size must be greater than 0".to_string());
        }

        if self.mailbox_size == 0 {
            return Err("mailbox_size must be greater than 0".to_string());
        }

        if self.read_timeout.is_zero() {
            return Err("read_timeout must be greater than 0".to_string());
        }

        if self.handshake_timeout.is_zero() {
            return Err("handshake_timeout must be greater than 0".to_string());
        }

        if self.shutdown_timeout.is_zero() {
            return Err("shutdown_timeout must be greater than 0".to_string());
        }

        Ok(())
    }
}

/// Transport selection for accepted connections
#[derive(Debug, Clone, Default)]
pub enum TransportConfig {
    /// Plain TCP
    #[default]
    Tcp,
    /// TLS over TCP
    Tls(TlsConfig),
}

impl TransportConfig {
    /// Short label used in logs and telemetry metadata
    pub fn label(&self) -> &'static str {
        match self {
            TransportConfig::Tcp => "tcp",
            TransportConfig::Tls(_) => "tls",
        }
    }
}

/// TLS transport options
#[derive(Debug, Clone)]
pub struct TlsConfig {
    /// Path to the PEM-encoded certificate chain (leaf first)
    pub cert_path: PathBuf,

    /// Path to the PEM-encoded private key
    pub key_path: PathBuf,

    /// ALPN protocols to advertise, in preference order
    pub alpn_protocols: Vec<Vec<u8>>,
}

impl TlsConfig {
    /// Create a TLS configuration from certificate and key paths
    pub fn new(cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
            alpn_protocols: Vec::new(),
        }
    }

    /// Set the ALPN protocols to advertise
    pub fn with_alpn_protocols(mut self, protocols: Vec<Vec<u8>>) -> Self {
        self.alpn_protocols = protocols;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_address.port(), 4000);
        assert_eq!(config.num_acceptors, 10);
        assert_eq!(config.read_timeout, Duration::from_secs(60));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(15));
        assert_eq!(config.transport.label(), "tcp");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_pattern() {
        let config = ServerConfig::default()
            .with_port(0)
            .with_num_acceptors(2)
            .with_read_timeout(Duration::from_millis(250))
            .with_max_connections(16);

        assert_eq!(config.bind_address.port(), 0);
        assert_eq!(config.num_acceptors, 2);
        assert_eq!(config.read_timeout, Duration::from_millis(250));
        assert_eq!(config.max_connections, 16);
    }

    #[test]
    fn test_validation() {
        let mut config = ServerConfig::default();
        assert!(config.validate().is_ok());

        config.num_acceptors = 0;
        assert!(config.validate().is_err());

        config.num_acceptors = 10;
        config.read_timeout = Duration::ZERO;
        assert!(config.validate().is_err());

        config.read_timeout = Duration::from_secs(60);
        config.mailbox_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_tls_config() {
        let tls = TlsConfig::new("cert.pem", "key.pem")
            .with_alpn_protocols(vec![b"h2".to_vec(), b"http/1.1".to_vec()]);
        assert_eq!(tls.alpn_protocols.len(), 2);

        let config = ServerConfig::default().with_transport(TransportConfig::Tls(tls));
        assert_eq!(config.transport.label(), "tls");
    }
}
