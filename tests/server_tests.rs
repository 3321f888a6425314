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

//! End-to-end server tests over real sockets

use async_trait::async_trait;
use bytes::Bytes;
use quayside::{
    CloseReason, Connection, ConnectionControl, ConnectionHandler, Directive, HandlerFactory,
    Message, Server, ServerConfig, ServerError, TelemetryEvent, TelemetrySink,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Telemetry sink that records every event for later inspection
#[derive(Default)]
struct CollectSink {
    events: Mutex<Vec<TelemetryEvent>>,
}

impl CollectSink {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn events(&self) -> Vec<TelemetryEvent> {
        self.events.lock().unwrap().clone()
    }

    fn count(&self, name: &str) -> usize {
        self.events()
            .iter()
            .filter(|event| event.name() == name)
            .count()
    }
}

impl TelemetrySink for CollectSink {
    fn emit(&self, event: TelemetryEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// Handler that echoes every chunk back to the peer
#[derive(Default)]
struct EchoHandler;

#[async_trait]
impl ConnectionHandler for EchoHandler {
    async fn on_data(&mut self, data: Bytes, conn: &mut Connection) -> Directive {
        match conn.send(&data).await {
            Ok(()) => Directive::Continue,
            Err(e) => Directive::Error(e),
        }
    }
}

fn echo_factory() -> Arc<dyn HandlerFactory> {
    Arc::new(|| Box::new(EchoHandler) as Box<dyn ConnectionHandler>)
}

fn test_config() -> ServerConfig {
    ServerConfig::new("127.0.0.1:0".parse().unwrap())
        .with_num_acceptors(2)
        .with_shutdown_timeout(Duration::from_secs(5))
}

async fn start_echo(config: ServerConfig) -> (Server, SocketAddr) {
    let server = Server::new(config).unwrap();
    server.start(echo_factory()).await.unwrap();
    let addr = server.local_addr().unwrap();
    (server, addr)
}

/// Poll a condition until it holds or the deadline passes
async fn wait_until(mut cond: impl FnMut() -> bool, deadline: Duration) -> bool {
    let result = timeout(deadline, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    result.is_ok()
}

#[tokio::test]
async fn test_ephemeral_port_is_resolved_and_accepting() {
    let (server, addr) = start_echo(test_config()).await;

    let info = server.listener_info().unwrap();
    assert!(info.port() > 0);
    assert_eq!(info.transport(), "tcp");

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");

    drop(client);
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_echo_no_crosstalk() {
    let (server, addr) = start_echo(test_config()).await;

    let mut client_a = TcpStream::connect(addr).await.unwrap();
    let mut client_b = TcpStream::connect(addr).await.unwrap();

    client_a.write_all(b"HELLO").await.unwrap();
    client_b.write_all(b"BONJOUR").await.unwrap();

    // read B before A; each client gets exactly its own bytes back
    let mut buf_b = [0u8; 7];
    client_b.read_exact(&mut buf_b).await.unwrap();
    assert_eq!(&buf_b, b"BONJOUR");

    let mut buf_a = [0u8; 5];
    client_a.read_exact(&mut buf_a).await.unwrap();
    assert_eq!(&buf_a, b"HELLO");

    drop(client_a);
    drop(client_b);
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_graceful_drain_refuses_new_and_serves_existing() {
    let (server, addr) = start_echo(test_config()).await;
    let server = Arc::new(server);

    let mut existing = TcpStream::connect(addr).await.unwrap();
    existing.write_all(b"warm").await.unwrap();
    let mut buf = [0u8; 4];
    existing.read_exact(&mut buf).await.unwrap();

    let stopper = {
        let server = server.clone();
        tokio::spawn(async move { server.stop().await })
    };

    // a fresh connect must fail within bounded time once drain begins
    let mut refused = false;
    for _ in 0..20 {
        match TcpStream::connect(addr).await {
            Err(_) => {
                refused = true;
                break;
            }
            Ok(conn) => {
                drop(conn);
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }
    }
    assert!(refused, "new connections should be refused during drain");

    // the existing connection keeps working through the drain window
    existing.write_all(b"HELLO").await.unwrap();
    let mut buf = [0u8; 5];
    timeout(Duration::from_secs(1), existing.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"HELLO");

    drop(existing);
    let stopped = timeout(Duration::from_secs(5), stopper).await.unwrap();
    assert!(stopped.unwrap().is_ok());
    assert_eq!(server.connection_count(), 0);
}

/// Handler that says goodbye when the server drains
struct GoodbyeHandler;

#[async_trait]
impl ConnectionHandler for GoodbyeHandler {
    async fn on_shutdown(&mut self, conn: &mut Connection) -> Directive {
        if let Err(e) = conn.send(b"GOODBYE").await {
            return Directive::Error(e);
        }
        let _ = conn.shutdown_write().await;
        Directive::Close
    }
}

#[tokio::test]
async fn test_goodbye_on_drain() {
    let server = Server::new(test_config()).unwrap();
    server
        .start(Arc::new(|| Box::new(GoodbyeHandler) as Box<dyn ConnectionHandler>))
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    let server = Arc::new(server);

    let mut client = TcpStream::connect(addr).await.unwrap();
    assert!(wait_until(|| server.connection_count() == 1, Duration::from_secs(1)).await);

    let stopper = {
        let server = server.clone();
        tokio::spawn(async move { server.stop().await })
    };

    let mut buf = [0u8; 7];
    timeout(Duration::from_secs(2), client.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"GOODBYE");

    // then EOF
    let mut rest = [0u8; 1];
    let n = timeout(Duration::from_secs(2), client.read(&mut rest))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, 0);

    assert!(timeout(Duration::from_secs(5), stopper)
        .await
        .unwrap()
        .unwrap()
        .is_ok());
}

#[tokio::test]
async fn test_shutdown_budget_forces_close() {
    let sink = CollectSink::new();
    let server = Server::new(test_config())
        .unwrap()
        .with_telemetry(sink.clone());
    // default on_shutdown keeps the connection running; the client never
    // goes away, so only the budget can end this connection
    server.start(echo_factory()).await.unwrap();
    let addr = server.local_addr().unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    assert!(wait_until(|| server.connection_count() == 1, Duration::from_secs(1)).await);

    let started = std::time::Instant::now();
    server
        .stop_with_timeout(Duration::from_millis(200))
        .await
        .unwrap();
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(server.connection_count(), 0);

    // the forced close is visible to the peer
    let mut buf = [0u8; 1];
    let read = timeout(Duration::from_secs(1), client.read(&mut buf)).await;
    match read {
        Ok(Ok(0)) | Ok(Err(_)) => {}
        other => panic!("expected EOF or reset, got {other:?}"),
    }

    let killed = sink
        .events()
        .iter()
        .filter(|event| {
            matches!(
                event,
                TelemetryEvent::ConnectionClose {
                    reason: CloseReason::Killed,
                    ..
                }
            )
        })
        .count();
    assert_eq!(killed, 1);
}

#[tokio::test]
async fn test_telemetry_listener_lifecycle() {
    let sink = CollectSink::new();
    let server = Server::new(test_config())
        .unwrap()
        .with_telemetry(sink.clone());
    server.start(echo_factory()).await.unwrap();
    let bound_port = server.listener_info().unwrap().port();
    server.stop().await.unwrap();

    let listener_events: Vec<TelemetryEvent> = sink
        .events()
        .into_iter()
        .filter(|event| event.name().starts_with("listener."))
        .collect();

    assert_eq!(listener_events.len(), 2);
    match &listener_events[0] {
        TelemetryEvent::ListenerStart { port, transport } => {
            assert_eq!(*port, bound_port);
            assert_eq!(*transport, "tcp");
        }
        other => panic!("expected listener.start first, got {other:?}"),
    }
    assert!(matches!(
        listener_events[1],
        TelemetryEvent::ListenerShutdown
    ));
}

#[tokio::test]
async fn test_connection_start_close_counts_balance() {
    let sink = CollectSink::new();
    let server = Server::new(test_config())
        .unwrap()
        .with_telemetry(sink.clone());
    server.start(echo_factory()).await.unwrap();
    let addr = server.local_addr().unwrap();

    for _ in 0..3 {
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"x").await.unwrap();
        let mut buf = [0u8; 1];
        client.read_exact(&mut buf).await.unwrap();
        drop(client);
    }

    assert!(
        wait_until(
            || sink.count("connection.close") == 3,
            Duration::from_secs(2)
        )
        .await
    );
    assert_eq!(sink.count("connection.start"), 3);

    server.stop().await.unwrap();
    assert_eq!(sink.count("connection.start"), sink.count("connection.close"));

    let metrics = server.metrics().snapshot();
    assert_eq!(metrics.total_connections, 3);
    assert_eq!(metrics.active_connections, 0);
}

/// Handler that records orderly closes and abnormal errors separately
struct CloseTrackHandler {
    closes: Arc<AtomicUsize>,
    errors: Arc<AtomicUsize>,
}

#[async_trait]
impl ConnectionHandler for CloseTrackHandler {
    async fn on_data(&mut self, data: Bytes, conn: &mut Connection) -> Directive {
        match conn.send(&data).await {
            Ok(()) => Directive::Continue,
            Err(e) => Directive::Error(e),
        }
    }

    async fn on_close(&mut self, _conn: &mut Connection) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_error(&mut self, _error: ServerError, _conn: &mut Connection) {
        self.errors.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn test_on_close_for_orderly_close_and_no_on_error() {
    let closes = Arc::new(AtomicUsize::new(0));
    let errors = Arc::new(AtomicUsize::new(0));

    let server = Server::new(test_config()).unwrap();
    let (closes_f, errors_f) = (closes.clone(), errors.clone());
    server
        .start(Arc::new(move || {
            Box::new(CloseTrackHandler {
                closes: closes_f.clone(),
                errors: errors_f.clone(),
            }) as Box<dyn ConnectionHandler>
        }))
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"bye").await.unwrap();
    let mut buf = [0u8; 3];
    client.read_exact(&mut buf).await.unwrap();
    drop(client);

    assert!(wait_until(|| closes.load(Ordering::SeqCst) == 1, Duration::from_secs(2)).await);
    assert_eq!(errors.load(Ordering::SeqCst), 0);

    server.stop().await.unwrap();
}

/// Handler that panics on the first chunk
struct PanicHandler {
    errors: Arc<AtomicUsize>,
}

#[async_trait]
impl ConnectionHandler for PanicHandler {
    async fn on_data(&mut self, _data: Bytes, _conn: &mut Connection) -> Directive {
        panic!("application bug");
    }

    async fn on_error(&mut self, error: ServerError, _conn: &mut Connection) {
        assert!(error.is_crash());
        self.errors.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn test_handler_panic_is_isolated() {
    let errors = Arc::new(AtomicUsize::new(0));

    let server = Server::new(test_config()).unwrap();
    let errors_f = errors.clone();
    server
        .start(Arc::new(move || {
            Box::new(PanicHandler {
                errors: errors_f.clone(),
            }) as Box<dyn ConnectionHandler>
        }))
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"boom").await.unwrap();

    assert!(wait_until(|| errors.load(Ordering::SeqCst) == 1, Duration::from_secs(2)).await);

    // the crash is visible to the peer as a close, and the server survives
    let mut buf = [0u8; 1];
    let n = timeout(Duration::from_secs(1), client.read(&mut buf))
        .await
        .unwrap()
        .unwrap_or(0);
    assert_eq!(n, 0);
    assert!(server.is_running());
    assert_eq!(server.metrics().snapshot().handler_panics, 1);

    server.stop().await.unwrap();
    assert_eq!(errors.load(Ordering::SeqCst), 1);
}

/// Handler that checks no two callbacks ever overlap on one connection
struct SerialHandler {
    busy: Arc<AtomicBool>,
    violated: Arc<AtomicBool>,
    control_slot: Arc<Mutex<Option<ConnectionControl>>>,
}

impl SerialHandler {
    async fn enter(&self) {
        if self.busy.swap(true, Ordering::SeqCst) {
            self.violated.store(true, Ordering::SeqCst);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    fn exit(&self) {
        self.busy.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl ConnectionHandler for SerialHandler {
    async fn on_connect(&mut self, conn: &mut Connection) -> Directive {
        *self.control_slot.lock().unwrap() = Some(conn.control());
        Directive::Continue
    }

    async fn on_data(&mut self, data: Bytes, conn: &mut Connection) -> Directive {
        self.enter().await;
        let result = conn.send(&data).await;
        self.exit();
        match result {
            Ok(()) => Directive::Continue,
            Err(e) => Directive::Error(e),
        }
    }

    async fn on_message(&mut self, _msg: Message, _conn: &mut Connection) -> Directive {
        self.enter().await;
        self.exit();
        Directive::Continue
    }
}

#[tokio::test]
async fn test_callbacks_are_serialized_per_connection() {
    let busy = Arc::new(AtomicBool::new(false));
    let violated = Arc::new(AtomicBool::new(false));
    let control_slot: Arc<Mutex<Option<ConnectionControl>>> = Arc::new(Mutex::new(None));

    let server = Server::new(test_config()).unwrap();
    let (busy_f, violated_f, slot_f) = (busy.clone(), violated.clone(), control_slot.clone());
    server
        .start(Arc::new(move || {
            Box::new(SerialHandler {
                busy: busy_f.clone(),
                violated: violated_f.clone(),
                control_slot: slot_f.clone(),
            }) as Box<dyn ConnectionHandler>
        }))
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    assert!(
        wait_until(
            || control_slot.lock().unwrap().is_some(),
            Duration::from_secs(1)
        )
        .await
    );
    let control = control_slot.lock().unwrap().clone().unwrap();

    // interleave socket writes with mailbox messages
    for i in 0..10u8 {
        client.write_all(&[i]).await.unwrap();
        control.message(Box::new(i)).await.unwrap();
    }

    let mut echoed = vec![0u8; 10];
    timeout(Duration::from_secs(5), client.read_exact(&mut echoed))
        .await
        .unwrap()
        .unwrap();

    assert!(!violated.load(Ordering::SeqCst), "callbacks overlapped");

    drop(client);
    server.stop().await.unwrap();
}

/// Second-stage handler used by the protocol-upgrade test
struct UpgradedHandler;

#[async_trait]
impl ConnectionHandler for UpgradedHandler {
    async fn on_data(&mut self, data: Bytes, conn: &mut Connection) -> Directive {
        let mut reply = b"B:".to_vec();
        reply.extend_from_slice(&data);
        match conn.send(&reply).await {
            Ok(()) => Directive::Continue,
            Err(e) => Directive::Error(e),
        }
    }
}

/// First-stage handler that switches to [`UpgradedHandler`] after one chunk
struct UpgradingHandler;

#[async_trait]
impl ConnectionHandler for UpgradingHandler {
    async fn on_data(&mut self, data: Bytes, conn: &mut Connection) -> Directive {
        let mut reply = b"A:".to_vec();
        reply.extend_from_slice(&data);
        if let Err(e) = conn.send(&reply).await {
            return Directive::Error(e);
        }
        Directive::Switch(Box::new(UpgradedHandler))
    }
}

#[tokio::test]
async fn test_switch_hands_connection_to_new_handler() {
    let server = Server::new(test_config()).unwrap();
    server
        .start(Arc::new(|| Box::new(UpgradingHandler) as Box<dyn ConnectionHandler>))
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();

    client.write_all(b"1").await.unwrap();
    let mut buf = [0u8; 3];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"A:1");

    client.write_all(b"2").await.unwrap();
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"B:2");

    drop(client);
    server.stop().await.unwrap();
}

/// Handler that arms a short read timeout and reports when it fires
struct TimeoutHandler;

#[async_trait]
impl ConnectionHandler for TimeoutHandler {
    async fn on_connect(&mut self, _conn: &mut Connection) -> Directive {
        Directive::ContinueWithTimeout(Duration::from_millis(100))
    }

    async fn on_timeout(&mut self, conn: &mut Connection) -> Directive {
        if let Err(e) = conn.send(b"TIMEOUT").await {
            return Directive::Error(e);
        }
        Directive::Close
    }
}

#[tokio::test]
async fn test_continue_with_timeout_overrides_read_timeout() {
    let server = Server::new(test_config()).unwrap();
    server
        .start(Arc::new(|| Box::new(TimeoutHandler) as Box<dyn ConnectionHandler>))
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();

    // send nothing; the overridden timeout should fire well before the
    // 60 second default
    let mut buf = [0u8; 7];
    timeout(Duration::from_secs(2), client.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"TIMEOUT");

    drop(client);
    server.stop().await.unwrap();
}

/// Handler that forwards mailbox strings to the peer
struct MailboxHandler {
    control_slot: Arc<Mutex<Option<ConnectionControl>>>,
}

#[async_trait]
impl ConnectionHandler for MailboxHandler {
    async fn on_connect(&mut self, conn: &mut Connection) -> Directive {
        *self.control_slot.lock().unwrap() = Some(conn.control());
        Directive::Continue
    }

    async fn on_message(&mut self, msg: Message, conn: &mut Connection) -> Directive {
        let Ok(text) = msg.downcast::<&'static str>() else {
            return Directive::Continue;
        };
        match conn.send(text.as_bytes()).await {
            Ok(()) => Directive::Continue,
            Err(e) => Directive::Error(e),
        }
    }
}

#[tokio::test]
async fn test_mailbox_messages_arrive_in_order() {
    let control_slot: Arc<Mutex<Option<ConnectionControl>>> = Arc::new(Mutex::new(None));

    let server = Server::new(test_config()).unwrap();
    let slot_f = control_slot.clone();
    server
        .start(Arc::new(move || {
            Box::new(MailboxHandler {
                control_slot: slot_f.clone(),
            }) as Box<dyn ConnectionHandler>
        }))
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    assert!(
        wait_until(
            || control_slot.lock().unwrap().is_some(),
            Duration::from_secs(1)
        )
        .await
    );
    let control = control_slot.lock().unwrap().clone().unwrap();

    control.message(Box::new("first")).await.unwrap();
    control.message(Box::new("second")).await.unwrap();

    let mut buf = [0u8; 11];
    timeout(Duration::from_secs(2), client.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"firstsecond");

    // the mailbox can also request an orderly close
    control.close().await.unwrap();
    let mut rest = [0u8; 1];
    let n = timeout(Duration::from_secs(2), client.read(&mut rest))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, 0);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_broadcast_reaches_all_connections() {
    let (server, addr) = start_echo(test_config()).await;

    let mut client_a = TcpStream::connect(addr).await.unwrap();
    let mut client_b = TcpStream::connect(addr).await.unwrap();
    assert!(wait_until(|| server.connection_count() == 2, Duration::from_secs(1)).await);

    let delivered = server.broadcast(Bytes::from_static(b"PING")).await;
    assert_eq!(delivered, 2);

    let mut buf = [0u8; 4];
    timeout(Duration::from_secs(2), client_a.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"PING");
    timeout(Duration::from_secs(2), client_b.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"PING");

    drop(client_a);
    drop(client_b);
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_connection_limit_drops_excess() {
    let config = test_config().with_max_connections(1);
    let (server, addr) = start_echo(config).await;

    let held = TcpStream::connect(addr).await.unwrap();
    assert!(wait_until(|| server.connection_count() == 1, Duration::from_secs(1)).await);

    // the second connect is accepted at the TCP level and immediately dropped
    let mut rejected = TcpStream::connect(addr).await.unwrap();
    let mut buf = [0u8; 1];
    let n = timeout(Duration::from_secs(2), rejected.read(&mut buf))
        .await
        .unwrap()
        .unwrap_or(0);
    assert_eq!(n, 0);

    drop(held);
    assert!(wait_until(|| server.connection_count() == 0, Duration::from_secs(2)).await);
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_two_servers_in_one_process() {
    let (server_a, addr_a) = start_echo(test_config()).await;
    let (server_b, addr_b) = start_echo(test_config()).await;
    assert_ne!(addr_a, addr_b);

    let mut client_a = TcpStream::connect(addr_a).await.unwrap();
    let mut client_b = TcpStream::connect(addr_b).await.unwrap();

    client_a.write_all(b"aa").await.unwrap();
    client_b.write_all(b"bb").await.unwrap();

    let mut buf = [0u8; 2];
    client_a.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"aa");
    client_b.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"bb");

    drop(client_a);
    drop(client_b);
    server_a.stop().await.unwrap();
    server_b.stop().await.unwrap();
}
