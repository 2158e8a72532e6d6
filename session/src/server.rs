//! Acceptor side: a listener that speaks the session protocol with every
//! connected peer.
//!
//! A [`Server`] accepts connections, runs the open handshake, and hands
//! each peer to its own driver task. Peers show up in the event stream
//! and in the registry as [`Peer`] handles, which carry the same call
//! surface as the initiator [`Session`](crate::client::Session) plus an
//! application context slot. Unlike the initiator there is no reconnect
//! machinery: when a connection ends the peer is gone, and it is the
//! initiator's job to come back.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use tether_wire::{CloseCode, HeartbeatMode, Role};

use crate::channel::ChannelEvent;
use crate::endpoint::{sleep_until_maybe, Command, Delivery, Endpoint, EndpointState, Responder};
use crate::error::SessionError;
use crate::heartbeat::{HeartbeatState, TimeoutMultiplier};
use crate::negotiate::{NegotiationOutcome, SettingsChange, SupportedOptions};
use crate::transport;

/// Handler for a fire-and-forget message from a peer.
pub type PeerMessageHandler<Ctx> = Arc<dyn Fn(&Peer<Ctx>, Value) + Send + Sync>;
/// Handler for a request from a peer; reply through the responder.
pub type PeerRequestHandler<Ctx> = Arc<dyn Fn(&Peer<Ctx>, Value, Responder) + Send + Sync>;

/// Protocol behavior applied to every accepted connection.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Deadline for responses, acknowledgements, and negotiation replies
    pub response_timeout: Duration,
    /// Heartbeat mode for new connections, until negotiated otherwise
    pub heartbeat_mode: HeartbeatMode,
    /// Heartbeat interval for new connections
    pub heartbeat_interval: Duration,
    /// Factor widening the heartbeat interval into the inactivity window
    pub heartbeat_timeout_multiplier: TimeoutMultiplier,
    /// Bounds applied to settings requests arriving from peers
    pub supported_options: SupportedOptions,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(15),
            heartbeat_mode: HeartbeatMode::Roundtrip,
            heartbeat_interval: Duration::from_secs(1),
            heartbeat_timeout_multiplier: TimeoutMultiplier::default(),
            supported_options: SupportedOptions::default(),
        }
    }
}

/// Registry key for one accepted connection. Unique per server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(u64);

impl PeerId {
    /// The raw counter value.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct PeerInner<Ctx> {
    id: PeerId,
    addr: SocketAddr,
    params: Vec<String>,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<EndpointState>,
    context: RwLock<Option<Ctx>>,
}

/// Handle to one connected peer. Clones share the connection, so a peer
/// can be held in handlers, the registry, and application state at once.
///
/// `Ctx` is an application slot, typically filled during authentication
/// and read back when later traffic from the same peer arrives.
pub struct Peer<Ctx = ()> {
    inner: Arc<PeerInner<Ctx>>,
}

impl<Ctx> Clone for Peer<Ctx> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<Ctx> fmt::Debug for Peer<Ctx> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.inner.id)
            .field("addr", &self.inner.addr)
            .finish()
    }
}

impl<Ctx> Peer<Ctx> {
    /// Registry key of this peer.
    pub fn id(&self) -> PeerId {
        self.inner.id
    }

    /// Remote socket address.
    pub fn addr(&self) -> SocketAddr {
        self.inner.addr
    }

    /// Connection parameters the peer presented in the open handshake.
    pub fn params(&self) -> &[String] {
        &self.inner.params
    }

    /// Current lifecycle state.
    pub fn state(&self) -> EndpointState {
        *self.inner.state.borrow()
    }

    /// Send a fire-and-forget message.
    pub fn send(&self, name: impl Into<String>, payload: Value) -> Result<(), SessionError> {
        self.inner
            .commands
            .send(Command::Send {
                name: name.into(),
                payload,
            })
            .map_err(|_| SessionError::ConnectionClosed)
    }

    /// Send a message and resolve once the peer confirms delivery.
    pub async fn send_with_ack(
        &self,
        name: impl Into<String>,
        payload: Value,
    ) -> Result<(), SessionError> {
        let (done, rx) = oneshot::channel();
        self.inner
            .commands
            .send(Command::SendWithAck {
                name: name.into(),
                payload,
                done,
            })
            .map_err(|_| SessionError::ConnectionClosed)?;
        rx.await.map_err(|_| SessionError::ConnectionClosed)?
    }

    /// Send a request and resolve with the peer's response payload.
    pub async fn request(
        &self,
        name: impl Into<String>,
        payload: Value,
    ) -> Result<Value, SessionError> {
        let (done, rx) = oneshot::channel();
        self.inner
            .commands
            .send(Command::Request {
                name: name.into(),
                payload,
                done,
            })
            .map_err(|_| SessionError::ConnectionClosed)?;
        rx.await.map_err(|_| SessionError::ConnectionClosed)?
    }

    /// Propose a settings change to the peer.
    pub async fn negotiate(
        &self,
        change: SettingsChange,
    ) -> Result<NegotiationOutcome, SessionError> {
        let (done, rx) = oneshot::channel();
        self.inner
            .commands
            .send(Command::Negotiate { change, done })
            .map_err(|_| SessionError::ConnectionClosed)?;
        rx.await.map_err(|_| SessionError::ConnectionClosed)?
    }

    /// Close the connection normally.
    pub fn close(&self) {
        self.close_with(CloseCode::Normal.as_u16(), "");
    }

    /// Close the connection with an explicit code and reason.
    pub fn close_with(&self, code: u16, reason: &str) {
        let _ = self.inner.commands.send(Command::Close {
            code,
            reason: reason.to_string(),
        });
    }

    /// Store the application context, replacing any previous one.
    pub fn set_context(&self, context: Ctx) {
        *self.write_context() = Some(context);
    }

    /// Remove and return the application context.
    pub fn take_context(&self) -> Option<Ctx> {
        self.write_context().take()
    }

    /// Read the application context in place. Returns `None` when no
    /// context has been stored.
    pub fn with_context<R>(&self, read: impl FnOnce(&Ctx) -> R) -> Option<R> {
        match self.inner.context.read() {
            Ok(guard) => guard.as_ref().map(read),
            Err(poisoned) => poisoned.into_inner().as_ref().map(read),
        }
    }

    fn write_context(&self) -> std::sync::RwLockWriteGuard<'_, Option<Ctx>> {
        match self.inner.context.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Connection lifecycle events of a server.
#[derive(Debug)]
pub enum ServerEvent<Ctx = ()> {
    /// A peer completed the open handshake and is ready for traffic
    Connected(Peer<Ctx>),
    /// A peer's connection ended; the peer has left the registry
    Disconnected {
        /// The departed peer; calls on it now fail
        peer: Peer<Ctx>,
        /// Close code, when the close was orderly
        code: Option<CloseCode>,
        /// Close reason, possibly empty
        reason: String,
    },
}

struct ServerShared<Ctx> {
    options: ServerOptions,
    local_addr: SocketAddr,
    peers: DashMap<PeerId, Peer<Ctx>>,
    messages: DashMap<String, PeerMessageHandler<Ctx>>,
    requests: DashMap<String, PeerRequestHandler<Ctx>>,
    next_peer_id: AtomicU64,
    shutdown: watch::Sender<bool>,
}

/// Handle to a listening server. Clones share the listener and registry.
pub struct Server<Ctx = ()> {
    shared: Arc<ServerShared<Ctx>>,
}

impl<Ctx> Clone for Server<Ctx> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<Ctx> fmt::Debug for Server<Ctx> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.shared.local_addr)
            .field("peers", &self.shared.peers.len())
            .finish()
    }
}

impl<Ctx: Send + Sync + 'static> Server<Ctx> {
    /// Bind a listener and start accepting connections. The returned
    /// stream carries connect and disconnect events; the listener runs
    /// until [`shutdown`](Server::shutdown) is called.
    pub async fn bind(
        addr: SocketAddr,
        options: ServerOptions,
    ) -> io::Result<(Self, mpsc::UnboundedReceiver<ServerEvent<Ctx>>)> {
        let listener = transport::listen(addr).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(ServerShared {
            options,
            local_addr,
            peers: DashMap::new(),
            messages: DashMap::new(),
            requests: DashMap::new(),
            next_peer_id: AtomicU64::new(1),
            shutdown,
        });
        tokio::spawn(accept_loop(
            listener,
            Arc::clone(&shared),
            event_tx,
            shutdown_rx,
        ));
        Ok((Server { shared }, event_rx))
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    /// Register the handler for a message name. Replaces any previous one.
    pub fn on_message(
        &self,
        name: impl Into<String>,
        handler: impl Fn(&Peer<Ctx>, Value) + Send + Sync + 'static,
    ) {
        self.shared.messages.insert(name.into(), Arc::new(handler));
    }

    /// Register the handler for a request name. Replaces any previous one.
    pub fn on_request(
        &self,
        name: impl Into<String>,
        handler: impl Fn(&Peer<Ctx>, Value, Responder) + Send + Sync + 'static,
    ) {
        self.shared.requests.insert(name.into(), Arc::new(handler));
    }

    /// Look up a connected peer by id.
    pub fn get(&self, id: PeerId) -> Option<Peer<Ctx>> {
        self.shared.peers.get(&id).map(|entry| entry.value().clone())
    }

    /// Snapshot of every connected peer.
    pub fn peers(&self) -> Vec<Peer<Ctx>> {
        self.shared
            .peers
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Number of connected peers.
    pub fn len(&self) -> usize {
        self.shared.peers.len()
    }

    /// Whether no peers are connected.
    pub fn is_empty(&self) -> bool {
        self.shared.peers.is_empty()
    }

    /// Stop accepting connections and close every connected peer with
    /// the given code.
    pub fn shutdown(&self, code: u16, reason: &str) {
        info!(code, "server shutting down");
        let _ = self.shared.shutdown.send(true);
        for entry in self.shared.peers.iter() {
            entry.value().close_with(code, reason);
        }
    }
}

async fn accept_loop<Ctx: Send + Sync + 'static>(
    listener: TcpListener,
    shared: Arc<ServerShared<Ctx>>,
    events: mpsc::UnboundedSender<ServerEvent<Ctx>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;

            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    debug!("listener stopping");
                    return;
                }
            }

            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    tokio::spawn(serve_connection(
                        stream,
                        addr,
                        Arc::clone(&shared),
                        events.clone(),
                    ));
                }
                Err(err) => warn!(error = %err, "accept failed"),
            },
        }
    }
}

async fn serve_connection<Ctx: Send + Sync + 'static>(
    stream: TcpStream,
    addr: SocketAddr,
    shared: Arc<ServerShared<Ctx>>,
    events: mpsc::UnboundedSender<ServerEvent<Ctx>>,
) {
    let (channel, params) = match transport::accept(stream).await {
        Ok(accepted) => accepted,
        Err(err) => {
            debug!(peer = %addr, error = %err, "handshake failed");
            return;
        }
    };

    let id = PeerId(shared.next_peer_id.fetch_add(1, Ordering::Relaxed));
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (state_tx, state_rx) = watch::channel(EndpointState::Open);
    let peer = Peer {
        inner: Arc::new(PeerInner {
            id,
            addr,
            params,
            commands: command_tx.clone(),
            state: state_rx,
            context: RwLock::new(None),
        }),
    };

    let heartbeat = HeartbeatState::new(
        shared.options.heartbeat_mode,
        shared.options.heartbeat_interval,
        shared.options.heartbeat_timeout_multiplier.clone(),
    );
    let mut endpoint = Endpoint::new(
        Role::Acceptor,
        heartbeat,
        shared.options.response_timeout,
        Some(shared.options.supported_options.clone()),
        command_tx.downgrade(),
    );
    let (sender, channel_events) = channel.split();
    endpoint.on_open(sender, Instant::now());

    shared.peers.insert(id, peer.clone());
    info!(peer = %addr, id = %id, "connection accepted");
    let _ = events.send(ServerEvent::Connected(peer.clone()));

    let driver = ConnDriver {
        endpoint,
        commands: command_rx,
        channel: channel_events,
        state: state_tx,
        peer: peer.clone(),
        shared: Arc::clone(&shared),
    };
    let outcome = driver.run().await;

    shared.peers.remove(&id);
    info!(peer = %addr, id = %id, code = ?outcome.code, "connection ended");
    let _ = events.send(ServerEvent::Disconnected {
        peer,
        code: outcome.code,
        reason: outcome.reason,
    });
}

struct ConnOutcome {
    code: Option<CloseCode>,
    reason: String,
}

/// Drives one accepted connection until it ends, one task per peer.
struct ConnDriver<Ctx> {
    endpoint: Endpoint,
    commands: mpsc::UnboundedReceiver<Command>,
    channel: mpsc::UnboundedReceiver<ChannelEvent>,
    state: watch::Sender<EndpointState>,
    peer: Peer<Ctx>,
    shared: Arc<ServerShared<Ctx>>,
}

impl<Ctx: Send + Sync + 'static> ConnDriver<Ctx> {
    async fn run(mut self) -> ConnOutcome {
        loop {
            let deadline = self.endpoint.next_deadline();
            tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    Some(Command::Close { code, reason }) => {
                        debug!(peer = %self.peer.id(), code, "peer close requested");
                        self.endpoint.close_channel(code, &reason);
                        return self.finish(Some(CloseCode::from_u16(code)), reason);
                    }
                    Some(Command::Open) => debug!("open command reached acceptor; dropped"),
                    Some(command) => self.endpoint.handle_command(command, Instant::now()),
                    None => {
                        self.endpoint.close_channel(CloseCode::Normal.as_u16(), "");
                        return self.finish(Some(CloseCode::Normal), String::new());
                    }
                },

                event = self.channel.recv() => match event {
                    Some(ChannelEvent::Received(bytes)) => {
                        match self.endpoint.on_received(bytes, Instant::now()) {
                            Ok(Some(delivery)) => self.deliver(delivery),
                            Ok(None) => {}
                            Err(err) => {
                                warn!(
                                    peer = %self.peer.id(),
                                    error = %err,
                                    "protocol violation; closing connection",
                                );
                                self.endpoint.close_channel(
                                    CloseCode::ProtocolError.as_u16(),
                                    "malformed packet",
                                );
                                return self.finish(
                                    Some(CloseCode::ProtocolError),
                                    "malformed packet".to_string(),
                                );
                            }
                        }
                    }
                    Some(ChannelEvent::Closed { code, reason }) => {
                        return self.finish(code.map(CloseCode::from_u16), reason);
                    }
                    other => {
                        let message = match other {
                            Some(ChannelEvent::Failed(message)) => message,
                            _ => "channel task ended".to_string(),
                        };
                        warn!(peer = %self.peer.id(), error = %message, "channel failed");
                        return self.finish(None, message);
                    }
                },

                _ = sleep_until_maybe(deadline) => {
                    if self.endpoint.on_timer(Instant::now()) {
                        info!(peer = %self.peer.id(), "peer inactive past deadline; closing connection");
                        self.endpoint
                            .close_channel(CloseCode::Normal.as_u16(), "heartbeat timeout");
                        return self.finish(None, "heartbeat timeout".to_string());
                    }
                }
            }
        }
    }

    fn finish(&mut self, code: Option<CloseCode>, reason: String) -> ConnOutcome {
        self.endpoint.on_close();
        self.endpoint.fail_queued();
        self.endpoint.set_terminal(true);
        self.endpoint.set_state(EndpointState::Closed);
        let _ = self.state.send(EndpointState::Closed);
        ConnOutcome { code, reason }
    }

    fn deliver(&mut self, delivery: Delivery) {
        match delivery {
            Delivery::Message { name, payload } => {
                let handler = self
                    .shared
                    .messages
                    .get(&name)
                    .map(|entry| Arc::clone(entry.value()));
                match handler {
                    Some(handler) => handler(&self.peer, payload),
                    None => debug!(name = %name, "no handler for message"),
                }
            }
            Delivery::Request {
                name,
                payload,
                responder,
            } => {
                let handler = self
                    .shared
                    .requests
                    .get(&name)
                    .map(|entry| Arc::clone(entry.value()));
                match handler {
                    Some(handler) => handler(&self.peer, payload, responder),
                    None => debug!(name = %name, "no handler for request; peer will time out"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use tether_wire::{encode_params, ChannelFrame};

    use crate::backoff::RetryOptions;
    use crate::client::{ConnectOptions, Session, SessionEvent};

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    fn fast_retry() -> RetryOptions {
        RetryOptions {
            min_timeout: Duration::from_millis(25),
            max_timeout: Duration::from_millis(100),
            randomize: false,
            ..RetryOptions::default()
        }
    }

    async fn next_session_event(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> SessionEvent {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for session event")
            .expect("session event stream ended")
    }

    async fn next_server_event<Ctx>(
        events: &mut mpsc::UnboundedReceiver<ServerEvent<Ctx>>,
    ) -> ServerEvent<Ctx> {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for server event")
            .expect("server event stream ended")
    }

    async fn connected_peer<Ctx>(
        events: &mut mpsc::UnboundedReceiver<ServerEvent<Ctx>>,
    ) -> Peer<Ctx> {
        match next_server_event(events).await {
            ServerEvent::Connected(peer) => peer,
            ServerEvent::Disconnected { code, reason, .. } => {
                panic!("expected connect, got disconnect: {code:?} {reason:?}")
            }
        }
    }

    /// Read and discard one length-prefixed frame from a raw socket.
    async fn read_frame(stream: &mut TcpStream) {
        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf).await.unwrap();
        let mut body = vec![0u8; u32::from_be_bytes(len_buf) as usize];
        stream.read_exact(&mut body).await.unwrap();
    }

    #[test]
    fn test_default_options() {
        let options = ServerOptions::default();
        assert_eq!(options.response_timeout, Duration::from_secs(15));
        assert_eq!(options.heartbeat_mode, HeartbeatMode::Roundtrip);
        assert_eq!(options.heartbeat_interval, Duration::from_secs(1));
        assert_eq!(
            options.supported_options.heartbeat_modes,
            vec![HeartbeatMode::Roundtrip]
        );
    }

    #[tokio::test]
    async fn test_request_round_trip_both_directions() {
        let (server, mut server_events) =
            Server::<()>::bind(loopback(), ServerOptions::default()).await.unwrap();
        server.on_request("sum", |_, payload, responder| {
            let total: i64 = payload
                .as_array()
                .map(|items| items.iter().filter_map(Value::as_i64).sum())
                .unwrap_or(0);
            responder.respond(json!(total));
        });

        let (session, mut session_events) =
            Session::connect(server.local_addr(), ConnectOptions::default());
        session.on_request("echo", |payload, responder| responder.respond(payload));
        let (tick_tx, mut tick_rx) = mpsc::unbounded_channel();
        session.on_message("tick", move |payload| {
            let _ = tick_tx.send(payload);
        });

        assert_eq!(next_session_event(&mut session_events).await, SessionEvent::Connected);
        let peer = connected_peer(&mut server_events).await;
        assert_eq!(server.len(), 1);
        assert_eq!(server.get(peer.id()).map(|p| p.id()), Some(peer.id()));

        let total = session.request("sum", json!([1, 2, 3])).await.unwrap();
        assert_eq!(total, json!(6));

        let echoed = peer.request("echo", json!({"k": "v"})).await.unwrap();
        assert_eq!(echoed, json!({"k": "v"}));

        peer.send("tick", json!(9)).unwrap();
        let tick = tokio::time::timeout(Duration::from_secs(5), tick_rx.recv())
            .await
            .expect("timed out waiting for message")
            .expect("collector closed");
        assert_eq!(tick, json!(9));

        session.close();
    }

    #[tokio::test]
    async fn test_acknowledged_sends_both_directions() {
        let (server, mut server_events) =
            Server::<()>::bind(loopback(), ServerOptions::default()).await.unwrap();
        let (note_tx, mut note_rx) = mpsc::unbounded_channel();
        server.on_message("note", move |_, payload| {
            let _ = note_tx.send(payload);
        });

        let (session, mut session_events) =
            Session::connect(server.local_addr(), ConnectOptions::default());
        assert_eq!(next_session_event(&mut session_events).await, SessionEvent::Connected);
        let peer = connected_peer(&mut server_events).await;

        session.send_with_ack("note", json!(1)).await.unwrap();
        assert_eq!(note_rx.recv().await, Some(json!(1)));

        // Delivery is confirmed by the protocol layer even when nothing
        // handles the name.
        session.send_with_ack("unhandled", json!(2)).await.unwrap();
        peer.send_with_ack("also-unhandled", json!(3)).await.unwrap();

        session.close();
    }

    #[tokio::test]
    async fn test_handshake_params_and_context() {
        let (server, mut server_events) =
            Server::<String>::bind(loopback(), ServerOptions::default()).await.unwrap();

        let (_session, mut session_events) = Session::connect(
            server.local_addr(),
            ConnectOptions {
                params: vec!["token-1".to_string(), "console".to_string()],
                ..ConnectOptions::default()
            },
        );
        assert_eq!(next_session_event(&mut session_events).await, SessionEvent::Connected);

        let peer = connected_peer(&mut server_events).await;
        assert_eq!(peer.params(), ["token-1", "console"]);
        assert_eq!(peer.state(), EndpointState::Open);

        peer.set_context("alice".to_string());
        assert_eq!(peer.with_context(|name| name.clone()), Some("alice".to_string()));
        assert_eq!(peer.take_context(), Some("alice".to_string()));
        assert_eq!(peer.with_context(|name| name.clone()), None);
    }

    #[tokio::test]
    async fn test_server_close_is_terminal_for_client() {
        let (server, mut server_events) =
            Server::<()>::bind(loopback(), ServerOptions::default()).await.unwrap();

        let (session, mut session_events) = Session::connect(
            server.local_addr(),
            ConnectOptions {
                retry: fast_retry(),
                ..ConnectOptions::default()
            },
        );
        assert_eq!(next_session_event(&mut session_events).await, SessionEvent::Connected);
        let peer = connected_peer(&mut server_events).await;

        peer.close_with(CloseCode::Normal.as_u16(), "done");

        assert_eq!(
            next_session_event(&mut session_events).await,
            SessionEvent::Disconnected {
                code: Some(CloseCode::Normal),
                reason: "done".to_string(),
            }
        );

        // A normal close is final: no reconnect attempt may follow.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(session_events.try_recv().is_err());
        assert_eq!(session.state(), EndpointState::Closed);

        match next_server_event(&mut server_events).await {
            ServerEvent::Disconnected { code, reason, .. } => {
                assert_eq!(code, Some(CloseCode::Normal));
                assert_eq!(reason, "done");
            }
            other => panic!("expected disconnect, got {other:?}"),
        }
        assert!(server.is_empty());
    }

    #[tokio::test]
    async fn test_abnormal_loss_triggers_reconnect() {
        let listener = TcpListener::bind(loopback()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            // First connection vanishes after the handshake, without a
            // close frame; the second is held open.
            let (mut first, _) = listener.accept().await.unwrap();
            read_frame(&mut first).await;
            drop(first);
            let (mut second, _) = listener.accept().await.unwrap();
            read_frame(&mut second).await;
            std::future::pending::<()>().await;
        });

        let (session, mut events) = Session::connect(
            addr,
            ConnectOptions {
                heartbeat_mode: HeartbeatMode::Disabled,
                retry: fast_retry(),
                ..ConnectOptions::default()
            },
        );

        assert_eq!(next_session_event(&mut events).await, SessionEvent::Connected);
        assert_eq!(
            next_session_event(&mut events).await,
            SessionEvent::Disconnected {
                code: None,
                reason: "connection lost".to_string(),
            }
        );
        assert_eq!(next_session_event(&mut events).await, SessionEvent::Connected);
        assert_eq!(session.state(), EndpointState::Open);
    }

    #[tokio::test]
    async fn test_heartbeat_expiry_disconnects_once_then_reconnects() {
        let listener = TcpListener::bind(loopback()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            // Accept and stay silent so the initiator's liveness window
            // lapses; keep sockets alive to rule out EOF-driven closes.
            let mut held = Vec::new();
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                read_frame(&mut stream).await;
                held.push(stream);
            }
        });

        let (_session, mut events) = Session::connect(
            addr,
            ConnectOptions {
                heartbeat_mode: HeartbeatMode::Roundtrip,
                heartbeat_interval: Duration::from_millis(100),
                heartbeat_timeout_multiplier: TimeoutMultiplier::Fixed(2.0),
                retry: fast_retry(),
                ..ConnectOptions::default()
            },
        );

        assert_eq!(next_session_event(&mut events).await, SessionEvent::Connected);
        assert_eq!(
            next_session_event(&mut events).await,
            SessionEvent::Disconnected {
                code: None,
                reason: "heartbeat timeout".to_string(),
            }
        );
        // Exactly one disconnect per expiry; the next event is the
        // reconnect coming up.
        assert_eq!(next_session_event(&mut events).await, SessionEvent::Connected);
    }

    #[tokio::test]
    async fn test_server_expires_silent_peer() {
        let (server, mut server_events) = Server::<()>::bind(
            loopback(),
            ServerOptions {
                heartbeat_interval: Duration::from_millis(100),
                heartbeat_timeout_multiplier: TimeoutMultiplier::Fixed(2.0),
                ..ServerOptions::default()
            },
        )
        .await
        .unwrap();

        // A disabled-heartbeat client never sends anything on its own.
        let (session, mut session_events) = Session::connect(
            server.local_addr(),
            ConnectOptions {
                heartbeat_mode: HeartbeatMode::Disabled,
                ..ConnectOptions::default()
            },
        );
        assert_eq!(next_session_event(&mut session_events).await, SessionEvent::Connected);
        let _peer = connected_peer(&mut server_events).await;

        match next_server_event(&mut server_events).await {
            ServerEvent::Disconnected { code, reason, .. } => {
                assert_eq!(code, None);
                assert_eq!(reason, "heartbeat timeout");
            }
            other => panic!("expected disconnect, got {other:?}"),
        }
        assert!(server.is_empty());

        // The peer closed with a normal code, so the client stops.
        assert_eq!(
            next_session_event(&mut session_events).await,
            SessionEvent::Disconnected {
                code: Some(CloseCode::Normal),
                reason: "heartbeat timeout".to_string(),
            }
        );
        drop(session);
    }

    #[tokio::test]
    async fn test_negotiation_applies_and_rejects() {
        let (server, mut server_events) = Server::<()>::bind(
            loopback(),
            ServerOptions {
                supported_options: SupportedOptions {
                    heartbeat_modes: vec![HeartbeatMode::Roundtrip, HeartbeatMode::Upstream],
                    min_interval: Duration::from_millis(100),
                    max_interval: Duration::from_secs(3),
                },
                ..ServerOptions::default()
            },
        )
        .await
        .unwrap();

        let (session, mut session_events) =
            Session::connect(server.local_addr(), ConnectOptions::default());
        assert_eq!(next_session_event(&mut session_events).await, SessionEvent::Connected);
        let _peer = connected_peer(&mut server_events).await;

        let approved = session
            .negotiate(SettingsChange {
                heartbeat_interval: Some(Duration::from_secs(2)),
                ..SettingsChange::default()
            })
            .await
            .unwrap();
        assert!(approved.approved);
        assert!(approved.supported.is_some());

        let mode_change = session
            .negotiate(SettingsChange {
                heartbeat_mode: Some(HeartbeatMode::Upstream),
                ..SettingsChange::default()
            })
            .await
            .unwrap();
        assert!(mode_change.approved);

        let rejected = session
            .negotiate(SettingsChange {
                heartbeat_interval: Some(Duration::from_secs(5)),
                ..SettingsChange::default()
            })
            .await
            .unwrap();
        assert!(!rejected.approved);
        let supported = rejected.supported.expect("rejection carries bounds");
        assert_eq!(supported.max_interval, Duration::from_secs(3));
        assert!(supported.heartbeat_modes.contains(&HeartbeatMode::Roundtrip));

        session.close();
    }

    #[tokio::test]
    async fn test_policy_violation_close_reports_auth_rejected() {
        let (server, mut server_events) =
            Server::<()>::bind(loopback(), ServerOptions::default()).await.unwrap();

        let (session, mut session_events) = Session::connect(
            server.local_addr(),
            ConnectOptions {
                retry: fast_retry(),
                ..ConnectOptions::default()
            },
        );
        assert_eq!(next_session_event(&mut session_events).await, SessionEvent::Connected);

        let peer = connected_peer(&mut server_events).await;
        peer.close_with(CloseCode::PolicyViolation.as_u16(), "denied");

        assert_eq!(
            next_session_event(&mut session_events).await,
            SessionEvent::Disconnected {
                code: Some(CloseCode::PolicyViolation),
                reason: "denied".to_string(),
            }
        );
        assert_eq!(
            next_session_event(&mut session_events).await,
            SessionEvent::Error(SessionError::AuthenticationRejected)
        );

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(session_events.try_recv().is_err());
        assert_eq!(session.state(), EndpointState::Closed);
        drop(server);
    }

    #[tokio::test]
    async fn test_shutdown_closes_all_peers() {
        let (server, mut server_events) =
            Server::<()>::bind(loopback(), ServerOptions::default()).await.unwrap();

        let (session_a, mut events_a) =
            Session::connect(server.local_addr(), ConnectOptions::default());
        assert_eq!(next_session_event(&mut events_a).await, SessionEvent::Connected);
        let _peer_a = connected_peer(&mut server_events).await;

        let (session_b, mut events_b) =
            Session::connect(server.local_addr(), ConnectOptions::default());
        assert_eq!(next_session_event(&mut events_b).await, SessionEvent::Connected);
        let _peer_b = connected_peer(&mut server_events).await;
        assert_eq!(server.len(), 2);

        server.shutdown(CloseCode::GoingAway.as_u16(), "maintenance");

        for events in [&mut events_a, &mut events_b] {
            assert_eq!(
                next_session_event(events).await,
                SessionEvent::Disconnected {
                    code: Some(CloseCode::GoingAway),
                    reason: "maintenance".to_string(),
                }
            );
        }

        tokio::time::timeout(Duration::from_secs(2), async {
            while !server.is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("peers never drained");

        assert_eq!(session_a.state(), EndpointState::Closed);
        assert_eq!(session_b.state(), EndpointState::Closed);
    }

    #[tokio::test]
    async fn test_calls_made_before_open_flush_in_order() {
        let (server, mut server_events) =
            Server::<()>::bind(loopback(), ServerOptions::default()).await.unwrap();
        let (note_tx, mut note_rx) = mpsc::unbounded_channel();
        server.on_message("note", move |_, payload| {
            let _ = note_tx.send(payload);
        });

        let (session, mut session_events) = Session::connect(
            server.local_addr(),
            ConnectOptions {
                auto_connect: false,
                ..ConnectOptions::default()
            },
        );
        assert_eq!(session.state(), EndpointState::Closed);

        session.send("note", json!(1)).unwrap();
        session.send("note", json!(2)).unwrap();
        session.send("note", json!(3)).unwrap();
        session.open();

        assert_eq!(next_session_event(&mut session_events).await, SessionEvent::Connected);
        let _peer = connected_peer(&mut server_events).await;

        for expected in 1..=3 {
            let note = tokio::time::timeout(Duration::from_secs(5), note_rx.recv())
                .await
                .expect("timed out waiting for note")
                .expect("collector closed");
            assert_eq!(note, json!(expected));
        }
    }

    #[tokio::test]
    async fn test_concurrent_requests_resolve_independently() {
        let (server, mut server_events) =
            Server::<()>::bind(loopback(), ServerOptions::default()).await.unwrap();
        server.on_request("delay", |_, payload, responder| {
            tokio::spawn(async move {
                let millis = payload.as_u64().unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(millis)).await;
                responder.respond(payload);
            });
        });

        let (session, mut session_events) =
            Session::connect(server.local_addr(), ConnectOptions::default());
        assert_eq!(next_session_event(&mut session_events).await, SessionEvent::Connected);
        let _peer = connected_peer(&mut server_events).await;

        // The slower call was issued first; each response must still land
        // on its own caller.
        let (slow, fast) = tokio::join!(
            session.request("delay", json!(80)),
            session.request("delay", json!(0)),
        );
        assert_eq!(slow.unwrap(), json!(80));
        assert_eq!(fast.unwrap(), json!(0));

        session.close();
    }

    #[tokio::test]
    async fn test_malformed_text_closes_connection() {
        let (server, mut server_events) =
            Server::<()>::bind(loopback(), ServerOptions::default()).await.unwrap();

        let mut raw = TcpStream::connect(server.local_addr()).await.unwrap();
        let open = ChannelFrame::Open(encode_params(&[])).encode().unwrap();
        raw.write_all(&open).await.unwrap();

        let _peer = connected_peer(&mut server_events).await;

        let garbage = ChannelFrame::Text("{not json".to_string()).encode().unwrap();
        raw.write_all(&garbage).await.unwrap();

        match next_server_event(&mut server_events).await {
            ServerEvent::Disconnected { code, reason, .. } => {
                assert_eq!(code, Some(CloseCode::ProtocolError));
                assert_eq!(reason, "malformed packet");
            }
            other => panic!("expected disconnect, got {other:?}"),
        }
        assert!(server.is_empty());
    }
}
