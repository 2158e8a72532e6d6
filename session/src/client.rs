//! Initiator session: the connecting side, with automatic reconnect.
//!
//! A [`Session`] is a cheap handle onto a driver task that owns the
//! connection, the protocol state, and the reconnect controller. Calls
//! made while no connection is open are queued and flushed in order once
//! one comes up; an explicit [`close`](Session::close) fails everything
//! still waiting.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use tether_wire::{CloseCode, HeartbeatMode, Role};

use crate::backoff::{Backoff, RetryOptions};
use crate::channel::{Channel, ChannelEvent};
use crate::endpoint::{sleep_until_maybe, Command, Delivery, Endpoint, EndpointState, Responder};
use crate::error::SessionError;
use crate::heartbeat::{HeartbeatState, TimeoutMultiplier};
use crate::negotiate::{NegotiationOutcome, SettingsChange, SupportedOptions};
use crate::policy::{classify_close, Disposition};
use crate::transport;

/// Handler for an inbound fire-and-forget message.
pub type MessageHandler = Arc<dyn Fn(Value) + Send + Sync>;
/// Handler for an inbound request; reply through the responder.
pub type RequestHandler = Arc<dyn Fn(Value, Responder) + Send + Sync>;

/// Connection behavior of an initiator session.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Deadline for one connect attempt
    pub connection_timeout: Duration,
    /// Deadline for responses, acknowledgements, and negotiation replies
    pub response_timeout: Duration,
    /// Initial heartbeat mode
    pub heartbeat_mode: HeartbeatMode,
    /// Initial heartbeat interval
    pub heartbeat_interval: Duration,
    /// Factor widening the heartbeat interval into the inactivity window
    pub heartbeat_timeout_multiplier: TimeoutMultiplier,
    /// Start connecting immediately; otherwise wait for [`Session::open`]
    pub auto_connect: bool,
    /// Reconnect backoff schedule
    pub retry: RetryOptions,
    /// Close codes outside the well-known range that still allow reconnect
    pub retryable_codes: Vec<u16>,
    /// Connection parameters presented in the open handshake
    pub params: Vec<String>,
    /// Bounds for settings requests arriving from the peer; `None` rejects
    /// them all
    pub supported_options: Option<SupportedOptions>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            connection_timeout: Duration::from_secs(60),
            response_timeout: Duration::from_secs(15),
            heartbeat_mode: HeartbeatMode::Roundtrip,
            heartbeat_interval: Duration::from_secs(1),
            heartbeat_timeout_multiplier: TimeoutMultiplier::default(),
            auto_connect: true,
            retry: RetryOptions::default(),
            retryable_codes: Vec::new(),
            params: Vec::new(),
            supported_options: None,
        }
    }
}

/// Lifecycle events of an initiator session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The connection is open and queued calls have been flushed
    Connected,
    /// The connection went away; the reconnect controller decides what
    /// happens next
    Disconnected {
        /// Close code received from the peer, when one arrived
        code: Option<CloseCode>,
        /// Close reason, possibly empty
        reason: String,
    },
    /// A failure worth surfacing: protocol violation, rejected
    /// authentication, terminal close code, or exhausted retries
    Error(SessionError),
}

/// Handle to an initiator session. Clones share the same connection.
#[derive(Clone)]
pub struct Session {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<EndpointState>,
    messages: Arc<DashMap<String, MessageHandler>>,
    requests: Arc<DashMap<String, RequestHandler>>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("state", &*self.state.borrow())
            .finish()
    }
}

impl Session {
    /// Start a session against `addr`. The driver task lives until every
    /// handle is dropped; the returned stream carries lifecycle events.
    pub fn connect(
        addr: SocketAddr,
        options: ConnectOptions,
    ) -> (Session, mpsc::UnboundedReceiver<SessionEvent>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let initial = if options.auto_connect {
            EndpointState::Connecting
        } else {
            EndpointState::Closed
        };
        let (state_tx, state_rx) = watch::channel(initial);
        let messages: Arc<DashMap<String, MessageHandler>> = Arc::new(DashMap::new());
        let requests: Arc<DashMap<String, RequestHandler>> = Arc::new(DashMap::new());

        let heartbeat = HeartbeatState::new(
            options.heartbeat_mode,
            options.heartbeat_interval,
            options.heartbeat_timeout_multiplier.clone(),
        );
        let mut endpoint = Endpoint::new(
            Role::Initiator,
            heartbeat,
            options.response_timeout,
            options.supported_options.clone(),
            command_tx.downgrade(),
        );
        endpoint.set_state(initial);

        let driver = Driver {
            addr,
            backoff: Backoff::new(options.retry.clone()),
            options,
            endpoint,
            commands: command_rx,
            events: event_tx,
            state: state_tx,
            messages: Arc::clone(&messages),
            requests: Arc::clone(&requests),
            conn: Conn::Idle,
        };
        tokio::spawn(driver.run());

        (
            Session {
                commands: command_tx,
                state: state_rx,
                messages,
                requests,
            },
            event_rx,
        )
    }

    /// Current lifecycle state.
    pub fn state(&self) -> EndpointState {
        *self.state.borrow()
    }

    /// Register the handler for a message name. Replaces any previous one.
    pub fn on_message(
        &self,
        name: impl Into<String>,
        handler: impl Fn(Value) + Send + Sync + 'static,
    ) {
        self.messages.insert(name.into(), Arc::new(handler));
    }

    /// Register the handler for a request name. Replaces any previous one.
    pub fn on_request(
        &self,
        name: impl Into<String>,
        handler: impl Fn(Value, Responder) + Send + Sync + 'static,
    ) {
        self.requests.insert(name.into(), Arc::new(handler));
    }

    /// Send a fire-and-forget message. Queued if no connection is open.
    pub fn send(&self, name: impl Into<String>, payload: Value) -> Result<(), SessionError> {
        self.commands
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
        self.commands
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
        self.commands
            .send(Command::Request {
                name: name.into(),
                payload,
                done,
            })
            .map_err(|_| SessionError::ConnectionClosed)?;
        rx.await.map_err(|_| SessionError::ConnectionClosed)?
    }

    /// Propose a settings change to the peer. A rejected change resolves
    /// with `approved: false`; only missing replies error.
    pub async fn negotiate(
        &self,
        change: SettingsChange,
    ) -> Result<NegotiationOutcome, SessionError> {
        let (done, rx) = oneshot::channel();
        self.commands
            .send(Command::Negotiate { change, done })
            .map_err(|_| SessionError::ConnectionClosed)?;
        rx.await.map_err(|_| SessionError::ConnectionClosed)?
    }

    /// Close normally. Fails queued and pending calls; no reconnect.
    pub fn close(&self) {
        self.close_with(CloseCode::Normal.as_u16(), "");
    }

    /// Close with an explicit code and reason.
    pub fn close_with(&self, code: u16, reason: &str) {
        let _ = self.commands.send(Command::Close {
            code,
            reason: reason.to_string(),
        });
    }

    /// Start connecting again after a close or with `auto_connect` off.
    /// The backoff schedule starts fresh.
    pub fn open(&self) {
        let _ = self.commands.send(Command::Open);
    }
}

enum Conn {
    Idle,
    Waiting {
        at: Instant,
    },
    Connecting {
        task: JoinHandle<io::Result<Channel>>,
        deadline: Instant,
    },
    Open {
        events: mpsc::UnboundedReceiver<ChannelEvent>,
    },
}

enum ConnPoll {
    Connected(io::Result<Channel>),
    Event(Option<ChannelEvent>),
}

async fn poll_conn(conn: &mut Conn) -> ConnPoll {
    match conn {
        Conn::Connecting { task, .. } => ConnPoll::Connected(match task.await {
            Ok(result) => result,
            Err(err) => Err(io::Error::new(io::ErrorKind::Other, err)),
        }),
        Conn::Open { events } => ConnPoll::Event(events.recv().await),
        Conn::Idle | Conn::Waiting { .. } => std::future::pending().await,
    }
}

struct Driver {
    addr: SocketAddr,
    options: ConnectOptions,
    endpoint: Endpoint,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<SessionEvent>,
    state: watch::Sender<EndpointState>,
    messages: Arc<DashMap<String, MessageHandler>>,
    requests: Arc<DashMap<String, RequestHandler>>,
    backoff: Backoff,
    conn: Conn,
}

impl Driver {
    async fn run(mut self) {
        if self.options.auto_connect {
            self.start_connect();
        }
        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    Some(Command::Close { code, reason }) => self.handle_close(code, &reason),
                    Some(Command::Open) => self.handle_open(),
                    Some(command) => self.endpoint.handle_command(command, Instant::now()),
                    None => {
                        self.teardown();
                        return;
                    }
                },

                polled = poll_conn(&mut self.conn) => match polled {
                    ConnPoll::Connected(Ok(channel)) => self.on_connected(channel),
                    ConnPoll::Connected(Err(err)) => {
                        debug!(error = %err, "connect attempt failed");
                        self.conn = Conn::Idle;
                        self.schedule_retry();
                    }
                    ConnPoll::Event(Some(event)) => self.on_channel_event(event),
                    ConnPoll::Event(None) => self.on_channel_event(ChannelEvent::Failed(
                        "channel task ended".to_string(),
                    )),
                },

                _ = sleep_until_maybe(deadline) => self.on_timers(),
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        match &self.conn {
            Conn::Waiting { at } => Some(*at),
            Conn::Connecting { deadline, .. } => Some(*deadline),
            Conn::Open { .. } => self.endpoint.next_deadline(),
            Conn::Idle => None,
        }
    }

    fn publish(&mut self, state: EndpointState) {
        self.endpoint.set_state(state);
        let _ = self.state.send(state);
    }

    fn start_connect(&mut self) {
        let addr = self.addr;
        let params = self.options.params.clone();
        let task = tokio::spawn(async move { transport::connect(addr, &params).await });
        self.conn = Conn::Connecting {
            task,
            deadline: Instant::now() + self.options.connection_timeout,
        };
        self.endpoint.set_terminal(false);
        self.publish(EndpointState::Connecting);
        debug!(peer = %self.addr, attempt = self.backoff.attempt(), "connecting");
    }

    fn on_connected(&mut self, channel: Channel) {
        let (sender, events) = channel.split();
        self.conn = Conn::Open { events };
        self.backoff.reset();
        self.endpoint.on_open(sender, Instant::now());
        self.publish(EndpointState::Open);
        info!(peer = %self.addr, "session connected");
        let _ = self.events.send(SessionEvent::Connected);
    }

    fn handle_open(&mut self) {
        if matches!(self.conn, Conn::Idle) {
            debug!("session reopen requested");
            self.backoff.reset();
            self.start_connect();
        }
    }

    fn handle_close(&mut self, code: u16, reason: &str) {
        if self.endpoint.is_terminal() {
            return;
        }
        debug!(code, "session close requested");
        self.publish(EndpointState::Closing);
        match std::mem::replace(&mut self.conn, Conn::Idle) {
            Conn::Open { events } => {
                self.endpoint.close_channel(code, reason);
                drop(events);
            }
            Conn::Connecting { task, .. } => task.abort(),
            _ => {}
        }
        self.endpoint.on_close();
        self.endpoint.fail_queued();
        self.endpoint.set_terminal(true);
        self.publish(EndpointState::Closed);
        let _ = self.events.send(SessionEvent::Disconnected {
            code: Some(CloseCode::from_u16(code)),
            reason: reason.to_string(),
        });
    }

    /// Terminal stop with no channel left to close.
    fn finalize(&mut self) {
        self.conn = Conn::Idle;
        self.endpoint.on_close();
        self.endpoint.fail_queued();
        self.endpoint.set_terminal(true);
        self.publish(EndpointState::Closed);
    }

    fn teardown(&mut self) {
        match std::mem::replace(&mut self.conn, Conn::Idle) {
            Conn::Open { .. } => {
                self.endpoint
                    .close_channel(CloseCode::Normal.as_u16(), "session dropped");
            }
            Conn::Connecting { task, .. } => task.abort(),
            _ => {}
        }
        self.endpoint.on_close();
        self.endpoint.fail_queued();
    }

    fn schedule_retry(&mut self) {
        match self.backoff.next_delay(rand::random::<f64>()) {
            Some(delay) => {
                debug!(attempt = self.backoff.attempt(), delay = ?delay, "reconnect scheduled");
                self.conn = Conn::Waiting {
                    at: Instant::now() + delay,
                };
                self.publish(EndpointState::Connecting);
            }
            None => {
                warn!("reconnect attempts exhausted");
                let _ = self.events.send(SessionEvent::Error(SessionError::Channel(
                    "reconnect attempts exhausted".to_string(),
                )));
                self.finalize();
            }
        }
    }

    fn on_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Received(bytes) => {
                match self.endpoint.on_received(bytes, Instant::now()) {
                    Ok(Some(delivery)) => self.deliver(delivery),
                    Ok(None) => {}
                    Err(err) => self.on_protocol_violation(err),
                }
            }
            ChannelEvent::Closed { code, reason } => self.on_closed(code, reason),
            ChannelEvent::Failed(message) => {
                warn!(error = %message, "channel failed");
                let _ = self
                    .events
                    .send(SessionEvent::Error(SessionError::Channel(message.clone())));
                self.conn = Conn::Idle;
                self.endpoint.on_close();
                let _ = self.events.send(SessionEvent::Disconnected {
                    code: None,
                    reason: message,
                });
                self.schedule_retry();
            }
        }
    }

    /// The peer spoke something unparseable. That rules the connection
    /// out entirely, including reconnecting to it.
    fn on_protocol_violation(&mut self, err: SessionError) {
        warn!(error = %err, "protocol violation; closing connection");
        let _ = self.events.send(SessionEvent::Error(err));
        self.endpoint
            .close_channel(CloseCode::ProtocolError.as_u16(), "malformed packet");
        self.conn = Conn::Idle;
        self.endpoint.on_close();
        self.endpoint.fail_queued();
        self.endpoint.set_terminal(true);
        self.publish(EndpointState::Closed);
        let _ = self.events.send(SessionEvent::Disconnected {
            code: Some(CloseCode::ProtocolError),
            reason: "malformed packet".to_string(),
        });
    }

    fn on_closed(&mut self, code: Option<u16>, reason: String) {
        info!(code = ?code, reason = %reason, "connection closed");
        self.conn = Conn::Idle;
        self.endpoint.on_close();
        let _ = self.events.send(SessionEvent::Disconnected {
            code: code.map(CloseCode::from_u16),
            reason,
        });
        match classify_close(code, &self.options.retryable_codes) {
            Disposition::Retry => self.schedule_retry(),
            Disposition::Stop => self.finalize(),
            Disposition::StopWithError(err) => {
                let _ = self.events.send(SessionEvent::Error(err));
                self.finalize();
            }
        }
    }

    fn on_timers(&mut self) {
        let now = Instant::now();
        if let Conn::Waiting { at } = &self.conn {
            if *at <= now {
                self.start_connect();
            }
            return;
        }
        if let Conn::Connecting { deadline, .. } = &self.conn {
            if *deadline <= now {
                if let Conn::Connecting { task, .. } =
                    std::mem::replace(&mut self.conn, Conn::Idle)
                {
                    task.abort();
                }
                debug!("connect attempt timed out");
                self.schedule_retry();
            }
            return;
        }
        if matches!(self.conn, Conn::Open { .. }) && self.endpoint.on_timer(now) {
            self.on_liveness_expired();
        }
    }

    fn on_liveness_expired(&mut self) {
        info!("peer inactive past deadline; closing connection");
        self.publish(EndpointState::Closing);
        self.endpoint
            .close_channel(CloseCode::Normal.as_u16(), "heartbeat timeout");
        self.conn = Conn::Idle;
        self.endpoint.on_close();
        let _ = self.events.send(SessionEvent::Disconnected {
            code: None,
            reason: "heartbeat timeout".to_string(),
        });
        self.schedule_retry();
    }

    fn deliver(&mut self, delivery: Delivery) {
        match delivery {
            Delivery::Message { name, payload } => {
                let handler = self.messages.get(&name).map(|entry| Arc::clone(entry.value()));
                match handler {
                    Some(handler) => handler(payload),
                    None => debug!(name = %name, "no handler for message"),
                }
            }
            Delivery::Request {
                name,
                payload,
                responder,
            } => {
                let handler = self.requests.get(&name).map(|entry| Arc::clone(entry.value()));
                match handler {
                    Some(handler) => handler(payload, responder),
                    None => debug!(name = %name, "no handler for request; peer will time out"),
                }
            }
        }
    }
}
