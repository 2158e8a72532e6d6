//! Per-connection protocol core shared by both roles.
//!
//! An [`Endpoint`] owns everything one connection needs to speak the
//! protocol: the pending-transaction table, the heartbeat schedule, and
//! the queue of calls made before the channel opened. It is driven from a
//! single task by the initiator's reconnect loop or the acceptor's
//! per-connection loop, which is what keeps handler execution serial per
//! connection.

use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use tether_wire::{
    acknowledgement, decode_inbound, heartbeat, negotiate_reply, negotiate_request, Inbound,
    NegotiateBody, NegotiateReply, NegotiateRequest, Packet, PacketBuilder, Role, RouteId,
};

use crate::channel::ChannelSender;
use crate::error::SessionError;
use crate::heartbeat::HeartbeatState;
use crate::negotiate::{NegotiationOutcome, SettingsChange, SupportedOptions};
use crate::transaction::{Completion, TransactionTable, TxnId};

/// Sleep until `deadline`, or forever when there is none. Drivers park
/// their timer arm on this.
pub(crate) async fn sleep_until_maybe(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Lifecycle of one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    /// No open channel; calls queue up
    Connecting,
    /// Channel open, traffic flowing
    Open,
    /// Close requested, channel going down
    Closing,
    /// Closed for good; calls fail
    Closed,
}

/// Commands from public handles into the task driving an endpoint.
pub(crate) enum Command {
    Send {
        name: String,
        payload: Value,
    },
    SendWithAck {
        name: String,
        payload: Value,
        done: oneshot::Sender<Result<(), SessionError>>,
    },
    Request {
        name: String,
        payload: Value,
        done: oneshot::Sender<Result<Value, SessionError>>,
    },
    Negotiate {
        change: SettingsChange,
        done: oneshot::Sender<Result<NegotiationOutcome, SessionError>>,
    },
    Respond {
        name: String,
        id: RouteId,
        payload: Value,
        ack: Option<oneshot::Sender<Result<(), SessionError>>>,
    },
    Close {
        code: u16,
        reason: String,
    },
    Open,
}

impl Command {
    /// Fail whichever caller is waiting on this command, if any.
    pub(crate) fn fail(self, error: SessionError) {
        match self {
            Command::SendWithAck { done, .. } => {
                let _ = done.send(Err(error));
            }
            Command::Request { done, .. } => {
                let _ = done.send(Err(error));
            }
            Command::Negotiate { done, .. } => {
                let _ = done.send(Err(error));
            }
            Command::Respond { ack: Some(done), .. } => {
                let _ = done.send(Err(error));
            }
            _ => {}
        }
    }
}

/// Application-facing work produced by inbound dispatch.
pub(crate) enum Delivery {
    /// Fire-and-forget message for a named handler
    Message { name: String, payload: Value },
    /// Request for a named handler; answer through the responder
    Request {
        name: String,
        payload: Value,
        responder: Responder,
    },
}

/// Replies to one inbound request.
///
/// Consuming it sends the response; dropping it leaves the peer to its
/// response timeout. May be moved to any task.
#[derive(Debug)]
pub struct Responder {
    name: String,
    id: RouteId,
    commands: mpsc::UnboundedSender<Command>,
}

impl Responder {
    /// Send the response payload.
    pub fn respond(self, payload: Value) {
        let _ = self.commands.send(Command::Respond {
            name: self.name,
            id: self.id,
            payload,
            ack: None,
        });
    }

    /// Send the response and resolve once the peer acknowledges receipt.
    pub async fn respond_with_ack(self, payload: Value) -> Result<(), SessionError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Respond {
                name: self.name,
                id: self.id,
                payload,
                ack: Some(tx),
            })
            .map_err(|_| SessionError::ConnectionClosed)?;
        rx.await.map_err(|_| SessionError::ConnectionClosed)?
    }
}

/// Protocol state for one connection.
pub(crate) struct Endpoint {
    role: Role,
    state: EndpointState,
    terminal: bool,
    sender: Option<ChannelSender>,
    heartbeat: HeartbeatState,
    table: TransactionTable,
    queue: VecDeque<Command>,
    response_timeout: Duration,
    supported: Option<SupportedOptions>,
    commands: mpsc::WeakUnboundedSender<Command>,
}

impl Endpoint {
    /// `supported` decides whether inbound settings requests can ever be
    /// approved; `None` rejects them all. `commands` is held weakly so an
    /// endpoint never keeps its own driver's command queue alive.
    pub fn new(
        role: Role,
        heartbeat: HeartbeatState,
        response_timeout: Duration,
        supported: Option<SupportedOptions>,
        commands: mpsc::WeakUnboundedSender<Command>,
    ) -> Self {
        Self {
            role,
            state: EndpointState::Connecting,
            terminal: false,
            sender: None,
            heartbeat,
            table: TransactionTable::new(),
            queue: VecDeque::new(),
            response_timeout,
            supported,
            commands,
        }
    }

    pub fn state(&self) -> EndpointState {
        self.state
    }

    pub fn set_state(&mut self, state: EndpointState) {
        self.state = state;
    }

    /// Once terminal, new calls fail instead of queueing. Cleared when a
    /// fresh connect cycle starts.
    pub fn set_terminal(&mut self, terminal: bool) {
        self.terminal = terminal;
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal
    }

    /// The channel came up: start heartbeats and flush every queued call
    /// in arrival order. Deadlines for the flushed calls start now.
    pub fn on_open(&mut self, sender: ChannelSender, now: Instant) {
        self.sender = Some(sender);
        self.state = EndpointState::Open;
        self.heartbeat.start(now);
        let queued: Vec<Command> = self.queue.drain(..).collect();
        for command in queued {
            self.handle_command(command, now);
        }
    }

    /// The channel is gone: stop heartbeats and fail everything pending.
    /// Queued calls survive for the next open.
    pub fn on_close(&mut self) {
        self.sender = None;
        self.heartbeat.stop();
        self.table.fail_all(SessionError::ConnectionClosed);
    }

    /// Fail the deferred-call queue; used when the endpoint will never
    /// open again.
    pub fn fail_queued(&mut self) {
        for command in self.queue.drain(..) {
            command.fail(SessionError::ConnectionClosed);
        }
    }

    /// Ask the transport to close. Safe to call with no channel attached.
    pub fn close_channel(&mut self, code: u16, reason: &str) {
        if let Some(sender) = &self.sender {
            sender.close(code, reason);
        }
    }

    /// Handle one application command. Anything but open/close queues
    /// while no channel is attached, unless the endpoint is terminal.
    pub fn handle_command(&mut self, command: Command, now: Instant) {
        if self.terminal {
            command.fail(SessionError::ConnectionClosed);
            return;
        }
        if self.state != EndpointState::Open {
            match command {
                Command::Close { .. } | Command::Open => {
                    debug!("lifecycle command reached endpoint; dropped")
                }
                other => self.queue.push_back(other),
            }
            return;
        }
        let deadline = now + self.response_timeout;
        match command {
            Command::Send { name, payload } => {
                self.send_packet(PacketBuilder::message(name).payload(payload).build());
            }
            Command::SendWithAck {
                name,
                payload,
                done,
            } => {
                let id = self.mint_tag();
                self.table
                    .register(TxnId::Opaque(id.clone()), Completion::Ack(done), deadline);
                self.send_packet(
                    PacketBuilder::message(name)
                        .payload(payload)
                        .ack_request(id)
                        .build(),
                );
            }
            Command::Request {
                name,
                payload,
                done,
            } => {
                let id = self.mint_route();
                self.table.register(
                    TxnId::from(id.clone()),
                    Completion::Response(done),
                    deadline,
                );
                self.send_packet(PacketBuilder::request(name, id).payload(payload).build());
            }
            Command::Negotiate { change, done } => {
                let id = self.mint_tag();
                let request = change.into_request(id.clone());
                self.table.register(
                    TxnId::Opaque(id),
                    Completion::Negotiation {
                        requested: request.clone(),
                        done,
                    },
                    deadline,
                );
                match negotiate_request(&request) {
                    Ok(packet) => self.send_packet(packet),
                    Err(err) => warn!(error = %err, "failed to build settings request"),
                }
            }
            Command::Respond {
                name,
                id,
                payload,
                ack,
            } => {
                let mut builder = PacketBuilder::response(name, id).payload(payload);
                if let Some(done) = ack {
                    let ack_id = self.mint_tag();
                    builder = builder.ack_request(ack_id.clone());
                    self.table
                        .register(TxnId::Opaque(ack_id), Completion::Ack(done), deadline);
                }
                self.send_packet(builder.build());
            }
            Command::Close { .. } | Command::Open => {
                debug!("lifecycle command reached endpoint; dropped")
            }
        }
    }

    /// Handle one inbound channel payload.
    ///
    /// Empty and non-text payloads are ignored. Undecodable text is a
    /// protocol error and fatal for the connection; the caller closes it.
    pub fn on_received(
        &mut self,
        bytes: Bytes,
        now: Instant,
    ) -> Result<Option<Delivery>, SessionError> {
        self.heartbeat.mark_active(now);
        if bytes.is_empty() {
            trace!("ignoring empty frame");
            return Ok(None);
        }
        let Ok(text) = std::str::from_utf8(&bytes) else {
            trace!("ignoring non-text frame");
            return Ok(None);
        };
        let inbound = decode_inbound(text, self.role)?;
        Ok(self.dispatch(inbound, now))
    }

    fn dispatch(&mut self, inbound: Inbound, now: Instant) -> Option<Delivery> {
        match inbound {
            Inbound::Heartbeat => None,
            Inbound::HeartbeatRequest => {
                if self.heartbeat.permits_reply() {
                    self.send_packet(heartbeat());
                }
                None
            }
            Inbound::Message {
                name,
                payload,
                ack_request,
            } => {
                if let Some(id) = ack_request {
                    self.send_packet(acknowledgement(id));
                }
                Some(Delivery::Message { name, payload })
            }
            Inbound::Request { id, name, payload } => {
                let Some(commands) = self.commands.upgrade() else {
                    debug!(name = %name, "request arrived during teardown; dropped");
                    return None;
                };
                let responder = Responder {
                    name: name.clone(),
                    id,
                    commands,
                };
                Some(Delivery::Request {
                    name,
                    payload,
                    responder,
                })
            }
            Inbound::Response {
                id,
                payload,
                ack_request,
            } => {
                if let Some(ack) = ack_request {
                    self.send_packet(acknowledgement(ack));
                }
                let key = TxnId::from(id);
                if !self.table.complete_response(&key, payload) {
                    debug!(id = %key, "response for unknown transaction dropped");
                }
                None
            }
            Inbound::Acknowledgement { id } => {
                let key = TxnId::Opaque(id);
                if !self.table.complete_ack(&key) {
                    debug!(id = %key, "acknowledgement for unknown transaction dropped");
                }
                None
            }
            Inbound::Negotiate(body) => {
                self.handle_negotiate(body, now);
                None
            }
        }
    }

    fn handle_negotiate(&mut self, body: NegotiateBody, now: Instant) {
        match body {
            NegotiateBody::Request(request) => {
                let approve = self
                    .supported
                    .as_ref()
                    .map(|supported| supported.evaluate(&request))
                    .unwrap_or(false);
                if approve {
                    self.apply_settings(&request, now);
                }
                debug!(id = %request.id, approve, "settings request judged");
                let reply = NegotiateReply {
                    id: request.id,
                    approve,
                    supported: self.supported.as_ref().map(SupportedOptions::to_ranges),
                };
                match negotiate_reply(&reply) {
                    Ok(packet) => self.send_packet(packet),
                    Err(err) => warn!(error = %err, "failed to build settings reply"),
                }
            }
            NegotiateBody::Reply(reply) => {
                let approved = reply.approve;
                let outcome = NegotiationOutcome {
                    approved,
                    supported: reply.supported.map(SupportedOptions::from_ranges),
                };
                match self
                    .table
                    .complete_negotiation(&TxnId::Opaque(reply.id), outcome)
                {
                    Some(requested) if approved => self.apply_settings(&requested, now),
                    Some(_) => {}
                    None => debug!("settings reply for unknown transaction dropped"),
                }
            }
        }
    }

    fn apply_settings(&mut self, request: &NegotiateRequest, now: Instant) {
        let interval = request
            .heartbeat_interval
            .and_then(|seconds| Duration::try_from_secs_f64(seconds).ok());
        self.heartbeat.apply(request.heartbeat_mode, interval, now);
        debug!(
            mode = ?self.heartbeat.mode(),
            interval = ?self.heartbeat.interval(),
            "heartbeat settings applied"
        );
    }

    /// Run everything due at `now`. Returns true when the inactivity
    /// deadline has passed and the connection must come down.
    pub fn on_timer(&mut self, now: Instant) -> bool {
        self.table.expire_due(now);
        if let Some(packet) = self.heartbeat.poll_send(now) {
            self.send_packet(packet);
        }
        matches!(self.heartbeat.idle_deadline(), Some(deadline) if deadline <= now)
    }

    /// Earliest pending deadline: heartbeat send, inactivity expiry, or
    /// transaction timeout.
    pub fn next_deadline(&self) -> Option<Instant> {
        [
            self.table.next_deadline(),
            self.heartbeat.next_send_at(),
            self.heartbeat.idle_deadline(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    fn mint_route(&mut self) -> RouteId {
        match self.role {
            Role::Initiator => RouteId::Numeric(self.table.next_numeric()),
            Role::Acceptor => RouteId::Opaque(self.table.mint_opaque()),
        }
    }

    fn mint_tag(&mut self) -> String {
        match self.role {
            Role::Initiator => self.table.next_numeric().to_string(),
            Role::Acceptor => self.table.mint_opaque(),
        }
    }

    fn send_packet(&mut self, packet: Packet) {
        let Some(sender) = &self.sender else {
            debug!("no channel attached; frame dropped");
            return;
        };
        match packet.encode() {
            Ok(text) => {
                if sender.send(text).is_err() {
                    debug!("channel task gone; frame dropped");
                }
            }
            Err(err) => warn!(error = %err, "failed to encode outbound packet"),
        }
    }

    #[cfg(test)]
    fn pending(&self) -> usize {
        self.table.len()
    }
}
