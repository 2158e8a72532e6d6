//! Duplex channel abstraction consumed by the session engine.
//!
//! A [`Channel`] is handed over already open: transports resolve their
//! connect or accept future with a ready channel, so there is no separate
//! open notification. Everything after that point arrives as a
//! [`ChannelEvent`], ending with exactly one `Closed` or `Failed`.

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::trace;

use crate::error::SessionError;

/// Events surfaced by a channel after it was handed over.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// One inbound payload. Empty and non-text payloads are ignored by the
    /// session layer, not by the channel.
    Received(Bytes),
    /// The channel ended. `code` is absent when the peer vanished without
    /// sending a close frame.
    Closed {
        /// Close code from the peer, if one arrived
        code: Option<u16>,
        /// Human-readable close reason, possibly empty
        reason: String,
    },
    /// Transport failure; the channel is unusable afterwards.
    Failed(String),
}

/// Commands accepted by a channel's transport task.
#[derive(Debug)]
pub(crate) enum ChannelCommand {
    Send(String),
    Close { code: u16, reason: String },
}

/// Outbound half of a channel. Cheap to clone; all clones feed the same
/// transport writer.
#[derive(Debug, Clone)]
pub struct ChannelSender {
    commands: mpsc::UnboundedSender<ChannelCommand>,
}

impl ChannelSender {
    pub(crate) fn new(commands: mpsc::UnboundedSender<ChannelCommand>) -> Self {
        Self { commands }
    }

    /// Queue one outbound text payload.
    pub fn send(&self, text: String) -> Result<(), SessionError> {
        self.commands
            .send(ChannelCommand::Send(text))
            .map_err(|_| SessionError::ConnectionClosed)
    }

    /// Ask the transport to close with a code and reason. Best effort; a
    /// channel that is already gone swallows the request.
    pub fn close(&self, code: u16, reason: &str) {
        let _ = self.commands.send(ChannelCommand::Close {
            code,
            reason: reason.to_string(),
        });
    }
}

/// One open duplex channel: an outbound sender plus the inbound event
/// stream.
#[derive(Debug)]
pub struct Channel {
    sender: ChannelSender,
    events: mpsc::UnboundedReceiver<ChannelEvent>,
}

impl Channel {
    pub(crate) fn new(
        sender: ChannelSender,
        events: mpsc::UnboundedReceiver<ChannelEvent>,
    ) -> Self {
        Self { sender, events }
    }

    /// Clone the outbound half.
    pub fn sender(&self) -> ChannelSender {
        self.sender.clone()
    }

    /// Queue one outbound text payload.
    pub fn send(&self, text: String) -> Result<(), SessionError> {
        self.sender.send(text)
    }

    /// Close the channel with a code and reason.
    pub fn close(&self, code: u16, reason: &str) {
        self.sender.close(code, reason);
    }

    /// Next inbound event. `None` means the transport task ended without a
    /// terminal event, which transports in this crate never do.
    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        self.events.recv().await
    }

    /// Split into the outbound sender and the raw event stream.
    pub fn split(self) -> (ChannelSender, mpsc::UnboundedReceiver<ChannelEvent>) {
        (self.sender, self.events)
    }
}

/// Create two channels wired back to back, for tests and in-process use.
///
/// Text sent on one side surfaces as [`ChannelEvent::Received`] on the
/// other; closing one side surfaces as `Closed` with the given code on the
/// other. Dropping a side entirely surfaces as `Closed` without a code,
/// the same shape a lost transport produces.
///
/// Requires a running tokio runtime.
pub fn memory_pair() -> (Channel, Channel) {
    let (left_cmd_tx, left_cmd_rx) = mpsc::unbounded_channel();
    let (left_event_tx, left_event_rx) = mpsc::unbounded_channel();
    let (right_cmd_tx, right_cmd_rx) = mpsc::unbounded_channel();
    let (right_event_tx, right_event_rx) = mpsc::unbounded_channel();

    tokio::spawn(relay(left_cmd_rx, right_event_tx));
    tokio::spawn(relay(right_cmd_rx, left_event_tx));

    (
        Channel::new(ChannelSender::new(left_cmd_tx), left_event_rx),
        Channel::new(ChannelSender::new(right_cmd_tx), right_event_rx),
    )
}

async fn relay(
    mut commands: mpsc::UnboundedReceiver<ChannelCommand>,
    events: mpsc::UnboundedSender<ChannelEvent>,
) {
    while let Some(command) = commands.recv().await {
        match command {
            ChannelCommand::Send(text) => {
                if events.send(ChannelEvent::Received(Bytes::from(text))).is_err() {
                    trace!("memory channel peer dropped");
                    return;
                }
            }
            ChannelCommand::Close { code, reason } => {
                let _ = events.send(ChannelEvent::Closed {
                    code: Some(code),
                    reason,
                });
                return;
            }
        }
    }
    let _ = events.send(ChannelEvent::Closed {
        code: None,
        reason: "channel dropped".to_string(),
    });
}
