//! Default TCP transport.
//!
//! Sockets are bridged onto [`Channel`]s by a reader and a writer task.
//! The connecting side writes its open frame before the channel is handed
//! over; the accepting side reads it and returns the decoded connection
//! parameters alongside the channel.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

use tether_wire::{decode_params, encode_params, ChannelFrame, CloseCode, FrameDecoder};

use crate::channel::{Channel, ChannelCommand, ChannelEvent, ChannelSender};

/// How long an accepted socket may take to present its open frame.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

const READ_BUFFER_CAPACITY: usize = 64 * 1024;

fn invalid_data(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

/// Write one frame.
async fn send_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: ChannelFrame) -> io::Result<()> {
    let bytes = frame.encode().map_err(invalid_data)?;
    writer.write_all(&bytes).await
}

/// Read one frame, buffering as needed. `Ok(None)` means EOF.
async fn recv_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    decoder: &mut FrameDecoder,
    buffer: &mut BytesMut,
) -> io::Result<Option<ChannelFrame>> {
    loop {
        if let Some(frame) = decoder.decode(buffer).map_err(invalid_data)? {
            return Ok(Some(frame));
        }
        if reader.read_buf(buffer).await? == 0 {
            return Ok(None);
        }
    }
}

/// Open a channel to `addr`, presenting `params` in the open frame.
pub async fn connect(addr: SocketAddr, params: &[String]) -> io::Result<Channel> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    send_frame(&mut stream, ChannelFrame::Open(encode_params(params))).await?;
    debug!(peer = %addr, "channel connected");
    Ok(spawn_channel(stream, BytesMut::with_capacity(READ_BUFFER_CAPACITY)))
}

/// Bind the listening socket.
pub async fn listen(addr: SocketAddr) -> io::Result<TcpListener> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "listening");
    Ok(listener)
}

/// Take an accepted socket through the open handshake. Returns the channel
/// and the connection parameters the peer presented.
pub async fn accept(stream: TcpStream) -> io::Result<(Channel, Vec<String>)> {
    stream.set_nodelay(true)?;
    let mut stream = stream;
    let mut decoder = FrameDecoder::new();
    let mut buffer = BytesMut::with_capacity(READ_BUFFER_CAPACITY);
    let frame = tokio::time::timeout(
        HANDSHAKE_TIMEOUT,
        recv_frame(&mut stream, &mut decoder, &mut buffer),
    )
    .await
    .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "no open frame received"))??;

    let header = match frame {
        Some(ChannelFrame::Open(header)) => header,
        Some(_) => return Err(invalid_data("expected open frame")),
        None => return Err(io::ErrorKind::UnexpectedEof.into()),
    };
    let params = decode_params(&header).map_err(invalid_data)?;
    Ok((spawn_channel(stream, buffer), params))
}

/// Bridge a connected socket onto a channel. `buffer` carries bytes read
/// past the handshake.
fn spawn_channel(stream: TcpStream, buffer: BytesMut) -> Channel {
    let (read_half, write_half) = stream.into_split();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    tokio::spawn(read_loop(read_half, buffer, event_tx));
    tokio::spawn(write_loop(write_half, command_rx));
    Channel::new(ChannelSender::new(command_tx), event_rx)
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    mut buffer: BytesMut,
    events: mpsc::UnboundedSender<ChannelEvent>,
) {
    let mut decoder = FrameDecoder::new();
    loop {
        match recv_frame(&mut reader, &mut decoder, &mut buffer).await {
            Ok(Some(ChannelFrame::Text(text))) => {
                if events.send(ChannelEvent::Received(Bytes::from(text))).is_err() {
                    return;
                }
            }
            Ok(Some(ChannelFrame::Binary(bytes))) => {
                if events.send(ChannelEvent::Received(bytes)).is_err() {
                    return;
                }
            }
            Ok(Some(ChannelFrame::Close { code, reason })) => {
                trace!(code = ?code, "peer closed channel");
                // A close frame without a code is still a deliberate close;
                // report it as no-status so it stays distinct from an
                // abnormal drop, which surfaces with no code at all.
                let code = code.or(Some(CloseCode::NoStatus.as_u16()));
                let _ = events.send(ChannelEvent::Closed { code, reason });
                return;
            }
            Ok(Some(ChannelFrame::Open(_))) => {
                trace!("unexpected open frame ignored");
            }
            Ok(None) => {
                let _ = events.send(ChannelEvent::Closed {
                    code: None,
                    reason: "connection lost".to_string(),
                });
                return;
            }
            Err(err) if err.kind() == io::ErrorKind::InvalidData => {
                let _ = events.send(ChannelEvent::Failed(err.to_string()));
                return;
            }
            Err(err) => {
                let _ = events.send(ChannelEvent::Closed {
                    code: None,
                    reason: err.to_string(),
                });
                return;
            }
        }
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut commands: mpsc::UnboundedReceiver<ChannelCommand>,
) {
    while let Some(command) = commands.recv().await {
        match command {
            ChannelCommand::Send(text) => {
                if let Err(err) = send_frame(&mut writer, ChannelFrame::Text(text)).await {
                    debug!(error = %err, "write failed; channel closing");
                    return;
                }
            }
            ChannelCommand::Close { code, reason } => {
                if let Err(err) = send_frame(
                    &mut writer,
                    ChannelFrame::Close {
                        code: Some(code),
                        reason,
                    },
                )
                .await
                {
                    debug!(error = %err, "close frame write failed");
                }
                let _ = writer.shutdown().await;
                return;
            }
        }
    }
    // All senders dropped without an explicit close.
    let _ = writer.shutdown().await;
}
