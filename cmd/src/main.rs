//! Demo node for the tether session protocol.
//!
//! Runs either side of the protocol from the command line: `serve`
//! accepts connections and answers the demo call surface, `connect`
//! dials a node, exercises the calls once connected, and stays up
//! printing lifecycle events until interrupted.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::{info, warn};

use tether_session::{
    CloseCode, ConnectOptions, EndpointState, Server, ServerEvent, ServerOptions, Session,
    SessionEvent,
};

mod config;
mod logging;

use config::NodeConfig;

/// Session protocol demo node
#[derive(Parser, Debug)]
#[command(name = "tether", version, about = "Session protocol demo node")]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Configuration file path
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Mode,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Accept connections and serve the demo call surface
    Serve {
        /// Listen address, e.g. 0.0.0.0:4600
        #[arg(long)]
        listen: Option<SocketAddr>,

        /// Require this token as the first handshake parameter
        #[arg(long)]
        auth_token: Option<String>,

        /// Heartbeat interval, e.g. 1s
        #[arg(long)]
        heartbeat_interval: Option<humantime::Duration>,
    },
    /// Connect to a node and exercise the call surface
    Connect {
        /// Remote address, e.g. 127.0.0.1:4600
        #[arg(long)]
        addr: Option<SocketAddr>,

        /// Handshake parameter (repeatable); the first one is checked
        /// against --auth-token on the serving side
        #[arg(long)]
        param: Vec<String>,

        /// Heartbeat interval, e.g. 1s
        #[arg(long)]
        heartbeat_interval: Option<humantime::Duration>,

        /// Payload sent with the demo echo request
        #[arg(long, default_value = "hello")]
        payload: String,
    },
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(&args.log_level)?;
    info!("tether node v{}", env!("CARGO_PKG_VERSION"));

    let config = NodeConfig::load(args.config.as_deref())?;

    match args.command {
        Mode::Serve {
            listen,
            auth_token,
            heartbeat_interval,
        } => {
            run_serve(
                config,
                listen,
                auth_token,
                heartbeat_interval.map(Duration::from),
            )
            .await
        }
        Mode::Connect {
            addr,
            param,
            heartbeat_interval,
            payload,
        } => {
            run_connect(
                config,
                addr,
                param,
                heartbeat_interval.map(Duration::from),
                payload,
            )
            .await
        }
    }
}

async fn run_serve(
    config: NodeConfig,
    listen: Option<SocketAddr>,
    auth_token: Option<String>,
    heartbeat_interval: Option<Duration>,
) -> Result<()> {
    let listen = listen.unwrap_or(config.listen);
    let auth_token = auth_token.or(config.auth_token.clone());
    let options = ServerOptions {
        heartbeat_interval: heartbeat_interval.unwrap_or_else(|| config.heartbeat_interval()),
        ..ServerOptions::default()
    };

    // Context holds the display name a peer registered with.
    let (server, mut events) = Server::<String>::bind(listen, options).await?;
    info!(addr = %server.local_addr(), auth = auth_token.is_some(), "serving");

    server.on_request("echo", |_peer, payload, responder| {
        responder.respond(payload);
    });
    server.on_request("time", |_peer, _payload, responder| {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        responder.respond(json!(now));
    });
    let fanout = server.clone();
    server.on_message("broadcast", move |sender, payload| {
        for peer in fanout.peers() {
            if peer.id() != sender.id() {
                let _ = peer.send("broadcast", payload.clone());
            }
        }
    });

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received");
                server.shutdown(CloseCode::GoingAway.as_u16(), "server shutting down");
                return Ok(());
            }

            event = events.recv() => match event {
                Some(ServerEvent::Connected(peer)) => {
                    if let Some(expected) = &auth_token {
                        match peer.params().first() {
                            Some(presented) if presented == expected => {}
                            _ => {
                                warn!(peer = %peer.id(), addr = %peer.addr(), "bad token; rejecting");
                                peer.close_with(
                                    CloseCode::PolicyViolation.as_u16(),
                                    "authentication failed",
                                );
                                continue;
                            }
                        }
                    }
                    let name = peer
                        .params()
                        .get(1)
                        .cloned()
                        .unwrap_or_else(|| format!("peer-{}", peer.id()));
                    info!(peer = %peer.id(), addr = %peer.addr(), name = %name, "peer connected");
                    peer.set_context(name);
                }
                Some(ServerEvent::Disconnected { peer, code, reason }) => {
                    let name = peer.with_context(|name| name.clone());
                    info!(peer = %peer.id(), name = ?name, code = ?code, reason = %reason, "peer disconnected");
                }
                None => return Ok(()),
            },
        }
    }
}

async fn run_connect(
    config: NodeConfig,
    addr: Option<SocketAddr>,
    params: Vec<String>,
    heartbeat_interval: Option<Duration>,
    payload: String,
) -> Result<()> {
    let addr = addr.unwrap_or(config.addr);
    let params = if params.is_empty() {
        config.params.clone()
    } else {
        params
    };
    let options = ConnectOptions {
        heartbeat_interval: heartbeat_interval.unwrap_or_else(|| config.heartbeat_interval()),
        params,
        ..ConnectOptions::default()
    };

    let (session, mut events) = Session::connect(addr, options);
    session.on_request("echo", |payload, responder| responder.respond(payload));
    session.on_message("broadcast", |payload| {
        info!(payload = %payload, "broadcast received");
    });

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received");
                session.close();
                return Ok(());
            }

            event = events.recv() => match event {
                Some(SessionEvent::Connected) => {
                    info!(addr = %addr, "connected");
                    let echoed = session.request("echo", json!(payload.clone())).await?;
                    info!(reply = %echoed, "echo answered");
                    let time = session.request("time", json!(null)).await?;
                    info!(unix_secs = %time, "time answered");
                }
                Some(SessionEvent::Disconnected { code, reason }) => {
                    info!(code = ?code, reason = %reason, "disconnected");
                    if session.state() == EndpointState::Closed {
                        return Ok(());
                    }
                }
                Some(SessionEvent::Error(err)) => {
                    warn!(error = %err, "session error");
                    if session.state() == EndpointState::Closed {
                        return Ok(());
                    }
                }
                None => return Ok(()),
            },
        }
    }
}
