//! Socket.IO client over a websocket.
//!
//! [`connect`] spawns a transport task and returns a [`SocketHandle`] plus the stream of
//! [`ServerEvent`]s. The task reconnects on its own after transport failures and buffers the
//! commands issued meanwhile. It stops after a local close or when the server disconnects the
//! session.

use std::{collections::VecDeque, time::Duration};

use anyhow::{anyhow, bail, Context};
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use tokio::{
    net::TcpStream,
    sync::mpsc,
    time::{sleep, sleep_until, timeout, Instant},
};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, instrument, trace, warn};

use crate::protocol::{
    codec::{self, EnginePacket, Handshake, SocketPacket},
    Command, ServerEvent, CLIENT_DISCONNECT, SERVER_DISCONNECT,
};

/// Disconnect reason when the websocket closed.
pub const TRANSPORT_CLOSE: &str = "transport close";
/// Disconnect reason when the websocket failed.
pub const TRANSPORT_ERROR: &str = "transport error";
/// Disconnect reason when the heartbeat stopped.
pub const PING_TIMEOUT: &str = "ping timeout";

const OPEN_TIMEOUT: Duration = Duration::from_secs(20);

/// What the session controller needs from a connection.
pub trait GameSocket {
    /// Emit a command. Never blocks; commands issued while disconnected are sent on reconnect.
    fn send(&self, command: Command);

    /// Close the session. A `Disconnect("io client disconnect")` event follows.
    fn close(&self);
}

/// Socket settings.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    url: String,
    engine_io_version: u8,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl SocketConfig {
    /// Settings for the server at `url`, Engine.IO v3.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            engine_io_version: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }

    /// Select the Engine.IO protocol revision, 3 or 4.
    pub fn with_engine_io_version(mut self, version: u8) -> Self {
        self.engine_io_version = version;
        self
    }

    /// Reconnection delay: `initial` after the first failure, doubled after each one, capped at
    /// `max`.
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    /// Websocket url of the Socket.IO endpoint.
    pub fn endpoint(&self) -> String {
        let base = self.url.trim_end_matches('/');
        format!(
            "{base}/socket.io/?EIO={}&transport=websocket",
            self.engine_io_version
        )
    }
}

#[derive(Debug)]
enum Outbound {
    Command(Command),
    Close,
}

/// Handle on the transport task.
///
/// Dropping every handle closes the session.
#[derive(Debug, Clone)]
pub struct SocketHandle {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl GameSocket for SocketHandle {
    fn send(&self, command: Command) {
        if self.tx.send(Outbound::Command(command)).is_err() {
            debug!("transport stopped, command dropped");
        }
    }

    fn close(&self) {
        let _ = self.tx.send(Outbound::Close);
    }
}

/// Start the transport task.
///
/// Must be called inside a tokio runtime.
pub fn connect(config: SocketConfig) -> (SocketHandle, mpsc::UnboundedReceiver<ServerEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    tokio::spawn(transport_loop(config, rx, event_tx));
    (SocketHandle { tx }, event_rx)
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

enum SessionEnd {
    /// Closed locally.
    Closed,
    /// Namespace disconnected by the server.
    ServerDisconnect,
    /// Transport lost; `connected` is false when the session never opened.
    Lost { reason: String, connected: bool },
}

fn emit(events: &mpsc::UnboundedSender<ServerEvent>, event: ServerEvent) -> bool {
    events.send(event).is_ok()
}

#[instrument(skip_all, fields(url = %config.url))]
async fn transport_loop(
    config: SocketConfig,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    events: mpsc::UnboundedSender<ServerEvent>,
) {
    let mut pending = VecDeque::new();
    let mut backoff = config.initial_backoff;
    loop {
        match run_session(&config, &mut rx, &events, &mut pending).await {
            SessionEnd::Closed => {
                emit(&events, ServerEvent::Disconnect(CLIENT_DISCONNECT.to_string()));
                break;
            }
            SessionEnd::ServerDisconnect => {
                emit(&events, ServerEvent::Disconnect(SERVER_DISCONNECT.to_string()));
                break;
            }
            SessionEnd::Lost { reason, connected } => {
                let delivered = if connected {
                    backoff = config.initial_backoff;
                    emit(&events, ServerEvent::Disconnect(reason))
                } else {
                    emit(&events, ServerEvent::ConnectError(reason))
                };
                if !delivered {
                    break;
                }
            }
        }

        info!("reconnecting in {backoff:?}");
        tokio::select! {
            _ = sleep(backoff) => {}
            _ = buffer_until_close(&mut rx, &mut pending) => {
                emit(&events, ServerEvent::Disconnect(CLIENT_DISCONNECT.to_string()));
                break;
            }
        }
        backoff = (backoff * 2).min(config.max_backoff);
    }
    debug!("transport loop stopped");
}

/// Queue commands until a close is requested.
async fn buffer_until_close(
    rx: &mut mpsc::UnboundedReceiver<Outbound>,
    pending: &mut VecDeque<Command>,
) {
    while let Some(Outbound::Command(command)) = rx.recv().await {
        pending.push_back(command);
    }
}

async fn open(config: &SocketConfig) -> anyhow::Result<(WsStream, Handshake)> {
    let (mut ws, _) = connect_async(config.endpoint())
        .await
        .context("websocket connection failed")?;

    let handshake = loop {
        match next_packet(&mut ws).await? {
            EnginePacket::Open(handshake) => break handshake,
            other => trace!("ignored before handshake: {other:?}"),
        }
    };
    debug!(sid = %handshake.sid, "engine.io session opened");

    if config.engine_io_version >= 4 {
        ws.send(Message::Text(codec::CONNECT.to_string())).await?;
    }
    loop {
        match next_packet(&mut ws).await? {
            EnginePacket::Message(SocketPacket::Connect) => break,
            EnginePacket::Message(SocketPacket::ConnectError(message)) => {
                bail!("namespace connection refused: {message}")
            }
            EnginePacket::Ping(payload) => {
                ws.send(Message::Text(format!("{}{payload}", codec::PONG))).await?;
            }
            EnginePacket::Close => bail!("closed during handshake"),
            other => trace!("ignored before namespace connect: {other:?}"),
        }
    }
    Ok((ws, handshake))
}

async fn next_packet(ws: &mut WsStream) -> anyhow::Result<EnginePacket> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => return codec::decode(&text),
            Some(Ok(Message::Close(_))) | None => return Err(anyhow!("websocket closed")),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
        }
    }
}

async fn run_session(
    config: &SocketConfig,
    rx: &mut mpsc::UnboundedReceiver<Outbound>,
    events: &mpsc::UnboundedSender<ServerEvent>,
    pending: &mut VecDeque<Command>,
) -> SessionEnd {
    let opened = tokio::select! {
        opened = timeout(OPEN_TIMEOUT, open(config)) => opened,
        _ = buffer_until_close(rx, pending) => return SessionEnd::Closed,
    };
    let (ws, handshake) = match opened {
        Ok(Ok(opened)) => opened,
        Ok(Err(e)) => {
            warn!("connection failed: {e:#}");
            return SessionEnd::Lost {
                reason: format!("{e:#}"),
                connected: false,
            };
        }
        Err(_) => {
            warn!("connection timed out");
            return SessionEnd::Lost {
                reason: "timeout".to_string(),
                connected: false,
            };
        }
    };

    info!("connected");
    if !emit(events, ServerEvent::Connect) {
        return SessionEnd::Closed;
    }
    let (mut sink, mut stream) = ws.split();
    while let Some(command) = pending.pop_front() {
        if let Err(e) = send_command(&mut sink, &command).await {
            pending.push_front(command);
            warn!("send failed: {e}");
            return lost(TRANSPORT_ERROR);
        }
    }

    let version = config.engine_io_version;
    let interval = Duration::from_millis(handshake.ping_interval);
    let grace = interval + Duration::from_millis(handshake.ping_timeout);
    let mut next_ping = Instant::now() + interval;
    let mut alive_until = Instant::now() + grace;

    loop {
        tokio::select! {
            outbound = rx.recv() => match outbound {
                Some(Outbound::Command(command)) => {
                    if let Err(e) = send_command(&mut sink, &command).await {
                        pending.push_back(command);
                        warn!("send failed: {e}");
                        return lost(TRANSPORT_ERROR);
                    }
                }
                Some(Outbound::Close) | None => {
                    let _ = sink.send(Message::Text(codec::DISCONNECT.to_string())).await;
                    let _ = sink.close().await;
                    info!("closed");
                    return SessionEnd::Closed;
                }
            },
            frame = stream.next() => {
                let text = match frame {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => return lost(TRANSPORT_CLOSE),
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        warn!("websocket error: {e}");
                        emit(events, ServerEvent::Error(e.to_string()));
                        return lost(TRANSPORT_ERROR);
                    }
                };
                let packet = match codec::decode(&text) {
                    Ok(packet) => packet,
                    Err(e) => {
                        warn!(frame = %text, "undecodable frame: {e:#}");
                        continue;
                    }
                };
                match packet {
                    EnginePacket::Ping(payload) => {
                        alive_until = Instant::now() + grace;
                        let pong = Message::Text(format!("{}{payload}", codec::PONG));
                        if sink.send(pong).await.is_err() {
                            return lost(TRANSPORT_ERROR);
                        }
                    }
                    EnginePacket::Pong(_) => alive_until = Instant::now() + grace,
                    EnginePacket::Close => return lost(TRANSPORT_CLOSE),
                    EnginePacket::Message(SocketPacket::Disconnect) => {
                        info!("disconnected by server");
                        return SessionEnd::ServerDisconnect;
                    }
                    EnginePacket::Message(SocketPacket::Event { name, args }) => {
                        let event = match ServerEvent::from_socket_event(&name, args) {
                            Ok(event) => event,
                            Err(e) => {
                                warn!(event = %name, "{e:#}");
                                continue;
                            }
                        };
                        if !emit(events, event) {
                            return SessionEnd::Closed;
                        }
                    }
                    EnginePacket::Message(SocketPacket::ConnectError(message)) => {
                        emit(events, ServerEvent::ConnectError(message));
                    }
                    other => trace!("ignored: {other:?}"),
                }
            }
            _ = sleep_until(next_ping), if version < 4 => {
                next_ping += interval;
                if sink.send(Message::Text(codec::PING.to_string())).await.is_err() {
                    return lost(TRANSPORT_ERROR);
                }
            }
            _ = sleep_until(alive_until) => {
                warn!("no heartbeat from server");
                return lost(PING_TIMEOUT);
            }
        }
    }
}

fn lost(reason: &str) -> SessionEnd {
    SessionEnd::Lost {
        reason: reason.to_string(),
        connected: true,
    }
}

async fn send_command(
    sink: &mut SplitSink<WsStream, Message>,
    command: &Command,
) -> anyhow::Result<()> {
    sink.send(Message::Text(command.encode())).await?;
    debug!("sent: {}", command.event_name());
    Ok(())
}
