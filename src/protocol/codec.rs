//! Engine.IO / Socket.IO text framing.
//!
//! Only the text packets the game server uses are supported: no binary attachments, no
//! acknowledgements, default namespace.

use anyhow::{anyhow, bail, Context};
use serde::Deserialize;
use serde_json::Value;

/// Engine.IO ping.
pub const PING: &str = "2";
/// Engine.IO pong.
pub const PONG: &str = "3";
/// Socket.IO namespace connect.
pub const CONNECT: &str = "40";
/// Socket.IO namespace disconnect.
pub const DISCONNECT: &str = "41";

/// Parameters sent by the server in the Engine.IO open packet.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    /// Session id.
    pub sid: String,
    /// Interval between pings, in milliseconds.
    pub ping_interval: u64,
    /// Time allowed for the ping answer, in milliseconds.
    pub ping_timeout: u64,
}

/// A decoded Engine.IO packet.
#[derive(Debug, Clone, PartialEq)]
pub enum EnginePacket {
    /// `0`: handshake.
    Open(Handshake),
    /// `1`: transport close requested.
    Close,
    /// `2`: ping, with optional payload.
    Ping(String),
    /// `3`: pong, with optional payload.
    Pong(String),
    /// `4`: Socket.IO packet.
    Message(SocketPacket),
    /// `5` or `6`: transport upgrade and noop, ignored on a websocket.
    Noop,
}

/// A decoded Socket.IO packet.
#[derive(Debug, Clone, PartialEq)]
pub enum SocketPacket {
    /// `0`: namespace connected.
    Connect,
    /// `1`: namespace disconnected by the server.
    Disconnect,
    /// `2`: event with its arguments.
    Event {
        /// Event name.
        name: String,
        /// Event arguments, possibly empty.
        args: Vec<Value>,
    },
    /// `4`: namespace connection refused.
    ConnectError(String),
    /// Acks and binary packets.
    Unsupported(char),
}

/// Decode one websocket text frame.
pub fn decode(text: &str) -> anyhow::Result<EnginePacket> {
    let mut chars = text.chars();
    let kind = chars.next().context("empty packet")?;
    let rest = chars.as_str();
    Ok(match kind {
        '0' => EnginePacket::Open(
            serde_json::from_str(rest).context("invalid handshake payload")?,
        ),
        '1' => EnginePacket::Close,
        '2' => EnginePacket::Ping(rest.to_string()),
        '3' => EnginePacket::Pong(rest.to_string()),
        '4' => EnginePacket::Message(decode_socket_packet(rest)?),
        '5' | '6' => EnginePacket::Noop,
        other => bail!("unknown engine.io packet type '{other}'"),
    })
}

fn decode_socket_packet(text: &str) -> anyhow::Result<SocketPacket> {
    let mut chars = text.chars();
    let kind = chars.next().context("empty socket.io packet")?;
    let rest = skip_namespace(chars.as_str());
    Ok(match kind {
        '0' => SocketPacket::Connect,
        '1' => SocketPacket::Disconnect,
        '2' => {
            // optional ack id before the payload
            let payload = rest.trim_start_matches(|c: char| c.is_ascii_digit());
            let mut array: Vec<Value> =
                serde_json::from_str(payload).context("invalid event payload")?;
            if array.is_empty() {
                bail!("event without name");
            }
            let name = match array.remove(0) {
                Value::String(name) => name,
                other => return Err(anyhow!("event name is not a string: {other}")),
            };
            SocketPacket::Event { name, args: array }
        }
        '4' => SocketPacket::ConnectError(rest.to_string()),
        other => SocketPacket::Unsupported(other),
    })
}

fn skip_namespace(text: &str) -> &str {
    if text.starts_with('/') {
        match text.find(',') {
            Some(i) => &text[i + 1..],
            None => "",
        }
    } else {
        text
    }
}

/// Encode an event emission: `42["name",arg,...]`.
pub fn encode_event(name: &str, args: &[Value]) -> String {
    let mut array = Vec::with_capacity(args.len() + 1);
    array.push(Value::String(name.to_string()));
    array.extend(args.iter().cloned());
    format!("42{}", Value::Array(array))
}
