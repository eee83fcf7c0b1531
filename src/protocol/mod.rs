//! Events received from and commands sent to the game server.
//!
//! Only the subset of the game protocol the session controller reacts to is modelled. Payloads
//! are decoded with `serde`; unknown fields are ignored.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub mod codec;

/// Disconnect reason when the server closed the session.
pub const SERVER_DISCONNECT: &str = "io server disconnect";
/// Disconnect reason when this process closed the session.
pub const CLIENT_DISCONNECT: &str = "io client disconnect";

/// Payload of `game_start`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameStart {
    /// Index of this instance among the players.
    #[serde(rename = "playerIndex")]
    pub player_index: usize,
    /// Server assigned replay id, unique per round.
    pub replay_id: String,
    /// Display names, index-aligned with player indices.
    #[serde(default)]
    pub usernames: Vec<String>,
    /// Chat room of the round.
    #[serde(default)]
    pub chat_room: String,
}

/// Payload of `game_lost`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameLost {
    /// Player index of the killer.
    pub killer: usize,
}

/// Lobby options carried by `queue_update`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LobbyOptions {
    /// Current game speed of the lobby.
    #[serde(default)]
    pub game_speed: Option<u32>,
}

/// Payload of `queue_update`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueUpdate {
    /// Lobby is already counting down to start.
    #[serde(default)]
    pub is_forcing: bool,
    /// Participants in the lobby.
    #[serde(default)]
    pub num_players: u32,
    /// Participants, the first one controls a custom lobby.
    #[serde(default)]
    pub usernames: Vec<Option<String>>,
    /// Lobby options.
    #[serde(default)]
    pub options: LobbyOptions,
}

/// Everything the session controller can receive from the connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// Socket connected (first connection or reconnection).
    Connect,
    /// Socket disconnected, with the reason.
    Disconnect(String),
    /// Transport error.
    Error(String),
    /// Connection attempt failed.
    ConnectError(String),
    /// Answer to `set_username`, empty on success.
    SetUsernameResult(String),
    /// A round started.
    GameStart(GameStart),
    /// Incremental board snapshot, kept raw for telemetry.
    GameUpdate(Value),
    /// This instance was eliminated.
    GameLost(GameLost),
    /// This instance won.
    GameWon,
    /// Lobby state changed.
    QueueUpdate(QueueUpdate),
    /// An event this crate does not react to.
    Other(String),
}

impl ServerEvent {
    /// Build an event from a Socket.IO event name and its arguments.
    ///
    /// # Errors
    /// Returned when the payload of a known event does not match its shape.
    pub fn from_socket_event(name: &str, args: Vec<Value>) -> anyhow::Result<ServerEvent> {
        let first = || args.first().cloned().unwrap_or(Value::Null);
        Ok(match name {
            "game_start" => ServerEvent::GameStart(
                serde_json::from_value(first()).context("invalid game_start payload")?,
            ),
            "game_update" => ServerEvent::GameUpdate(first()),
            "game_lost" => ServerEvent::GameLost(
                serde_json::from_value(first()).context("invalid game_lost payload")?,
            ),
            "game_won" => ServerEvent::GameWon,
            "queue_update" => ServerEvent::QueueUpdate(
                serde_json::from_value(first()).context("invalid queue_update payload")?,
            ),
            "error_set_username" => ServerEvent::SetUsernameResult(match first() {
                Value::String(message) => message,
                Value::Null => String::new(),
                other => other.to_string(),
            }),
            other => ServerEvent::Other(other.to_string()),
        })
    }
}

/// A single move: send the army of `start` to `end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Move {
    /// Origin tile index.
    pub start: usize,
    /// Target tile index, `-1` when the agent found nothing to do.
    pub end: i64,
    /// Move only half of the army.
    pub is50: bool,
}

/// Commands sent to the game server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `set_username(userId, username)`
    SetUsername {
        /// Account identifier.
        user_id: String,
        /// Display name.
        username: String,
    },
    /// `play(userId)`: free-for-all queue.
    Play {
        /// Account identifier.
        user_id: String,
    },
    /// `join_1v1(userId)`: duel queue.
    JoinDuel {
        /// Account identifier.
        user_id: String,
    },
    /// `join_private(gameId, userId)`: custom lobby.
    JoinPrivate {
        /// Lobby id.
        game_id: String,
        /// Account identifier.
        user_id: String,
    },
    /// `set_force_start(gameIdOrNull, true)`
    SetForceStart {
        /// Lobby id, `null` outside custom lobbies.
        game_id: Option<String>,
    },
    /// `set_custom_options(gameId, {game_speed})`
    SetCustomOptions {
        /// Lobby id.
        game_id: String,
        /// Requested speed.
        game_speed: u32,
    },
    /// `chat_message(chatRoom, text)`
    ChatMessage {
        /// Chat room of the round.
        room: String,
        /// Line to send.
        text: String,
    },
    /// `leave_game()`
    LeaveGame,
    /// `attack(start, end, is50)`
    Attack(Move),
}

impl Command {
    /// Socket.IO event name.
    pub fn event_name(&self) -> &'static str {
        match self {
            Command::SetUsername { .. } => "set_username",
            Command::Play { .. } => "play",
            Command::JoinDuel { .. } => "join_1v1",
            Command::JoinPrivate { .. } => "join_private",
            Command::SetForceStart { .. } => "set_force_start",
            Command::SetCustomOptions { .. } => "set_custom_options",
            Command::ChatMessage { .. } => "chat_message",
            Command::LeaveGame => "leave_game",
            Command::Attack(_) => "attack",
        }
    }

    /// Socket.IO event arguments.
    pub fn args(&self) -> Vec<Value> {
        match self {
            Command::SetUsername { user_id, username } => vec![json!(user_id), json!(username)],
            Command::Play { user_id } | Command::JoinDuel { user_id } => vec![json!(user_id)],
            Command::JoinPrivate { game_id, user_id } => vec![json!(game_id), json!(user_id)],
            Command::SetForceStart { game_id } => vec![json!(game_id), Value::Bool(true)],
            Command::SetCustomOptions {
                game_id,
                game_speed,
            } => vec![json!(game_id), json!({ "game_speed": game_speed })],
            Command::ChatMessage { room, text } => vec![json!(room), json!(text)],
            Command::LeaveGame => vec![],
            Command::Attack(m) => vec![json!(m.start), json!(m.end), json!(m.is50)],
        }
    }

    /// Full Socket.IO frame.
    pub fn encode(&self) -> String {
        codec::encode_event(self.event_name(), &self.args())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_game_start() {
        let event = ServerEvent::from_socket_event(
            "game_start",
            vec![json!({
                "playerIndex": 1,
                "replay_id": "abc",
                "usernames": ["a", "b"],
                "chat_room": "game_abc",
                "teams": [1, 2]
            })],
        )
        .unwrap();
        assert_eq!(
            event,
            ServerEvent::GameStart(GameStart {
                player_index: 1,
                replay_id: "abc".into(),
                usernames: vec!["a".into(), "b".into()],
                chat_room: "game_abc".into(),
            })
        );
    }

    #[test]
    fn decode_queue_update_with_missing_fields() {
        let event = ServerEvent::from_socket_event(
            "queue_update",
            vec![json!({"numPlayers": 2, "usernames": ["flo", null]})],
        )
        .unwrap();
        let ServerEvent::QueueUpdate(update) = event else {
            panic!("expected queue update");
        };
        assert!(!update.is_forcing);
        assert_eq!(update.num_players, 2);
        assert_eq!(update.usernames, vec![Some("flo".into()), None]);
        assert_eq!(update.options.game_speed, None);
    }

    #[test]
    fn decode_invalid_payload_is_an_error() {
        assert!(ServerEvent::from_socket_event("game_lost", vec![json!({"killer": "x"})]).is_err());
        assert!(ServerEvent::from_socket_event("game_start", vec![]).is_err());
    }

    #[test]
    fn unknown_events_are_kept_by_name() {
        assert_eq!(
            ServerEvent::from_socket_event("chat_message", vec![]).unwrap(),
            ServerEvent::Other("chat_message".into())
        );
    }

    #[test]
    fn encode_commands() {
        assert_eq!(
            Command::JoinPrivate {
                game_id: "lobby".into(),
                user_id: "u".into()
            }
            .encode(),
            r#"42["join_private","lobby","u"]"#
        );
        assert_eq!(
            Command::SetCustomOptions {
                game_id: "lobby".into(),
                game_speed: 4
            }
            .encode(),
            r#"42["set_custom_options","lobby",{"game_speed":4}]"#
        );
        assert_eq!(
            Command::SetForceStart { game_id: None }.encode(),
            r#"42["set_force_start",null,true]"#
        );
        assert_eq!(
            Command::Attack(Move {
                start: 3,
                end: 4,
                is50: false
            })
            .encode(),
            r#"42["attack",3,4,false]"#
        );
    }
}
