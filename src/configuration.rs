//! Run configuration.
//!
//! This module provides the immutable configuration of one run of the session controller: which
//! account plays, which game mode is joined, how many rounds are played, and where telemetry goes.
//!
//! Configuration can be created programmatically using [`RunConfiguration::new()`], loaded from a
//! JSON file with [`FileConfiguration::load()`], and overlaid with environment variables using
//! [`RunConfiguration::with_env()`]. Call [`RunConfiguration::validate()`] before use.
//!
//! # Environment Variables
//!
//! All values are optional.
//!
//! - `BOT_USER_ID`: account identifier
//! - `BOT_USERNAME`: display name
//! - `BOT_SERVER_URL`: game server websocket url
//! - `BOT_CUSTOM_GAME_SPEED`: custom lobby game speed
//! - `BOT_REDIS_URL`: full store url, overrides host/port/credentials
//! - `BOT_TELEMETRY_TTL_SECS`: expiration of round keyspaces, in seconds
//! - `BOT_SHUTDOWN_TIMEOUT_MS`: bound on the shutdown sequence, in milliseconds
//!
//! # File layout
//!
//! ```json
//! {
//!   "gameConfig": {
//!     "userId": "...", "username": "...",
//!     "customGameId": "lobby", "customGameSpeed": 4,
//!     "warCry": ["gl hf"]
//!   },
//!   "redisConfig": {
//!     "HOST": "localhost", "PORT": 6379, "USERNAME": "default", "PASSWORD": "...",
//!     "EXPIRATION_TIME": 86400
//!   }
//! }
//! ```

use std::{env, fmt::Display, path::Path, time::Duration};

use anyhow::{bail, Context};
use serde::Deserialize;

/// Default game server.
pub const DEFAULT_SERVER_URL: &str = "wss://botws.generals.io/";
/// Default custom lobby game speed.
pub const DEFAULT_CUSTOM_GAME_SPEED: u32 = 4;
/// Default expiration of the per-round keyspace and lists.
pub const DEFAULT_TELEMETRY_TTL: Duration = Duration::from_secs(60 * 60 * 24);

/// Which queue or lobby is joined each round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GameMode {
    /// Open free-for-all queue.
    Ffa,
    /// One-on-one queue.
    Duel,
    /// Private lobby, joined by id.
    Custom {
        /// Lobby id.
        game_id: String,
    },
}

impl GameMode {
    /// Name used in `joined` state events.
    pub fn label(&self) -> &'static str {
        match self {
            GameMode::Ffa => "FFA",
            GameMode::Duel => "1v1",
            GameMode::Custom { .. } => "custom",
        }
    }

    /// Lobby id of a custom game.
    pub fn custom_game_id(&self) -> Option<&str> {
        match self {
            GameMode::Custom { game_id } => Some(game_id),
            _ => None,
        }
    }
}

impl Display for GameMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GameMode::Custom { game_id } => write!(f, "custom: {game_id}"),
            other => f.write_str(other.label()),
        }
    }
}

/// Where telemetry is written.
#[derive(Clone, PartialEq, Eq)]
pub struct StoreConfiguration {
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) username: Option<String>,
    pub(crate) password: Option<String>,
    pub(crate) tls: bool,
    pub(crate) url: Option<String>,
    pub(crate) ttl: Duration,
    pub(crate) namespace_label: Option<String>,
}

impl StoreConfiguration {
    /// Local store without TLS, 24 hour expiration.
    pub fn new() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            username: None,
            password: None,
            tls: false,
            url: None,
            ttl: DEFAULT_TELEMETRY_TTL,
            namespace_label: None,
        }
    }

    /// Set host and port.
    pub fn with_address(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = host.into();
        self.port = port;
        self
    }

    /// Set credentials.
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Enable or disable TLS (`rediss://`).
    pub fn with_tls(mut self, value: bool) -> Self {
        self.tls = value;
        self
    }

    /// Use a full connection url, ignoring host, port, credentials and TLS flag.
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Set the expiration re-armed on every write to a round keyspace.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Prefix the instance token with a label in every channel and key name.
    pub fn with_namespace_label(mut self, label: impl Into<String>) -> Self {
        self.namespace_label = Some(label.into());
        self
    }

    /// Expiration of round keyspaces.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Optional namespace label.
    pub fn namespace_label(&self) -> Option<&str> {
        self.namespace_label.as_deref()
    }

    /// Connection url.
    pub fn connection_url(&self) -> String {
        if let Some(url) = &self.url {
            return url.clone();
        }
        let scheme = if self.tls { "rediss" } else { "redis" };
        let credentials = match (&self.username, &self.password) {
            (Some(user), Some(password)) => format!("{user}:{password}@"),
            (None, Some(password)) => format!(":{password}@"),
            (Some(user), None) => format!("{user}@"),
            (None, None) => String::new(),
        };
        format!("{scheme}://{credentials}{}:{}", self.host, self.port)
    }
}

impl Default for StoreConfiguration {
    fn default() -> Self {
        Self::new()
    }
}

// Keeps the password out of logs.
impl std::fmt::Debug for StoreConfiguration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreConfiguration")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("tls", &self.tls)
            .field("url", &self.url.as_ref().map(|_| "***"))
            .field("ttl", &self.ttl)
            .field("namespace_label", &self.namespace_label)
            .finish()
    }
}

/// Configuration of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfiguration {
    pub(crate) user_id: String,
    pub(crate) username: String,
    pub(crate) server_url: String,
    pub(crate) mode: GameMode,
    pub(crate) total_rounds: u32,
    pub(crate) custom_game_speed: u32,
    pub(crate) chat_lines: Vec<String>,
    pub(crate) set_username: bool,
    pub(crate) force_start_delay: Duration,
    pub(crate) custom_options_delay: Duration,
    pub(crate) chat_interval: Duration,
    pub(crate) shutdown_timeout: Duration,
    pub(crate) store: StoreConfiguration,
}

impl RunConfiguration {
    /// Create a new configuration with default parameters.
    ///
    /// By default:
    /// - One free-for-all round is played on [`DEFAULT_SERVER_URL`].
    /// - The display name is not (re)announced and no chat line is sent.
    /// - Custom lobbies are set to game speed 4.
    /// - Force start is requested 1 second after a queue update, custom options 100 ms after.
    /// - Chat lines are paced 1 second apart.
    /// - The shutdown sequence is bounded to 5 seconds.
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            username: String::new(),
            server_url: DEFAULT_SERVER_URL.to_string(),
            mode: GameMode::Ffa,
            total_rounds: 1,
            custom_game_speed: DEFAULT_CUSTOM_GAME_SPEED,
            chat_lines: vec![],
            set_username: false,
            force_start_delay: Duration::from_secs(1),
            custom_options_delay: Duration::from_millis(100),
            chat_interval: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(5),
            store: StoreConfiguration::new(),
        }
    }

    /// Overlay values found in the environment (see module documentation).
    ///
    /// # Errors
    /// Returned when a variable is set but cannot be parsed.
    pub fn with_env(mut self) -> anyhow::Result<Self> {
        fn parse_var<T: std::str::FromStr>(var: &str) -> anyhow::Result<Option<T>>
        where
            T::Err: std::error::Error + Send + Sync + 'static,
        {
            match env::var(var) {
                Ok(value) => Ok(Some(
                    value
                        .trim()
                        .parse()
                        .with_context(|| format!("could not parse {var}='{value}'"))?,
                )),
                Err(_) => Ok(None),
            }
        }

        if let Ok(user_id) = env::var("BOT_USER_ID") {
            self.user_id = user_id;
        }
        if let Ok(username) = env::var("BOT_USERNAME") {
            self.username = username;
        }
        if let Ok(url) = env::var("BOT_SERVER_URL") {
            self.server_url = url;
        }
        if let Some(speed) = parse_var("BOT_CUSTOM_GAME_SPEED")? {
            self.custom_game_speed = speed;
        }
        if let Ok(url) = env::var("BOT_REDIS_URL") {
            self.store.url = Some(url);
        }
        if let Some(secs) = parse_var("BOT_TELEMETRY_TTL_SECS")? {
            self.store.ttl = Duration::from_secs(secs);
        }
        if let Some(millis) = parse_var("BOT_SHUTDOWN_TIMEOUT_MS")? {
            self.shutdown_timeout = Duration::from_millis(millis);
        }
        Ok(self)
    }

    /// Set the display name.
    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = username.into();
        self
    }

    /// Set the game server websocket url.
    pub fn with_server_url(mut self, url: impl Into<String>) -> Self {
        self.server_url = url.into();
        self
    }

    /// Set the game mode.
    pub fn with_mode(mut self, mode: GameMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the number of rounds to play.
    pub fn with_total_rounds(mut self, rounds: u32) -> Self {
        self.total_rounds = rounds;
        self
    }

    /// Set the custom lobby game speed.
    pub fn with_custom_game_speed(mut self, speed: u32) -> Self {
        self.custom_game_speed = speed;
        self
    }

    /// Set the chat lines sent at the start of every round.
    pub fn with_chat_lines(mut self, lines: Vec<String>) -> Self {
        self.chat_lines = lines;
        self
    }

    /// Enable or disable the display name registration on connect.
    pub fn with_set_username(mut self, value: bool) -> Self {
        self.set_username = value;
        self
    }

    /// Set the delay between a queue update and the force start request.
    pub fn with_force_start_delay(mut self, delay: Duration) -> Self {
        self.force_start_delay = delay;
        self
    }

    /// Set the delay before the custom options are sent.
    pub fn with_custom_options_delay(mut self, delay: Duration) -> Self {
        self.custom_options_delay = delay;
        self
    }

    /// Set the pacing of chat lines.
    pub fn with_chat_interval(mut self, interval: Duration) -> Self {
        self.chat_interval = interval;
        self
    }

    /// Set the bound on the shutdown sequence.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Set the telemetry store configuration.
    pub fn with_store(mut self, store: StoreConfiguration) -> Self {
        self.store = store;
        self
    }

    /// Check the configuration can run.
    ///
    /// # Errors
    /// Returned on empty user id, zero rounds, custom mode without lobby id, username
    /// registration without username, or zero game speed.
    pub fn validate(self) -> anyhow::Result<Self> {
        if self.user_id.trim().is_empty() {
            bail!("userId is missing");
        }
        if self.total_rounds == 0 {
            bail!("number of games must be at least 1");
        }
        if let GameMode::Custom { game_id } = &self.mode {
            if game_id.trim().is_empty() {
                bail!("custom game requires a game id");
            }
        }
        if self.set_username && self.username.trim().is_empty() {
            bail!("cannot set username: username is missing");
        }
        if self.custom_game_speed == 0 {
            bail!("custom game speed must be at least 1");
        }
        Ok(self)
    }

    /// Account identifier.
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Display name.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Game server url.
    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /// Game mode.
    pub fn mode(&self) -> &GameMode {
        &self.mode
    }

    /// Number of rounds to play.
    pub fn total_rounds(&self) -> u32 {
        self.total_rounds
    }

    /// Bound on the shutdown sequence.
    pub fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout
    }

    /// Telemetry store configuration.
    pub fn store(&self) -> &StoreConfiguration {
        &self.store
    }
}

/// On-disk configuration, `config.json`.
#[derive(Debug, Default, Deserialize)]
pub struct FileConfiguration {
    #[serde(rename = "gameConfig", default)]
    game: FileGameConfig,
    #[serde(rename = "redisConfig", default)]
    store: FileStoreConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileGameConfig {
    user_id: Option<String>,
    username: Option<String>,
    custom_game_id: Option<String>,
    custom_game_speed: Option<u32>,
    #[serde(default)]
    war_cry: Vec<String>,
    server_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
struct FileStoreConfig {
    host: Option<String>,
    port: Option<u16>,
    username: Option<String>,
    password: Option<String>,
    tls: Option<bool>,
    url: Option<String>,
    expiration_time: Option<u64>,
    namespace: Option<String>,
}

impl FileConfiguration {
    /// Read and parse a configuration file.
    ///
    /// # Errors
    /// Returned when the file cannot be read or is not valid JSON.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("could not read configuration file {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("invalid configuration file {}", path.display()))
    }

    /// Parse configuration text.
    ///
    /// # Errors
    /// Returned when `text` is not valid JSON for this layout.
    pub fn parse(text: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Lobby id stored in the file, used by `custom` without an explicit id.
    pub fn custom_game_id(&self) -> Option<&str> {
        self.game.custom_game_id.as_deref()
    }

    /// Build a run configuration from the file values.
    ///
    /// The game mode defaults to free-for-all. Store values default as documented on
    /// [`StoreConfiguration::new()`]; TLS defaults to enabled when the file names a remote host.
    pub fn into_run_configuration(self) -> RunConfiguration {
        let game = self.game;
        let file_store = self.store;

        let mut config = RunConfiguration::new(game.user_id.unwrap_or_default())
            .with_username(game.username.unwrap_or_default())
            .with_chat_lines(game.war_cry)
            .with_custom_game_speed(game.custom_game_speed.unwrap_or(DEFAULT_CUSTOM_GAME_SPEED));
        if let Some(url) = game.server_url {
            config = config.with_server_url(url);
        }

        let mut store = StoreConfiguration::new();
        if let Some(host) = file_store.host {
            store.tls = file_store.tls.unwrap_or(true);
            store.host = host;
        } else if let Some(tls) = file_store.tls {
            store.tls = tls;
        }
        if let Some(port) = file_store.port {
            store.port = port;
        }
        store.username = file_store.username;
        store.password = file_store.password;
        store.url = file_store.url;
        if let Some(secs) = file_store.expiration_time {
            store.ttl = Duration::from_secs(secs);
        }
        store.namespace_label = file_store.namespace;

        config.with_store(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = RunConfiguration::new("id");
        assert_eq!(config.mode, GameMode::Ffa);
        assert_eq!(config.total_rounds, 1);
        assert_eq!(config.custom_game_speed, 4);
        assert_eq!(config.force_start_delay, Duration::from_secs(1));
        assert_eq!(config.store.ttl, DEFAULT_TELEMETRY_TTL);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validation_errors() {
        assert!(RunConfiguration::new("").validate().is_err());
        assert!(RunConfiguration::new("id").with_total_rounds(0).validate().is_err());
        assert!(RunConfiguration::new("id")
            .with_mode(GameMode::Custom { game_id: " ".into() })
            .validate()
            .is_err());
        assert!(RunConfiguration::new("id").with_set_username(true).validate().is_err());
        assert!(RunConfiguration::new("id")
            .with_set_username(true)
            .with_username("flo")
            .validate()
            .is_ok());
    }

    #[test]
    fn parse_file_layout() {
        let text = r#"{
            "gameConfig": {
                "userId": "secret", "username": "[Bot] flo",
                "customGameId": "lobby7", "customGameSpeed": 2,
                "warCry": ["hello", "good luck"]
            },
            "redisConfig": {
                "HOST": "redis.example.com", "PORT": 6380,
                "USERNAME": "default", "PASSWORD": "pw",
                "EXPIRATION_TIME": 1209600
            }
        }"#;
        let file = FileConfiguration::parse(text).unwrap();
        assert_eq!(file.custom_game_id(), Some("lobby7"));
        let config = file.into_run_configuration();
        assert_eq!(config.user_id(), "secret");
        assert_eq!(config.username(), "[Bot] flo");
        assert_eq!(config.custom_game_speed, 2);
        assert_eq!(config.chat_lines, vec!["hello", "good luck"]);
        assert_eq!(config.store.ttl, Duration::from_secs(1_209_600));
        assert_eq!(
            config.store.connection_url(),
            "rediss://default:pw@redis.example.com:6380"
        );
    }

    #[test]
    fn empty_file_uses_defaults() {
        let config = FileConfiguration::parse("{}").unwrap().into_run_configuration();
        assert_eq!(config.store.connection_url(), "redis://127.0.0.1:6379");
        assert!(config.validate().is_err());
    }

    #[test]
    fn debug_hides_password() {
        let store = StoreConfiguration::new().with_credentials("user", "hunter2");
        assert!(!format!("{store:?}").contains("hunter2"));
    }

    #[test]
    fn mode_labels() {
        assert_eq!(GameMode::Duel.label(), "1v1");
        let custom = GameMode::Custom { game_id: "abc".into() };
        assert_eq!(custom.custom_game_id(), Some("abc"));
        assert_eq!(custom.to_string(), "custom: abc");
    }
}
