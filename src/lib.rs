//! # Round Runner
//!
//! Drives an automated player through consecutive rounds of a realtime multiplayer game served over
//! Socket.IO, and mirrors the session telemetry into a shared redis store for external observers.
//!
//! It provides:
//! - A round state machine (`SessionController`) that joins, plays, leaves and rejoins rounds,
//!   sends the lobby administrative commands at most once per round and shuts down within a bound
//! - Best-effort telemetry (`Telemetry`) over a pluggable key-value / pub-sub store, redis or
//!   in-memory
//! - A short per-instance namespace derived from the account id ([`identity`])
//! - A minimal Socket.IO client with transport-level reconnection ([`connection`])
//! - The agent boundary ([`Agent`] and [`AgentFactory`]) and a small stub agent
//!
//! # Documentation Overview
//!
//! - For the round lifecycle, guards and exit policy, see the [`session`] module.
//! - For the telemetry naming contract (channels, keyspaces, lists), see the [`telemetry`] module.
//! - For configuration (builder, environment, `config.json`), see
//!   [`RunConfiguration`](crate::configuration::RunConfiguration).
//! - For plugging a decision-making agent, check out the [`Agent`] and [`AgentFactory`] traits.
//!
//! # Usage Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use round_runner::prelude::*;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> anyhow::Result<()> {
//!     let config = RunConfiguration::new("my-user-id")
//!         .with_username("my bot")
//!         .with_mode(GameMode::Duel)
//!         .with_total_rounds(3)
//!         .validate()?;
//!
//!     let token = round_runner::identity::derive(config.user_id())?;
//!     let ttl = Duration::from_secs(3600);
//!     let telemetry = Telemetry::start(MemoryStore::new(), token.as_str(), ttl);
//!
//!     let (socket, events) = connect(SocketConfig::new(config.server_url()));
//!     let (_signal_tx, signals) = tokio::sync::mpsc::unbounded_channel();
//!
//!     let mut controller =
//!         SessionController::new(config, socket, telemetry, FrontierAgentFactory);
//!     let exit = controller.run(events, signals).await;
//!     std::process::exit(exit.code());
//! }
//! ```
#![warn(missing_docs)]

pub use anyhow;

pub mod agent;
pub mod agent_interface;
pub mod configuration;
pub mod connection;
pub mod game_state;
pub mod identity;
pub mod logger;
pub mod protocol;
pub mod scheduler;
pub mod session;
pub mod telemetry;

pub use agent_interface::{Agent, AgentFactory};

/// Commonly used types and traits for quick access.
///
/// Import this prelude to get started easily:
/// ```rust
/// use round_runner::prelude::*;
/// ```
pub mod prelude {
    pub use crate::agent::FrontierAgentFactory;
    pub use crate::agent_interface::{Agent, AgentFactory};
    pub use crate::configuration::{GameMode, RunConfiguration, StoreConfiguration};
    pub use crate::connection::{connect, GameSocket, SocketConfig};
    pub use crate::session::{SessionController, SessionExit, Signal};
    pub use crate::telemetry::{KeyValueStore, MemoryStore, RedisStore, Telemetry};
}
