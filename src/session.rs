//! Session controller: connection lifecycle, round sequencing and graceful shutdown.
//!
//! The controller is a plain state machine. [`SessionController::run`] feeds it, one at a time,
//! the events of the connection, the operator signals and the due scheduled triggers. Handlers
//! never await, so guard checks and the guarded side effects cannot interleave with another
//! handler.

use std::fmt::Display;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::{
    sync::mpsc,
    time::{sleep_until, timeout_at, Instant},
};
use tracing::{debug, error, info, trace, warn};

use crate::{
    agent_interface::{AgentAdapter, AgentFactory},
    configuration::{GameMode, RunConfiguration},
    connection::GameSocket,
    game_state::{tile_entries, GameUpdate},
    protocol::{
        Command, GameLost, GameStart, QueueUpdate, ServerEvent, CLIENT_DISCONNECT,
        SERVER_DISCONNECT,
    },
    scheduler::{Scheduler, TaskId, Trigger},
    telemetry::{field, list, topic, FieldBatch, Keyspace, Telemetry},
};

/// Lifecycle phase of the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No connection, initial and terminal phase.
    Disconnected,
    /// Waiting for the connection (first one or reconnection).
    Connecting,
    /// Connected, no round joined.
    Idle,
    /// Join sent, waiting in a queue or lobby.
    Joining,
    /// Round started.
    InRound,
    /// Round resolved, leaving it.
    RoundEnding,
}

/// Operator signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Ctrl-C.
    Interrupt,
    /// SIGTERM.
    Terminate,
}

/// How the session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionExit {
    /// Run complete or operator shutdown.
    Clean,
    /// The server closed the session.
    ServerDisconnect,
    /// The shutdown sequence did not finish in time.
    ShutdownTimeout,
}

impl SessionExit {
    /// Process exit code.
    pub fn code(&self) -> i32 {
        match self {
            SessionExit::Clean => 0,
            SessionExit::ServerDisconnect => 3,
            SessionExit::ShutdownTimeout => 1,
        }
    }
}

/// Terminal classification of a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// This instance won.
    Won,
    /// Eliminated by the player at index `killer`.
    Lost {
        /// Player index of the killer.
        killer: usize,
    },
    /// Left before the round was resolved.
    Abandoned,
}

/// A finished round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundRecord {
    /// 1-based round number.
    pub number: u32,
    /// Replay id, empty if the round never started.
    pub replay_id: String,
    /// How it ended.
    pub outcome: Outcome,
}

/// Payload of the `joined` state event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Joined {
    /// `FFA`, `1v1` or `custom`.
    pub game_type: String,
    /// Lobby id, custom lobbies only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub game_id: Option<String>,
}

/// Messages published on the `state` channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateEvent {
    /// Connected, with the display name.
    Connected(String),
    /// Join sent.
    Joined(Joined),
    /// Round started, with the server payload.
    GameStart(Value),
    /// Round lost.
    GameLost {
        /// Replay id of the round.
        replay_id: String,
        /// Player index of the killer.
        killer: usize,
        /// Display name of the killer, if known.
        killer_name: Option<String>,
    },
    /// Round won.
    GameWon {
        /// Replay id of the round.
        replay_id: String,
    },
    /// Connection lost, with the reason.
    Disconnected(String),
}

/// One-shot latch of an administrative command, scoped to a round.
#[derive(Debug, Default)]
struct CommandGuard {
    sent: bool,
    task: Option<TaskId>,
}

impl CommandGuard {
    /// Schedule the command unless it was already sent or is already scheduled.
    fn arm(
        &mut self,
        scheduler: &mut Scheduler,
        delay: std::time::Duration,
        trigger: Trigger,
    ) -> bool {
        if self.sent || self.task.is_some_and(|id| scheduler.is_pending(id)) {
            return false;
        }
        self.task = Some(scheduler.schedule(Instant::now(), delay, trigger));
        true
    }

    /// True if the command must be sent now. Latches the guard.
    fn fire(&mut self, id: TaskId) -> bool {
        if self.task != Some(id) {
            return false;
        }
        self.task = None;
        !std::mem::replace(&mut self.sent, true)
    }

    fn reset(&mut self, scheduler: &mut Scheduler) {
        if let Some(id) = self.task.take() {
            scheduler.cancel(id);
        }
        self.sent = false;
    }
}

#[derive(Debug, Default)]
struct Round {
    number: u32,
    replay_id: String,
    player_index: Option<usize>,
    usernames: Vec<String>,
    chat_room: String,
    joined: bool,
    keyspace: Option<Keyspace>,
    seen_update: bool,
}

/// Drives the rounds of one run.
pub struct SessionController<S: GameSocket, F: AgentFactory> {
    config: RunConfiguration,
    socket: S,
    telemetry: Telemetry,
    factory: F,
    scheduler: Scheduler,
    phase: Phase,
    round: Round,
    force_start: CommandGuard,
    custom_options: CommandGuard,
    chat_tasks: Vec<TaskId>,
    queue_num_players: u32,
    adapter: Option<AgentAdapter<F::Agent>>,
    history: Vec<RoundRecord>,
    closing: bool,
}

impl<S: GameSocket, F: AgentFactory> SessionController<S, F> {
    /// Create a controller. Nothing is sent until the first `connect` event.
    pub fn new(config: RunConfiguration, socket: S, telemetry: Telemetry, factory: F) -> Self {
        Self {
            config,
            socket,
            telemetry,
            factory,
            scheduler: Scheduler::new(),
            phase: Phase::Disconnected,
            round: Round::default(),
            force_start: CommandGuard::default(),
            custom_options: CommandGuard::default(),
            chat_tasks: vec![],
            queue_num_players: 0,
            adapter: None,
            history: vec![],
            closing: false,
        }
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Number of the current round, 0 before the first join.
    pub fn round_number(&self) -> u32 {
        self.round.number
    }

    /// Replay id of the current round, empty until it starts.
    pub fn replay_id(&self) -> &str {
        &self.round.replay_id
    }

    /// True while a round is joined and not resolved.
    pub fn is_joined(&self) -> bool {
        self.round.joined
    }

    /// Id of the current agent adapter.
    pub fn adapter_id(&self) -> Option<u64> {
        self.adapter.as_ref().map(|adapter| adapter.id())
    }

    /// Finished rounds, oldest first.
    pub fn history(&self) -> &[RoundRecord] {
        &self.history
    }

    /// True once the socket close was requested.
    pub fn is_closing(&self) -> bool {
        self.closing
    }

    /// Pending scheduled triggers.
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Telemetry client.
    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    /// Process events until the session ends, then shut telemetry down.
    ///
    /// Once the socket close is requested, the rest of the sequence must complete within the
    /// configured shutdown timeout, otherwise [`SessionExit::ShutdownTimeout`] is returned.
    pub async fn run(
        &mut self,
        mut events: mpsc::UnboundedReceiver<ServerEvent>,
        mut signals: mpsc::UnboundedReceiver<Signal>,
    ) -> SessionExit {
        if self.phase == Phase::Disconnected {
            self.phase = Phase::Connecting;
        }
        let bound = self.config.shutdown_timeout;
        let mut deadline: Option<Instant> = None;

        let exit = loop {
            if self.closing && deadline.is_none() {
                deadline = Some(Instant::now() + bound);
            }
            let next_trigger = self.scheduler.next_deadline();
            tokio::select! {
                event = events.recv() => {
                    let exit = match event {
                        Some(event) => self.handle_event(event),
                        None => Some(self.on_connection_lost()),
                    };
                    if let Some(exit) = exit {
                        break exit;
                    }
                }
                Some(signal) = signals.recv() => self.on_signal(signal),
                _ = sleep_until(next_trigger.unwrap_or_else(Instant::now)),
                    if next_trigger.is_some() =>
                {
                    self.fire_due_triggers(Instant::now());
                }
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    error!("socket did not close within {bound:?}");
                    break SessionExit::ShutdownTimeout;
                }
            }
        };

        self.scheduler.cancel_all();
        self.log_summary();
        if exit == SessionExit::ShutdownTimeout {
            return exit;
        }
        let deadline = deadline.unwrap_or_else(|| Instant::now() + bound);
        match timeout_at(deadline, self.telemetry.shutdown()).await {
            Ok(()) => exit,
            Err(_) => {
                error!("telemetry did not shut down within {bound:?}");
                SessionExit::ShutdownTimeout
            }
        }
    }

    /// Apply one connection event. Returns the exit once the session is over.
    pub fn handle_event(&mut self, event: ServerEvent) -> Option<SessionExit> {
        if self.closing && !matches!(event, ServerEvent::Disconnect(_)) {
            debug!("closing, ignored {event:?}");
            return None;
        }
        match event {
            ServerEvent::Connect => self.on_connect(),
            ServerEvent::Disconnect(reason) => return self.on_disconnect(&reason),
            ServerEvent::Error(e) => error!("[socket] {e}"),
            ServerEvent::ConnectError(e) => error!("[socket] connection failed: {e}"),
            ServerEvent::SetUsernameResult(message) => self.on_set_username_result(&message),
            ServerEvent::GameStart(data) => self.on_game_start(data),
            ServerEvent::GameUpdate(data) => self.on_game_update(&data),
            ServerEvent::GameLost(data) => self.on_game_lost(data),
            ServerEvent::GameWon => self.on_game_won(),
            ServerEvent::QueueUpdate(data) => self.on_queue_update(&data),
            ServerEvent::Other(name) => trace!("ignored event {name}"),
        }
        None
    }

    fn publish_state(&self, event: &StateEvent) {
        self.telemetry.publish(topic::STATE, event);
    }

    fn send(&self, command: Command) {
        trace!("sending {command:?}");
        self.socket.send(command);
    }

    /// Connected, or reconnected after a transport loss.
    pub fn on_connect(&mut self) {
        info!("[connected] {}", self.config.username);
        self.phase = Phase::Idle;
        if self.config.set_username {
            self.send(Command::SetUsername {
                user_id: self.config.user_id.clone(),
                username: self.config.username.clone(),
            });
        }
        self.publish_state(&StateEvent::Connected(self.config.username.clone()));

        if self.round.number == 0 {
            self.join_next_round();
        } else {
            info!(round = self.round.number, "reconnected, joining again");
            self.adapter = None;
            self.send_join();
        }
    }

    /// Start the next round, or close the socket once every round was played.
    pub fn join_next_round(&mut self) {
        self.round.number += 1;
        if self.round.number > self.config.total_rounds {
            info!("played {} games, exiting", self.config.total_rounds);
            self.close();
            return;
        }
        info!(
            "[joining] game {} of {}",
            self.round.number, self.config.total_rounds
        );
        self.send_join();
    }

    fn send_join(&mut self) {
        self.cancel_chat();
        self.force_start.reset(&mut self.scheduler);
        self.custom_options.reset(&mut self.scheduler);
        self.round = Round {
            number: self.round.number,
            joined: true,
            ..Round::default()
        };
        self.queue_num_players = 0;

        let user_id = self.config.user_id.clone();
        let joined = match &self.config.mode {
            GameMode::Ffa => {
                self.send(Command::Play { user_id });
                Joined {
                    game_type: self.config.mode.label().to_string(),
                    game_id: None,
                }
            }
            GameMode::Duel => {
                self.send(Command::JoinDuel { user_id });
                Joined {
                    game_type: self.config.mode.label().to_string(),
                    game_id: None,
                }
            }
            GameMode::Custom { game_id } => {
                let game_id = game_id.clone();
                self.send(Command::JoinPrivate {
                    game_id: game_id.clone(),
                    user_id,
                });
                self.custom_options.arm(
                    &mut self.scheduler,
                    self.config.custom_options_delay,
                    Trigger::CustomOptions,
                );
                self.force_start.arm(
                    &mut self.scheduler,
                    self.config.force_start_delay,
                    Trigger::ForceStart,
                );
                Joined {
                    game_type: self.config.mode.label().to_string(),
                    game_id: Some(game_id),
                }
            }
        };
        match &joined.game_id {
            Some(id) => info!("[joined] {}: {id}", joined.game_type),
            None => info!("[joined] {}", joined.game_type),
        }
        self.phase = Phase::Joining;
        self.publish_state(&StateEvent::Joined(joined));
    }

    fn on_set_username_result(&self, message: &str) {
        if message.is_empty() {
            info!("[set_username] username set to {}", self.config.username);
        } else {
            warn!("[error_set_username] {message}");
        }
    }

    /// A round started.
    pub fn on_game_start(&mut self, data: GameStart) {
        if !self.round.joined {
            warn!(replay_id = %data.replay_id, "game_start without a joined round, ignored");
            return;
        }
        info!(
            "[game_start] replay: {}, users: {}",
            data.replay_id,
            data.usernames.join(",")
        );
        // a previous agent never carries over
        self.adapter = None;
        self.cancel_chat();
        self.round.replay_id = data.replay_id.clone();
        self.round.player_index = Some(data.player_index);
        self.round.usernames = data.usernames.clone();
        self.round.chat_room = data.chat_room.clone();
        self.round.seen_update = false;
        self.phase = Phase::InRound;

        match serde_json::to_value(&data) {
            Ok(payload) => self.publish_state(&StateEvent::GameStart(payload)),
            Err(e) => error!(target: "telemetry", "could not serialize game_start: {e}"),
        }
        let keyspace = self.telemetry.keyspace(&data.replay_id);
        self.telemetry.set_fields(
            &keyspace,
            FieldBatch::new()
                .with("playerIndex", &data.player_index)
                .with("replay_id", &data.replay_id)
                .with("usernames", &data.usernames)
                .with("chat_room", &data.chat_room),
        );
        self.telemetry.arm_expiration(&keyspace);
        self.round.keyspace = Some(keyspace);

        let now = Instant::now();
        for (i, line) in self.config.chat_lines.iter().enumerate() {
            let delay = self.config.chat_interval * i as u32;
            let id = self.scheduler.schedule(
                now,
                delay,
                Trigger::Chat {
                    room: data.chat_room.clone(),
                    text: line.clone(),
                },
            );
            self.chat_tasks.push(id);
        }
    }

    /// A board snapshot arrived.
    pub fn on_game_update(&mut self, data: &Value) {
        let (Some(player_index), Some(keyspace)) =
            (self.round.player_index, self.round.keyspace.clone())
        else {
            warn!("game_update outside of a started round, ignored");
            return;
        };
        if !self.round.joined {
            warn!("game_update after the round ended, ignored");
            return;
        }
        let update = match GameUpdate::from_value(data) {
            Ok(update) => update,
            Err(e) => {
                warn!(replay_id = %self.round.replay_id, "{e:#}");
                return;
            }
        };

        let moves = match self.adapter.as_mut() {
            Some(adapter) => adapter.update(&update),
            None => match AgentAdapter::new(&self.factory, player_index, &update) {
                Ok((adapter, moves)) => {
                    debug!(adapter = adapter.id(), "first game update");
                    self.adapter = Some(adapter);
                    Ok(moves)
                }
                Err(e) => Err(e),
            },
        };
        let moves = match moves {
            Ok(moves) => moves,
            Err(e) => {
                warn!(replay_id = %self.round.replay_id, turn = update.turn, "{e:#}");
                return;
            }
        };
        for m in moves {
            self.send(Command::Attack(m));
        }
        let Some(adapter) = self.adapter.as_ref() else {
            return;
        };

        self.telemetry.publish(topic::GAME_UPDATE, data);
        let state = adapter.state();
        if !self.round.seen_update {
            self.round.seen_update = true;
            self.telemetry.set_fields(
                &keyspace,
                FieldBatch::new()
                    .with(field::WIDTH, &state.width())
                    .with(field::HEIGHT, &state.height())
                    .with(field::SIZE, &state.size())
                    .with(field::OWN_GENERAL, &state.own_general()),
            );
        }
        self.telemetry.set_fields(
            &keyspace,
            FieldBatch::new()
                .with(field::TURN, &state.turn())
                .with(field::CITIES, state.cities())
                .with(field::DISCOVERED_TILES, state.discovered_tiles())
                .with(field::ARMIES, state.armies())
                .with(field::TERRAIN, state.terrain())
                .with(field::ENEMY_GENERAL, &state.enemy_general())
                .with(field::OWN_TILES, &tile_entries(state.own_tiles()))
                .with(field::ENEMY_TILES, &tile_entries(state.enemy_tiles())),
        );
        self.telemetry
            .append_to_list(&keyspace, list::SCORES, &update.scores);
        self.telemetry
            .append_to_list(&keyspace, list::MAX_ARMY_ON_TILE, &state.max_army_on_tile());
        self.telemetry
            .append_to_list(&keyspace, list::MOVE_COUNT, &adapter.move_count());
    }

    /// Lobby state changed.
    pub fn on_queue_update(&mut self, data: &QueueUpdate) {
        if self.phase != Phase::Joining {
            debug!("queue_update outside of a lobby, ignored");
            return;
        }
        if !data.is_forcing
            && self.force_start.arm(
                &mut self.scheduler,
                self.config.force_start_delay,
                Trigger::ForceStart,
            )
        {
            debug!("force start armed");
        }

        if let GameMode::Custom { .. } = self.config.mode {
            let controlling = data
                .usernames
                .first()
                .and_then(Option::as_deref)
                .is_some_and(|name| name == self.config.username);
            let changed = data.num_players != self.queue_num_players
                || data.options.game_speed != Some(self.config.custom_game_speed);
            if controlling
                && changed
                && self.custom_options.arm(
                    &mut self.scheduler,
                    self.config.custom_options_delay,
                    Trigger::CustomOptions,
                )
            {
                debug!("custom options armed");
            }
        }
        self.queue_num_players = data.num_players;
    }

    /// This instance was eliminated.
    pub fn on_game_lost(&mut self, data: GameLost) {
        if self.phase != Phase::InRound {
            warn!("game_lost outside of a started round, ignored");
            return;
        }
        let killer_name = self.round.usernames.get(data.killer).cloned();
        info!(
            "[game_lost] {}, killer: {}",
            self.round.replay_id,
            OrUnknown(killer_name.as_deref())
        );
        self.publish_state(&StateEvent::GameLost {
            replay_id: self.round.replay_id.clone(),
            killer: data.killer,
            killer_name,
        });
        self.finish_round(Outcome::Lost {
            killer: data.killer,
        });
    }

    /// This instance won.
    pub fn on_game_won(&mut self) {
        if self.phase != Phase::InRound {
            warn!("game_won outside of a started round, ignored");
            return;
        }
        info!("[game_won] {}", self.round.replay_id);
        self.publish_state(&StateEvent::GameWon {
            replay_id: self.round.replay_id.clone(),
        });
        self.finish_round(Outcome::Won);
    }

    fn finish_round(&mut self, outcome: Outcome) {
        self.phase = Phase::RoundEnding;
        self.send(Command::LeaveGame);
        self.record(outcome);
        self.adapter = None;
        self.cancel_chat();
        self.join_next_round();
    }

    fn record(&mut self, outcome: Outcome) {
        if !self.round.joined {
            return;
        }
        self.round.joined = false;
        self.history.push(RoundRecord {
            number: self.round.number,
            replay_id: self.round.replay_id.clone(),
            outcome,
        });
    }

    /// The connection dropped. Returns the exit when it will not come back.
    pub fn on_disconnect(&mut self, reason: &str) -> Option<SessionExit> {
        self.publish_state(&StateEvent::Disconnected(reason.to_string()));
        match reason {
            SERVER_DISCONNECT => {
                error!("disconnected: {reason}");
                self.end_session();
                Some(SessionExit::ServerDisconnect)
            }
            CLIENT_DISCONNECT => {
                info!("disconnected: {reason}");
                self.end_session();
                Some(SessionExit::Clean)
            }
            _ => {
                warn!("disconnected: {reason}");
                self.force_start.reset(&mut self.scheduler);
                self.custom_options.reset(&mut self.scheduler);
                self.cancel_chat();
                self.phase = Phase::Connecting;
                None
            }
        }
    }

    fn on_connection_lost(&mut self) -> SessionExit {
        if self.closing {
            self.end_session();
            return SessionExit::Clean;
        }
        error!("connection stopped without a disconnect event");
        self.end_session();
        SessionExit::ServerDisconnect
    }

    fn end_session(&mut self) {
        self.record(Outcome::Abandoned);
        self.adapter = None;
        self.scheduler.cancel_all();
        self.phase = Phase::Disconnected;
    }

    /// Operator asked the process to stop: leave the round, then close the socket.
    pub fn on_signal(&mut self, signal: Signal) {
        if self.closing {
            debug!("{signal:?} while closing, ignored");
            return;
        }
        match signal {
            Signal::Interrupt => warn!("Interrupted. Exiting gracefully."),
            Signal::Terminate => warn!("Terminated. Exiting gracefully."),
        }
        if self.round.joined {
            self.send(Command::LeaveGame);
            info!(round = self.round.number, "sent: leave_game");
            self.record(Outcome::Abandoned);
        }
        self.close();
    }

    fn close(&mut self) {
        if self.closing {
            return;
        }
        self.closing = true;
        self.scheduler.cancel_all();
        self.chat_tasks.clear();
        self.socket.close();
    }

    fn cancel_chat(&mut self) {
        for id in self.chat_tasks.drain(..) {
            self.scheduler.cancel(id);
        }
    }

    /// Run every trigger due at `now`.
    pub fn fire_due_triggers(&mut self, now: Instant) {
        for (id, trigger) in self.scheduler.pop_due(now) {
            match trigger {
                Trigger::ForceStart => {
                    if self.force_start.fire(id) {
                        self.send(Command::SetForceStart {
                            game_id: self.config.mode.custom_game_id().map(str::to_string),
                        });
                    }
                }
                Trigger::CustomOptions => {
                    if let Some(game_id) = self.config.mode.custom_game_id() {
                        if self.custom_options.fire(id) {
                            self.send(Command::SetCustomOptions {
                                game_id: game_id.to_string(),
                                game_speed: self.config.custom_game_speed,
                            });
                        }
                    }
                }
                Trigger::Chat { room, text } => {
                    self.chat_tasks.retain(|task| *task != id);
                    debug!("sent: [chat_message] {text}");
                    self.send(Command::ChatMessage { room, text });
                }
            }
        }
    }

    fn log_summary(&self) {
        let (mut won, mut lost, mut abandoned) = (0, 0, 0);
        for record in &self.history {
            match record.outcome {
                Outcome::Won => won += 1,
                Outcome::Lost { .. } => lost += 1,
                Outcome::Abandoned => abandoned += 1,
            }
        }
        info!(
            "{} rounds: {won} won, {lost} lost, {abandoned} abandoned",
            self.history.len()
        );
    }
}

struct OrUnknown<'a>(Option<&'a str>);

impl Display for OrUnknown<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.0.unwrap_or("unknown"))
    }
}
