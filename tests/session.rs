use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use round_runner::{
    agent::FrontierAgentFactory,
    configuration::{GameMode, RunConfiguration},
    connection::GameSocket,
    protocol::{
        Command, GameLost, GameStart, LobbyOptions, QueueUpdate, ServerEvent, CLIENT_DISCONNECT,
        SERVER_DISCONNECT,
    },
    session::{Outcome, Phase, SessionController, SessionExit, Signal},
    telemetry::{MemoryStore, Telemetry},
};
use serde_json::{json, Value};
use tokio::{sync::mpsc, time::Instant};
use tracing::Level;

const NAMESPACE: &str = "tok1234";
const TTL: Duration = Duration::from_secs(60 * 60);

#[allow(dead_code)]
fn init_test_logger() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Records commands; a close is answered like the real transport does.
#[derive(Clone)]
struct FakeSocket {
    sent: Arc<Mutex<Vec<Command>>>,
    closes: Arc<AtomicUsize>,
    silent_close: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<ServerEvent>,
}

impl FakeSocket {
    fn new(events: mpsc::UnboundedSender<ServerEvent>) -> Self {
        Self {
            sent: Arc::new(Mutex::new(vec![])),
            closes: Arc::new(AtomicUsize::new(0)),
            silent_close: Arc::new(AtomicBool::new(false)),
            events,
        }
    }

    fn sent(&self) -> Vec<Command> {
        self.sent.lock().unwrap().clone()
    }

    fn count(&self, event_name: &str) -> usize {
        self.sent()
            .iter()
            .filter(|command| command.event_name() == event_name)
            .count()
    }

    fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl GameSocket for FakeSocket {
    fn send(&self, command: Command) {
        self.sent.lock().unwrap().push(command);
    }

    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        if !self.silent_close.load(Ordering::SeqCst) {
            let _ = self
                .events
                .send(ServerEvent::Disconnect(CLIENT_DISCONNECT.to_string()));
        }
    }
}

struct Harness {
    controller: SessionController<FakeSocket, FrontierAgentFactory>,
    socket: FakeSocket,
    store: MemoryStore,
    events_tx: mpsc::UnboundedSender<ServerEvent>,
    events: mpsc::UnboundedReceiver<ServerEvent>,
    signal_tx: mpsc::UnboundedSender<Signal>,
    signals: mpsc::UnboundedReceiver<Signal>,
}

impl Harness {
    fn new(config: RunConfiguration) -> Self {
        Self::with_store(config, MemoryStore::new())
    }

    fn with_store(config: RunConfiguration, store: MemoryStore) -> Self {
        let (events_tx, events) = mpsc::unbounded_channel();
        let (signal_tx, signals) = mpsc::unbounded_channel();
        let socket = FakeSocket::new(events_tx.clone());
        let telemetry = Telemetry::start(store.clone(), NAMESPACE, TTL);
        let controller = SessionController::new(
            config.validate().unwrap(),
            socket.clone(),
            telemetry,
            FrontierAgentFactory,
        );
        Self {
            controller,
            socket,
            store,
            events_tx,
            events,
            signal_tx,
            signals,
        }
    }

    fn push(&self, event: ServerEvent) {
        self.events_tx.send(event).unwrap();
    }

    async fn run(mut self) -> (SessionExit, Self) {
        let (_, events) = mpsc::unbounded_channel();
        let (_, signals) = mpsc::unbounded_channel();
        let events = std::mem::replace(&mut self.events, events);
        let signals = std::mem::replace(&mut self.signals, signals);
        let exit = self.controller.run(events, signals).await;
        (exit, self)
    }

    fn state_events(&self) -> Vec<Value> {
        self.store
            .published(&format!("{NAMESPACE}-state"))
            .iter()
            .map(|message| serde_json::from_str(message).unwrap())
            .collect()
    }
}

fn config(mode: GameMode, rounds: u32) -> RunConfiguration {
    RunConfiguration::new("user-id")
        .with_username("me")
        .with_mode(mode)
        .with_total_rounds(rounds)
}

fn game_start(replay_id: &str) -> ServerEvent {
    ServerEvent::GameStart(GameStart {
        player_index: 0,
        replay_id: replay_id.to_string(),
        usernames: vec!["me".to_string(), "enemy".to_string()],
        chat_room: format!("chat_{replay_id}"),
    })
}

/// 2x2 board, own army of 5 on tile 0, the rest empty.
fn first_update() -> ServerEvent {
    ServerEvent::GameUpdate(json!({
        "turn": 1,
        "map_diff": [0, 10, 2, 2, 5, 0, 0, 0, 0, -1, -1, -1],
        "cities_diff": [0],
        "generals": [0, -1],
        "scores": [{ "total": 5, "tiles": 1, "i": 0, "dead": false }]
    }))
}

fn next_update(turn: u64) -> ServerEvent {
    ServerEvent::GameUpdate(json!({
        "turn": turn,
        "map_diff": [10],
        "cities_diff": [0],
        "generals": [0, -1],
        "scores": [{ "total": 5, "tiles": 1, "i": 0, "dead": false }]
    }))
}

fn lost_to(killer: usize) -> ServerEvent {
    ServerEvent::GameLost(GameLost { killer })
}

fn queue_update(is_forcing: bool, num_players: u32, first: &str, game_speed: u32) -> ServerEvent {
    ServerEvent::QueueUpdate(QueueUpdate {
        is_forcing,
        num_players,
        usernames: vec![Some(first.to_string()), None],
        options: LobbyOptions {
            game_speed: Some(game_speed),
        },
    })
}

#[tokio::test]
async fn duel_two_rounds_then_close() {
    let harness = Harness::new(config(GameMode::Duel, 2));
    for event in [
        ServerEvent::Connect,
        game_start("abc"),
        first_update(),
        lost_to(1),
        game_start("def"),
        lost_to(1),
    ] {
        harness.push(event);
    }
    let (exit, harness) = harness.run().await;

    assert_eq!(exit, SessionExit::Clean);
    assert_eq!(exit.code(), 0);
    assert_eq!(harness.socket.count("join_1v1"), 2);
    assert_eq!(harness.socket.count("leave_game"), 2);
    assert_eq!(harness.socket.closes(), 1);

    let game_start_payload = |replay_id: &str| {
        json!({ "game_start": {
            "playerIndex": 0,
            "replay_id": replay_id,
            "usernames": ["me", "enemy"],
            "chat_room": format!("chat_{replay_id}"),
        }})
    };
    assert_eq!(
        harness.state_events(),
        vec![
            json!({ "connected": "me" }),
            json!({ "joined": { "gameType": "1v1" } }),
            game_start_payload("abc"),
            json!({ "game_lost": { "replay_id": "abc", "killer": 1, "killer_name": "enemy" } }),
            json!({ "joined": { "gameType": "1v1" } }),
            game_start_payload("def"),
            json!({ "game_lost": { "replay_id": "def", "killer": 1, "killer_name": "enemy" } }),
            json!({ "disconnected": CLIENT_DISCONNECT }),
        ]
    );

    let outcomes = harness
        .controller
        .history()
        .iter()
        .map(|record| (record.number, record.replay_id.as_str(), record.outcome))
        .collect::<Vec<_>>();
    assert_eq!(
        outcomes,
        vec![
            (1, "abc", Outcome::Lost { killer: 1 }),
            (2, "def", Outcome::Lost { killer: 1 }),
        ]
    );
    assert_eq!(harness.controller.phase(), Phase::Disconnected);
}

#[tokio::test]
async fn server_disconnect_exits_with_code_3_without_rejoining() {
    let harness = Harness::new(config(GameMode::Duel, 5));
    harness.push(ServerEvent::Connect);
    harness.push(ServerEvent::Disconnect(SERVER_DISCONNECT.to_string()));
    let (exit, harness) = harness.run().await;

    assert_eq!(exit, SessionExit::ServerDisconnect);
    assert_eq!(exit.code(), 3);
    assert_eq!(harness.socket.count("join_1v1"), 1);
    assert_eq!(harness.socket.closes(), 0);
    assert_eq!(
        harness.state_events().last(),
        Some(&json!({ "disconnected": SERVER_DISCONNECT }))
    );
    assert_eq!(harness.controller.history()[0].outcome, Outcome::Abandoned);
}

#[tokio::test]
async fn client_disconnect_exits_with_code_0() {
    let harness = Harness::new(config(GameMode::Ffa, 1));
    harness.push(ServerEvent::Connect);
    harness.push(ServerEvent::Disconnect(CLIENT_DISCONNECT.to_string()));
    let (exit, _) = harness.run().await;
    assert_eq!(exit.code(), 0);
}

#[tokio::test]
async fn transport_loss_rejoins_the_same_round() {
    let harness = Harness::new(config(GameMode::Ffa, 3));
    for event in [
        ServerEvent::Connect,
        ServerEvent::Disconnect("transport close".to_string()),
        ServerEvent::Connect,
        game_start("abc"),
        ServerEvent::GameWon,
        ServerEvent::Disconnect(CLIENT_DISCONNECT.to_string()),
    ] {
        harness.push(event);
    }
    let (exit, harness) = harness.run().await;

    assert_eq!(exit, SessionExit::Clean);
    // round 1 joined twice, then round 2 after the win
    assert_eq!(harness.socket.count("play"), 3);
    assert_eq!(harness.controller.round_number(), 2);
    assert_eq!(
        harness.controller.history()[0].outcome,
        Outcome::Won
    );
    assert_eq!(harness.controller.history()[0].number, 1);
}

#[tokio::test(start_paused = true)]
async fn force_start_once_per_round() {
    let mut harness = Harness::new(config(GameMode::Ffa, 2));
    let controller = &mut harness.controller;
    controller.handle_event(ServerEvent::Connect);

    for _ in 0..3 {
        controller.handle_event(queue_update(false, 2, "someone", 1));
    }
    tokio::time::advance(Duration::from_millis(500)).await;
    controller.handle_event(queue_update(false, 3, "someone", 1));
    tokio::time::advance(Duration::from_millis(600)).await;
    controller.fire_due_triggers(Instant::now());
    assert_eq!(harness.socket.count("set_force_start"), 1);

    // later lobby updates in the same round do not send it again
    harness.controller.handle_event(queue_update(false, 4, "someone", 1));
    tokio::time::advance(Duration::from_secs(2)).await;
    harness.controller.fire_due_triggers(Instant::now());
    assert_eq!(harness.socket.count("set_force_start"), 1);
    assert!(harness
        .socket
        .sent()
        .contains(&Command::SetForceStart { game_id: None }));

    // next round resets the guard
    harness.controller.handle_event(game_start("abc"));
    harness.controller.handle_event(ServerEvent::GameWon);
    harness.controller.handle_event(queue_update(false, 2, "someone", 1));
    harness.controller.handle_event(queue_update(false, 2, "someone", 1));
    tokio::time::advance(Duration::from_secs(1)).await;
    harness.controller.fire_due_triggers(Instant::now());
    assert_eq!(harness.socket.count("set_force_start"), 2);
}

#[tokio::test(start_paused = true)]
async fn lobby_already_forcing_is_left_alone() {
    let mut harness = Harness::new(config(GameMode::Duel, 1));
    harness.controller.handle_event(ServerEvent::Connect);
    harness
        .controller
        .handle_event(queue_update(true, 2, "someone", 1));
    assert!(harness.controller.scheduler().is_empty());
    tokio::time::advance(Duration::from_secs(5)).await;
    harness.controller.fire_due_triggers(Instant::now());
    assert_eq!(harness.socket.count("set_force_start"), 0);
}

#[tokio::test(start_paused = true)]
async fn stale_force_start_is_cancelled_by_round_transition() {
    let mut harness = Harness::new(config(GameMode::Ffa, 2));
    harness.controller.handle_event(ServerEvent::Connect);
    harness
        .controller
        .handle_event(queue_update(false, 2, "someone", 1));
    assert_eq!(harness.controller.scheduler().len(), 1);

    harness.controller.handle_event(game_start("abc"));
    harness.controller.handle_event(lost_to(1));
    assert!(harness.controller.scheduler().is_empty());
    tokio::time::advance(Duration::from_secs(5)).await;
    harness.controller.fire_due_triggers(Instant::now());
    assert_eq!(harness.socket.count("set_force_start"), 0);
}

#[tokio::test(start_paused = true)]
async fn transport_loss_drops_pending_force_start() {
    let mut harness = Harness::new(config(GameMode::Ffa, 1));
    let controller = &mut harness.controller;
    controller.handle_event(ServerEvent::Connect);
    controller.handle_event(queue_update(false, 2, "someone", 1));
    controller.handle_event(ServerEvent::Disconnect("transport close".to_string()));
    assert!(controller.scheduler().is_empty());

    tokio::time::advance(Duration::from_secs(1)).await;
    controller.fire_due_triggers(Instant::now());
    assert_eq!(harness.socket.count("set_force_start"), 0);

    harness.controller.handle_event(ServerEvent::Connect);
    harness.controller.handle_event(queue_update(false, 2, "someone", 1));
    tokio::time::advance(Duration::from_secs(1)).await;
    harness.controller.fire_due_triggers(Instant::now());
    assert_eq!(harness.controller.round_number(), 1);
    assert_eq!(harness.socket.count("play"), 2);
    assert_eq!(harness.socket.count("set_force_start"), 1);
}

#[tokio::test(start_paused = true)]
async fn transport_loss_drops_pending_chat_lines() {
    let mut harness = Harness::new(
        config(GameMode::Ffa, 1).with_chat_lines(vec!["gl".to_string(), "hf".to_string()]),
    );
    harness.controller.handle_event(ServerEvent::Connect);
    harness.controller.handle_event(game_start("abc"));
    harness
        .controller
        .handle_event(ServerEvent::Disconnect("ping timeout".to_string()));

    tokio::time::advance(Duration::from_secs(5)).await;
    harness.controller.fire_due_triggers(Instant::now());
    assert_eq!(harness.socket.count("chat_message"), 0);
    assert!(harness.controller.scheduler().is_empty());
}

#[tokio::test(start_paused = true)]
async fn custom_lobby_options_and_force_start_go_out_once() {
    let mut harness = Harness::new(config(
        GameMode::Custom {
            game_id: "lobby".to_string(),
        },
        1,
    ));
    harness.controller.handle_event(ServerEvent::Connect);
    assert_eq!(
        harness.socket.sent()[0],
        Command::JoinPrivate {
            game_id: "lobby".to_string(),
            user_id: "user-id".to_string(),
        }
    );
    for players in 1..=3 {
        harness
            .controller
            .handle_event(queue_update(false, players, "me", 1));
    }
    tokio::time::advance(Duration::from_secs(2)).await;
    harness.controller.fire_due_triggers(Instant::now());

    assert_eq!(harness.socket.count("set_custom_options"), 1);
    assert_eq!(harness.socket.count("set_force_start"), 1);
    let sent = harness.socket.sent();
    assert!(sent.contains(&Command::SetCustomOptions {
        game_id: "lobby".to_string(),
        game_speed: 4,
    }));
    assert!(sent.contains(&Command::SetForceStart {
        game_id: Some("lobby".to_string()),
    }));
    harness.controller.telemetry().flush().await;
    assert_eq!(
        harness.state_events()[1],
        json!({ "joined": { "gameType": "custom", "gameId": "lobby" } })
    );
}

#[tokio::test]
async fn every_round_gets_a_fresh_agent() {
    let mut harness = Harness::new(config(GameMode::Ffa, 2));
    let controller = &mut harness.controller;
    controller.handle_event(ServerEvent::Connect);
    controller.handle_event(game_start("abc"));
    assert_eq!(controller.adapter_id(), None);
    controller.handle_event(first_update());
    controller.handle_event(next_update(2));
    let first = controller.adapter_id().unwrap();
    controller.handle_event(next_update(3));
    assert_eq!(controller.adapter_id(), Some(first));

    controller.handle_event(lost_to(1));
    assert_eq!(controller.adapter_id(), None);

    controller.handle_event(game_start("def"));
    controller.handle_event(first_update());
    let second = controller.adapter_id().unwrap();
    assert_ne!(first, second);
    controller.telemetry().flush().await;

    // move counters start over
    let moves_a = harness.store.list(&format!("{NAMESPACE}-abc-moveCount"));
    let moves_b = harness.store.list(&format!("{NAMESPACE}-def-moveCount"));
    assert_eq!(moves_a.len(), 3);
    assert_eq!(moves_b.len(), 1);
    assert_eq!(moves_a[0], moves_b[0]);
}

#[tokio::test]
async fn game_updates_are_mirrored_to_the_round_keyspace() {
    let mut harness = Harness::new(config(GameMode::Ffa, 1));
    harness.controller.handle_event(ServerEvent::Connect);
    harness.controller.handle_event(game_start("abc"));
    harness.controller.handle_event(first_update());
    harness.controller.handle_event(next_update(2));
    harness.controller.telemetry().flush().await;

    let keyspace = format!("{NAMESPACE}-abc");
    let hash = harness.store.hash(&keyspace);
    let field = |name: &str| serde_json::from_str::<Value>(&hash[name]).unwrap();
    assert_eq!(field("width"), json!(2));
    assert_eq!(field("height"), json!(2));
    assert_eq!(field("size"), json!(4));
    assert_eq!(field("ownGeneral"), json!(0));
    assert_eq!(field("turn"), json!(2));
    assert_eq!(field("armies"), json!([5, 0, 0, 0]));
    assert_eq!(field("terrain"), json!([0, -1, -1, -1]));
    assert_eq!(field("cities"), json!([]));
    assert_eq!(field("discoveredTiles"), json!([true, true, true, true]));
    assert_eq!(field("enemyGeneral"), json!(-1));
    assert_eq!(field("ownTiles"), json!([[0, 5]]));
    assert_eq!(field("enemyTiles"), json!([]));
    assert_eq!(field("replay_id"), json!("abc"));
    assert_eq!(field("playerIndex"), json!(0));
    assert!(harness.store.ttl(&keyspace).is_some());

    assert_eq!(
        harness.store.list(&format!("{keyspace}-maxArmyOnTile")),
        vec!["5", "5"]
    );
    let scores = harness.store.list(&format!("{keyspace}-scores"));
    assert_eq!(scores.len(), 2);
    assert_eq!(
        serde_json::from_str::<Value>(&scores[0]).unwrap(),
        json!([{ "total": 5, "tiles": 1, "i": 0, "dead": false }])
    );
    assert!(harness.store.ttl(&format!("{keyspace}-scores")).is_some());

    let updates = harness.store.published(&format!("{NAMESPACE}-game_update"));
    assert_eq!(updates.len(), 2);
    assert_eq!(serde_json::from_str::<Value>(&updates[0]).unwrap()["turn"], json!(1));
    assert!(harness.socket.count("attack") >= 1);
}

#[tokio::test]
async fn game_update_outside_a_round_is_ignored() {
    let mut harness = Harness::new(config(GameMode::Ffa, 1));
    harness.controller.handle_event(first_update());
    harness.controller.handle_event(ServerEvent::Connect);
    harness.controller.handle_event(first_update());
    harness
        .controller
        .handle_event(ServerEvent::GameUpdate(json!({ "turn": "bogus" })));
    harness.controller.telemetry().flush().await;

    assert_eq!(harness.controller.adapter_id(), None);
    assert_eq!(harness.socket.count("attack"), 0);
    assert!(harness
        .store
        .published(&format!("{NAMESPACE}-game_update"))
        .is_empty());
    assert_eq!(harness.controller.phase(), Phase::Joining);
}

#[tokio::test]
async fn signal_leaves_the_round_then_closes() {
    let mut harness = Harness::new(config(GameMode::Duel, 3));
    harness.controller.handle_event(ServerEvent::Connect);
    harness.controller.handle_event(game_start("abc"));
    harness.controller.on_signal(Signal::Interrupt);
    harness.controller.on_signal(Signal::Terminate);

    let sent = harness.socket.sent();
    assert_eq!(sent.last(), Some(&Command::LeaveGame));
    assert_eq!(harness.socket.closes(), 1);
    assert!(harness.controller.is_closing());

    let (exit, harness) = harness.run().await;
    assert_eq!(exit, SessionExit::Clean);
    assert_eq!(harness.socket.count("join_1v1"), 1);
    assert_eq!(harness.controller.history().len(), 1);
    assert_eq!(harness.controller.history()[0].outcome, Outcome::Abandoned);
}

#[tokio::test]
async fn signal_while_waiting_does_not_leave() {
    let harness = Harness::new(config(GameMode::Duel, 1));
    harness.signal_tx.send(Signal::Terminate).unwrap();
    let (exit, harness) = harness.run().await;
    assert_eq!(exit, SessionExit::Clean);
    assert_eq!(harness.socket.count("leave_game"), 0);
    assert_eq!(harness.socket.closes(), 1);
}

#[tokio::test(start_paused = true)]
async fn hung_store_quit_is_bounded() {
    let store = MemoryStore::new().with_hanging_quit();
    let mut harness = Harness::with_store(
        config(GameMode::Ffa, 1).with_shutdown_timeout(Duration::from_secs(5)),
        store,
    );
    harness.controller.handle_event(ServerEvent::Connect);
    harness.controller.on_signal(Signal::Interrupt);

    let started = Instant::now();
    let (exit, harness) = harness.run().await;
    assert_eq!(exit, SessionExit::ShutdownTimeout);
    assert_eq!(exit.code(), 1);
    assert!(started.elapsed() >= Duration::from_secs(5));
    assert_eq!(harness.store.quit_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn socket_that_never_closes_is_bounded() {
    let mut harness =
        Harness::new(config(GameMode::Ffa, 1).with_shutdown_timeout(Duration::from_secs(2)));
    harness.socket.silent_close.store(true, Ordering::SeqCst);
    harness.controller.handle_event(ServerEvent::Connect);
    harness.controller.on_signal(Signal::Terminate);

    let (exit, _) = harness.run().await;
    assert_eq!(exit, SessionExit::ShutdownTimeout);
}

#[tokio::test(start_paused = true)]
async fn chat_lines_are_paced_in_order() {
    let mut harness = Harness::new(
        config(GameMode::Ffa, 1).with_chat_lines(vec!["gl".to_string(), "hf".to_string()]),
    );
    harness.controller.handle_event(ServerEvent::Connect);
    harness.controller.handle_event(game_start("abc"));

    harness.controller.fire_due_triggers(Instant::now());
    assert_eq!(harness.socket.count("chat_message"), 1);
    tokio::time::advance(Duration::from_millis(999)).await;
    harness.controller.fire_due_triggers(Instant::now());
    assert_eq!(harness.socket.count("chat_message"), 1);
    tokio::time::advance(Duration::from_millis(1)).await;
    harness.controller.fire_due_triggers(Instant::now());

    let chat = harness
        .socket
        .sent()
        .into_iter()
        .filter(|command| command.event_name() == "chat_message")
        .collect::<Vec<_>>();
    assert_eq!(
        chat,
        vec![
            Command::ChatMessage {
                room: "chat_abc".to_string(),
                text: "gl".to_string(),
            },
            Command::ChatMessage {
                room: "chat_abc".to_string(),
                text: "hf".to_string(),
            },
        ]
    );
}

#[tokio::test]
async fn username_is_announced_before_joining() {
    let mut harness = Harness::new(config(GameMode::Ffa, 1).with_set_username(true));
    harness.controller.handle_event(ServerEvent::Connect);
    harness
        .controller
        .handle_event(ServerEvent::SetUsernameResult("taken".to_string()));
    assert_eq!(
        harness.socket.sent(),
        vec![
            Command::SetUsername {
                user_id: "user-id".to_string(),
                username: "me".to_string(),
            },
            Command::Play {
                user_id: "user-id".to_string(),
            },
        ]
    );
}
