//! Command line entry point.
//!
//! ```bash
//! round-runner [options] <ffa | 1v1 | custom [id]>
//! ```

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{error, info, warn, Level};

use round_runner::{
    agent::FrontierAgentFactory,
    configuration::{FileConfiguration, GameMode, RunConfiguration},
    connection::{connect, SocketConfig},
    identity, logger,
    session::{SessionController, Signal},
    telemetry::{self, MemoryStore, RedisStore, Telemetry},
};

/// Plays consecutive rounds and mirrors session telemetry into redis.
#[derive(Parser)]
#[command(name = "round-runner", version, long_about = None)]
struct Cli {
    #[command(subcommand)]
    mode: ModeCommand,

    /// Number of games to play
    #[arg(short = 'n', long, default_value_t = 1, global = true)]
    number_of_games: u32,

    /// Enable debugging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Announce the configured display name on connect
    #[arg(short, long, global = true)]
    set_username: bool,

    /// Configuration file
    #[arg(short, long, default_value = "config.json", global = true)]
    config: PathBuf,

    /// Write logs to a timestamped file in this directory instead of stderr
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    /// Game server websocket url
    #[arg(long, env = "BOT_SERVER_URL", global = true)]
    server_url: Option<String>,

    /// Engine.IO protocol revision of the server (3 or 4)
    #[arg(
        long,
        default_value_t = 3,
        value_parser = clap::value_parser!(u8).range(3..=4),
        global = true
    )]
    engine_io: u8,

    /// Keep telemetry in memory instead of writing it to redis
    #[arg(long, global = true)]
    dry_run: bool,
}

#[derive(Subcommand)]
enum ModeCommand {
    /// Free for all
    Ffa,
    /// One vs one
    #[command(name = "1v1")]
    Duel,
    /// Custom game
    Custom {
        /// Custom game id, defaults to `customGameId` of the configuration file
        id: Option<String>,
    },
}

fn build_configuration(cli: &Cli) -> anyhow::Result<RunConfiguration> {
    let file = if cli.config.exists() {
        FileConfiguration::load(&cli.config)?
    } else {
        warn!("{} not found, using defaults", cli.config.display());
        FileConfiguration::default()
    };

    let mode = match &cli.mode {
        ModeCommand::Ffa => GameMode::Ffa,
        ModeCommand::Duel => GameMode::Duel,
        ModeCommand::Custom { id } => GameMode::Custom {
            game_id: id
                .clone()
                .or_else(|| file.custom_game_id().map(str::to_string))
                .context("custom game requires a game id")?,
        },
    };

    let mut config = file
        .into_run_configuration()
        .with_env()?
        .with_mode(mode)
        .with_total_rounds(cli.number_of_games)
        .with_set_username(cli.set_username);
    if let Some(url) = &cli.server_url {
        config = config.with_server_url(url.clone());
    }
    config.validate()
}

fn main() {
    let cli = Cli::parse();

    let level = if cli.debug { Level::DEBUG } else { Level::INFO };
    if let Err(e) = logger::init_logger(level, cli.log_dir.as_deref()) {
        eprintln!("{e:#}");
        std::process::exit(1);
    }

    let config = match build_configuration(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!("configuration error: {e:#}");
            std::process::exit(1);
        }
    };

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("could not start the runtime: {e}");
            std::process::exit(1);
        }
    };

    let code = runtime.block_on(async {
        match run(config, cli.engine_io, cli.dry_run).await {
            Ok(code) => code,
            Err(e) => {
                error!("{e:#}");
                1
            }
        }
    });
    std::process::exit(code);
}

async fn run(config: RunConfiguration, engine_io: u8, dry_run: bool) -> anyhow::Result<i32> {
    let token = identity::derive(config.user_id())?;
    info!(
        "[initializing] {} v{}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );
    info!("[initializing] botId: {token}");
    tracing::debug!(?config, "configuration");

    let namespace = telemetry::namespace(&token, config.store().namespace_label());
    let ttl = config.store().ttl();
    let telemetry = if dry_run {
        info!("dry run, telemetry kept in memory");
        Telemetry::start(MemoryStore::new(), namespace, ttl)
    } else {
        Telemetry::start(RedisStore::open(config.store())?, namespace, ttl)
    };

    let (socket, events) = connect(
        SocketConfig::new(config.server_url()).with_engine_io_version(engine_io),
    );

    let (signal_tx, signals) = mpsc::unbounded_channel();
    #[cfg(unix)]
    {
        let signal_tx = signal_tx.clone();
        tokio::spawn(async move {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut terminate) => {
                    if terminate.recv().await.is_some() {
                        let _ = signal_tx.send(Signal::Terminate);
                    }
                }
                Err(e) => warn!("could not listen for SIGTERM: {e}"),
            }
        });
    }
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = signal_tx.send(Signal::Interrupt);
        }
    });

    let mut controller = SessionController::new(config, socket, telemetry, FrontierAgentFactory);
    let exit = controller.run(events, signals).await;
    info!("exiting with code {}", exit.code());
    Ok(exit.code())
}
