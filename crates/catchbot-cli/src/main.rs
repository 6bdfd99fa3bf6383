mod gateway;
mod logging;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use catchbot_contracts::config::AgentConfig;
use catchbot_contracts::events::TransactionLog;
use catchbot_engine::assets::{build_index_from_assets, DownloadReport, SpriteDownloader};
use catchbot_engine::{
    average_hash, BroadcastTask, CatchSellWorkflow, ChatTransport, CollisionPolicy, Dispatcher,
    EventRouter, HttpImageSource, Identification, Identifier, ImageSource, PacedSender, Pacer,
    RouterSettings, WorkflowSettings,
};
use clap::{Parser, Subcommand};
use tracing::info;

use crate::gateway::{DiscordGateway, DiscordRest};

#[derive(Debug, Parser)]
#[command(name = "catchbot", version, about = "Catch-and-sell chat game agent")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Connect to the gateway and play until the connection fails.
    Run(ConfigArgs),
    /// Download every reference sprite listed in the name map.
    GenerateData(ConfigArgs),
    /// Hash an image file or URL and look it up in the reference index.
    Identify(IdentifyArgs),
}

#[derive(Debug, Parser)]
struct ConfigArgs {
    #[arg(long, default_value = "config.json")]
    config: PathBuf,
}

#[derive(Debug, Parser)]
struct IdentifyArgs {
    #[arg(long, default_value = "config.json")]
    config: PathBuf,
    /// Local path or http(s) URL.
    image: String,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("catchbot error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    if cli.log_json {
        logging::init_json();
    } else {
        logging::init();
    }
    match cli.command {
        Command::Run(args) => {
            run_agent(&args.config)?;
            Ok(0)
        }
        Command::GenerateData(args) => run_generate_data(&args.config),
        Command::Identify(args) => run_identify(args),
    }
}

fn load_config(path: &Path) -> Result<AgentConfig> {
    AgentConfig::load(path).with_context(|| format!("failed to load config {}", path.display()))
}

fn load_identifier(config: &AgentConfig) -> Result<Identifier> {
    let policy = CollisionPolicy::from_reject_flag(config.reject_hash_collisions);
    let index = build_index_from_assets(&config.assets, policy)?;
    Ok(Identifier::new(index).with_max_distance(config.max_hash_distance))
}

fn run_agent(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let identifier = Arc::new(load_identifier(&config)?);
    let images: Arc<dyn ImageSource> = Arc::new(HttpImageSource::new()?);
    let transport: Arc<dyn ChatTransport> = Arc::new(DiscordRest::new(config.token.clone())?);
    let pacer = Pacer::from_config(&config.pacer);

    let mut workflow = CatchSellWorkflow::new(
        identifier,
        images,
        PacedSender::new(Arc::clone(&transport), pacer, &config.command_prefix),
        WorkflowSettings::from_config(&config),
    );
    if let Some(path) = &config.events_path {
        let events = TransactionLog::with_new_session(path);
        info!(path = %path.display(), session = events.session_id(), "recording transaction events");
        workflow = workflow.with_events(events);
    }

    let dispatcher = Dispatcher::new(Arc::new(workflow))
        .with_idle_timeout(Duration::from_secs(config.channel_idle_secs));
    let broadcast = BroadcastTask::new(
        PacedSender::new(Arc::clone(&transport), pacer, &config.command_prefix),
        &config.broadcast,
    );
    let regenerator = Arc::new(SpriteDownloader::new(&config.assets)?);
    let mut router = EventRouter::new(
        RouterSettings::from_config(&config),
        dispatcher,
        broadcast,
        transport,
    )
    .with_regenerator(regenerator);

    info!(
        game_bot = %config.game_bot_name,
        white_list = config.white_list.len(),
        limit_iv = config.limit_iv,
        "agent starting"
    );
    let outcome = DiscordGateway::new(config.token.clone()).run(&mut router);
    router.shutdown();
    outcome
}

fn run_generate_data(config_path: &Path) -> Result<i32> {
    let config = load_config(config_path)?;
    let report = SpriteDownloader::new(&config.assets)?.download_all()?;
    println!("{}", describe_report(&report));
    Ok(if report.failed.is_empty() { 0 } else { 1 })
}

fn run_identify(args: IdentifyArgs) -> Result<i32> {
    let config = load_config(&args.config)?;
    let identifier = load_identifier(&config)?;
    let bytes = if args.image.starts_with("http://") || args.image.starts_with("https://") {
        HttpImageSource::new()?.fetch(&args.image)?
    } else {
        fs::read(&args.image).with_context(|| format!("failed to read {}", args.image))?
    };
    let digest = average_hash(&bytes).context("failed to decode image")?;
    match identifier.lookup(digest) {
        Identification::Known(identity) => {
            println!("{digest} {identity}");
            Ok(0)
        }
        Identification::Unknown => {
            println!("{digest} unknown");
            Ok(2)
        }
    }
}

fn describe_report(report: &DownloadReport) -> String {
    let mut lines = vec![format!(
        "downloaded {} sprites, {} failed",
        report.downloaded,
        report.failed.len()
    )];
    for (identity, reason) in &report.failed {
        lines.push(format!("  {identity}: {reason}"));
    }
    lines.join("\n")
}
