use anyhow::{Context, Result};
use chrono::TimeDelta;
use clap::{Args, Parser, Subcommand};
use std::io::{self, BufRead};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use worktrack::analysis::AnalysisGateway;
use worktrack::capabilities::{MacOsIdleMeter, MacOsScreenCapturer, MacOsWindowInspector};
use worktrack::capture::{CaptureConfig, CapturePipeline};
use worktrack::clock::SystemClock;
use worktrack::engine::{EngineConfig, EngineEvent, SessionEngine};
use worktrack::exporter;
use worktrack::kv::JsonStore;
use worktrack::paths;
use worktrack::settings::Settings;
use worktrack::state::{AggregateStore, ArtifactStore};

#[derive(Debug, Parser)]
#[command(name = "worktrack")]
#[command(about = "Track work sessions with periodic screen captures and AI analysis")]
struct Cli {
    /// Directory for the state store and captured images.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the tracking engine interactively.
    Run(RunArgs),
    /// Print cumulative totals and session history.
    Stats,
    /// Take a single capture and exit.
    Capture,
    /// Ask an AI provider about recent captures.
    Analyze(AnalyzeArgs),
    /// Upload session history to the configured server.
    Export,
    /// Update stored settings.
    Configure(ConfigureArgs),
}

#[derive(Debug, Args)]
struct RunArgs {
    #[arg(long, default_value = "30s", value_parser = parse_duration)]
    every: Duration,

    #[arg(long, default_value = "30s", value_parser = parse_duration)]
    activity_every: Duration,

    #[arg(long, default_value = "5m", value_parser = parse_duration)]
    idle_after: Duration,
}

#[derive(Debug, Args)]
struct AnalyzeArgs {
    /// The question to ask about the captures.
    query: String,

    #[arg(long, default_value = "openai")]
    provider: String,

    #[arg(long)]
    model: Option<String>,

    /// How many recent captures to send.
    #[arg(long, default_value_t = 1)]
    recent: usize,
}

#[derive(Debug, Args)]
struct ConfigureArgs {
    #[arg(long)]
    openai_api_key: Option<String>,

    #[arg(long)]
    anthropic_api_key: Option<String>,

    #[arg(long)]
    first_name: Option<String>,

    #[arg(long)]
    last_name: Option<String>,

    #[arg(long)]
    email: Option<String>,

    #[arg(long)]
    server_url: Option<String>,
}

fn parse_duration(value: &str) -> std::result::Result<Duration, String> {
    humantime::parse_duration(value).map_err(|e| e.to_string())
}

struct App {
    kv: Arc<JsonStore>,
    aggregate: AggregateStore,
    artifacts: ArtifactStore,
    pipeline: Arc<CapturePipeline>,
}

fn open_app(data_dir: Option<PathBuf>) -> Result<App> {
    let data_dir = data_dir.unwrap_or_else(paths::default_data_dir);
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("failed to create data directory {}", data_dir.display()))?;

    let kv = Arc::new(JsonStore::open(data_dir.join("store.json"))?);
    let aggregate = AggregateStore::new(kv.clone());
    let artifacts = ArtifactStore::new(kv.clone());
    let pipeline = Arc::new(CapturePipeline::new(
        Arc::new(MacOsScreenCapturer),
        Arc::new(MacOsWindowInspector),
        artifacts.clone(),
        Arc::new(SystemClock),
        CaptureConfig::new(data_dir.join("artifacts")),
    ));

    Ok(App {
        kv,
        aggregate,
        artifacts,
        pipeline,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let app = open_app(cli.data_dir)?;

    match cli.command {
        Commands::Run(args) => run(app, args).await,
        Commands::Stats => {
            print_stats(&app);
            Ok(())
        }
        Commands::Capture => {
            match app.pipeline.capture_once().await? {
                Some(artifact) => println!("captured {}", artifact.storage_path.display()),
                None => eprintln!("capture failed at every fallback level"),
            }
            Ok(())
        }
        Commands::Analyze(args) => {
            let gateway = AnalysisGateway::new(app.pipeline.clone(), app.artifacts.clone());
            let settings = Settings::load(&app.kv);
            let answer = gateway
                .analyze(
                    &args.query,
                    &args.provider,
                    args.model.as_deref(),
                    &settings,
                    args.recent,
                )
                .await?;
            println!("{answer}");
            Ok(())
        }
        Commands::Export => {
            let settings = Settings::load(&app.kv);
            exporter::export(
                &reqwest::Client::new(),
                &settings,
                &app.aggregate,
                &app.artifacts,
            )
            .await
        }
        Commands::Configure(args) => configure(&app, args),
    }
}

fn print_stats(app: &App) {
    let state = app.aggregate.load();
    let sessions = app.aggregate.sessions();
    println!("tracked total: {}", format_ms(state.cumulative_tracked_ms));
    println!("sessions:      {}", sessions.len());
    println!("captures:      {}", app.artifacts.count());
    println!("tracking now:  {}", state.is_tracking);
    if let Some(last) = sessions.last() {
        println!(
            "last session:  {} ({}, {} captures)",
            last.started_at.to_rfc3339(),
            format_ms(last.duration_ms),
            last.artifacts.len()
        );
    }
}

fn format_ms(ms: i64) -> String {
    let total_secs = ms / 1_000;
    format!(
        "{:02}:{:02}:{:02}",
        total_secs / 3_600,
        (total_secs / 60) % 60,
        total_secs % 60
    )
}

fn configure(app: &App, args: ConfigureArgs) -> Result<()> {
    let mut settings = Settings::load(&app.kv);
    if let Some(value) = args.openai_api_key {
        settings.openai_api_key = value;
    }
    if let Some(value) = args.anthropic_api_key {
        settings.anthropic_api_key = value;
    }
    if let Some(value) = args.first_name {
        settings.first_name = value;
    }
    if let Some(value) = args.last_name {
        settings.last_name = value;
    }
    if let Some(value) = args.email {
        settings.email = value;
    }
    if let Some(value) = args.server_url {
        settings.server_url = value;
    }
    settings.save(&app.kv)?;
    println!("settings saved");
    Ok(())
}

async fn run(app: App, args: RunArgs) -> Result<()> {
    let config = EngineConfig {
        capture_interval: args.every,
        activity_interval: args.activity_every,
        idle_threshold: TimeDelta::milliseconds(args.idle_after.as_millis() as i64),
    };
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let engine = SessionEngine::new(
        app.aggregate.clone(),
        app.artifacts.clone(),
        app.pipeline.clone(),
        Arc::new(MacOsWindowInspector),
        Arc::new(MacOsIdleMeter),
        Arc::new(SystemClock),
        config,
        Some(event_tx),
    );

    let event_handle = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            match event {
                EngineEvent::Started {
                    session_id,
                    resumed,
                } => {
                    if resumed {
                        println!("resumed session {session_id}");
                    } else {
                        println!("started session {session_id}");
                    }
                }
                EngineEvent::Tick {
                    session_ms,
                    total_ms,
                } => {
                    log::debug!(
                        "tick: session {} total {}",
                        format_ms(session_ms),
                        format_ms(total_ms)
                    );
                }
                EngineEvent::Activity(sample) => {
                    if sample.is_idle {
                        println!("idle since {}", sample.last_activity_at.to_rfc3339());
                    }
                }
                EngineEvent::ArtifactCommitted(artifact) => {
                    println!("captured {}", artifact.filename);
                }
                EngineEvent::Stopped(outcome) => {
                    println!(
                        "stopped: session {} / total {}",
                        format_ms(outcome.session_duration_ms),
                        format_ms(outcome.cumulative_tracked_ms)
                    );
                }
            }
        }
    });

    // A session left open by a crash resumes before any command is read.
    engine.recover().await?;

    let (command_tx, mut command_rx) = mpsc::unbounded_channel::<String>();
    tokio::task::spawn_blocking(move || {
        eprintln!("commands: start | stop | status | capture | analyze <query> | quit");
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else {
                break;
            };
            if command_tx.send(line).is_err() {
                break;
            }
        }
    });

    let gateway = AnalysisGateway::new(app.pipeline.clone(), app.artifacts.clone());
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                // Fold elapsed time so a restart resumes without losing any.
                engine.checkpoint().await?;
                break;
            }
            line = command_rx.recv() => {
                let Some(line) = line else {
                    engine.checkpoint().await?;
                    break;
                };
                let line = line.trim();
                let (command, rest) = match line.split_once(' ') {
                    Some((head, tail)) => (head, tail.trim()),
                    None => (line, ""),
                };
                match command.to_ascii_lowercase().as_str() {
                    "" => {}
                    "start" => {
                        if !engine.start().await? {
                            eprintln!("already tracking");
                        }
                    }
                    "stop" => {
                        if engine.stop().await?.is_none() {
                            eprintln!("not tracking");
                        }
                    }
                    "status" => {
                        match engine.session_elapsed_ms().await {
                            Some(elapsed) => println!("tracking for {}", format_ms(elapsed)),
                            None => println!("idle"),
                        }
                        print_stats(&app);
                    }
                    "capture" => {
                        if engine.capture_now().await?.is_none() {
                            eprintln!("capture failed at every fallback level");
                        }
                    }
                    "analyze" if !rest.is_empty() => {
                        let settings = Settings::load(&app.kv);
                        match gateway.analyze(rest, "openai", None, &settings, 1).await {
                            Ok(answer) => println!("{answer}"),
                            Err(err) => eprintln!("analysis failed: {err}"),
                        }
                    }
                    "quit" | "exit" => {
                        engine.checkpoint().await?;
                        break;
                    }
                    _ => eprintln!("commands: start | stop | status | capture | analyze <query> | quit"),
                }
            }
        }
    }

    event_handle.abort();
    Ok(())
}
