#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    rust_2018_idioms
)]

//! SmartArt display runtime: wires the bus, ingest, feedback, policy and
//! render loop together and accepts operator commands on stdin.

use std::{
    io::{self, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde_json::json;
use shared_logging::{JsonLogger, LogSink};
use shared_message_bus::{BusMessage, BusPublisher, MemoryBus};
use smartart_engine::{
    transport::SupervisorStats, ArchiveRecorder, BusRouter, BusSupervisor, ControlEvent,
    DeviceCommander, DisplayLoop, EngineTelemetry, FeedbackAggregator, HeadlessRenderer,
    IngestArbitrator, InstallationConfig, MeasurementArchive, RequestGateway, SharedEnvironment,
    SqliteRatingStore,
};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::mpsc::UnboundedSender,
    task::JoinHandle,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "smartart_display",
    version,
    about = "Adaptive SmartArt display driven by sensor telemetry and visitor feedback"
)]
struct Cli {
    /// Installation configuration (TOML). Defaults apply when the file is absent.
    #[arg(long, default_value = "smartart/display_app/data/installation.toml")]
    config: PathBuf,
    /// Seed for the theme policy RNG.
    #[arg(long)]
    seed: Option<u64>,
    /// Skip the operator prompt and run until ctrl-c.
    #[arg(long)]
    detached: bool,
}

#[derive(Debug, PartialEq, Eq)]
enum Command<'a> {
    Publish { topic: &'a str, payload: &'a str },
    Ingest(&'a str),
    Health,
    Status,
    Rate(u32),
    Alert(u32),
    Help,
    Quit,
    Unknown(&'a str),
}

fn parse_command(line: &str) -> Result<Command<'_>> {
    let mut parts = line.trim().splitn(2, ' ');
    let command = parts.next().unwrap_or_default();
    let args = parts.next().unwrap_or("").trim();
    Ok(match command {
        "pub" => {
            let mut pieces = args.splitn(2, ' ');
            match (pieces.next(), pieces.next()) {
                (Some(topic), Some(payload)) if !topic.is_empty() => Command::Publish {
                    topic,
                    payload: payload.trim(),
                },
                _ => bail!("usage: pub <topic> <payload>"),
            }
        }
        "ingest" => {
            if args.is_empty() {
                bail!("usage: ingest <json>");
            }
            Command::Ingest(args)
        }
        "health" => Command::Health,
        "status" => Command::Status,
        "rate" => Command::Rate(args.parse().context("usage: rate <seconds>")?),
        "alert" => Command::Alert(args.parse().context("usage: alert <threshold>")?),
        "help" => Command::Help,
        "quit" | "exit" => Command::Quit,
        other => Command::Unknown(other),
    })
}

struct DisplayApp {
    bus: Arc<MemoryBus>,
    arbitrator: IngestArbitrator,
    gateway: RequestGateway,
    commander: DeviceCommander,
    controls: UnboundedSender<ControlEvent>,
    supervisors: Vec<JoinHandle<SupervisorStats>>,
    display: JoinHandle<Result<u64>>,
}

impl DisplayApp {
    fn bootstrap(config: &InstallationConfig, seed: Option<u64>) -> Result<Self> {
        let bus = Arc::new(MemoryBus::new(config.bus.capacity));
        let log_sink: Option<Arc<dyn LogSink>> = match &config.telemetry.log_path {
            Some(path) => Some(Arc::new(
                JsonLogger::new(path)
                    .with_context(|| format!("opening log file {}", path.display()))?,
            )),
            None => None,
        };
        let telemetry = |module: &str| -> Result<EngineTelemetry> {
            let mut builder = EngineTelemetry::builder(module).event_publisher(bus.clone());
            if let Some(sink) = &log_sink {
                builder = builder.sink(sink.clone());
            }
            builder.build()
        };

        let environment = SharedEnvironment::new(config.initial_source()?);
        let arbitrator = IngestArbitrator::new(environment.clone(), telemetry("ingest")?)
            .with_debug_log(config.ingest.debug_log);
        let transport_telemetry = telemetry("transport")?;
        let router = BusRouter::new(
            arbitrator.clone(),
            config.bus.data_topic.clone(),
            config.bus.mode_topic.clone(),
            transport_telemetry.clone(),
        );
        let recorder = match &config.archive.path {
            Some(path) => Some(ArchiveRecorder::new(
                Arc::new(MeasurementArchive::open(path)?),
                config.bus.data_topic.clone(),
                telemetry("archive")?,
            )),
            None => None,
        };
        let mut gateway = RequestGateway::new(arbitrator.clone(), transport_telemetry.clone());
        if let Some(recorder) = &recorder {
            gateway = gateway.with_archive(recorder.clone());
        }
        let commander = DeviceCommander::new(
            bus.clone(),
            config.bus.sampling_rate_topic.clone(),
            config.bus.motion_alert_topic.clone(),
            transport_telemetry.clone(),
        );

        let display_telemetry = telemetry("display")?;
        let store =
            SqliteRatingStore::new(config.feedback.db_path.clone(), config.feedback_budget());
        let renderer =
            HeadlessRenderer::new(config.display.frame_log_every, display_telemetry.clone());
        let mut builder = DisplayLoop::builder(
            environment,
            FeedbackAggregator::new(Arc::new(store)),
            Box::new(renderer),
        )
        .telemetry(display_telemetry)
        .catalog(config.catalog()?)
        .policy(config.policy_engine())
        .settings(config.display_settings());
        if let Some(seed) = seed {
            builder = builder.seed(seed);
        }
        let mut display = builder.build();
        let controls = display.controls();
        let shutdown = display.shutdown_signal();

        let mut supervisors = vec![BusSupervisor::new(
            "ingest",
            bus.clone(),
            Arc::new(router.clone()),
            router.filters(),
            transport_telemetry,
        )
        .with_backoff(config.backoff())
        .spawn(shutdown.clone())];

        if let Some(recorder) = recorder {
            supervisors.push(
                BusSupervisor::new(
                    "archive",
                    bus.clone(),
                    Arc::new(recorder),
                    vec![config.bus.data_topic.clone()],
                    telemetry("archive")?,
                )
                .with_backoff(config.backoff())
                .spawn(shutdown),
            );
        }

        tracing::info!(
            source = %arbitrator.source(),
            width = config.display.width,
            height = config.display.height,
            fps = config.display.fps,
            feedback_db = %config.feedback.db_path.display(),
            "display runtime started"
        );
        let display = tokio::spawn(async move { display.run().await });

        Ok(Self {
            bus,
            arbitrator,
            gateway,
            commander,
            controls,
            supervisors,
            display,
        })
    }

    /// Applies one operator command; `false` means stop.
    fn handle(&self, command: Command<'_>) -> Result<bool> {
        match command {
            Command::Publish { topic, payload } => {
                self.bus.publish(BusMessage::new(topic, payload))?;
            }
            Command::Ingest(body) => {
                let reply = self.gateway.ingest(body.as_bytes());
                println!("{} {}", reply.status, reply.body);
            }
            Command::Health => println!("{}", self.gateway.health().body),
            Command::Status => {
                let view = self.arbitrator.environment().view();
                println!(
                    "{}",
                    json!({ "source": view.source.as_str(), "snapshot": view.snapshot })
                );
            }
            Command::Rate(seconds) => self.commander.set_sampling_rate(seconds)?,
            Command::Alert(threshold) => self.commander.set_motion_alert(threshold)?,
            Command::Help => print_help(),
            Command::Quit => return Ok(false),
            Command::Unknown(other) => {
                println!("Unknown command: {other}. Type 'help' for usage.");
            }
        }
        Ok(true)
    }

    async fn prompt(&self) -> Result<()> {
        println!("SmartArt display ready. Type 'help' for options.");
        let mut reader = BufReader::new(tokio::io::stdin()).lines();
        loop {
            print!("smartart> ");
            io::stdout().flush()?;
            let line = tokio::select! {
                line = reader.next_line() => match line? {
                    Some(line) => line,
                    None => break,
                },
                _ = tokio::signal::ctrl_c() => break,
            };
            if line.trim().is_empty() {
                continue;
            }
            match parse_command(&line) {
                Ok(command) => match self.handle(command) {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(err) => println!("error: {err:#}"),
                },
                Err(err) => println!("{err:#}"),
            }
        }
        Ok(())
    }

    async fn shutdown(self) -> Result<()> {
        // The loop may already have stopped on its own.
        let _ = self.controls.send(ControlEvent::Quit);
        let frames = self.display.await.context("display task panicked")??;
        for handle in self.supervisors {
            let stats = handle.await.context("bus supervisor panicked")?;
            tracing::info!(
                connections = stats.connections,
                messages = stats.messages,
                failures = stats.failures,
                "bus supervisor stopped"
            );
        }
        tracing::info!(frames, "display runtime stopped");
        Ok(())
    }
}

fn print_help() {
    println!("Commands:");
    println!("  pub <topic> <payload>  publish on the in-process bus");
    println!("  ingest <json>          submit telemetry through the request transport");
    println!("  health                 show the authoritative source");
    println!("  status                 show the current snapshot");
    println!("  rate <seconds>         set the board sampling period");
    println!("  alert <threshold>      set the board motion alert threshold");
    println!("  quit                   stop the display");
}

fn load_config(path: &Path) -> Result<InstallationConfig> {
    if path.exists() {
        InstallationConfig::load(path)
    } else {
        tracing::warn!(path = %path.display(), "config not found, using defaults");
        Ok(InstallationConfig::default())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;
    let app = DisplayApp::bootstrap(&config, cli.seed)?;
    if cli.detached {
        tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    } else {
        app.prompt().await?;
    }
    app.shutdown().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_operator_commands() {
        assert_eq!(
            parse_command("pub smartart/cmd/mode request").unwrap(),
            Command::Publish {
                topic: "smartart/cmd/mode",
                payload: "request"
            }
        );
        assert_eq!(
            parse_command("ingest {\"temperature\": 30}").unwrap(),
            Command::Ingest("{\"temperature\": 30}")
        );
        assert_eq!(parse_command("rate 5").unwrap(), Command::Rate(5));
        assert_eq!(parse_command("exit").unwrap(), Command::Quit);
        assert_eq!(parse_command("dance").unwrap(), Command::Unknown("dance"));
        assert!(parse_command("rate fast").is_err());
        assert!(parse_command("pub onlytopic").is_err());
    }

    #[tokio::test]
    async fn operator_session_drives_the_runtime() {
        let config = InstallationConfig::default();
        let app = DisplayApp::bootstrap(&config, Some(1)).unwrap();
        let ingest = parse_command("ingest {\"temperature\": 30}").unwrap();
        assert!(app.handle(ingest).unwrap());
        assert!(app.handle(parse_command("rate 10").unwrap()).unwrap());
        assert_eq!(
            app.bus.snapshot_matching("smartart/cmd/sampling_rate")[0]
                .text()
                .unwrap(),
            "10"
        );
        assert!(!app.handle(Command::Quit).unwrap());
        app.shutdown().await.unwrap();
    }
}
