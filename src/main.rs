//! Vigil: always-on multi-camera recorder

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use color_eyre::{eyre::eyre, Result};
use parking_lot::Mutex;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use vigil::capture::UrlConnector;
use vigil::display::StatusDisplay;
use vigil::recording::factory_for;
use vigil::{Config, EventLog, RecordingOrchestrator};

const USAGE: &str = "usage: vigil [--config <file.toml>]";

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let config = Config::load(config_path()?.as_deref())?;

    // RUST_LOG wins over the configured filter
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("Vigil launching with {} camera(s)", config.cameras.len());

    let (events, event_worker) = EventLog::spawn(&config.logging.log_dir)?;
    let sinks = factory_for(&config.recording.container)?;
    let orchestrator = Arc::new(RecordingOrchestrator::launch(
        &config,
        Arc::new(UrlConnector::new()),
        sinks,
        events,
    )?);

    if config.recording.autostart {
        orchestrator.start_recording();
    }

    let display = Arc::new(Mutex::new(StatusDisplay::new(
        orchestrator.take_viewer_feeds(),
        orchestrator.status(),
    )));
    let status_task = (config.viewer.status_interval_secs > 0).then(|| {
        tokio::spawn(report_status(
            display.clone(),
            Duration::from_secs(config.viewer.status_interval_secs),
        ))
    });

    info!("Commands: start, stop, status, quit");
    let lines = spawn_line_reader(std::io::BufReader::new(std::io::stdin()));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            line = lines.recv_async() => match line {
                Ok(line) => match line.trim() {
                    "start" => orchestrator.start_recording(),
                    "stop" => {
                        // Blocks until every chunk is finalized
                        let orchestrator = orchestrator.clone();
                        tokio::task::spawn_blocking(move || orchestrator.stop_recording()).await?;
                    }
                    "status" => print_status(&display),
                    "quit" | "exit" | "q" => break,
                    "" => {}
                    other => warn!("Unknown command `{}`", other),
                },
                Err(_) => {
                    // Detached from a terminal; run until interrupted
                    tokio::signal::ctrl_c().await?;
                    info!("Interrupted");
                    break;
                }
            },
        }
    }

    if let Some(task) = status_task {
        task.abort();
    }

    info!("Vigil shutting down");
    tokio::task::spawn_blocking(move || orchestrator.shutdown()).await?;
    // Last event senders went away with the pipelines
    tokio::task::spawn_blocking(move || event_worker.join()).await?;

    Ok(())
}

/// Forward input lines from a thread of their own. The thread is never
/// joined, so a read blocked on a terminal cannot hold up exit.
fn spawn_line_reader<R: BufRead + Send + 'static>(input: R) -> flume::Receiver<String> {
    let (tx, rx) = flume::unbounded();
    let spawned = std::thread::Builder::new()
        .name("stdin".into())
        .spawn(move || {
            for line in input.lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
        });
    if let Err(e) = spawned {
        warn!("Console commands unavailable: {}", e);
    }
    rx
}

fn config_path() -> Result<Option<PathBuf>> {
    let mut args = std::env::args().skip(1);
    match args.next().as_deref() {
        None => Ok(None),
        Some("-c" | "--config") => args
            .next()
            .map(|p| Some(PathBuf::from(p)))
            .ok_or_else(|| eyre!("missing config path\n{}", USAGE)),
        Some("-h" | "--help") => {
            println!("{}", USAGE);
            std::process::exit(0);
        }
        Some(other) => Err(eyre!("unexpected argument `{}`\n{}", other, USAGE)),
    }
}

async fn report_status(display: Arc<Mutex<StatusDisplay>>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        for line in display.lock().render() {
            info!(target: "vigil::status", "{}", line);
        }
    }
}

fn print_status(display: &Mutex<StatusDisplay>) {
    for line in display.lock().render() {
        println!("{}", line);
    }
}
