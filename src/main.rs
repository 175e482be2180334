use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use chrono::Utc;
use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use vitals_sync::channel::{DeviceSnapshot, LocalFeed};
use vitals_sync::config::PipelineConfig;
use vitals_sync::models::{FeedMode, Metric, SubjectId};
use vitals_sync::roster::Roster;
use vitals_sync::{Command, Monitor};

#[derive(Parser)]
#[command(name = "vitals-sync")]
#[command(about = "Vital-sign stream synchronization and anomaly flagging", long_about = None)]
struct Cli {
    /// JSON file overriding pipeline constants
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the monitored subjects
    Roster,
    /// Push a device snapshot through a live-feed subject
    Replay {
        #[arg(long)]
        snapshot: PathBuf,
        #[arg(long, default_value_t = 1)]
        subject: SubjectId,
        #[arg(long, default_value = "heart-rate")]
        metric: Metric,
        /// Write the historical series as CSV here
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Run the synthetic generator for a simulated subject
    Simulate {
        #[arg(long)]
        subject: SubjectId,
        #[arg(long, default_value_t = 5)]
        ticks: usize,
        #[arg(long, default_value_t = 7)]
        seed: u64,
        #[arg(long, default_value = "heart-rate")]
        metric: Metric,
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

fn load_config(path: Option<&Path>) -> anyhow::Result<PipelineConfig> {
    match path {
        Some(path) => PipelineConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => Ok(PipelineConfig::default()),
    }
}

fn print_readouts(monitor: &Monitor<LocalFeed>, subject: SubjectId) {
    let now = Utc::now();
    for metric in Metric::ALL {
        let summary = monitor.summary(subject, metric);
        println!(
            "- {}: current {} ({}), {} samples, avg {:.1}, {} anomalies",
            metric,
            monitor.current_value(subject, metric),
            monitor.range_status(subject, metric).label(),
            summary.count,
            summary.average,
            summary.anomaly_count
        );
    }
    println!("Latest update: {}", monitor.recency(subject, now).label());
}

fn write_export(
    monitor: &Monitor<LocalFeed>,
    subject: SubjectId,
    metric: Metric,
    out: &Path,
) -> anyhow::Result<()> {
    let payload = monitor.export(subject, metric)?;
    std::fs::write(out, &payload.body)
        .with_context(|| format!("failed to write {}", out.display()))?;
    println!(
        "Export written to {} (suggested name {}, {}).",
        out.display(),
        payload.filename,
        payload.mime
    );
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    let roster = Roster::seed();

    match cli.command {
        Commands::Roster => {
            for subject in roster.subjects() {
                let source = match subject.mode {
                    FeedMode::LiveFeed => "live feed",
                    FeedMode::Synthetic => "synthetic",
                };
                println!(
                    "- {} {} (age {}, device {}, {}) via {}",
                    subject.id, subject.name, subject.age, subject.device_id, subject.status, source
                );
            }
        }
        Commands::Replay {
            snapshot,
            subject,
            metric,
            out,
        } => {
            let raw = std::fs::read_to_string(&snapshot)
                .with_context(|| format!("failed to read {}", snapshot.display()))?;
            let tree: Option<DeviceSnapshot> =
                serde_json::from_str(&raw).context("snapshot is not a device state tree")?;

            let entry = roster.require(subject)?.clone();
            if entry.mode != FeedMode::LiveFeed {
                bail!("subject {} is not backed by a live feed", subject);
            }

            let mut monitor = Monitor::new(config, roster, LocalFeed::new(), StdRng::from_entropy())?;
            monitor.select(subject, Utc::now());
            let delivered = monitor.feed().publish(&entry.device_id, tree);
            let updates = monitor.pump();
            info!(delivered, updates = updates.len(), "snapshot replayed");

            println!("Subject {}: {}", entry.id, entry.name);
            print_readouts(&monitor, subject);

            println!("Alerts (newest first):");
            for alert in monitor.alerts(subject) {
                println!(
                    "- {} {:?} from {}",
                    alert.occurred_at,
                    alert.kind,
                    alert.source.as_deref().unwrap_or("N/A")
                );
            }
            println!("Audio (newest first):");
            for audio in monitor.audio(subject) {
                println!(
                    "- {} {} keyword {}",
                    audio.occurred_at,
                    audio.file_path,
                    audio.keyword.as_deref().unwrap_or("none")
                );
            }
            if monitor.take_capture() {
                println!("Capture requested: latest image available.");
            }

            if let Some(out) = out {
                write_export(&monitor, subject, metric, &out)?;
            }
        }
        Commands::Simulate {
            subject,
            ticks,
            seed,
            metric,
            out,
        } => {
            let entry = roster.require(subject)?.clone();
            if entry.mode != FeedMode::Synthetic {
                bail!("subject {} is backed by a live feed", subject);
            }

            let mut monitor =
                Monitor::new(config, roster, LocalFeed::new(), StdRng::seed_from_u64(seed))?;
            let (commands, rx) = mpsc::unbounded_channel();
            commands
                .send(Command::Select(subject))
                .context("command channel closed")?;

            let ticks = ticks.max(1);
            let mut seen = 0usize;
            monitor
                .run(rx, |monitor, update| {
                    seen += 1;
                    println!(
                        "tick {}: heart rate {} bpm, SpO2 {}%{}",
                        seen,
                        monitor.current_value(subject, Metric::HeartRate),
                        monitor.current_value(subject, Metric::SpO2),
                        if update.capture { " (capture)" } else { "" }
                    );
                    if seen >= ticks {
                        let _ = commands.send(Command::Shutdown);
                    }
                })
                .await;

            println!("Subject {}: {}", entry.id, entry.name);
            print_readouts(&monitor, subject);
            if let Some(out) = out {
                write_export(&monitor, subject, metric, &out)?;
            }
        }
    }

    Ok(())
}
