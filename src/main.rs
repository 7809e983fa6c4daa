use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::BufReader;

use flowwatch::config::{FlowwatchConfig, ProviderKind};
use flowwatch::pipeline::{feed, PipelineError, StatsSnapshot};
use flowwatch::storage::{export, AnomalyStore};

#[derive(Parser)]
#[command(
    name = "flowwatch",
    about = "Network anomaly scoring and alerting with explained findings",
    version,
    long_about = None
)]
struct Cli {
    /// Config file (default: $FLOWWATCH_CONFIG, then ./flowwatch.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (pipeline workers + HTTP API)
    Serve {
        /// Bind address (overrides api.bind)
        #[arg(long)]
        bind: Option<String>,
    },

    /// Run a feed through the pipeline and print a summary
    Detect {
        /// JSONL observation file, or "-" for stdin
        #[arg(long, conflicts_with = "simulate")]
        feed: Option<String>,

        /// Generate simulated traffic instead of reading a feed
        #[arg(long)]
        simulate: bool,

        /// Simulated narrow-band observations
        #[arg(long, default_value = "100")]
        normal: usize,

        /// Simulated wide-band observations
        #[arg(long, default_value = "10")]
        attack: usize,

        /// Seed for simulated traffic
        #[arg(long, default_value = "7")]
        seed: u64,

        /// Use the local reasoning service (no network)
        #[arg(long)]
        offline: bool,
    },

    /// Show the most recent anomalies
    History {
        /// Number of records
        #[arg(long, default_value = "10")]
        limit: usize,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Export the full anomaly history as CSV
    Export {
        /// Output file path (stdout when omitted)
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let mut config = FlowwatchConfig::resolve(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.api.bind = bind;
            }
            tracing::info!(bind = %config.api.bind, "Starting flowwatch daemon");
            let report = flowwatch::serve(config).await?;
            print_summary(&report);
        }
        Commands::Detect {
            feed: feed_path,
            simulate,
            normal,
            attack,
            seed,
            offline,
        } => {
            if offline {
                config.explain.provider = ProviderKind::Local;
            }
            let pipeline = flowwatch::build_pipeline(&config)?;
            let handle = pipeline.start();
            let sender = handle.sender();

            match feed_path.as_deref() {
                Some("-") => {
                    let summary = feed::replay(BufReader::new(tokio::io::stdin()), sender).await?;
                    tracing::info!(sent = summary.sent, malformed = summary.malformed, "stdin feed done");
                }
                Some(path) => {
                    let file = tokio::fs::File::open(path)
                        .await
                        .with_context(|| format!("failed to open feed {path}"))?;
                    feed::replay(BufReader::new(file), sender).await?;
                }
                None => {
                    if !simulate {
                        tracing::info!("no --feed given, using simulated traffic");
                    }
                    let traffic = feed::simulated_traffic(normal, attack, seed);
                    feed::send_all(traffic, sender).await?;
                }
            }

            match handle.finish().await {
                Ok(report) => print_summary(&report),
                Err(PipelineError::Persist { lost, report }) => {
                    print_summary(&report);
                    anyhow::bail!("{lost} anomalies could not be persisted");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Commands::History { limit, json } => {
            let store = AnomalyStore::open(&config.storage.db_path)?;
            let records = store.recent_history(limit)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else if records.is_empty() {
                println!("No anomalies recorded.");
            } else {
                println!(
                    "{:<6} | {:<20} | {:<39} | {:>10} | {:>10} | Explanation",
                    "ID", "Timestamp", "Source", "Size", "Time"
                );
                println!("{:-<6}-|-{:-<20}-|-{:-<39}-|-{:-<10}-|-{:-<10}-|-{:-<30}", "", "", "", "", "", "");
                for r in &records {
                    println!(
                        "{:<6} | {:<20} | {:<39} | {:>10.1} | {:>10.1} | {}",
                        r.id,
                        r.timestamp.format("%Y-%m-%d %H:%M:%S"),
                        if r.source_address.is_empty() { "-" } else { &r.source_address },
                        r.packet_size,
                        r.response_time,
                        r.explanation.lines().next().unwrap_or(""),
                    );
                }
            }
        }
        Commands::Export { output } => {
            let store = AnomalyStore::open(&config.storage.db_path)?;
            let records = store.all()?;
            match output {
                Some(path) => {
                    let mut file = std::io::BufWriter::new(
                        std::fs::File::create(&path)
                            .with_context(|| format!("failed to create {}", path.display()))?,
                    );
                    let rows = export::write_csv(&mut file, &records)?;
                    std::io::Write::flush(&mut file)?;
                    tracing::info!(rows, path = %path.display(), "history exported");
                }
                None => {
                    let stdout = std::io::stdout();
                    let mut lock = stdout.lock();
                    export::write_csv(&mut lock, &records)?;
                }
            }
        }
    }

    Ok(())
}

fn print_summary(report: &StatsSnapshot) {
    println!("\n=== flowwatch run summary ===");
    println!("Received:              {}", report.received);
    println!(
        "Dropped:               {} (address {}, feature {}, model {})",
        report.dropped(),
        report.dropped_invalid_address,
        report.dropped_invalid_feature,
        report.dropped_model_error
    );
    println!("Normal:                {}", report.normal);
    println!("Anomalies:             {}", report.anomalies);
    println!("Persisted:             {}", report.persisted);
    println!("Degraded explanations: {}", report.degraded_explanations);
    println!("Store failures:        {}", report.store_failures);
    println!("=============================\n");
}
