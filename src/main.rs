use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::prelude::*;

use sintra::analysis::AlertsReport;
use sintra::config::{LoggingConfig, SintraConfig};
use sintra::storage::events;

#[derive(Parser)]
#[command(
    name = "sintra",
    about = "Network anomaly detection over distributed ping and traceroute measurements",
    version,
    long_about = None
)]
struct Cli {
    /// Configuration file (defaults to $SINTRA_CONFIG, then ./sintra.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit JSON log lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run detection over every measurement result document
    Detect {
        /// Directory holding measurement_*_result*.json documents
        #[arg(long)]
        results_dir: Option<PathBuf>,

        /// Directory receiving one event document per measurement
        #[arg(long)]
        events_dir: Option<PathBuf>,

        /// Maximum documents processed concurrently
        #[arg(long)]
        workers: Option<usize>,
    },

    /// Show anomaly summaries from the last detection run
    Alerts {
        /// Also list every event
        #[arg(long)]
        detailed: bool,

        /// Restrict the view to one measurement
        #[arg(long)]
        measurement_id: Option<u64>,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,

        /// Directory holding event documents
        #[arg(long)]
        events_dir: Option<PathBuf>,
    },

    /// Validate the configuration and print the effective values
    CheckConfig,

    /// Serve alerts and metrics over HTTP
    Serve {
        /// Bind address
        #[arg(long)]
        bind: Option<String>,
    },
}

fn init_tracing(logging: &LoggingConfig, force_json: bool) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));

    if logging.json || force_json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => SintraConfig::load(path)?,
        None => SintraConfig::load_or_default(),
    };

    init_tracing(&config.logging, cli.log_json);

    match cli.command {
        Commands::Detect {
            results_dir,
            events_dir,
            workers,
        } => {
            if let Some(dir) = results_dir {
                config.paths.results_dir = dir;
            }
            if let Some(dir) = events_dir {
                config.paths.events_dir = dir;
            }
            if let Some(n) = workers {
                config.batch.workers = n;
            }

            tracing::info!(
                results_dir = %config.paths.results_dir.display(),
                workers = config.batch.workers,
                "Running detection"
            );
            let outcome = sintra::run_detect(&config).await?;

            println!("\nSintra Detection Run {}", outcome.run_id);
            println!(
                "{:<15} | {:<11} | {:<7} | {:<9} | Skipped samples",
                "Measurement", "Type", "Probes", "Anomalies"
            );
            println!("{:-<15}-|-{:-<11}-|-{:-<7}-|-{:-<9}-|-{:-<15}", "", "", "", "", "");
            for report in &outcome.reports {
                println!(
                    "{:<15} | {:<11} | {:<7} | {:<9} | {}",
                    report.measurement_id,
                    report.kind.to_string(),
                    report.probes_evaluated,
                    report.anomaly_count(),
                    report.warnings.len()
                );
            }
            for skipped in &outcome.skipped {
                println!("Skipped {}: {}", skipped.path.display(), skipped.reason);
            }
            println!(
                "\n{} documents evaluated, {} skipped, {} anomalies\n",
                outcome.reports.len(),
                outcome.skipped.len(),
                outcome.anomaly_count()
            );
        }
        Commands::Alerts {
            detailed,
            measurement_id,
            json,
            events_dir,
        } => {
            let dir = events_dir.unwrap_or_else(|| config.paths.events_dir.clone());
            let docs = events::read_event_documents(&dir).await?;
            let report = AlertsReport::build(
                docs.iter().map(|d| (d.measurement_id, d.events.as_slice())),
                measurement_id,
                detailed,
            );

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_alerts(&report);
            }
        }
        Commands::CheckConfig => {
            config.validate()?;
            println!("{}", toml::to_string_pretty(&config)?);
            println!("# configuration OK");
        }
        Commands::Serve { bind } => {
            let bind = bind.unwrap_or_else(|| config.api.bind.clone());
            tracing::info!(%bind, "Starting sintra API");
            sintra::serve(&config, &bind).await?;
        }
    }

    Ok(())
}

fn print_alerts(report: &AlertsReport) {
    if report.measurements.is_empty() {
        println!("No event documents found.");
        return;
    }

    for summary in &report.measurements {
        println!("\n=== Measurement {} ===", summary.measurement_id);
        println!(
            "Anomalies: {}   Probes affected: {}   Critical: {}",
            summary.total_anomalies, summary.probes_affected, summary.critical
        );
        if summary.breakdown.is_empty() {
            continue;
        }
        println!("{:<22} | {:<6} | Description", "Kind", "Count");
        println!("{:-<22}-|-{:-<6}-|-{:-<40}", "", "", "");
        for (kind, count) in &summary.breakdown {
            println!("{:<22} | {:<6} | {}", kind.as_str(), count.count, count.description);
        }
    }

    let global = &report.global;
    println!("\n=== Global Summary ===");
    println!("Measurements:            {}", global.measurements);
    println!("Total anomalies:         {}", global.total_anomalies);
    println!("Average per measurement: {:.1}", global.average_per_measurement);
    if !global.breakdown.is_empty() {
        println!("{:<22} | {:<6} | Share", "Kind", "Count");
        println!("{:-<22}-|-{:-<6}-|-{:-<7}", "", "", "");
        for (kind, share) in &global.breakdown {
            println!("{:<22} | {:<6} | {:.1}%", kind.as_str(), share.count, share.percentage);
        }
    }

    if let Some(details) = &report.details {
        println!("\n=== Events ===");
        println!(
            "{:<11} | {:<6} | {:<22} | {:<8} | {:<10} | {:<10} | Target",
            "Measurement", "Probe", "Kind", "Severity", "Value", "Threshold"
        );
        println!(
            "{:-<11}-|-{:-<6}-|-{:-<22}-|-{:-<8}-|-{:-<10}-|-{:-<10}-|-{:-<20}",
            "", "", "", "", "", "", ""
        );
        for d in details {
            println!(
                "{:<11} | {:<6} | {:<22} | {:<8} | {:<10} | {:<10} | {}",
                d.measurement_id,
                d.probe_id,
                d.kind.as_str(),
                d.severity.to_string(),
                format!("{:.1}{}", d.value, d.units),
                format!("{:.1}{}", d.threshold, d.units),
                d.target
            );
        }
    }
    println!();
}
