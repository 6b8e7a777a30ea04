use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tracing::info;
use uuid::Uuid;

use granary::config::JobConfig;
use granary::connectors::Checkpoint;
use granary::domain::BatchStatus;
use granary::logging::init_logging;
use granary::pipeline::orchestrator::{CancelFlag, Orchestrator};
use granary::pipeline::report::QualityReporter;
use granary::warehouse::sqlite::SqliteWarehouse;
use granary::warehouse::Warehouse;

#[derive(Parser)]
#[command(name = "granary")]
#[command(about = "ETL pipeline and star-schema warehouse builder")]
#[command(version = "0.1.0")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one source-to-target job from a TOML job file
    Run {
        /// Path to the job configuration file
        #[arg(long)]
        job: PathBuf,
        /// Path to the SQLite warehouse file
        #[arg(long, default_value = "warehouse.db")]
        warehouse: PathBuf,
        /// Only extract records changed after this RFC 3339 timestamp
        #[arg(long)]
        since: Option<String>,
    },
    /// Print the data-quality report for a load batch
    Report {
        #[arg(long, default_value = "warehouse.db")]
        warehouse: PathBuf,
        /// Batch id (UUID)
        #[arg(long)]
        batch_id: String,
        /// Number of quarantined records to include as a sample
        #[arg(long, default_value_t = 10)]
        sample: usize,
    },
    /// List all load batches in the warehouse
    Batches {
        #[arg(long, default_value = "warehouse.db")]
        warehouse: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging();

    match cli.command {
        Commands::Run {
            job,
            warehouse,
            since,
        } => {
            let config = JobConfig::load(&job)?;
            let since = since
                .map(|raw| -> anyhow::Result<Checkpoint> {
                    let at = DateTime::parse_from_rfc3339(&raw)?.with_timezone(&Utc);
                    Ok(Checkpoint::Timestamp { at })
                })
                .transpose()?;

            let store: Arc<dyn Warehouse> = Arc::new(SqliteWarehouse::open(&warehouse)?);
            info!(job = %config.job_name, "running job");
            let result = Orchestrator::new(store)
                .run_job(&config, since, CancelFlag::default())
                .await?;

            let counts = &result.batch.counts;
            println!(
                "batch {} {}: extracted={} accepted={} quarantined={} skipped={}",
                result.batch.id,
                result.batch.status,
                counts.extracted,
                counts.accepted,
                counts.quarantined,
                counts.connector_skipped,
            );
            for rule in &result.report.rule_counts {
                println!(
                    "  rule {} ({}): {}",
                    rule.rule_id, rule.severity, rule.count
                );
            }
            if result.batch.status == BatchStatus::Failed {
                if let Some(reason) = &result.batch.failure_reason {
                    eprintln!("batch failed: {reason}");
                }
                std::process::exit(1);
            }
        }
        Commands::Report {
            warehouse,
            batch_id,
            sample,
        } => {
            let store = SqliteWarehouse::open(&warehouse)?;
            let id = Uuid::parse_str(&batch_id)?;
            let report = QualityReporter::with_sample_limit(sample)
                .summarize(&store, id)
                .await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Batches { warehouse } => {
            let store = SqliteWarehouse::open(&warehouse)?;
            for batch in store.list_batches().await? {
                println!(
                    "{}  {}  {}  job={} source={} accepted={} quarantined={}",
                    batch.id,
                    batch.started_at.format("%Y-%m-%d %H:%M:%S"),
                    batch.status,
                    batch.job_name,
                    batch.source_id,
                    batch.counts.accepted,
                    batch.counts.quarantined,
                );
            }
        }
    }

    Ok(())
}
