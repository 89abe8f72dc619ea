use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, Instrument};
use uuid::Uuid;

mod aggregate;
mod config;
mod db;
mod endpoint;
mod error;
mod featurize;
mod logging;
mod matrix;
mod models;
mod pipeline;
mod report;
mod scoring;
mod secrets;
mod training;

use config::Config;
use db::PgStore;
use endpoint::{HttpModelEndpoint, ModelEndpoint};
use pipeline::{ModelPair, Pipeline, ScoringOptions};
use secrets::{EnvSecretStore, FileSecretStore, SecretStore};

#[derive(Parser)]
#[command(name = "visit-anomaly-scoring")]
#[command(about = "Behavioral anomaly scoring for facility visit events", long_about = None)]
struct Cli {
    /// Read database credentials from USERNAME, PASSWORD, HOST, PORT and DB
    #[arg(long, global = true)]
    use_env: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Score the trailing interval of visit events and append the results
    Run {
        /// Score without appending to the prediction tables
        #[arg(long)]
        dry_run: bool,
        /// Also write a markdown summary of the run
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Write model training CSVs from the full event history
    ExportTraining {
        #[arg(long, default_value = "data")]
        out_dir: PathBuf,
        #[arg(long, default_value_t = aggregate::DEFAULT_WINDOW_DAYS)]
        window_days: i64,
    },
    /// Featurize a CSV export of raw visit events
    Featurize {
        #[arg(long)]
        csv: PathBuf,
        #[arg(long)]
        out: PathBuf,
    },
}

fn http_endpoint(config: &Config, name: &str) -> anyhow::Result<Arc<dyn ModelEndpoint>> {
    let endpoint =
        HttpModelEndpoint::new(config.model_endpoint_url()?, name, config.endpoint_timeout)?;
    Ok(Arc::new(endpoint))
}

async fn connect(config: &Config, use_env: bool) -> anyhow::Result<PgStore> {
    let secrets: Box<dyn SecretStore> = if use_env {
        Box::new(EnvSecretStore::from_env())
    } else {
        Box::new(FileSecretStore::new(&config.secrets_dir))
    };
    let credentials = secrets
        .get(&config.rds_secret_name)
        .await
        .context("failed to read database credentials")?;
    PgStore::connect(&credentials, config).await
}

async fn run(
    config: &Config,
    use_env: bool,
    dry_run: bool,
    report: Option<PathBuf>,
) -> anyhow::Result<()> {
    let pipeline = Pipeline::new(
        ModelPair {
            scorer: http_endpoint(config, &config.event_prediction_endpoint)?,
            explainer: http_endpoint(config, &config.event_estimator_endpoint)?,
        },
        ModelPair {
            scorer: http_endpoint(config, &config.actor_prediction_endpoint)?,
            explainer: http_endpoint(config, &config.actor_estimator_endpoint)?,
        },
        ScoringOptions {
            attribution_batch_size: config.attribution_batch_size,
            max_concurrency: config.endpoint_max_concurrency,
        },
    );

    let mut store = connect(config, use_env).await?;
    let outcome = pipeline.run(&mut store, &config.interval, !dry_run).await;
    let summary = store.close_after(outcome).await?;

    if let Some(path) = report {
        std::fs::write(&path, report::build_report(&summary))
            .with_context(|| format!("failed to write {}", path.display()))?;
        info!(path = %path.display(), "report written");
    }

    summary.ensure_complete()?;
    info!(
        events = summary.events.as_ref().map(|t| t.len()).unwrap_or(0),
        persons_of_interest = summary.actors.as_ref().map(|t| t.len()).unwrap_or(0),
        persisted = summary.persisted,
        "scoring run complete"
    );
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { dry_run, report } => {
            let config = Config::from_env().context("invalid configuration")?;
            config.model_endpoint_url().context("invalid configuration")?;

            let span = tracing::info_span!("run", run_id = %Uuid::new_v4());
            run(&config, cli.use_env, dry_run, report)
                .instrument(span)
                .await?;
        }
        Commands::ExportTraining {
            out_dir,
            window_days,
        } => {
            let config = Config::from_env().context("invalid configuration")?;
            anyhow::ensure!(window_days > 0, "--window-days must be positive");

            let mut store = connect(&config, cli.use_env).await?;
            let outcome =
                training::export(&mut store, &out_dir, chrono::Duration::days(window_days)).await;
            let files = store.close_after(outcome).await?;
            println!(
                "Wrote {} event rows to {} and {} person of interest rows to {}.",
                files.event_rows,
                files.event_path.display(),
                files.actor_rows,
                files.actor_path.display()
            );
        }
        Commands::Featurize { csv, out } => {
            let count = training::featurize_csv(&csv, &out)?;
            println!(
                "Featurized {count} completed visits from {} into {}.",
                csv.display(),
                out.display()
            );
        }
    }

    Ok(())
}
