use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ncf_pipeline::{archive_status, joined_view, Pipeline, PipelineConfig, RunOptions};
use ncf_store::{table_to_csv, write_table_atomic};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "ncf")]
#[command(about = "Philadelphia new criminal filings tracker")]
#[command(version)]
struct Cli {
    /// Data directory holding the archives (overrides config)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scrape the listing, merge the archive, and fetch missing enrichment
    Update {
        /// Worker-count hint forwarded to the docket portal
        #[arg(long)]
        ntasks: Option<u32>,

        /// Inter-task delay hint forwarded to the docket portal, in seconds
        #[arg(long)]
        sleep: Option<u64>,

        /// Days of listing to scrape, newest first
        #[arg(long)]
        days: Option<u32>,

        /// Stop after the historical merge; no portal traffic
        #[arg(long)]
        skip_enrichment: bool,
    },

    /// Print the filings joined to their enrichment as CSV
    Join {
        /// Write to this file instead of stdout
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Show archive row counts and the open enrichment gap
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        // Logs go to stderr; stdout carries command output such as the
        // joined CSV.
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

const DEFAULT_CONFIG_FILE: &str = "ncf.yaml";

fn load_config(cli: &Cli) -> Result<PipelineConfig> {
    let path = match &cli.config {
        Some(path) => Some(path.clone()),
        // No explicit path: pick up ncf.yaml from the working directory
        // when it exists, otherwise run on defaults.
        None => Path::new(DEFAULT_CONFIG_FILE)
            .exists()
            .then(|| PathBuf::from(DEFAULT_CONFIG_FILE)),
    };
    let mut config = match path {
        Some(path) => PipelineConfig::load(&path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    if let Some(data_dir) = &cli.data_dir {
        config.data_dir = data_dir.clone();
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let mut config = load_config(&cli)?;

    let command = cli.command.unwrap_or(Commands::Update {
        ntasks: None,
        sleep: None,
        days: None,
        skip_enrichment: false,
    });

    match command {
        Commands::Update {
            ntasks,
            sleep,
            days,
            skip_enrichment,
        } => {
            if let Some(ntasks) = ntasks {
                config.portal.ntasks = ntasks;
            }
            if let Some(sleep) = sleep {
                config.portal.sleep_secs = sleep;
            }
            if let Some(days) = days {
                config.scrape.window_days = days;
            }
            let pipeline = Pipeline::new(config)?;
            let summary = pipeline.run(RunOptions { skip_enrichment }).await?;
            println!(
                "update complete: run_id={} stage={:?} scraped={} archive={} gap={} enriched={}",
                summary.run_id,
                summary.completed_stage,
                summary.scraped_rows,
                summary.archive_rows,
                summary.gap_size,
                summary.enrichment_rows_added
            );
        }
        Commands::Join { out } => {
            let table = joined_view(&config).await?;
            match out {
                Some(path) => {
                    write_table_atomic(&path, &table).await?;
                    println!("wrote {} rows to {}", table.len(), path.display());
                }
                None => print!("{}", table_to_csv(&table)),
            }
        }
        Commands::Status { json } => {
            let report = archive_status(&config).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("data dir:     {}", report.data_dir);
                println!("mode:         {:?}", report.mode);
                println!("filings:      {}", report.filings_rows);
                println!("enrichment:   {}", report.enrichment_rows);
                println!("latest batch: {}", report.latest_batch_rows);
                println!("open gap:     {}", report.gap_size);
            }
        }
    }

    Ok(())
}
