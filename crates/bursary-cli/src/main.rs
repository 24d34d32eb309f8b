use anyhow::Result;
use bursary_core::{BursaryRecord, BursaryStatus};
use bursary_sync::{CheckConfig, CheckPipeline, CheckRun};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "bursary-cli")]
#[command(about = "Check which bursaries for a field of study are still open")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Discover, fetch and classify every bursary listed for a field.
    Check {
        #[arg(long)]
        field: String,
        /// Ignore any cached results and re-fetch.
        #[arg(long)]
        refresh: bool,
        #[arg(long)]
        open_only: bool,
        #[arg(long)]
        json: bool,
        #[arg(long)]
        workers: Option<usize>,
        /// Classify against this date (YYYY-MM-DD) instead of today.
        #[arg(long)]
        as_of: Option<NaiveDate>,
    },
    /// Print the category page URL for a field.
    Url {
        #[arg(long)]
        field: String,
    },
    /// Delete the cached results for a field.
    ClearCache {
        #[arg(long)]
        field: String,
    },
}

fn init_telemetry() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn,bursary_sync=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_telemetry();

    let mut config = CheckConfig::from_env();

    match cli.command {
        Commands::Check {
            field,
            refresh,
            open_only,
            json,
            workers,
            as_of,
        } => {
            config.refresh = refresh;
            if let Some(workers) = workers {
                config.workers = workers.max(1);
            }
            if as_of.is_some() {
                config.reference_date = as_of;
            }

            let pipeline = CheckPipeline::new(config)?;
            let mut run = match pipeline.run_once(&field).await {
                Ok(run) => run,
                Err(err) if err.is_empty_listing() => {
                    eprintln!("no bursaries found for {field}: {err}");
                    return Ok(());
                }
                Err(err) => return Err(err.into()),
            };
            if open_only {
                run.records.retain(BursaryRecord::is_open);
            }

            if json {
                print_json(&run)?;
            } else {
                print_table(&run);
            }
        }
        Commands::Url { field } => {
            let pipeline = CheckPipeline::new(config)?;
            println!("{}", pipeline.category_url(&field));
        }
        Commands::ClearCache { field } => {
            let pipeline = CheckPipeline::new(config)?;
            let path = pipeline.cache().entry_path(&bursary_core::field_slug(&field));
            if pipeline.clear_cache(&field).await? {
                println!("removed {}", path.display());
            } else {
                println!("no cache entry at {}", path.display());
            }
        }
    }

    Ok(())
}

fn print_json(run: &CheckRun) -> Result<()> {
    let payload = serde_json::json!({
        "summary": run.summary,
        "records": run.records,
    });
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}

fn print_table(run: &CheckRun) {
    for record in &run.records {
        let closing = record
            .closing_date
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!("{:<8} {:<10}  {}", record.status.as_str(), closing, record.name);
        println!("{:<20}{}", "", record.url);
        if record.status == BursaryStatus::Open && !record.details.is_empty() {
            println!("{:<20}{}", "", record.details);
        }
    }

    let s = &run.summary;
    println!(
        "check complete: run_id={} field={} candidates={} open={} closed={} unknown={} errors={}{}",
        s.run_id,
        s.field,
        s.candidates,
        s.open,
        s.closed,
        s.unknown,
        s.errors,
        if s.from_cache { " (cached)" } else { "" }
    );
}
