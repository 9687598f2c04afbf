use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use pkgstats_core::{Family, PackageName};
use pkgstats_sync::{EtlOutcome, ReadService};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "pkgstats-cli")]
#[command(about = "Package download statistics ETL")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Load one day from the warehouse (yesterday by default).
    Etl {
        #[arg(long)]
        date: Option<NaiveDate>,
        /// Skip the retention purge after loading.
        #[arg(long)]
        no_purge: bool,
    },
    /// Backfill a package up to yesterday if it is behind.
    EnsureFresh { package: PackageName },
    /// Run the daily ETL on its cron schedule until interrupted.
    Schedule,
    /// Print stored statistics for a package.
    Show {
        package: PackageName,
        /// One category family; omit for a per-family summary.
        #[arg(long)]
        family: Option<Family>,
        /// Include the recent day/week/month totals.
        #[arg(long)]
        recent: bool,
    },
    /// Verify the relational store is reachable.
    Check,
    /// Top packages by downloads over the last `days`.
    Popular {
        #[arg(long, default_value_t = 30)]
        days: u64,
        #[arg(long, default_value_t = 10)]
        limit: i64,
    },
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let (mut config, service) = pkgstats_sync::build_service_from_env().await?;

    match cli.command.unwrap_or(Commands::Etl { date: None, no_purge: false }) {
        Commands::Etl { date, no_purge } => {
            let outcome = service.run(date, !no_purge).await?;
            if let EtlOutcome::Completed(report) = &outcome {
                info!(
                    run_id = %report.run_id,
                    date = %report.date,
                    rows = report.rows_fetched,
                    marked = report.marked_processed,
                    "etl complete"
                );
            }
            print_json(&outcome)?;
        }
        Commands::EnsureFresh { package } => {
            let outcome = service.ensure_fresh(&package).await;
            print_json(&outcome)?;
        }
        Commands::Schedule => {
            config.scheduler_enabled = true;
            let sched = pkgstats_sync::maybe_build_scheduler(&config, service)
                .await?
                .context("scheduler was not built")?;
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.etl_cron, "scheduler running");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            info!("shutting down");
        }
        Commands::Show { package, family, recent } => {
            let reads = ReadService::new(service);
            match family {
                Some(family) => print_json(&reads.series(family, &package, None).await?)?,
                None => print_json(&reads.summary(&package).await?)?,
            }
            if recent {
                print_json(&reads.recent(&package).await?)?;
            }
        }
        Commands::Check => {
            service.health_check().await?;
            print_json(&serde_json::json!({ "store": "ok" }))?;
        }
        Commands::Popular { days, limit } => {
            let reads = ReadService::new(service);
            print_json(&reads.popular_packages(limit, days).await?)?;
        }
    }

    Ok(())
}
