mod logging;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use eventscout_storage::{EventStore, MemoryEventStore, PgEventStore};
use eventscout_sync::{run_detail_loop, SyncConfig, SyncServices};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "eventscout")]
#[command(about = "Crawls event listings, deduplicates them and enriches their details")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Crawl every SCRAPER_INTERVAL_MINUTES until Ctrl-C.
    Crawl,
    /// Run a single crawl cycle.
    CrawlOnce {
        /// Write to an in-memory store instead of the database.
        #[arg(long)]
        dry_run: bool,
    },
    /// Refresh event details every DETAIL_INTERVAL_MINUTES until Ctrl-C.
    Details,
    /// Run a single detail refresh.
    DetailsOnce {
        /// Overrides DETAIL_BATCH_LIMIT.
        #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
        limit: Option<u32>,
    },
    /// Apply pending database migrations.
    Migrate,
    /// Event totals per platform.
    Stats {
        /// Also list the most recently created events.
        #[arg(long, default_value_t = 0)]
        recent: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = SyncConfig::from_env().context("loading configuration")?;
    let _log_guard = logging::init(config.log_dir.as_deref())?;

    match cli.command.unwrap_or(Commands::Crawl) {
        Commands::Crawl => {
            let store = connect(&config).await?;
            let services = SyncServices::load(config, store).await?;
            let scheduler = services.scheduler();
            scheduler.start().await?;
            wait_for_ctrl_c().await;
            scheduler.stop().await?;
            println!("crawl stopped after {} cycles", scheduler.cycle_count());
        }
        Commands::CrawlOnce { dry_run } => {
            let memory = MemoryEventStore::new();
            let store: Arc<dyn EventStore> = if dry_run {
                info!("dry run: writing to an in-memory store");
                Arc::new(memory.clone())
            } else {
                connect(&config).await?
            };
            let services = SyncServices::load(config, store).await?;
            let scheduler = services.scheduler();
            let report = tokio::select! {
                report = scheduler.run_cycle() => report,
                _ = wait_for_ctrl_c() => {
                    scheduler.stop().await?;
                    None
                }
            };
            match report {
                Some(report) => print!("{}", report.render()),
                None => println!("crawl cycle interrupted"),
            }
            if dry_run {
                for event in memory.events().await {
                    let date = if event.date_time.is_empty() { &event.date } else { &event.date_time };
                    println!("{:<12} {:<60} {}", event.platform, event.name, date);
                }
            }
        }
        Commands::Details => {
            let store = connect(&config).await?;
            let interval = config.detail_interval;
            let limit = config.detail_batch_limit;
            let services = SyncServices::load(config, store).await?;
            let refresher = services.refresher();

            let cancel = CancellationToken::new();
            spawn_ctrl_c_cancel(cancel.clone());
            let runs = run_detail_loop(&refresher, interval, limit, &cancel).await;
            println!("detail loop stopped after {runs} runs");
        }
        Commands::DetailsOnce { limit } => {
            let limit = limit.or(config.detail_batch_limit);
            let store = connect(&config).await?;
            let services = SyncServices::load(config, store).await?;
            let refresher = services.refresher();

            let cancel = CancellationToken::new();
            spawn_ctrl_c_cancel(cancel.clone());
            let (outcome, summary) = refresher.run_once(limit, &cancel).await?;
            let stats = outcome.stats();
            println!(
                "details: {} inserted, {} updated, {} failed ({} of {} candidates reached{})",
                summary.inserted,
                summary.updated,
                summary.failed,
                stats.reached,
                stats.candidates,
                if outcome.deadline_reached() { ", stopped early" } else { "" }
            );
        }
        Commands::Migrate => {
            let store = PgEventStore::connect(&config.database_url)
                .await
                .context("connecting to database")?;
            store.migrate().await.context("running migrations")?;
            println!("migrations applied");
        }
        Commands::Stats { recent } => {
            let store = connect(&config).await?;
            let stats = store.stats().await.context("reading event stats")?;
            println!("total events: {}", stats.total_events);
            for platform in &stats.platforms {
                println!("  {:<12} {}", platform.platform, platform.events);
            }
            if recent > 0 {
                let events = store
                    .recent_events(i64::from(recent))
                    .await
                    .context("reading recent events")?;
                for event in events {
                    println!("{:<12} {:<60} {}", event.platform, event.name, event.location);
                }
            }
        }
    }

    Ok(())
}

async fn connect(config: &SyncConfig) -> Result<Arc<dyn EventStore>> {
    let store = PgEventStore::connect(&config.database_url)
        .await
        .context("connecting to database")?;
    store.migrate().await.context("running migrations")?;
    Ok(Arc::new(store))
}

async fn wait_for_ctrl_c() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "listening for Ctrl-C failed");
        std::future::pending::<()>().await;
    }
    info!("Ctrl-C received; shutting down");
}

fn spawn_ctrl_c_cancel(cancel: CancellationToken) {
    tokio::spawn(async move {
        wait_for_ctrl_c().await;
        cancel.cancel();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn details_once_limit_must_be_positive() {
        for bad in ["-1", "0", "many"] {
            assert!(
                Cli::try_parse_from(["eventscout", "details-once", "--limit", bad]).is_err(),
                "accepted --limit {bad}"
            );
        }

        let cli = Cli::try_parse_from(["eventscout", "details-once", "--limit", "25"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::DetailsOnce { limit: Some(25) })));
    }

    #[test]
    fn every_subcommand_is_described_in_help() {
        use clap::CommandFactory;

        let command = Cli::command();
        for sub in command.get_subcommands() {
            assert!(sub.get_about().is_some(), "{} has no help text", sub.get_name());
        }
    }
}
