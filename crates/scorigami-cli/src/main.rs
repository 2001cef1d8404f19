use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use scorigami_sync::{build_scheduler, check_reachable, SyncConfig, SyncPipeline};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "scorigami-cli")]
#[command(about = "MLB scorigami pipeline: daily sync, exports and historical imports")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch yesterday's and today's finished games, append new ones, re-export.
    Sync {
        /// Read saved `schedule_YYYY-MM-DD.json` files instead of calling the Stats API.
        #[arg(long)]
        schedule_dir: Option<PathBuf>,
    },
    /// Write the franchise score-count CSV.
    Export {
        /// Also regenerate the full gamelog CSV.
        #[arg(long)]
        gamelogs: bool,
    },
    /// Load Retrosheet game logs from `<data-dir>/regular-season` and `<data-dir>/playoffs`.
    Import {
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Replace the team tables from a franchise CSV.
    Teams {
        #[arg(long)]
        csv: Option<PathBuf>,
    },
    Migrate,
    /// Refresh `mlb_scorigami` and rebuild `franchise_scorigami`.
    Refresh,
    /// Score combinations involving one team.
    Lookup { team: String },
    /// Check that the database host accepts TCP connections.
    Check {
        #[arg(long, default_value_t = 5)]
        timeout_secs: u64,
    },
    /// Run the daily sync on `SCORIGAMI_SYNC_CRON` until interrupted.
    Schedule,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let mut config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync { schedule_dir: None }) {
        Commands::Sync { schedule_dir } => {
            if schedule_dir.is_some() {
                config.schedule_dir = schedule_dir;
            }
            let pipeline = SyncPipeline::from_config(config).await?;
            let summary = pipeline.run_daily(Utc::now()).await?;
            println!(
                "sync complete: run_id={} fetched={} inserted={} skipped={} novel={} report={}",
                summary.run_id,
                summary.fetched_games,
                summary.inserted,
                summary.skipped,
                summary.novel.len(),
                summary.report_path
            );
            for game in &summary.novel {
                println!(
                    "scorigami: {} {} {} @ {} {}",
                    game.date,
                    game.visitor_team,
                    game.visitor_score,
                    game.home_team,
                    game.home_score
                );
            }
        }
        Commands::Export { gamelogs } => {
            let pipeline = SyncPipeline::from_config(config).await?;
            let scores = pipeline.export_scores().await?;
            println!("wrote {} ({} rows, sha256 {})", scores.path, scores.rows, scores.sha256);
            if gamelogs {
                let logs = pipeline.export_gamelogs().await?;
                println!("wrote {} ({} rows, sha256 {})", logs.path, logs.rows, logs.sha256);
            }
        }
        Commands::Import { data_dir } => {
            if let Some(dir) = data_dir {
                config.data_dir = dir;
            }
            let dirs = config.retrosheet_dirs();
            let pipeline = SyncPipeline::from_config(config).await?;
            let summary = pipeline.import_retrosheet(&dirs).await?;
            println!(
                "import complete: files={} parsed={} unique={} trimmed={} inserted={}",
                summary.files, summary.parsed, summary.unique, summary.trimmed, summary.inserted
            );
        }
        Commands::Teams { csv } => {
            let path = csv.unwrap_or_else(|| config.teams_csv.clone());
            let pipeline = SyncPipeline::from_config(config).await?;
            let loaded = pipeline.load_teams(&path).await?;
            println!("loaded {loaded} team rows from {}", path.display());
        }
        Commands::Migrate => {
            SyncPipeline::from_config(config).await?;
            println!("migrations applied");
        }
        Commands::Refresh => {
            let pipeline = SyncPipeline::from_config(config).await?;
            let summary = pipeline.refresh().await?;
            println!("refreshed: franchise_scorigami rows={}", summary.franchise_rows);
        }
        Commands::Lookup { team } => {
            let pipeline = SyncPipeline::from_config(config).await?;
            let rows = pipeline.lookup(&team).await?;
            if rows.is_empty() {
                println!("no games found for {team}");
            }
            for row in rows {
                println!(
                    "{} {} - {} {}  x{}",
                    row.home_team, row.home_score, row.visitor_score, row.visitor_team, row.n
                );
            }
        }
        Commands::Check { timeout_secs } => {
            let (host, port) = config.reachability_target()?;
            let elapsed = check_reachable(&host, port, Duration::from_secs(timeout_secs)).await?;
            println!("database reachable at {host}:{port} ({} ms)", elapsed.as_millis());
        }
        Commands::Schedule => {
            let pipeline = Arc::new(SyncPipeline::from_config(config).await?);
            let cron = pipeline.config().sync_cron.clone();
            let mut sched = build_scheduler(pipeline).await?;
            sched.start().await.context("starting scheduler")?;
            info!(%cron, "scheduler running; ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
