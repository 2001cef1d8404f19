//! Scorigami pipeline orchestration: daily Stats API sync, exports, imports, scheduler.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use scorigami_adapters::{
    collect_retrosheet_files, dedupe_and_sort, load_team_rows, read_retrosheet_file,
    scheduled_game_to_gamelog, AdapterContext, FileScheduleSource, FranchiseDirectory,
    ScheduleSource, StatsApiSource, DEFAULT_STATSAPI_BASE_URL,
};
use scorigami_core::{novel_scores, GameLog, ScheduledGame, ScoreCount, TeamScoreCount};
use scorigami_storage::{DbOptions, HttpClientConfig, HttpFetcher, ScorigamiDb};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use url::Url;
use uuid::Uuid;

mod export;
mod ledger;

pub use export::{
    publish, read_manifest, render_gamelogs_csv, render_score_counts_csv, sha256_hex, write_atomic,
    ExportManifest, ExportSummary, ManifestFile, GAMELOGS_CSV, MANIFEST_JSON, SCORES_CSV,
};
pub use ledger::ProcessedGames;

pub const CRATE_NAME: &str = "scorigami-sync";

const DEFAULT_DB_PORT: u16 = 5432;

/// Connection pieces read from `DB_*` variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbCredentials {
    pub user: String,
    pub password: String,
    pub host: String,
    pub port: u16,
    pub name: String,
}

impl Default for DbCredentials {
    fn default() -> Self {
        Self {
            user: "postgres".to_string(),
            password: String::new(),
            host: "localhost".to_string(),
            port: DEFAULT_DB_PORT,
            name: "mlb_scorigami".to_string(),
        }
    }
}

impl DbCredentials {
    /// Percent-encodes user and password so secrets with `@` or `/` survive.
    pub fn database_url(&self) -> Result<String> {
        let mut url = Url::parse("postgres://localhost").context("building database url")?;
        url.set_host(Some(&self.host))
            .with_context(|| format!("invalid DB_HOST {:?}", self.host))?;
        url.set_port(Some(self.port))
            .map_err(|_| anyhow!("cannot set port on database url"))?;
        url.set_username(&self.user)
            .map_err(|_| anyhow!("cannot set DB_USER on database url"))?;
        let password = Some(self.password.as_str()).filter(|p| !p.is_empty());
        url.set_password(password)
            .map_err(|_| anyhow!("cannot set DB_PASSWORD on database url"))?;
        url.set_path(&format!("/{}", self.name));
        Ok(url.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub credentials: DbCredentials,
    pub database_url_override: Option<String>,
    pub db_schema: Option<String>,
    pub outputs_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub teams_csv: PathBuf,
    pub processed_games_path: PathBuf,
    pub data_dir: PathBuf,
    pub statsapi_base_url: String,
    /// Replay saved schedule JSON from this directory instead of calling the API.
    pub schedule_dir: Option<PathBuf>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub sync_cron: String,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Blank values count as unset, except `DB_PASSWORD` which may be empty.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let path = |key: &str, default: &str| {
            get(key)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(default))
        };
        let defaults = DbCredentials::default();

        Self {
            credentials: DbCredentials {
                user: get("DB_USER").unwrap_or(defaults.user),
                password: lookup("DB_PASSWORD").unwrap_or(defaults.password),
                host: get("DB_HOST").unwrap_or(defaults.host),
                port: get("DB_PORT")
                    .and_then(|v| parse_setting("DB_PORT", &v))
                    .unwrap_or(defaults.port),
                name: get("DB_NAME").unwrap_or(defaults.name),
            },
            database_url_override: get("DATABASE_URL"),
            db_schema: get("DB_SCHEMA"),
            outputs_dir: path("SCORIGAMI_OUTPUTS_DIR", "outputs"),
            reports_dir: path("SCORIGAMI_REPORTS_DIR", "reports"),
            teams_csv: path("SCORIGAMI_TEAMS_CSV", "teams_with_franchise.csv"),
            processed_games_path: path("SCORIGAMI_PROCESSED_GAMES", "processed_games.txt"),
            data_dir: path("SCORIGAMI_DATA_DIR", "data"),
            statsapi_base_url: get("STATSAPI_BASE_URL")
                .unwrap_or_else(|| DEFAULT_STATSAPI_BASE_URL.to_string()),
            schedule_dir: get("SCORIGAMI_SCHEDULE_DIR").map(PathBuf::from),
            user_agent: get("SCORIGAMI_USER_AGENT")
                .unwrap_or_else(|| format!("mlb-scorigami/{}", env!("CARGO_PKG_VERSION"))),
            http_timeout_secs: get("SCORIGAMI_HTTP_TIMEOUT_SECS")
                .and_then(|v| parse_setting("SCORIGAMI_HTTP_TIMEOUT_SECS", &v))
                .unwrap_or(20),
            sync_cron: get("SCORIGAMI_SYNC_CRON").unwrap_or_else(|| "0 0 10 * * *".to_string()),
        }
    }

    pub fn database_url(&self) -> Result<String> {
        match &self.database_url_override {
            Some(url) => Ok(url.clone()),
            None => self.credentials.database_url(),
        }
    }

    /// Host and port targeted by the reachability check.
    pub fn reachability_target(&self) -> Result<(String, u16)> {
        let Some(raw) = &self.database_url_override else {
            return Ok((self.credentials.host.clone(), self.credentials.port));
        };
        let url = Url::parse(raw).context("parsing DATABASE_URL")?;
        let host = url
            .host_str()
            .ok_or_else(|| anyhow!("DATABASE_URL has no host"))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        Ok((host, url.port().unwrap_or(DEFAULT_DB_PORT)))
    }

    /// `regular-season` and `playoffs` under the data directory.
    pub fn retrosheet_dirs(&self) -> Vec<PathBuf> {
        vec![
            self.data_dir.join("regular-season"),
            self.data_dir.join("playoffs"),
        ]
    }

    pub fn db_options(&self) -> DbOptions {
        DbOptions {
            schema: self.db_schema.clone(),
            ..Default::default()
        }
    }
}

/// Parse a numeric setting. A malformed value is logged and ignored so the default applies.
fn parse_setting<T: FromStr>(key: &str, raw: &str) -> Option<T> {
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = raw, "ignoring malformed setting; using default");
            None
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DailyRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dates: Vec<NaiveDate>,
    pub fetched_games: usize,
    pub completed_games: usize,
    pub already_processed: usize,
    pub already_in_db: usize,
    pub skipped: usize,
    pub inserted: u64,
    pub novel: Vec<GameLog>,
    pub scores_csv: ExportSummary,
    pub gamelogs_csv: Option<ExportSummary>,
    pub report_path: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportSummary {
    pub files: usize,
    pub parsed: usize,
    pub unique: usize,
    pub trimmed: u64,
    pub inserted: u64,
    pub gamelogs_csv: ExportSummary,
}

#[derive(Debug, Clone, Serialize)]
pub struct RefreshSummary {
    pub franchise_rows: u64,
}

pub struct SyncPipeline {
    config: SyncConfig,
    db: ScorigamiDb,
    source: Box<dyn ScheduleSource>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig, db: ScorigamiDb, source: Box<dyn ScheduleSource>) -> Self {
        Self { config, db, source }
    }

    /// Connect, apply pending migrations and pick the schedule source from config.
    pub async fn from_config(config: SyncConfig) -> Result<Self> {
        let url = config.database_url()?;
        let db = ScorigamiDb::connect(&url, config.db_options()).await?;
        db.migrate().await?;
        let source: Box<dyn ScheduleSource> = match &config.schedule_dir {
            Some(dir) => Box::new(FileScheduleSource::new(dir.clone())),
            None => {
                let http = HttpFetcher::new(HttpClientConfig {
                    timeout: Duration::from_secs(config.http_timeout_secs),
                    user_agent: Some(config.user_agent.clone()),
                    ..Default::default()
                })?;
                Box::new(StatsApiSource::new(http, config.statsapi_base_url.clone()))
            }
        };
        Ok(Self::new(config, db, source))
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn db(&self) -> &ScorigamiDb {
        &self.db
    }

    /// Pull yesterday's and today's completed regular-season games, append the new ones, re-export.
    pub async fn run_daily(&self, now: DateTime<Utc>) -> Result<DailyRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let today = now.date_naive();
        let dates: Vec<NaiveDate> = today.pred_opt().into_iter().chain([today]).collect();
        let ctx = AdapterContext {
            run_id,
            fetched_at: now,
        };
        info!(%run_id, source = self.source.source_id(), "starting daily sync");

        let mut by_id: BTreeMap<u64, ScheduledGame> = BTreeMap::new();
        for date in &dates {
            let span = info_span!("schedule_fetch", %run_id, %date);
            match self.source.fetch_schedule(&ctx, *date).instrument(span).await {
                Ok(games) => {
                    for game in games {
                        by_id.entry(game.game_id).or_insert(game);
                    }
                }
                Err(err) => warn!(%date, error = %err, "schedule fetch failed; skipping date"),
            }
        }
        let fetched_games = by_id.len();

        let mut ledger = ProcessedGames::load(&self.config.processed_games_path).await;
        if ledger.is_empty() {
            info!("processed games ledger is empty; deduplicating against the database");
        } else {
            info!(entries = ledger.len(), "loaded processed games ledger");
        }
        let completed: Vec<ScheduledGame> = by_id
            .into_values()
            .filter(|g| g.is_completed() && g.is_regular_season())
            .collect();
        let completed_games = completed.len();
        let (seen, fresh): (Vec<_>, Vec<_>) = completed
            .into_iter()
            .partition(|g| ledger.contains(&g.game_id.to_string()));
        let already_processed = seen.len();

        // Identity is the gamePk: doubleheaders share date and teams.
        let mut new_rows = Vec::new();
        let mut new_game_ids = Vec::new();
        let mut ledger_ids = Vec::new();
        let mut already_in_db = 0usize;
        let mut skipped = 0usize;
        if !fresh.is_empty() {
            let recorded = self.db.processed_game_ids().await?;
            let (in_db, pending): (Vec<_>, Vec<_>) = fresh
                .into_iter()
                .partition(|g| recorded.contains(&g.game_id));
            already_in_db = in_db.len();
            ledger_ids.extend(in_db.iter().map(|g| g.game_id.to_string()));

            if !pending.is_empty() {
                let rows = load_team_rows(&self.config.teams_csv)?;
                let directory = FranchiseDirectory::from_rows(&rows, today.year());
                if directory.is_empty() {
                    warn!(
                        path = %self.config.teams_csv.display(),
                        "no active franchises in team mapping"
                    );
                }
                for game in &pending {
                    match scheduled_game_to_gamelog(game, &directory) {
                        Ok(row) => {
                            info!(game_id = game.game_id, game = %game.summary(), "new game");
                            new_rows.push(row);
                            new_game_ids.push(game.game_id);
                        }
                        Err(reason) => {
                            skipped += 1;
                            warn!(
                                game_id = game.game_id,
                                game = %game.summary(),
                                %reason,
                                "skipping game"
                            );
                        }
                    }
                }
            }
        }

        let inserted = self
            .db
            .append_scheduled_games(&new_rows, &new_game_ids)
            .await?;
        ledger_ids.extend(new_game_ids.iter().map(u64::to_string));
        if !ledger_ids.is_empty() {
            ledger.record(&ledger_ids).await?;
        }

        let gamelogs_csv = if inserted > 0 {
            Some(self.export_gamelogs().await?)
        } else {
            None
        };

        let counts = self.db.franchise_score_counts().await?;
        let scores_csv = self.publish_scores(&counts).await?;
        let novel = novel_scores(&new_rows, &counts);
        for game in &novel {
            info!(
                date = %game.date,
                visitor = %game.visitor_team,
                home = %game.home_team,
                score = %format!("{}-{}", game.home_score, game.visitor_score),
                "scorigami"
            );
        }

        let report_path = self
            .config
            .reports_dir
            .join(run_id.to_string())
            .join("summary.json");
        let summary = DailyRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            dates,
            fetched_games,
            completed_games,
            already_processed,
            already_in_db,
            skipped,
            inserted,
            novel,
            scores_csv,
            gamelogs_csv,
            report_path: report_path.display().to_string(),
        };
        let report = serde_json::to_vec_pretty(&summary).context("serializing run summary")?;
        write_atomic(&report_path, &report).await?;

        info!(
            %run_id,
            fetched = summary.fetched_games,
            inserted = summary.inserted,
            skipped = summary.skipped,
            novel = summary.novel.len(),
            "daily sync complete"
        );
        Ok(summary)
    }

    /// Franchise-filtered score counts to `outputs/mlb_scorigami_scores_franchise.csv`.
    pub async fn export_scores(&self) -> Result<ExportSummary> {
        let counts = self.db.franchise_score_counts().await?;
        self.publish_scores(&counts).await
    }

    async fn publish_scores(&self, counts: &[ScoreCount]) -> Result<ExportSummary> {
        let bytes = render_score_counts_csv(counts)?;
        let summary = publish(&self.config.outputs_dir, SCORES_CSV, &bytes, counts.len()).await?;
        info!(path = %summary.path, rows = summary.rows, "wrote score export");
        Ok(summary)
    }

    pub async fn export_gamelogs(&self) -> Result<ExportSummary> {
        let games = self.db.load_gamelogs().await?;
        self.publish_gamelogs(&games).await
    }

    async fn publish_gamelogs(&self, games: &[GameLog]) -> Result<ExportSummary> {
        let bytes = render_gamelogs_csv(games)?;
        let summary = publish(&self.config.outputs_dir, GAMELOGS_CSV, &bytes, games.len()).await?;
        info!(path = %summary.path, rows = summary.rows, "wrote gamelog export");
        Ok(summary)
    }

    /// Load Retrosheet game logs from `dirs` and append the games the table does not hold yet.
    pub async fn import_retrosheet(&self, dirs: &[PathBuf]) -> Result<ImportSummary> {
        let dirs = dirs.to_vec();
        let (files, parsed, games) = tokio::task::spawn_blocking(move || -> Result<_> {
            let files = collect_retrosheet_files(&dirs)?;
            let mut games = Vec::new();
            for file in &files {
                games.extend(read_retrosheet_file(file)?);
            }
            let parsed = games.len();
            Ok((files.len(), parsed, dedupe_and_sort(games)))
        })
        .await
        .context("retrosheet reader task panicked")??;
        info!(files, parsed, unique = games.len(), "parsed retrosheet game logs");

        let gamelogs_csv = self.publish_gamelogs(&games).await?;
        let trimmed = self.db.trim_quoted_fields().await?;

        let mut known = self.db.existing_game_keys().await?;
        let missing: Vec<GameLog> = games
            .iter()
            .filter(|g| known.insert(g.key()))
            .cloned()
            .collect();
        let inserted = if missing.is_empty() {
            0
        } else {
            self.db.append_gamelogs(&missing).await?
        };
        info!(trimmed, inserted, "retrosheet import complete");

        Ok(ImportSummary {
            files,
            parsed,
            unique: games.len(),
            trimmed,
            inserted,
            gamelogs_csv,
        })
    }

    /// Replace `teams` and `teams_with_franchise` from a CSV file.
    pub async fn load_teams(&self, csv_path: &Path) -> Result<u64> {
        let rows = load_team_rows(csv_path)?;
        let loaded = self.db.replace_teams(&rows).await?;
        info!(path = %csv_path.display(), rows = loaded, "loaded teams");
        Ok(loaded)
    }

    pub async fn refresh(&self) -> Result<RefreshSummary> {
        self.db.refresh_scorigami_view().await?;
        let franchise_rows = self.db.rebuild_franchise_scorigami().await?;
        info!(franchise_rows, "refreshed scorigami tables");
        Ok(RefreshSummary { franchise_rows })
    }

    pub async fn lookup(&self, team: &str) -> Result<Vec<TeamScoreCount>> {
        self.db.team_scorigami(team).await
    }
}

/// Open and drop a TCP connection; returns how long the connect took.
pub async fn check_reachable(host: &str, port: u16, timeout: Duration) -> Result<Duration> {
    let started = Instant::now();
    tokio::time::timeout(timeout, TcpStream::connect((host, port)))
        .await
        .with_context(|| format!("timed out connecting to {host}:{port}"))?
        .with_context(|| format!("connecting to {host}:{port}"))?;
    Ok(started.elapsed())
}

/// One cron job running the daily sync. A tick that lands while a run is in progress is skipped.
pub async fn build_scheduler(pipeline: Arc<SyncPipeline>) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = pipeline.config().sync_cron.clone();
    let running = Arc::new(tokio::sync::Mutex::new(()));

    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let pipeline = Arc::clone(&pipeline);
        let running = Arc::clone(&running);
        Box::pin(async move {
            let Ok(_guard) = running.try_lock() else {
                warn!("previous sync still running; skipping tick");
                return;
            };
            match pipeline.run_daily(Utc::now()).await {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    inserted = summary.inserted,
                    "scheduled sync finished"
                ),
                Err(err) => error!(error = %format!("{err:#}"), "scheduled sync failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}
