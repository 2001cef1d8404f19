//! Source adapters: MLB Stats API schedule, Retrosheet game logs, team franchise CSV.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use csv::StringRecord;
use scorigami_core::{to_gamelog_date, GameLog, RawTeamRow, ScheduledGame};
use scorigami_storage::{FetchError, HttpFetcher};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "scorigami-adapters";

pub const DEFAULT_STATSAPI_BASE_URL: &str = "https://statsapi.mlb.com";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("malformed schedule payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Where daily schedules come from.
#[async_trait]
pub trait ScheduleSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn fetch_schedule(
        &self,
        ctx: &AdapterContext,
        date: NaiveDate,
    ) -> Result<Vec<ScheduledGame>, AdapterError>;
}

/// Live schedule from the public MLB Stats API.
#[derive(Debug, Clone)]
pub struct StatsApiSource {
    http: HttpFetcher,
    base_url: String,
}

impl StatsApiSource {
    pub fn new(http: HttpFetcher, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn schedule_url(&self, date: NaiveDate) -> String {
        format!(
            "{}/api/v1/schedule?sportId=1&date={}",
            self.base_url,
            date.format("%m/%d/%Y")
        )
    }
}

#[async_trait]
impl ScheduleSource for StatsApiSource {
    fn source_id(&self) -> &'static str {
        "statsapi"
    }

    async fn fetch_schedule(
        &self,
        ctx: &AdapterContext,
        date: NaiveDate,
    ) -> Result<Vec<ScheduledGame>, AdapterError> {
        let url = self.schedule_url(date);
        let resp = self.http.fetch_bytes(ctx.run_id, self.source_id(), &url).await?;
        let games = parse_schedule_json(&resp.body)?;
        debug!(%date, games = games.len(), "parsed statsapi schedule");
        Ok(games)
    }
}

/// Replays saved Stats API responses named `schedule_YYYY-MM-DD.json`.
#[derive(Debug, Clone)]
pub struct FileScheduleSource {
    dir: PathBuf,
}

impl FileScheduleSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, date: NaiveDate) -> PathBuf {
        self.dir.join(format!("schedule_{}.json", date.format("%Y-%m-%d")))
    }
}

#[async_trait]
impl ScheduleSource for FileScheduleSource {
    fn source_id(&self) -> &'static str {
        "statsapi-file"
    }

    async fn fetch_schedule(
        &self,
        _ctx: &AdapterContext,
        date: NaiveDate,
    ) -> Result<Vec<ScheduledGame>, AdapterError> {
        let path = self.path_for(date);
        if !tokio::fs::try_exists(&path)
            .await
            .with_context(|| format!("checking {}", path.display()))?
        {
            debug!(path = %path.display(), "no saved schedule for date");
            return Ok(Vec::new());
        }
        let bytes = tokio::fs::read(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Ok(parse_schedule_json(&bytes)?)
    }
}

#[derive(Debug, Deserialize)]
struct ApiSchedule {
    #[serde(default)]
    dates: Vec<ApiScheduleDate>,
}

#[derive(Debug, Deserialize)]
struct ApiScheduleDate {
    date: Option<String>,
    #[serde(default)]
    games: Vec<ApiGame>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiGame {
    game_pk: u64,
    game_type: Option<String>,
    official_date: Option<String>,
    #[serde(default)]
    status: ApiStatus,
    teams: Option<ApiTeams>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiStatus {
    #[serde(default)]
    detailed_state: String,
}

#[derive(Debug, Deserialize)]
struct ApiTeams {
    away: Option<ApiSide>,
    home: Option<ApiSide>,
}

#[derive(Debug, Deserialize)]
struct ApiSide {
    score: Option<i64>,
    team: Option<ApiTeam>,
}

#[derive(Debug, Deserialize)]
struct ApiTeam {
    name: Option<String>,
}

impl ApiSide {
    fn name(&self) -> Option<String> {
        self.team.as_ref().and_then(|t| t.name.clone())
    }
}

/// Flatten a Stats API `/schedule` payload into one entry per game.
pub fn parse_schedule_json(bytes: &[u8]) -> Result<Vec<ScheduledGame>, serde_json::Error> {
    let schedule: ApiSchedule = serde_json::from_slice(bytes)?;
    let mut out = Vec::new();
    for day in schedule.dates {
        for game in day.games {
            let (away, home) = match &game.teams {
                Some(teams) => (teams.away.as_ref(), teams.home.as_ref()),
                None => (None, None),
            };
            out.push(ScheduledGame {
                game_id: game.game_pk,
                game_date: game.official_date.clone().or_else(|| day.date.clone()),
                game_type: game.game_type.clone(),
                status: game.status.detailed_state.clone(),
                away_name: away.and_then(ApiSide::name),
                home_name: home.and_then(ApiSide::name),
                away_score: away.and_then(|s| s.score),
                home_score: home.and_then(|s| s.score),
            });
        }
    }
    Ok(out)
}

/// Read `teams_with_franchise.csv` (header: TEAM,LEAGUE,CITY,NICKNAME,FIRST,LAST,FRANCHISE).
pub fn load_team_rows(path: impl AsRef<Path>) -> Result<Vec<RawTeamRow>> {
    let path = path.as_ref();
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("opening {}", path.display()))?;
    let mut rows = Vec::new();
    for (idx, record) in reader.deserialize::<RawTeamRow>().enumerate() {
        let row = record.with_context(|| format!("parsing {} row {}", path.display(), idx + 2))?;
        rows.push(row);
    }
    Ok(rows)
}

/// Maps schedule team names onto franchise codes for the teams active in a season.
#[derive(Debug, Clone, Default)]
pub struct FranchiseDirectory {
    by_full_name: HashMap<String, String>,
    by_nickname: HashMap<String, String>,
}

impl FranchiseDirectory {
    pub fn from_rows(rows: &[RawTeamRow], season: i32) -> Self {
        let mut directory = Self::default();
        for raw in rows {
            if !scorigami_core::franchise_is_present(raw.franchise.as_deref()) {
                continue;
            }
            let record = match raw.to_record() {
                Ok(record) => record,
                Err(err) => {
                    warn!(error = %err, "skipping team row");
                    continue;
                }
            };
            if !record.active_in(season) {
                continue;
            }
            let (Some(nickname), Some(franchise)) = (&record.nickname, &record.franchise) else {
                continue;
            };
            directory
                .by_nickname
                .insert(nickname.to_lowercase(), franchise.clone());
            if let Some(full_name) = record.full_name() {
                directory
                    .by_full_name
                    .insert(full_name.to_lowercase(), franchise.clone());
            }
        }
        directory
    }

    /// Full name first, then the last word as a nickname.
    pub fn resolve(&self, team_name: &str) -> Option<&str> {
        let lowered = team_name.trim().to_lowercase();
        if let Some(franchise) = self.by_full_name.get(&lowered) {
            return Some(franchise);
        }
        let nickname = lowered.split_whitespace().last()?;
        self.by_nickname.get(nickname).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.by_nickname.is_empty() && self.by_full_name.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SkipReason {
    #[error("missing game date")]
    MissingDate,
    #[error("invalid game date {0:?}")]
    InvalidDate(String),
    #[error("incomplete team names or scores")]
    Incomplete,
    #[error("no franchise mapping for {side} team {name:?}")]
    UnmappedTeam { side: &'static str, name: String },
    #[error("score {0} out of range")]
    ScoreOutOfRange(i64),
}

/// Turn a completed schedule entry into a `gamelogs` row keyed by franchise codes.
pub fn scheduled_game_to_gamelog(
    game: &ScheduledGame,
    directory: &FranchiseDirectory,
) -> Result<GameLog, SkipReason> {
    let iso_date = game.game_date.as_deref().ok_or(SkipReason::MissingDate)?;
    let (Some(away_name), Some(home_name), Some(away_score), Some(home_score)) = (
        game.away_name.as_deref(),
        game.home_name.as_deref(),
        game.away_score,
        game.home_score,
    ) else {
        return Err(SkipReason::Incomplete);
    };
    let date = to_gamelog_date(iso_date).ok_or_else(|| SkipReason::InvalidDate(iso_date.into()))?;

    let visitor_team = directory
        .resolve(away_name)
        .ok_or_else(|| SkipReason::UnmappedTeam {
            side: "visitor",
            name: away_name.to_string(),
        })?;
    let home_team = directory
        .resolve(home_name)
        .ok_or_else(|| SkipReason::UnmappedTeam {
            side: "home",
            name: home_name.to_string(),
        })?;

    Ok(GameLog {
        date,
        visitor_team: visitor_team.to_string(),
        home_team: home_team.to_string(),
        visitor_score: to_score(away_score)?,
        home_score: to_score(home_score)?,
    })
}

fn to_score(value: i64) -> Result<i32, SkipReason> {
    i32::try_from(value)
        .ok()
        .filter(|v| *v >= 0)
        .ok_or(SkipReason::ScoreOutOfRange(value))
}

// Zero-based Retrosheet columns: date, visitor, home, visitor score, home score.
const RETRO_DATE: usize = 0;
const RETRO_VISITOR: usize = 3;
const RETRO_HOME: usize = 6;
const RETRO_VISITOR_SCORE: usize = 9;
const RETRO_HOME_SCORE: usize = 10;

/// Extract a game from one Retrosheet record.
///
/// `None` when either score is missing or not an integer.
pub fn parse_retrosheet_record(record: &StringRecord) -> Option<GameLog> {
    let text = |idx: usize| record.get(idx).map(|v| v.trim().trim_matches('"').to_string());
    let score = |idx: usize| text(idx).and_then(|v| v.parse::<i32>().ok());

    Some(GameLog {
        date: text(RETRO_DATE).unwrap_or_default(),
        visitor_team: text(RETRO_VISITOR).unwrap_or_default(),
        home_team: text(RETRO_HOME).unwrap_or_default(),
        visitor_score: score(RETRO_VISITOR_SCORE)?,
        home_score: score(RETRO_HOME_SCORE)?,
    })
}

pub fn read_retrosheet_file(path: impl AsRef<Path>) -> Result<Vec<GameLog>> {
    let path = path.as_ref();
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("opening {}", path.display()))?;

    let mut games = Vec::new();
    let mut dropped = 0usize;
    for record in reader.records() {
        let record = record.with_context(|| format!("reading {}", path.display()))?;
        match parse_retrosheet_record(&record) {
            Some(game) => games.push(game),
            None => dropped += 1,
        }
    }
    if dropped > 0 {
        debug!(path = %path.display(), dropped, "dropped rows without numeric scores");
    }
    Ok(games)
}

/// All `*.txt` files directly inside `dirs`, in directory order then name order.
pub fn collect_retrosheet_files(dirs: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for dir in dirs {
        let mut files = fs::read_dir(dir)
            .with_context(|| format!("reading {}", dir.display()))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|p| p.is_file() && p.extension().map(|e| e == "txt").unwrap_or(false))
            .collect::<Vec<_>>();
        files.sort();
        out.extend(files);
    }
    Ok(out)
}

/// Keep the first game per `(date, visitor, home)` and order by date.
///
/// Input order is preserved within a day.
pub fn dedupe_and_sort(games: Vec<GameLog>) -> Vec<GameLog> {
    let mut seen = HashSet::new();
    let mut by_date: BTreeMap<String, Vec<GameLog>> = BTreeMap::new();
    for game in games {
        if seen.insert(game.key()) {
            by_date.entry(game.date.clone()).or_default().push(game);
        }
    }
    by_date.into_values().flatten().collect()
}
