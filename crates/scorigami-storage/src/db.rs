use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use scorigami_core::{GameKey, GameLog, RawTeamRow, ScoreCount, TeamRecord, TeamScoreCount};
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{PgConnection, PgPool, Postgres, QueryBuilder, Row};
use tracing::{debug, info};

pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

// Keeps each INSERT well below the 65535 bind-parameter limit.
const INSERT_BATCH_ROWS: usize = 1_000;

const FRANCHISE_TEAMS: &str =
    "SELECT team FROM teams WHERE COALESCE(TRIM(franchise), '') <> ''";

#[derive(Debug, Clone)]
pub struct DbOptions {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    /// Optional schema placed first on the `search_path` of every connection.
    pub schema: Option<String>,
}

impl Default for DbOptions {
    fn default() -> Self {
        Self {
            max_connections: 2,
            acquire_timeout: Duration::from_secs(15),
            schema: None,
        }
    }
}

/// Schema names are interpolated into DDL, so only plain identifiers are accepted.
pub fn validate_schema_name(schema: &str) -> Result<()> {
    let mut chars = schema.chars();
    let valid_start = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    if !valid_start || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        bail!("invalid schema name {schema:?}");
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct ScorigamiDb {
    pool: PgPool,
    schema: Option<String>,
}

impl ScorigamiDb {
    pub async fn connect(database_url: &str, options: DbOptions) -> Result<Self> {
        let mut connect =
            PgConnectOptions::from_str(database_url).context("parsing database url")?;
        if let Some(schema) = &options.schema {
            validate_schema_name(schema)?;
            connect = connect.options([("search_path", schema.as_str())]);
        }

        let pool = PgPoolOptions::new()
            .max_connections(options.max_connections.max(1))
            .acquire_timeout(options.acquire_timeout)
            .connect_with(connect)
            .await
            .context("connecting to postgres")?;
        Ok(Self {
            pool,
            schema: options.schema,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .context("pinging postgres")?;
        Ok(())
    }

    pub async fn migrate(&self) -> Result<()> {
        if let Some(schema) = &self.schema {
            sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS \"{schema}\""))
                .execute(&self.pool)
                .await
                .with_context(|| format!("creating schema {schema}"))?;
        }
        MIGRATOR
            .run(&self.pool)
            .await
            .context("applying migrations")?;
        Ok(())
    }

    pub async fn existing_game_keys(&self) -> Result<HashSet<GameKey>> {
        let rows = sqlx::query("SELECT date, visitor_team, home_team FROM gamelogs")
            .fetch_all(&self.pool)
            .await
            .context("loading existing gamelog keys")?;

        let mut out = HashSet::with_capacity(rows.len());
        for row in rows {
            out.insert(GameKey {
                date: row.try_get("date")?,
                visitor_team: row.try_get("visitor_team")?,
                home_team: row.try_get("home_team")?,
            });
        }
        Ok(out)
    }

    /// Append rows in one transaction; nothing is written if any batch fails.
    pub async fn append_gamelogs(&self, games: &[GameLog]) -> Result<u64> {
        if games.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await.context("starting gamelogs append")?;
        let inserted = insert_gamelogs(&mut *tx, games).await?;
        tx.commit().await.context("committing gamelogs append")?;
        info!(inserted, "appended gamelogs");
        Ok(inserted)
    }

    /// Append Stats API games and mark their `gamePk`s processed, atomically.
    pub async fn append_scheduled_games(&self, games: &[GameLog], game_ids: &[u64]) -> Result<u64> {
        if games.is_empty() && game_ids.is_empty() {
            return Ok(0);
        }
        let ids = game_ids
            .iter()
            .map(|id| i64::try_from(*id).with_context(|| format!("game id {id} out of range")))
            .collect::<Result<Vec<_>>>()?;

        let mut tx = self.pool.begin().await.context("starting daily append")?;
        let inserted = insert_gamelogs(&mut *tx, games).await?;
        for chunk in ids.chunks(INSERT_BATCH_ROWS) {
            let mut builder: QueryBuilder<Postgres> =
                QueryBuilder::new("INSERT INTO processed_games (game_id) ");
            builder.push_values(chunk, |mut row, id| {
                row.push_bind(*id);
            });
            builder.push(" ON CONFLICT (game_id) DO NOTHING");
            builder
                .build()
                .execute(&mut *tx)
                .await
                .context("recording processed game ids")?;
        }
        tx.commit().await.context("committing daily append")?;
        info!(inserted, game_ids = ids.len(), "appended scheduled games");
        Ok(inserted)
    }

    /// Stats API `gamePk`s already appended by earlier daily runs.
    pub async fn processed_game_ids(&self) -> Result<HashSet<u64>> {
        let rows = sqlx::query("SELECT game_id FROM processed_games")
            .fetch_all(&self.pool)
            .await
            .context("loading processed game ids")?;

        let mut out = HashSet::with_capacity(rows.len());
        for row in rows {
            let id: i64 = row.try_get("game_id")?;
            out.insert(u64::try_from(id).with_context(|| format!("negative game id {id}"))?);
        }
        Ok(out)
    }

    /// Strip stray double quotes left in text columns by earlier raw imports.
    pub async fn trim_quoted_fields(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE gamelogs
               SET date = TRIM(BOTH '"' FROM date),
                   visitor_team = TRIM(BOTH '"' FROM visitor_team),
                   home_team = TRIM(BOTH '"' FROM home_team)
             WHERE date LIKE '%"%'
                OR visitor_team LIKE '%"%'
                OR home_team LIKE '%"%'
            "#,
        )
        .execute(&self.pool)
        .await
        .context("trimming quoted gamelog fields")?;
        Ok(result.rows_affected())
    }

    pub async fn load_gamelogs(&self) -> Result<Vec<GameLog>> {
        let rows = sqlx::query(
            r#"
            SELECT date, visitor_team, home_team, visitor_score, home_score
              FROM gamelogs
             ORDER BY date, visitor_team, home_team
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("loading gamelogs")?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(GameLog {
                date: row.try_get("date")?,
                visitor_team: row.try_get("visitor_team")?,
                home_team: row.try_get("home_team")?,
                visitor_score: row.try_get("visitor_score")?,
                home_score: row.try_get("home_score")?,
            });
        }
        Ok(out)
    }

    /// Occurrences of each final score between two franchise-tagged teams.
    ///
    /// Team membership is a semi-join, so a code listed in several `teams` rows
    /// is counted once per game.
    pub async fn franchise_score_counts(&self) -> Result<Vec<ScoreCount>> {
        let sql = format!(
            r#"
            SELECT g.home_score, g.visitor_score, COUNT(*) AS occurrences
              FROM gamelogs g
             WHERE g.home_team IN ({FRANCHISE_TEAMS})
               AND g.visitor_team IN ({FRANCHISE_TEAMS})
             GROUP BY g.home_score, g.visitor_score
             ORDER BY g.home_score, g.visitor_score
            "#
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .context("running franchise scorigami query")?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(ScoreCount {
                home_score: row.try_get("home_score")?,
                visitor_score: row.try_get("visitor_score")?,
                occurrences: row.try_get("occurrences")?,
            });
        }
        Ok(out)
    }

    /// Replace both team tables from the CSV rows in a single transaction.
    pub async fn replace_teams(&self, rows: &[RawTeamRow]) -> Result<u64> {
        let mut tx = self.pool.begin().await.context("starting teams load")?;
        sqlx::query("DELETE FROM teams_with_franchise")
            .execute(&mut *tx)
            .await
            .context("clearing teams_with_franchise")?;
        sqlx::query("DELETE FROM teams")
            .execute(&mut *tx)
            .await
            .context("clearing teams")?;

        for chunk in rows.chunks(INSERT_BATCH_ROWS) {
            let mut raw: QueryBuilder<Postgres> = QueryBuilder::new(
                r#"
                INSERT INTO teams_with_franchise
                       ("TEAM", "LEAGUE", "CITY", "NICKNAME", "FIRST", "LAST", "FRANCHISE")
                "#,
            );
            raw.push_values(chunk, |mut b, r| {
                b.push_bind(r.team.as_str())
                    .push_bind(r.league.as_deref())
                    .push_bind(r.city.as_deref())
                    .push_bind(r.nickname.as_deref())
                    .push_bind(r.first.as_deref())
                    .push_bind(r.last.as_deref())
                    .push_bind(r.franchise.as_deref());
            });
            raw.build()
                .execute(&mut *tx)
                .await
                .context("inserting teams_with_franchise rows")?;

            let typed: Vec<TeamRecord> = chunk.iter().map(RawTeamRow::to_record_lossy).collect();
            let mut teams: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO teams (team, league, city, nickname, first, last, franchise) ",
            );
            teams.push_values(&typed, |mut b, t| {
                b.push_bind(t.team.clone())
                    .push_bind(t.league.clone())
                    .push_bind(t.city.clone())
                    .push_bind(t.nickname.clone())
                    .push_bind(t.first)
                    .push_bind(t.last)
                    .push_bind(t.franchise.clone());
            });
            teams
                .build()
                .execute(&mut *tx)
                .await
                .context("inserting teams rows")?;
        }

        tx.commit().await.context("committing teams load")?;
        Ok(rows.len() as u64)
    }

    pub async fn load_teams(&self) -> Result<Vec<TeamRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT team, league, city, nickname, first, last, franchise
              FROM teams
             ORDER BY team, first
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("loading teams")?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(TeamRecord {
                team: row.try_get("team")?,
                league: row.try_get("league")?,
                city: row.try_get("city")?,
                nickname: row.try_get("nickname")?,
                first: row.try_get("first")?,
                last: row.try_get("last")?,
                franchise: row.try_get("franchise")?,
            });
        }
        Ok(out)
    }

    pub async fn refresh_scorigami_view(&self) -> Result<()> {
        sqlx::query("REFRESH MATERIALIZED VIEW mlb_scorigami")
            .execute(&self.pool)
            .await
            .context("refreshing mlb_scorigami")?;
        Ok(())
    }

    /// Rebuild the per-franchise memo of first occurrences from `gamelogs`.
    ///
    /// Each game counts once for every franchise-tagged side, from that side's
    /// perspective (runs scored, runs allowed).
    pub async fn rebuild_franchise_scorigami(&self) -> Result<u64> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("starting franchise_scorigami rebuild")?;
        sqlx::query("DELETE FROM franchise_scorigami")
            .execute(&mut *tx)
            .await
            .context("clearing franchise_scorigami")?;
        let result = sqlx::query(
            r#"
            WITH team_franchise AS (
                SELECT DISTINCT ON (team) team, TRIM(franchise) AS franchise
                  FROM teams
                 WHERE COALESCE(TRIM(franchise), '') <> ''
                 ORDER BY team, last DESC NULLS FIRST
            ),
            sides AS (
                SELECT tf.franchise,
                       g.home_score AS runs_scored,
                       g.visitor_score AS runs_allowed,
                       g.date
                  FROM gamelogs g
                  JOIN team_franchise tf ON tf.team = g.home_team
                UNION ALL
                SELECT tf.franchise, g.visitor_score, g.home_score, g.date
                  FROM gamelogs g
                  JOIN team_franchise tf ON tf.team = g.visitor_team
            )
            INSERT INTO franchise_scorigami
                   (franchise, runs_scored, runs_allowed, occurrences, first_date)
            SELECT franchise, runs_scored, runs_allowed, COUNT(*), MIN(date)
              FROM sides
             GROUP BY franchise, runs_scored, runs_allowed
            "#,
        )
        .execute(&mut *tx)
        .await
        .context("rebuilding franchise_scorigami")?;
        tx.commit()
            .await
            .context("committing franchise_scorigami rebuild")?;
        Ok(result.rows_affected())
    }

    /// Rows of `mlb_scorigami` involving `team` on either side.
    pub async fn team_scorigami(&self, team: &str) -> Result<Vec<TeamScoreCount>> {
        let rows = sqlx::query(
            r#"
            SELECT home_score, visitor_score, home_team, visitor_team, n
              FROM mlb_scorigami
             WHERE home_team = $1
                OR visitor_team = $1
             ORDER BY home_score, visitor_score, home_team, visitor_team
            "#,
        )
        .bind(team)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("querying mlb_scorigami for {team}"))?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(TeamScoreCount {
                home_score: row.try_get("home_score")?,
                visitor_score: row.try_get("visitor_score")?,
                home_team: row.try_get("home_team")?,
                visitor_team: row.try_get("visitor_team")?,
                n: row.try_get("n")?,
            });
        }
        Ok(out)
    }
}

async fn insert_gamelogs(conn: &mut PgConnection, games: &[GameLog]) -> Result<u64> {
    let mut inserted = 0u64;
    for chunk in games.chunks(INSERT_BATCH_ROWS) {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO gamelogs (date, visitor_team, home_team, visitor_score, home_score) ",
        );
        builder.push_values(chunk, |mut row, game| {
            row.push_bind(game.date.as_str())
                .push_bind(game.visitor_team.as_str())
                .push_bind(game.home_team.as_str())
                .push_bind(game.visitor_score)
                .push_bind(game.home_score);
        });
        let result = builder
            .build()
            .execute(&mut *conn)
            .await
            .context("inserting gamelogs batch")?;
        inserted += result.rows_affected();
        debug!(batch = chunk.len(), "appended gamelogs batch");
    }
    Ok(inserted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_names_must_be_plain_identifiers() {
        assert!(validate_schema_name("scorigami").is_ok());
        assert!(validate_schema_name("_stage_2").is_ok());
        assert!(validate_schema_name("").is_err());
        assert!(validate_schema_name("2024").is_err());
        assert!(validate_schema_name("public; DROP TABLE teams").is_err());
        assert!(validate_schema_name("a\"b").is_err());
    }

    #[test]
    fn bundled_migrations_include_schema() {
        assert!(MIGRATOR.iter().any(|m| m.description.contains("scorigami schema")));
        assert!(MIGRATOR.iter().any(|m| m.description.contains("processed games")));
    }
}
