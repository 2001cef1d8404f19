//! Core domain model for the scorigami pipeline: game logs, teams and score tallies.

use std::collections::HashMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "scorigami-core";

/// Date format used by the `gamelogs.date` column and the Retrosheet files.
pub const GAMELOG_DATE_FORMAT: &str = "%Y%m%d";

/// One final result as stored in `gamelogs`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GameLog {
    /// `YYYYMMDD`, kept textual to match the table.
    pub date: String,
    pub visitor_team: String,
    pub home_team: String,
    pub visitor_score: i32,
    pub home_score: i32,
}

impl GameLog {
    pub fn key(&self) -> GameKey {
        GameKey {
            date: self.date.clone(),
            visitor_team: self.visitor_team.clone(),
            home_team: self.home_team.clone(),
        }
    }

    pub fn score_pair(&self) -> (i32, i32) {
        (self.home_score, self.visitor_score)
    }
}

/// Identity used by the loaders to skip games that are already present.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GameKey {
    pub date: String,
    pub visitor_team: String,
    pub home_team: String,
}

/// Typed row of the `teams` dimension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamRecord {
    pub team: String,
    pub league: Option<String>,
    pub city: Option<String>,
    pub nickname: Option<String>,
    pub first: Option<i32>,
    /// `None` means the team is still active.
    pub last: Option<i32>,
    pub franchise: Option<String>,
}

impl TeamRecord {
    pub fn has_franchise(&self) -> bool {
        franchise_is_present(self.franchise.as_deref())
    }

    /// Whether the team was active in `year`. Teams without a known first year never are.
    pub fn active_in(&self, year: i32) -> bool {
        let Some(first) = self.first else {
            return false;
        };
        let last = self.last.unwrap_or(year + 1);
        first <= year && year <= last
    }

    pub fn full_name(&self) -> Option<String> {
        match (&self.city, &self.nickname) {
            (Some(city), Some(nickname)) => Some(format!("{city} {nickname}")),
            _ => None,
        }
    }
}

/// Row of `teams_with_franchise.csv` / the `teams_with_franchise` table, kept textual.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawTeamRow {
    #[serde(rename = "TEAM")]
    pub team: String,
    #[serde(rename = "LEAGUE", default)]
    pub league: Option<String>,
    #[serde(rename = "CITY", default)]
    pub city: Option<String>,
    #[serde(rename = "NICKNAME", default)]
    pub nickname: Option<String>,
    #[serde(rename = "FIRST", default)]
    pub first: Option<String>,
    #[serde(rename = "LAST", default)]
    pub last: Option<String>,
    #[serde(rename = "FRANCHISE", default)]
    pub franchise: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("team {team}: invalid {column} year {value:?}")]
pub struct InvalidYear {
    pub team: String,
    pub column: &'static str,
    pub value: String,
}

impl RawTeamRow {
    /// Strict conversion: a missing or malformed `FIRST`, or a malformed `LAST`, is an error.
    pub fn to_record(&self) -> Result<TeamRecord, InvalidYear> {
        let first = match non_blank(self.first.as_deref()) {
            Some(value) => Some(self.parse_year("FIRST", value)?),
            None => {
                return Err(InvalidYear {
                    team: self.team.clone(),
                    column: "FIRST",
                    value: String::new(),
                })
            }
        };
        let last = match non_blank(self.last.as_deref()) {
            Some(value) if value.eq_ignore_ascii_case("present") => None,
            Some(value) => Some(self.parse_year("LAST", value)?),
            None => None,
        };
        Ok(self.record_with_years(first, last))
    }

    /// Lenient conversion used for the `teams` table: unparseable years become NULL.
    pub fn to_record_lossy(&self) -> TeamRecord {
        let first = non_blank(self.first.as_deref()).and_then(|v| v.parse().ok());
        let last = non_blank(self.last.as_deref()).and_then(|v| v.parse().ok());
        self.record_with_years(first, last)
    }

    fn parse_year(&self, column: &'static str, value: &str) -> Result<i32, InvalidYear> {
        value.parse().map_err(|_| InvalidYear {
            team: self.team.clone(),
            column,
            value: value.to_string(),
        })
    }

    fn record_with_years(&self, first: Option<i32>, last: Option<i32>) -> TeamRecord {
        TeamRecord {
            team: self.team.trim().to_string(),
            league: non_blank(self.league.as_deref()).map(str::to_string),
            city: non_blank(self.city.as_deref()).map(str::to_string),
            nickname: non_blank(self.nickname.as_deref()).map(str::to_string),
            first,
            last,
            franchise: non_blank(self.franchise.as_deref()).map(str::to_string),
        }
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// NULL and blank franchise labels are equivalent: neither tags a team.
pub fn franchise_is_present(franchise: Option<&str>) -> bool {
    franchise.map(|f| !f.trim().is_empty()).unwrap_or(false)
}

/// One exported row: how often a final score occurred between franchise teams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreCount {
    pub home_score: i32,
    pub visitor_score: i32,
    pub occurrences: i64,
}

impl ScoreCount {
    pub fn is_scorigami(&self) -> bool {
        self.occurrences == 1
    }
}

/// Row of the `mlb_scorigami` materialized view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamScoreCount {
    pub home_score: i32,
    pub visitor_score: i32,
    pub home_team: String,
    pub visitor_team: String,
    pub n: i64,
}

/// Schedule entry as reported by the MLB Stats API, before any validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledGame {
    pub game_id: u64,
    /// ISO `YYYY-MM-DD`.
    pub game_date: Option<String>,
    pub game_type: Option<String>,
    pub status: String,
    pub away_name: Option<String>,
    pub home_name: Option<String>,
    pub away_score: Option<i64>,
    pub home_score: Option<i64>,
}

impl ScheduledGame {
    pub fn is_completed(&self) -> bool {
        is_completed_status(&self.status)
    }

    pub fn is_regular_season(&self) -> bool {
        self.game_type.as_deref() == Some("R")
    }

    pub fn summary(&self) -> String {
        let score = |s: Option<i64>| s.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string());
        format!(
            "{} ({}) @ {} ({}) ({})",
            self.away_name.as_deref().unwrap_or("?"),
            score(self.away_score),
            self.home_name.as_deref().unwrap_or("?"),
            score(self.home_score),
            self.status
        )
    }
}

pub fn is_completed_status(status: &str) -> bool {
    let status = status.trim().to_lowercase();
    status == "final" || status == "game over" || status.starts_with("completed early")
}

/// Convert an ISO `YYYY-MM-DD` date into the `YYYYMMDD` form stored in `gamelogs`.
pub fn to_gamelog_date(iso_date: &str) -> Option<String> {
    NaiveDate::parse_from_str(iso_date.trim(), "%Y-%m-%d")
        .ok()
        .map(|d| d.format(GAMELOG_DATE_FORMAT).to_string())
}

/// Games from `new_games` whose final score now occurs exactly once in `counts`.
pub fn novel_scores(new_games: &[GameLog], counts: &[ScoreCount]) -> Vec<GameLog> {
    let by_pair: HashMap<(i32, i32), &ScoreCount> = counts
        .iter()
        .map(|c| ((c.home_score, c.visitor_score), c))
        .collect();
    new_games
        .iter()
        .filter(|g| {
            by_pair
                .get(&g.score_pair())
                .is_some_and(|c| c.is_scorigami())
        })
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn game(date: &str, home: i32, visitor: i32) -> GameLog {
        GameLog {
            date: date.to_string(),
            visitor_team: "BOS".to_string(),
            home_team: "NYA".to_string(),
            visitor_score: visitor,
            home_score: home,
        }
    }

    #[test]
    fn completed_statuses_match_final_game_over_and_completed_early() {
        assert!(is_completed_status("Final"));
        assert!(is_completed_status("Game Over"));
        assert!(is_completed_status("Completed Early: Rain"));
        assert!(!is_completed_status("In Progress"));
        assert!(!is_completed_status("Final: Tied"));
        assert!(!is_completed_status("Postponed"));
    }

    #[test]
    fn iso_dates_convert_to_compact_form() {
        assert_eq!(to_gamelog_date("2025-06-01").as_deref(), Some("20250601"));
        assert_eq!(to_gamelog_date("06/01/2025"), None);
        assert_eq!(to_gamelog_date(""), None);
    }

    #[test]
    fn null_and_blank_franchise_are_equivalent() {
        assert!(!franchise_is_present(None));
        assert!(!franchise_is_present(Some("")));
        assert!(!franchise_is_present(Some("  ")));
        assert!(franchise_is_present(Some("NYA")));
    }

    #[test]
    fn active_range_treats_missing_last_year_as_present() {
        let team = TeamRecord {
            team: "SEA".into(),
            league: Some("AL".into()),
            city: Some("Seattle".into()),
            nickname: Some("Mariners".into()),
            first: Some(1977),
            last: None,
            franchise: Some("SEA".into()),
        };
        assert!(team.active_in(2025));
        assert!(!team.active_in(1976));
        assert_eq!(team.full_name().as_deref(), Some("Seattle Mariners"));

        let pilots = TeamRecord {
            first: Some(1969),
            last: Some(1969),
            ..team.clone()
        };
        assert!(!pilots.active_in(1970));

        let unknown = TeamRecord { first: None, ..team };
        assert!(!unknown.active_in(2025));
    }

    #[test]
    fn raw_team_rows_convert_strictly_and_lossily() {
        let raw = RawTeamRow {
            team: "ANA".into(),
            league: Some("AL".into()),
            city: Some("Anaheim".into()),
            nickname: Some("Angels".into()),
            first: Some("1997".into()),
            last: Some("Present".into()),
            franchise: Some(" ANA ".into()),
        };
        let record = raw.to_record().unwrap();
        assert_eq!(record.first, Some(1997));
        assert_eq!(record.last, None);
        assert_eq!(record.franchise.as_deref(), Some("ANA"));

        let broken = RawTeamRow {
            first: Some("n/a".into()),
            franchise: Some(String::new()),
            ..raw
        };
        let err = broken.to_record().unwrap_err();
        assert_eq!(err.column, "FIRST");
        let lossy = broken.to_record_lossy();
        assert_eq!(lossy.first, None);
        assert_eq!(lossy.franchise, None);
        assert!(!lossy.has_franchise());
    }

    #[test]
    fn novel_scores_only_reports_pairs_seen_once() {
        let counts = vec![
            ScoreCount {
                home_score: 2,
                visitor_score: 2,
                occurrences: 1,
            },
            ScoreCount {
                home_score: 5,
                visitor_score: 3,
                occurrences: 2,
            },
        ];
        assert!(counts[0].is_scorigami());
        assert!(!counts[1].is_scorigami());
        let games = vec![
            game("20250601", 5, 3),
            game("20250601", 2, 2),
            game("20250602", 30, 0),
        ];
        let novel = novel_scores(&games, &counts);
        assert_eq!(novel, vec![game("20250601", 2, 2)]);
    }

    #[test]
    fn summary_mentions_both_teams_and_status() {
        let g = ScheduledGame {
            game_id: 1,
            game_date: Some("2025-06-01".into()),
            game_type: Some("R".into()),
            status: "Final".into(),
            away_name: Some("Boston Red Sox".into()),
            home_name: Some("New York Yankees".into()),
            away_score: Some(3),
            home_score: None,
        };
        assert_eq!(g.summary(), "Boston Red Sox (3) @ New York Yankees (-) (Final)");
        assert!(g.is_regular_season());
        assert!(g.is_completed());
    }
}
