// Runs against a live PostgreSQL when SCORIGAMI_TEST_DATABASE_URL is set; skipped otherwise.
// Every run works inside its own throwaway schema.

use scorigami_core::{GameLog, RawTeamRow, ScoreCount};
use scorigami_storage::{DbOptions, ScorigamiDb};

fn team(code: &str, franchise: Option<&str>, last: Option<&str>) -> RawTeamRow {
    RawTeamRow {
        team: code.to_string(),
        league: Some("AL".into()),
        city: Some(format!("{code} City")),
        nickname: Some(format!("{code}s")),
        first: Some("1901".into()),
        last: last.map(str::to_string),
        franchise: franchise.map(str::to_string),
    }
}

fn game(date: &str, visitor: &str, home: &str, visitor_score: i32, home_score: i32) -> GameLog {
    GameLog {
        date: date.into(),
        visitor_team: visitor.into(),
        home_team: home.into(),
        visitor_score,
        home_score,
    }
}

async fn scratch_db() -> Option<(ScorigamiDb, String)> {
    let url = std::env::var("SCORIGAMI_TEST_DATABASE_URL").ok()?;
    let schema = format!("scorigami_test_{}", uuid::Uuid::new_v4().simple());
    let db = ScorigamiDb::connect(
        &url,
        DbOptions {
            schema: Some(schema.clone()),
            ..Default::default()
        },
    )
    .await
    .expect("connect");
    db.migrate().await.expect("migrate");
    Some((db, schema))
}

async fn drop_schema(db: &ScorigamiDb, schema: &str) {
    sqlx::query(&format!("DROP SCHEMA \"{schema}\" CASCADE"))
        .execute(db.pool())
        .await
        .expect("drop schema");
}

#[tokio::test]
async fn export_counts_only_franchise_games_in_score_order() {
    let Some((db, schema)) = scratch_db().await else {
        eprintln!("SCORIGAMI_TEST_DATABASE_URL not set; skipping");
        return;
    };

    db.replace_teams(&[
        team("NYA", Some("NYA"), None),
        team("BOS", Some("BOS"), None),
        // Same code listed twice must not double the counts.
        team("BOS", Some("BOS"), Some("1950")),
        team("XXX", Some(""), None),
        team("YYY", None, None),
    ])
    .await
    .expect("teams");

    db.append_gamelogs(&[
        game("20240401", "BOS", "NYA", 3, 5),
        game("20240402", "BOS", "NYA", 3, 5),
        game("20240403", "NYA", "BOS", 2, 2),
        game("20240404", "XXX", "NYA", 0, 9),
        game("20240405", "NYA", "YYY", 1, 7),
    ])
    .await
    .expect("append");

    let counts = db.franchise_score_counts().await.expect("counts");
    assert_eq!(
        counts,
        vec![
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
        ]
    );

    // Pure read: a second run sees the same rows.
    assert_eq!(db.franchise_score_counts().await.expect("counts again"), counts);

    drop_schema(&db, &schema).await;
}

#[tokio::test]
async fn view_refresh_lookup_and_franchise_rebuild() {
    let Some((db, schema)) = scratch_db().await else {
        eprintln!("SCORIGAMI_TEST_DATABASE_URL not set; skipping");
        return;
    };

    db.replace_teams(&[team("NYA", Some("NYA"), None), team("BOS", Some("BOS"), None)])
        .await
        .expect("teams");
    db.append_gamelogs(&[
        game("20240401", "BOS", "NYA", 3, 5),
        game("20240301", "BOS", "NYA", 3, 5),
        game("20240402", "NYA", "BOS", 5, 3),
    ])
    .await
    .expect("append");

    assert!(db.team_scorigami("NYA").await.expect("empty view").is_empty());
    db.refresh_scorigami_view().await.expect("refresh");
    let rows = db.team_scorigami("NYA").await.expect("lookup");
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].home_score, 3);
    assert_eq!(rows[1].n, 2);

    let inserted = db.rebuild_franchise_scorigami().await.expect("rebuild");
    // NYA: 5-3 won (x3: two at home, one away). BOS: 3-5 lost (x3).
    assert_eq!(inserted, 2);
    let first_date: String = sqlx::query_scalar(
        "SELECT first_date FROM franchise_scorigami WHERE franchise = 'NYA'",
    )
    .fetch_one(db.pool())
    .await
    .expect("first date");
    assert_eq!(first_date, "20240301");

    let keys = db.existing_game_keys().await.expect("keys");
    assert_eq!(keys.len(), 3);
    assert_eq!(db.load_gamelogs().await.expect("load")[0].date, "20240301");
    assert_eq!(db.load_teams().await.expect("teams").len(), 2);

    drop_schema(&db, &schema).await;
}

#[tokio::test]
async fn quoted_fields_are_trimmed() {
    let Some((db, schema)) = scratch_db().await else {
        eprintln!("SCORIGAMI_TEST_DATABASE_URL not set; skipping");
        return;
    };

    db.append_gamelogs(&[game("\"20240401\"", "\"BOS\"", "NYA", 1, 2)])
        .await
        .expect("append");
    assert_eq!(db.trim_quoted_fields().await.expect("trim"), 1);
    let games = db.load_gamelogs().await.expect("load");
    assert_eq!(games[0].date, "20240401");
    assert_eq!(games[0].visitor_team, "BOS");

    drop_schema(&db, &schema).await;
}

#[tokio::test]
async fn scheduled_games_record_ids_with_the_rows() {
    let Some((db, schema)) = scratch_db().await else {
        eprintln!("SCORIGAMI_TEST_DATABASE_URL not set; skipping");
        return;
    };

    // Doubleheader: same date and teams, two game ids.
    let inserted = db
        .append_scheduled_games(
            &[
                game("20250704", "BOS", "NYA", 3, 5),
                game("20250704", "BOS", "NYA", 1, 0),
            ],
            &[900001, 900002],
        )
        .await
        .expect("append");
    assert_eq!(inserted, 2);
    assert_eq!(db.load_gamelogs().await.expect("load").len(), 2);

    let ids = db.processed_game_ids().await.expect("ids");
    assert_eq!(ids.len(), 2);
    assert!(ids.contains(&900001) && ids.contains(&900002));

    // Re-recording a known id is not an error.
    db.append_scheduled_games(&[], &[900002])
        .await
        .expect("re-record");
    assert_eq!(db.processed_game_ids().await.expect("ids").len(), 2);

    drop_schema(&db, &schema).await;
}
