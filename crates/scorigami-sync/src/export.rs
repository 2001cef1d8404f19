use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use scorigami_core::{GameLog, ScoreCount};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

pub const SCORES_CSV: &str = "mlb_scorigami_scores_franchise.csv";
pub const GAMELOGS_CSV: &str = "mlb_franchise_gamelogs.csv";
pub const MANIFEST_JSON: &str = "manifest.json";

const SCORES_HEADER: [&str; 3] = ["home_score", "visitor_score", "occurrences"];
const GAMELOGS_HEADER: [&str; 5] = [
    "date",
    "visitor_team",
    "home_team",
    "visitor_score",
    "home_score",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestFile {
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
    pub rows: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportManifest {
    pub schema_version: u32,
    pub files: BTreeMap<String, ManifestFile>,
}

impl Default for ExportManifest {
    fn default() -> Self {
        Self {
            schema_version: 1,
            files: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportSummary {
    pub path: String,
    pub rows: usize,
    pub sha256: String,
}

/// CSV with a header row even when there are no score pairs.
pub fn render_score_counts_csv(counts: &[ScoreCount]) -> Result<Vec<u8>> {
    render_csv(&SCORES_HEADER, counts)
}

pub fn render_gamelogs_csv(games: &[GameLog]) -> Result<Vec<u8>> {
    render_csv(&GAMELOGS_HEADER, games)
}

fn render_csv<T: Serialize>(header: &[&str], rows: &[T]) -> Result<Vec<u8>> {
    let mut wtr = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    wtr.write_record(header).context("writing csv header")?;
    for row in rows {
        wtr.serialize(row).context("writing csv row")?;
    }
    wtr.into_inner()
        .map_err(|err| anyhow::anyhow!("finishing csv buffer: {}", err.error()))
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Replace `path` with `bytes` via a temp file + rename, so readers never see a partial file.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!("renaming {} -> {}", temp_path.display(), path.display())
        });
    }
    Ok(())
}

/// Write one export and record its digest in `<outputs>/manifest.json`.
pub async fn publish(
    outputs_dir: &Path,
    file_name: &str,
    bytes: &[u8],
    rows: usize,
) -> Result<ExportSummary> {
    let path = outputs_dir.join(file_name);
    write_atomic(&path, bytes).await?;

    let sha256 = sha256_hex(bytes);
    let manifest_path = outputs_dir.join(MANIFEST_JSON);
    let mut manifest = read_manifest(&manifest_path).await?;
    manifest.files.insert(
        file_name.to_string(),
        ManifestFile {
            path: file_name.to_string(),
            sha256: sha256.clone(),
            bytes: bytes.len() as u64,
            rows,
        },
    );
    let manifest_bytes =
        serde_json::to_vec_pretty(&manifest).context("serializing export manifest")?;
    write_atomic(&manifest_path, &manifest_bytes).await?;

    Ok(ExportSummary {
        path: path.display().to_string(),
        rows,
        sha256,
    })
}

pub async fn read_manifest(path: &Path) -> Result<ExportManifest> {
    match fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing {}", path.display())),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(ExportManifest::default()),
        Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
    }
}
