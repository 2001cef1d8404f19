use std::collections::HashSet;
use std::io::SeekFrom;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::warn;

/// Stats API game ids that were already loaded, one per line on disk.
#[derive(Debug, Clone, Default)]
pub struct ProcessedGames {
    path: PathBuf,
    ids: HashSet<String>,
}

impl ProcessedGames {
    /// A missing file is an empty ledger; an unreadable one is logged and treated as empty.
    pub async fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let ids = match fs::read_to_string(&path).await {
            Ok(text) => text
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect(),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => HashSet::new(),
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "could not read processed games ledger"
                );
                HashSet::new()
            }
        };
        Self { path, ids }
    }

    pub fn contains(&self, game_id: &str) -> bool {
        self.ids.contains(game_id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Append ids not yet recorded. Returns how many were new.
    pub async fn record(&mut self, game_ids: &[String]) -> Result<usize> {
        let fresh: Vec<&String> = game_ids.iter().filter(|id| !self.ids.contains(*id)).collect();
        if fresh.is_empty() {
            return Ok(0);
        }

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("opening {}", self.path.display()))?;

        // A hand-edited file may lack its final newline.
        let mut text = String::new();
        if self.ends_mid_line(&mut file).await? {
            text.push('\n');
        }
        for id in &fresh {
            text.push_str(id);
            text.push('\n');
        }
        file.write_all(text.as_bytes())
            .await
            .with_context(|| format!("appending to {}", self.path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing {}", self.path.display()))?;

        let count = fresh.len();
        let fresh: Vec<String> = fresh.into_iter().cloned().collect();
        self.ids.extend(fresh);
        Ok(count)
    }

    async fn ends_mid_line(&self, file: &mut fs::File) -> Result<bool> {
        let len = file
            .metadata()
            .await
            .with_context(|| format!("inspecting {}", self.path.display()))?
            .len();
        if len == 0 {
            return Ok(false);
        }
        let mut last = [0u8; 1];
        file.seek(SeekFrom::End(-1))
            .await
            .with_context(|| format!("seeking {}", self.path.display()))?;
        file.read_exact(&mut last)
            .await
            .with_context(|| format!("reading {}", self.path.display()))?;
        Ok(last[0] != b'\n')
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn missing_ledger_is_empty_and_records_persist() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("state").join("processed_games.txt");

        let mut ledger = ProcessedGames::load(&path).await;
        assert!(ledger.is_empty());

        let added = ledger
            .record(&["777101".to_string(), "777102".to_string()])
            .await
            .expect("record");
        assert_eq!(added, 2);
        assert!(ledger.contains("777101"));

        let again = ledger
            .record(&["777102".to_string(), "777103".to_string()])
            .await
            .expect("record again");
        assert_eq!(again, 1);

        let reloaded = ProcessedGames::load(&path).await;
        assert_eq!(reloaded.len(), 3);
        let text = std::fs::read_to_string(&path).expect("read");
        assert_eq!(text, "777101\n777102\n777103\n");
    }

    #[tokio::test]
    async fn record_after_unterminated_last_line_keeps_ids_apart() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("processed_games.txt");
        std::fs::write(&path, "745001").expect("write");

        let mut ledger = ProcessedGames::load(&path).await;
        assert!(ledger.contains("745001"));
        ledger.record(&["745002".to_string()]).await.expect("record");

        assert_eq!(std::fs::read_to_string(&path).expect("read"), "745001\n745002\n");
        let reloaded = ProcessedGames::load(&path).await;
        assert!(reloaded.contains("745001"));
        assert!(reloaded.contains("745002"));
        assert_eq!(reloaded.len(), 2);
    }

    #[tokio::test]
    async fn blank_lines_are_ignored() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("processed_games.txt");
        std::fs::write(&path, "\n 1 \n\n2\n").expect("write");
        let ledger = ProcessedGames::load(&path).await;
        assert_eq!(ledger.len(), 2);
        assert!(ledger.contains("1"));
    }
}
