//! Player profiles stored as one JSON file per account.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use realm_core::{BoxError, Persist};
use realm_protocol::WorldId;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace};

use crate::world::PlayerSession;

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt profile {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Name {0:?} cannot be used as a file name")]
    InvalidName(String),
}

/// Saved state of one player.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerRecord {
    pub name: String,
    pub world: WorldId,
    pub x: u16,
    pub y: u16,
    #[serde(default)]
    pub saved_at: u64,
}

impl PlayerRecord {
    /// Record for a player who has never been saved.
    #[must_use]
    pub fn fresh(name: impl Into<String>, world: WorldId) -> Self {
        Self {
            name: name.into(),
            world,
            x: SPAWN.0,
            y: SPAWN.1,
            saved_at: 0,
        }
    }
}

/// Where new players appear.
pub const SPAWN: (u16, u16) = (3222, 3218);

/// One pooled handle onto the profile directory.
#[derive(Debug, Clone)]
pub struct StoreSession {
    dir: Arc<PathBuf>,
    slot: usize,
}

impl StoreSession {
    #[must_use]
    pub fn new(dir: Arc<PathBuf>, slot: usize) -> Self {
        Self { dir, slot }
    }

    /// Create the profile directory if missing.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub async fn prepare(dir: &Path) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(dir).await.map_err(|source| StoreError::Io {
            path: dir.to_path_buf(),
            source,
        })
    }

    fn path_for(&self, name: &str) -> Result<PathBuf, StoreError> {
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ' ');
        if !valid {
            return Err(StoreError::InvalidName(name.to_string()));
        }
        Ok(self.dir.join(format!("{}.json", name.replace(' ', "_"))))
    }

    /// Load a profile. `None` if the player was never saved.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub async fn load(&self, name: &str) -> Result<Option<PlayerRecord>, StoreError> {
        let path = self.path_for(name)?;
        let contents = match tokio::fs::read(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(StoreError::Io { path, source }),
        };
        let record = serde_json::from_slice(&contents).map_err(|source| StoreError::Corrupt {
            path: path.clone(),
            source,
        })?;
        trace!(player = name, path = %path.display(), "Profile loaded");
        Ok(Some(record))
    }

    /// Write a profile, replacing the previous file atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub async fn write(&self, record: &PlayerRecord) -> Result<(), StoreError> {
        let path = self.path_for(&record.name)?;
        let tmp = path.with_extension(format!("json.{}.tmp", self.slot));
        let contents = serde_json::to_vec_pretty(record).map_err(|source| StoreError::Corrupt {
            path: path.clone(),
            source,
        })?;

        tokio::fs::write(&tmp, contents)
            .await
            .map_err(|source| StoreError::Io {
                path: tmp.clone(),
                source,
            })?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|source| StoreError::Io {
                path: path.clone(),
                source,
            })?;
        debug!(player = %record.name, slot = self.slot, "Profile saved");
        Ok(())
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[async_trait]
impl Persist<PlayerSession> for StoreSession {
    async fn save(&mut self, player: &PlayerSession) -> Result<bool, BoxError> {
        // Profiles that failed to load are never overwritten.
        if !player.is_loaded() {
            return Ok(false);
        }
        let mut record = player.record();
        record.saved_at = unix_now();
        self.write(&record).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(tag: &str) -> Arc<PathBuf> {
        let dir = std::env::temp_dir().join(format!("realm-store-{}-{}", tag, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        Arc::new(dir)
    }

    #[tokio::test]
    async fn test_write_then_load() {
        let dir = scratch_dir("roundtrip");
        StoreSession::prepare(&dir).await.unwrap();
        let store = StoreSession::new(dir.clone(), 0);

        assert_eq!(store.load("zezima").await.unwrap(), None);

        let record = PlayerRecord {
            name: "zezima".to_string(),
            world: 2,
            x: 3093,
            y: 3493,
            saved_at: 7,
        };
        store.write(&record).await.unwrap();
        assert_eq!(store.load("zezima").await.unwrap(), Some(record));

        // No temporary files left behind.
        let leftovers = std::fs::read_dir(dir.as_path())
            .unwrap()
            .filter(|e| e.as_ref().unwrap().path().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
        let _ = std::fs::remove_dir_all(dir.as_path());
    }

    #[tokio::test]
    async fn test_corrupt_profile_reported() {
        let dir = scratch_dir("corrupt");
        StoreSession::prepare(&dir).await.unwrap();
        std::fs::write(dir.join("broken.json"), b"{ not json").unwrap();

        let store = StoreSession::new(dir.clone(), 1);
        assert!(matches!(
            store.load("broken").await,
            Err(StoreError::Corrupt { .. })
        ));
        let _ = std::fs::remove_dir_all(dir.as_path());
    }

    #[tokio::test]
    async fn test_path_names_rejected() {
        let store = StoreSession::new(scratch_dir("names"), 0);
        assert!(matches!(
            store.load("../etc/passwd").await,
            Err(StoreError::InvalidName(_))
        ));
    }
}
