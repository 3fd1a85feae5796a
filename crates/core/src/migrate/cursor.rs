//! JSON file persistence for [`MigrationCursor`].

use std::path::{Path, PathBuf};

use super::state::MigrationCursor;
use crate::Error;

/// Stores the cursor as pretty JSON, replacing the file atomically.
#[derive(Debug, Clone)]
pub struct CursorStore {
    path: PathBuf,
}

impl CursorStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the saved cursor, if any.
    ///
    /// # Errors
    ///
    /// Returns `Error::CorruptDocument` if the file is not a valid cursor.
    pub async fn load(&self) -> Result<Option<MigrationCursor>, Error> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| Error::corrupt(self.path.display().to_string(), e))
    }

    /// Write the cursor to a temporary sibling and rename it into place.
    pub async fn save(&self, cursor: &MigrationCursor) -> Result<(), Error> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec_pretty(cursor).map_err(|e| Error::Validation(format!("cursor: {e}")))?;

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        tracing::debug!(path = %self.path.display(), phase = %cursor.phase, last_key = ?cursor.last_key, "cursor saved");
        Ok(())
    }

    /// Discard the saved cursor. Missing files are not an error.
    pub async fn clear(&self) -> Result<(), Error> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::state::MigrationPhase;

    #[tokio::test]
    async fn test_save_load_clear() {
        let dir = tempfile::tempdir().unwrap();
        let store = CursorStore::new(dir.path().join("state").join("cursor.json"));
        assert!(store.load().await.unwrap().is_none());

        let mut cursor = MigrationCursor::new();
        cursor.transition(MigrationPhase::Scanning).unwrap();
        cursor.last_key = Some("https://b.com/".into());
        cursor.counters.migrated = 2;
        store.save(&cursor).await.unwrap();

        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded.phase, MigrationPhase::Scanning);
        assert_eq!(loaded.last_key.as_deref(), Some("https://b.com/"));
        assert_eq!(loaded.counters, cursor.counters);

        store.clear().await.unwrap();
        assert!(store.load().await.unwrap().is_none());
        store.clear().await.unwrap();
    }

    #[tokio::test]
    async fn test_corrupt_cursor_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cursor.json");
        tokio::fs::write(&path, b"{not json").await.unwrap();
        let err = CursorStore::new(&path).load().await.unwrap_err();
        assert!(matches!(err, Error::CorruptDocument { .. }));
    }
}
