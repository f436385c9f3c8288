//! Text-file stores.
//!
//! Reading trims every line and skips blank lines and `#` comments.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use super::{CheckpointStore, ScriptStore};
use crate::error::{MigrateError, Result};

fn state_error(path: &Path, action: &str, e: std::io::Error) -> MigrateError {
    MigrateError::State(format!("cannot {} {}: {}", action, path.display(), e))
}

async fn read_lines(path: &Path) -> Result<Vec<String>> {
    match fs::read_to_string(path).await {
        Ok(content) => Ok(content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(String::from)
            .collect()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(state_error(path, "read", e)),
    }
}

async fn remove(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => {
            debug!("Removed {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(state_error(path, "delete", e)),
    }
}

/// Checkpoint kept as one table name per line.
pub struct FileCheckpointStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileCheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn read(&self) -> Result<Vec<String>> {
        read_lines(&self.path).await
    }

    async fn append_line(&self, line: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| state_error(&self.path, "open", e))?;
        file.write_all(format!("{}\n", line).as_bytes())
            .await
            .map_err(|e| state_error(&self.path, "append to", e))?;
        file.flush()
            .await
            .map_err(|e| state_error(&self.path, "flush", e))?;
        file.sync_data()
            .await
            .map_err(|e| state_error(&self.path, "sync", e))?;
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        remove(&self.path).await
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}

/// Restore script kept as a text file, replaced atomically on write.
pub struct FileScriptStore {
    path: PathBuf,
}

impl FileScriptStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ScriptStore for FileScriptStore {
    async fn read(&self) -> Result<String> {
        Ok(read_lines(&self.path).await?.join("\n"))
    }

    async fn write(&self, script: &str) -> Result<()> {
        // Atomic write: write to temp file, then rename
        let temp_path = self.path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| state_error(&temp_path, "create", e))?;
        file.write_all(script.as_bytes())
            .await
            .map_err(|e| state_error(&temp_path, "write", e))?;
        file.sync_data()
            .await
            .map_err(|e| state_error(&temp_path, "sync", e))?;
        drop(file);

        fs::rename(&temp_path, &self.path)
            .await
            .map_err(|e| state_error(&self.path, "replace", e))?;
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        remove(&self.path).await
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_checkpoint_reads_empty() {
        let dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::new(dir.path().join("tables.txt"));
        assert!(store.read().await.unwrap().is_empty());
        store.delete().await.unwrap();
    }

    #[tokio::test]
    async fn test_append_then_read() {
        let dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::new(dir.path().join("tables.txt"));
        store.append_line("customers").await.unwrap();
        store.append_line("orders").await.unwrap();
        assert_eq!(store.read().await.unwrap(), vec!["customers", "orders"]);

        store.delete().await.unwrap();
        assert!(!store.path().exists());
    }

    #[tokio::test]
    async fn test_read_skips_blanks_and_comments() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tables.txt");
        std::fs::write(&path, "# done so far\n\n  customers  \r\norders\n\n").unwrap();
        let store = FileCheckpointStore::new(&path);
        assert_eq!(store.read().await.unwrap(), vec!["customers", "orders"]);
    }

    #[tokio::test]
    async fn test_concurrent_appends_do_not_interleave() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FileCheckpointStore::new(dir.path().join("tables.txt")));

        let handles: Vec<_> = (0..32)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move { store.append_line(&format!("table_{:02}", i)).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let mut lines = store.read().await.unwrap();
        lines.sort();
        let expected: Vec<String> = (0..32).map(|i| format!("table_{:02}", i)).collect();
        assert_eq!(lines, expected);
    }

    #[tokio::test]
    async fn test_script_write_replaces() {
        let dir = TempDir::new().unwrap();
        let store = FileScriptStore::new(dir.path().join("after_script.txt"));
        assert_eq!(store.read().await.unwrap(), "");

        store.write("ALTER TABLE a ADD CONSTRAINT x;").await.unwrap();
        store
            .write("ALTER TABLE b ADD CONSTRAINT y;\nALTER TABLE c ADD CONSTRAINT z;")
            .await
            .unwrap();
        assert_eq!(
            store.read().await.unwrap(),
            "ALTER TABLE b ADD CONSTRAINT y;\nALTER TABLE c ADD CONSTRAINT z;"
        );
        assert!(!dir.path().join("after_script.tmp").exists());

        store.delete().await.unwrap();
        assert_eq!(store.read().await.unwrap(), "");
    }
}
