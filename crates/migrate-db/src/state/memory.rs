//! In-memory stores.

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{CheckpointStore, ScriptStore};
use crate::error::Result;

#[derive(Default)]
pub struct MemoryCheckpointStore {
    lines: Mutex<Option<Vec<String>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that already holds `lines`, as left by an earlier run.
    pub fn with_lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            lines: Mutex::new(Some(lines.into_iter().map(Into::into).collect())),
        }
    }

    /// Whether the record currently exists.
    pub async fn exists(&self) -> bool {
        self.lines.lock().await.is_some()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn read(&self) -> Result<Vec<String>> {
        Ok(self.lines.lock().await.clone().unwrap_or_default())
    }

    async fn append_line(&self, line: &str) -> Result<()> {
        self.lines
            .lock()
            .await
            .get_or_insert_with(Vec::new)
            .push(line.to_string());
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        *self.lines.lock().await = None;
        Ok(())
    }

    fn location(&self) -> String {
        "memory".to_string()
    }
}

#[derive(Default)]
pub struct MemoryScriptStore {
    script: Mutex<Option<String>>,
}

impl MemoryScriptStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(script: impl Into<String>) -> Self {
        Self {
            script: Mutex::new(Some(script.into())),
        }
    }

    pub async fn exists(&self) -> bool {
        self.script.lock().await.is_some()
    }
}

#[async_trait]
impl ScriptStore for MemoryScriptStore {
    async fn read(&self) -> Result<String> {
        Ok(self.script.lock().await.clone().unwrap_or_default())
    }

    async fn write(&self, script: &str) -> Result<()> {
        *self.script.lock().await = Some(script.to_string());
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        *self.script.lock().await = None;
        Ok(())
    }

    fn location(&self) -> String {
        "memory".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_checkpoint_lifecycle() {
        let store = MemoryCheckpointStore::with_lines(["customers"]);
        store.append_line("orders").await.unwrap();
        assert_eq!(store.read().await.unwrap(), vec!["customers", "orders"]);
        store.delete().await.unwrap();
        assert!(!store.exists().await);
        assert!(store.read().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_script_lifecycle() {
        let store = MemoryScriptStore::new();
        assert_eq!(store.read().await.unwrap(), "");
        store.write("ALTER TABLE x;").await.unwrap();
        assert!(store.exists().await);
        store.delete().await.unwrap();
        assert!(!store.exists().await);
    }
}
