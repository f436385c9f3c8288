//! Durable resume records.
//!
//! Two stores survive an interrupted run:
//!
//! - the **checkpoint**, an append-only list of tables that finished copying;
//! - the **restore script**, the DDL that re-adds suspended foreign keys.
//!
//! [`FileCheckpointStore`] and [`FileScriptStore`] keep them as plain text
//! files; the memory implementations back embedding and tests.

mod file;
mod memory;

pub use file::{FileCheckpointStore, FileScriptStore};
pub use memory::{MemoryCheckpointStore, MemoryScriptStore};

use async_trait::async_trait;

use crate::error::Result;

/// Append-only record of fully transferred tables.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Recorded lines in order. Empty if the record does not exist.
    async fn read(&self) -> Result<Vec<String>>;

    /// Durably append one line, creating the record if needed.
    ///
    /// Concurrent callers are serialized; each append completes before the
    /// next one starts.
    async fn append_line(&self, line: &str) -> Result<()>;

    /// Remove the record. No-op if absent.
    async fn delete(&self) -> Result<()>;

    /// Where the record lives, for messages.
    fn location(&self) -> String;
}

/// Persisted restore DDL.
#[async_trait]
pub trait ScriptStore: Send + Sync {
    /// Stored script, or an empty string if none.
    async fn read(&self) -> Result<String>;

    /// Replace the stored script.
    async fn write(&self, script: &str) -> Result<()>;

    /// Remove the script. No-op if absent.
    async fn delete(&self) -> Result<()>;

    fn location(&self) -> String;
}
