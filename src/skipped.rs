use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::info;
use tokio::sync::RwLock;

/// Capability the core needs from the skipped-events store: membership checks
/// and the active id list. Lookup errors are treated as "not skipped" by
/// callers, so a broken store never hides the calendar.
#[async_trait]
pub trait SkippedStore: Send + Sync {
    async fn is_skipped(&self, event_id: &str) -> Result<bool>;
    /// Active skipped ids mapped to the reason they were skipped.
    async fn active_list(&self) -> Result<HashMap<String, String>>;
}

/// Persisted skipped-event store backed by sled. Survives restarts; the event
/// window itself is rebuilt from sources and never persisted.
pub struct SledSkippedStore {
    tree: sled::Tree,
    _db: sled::Db,
}

impl SledSkippedStore {
    pub fn open(path: Option<PathBuf>) -> Result<Self> {
        let path = match path {
            Some(p) => p,
            None => {
                let mut p = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
                p.push("calendarbot");
                p.push("skipped_events.db");
                p
            }
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let db = sled::open(&path)
            .with_context(|| format!("Failed to open skipped store at {}", path.display()))?;
        let tree = db
            .open_tree("skipped_events")
            .context("Failed to open skipped_events tree")?;
        info!(
            "Skipped-event store opened at {} ({} entries)",
            path.display(),
            tree.len()
        );
        Ok(SledSkippedStore { tree, _db: db })
    }

    pub fn skip(&self, event_id: &str, reason: &str) -> Result<()> {
        self.tree
            .insert(event_id.as_bytes(), reason.as_bytes())
            .context("Failed to write skipped event")?;
        self.tree.flush().context("Failed to flush skipped store")?;
        Ok(())
    }

    pub fn unskip(&self, event_id: &str) -> Result<bool> {
        let removed = self
            .tree
            .remove(event_id.as_bytes())
            .context("Failed to remove skipped event")?
            .is_some();
        self.tree.flush().context("Failed to flush skipped store")?;
        Ok(removed)
    }

    /// Maintenance operation: drop every skipped id.
    pub fn clear_all(&self) -> Result<usize> {
        let count = self.tree.len();
        self.tree.clear().context("Failed to clear skipped store")?;
        self.tree.flush().context("Failed to flush skipped store")?;
        info!("Cleared {} skipped events", count);
        Ok(count)
    }
}

#[async_trait]
impl SkippedStore for SledSkippedStore {
    async fn is_skipped(&self, event_id: &str) -> Result<bool> {
        Ok(self
            .tree
            .contains_key(event_id.as_bytes())
            .context("Skipped store lookup failed")?)
    }

    async fn active_list(&self) -> Result<HashMap<String, String>> {
        let mut out = HashMap::new();
        for entry in self.tree.iter() {
            let (key, value) = entry.context("Skipped store scan failed")?;
            out.insert(
                String::from_utf8_lossy(&key).into_owned(),
                String::from_utf8_lossy(&value).into_owned(),
            );
        }
        Ok(out)
    }
}

/// In-memory store for tests and for running without persistence.
#[derive(Default)]
pub struct MemorySkippedStore {
    entries: RwLock<HashMap<String, String>>,
}

impl MemorySkippedStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn skip(&self, event_id: &str, reason: &str) {
        self.entries
            .write()
            .await
            .insert(event_id.to_string(), reason.to_string());
    }
}

#[async_trait]
impl SkippedStore for MemorySkippedStore {
    async fn is_skipped(&self, event_id: &str) -> Result<bool> {
        Ok(self.entries.read().await.contains_key(event_id))
    }

    async fn active_list(&self) -> Result<HashMap<String, String>> {
        Ok(self.entries.read().await.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sled_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SledSkippedStore::open(Some(dir.path().join("skipped.db"))).unwrap();

        assert!(!store.is_skipped("ev-1").await.unwrap());
        store.skip("ev-1", "declined standing meeting").unwrap();
        assert!(store.is_skipped("ev-1").await.unwrap());

        let list = store.active_list().await.unwrap();
        assert_eq!(
            list.get("ev-1").map(String::as_str),
            Some("declined standing meeting")
        );

        assert!(store.unskip("ev-1").unwrap());
        assert!(!store.unskip("ev-1").unwrap());
        assert!(!store.is_skipped("ev-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_sled_store_clear_all() {
        let dir = tempfile::tempdir().unwrap();
        let store = SledSkippedStore::open(Some(dir.path().join("skipped.db"))).unwrap();
        store.skip("a", "r").unwrap();
        store.skip("b", "r").unwrap();
        assert_eq!(store.clear_all().unwrap(), 2);
        assert!(store.active_list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemorySkippedStore::new();
        store.skip("x", "testing").await;
        assert!(store.is_skipped("x").await.unwrap());
        assert!(!store.is_skipped("y").await.unwrap());
    }
}
