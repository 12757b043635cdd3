//! Best-effort keyed persistence for per-device metadata and cooling modes.
//!
//! Services persist small JSON documents keyed by `(scope, device id)` so
//! that device capabilities and the last requested cooling configuration
//! survive restarts. Persistence failures never fail device operations; the
//! callers log and move on.

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use log::warn;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

/// Outcome of reading a typed configuration entry.
///
/// `Malformed` is distinct from `NotFound` so callers can tell "never
/// persisted" apart from "persisted by an incompatible version"; both are
/// treated as absent, but malformed entries are worth a warning.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigRead<T> {
    Found(T),
    NotFound,
    Malformed,
}

impl<T> ConfigRead<T> {
    pub fn into_option(self) -> Option<T> {
        match self {
            ConfigRead::Found(value) => Some(value),
            ConfigRead::NotFound | ConfigRead::Malformed => None,
        }
    }
}

/// Keyed JSON document store.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn read_raw(&self, scope: &str, key: Uuid) -> Result<Option<Value>>;

    async fn write_raw(&self, scope: &str, key: Uuid, value: Value) -> Result<()>;

    /// Keys currently present under `scope`.
    async fn keys(&self, scope: &str) -> Result<Vec<Uuid>>;

    async fn delete(&self, scope: &str, key: Uuid) -> Result<()>;
}

/// Reads and deserializes one entry. Deserialization failures come back as
/// [`ConfigRead::Malformed`] with a warning, not as errors.
pub async fn read_value<T: DeserializeOwned>(
    store: &dyn ConfigStore,
    scope: &str,
    key: Uuid,
) -> Result<ConfigRead<T>> {
    let Some(raw) = store.read_raw(scope, key).await? else {
        return Ok(ConfigRead::NotFound);
    };
    match serde_json::from_value(raw) {
        Ok(value) => Ok(ConfigRead::Found(value)),
        Err(err) => {
            warn!("malformed config entry {scope}/{key}: {err}");
            Ok(ConfigRead::Malformed)
        }
    }
}

/// Serializes and writes one entry.
pub async fn write_value<T: Serialize>(
    store: &dyn ConfigStore,
    scope: &str,
    key: Uuid,
    value: &T,
) -> Result<()> {
    let raw = serde_json::to_value(value).context("serializing config entry")?;
    store.write_raw(scope, key, raw).await
}

/// In-memory store, used in tests and by embedders that do not persist.
#[derive(Default)]
pub struct MemoryConfigStore {
    entries: DashMap<(String, Uuid), Value>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn read_raw(&self, scope: &str, key: Uuid) -> Result<Option<Value>> {
        Ok(self
            .entries
            .get(&(scope.to_owned(), key))
            .map(|entry| entry.value().clone()))
    }

    async fn write_raw(&self, scope: &str, key: Uuid, value: Value) -> Result<()> {
        self.entries.insert((scope.to_owned(), key), value);
        Ok(())
    }

    async fn keys(&self, scope: &str) -> Result<Vec<Uuid>> {
        Ok(self
            .entries
            .iter()
            .filter(|entry| entry.key().0 == scope)
            .map(|entry| entry.key().1)
            .collect())
    }

    async fn delete(&self, scope: &str, key: Uuid) -> Result<()> {
        self.entries.remove(&(scope.to_owned(), key));
        Ok(())
    }
}

/// File-backed store: one `<root>/<scope>/<key>.json` document per entry.
pub struct JsonFileConfigStore {
    root: PathBuf,
}

impl JsonFileConfigStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn entry_path(&self, scope: &str, key: Uuid) -> PathBuf {
        self.root.join(scope).join(format!("{key}.json"))
    }
}

#[async_trait]
impl ConfigStore for JsonFileConfigStore {
    async fn read_raw(&self, scope: &str, key: Uuid) -> Result<Option<Value>> {
        let path = self.entry_path(scope, key);
        let contents = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err).context(format!("reading {}", path.display())),
        };
        let value =
            serde_json::from_str(&contents).context(format!("parsing {}", path.display()))?;
        Ok(Some(value))
    }

    async fn write_raw(&self, scope: &str, key: Uuid, value: Value) -> Result<()> {
        let path = self.entry_path(scope, key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .context(format!("creating {}", parent.display()))?;
        }
        let contents = serde_json::to_string_pretty(&value)?;
        std::fs::write(&path, contents).context(format!("writing {}", path.display()))?;
        Ok(())
    }

    async fn keys(&self, scope: &str) -> Result<Vec<Uuid>> {
        let dir = self.root.join(scope);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err).context(format!("listing {}", dir.display())),
        };
        let mut keys = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                continue;
            };
            if let Ok(key) = stem.parse() {
                keys.push(key);
            }
        }
        Ok(keys)
    }

    async fn delete(&self, scope: &str, key: Uuid) -> Result<()> {
        let path = self.entry_path(scope, key);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).context(format!("deleting {}", path.display())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Doc {
        power: u8,
    }

    #[tokio::test]
    async fn memory_store_round_trips_typed_entries() {
        let store = MemoryConfigStore::new();
        let key = Uuid::new_v4();

        assert_eq!(
            read_value::<Doc>(&store, "cooling-mode", key).await.unwrap(),
            ConfigRead::NotFound
        );

        write_value(&store, "cooling-mode", key, &Doc { power: 42 })
            .await
            .unwrap();
        assert_eq!(
            read_value::<Doc>(&store, "cooling-mode", key).await.unwrap(),
            ConfigRead::Found(Doc { power: 42 })
        );

        store.delete("cooling-mode", key).await.unwrap();
        assert_eq!(
            read_value::<Doc>(&store, "cooling-mode", key).await.unwrap(),
            ConfigRead::NotFound
        );
    }

    #[tokio::test]
    async fn incompatible_entry_reads_as_malformed() {
        let store = MemoryConfigStore::new();
        let key = Uuid::new_v4();
        store
            .write_raw("cooling-mode", key, serde_json::json!({"legacy": true}))
            .await
            .unwrap();
        assert_eq!(
            read_value::<Doc>(&store, "cooling-mode", key).await.unwrap(),
            ConfigRead::Malformed
        );
    }

    #[tokio::test]
    async fn scopes_are_isolated() {
        let store = MemoryConfigStore::new();
        let key = Uuid::new_v4();
        write_value(&store, "sensors", key, &Doc { power: 1 })
            .await
            .unwrap();
        assert_eq!(store.keys("sensors").await.unwrap(), vec![key]);
        assert!(store.keys("cooling-mode").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn file_store_round_trips_and_lists_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileConfigStore::new(dir.path());
        let key = Uuid::new_v4();

        write_value(&store, "sensors", key, &Doc { power: 7 })
            .await
            .unwrap();
        assert_eq!(
            read_value::<Doc>(&store, "sensors", key).await.unwrap(),
            ConfigRead::Found(Doc { power: 7 })
        );
        assert_eq!(store.keys("sensors").await.unwrap(), vec![key]);

        store.delete("sensors", key).await.unwrap();
        assert_eq!(
            read_value::<Doc>(&store, "sensors", key).await.unwrap(),
            ConfigRead::NotFound
        );
        // Deleting a missing entry is a no-op.
        store.delete("sensors", key).await.unwrap();
    }

    #[tokio::test]
    async fn file_store_missing_scope_lists_no_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileConfigStore::new(dir.path());
        assert!(store.keys("never-written").await.unwrap().is_empty());
    }
}
