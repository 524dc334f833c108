use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::{anyhow, Result};
use chrono::Utc;
use log::warn;

use super::{models::AudioMapping, Database};
use crate::models::TagId;

/// Tag-to-file lookup used by the playback engine and registration flow.
///
/// Implementations must make an upsert visible to every later `get`.
pub trait MappingStore: Send + Sync {
    fn get(&self, tag: &TagId) -> Result<Option<String>>;

    /// Returns the file previously mapped to `tag`, if any.
    fn upsert(&self, tag: &TagId, file: &str) -> Result<Option<String>>;

    fn list(&self) -> Result<Vec<AudioMapping>>;
}

impl MappingStore for Database {
    fn get(&self, tag: &TagId) -> Result<Option<String>> {
        self.get_mapping(tag)
    }

    fn upsert(&self, tag: &TagId, file: &str) -> Result<Option<String>> {
        self.upsert_mapping(tag, file)
    }

    fn list(&self) -> Result<Vec<AudioMapping>> {
        self.list_mappings()
    }
}

/// Mappings held in memory for the life of the process.
#[derive(Default)]
pub struct MemoryStore {
    rows: RwLock<HashMap<TagId, AudioMapping>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded with `(tag id, file)` pairs. Blank ids are skipped.
    pub fn with_mappings<I, T, F>(mappings: I) -> Self
    where
        I: IntoIterator<Item = (T, F)>,
        T: AsRef<str>,
        F: Into<String>,
    {
        let store = Self::new();
        {
            let mut rows = match store.rows.write() {
                Ok(rows) => rows,
                Err(poisoned) => poisoned.into_inner(),
            };
            let now = Utc::now();
            for (id, file) in mappings {
                let Some(tag) = TagId::parse(id.as_ref()) else {
                    warn!("Skipping mapping with blank tag id");
                    continue;
                };
                rows.insert(
                    tag.clone(),
                    AudioMapping {
                        tag,
                        file: file.into(),
                        created_at: now,
                        updated_at: now,
                    },
                );
            }
        }
        store
    }
}

impl MappingStore for MemoryStore {
    fn get(&self, tag: &TagId) -> Result<Option<String>> {
        let rows = self
            .rows
            .read()
            .map_err(|_| anyhow!("mapping table lock poisoned"))?;
        Ok(rows.get(tag).map(|row| row.file.clone()))
    }

    fn upsert(&self, tag: &TagId, file: &str) -> Result<Option<String>> {
        let mut rows = self
            .rows
            .write()
            .map_err(|_| anyhow!("mapping table lock poisoned"))?;
        let now = Utc::now();
        match rows.get_mut(tag) {
            Some(row) => {
                let previous = std::mem::replace(&mut row.file, file.to_string());
                row.updated_at = now;
                Ok(Some(previous))
            }
            None => {
                rows.insert(
                    tag.clone(),
                    AudioMapping {
                        tag: tag.clone(),
                        file: file.to_string(),
                        created_at: now,
                        updated_at: now,
                    },
                );
                Ok(None)
            }
        }
    }

    fn list(&self) -> Result<Vec<AudioMapping>> {
        let rows = self
            .rows
            .read()
            .map_err(|_| anyhow!("mapping table lock poisoned"))?;
        let mut all: Vec<_> = rows.values().cloned().collect();
        all.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(all)
    }
}
