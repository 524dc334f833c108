use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};

use crate::db::{connection::Database, helpers::parse_datetime, models::AudioMapping};
use crate::models::TagId;

fn row_to_mapping(row: &Row) -> Result<AudioMapping> {
    let id: String = row.get("id")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;

    Ok(AudioMapping {
        tag: TagId::parse(&id).with_context(|| format!("blank tag id {id:?} in database"))?,
        file: row.get("file")?,
        created_at: parse_datetime(&created_at, "created_at")?,
        updated_at: parse_datetime(&updated_at, "updated_at")?,
    })
}

impl Database {
    /// File mapped to `tag`, if any.
    pub fn get_mapping(&self, tag: &TagId) -> Result<Option<String>> {
        let id = tag.as_str().to_string();
        self.execute(move |conn| {
            conn.query_row(
                "SELECT file FROM rfid_audio WHERE id = ?1",
                params![id],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .context("failed to look up mapping")
        })
    }

    /// Inserts or replaces the file for `tag`. Returns the previous file when
    /// an existing mapping was overwritten.
    pub fn upsert_mapping(&self, tag: &TagId, file: &str) -> Result<Option<String>> {
        let id = tag.as_str().to_string();
        let file = file.to_string();
        self.execute(move |conn| {
            let tx = conn.transaction()?;
            let previous: Option<String> = tx
                .query_row(
                    "SELECT file FROM rfid_audio WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;

            let now = Utc::now().to_rfc3339();
            tx.execute(
                "INSERT INTO rfid_audio (id, file, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?3)
                 ON CONFLICT(id) DO UPDATE SET
                     file = excluded.file,
                     updated_at = excluded.updated_at",
                params![id, file, now],
            )
            .context("failed to upsert mapping")?;
            tx.commit().context("failed to commit mapping")?;

            Ok(previous)
        })
    }

    /// All mappings, most recently updated first.
    pub fn list_mappings(&self) -> Result<Vec<AudioMapping>> {
        self.execute(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, file, created_at, updated_at
                 FROM rfid_audio
                 ORDER BY updated_at DESC",
            )?;

            let mut rows = stmt.query([])?;
            let mut mappings = Vec::new();
            while let Some(row) = rows.next()? {
                mappings.push(row_to_mapping(row)?);
            }

            Ok(mappings)
        })
    }
}
