use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use rusqlite_migration::{Migrations, M};

use crate::app::{Result, PodsyncError};
use crate::domain::PendingMutation;
use crate::media::{MediaBlob, MediaStore};
use crate::store::{Batch, ChangeSet, Entries, Store};

const ENTRIES_TABLE: &str = "entries";
const BASE_TABLE: &str = "base_entries";

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.run_migrations()?;
        Ok(store)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.run_migrations()?;
        Ok(store)
    }

    fn run_migrations(&self) -> Result<()> {
        let migrations = Migrations::new(vec![M::up(include_str!(
            "../../migrations/001-initial/up.sql"
        ))]);

        let mut conn = self.conn()?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        migrations.to_latest(&mut conn)?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| PodsyncError::LockPoisoned(format!("sqlite connection: {}", e)))
    }

    fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
            .or_else(|| s.parse::<DateTime<Utc>>().ok())
    }

    fn load_table(&self, table: &str) -> Result<Entries> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!("SELECT key, value FROM {} ORDER BY key", table))?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut entries = Entries::new();
        for (key, raw) in rows {
            entries.insert(key, serde_json::from_str(&raw)?);
        }
        Ok(entries)
    }

    fn write_changes(tx: &Transaction<'_>, table: &str, changes: &ChangeSet) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }
        let mut upsert = tx.prepare(&format!(
            "INSERT INTO {} (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = ?2",
            table
        ))?;
        let mut delete = tx.prepare(&format!("DELETE FROM {} WHERE key = ?1", table))?;

        for (key, change) in changes {
            match change {
                Some(value) => {
                    upsert.execute(params![key, serde_json::to_string(value)?])?;
                }
                None => {
                    delete.execute(params![key])?;
                }
            }
        }
        Ok(())
    }
}

impl Store for SqliteStore {
    fn load_entries(&self) -> Result<Entries> {
        self.load_table(ENTRIES_TABLE)
    }

    fn load_base(&self) -> Result<Entries> {
        self.load_table(BASE_TABLE)
    }

    fn load_outbox(&self) -> Result<Vec<PendingMutation>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT id, name, args, created_at FROM outbox ORDER BY id")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(id, name, args, created_at)| {
                Ok(PendingMutation {
                    id: id as u64,
                    name,
                    args: serde_json::from_str(&args)?,
                    created_at: Self::parse_datetime(&created_at).unwrap_or_else(Utc::now),
                })
            })
            .collect()
    }

    fn meta(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        let value = conn
            .query_row(
                "SELECT value FROM sync_meta WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn commit(&self, batch: &Batch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        Self::write_changes(&tx, ENTRIES_TABLE, &batch.entries)?;
        Self::write_changes(&tx, BASE_TABLE, &batch.base)?;

        for mutation in &batch.outbox_push {
            tx.execute(
                "INSERT OR REPLACE INTO outbox (id, name, args, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    mutation.id as i64,
                    mutation.name,
                    serde_json::to_string(&mutation.args)?,
                    mutation.created_at.to_rfc3339()
                ],
            )?;
        }
        if let Some(acked) = batch.outbox_ack {
            tx.execute("DELETE FROM outbox WHERE id <= ?1", params![acked as i64])?;
        }
        for (key, value) in &batch.meta {
            tx.execute(
                "INSERT INTO sync_meta (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = ?2",
                params![key, value],
            )?;
        }

        tx.commit()?;
        Ok(())
    }
}

#[async_trait]
impl MediaStore for SqliteStore {
    async fn put(&self, episode_id: &str, blob: MediaBlob) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO media (episode_id, content_type, digest, body, stored_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(episode_id) DO UPDATE SET
                content_type = ?2, digest = ?3, body = ?4, stored_at = ?5",
            params![
                episode_id,
                blob.content_type,
                blob.digest,
                blob.body,
                blob.stored_at.to_rfc3339()
            ],
        )?;
        Ok(())
    }

    async fn get(&self, episode_id: &str) -> Result<Option<MediaBlob>> {
        let conn = self.conn()?;
        let blob = conn
            .query_row(
                "SELECT content_type, digest, body, stored_at FROM media WHERE episode_id = ?1",
                params![episode_id],
                |row| {
                    Ok(MediaBlob {
                        content_type: row.get(0)?,
                        digest: row.get(1)?,
                        body: row.get(2)?,
                        stored_at: row
                            .get::<_, String>(3)
                            .ok()
                            .and_then(|s| Self::parse_datetime(&s))
                            .unwrap_or_else(Utc::now),
                    })
                },
            )
            .optional()?;
        Ok(blob)
    }

    async fn delete(&self, episode_id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let removed = conn.execute("DELETE FROM media WHERE episode_id = ?1", params![episode_id])?;
        Ok(removed > 0)
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT episode_id FROM media ORDER BY episode_id")?;
        let keys = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pending(id: u64) -> PendingMutation {
        PendingMutation {
            id,
            name: "setPlayerSpeed".into(),
            args: json!(1.5),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_commit_and_load_entries() {
        let store = SqliteStore::in_memory().unwrap();
        let mut batch = Batch::default();
        batch.entries.insert("feed/1".into(), Some(json!({"id": "1"})));
        batch.entries.insert("feed/2".into(), Some(json!({"id": "2"})));
        store.commit(&batch).unwrap();

        let mut batch = Batch::default();
        batch.entries.insert("feed/1".into(), None);
        store.commit(&batch).unwrap();

        let entries = store.load_entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries.get("feed/2"), Some(&json!({"id": "2"})));
        assert!(store.load_base().unwrap().is_empty());
    }

    #[test]
    fn test_outbox_push_and_ack() {
        let store = SqliteStore::in_memory().unwrap();
        let batch = Batch {
            outbox_push: vec![pending(1), pending(2), pending(3)],
            ..Default::default()
        };
        store.commit(&batch).unwrap();

        let batch = Batch {
            outbox_ack: Some(2),
            ..Default::default()
        };
        store.commit(&batch).unwrap();

        let outbox = store.load_outbox().unwrap();
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox[0].id, 3);
        assert_eq!(outbox[0].args, json!(1.5));
    }

    #[test]
    fn test_meta_upsert() {
        let store = SqliteStore::in_memory().unwrap();
        assert_eq!(store.meta("cookie").unwrap(), None);

        for value in ["1", "2"] {
            let batch = Batch {
                meta: vec![("cookie".into(), value.into())],
                ..Default::default()
            };
            store.commit(&batch).unwrap();
        }
        assert_eq!(store.meta("cookie").unwrap(), Some("2".into()));
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("podsync.db");
        {
            let store = SqliteStore::new(&path).unwrap();
            let mut batch = Batch::default();
            batch.base.insert("/volume".into(), Some(json!(0.5)));
            batch.outbox_push.push(pending(7));
            store.commit(&batch).unwrap();
        }

        let store = SqliteStore::new(&path).unwrap();
        assert_eq!(store.load_base().unwrap().get("/volume"), Some(&json!(0.5)));
        assert_eq!(store.load_outbox().unwrap()[0].id, 7);
    }

    #[tokio::test]
    async fn test_media_put_get_delete() {
        let store = SqliteStore::in_memory().unwrap();
        let blob = MediaBlob::new("audio/mpeg", b"ID3...".to_vec());
        store.put("e1", blob.clone()).await.unwrap();

        let found = store.get("e1").await.unwrap().unwrap();
        assert_eq!(found.digest, blob.digest);
        assert_eq!(found.body, b"ID3...".to_vec());
        assert_eq!(store.keys().await.unwrap(), vec!["e1".to_string()]);

        assert!(store.delete("e1").await.unwrap());
        assert!(!store.delete("e1").await.unwrap());
        assert!(store.get("e1").await.unwrap().is_none());
    }
}
