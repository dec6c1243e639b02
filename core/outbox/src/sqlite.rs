//! SQLite-backed durable outbox.
//!
//! Persists queued mutations locally so that nothing enqueued while offline is
//! lost across restarts.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use tracing::{debug, info};

use tideline_common::{
    ConflictRecord, Error, ItemId, ItemStatus, NewItem, Priority, RecordId, Result, SyncItem,
};

use crate::store::{Disposition, Enqueued, OutboxStore, StatusCounts};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS sync_items (
        id TEXT PRIMARY KEY,
        table_name TEXT NOT NULL,
        action TEXT NOT NULL,
        payload TEXT NOT NULL,
        record_id TEXT,
        priority INTEGER NOT NULL,
        status TEXT NOT NULL,
        enqueued_at INTEGER NOT NULL,
        last_attempt_at INTEGER,
        next_attempt_at INTEGER,
        retry_count INTEGER NOT NULL DEFAULT 0,
        last_error TEXT,
        resolution TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_sync_items_selection
        ON sync_items(status, priority, enqueued_at);
    CREATE INDEX IF NOT EXISTS idx_sync_items_record
        ON sync_items(table_name, record_id, status);
"#;

const COLUMNS: &str = "id, table_name, action, payload, record_id, priority, status, \
     enqueued_at, last_attempt_at, next_attempt_at, retry_count, last_error, resolution";

fn due_query() -> String {
    format!(
        "SELECT {} FROM sync_items \
         WHERE status = 'pending' AND (next_attempt_at IS NULL OR next_attempt_at <= ?1) \
         ORDER BY priority ASC, enqueued_at ASC, id ASC LIMIT ?2",
        COLUMNS
    )
}

fn store_err(err: rusqlite::Error) -> Error {
    Error::Store(err.to_string())
}

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| Error::Store(format!("Timestamp out of range: {}", ms)))
}

/// A row as stored, before its text columns are parsed.
struct StoredRow {
    id: String,
    table: String,
    action: String,
    payload: String,
    record_id: Option<String>,
    priority: i32,
    status: String,
    enqueued_at: i64,
    last_attempt_at: Option<i64>,
    next_attempt_at: Option<i64>,
    retry_count: u32,
    last_error: Option<String>,
    resolution: Option<String>,
}

impl StoredRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            table: row.get(1)?,
            action: row.get(2)?,
            payload: row.get(3)?,
            record_id: row.get(4)?,
            priority: row.get(5)?,
            status: row.get(6)?,
            enqueued_at: row.get(7)?,
            last_attempt_at: row.get(8)?,
            next_attempt_at: row.get(9)?,
            retry_count: row.get(10)?,
            last_error: row.get(11)?,
            resolution: row.get(12)?,
        })
    }

    fn into_item(self) -> Result<SyncItem> {
        Ok(SyncItem {
            id: ItemId::from_raw(self.id),
            table: self.table,
            action: self.action.parse()?,
            payload: serde_json::from_str(&self.payload)?,
            record_id: self.record_id.map(RecordId::from),
            priority: Priority(self.priority),
            status: self.status.parse()?,
            enqueued_at: from_millis(self.enqueued_at)?,
            last_attempt_at: self.last_attempt_at.map(from_millis).transpose()?,
            next_attempt_at: self.next_attempt_at.map(from_millis).transpose()?,
            retry_count: self.retry_count,
            last_error: self.last_error,
            resolution: self
                .resolution
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
        })
    }
}

fn select_items(
    conn: &Connection,
    sql: &str,
    params: &[&dyn rusqlite::ToSql],
) -> Result<Vec<SyncItem>> {
    let mut stmt = conn.prepare(sql).map_err(store_err)?;
    let rows = stmt
        .query_map(params, StoredRow::from_row)
        .map_err(store_err)?;

    let mut items = Vec::new();
    for row in rows {
        items.push(row.map_err(store_err)?.into_item()?);
    }
    Ok(items)
}

/// Fold the item `id`, just returned to pending, into a newer pending item
/// for the same record. Runs inside the caller's transaction.
fn fold_into_newer(conn: &Connection, id: &ItemId) -> Result<()> {
    let older = select_items(
        conn,
        &format!("SELECT {} FROM sync_items WHERE id = ?1", COLUMNS),
        params![id.as_str()],
    )?
    .into_iter()
    .next();
    let Some(older) = older else {
        return Ok(());
    };
    let Some(record_id) = &older.record_id else {
        return Ok(());
    };

    let newer = select_items(
        conn,
        &format!(
            "SELECT {} FROM sync_items \
             WHERE table_name = ?1 AND record_id = ?2 AND status = 'pending' AND id != ?3 \
             ORDER BY enqueued_at LIMIT 1",
            COLUMNS
        ),
        params![older.table, record_id.as_str(), older.id.as_str()],
    )?
    .into_iter()
    .next();
    let Some(mut newer) = newer else {
        return Ok(());
    };

    conn.execute("DELETE FROM sync_items WHERE id = ?1", params![older.id.as_str()])
        .map_err(store_err)?;

    if newer.absorb_older(&older) {
        debug!("Folded requeued item {} into {}", older.id, newer.id);
        conn.execute(
            "UPDATE sync_items SET action = ?1, priority = ?2, enqueued_at = ?3, \
             next_attempt_at = ?4, retry_count = ?5, last_error = ?6 WHERE id = ?7",
            params![
                newer.action.as_str(),
                newer.priority.0,
                to_millis(newer.enqueued_at),
                newer.next_attempt_at.map(to_millis),
                newer.retry_count,
                newer.last_error,
                newer.id.as_str(),
            ],
        )
        .map_err(store_err)?;
    } else {
        debug!("Requeued item {} cancels pending {}", older.id, newer.id);
        conn.execute("DELETE FROM sync_items WHERE id = ?1", params![newer.id.as_str()])
            .map_err(store_err)?;
    }
    Ok(())
}

/// Durable outbox in a single SQLite table.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Create or open an outbox database.
    ///
    /// # Errors
    /// - Database creation or migration failure
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path).map_err(store_err)?;
        conn.execute_batch(SCHEMA).map_err(store_err)?;

        info!("Outbox store opened successfully");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory outbox (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    fn query_items(&self, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<Vec<SyncItem>> {
        select_items(&self.conn.lock(), sql, params)
    }

    /// Run an UPDATE that must touch exactly the item `id`.
    fn update_one(&self, id: &ItemId, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<()> {
        let changed = self.conn.lock().execute(sql, params).map_err(store_err)?;
        if changed == 0 {
            return Err(Error::NotFound(format!("Sync item not found: {}", id)));
        }
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn enqueue(&self, item: NewItem) -> Result<Enqueued> {
        item.validate()?;
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(store_err)?;

        let existing = match &item.record_id {
            Some(record_id) => tx
                .query_row(
                    &format!(
                        "SELECT {} FROM sync_items \
                         WHERE table_name = ?1 AND record_id = ?2 AND status = 'pending' \
                         ORDER BY enqueued_at LIMIT 1",
                        COLUMNS
                    ),
                    params![item.table, record_id.as_str()],
                    StoredRow::from_row,
                )
                .optional()
                .map_err(store_err)?,
            None => None,
        };

        let enqueued = match existing {
            Some(row) => {
                let mut current = row.into_item()?;
                if current.absorb(&item) {
                    debug!("Coalescing mutation into {}", current.id);
                    tx.execute(
                        "UPDATE sync_items SET action = ?1, payload = ?2, priority = ?3 WHERE id = ?4",
                        params![
                            current.action.as_str(),
                            serde_json::to_string(&current.payload)?,
                            current.priority.0,
                            current.id.as_str(),
                        ],
                    )
                    .map_err(store_err)?;
                    Enqueued {
                        id: current.id,
                        disposition: Disposition::Coalesced,
                    }
                } else {
                    debug!("Mutation cancels pending create {}", current.id);
                    tx.execute(
                        "DELETE FROM sync_items WHERE id = ?1",
                        params![current.id.as_str()],
                    )
                    .map_err(store_err)?;
                    Enqueued {
                        id: current.id,
                        disposition: Disposition::Cancelled,
                    }
                }
            }
            None => {
                let new = item.into_item(Utc::now());
                tx.execute(
                    &format!(
                        "INSERT INTO sync_items ({}) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, NULL, NULL, 0, NULL, NULL)",
                        COLUMNS
                    ),
                    params![
                        new.id.as_str(),
                        new.table,
                        new.action.as_str(),
                        serde_json::to_string(&new.payload)?,
                        new.record_id.as_ref().map(|r| r.as_str()),
                        new.priority.0,
                        new.status.as_str(),
                        to_millis(new.enqueued_at),
                    ],
                )
                .map_err(store_err)?;
                Enqueued {
                    id: new.id,
                    disposition: Disposition::Inserted,
                }
            }
        };

        tx.commit().map_err(store_err)?;
        Ok(enqueued)
    }

    async fn get(&self, id: &ItemId) -> Result<Option<SyncItem>> {
        let items = self.query_items(
            &format!("SELECT {} FROM sync_items WHERE id = ?1", COLUMNS),
            params![id.as_str()],
        )?;
        Ok(items.into_iter().next())
    }

    async fn list_pending(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<SyncItem>> {
        self.query_items(&due_query(), params![to_millis(now), limit as i64])
    }

    async fn mark_in_flight(&self, ids: &[ItemId], now: DateTime<Utc>) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(store_err)?;
        for id in ids {
            tx.execute(
                "UPDATE sync_items SET status = 'in_flight', last_attempt_at = ?1 \
                 WHERE id = ?2 AND status = 'pending'",
                params![to_millis(now), id.as_str()],
            )
            .map_err(store_err)?;
        }
        tx.commit().map_err(store_err)
    }

    async fn claim_batch(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<SyncItem>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(store_err)?;

        let mut batch = select_items(&tx, &due_query(), params![to_millis(now), limit as i64])?;
        for item in &mut batch {
            tx.execute(
                "UPDATE sync_items SET status = 'in_flight', last_attempt_at = ?1 WHERE id = ?2",
                params![to_millis(now), item.id.as_str()],
            )
            .map_err(store_err)?;
            item.status = ItemStatus::InFlight;
            item.last_attempt_at = Some(now);
        }

        tx.commit().map_err(store_err)?;
        Ok(batch)
    }

    async fn mark_synced(&self, id: &ItemId) -> Result<()> {
        self.update_one(
            id,
            "UPDATE sync_items SET status = 'synced', next_attempt_at = NULL, last_error = NULL \
             WHERE id = ?1",
            params![id.as_str()],
        )
    }

    async fn mark_failed(&self, id: &ItemId, error: &str) -> Result<()> {
        self.update_one(
            id,
            "UPDATE sync_items SET status = 'failed', next_attempt_at = NULL, last_error = ?1 \
             WHERE id = ?2",
            params![error, id.as_str()],
        )
    }

    async fn schedule_retry(
        &self,
        id: &ItemId,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(store_err)?;

        let changed = tx
            .execute(
                "UPDATE sync_items SET status = 'pending', retry_count = retry_count + 1, \
                 next_attempt_at = ?1, last_error = ?2 WHERE id = ?3",
                params![to_millis(next_attempt_at), error, id.as_str()],
            )
            .map_err(store_err)?;
        if changed == 0 {
            return Err(Error::NotFound(format!("Sync item not found: {}", id)));
        }
        fold_into_newer(&tx, id)?;

        tx.commit().map_err(store_err)
    }

    async fn mark_conflicted(&self, id: &ItemId, resolution: ConflictRecord) -> Result<()> {
        let resolution = serde_json::to_string(&resolution)?;
        self.update_one(
            id,
            "UPDATE sync_items SET status = 'conflicted', next_attempt_at = NULL, resolution = ?1 \
             WHERE id = ?2",
            params![resolution, id.as_str()],
        )
    }

    async fn count_pending(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .lock()
            .query_row(
                "SELECT COUNT(*) FROM sync_items WHERE status IN ('pending', 'in_flight')",
                [],
                |row| row.get(0),
            )
            .map_err(store_err)?;
        Ok(count as usize)
    }

    async fn counts(&self) -> Result<StatusCounts> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT status, COUNT(*) FROM sync_items GROUP BY status")
            .map_err(store_err)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
            .map_err(store_err)?;

        let mut counts = StatusCounts::default();
        for row in rows {
            let (status, count) = row.map_err(store_err)?;
            let count = count as usize;
            match status.parse::<ItemStatus>()? {
                ItemStatus::Pending => counts.pending = count,
                ItemStatus::InFlight => counts.in_flight = count,
                ItemStatus::Synced => counts.synced = count,
                ItemStatus::Failed => counts.failed = count,
                ItemStatus::Conflicted => counts.conflicted = count,
            }
        }
        Ok(counts)
    }

    async fn next_retry_at(&self) -> Result<Option<DateTime<Utc>>> {
        let earliest: Option<i64> = self
            .conn
            .lock()
            .query_row(
                "SELECT MIN(next_attempt_at) FROM sync_items WHERE status = 'pending'",
                [],
                |row| row.get(0),
            )
            .map_err(store_err)?;
        earliest.map(from_millis).transpose()
    }

    async fn revert_in_flight(&self) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(store_err)?;

        let ids: Vec<ItemId> = {
            let mut stmt = tx
                .prepare("SELECT id FROM sync_items WHERE status = 'in_flight'")
                .map_err(store_err)?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(store_err)?;
            let ids = rows
                .map(|row| row.map(ItemId::from_raw))
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(store_err)?;
            ids
        };

        tx.execute(
            "UPDATE sync_items SET status = 'pending' WHERE status = 'in_flight'",
            [],
        )
        .map_err(store_err)?;
        for id in &ids {
            fold_into_newer(&tx, id)?;
        }
        tx.commit().map_err(store_err)?;

        if !ids.is_empty() {
            info!("Reverted {} in-flight items to pending", ids.len());
        }
        Ok(ids.len())
    }

    async fn resync_failed(&self, ids: Option<&[ItemId]>) -> Result<usize> {
        const RESET: &str = "UPDATE sync_items SET status = 'pending', retry_count = 0, \
                             next_attempt_at = NULL, last_error = NULL WHERE status = 'failed'";

        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(store_err)?;
        let reset = match ids {
            None => tx.execute(RESET, []).map_err(store_err)?,
            Some(ids) => {
                let mut reset = 0;
                for id in ids {
                    reset += tx
                        .execute(&format!("{} AND id = ?1", RESET), params![id.as_str()])
                        .map_err(store_err)?;
                }
                reset
            }
        };
        tx.commit().map_err(store_err)?;
        Ok(reset)
    }

    async fn discard(&self, id: &ItemId) -> Result<()> {
        let conn = self.conn.lock();
        let status: Option<String> = conn
            .query_row(
                "SELECT status FROM sync_items WHERE id = ?1",
                params![id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(store_err)?;

        match status.as_deref() {
            None => Err(Error::NotFound(format!("Sync item not found: {}", id))),
            Some("in_flight") => Err(Error::InvalidInput(format!(
                "Cannot discard in-flight item: {}",
                id
            ))),
            Some(_) => {
                conn.execute("DELETE FROM sync_items WHERE id = ?1", params![id.as_str()])
                    .map_err(store_err)?;
                Ok(())
            }
        }
    }

    async fn purge_synced(&self, older_than: DateTime<Utc>) -> Result<usize> {
        self.conn
            .lock()
            .execute(
                "DELETE FROM sync_items WHERE status = 'synced' \
                 AND (last_attempt_at IS NULL OR last_attempt_at < ?1)",
                params![to_millis(older_than)],
            )
            .map_err(store_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;
    use tideline_common::{ConflictPolicy, SyncAction};

    fn update(record: i64, title: &str) -> NewItem {
        NewItem::new("todos", SyncAction::Update, json!({ "title": title })).with_record_id(record)
    }

    #[tokio::test]
    async fn test_enqueue_and_get() {
        let store = SqliteStore::in_memory().unwrap();
        let enqueued = store.enqueue(update(1, "a")).await.unwrap();
        assert_eq!(enqueued.disposition, Disposition::Inserted);

        let item = store.get(&enqueued.id).await.unwrap().unwrap();
        assert_eq!(item.table, "todos");
        assert_eq!(item.action, SyncAction::Update);
        assert_eq!(item.record_id, Some(RecordId::from("1")));
        assert_eq!(item.status, ItemStatus::Pending);
        assert_eq!(item.payload, json!({ "title": "a" }));
    }

    #[tokio::test]
    async fn test_coalescing_in_transaction() {
        let store = SqliteStore::in_memory().unwrap();
        let first = store.enqueue(update(1, "a")).await.unwrap();
        let second = store.enqueue(update(1, "b")).await.unwrap();

        assert_eq!(second.disposition, Disposition::Coalesced);
        assert_eq!(first.id, second.id);
        assert_eq!(store.count_pending().await.unwrap(), 1);

        let cancel = store
            .enqueue(NewItem::new("todos", SyncAction::Create, json!({})).with_record_id("n"))
            .await
            .unwrap();
        let cancelled = store
            .enqueue(NewItem::new("todos", SyncAction::Delete, json!(null)).with_record_id("n"))
            .await
            .unwrap();
        assert_eq!(cancelled.disposition, Disposition::Cancelled);
        assert!(store.get(&cancel.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_selection_order_and_backoff() {
        let store = SqliteStore::in_memory().unwrap();
        for p in [3, 1, 2] {
            store
                .enqueue(NewItem::new("notes", SyncAction::Create, json!({})).with_priority(Priority(p)))
                .await
                .unwrap();
        }

        let now = Utc::now();
        let batch = store.list_pending(10, now).await.unwrap();
        let priorities: Vec<i32> = batch.iter().map(|i| i.priority.0).collect();
        assert_eq!(priorities, vec![1, 2, 3]);

        let later = now + chrono::Duration::seconds(60);
        store.mark_in_flight(&[batch[0].id.clone()], now).await.unwrap();
        store.schedule_retry(&batch[0].id, "503", later).await.unwrap();

        assert_eq!(store.list_pending(10, now).await.unwrap().len(), 2);
        assert_eq!(store.list_pending(10, later).await.unwrap().len(), 3);
        assert_eq!(
            store.next_retry_at().await.unwrap().map(|t| t.timestamp_millis()),
            Some(later.timestamp_millis())
        );
    }

    #[tokio::test]
    async fn test_claim_batch_in_one_transaction() {
        let store = SqliteStore::in_memory().unwrap();
        for p in [3, 1, 2] {
            store
                .enqueue(NewItem::new("notes", SyncAction::Create, json!({})).with_priority(Priority(p)))
                .await
                .unwrap();
        }

        let now = Utc::now();
        let claimed = store.claim_batch(2, now).await.unwrap();
        let priorities: Vec<i32> = claimed.iter().map(|i| i.priority.0).collect();
        assert_eq!(priorities, vec![1, 2]);
        assert!(claimed.iter().all(|i| i.status == ItemStatus::InFlight));

        let stored = store.get(&claimed[0].id).await.unwrap().unwrap();
        assert_eq!(stored.status, ItemStatus::InFlight);
        assert_eq!(
            stored.last_attempt_at.map(|t| t.timestamp_millis()),
            Some(now.timestamp_millis())
        );
        assert_eq!(store.counts().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn test_retry_folds_into_newer_pending_item() {
        let store = SqliteStore::in_memory().unwrap();
        let now = Utc::now();
        let later = now + chrono::Duration::seconds(30);

        let stale = store
            .enqueue(NewItem::new("todos", SyncAction::Create, json!({ "v": 1 })).with_record_id(1))
            .await
            .unwrap()
            .id;
        store.claim_batch(10, now).await.unwrap();
        let fresh = store.enqueue(update(1, "v2")).await.unwrap();
        assert_eq!(fresh.disposition, Disposition::Inserted);

        store.schedule_retry(&stale, "503", later).await.unwrap();

        assert!(store.get(&stale).await.unwrap().is_none());
        let item = store.get(&fresh.id).await.unwrap().unwrap();
        assert_eq!(item.action, SyncAction::Create);
        assert_eq!(item.payload, json!({ "title": "v2" }));
        assert_eq!(item.retry_count, 1);
        assert_eq!(item.last_error.as_deref(), Some("503"));
        assert_eq!(
            item.next_attempt_at.map(|t| t.timestamp_millis()),
            Some(later.timestamp_millis())
        );
        assert_eq!(store.count_pending().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_status_transitions_and_counts() {
        let store = SqliteStore::in_memory().unwrap();
        let a = store.enqueue(update(1, "a")).await.unwrap().id;
        let b = store.enqueue(update(2, "b")).await.unwrap().id;
        let c = store.enqueue(update(3, "c")).await.unwrap().id;

        store
            .mark_in_flight(&[a.clone(), b.clone(), c.clone()], Utc::now())
            .await
            .unwrap();
        store.mark_synced(&a).await.unwrap();
        store.mark_failed(&b, "invalid payload").await.unwrap();
        store
            .mark_conflicted(
                &c,
                ConflictRecord {
                    policy: ConflictPolicy::ServerWins,
                    server_version: Some(json!({ "title": "server" })),
                    resolved_at: Utc::now(),
                },
            )
            .await
            .unwrap();

        let counts = store.counts().await.unwrap();
        assert_eq!(counts.synced, 1);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.conflicted, 1);
        assert_eq!(counts.outstanding(), 0);

        let conflicted = store.get(&c).await.unwrap().unwrap();
        let resolution = conflicted.resolution.unwrap();
        assert_eq!(resolution.server_version, Some(json!({ "title": "server" })));

        assert_eq!(store.resync_failed(Some(&[b.clone()])).await.unwrap(), 1);
        assert_eq!(store.get(&b).await.unwrap().unwrap().status, ItemStatus::Pending);
    }

    #[tokio::test]
    async fn test_unknown_id_is_not_found() {
        let store = SqliteStore::in_memory().unwrap();
        let err = store.mark_failed(&ItemId::generate(), "x").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_persistence_and_recovery() {
        let temp = TempDir::new().unwrap();
        let db_path = temp.path().join("outbox.db");

        let id = {
            let store = SqliteStore::open(&db_path).unwrap();
            let id = store.enqueue(update(1, "offline edit")).await.unwrap().id;
            store.mark_in_flight(&[id.clone()], Utc::now()).await.unwrap();
            id
        };

        let store = SqliteStore::open(&db_path).unwrap();
        assert_eq!(store.revert_in_flight().await.unwrap(), 1);

        let item = store.get(&id).await.unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::Pending);
        assert!(item.last_attempt_at.is_some());
        assert_eq!(item.payload, json!({ "title": "offline edit" }));
    }

    #[tokio::test]
    async fn test_recovery_folds_into_newer_edit() {
        let temp = TempDir::new().unwrap();
        let db_path = temp.path().join("outbox.db");

        let fresh = {
            let store = SqliteStore::open(&db_path).unwrap();
            store.enqueue(update(1, "sent")).await.unwrap();
            store.claim_batch(10, Utc::now()).await.unwrap();
            store.enqueue(update(1, "edited")).await.unwrap().id
        };

        let store = SqliteStore::open(&db_path).unwrap();
        assert_eq!(store.revert_in_flight().await.unwrap(), 1);
        assert_eq!(store.count_pending().await.unwrap(), 1);

        let item = store.get(&fresh).await.unwrap().unwrap();
        assert_eq!(item.payload, json!({ "title": "edited" }));
    }

    #[tokio::test]
    async fn test_discard_refuses_in_flight() {
        let store = SqliteStore::in_memory().unwrap();
        let id = store.enqueue(update(1, "a")).await.unwrap().id;
        store.mark_in_flight(&[id.clone()], Utc::now()).await.unwrap();
        assert!(matches!(store.discard(&id).await, Err(Error::InvalidInput(_))));

        store.mark_synced(&id).await.unwrap();
        assert_eq!(
            store
                .purge_synced(Utc::now() + chrono::Duration::seconds(1))
                .await
                .unwrap(),
            1
        );
    }
}
