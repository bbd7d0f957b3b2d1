//! Durable mission state: SQLite in WAL mode behind a dedicated writer
//! thread and a round-robin pool of read-only connections.

mod writer;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc::Sender;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Row, params};
use tokio::sync::oneshot;

use crate::domain::{
    BacklogItem, ContextItem, Epoch, Mission, Reflection, ReviewRecord, WorkUnit,
};
use crate::error::{Result, store_err, store_err_with};
use writer::{StoreWriter, WriteCommand};

const DEFAULT_READ_POOL_SIZE: usize = 4;

struct ReadPool {
    connections: Vec<Mutex<Connection>>,
    next: std::sync::atomic::AtomicUsize,
}

impl ReadPool {
    fn new(db_path: &Path, size: usize) -> Result<Self> {
        let mut connections = Vec::with_capacity(size);
        for _ in 0..size {
            let conn = Connection::open_with_flags(
                db_path,
                rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY
                    | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )
            .map_err(|e| store_err_with("Failed to open read connection", e))?;
            connections.push(Mutex::new(conn));
        }
        Ok(Self {
            connections,
            next: std::sync::atomic::AtomicUsize::new(0),
        })
    }

    fn acquire(&self) -> parking_lot::MutexGuard<'_, Connection> {
        let idx =
            self.next.fetch_add(1, std::sync::atomic::Ordering::Relaxed) % self.connections.len();
        self.connections[idx].lock()
    }
}

struct StoreInner {
    writer_tx: Sender<WriteCommand>,
    read_pool: ReadPool,
    db_path: PathBuf,
    /// Holds the writer thread handle. Must not be dropped while the store
    /// is alive.
    #[allow(dead_code)]
    writer: StoreWriter,
}

#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Store {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        Self::with_read_pool_size(db_path, DEFAULT_READ_POOL_SIZE)
    }

    pub fn with_read_pool_size(db_path: impl AsRef<Path>, pool_size: usize) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| store_err_with("Failed to create db directory", e))?;
        }

        let writer = StoreWriter::new(db_path.clone())?;
        let writer_tx = writer.sender();
        let read_pool = ReadPool::new(&db_path, pool_size)?;

        Ok(Self {
            inner: Arc::new(StoreInner {
                writer_tx,
                read_pool,
                db_path,
                writer,
            }),
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.inner.db_path
    }

    async fn write(&self, build: impl FnOnce(oneshot::Sender<Result<()>>) -> WriteCommand) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .writer_tx
            .send(build(tx))
            .map_err(|_| store_err("Writer thread disconnected"))?;
        rx.await
            .map_err(|_| store_err("Writer response channel dropped"))?
    }

    pub async fn upsert_mission(&self, mission: &Mission) -> Result<()> {
        let mission = Box::new(mission.clone());
        self.write(|response| WriteCommand::UpsertMission { mission, response })
            .await
    }

    pub async fn upsert_epoch(&self, epoch: &Epoch) -> Result<()> {
        let epoch = Box::new(epoch.clone());
        self.write(|response| WriteCommand::UpsertEpoch { epoch, response })
            .await
    }

    pub async fn upsert_unit(&self, unit: &WorkUnit) -> Result<()> {
        let unit = Box::new(unit.clone());
        self.write(|response| WriteCommand::UpsertUnit { unit, response })
            .await
    }

    pub async fn upsert_backlog_item(&self, item: &BacklogItem) -> Result<()> {
        let item = Box::new(item.clone());
        self.write(|response| WriteCommand::UpsertBacklogItem { item, response })
            .await
    }

    pub async fn insert_context_item(&self, item: &ContextItem) -> Result<()> {
        let item = Box::new(item.clone());
        self.write(|response| WriteCommand::InsertContextItem { item, response })
            .await
    }

    pub async fn insert_review(&self, review: &ReviewRecord) -> Result<()> {
        let review = Box::new(review.clone());
        self.write(|response| WriteCommand::InsertReview { review, response })
            .await
    }

    pub async fn insert_reflection(&self, reflection: &Reflection) -> Result<()> {
        let reflection = Box::new(reflection.clone());
        self.write(|response| WriteCommand::InsertReflection {
            reflection,
            response,
        })
        .await
    }

    async fn read<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let guard = inner.read_pool.acquire();
            f(&guard)
        })
        .await
        .map_err(|e| store_err_with("Read task failed", e))?
    }

    pub async fn get_mission(&self, mission_id: &str) -> Result<Option<Mission>> {
        let mission_id = mission_id.to_string();
        self.read(move |conn| {
            conn.query_row(
                "SELECT id, objective, verification_command, budget_usd,
                        wall_time_budget_secs, status, stop_reason, total_cost_usd,
                        total_epochs, started_at, finished_at
                 FROM missions WHERE id = ?1",
                params![mission_id],
                map_mission,
            )
            .optional()
            .map_err(|e| store_err_with("Failed to query mission", e))
        })
        .await
    }

    pub async fn list_missions(&self) -> Result<Vec<Mission>> {
        self.read(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, objective, verification_command, budget_usd,
                            wall_time_budget_secs, status, stop_reason, total_cost_usd,
                            total_epochs, started_at, finished_at
                     FROM missions ORDER BY started_at DESC",
                )
                .map_err(|e| store_err_with("Failed to prepare statement", e))?;
            let rows = stmt
                .query_map([], map_mission)
                .map_err(|e| store_err_with("Failed to query missions", e))?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| store_err_with("Failed to collect missions", e))
        })
        .await
    }

    pub async fn get_unit(&self, unit_id: &str) -> Result<Option<WorkUnit>> {
        let unit_id = unit_id.to_string();
        self.read(move |conn| {
            conn.query_row(
                &format!("{} WHERE id = ?1", UNIT_SELECT),
                params![unit_id],
                map_unit,
            )
            .optional()
            .map_err(|e| store_err_with("Failed to query unit", e))
        })
        .await
    }

    pub async fn units_for_epoch(&self, epoch_id: &str) -> Result<Vec<WorkUnit>> {
        let epoch_id = epoch_id.to_string();
        self.read(move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "{} WHERE epoch_id = ?1 ORDER BY queued_at_monotonic_ms",
                    UNIT_SELECT
                ))
                .map_err(|e| store_err_with("Failed to prepare statement", e))?;
            let rows = stmt
                .query_map(params![epoch_id], map_unit)
                .map_err(|e| store_err_with("Failed to query units", e))?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| store_err_with("Failed to collect units", e))
        })
        .await
    }

    pub async fn units_for_mission(&self, mission_id: &str) -> Result<Vec<WorkUnit>> {
        let mission_id = mission_id.to_string();
        self.read(move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "{} WHERE mission_id = ?1 ORDER BY queued_at_monotonic_ms",
                    UNIT_SELECT
                ))
                .map_err(|e| store_err_with("Failed to prepare statement", e))?;
            let rows = stmt
                .query_map(params![mission_id], map_unit)
                .map_err(|e| store_err_with("Failed to query units", e))?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| store_err_with("Failed to collect units", e))
        })
        .await
    }

    pub async fn list_backlog(&self) -> Result<Vec<BacklogItem>> {
        self.read(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, description, impact, effort, attempt_count, pinned_score,
                            last_failure, files_hint, updated_at
                     FROM backlog_items ORDER BY updated_at DESC",
                )
                .map_err(|e| store_err_with("Failed to prepare statement", e))?;
            let rows = stmt
                .query_map([], map_backlog_item)
                .map_err(|e| store_err_with("Failed to query backlog", e))?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| store_err_with("Failed to collect backlog", e))
        })
        .await
    }

    pub async fn epochs_for_mission(&self, mission_id: &str) -> Result<Vec<Epoch>> {
        let mission_id = mission_id.to_string();
        self.read(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, mission_id, ordinal, planned_unit_ids, dispatched_unit_ids,
                            ambition_score, all_failed, cost_usd, started_at, ended_at
                     FROM epochs WHERE mission_id = ?1 ORDER BY ordinal",
                )
                .map_err(|e| store_err_with("Failed to prepare statement", e))?;
            let rows = stmt
                .query_map(params![mission_id], map_epoch)
                .map_err(|e| store_err_with("Failed to query epochs", e))?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| store_err_with("Failed to collect epochs", e))
        })
        .await
    }

    pub async fn reviews_for_mission(&self, mission_id: &str) -> Result<Vec<ReviewRecord>> {
        let mission_id = mission_id.to_string();
        self.read(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, unit_id, mission_id, alignment, approach, tests, notes,
                            parsed, raw_output, created_at
                     FROM review_records WHERE mission_id = ?1 ORDER BY created_at",
                )
                .map_err(|e| store_err_with("Failed to prepare statement", e))?;
            let rows = stmt
                .query_map(params![mission_id], map_review)
                .map_err(|e| store_err_with("Failed to query reviews", e))?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| store_err_with("Failed to collect reviews", e))
        })
        .await
    }

    pub async fn reflections_for_mission(
        &self,
        mission_id: &str,
        limit: usize,
    ) -> Result<Vec<Reflection>> {
        let mission_id = mission_id.to_string();
        self.read(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, mission_id, epoch_id, content, created_at
                     FROM reflections WHERE mission_id = ?1
                     ORDER BY created_at DESC LIMIT ?2",
                )
                .map_err(|e| store_err_with("Failed to prepare statement", e))?;
            let rows = stmt
                .query_map(params![mission_id, limit as i64], map_reflection)
                .map_err(|e| store_err_with("Failed to query reflections", e))?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| store_err_with("Failed to collect reflections", e))
        })
        .await
    }

    pub async fn context_items_for_mission(
        &self,
        mission_id: &str,
        limit: usize,
    ) -> Result<Vec<ContextItem>> {
        let mission_id = mission_id.to_string();
        self.read(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, mission_id, kind, content, created_at
                     FROM context_items WHERE mission_id = ?1
                     ORDER BY created_at DESC LIMIT ?2",
                )
                .map_err(|e| store_err_with("Failed to prepare statement", e))?;
            let rows = stmt
                .query_map(params![mission_id, limit as i64], map_context_item)
                .map_err(|e| store_err_with("Failed to query context items", e))?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| store_err_with("Failed to collect context items", e))
        })
        .await
    }
}

const UNIT_SELECT: &str = "SELECT id, mission_id, epoch_id, description, files_hint, depends_on,
        acceptance_criteria, specialist_tag, needs_research, state, attempt_count,
        branch_name, last_failure_reason, queued_at, queued_at_monotonic_ms
 FROM work_units";

fn parse_timestamp(s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))
}

fn parse_json_vec(s: &str) -> rusqlite::Result<Vec<String>> {
    serde_json::from_str(s).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn map_mission(row: &Row<'_>) -> rusqlite::Result<Mission> {
    let status: String = row.get(5)?;
    let stop_reason: Option<String> = row.get(6)?;
    let started_at: String = row.get(9)?;
    let finished_at: Option<String> = row.get(10)?;
    Ok(Mission {
        id: row.get(0)?,
        objective: row.get(1)?,
        verification_command: row.get(2)?,
        budget_usd: row.get(3)?,
        wall_time_budget_secs: row.get::<_, i64>(4)? as u64,
        status: status.parse().unwrap_or(crate::domain::MissionStatus::Failed),
        stop_reason: stop_reason.and_then(|s| serde_json::from_value(serde_json::Value::String(s)).ok()),
        total_cost_usd: row.get(7)?,
        total_epochs: row.get(8)?,
        started_at: parse_timestamp(&started_at)?,
        finished_at: finished_at.as_deref().map(parse_timestamp).transpose()?,
    })
}

fn map_epoch(row: &Row<'_>) -> rusqlite::Result<Epoch> {
    let planned: String = row.get(3)?;
    let dispatched: String = row.get(4)?;
    let started_at: String = row.get(8)?;
    let ended_at: Option<String> = row.get(9)?;
    Ok(Epoch {
        id: row.get(0)?,
        mission_id: row.get(1)?,
        ordinal: row.get(2)?,
        planned_unit_ids: parse_json_vec(&planned)?,
        dispatched_unit_ids: parse_json_vec(&dispatched)?,
        ambition_score: row.get(5)?,
        all_failed: row.get(6)?,
        cost_usd: row.get(7)?,
        started_at: parse_timestamp(&started_at)?,
        ended_at: ended_at.as_deref().map(parse_timestamp).transpose()?,
    })
}

fn map_unit(row: &Row<'_>) -> rusqlite::Result<WorkUnit> {
    let files_hint: String = row.get(4)?;
    let depends_on: String = row.get(5)?;
    let criteria: String = row.get(6)?;
    let state: String = row.get(9)?;
    let queued_at: String = row.get(13)?;
    Ok(WorkUnit {
        id: row.get(0)?,
        mission_id: row.get(1)?,
        epoch_id: row.get(2)?,
        description: row.get(3)?,
        files_hint: parse_json_vec(&files_hint)?,
        depends_on: parse_json_vec(&depends_on)?,
        acceptance_criteria: parse_json_vec(&criteria)?,
        specialist_tag: row.get(7)?,
        needs_research: row.get(8)?,
        state: state.parse().unwrap_or(crate::domain::UnitState::Rejected),
        attempt_count: row.get(10)?,
        branch_name: row.get(11)?,
        last_failure_reason: row.get(12)?,
        queued_at: parse_timestamp(&queued_at)?,
        queued_at_monotonic_ms: row.get::<_, i64>(14)? as u64,
    })
}

fn map_backlog_item(row: &Row<'_>) -> rusqlite::Result<BacklogItem> {
    let files_hint: String = row.get(7)?;
    let updated_at: String = row.get(8)?;
    Ok(BacklogItem {
        id: row.get(0)?,
        description: row.get(1)?,
        impact: row.get(2)?,
        effort: row.get(3)?,
        attempt_count: row.get(4)?,
        pinned_score: row.get(5)?,
        last_failure: row.get(6)?,
        files_hint: parse_json_vec(&files_hint)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

fn map_review(row: &Row<'_>) -> rusqlite::Result<ReviewRecord> {
    let created_at: String = row.get(9)?;
    Ok(ReviewRecord {
        id: row.get(0)?,
        unit_id: row.get(1)?,
        mission_id: row.get(2)?,
        alignment: row.get(3)?,
        approach: row.get(4)?,
        tests: row.get(5)?,
        notes: row.get(6)?,
        parsed: row.get(7)?,
        raw_output: row.get(8)?,
        created_at: parse_timestamp(&created_at)?,
    })
}

fn map_context_item(row: &Row<'_>) -> rusqlite::Result<ContextItem> {
    let created_at: String = row.get(4)?;
    Ok(ContextItem {
        id: row.get(0)?,
        mission_id: row.get(1)?,
        kind: row.get(2)?,
        content: row.get(3)?,
        created_at: parse_timestamp(&created_at)?,
    })
}

fn map_reflection(row: &Row<'_>) -> rusqlite::Result<Reflection> {
    let created_at: String = row.get(4)?;
    Ok(Reflection {
        id: row.get(0)?,
        mission_id: row.get(1)?,
        epoch_id: row.get(2)?,
        content: row.get(3)?,
        created_at: parse_timestamp(&created_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{StopReason, UnitState};
    use tempfile::TempDir;

    fn temp_store() -> (TempDir, Store) {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("foreman.db");
        let store = Store::open(&db_path).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn mission_round_trip() {
        let (_dir, store) = temp_store();

        let mut mission = Mission::new("raise coverage", "cargo test").with_budget(10.0, 3600);
        store.upsert_mission(&mission).await.unwrap();

        let loaded = store.get_mission(&mission.id).await.unwrap().unwrap();
        assert_eq!(loaded.objective, "raise coverage");
        assert_eq!(loaded.wall_time_budget_secs, 3600);
        assert!(loaded.stop_reason.is_none());

        mission.stop(StopReason::CostBudget);
        mission.total_cost_usd = 10.5;
        store.upsert_mission(&mission).await.unwrap();

        let loaded = store.get_mission(&mission.id).await.unwrap().unwrap();
        assert_eq!(loaded.stop_reason, Some(StopReason::CostBudget));
        assert!((loaded.total_cost_usd - 10.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn unit_upsert_updates_state_only_fields() {
        let (_dir, store) = temp_store();

        let mut unit = WorkUnit::new("m1", "e1", "add tests")
            .with_files_hint(vec!["src/lib.rs".into()])
            .with_depends_on(vec!["u0".into()]);
        store.upsert_unit(&unit).await.unwrap();

        unit.state = UnitState::Dispatched;
        unit.attempt_count = 1;
        unit.last_failure_reason = "timeout".into();
        store.upsert_unit(&unit).await.unwrap();

        let loaded = store.get_unit(&unit.id).await.unwrap().unwrap();
        assert_eq!(loaded.state, UnitState::Dispatched);
        assert_eq!(loaded.attempt_count, 1);
        assert_eq!(loaded.last_failure_reason, "timeout");
        assert_eq!(loaded.files_hint, vec!["src/lib.rs".to_string()]);
        assert_eq!(loaded.depends_on, vec!["u0".to_string()]);
    }

    #[tokio::test]
    async fn units_query_by_epoch_in_submission_order() {
        let (_dir, store) = temp_store();

        for i in 0..3u64 {
            let mut unit = WorkUnit::new("m1", "e1", format!("unit {}", i));
            unit.queued_at_monotonic_ms = 100 - i * 10;
            store.upsert_unit(&unit).await.unwrap();
        }

        let units = store.units_for_epoch("e1").await.unwrap();
        assert_eq!(units.len(), 3);
        let ages: Vec<u64> = units.iter().map(|u| u.queued_at_monotonic_ms).collect();
        assert_eq!(ages, vec![80, 90, 100]);
    }

    #[tokio::test]
    async fn review_and_reflection_round_trip() {
        let (_dir, store) = temp_store();

        let review = ReviewRecord::parsed("u1", "m1", 8, 7, 9, "good tests");
        store.insert_review(&review).await.unwrap();

        let unparsed = ReviewRecord::unparsed("u2", "m1", "no marker in output");
        store.insert_review(&unparsed).await.unwrap();

        let reviews = store.reviews_for_mission("m1").await.unwrap();
        assert_eq!(reviews.len(), 2);
        assert!(reviews.iter().any(|r| !r.parsed && r.raw_output.contains("marker")));

        let reflection = Reflection::new("m1", "e1", "epoch 1: 3/4 units merged");
        store.insert_reflection(&reflection).await.unwrap();
        let reflections = store.reflections_for_mission("m1", 10).await.unwrap();
        assert_eq!(reflections.len(), 1);
    }

    #[tokio::test]
    async fn reopen_preserves_state() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("foreman.db");

        let mission_id = {
            let store = Store::open(&db_path).unwrap();
            let mission = Mission::new("persist me", "true");
            store.upsert_mission(&mission).await.unwrap();
            mission.id
        };

        let store = Store::open(&db_path).unwrap();
        let loaded = store.get_mission(&mission_id).await.unwrap();
        assert!(loaded.is_some());
    }

    #[tokio::test]
    async fn concurrent_writes_serialize() {
        let (_dir, store) = temp_store();

        let handles: Vec<_> = (0..20)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    let unit = WorkUnit::new("m1", "e1", format!("unit {}", i));
                    store.upsert_unit(&unit).await
                })
            })
            .collect();

        let results = futures::future::join_all(handles).await;
        assert!(results.iter().all(|r| r.as_ref().unwrap().is_ok()));

        let units = store.units_for_mission("m1").await.unwrap();
        assert_eq!(units.len(), 20);
    }
}
