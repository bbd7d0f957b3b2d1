//! Dedicated writer thread for the mission database.

use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};

use rusqlite::{Connection, params};
use tracing::{debug, error, warn};

use crate::domain::{
    BacklogItem, ContextItem, Epoch, Mission, Reflection, ReviewRecord, WorkUnit,
};
use crate::error::{Result, store_err, store_err_with};

pub(super) enum WriteCommand {
    UpsertMission {
        mission: Box<Mission>,
        response: tokio::sync::oneshot::Sender<Result<()>>,
    },
    UpsertEpoch {
        epoch: Box<Epoch>,
        response: tokio::sync::oneshot::Sender<Result<()>>,
    },
    UpsertUnit {
        unit: Box<WorkUnit>,
        response: tokio::sync::oneshot::Sender<Result<()>>,
    },
    UpsertBacklogItem {
        item: Box<BacklogItem>,
        response: tokio::sync::oneshot::Sender<Result<()>>,
    },
    InsertContextItem {
        item: Box<ContextItem>,
        response: tokio::sync::oneshot::Sender<Result<()>>,
    },
    InsertReview {
        review: Box<ReviewRecord>,
        response: tokio::sync::oneshot::Sender<Result<()>>,
    },
    InsertReflection {
        reflection: Box<Reflection>,
        response: tokio::sync::oneshot::Sender<Result<()>>,
    },
    Shutdown,
}

pub(super) struct StoreWriter {
    tx: Sender<WriteCommand>,
    handle: Option<JoinHandle<()>>,
}

/// Forward-only migrations, applied in order at startup. Each entry bumps
/// `schema_version` to its number inside the same transaction.
const MIGRATIONS: &[(i64, &str)] = &[(
    1,
    r"
    CREATE TABLE IF NOT EXISTS missions (
        id TEXT PRIMARY KEY,
        objective TEXT NOT NULL,
        verification_command TEXT NOT NULL,
        budget_usd REAL NOT NULL,
        wall_time_budget_secs INTEGER NOT NULL,
        status TEXT NOT NULL,
        stop_reason TEXT,
        total_cost_usd REAL NOT NULL,
        total_epochs INTEGER NOT NULL,
        started_at TEXT NOT NULL,
        finished_at TEXT
    );

    CREATE TABLE IF NOT EXISTS epochs (
        id TEXT PRIMARY KEY,
        mission_id TEXT NOT NULL,
        ordinal INTEGER NOT NULL,
        planned_unit_ids TEXT NOT NULL,
        dispatched_unit_ids TEXT NOT NULL,
        ambition_score REAL NOT NULL,
        all_failed INTEGER NOT NULL,
        cost_usd REAL NOT NULL,
        started_at TEXT NOT NULL,
        ended_at TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_epochs_mission ON epochs(mission_id, ordinal);

    CREATE TABLE IF NOT EXISTS work_units (
        id TEXT PRIMARY KEY,
        mission_id TEXT NOT NULL,
        epoch_id TEXT NOT NULL,
        description TEXT NOT NULL,
        files_hint TEXT NOT NULL,
        depends_on TEXT NOT NULL,
        acceptance_criteria TEXT NOT NULL,
        specialist_tag TEXT NOT NULL,
        needs_research INTEGER NOT NULL,
        state TEXT NOT NULL,
        attempt_count INTEGER NOT NULL,
        branch_name TEXT NOT NULL,
        last_failure_reason TEXT NOT NULL,
        queued_at TEXT NOT NULL,
        queued_at_monotonic_ms INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_units_mission ON work_units(mission_id);
    CREATE INDEX IF NOT EXISTS idx_units_epoch ON work_units(epoch_id);

    CREATE TABLE IF NOT EXISTS backlog_items (
        id TEXT PRIMARY KEY,
        description TEXT NOT NULL,
        impact REAL NOT NULL,
        effort REAL NOT NULL,
        attempt_count INTEGER NOT NULL,
        pinned_score REAL,
        last_failure TEXT NOT NULL,
        files_hint TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS context_items (
        id TEXT PRIMARY KEY,
        mission_id TEXT NOT NULL,
        kind TEXT NOT NULL,
        content TEXT NOT NULL,
        created_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_context_mission ON context_items(mission_id);

    CREATE TABLE IF NOT EXISTS review_records (
        id TEXT PRIMARY KEY,
        unit_id TEXT NOT NULL,
        mission_id TEXT NOT NULL,
        alignment INTEGER NOT NULL,
        approach INTEGER NOT NULL,
        tests INTEGER NOT NULL,
        notes TEXT NOT NULL,
        parsed INTEGER NOT NULL,
        raw_output TEXT NOT NULL,
        created_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_reviews_mission ON review_records(mission_id);

    CREATE TABLE IF NOT EXISTS reflections (
        id TEXT PRIMARY KEY,
        mission_id TEXT NOT NULL,
        epoch_id TEXT NOT NULL,
        content TEXT NOT NULL,
        created_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_reflections_mission ON reflections(mission_id);
    ",
)];

impl StoreWriter {
    pub fn new(db_path: PathBuf) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<WriteCommand>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<()>>();

        let handle = thread::Builder::new()
            .name("store-writer".into())
            .spawn(move || match Self::init_db(&db_path) {
                Ok(conn) => {
                    let _ = ready_tx.send(Ok(()));
                    Self::process_commands(&conn, rx);
                }
                Err(e) => {
                    error!(error = %e, "Store writer init failed");
                    let _ = ready_tx.send(Err(e));
                }
            })
            .map_err(|e| store_err_with("Failed to spawn writer thread", e))?;

        ready_rx
            .recv()
            .map_err(|_| store_err("Writer thread died during init"))??;

        Ok(Self {
            tx,
            handle: Some(handle),
        })
    }

    pub fn sender(&self) -> Sender<WriteCommand> {
        self.tx.clone()
    }

    fn init_db(db_path: &PathBuf) -> Result<Connection> {
        let conn =
            Connection::open(db_path).map_err(|e| store_err_with("Failed to open database", e))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| store_err_with("Failed to enable WAL", e))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|e| store_err_with("Failed to set synchronous", e))?;
        Self::run_migrations(&conn)?;
        Ok(conn)
    }

    fn run_migrations(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY);
             INSERT OR IGNORE INTO schema_version VALUES (0);",
        )
        .map_err(|e| store_err_with("Failed to init schema_version", e))?;

        let current: i64 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
                row.get(0)
            })
            .map_err(|e| store_err_with("Failed to read schema version", e))?;

        for (version, sql) in MIGRATIONS {
            if *version <= current {
                continue;
            }
            let tx = conn
                .unchecked_transaction()
                .map_err(|e| store_err_with("Failed to start migration transaction", e))?;
            tx.execute_batch(sql)
                .map_err(|e| store_err_with("Failed to apply migration", e))?;
            tx.execute("INSERT INTO schema_version VALUES (?1)", params![version])
                .map_err(|e| store_err_with("Failed to record migration", e))?;
            tx.commit()
                .map_err(|e| store_err_with("Failed to commit migration", e))?;
            debug!(version, "Applied schema migration");
        }

        Ok(())
    }

    fn process_commands(conn: &Connection, rx: Receiver<WriteCommand>) {
        for cmd in rx {
            match cmd {
                WriteCommand::UpsertMission { mission, response } => {
                    let _ = response.send(Self::upsert_mission(conn, &mission));
                }
                WriteCommand::UpsertEpoch { epoch, response } => {
                    let _ = response.send(Self::upsert_epoch(conn, &epoch));
                }
                WriteCommand::UpsertUnit { unit, response } => {
                    let _ = response.send(Self::upsert_unit(conn, &unit));
                }
                WriteCommand::UpsertBacklogItem { item, response } => {
                    let _ = response.send(Self::upsert_backlog_item(conn, &item));
                }
                WriteCommand::InsertContextItem { item, response } => {
                    let _ = response.send(Self::insert_context_item(conn, &item));
                }
                WriteCommand::InsertReview { review, response } => {
                    let _ = response.send(Self::insert_review(conn, &review));
                }
                WriteCommand::InsertReflection {
                    reflection,
                    response,
                } => {
                    let _ = response.send(Self::insert_reflection(conn, &reflection));
                }
                WriteCommand::Shutdown => {
                    debug!("Store writer received shutdown signal");
                    break;
                }
            }
        }
    }

    fn upsert_mission(conn: &Connection, mission: &Mission) -> Result<()> {
        conn.execute(
            "INSERT INTO missions
               (id, objective, verification_command, budget_usd, wall_time_budget_secs,
                status, stop_reason, total_cost_usd, total_epochs, started_at, finished_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(id) DO UPDATE SET
               status = excluded.status,
               stop_reason = excluded.stop_reason,
               total_cost_usd = excluded.total_cost_usd,
               total_epochs = excluded.total_epochs,
               finished_at = excluded.finished_at",
            params![
                mission.id,
                mission.objective,
                mission.verification_command,
                mission.budget_usd,
                mission.wall_time_budget_secs as i64,
                mission.status.as_str(),
                mission.stop_reason.map(|r| r.as_str()),
                mission.total_cost_usd,
                mission.total_epochs,
                mission.started_at.to_rfc3339(),
                mission.finished_at.map(|t| t.to_rfc3339()),
            ],
        )
        .map_err(|e| store_err_with("Failed to upsert mission", e))?;
        Ok(())
    }

    fn upsert_epoch(conn: &Connection, epoch: &Epoch) -> Result<()> {
        conn.execute(
            "INSERT INTO epochs
               (id, mission_id, ordinal, planned_unit_ids, dispatched_unit_ids,
                ambition_score, all_failed, cost_usd, started_at, ended_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(id) DO UPDATE SET
               planned_unit_ids = excluded.planned_unit_ids,
               dispatched_unit_ids = excluded.dispatched_unit_ids,
               ambition_score = excluded.ambition_score,
               all_failed = excluded.all_failed,
               cost_usd = excluded.cost_usd,
               ended_at = excluded.ended_at",
            params![
                epoch.id,
                epoch.mission_id,
                epoch.ordinal,
                serde_json::to_string(&epoch.planned_unit_ids)
                    .map_err(|e| store_err_with("Failed to serialize planned ids", e))?,
                serde_json::to_string(&epoch.dispatched_unit_ids)
                    .map_err(|e| store_err_with("Failed to serialize dispatched ids", e))?,
                epoch.ambition_score,
                epoch.all_failed,
                epoch.cost_usd,
                epoch.started_at.to_rfc3339(),
                epoch.ended_at.map(|t| t.to_rfc3339()),
            ],
        )
        .map_err(|e| store_err_with("Failed to upsert epoch", e))?;
        Ok(())
    }

    fn upsert_unit(conn: &Connection, unit: &WorkUnit) -> Result<()> {
        conn.execute(
            "INSERT INTO work_units
               (id, mission_id, epoch_id, description, files_hint, depends_on,
                acceptance_criteria, specialist_tag, needs_research, state,
                attempt_count, branch_name, last_failure_reason, queued_at,
                queued_at_monotonic_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
             ON CONFLICT(id) DO UPDATE SET
               state = excluded.state,
               attempt_count = excluded.attempt_count,
               last_failure_reason = excluded.last_failure_reason,
               epoch_id = excluded.epoch_id",
            params![
                unit.id,
                unit.mission_id,
                unit.epoch_id,
                unit.description,
                serde_json::to_string(&unit.files_hint)
                    .map_err(|e| store_err_with("Failed to serialize files_hint", e))?,
                serde_json::to_string(&unit.depends_on)
                    .map_err(|e| store_err_with("Failed to serialize depends_on", e))?,
                serde_json::to_string(&unit.acceptance_criteria)
                    .map_err(|e| store_err_with("Failed to serialize criteria", e))?,
                unit.specialist_tag,
                unit.needs_research,
                unit.state.as_str(),
                unit.attempt_count,
                unit.branch_name,
                unit.last_failure_reason,
                unit.queued_at.to_rfc3339(),
                unit.queued_at_monotonic_ms as i64,
            ],
        )
        .map_err(|e| store_err_with("Failed to upsert work unit", e))?;
        Ok(())
    }

    fn upsert_backlog_item(conn: &Connection, item: &BacklogItem) -> Result<()> {
        conn.execute(
            "INSERT INTO backlog_items
               (id, description, impact, effort, attempt_count, pinned_score,
                last_failure, files_hint, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(id) DO UPDATE SET
               impact = excluded.impact,
               effort = excluded.effort,
               attempt_count = excluded.attempt_count,
               pinned_score = excluded.pinned_score,
               last_failure = excluded.last_failure,
               updated_at = excluded.updated_at",
            params![
                item.id,
                item.description,
                item.impact,
                item.effort,
                item.attempt_count,
                item.pinned_score,
                item.last_failure,
                serde_json::to_string(&item.files_hint)
                    .map_err(|e| store_err_with("Failed to serialize files_hint", e))?,
                item.updated_at.to_rfc3339(),
            ],
        )
        .map_err(|e| store_err_with("Failed to upsert backlog item", e))?;
        Ok(())
    }

    fn insert_context_item(conn: &Connection, item: &ContextItem) -> Result<()> {
        conn.execute(
            "INSERT INTO context_items (id, mission_id, kind, content, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                item.id,
                item.mission_id,
                item.kind,
                item.content,
                item.created_at.to_rfc3339(),
            ],
        )
        .map_err(|e| store_err_with("Failed to insert context item", e))?;
        Ok(())
    }

    fn insert_review(conn: &Connection, review: &ReviewRecord) -> Result<()> {
        conn.execute(
            "INSERT INTO review_records
               (id, unit_id, mission_id, alignment, approach, tests, notes,
                parsed, raw_output, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                review.id,
                review.unit_id,
                review.mission_id,
                review.alignment,
                review.approach,
                review.tests,
                review.notes,
                review.parsed,
                review.raw_output,
                review.created_at.to_rfc3339(),
            ],
        )
        .map_err(|e| store_err_with("Failed to insert review", e))?;
        Ok(())
    }

    fn insert_reflection(conn: &Connection, reflection: &Reflection) -> Result<()> {
        conn.execute(
            "INSERT INTO reflections (id, mission_id, epoch_id, content, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                reflection.id,
                reflection.mission_id,
                reflection.epoch_id,
                reflection.content,
                reflection.created_at.to_rfc3339(),
            ],
        )
        .map_err(|e| store_err_with("Failed to insert reflection", e))?;
        Ok(())
    }
}

impl Drop for StoreWriter {
    fn drop(&mut self) {
        let _ = self.tx.send(WriteCommand::Shutdown);
        if let Some(handle) = self.handle.take()
            && let Err(e) = handle.join()
        {
            warn!("Store writer thread panicked: {:?}", e);
        }
    }
}
