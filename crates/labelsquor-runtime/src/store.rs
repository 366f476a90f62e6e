//! SQLite-backed durable store.
//!
//! Owns every table in the runtime schema and exposes the two primitives the
//! rest of the system is built on: compare-and-transition (the sole mutator
//! of `state`) and acquire-lock-if-free. Both run in a single transaction
//! with their outbox inserts; delivery happens elsewhere.
//!
//! Timestamps are stored as milliseconds since the UTC epoch. The schema is
//! versioned through a migration table applied at open.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{json, Value};

use labelsquor_workflow::{
    FailureClass, OrchestratorError, PipelineStage, QuotaLimits, Result, WorkItemState,
};

use crate::models::{
    DeadLetterRow, DispatchCandidate, EventRecord, EventType, LastError, ListFilter, MetricKind,
    QuotaCounter, QuotaUsage, QuotaUsageLogRow, QuotaWindow, TransitionRecord, WorkItem,
};

const SCHEMA_VERSION: i64 = 2;

const WORK_ITEM_COLUMNS: &str = "id, state, stage, priority, version, enqueued_at_ms, \
     started_at_ms, completed_at_ms, next_attempt_at_ms, lock_holder, lock_acquired_at_ms, \
     lock_expires_at_ms, attempt_count, quota_exceeded_count, payload, partial_results, \
     last_error, cancel_requested, quota_service";

/// Field updates applied alongside a state change. `Option<Option<T>>`
/// distinguishes "leave unchanged" (`None`) from "set" and "clear".
#[derive(Clone, Debug, Default)]
pub struct TransitionUpdates {
    pub stage: Option<PipelineStage>,
    pub next_attempt_at: Option<Option<DateTime<Utc>>>,
    pub increment_attempt: bool,
    pub increment_quota_exceeded: bool,
    /// Entry merged into `partial_results`. A completed stage uses its stage
    /// name as the key; interrupted progress uses a `<stage>_partial` key so
    /// it never counts as a completed stage.
    pub partial_result: Option<(String, Value)>,
    pub last_error: Option<Option<LastError>>,
    pub quota_service: Option<Option<String>>,
    pub clear_cancel_requested: bool,
    /// Error chain persisted to the dead-letter table when the target state
    /// is DEAD_LETTERED; defaults to the item's last error.
    pub dead_letter_chain: Option<Value>,
    /// Additional outbox events co-committed with the state change.
    pub extra_events: Vec<(EventType, Value)>,
}

/// One compare-and-transition call. Every transition carries a reason and an
/// actor; the store rejects pairs not in the legal-transition table.
#[derive(Clone, Debug)]
pub struct TransitionRequest {
    pub work_item_id: String,
    pub expected_version: u64,
    pub from: WorkItemState,
    pub to: WorkItemState,
    pub reason: String,
    pub actor: String,
    pub metadata: Option<Value>,
    pub updates: TransitionUpdates,
}

impl TransitionRequest {
    pub fn new(
        work_item_id: impl Into<String>,
        expected_version: u64,
        from: WorkItemState,
        to: WorkItemState,
        reason: impl Into<String>,
        actor: impl Into<String>,
    ) -> Self {
        Self {
            work_item_id: work_item_id.into(),
            expected_version,
            from,
            to,
            reason: reason.into(),
            actor: actor.into(),
            metadata: None,
            updates: TransitionUpdates::default(),
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_stage(mut self, stage: PipelineStage) -> Self {
        self.updates.stage = Some(stage);
        self
    }

    pub fn set_next_attempt_at(mut self, at: DateTime<Utc>) -> Self {
        self.updates.next_attempt_at = Some(Some(at));
        self
    }

    pub fn clear_next_attempt_at(mut self) -> Self {
        self.updates.next_attempt_at = Some(None);
        self
    }

    pub fn increment_attempt(mut self) -> Self {
        self.updates.increment_attempt = true;
        self
    }

    pub fn increment_quota_exceeded(mut self) -> Self {
        self.updates.increment_quota_exceeded = true;
        self
    }

    pub fn with_partial_result(mut self, stage: PipelineStage, summary: Value) -> Self {
        self.updates.partial_result = Some((stage.as_str().to_string(), summary));
        self
    }

    /// Progress entry that must not mark a stage as completed.
    pub fn with_partial_entry(mut self, key: impl Into<String>, summary: Value) -> Self {
        self.updates.partial_result = Some((key.into(), summary));
        self
    }

    pub fn set_last_error(mut self, class: FailureClass, message: impl Into<String>) -> Self {
        self.updates.last_error = Some(Some(LastError {
            class,
            message: message.into(),
        }));
        self
    }

    pub fn clear_last_error(mut self) -> Self {
        self.updates.last_error = Some(None);
        self
    }

    pub fn set_quota_service(mut self, service: impl Into<String>) -> Self {
        self.updates.quota_service = Some(Some(service.into()));
        self
    }

    pub fn clear_quota_service(mut self) -> Self {
        self.updates.quota_service = Some(None);
        self
    }

    pub fn clear_cancel_requested(mut self) -> Self {
        self.updates.clear_cancel_requested = true;
        self
    }

    pub fn with_dead_letter_chain(mut self, chain: Value) -> Self {
        self.updates.dead_letter_chain = Some(chain);
        self
    }

    pub fn with_event(mut self, event_type: EventType, payload: Value) -> Self {
        self.updates.extra_events.push((event_type, payload));
        self
    }
}

#[derive(Clone)]
pub struct SqliteWorkflowStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteWorkflowStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)
            .map_err(|e| OrchestratorError::StoreUnavailable(format!("open {}: {}", db_path, e)))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| OrchestratorError::StoreUnavailable(format!("set WAL: {}", e)))?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(|e| OrchestratorError::StoreUnavailable(format!("enable fks: {}", e)))?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| OrchestratorError::Store("store connection lock poisoned".to_string()))
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.conn()?;
        ensure_migration_table(&conn)?;
        let current = current_schema_version(&conn)?;
        if current > SCHEMA_VERSION {
            return Err(OrchestratorError::Store(format!(
                "schema version {} is newer than supported {}",
                current, SCHEMA_VERSION
            )));
        }
        if current < 1 {
            apply_migration_v1(&conn)?;
            record_migration(&conn, 1, "baseline_workflow_tables")?;
        }
        if current < 2 {
            apply_migration_v2(&conn)?;
            record_migration(&conn, 2, "cancellation_and_quota_pause")?;
        }
        Ok(())
    }

    /// Insert a new work item in CREATED. The ingress facade transitions it
    /// to READY in the same call via [Self::compare_and_transition].
    pub fn insert_work_item(
        &self,
        id: &str,
        payload: &Value,
        priority: i64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn()?;
        let payload_text = payload.to_string();
        conn.execute(
            "INSERT INTO work_item
             (id, state, stage, priority, version, enqueued_at_ms, attempt_count,
              quota_exceeded_count, payload, partial_results)
             VALUES (?1, 'created', 'discovery', ?2, 0, ?3, 0, 0, ?4, '{}')",
            params![id, priority, dt_to_ms(now), payload_text],
        )
        .map_err(|e| OrchestratorError::Store(format!("insert work item: {}", e)))?;
        Ok(())
    }

    pub fn get_work_item(&self, id: &str) -> Result<Option<WorkItem>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {} FROM work_item WHERE id = ?1", WORK_ITEM_COLUMNS),
            params![id],
            map_row_to_work_item,
        )
        .optional()
        .map_err(|e| OrchestratorError::Store(format!("get work item: {}", e)))
    }

    /// Compare-and-transition: the sole mutator of `state`.
    ///
    /// Atomically updates the item, appends the transition row, appends the
    /// outbox event(s), and records a state-duration metric, or fails with
    /// `Conflict` leaving everything unchanged. The authoritative check is a
    /// single `UPDATE ... WHERE id = ? AND state = ? AND version = ?`.
    pub fn compare_and_transition(
        &self,
        req: &TransitionRequest,
        now: DateTime<Utc>,
    ) -> Result<WorkItem> {
        if !req.from.can_transition_to(req.to) {
            return Err(OrchestratorError::IllegalTransition {
                from: req.from,
                to: req.to,
            });
        }
        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .map_err(|e| OrchestratorError::Store(format!("begin transition tx: {}", e)))?;

        let Some(current) = tx
            .query_row(
                &format!("SELECT {} FROM work_item WHERE id = ?1", WORK_ITEM_COLUMNS),
                params![req.work_item_id],
                map_row_to_work_item,
            )
            .optional()
            .map_err(|e| OrchestratorError::Store(format!("read item for transition: {}", e)))?
        else {
            return Err(OrchestratorError::NotFound(req.work_item_id.clone()));
        };

        // Derived column values; the guarded UPDATE below remains the only
        // authority on whether they land.
        let new_stage = req.updates.stage.unwrap_or(current.stage);
        let new_attempts = current.attempt_count + u32::from(req.updates.increment_attempt);
        let new_quota_count =
            current.quota_exceeded_count + u32::from(req.updates.increment_quota_exceeded);
        let started_at = match (req.to, current.started_at) {
            (WorkItemState::Running, None) => Some(now),
            (_, existing) => existing,
        };
        let completed_at = if req.to.is_terminal() {
            Some(now)
        } else {
            current.completed_at
        };
        let next_attempt_at = match req.updates.next_attempt_at {
            Some(patch) => patch,
            None => current.next_attempt_at,
        };
        let last_error = match &req.updates.last_error {
            Some(patch) => patch.clone(),
            None => current.last_error.clone(),
        };
        let quota_service = match &req.updates.quota_service {
            Some(patch) => patch.clone(),
            None => current.quota_service.clone(),
        };
        let cancel_requested = current.cancel_requested && !req.updates.clear_cancel_requested;
        let mut partial_results = current.partial_results.clone();
        if let Some((key, summary)) = &req.updates.partial_result {
            partial_results.insert(key.clone(), summary.clone());
        }

        let updated = tx
            .execute(
                "UPDATE work_item
                 SET state = ?4, stage = ?5, version = version + 1,
                     started_at_ms = ?6, completed_at_ms = ?7, next_attempt_at_ms = ?8,
                     attempt_count = ?9, quota_exceeded_count = ?10, partial_results = ?11,
                     last_error = ?12, cancel_requested = ?13, quota_service = ?14
                 WHERE id = ?1 AND state = ?2 AND version = ?3",
                params![
                    req.work_item_id,
                    req.from.as_str(),
                    req.expected_version as i64,
                    req.to.as_str(),
                    new_stage.as_str(),
                    started_at.map(dt_to_ms),
                    completed_at.map(dt_to_ms),
                    next_attempt_at.map(dt_to_ms),
                    new_attempts as i64,
                    new_quota_count as i64,
                    serialize_partials(&partial_results),
                    last_error
                        .as_ref()
                        .map(|e| serde_json::to_string(e).unwrap_or_default()),
                    cancel_requested,
                    quota_service,
                ],
            )
            .map_err(|e| OrchestratorError::Store(format!("apply transition: {}", e)))?;
        if updated == 0 {
            return Err(OrchestratorError::Conflict(req.work_item_id.clone()));
        }

        let previous_change_ms: Option<i64> = tx
            .query_row(
                "SELECT MAX(at_ms) FROM transition WHERE work_item_id = ?1",
                params![req.work_item_id],
                |r| r.get(0),
            )
            .map_err(|e| OrchestratorError::Store(format!("read last transition time: {}", e)))?;
        let entered_at = previous_change_ms
            .map(ms_to_dt)
            .unwrap_or(current.enqueued_at);
        let dwell_ms = (now - entered_at).num_milliseconds().max(0);

        tx.execute(
            "INSERT INTO transition
             (work_item_id, from_state, to_state, stage, reason, metadata, actor, at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                req.work_item_id,
                req.from.as_str(),
                req.to.as_str(),
                req.updates.stage.map(|s| s.as_str()),
                req.reason,
                req.metadata.as_ref().map(|m| m.to_string()),
                req.actor,
                dt_to_ms(now)
            ],
        )
        .map_err(|e| OrchestratorError::Store(format!("insert transition: {}", e)))?;

        let state_changed = json!({
            "from": req.from.as_str(),
            "to": req.to.as_str(),
            "stage": new_stage.as_str(),
            "reason": req.reason,
            "actor": req.actor,
        });
        insert_event_tx(&tx, &req.work_item_id, EventType::StateChanged, &state_changed, now)?;
        for (event_type, payload) in &req.updates.extra_events {
            insert_event_tx(&tx, &req.work_item_id, *event_type, payload, now)?;
        }

        insert_metric_tx(
            &tx,
            Some(&req.work_item_id),
            MetricKind::StateDurationMs,
            req.from.as_str(),
            dwell_ms as f64,
            now,
        )?;
        if req.updates.increment_attempt {
            insert_metric_tx(
                &tx,
                Some(&req.work_item_id),
                MetricKind::RetryCount,
                "attempt",
                new_attempts as f64,
                now,
            )?;
        }
        if let Some(Some(error)) = &req.updates.last_error {
            insert_metric_tx(
                &tx,
                Some(&req.work_item_id),
                MetricKind::Error,
                error.class.as_str(),
                1.0,
                now,
            )?;
        }

        if req.to == WorkItemState::DeadLettered {
            let chain = req.updates.dead_letter_chain.clone().unwrap_or_else(|| {
                last_error
                    .as_ref()
                    .and_then(|e| serde_json::to_value(e).ok())
                    .unwrap_or(Value::Null)
            });
            tx.execute(
                "INSERT INTO dead_letter (work_item_id, error_chain, at_ms) VALUES (?1, ?2, ?3)",
                params![req.work_item_id, chain.to_string(), dt_to_ms(now)],
            )
            .map_err(|e| OrchestratorError::Store(format!("insert dead letter: {}", e)))?;
            insert_event_tx(
                &tx,
                &req.work_item_id,
                EventType::DeadLettered,
                &json!({ "reason": req.reason, "error_chain": chain }),
                now,
            )?;
        }

        let refreshed = tx
            .query_row(
                &format!("SELECT {} FROM work_item WHERE id = ?1", WORK_ITEM_COLUMNS),
                params![req.work_item_id],
                map_row_to_work_item,
            )
            .map_err(|e| OrchestratorError::Store(format!("reread item post-transition: {}", e)))?;

        tx.commit()
            .map_err(|e| OrchestratorError::Store(format!("commit transition: {}", e)))?;
        Ok(refreshed)
    }

    /// Acquire-lock-if-free: claims the item iff no lock is held or the held
    /// lease has expired. Lock state lives on the row; expiry is judged by
    /// the store, never by clock comparison in callers.
    pub fn acquire_lock(
        &self,
        id: &str,
        worker_id: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<WorkItem> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .map_err(|e| OrchestratorError::Store(format!("begin lock tx: {}", e)))?;
        let updated = tx
            .execute(
                "UPDATE work_item
                 SET lock_holder = ?2, lock_acquired_at_ms = ?3, lock_expires_at_ms = ?4
                 WHERE id = ?1
                   AND (lock_holder IS NULL OR lock_expires_at_ms < ?3)",
                params![id, worker_id, dt_to_ms(now), dt_to_ms(now + lease)],
            )
            .map_err(|e| OrchestratorError::Store(format!("acquire lock: {}", e)))?;
        if updated == 0 {
            let exists: Option<String> = tx
                .query_row(
                    "SELECT lock_holder FROM work_item WHERE id = ?1",
                    params![id],
                    |r| r.get(0),
                )
                .optional()
                .map_err(|e| OrchestratorError::Store(format!("probe lock holder: {}", e)))?
                .flatten();
            return match exists {
                Some(_) => Err(OrchestratorError::Conflict(format!("lock held: {}", id))),
                None => Err(OrchestratorError::NotFound(id.to_string())),
            };
        }
        insert_event_tx(
            &tx,
            id,
            EventType::Locked,
            &json!({ "worker": worker_id, "lease_expires_at": (now + lease).to_rfc3339() }),
            now,
        )?;
        let item = tx
            .query_row(
                &format!("SELECT {} FROM work_item WHERE id = ?1", WORK_ITEM_COLUMNS),
                params![id],
                map_row_to_work_item,
            )
            .map_err(|e| OrchestratorError::Store(format!("reread locked item: {}", e)))?;
        tx.commit()
            .map_err(|e| OrchestratorError::Store(format!("commit lock: {}", e)))?;
        Ok(item)
    }

    /// Release only if still the holder. Returns whether a lock was released.
    pub fn release_lock(&self, id: &str, worker_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .map_err(|e| OrchestratorError::Store(format!("begin unlock tx: {}", e)))?;
        let updated = tx
            .execute(
                "UPDATE work_item
                 SET lock_holder = NULL, lock_acquired_at_ms = NULL, lock_expires_at_ms = NULL
                 WHERE id = ?1 AND lock_holder = ?2",
                params![id, worker_id],
            )
            .map_err(|e| OrchestratorError::Store(format!("release lock: {}", e)))?;
        if updated > 0 {
            insert_event_tx(&tx, id, EventType::Unlocked, &json!({ "worker": worker_id }), now)?;
        }
        tx.commit()
            .map_err(|e| OrchestratorError::Store(format!("commit unlock: {}", e)))?;
        Ok(updated > 0)
    }

    /// Extend the lease while actively executing. `Conflict` means the lease
    /// was lost (expired and reclaimed); the worker must abandon the item.
    pub fn extend_lock(
        &self,
        id: &str,
        worker_id: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn()?;
        let updated = conn
            .execute(
                "UPDATE work_item
                 SET lock_expires_at_ms = ?3
                 WHERE id = ?1 AND lock_holder = ?2",
                params![id, worker_id, dt_to_ms(now + lease)],
            )
            .map_err(|e| OrchestratorError::Store(format!("extend lock: {}", e)))?;
        if updated == 0 {
            return Err(OrchestratorError::Conflict(format!("lease lost: {}", id)));
        }
        Ok(())
    }

    /// Record a cancellation request on a RUNNING item.
    pub fn set_cancel_requested(&self, id: &str) -> Result<WorkItem> {
        let conn = self.conn()?;
        let updated = conn
            .execute(
                "UPDATE work_item SET cancel_requested = 1 WHERE id = ?1",
                params![id],
            )
            .map_err(|e| OrchestratorError::Store(format!("set cancel requested: {}", e)))?;
        if updated == 0 {
            return Err(OrchestratorError::NotFound(id.to_string()));
        }
        conn.query_row(
            &format!("SELECT {} FROM work_item WHERE id = ?1", WORK_ITEM_COLUMNS),
            params![id],
            map_row_to_work_item,
        )
        .map_err(|e| OrchestratorError::Store(format!("reread after cancel request: {}", e)))
    }

    /// Claim candidates: READY items that are due and unlocked, plus RUNNING
    /// items whose lease has lapsed (reclaims). Priority first, oldest first.
    pub fn list_dispatchable(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DispatchCandidate>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, state, priority, enqueued_at_ms
                 FROM work_item
                 WHERE (state = 'ready'
                        AND (next_attempt_at_ms IS NULL OR next_attempt_at_ms <= ?1)
                        AND (lock_holder IS NULL OR lock_expires_at_ms < ?1))
                    OR (state = 'running'
                        AND lock_expires_at_ms IS NOT NULL
                        AND lock_expires_at_ms < ?1)
                 ORDER BY priority DESC, enqueued_at_ms ASC, id ASC
                 LIMIT ?2",
            )
            .map_err(|e| OrchestratorError::Store(format!("prepare dispatch query: {}", e)))?;
        let rows = stmt
            .query_map(params![dt_to_ms(now), limit as i64], |row| {
                Ok(DispatchCandidate {
                    work_item_id: row.get(0)?,
                    state: parse_state(&row.get::<_, String>(1)?),
                    priority: row.get(2)?,
                    enqueued_at: ms_to_dt(row.get::<_, i64>(3)?),
                })
            })
            .map_err(|e| OrchestratorError::Store(format!("query dispatchables: {}", e)))?;
        collect_rows(rows)
    }

    /// RETRY_SCHEDULED items whose retry instant has passed.
    pub fn due_retry_scheduled(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<(String, u64)>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, version FROM work_item
                 WHERE state = 'retry_scheduled'
                   AND next_attempt_at_ms IS NOT NULL AND next_attempt_at_ms <= ?1
                 ORDER BY priority DESC, next_attempt_at_ms ASC
                 LIMIT ?2",
            )
            .map_err(|e| OrchestratorError::Store(format!("prepare due retries: {}", e)))?;
        let rows = stmt
            .query_map(params![dt_to_ms(now), limit as i64], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
            })
            .map_err(|e| OrchestratorError::Store(format!("query due retries: {}", e)))?;
        collect_rows(rows)
    }

    /// QUOTA_EXCEEDED items due for a resume check, with their service.
    pub fn due_quota_paused(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<(String, u64, Option<String>)>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, version, quota_service FROM work_item
                 WHERE state = 'quota_exceeded'
                   AND next_attempt_at_ms IS NOT NULL AND next_attempt_at_ms <= ?1
                 ORDER BY priority DESC, next_attempt_at_ms ASC
                 LIMIT ?2",
            )
            .map_err(|e| OrchestratorError::Store(format!("prepare due quota items: {}", e)))?;
        let rows = stmt
            .query_map(params![dt_to_ms(now), limit as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)? as u64,
                    row.get::<_, Option<String>>(2)?,
                ))
            })
            .map_err(|e| OrchestratorError::Store(format!("query due quota items: {}", e)))?;
        collect_rows(rows)
    }

    /// Standalone outbox insert, for events not tied to a state change
    /// (stage lifecycle, quota signals).
    pub fn insert_event(
        &self,
        work_item_id: &str,
        event_type: EventType,
        payload: &Value,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO event (work_item_id, event_type, payload, at_ms, delivered)
             VALUES (?1, ?2, ?3, ?4, 0)",
            params![work_item_id, event_type.as_str(), payload.to_string(), dt_to_ms(now)],
        )
        .map_err(|e| OrchestratorError::Store(format!("insert event: {}", e)))?;
        Ok(())
    }

    /// Undelivered outbox rows in insertion order (per-item write order).
    pub fn undelivered_events(&self, limit: usize) -> Result<Vec<EventRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT event_id, work_item_id, event_type, payload, at_ms, delivered
                 FROM event WHERE delivered = 0
                 ORDER BY event_id ASC
                 LIMIT ?1",
            )
            .map_err(|e| OrchestratorError::Store(format!("prepare undelivered events: {}", e)))?;
        let rows = stmt
            .query_map(params![limit as i64], map_row_to_event)
            .map_err(|e| OrchestratorError::Store(format!("query undelivered events: {}", e)))?;
        collect_rows(rows)
    }

    pub fn mark_event_delivered(&self, event_id: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE event SET delivered = 1 WHERE event_id = ?1",
            params![event_id],
        )
        .map_err(|e| OrchestratorError::Store(format!("mark event delivered: {}", e)))?;
        Ok(())
    }

    pub fn record_metric(
        &self,
        work_item_id: Option<&str>,
        kind: MetricKind,
        name: &str,
        value: f64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO metric (work_item_id, kind, name, value, at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![work_item_id, kind.as_str(), name, value, dt_to_ms(now)],
        )
        .map_err(|e| OrchestratorError::Store(format!("record metric: {}", e)))?;
        Ok(())
    }

    /// Full transition history of an item, oldest first.
    pub fn history(&self, work_item_id: &str) -> Result<Vec<TransitionRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT transition_id, work_item_id, from_state, to_state, stage, reason,
                        metadata, actor, at_ms
                 FROM transition WHERE work_item_id = ?1
                 ORDER BY at_ms ASC, transition_id ASC",
            )
            .map_err(|e| OrchestratorError::Store(format!("prepare history: {}", e)))?;
        let rows = stmt
            .query_map(params![work_item_id], map_row_to_transition)
            .map_err(|e| OrchestratorError::Store(format!("query history: {}", e)))?;
        collect_rows(rows)
    }

    pub fn list_items(&self, filter: &ListFilter, now: DateTime<Utc>) -> Result<Vec<WorkItem>> {
        let conn = self.conn()?;
        let enqueued_floor = filter
            .max_age
            .map(|age| dt_to_ms(now - age));
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM work_item
                 WHERE (?1 IS NULL OR state = ?1)
                   AND (?2 IS NULL OR stage = ?2)
                   AND (?3 IS NULL OR priority >= ?3)
                   AND (?4 IS NULL OR enqueued_at_ms >= ?4)
                 ORDER BY priority DESC, enqueued_at_ms ASC
                 LIMIT ?5",
                WORK_ITEM_COLUMNS
            ))
            .map_err(|e| OrchestratorError::Store(format!("prepare list items: {}", e)))?;
        let rows = stmt
            .query_map(
                params![
                    filter.state.map(|s| s.as_str()),
                    filter.stage.map(|s| s.as_str()),
                    filter.min_priority,
                    enqueued_floor,
                    filter.limit.unwrap_or(100) as i64
                ],
                map_row_to_work_item,
            )
            .map_err(|e| OrchestratorError::Store(format!("query list items: {}", e)))?;
        collect_rows(rows)
    }

    pub fn quota_counters(&self, service: &str) -> Result<Vec<QuotaCounter>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT service, window, limit_value, used, window_start_ms
                 FROM quota_counter WHERE service = ?1",
            )
            .map_err(|e| OrchestratorError::Store(format!("prepare quota counters: {}", e)))?;
        let rows = stmt
            .query_map(params![service], map_row_to_quota_counter)
            .map_err(|e| OrchestratorError::Store(format!("query quota counters: {}", e)))?;
        collect_rows(rows)
    }

    pub fn quota_counter(&self, service: &str, window: QuotaWindow) -> Result<Option<QuotaCounter>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT service, window, limit_value, used, window_start_ms
             FROM quota_counter WHERE service = ?1 AND window = ?2",
            params![service, window.as_str()],
            map_row_to_quota_counter,
        )
        .optional()
        .map_err(|e| OrchestratorError::Store(format!("get quota counter: {}", e)))
    }

    /// Increment all four windows for a service, tumbling any that expired.
    /// Rows keep a pre-existing limit if present (persisted limits win over
    /// configured ones); absent rows are created from `limits`.
    pub fn add_quota_usage(
        &self,
        service: &str,
        limits: &QuotaLimits,
        tokens: u64,
        requests: u64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .map_err(|e| OrchestratorError::Store(format!("begin quota tx: {}", e)))?;
        for window in QuotaWindow::ALL {
            let increment = if window.counts_tokens() { tokens } else { requests };
            let default_limit = limit_for_window(limits, window);
            let window_start = window.window_start(now);
            let existing: Option<(u64, i64)> = tx
                .query_row(
                    "SELECT used, window_start_ms FROM quota_counter
                     WHERE service = ?1 AND window = ?2",
                    params![service, window.as_str()],
                    |r| Ok((r.get::<_, i64>(0)? as u64, r.get(1)?)),
                )
                .optional()
                .map_err(|e| OrchestratorError::Store(format!("read quota counter: {}", e)))?;
            match existing {
                None => {
                    tx.execute(
                        "INSERT INTO quota_counter (service, window, limit_value, used, window_start_ms)
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                        params![
                            service,
                            window.as_str(),
                            default_limit as i64,
                            increment as i64,
                            dt_to_ms(window_start)
                        ],
                    )
                    .map_err(|e| OrchestratorError::Store(format!("insert quota counter: {}", e)))?;
                }
                Some((used, start_ms)) => {
                    let tumbled = ms_to_dt(start_ms) + window.length() <= now;
                    let new_used = if tumbled { increment } else { used + increment };
                    let new_start = if tumbled { window_start } else { ms_to_dt(start_ms) };
                    tx.execute(
                        "UPDATE quota_counter SET used = ?3, window_start_ms = ?4
                         WHERE service = ?1 AND window = ?2",
                        params![
                            service,
                            window.as_str(),
                            new_used as i64,
                            dt_to_ms(new_start)
                        ],
                    )
                    .map_err(|e| OrchestratorError::Store(format!("update quota counter: {}", e)))?;
                }
            }
        }
        tx.commit()
            .map_err(|e| OrchestratorError::Store(format!("commit quota tx: {}", e)))?;
        Ok(())
    }

    pub fn append_quota_usage_log(
        &self,
        service: &str,
        work_item_id: Option<&str>,
        usage: &QuotaUsage,
        cost: f64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO quota_usage_log
             (service, work_item_id, input_tokens, output_tokens, image_count, cost, at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                service,
                work_item_id,
                usage.input_tokens as i64,
                usage.output_tokens as i64,
                usage.image_count as i64,
                cost,
                dt_to_ms(now)
            ],
        )
        .map_err(|e| OrchestratorError::Store(format!("append quota usage log: {}", e)))?;
        Ok(())
    }

    pub fn quota_usage_log(&self, service: &str, limit: usize) -> Result<Vec<QuotaUsageLogRow>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT usage_id, service, work_item_id, input_tokens, output_tokens,
                        image_count, cost, at_ms
                 FROM quota_usage_log WHERE service = ?1
                 ORDER BY at_ms DESC, usage_id DESC
                 LIMIT ?2",
            )
            .map_err(|e| OrchestratorError::Store(format!("prepare quota usage log: {}", e)))?;
        let rows = stmt
            .query_map(params![service, limit as i64], |row| {
                Ok(QuotaUsageLogRow {
                    id: row.get(0)?,
                    service: row.get(1)?,
                    work_item_id: row.get(2)?,
                    input_tokens: row.get::<_, i64>(3)? as u64,
                    output_tokens: row.get::<_, i64>(4)? as u64,
                    image_count: row.get::<_, i64>(5)? as u32,
                    cost: row.get(6)?,
                    at: ms_to_dt(row.get::<_, i64>(7)?),
                })
            })
            .map_err(|e| OrchestratorError::Store(format!("query quota usage log: {}", e)))?;
        collect_rows(rows)
    }

    /// Cumulative USD cost recorded for a service.
    pub fn quota_cost_total(&self, service: &str) -> Result<f64> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT COALESCE(SUM(cost), 0) FROM quota_usage_log WHERE service = ?1",
            params![service],
            |r| r.get(0),
        )
        .map_err(|e| OrchestratorError::Store(format!("sum quota cost: {}", e)))
    }

    pub fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterRow>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT dead_letter_id, work_item_id, error_chain, at_ms
                 FROM dead_letter ORDER BY at_ms DESC, dead_letter_id DESC LIMIT ?1",
            )
            .map_err(|e| OrchestratorError::Store(format!("prepare dead letters: {}", e)))?;
        let rows = stmt
            .query_map(params![limit as i64], map_row_to_dead_letter)
            .map_err(|e| OrchestratorError::Store(format!("query dead letters: {}", e)))?;
        collect_rows(rows)
    }

    pub fn dead_letter_for(&self, work_item_id: &str) -> Result<Option<DeadLetterRow>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT dead_letter_id, work_item_id, error_chain, at_ms
             FROM dead_letter WHERE work_item_id = ?1
             ORDER BY dead_letter_id DESC LIMIT 1",
            params![work_item_id],
            map_row_to_dead_letter,
        )
        .optional()
        .map_err(|e| OrchestratorError::Store(format!("get dead letter: {}", e)))
    }

    pub fn state_counts(&self) -> Result<Vec<(WorkItemState, u64)>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT state, COUNT(*) FROM work_item GROUP BY state")
            .map_err(|e| OrchestratorError::Store(format!("prepare state counts: {}", e)))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    parse_state(&row.get::<_, String>(0)?),
                    row.get::<_, i64>(1)? as u64,
                ))
            })
            .map_err(|e| OrchestratorError::Store(format!("query state counts: {}", e)))?;
        collect_rows(rows)
    }

    pub fn count_transitions_to(
        &self,
        to: WorkItemState,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<u64> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT COUNT(*) FROM transition
             WHERE to_state = ?1 AND at_ms >= ?2 AND at_ms <= ?3",
            params![to.as_str(), dt_to_ms(since), dt_to_ms(until)],
            |r| r.get::<_, i64>(0),
        )
        .map(|n| n as u64)
        .map_err(|e| OrchestratorError::Store(format!("count transitions: {}", e)))
    }

    pub fn metric_values(
        &self,
        kind: MetricKind,
        name: Option<&str>,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<f64>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT value FROM metric
                 WHERE kind = ?1 AND (?2 IS NULL OR name = ?2)
                   AND at_ms >= ?3 AND at_ms <= ?4
                 ORDER BY value ASC",
            )
            .map_err(|e| OrchestratorError::Store(format!("prepare metric values: {}", e)))?;
        let rows = stmt
            .query_map(
                params![kind.as_str(), name, dt_to_ms(since), dt_to_ms(until)],
                |row| row.get::<_, f64>(0),
            )
            .map_err(|e| OrchestratorError::Store(format!("query metric values: {}", e)))?;
        collect_rows(rows)
    }

    pub fn metric_count_by_name(
        &self,
        kind: MetricKind,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<(String, u64)>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT name, COUNT(*) FROM metric
                 WHERE kind = ?1 AND at_ms >= ?2 AND at_ms <= ?3
                 GROUP BY name ORDER BY COUNT(*) DESC",
            )
            .map_err(|e| OrchestratorError::Store(format!("prepare metric counts: {}", e)))?;
        let rows = stmt
            .query_map(
                params![kind.as_str(), dt_to_ms(since), dt_to_ms(until)],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64)),
            )
            .map_err(|e| OrchestratorError::Store(format!("query metric counts: {}", e)))?;
        collect_rows(rows)
    }
}

fn insert_event_tx(
    tx: &rusqlite::Transaction<'_>,
    work_item_id: &str,
    event_type: EventType,
    payload: &Value,
    now: DateTime<Utc>,
) -> Result<()> {
    tx.execute(
        "INSERT INTO event (work_item_id, event_type, payload, at_ms, delivered)
         VALUES (?1, ?2, ?3, ?4, 0)",
        params![work_item_id, event_type.as_str(), payload.to_string(), dt_to_ms(now)],
    )
    .map_err(|e| OrchestratorError::Store(format!("insert outbox event: {}", e)))?;
    Ok(())
}

fn insert_metric_tx(
    tx: &rusqlite::Transaction<'_>,
    work_item_id: Option<&str>,
    kind: MetricKind,
    name: &str,
    value: f64,
    now: DateTime<Utc>,
) -> Result<()> {
    tx.execute(
        "INSERT INTO metric (work_item_id, kind, name, value, at_ms)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![work_item_id, kind.as_str(), name, value, dt_to_ms(now)],
    )
    .map_err(|e| OrchestratorError::Store(format!("insert metric: {}", e)))?;
    Ok(())
}

fn collect_rows<T>(
    rows: impl Iterator<Item = rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut out = Vec::new();
    for row in rows {
        out.push(row.map_err(|e| OrchestratorError::Store(format!("row scan: {}", e)))?);
    }
    Ok(out)
}

fn map_row_to_work_item(row: &rusqlite::Row<'_>) -> rusqlite::Result<WorkItem> {
    let partials: String = row.get(15)?;
    let last_error: Option<String> = row.get(16)?;
    Ok(WorkItem {
        id: row.get(0)?,
        state: parse_state(&row.get::<_, String>(1)?),
        stage: parse_stage(&row.get::<_, String>(2)?),
        priority: row.get(3)?,
        version: row.get::<_, i64>(4)? as u64,
        enqueued_at: ms_to_dt(row.get::<_, i64>(5)?),
        started_at: row.get::<_, Option<i64>>(6)?.map(ms_to_dt),
        completed_at: row.get::<_, Option<i64>>(7)?.map(ms_to_dt),
        next_attempt_at: row.get::<_, Option<i64>>(8)?.map(ms_to_dt),
        lock_holder: row.get(9)?,
        lock_acquired_at: row.get::<_, Option<i64>>(10)?.map(ms_to_dt),
        lock_expires_at: row.get::<_, Option<i64>>(11)?.map(ms_to_dt),
        attempt_count: row.get::<_, i64>(12)? as u32,
        quota_exceeded_count: row.get::<_, i64>(13)? as u32,
        payload: serde_json::from_str(&row.get::<_, String>(14)?).unwrap_or(Value::Null),
        partial_results: serde_json::from_str::<BTreeMap<String, Value>>(&partials)
            .unwrap_or_default(),
        last_error: last_error.and_then(|raw| serde_json::from_str(&raw).ok()),
        cancel_requested: row.get::<_, i64>(17)? != 0,
        quota_service: row.get(18)?,
    })
}

fn map_row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<EventRecord> {
    Ok(EventRecord {
        id: row.get(0)?,
        work_item_id: row.get(1)?,
        event_type: EventType::parse(&row.get::<_, String>(2)?)
            .unwrap_or(EventType::StateChanged),
        payload: serde_json::from_str(&row.get::<_, String>(3)?).unwrap_or(Value::Null),
        at: ms_to_dt(row.get::<_, i64>(4)?),
        delivered: row.get::<_, i64>(5)? != 0,
    })
}

fn map_row_to_transition(row: &rusqlite::Row<'_>) -> rusqlite::Result<TransitionRecord> {
    let metadata: Option<String> = row.get(6)?;
    Ok(TransitionRecord {
        id: row.get(0)?,
        work_item_id: row.get(1)?,
        from_state: parse_state(&row.get::<_, String>(2)?),
        to_state: parse_state(&row.get::<_, String>(3)?),
        stage: row
            .get::<_, Option<String>>(4)?
            .and_then(|s| PipelineStage::parse(&s)),
        reason: row.get(5)?,
        metadata: metadata.and_then(|raw| serde_json::from_str(&raw).ok()),
        actor: row.get(7)?,
        at: ms_to_dt(row.get::<_, i64>(8)?),
    })
}

fn map_row_to_quota_counter(row: &rusqlite::Row<'_>) -> rusqlite::Result<QuotaCounter> {
    Ok(QuotaCounter {
        service: row.get(0)?,
        window: QuotaWindow::parse(&row.get::<_, String>(1)?)
            .unwrap_or(QuotaWindow::RequestsPerMinute),
        limit: row.get::<_, i64>(2)? as u64,
        used: row.get::<_, i64>(3)? as u64,
        window_start: ms_to_dt(row.get::<_, i64>(4)?),
    })
}

fn map_row_to_dead_letter(row: &rusqlite::Row<'_>) -> rusqlite::Result<DeadLetterRow> {
    Ok(DeadLetterRow {
        id: row.get(0)?,
        work_item_id: row.get(1)?,
        error_chain: serde_json::from_str(&row.get::<_, String>(2)?).unwrap_or(Value::Null),
        at: ms_to_dt(row.get::<_, i64>(3)?),
    })
}

pub(crate) fn limit_for_window(limits: &QuotaLimits, window: QuotaWindow) -> u64 {
    match window {
        QuotaWindow::TokensPerMinute => limits.tokens_per_minute,
        QuotaWindow::TokensPerDay => limits.tokens_per_day,
        QuotaWindow::RequestsPerMinute => limits.requests_per_minute,
        QuotaWindow::RequestsPerDay => limits.requests_per_day,
    }
}

fn serialize_partials(partials: &BTreeMap<String, Value>) -> String {
    serde_json::to_string(partials).unwrap_or_else(|_| "{}".to_string())
}

fn parse_state(value: &str) -> WorkItemState {
    WorkItemState::parse(value).unwrap_or(WorkItemState::Created)
}

fn parse_stage(value: &str) -> PipelineStage {
    PipelineStage::parse(value).unwrap_or(PipelineStage::Discovery)
}

pub(crate) fn dt_to_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

pub(crate) fn ms_to_dt(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

fn ensure_migration_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_migration (
          version INTEGER PRIMARY KEY,
          name TEXT NOT NULL,
          applied_at_ms INTEGER NOT NULL
        );
        "#,
    )
    .map_err(|e| OrchestratorError::Store(format!("init migration table: {}", e)))?;
    Ok(())
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migration",
        [],
        |r| r.get(0),
    )
    .map_err(|e| OrchestratorError::Store(format!("read schema version: {}", e)))
}

fn record_migration(conn: &Connection, version: i64, name: &str) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO schema_migration (version, name, applied_at_ms) VALUES (?1, ?2, ?3)",
        params![version, name, dt_to_ms(Utc::now())],
    )
    .map_err(|e| OrchestratorError::Store(format!("record migration: {}", e)))?;
    Ok(())
}

fn apply_migration_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS work_item (
          id TEXT PRIMARY KEY,
          state TEXT NOT NULL,
          stage TEXT NOT NULL,
          priority INTEGER NOT NULL DEFAULT 0,
          version INTEGER NOT NULL DEFAULT 0,
          enqueued_at_ms INTEGER NOT NULL,
          started_at_ms INTEGER NULL,
          completed_at_ms INTEGER NULL,
          next_attempt_at_ms INTEGER NULL,
          lock_holder TEXT NULL,
          lock_acquired_at_ms INTEGER NULL,
          lock_expires_at_ms INTEGER NULL,
          attempt_count INTEGER NOT NULL DEFAULT 0,
          quota_exceeded_count INTEGER NOT NULL DEFAULT 0,
          payload TEXT NOT NULL,
          partial_results TEXT NOT NULL DEFAULT '{}',
          last_error TEXT NULL
        );
        CREATE TABLE IF NOT EXISTS transition (
          transition_id INTEGER PRIMARY KEY AUTOINCREMENT,
          work_item_id TEXT NOT NULL,
          from_state TEXT NOT NULL,
          to_state TEXT NOT NULL,
          stage TEXT NULL,
          reason TEXT NOT NULL,
          metadata TEXT NULL,
          actor TEXT NOT NULL,
          at_ms INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS event (
          event_id INTEGER PRIMARY KEY AUTOINCREMENT,
          work_item_id TEXT NOT NULL,
          event_type TEXT NOT NULL,
          payload TEXT NOT NULL,
          at_ms INTEGER NOT NULL,
          delivered INTEGER NOT NULL DEFAULT 0
        );
        CREATE TABLE IF NOT EXISTS metric (
          metric_id INTEGER PRIMARY KEY AUTOINCREMENT,
          work_item_id TEXT NULL,
          kind TEXT NOT NULL,
          name TEXT NOT NULL,
          value REAL NOT NULL,
          at_ms INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS quota_counter (
          service TEXT NOT NULL,
          window TEXT NOT NULL,
          limit_value INTEGER NOT NULL,
          used INTEGER NOT NULL DEFAULT 0,
          window_start_ms INTEGER NOT NULL,
          PRIMARY KEY (service, window)
        );
        CREATE TABLE IF NOT EXISTS quota_usage_log (
          usage_id INTEGER PRIMARY KEY AUTOINCREMENT,
          service TEXT NOT NULL,
          work_item_id TEXT NULL,
          input_tokens INTEGER NOT NULL DEFAULT 0,
          output_tokens INTEGER NOT NULL DEFAULT 0,
          image_count INTEGER NOT NULL DEFAULT 0,
          cost REAL NOT NULL DEFAULT 0,
          at_ms INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS dead_letter (
          dead_letter_id INTEGER PRIMARY KEY AUTOINCREMENT,
          work_item_id TEXT NOT NULL,
          error_chain TEXT NOT NULL,
          at_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_work_item_dispatch
          ON work_item(state, priority DESC, next_attempt_at_ms);
        CREATE INDEX IF NOT EXISTS idx_work_item_lock_expiry
          ON work_item(lock_expires_at_ms);
        CREATE INDEX IF NOT EXISTS idx_transition_item_at
          ON transition(work_item_id, at_ms);
        CREATE INDEX IF NOT EXISTS idx_event_undelivered
          ON event(event_id) WHERE delivered = 0;
        CREATE INDEX IF NOT EXISTS idx_metric_kind_at
          ON metric(kind, at_ms);
        CREATE INDEX IF NOT EXISTS idx_quota_usage_log_service
          ON quota_usage_log(service, at_ms DESC);
        CREATE INDEX IF NOT EXISTS idx_dead_letter_item
          ON dead_letter(work_item_id);
        "#,
    )
    .map_err(|e| OrchestratorError::Store(format!("apply migration v1: {}", e)))?;
    Ok(())
}

fn apply_migration_v2(conn: &Connection) -> Result<()> {
    add_column_if_missing(conn, "work_item", "cancel_requested", "INTEGER NOT NULL DEFAULT 0")?;
    add_column_if_missing(conn, "work_item", "quota_service", "TEXT NULL")?;
    Ok(())
}

fn add_column_if_missing(
    conn: &Connection,
    table: &str,
    column: &str,
    column_def: &str,
) -> Result<()> {
    let pragma = format!("PRAGMA table_info({})", table);
    let mut stmt = conn
        .prepare(&pragma)
        .map_err(|e| OrchestratorError::Store(format!("prepare table_info {}: {}", table, e)))?;
    let cols = stmt
        .query_map([], |row| row.get::<_, String>(1))
        .map_err(|e| OrchestratorError::Store(format!("query table_info {}: {}", table, e)))?;
    for col in cols {
        let name = col.map_err(|e| OrchestratorError::Store(format!("scan table_info: {}", e)))?;
        if name == column {
            return Ok(());
        }
    }
    let alter = format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, column_def);
    conn.execute(&alter, [])
        .map_err(|e| OrchestratorError::Store(format!("alter {} add {}: {}", table, column, e)))?;
    Ok(())
}
