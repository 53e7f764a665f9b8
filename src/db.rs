//! SQLite database with Diesel ORM
//!
//! Stores the task tree, the append-only time event log, and rest
//! suggestions. The event log is the authoritative history; the `tasks`
//! table is a derived mirror updated in the same transaction as each
//! appended event.

use crate::advisor;
use crate::replay::{self, LogEvent};
use crate::schema::*;
use chrono::{Local, TimeZone, Utc};
use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool, PooledConnection};
use diesel::sqlite::SqliteConnection;
use serde_json::json;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use uuid::Uuid;

const MAX_TITLE_LEN: usize = 500;
const MAX_TAG_LEN: usize = 100;

// ============================================================================
// Domain Enums
// ============================================================================

/// Task lifecycle state, mirrored from the event log
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum TaskStatus {
    Idle,
    Running,
    Paused,
    Stopped,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Idle => "idle",
            TaskStatus::Running => "running",
            TaskStatus::Paused => "paused",
            TaskStatus::Stopped => "stopped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(TaskStatus::Idle),
            "running" => Some(TaskStatus::Running),
            "paused" => Some(TaskStatus::Paused),
            "stopped" => Some(TaskStatus::Stopped),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Kind of a time event
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum EventKind {
    Start,
    Pause,
    Resume,
    Stop,
    Rename,
    Reparent,
    TagAdd,
    TagRemove,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Start => "start",
            EventKind::Pause => "pause",
            EventKind::Resume => "resume",
            EventKind::Stop => "stop",
            EventKind::Rename => "rename",
            EventKind::Reparent => "reparent",
            EventKind::TagAdd => "tag_add",
            EventKind::TagRemove => "tag_remove",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "start" => Some(EventKind::Start),
            "pause" => Some(EventKind::Pause),
            "resume" => Some(EventKind::Resume),
            "stop" => Some(EventKind::Stop),
            "rename" => Some(EventKind::Rename),
            "reparent" => Some(EventKind::Reparent),
            "tag_add" => Some(EventKind::TagAdd),
            "tag_remove" => Some(EventKind::TagRemove),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What caused a rest suggestion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerType {
    SubtaskEnd,
    TaskSwitch,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::SubtaskEnd => "subtask_end",
            TriggerType::TaskSwitch => "task_switch",
        }
    }
}

/// Response state of a rest suggestion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuggestionStatus {
    Pending,
    Accepted,
    Ignored,
}

impl SuggestionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SuggestionStatus::Pending => "pending",
            SuggestionStatus::Accepted => "accepted",
            SuggestionStatus::Ignored => "ignored",
        }
    }
}

/// Query window for `get_overview`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverviewRange {
    All,
    Day,
    Week,
    Today,
}

impl OverviewRange {
    pub fn as_str(&self) -> &'static str {
        match self {
            OverviewRange::All => "all",
            OverviewRange::Day => "day",
            OverviewRange::Week => "week",
            OverviewRange::Today => "today",
        }
    }

    fn window_start(&self, now: i64) -> Option<i64> {
        match self {
            OverviewRange::All => None,
            OverviewRange::Day => Some(now - 86_400),
            OverviewRange::Week => Some(now - 7 * 86_400),
            OverviewRange::Today => Some(local_day_start(now)),
        }
    }
}

impl std::str::FromStr for OverviewRange {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "all" => Ok(OverviewRange::All),
            "day" => Ok(OverviewRange::Day),
            "week" => Ok(OverviewRange::Week),
            "today" => Ok(OverviewRange::Today),
            other => Err(EngineError::InvalidInput(format!(
                "unsupported range '{other}', expected one of: all, day, week, today"
            ))),
        }
    }
}

impl std::fmt::Display for OverviewRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Error type for engine operations, one variant per stable error kind
#[derive(Debug)]
pub enum EngineError {
    InvalidInput(String),
    NotFound(String),
    Archived(String),
    InvalidState(String),
    CycleDetected(String),
    Conflict(String),
    Storage(String),
    Internal(String),
}

impl EngineError {
    /// Stable machine-readable kind, for hosts that switch on errors
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::InvalidInput(_) => "invalid_input",
            EngineError::NotFound(_) => "not_found",
            EngineError::Archived(_) => "archived",
            EngineError::InvalidState(_) => "invalid_state",
            EngineError::CycleDetected(_) => "cycle_detected",
            EngineError::Conflict(_) => "conflict",
            EngineError::Storage(_) => "storage",
            EngineError::Internal(_) => "internal",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            EngineError::NotFound(msg) => write!(f, "not found: {msg}"),
            EngineError::Archived(msg) => write!(f, "archived: {msg}"),
            EngineError::InvalidState(msg) => write!(f, "invalid state: {msg}"),
            EngineError::CycleDetected(msg) => write!(f, "cycle detected: {msg}"),
            EngineError::Conflict(msg) => write!(f, "conflict: {msg}"),
            EngineError::Storage(msg) => write!(f, "storage error: {msg}"),
            EngineError::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<diesel::result::Error> for EngineError {
    fn from(e: diesel::result::Error) -> Self {
        EngineError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Internal(format!("payload serialization: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

// ============================================================================
// Schema Migrations
// ============================================================================

/// One forward-only schema migration
#[derive(Debug, Clone)]
pub struct Migration {
    pub version: i64,
    pub name: &'static str,
    sql: &'static str,
}

/// Schema version this binary writes
pub const CURRENT_SCHEMA_VERSION: i64 = 2;

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "timing-core",
        sql: r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                parent_id TEXT REFERENCES tasks(id),
                title TEXT NOT NULL CHECK (length(trim(title)) > 0),
                status TEXT NOT NULL CHECK (status IN ('idle', 'running', 'paused', 'stopped')),
                created_at BIGINT NOT NULL,
                archived_at BIGINT
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_parent_id ON tasks(parent_id);

            CREATE TABLE IF NOT EXISTS tags (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                created_at BIGINT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS task_tags (
                task_id TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                tag_id TEXT NOT NULL REFERENCES tags(id) ON DELETE CASCADE,
                created_at BIGINT NOT NULL,
                PRIMARY KEY (task_id, tag_id)
            );
            CREATE INDEX IF NOT EXISTS idx_task_tags_tag_id ON task_tags(tag_id);

            CREATE TABLE IF NOT EXISTS time_events (
                sequence INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id TEXT NOT NULL REFERENCES tasks(id),
                kind TEXT NOT NULL CHECK (kind IN (
                    'start', 'pause', 'resume', 'stop',
                    'rename', 'reparent', 'tag_add', 'tag_remove'
                )),
                at BIGINT NOT NULL,
                payload TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_time_events_task_sequence
                ON time_events(task_id, sequence);
            CREATE INDEX IF NOT EXISTS idx_time_events_at ON time_events(at);
        "#,
    },
    Migration {
        version: 2,
        name: "rest-suggestions",
        sql: r#"
            CREATE TABLE IF NOT EXISTS rest_suggestions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                trigger_type TEXT NOT NULL CHECK (trigger_type IN ('subtask_end', 'task_switch')),
                task_id TEXT REFERENCES tasks(id),
                focus_seconds BIGINT NOT NULL,
                switch_count_30m BIGINT NOT NULL,
                deviation_ratio DOUBLE NOT NULL,
                suggested_minutes BIGINT NOT NULL CHECK (suggested_minutes IN (0, 3, 8, 15)),
                reasons TEXT NOT NULL,
                status TEXT NOT NULL CHECK (status IN ('pending', 'accepted', 'ignored')),
                created_at BIGINT NOT NULL,
                responded_at BIGINT
            );
            CREATE INDEX IF NOT EXISTS idx_rest_suggestions_status
                ON rest_suggestions(status, created_at DESC, id DESC);
        "#,
    },
];

// ============================================================================
// Diesel Models
// ============================================================================

/// Insertable task
#[derive(Insertable)]
#[diesel(table_name = tasks)]
pub struct NewTask<'a> {
    pub id: &'a str,
    pub parent_id: Option<&'a str>,
    pub title: &'a str,
    pub status: &'a str,
    pub created_at: i64,
}

/// Queryable task row
#[derive(Queryable, Selectable, Debug, Clone, serde::Serialize)]
#[diesel(table_name = tasks)]
pub struct Task {
    pub id: String,
    pub parent_id: Option<String>,
    pub title: String,
    pub status: String,
    pub created_at: i64,
    pub archived_at: Option<i64>,
}

/// Insertable tag
#[derive(Insertable)]
#[diesel(table_name = tags)]
pub struct NewTag<'a> {
    pub id: &'a str,
    pub name: &'a str,
    pub created_at: i64,
}

/// Queryable tag row
#[derive(Queryable, QueryableByName, Selectable, Debug, Clone, serde::Serialize)]
#[diesel(table_name = tags)]
pub struct Tag {
    pub id: String,
    pub name: String,
    pub created_at: i64,
}

/// Insertable task/tag association
#[derive(Insertable)]
#[diesel(table_name = task_tags)]
pub struct NewTaskTag<'a> {
    pub task_id: &'a str,
    pub tag_id: &'a str,
    pub created_at: i64,
}

/// Insertable time event
#[derive(Insertable)]
#[diesel(table_name = time_events)]
pub struct NewTimeEvent<'a> {
    pub task_id: &'a str,
    pub kind: &'a str,
    pub at: i64,
    pub payload: Option<&'a str>,
}

/// Queryable time event row
#[derive(Queryable, Selectable, Debug, Clone, serde::Serialize)]
#[diesel(table_name = time_events)]
pub struct TimeEvent {
    pub sequence: i64,
    pub task_id: String,
    pub kind: String,
    pub at: i64,
    pub payload: Option<String>,
}

/// Insertable rest suggestion
#[derive(Insertable)]
#[diesel(table_name = rest_suggestions)]
pub struct NewRestSuggestion<'a> {
    pub trigger_type: &'a str,
    pub task_id: Option<&'a str>,
    pub focus_seconds: i64,
    pub switch_count_30m: i64,
    pub deviation_ratio: f64,
    pub suggested_minutes: i64,
    pub reasons: &'a str,
    pub status: &'a str,
    pub created_at: i64,
}

/// Queryable rest suggestion row
#[derive(Queryable, Selectable, Debug, Clone)]
#[diesel(table_name = rest_suggestions)]
pub struct RestSuggestion {
    pub id: i64,
    pub trigger_type: String,
    pub task_id: Option<String>,
    pub focus_seconds: i64,
    pub switch_count_30m: i64,
    pub deviation_ratio: f64,
    pub suggested_minutes: i64,
    pub reasons: String,
    pub status: String,
    pub created_at: i64,
    pub responded_at: Option<i64>,
}

impl RestSuggestion {
    /// Outward-facing form with the reason list decoded
    pub fn view(&self) -> RestSuggestionView {
        RestSuggestionView {
            id: self.id,
            trigger_type: self.trigger_type.clone(),
            task_id: self.task_id.clone(),
            focus_seconds: self.focus_seconds,
            switch_count_30m: self.switch_count_30m,
            deviation_ratio: self.deviation_ratio,
            suggested_minutes: self.suggested_minutes,
            reasons: serde_json::from_str(&self.reasons).unwrap_or_default(),
            status: self.status.clone(),
            created_at: self.created_at,
        }
    }
}

/// Rest suggestion as exposed in snapshots
#[derive(Debug, Clone, serde::Serialize)]
pub struct RestSuggestionView {
    pub id: i64,
    pub trigger_type: String,
    pub task_id: Option<String>,
    pub focus_seconds: i64,
    pub switch_count_30m: i64,
    pub deviation_ratio: f64,
    pub suggested_minutes: i64,
    pub reasons: Vec<String>,
    pub status: String,
    pub created_at: i64,
}

/// One task in an overview snapshot
#[derive(Debug, Clone, serde::Serialize)]
pub struct TaskOverview {
    pub id: String,
    pub parent_id: Option<String>,
    pub title: String,
    pub status: String,
    pub created_at: i64,
    pub tags: Vec<String>,
    pub inclusive_seconds: i64,
    pub exclusive_seconds: i64,
}

/// Snapshot returned by `get_overview`
#[derive(Debug, Clone, serde::Serialize)]
pub struct OverviewSnapshot {
    pub range: String,
    pub generated_at: i64,
    pub active_task_id: Option<String>,
    pub rest_suggestion: Option<RestSuggestionView>,
    pub tasks: Vec<TaskOverview>,
}

// ============================================================================
// Database Connection
// ============================================================================

type DbPool = Pool<ConnectionManager<SqliteConnection>>;
type DbConn = PooledConnection<ConnectionManager<SqliteConnection>>;

/// Wall-clock source, read once per command
pub type ClockFn = Box<dyn Fn() -> i64 + Send + Sync>;

type ChangeListener = Box<dyn Fn() + Send + Sync>;

/// Database handle: connection pool plus per-process engine state
pub struct Database {
    pool: DbPool,
    clock: ClockFn,
    advisor_enabled: AtomicBool,
    listeners: RwLock<Vec<ChangeListener>>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("advisor_enabled", &self.advisor_enabled)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
struct ConnectionTuning;

impl diesel::r2d2::CustomizeConnection<SqliteConnection, diesel::r2d2::Error> for ConnectionTuning {
    fn on_acquire(
        &self,
        conn: &mut SqliteConnection,
    ) -> std::result::Result<(), diesel::r2d2::Error> {
        conn.batch_execute(
            "PRAGMA busy_timeout = 5000; PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;",
        )
        .map_err(diesel::r2d2::Error::QueryError)
    }
}

impl Database {
    /// Open (or create) the database at `path` and bring the schema current.
    pub fn open_at<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_clock(path, Box::new(|| Utc::now().timestamp()))
    }

    /// Open with a caller-supplied wall-clock source.
    ///
    /// The clock is read once per command; every event of one command shares
    /// the reading. Tests use this to pin timestamps.
    pub fn open_with_clock<P: AsRef<Path>>(path: P, clock: ClockFn) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| EngineError::Storage(format!("create {}: {e}", parent.display())))?;
            }
        }

        let manager = ConnectionManager::<SqliteConnection>::new(path.to_string_lossy().as_ref());
        let pool = Pool::builder()
            .max_size(5)
            .connection_customizer(Box::new(ConnectionTuning))
            .build(manager)
            .map_err(|e| EngineError::Storage(e.to_string()))?;

        let db = Self {
            pool,
            clock,
            advisor_enabled: AtomicBool::new(true),
            listeners: RwLock::new(Vec::new()),
        };
        db.migrate()?;
        db.heal_mirror()?;
        Ok(db)
    }

    fn get_conn(&self) -> Result<DbConn> {
        self.pool
            .get()
            .map_err(|e| EngineError::Storage(e.to_string()))
    }

    /// Register a callback fired after every successful mutation commit.
    pub fn on_data_changed<F>(&self, listener: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        if let Ok(mut listeners) = self.listeners.write() {
            listeners.push(Box::new(listener));
        }
    }

    fn notify_data_changed(&self) {
        if let Ok(listeners) = self.listeners.read() {
            for listener in listeners.iter() {
                listener();
            }
        }
    }

    /// Toggle the rest advisor. Disabled means triggers record nothing.
    pub fn set_advisor_enabled(&self, enabled: bool) {
        self.advisor_enabled.store(enabled, Ordering::SeqCst);
    }

    fn advisor_on(&self) -> bool {
        self.advisor_enabled.load(Ordering::SeqCst)
    }

    /// Liveness probe.
    pub fn ping(&self) -> Result<&'static str> {
        let mut conn = self.get_conn()?;
        let _: i32 = diesel::select(diesel::dsl::sql::<diesel::sql_types::Integer>("1"))
            .first(&mut conn)?;
        Ok("pong")
    }

    // ========================================================================
    // Schema Versioning
    // ========================================================================

    fn migrate(&self) -> Result<()> {
        let mut conn = self.get_conn()?;

        diesel::sql_query(
            "CREATE TABLE IF NOT EXISTS meta (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                schema_version BIGINT NOT NULL
            )",
        )
        .execute(&mut conn)?;
        diesel::insert_or_ignore_into(meta::table)
            .values((meta::id.eq(1), meta::schema_version.eq(0i64)))
            .execute(&mut conn)?;

        let on_disk: i64 = meta::table.select(meta::schema_version).first(&mut conn)?;
        if on_disk > CURRENT_SCHEMA_VERSION {
            return Err(EngineError::Storage(format!(
                "database schema is v{on_disk} but this binary only knows v{CURRENT_SCHEMA_VERSION}; \
                 refusing to open"
            )));
        }

        for migration in MIGRATIONS.iter().filter(|m| m.version > on_disk) {
            conn.immediate_transaction::<_, EngineError, _>(|conn| {
                conn.batch_execute(migration.sql)?;
                diesel::update(meta::table)
                    .set(meta::schema_version.eq(migration.version))
                    .execute(conn)?;
                Ok(())
            })?;
            tracing::info!(version = migration.version, name = migration.name, "applied schema migration");
        }

        Ok(())
    }

    /// Verify the `tasks` mirror against a full replay of the event log and
    /// rebuild diverging rows. A crash cannot split an event append from its
    /// mirror update (same transaction), so repairs indicate external damage.
    fn heal_mirror(&self) -> Result<()> {
        let wall = (self.clock)();
        let mut conn = self.get_conn()?;

        let repairs = conn.immediate_transaction::<_, EngineError, _>(|conn| {
            let events = load_events(conn)?;
            if events.is_empty() {
                return Ok(0usize);
            }
            let replayed = replay::rebuild_states(&events);
            let rows: Vec<Task> = tasks::table.load(conn)?;
            let actual_tags = tag_names_by_task(conn)?;

            let mut repairs = 0usize;
            for row in &rows {
                let Some(state) = replayed.get(&row.id) else {
                    continue;
                };

                if let Some(expected) = state.status {
                    if TaskStatus::parse(&row.status) != Some(expected) {
                        set_status(conn, &row.id, expected)?;
                        repairs += 1;
                    }
                }

                if let Some(expected_parent) = &state.parent {
                    if *expected_parent != row.parent_id {
                        diesel::update(tasks::table.find(&row.id))
                            .set(tasks::parent_id.eq(expected_parent.as_deref()))
                            .execute(conn)?;
                        repairs += 1;
                    }
                }

                let current: BTreeSet<String> = actual_tags
                    .get(&row.id)
                    .map(|names| names.iter().cloned().collect())
                    .unwrap_or_default();
                if current != state.tags {
                    rebuild_task_tags(conn, &row.id, &state.tags, wall)?;
                    repairs += 1;
                }
            }
            Ok(repairs)
        })?;

        if repairs > 0 {
            tracing::warn!(repairs, "task mirror diverged from event log; rebuilt from replay");
        }
        Ok(())
    }

    // ========================================================================
    // Task Repository
    // ========================================================================

    /// Create a task. Returns the new task id.
    pub fn create_task(&self, title: &str, parent_id: Option<&str>) -> Result<String> {
        let clean_title = sanitize_title(title)?;
        let task_id = Uuid::new_v4().to_string();
        let wall = (self.clock)();
        let mut conn = self.get_conn()?;

        conn.immediate_transaction::<_, EngineError, _>(|conn| {
            let now = clamp_clock(conn, wall)?;
            if let Some(parent) = parent_id {
                let gate = task_gate(conn, parent)?;
                require_live(&gate, parent)?;
            }
            diesel::insert_into(tasks::table)
                .values(&NewTask {
                    id: &task_id,
                    parent_id,
                    title: &clean_title,
                    status: TaskStatus::Idle.as_str(),
                    created_at: now,
                })
                .execute(conn)?;
            Ok(())
        })?;

        self.notify_data_changed();
        Ok(task_id)
    }

    /// Rename a task. Renaming to the current title is a no-op.
    pub fn rename_task(&self, task_id: &str, title: &str) -> Result<()> {
        let clean_title = sanitize_title(title)?;
        let wall = (self.clock)();
        let mut conn = self.get_conn()?;

        let changed = conn.immediate_transaction::<_, EngineError, _>(|conn| {
            let now = clamp_clock(conn, wall)?;
            let gate = task_gate(conn, task_id)?;
            require_live(&gate, task_id)?;
            if gate.title == clean_title {
                return Ok(false);
            }
            diesel::update(tasks::table.find(task_id))
                .set(tasks::title.eq(&clean_title))
                .execute(conn)?;
            append_event(
                conn,
                task_id,
                EventKind::Rename,
                now,
                Some(json!({ "from": gate.title, "to": clean_title })),
            )?;
            Ok(true)
        })?;

        if changed {
            self.notify_data_changed();
        }
        Ok(())
    }

    /// Move a task under a new parent (or to the root with `None`).
    pub fn reparent_task(&self, task_id: &str, new_parent_id: Option<&str>) -> Result<()> {
        let wall = (self.clock)();
        let mut conn = self.get_conn()?;

        let changed = conn.immediate_transaction::<_, EngineError, _>(|conn| {
            let now = clamp_clock(conn, wall)?;
            let gate = task_gate(conn, task_id)?;
            require_live(&gate, task_id)?;

            if new_parent_id == Some(task_id) {
                return Err(EngineError::CycleDetected(format!(
                    "task {task_id} cannot be its own parent"
                )));
            }
            if gate.parent_id.as_deref() == new_parent_id {
                return Ok(false);
            }
            if let Some(parent) = new_parent_id {
                let parent_gate = task_gate(conn, parent)?;
                require_live(&parent_gate, parent)?;
                ensure_acyclic(conn, task_id, parent)?;
            }

            diesel::update(tasks::table.find(task_id))
                .set(tasks::parent_id.eq(new_parent_id))
                .execute(conn)?;
            append_event(
                conn,
                task_id,
                EventKind::Reparent,
                now,
                Some(json!({ "from": gate.parent_id, "to": new_parent_id })),
            )?;
            Ok(true)
        })?;

        if changed {
            self.notify_data_changed();
        }
        Ok(())
    }

    /// Soft-delete a task and its whole subtree.
    pub fn archive_task(&self, task_id: &str) -> Result<()> {
        self.delete_tasks(&[task_id.to_string()], false)
    }

    /// Delete tasks and their subtrees. Soft (archive) unless `hard`; hard
    /// deletion requires every affected task to be archived already and
    /// purges its rows from tasks, task_tags and time_events. Tag rows are
    /// retained.
    pub fn delete_tasks(&self, task_ids: &[String], hard: bool) -> Result<()> {
        if task_ids.is_empty() {
            return Err(EngineError::InvalidInput("task_ids cannot be empty".to_string()));
        }
        let wall = (self.clock)();
        let mut conn = self.get_conn()?;

        conn.immediate_transaction::<_, EngineError, _>(|conn| {
            let now = clamp_clock(conn, wall)?;

            let mut expanded: Vec<String> = Vec::new();
            let mut seen: HashSet<String> = HashSet::new();
            for raw_id in task_ids {
                let task_id = raw_id.trim();
                if task_id.is_empty() || seen.contains(task_id) {
                    continue;
                }
                task_gate(conn, task_id)?;
                for member in subtree_ids(conn, task_id)? {
                    if seen.insert(member.clone()) {
                        expanded.push(member);
                    }
                }
            }

            if hard {
                let live: i64 = tasks::table
                    .filter(tasks::id.eq_any(&expanded))
                    .filter(tasks::archived_at.is_null())
                    .count()
                    .get_result(conn)?;
                if live > 0 {
                    return Err(EngineError::InvalidState(format!(
                        "hard delete requires archiving first; {live} task(s) are not archived"
                    )));
                }
                diesel::delete(
                    rest_suggestions::table.filter(rest_suggestions::task_id.eq_any(&expanded)),
                )
                .execute(conn)?;
                diesel::delete(time_events::table.filter(time_events::task_id.eq_any(&expanded)))
                    .execute(conn)?;
                diesel::delete(task_tags::table.filter(task_tags::task_id.eq_any(&expanded)))
                    .execute(conn)?;
                // children were pushed after their parents; delete leaves first
                for task_id in expanded.iter().rev() {
                    diesel::delete(tasks::table.find(task_id)).execute(conn)?;
                }
            } else {
                archive_members(conn, &expanded, now)?;
            }
            Ok(())
        })?;

        self.notify_data_changed();
        Ok(())
    }

    // ========================================================================
    // Timing State Machine
    // ========================================================================

    /// Start an idle or stopped task, pausing the current runner if any.
    pub fn start_task(&self, task_id: &str) -> Result<()> {
        let wall = (self.clock)();
        let mut conn = self.get_conn()?;

        conn.immediate_transaction::<_, EngineError, _>(|conn| {
            let now = clamp_clock(conn, wall)?;
            let gate = task_gate(conn, task_id)?;
            require_live(&gate, task_id)?;
            match gate.status {
                TaskStatus::Running => {
                    return Err(EngineError::InvalidState(format!(
                        "task {task_id} is already running"
                    )));
                }
                TaskStatus::Paused => {
                    return Err(EngineError::InvalidState(format!(
                        "task {task_id} is paused; resume it instead"
                    )));
                }
                TaskStatus::Idle | TaskStatus::Stopped => {}
            }

            let previous_target = latest_switch_target(conn)?;
            if let Some(runner) = running_task(conn)? {
                append_event(conn, &runner, EventKind::Pause, now, None)?;
                set_status(conn, &runner, TaskStatus::Paused)?;
            }
            append_event(conn, task_id, EventKind::Start, now, None)?;
            set_status(conn, task_id, TaskStatus::Running)?;

            if self.advisor_on() {
                if let Some(previous) = previous_target {
                    if previous != task_id {
                        record_suggestion(conn, TriggerType::TaskSwitch, Some(&previous), now)?;
                    }
                }
            }
            Ok(())
        })?;

        self.notify_data_changed();
        Ok(())
    }

    /// Pause the running task.
    pub fn pause_task(&self, task_id: &str) -> Result<()> {
        let wall = (self.clock)();
        let mut conn = self.get_conn()?;

        conn.immediate_transaction::<_, EngineError, _>(|conn| {
            let now = clamp_clock(conn, wall)?;
            let gate = task_gate(conn, task_id)?;
            require_live(&gate, task_id)?;
            if gate.status != TaskStatus::Running {
                return Err(EngineError::InvalidState(format!(
                    "only a running task can be paused; task {task_id} is {}",
                    gate.status
                )));
            }
            append_event(conn, task_id, EventKind::Pause, now, None)?;
            set_status(conn, task_id, TaskStatus::Paused)?;
            Ok(())
        })?;

        self.notify_data_changed();
        Ok(())
    }

    /// Resume a paused task, pausing the current runner if any.
    pub fn resume_task(&self, task_id: &str) -> Result<()> {
        let wall = (self.clock)();
        let mut conn = self.get_conn()?;

        conn.immediate_transaction::<_, EngineError, _>(|conn| {
            let now = clamp_clock(conn, wall)?;
            let gate = task_gate(conn, task_id)?;
            require_live(&gate, task_id)?;
            if gate.status != TaskStatus::Paused {
                return Err(EngineError::InvalidState(format!(
                    "only a paused task can be resumed; task {task_id} is {}",
                    gate.status
                )));
            }

            let previous_target = latest_switch_target(conn)?;
            if let Some(runner) = running_task(conn)? {
                append_event(conn, &runner, EventKind::Pause, now, None)?;
                set_status(conn, &runner, TaskStatus::Paused)?;
            }
            append_event(conn, task_id, EventKind::Resume, now, None)?;
            set_status(conn, task_id, TaskStatus::Running)?;

            if self.advisor_on() {
                if let Some(previous) = previous_target {
                    if previous != task_id {
                        record_suggestion(conn, TriggerType::TaskSwitch, Some(&previous), now)?;
                    }
                }
            }
            Ok(())
        })?;

        self.notify_data_changed();
        Ok(())
    }

    /// Stop a running or paused task, finalizing its current session.
    ///
    /// If the task was inserted as a subtask of a still-paused parent and
    /// nothing else was started in between, the parent resumes automatically.
    pub fn stop_task(&self, task_id: &str) -> Result<()> {
        let wall = (self.clock)();
        let mut conn = self.get_conn()?;

        conn.immediate_transaction::<_, EngineError, _>(|conn| {
            let now = clamp_clock(conn, wall)?;
            let gate = task_gate(conn, task_id)?;
            require_live(&gate, task_id)?;
            if !matches!(gate.status, TaskStatus::Running | TaskStatus::Paused) {
                return Err(EngineError::InvalidState(format!(
                    "only a running or paused task can be stopped; task {task_id} is {}",
                    gate.status
                )));
            }

            append_event(conn, task_id, EventKind::Stop, now, None)?;
            set_status(conn, task_id, TaskStatus::Stopped)?;

            if let Some(parent_id) = &gate.parent_id {
                let parent_gate = task_gate(conn, parent_id)?;
                if !parent_gate.archived
                    && parent_gate.status == TaskStatus::Paused
                    && subtask_pause_eligible(conn, parent_id, task_id)?
                    && running_task(conn)?.is_none()
                {
                    append_event(conn, parent_id, EventKind::Resume, now, None)?;
                    set_status(conn, parent_id, TaskStatus::Running)?;
                }
            }

            if self.advisor_on() && gate.parent_id.is_some() {
                record_suggestion(conn, TriggerType::SubtaskEnd, Some(task_id), now)?;
            }
            Ok(())
        })?;

        self.notify_data_changed();
        Ok(())
    }

    /// Create a child under the running task and switch focus to it in one
    /// transaction: the parent is paused, the child created and started.
    pub fn insert_subtask_and_start(&self, parent_task_id: &str, title: &str) -> Result<String> {
        let clean_title = sanitize_title(title)?;
        let child_id = Uuid::new_v4().to_string();
        let wall = (self.clock)();
        let mut conn = self.get_conn()?;

        conn.immediate_transaction::<_, EngineError, _>(|conn| {
            let now = clamp_clock(conn, wall)?;
            let gate = task_gate(conn, parent_task_id)?;
            require_live(&gate, parent_task_id)?;
            if gate.status != TaskStatus::Running {
                return Err(EngineError::InvalidState(format!(
                    "insert_subtask_and_start requires a running parent; task {parent_task_id} is {}",
                    gate.status
                )));
            }

            diesel::insert_into(tasks::table)
                .values(&NewTask {
                    id: &child_id,
                    parent_id: Some(parent_task_id),
                    title: &clean_title,
                    status: TaskStatus::Idle.as_str(),
                    created_at: now,
                })
                .execute(conn)?;

            append_event(conn, parent_task_id, EventKind::Pause, now, None)?;
            set_status(conn, parent_task_id, TaskStatus::Paused)?;
            append_event(conn, &child_id, EventKind::Start, now, None)?;
            set_status(conn, &child_id, TaskStatus::Running)?;

            if self.advisor_on() {
                record_suggestion(conn, TriggerType::TaskSwitch, Some(parent_task_id), now)?;
            }
            Ok(())
        })?;

        self.notify_data_changed();
        Ok(child_id)
    }

    // ========================================================================
    // Tags
    // ========================================================================

    /// Attach a tag, creating the tag row if needed. Tag names match
    /// case-insensitively and keep their first spelling. Re-adding a present
    /// tag is a no-op and emits nothing.
    pub fn add_tag_to_task(&self, task_id: &str, tag_name: &str) -> Result<()> {
        let clean_tag = sanitize_tag(tag_name)?;
        let tag_id = Uuid::new_v4().to_string();
        let wall = (self.clock)();
        let mut conn = self.get_conn()?;

        let changed = conn.immediate_transaction::<_, EngineError, _>(|conn| {
            let now = clamp_clock(conn, wall)?;
            let gate = task_gate(conn, task_id)?;
            require_live(&gate, task_id)?;

            let tag = match lookup_tag(conn, &clean_tag)? {
                Some(existing) => existing,
                None => {
                    diesel::insert_into(tags::table)
                        .values(&NewTag {
                            id: &tag_id,
                            name: &clean_tag,
                            created_at: now,
                        })
                        .execute(conn)?;
                    Tag {
                        id: tag_id.clone(),
                        name: clean_tag.clone(),
                        created_at: now,
                    }
                }
            };

            let inserted = diesel::insert_or_ignore_into(task_tags::table)
                .values(&NewTaskTag {
                    task_id,
                    tag_id: &tag.id,
                    created_at: now,
                })
                .execute(conn)?;
            if inserted == 0 {
                return Ok(false);
            }
            append_event(
                conn,
                task_id,
                EventKind::TagAdd,
                now,
                Some(json!({ "tag": tag.name })),
            )?;
            Ok(true)
        })?;

        if changed {
            self.notify_data_changed();
        }
        Ok(())
    }

    /// Detach a tag. Removing an absent tag is a no-op.
    pub fn remove_tag_from_task(&self, task_id: &str, tag_name: &str) -> Result<()> {
        let clean_tag = sanitize_tag(tag_name)?;
        let wall = (self.clock)();
        let mut conn = self.get_conn()?;

        let changed = conn.immediate_transaction::<_, EngineError, _>(|conn| {
            let now = clamp_clock(conn, wall)?;
            let gate = task_gate(conn, task_id)?;
            require_live(&gate, task_id)?;

            let Some(tag) = lookup_tag(conn, &clean_tag)? else {
                return Ok(false);
            };
            let deleted = diesel::delete(
                task_tags::table
                    .filter(task_tags::task_id.eq(task_id))
                    .filter(task_tags::tag_id.eq(&tag.id)),
            )
            .execute(conn)?;
            if deleted == 0 {
                return Ok(false);
            }
            append_event(
                conn,
                task_id,
                EventKind::TagRemove,
                now,
                Some(json!({ "tag": tag.name })),
            )?;
            Ok(true)
        })?;

        if changed {
            self.notify_data_changed();
        }
        Ok(())
    }

    // ========================================================================
    // Rest Suggestions
    // ========================================================================

    /// Accept or ignore a pending suggestion. Responding again is a no-op;
    /// an unknown id is an error.
    pub fn respond_rest_suggestion(&self, suggestion_id: i64, accept: bool) -> Result<()> {
        let wall = (self.clock)();
        let mut conn = self.get_conn()?;

        let changed = conn.immediate_transaction::<_, EngineError, _>(|conn| {
            let now = clamp_clock(conn, wall)?;
            let status = if accept {
                SuggestionStatus::Accepted
            } else {
                SuggestionStatus::Ignored
            };
            let updated = diesel::update(
                rest_suggestions::table
                    .filter(rest_suggestions::id.eq(suggestion_id))
                    .filter(rest_suggestions::status.eq(SuggestionStatus::Pending.as_str())),
            )
            .set((
                rest_suggestions::status.eq(status.as_str()),
                rest_suggestions::responded_at.eq(now),
            ))
            .execute(conn)?;
            if updated > 0 {
                return Ok(true);
            }

            let exists: i64 = rest_suggestions::table
                .filter(rest_suggestions::id.eq(suggestion_id))
                .count()
                .get_result(conn)?;
            if exists > 0 {
                Ok(false)
            } else {
                Err(EngineError::NotFound(format!(
                    "rest suggestion {suggestion_id} not found"
                )))
            }
        })?;

        if changed {
            self.notify_data_changed();
        }
        Ok(())
    }

    /// The pending suggestion, if one exists.
    pub fn pending_rest_suggestion(&self) -> Result<Option<RestSuggestionView>> {
        let mut conn = self.get_conn()?;
        Ok(pending_suggestion(&mut conn)?.map(|s| s.view()))
    }

    /// All suggestions, newest first.
    pub fn rest_suggestions(&self) -> Result<Vec<RestSuggestionView>> {
        let mut conn = self.get_conn()?;
        let rows: Vec<RestSuggestion> = rest_suggestions::table
            .order((rest_suggestions::created_at.desc(), rest_suggestions::id.desc()))
            .load(&mut conn)?;
        Ok(rows.iter().map(RestSuggestion::view).collect())
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Get a single task by id (archived included).
    pub fn get_task(&self, task_id: &str) -> Result<Option<Task>> {
        let mut conn = self.get_conn()?;
        Ok(tasks::table.find(task_id).first::<Task>(&mut conn).optional()?)
    }

    /// The full event log in sequence order.
    pub fn event_log(&self) -> Result<Vec<TimeEvent>> {
        let mut conn = self.get_conn()?;
        Ok(time_events::table
            .order(time_events::sequence.asc())
            .load(&mut conn)?)
    }

    /// One task's events in sequence order.
    pub fn task_events(&self, task_id: &str) -> Result<Vec<TimeEvent>> {
        let mut conn = self.get_conn()?;
        task_gate(&mut conn, task_id)?;
        Ok(time_events::table
            .filter(time_events::task_id.eq(task_id))
            .order(time_events::sequence.asc())
            .load(&mut conn)?)
    }

    /// Snapshot of all live tasks with replayed durations over `range`.
    pub fn get_overview(&self, range: OverviewRange) -> Result<OverviewSnapshot> {
        let wall = (self.clock)();
        let mut conn = self.get_conn()?;

        let now = clamp_clock(&mut conn, wall)?;
        let window_start = range.window_start(now);

        let task_rows: Vec<Task> = tasks::table
            .filter(tasks::archived_at.is_null())
            .order(tasks::created_at.asc())
            .load(&mut conn)?;
        let tags_by_task = tag_names_by_task(&mut conn)?;
        let events = load_events(&mut conn)?;

        let exclusive = replay::exclusive_seconds(&events, window_start, now);
        let parents: Vec<(String, Option<String>)> = task_rows
            .iter()
            .map(|t| (t.id.clone(), t.parent_id.clone()))
            .collect();
        let inclusive = replay::inclusive_rollup(&parents, &exclusive);

        let active_task_id = running_task(&mut conn)?;
        let rest_suggestion = pending_suggestion(&mut conn)?.map(|s| s.view());

        let tasks = task_rows
            .into_iter()
            .map(|task| TaskOverview {
                inclusive_seconds: *inclusive.get(&task.id).unwrap_or(&0),
                exclusive_seconds: *exclusive.get(&task.id).unwrap_or(&0),
                tags: tags_by_task.get(&task.id).cloned().unwrap_or_default(),
                id: task.id,
                parent_id: task.parent_id,
                title: task.title,
                status: task.status,
                created_at: task.created_at,
            })
            .collect();

        Ok(OverviewSnapshot {
            range: range.as_str().to_string(),
            generated_at: now,
            active_task_id,
            rest_suggestion,
            tasks,
        })
    }
}

// ============================================================================
// Transaction-scope helpers
// ============================================================================

/// Per-command clock: wall time, clamped so event times never regress.
fn clamp_clock(conn: &mut SqliteConnection, wall: i64) -> Result<i64> {
    let last: Option<i64> = time_events::table
        .select(diesel::dsl::max(time_events::at))
        .first(conn)?;
    Ok(wall.max(last.unwrap_or(wall)))
}

struct TaskGate {
    parent_id: Option<String>,
    title: String,
    status: TaskStatus,
    archived: bool,
}

fn task_gate(conn: &mut SqliteConnection, task_id: &str) -> Result<TaskGate> {
    let row: Option<Task> = tasks::table.find(task_id).first(conn).optional()?;
    let Some(row) = row else {
        return Err(EngineError::NotFound(format!("task {task_id} not found")));
    };
    let status = TaskStatus::parse(&row.status).ok_or_else(|| {
        EngineError::Internal(format!("task {task_id} has unknown status '{}'", row.status))
    })?;
    Ok(TaskGate {
        parent_id: row.parent_id,
        title: row.title,
        status,
        archived: row.archived_at.is_some(),
    })
}

fn require_live(gate: &TaskGate, task_id: &str) -> Result<()> {
    if gate.archived {
        Err(EngineError::Archived(format!("task {task_id} is archived")))
    } else {
        Ok(())
    }
}

fn running_task(conn: &mut SqliteConnection) -> Result<Option<String>> {
    Ok(tasks::table
        .filter(tasks::status.eq(TaskStatus::Running.as_str()))
        .filter(tasks::archived_at.is_null())
        .select(tasks::id)
        .first(conn)
        .optional()?)
}

/// Target of the most recent start/resume event; the task the user would be
/// switching away from.
fn latest_switch_target(conn: &mut SqliteConnection) -> Result<Option<String>> {
    Ok(time_events::table
        .filter(time_events::kind.eq_any([EventKind::Start.as_str(), EventKind::Resume.as_str()]))
        .order(time_events::sequence.desc())
        .select(time_events::task_id)
        .first(conn)
        .optional()?)
}

fn append_event(
    conn: &mut SqliteConnection,
    task_id: &str,
    kind: EventKind,
    at: i64,
    payload: Option<serde_json::Value>,
) -> Result<()> {
    let payload_text = payload.map(|value| value.to_string());
    diesel::insert_into(time_events::table)
        .values(&NewTimeEvent {
            task_id,
            kind: kind.as_str(),
            at,
            payload: payload_text.as_deref(),
        })
        .execute(conn)?;
    Ok(())
}

fn set_status(conn: &mut SqliteConnection, task_id: &str, status: TaskStatus) -> Result<()> {
    diesel::update(tasks::table.find(task_id))
        .set(tasks::status.eq(status.as_str()))
        .execute(conn)?;
    Ok(())
}

/// All ids in the subtree rooted at `root` (archived included), parents
/// before their children.
fn subtree_ids(conn: &mut SqliteConnection, root: &str) -> Result<Vec<String>> {
    let mut result = Vec::new();
    let mut queue = vec![root.to_string()];
    let mut visited = HashSet::new();

    while let Some(task_id) = queue.pop() {
        if !visited.insert(task_id.clone()) {
            return Err(EngineError::Internal(format!(
                "cycle in task tree at {task_id}"
            )));
        }
        let children: Vec<String> = tasks::table
            .filter(tasks::parent_id.eq(&task_id))
            .select(tasks::id)
            .load(conn)?;
        result.push(task_id);
        queue.extend(children);
    }
    Ok(result)
}

/// Walk upward from `candidate_parent`; meeting `task_id` means the candidate
/// lives inside the task's own subtree.
fn ensure_acyclic(
    conn: &mut SqliteConnection,
    task_id: &str,
    candidate_parent: &str,
) -> Result<()> {
    let mut current = Some(candidate_parent.to_string());
    let mut visited = HashSet::new();

    while let Some(ancestor) = current {
        if ancestor == task_id {
            return Err(EngineError::CycleDetected(format!(
                "task {task_id} cannot move beneath its own descendant"
            )));
        }
        if !visited.insert(ancestor.clone()) {
            return Err(EngineError::Internal(format!(
                "parent chain already cyclic at {ancestor}"
            )));
        }
        current = tasks::table
            .find(&ancestor)
            .select(tasks::parent_id)
            .first::<Option<String>>(conn)
            .optional()?
            .ok_or_else(|| EngineError::NotFound(format!("task {ancestor} not found")))?;
    }
    Ok(())
}

/// Stop any running/paused members, then stamp `archived_at`.
fn archive_members(conn: &mut SqliteConnection, member_ids: &[String], now: i64) -> Result<()> {
    for task_id in member_ids {
        let gate = task_gate(conn, task_id)?;
        if matches!(gate.status, TaskStatus::Running | TaskStatus::Paused) {
            append_event(conn, task_id, EventKind::Stop, now, None)?;
            set_status(conn, task_id, TaskStatus::Stopped)?;
        }
    }
    diesel::update(
        tasks::table
            .filter(tasks::id.eq_any(member_ids))
            .filter(tasks::archived_at.is_null()),
    )
    .set(tasks::archived_at.eq(now))
    .execute(conn)?;
    Ok(())
}

/// Case-insensitive tag lookup preserving the stored spelling.
fn lookup_tag(conn: &mut SqliteConnection, name: &str) -> Result<Option<Tag>> {
    Ok(diesel::sql_query(
        "SELECT id, name, created_at FROM tags WHERE lower(name) = lower(?) LIMIT 1",
    )
    .bind::<diesel::sql_types::Text, _>(name)
    .get_result::<Tag>(conn)
    .optional()?)
}

fn load_events(conn: &mut SqliteConnection) -> Result<Vec<LogEvent>> {
    let rows: Vec<TimeEvent> = time_events::table
        .order(time_events::sequence.asc())
        .load(conn)?;
    rows.into_iter()
        .map(|row| {
            let kind = EventKind::parse(&row.kind).ok_or_else(|| {
                EngineError::Internal(format!("unknown event kind '{}'", row.kind))
            })?;
            Ok(LogEvent {
                sequence: row.sequence,
                task_id: row.task_id,
                kind,
                at: row.at,
                payload: row.payload,
            })
        })
        .collect()
}

/// Tag names per task, sorted, for live tasks and the mirror check.
fn tag_names_by_task(conn: &mut SqliteConnection) -> Result<HashMap<String, Vec<String>>> {
    let associations: Vec<(String, String)> = task_tags::table
        .select((task_tags::task_id, task_tags::tag_id))
        .load(conn)?;
    let tag_rows: Vec<Tag> = tags::table.load(conn)?;
    let names: HashMap<String, String> = tag_rows
        .into_iter()
        .map(|tag| (tag.id, tag.name))
        .collect();

    let mut by_task: HashMap<String, Vec<String>> = HashMap::new();
    for (task_id, tag_id) in associations {
        if let Some(name) = names.get(&tag_id) {
            by_task.entry(task_id).or_default().push(name.clone());
        }
    }
    for tag_list in by_task.values_mut() {
        tag_list.sort();
    }
    Ok(by_task)
}

fn rebuild_task_tags(
    conn: &mut SqliteConnection,
    task_id: &str,
    expected: &BTreeSet<String>,
    now: i64,
) -> Result<()> {
    diesel::delete(task_tags::table.filter(task_tags::task_id.eq(task_id))).execute(conn)?;
    for name in expected {
        let tag = match lookup_tag(conn, name)? {
            Some(existing) => existing,
            None => {
                let tag_id = Uuid::new_v4().to_string();
                diesel::insert_into(tags::table)
                    .values(&NewTag {
                        id: &tag_id,
                        name,
                        created_at: now,
                    })
                    .execute(conn)?;
                Tag {
                    id: tag_id,
                    name: name.clone(),
                    created_at: now,
                }
            }
        };
        diesel::insert_or_ignore_into(task_tags::table)
            .values(&NewTaskTag {
                task_id,
                tag_id: &tag.id,
                created_at: now,
            })
            .execute(conn)?;
    }
    Ok(())
}

/// True when the parent's pause was caused by inserting `child_id` and the
/// user has not started anything else since. Timing payloads are empty, so
/// this reads event order: the parent's latest event must be a pause whose
/// successor is the child's start at the same instant, and every later
/// start/resume must target the child.
fn subtask_pause_eligible(
    conn: &mut SqliteConnection,
    parent_id: &str,
    child_id: &str,
) -> Result<bool> {
    let last_parent_event: Option<TimeEvent> = time_events::table
        .filter(time_events::task_id.eq(parent_id))
        .order(time_events::sequence.desc())
        .first(conn)
        .optional()?;
    let Some(pause) = last_parent_event else {
        return Ok(false);
    };
    if pause.kind != EventKind::Pause.as_str() {
        return Ok(false);
    }

    let successor: Option<TimeEvent> = time_events::table
        .filter(time_events::sequence.gt(pause.sequence))
        .order(time_events::sequence.asc())
        .first(conn)
        .optional()?;
    let Some(successor) = successor else {
        return Ok(false);
    };
    if successor.task_id != child_id
        || successor.kind != EventKind::Start.as_str()
        || successor.at != pause.at
    {
        return Ok(false);
    }

    let interlopers: i64 = time_events::table
        .filter(time_events::sequence.gt(pause.sequence))
        .filter(time_events::kind.eq_any([EventKind::Start.as_str(), EventKind::Resume.as_str()]))
        .filter(time_events::task_id.ne(child_id))
        .count()
        .get_result(conn)?;
    Ok(interlopers == 0)
}

fn pending_suggestion(conn: &mut SqliteConnection) -> Result<Option<RestSuggestion>> {
    Ok(rest_suggestions::table
        .filter(rest_suggestions::status.eq(SuggestionStatus::Pending.as_str()))
        .order((rest_suggestions::created_at.desc(), rest_suggestions::id.desc()))
        .first(conn)
        .optional()?)
}

/// Compute advisor inputs from the log, supersede any pending suggestion and
/// insert the new one.
fn record_suggestion(
    conn: &mut SqliteConnection,
    trigger: TriggerType,
    anchor_task_id: Option<&str>,
    now: i64,
) -> Result<()> {
    let events = load_events(conn)?;

    let (focus_seconds, deviation) = match anchor_task_id {
        Some(task_id) => {
            let intervals = replay::running_intervals_for(&events, task_id, now);
            let blocks = advisor::focus_blocks(&intervals, advisor::PAUSE_MERGE_GAP_SECONDS);
            let focus = blocks.last().copied().unwrap_or(0);
            let prior = &blocks[..blocks.len().saturating_sub(1)];
            (focus, advisor::deviation_ratio(focus, prior))
        }
        None => (0, 0.0),
    };

    let stream: Vec<(String, i64)> = events
        .iter()
        .filter(|e| matches!(e.kind, EventKind::Start | EventKind::Resume))
        .map(|e| (e.task_id.clone(), e.at))
        .collect();
    let switch_count = advisor::count_switches(&stream, now - advisor::SWITCH_WINDOW_SECONDS);

    let verdict = advisor::evaluate(focus_seconds, switch_count, deviation);
    let reasons_json = serde_json::to_string(&verdict.reasons)?;

    diesel::update(
        rest_suggestions::table
            .filter(rest_suggestions::status.eq(SuggestionStatus::Pending.as_str())),
    )
    .set((
        rest_suggestions::status.eq(SuggestionStatus::Ignored.as_str()),
        rest_suggestions::responded_at.eq(now),
    ))
    .execute(conn)?;

    diesel::insert_into(rest_suggestions::table)
        .values(&NewRestSuggestion {
            trigger_type: trigger.as_str(),
            task_id: anchor_task_id,
            focus_seconds,
            switch_count_30m: switch_count,
            deviation_ratio: deviation,
            suggested_minutes: verdict.suggested_minutes,
            reasons: &reasons_json,
            status: SuggestionStatus::Pending.as_str(),
            created_at: now,
        })
        .execute(conn)?;
    Ok(())
}

fn sanitize_title(raw: &str) -> Result<String> {
    let cleaned = raw.trim();
    if cleaned.is_empty() {
        return Err(EngineError::InvalidInput("title cannot be empty".to_string()));
    }
    if cleaned.chars().count() > MAX_TITLE_LEN {
        return Err(EngineError::InvalidInput(format!(
            "title exceeds {MAX_TITLE_LEN} characters"
        )));
    }
    Ok(cleaned.to_string())
}

fn sanitize_tag(raw: &str) -> Result<String> {
    let cleaned = raw.trim();
    if cleaned.is_empty() {
        return Err(EngineError::InvalidInput("tag cannot be empty".to_string()));
    }
    if cleaned.chars().count() > MAX_TAG_LEN {
        return Err(EngineError::InvalidInput(format!(
            "tag exceeds {MAX_TAG_LEN} characters"
        )));
    }
    Ok(cleaned.to_string())
}

/// Unix seconds of the most recent local midnight.
fn local_day_start(now: i64) -> i64 {
    let Some(local_now) = Local.timestamp_opt(now, 0).single() else {
        return now;
    };
    local_now
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .and_then(|midnight| Local.from_local_datetime(&midnight).earliest())
        .map(|dt| dt.timestamp())
        .unwrap_or(now)
}
