// crates/alphred-store-sqlite/src/store.rs
// ============================================================================
// Module: Alphred SQLite Workflow Store
// Description: Durable WorkflowStore backed by SQLite WAL.
// Purpose: Persist trees, runs, artifacts, diagnostics, and stream events.
// Dependencies: alphred-core, rusqlite, serde, serde_json, thiserror
// ============================================================================

//! ## Overview
//! One connection per session, serialized through a mutex. Every mutation
//! stamps `updated_at` with an RFC3339 UTC millisecond timestamp; guarded
//! status updates include `WHERE status = ? AND attempt = ?` and treat a
//! row-count other than 1 as a precondition miss. Stream sequences continue
//! from `MAX(sequence)` inside the insert transaction so they stay gap-free.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use alphred_core::ArtifactId;
use alphred_core::ArtifactType;
use alphred_core::Clock;
use alphred_core::ContentType;
use alphred_core::DecisionId;
use alphred_core::DecisionSignal;
use alphred_core::GuardDefinition;
use alphred_core::GuardId;
use alphred_core::LatestArtifact;
use alphred_core::NewArtifact;
use alphred_core::NewDiagnostics;
use alphred_core::NewRoutingDecision;
use alphred_core::NewRunNode;
use alphred_core::NewStreamEvent;
use alphred_core::NodeStatus;
use alphred_core::NodeTransition;
use alphred_core::PhaseArtifact;
use alphred_core::PromptTemplate;
use alphred_core::PromptTemplateId;
use alphred_core::RoutingDecision;
use alphred_core::RunId;
use alphred_core::RunNode;
use alphred_core::RunNodeDiagnostics;
use alphred_core::RunNodeId;
use alphred_core::RunNodeStreamEvent;
use alphred_core::RunStatus;
use alphred_core::RunWorktree;
use alphred_core::StoreError;
use alphred_core::StoreSessionFactory;
use alphred_core::SystemClock;
use alphred_core::Timestamp;
use alphred_core::TimestampAction;
use alphred_core::TreeDefinition;
use alphred_core::TreeEdge;
use alphred_core::TreeId;
use alphred_core::TreeNode;
use alphred_core::TreeNodeId;
use alphred_core::TreeStatus;
use alphred_core::WorkflowRun;
use alphred_core::WorkflowStore;
use alphred_core::WorkflowTree;
use alphred_core::WorktreeId;
use alphred_core::EdgeId;
use alphred_core::ExecutionPermissions;
use alphred_core::NodePosition;
use alphred_core::NodeRole;
use alphred_core::NodeType;
use alphred_core::RouteOn;
use alphred_core::parse_guard_expression;
use rusqlite::Connection;
use rusqlite::ErrorCode;
use rusqlite::OptionalExtension;
use rusqlite::Row;
use rusqlite::Transaction;
use rusqlite::params;
use serde::Deserialize;
use serde_json::Value;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// `SQLite` schema version for the store.
const SCHEMA_VERSION: i64 = 1;
/// Default busy timeout (ms).
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

// ============================================================================
// SECTION: Config
// ============================================================================

/// `SQLite` journal mode configuration.
///
/// # Invariants
/// - Values map 1:1 to `SQLite` `journal_mode` pragma settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SqliteJournalMode {
    /// WAL journal mode (recommended).
    #[default]
    Wal,
    /// Delete journal mode (legacy).
    Delete,
}

impl SqliteJournalMode {
    /// Returns the `SQLite` pragma value.
    #[must_use]
    pub const fn pragma_value(self) -> &'static str {
        match self {
            Self::Wal => "wal",
            Self::Delete => "delete",
        }
    }
}

/// `SQLite` sync mode configuration.
///
/// # Invariants
/// - Values map 1:1 to `SQLite` `synchronous` pragma settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SqliteSyncMode {
    /// Full synchronous mode (safest).
    #[default]
    Full,
    /// Normal synchronous mode (balanced).
    Normal,
}

impl SqliteSyncMode {
    /// Returns the `SQLite` pragma value.
    #[must_use]
    pub const fn pragma_value(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Normal => "normal",
        }
    }
}

/// Configuration for the `SQLite` workflow store.
///
/// # Invariants
/// - `path` must resolve to a file path (not a directory).
/// - `busy_timeout_ms` is interpreted as milliseconds.
#[derive(Debug, Clone, Deserialize)]
pub struct SqliteStoreConfig {
    /// Path to the `SQLite` database file.
    pub path: PathBuf,
    /// Busy timeout in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    /// `SQLite` journal mode.
    #[serde(default)]
    pub journal_mode: SqliteJournalMode,
    /// `SQLite` sync mode.
    #[serde(default)]
    pub sync_mode: SqliteSyncMode,
}

impl SqliteStoreConfig {
    /// Creates a config with defaults for the given database path.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            journal_mode: SqliteJournalMode::default(),
            sync_mode: SqliteSyncMode::default(),
        }
    }
}

/// Returns the default busy timeout for `SQLite` connections.
const fn default_busy_timeout_ms() -> u64 {
    DEFAULT_BUSY_TIMEOUT_MS
}

// ============================================================================
// SECTION: Store
// ============================================================================

/// `SQLite`-backed [`WorkflowStore`].
///
/// # Invariants
/// - Connection access is serialized through a mutex.
/// - Every mutation stamps `updated_at`.
pub struct SqliteWorkflowStore {
    /// Shared connection guarded by a mutex.
    connection: Arc<Mutex<Connection>>,
    /// Wall clock stamping row timestamps.
    clock: SystemClock,
}

impl SqliteWorkflowStore {
    /// Opens (and initializes) a workflow store at the configured path.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the database cannot be opened or the
    /// schema cannot be initialized.
    pub fn open(config: &SqliteStoreConfig) -> Result<Self, StoreError> {
        ensure_parent_dir(&config.path)?;
        let mut connection = Connection::open(&config.path).map_err(db_err)?;
        configure_connection(&connection, config)?;
        initialize_schema(&mut connection)?;
        Ok(Self {
            connection: Arc::new(Mutex::new(connection)),
            clock: SystemClock,
        })
    }

    /// Locks the connection.
    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.connection.lock().map_err(|_| StoreError::Io("sqlite mutex poisoned".to_string()))
    }

    /// Returns the current timestamp in the canonical TEXT form.
    fn now_text(&self) -> String {
        self.clock.now().to_rfc3339()
    }
}

/// Session factory opening one fresh connection per session.
#[derive(Debug, Clone)]
pub struct SqliteSessionFactory {
    /// Store configuration shared by all sessions.
    config: SqliteStoreConfig,
}

impl SqliteSessionFactory {
    /// Creates a factory for the given configuration.
    #[must_use]
    pub const fn new(config: SqliteStoreConfig) -> Self {
        Self {
            config,
        }
    }
}

impl StoreSessionFactory for SqliteSessionFactory {
    type Store = SqliteWorkflowStore;

    fn open_session(&self) -> Result<Self::Store, StoreError> {
        SqliteWorkflowStore::open(&self.config)
    }
}

// ============================================================================
// SECTION: Connection Setup
// ============================================================================

/// Creates the parent directory of the database file when missing.
fn ensure_parent_dir(path: &Path) -> Result<(), StoreError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
        && !parent.exists()
    {
        std::fs::create_dir_all(parent)
            .map_err(|err| StoreError::Io(format!("create {}: {err}", parent.display())))?;
    }
    Ok(())
}

/// Applies pragmas for the configured journal and sync modes.
fn configure_connection(
    connection: &Connection,
    config: &SqliteStoreConfig,
) -> Result<(), StoreError> {
    connection
        .busy_timeout(std::time::Duration::from_millis(config.busy_timeout_ms))
        .map_err(db_err)?;
    connection
        .pragma_update(None, "journal_mode", config.journal_mode.pragma_value())
        .map_err(db_err)?;
    connection
        .pragma_update(None, "synchronous", config.sync_mode.pragma_value())
        .map_err(db_err)?;
    connection.pragma_update(None, "foreign_keys", "on").map_err(db_err)?;
    Ok(())
}

/// Creates the schema and records the store version.
fn initialize_schema(connection: &mut Connection) -> Result<(), StoreError> {
    let tx = connection.transaction().map_err(db_err)?;
    tx.execute_batch("CREATE TABLE IF NOT EXISTS store_meta (version INTEGER NOT NULL);")
        .map_err(db_err)?;
    let version: Option<i64> = tx
        .query_row("SELECT version FROM store_meta LIMIT 1", params![], |row| row.get(0))
        .optional()
        .map_err(db_err)?;
    match version {
        None => {
            tx.execute("INSERT INTO store_meta (version) VALUES (?1)", params![SCHEMA_VERSION])
                .map_err(db_err)?;
            tx.execute_batch(
                "CREATE TABLE IF NOT EXISTS workflow_trees (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    tree_key TEXT NOT NULL,
                    version INTEGER NOT NULL,
                    status TEXT NOT NULL,
                    name TEXT NOT NULL,
                    draft_revision INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    UNIQUE (tree_key, version)
                );
                CREATE TABLE IF NOT EXISTS prompt_templates (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    tree_id INTEGER NOT NULL
                        REFERENCES workflow_trees(id) ON DELETE CASCADE,
                    name TEXT NOT NULL,
                    content_type TEXT,
                    body TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );
                CREATE TABLE IF NOT EXISTS guard_definitions (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    tree_id INTEGER NOT NULL
                        REFERENCES workflow_trees(id) ON DELETE CASCADE,
                    expression TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );
                CREATE TABLE IF NOT EXISTS tree_nodes (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    tree_id INTEGER NOT NULL
                        REFERENCES workflow_trees(id) ON DELETE CASCADE,
                    node_key TEXT NOT NULL,
                    node_type TEXT NOT NULL,
                    node_role TEXT NOT NULL,
                    provider TEXT,
                    model TEXT,
                    execution_permissions TEXT,
                    prompt_template_id INTEGER REFERENCES prompt_templates(id),
                    max_retries INTEGER NOT NULL DEFAULT 0,
                    sequence_index INTEGER NOT NULL,
                    position_x REAL,
                    position_y REAL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    UNIQUE (tree_id, node_key)
                );
                CREATE TABLE IF NOT EXISTS tree_edges (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    tree_id INTEGER NOT NULL
                        REFERENCES workflow_trees(id) ON DELETE CASCADE,
                    source_node_id INTEGER NOT NULL
                        REFERENCES tree_nodes(id) ON DELETE CASCADE,
                    target_node_id INTEGER NOT NULL
                        REFERENCES tree_nodes(id) ON DELETE CASCADE,
                    priority INTEGER NOT NULL,
                    auto INTEGER NOT NULL,
                    guard_definition_id INTEGER REFERENCES guard_definitions(id),
                    route_on TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    UNIQUE (source_node_id, route_on, priority)
                );
                CREATE TABLE IF NOT EXISTS workflow_runs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    tree_id INTEGER NOT NULL REFERENCES workflow_trees(id),
                    status TEXT NOT NULL,
                    started_at TEXT,
                    completed_at TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );
                CREATE TABLE IF NOT EXISTS run_nodes (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    run_id INTEGER NOT NULL
                        REFERENCES workflow_runs(id) ON DELETE CASCADE,
                    tree_node_id INTEGER NOT NULL REFERENCES tree_nodes(id),
                    node_key TEXT NOT NULL,
                    status TEXT NOT NULL,
                    attempt INTEGER NOT NULL DEFAULT 1,
                    sequence_index INTEGER NOT NULL,
                    started_at TEXT,
                    completed_at TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    UNIQUE (run_id, tree_node_id)
                );
                CREATE INDEX IF NOT EXISTS idx_run_nodes_run ON run_nodes (run_id);
                CREATE TABLE IF NOT EXISTS phase_artifacts (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    run_id INTEGER NOT NULL
                        REFERENCES workflow_runs(id) ON DELETE CASCADE,
                    run_node_id INTEGER NOT NULL
                        REFERENCES run_nodes(id) ON DELETE CASCADE,
                    artifact_type TEXT NOT NULL,
                    content_type TEXT NOT NULL,
                    content TEXT NOT NULL,
                    metadata TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_phase_artifacts_run
                    ON phase_artifacts (run_id, run_node_id, id);
                CREATE TABLE IF NOT EXISTS routing_decisions (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    run_id INTEGER NOT NULL
                        REFERENCES workflow_runs(id) ON DELETE CASCADE,
                    run_node_id INTEGER NOT NULL
                        REFERENCES run_nodes(id) ON DELETE CASCADE,
                    decision TEXT NOT NULL,
                    rationale TEXT,
                    attempt INTEGER,
                    raw_output TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_routing_decisions_run
                    ON routing_decisions (run_id, run_node_id, created_at, id);
                CREATE TABLE IF NOT EXISTS run_node_diagnostics (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    run_id INTEGER NOT NULL
                        REFERENCES workflow_runs(id) ON DELETE CASCADE,
                    run_node_id INTEGER NOT NULL
                        REFERENCES run_nodes(id) ON DELETE CASCADE,
                    attempt INTEGER NOT NULL,
                    outcome TEXT NOT NULL,
                    counts TEXT NOT NULL,
                    redacted INTEGER NOT NULL,
                    truncated INTEGER NOT NULL,
                    payload_chars INTEGER NOT NULL,
                    diagnostics TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    UNIQUE (run_id, run_node_id, attempt)
                );
                CREATE TABLE IF NOT EXISTS run_node_stream_events (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    run_id INTEGER NOT NULL
                        REFERENCES workflow_runs(id) ON DELETE CASCADE,
                    run_node_id INTEGER NOT NULL
                        REFERENCES run_nodes(id) ON DELETE CASCADE,
                    attempt INTEGER NOT NULL,
                    sequence INTEGER NOT NULL,
                    event_type TEXT NOT NULL,
                    timestamp TEXT NOT NULL,
                    content_chars INTEGER NOT NULL,
                    content_preview TEXT,
                    metadata TEXT,
                    usage_delta_tokens INTEGER,
                    usage_cumulative_tokens INTEGER,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    UNIQUE (run_node_id, attempt, sequence)
                );
                CREATE TABLE IF NOT EXISTS run_worktrees (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    run_id INTEGER NOT NULL
                        REFERENCES workflow_runs(id) ON DELETE CASCADE,
                    path TEXT NOT NULL,
                    status TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );",
            )
            .map_err(db_err)?;
        }
        Some(value) if value == SCHEMA_VERSION => {}
        Some(value) => {
            return Err(StoreError::Invalid(format!("unsupported schema version: {value}")));
        }
    }
    tx.commit().map_err(db_err)
}

// ============================================================================
// SECTION: Error Helpers
// ============================================================================

/// Maps a `rusqlite` error onto the store taxonomy.
fn db_err(err: rusqlite::Error) -> StoreError {
    if let rusqlite::Error::SqliteFailure(failure, _) = &err
        && failure.code == ErrorCode::ConstraintViolation
    {
        return StoreError::Conflict(err.to_string());
    }
    StoreError::Db(err.to_string())
}

/// Parses a stored status TEXT column.
fn parse_run_status(value: &str) -> Result<RunStatus, StoreError> {
    RunStatus::parse(value)
        .ok_or_else(|| StoreError::Invalid(format!("unknown run status: {value}")))
}

/// Parses a stored node status TEXT column.
fn parse_node_status(value: &str) -> Result<NodeStatus, StoreError> {
    NodeStatus::parse(value)
        .ok_or_else(|| StoreError::Invalid(format!("unknown node status: {value}")))
}

/// Parses a stored timestamp TEXT column.
fn parse_timestamp(value: &str) -> Result<Timestamp, StoreError> {
    Timestamp::parse_rfc3339(value)
        .ok_or_else(|| StoreError::Invalid(format!("malformed timestamp: {value}")))
}

/// Parses an optional stored timestamp TEXT column.
fn parse_timestamp_opt(value: Option<String>) -> Result<Option<Timestamp>, StoreError> {
    value.as_deref().map(parse_timestamp).transpose()
}

/// Converts a rowid column into a typed identifier.
fn typed_id<T>(raw: i64, build: fn(i64) -> Option<T>, label: &str) -> Result<T, StoreError> {
    build(raw).ok_or_else(|| StoreError::Invalid(format!("non-positive {label} rowid: {raw}")))
}

/// Parses a JSON column defensively (malformed blobs become null).
fn parse_json_lenient(value: Option<String>) -> Value {
    value.and_then(|text| serde_json::from_str(&text).ok()).unwrap_or(Value::Null)
}

// ============================================================================
// SECTION: Row Mapping
// ============================================================================

/// Raw workflow tree row.
struct TreeRow {
    /// Rowid.
    id: i64,
    /// Tree key.
    tree_key: String,
    /// Version number.
    version: i64,
    /// Status TEXT.
    status: String,
    /// Display name.
    name: String,
    /// Draft revision counter.
    draft_revision: i64,
    /// Creation stamp TEXT.
    created_at: String,
    /// Update stamp TEXT.
    updated_at: String,
}

impl TreeRow {
    /// Reads the row from a query result.
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            tree_key: row.get(1)?,
            version: row.get(2)?,
            status: row.get(3)?,
            name: row.get(4)?,
            draft_revision: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
        })
    }

    /// Converts into the core record.
    fn into_tree(self) -> Result<WorkflowTree, StoreError> {
        Ok(WorkflowTree {
            id: typed_id(self.id, TreeId::from_raw, "tree")?,
            status: TreeStatus::parse(&self.status)
                .ok_or_else(|| StoreError::Invalid(format!("unknown tree status: {}", self.status)))?,
            tree_key: self.tree_key,
            version: self.version,
            name: self.name,
            draft_revision: self.draft_revision,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
        })
    }
}

/// Column list shared by tree queries.
const TREE_COLUMNS: &str =
    "id, tree_key, version, status, name, draft_revision, created_at, updated_at";

/// Raw run row.
struct RunRow {
    /// Rowid.
    id: i64,
    /// Owning tree rowid.
    tree_id: i64,
    /// Status TEXT.
    status: String,
    /// Start stamp TEXT.
    started_at: Option<String>,
    /// Completion stamp TEXT.
    completed_at: Option<String>,
    /// Creation stamp TEXT.
    created_at: String,
    /// Update stamp TEXT.
    updated_at: String,
}

impl RunRow {
    /// Reads the row from a query result.
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            tree_id: row.get(1)?,
            status: row.get(2)?,
            started_at: row.get(3)?,
            completed_at: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
        })
    }

    /// Converts into the core record.
    fn into_run(self) -> Result<WorkflowRun, StoreError> {
        Ok(WorkflowRun {
            id: typed_id(self.id, RunId::from_raw, "run")?,
            tree_id: typed_id(self.tree_id, TreeId::from_raw, "tree")?,
            status: parse_run_status(&self.status)?,
            started_at: parse_timestamp_opt(self.started_at)?,
            completed_at: parse_timestamp_opt(self.completed_at)?,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
        })
    }
}

/// Column list shared by run queries.
const RUN_COLUMNS: &str = "id, tree_id, status, started_at, completed_at, created_at, updated_at";

/// Raw run-node row.
struct RunNodeRow {
    /// Rowid.
    id: i64,
    /// Owning run rowid.
    run_id: i64,
    /// Instantiated tree node rowid.
    tree_node_id: i64,
    /// Node key.
    node_key: String,
    /// Status TEXT.
    status: String,
    /// Attempt counter.
    attempt: i64,
    /// Ordering index.
    sequence_index: i64,
    /// Start stamp TEXT.
    started_at: Option<String>,
    /// Completion stamp TEXT.
    completed_at: Option<String>,
    /// Update stamp TEXT.
    updated_at: String,
}

impl RunNodeRow {
    /// Reads the row from a query result.
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            run_id: row.get(1)?,
            tree_node_id: row.get(2)?,
            node_key: row.get(3)?,
            status: row.get(4)?,
            attempt: row.get(5)?,
            sequence_index: row.get(6)?,
            started_at: row.get(7)?,
            completed_at: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }

    /// Converts into the core record.
    fn into_run_node(self) -> Result<RunNode, StoreError> {
        Ok(RunNode {
            id: typed_id(self.id, RunNodeId::from_raw, "run node")?,
            run_id: typed_id(self.run_id, RunId::from_raw, "run")?,
            tree_node_id: typed_id(self.tree_node_id, TreeNodeId::from_raw, "tree node")?,
            node_key: self.node_key,
            status: parse_node_status(&self.status)?,
            attempt: self.attempt,
            sequence_index: self.sequence_index,
            started_at: parse_timestamp_opt(self.started_at)?,
            completed_at: parse_timestamp_opt(self.completed_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
        })
    }
}

/// Column list shared by run-node queries.
const RUN_NODE_COLUMNS: &str = "id, run_id, tree_node_id, node_key, status, attempt, \
                                sequence_index, started_at, completed_at, updated_at";

/// Raw routing decision row.
struct DecisionRow {
    /// Rowid.
    id: i64,
    /// Owning run rowid.
    run_id: i64,
    /// Deciding run-node rowid.
    run_node_id: i64,
    /// Decision TEXT.
    decision: String,
    /// Optional rationale.
    rationale: Option<String>,
    /// Recorded attempt (NULL on historical rows).
    attempt: Option<i64>,
    /// Raw provider output JSON.
    raw_output: Option<String>,
    /// Creation stamp TEXT.
    created_at: String,
}

impl DecisionRow {
    /// Reads the row from a query result.
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            run_id: row.get(1)?,
            run_node_id: row.get(2)?,
            decision: row.get(3)?,
            rationale: row.get(4)?,
            attempt: row.get(5)?,
            raw_output: row.get(6)?,
            created_at: row.get(7)?,
        })
    }

    /// Converts into the core record.
    fn into_decision(self) -> Result<RoutingDecision, StoreError> {
        Ok(RoutingDecision {
            id: typed_id(self.id, DecisionId::from_raw, "decision")?,
            run_id: typed_id(self.run_id, RunId::from_raw, "run")?,
            run_node_id: typed_id(self.run_node_id, RunNodeId::from_raw, "run node")?,
            decision: DecisionSignal::parse(&self.decision).ok_or_else(|| {
                StoreError::Invalid(format!("unknown decision signal: {}", self.decision))
            })?,
            rationale: self.rationale,
            attempt: self.attempt,
            raw_output: self
                .raw_output
                .map(|text| parse_json_lenient(Some(text)))
                .filter(|value| !value.is_null()),
            created_at: parse_timestamp(&self.created_at)?,
        })
    }
}

// ============================================================================
// SECTION: WorkflowStore Implementation
// ============================================================================

impl WorkflowStore for SqliteWorkflowStore {
    fn load_tree(&self, tree_id: TreeId) -> Result<Option<WorkflowTree>, StoreError> {
        let connection = self.lock()?;
        let row = connection
            .query_row(
                &format!("SELECT {TREE_COLUMNS} FROM workflow_trees WHERE id = ?1"),
                params![tree_id.get()],
                TreeRow::from_row,
            )
            .optional()
            .map_err(db_err)?;
        row.map(TreeRow::into_tree).transpose()
    }

    fn find_latest_published_tree(
        &self,
        tree_key: &str,
    ) -> Result<Option<WorkflowTree>, StoreError> {
        let connection = self.lock()?;
        let row = connection
            .query_row(
                &format!(
                    "SELECT {TREE_COLUMNS} FROM workflow_trees \
                     WHERE tree_key = ?1 AND status = 'published' \
                     ORDER BY version DESC LIMIT 1"
                ),
                params![tree_key],
                TreeRow::from_row,
            )
            .optional()
            .map_err(db_err)?;
        row.map(TreeRow::into_tree).transpose()
    }

    fn load_tree_nodes(&self, tree_id: TreeId) -> Result<Vec<TreeNode>, StoreError> {
        let connection = self.lock()?;
        let mut statement = connection
            .prepare(
                "SELECT id, tree_id, node_key, node_type, node_role, provider, model, \
                 execution_permissions, prompt_template_id, max_retries, sequence_index, \
                 position_x, position_y \
                 FROM tree_nodes WHERE tree_id = ?1 \
                 ORDER BY sequence_index, node_key, id",
            )
            .map_err(db_err)?;
        let rows = statement
            .query_map(params![tree_id.get()], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, Option<String>>(7)?,
                    row.get::<_, Option<i64>>(8)?,
                    row.get::<_, i64>(9)?,
                    row.get::<_, i64>(10)?,
                    row.get::<_, Option<f64>>(11)?,
                    row.get::<_, Option<f64>>(12)?,
                ))
            })
            .map_err(db_err)?;
        let mut nodes = Vec::new();
        for row in rows {
            let (
                id,
                tree_raw,
                node_key,
                node_type,
                node_role,
                provider,
                model,
                permissions,
                template_id,
                max_retries,
                sequence_index,
                position_x,
                position_y,
            ) = row.map_err(db_err)?;
            let execution_permissions: Option<ExecutionPermissions> = permissions
                .as_deref()
                .map(serde_json::from_str)
                .transpose()
                .map_err(|err| StoreError::Invalid(format!("execution_permissions: {err}")))?;
            nodes.push(TreeNode {
                id: typed_id(id, TreeNodeId::from_raw, "tree node")?,
                tree_id: typed_id(tree_raw, TreeId::from_raw, "tree")?,
                node_type: NodeType::parse(&node_type).ok_or_else(|| {
                    StoreError::Invalid(format!("unknown node type: {node_type}"))
                })?,
                node_role: NodeRole::parse(&node_role).ok_or_else(|| {
                    StoreError::Invalid(format!("unknown node role: {node_role}"))
                })?,
                node_key,
                provider,
                model,
                execution_permissions,
                prompt_template_id: template_id
                    .map(|raw| typed_id(raw, PromptTemplateId::from_raw, "prompt template"))
                    .transpose()?,
                max_retries,
                sequence_index,
                position: match (position_x, position_y) {
                    (Some(x), Some(y)) => Some(NodePosition {
                        x,
                        y,
                    }),
                    _ => None,
                },
            });
        }
        Ok(nodes)
    }

    fn load_tree_edges(&self, tree_id: TreeId) -> Result<Vec<TreeEdge>, StoreError> {
        let connection = self.lock()?;
        let mut statement = connection
            .prepare(
                "SELECT id, tree_id, source_node_id, target_node_id, priority, auto, \
                 guard_definition_id, route_on \
                 FROM tree_edges WHERE tree_id = ?1 \
                 ORDER BY priority, target_node_id, id",
            )
            .map_err(db_err)?;
        let rows = statement
            .query_map(params![tree_id.get()], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, Option<i64>>(6)?,
                    row.get::<_, String>(7)?,
                ))
            })
            .map_err(db_err)?;
        let mut edges = Vec::new();
        for row in rows {
            let (id, tree_raw, source, target, priority, auto, guard, route_on) =
                row.map_err(db_err)?;
            edges.push(TreeEdge {
                id: typed_id(id, EdgeId::from_raw, "edge")?,
                tree_id: typed_id(tree_raw, TreeId::from_raw, "tree")?,
                source_node_id: typed_id(source, TreeNodeId::from_raw, "tree node")?,
                target_node_id: typed_id(target, TreeNodeId::from_raw, "tree node")?,
                priority,
                auto: auto != 0,
                guard_definition_id: guard
                    .map(|raw| typed_id(raw, GuardId::from_raw, "guard"))
                    .transpose()?,
                route_on: RouteOn::parse(&route_on).ok_or_else(|| {
                    StoreError::Invalid(format!("unknown route lane: {route_on}"))
                })?,
            });
        }
        Ok(edges)
    }

    fn load_guard(&self, guard_id: GuardId) -> Result<Option<GuardDefinition>, StoreError> {
        let connection = self.lock()?;
        let expression: Option<String> = connection
            .query_row(
                "SELECT expression FROM guard_definitions WHERE id = ?1",
                params![guard_id.get()],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        expression
            .map(|text| {
                let expression = parse_guard_expression(&text)
                    .map_err(|err| StoreError::Invalid(err.to_string()))?;
                Ok(GuardDefinition {
                    id: guard_id,
                    expression,
                })
            })
            .transpose()
    }

    fn load_prompt_template(
        &self,
        template_id: PromptTemplateId,
    ) -> Result<Option<PromptTemplate>, StoreError> {
        let connection = self.lock()?;
        connection
            .query_row(
                "SELECT name, content_type, body FROM prompt_templates WHERE id = ?1",
                params![template_id.get()],
                |row| {
                    Ok(PromptTemplate {
                        id: template_id,
                        name: row.get(0)?,
                        content_type: row.get(1)?,
                        body: row.get(2)?,
                    })
                },
            )
            .optional()
            .map_err(db_err)
    }

    fn create_draft_tree(&self, tree_key: &str, name: &str) -> Result<WorkflowTree, StoreError> {
        let mut connection = self.lock()?;
        let now = self.now_text();
        let tx = connection.transaction().map_err(db_err)?;
        let draft_exists: Option<i64> = tx
            .query_row(
                "SELECT id FROM workflow_trees WHERE tree_key = ?1 AND status = 'draft' LIMIT 1",
                params![tree_key],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        if draft_exists.is_some() {
            return Err(StoreError::Conflict(format!(
                "a draft already exists for tree key {tree_key}"
            )));
        }
        let next_version: i64 = tx
            .query_row(
                "SELECT COALESCE(MAX(version), 0) + 1 FROM workflow_trees WHERE tree_key = ?1",
                params![tree_key],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        tx.execute(
            "INSERT INTO workflow_trees \
             (tree_key, version, status, name, draft_revision, created_at, updated_at) \
             VALUES (?1, ?2, 'draft', ?3, 0, ?4, ?4)",
            params![tree_key, next_version, name, now],
        )
        .map_err(db_err)?;
        let id = tx.last_insert_rowid();
        tx.commit().map_err(db_err)?;
        Ok(WorkflowTree {
            id: typed_id(id, TreeId::from_raw, "tree")?,
            tree_key: tree_key.to_string(),
            version: next_version,
            status: TreeStatus::Draft,
            name: name.to_string(),
            draft_revision: 0,
            created_at: parse_timestamp(&now)?,
            updated_at: parse_timestamp(&now)?,
        })
    }

    fn save_draft_tree(
        &self,
        tree_id: TreeId,
        expected_revision: i64,
        definition: &TreeDefinition,
    ) -> Result<i64, StoreError> {
        validate_definition(definition)?;
        let mut connection = self.lock()?;
        let now = self.now_text();
        let tx = connection.transaction().map_err(db_err)?;
        let (status, revision): (String, i64) = tx
            .query_row(
                "SELECT status, draft_revision FROM workflow_trees WHERE id = ?1",
                params![tree_id.get()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(db_err)?
            .ok_or_else(|| StoreError::NotFound(format!("workflow tree {tree_id}")))?;
        if status != "draft" {
            return Err(StoreError::Invalid(format!("tree {tree_id} is not a draft")));
        }
        if revision != expected_revision {
            return Err(StoreError::Conflict(format!(
                "draft revision mismatch on tree {tree_id}: expected {expected_revision}, \
                 stored {revision}"
            )));
        }

        tx.execute("DELETE FROM tree_edges WHERE tree_id = ?1", params![tree_id.get()])
            .map_err(db_err)?;
        tx.execute("DELETE FROM tree_nodes WHERE tree_id = ?1", params![tree_id.get()])
            .map_err(db_err)?;
        tx.execute("DELETE FROM guard_definitions WHERE tree_id = ?1", params![tree_id.get()])
            .map_err(db_err)?;
        tx.execute("DELETE FROM prompt_templates WHERE tree_id = ?1", params![tree_id.get()])
            .map_err(db_err)?;

        let mut template_ids = Vec::with_capacity(definition.templates.len());
        for template in &definition.templates {
            tx.execute(
                "INSERT INTO prompt_templates \
                 (tree_id, name, content_type, body, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                params![tree_id.get(), template.name, template.content_type, template.body, now],
            )
            .map_err(db_err)?;
            template_ids.push(tx.last_insert_rowid());
        }
        let mut guard_ids = Vec::with_capacity(definition.guards.len());
        for expression in &definition.guards {
            let rendered = serde_json::to_string(expression)
                .map_err(|err| StoreError::Invalid(err.to_string()))?;
            tx.execute(
                "INSERT INTO guard_definitions (tree_id, expression, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?3)",
                params![tree_id.get(), rendered, now],
            )
            .map_err(db_err)?;
            guard_ids.push(tx.last_insert_rowid());
        }
        let mut node_ids: std::collections::BTreeMap<&str, i64> = std::collections::BTreeMap::new();
        for node in &definition.nodes {
            let permissions = node
                .execution_permissions
                .as_ref()
                .map(serde_json::to_string)
                .transpose()
                .map_err(|err| StoreError::Invalid(err.to_string()))?;
            let template_id = node.template_index.and_then(|index| template_ids.get(index).copied());
            tx.execute(
                "INSERT INTO tree_nodes \
                 (tree_id, node_key, node_type, node_role, provider, model, \
                  execution_permissions, prompt_template_id, max_retries, sequence_index, \
                  created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)",
                params![
                    tree_id.get(),
                    node.node_key,
                    node.node_type.as_str(),
                    node.node_role.as_str(),
                    node.provider,
                    node.model,
                    permissions,
                    template_id,
                    node.max_retries,
                    node.sequence_index,
                    now
                ],
            )
            .map_err(db_err)?;
            node_ids.insert(node.node_key.as_str(), tx.last_insert_rowid());
        }
        for edge in &definition.edges {
            let source = node_ids.get(edge.source_node_key.as_str()).copied().ok_or_else(|| {
                StoreError::Invalid(format!("unknown source node {}", edge.source_node_key))
            })?;
            let target = node_ids.get(edge.target_node_key.as_str()).copied().ok_or_else(|| {
                StoreError::Invalid(format!("unknown target node {}", edge.target_node_key))
            })?;
            let guard_id = edge.guard_index.and_then(|index| guard_ids.get(index).copied());
            tx.execute(
                "INSERT INTO tree_edges \
                 (tree_id, source_node_id, target_node_id, priority, auto, \
                  guard_definition_id, route_on, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
                params![
                    tree_id.get(),
                    source,
                    target,
                    edge.priority,
                    i64::from(edge.auto),
                    guard_id,
                    edge.route_on.as_str(),
                    now
                ],
            )
            .map_err(db_err)?;
        }

        let changed = tx
            .execute(
                "UPDATE workflow_trees \
                 SET draft_revision = draft_revision + 1, updated_at = ?3 \
                 WHERE id = ?1 AND draft_revision = ?2 AND status = 'draft'",
                params![tree_id.get(), expected_revision, now],
            )
            .map_err(db_err)?;
        if changed != 1 {
            return Err(StoreError::Conflict(format!(
                "draft revision raced on tree {tree_id}"
            )));
        }
        tx.commit().map_err(db_err)?;
        Ok(expected_revision + 1)
    }

    fn publish_draft_tree(
        &self,
        tree_id: TreeId,
        expected_revision: i64,
    ) -> Result<i64, StoreError> {
        let mut connection = self.lock()?;
        let now = self.now_text();
        let tx = connection.transaction().map_err(db_err)?;
        let (tree_key, status, revision): (String, String, i64) = tx
            .query_row(
                "SELECT tree_key, status, draft_revision FROM workflow_trees WHERE id = ?1",
                params![tree_id.get()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
            .map_err(db_err)?
            .ok_or_else(|| StoreError::NotFound(format!("workflow tree {tree_id}")))?;
        if status != "draft" {
            return Err(StoreError::Invalid(format!("tree {tree_id} is not a draft")));
        }
        if revision != expected_revision {
            return Err(StoreError::Conflict(format!(
                "draft revision mismatch on tree {tree_id}: expected {expected_revision}, \
                 stored {revision}"
            )));
        }
        let version: i64 = tx
            .query_row(
                "SELECT COALESCE(MAX(version), 0) + 1 FROM workflow_trees \
                 WHERE tree_key = ?1 AND status = 'published'",
                params![tree_key],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        let changed = tx
            .execute(
                "UPDATE workflow_trees \
                 SET version = ?2, status = 'published', draft_revision = 0, updated_at = ?4 \
                 WHERE id = ?1 AND draft_revision = ?3 AND status = 'draft'",
                params![tree_id.get(), version, expected_revision, now],
            )
            .map_err(db_err)?;
        if changed != 1 {
            return Err(StoreError::Conflict(format!(
                "draft revision raced on tree {tree_id}"
            )));
        }
        tx.commit().map_err(db_err)?;
        Ok(version)
    }

    fn load_run(&self, run_id: RunId) -> Result<Option<WorkflowRun>, StoreError> {
        let connection = self.lock()?;
        let row = connection
            .query_row(
                &format!("SELECT {RUN_COLUMNS} FROM workflow_runs WHERE id = ?1"),
                params![run_id.get()],
                RunRow::from_row,
            )
            .optional()
            .map_err(db_err)?;
        row.map(RunRow::into_run).transpose()
    }

    fn list_runs(&self) -> Result<Vec<WorkflowRun>, StoreError> {
        let connection = self.lock()?;
        let mut statement = connection
            .prepare(&format!("SELECT {RUN_COLUMNS} FROM workflow_runs ORDER BY id"))
            .map_err(db_err)?;
        let rows = statement.query_map(params![], RunRow::from_row).map_err(db_err)?;
        let mut runs = Vec::new();
        for row in rows {
            runs.push(row.map_err(db_err)?.into_run()?);
        }
        Ok(runs)
    }

    fn create_run_with_nodes(
        &self,
        tree_id: TreeId,
        nodes: &[NewRunNode],
    ) -> Result<RunId, StoreError> {
        let mut connection = self.lock()?;
        let now = self.now_text();
        let tx = connection.transaction().map_err(db_err)?;
        tx.execute(
            "INSERT INTO workflow_runs (tree_id, status, created_at, updated_at) \
             VALUES (?1, 'pending', ?2, ?2)",
            params![tree_id.get(), now],
        )
        .map_err(db_err)?;
        let run_raw = tx.last_insert_rowid();
        for node in nodes {
            tx.execute(
                "INSERT INTO run_nodes \
                 (run_id, tree_node_id, node_key, status, attempt, sequence_index, \
                  created_at, updated_at) \
                 VALUES (?1, ?2, ?3, 'pending', 1, ?4, ?5, ?5)",
                params![run_raw, node.tree_node_id.get(), node.node_key, node.sequence_index, now],
            )
            .map_err(db_err)?;
        }
        tx.commit().map_err(db_err)?;
        typed_id(run_raw, RunId::from_raw, "run")
    }

    fn transition_run(
        &self,
        run_id: RunId,
        expected_status: RunStatus,
        new_status: RunStatus,
    ) -> Result<(), StoreError> {
        if !expected_status.can_transition_to(new_status) {
            return Err(StoreError::Invalid(format!(
                "run transition {expected_status} -> {new_status} is not allowed"
            )));
        }
        let connection = self.lock()?;
        let now = self.now_text();
        let changed = connection
            .execute(
                "UPDATE workflow_runs SET status = ?2, updated_at = ?3, \
                 started_at = CASE WHEN ?2 = 'running' AND started_at IS NULL \
                     THEN ?3 ELSE started_at END, \
                 completed_at = CASE WHEN ?2 IN ('completed', 'failed', 'cancelled') \
                     THEN ?3 ELSE completed_at END \
                 WHERE id = ?1 AND status = ?4",
                params![run_id.get(), new_status.as_str(), now, expected_status.as_str()],
            )
            .map_err(db_err)?;
        if changed != 1 {
            return Err(StoreError::Precondition {
                entity: "workflow_run".to_string(),
                detail: format!("run {run_id}: expected {expected_status}"),
            });
        }
        Ok(())
    }

    fn load_run_nodes(&self, run_id: RunId) -> Result<Vec<RunNode>, StoreError> {
        let connection = self.lock()?;
        let mut statement = connection
            .prepare(&format!(
                "SELECT {RUN_NODE_COLUMNS} FROM run_nodes WHERE run_id = ?1 ORDER BY id"
            ))
            .map_err(db_err)?;
        let rows = statement.query_map(params![run_id.get()], RunNodeRow::from_row).map_err(db_err)?;
        let mut nodes = Vec::new();
        for row in rows {
            nodes.push(row.map_err(db_err)?.into_run_node()?);
        }
        Ok(nodes)
    }

    fn load_run_node(&self, run_node_id: RunNodeId) -> Result<Option<RunNode>, StoreError> {
        let connection = self.lock()?;
        let row = connection
            .query_row(
                &format!("SELECT {RUN_NODE_COLUMNS} FROM run_nodes WHERE id = ?1"),
                params![run_node_id.get()],
                RunNodeRow::from_row,
            )
            .optional()
            .map_err(db_err)?;
        row.map(RunNodeRow::into_run_node).transpose()
    }

    fn transition_node(&self, transition: &NodeTransition) -> Result<(), StoreError> {
        if !transition.expected_status.can_transition_to(transition.new_status) {
            return Err(StoreError::Invalid(format!(
                "node transition {} -> {} is not allowed",
                transition.expected_status, transition.new_status
            )));
        }
        let connection = self.lock()?;
        let now = self.now_text();
        let started_fragment = match transition.started_at {
            TimestampAction::Keep => "",
            TimestampAction::SetNow => ", started_at = ?3",
            TimestampAction::Clear => ", started_at = NULL",
        };
        let completed_fragment = match transition.completed_at {
            TimestampAction::Keep => "",
            TimestampAction::SetNow => ", completed_at = ?3",
            TimestampAction::Clear => ", completed_at = NULL",
        };
        let attempt_fragment =
            if transition.increment_attempt { ", attempt = attempt + 1" } else { "" };
        let statement = format!(
            "UPDATE run_nodes SET status = ?2, updated_at = ?3{attempt_fragment}\
             {started_fragment}{completed_fragment} \
             WHERE id = ?1 AND status = ?4 AND attempt = ?5"
        );
        let changed = connection
            .execute(
                &statement,
                params![
                    transition.run_node_id.get(),
                    transition.new_status.as_str(),
                    now,
                    transition.expected_status.as_str(),
                    transition.expected_attempt
                ],
            )
            .map_err(db_err)?;
        if changed != 1 {
            return Err(StoreError::Precondition {
                entity: "run_node".to_string(),
                detail: format!(
                    "node {}: expected {}/{}",
                    transition.run_node_id,
                    transition.expected_status,
                    transition.expected_attempt
                ),
            });
        }
        Ok(())
    }

    fn requeue_failed_nodes(&self, run_id: RunId) -> Result<Vec<RunNodeId>, StoreError> {
        let mut connection = self.lock()?;
        let now = self.now_text();
        let tx = connection.transaction().map_err(db_err)?;
        let status: String = tx
            .query_row(
                "SELECT status FROM workflow_runs WHERE id = ?1",
                params![run_id.get()],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?
            .ok_or_else(|| StoreError::NotFound(format!("workflow run {run_id}")))?;
        if status != "failed" {
            return Err(StoreError::Precondition {
                entity: "workflow_run".to_string(),
                detail: format!("run {run_id}: expected failed, observed {status}"),
            });
        }
        let failed = collect_failed_node_ids(&tx, run_id)?;
        if failed.is_empty() {
            return Ok(Vec::new());
        }
        for raw in &failed {
            tx.execute(
                "UPDATE run_nodes SET status = 'pending', attempt = attempt + 1, \
                 started_at = NULL, completed_at = NULL, updated_at = ?2 \
                 WHERE id = ?1 AND status = 'failed'",
                params![raw, now],
            )
            .map_err(db_err)?;
        }
        let changed = tx
            .execute(
                "UPDATE workflow_runs SET status = 'running', completed_at = NULL, \
                 updated_at = ?2 WHERE id = ?1 AND status = 'failed'",
                params![run_id.get(), now],
            )
            .map_err(db_err)?;
        if changed != 1 {
            return Err(StoreError::Precondition {
                entity: "workflow_run".to_string(),
                detail: format!("run {run_id}: lost the failed -> running race"),
            });
        }
        tx.commit().map_err(db_err)?;
        failed
            .into_iter()
            .map(|raw| typed_id(raw, RunNodeId::from_raw, "run node"))
            .collect()
    }

    fn insert_artifact(&self, artifact: &NewArtifact) -> Result<ArtifactId, StoreError> {
        let connection = self.lock()?;
        let now = self.now_text();
        connection
            .execute(
                "INSERT INTO phase_artifacts \
                 (run_id, run_node_id, artifact_type, content_type, content, metadata, \
                  created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
                params![
                    artifact.run_id.get(),
                    artifact.run_node_id.get(),
                    artifact.artifact_type.as_str(),
                    artifact.content_type.as_str(),
                    artifact.content,
                    artifact.metadata.to_string(),
                    now
                ],
            )
            .map_err(db_err)?;
        typed_id(connection.last_insert_rowid(), ArtifactId::from_raw, "artifact")
    }

    fn load_artifacts(&self, run_id: RunId) -> Result<Vec<PhaseArtifact>, StoreError> {
        let connection = self.lock()?;
        let mut statement = connection
            .prepare(
                "SELECT id, run_id, run_node_id, artifact_type, content_type, content, \
                 metadata, created_at FROM phase_artifacts WHERE run_id = ?1 ORDER BY id",
            )
            .map_err(db_err)?;
        let rows = statement
            .query_map(params![run_id.get()], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, String>(7)?,
                ))
            })
            .map_err(db_err)?;
        let mut artifacts = Vec::new();
        for row in rows {
            let (id, run_raw, node_raw, artifact_type, content_type, content, metadata, created) =
                row.map_err(db_err)?;
            artifacts.push(PhaseArtifact {
                id: typed_id(id, ArtifactId::from_raw, "artifact")?,
                run_id: typed_id(run_raw, RunId::from_raw, "run")?,
                run_node_id: typed_id(node_raw, RunNodeId::from_raw, "run node")?,
                artifact_type: ArtifactType::parse(&artifact_type).ok_or_else(|| {
                    StoreError::Invalid(format!("unknown artifact type: {artifact_type}"))
                })?,
                content_type: ContentType::parse(&content_type).ok_or_else(|| {
                    StoreError::Invalid(format!("unknown content type: {content_type}"))
                })?,
                content,
                metadata: parse_json_lenient(metadata),
                created_at: parse_timestamp(&created)?,
            });
        }
        Ok(artifacts)
    }

    fn latest_artifacts_by_run_node(
        &self,
        run_id: RunId,
    ) -> Result<Vec<LatestArtifact>, StoreError> {
        let connection = self.lock()?;
        let mut statement = connection
            .prepare(
                "SELECT p.run_node_id, p.id, p.created_at \
                 FROM phase_artifacts p \
                 JOIN (SELECT run_node_id, MAX(id) AS latest_id FROM phase_artifacts \
                       WHERE run_id = ?1 GROUP BY run_node_id) latest \
                   ON p.id = latest.latest_id \
                 ORDER BY p.run_node_id",
            )
            .map_err(db_err)?;
        let rows = statement
            .query_map(params![run_id.get()], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?, row.get::<_, String>(2)?))
            })
            .map_err(db_err)?;
        let mut latest = Vec::new();
        for row in rows {
            let (node_raw, artifact_raw, created) = row.map_err(db_err)?;
            latest.push(LatestArtifact {
                run_node_id: typed_id(node_raw, RunNodeId::from_raw, "run node")?,
                artifact_id: typed_id(artifact_raw, ArtifactId::from_raw, "artifact")?,
                created_at: parse_timestamp(&created)?,
            });
        }
        Ok(latest)
    }

    fn insert_routing_decision(
        &self,
        decision: &NewRoutingDecision,
    ) -> Result<DecisionId, StoreError> {
        let connection = self.lock()?;
        let now = self.now_text();
        connection
            .execute(
                "INSERT INTO routing_decisions \
                 (run_id, run_node_id, decision, rationale, attempt, raw_output, \
                  created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
                params![
                    decision.run_id.get(),
                    decision.run_node_id.get(),
                    decision.decision.as_str(),
                    decision.rationale,
                    decision.attempt,
                    decision.raw_output.as_ref().map(ToString::to_string),
                    now
                ],
            )
            .map_err(db_err)?;
        typed_id(connection.last_insert_rowid(), DecisionId::from_raw, "decision")
    }

    fn latest_routing_decisions(&self, run_id: RunId) -> Result<Vec<RoutingDecision>, StoreError> {
        let connection = self.lock()?;
        let mut statement = connection
            .prepare(
                "SELECT d.id, d.run_id, d.run_node_id, d.decision, d.rationale, d.attempt, \
                 d.raw_output, d.created_at \
                 FROM routing_decisions d \
                 WHERE d.run_id = ?1 AND NOT EXISTS (\
                   SELECT 1 FROM routing_decisions o \
                   WHERE o.run_node_id = d.run_node_id \
                     AND (o.created_at > d.created_at \
                          OR (o.created_at = d.created_at AND o.id > d.id))) \
                 ORDER BY d.run_node_id",
            )
            .map_err(db_err)?;
        let rows = statement.query_map(params![run_id.get()], DecisionRow::from_row).map_err(db_err)?;
        let mut decisions = Vec::new();
        for row in rows {
            decisions.push(row.map_err(db_err)?.into_decision()?);
        }
        Ok(decisions)
    }

    fn insert_diagnostics(&self, diagnostics: &NewDiagnostics) -> Result<bool, StoreError> {
        let connection = self.lock()?;
        let now = self.now_text();
        let changed = connection
            .execute(
                "INSERT INTO run_node_diagnostics \
                 (run_id, run_node_id, attempt, outcome, counts, redacted, truncated, \
                  payload_chars, diagnostics, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10) \
                 ON CONFLICT (run_id, run_node_id, attempt) DO NOTHING",
                params![
                    diagnostics.run_id.get(),
                    diagnostics.run_node_id.get(),
                    diagnostics.attempt,
                    diagnostics.outcome,
                    diagnostics.counts.to_string(),
                    i64::from(diagnostics.redacted),
                    i64::from(diagnostics.truncated),
                    diagnostics.payload_chars,
                    diagnostics.diagnostics.to_string(),
                    now
                ],
            )
            .map_err(db_err)?;
        Ok(changed == 1)
    }

    fn load_diagnostics(
        &self,
        run_id: RunId,
        run_node_id: RunNodeId,
    ) -> Result<Vec<RunNodeDiagnostics>, StoreError> {
        let connection = self.lock()?;
        let mut statement = connection
            .prepare(
                "SELECT id, run_id, run_node_id, attempt, outcome, counts, redacted, \
                 truncated, payload_chars, diagnostics \
                 FROM run_node_diagnostics WHERE run_id = ?1 AND run_node_id = ?2 \
                 ORDER BY attempt",
            )
            .map_err(db_err)?;
        let rows = statement
            .query_map(params![run_id.get(), run_node_id.get()], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, i64>(6)?,
                    row.get::<_, i64>(7)?,
                    row.get::<_, i64>(8)?,
                    row.get::<_, Option<String>>(9)?,
                ))
            })
            .map_err(db_err)?;
        let mut out = Vec::new();
        for row in rows {
            let (
                id,
                run_raw,
                node_raw,
                attempt,
                outcome,
                counts,
                redacted,
                truncated,
                payload_chars,
                payload,
            ) = row.map_err(db_err)?;
            out.push(RunNodeDiagnostics {
                id,
                run_id: typed_id(run_raw, RunId::from_raw, "run")?,
                run_node_id: typed_id(node_raw, RunNodeId::from_raw, "run node")?,
                attempt,
                outcome,
                counts: parse_json_lenient(counts),
                redacted: redacted != 0,
                truncated: truncated != 0,
                payload_chars,
                diagnostics: parse_json_lenient(payload),
            });
        }
        Ok(out)
    }

    fn append_stream_events(
        &self,
        run_id: RunId,
        run_node_id: RunNodeId,
        attempt: i64,
        events: &[NewStreamEvent],
    ) -> Result<i64, StoreError> {
        let mut connection = self.lock()?;
        let now = self.now_text();
        let tx = connection.transaction().map_err(db_err)?;
        let max_sequence: i64 = tx
            .query_row(
                "SELECT COALESCE(MAX(sequence), 0) FROM run_node_stream_events \
                 WHERE run_node_id = ?1 AND attempt = ?2",
                params![run_node_id.get(), attempt],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        let first = max_sequence + 1;
        for (offset, event) in events.iter().enumerate() {
            let sequence = first + i64::try_from(offset).unwrap_or(i64::MAX);
            tx.execute(
                "INSERT INTO run_node_stream_events \
                 (run_id, run_node_id, attempt, sequence, event_type, timestamp, \
                  content_chars, content_preview, metadata, usage_delta_tokens, \
                  usage_cumulative_tokens, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12)",
                params![
                    run_id.get(),
                    run_node_id.get(),
                    attempt,
                    sequence,
                    event.event_type,
                    event.timestamp.to_rfc3339(),
                    event.content_chars,
                    event.content_preview,
                    event.metadata.as_ref().map(ToString::to_string),
                    event.usage_delta_tokens,
                    event.usage_cumulative_tokens,
                    now
                ],
            )
            .map_err(db_err)?;
        }
        tx.commit().map_err(db_err)?;
        Ok(first)
    }

    fn stream_events_after(
        &self,
        run_node_id: RunNodeId,
        attempt: i64,
        cursor: i64,
    ) -> Result<Vec<RunNodeStreamEvent>, StoreError> {
        let connection = self.lock()?;
        let mut statement = connection
            .prepare(
                "SELECT id, run_id, run_node_id, attempt, sequence, event_type, timestamp, \
                 content_chars, content_preview, metadata, usage_delta_tokens, \
                 usage_cumulative_tokens \
                 FROM run_node_stream_events \
                 WHERE run_node_id = ?1 AND attempt = ?2 AND sequence > ?3 \
                 ORDER BY sequence",
            )
            .map_err(db_err)?;
        let rows = statement
            .query_map(params![run_node_id.get(), attempt, cursor], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, i64>(7)?,
                    row.get::<_, Option<String>>(8)?,
                    row.get::<_, Option<String>>(9)?,
                    row.get::<_, Option<i64>>(10)?,
                    row.get::<_, Option<i64>>(11)?,
                ))
            })
            .map_err(db_err)?;
        let mut events = Vec::new();
        for row in rows {
            let (
                id,
                run_raw,
                node_raw,
                attempt,
                sequence,
                event_type,
                timestamp,
                content_chars,
                content_preview,
                metadata,
                delta,
                cumulative,
            ) = row.map_err(db_err)?;
            events.push(RunNodeStreamEvent {
                id,
                run_id: typed_id(run_raw, RunId::from_raw, "run")?,
                run_node_id: typed_id(node_raw, RunNodeId::from_raw, "run node")?,
                attempt,
                sequence,
                event_type,
                timestamp: parse_timestamp(&timestamp)?,
                content_chars,
                content_preview,
                metadata: metadata.map(|text| parse_json_lenient(Some(text))),
                usage_delta_tokens: delta,
                usage_cumulative_tokens: cumulative,
            });
        }
        Ok(events)
    }

    fn insert_worktree(
        &self,
        run_id: RunId,
        path: &str,
        status: &str,
    ) -> Result<WorktreeId, StoreError> {
        let connection = self.lock()?;
        let now = self.now_text();
        connection
            .execute(
                "INSERT INTO run_worktrees (run_id, path, status, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?4)",
                params![run_id.get(), path, status, now],
            )
            .map_err(db_err)?;
        typed_id(connection.last_insert_rowid(), WorktreeId::from_raw, "worktree")
    }

    fn latest_active_worktree(&self, run_id: RunId) -> Result<Option<RunWorktree>, StoreError> {
        let connection = self.lock()?;
        let row = connection
            .query_row(
                "SELECT id, run_id, path, status, created_at FROM run_worktrees \
                 WHERE run_id = ?1 AND status = 'active' ORDER BY id DESC LIMIT 1",
                params![run_id.get()],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()
            .map_err(db_err)?;
        row.map(|(id, run_raw, path, status, created)| {
            Ok(RunWorktree {
                id: typed_id(id, WorktreeId::from_raw, "worktree")?,
                run_id: typed_id(run_raw, RunId::from_raw, "run")?,
                path,
                status,
                created_at: parse_timestamp(&created)?,
            })
        })
        .transpose()
    }

    fn readiness(&self) -> Result<(), StoreError> {
        let connection = self.lock()?;
        connection
            .query_row("SELECT 1", params![], |_row| Ok(()))
            .map_err(db_err)?;
        Ok(())
    }
}

// ============================================================================
// SECTION: SQL Helpers
// ============================================================================

/// Collects latest-attempt failed node rowids inside a transaction.
fn collect_failed_node_ids(tx: &Transaction<'_>, run_id: RunId) -> Result<Vec<i64>, StoreError> {
    let mut statement = tx
        .prepare(
            "SELECT id FROM run_nodes WHERE run_id = ?1 AND status = 'failed' ORDER BY id",
        )
        .map_err(db_err)?;
    let rows = statement
        .query_map(params![run_id.get()], |row| row.get::<_, i64>(0))
        .map_err(db_err)?;
    let mut ids = Vec::new();
    for row in rows {
        ids.push(row.map_err(db_err)?);
    }
    Ok(ids)
}

/// Validates a draft definition before it replaces tree content.
fn validate_definition(definition: &TreeDefinition) -> Result<(), StoreError> {
    let mut keys = std::collections::BTreeSet::new();
    for node in &definition.nodes {
        if node.node_key.is_empty() {
            return Err(StoreError::Invalid("node_key must not be empty".to_string()));
        }
        if node.max_retries < 0 {
            return Err(StoreError::Invalid(format!(
                "max_retries must be >= 0 for node {}",
                node.node_key
            )));
        }
        if !keys.insert(node.node_key.as_str()) {
            return Err(StoreError::Invalid(format!("duplicate node_key: {}", node.node_key)));
        }
        if let Some(index) = node.template_index
            && index >= definition.templates.len()
        {
            return Err(StoreError::Invalid(format!(
                "template_index {index} out of range for node {}",
                node.node_key
            )));
        }
    }
    let mut priorities = std::collections::BTreeSet::new();
    for edge in &definition.edges {
        if edge.priority < 0 {
            return Err(StoreError::Invalid("edge priority must be >= 0".to_string()));
        }
        if !keys.contains(edge.source_node_key.as_str()) {
            return Err(StoreError::Invalid(format!(
                "edge references unknown source node: {}",
                edge.source_node_key
            )));
        }
        if !keys.contains(edge.target_node_key.as_str()) {
            return Err(StoreError::Invalid(format!(
                "edge references unknown target node: {}",
                edge.target_node_key
            )));
        }
        if let Some(index) = edge.guard_index
            && index >= definition.guards.len()
        {
            return Err(StoreError::Invalid(format!(
                "guard_index {index} out of range for edge {} -> {}",
                edge.source_node_key, edge.target_node_key
            )));
        }
        if !priorities.insert((edge.source_node_key.as_str(), edge.route_on.as_str(), edge.priority))
        {
            return Err(StoreError::Invalid(format!(
                "duplicate priority {} on source {} lane {}",
                edge.priority,
                edge.source_node_key,
                edge.route_on.as_str()
            )));
        }
    }
    Ok(())
}
