//! Storage layer with SQLite.
//!
//! # Schema Design
//!
//! The database uses WAL mode for concurrent reads and single-writer semantics.
//! All timestamps are epoch milliseconds (i64). One database holds every
//! mirrored team server; rows carry a `team_server_id` so a desync wipe can
//! clear one server without touching the others.
//!
//! # Tables
//!
//! - `team_servers`: registered C2 servers and their active flag
//! - `listeners`: named C2 channels, upserted by (server, name)
//! - `beacons`: implant sessions, unique per (server, bid)
//! - `beacon_logs`: interaction log lines, correlated to actions
//! - `archives`: reporting records, correlated to actions
//! - `actions`: correlated units of operator activity
//! - `beacon_presence`: contiguous check-in windows with sleep cadence
//! - `credentials`, `downloads`: captured material
//!
//! Writes are serialized through a dedicated writer thread so that
//! correlation lookups and the inserts that depend on them execute on one
//! connection, in order. Reads open short-lived connections on the blocking
//! pool.

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::correlate::{self, CorrelationContext, CorrelationPlan};
use crate::error::{Result, StorageError};
use crate::presence::{self, SleepParams};
use crate::protocol::{ListenerRecord, SessionOpen};

/// Current schema version, tracked via PRAGMA user_version.
pub const SCHEMA_VERSION: i32 = 1;

/// Schema initialization SQL.
///
/// Convention notes:
/// - Timestamps: epoch milliseconds (i64)
/// - Booleans: INTEGER 0/1
/// - All tables use INTEGER PRIMARY KEY for rowid aliasing
pub const SCHEMA_SQL: &str = r"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS team_servers (
    id INTEGER PRIMARY KEY,
    description TEXT NOT NULL,
    hostname TEXT NOT NULL,
    port INTEGER NOT NULL,
    password TEXT NOT NULL,
    active INTEGER NOT NULL DEFAULT 1,
    UNIQUE(hostname, port)
);

-- Listeners are replayed on every client sync; (server, name) identifies one.
CREATE TABLE IF NOT EXISTS listeners (
    id INTEGER PRIMARY KEY,
    team_server_id INTEGER NOT NULL REFERENCES team_servers(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    payload TEXT,
    port TEXT,
    host TEXT,
    althost TEXT,
    bindto TEXT,
    proxy TEXT,
    profile TEXT,
    strategy TEXT,
    beacons TEXT,
    status TEXT,
    maxretry TEXT,
    guards TEXT,
    localonly INTEGER,
    UNIQUE(team_server_id, name)
);

CREATE TABLE IF NOT EXISTS beacons (
    id INTEGER PRIMARY KEY,
    team_server_id INTEGER NOT NULL REFERENCES team_servers(id) ON DELETE CASCADE,
    bid INTEGER NOT NULL,
    user TEXT,
    computer TEXT,
    host TEXT,
    internal TEXT,
    external TEXT,
    process TEXT,
    pid TEXT,
    barch TEXT,
    os TEXT,
    ver TEXT,
    build TEXT,
    arch TEXT,
    session TEXT,
    note TEXT,
    charset TEXT,
    is64 INTEGER NOT NULL DEFAULT 0,
    opened_at INTEGER NOT NULL,       -- epoch ms
    last_seen_at INTEGER,             -- epoch ms, NULL until first check-in
    parent_id INTEGER REFERENCES beacons(id),
    listener_id INTEGER REFERENCES listeners(id),
    UNIQUE(team_server_id, bid)
);

CREATE INDEX IF NOT EXISTS idx_beacons_server_bid ON beacons(team_server_id, bid);

CREATE TABLE IF NOT EXISTS actions (
    id INTEGER PRIMARY KEY,
    team_server_id INTEGER NOT NULL REFERENCES team_servers(id) ON DELETE CASCADE,
    beacon_id INTEGER NOT NULL REFERENCES beacons(id) ON DELETE CASCADE,
    start_at INTEGER NOT NULL,        -- epoch ms
    accept_output INTEGER NOT NULL DEFAULT 1
);

CREATE INDEX IF NOT EXISTS idx_actions_beacon_start ON actions(beacon_id, start_at);

CREATE TABLE IF NOT EXISTS beacon_logs (
    id INTEGER PRIMARY KEY,
    team_server_id INTEGER NOT NULL REFERENCES team_servers(id) ON DELETE CASCADE,
    beacon_id INTEGER NOT NULL REFERENCES beacons(id) ON DELETE CASCADE,
    kind TEXT NOT NULL,
    data TEXT NOT NULL,
    operator TEXT,
    output_job TEXT,
    task_id TEXT,
    logged_at INTEGER NOT NULL,       -- epoch ms
    action_id INTEGER REFERENCES actions(id)
);

CREATE INDEX IF NOT EXISTS idx_logs_beacon_when ON beacon_logs(beacon_id, logged_at);
CREATE INDEX IF NOT EXISTS idx_logs_task ON beacon_logs(task_id) WHERE task_id IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_logs_action ON beacon_logs(action_id);

CREATE TABLE IF NOT EXISTS archives (
    id INTEGER PRIMARY KEY,
    team_server_id INTEGER NOT NULL REFERENCES team_servers(id) ON DELETE CASCADE,
    beacon_id INTEGER REFERENCES beacons(id) ON DELETE CASCADE,
    kind TEXT NOT NULL,
    data TEXT,
    tactic TEXT,
    logged_at INTEGER NOT NULL,       -- epoch ms
    action_id INTEGER REFERENCES actions(id)
);

CREATE INDEX IF NOT EXISTS idx_archives_beacon_when ON archives(beacon_id, logged_at);

CREATE TABLE IF NOT EXISTS beacon_presence (
    id INTEGER PRIMARY KEY,
    beacon_id INTEGER NOT NULL REFERENCES beacons(id) ON DELETE CASCADE,
    first_checkin_at INTEGER NOT NULL,  -- epoch ms
    last_checkin_at INTEGER NOT NULL,   -- epoch ms
    sleep_seconds INTEGER NOT NULL DEFAULT 0,
    sleep_jitter REAL NOT NULL DEFAULT 0.0
);

CREATE INDEX IF NOT EXISTS idx_presence_beacon ON beacon_presence(beacon_id, last_checkin_at);

CREATE TABLE IF NOT EXISTS credentials (
    id INTEGER PRIMARY KEY,
    team_server_id INTEGER NOT NULL REFERENCES team_servers(id) ON DELETE CASCADE,
    user TEXT,
    password TEXT,
    host TEXT,
    realm TEXT,
    source TEXT,
    added_at INTEGER NOT NULL         -- epoch ms
);

-- Replayed streams after a crash mid-sync re-emit rows at or before the
-- watermark; these expression indexes absorb the duplicates. A credential
-- is identified by system, account, and secret, so re-observing the same
-- material at a later timestamp does not duplicate either.
CREATE UNIQUE INDEX IF NOT EXISTS idx_credentials_dedup ON credentials (
    team_server_id, IFNULL(user, ''), IFNULL(password, ''), IFNULL(host, ''),
    IFNULL(realm, ''), IFNULL(source, '')
);

CREATE TABLE IF NOT EXISTS downloads (
    id INTEGER PRIMARY KEY,
    team_server_id INTEGER NOT NULL REFERENCES team_servers(id) ON DELETE CASCADE,
    beacon_id INTEGER REFERENCES beacons(id) ON DELETE CASCADE,
    size TEXT,
    path TEXT,
    name TEXT,
    date_at INTEGER NOT NULL          -- epoch ms
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_downloads_dedup ON downloads (
    team_server_id, IFNULL(beacon_id, 0), IFNULL(path, ''), IFNULL(name, ''),
    date_at
);
";

/// Epoch milliseconds for the current instant.
#[must_use]
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

// =============================================================================
// Record Types
// =============================================================================

/// A registered team server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamServerRecord {
    pub id: i64,
    pub description: String,
    pub hostname: String,
    pub port: u16,
    pub password: String,
    pub active: bool,
}

/// Input for registering a team server.
#[derive(Debug, Clone)]
pub struct NewTeamServer {
    pub description: String,
    pub hostname: String,
    pub port: u16,
    pub password: String,
}

/// A stored beacon session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeaconRow {
    pub id: i64,
    pub team_server_id: i64,
    pub bid: i64,
    pub user: Option<String>,
    pub computer: Option<String>,
    pub process: Option<String>,
    pub session: Option<String>,
    pub opened_at: i64,
    pub last_seen_at: Option<i64>,
    pub parent_id: Option<i64>,
    pub listener_id: Option<i64>,
}

/// A beacon log pending insertion, with the beacon already resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBeaconLog {
    pub team_server_id: i64,
    pub beacon_id: i64,
    pub kind: String,
    pub data: String,
    pub operator: Option<String>,
    pub output_job: Option<String>,
    pub task_id: Option<String>,
    pub logged_at: i64,
}

/// An archive pending insertion. `beacon_id` is `None` for webhit/notify
/// records that carry no beacon.
#[derive(Debug, Clone)]
pub struct NewArchive {
    pub team_server_id: i64,
    pub beacon_id: Option<i64>,
    pub kind: String,
    pub data: Option<String>,
    pub tactic: Option<String>,
    pub logged_at: i64,
}

#[derive(Debug, Clone)]
pub struct NewCredential {
    pub team_server_id: i64,
    pub user: Option<String>,
    pub password: Option<String>,
    pub host: Option<String>,
    pub realm: Option<String>,
    pub source: Option<String>,
    pub added_at: i64,
}

#[derive(Debug, Clone)]
pub struct NewDownload {
    pub team_server_id: i64,
    pub beacon_id: Option<i64>,
    pub size: Option<String>,
    pub path: Option<String>,
    pub name: Option<String>,
    pub date_at: i64,
}

/// A correlated unit of operator activity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRow {
    pub id: i64,
    pub team_server_id: i64,
    pub beacon_id: i64,
    pub start_at: i64,
    pub accept_output: bool,
}

/// A contiguous check-in window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceRow {
    pub id: i64,
    pub beacon_id: i64,
    pub first_checkin_at: i64,
    pub last_checkin_at: i64,
    pub sleep_seconds: i64,
    pub sleep_jitter: f64,
}

/// Outcome of applying a check-in metadata line to a beacon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckinOutcome {
    /// Whether the beacon's last-seen time was actually advanced. The
    /// update is suppressed when the stored value is under a minute stale,
    /// to absorb the approximation error of "milliseconds ago" deltas.
    pub updated: bool,
    /// Whether the check-in itself was recent (delta under a minute),
    /// meaning presence tracking should run.
    pub recent: bool,
    /// Resolved beacon primary key, when the beacon is known.
    pub beacon_id: Option<i64>,
}

/// High-water timestamps per table for one team server, handed to the
/// scripting client so a reconnect only replays rows newer than the local
/// mirror.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncWatermarks {
    pub last_session: i64,
    pub last_archive: i64,
    pub last_beacon_log: i64,
    pub last_credential: i64,
    pub last_download: i64,
}

/// Per-table row counts for status reporting.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StorageCounts {
    pub team_servers: i64,
    pub listeners: i64,
    pub beacons: i64,
    pub beacon_logs: i64,
    pub archives: i64,
    pub actions: i64,
    pub credentials: i64,
    pub downloads: i64,
}

// =============================================================================
// Writer Command Types
// =============================================================================

enum WriteCommand {
    AddTeamServer {
        server: NewTeamServer,
        respond: oneshot::Sender<Result<i64>>,
    },
    SetTeamServerActive {
        id: i64,
        active: bool,
        respond: oneshot::Sender<Result<bool>>,
    },
    UpsertListener {
        team_server_id: i64,
        listener: ListenerRecord,
        respond: oneshot::Sender<Result<i64>>,
    },
    UpsertBeacon {
        team_server_id: i64,
        session: SessionOpen,
        respond: oneshot::Sender<Result<i64>>,
    },
    ApplyCheckin {
        team_server_id: i64,
        bid: i64,
        last_ms_ago: i64,
        sleep: Option<SleepParams>,
        fuzz_ms: i64,
        respond: oneshot::Sender<Result<CheckinOutcome>>,
    },
    InsertBeaconLog {
        log: NewBeaconLog,
        respond: oneshot::Sender<Result<i64>>,
    },
    InsertArchive {
        archive: NewArchive,
        respond: oneshot::Sender<Result<i64>>,
    },
    InsertCredential {
        credential: NewCredential,
        respond: oneshot::Sender<Result<i64>>,
    },
    InsertDownload {
        download: NewDownload,
        respond: oneshot::Sender<Result<i64>>,
    },
    WipeTeamServerData {
        team_server_id: i64,
        respond: oneshot::Sender<Result<usize>>,
    },
    Shutdown {
        respond: oneshot::Sender<()>,
    },
}

/// Configuration for the storage handle.
pub struct StorageConfig {
    /// Maximum number of pending write commands before backpressure.
    pub write_queue_size: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            write_queue_size: 1024,
        }
    }
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            let existed = parent.exists();
            std::fs::create_dir_all(parent)
                .map_err(|e| StorageError::Database(format!("Failed to create directory: {e}")))?;
            #[cfg(unix)]
            if !existed {
                set_permissions(parent, 0o700)?;
            }
        }
    }
    Ok(())
}

#[cfg(unix)]
fn set_permissions(path: &Path, mode: u32) -> Result<()> {
    let permissions = std::fs::Permissions::from_mode(mode);
    std::fs::set_permissions(path, permissions).map_err(|e| {
        StorageError::Database(format!(
            "Failed to set permissions on {}: {e}",
            path.display()
        ))
    })?;
    Ok(())
}

fn initialize_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA_SQL)
        .map_err(|e| StorageError::Database(format!("Schema initialization failed: {e}")))?;
    let version: i32 = conn
        .query_row("PRAGMA user_version", [], |row| row.get(0))
        .map_err(StorageError::from)?;
    if version == 0 {
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)
            .map_err(StorageError::from)?;
    } else if version > SCHEMA_VERSION {
        return Err(StorageError::Database(format!(
            "Database schema version {version} is newer than supported {SCHEMA_VERSION}"
        ))
        .into());
    }
    Ok(())
}

// =============================================================================
// Storage Handle
// =============================================================================

/// Async-safe storage handle.
///
/// Writes are serialized through a dedicated writer thread so correlation
/// reads and dependent inserts never interleave. Reads use `spawn_blocking`
/// with WAL mode for concurrent access.
#[derive(Clone)]
pub struct StorageHandle {
    write_tx: mpsc::Sender<WriteCommand>,
    db_path: Arc<String>,
    writer_handle: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl StorageHandle {
    /// Open or create the database at `db_path`, initialize the schema, and
    /// start the writer thread.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened or schema fails.
    pub async fn new(db_path: &str) -> Result<Self> {
        Self::with_config(db_path, StorageConfig::default()).await
    }

    /// Return the database path backing this storage handle.
    #[must_use]
    pub fn db_path(&self) -> &str {
        self.db_path.as_str()
    }

    /// Create a storage handle with custom configuration.
    pub async fn with_config(db_path: &str, config: StorageConfig) -> Result<Self> {
        ensure_parent_dir(Path::new(db_path))?;

        let db_path_owned = db_path.to_string();
        let init_result = tokio::task::spawn_blocking(move || -> Result<Connection> {
            let conn = Connection::open(&db_path_owned)
                .map_err(|e| StorageError::Database(format!("Failed to open database: {e}")))?;
            initialize_schema(&conn)?;
            Ok(conn)
        })
        .await
        .map_err(|e| StorageError::Database(format!("Task join error: {e}")))??;

        let (write_tx, mut write_rx) = mpsc::channel::<WriteCommand>(config.write_queue_size);

        let writer_handle = thread::spawn(move || {
            let mut conn = init_result;
            writer_loop(&mut conn, &mut write_rx);
        });

        Ok(Self {
            write_tx,
            db_path: Arc::new(db_path.to_string()),
            writer_handle: Arc::new(Mutex::new(Some(writer_handle))),
        })
    }

    async fn send_write<T>(
        &self,
        cmd: WriteCommand,
        rx: oneshot::Receiver<Result<T>>,
    ) -> Result<T> {
        self.write_tx
            .send(cmd)
            .await
            .map_err(|_| StorageError::WriterUnavailable("Writer thread not available".into()))?;
        rx.await
            .map_err(|_| StorageError::WriterUnavailable("Writer response channel closed".into()))?
    }

    /// Register a team server. Returns its id.
    pub async fn add_team_server(&self, server: NewTeamServer) -> Result<i64> {
        let (tx, rx) = oneshot::channel();
        self.send_write(
            WriteCommand::AddTeamServer {
                server,
                respond: tx,
            },
            rx,
        )
        .await
    }

    /// Set a team server's active flag. Returns true if a row changed.
    pub async fn set_team_server_active(&self, id: i64, active: bool) -> Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.send_write(
            WriteCommand::SetTeamServerActive {
                id,
                active,
                respond: tx,
            },
            rx,
        )
        .await
    }

    /// Insert or update a listener by (server, name). Returns the listener id.
    pub async fn upsert_listener(
        &self,
        team_server_id: i64,
        listener: ListenerRecord,
    ) -> Result<i64> {
        let (tx, rx) = oneshot::channel();
        self.send_write(
            WriteCommand::UpsertListener {
                team_server_id,
                listener,
                respond: tx,
            },
            rx,
        )
        .await
    }

    /// Insert or update a beacon session, resolving its parent beacon and
    /// listener inside the writer. Returns the beacon primary key.
    pub async fn upsert_beacon(&self, team_server_id: i64, session: SessionOpen) -> Result<i64> {
        let (tx, rx) = oneshot::channel();
        self.send_write(
            WriteCommand::UpsertBeacon {
                team_server_id,
                session,
                respond: tx,
            },
            rx,
        )
        .await
    }

    /// Apply a check-in metadata line: advance the beacon's last-seen time
    /// (with the one-minute staleness guard) and, when the check-in is
    /// recent, extend or open a presence window.
    pub async fn apply_checkin(
        &self,
        team_server_id: i64,
        bid: i64,
        last_ms_ago: i64,
        sleep: Option<SleepParams>,
        fuzz_ms: i64,
    ) -> Result<CheckinOutcome> {
        let (tx, rx) = oneshot::channel();
        self.send_write(
            WriteCommand::ApplyCheckin {
                team_server_id,
                bid,
                last_ms_ago,
                sleep,
                fuzz_ms,
                respond: tx,
            },
            rx,
        )
        .await
    }

    /// Insert a beacon log, correlating it to an action in the same writer
    /// step. Returns the log id.
    pub async fn insert_beacon_log(&self, log: NewBeaconLog) -> Result<i64> {
        let (tx, rx) = oneshot::channel();
        self.send_write(WriteCommand::InsertBeaconLog { log, respond: tx }, rx)
            .await
    }

    /// Insert an archive, correlating it to the most recent action when it
    /// carries a beacon. Returns the archive id.
    pub async fn insert_archive(&self, archive: NewArchive) -> Result<i64> {
        let (tx, rx) = oneshot::channel();
        self.send_write(
            WriteCommand::InsertArchive {
                archive,
                respond: tx,
            },
            rx,
        )
        .await
    }

    /// Insert a credential. Returns its id.
    pub async fn insert_credential(&self, credential: NewCredential) -> Result<i64> {
        let (tx, rx) = oneshot::channel();
        self.send_write(
            WriteCommand::InsertCredential {
                credential,
                respond: tx,
            },
            rx,
        )
        .await
    }

    /// Insert a download. Returns its id.
    pub async fn insert_download(&self, download: NewDownload) -> Result<i64> {
        let (tx, rx) = oneshot::channel();
        self.send_write(
            WriteCommand::InsertDownload {
                download,
                respond: tx,
            },
            rx,
        )
        .await
    }

    /// Delete all mirrored data for one team server, keeping its
    /// registration row. Returns the number of rows deleted. Used on
    /// desync so the next poll resynchronizes from scratch.
    pub async fn wipe_team_server_data(&self, team_server_id: i64) -> Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.send_write(
            WriteCommand::WipeTeamServerData {
                team_server_id,
                respond: tx,
            },
            rx,
        )
        .await
    }

    /// Fetch a team server by id.
    pub async fn get_team_server(&self, id: i64) -> Result<Option<TeamServerRecord>> {
        self.read(move |conn| query_team_server(conn, id)).await
    }

    /// List all registered team servers.
    pub async fn list_team_servers(&self) -> Result<Vec<TeamServerRecord>> {
        self.read(list_team_servers_sync).await
    }

    /// Check a team server's active flag without loading the whole row.
    pub async fn team_server_active(&self, id: i64) -> Result<Option<bool>> {
        self.read(move |conn| {
            conn.query_row(
                "SELECT active FROM team_servers WHERE id = ?1",
                params![id],
                |row| row.get::<_, bool>(0),
            )
            .optional()
            .map_err(StorageError::from)
            .map_err(Into::into)
        })
        .await
    }

    /// Look up a beacon by its server-assigned id.
    pub async fn get_beacon_for_bid(
        &self,
        team_server_id: i64,
        bid: i64,
    ) -> Result<Option<BeaconRow>> {
        self.read(move |conn| query_beacon_for_bid(conn, team_server_id, bid))
            .await
    }

    /// All actions for a beacon, oldest first.
    pub async fn list_actions(&self, beacon_id: i64) -> Result<Vec<ActionRow>> {
        self.read(move |conn| list_actions_sync(conn, beacon_id))
            .await
    }

    /// All presence windows for a beacon, oldest first.
    pub async fn list_presence(&self, beacon_id: i64) -> Result<Vec<PresenceRow>> {
        self.read(move |conn| list_presence_sync(conn, beacon_id))
            .await
    }

    /// The action a given beacon log is attached to, if any.
    pub async fn action_for_log(&self, log_id: i64) -> Result<Option<i64>> {
        self.read(move |conn| {
            conn.query_row(
                "SELECT action_id FROM beacon_logs WHERE id = ?1",
                params![log_id],
                |row| row.get::<_, Option<i64>>(0),
            )
            .optional()
            .map(Option::flatten)
            .map_err(StorageError::from)
            .map_err(Into::into)
        })
        .await
    }

    /// The action a given archive is attached to, if any.
    pub async fn action_for_archive(&self, archive_id: i64) -> Result<Option<i64>> {
        self.read(move |conn| {
            conn.query_row(
                "SELECT action_id FROM archives WHERE id = ?1",
                params![archive_id],
                |row| row.get::<_, Option<i64>>(0),
            )
            .optional()
            .map(Option::flatten)
            .map_err(StorageError::from)
            .map_err(Into::into)
        })
        .await
    }

    /// Data column of a beacon log, for inspecting merged output.
    pub async fn log_data(&self, log_id: i64) -> Result<Option<String>> {
        self.read(move |conn| {
            conn.query_row(
                "SELECT data FROM beacon_logs WHERE id = ?1",
                params![log_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(StorageError::from)
            .map_err(Into::into)
        })
        .await
    }

    /// High-water timestamps for one team server, zero where no rows exist.
    pub async fn sync_watermarks(&self, team_server_id: i64) -> Result<SyncWatermarks> {
        self.read(move |conn| sync_watermarks_sync(conn, team_server_id))
            .await
    }

    /// Row counts for status reporting.
    pub async fn counts(&self) -> Result<StorageCounts> {
        self.read(counts_sync).await
    }

    async fn read<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let db_path = Arc::clone(&self.db_path);
        tokio::task::spawn_blocking(move || {
            let conn = Connection::open(db_path.as_str()).map_err(|e| {
                StorageError::Database(format!("Failed to open read connection: {e}"))
            })?;
            f(&conn)
        })
        .await
        .map_err(|e| StorageError::Database(format!("Task join error: {e}")))?
    }

    /// Shutdown the storage handle.
    ///
    /// Flushes all pending writes and waits for the writer thread to exit.
    /// Safe to call multiple times.
    pub async fn shutdown(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        let _ = self.write_tx.send(WriteCommand::Shutdown { respond: tx }).await;
        let _ = rx.await;

        let handle = self
            .writer_handle
            .lock()
            .map_err(|_| StorageError::Database("Writer handle lock poisoned".into()))?
            .take();
        if let Some(handle) = handle {
            handle
                .join()
                .map_err(|_| StorageError::Database("Writer thread panicked".into()))?;
        }
        Ok(())
    }
}

// =============================================================================
// Writer Thread Implementation
// =============================================================================

fn writer_loop(conn: &mut Connection, rx: &mut mpsc::Receiver<WriteCommand>) {
    while let Some(cmd) = rx.blocking_recv() {
        match cmd {
            WriteCommand::AddTeamServer { server, respond } => {
                let _ = respond.send(add_team_server_sync(conn, &server));
            }
            WriteCommand::SetTeamServerActive {
                id,
                active,
                respond,
            } => {
                let _ = respond.send(set_team_server_active_sync(conn, id, active));
            }
            WriteCommand::UpsertListener {
                team_server_id,
                listener,
                respond,
            } => {
                let _ = respond.send(upsert_listener_sync(conn, team_server_id, &listener));
            }
            WriteCommand::UpsertBeacon {
                team_server_id,
                session,
                respond,
            } => {
                let _ = respond.send(upsert_beacon_sync(conn, team_server_id, &session));
            }
            WriteCommand::ApplyCheckin {
                team_server_id,
                bid,
                last_ms_ago,
                sleep,
                fuzz_ms,
                respond,
            } => {
                let _ = respond.send(apply_checkin_sync(
                    conn,
                    team_server_id,
                    bid,
                    last_ms_ago,
                    sleep,
                    fuzz_ms,
                ));
            }
            WriteCommand::InsertBeaconLog { log, respond } => {
                let _ = respond.send(insert_beacon_log_sync(conn, &log));
            }
            WriteCommand::InsertArchive { archive, respond } => {
                let _ = respond.send(insert_archive_sync(conn, &archive));
            }
            WriteCommand::InsertCredential {
                credential,
                respond,
            } => {
                let _ = respond.send(insert_credential_sync(conn, &credential));
            }
            WriteCommand::InsertDownload { download, respond } => {
                let _ = respond.send(insert_download_sync(conn, &download));
            }
            WriteCommand::WipeTeamServerData {
                team_server_id,
                respond,
            } => {
                let _ = respond.send(wipe_team_server_data_sync(conn, team_server_id));
            }
            WriteCommand::Shutdown { respond } => {
                let _ = respond.send(());
                break;
            }
        }
    }
}

fn add_team_server_sync(conn: &Connection, server: &NewTeamServer) -> Result<i64> {
    conn.execute(
        "INSERT INTO team_servers (description, hostname, port, password, active)
         VALUES (?1, ?2, ?3, ?4, 1)",
        params![
            server.description,
            server.hostname,
            server.port,
            server.password
        ],
    )
    .map_err(StorageError::from)?;
    Ok(conn.last_insert_rowid())
}

fn set_team_server_active_sync(conn: &Connection, id: i64, active: bool) -> Result<bool> {
    let changed = conn
        .execute(
            "UPDATE team_servers SET active = ?2 WHERE id = ?1",
            params![id, active],
        )
        .map_err(StorageError::from)?;
    Ok(changed > 0)
}

fn upsert_listener_sync(
    conn: &Connection,
    team_server_id: i64,
    listener: &ListenerRecord,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO listeners (team_server_id, name, payload, port, host, althost, bindto,
                                proxy, profile, strategy, beacons, status, maxretry, guards, localonly)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
         ON CONFLICT(team_server_id, name) DO UPDATE SET
             payload = excluded.payload,
             port = excluded.port,
             host = excluded.host,
             althost = excluded.althost,
             bindto = excluded.bindto,
             proxy = excluded.proxy,
             profile = excluded.profile,
             strategy = excluded.strategy,
             beacons = excluded.beacons,
             status = excluded.status,
             maxretry = excluded.maxretry,
             guards = excluded.guards,
             localonly = excluded.localonly",
        params![
            team_server_id,
            listener.name,
            listener.payload,
            listener.port,
            listener.host,
            listener.althost,
            listener.bindto,
            listener.proxy,
            listener.profile,
            listener.strategy,
            listener.beacons,
            listener.status,
            listener.maxretry,
            listener.guards,
            listener.localonly,
        ],
    )
    .map_err(StorageError::from)?;
    conn.query_row(
        "SELECT id FROM listeners WHERE team_server_id = ?1 AND name = ?2",
        params![team_server_id, listener.name],
        |row| row.get(0),
    )
    .map_err(StorageError::from)
    .map_err(Into::into)
}

fn beacon_pk_for_bid(conn: &Connection, team_server_id: i64, bid: i64) -> Result<Option<i64>> {
    conn.query_row(
        "SELECT id FROM beacons WHERE team_server_id = ?1 AND bid = ?2",
        params![team_server_id, bid],
        |row| row.get(0),
    )
    .optional()
    .map_err(StorageError::from)
    .map_err(Into::into)
}

fn upsert_beacon_sync(conn: &Connection, team_server_id: i64, session: &SessionOpen) -> Result<i64> {
    // Resolve the parent chain before touching the row. SSH sessions also
    // carry a pbid; only beacon sessions get the bind-pipe listener guess.
    let mut parent_id: Option<i64> = None;
    let mut listener_id: Option<i64> = None;
    if let Some(pbid_raw) = &session.pbid {
        let pbid = crate::protocol::parse_bid(pbid_raw)
            .map_err(|e| StorageError::Database(format!("Bad parent beacon id: {e}")))?;
        parent_id = beacon_pk_for_bid(conn, team_server_id, pbid)?;
        if session.session.as_deref() == Some("beacon") {
            // Chained beacons don't name their listener; assume the first
            // configured SMB listener since nothing better is on the wire.
            listener_id = conn
                .query_row(
                    "SELECT id FROM listeners
                     WHERE team_server_id = ?1 AND payload = 'windows/beacon_bind_pipe'
                     ORDER BY id LIMIT 1",
                    params![team_server_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(StorageError::from)?;
        }
    } else if let Some(name) = &session.listener {
        listener_id = conn
            .query_row(
                "SELECT id FROM listeners WHERE team_server_id = ?1 AND name = ?2",
                params![team_server_id, name],
                |row| row.get(0),
            )
            .optional()
            .map_err(StorageError::from)?;
    }

    conn.execute(
        "INSERT INTO beacons (team_server_id, bid, user, computer, host, internal, external,
                              process, pid, barch, os, ver, build, arch, session, note, charset,
                              is64, opened_at, parent_id, listener_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17,
                 ?18, ?19, ?20, ?21)
         ON CONFLICT(team_server_id, bid) DO UPDATE SET
             user = excluded.user,
             computer = excluded.computer,
             host = excluded.host,
             internal = excluded.internal,
             external = excluded.external,
             process = excluded.process,
             pid = excluded.pid,
             barch = excluded.barch,
             os = excluded.os,
             ver = excluded.ver,
             build = excluded.build,
             arch = excluded.arch,
             session = excluded.session,
             note = excluded.note,
             charset = excluded.charset,
             is64 = excluded.is64,
             opened_at = MIN(opened_at, excluded.opened_at),
             parent_id = excluded.parent_id,
             listener_id = excluded.listener_id",
        params![
            team_server_id,
            session.id,
            session.user,
            session.computer,
            session.host,
            session.internal,
            session.external,
            session.process,
            session.pid,
            session.barch,
            session.os,
            session.ver,
            session.build,
            session.arch,
            session.session,
            session.note,
            session.charset,
            session.is64,
            session.opened_ms,
            parent_id,
            listener_id,
        ],
    )
    .map_err(StorageError::from)?;

    beacon_pk_for_bid(conn, team_server_id, session.id)?.ok_or_else(|| {
        StorageError::Database("Beacon row missing after upsert".into()).into()
    })
}

fn apply_checkin_sync(
    conn: &Connection,
    team_server_id: i64,
    bid: i64,
    last_ms_ago: i64,
    sleep: Option<SleepParams>,
    fuzz_ms: i64,
) -> Result<CheckinOutcome> {
    let Some(beacon_id) = beacon_pk_for_bid(conn, team_server_id, bid)? else {
        return Ok(CheckinOutcome {
            updated: false,
            recent: false,
            beacon_id: None,
        });
    };

    // The delta is "milliseconds ago" at the time the line was generated,
    // so the derived last-seen drifts a little on every line. Only write
    // when it moves the stored value by more than a minute.
    let approx_last = now_ms() - last_ms_ago;
    let updated = conn
        .execute(
            "UPDATE beacons SET last_seen_at = ?2
             WHERE id = ?1 AND (last_seen_at IS NULL OR last_seen_at <= ?2 - 60000)",
            params![beacon_id, approx_last],
        )
        .map_err(StorageError::from)?;

    let recent = last_ms_ago < 60_000;
    if updated > 0 && recent {
        apply_presence(conn, beacon_id, approx_last, sleep, fuzz_ms)?;
    }

    Ok(CheckinOutcome {
        updated: updated > 0,
        recent,
        beacon_id: Some(beacon_id),
    })
}

/// Extend or open a presence window for a fresh check-in.
fn apply_presence(
    conn: &Connection,
    beacon_id: i64,
    checkin_ms: i64,
    sleep: Option<SleepParams>,
    fuzz_ms: i64,
) -> Result<()> {
    let params_now = match sleep {
        Some(p) => {
            if p.negative() {
                // Negative sleep metadata means the server considers the
                // beacon gone; keep the existing window untouched.
                return Ok(());
            }
            p
        }
        None => last_acknowledged_sleep(conn, beacon_id)?,
    };

    let last_window = conn
        .query_row(
            "SELECT id, beacon_id, first_checkin_at, last_checkin_at, sleep_seconds, sleep_jitter
             FROM beacon_presence WHERE beacon_id = ?1
             ORDER BY id DESC LIMIT 1",
            params![beacon_id],
            presence_from_row,
        )
        .optional()
        .map_err(StorageError::from)?;

    let decision = presence::plan_checkin(last_window.as_ref(), checkin_ms, params_now, fuzz_ms);

    if let Some(id) = decision.extend {
        conn.execute(
            "UPDATE beacon_presence SET last_checkin_at = ?2 WHERE id = ?1",
            params![id, checkin_ms],
        )
        .map_err(StorageError::from)?;
    }
    if decision.create {
        conn.execute(
            "INSERT INTO beacon_presence
                 (beacon_id, first_checkin_at, last_checkin_at, sleep_seconds, sleep_jitter)
             VALUES (?1, ?2, ?2, ?3, ?4)",
            params![beacon_id, checkin_ms, params_now.seconds, params_now.jitter],
        )
        .map_err(StorageError::from)?;
    }
    Ok(())
}

/// Derive sleep cadence from the most recent sleep-affecting log entry.
/// Interactive (zero sleep) is the default when nothing matches.
fn last_acknowledged_sleep(conn: &Connection, beacon_id: i64) -> Result<SleepParams> {
    let data: Option<String> = conn
        .query_row(
            "SELECT data FROM beacon_logs
             WHERE beacon_id = ?1
               AND ((kind = 'task' AND (data LIKE 'Tasked beacon to sleep for %'
                                        OR data = 'Tasked beacon to become interactive'))
                 OR (kind = 'output' AND (data LIKE 'started SOCKS4a server on: %'
                                          OR data LIKE 'started SOCKS5 server on: %')))
             ORDER BY logged_at DESC LIMIT 1",
            params![beacon_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(StorageError::from)?;

    Ok(data
        .as_deref()
        .map(presence::parse_sleep_task)
        .unwrap_or_default())
}

fn presence_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PresenceRow> {
    Ok(PresenceRow {
        id: row.get(0)?,
        beacon_id: row.get(1)?,
        first_checkin_at: row.get(2)?,
        last_checkin_at: row.get(3)?,
        sleep_seconds: row.get(4)?,
        sleep_jitter: row.get(5)?,
    })
}

fn insert_beacon_log_sync(conn: &Connection, log: &NewBeaconLog) -> Result<i64> {
    // Savepoint so the correlation insert and the log insert land together.
    conn.execute_batch("SAVEPOINT ingest_log")
        .map_err(StorageError::from)?;
    let result = insert_beacon_log_inner(conn, log);
    match &result {
        Ok(_) => conn
            .execute_batch("RELEASE ingest_log")
            .map_err(StorageError::from)?,
        Err(_) => {
            let _ = conn.execute_batch("ROLLBACK TO ingest_log; RELEASE ingest_log");
        }
    }
    result
}

fn insert_beacon_log_inner(conn: &Connection, log: &NewBeaconLog) -> Result<i64> {
    let ctx = correlation_context(conn, log)?;
    let plan = correlate::plan_beacon_log(&log.kind, &log.data, log.task_id.as_deref(), &ctx);

    let action_id = match plan {
        CorrelationPlan::Attach(id) => Some(id),
        CorrelationPlan::Create { accept_output } => {
            conn.execute(
                "INSERT INTO actions (team_server_id, beacon_id, start_at, accept_output)
                 VALUES (?1, ?2, ?3, ?4)",
                params![log.team_server_id, log.beacon_id, log.logged_at, accept_output],
            )
            .map_err(StorageError::from)?;
            Some(conn.last_insert_rowid())
        }
        CorrelationPlan::Skip => None,
    };

    conn.execute(
        "INSERT INTO beacon_logs
             (team_server_id, beacon_id, kind, data, operator, output_job, task_id,
              logged_at, action_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            log.team_server_id,
            log.beacon_id,
            log.kind,
            log.data,
            log.operator,
            log.output_job,
            log.task_id,
            log.logged_at,
            action_id,
        ],
    )
    .map_err(StorageError::from)?;
    Ok(conn.last_insert_rowid())
}

/// Gather the action lookups the correlation planner needs, scoped to the
/// log's beacon and timestamp.
fn correlation_context(conn: &Connection, log: &NewBeaconLog) -> Result<CorrelationContext> {
    let task_action = match &log.task_id {
        Some(task_id) => conn
            .query_row(
                "SELECT DISTINCT a.id FROM actions a
                 JOIN beacon_logs l ON l.action_id = a.id
                 WHERE a.beacon_id = ?1 AND l.task_id = ?2
                 LIMIT 1",
                params![log.beacon_id, task_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(StorageError::from)?,
        None => None,
    };

    let action_within_last_second = conn
        .query_row(
            "SELECT EXISTS(
                 SELECT 1 FROM actions
                 WHERE beacon_id = ?1 AND start_at >= ?2 - 1000 AND start_at <= ?2)",
            params![log.beacon_id, log.logged_at],
            |row| row.get(0),
        )
        .map_err(StorageError::from)?;

    let latest_action = conn
        .query_row(
            "SELECT id FROM actions
             WHERE beacon_id = ?1 AND start_at <= ?2
             ORDER BY start_at DESC LIMIT 1",
            params![log.beacon_id, log.logged_at],
            |row| row.get(0),
        )
        .optional()
        .map_err(StorageError::from)?;

    let latest_accepting_action = conn
        .query_row(
            "SELECT id FROM actions
             WHERE beacon_id = ?1 AND start_at <= ?2 AND accept_output = 1
             ORDER BY start_at DESC LIMIT 1",
            params![log.beacon_id, log.logged_at],
            |row| row.get(0),
        )
        .optional()
        .map_err(StorageError::from)?;

    Ok(CorrelationContext {
        task_action,
        action_within_last_second,
        latest_action,
        latest_accepting_action,
    })
}

fn insert_archive_sync(conn: &Connection, archive: &NewArchive) -> Result<i64> {
    // Webhit/notify archives carry no beacon and stay uncorrelated.
    let latest_action: Option<i64> = match archive.beacon_id {
        Some(beacon_id) => conn
            .query_row(
                "SELECT id FROM actions
                 WHERE beacon_id = ?1 AND start_at <= ?2
                 ORDER BY start_at DESC LIMIT 1",
                params![beacon_id, archive.logged_at],
                |row| row.get(0),
            )
            .optional()
            .map_err(StorageError::from)?,
        None => None,
    };
    let action_id = match correlate::plan_archive(latest_action) {
        CorrelationPlan::Attach(id) => Some(id),
        CorrelationPlan::Create { .. } | CorrelationPlan::Skip => None,
    };

    conn.execute(
        "INSERT INTO archives
             (team_server_id, beacon_id, kind, data, tactic, logged_at, action_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            archive.team_server_id,
            archive.beacon_id,
            archive.kind,
            archive.data,
            archive.tactic,
            archive.logged_at,
            action_id,
        ],
    )
    .map_err(StorageError::from)?;
    Ok(conn.last_insert_rowid())
}

fn insert_credential_sync(conn: &Connection, credential: &NewCredential) -> Result<i64> {
    conn.execute(
        "INSERT OR IGNORE INTO credentials
             (team_server_id, user, password, host, realm, source, added_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            credential.team_server_id,
            credential.user,
            credential.password,
            credential.host,
            credential.realm,
            credential.source,
            credential.added_at,
        ],
    )
    .map_err(StorageError::from)?;
    Ok(conn.last_insert_rowid())
}

fn insert_download_sync(conn: &Connection, download: &NewDownload) -> Result<i64> {
    conn.execute(
        "INSERT OR IGNORE INTO downloads
             (team_server_id, beacon_id, size, path, name, date_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            download.team_server_id,
            download.beacon_id,
            download.size,
            download.path,
            download.name,
            download.date_at,
        ],
    )
    .map_err(StorageError::from)?;
    Ok(conn.last_insert_rowid())
}

fn wipe_team_server_data_sync(conn: &Connection, team_server_id: i64) -> Result<usize> {
    conn.execute_batch("SAVEPOINT wipe_ts")
        .map_err(StorageError::from)?;
    let result = wipe_team_server_data_inner(conn, team_server_id);
    match &result {
        Ok(_) => conn
            .execute_batch("RELEASE wipe_ts")
            .map_err(StorageError::from)?,
        Err(_) => {
            let _ = conn.execute_batch("ROLLBACK TO wipe_ts; RELEASE wipe_ts");
        }
    }
    result
}

fn wipe_team_server_data_inner(conn: &Connection, team_server_id: i64) -> Result<usize> {
    let mut total = 0usize;
    total += conn
        .execute(
            "DELETE FROM beacon_presence WHERE beacon_id IN
                 (SELECT id FROM beacons WHERE team_server_id = ?1)",
            params![team_server_id],
        )
        .map_err(StorageError::from)?;
    for table in [
        "beacon_logs",
        "archives",
        "actions",
        "credentials",
        "downloads",
        "beacons",
        "listeners",
    ] {
        total += conn
            .execute(
                &format!("DELETE FROM {table} WHERE team_server_id = ?1"),
                params![team_server_id],
            )
            .map_err(StorageError::from)?;
    }
    Ok(total)
}

// =============================================================================
// Read Queries
// =============================================================================

fn team_server_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TeamServerRecord> {
    Ok(TeamServerRecord {
        id: row.get(0)?,
        description: row.get(1)?,
        hostname: row.get(2)?,
        port: row.get(3)?,
        password: row.get(4)?,
        active: row.get(5)?,
    })
}

fn query_team_server(conn: &Connection, id: i64) -> Result<Option<TeamServerRecord>> {
    conn.query_row(
        "SELECT id, description, hostname, port, password, active
         FROM team_servers WHERE id = ?1",
        params![id],
        team_server_from_row,
    )
    .optional()
    .map_err(StorageError::from)
    .map_err(Into::into)
}

fn list_team_servers_sync(conn: &Connection) -> Result<Vec<TeamServerRecord>> {
    let mut stmt = conn
        .prepare(
            "SELECT id, description, hostname, port, password, active
             FROM team_servers ORDER BY id",
        )
        .map_err(StorageError::from)?;
    let rows = stmt
        .query_map([], team_server_from_row)
        .map_err(StorageError::from)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row.map_err(StorageError::from)?);
    }
    Ok(out)
}

fn query_beacon_for_bid(
    conn: &Connection,
    team_server_id: i64,
    bid: i64,
) -> Result<Option<BeaconRow>> {
    conn.query_row(
        "SELECT id, team_server_id, bid, user, computer, process, session,
                opened_at, last_seen_at, parent_id, listener_id
         FROM beacons WHERE team_server_id = ?1 AND bid = ?2",
        params![team_server_id, bid],
        |row| {
            Ok(BeaconRow {
                id: row.get(0)?,
                team_server_id: row.get(1)?,
                bid: row.get(2)?,
                user: row.get(3)?,
                computer: row.get(4)?,
                process: row.get(5)?,
                session: row.get(6)?,
                opened_at: row.get(7)?,
                last_seen_at: row.get(8)?,
                parent_id: row.get(9)?,
                listener_id: row.get(10)?,
            })
        },
    )
    .optional()
    .map_err(StorageError::from)
    .map_err(Into::into)
}

fn list_actions_sync(conn: &Connection, beacon_id: i64) -> Result<Vec<ActionRow>> {
    let mut stmt = conn
        .prepare(
            "SELECT id, team_server_id, beacon_id, start_at, accept_output
             FROM actions WHERE beacon_id = ?1 ORDER BY start_at, id",
        )
        .map_err(StorageError::from)?;
    let rows = stmt
        .query_map(params![beacon_id], |row| {
            Ok(ActionRow {
                id: row.get(0)?,
                team_server_id: row.get(1)?,
                beacon_id: row.get(2)?,
                start_at: row.get(3)?,
                accept_output: row.get(4)?,
            })
        })
        .map_err(StorageError::from)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row.map_err(StorageError::from)?);
    }
    Ok(out)
}

fn list_presence_sync(conn: &Connection, beacon_id: i64) -> Result<Vec<PresenceRow>> {
    let mut stmt = conn
        .prepare(
            "SELECT id, beacon_id, first_checkin_at, last_checkin_at, sleep_seconds, sleep_jitter
             FROM beacon_presence WHERE beacon_id = ?1 ORDER BY id",
        )
        .map_err(StorageError::from)?;
    let rows = stmt
        .query_map(params![beacon_id], presence_from_row)
        .map_err(StorageError::from)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row.map_err(StorageError::from)?);
    }
    Ok(out)
}

fn sync_watermarks_sync(conn: &Connection, team_server_id: i64) -> Result<SyncWatermarks> {
    let high = |sql: &str| -> Result<i64> {
        conn.query_row(sql, params![team_server_id], |row| {
            row.get::<_, Option<i64>>(0)
        })
        .map(|v| v.unwrap_or(0))
        .map_err(StorageError::from)
        .map_err(Into::into)
    };
    Ok(SyncWatermarks {
        last_session: high("SELECT MAX(opened_at) FROM beacons WHERE team_server_id = ?1")?,
        last_archive: high("SELECT MAX(logged_at) FROM archives WHERE team_server_id = ?1")?,
        last_beacon_log: high("SELECT MAX(logged_at) FROM beacon_logs WHERE team_server_id = ?1")?,
        last_credential: high("SELECT MAX(added_at) FROM credentials WHERE team_server_id = ?1")?,
        last_download: high("SELECT MAX(date_at) FROM downloads WHERE team_server_id = ?1")?,
    })
}

fn counts_sync(conn: &Connection) -> Result<StorageCounts> {
    let count = |table: &str| -> Result<i64> {
        conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
            row.get(0)
        })
        .map_err(StorageError::from)
        .map_err(Into::into)
    };
    Ok(StorageCounts {
        team_servers: count("team_servers")?,
        listeners: count("listeners")?,
        beacons: count("beacons")?,
        beacon_logs: count("beacon_logs")?,
        archives: count("archives")?,
        actions: count("actions")?,
        credentials: count("credentials")?,
        downloads: count("downloads")?,
    })
}
