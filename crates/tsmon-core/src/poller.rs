//! Poller supervision and the per-server ingest loop.
//!
//! One poll task per team server owns a scripting-client subprocess and
//! consumes its tagged line stream. The supervisor holds an explicit
//! registry of running tasks with single-flight admission (one poller per
//! server, with a TTL so a wedged task can be replaced) and cancellation
//! via watch channels.
//!
//! The ingest loop is deliberately skip-tolerant: a line that fails the
//! grammar or a decoder is logged and dropped, while storage and process
//! failures bubble to the retry loop, which relaunches the client after a
//! delay for as long as the server stays active.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::client::{ClientProcess, ScriptingClient, render_sync_script};
use crate::config::{ClientConfig, PollerConfig};
use crate::error::{Error, Result};
use crate::merge::OutputMergeBuffer;
use crate::presence;
use crate::protocol::{self, ControlSignal, StreamRecord, control_signal, is_noise, parse_line};
use crate::storage::{
    NewArchive, NewBeaconLog, NewCredential, NewDownload, StorageHandle, TeamServerRecord,
};

/// Why a single client stream stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamExit {
    /// The pipes closed; the client exited or the connection dropped.
    Ended,
    /// The server's replay log is behind our mirror; local data was wiped
    /// and a full resync is needed.
    Desynchronized,
    /// The server was marked inactive.
    Deactivated,
    /// The supervisor asked us to stop.
    Cancelled,
}

struct PollerEntry {
    cancel: watch::Sender<bool>,
    handle: JoinHandle<()>,
    started: Instant,
}

/// Registry of running poll tasks, one per team server.
pub struct PollerSupervisor {
    storage: StorageHandle,
    poller_config: PollerConfig,
    client: ScriptingClient,
    tasks: std::sync::Mutex<HashMap<i64, PollerEntry>>,
}

impl PollerSupervisor {
    #[must_use]
    pub fn new(
        storage: StorageHandle,
        poller_config: PollerConfig,
        client_config: ClientConfig,
    ) -> Self {
        Self {
            storage,
            poller_config,
            client: ScriptingClient::new(client_config),
            tasks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Startup sweep: launch a poller for every active registered server.
    pub async fn start_all(&self) -> Result<()> {
        let servers = self.storage.list_team_servers().await?;
        for server in servers {
            if server.active {
                if let Err(e) = self.add(server.id).await {
                    warn!(server = server.id, error = %e, "Could not start poller");
                }
            } else {
                debug!(server = server.id, "Skipping inactive server");
            }
        }
        Ok(())
    }

    /// Launch a poll task for one server.
    ///
    /// Single-flight: refuses while a live task exists for the server.
    /// A finished task is replaced silently; a task older than the TTL is
    /// presumed wedged, cancelled, and replaced.
    pub async fn add(&self, server_id: i64) -> Result<()> {
        let server = self
            .storage
            .get_team_server(server_id)
            .await?
            .ok_or(Error::UnknownTeamServer(server_id))?;

        let ttl = Duration::from_secs(self.poller_config.single_flight_ttl_secs);
        {
            let mut tasks = lock_tasks(&self.tasks)?;
            if let Some(entry) = tasks.get(&server_id) {
                if entry.handle.is_finished() {
                    tasks.remove(&server_id);
                } else if entry.started.elapsed() < ttl {
                    return Err(Error::AlreadyPolling(server_id));
                } else {
                    warn!(server = server_id, "Replacing poller past its single-flight TTL");
                    let _ = entry.cancel.send(true);
                    entry.handle.abort();
                    tasks.remove(&server_id);
                }
            }

            let (cancel_tx, cancel_rx) = watch::channel(false);
            let task = PollTask {
                storage: self.storage.clone(),
                client: self.client.clone(),
                config: self.poller_config.clone(),
                server,
                cancel: cancel_rx,
            };
            let handle = tokio::spawn(task.run());
            tasks.insert(
                server_id,
                PollerEntry {
                    cancel: cancel_tx,
                    handle,
                    started: Instant::now(),
                },
            );
        }
        info!(server = server_id, "Started poller");
        Ok(())
    }

    /// Stop the poll task for one server, if any.
    pub async fn remove(&self, server_id: i64) -> Result<()> {
        let entry = lock_tasks(&self.tasks)?.remove(&server_id);
        if let Some(entry) = entry {
            let _ = entry.cancel.send(true);
            let _ = entry.handle.await;
            info!(server = server_id, "Stopped poller");
        }
        Ok(())
    }

    /// Ids of servers with a live poll task.
    pub fn running(&self) -> Vec<i64> {
        self.tasks.lock().map_or_else(
            |_| Vec::new(),
            |tasks| {
                tasks
                    .iter()
                    .filter(|(_, e)| !e.handle.is_finished())
                    .map(|(id, _)| *id)
                    .collect()
            },
        )
    }

    /// Cancel every poll task and wait for them to exit.
    pub async fn shutdown(&self) -> Result<()> {
        let entries: Vec<(i64, PollerEntry)> = lock_tasks(&self.tasks)?.drain().collect();
        for (server_id, entry) in entries {
            let _ = entry.cancel.send(true);
            let _ = entry.handle.await;
            debug!(server = server_id, "Poller exited");
        }
        Ok(())
    }
}

fn lock_tasks(
    tasks: &std::sync::Mutex<HashMap<i64, PollerEntry>>,
) -> Result<std::sync::MutexGuard<'_, HashMap<i64, PollerEntry>>> {
    tasks.lock().map_err(|_| {
        crate::error::StorageError::Database("Poller registry lock poisoned".into()).into()
    })
}

/// One server's poll loop: launch the client, ingest its stream, and
/// relaunch on failure until cancelled or deactivated.
struct PollTask {
    storage: StorageHandle,
    client: ScriptingClient,
    config: PollerConfig,
    server: TeamServerRecord,
    cancel: watch::Receiver<bool>,
}

impl PollTask {
    async fn run(mut self) {
        let retry_delay = Duration::from_secs(self.config.retry_delay_secs);
        loop {
            if *self.cancel.borrow() {
                return;
            }

            match self.poll_once().await {
                Ok(StreamExit::Cancelled | StreamExit::Deactivated) => return,
                Ok(StreamExit::Desynchronized) => {
                    // Mirror wiped; reconnect immediately with zeroed
                    // watermarks for a full resync.
                    info!(server = self.server.id, "Resynchronizing after wipe");
                }
                Ok(StreamExit::Ended) => {
                    debug!(server = self.server.id, "Client stream ended; reconnecting");
                    if self.sleep_or_cancel(retry_delay).await {
                        return;
                    }
                }
                Err(e) => {
                    error!(server = self.server.id, error = %e, "Poll attempt failed");
                    if self.sleep_or_cancel(retry_delay).await {
                        return;
                    }
                }
            }
        }
    }

    /// Sleep for `delay`, returning true if cancelled meanwhile.
    async fn sleep_or_cancel(&mut self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.changed() => *self.cancel.borrow(),
            () = tokio::time::sleep(delay) => false,
        }
    }

    /// One client lifetime: spawn, ingest until the stream stops.
    async fn poll_once(&mut self) -> Result<StreamExit> {
        let marks = self.storage.sync_watermarks(self.server.id).await?;
        let script = render_sync_script(marks);
        let mut process = self.client.spawn(&self.server, &script)?;

        let exit = self.ingest(&mut process).await;

        // The JVM stays connected until told otherwise.
        if !matches!(exit, Ok(StreamExit::Ended)) {
            let _ = process.kill().await;
        }
        exit
    }

    /// Consume the merged line stream until it ends or a control event
    /// stops it.
    async fn ingest(&mut self, process: &mut ClientProcess) -> Result<StreamExit> {
        let mut state = IngestState::new(self.server.id, self.config.merge_window_ms);
        let liveness_ttl = Duration::from_secs(self.config.liveness_cache_secs);
        let mut liveness_checked = Instant::now();

        loop {
            let line = tokio::select! {
                _ = self.cancel.changed() => {
                    if *self.cancel.borrow() {
                        state.flush_pending(&self.storage).await?;
                        return Ok(StreamExit::Cancelled);
                    }
                    continue;
                }
                line = process.next_line() => line,
            };

            let Some(line) = line else {
                state.flush_pending(&self.storage).await?;
                return Ok(StreamExit::Ended);
            };

            // Re-check the active flag every few seconds, not every line.
            if liveness_checked.elapsed() >= liveness_ttl {
                liveness_checked = Instant::now();
                let active = self
                    .storage
                    .team_server_active(self.server.id)
                    .await?
                    .unwrap_or(false);
                if !active {
                    info!(server = self.server.id, "Server marked inactive; stopping stream");
                    state.flush_pending(&self.storage).await?;
                    return Ok(StreamExit::Deactivated);
                }
            }

            match state.handle_line(&self.storage, &self.config, &line).await? {
                LineOutcome::Continue => {}
                LineOutcome::Desynchronized => {
                    warn!(
                        server = self.server.id,
                        "Local mirror ahead of team server; wiping local copy"
                    );
                    let removed = self.storage.wipe_team_server_data(self.server.id).await?;
                    info!(server = self.server.id, rows = removed, "Wiped local mirror");
                    return Ok(StreamExit::Desynchronized);
                }
            }
        }
    }
}

/// Result of feeding one line to the ingestor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineOutcome {
    /// Line consumed (or skipped); keep streaming.
    Continue,
    /// The desync marker was seen; the caller must wipe and resync.
    Desynchronized,
}

/// Per-stream ingest state: the merge buffer plus a bid-to-row cache so
/// every log line doesn't pay a lookup.
pub struct IngestState {
    team_server_id: i64,
    merge: OutputMergeBuffer,
    bid_cache: HashMap<i64, i64>,
}

impl IngestState {
    #[must_use]
    pub fn new(team_server_id: i64, merge_window_ms: i64) -> Self {
        Self {
            team_server_id,
            merge: OutputMergeBuffer::new(merge_window_ms),
            bid_cache: HashMap::new(),
        }
    }

    /// Feed one raw line from the client stream.
    pub async fn handle_line(
        &mut self,
        storage: &StorageHandle,
        config: &PollerConfig,
        line: &str,
    ) -> Result<LineOutcome> {
        let line = line.trim_end();
        if line.is_empty() || is_noise(line) {
            return Ok(LineOutcome::Continue);
        }

        // Control markers arrive as untagged exception text, so they are
        // only checked on lines that fail the record grammar. Marker
        // substrings inside a record's JSON payload are ordinary data.
        let raw = match parse_line(line) {
            Ok(raw) => raw,
            Err(e) => match control_signal(line) {
                Some(ControlSignal::Desync) => {
                    self.flush_pending(storage).await?;
                    self.bid_cache.clear();
                    return Ok(LineOutcome::Desynchronized);
                }
                Some(ControlSignal::VersionMismatch) => {
                    warn!(
                        server = self.team_server_id,
                        "Client/server version mismatch reported; stream may be incomplete"
                    );
                    return Ok(LineOutcome::Continue);
                }
                None => {
                    debug!(server = self.team_server_id, error = %e, line, "Skipping unparseable line");
                    return Ok(LineOutcome::Continue);
                }
            },
        };

        let record = match protocol::decode(&raw) {
            Ok(record) => record,
            Err(e) => {
                warn!(server = self.team_server_id, tag = %raw.tag, error = %e, "Skipping undecodable record");
                return Ok(LineOutcome::Continue);
            }
        };

        // A non-log record means the fragment burst is over; flush first so
        // row order in the database matches stream order.
        if !matches!(record, StreamRecord::BeaconLog(_)) {
            self.flush_pending(storage).await?;
        }

        match record {
            StreamRecord::Listener(listener) => {
                storage.upsert_listener(self.team_server_id, listener).await?;
            }
            StreamRecord::Metadata(meta) => {
                let sleep = meta
                    .sleep
                    .as_deref()
                    .and_then(presence::parse_sleep_metadata);
                let outcome = storage
                    .apply_checkin(
                        self.team_server_id,
                        meta.beacon_id,
                        meta.last_ms_ago,
                        sleep,
                        config.presence_fuzz_secs * 1000,
                    )
                    .await?;
                if outcome.beacon_id.is_none() {
                    debug!(
                        server = self.team_server_id,
                        bid = meta.beacon_id,
                        "Check-in for unknown beacon"
                    );
                }
            }
            StreamRecord::SessionOpen(session) => {
                let bid = session.id;
                let pk = storage.upsert_beacon(self.team_server_id, session).await?;
                self.bid_cache.insert(bid, pk);
            }
            StreamRecord::Archive(archive) => {
                // An unknown bid downgrades to an unattached archive
                // rather than dropping the record.
                let beacon_id = match &archive.bid {
                    Some(bid) => self.resolve_bid(storage, bid).await?,
                    None => None,
                };
                storage
                    .insert_archive(NewArchive {
                        team_server_id: self.team_server_id,
                        beacon_id,
                        kind: archive.kind,
                        data: archive.data,
                        tactic: archive.tactic,
                        logged_at: archive.when_ms,
                    })
                    .await?;
            }
            StreamRecord::BeaconLog(log) => {
                let Some(beacon_id) = self.resolve_bid(storage, &log.bid).await? else {
                    warn!(
                        server = self.team_server_id,
                        bid = %log.bid,
                        "Dropping log for unknown beacon"
                    );
                    return Ok(LineOutcome::Continue);
                };
                let row = NewBeaconLog {
                    team_server_id: self.team_server_id,
                    beacon_id,
                    kind: log.kind,
                    data: log.data,
                    operator: log.operator,
                    output_job: log.output_job,
                    task_id: log.task_id,
                    logged_at: log.when_ms,
                };
                for ready in self.merge.push(row) {
                    storage.insert_beacon_log(ready).await?;
                }
            }
            StreamRecord::Credential(cred) => {
                storage
                    .insert_credential(NewCredential {
                        team_server_id: self.team_server_id,
                        user: cred.user,
                        password: cred.password,
                        host: cred.host,
                        realm: cred.realm,
                        source: cred.source,
                        added_at: cred.added_ms,
                    })
                    .await?;
            }
            StreamRecord::Download(download) => {
                let beacon_id = match &download.bid {
                    Some(bid) => self.resolve_bid(storage, bid).await?,
                    None => None,
                };
                let Some(beacon_id) = beacon_id else {
                    warn!(
                        server = self.team_server_id,
                        name = download.name.as_deref().unwrap_or(""),
                        "Dropping download with no resolvable beacon"
                    );
                    return Ok(LineOutcome::Continue);
                };
                storage
                    .insert_download(NewDownload {
                        team_server_id: self.team_server_id,
                        beacon_id: Some(beacon_id),
                        size: download.size,
                        path: download.path,
                        name: download.name,
                        date_at: download.date_ms,
                    })
                    .await?;
            }
        }
        Ok(LineOutcome::Continue)
    }

    /// Flush any buffered output row. Call when the stream ends.
    pub async fn flush_pending(&mut self, storage: &StorageHandle) -> Result<()> {
        if let Some(row) = self.merge.flush() {
            storage.insert_beacon_log(row).await?;
        }
        Ok(())
    }

    /// Resolve a wire beacon id to its row, via the stream-local cache.
    async fn resolve_bid(&mut self, storage: &StorageHandle, raw: &str) -> Result<Option<i64>> {
        let bid = match protocol::parse_bid(raw) {
            Ok(bid) => bid,
            Err(e) => {
                warn!(server = self.team_server_id, raw, error = %e, "Unusable beacon id");
                return Ok(None);
            }
        };
        if let Some(pk) = self.bid_cache.get(&bid) {
            return Ok(Some(*pk));
        }
        let row = storage.get_beacon_for_bid(self.team_server_id, bid).await?;
        if let Some(row) = &row {
            self.bid_cache.insert(bid, row.id);
        }
        Ok(row.map(|r| r.id))
    }
}
