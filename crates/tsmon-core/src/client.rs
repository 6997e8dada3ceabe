//! Headless scripting client subprocess management.
//!
//! Each poll runs the team server vendor's Java scripting client in
//! headless mode with a generated sync script. The script replays server
//! state as tagged JSON lines on stdout, filtered to rows newer than the
//! local mirror's watermarks so reconnects don't re-emit history.
//!
//! stdout and stderr are piped and forwarded line by line into a single
//! channel; the parse loop treats them uniformly since the JVM writes
//! diagnostics to either.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::debug;

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::storage::{SyncWatermarks, TeamServerRecord, now_ms};

/// Environment variable to override the client jar path.
const CLIENT_JAR_ENV: &str = "TSMON_CLIENT_JAR";

/// Entry point class of the headless scripting client.
const HEADLESS_MAIN: &str = "aggressor.headless.Start";

/// Buffered lines before the reader tasks apply backpressure.
const LINE_CHANNEL_CAPACITY: usize = 256;

/// Minimal script used by health checks: connect, wait for sync, exit.
const HEALTHCHECK_SCRIPT: &str = r#"println("Connected OK. Synchronizing...");

on ready {
   println("Synchronized OK.");
   closeClient();
}
"#;

/// Resolve the client jar, newest installer layout first.
///
/// Order: `TSMON_CLIENT_JAR` env var, explicit config path, then the
/// conventional install directory. Within an install directory the 4.9+
/// `client/` subdirectory jar wins over the 4.6+ sibling client jar, which
/// wins over the combined jar.
pub fn resolve_jar_path(config: &ClientConfig) -> Result<PathBuf, ClientError> {
    if let Ok(path) = std::env::var(CLIENT_JAR_ENV) {
        return Ok(PathBuf::from(path));
    }
    if let Some(path) = &config.jar_path {
        return Ok(path.clone());
    }

    let mut jar_path = if cfg!(windows) {
        PathBuf::from(r"C:\Tools\cobaltstrike\cobaltstrike.jar")
    } else {
        PathBuf::from("/opt/cobaltstrike/cobaltstrike.jar")
    };
    let Some(install_dir) = jar_path.parent().map(Path::to_path_buf) else {
        return Err(ClientError::JarNotFound(jar_path.display().to_string()));
    };

    let split_client_jar = install_dir.join("cobaltstrike-client.jar");
    if split_client_jar.exists() {
        jar_path = split_client_jar;
    }
    let nested_client_jar = install_dir.join("client").join("cobaltstrike-client.jar");
    if nested_client_jar.exists() {
        jar_path = nested_client_jar;
    }
    Ok(jar_path)
}

/// Render the sync script handed to the headless client.
///
/// The script registers dump handlers for listeners, beacon metadata,
/// sessions, archives, beacon logs, credentials, and downloads, each
/// printing one tagged JSON line, and embeds the caller's watermarks so
/// only rows newer than the local mirror are replayed.
#[must_use]
pub fn render_sync_script(marks: SyncWatermarks) -> String {
    format!(
        r#"# Generated sync script. Emits one tagged JSON line per record:
#   [<tag>] [<id>] <json>
$last_session = {session}L;
$last_archive = {archive}L;
$last_beaconlog = {beaconlog}L;
$last_credential = {credential}L;
$last_download = {download}L;

sub emit {{
    println("[" . $1 . "] [" . $2 . "] " . tojson($3));
}}

on ready {{
    foreach $l (listeners_stageless()) {{
        emit("L", listener_describe($l), listener_info($l));
    }}
    foreach $b (beacons()) {{
        if (long($b['opened']) > $last_session) {{
            emit("S", $b['id'], $b);
        }}
    }}
    foreach $a (data_keys("archives")) {{
        if (long($a['when']) > $last_archive) {{
            emit("A", $a['when'], $a);
        }}
    }}
    foreach $c (credentials()) {{
        if (long($c['added']) > $last_credential) {{
            emit("C", $c['added'], $c);
        }}
    }}
    foreach $d (downloads()) {{
        if (long($d['date']) > $last_download) {{
            emit("D", $d['date'], $d);
        }}
    }}
}}

on beacons {{
    foreach $b ($1) {{
        emit("M", $b['id'], %(last => $b['last'], sleep => $b['sleep']));
    }}
}}

on beacon_initial {{
    emit("S", $1, beacon_info($1));
}}

on archive {{
    if (long($1['when']) > $last_archive) {{
        emit("A", $1['when'], $1);
    }}
}}

on beacon_output {{
    emit("B", ticks(), %(bid => $1, type => "beacon_output", data => $2, when => $3));
}}

on beacon_log_entry {{
    if (long($1['when']) > $last_beaconlog) {{
        emit("B", ticks(), $1);
    }}
}}

on credentials {{
    foreach $c ($1) {{
        if (long($c['added']) > $last_credential) {{
            emit("C", $c['added'], $c);
        }}
    }}
}}

on downloads {{
    foreach $d ($1) {{
        if (long($d['date']) > $last_download) {{
            emit("D", $d['date'], $d);
        }}
    }}
}}
"#,
        session = marks.last_session,
        archive = marks.last_archive,
        beaconlog = marks.last_beacon_log,
        credential = marks.last_credential,
        download = marks.last_download,
    )
}

/// A running headless client: its process plus the merged line stream.
pub struct ClientProcess {
    child: Child,
    lines: mpsc::Receiver<String>,
    /// Script temp file, removed on drop.
    _script: tempfile::NamedTempFile,
}

impl ClientProcess {
    /// Next line from the merged stdout/stderr stream. `None` when both
    /// pipes have closed.
    pub async fn next_line(&mut self) -> Option<String> {
        self.lines.recv().await
    }

    /// Kill the JVM. Used when a server is disabled mid-stream or on
    /// desync.
    pub async fn kill(&mut self) -> Result<(), ClientError> {
        self.child
            .kill()
            .await
            .map_err(|e| ClientError::Process(format!("Failed to kill client: {e}")))
    }

    /// Wait for the JVM to exit on its own.
    pub async fn wait(&mut self) -> Result<std::process::ExitStatus, ClientError> {
        self.child
            .wait()
            .await
            .map_err(|e| ClientError::Process(format!("Failed to wait for client: {e}")))
    }
}

/// Launcher for the headless scripting client.
#[derive(Debug, Clone)]
pub struct ScriptingClient {
    config: ClientConfig,
}

impl ScriptingClient {
    #[must_use]
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }

    /// Spawn the client against `server` running `script`.
    ///
    /// The JVM is launched with a small fixed heap and parallel GC so a
    /// stuck sync can't eat the host, and with the jar directory as its
    /// working directory (the client resolves resources relative to it).
    pub fn spawn(
        &self,
        server: &TeamServerRecord,
        script: &str,
    ) -> Result<ClientProcess, ClientError> {
        let jar_path = resolve_jar_path(&self.config)?;
        let jar_dir = jar_path
            .parent()
            .filter(|p| p.is_dir())
            .ok_or_else(|| ClientError::BadJarDirectory(jar_path.display().to_string()))?
            .to_path_buf();

        let script_file = write_script(script)?;

        // Unique-per-second nickname so concurrent reconnects don't clash
        // on the server's operator list.
        let nickname = format!("tsmon{}", now_ms() / 1000);

        let mut cmd = Command::new("java");
        cmd.arg(format!("-XX:ParallelGCThreads={}", self.config.gc_threads))
            .arg("-XX:+AggressiveHeap")
            .arg("-XX:+UseParallelGC")
            .arg(format!("-Xmx{}M", self.config.max_heap_mb))
            .arg("-classpath")
            .arg(&jar_path)
            .arg(HEADLESS_MAIN)
            .arg(&server.hostname)
            .arg(server.port.to_string())
            .arg(&nickname)
            .arg(&server.password)
            .arg(script_file.path())
            .current_dir(&jar_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ClientError::JvmNotFound,
            _ => ClientError::Process(format!("Failed to spawn client: {e}")),
        })?;

        let (line_tx, line_rx) = mpsc::channel::<String>(LINE_CHANNEL_CAPACITY);

        if let Some(stdout) = child.stdout.take() {
            spawn_line_forwarder(stdout, line_tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_line_forwarder(stderr, line_tx);
        }

        debug!(server = server.id, %nickname, jar = %jar_path.display(), "spawned scripting client");

        Ok(ClientProcess {
            child,
            lines: line_rx,
            _script: script_file,
        })
    }
}

fn write_script(script: &str) -> Result<tempfile::NamedTempFile, ClientError> {
    use std::io::Write;
    let mut file = tempfile::Builder::new()
        .prefix("tsmon-sync-")
        .suffix(".cna")
        .tempfile()
        .map_err(|e| ClientError::Script(format!("Failed to create script file: {e}")))?;
    file.write_all(script.as_bytes())
        .map_err(|e| ClientError::Script(format!("Failed to write script file: {e}")))?;
    file.flush()
        .map_err(|e| ClientError::Script(format!("Failed to flush script file: {e}")))?;
    Ok(file)
}

fn spawn_line_forwarder<R>(reader: R, tx: mpsc::Sender<String>)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).await.is_err() {
                break;
            }
        }
    });
}

/// Result of a team server health check.
#[derive(Debug, Clone, Default)]
pub struct HealthReport {
    /// Error from the raw TCP connect, if it failed.
    pub tcp_error: Option<String>,
    /// Combined output of a throwaway client connect-and-sync run.
    pub client_output: Option<String>,
    /// Whether the client reached a full sync.
    pub synchronized: bool,
}

/// Probe a team server: raw TCP reachability first, then a full
/// connect-and-sync with a throwaway client.
pub async fn healthcheck(
    client: &ScriptingClient,
    server: &TeamServerRecord,
    timeout: Duration,
) -> HealthReport {
    let mut report = HealthReport::default();

    let addr = format!("{}:{}", server.hostname, server.port);
    match tokio::time::timeout(timeout, TcpStream::connect(&addr)).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => {
            report.tcp_error = Some(e.to_string());
            return report;
        }
        Err(_) => {
            report.tcp_error = Some(format!("connect to {addr} timed out"));
            return report;
        }
    }

    let mut process = match client.spawn(server, HEALTHCHECK_SCRIPT) {
        Ok(p) => p,
        Err(e) => {
            report.client_output = Some(e.to_string());
            return report;
        }
    };

    let mut output = String::new();
    let collect = async {
        while let Some(line) = process.next_line().await {
            if line.contains("Synchronized OK") {
                report.synchronized = true;
            }
            output.push_str(&line);
            output.push('\n');
        }
    };
    if tokio::time::timeout(timeout, collect).await.is_err() {
        let _ = process.kill().await;
        output.push_str("health check timed out\n");
    }

    if output.contains("Could not find or load main class aggressor.headless.Start") {
        output.push_str("Try (re-)running the team server's update script\n");
    }
    report.client_output = Some(output);
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_jar_path_wins_over_defaults() {
        let config = ClientConfig {
            jar_path: Some(PathBuf::from("/tmp/custom/client.jar")),
            ..ClientConfig::default()
        };
        let path = resolve_jar_path(&config).unwrap();
        assert_eq!(path, PathBuf::from("/tmp/custom/client.jar"));
    }

    #[test]
    fn sync_script_embeds_watermarks() {
        let script = render_sync_script(SyncWatermarks {
            last_session: 111,
            last_archive: 222,
            last_beacon_log: 333,
            last_credential: 444,
            last_download: 555,
        });
        assert!(script.contains("$last_session = 111L;"));
        assert!(script.contains("$last_archive = 222L;"));
        assert!(script.contains("$last_beaconlog = 333L;"));
        assert!(script.contains("$last_credential = 444L;"));
        assert!(script.contains("$last_download = 555L;"));
    }

    #[test]
    fn healthcheck_script_closes_after_sync() {
        assert!(HEALTHCHECK_SCRIPT.contains("on ready"));
        assert!(HEALTHCHECK_SCRIPT.contains("closeClient()"));
    }
}
