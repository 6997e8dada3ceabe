//! Team-server stream grammar and entity decoders.
//!
//! The scripting client emits one event per line on stdout:
//!
//! ```text
//! "[" <tag> "] [" <line-id> "] " <json-object>
//! ```
//!
//! with `<tag>` one of `L` (listener), `M` (beacon check-in metadata),
//! `S` (beacon session open), `A` (archive), `B` (beacon log),
//! `C` (credential), `D` (download). Each tag has its own decode function
//! with an explicit field whitelist and coercion rules; unknown keys are
//! discarded. Lines that fail the grammar or JSON decoding are skipped by
//! the caller, never fatal.
//!
//! Two literal non-JSON substrings act as control signals: an
//! array-index-underflow report means the local mirror is ahead of the
//! remote (desync), and an unauth'd-read report means a client/server
//! version mismatch.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use thiserror::Error;

static LINE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\[(.)\] \[([^\]]+)\] (.*)$").expect("line regex"));

/// Beacon ids arrive as bare digit strings, or wrapped in a single-quoted
/// literal inside `@( ... )` (an artifact of an upstream tooling bug).
static BID_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").expect("bid regex"));

/// Connection-lifecycle noise emitted by the client; filtered before
/// classification and never logged as parse errors.
pub const BENIGN_NOISE: &[&str] = &[
    "Loading Windows error codes",
    "Windows error codes loaded",
    "Connected OK",
    "Synchronizing",
    "Synchronized OK",
    "shutting down client",
    "Disconnected from team server",
];

/// Remote reports an array-index underflow: the local mirror is ahead of
/// the team server (model reset on the TS). Triggers a full local wipe.
pub const DESYNC_MARKER: &str = "illegal subarray";

/// Client/server protocol version mismatch. Logged, stream continues.
pub const VERSION_MISMATCH_MARKER: &str = "read [Manage: unauth'd user]: null";

/// Prefix added to output data by a known tooling addition; stripped on
/// ingest (prefix plus its trailing newline, 17 characters).
const TOOLING_OUTPUT_PREFIX: &str = "received output:";
const TOOLING_OUTPUT_PREFIX_LEN: usize = 17;

/// Control actions signalled by non-JSON marker lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    /// Local state has diverged from the remote; wipe and restart.
    Desync,
    /// Client/server version mismatch; warn and continue.
    VersionMismatch,
}

/// Decode failures. All are skip-and-continue at the stream level.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("line does not match tag grammar")]
    Grammar,
    #[error("unknown tag: {0}")]
    UnknownTag(char),
    #[error("JSON decode failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("missing field: {0}")]
    MissingField(&'static str),
    #[error("bad field {field}: {reason}")]
    BadField { field: &'static str, reason: String },
    #[error("no digits in beacon id: {0:?}")]
    BadBid(String),
}

/// A raw classified line: tag, opaque line id, and the undecoded payload.
#[derive(Debug, Clone)]
pub struct RawLine {
    pub tag: char,
    pub line_id: String,
    pub payload: Value,
}

/// Closed set of typed records produced by the decoders.
#[derive(Debug, Clone)]
pub enum StreamRecord {
    Listener(ListenerRecord),
    Metadata(BeaconMetadata),
    SessionOpen(SessionOpen),
    Archive(ArchiveRecord),
    BeaconLog(BeaconLogRecord),
    Credential(CredentialRecord),
    Download(DownloadRecord),
}

/// `[L]` — a named C2 channel on the team server.
#[derive(Debug, Clone, Default)]
pub struct ListenerRecord {
    pub name: String,
    pub payload: Option<String>,
    pub port: Option<String>,
    pub host: Option<String>,
    pub althost: Option<String>,
    pub bindto: Option<String>,
    pub proxy: Option<String>,
    pub profile: Option<String>,
    pub strategy: Option<String>,
    pub beacons: Option<String>,
    pub status: Option<String>,
    pub maxretry: Option<String>,
    pub guards: Option<String>,
    /// `"true"`/`"false"` string on the wire.
    pub localonly: Option<bool>,
}

/// `[M]` — periodic check-in metadata. The line id is the beacon id, and
/// `last` is a "milliseconds ago" delta, not a timestamp.
#[derive(Debug, Clone)]
pub struct BeaconMetadata {
    pub beacon_id: i64,
    pub last_ms_ago: i64,
    /// Sleep descriptor present in newer protocol versions.
    pub sleep: Option<String>,
}

/// `[S]` — a new implant session.
#[derive(Debug, Clone, Default)]
pub struct SessionOpen {
    pub id: i64,
    pub user: Option<String>,
    pub computer: Option<String>,
    pub host: Option<String>,
    pub internal: Option<String>,
    pub external: Option<String>,
    pub process: Option<String>,
    pub pid: Option<String>,
    pub barch: Option<String>,
    pub os: Option<String>,
    pub ver: Option<String>,
    pub build: Option<String>,
    pub arch: Option<String>,
    pub session: Option<String>,
    pub note: Option<String>,
    pub charset: Option<String>,
    /// `"1"` on the wire.
    pub is64: bool,
    /// Epoch milliseconds.
    pub opened_ms: i64,
    /// Parent beacon id for peer-to-peer chains (raw, pre-bid-parse).
    pub pbid: Option<String>,
    /// Listener name for directly connected sessions.
    pub listener: Option<String>,
}

/// `[A]` — secondary record of beacon activity used for reporting.
#[derive(Debug, Clone)]
pub struct ArchiveRecord {
    pub bid: Option<String>,
    /// Normalized type (see [`clean_type`]).
    pub kind: String,
    pub data: Option<String>,
    pub tactic: Option<String>,
    pub when_ms: i64,
}

/// `[B]` — one unit of interaction with a beacon.
#[derive(Debug, Clone)]
pub struct BeaconLogRecord {
    pub bid: String,
    /// Normalized type (see [`clean_type`]).
    pub kind: String,
    pub data: String,
    pub operator: Option<String>,
    pub output_job: Option<String>,
    /// Task identifier (newer team servers); enables exclusive correlation.
    pub task_id: Option<String>,
    pub when_ms: i64,
}

/// `[C]` — opportunistically captured credential material.
#[derive(Debug, Clone)]
pub struct CredentialRecord {
    pub user: Option<String>,
    pub password: Option<String>,
    pub host: Option<String>,
    pub realm: Option<String>,
    pub source: Option<String>,
    pub added_ms: i64,
}

/// `[D]` — a file downloaded from a compromised host.
#[derive(Debug, Clone)]
pub struct DownloadRecord {
    pub bid: Option<String>,
    pub size: Option<String>,
    pub path: Option<String>,
    pub name: Option<String>,
    pub date_ms: i64,
}

/// True when the line is known connection-lifecycle noise.
pub fn is_noise(line: &str) -> bool {
    BENIGN_NOISE.iter().any(|msg| line.contains(msg))
}

/// Detect a control-signal marker in an arbitrary line.
pub fn control_signal(line: &str) -> Option<ControlSignal> {
    if line.contains(DESYNC_MARKER) {
        Some(ControlSignal::Desync)
    } else if line.contains(VERSION_MISMATCH_MARKER) {
        Some(ControlSignal::VersionMismatch)
    } else {
        None
    }
}

/// Split a line into tag, line id, and JSON payload.
pub fn parse_line(line: &str) -> Result<RawLine, DecodeError> {
    let caps = LINE_RE.captures(line).ok_or(DecodeError::Grammar)?;
    let tag = caps
        .get(1)
        .and_then(|m| m.as_str().chars().next())
        .ok_or(DecodeError::Grammar)?;
    let payload: Value = serde_json::from_str(caps.get(3).map_or("", |m| m.as_str()))?;
    Ok(RawLine {
        tag,
        line_id: caps.get(2).map_or("", |m| m.as_str()).to_string(),
        payload,
    })
}

/// Decode a classified line into a typed record.
pub fn decode(raw: &RawLine) -> Result<StreamRecord, DecodeError> {
    match raw.tag {
        'L' => decode_listener(&raw.payload).map(StreamRecord::Listener),
        'M' => decode_metadata(raw).map(StreamRecord::Metadata),
        'S' => decode_session(&raw.payload).map(StreamRecord::SessionOpen),
        'A' => decode_archive(&raw.payload).map(StreamRecord::Archive),
        'B' => decode_beacon_log(&raw.payload).map(StreamRecord::BeaconLog),
        'C' => decode_credential(&raw.payload).map(StreamRecord::Credential),
        'D' => decode_download(&raw.payload).map(StreamRecord::Download),
        other => Err(DecodeError::UnknownTag(other)),
    }
}

/// Extract the integer beacon id from any of its textual encodings: bare
/// digits, `@('12345')` wrapping, or either with surrounding whitespace.
pub fn parse_bid(raw: &str) -> Result<i64, DecodeError> {
    let digits = BID_RE
        .find(raw)
        .ok_or_else(|| DecodeError::BadBid(raw.to_string()))?;
    digits
        .as_str()
        .parse::<i64>()
        .map_err(|e| DecodeError::BadField {
            field: "bid",
            reason: e.to_string(),
        })
}

/// Normalize archive/log type names: drop the `beacon_` prefix, collapse
/// `tasked` to `task`, drop a trailing `_alt`.
pub fn clean_type(input: &str) -> String {
    let s = input.strip_prefix("beacon_").unwrap_or(input);
    let s = s.replace("tasked", "task");
    s.strip_suffix("_alt").unwrap_or(&s).to_string()
}

/// Strip the tooling-added `received output:\n` prefix when present.
pub fn strip_tooling_prefix(data: &str) -> &str {
    if data.starts_with(TOOLING_OUTPUT_PREFIX) {
        &data[TOOLING_OUTPUT_PREFIX_LEN.min(data.len())..]
    } else {
        data
    }
}

fn str_field(payload: &Value, key: &str) -> Option<String> {
    match payload.get(key) {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

fn required_str(payload: &Value, key: &'static str) -> Result<String, DecodeError> {
    str_field(payload, key).ok_or(DecodeError::MissingField(key))
}

/// Parse an epoch-milliseconds field that may be a JSON number or a string,
/// possibly carrying a Java long-literal `L` suffix.
fn epoch_ms(payload: &Value, key: &'static str) -> Result<i64, DecodeError> {
    match payload.get(key) {
        Some(Value::Number(n)) => n.as_i64().ok_or(DecodeError::BadField {
            field: key,
            reason: "not an i64".to_string(),
        }),
        Some(Value::String(s)) => {
            s.trim_end_matches('L')
                .parse::<i64>()
                .map_err(|e| DecodeError::BadField {
                    field: key,
                    reason: e.to_string(),
                })
        }
        _ => Err(DecodeError::MissingField(key)),
    }
}

fn decode_listener(payload: &Value) -> Result<ListenerRecord, DecodeError> {
    Ok(ListenerRecord {
        name: required_str(payload, "name")?,
        payload: str_field(payload, "payload"),
        port: str_field(payload, "port"),
        host: str_field(payload, "host"),
        althost: str_field(payload, "althost"),
        bindto: str_field(payload, "bindto"),
        proxy: str_field(payload, "proxy"),
        profile: str_field(payload, "profile"),
        strategy: str_field(payload, "strategy"),
        beacons: str_field(payload, "beacons"),
        status: str_field(payload, "status"),
        maxretry: str_field(payload, "maxretry"),
        guards: str_field(payload, "guards"),
        // TCP listeners can be configured to only bind to localhost.
        localonly: str_field(payload, "localonly").map(|v| v == "true"),
    })
}

fn decode_metadata(raw: &RawLine) -> Result<BeaconMetadata, DecodeError> {
    let beacon_id = raw
        .line_id
        .trim()
        .parse::<i64>()
        .map_err(|e| DecodeError::BadField {
            field: "line_id",
            reason: e.to_string(),
        })?;
    Ok(BeaconMetadata {
        beacon_id,
        last_ms_ago: epoch_ms(&raw.payload, "last")?,
        sleep: str_field(&raw.payload, "sleep").filter(|s| !s.is_empty()),
    })
}

fn decode_session(payload: &Value) -> Result<SessionOpen, DecodeError> {
    let id_raw = required_str(payload, "id")?;
    Ok(SessionOpen {
        id: parse_bid(&id_raw)?,
        user: str_field(payload, "user"),
        computer: str_field(payload, "computer"),
        host: str_field(payload, "host"),
        internal: str_field(payload, "internal"),
        external: str_field(payload, "external"),
        process: str_field(payload, "process"),
        pid: str_field(payload, "pid"),
        barch: str_field(payload, "barch"),
        os: str_field(payload, "os"),
        ver: str_field(payload, "ver"),
        build: str_field(payload, "build"),
        arch: str_field(payload, "arch"),
        session: str_field(payload, "session"),
        note: str_field(payload, "note"),
        charset: str_field(payload, "charset"),
        is64: str_field(payload, "is64").as_deref() == Some("1"),
        opened_ms: epoch_ms(payload, "opened")?,
        pbid: str_field(payload, "pbid").filter(|s| !s.is_empty()),
        listener: str_field(payload, "listener"),
    })
}

fn decode_archive(payload: &Value) -> Result<ArchiveRecord, DecodeError> {
    Ok(ArchiveRecord {
        bid: str_field(payload, "bid"),
        kind: clean_type(&required_str(payload, "type")?),
        data: str_field(payload, "data"),
        tactic: str_field(payload, "tactic"),
        when_ms: epoch_ms(payload, "when")?,
    })
}

fn decode_beacon_log(payload: &Value) -> Result<BeaconLogRecord, DecodeError> {
    let data = str_field(payload, "data").unwrap_or_default();
    Ok(BeaconLogRecord {
        bid: required_str(payload, "bid")?,
        kind: clean_type(&required_str(payload, "type")?),
        data: strip_tooling_prefix(&data).to_string(),
        operator: str_field(payload, "operator"),
        output_job: str_field(payload, "output_job"),
        task_id: str_field(payload, "task_id").filter(|s| !s.is_empty()),
        when_ms: epoch_ms(payload, "when")?,
    })
}

fn decode_credential(payload: &Value) -> Result<CredentialRecord, DecodeError> {
    Ok(CredentialRecord {
        user: str_field(payload, "user"),
        password: str_field(payload, "password"),
        host: str_field(payload, "host"),
        realm: str_field(payload, "realm"),
        source: str_field(payload, "source"),
        added_ms: epoch_ms(payload, "added")?,
    })
}

fn decode_download(payload: &Value) -> Result<DownloadRecord, DecodeError> {
    Ok(DownloadRecord {
        bid: str_field(payload, "bid").filter(|s| !s.is_empty()),
        size: str_field(payload, "size"),
        path: str_field(payload, "path"),
        name: str_field(payload, "name"),
        date_ms: epoch_ms(payload, "date")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_line_splits_tag_id_payload() {
        let raw = parse_line(r#"[B] [1263] {"bid":"270632664","type":"beacon_output","when":"1741168779890","data":"hi"}"#).unwrap();
        assert_eq!(raw.tag, 'B');
        assert_eq!(raw.line_id, "1263");
        assert_eq!(raw.payload["bid"], "270632664");
    }

    #[test]
    fn parse_line_rejects_untagged_text() {
        assert!(matches!(
            parse_line("some random stderr chatter"),
            Err(DecodeError::Grammar)
        ));
    }

    #[test]
    fn parse_line_rejects_bad_json() {
        assert!(matches!(
            parse_line("[B] [1] {not json"),
            Err(DecodeError::Json(_))
        ));
    }

    #[test]
    fn bid_decodings_all_resolve() {
        assert_eq!(parse_bid("12345").unwrap(), 12345);
        assert_eq!(parse_bid("@('12345')").unwrap(), 12345);
        assert_eq!(parse_bid("  12345  ").unwrap(), 12345);
    }

    #[test]
    fn bid_without_digits_fails() {
        assert!(parse_bid("@('')").is_err());
    }

    #[test]
    fn clean_type_normalizes() {
        assert_eq!(clean_type("beacon_output"), "output");
        assert_eq!(clean_type("beacon_tasked"), "task");
        assert_eq!(clean_type("beacon_output_alt"), "output");
        assert_eq!(clean_type("input"), "input");
    }

    #[test]
    fn tooling_prefix_is_stripped() {
        let data = "received output:\n[+] whoami output\n";
        assert_eq!(strip_tooling_prefix(data), "[+] whoami output\n");
        assert_eq!(strip_tooling_prefix("plain"), "plain");
    }

    #[test]
    fn listener_localonly_coerces() {
        let raw = parse_line(
            r#"[L] [7] {"name":"http-main","payload":"windows/beacon_http","localonly":"true","port":"80"}"#,
        )
        .unwrap();
        let StreamRecord::Listener(l) = decode(&raw).unwrap() else {
            panic!("expected listener");
        };
        assert_eq!(l.name, "http-main");
        assert_eq!(l.localonly, Some(true));
    }

    #[test]
    fn session_coerces_is64_and_opened() {
        let raw = parse_line(
            r#"[S] [2] {"id":"100","is64":"1","opened":"1741168779000","listener":"http-main","user":"svc"}"#,
        )
        .unwrap();
        let StreamRecord::SessionOpen(s) = decode(&raw).unwrap() else {
            panic!("expected session");
        };
        assert_eq!(s.id, 100);
        assert!(s.is64);
        assert_eq!(s.opened_ms, 1_741_168_779_000);
        assert_eq!(s.listener.as_deref(), Some("http-main"));
        assert!(s.pbid.is_none());
    }

    #[test]
    fn archive_when_strips_long_suffix() {
        let raw = parse_line(
            r#"[A] [3] {"type":"beacon_tasked","when":"1741168779890L","bid":"100","data":"Tasked"}"#,
        )
        .unwrap();
        let StreamRecord::Archive(a) = decode(&raw).unwrap() else {
            panic!("expected archive");
        };
        assert_eq!(a.kind, "task");
        assert_eq!(a.when_ms, 1_741_168_779_890);
    }

    #[test]
    fn metadata_uses_line_id_as_beacon_id() {
        let raw = parse_line(r#"[M] [270632664] {"last":"9500"}"#).unwrap();
        let StreamRecord::Metadata(m) = decode(&raw).unwrap() else {
            panic!("expected metadata");
        };
        assert_eq!(m.beacon_id, 270_632_664);
        assert_eq!(m.last_ms_ago, 9500);
        assert!(m.sleep.is_none());
    }

    #[test]
    fn control_signals_detected() {
        assert_eq!(
            control_signal("x illegal subarray y"),
            Some(ControlSignal::Desync)
        );
        assert_eq!(
            control_signal("read [Manage: unauth'd user]: null"),
            Some(ControlSignal::VersionMismatch)
        );
        assert_eq!(control_signal("[B] [1] {}"), None);
    }

    #[test]
    fn noise_filter_matches_lifecycle_chatter() {
        assert!(is_noise("Connected OK. Synchronizing..."));
        assert!(is_noise("Disconnected from team server"));
        assert!(!is_noise("[L] [1] {}"));
    }
}
