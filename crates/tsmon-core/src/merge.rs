//! Output fragment merging.
//!
//! Team servers emit beacon output as many small adjacent log lines.
//! Persisting each fragment separately hammers the database and re-runs
//! downstream regexes, so adjacent output fragments are coalesced in
//! memory before insertion: an output log is held as pending, and the next
//! log is appended to it when it belongs to the same beacon, server, kind,
//! and output job and arrives inside a short time window. Anything else
//! flushes the pending row. This only catches fragments that arrive back
//! to back; genuinely interleaved output still lands in separate rows.

use crate::storage::NewBeaconLog;

/// Coalesces adjacent output logs for insertion.
#[derive(Debug)]
pub struct OutputMergeBuffer {
    window_ms: i64,
    pending: Option<NewBeaconLog>,
}

impl OutputMergeBuffer {
    /// `window_ms` is the maximum gap between fragments that still merges.
    #[must_use]
    pub fn new(window_ms: i64) -> Self {
        Self {
            window_ms,
            pending: None,
        }
    }

    /// Whether an output row is currently buffered.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Offer a log to the buffer. Returns the rows now ready to persist,
    /// in order: zero when the log was absorbed or became pending, one or
    /// two when the pending row (and possibly the offered log) flushed.
    pub fn push(&mut self, log: NewBeaconLog) -> Vec<NewBeaconLog> {
        match self.pending.take() {
            Some(mut pending) => {
                if self.fits(&pending, &log) {
                    pending.data.push_str(&log.data);
                    // Advance the window so a burst of fragments keeps
                    // merging as long as each gap is small.
                    pending.logged_at = log.logged_at;
                    self.pending = Some(pending);
                    Vec::new()
                } else if log.kind == "output" {
                    // A mismatched output starts its own burst, so it
                    // buffers in place of the flushed row.
                    self.pending = Some(log);
                    vec![normalize(pending)]
                } else {
                    vec![normalize(pending), log]
                }
            }
            None => {
                if log.kind == "output" {
                    self.pending = Some(log);
                    Vec::new()
                } else {
                    vec![log]
                }
            }
        }
    }

    /// Flush the pending row, if any. Call on stream end or when a
    /// non-log line arrives.
    pub fn flush(&mut self) -> Option<NewBeaconLog> {
        self.pending.take().map(normalize)
    }

    fn fits(&self, pending: &NewBeaconLog, log: &NewBeaconLog) -> bool {
        log.kind == pending.kind
            && log.output_job == pending.output_job
            && log.beacon_id == pending.beacon_id
            && log.team_server_id == pending.team_server_id
            && log.logged_at - pending.logged_at <= self.window_ms
    }
}

/// Downstream patterns anchor on a trailing newline, so guarantee exactly
/// one at the end of merged data.
fn normalize(mut log: NewBeaconLog) -> NewBeaconLog {
    while log.data.ends_with('\n') {
        log.data.pop();
    }
    log.data.push('\n');
    log
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(beacon_id: i64, data: &str, at: i64) -> NewBeaconLog {
        NewBeaconLog {
            team_server_id: 1,
            beacon_id,
            kind: "output".to_string(),
            data: data.to_string(),
            operator: None,
            output_job: None,
            task_id: None,
            logged_at: at,
        }
    }

    #[test]
    fn adjacent_fragments_merge_into_one_row() {
        let mut buf = OutputMergeBuffer::new(15);
        assert!(buf.push(output(10, "part one ", 1_000)).is_empty());
        assert!(buf.push(output(10, "part two ", 1_010)).is_empty());
        // Rolling window: 20ms after the first line but 10ms after the
        // second still merges.
        assert!(buf.push(output(10, "part three", 1_020)).is_empty());

        let merged = buf.flush().unwrap();
        assert_eq!(merged.data, "part one part two part three\n");
        assert_eq!(merged.logged_at, 1_020);
        assert!(buf.flush().is_none());
    }

    #[test]
    fn window_boundary_is_inclusive() {
        let mut buf = OutputMergeBuffer::new(15);
        assert!(buf.push(output(10, "a", 1_000)).is_empty());
        assert!(buf.push(output(10, "b", 1_015)).is_empty());

        let mut buf2 = OutputMergeBuffer::new(15);
        assert!(buf2.push(output(10, "a", 1_000)).is_empty());
        let flushed = buf2.push(output(10, "b", 1_016));
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].data, "a\n");
        assert!(buf2.has_pending());
        assert_eq!(buf2.flush().unwrap().data, "b\n");
    }

    #[test]
    fn different_beacon_flushes_pending() {
        let mut buf = OutputMergeBuffer::new(15);
        assert!(buf.push(output(10, "for ten", 1_000)).is_empty());
        let flushed = buf.push(output(20, "for twenty", 1_005));
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].beacon_id, 10);
        // The mismatched output starts a burst of its own.
        assert_eq!(buf.flush().unwrap().beacon_id, 20);
    }

    #[test]
    fn second_output_job_merges_after_flushing_first() {
        let mut buf = OutputMergeBuffer::new(15);
        let mut a = output(10, "job a", 1_000);
        a.output_job = Some("1".to_string());
        let mut b1 = output(10, "job b ", 1_005);
        b1.output_job = Some("2".to_string());
        let mut b2 = output(10, "continued", 1_010);
        b2.output_job = Some("2".to_string());

        assert!(buf.push(a).is_empty());
        // The first job flushes (normalized) and the second becomes
        // pending, so its own fragments still coalesce.
        let flushed = buf.push(b1);
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].data, "job a\n");
        assert!(buf.push(b2).is_empty());
        assert_eq!(buf.flush().unwrap().data, "job b continued\n");
    }

    #[test]
    fn non_output_passes_straight_through() {
        let mut buf = OutputMergeBuffer::new(15);
        let mut input = output(10, "whoami", 1_000);
        input.kind = "input".to_string();
        let out = buf.push(input);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].data, "whoami");
        assert!(!buf.has_pending());
    }

    #[test]
    fn flush_normalizes_trailing_newlines() {
        let mut buf = OutputMergeBuffer::new(15);
        assert!(buf.push(output(10, "line\r\n\n\n", 1_000)).is_empty());
        assert_eq!(buf.flush().unwrap().data, "line\r\n");
    }

    #[test]
    fn merge_is_idempotent_under_replay() {
        // Pushing the same fragment sequence twice through fresh buffers
        // produces identical rows.
        let run = || {
            let mut buf = OutputMergeBuffer::new(15);
            let mut rows = Vec::new();
            rows.extend(buf.push(output(10, "a", 1_000)));
            rows.extend(buf.push(output(10, "b", 1_010)));
            rows.extend(buf.flush());
            rows
        };
        assert_eq!(run(), run());
    }
}
