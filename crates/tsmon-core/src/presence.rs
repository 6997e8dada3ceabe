//! Beacon presence and sleep cadence tracking.
//!
//! A presence window is a contiguous run of check-ins under one sleep
//! configuration. A fresh check-in either extends the latest window or
//! opens a new one: new when the gap since the previous check-in exceeds
//! what the configured sleep allows (the beacon went away and came back),
//! or when the sleep parameters changed (so cadence history is preserved).
//!
//! Sleep parameters come from two places. Newer team servers embed a
//! `@(sleep, jitter, _)` tuple in check-in metadata. Older ones don't, so
//! the cadence is inferred from the most recent sleep-affecting log line.

use std::sync::LazyLock;

use regex::Regex;

use crate::storage::PresenceRow;

/// Acknowledged sleep taskings in beacon logs.
static SLEEP_TASK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Tasked beacon to sleep for (?P<sleep>\d+)s(?: \((?P<jitter>\d+)% jitter\))?")
        .expect("sleep task regex")
});

/// Sleep tuple in check-in metadata. Values may carry a Java long-literal
/// `L` suffix, and are negative when the server has written the beacon off.
static SLEEP_METADATA_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"@\((?P<sleep>[-\d]+)L?, (?P<jitter>[-\d]+)L?, (?:[-\d]+)L?\)")
        .expect("sleep metadata regex")
});

/// A beacon's configured sleep cadence. The default (zero sleep, zero
/// jitter) is interactive, which is also the assumption for new beacons
/// whose profile defaults are not visible on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SleepParams {
    pub seconds: i64,
    /// Fraction, 0.0 to 1.0.
    pub jitter: f64,
}

impl SleepParams {
    /// Negative values mean the server considers the beacon gone.
    #[must_use]
    pub fn negative(self) -> bool {
        self.seconds < 0 || self.jitter < 0.0
    }

    /// Longest expected interval between check-ins. Jitter only shortens
    /// sleeps, so the configured sleep is the ceiling.
    #[must_use]
    pub fn max_sleep_ms(self) -> i64 {
        self.seconds.saturating_mul(1000)
    }
}

/// Parse the `@(sleep, jitter, _)` tuple from check-in metadata.
/// Returns `None` when the descriptor doesn't contain one.
#[must_use]
pub fn parse_sleep_metadata(descriptor: &str) -> Option<SleepParams> {
    let caps = SLEEP_METADATA_RE.captures(descriptor)?;
    let seconds = caps
        .name("sleep")
        .and_then(|m| m.as_str().parse::<i64>().ok())
        .unwrap_or(0);
    let jitter = caps
        .name("jitter")
        .and_then(|m| m.as_str().parse::<i64>().ok())
        .unwrap_or(0);
    #[allow(clippy::cast_precision_loss)]
    Some(SleepParams {
        seconds,
        jitter: jitter as f64 / 100.0,
    })
}

/// Derive sleep cadence from a sleep-affecting log line. Interactive
/// taskings and SOCKS server starts don't match the sleep pattern, which
/// correctly yields the interactive default.
#[must_use]
pub fn parse_sleep_task(data: &str) -> SleepParams {
    let Some(caps) = SLEEP_TASK_RE.captures(data) else {
        return SleepParams::default();
    };
    let seconds = caps
        .name("sleep")
        .and_then(|m| m.as_str().parse::<i64>().ok())
        .unwrap_or(0);
    let jitter = caps
        .name("jitter")
        .and_then(|m| m.as_str().parse::<i64>().ok())
        .unwrap_or(0);
    #[allow(clippy::cast_precision_loss)]
    SleepParams {
        seconds,
        jitter: jitter as f64 / 100.0,
    }
}

/// What to do with a presence window for one check-in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CheckinDecision {
    /// Window to extend up to the check-in time, when one is still live.
    pub extend: Option<i64>,
    /// Whether to open a new window at the check-in time. Both can be set:
    /// a live window is extended and a new one opened when sleep changed.
    pub create: bool,
}

/// Decide whether a check-in extends the latest window, opens a new one,
/// or both.
///
/// `fuzz_ms` absorbs inherent jitter and delivery delay on top of the
/// window's own maximum sleep. A window is still live when its last
/// check-in falls within twice that fuzzed period before the new check-in.
#[must_use]
pub fn plan_checkin(
    last_window: Option<&PresenceRow>,
    checkin_ms: i64,
    params: SleepParams,
    fuzz_ms: i64,
) -> CheckinDecision {
    let max_sleep_fuzzy = last_window.map_or(fuzz_ms, |w| {
        SleepParams {
            seconds: w.sleep_seconds,
            jitter: w.sleep_jitter,
        }
        .max_sleep_ms()
            + fuzz_ms
    });

    let active = last_window.filter(|w| w.last_checkin_at >= checkin_ms - 2 * max_sleep_fuzzy);

    let create = match active {
        None => true,
        Some(w) => {
            w.sleep_seconds != params.seconds
                || (w.sleep_jitter - params.jitter).abs() > f64::EPSILON
        }
    };

    CheckinDecision {
        extend: active.map(|w| w.id),
        create,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(last_checkin_at: i64, sleep_seconds: i64, sleep_jitter: f64) -> PresenceRow {
        PresenceRow {
            id: 1,
            beacon_id: 10,
            first_checkin_at: 0,
            last_checkin_at,
            sleep_seconds,
            sleep_jitter,
        }
    }

    #[test]
    fn metadata_tuple_parses_with_long_suffix() {
        let p = parse_sleep_metadata("beacon @(60L, 25L, 0L) extra").unwrap();
        assert_eq!(p.seconds, 60);
        assert!((p.jitter - 0.25).abs() < f64::EPSILON);
        assert!(!p.negative());
    }

    #[test]
    fn metadata_negative_means_gone() {
        let p = parse_sleep_metadata("@(-1, -1, -1)").unwrap();
        assert!(p.negative());
    }

    #[test]
    fn metadata_without_tuple_is_none() {
        assert!(parse_sleep_metadata("no tuple here").is_none());
    }

    #[test]
    fn sleep_task_parses_with_and_without_jitter() {
        let p = parse_sleep_task("Tasked beacon to sleep for 300s (20% jitter)");
        assert_eq!(p.seconds, 300);
        assert!((p.jitter - 0.2).abs() < f64::EPSILON);

        let p = parse_sleep_task("Tasked beacon to sleep for 60s");
        assert_eq!(p.seconds, 60);
        assert!(p.jitter.abs() < f64::EPSILON);
    }

    #[test]
    fn interactive_tasking_yields_default() {
        let p = parse_sleep_task("Tasked beacon to become interactive");
        assert_eq!(p, SleepParams::default());
    }

    #[test]
    fn first_checkin_opens_window() {
        let d = plan_checkin(None, 1_000_000, SleepParams::default(), 60_000);
        assert!(d.create);
        assert!(d.extend.is_none());
    }

    #[test]
    fn steady_cadence_extends_window() {
        let w = window(1_000_000, 60, 0.0);
        // Next check-in 60s later, well within 2 * (60s + 60s fuzz).
        let d = plan_checkin(
            Some(&w),
            1_060_000,
            SleepParams {
                seconds: 60,
                jitter: 0.0,
            },
            60_000,
        );
        assert_eq!(d.extend, Some(1));
        assert!(!d.create);
    }

    #[test]
    fn long_gap_splits_presence() {
        let w = window(1_000_000, 60, 0.0);
        // Gap of 10 minutes exceeds 2 * (60s + 60s).
        let d = plan_checkin(
            Some(&w),
            1_600_000,
            SleepParams {
                seconds: 60,
                jitter: 0.0,
            },
            60_000,
        );
        assert!(d.extend.is_none());
        assert!(d.create);
    }

    #[test]
    fn sleep_change_extends_and_opens() {
        let w = window(1_000_000, 60, 0.0);
        let d = plan_checkin(
            Some(&w),
            1_030_000,
            SleepParams {
                seconds: 300,
                jitter: 0.2,
            },
            60_000,
        );
        // The old window closes at this check-in and a new one opens with
        // the new cadence.
        assert_eq!(d.extend, Some(1));
        assert!(d.create);
    }

    #[test]
    fn interactive_window_tolerates_fuzz_only() {
        let w = window(1_000_000, 0, 0.0);
        // 2 * 60s fuzz for an interactive beacon.
        let within = plan_checkin(Some(&w), 1_100_000, SleepParams::default(), 60_000);
        assert_eq!(within.extend, Some(1));
        let beyond = plan_checkin(Some(&w), 1_130_000, SleepParams::default(), 60_000);
        assert!(beyond.extend.is_none());
        assert!(beyond.create);
    }
}
