//! Action correlation planning.
//!
//! Beacon logs arrive before their archives, so logs drive action creation
//! and archives only ever attach to existing actions. Planning is pure: the
//! storage writer gathers a [`CorrelationContext`] from the database, asks
//! the planner for a [`CorrelationPlan`], and executes the plan and the row
//! insert in one step so an action and its first log land together.
//!
//! Two strategies exist. When a log carries a task identifier (newer team
//! servers), that identifier is used *exclusively*: outputs with an unseen
//! task id stay uncorrelated rather than being guessed onto a nearby
//! action, which would mis-assign outputs when many commands run in one
//! check-in. Without a task id, timing-based correlation attaches each log
//! to the most recent action at or before its timestamp.

/// Commands known not to produce output. Actions opened for these refuse
/// later output attachment, so quick-succession outputs skip past them to
/// the action that actually asked for output.
const NO_OUTPUT_PREFIXES: &[&str] = &[
    "sleep ",
    "note ",
    "Tasked beacon to sleep ",
    "Tasked beacon to become interactive",
];

/// Action lookups for one pending log, scoped to its beacon and timestamp.
#[derive(Debug, Clone, Copy, Default)]
pub struct CorrelationContext {
    /// An existing action already holding a log with the same task id.
    pub task_action: Option<i64>,
    /// Whether any action started within the second before the log.
    pub action_within_last_second: bool,
    /// Most recent action starting at or before the log.
    pub latest_action: Option<i64>,
    /// Most recent output-accepting action starting at or before the log.
    pub latest_accepting_action: Option<i64>,
}

/// What to do with a pending log or archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrelationPlan {
    /// Attach to an existing action.
    Attach(i64),
    /// Open a new action starting at the record's timestamp.
    Create { accept_output: bool },
    /// Leave the record uncorrelated.
    Skip,
}

/// Plan correlation for a beacon log.
#[must_use]
pub fn plan_beacon_log(
    kind: &str,
    data: &str,
    task_id: Option<&str>,
    ctx: &CorrelationContext,
) -> CorrelationPlan {
    if task_id.is_some() {
        // Check for an existing action first regardless of log type, so a
        // duplicate input/task pair with one task id yields one action.
        if let Some(id) = ctx.task_action {
            return CorrelationPlan::Attach(id);
        }
        if kind == "input" || kind == "task" {
            return CorrelationPlan::Create {
                accept_output: !NO_OUTPUT_PREFIXES.iter().any(|p| data.starts_with(p)),
            };
        }
        // Output/error/note with a task id but no matching action yet: the
        // input log may not have been seen. Leave it uncorrelated rather
        // than risk attaching to the wrong action.
        return CorrelationPlan::Skip;
    }

    // Timing-based correlation for team servers without task ids.
    if kind == "input" {
        return CorrelationPlan::Create {
            accept_output: !(data.starts_with("sleep ") || data.starts_with("note ")),
        };
    }

    // A sleep task with no fresh input within the last second is also the
    // start of a new action (operator used the sleep menu, not the prompt).
    if kind == "task"
        && data.contains("Tasked beacon to sleep ")
        && !ctx.action_within_last_second
    {
        return CorrelationPlan::Create {
            accept_output: false,
        };
    }

    let target = if kind.starts_with("output") || kind == "error" {
        ctx.latest_accepting_action
    } else {
        ctx.latest_action
    };
    target.map_or(CorrelationPlan::Skip, CorrelationPlan::Attach)
}

/// Plan correlation for an archive: attach to the most recent action at or
/// before its timestamp, when one exists.
#[must_use]
pub fn plan_archive(latest_action: Option<i64>) -> CorrelationPlan {
    latest_action.map_or(CorrelationPlan::Skip, CorrelationPlan::Attach)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_id_attaches_to_existing_action() {
        let ctx = CorrelationContext {
            task_action: Some(7),
            ..CorrelationContext::default()
        };
        assert_eq!(
            plan_beacon_log("output", "data\n", Some("t-1"), &ctx),
            CorrelationPlan::Attach(7)
        );
        // Even an input with the same task id reuses the action.
        assert_eq!(
            plan_beacon_log("input", "whoami", Some("t-1"), &ctx),
            CorrelationPlan::Attach(7)
        );
    }

    #[test]
    fn task_id_input_creates_action() {
        let ctx = CorrelationContext::default();
        assert_eq!(
            plan_beacon_log("input", "whoami", Some("t-1"), &ctx),
            CorrelationPlan::Create {
                accept_output: true
            }
        );
        assert_eq!(
            plan_beacon_log("task", "Tasked beacon to sleep for 60s", Some("t-2"), &ctx),
            CorrelationPlan::Create {
                accept_output: false
            }
        );
    }

    #[test]
    fn task_id_output_without_action_is_skipped() {
        let ctx = CorrelationContext {
            latest_action: Some(3),
            latest_accepting_action: Some(3),
            ..CorrelationContext::default()
        };
        // No timing fallback when a task id is present.
        assert_eq!(
            plan_beacon_log("output", "late\n", Some("t-9"), &ctx),
            CorrelationPlan::Skip
        );
    }

    #[test]
    fn timing_input_always_creates() {
        let ctx = CorrelationContext {
            latest_action: Some(3),
            ..CorrelationContext::default()
        };
        assert_eq!(
            plan_beacon_log("input", "whoami", None, &ctx),
            CorrelationPlan::Create {
                accept_output: true
            }
        );
        assert_eq!(
            plan_beacon_log("input", "sleep 60", None, &ctx),
            CorrelationPlan::Create {
                accept_output: false
            }
        );
        assert_eq!(
            plan_beacon_log("input", "note resting", None, &ctx),
            CorrelationPlan::Create {
                accept_output: false
            }
        );
    }

    #[test]
    fn timing_sleep_task_dedupes_against_recent_action() {
        let fresh = CorrelationContext {
            action_within_last_second: true,
            latest_action: Some(5),
            ..CorrelationContext::default()
        };
        // Sleep task right after its input attaches instead of creating.
        assert_eq!(
            plan_beacon_log("task", "Tasked beacon to sleep for 60s", None, &fresh),
            CorrelationPlan::Attach(5)
        );

        let stale = CorrelationContext::default();
        assert_eq!(
            plan_beacon_log("task", "Tasked beacon to sleep for 60s", None, &stale),
            CorrelationPlan::Create {
                accept_output: false
            }
        );
    }

    #[test]
    fn timing_output_respects_accept_output() {
        let ctx = CorrelationContext {
            latest_action: Some(9),
            latest_accepting_action: Some(4),
            ..CorrelationContext::default()
        };
        assert_eq!(
            plan_beacon_log("output", "data\n", None, &ctx),
            CorrelationPlan::Attach(4)
        );
        assert_eq!(
            plan_beacon_log("error", "fail\n", None, &ctx),
            CorrelationPlan::Attach(4)
        );
        // Non-output kinds take the latest action regardless.
        assert_eq!(
            plan_beacon_log("checkin", "called home", None, &ctx),
            CorrelationPlan::Attach(9)
        );
    }

    #[test]
    fn logs_before_any_action_stay_uncorrelated() {
        let ctx = CorrelationContext::default();
        assert_eq!(
            plan_beacon_log("output", "early\n", None, &ctx),
            CorrelationPlan::Skip
        );
    }

    #[test]
    fn archive_attaches_or_skips() {
        assert_eq!(plan_archive(Some(2)), CorrelationPlan::Attach(2));
        assert_eq!(plan_archive(None), CorrelationPlan::Skip);
    }
}
