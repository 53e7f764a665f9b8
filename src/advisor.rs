//! Rest suggestion rule engine
//!
//! Pure scoring logic for the adaptive rest advisor. The storage layer
//! computes the inputs (focus block just closed, switch frequency, deviation
//! from the task's historical median) from the event log and feeds them
//! through `evaluate`, which returns the suggested rest length and the rule
//! identifiers that fired.

/// Pauses shorter than this merge into the surrounding focus block.
pub const PAUSE_MERGE_GAP_SECONDS: i64 = 120;

/// Window over which task switches are counted.
pub const SWITCH_WINDOW_SECONDS: i64 = 1800;

/// Rule identifiers, recorded in a suggestion's `reasons` in firing order.
pub const RULE_LONG_FOCUS: &str = "R1";
pub const RULE_MEDIUM_FOCUS: &str = "R2";
pub const RULE_SHORT_FOCUS: &str = "R3";
pub const RULE_FRAGMENTED: &str = "R4";
pub const RULE_OVERRUN: &str = "R5";
pub const RULE_QUICK_TASK: &str = "R6";

/// Result of a rule evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestVerdict {
    /// Suggested rest length, always one of 0, 3, 8 or 15 minutes
    pub suggested_minutes: i64,
    /// Identifiers of the rules that fired, in evaluation order
    pub reasons: Vec<String>,
}

/// Collapse a task's closed running intervals into focus block durations.
///
/// Intervals must be ordered by start time. Consecutive intervals separated
/// by a gap shorter than `merge_gap` belong to the same block; a block's
/// duration is the sum of its running interval lengths (gaps excluded).
pub fn focus_blocks(intervals: &[(i64, i64)], merge_gap: i64) -> Vec<i64> {
    let mut blocks = Vec::new();
    let mut current = 0i64;
    let mut last_end: Option<i64> = None;

    for &(start, end) in intervals {
        if let Some(prev_end) = last_end {
            if start - prev_end >= merge_gap {
                blocks.push(current);
                current = 0;
            }
        }
        current += (end - start).max(0);
        last_end = Some(end);
    }

    if last_end.is_some() {
        blocks.push(current);
    }
    blocks
}

/// Median of a slice of durations (0 for an empty slice).
pub fn median(values: &[i64]) -> i64 {
    if values.is_empty() {
        return 0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2
    } else {
        sorted[mid]
    }
}

/// Relative deviation of the current focus block from the historical median.
///
/// Returns 0 when there is no prior history or the median is non-positive.
pub fn deviation_ratio(focus_seconds: i64, prior_blocks: &[i64]) -> f64 {
    let baseline = median(prior_blocks);
    if baseline <= 0 {
        return 0.0;
    }
    (focus_seconds - baseline).abs() as f64 / baseline as f64
}

/// Count task switches in `[window_start, ..]` over an ordered stream of
/// `(task_id, at)` start/resume targets.
///
/// A switch is a start/resume whose task differs from the immediately prior
/// one. The stream may begin before the window so the first in-window event
/// has a predecessor to compare against.
pub fn count_switches(stream: &[(String, i64)], window_start: i64) -> i64 {
    let mut previous: Option<&str> = None;
    let mut switches = 0i64;

    for (task_id, at) in stream {
        if let Some(prev) = previous {
            if prev != task_id && *at >= window_start {
                switches += 1;
            }
        }
        previous = Some(task_id);
    }
    switches
}

/// Evaluate the rest rules in order and return the verdict.
///
/// Each rule contributes a floor; the final suggestion is the maximum
/// contribution. The contributions are all members of {0, 3, 8, 15}, so the
/// maximum needs no further snapping.
pub fn evaluate(focus_seconds: i64, switch_count_30m: i64, deviation_ratio: f64) -> RestVerdict {
    let mut suggested = 0i64;
    let mut reasons = Vec::new();
    let fire = |minutes: i64, rule: &str, suggested: &mut i64, reasons: &mut Vec<String>| {
        *suggested = (*suggested).max(minutes);
        reasons.push(rule.to_string());
    };

    if focus_seconds >= 5_400 {
        fire(15, RULE_LONG_FOCUS, &mut suggested, &mut reasons);
    }
    if (3_000..5_400).contains(&focus_seconds) {
        fire(8, RULE_MEDIUM_FOCUS, &mut suggested, &mut reasons);
    }
    if (900..3_000).contains(&focus_seconds) {
        fire(3, RULE_SHORT_FOCUS, &mut suggested, &mut reasons);
    }
    if switch_count_30m >= 5 {
        fire(8, RULE_FRAGMENTED, &mut suggested, &mut reasons);
    }
    if deviation_ratio >= 0.5 && focus_seconds >= 1_200 {
        fire(3, RULE_OVERRUN, &mut suggested, &mut reasons);
    }
    if focus_seconds < 600 && switch_count_30m < 3 {
        fire(0, RULE_QUICK_TASK, &mut suggested, &mut reasons);
    }

    RestVerdict {
        suggested_minutes: suggested,
        reasons,
    }
}
