//! Deterministic replay of the time event log
//!
//! Durations are never stored; they are recomputed by streaming the event
//! log in sequence order. Identical history and window always produce
//! identical totals — the arithmetic is pure integer seconds.

use crate::db::{EventKind, TaskStatus};
use std::collections::{BTreeSet, HashMap, HashSet};

/// One row of the event log, in replay form
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEvent {
    pub sequence: i64,
    pub task_id: String,
    pub kind: EventKind,
    pub at: i64,
    pub payload: Option<String>,
}

/// Per-task state derived from the log alone
#[derive(Debug, Clone, Default)]
pub struct ReplayedTask {
    /// Last timing transition, if the task has any timing events
    pub status: Option<TaskStatus>,
    /// Final parent according to reparent history; `None` when the log holds
    /// no reparent evidence (the creation parent is not event-sourced)
    pub parent: Option<Option<String>>,
    /// Tag names currently attached according to tag events
    pub tags: BTreeSet<String>,
}

/// Exclusive running seconds per task over a clipped window.
///
/// Events must be ordered by sequence. `window_start` of `None` means
/// unbounded; open intervals are closed at `window_end`.
pub fn exclusive_seconds(
    events: &[LogEvent],
    window_start: Option<i64>,
    window_end: i64,
) -> HashMap<String, i64> {
    let mut running_since: HashMap<&str, i64> = HashMap::new();
    let mut exclusive: HashMap<String, i64> = HashMap::new();

    for event in events {
        match event.kind {
            EventKind::Start | EventKind::Resume => {
                running_since.entry(&event.task_id).or_insert(event.at);
            }
            EventKind::Pause | EventKind::Stop => {
                if let Some(since) = running_since.remove(event.task_id.as_str()) {
                    add_clipped(
                        &mut exclusive,
                        &event.task_id,
                        since,
                        event.at,
                        window_start,
                        window_end,
                    );
                }
            }
            _ => {}
        }
    }

    let still_running: Vec<(String, i64)> = running_since
        .into_iter()
        .map(|(task_id, since)| (task_id.to_string(), since))
        .collect();
    for (task_id, since) in still_running {
        add_clipped(
            &mut exclusive,
            &task_id,
            since,
            window_end,
            window_start,
            window_end,
        );
    }

    exclusive
}

fn add_clipped(
    exclusive: &mut HashMap<String, i64>,
    task_id: &str,
    start: i64,
    end: i64,
    window_start: Option<i64>,
    window_end: i64,
) {
    let clipped_start = window_start.map_or(start, |t0| start.max(t0));
    let clipped_end = end.min(window_end);
    if clipped_end > clipped_start {
        *exclusive.entry(task_id.to_string()).or_insert(0) += clipped_end - clipped_start;
    }
}

/// Inclusive totals: a task's exclusive seconds plus those of its descendants.
///
/// `parents` is the current parent map (one entry per live task). The
/// traversal is memoized post-order with a visiting guard, so a corrupted
/// cyclic map degrades to exclusive-only totals instead of recursing forever.
pub fn inclusive_rollup(
    parents: &[(String, Option<String>)],
    exclusive: &HashMap<String, i64>,
) -> HashMap<String, i64> {
    let mut children_by_parent: HashMap<&str, Vec<&str>> = HashMap::new();
    for (task_id, parent_id) in parents {
        if let Some(parent_id) = parent_id {
            children_by_parent
                .entry(parent_id.as_str())
                .or_default()
                .push(task_id.as_str());
        }
    }

    let mut memo: HashMap<String, i64> = HashMap::new();
    for (task_id, _) in parents {
        let mut visiting = HashSet::new();
        compute_inclusive(task_id, &children_by_parent, exclusive, &mut memo, &mut visiting);
    }
    memo
}

fn compute_inclusive(
    task_id: &str,
    children_by_parent: &HashMap<&str, Vec<&str>>,
    exclusive: &HashMap<String, i64>,
    memo: &mut HashMap<String, i64>,
    visiting: &mut HashSet<String>,
) -> i64 {
    if let Some(cached) = memo.get(task_id) {
        return *cached;
    }
    if !visiting.insert(task_id.to_string()) {
        return *exclusive.get(task_id).unwrap_or(&0);
    }

    let mut total = *exclusive.get(task_id).unwrap_or(&0);
    if let Some(children) = children_by_parent.get(task_id) {
        for child_id in children {
            total += compute_inclusive(child_id, children_by_parent, exclusive, memo, visiting);
        }
    }

    visiting.remove(task_id);
    memo.insert(task_id.to_string(), total);
    total
}

/// Closed running intervals of one task, up to and including `until`.
///
/// An interval left open at `until` (task still running) is closed there.
pub fn running_intervals_for(events: &[LogEvent], task_id: &str, until: i64) -> Vec<(i64, i64)> {
    let mut intervals = Vec::new();
    let mut running_since: Option<i64> = None;

    for event in events {
        if event.task_id != task_id || event.at > until {
            continue;
        }
        match event.kind {
            EventKind::Start | EventKind::Resume => {
                if running_since.is_none() {
                    running_since = Some(event.at);
                }
            }
            EventKind::Pause | EventKind::Stop => {
                if let Some(since) = running_since.take() {
                    if event.at > since {
                        intervals.push((since, event.at));
                    }
                }
            }
            _ => {}
        }
    }

    if let Some(since) = running_since {
        if until > since {
            intervals.push((since, until));
        }
    }
    intervals
}

/// Rebuild per-task state from the log.
///
/// Used by the startup consistency check to verify the `tasks` mirror and by
/// invariant tests. Reparent payloads carry `{from, to}`; tag payloads carry
/// `{tag}`.
pub fn rebuild_states(events: &[LogEvent]) -> HashMap<String, ReplayedTask> {
    let mut states: HashMap<String, ReplayedTask> = HashMap::new();

    for event in events {
        let state = states.entry(event.task_id.clone()).or_default();
        match event.kind {
            EventKind::Start | EventKind::Resume => state.status = Some(TaskStatus::Running),
            EventKind::Pause => state.status = Some(TaskStatus::Paused),
            EventKind::Stop => state.status = Some(TaskStatus::Stopped),
            EventKind::Reparent => {
                state.parent = Some(payload_field(event, "to"));
            }
            EventKind::TagAdd => {
                if let Some(tag) = payload_field(event, "tag") {
                    state.tags.insert(tag);
                }
            }
            EventKind::TagRemove => {
                if let Some(tag) = payload_field(event, "tag") {
                    state.tags.remove(&tag);
                }
            }
            EventKind::Rename => {}
        }
    }

    states
}

fn payload_field(event: &LogEvent, field: &str) -> Option<String> {
    event
        .payload
        .as_deref()
        .and_then(|raw| serde_json::from_str::<serde_json::Value>(raw).ok())
        .and_then(|value| value.get(field).and_then(|v| v.as_str()).map(str::to_owned))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(sequence: i64, task_id: &str, kind: EventKind, at: i64) -> LogEvent {
        LogEvent {
            sequence,
            task_id: task_id.to_string(),
            kind,
            at,
            payload: None,
        }
    }

    fn payload_event(
        sequence: i64,
        task_id: &str,
        kind: EventKind,
        at: i64,
        payload: serde_json::Value,
    ) -> LogEvent {
        LogEvent {
            sequence,
            task_id: task_id.to_string(),
            kind,
            at,
            payload: Some(payload.to_string()),
        }
    }

    // === exclusive_seconds Tests ===

    #[test]
    fn test_preempted_start_splits_time() {
        // A runs 100..160, B takes over at 160
        let events = vec![
            event(1, "a", EventKind::Start, 100),
            event(2, "a", EventKind::Pause, 160),
            event(3, "b", EventKind::Start, 160),
        ];
        let exclusive = exclusive_seconds(&events, Some(0), 200);
        assert_eq!(exclusive.get("a"), Some(&60));
        assert_eq!(exclusive.get("b"), Some(&40));
    }

    #[test]
    fn test_open_interval_closed_at_window_end() {
        let events = vec![event(1, "a", EventKind::Start, 50)];
        let exclusive = exclusive_seconds(&events, None, 80);
        assert_eq!(exclusive.get("a"), Some(&30));
    }

    #[test]
    fn test_interval_outside_window_contributes_nothing() {
        let events = vec![
            event(1, "a", EventKind::Start, 0),
            event(2, "a", EventKind::Stop, 100),
        ];
        let exclusive = exclusive_seconds(&events, Some(200), 300);
        assert_eq!(exclusive.get("a"), None);
    }

    #[test]
    fn test_interval_clipped_at_both_edges() {
        let events = vec![
            event(1, "a", EventKind::Start, 0),
            event(2, "a", EventKind::Stop, 1000),
        ];
        let exclusive = exclusive_seconds(&events, Some(250), 750);
        assert_eq!(exclusive.get("a"), Some(&500));
    }

    #[test]
    fn test_pause_resume_accumulates() {
        let events = vec![
            event(1, "a", EventKind::Start, 0),
            event(2, "a", EventKind::Pause, 100),
            event(3, "a", EventKind::Resume, 300),
            event(4, "a", EventKind::Stop, 450),
        ];
        let exclusive = exclusive_seconds(&events, None, 500);
        assert_eq!(exclusive.get("a"), Some(&250));
    }

    #[test]
    fn test_non_timing_events_ignored() {
        let events = vec![
            event(1, "a", EventKind::Start, 0),
            payload_event(2, "a", EventKind::TagAdd, 50, serde_json::json!({"tag": "deep"})),
            event(3, "a", EventKind::Stop, 100),
        ];
        let exclusive = exclusive_seconds(&events, None, 200);
        assert_eq!(exclusive.get("a"), Some(&100));
    }

    #[test]
    fn test_replay_is_deterministic() {
        let events = vec![
            event(1, "p", EventKind::Start, 0),
            event(2, "p", EventKind::Pause, 300),
            event(3, "c", EventKind::Start, 300),
            event(4, "c", EventKind::Stop, 420),
            event(5, "p", EventKind::Resume, 420),
        ];
        let first = exclusive_seconds(&events, Some(0), 500);
        let second = exclusive_seconds(&events, Some(0), 500);
        assert_eq!(first, second);
    }

    // === inclusive_rollup Tests ===

    #[test]
    fn test_subtask_time_rolls_up() {
        // parent runs 0..300 and 420..500, child runs 300..420
        let events = vec![
            event(1, "p", EventKind::Start, 0),
            event(2, "p", EventKind::Pause, 300),
            event(3, "c", EventKind::Start, 300),
            event(4, "c", EventKind::Stop, 420),
            event(5, "p", EventKind::Resume, 420),
        ];
        let exclusive = exclusive_seconds(&events, Some(0), 500);
        assert_eq!(exclusive.get("p"), Some(&380));
        assert_eq!(exclusive.get("c"), Some(&120));

        let parents = vec![
            ("p".to_string(), None),
            ("c".to_string(), Some("p".to_string())),
        ];
        let inclusive = inclusive_rollup(&parents, &exclusive);
        assert_eq!(inclusive.get("p"), Some(&500));
        assert_eq!(inclusive.get("c"), Some(&120));
    }

    #[test]
    fn test_inclusive_structural_identity() {
        let mut exclusive = HashMap::new();
        exclusive.insert("root".to_string(), 10);
        exclusive.insert("a".to_string(), 20);
        exclusive.insert("b".to_string(), 30);
        exclusive.insert("leaf".to_string(), 40);

        let parents = vec![
            ("root".to_string(), None),
            ("a".to_string(), Some("root".to_string())),
            ("b".to_string(), Some("root".to_string())),
            ("leaf".to_string(), Some("a".to_string())),
        ];
        let inclusive = inclusive_rollup(&parents, &exclusive);

        // inclusive(t) = exclusive(t) + Σ inclusive(direct children)
        assert_eq!(inclusive["leaf"], 40);
        assert_eq!(inclusive["a"], 20 + inclusive["leaf"]);
        assert_eq!(inclusive["b"], 30);
        assert_eq!(inclusive["root"], 10 + inclusive["a"] + inclusive["b"]);
    }

    #[test]
    fn test_rollup_survives_corrupt_cycle() {
        let mut exclusive = HashMap::new();
        exclusive.insert("a".to_string(), 5);
        exclusive.insert("b".to_string(), 7);

        // a and b point at each other; the guard keeps totals finite
        let parents = vec![
            ("a".to_string(), Some("b".to_string())),
            ("b".to_string(), Some("a".to_string())),
        ];
        let inclusive = inclusive_rollup(&parents, &exclusive);
        assert!(inclusive["a"] <= 12);
        assert!(inclusive["b"] <= 12);
    }

    // === running_intervals_for Tests ===

    #[test]
    fn test_intervals_for_single_task() {
        let events = vec![
            event(1, "a", EventKind::Start, 0),
            event(2, "b", EventKind::Start, 10),
            event(3, "a", EventKind::Pause, 100),
            event(4, "a", EventKind::Resume, 150),
            event(5, "a", EventKind::Stop, 200),
        ];
        let intervals = running_intervals_for(&events, "a", 300);
        assert_eq!(intervals, vec![(0, 100), (150, 200)]);
    }

    #[test]
    fn test_intervals_open_closed_at_until() {
        let events = vec![event(1, "a", EventKind::Start, 40)];
        let intervals = running_intervals_for(&events, "a", 100);
        assert_eq!(intervals, vec![(40, 100)]);
    }

    // === rebuild_states Tests ===

    #[test]
    fn test_rebuild_status_follows_last_transition() {
        let events = vec![
            event(1, "a", EventKind::Start, 0),
            event(2, "a", EventKind::Pause, 10),
            event(3, "a", EventKind::Resume, 20),
            event(4, "a", EventKind::Stop, 30),
        ];
        let states = rebuild_states(&events);
        assert_eq!(states["a"].status, Some(TaskStatus::Stopped));
    }

    #[test]
    fn test_rebuild_parent_from_reparent_history() {
        let events = vec![
            payload_event(
                1,
                "a",
                EventKind::Reparent,
                0,
                serde_json::json!({"from": null, "to": "p1"}),
            ),
            payload_event(
                2,
                "a",
                EventKind::Reparent,
                5,
                serde_json::json!({"from": "p1", "to": null}),
            ),
        ];
        let states = rebuild_states(&events);
        assert_eq!(states["a"].parent, Some(None));
    }

    #[test]
    fn test_rebuild_tag_set() {
        let events = vec![
            payload_event(1, "a", EventKind::TagAdd, 0, serde_json::json!({"tag": "deep"})),
            payload_event(2, "a", EventKind::TagAdd, 1, serde_json::json!({"tag": "work"})),
            payload_event(3, "a", EventKind::TagRemove, 2, serde_json::json!({"tag": "deep"})),
        ];
        let states = rebuild_states(&events);
        assert_eq!(
            states["a"].tags.iter().cloned().collect::<Vec<_>>(),
            vec!["work".to_string()]
        );
    }

    #[test]
    fn test_rebuild_without_timing_events_has_no_status() {
        let events = vec![payload_event(
            1,
            "a",
            EventKind::TagAdd,
            0,
            serde_json::json!({"tag": "x"}),
        )];
        let states = rebuild_states(&events);
        assert_eq!(states["a"].status, None);
    }
}
