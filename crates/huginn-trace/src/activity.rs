//! Active-time tracking.
//!
//! An [`Activity`] accumulates the time ranges during which a span, or any
//! span feeding into it, was running. Completed ranges are kept sorted and
//! merged; running spans are tracked separately by start time so the total
//! never double-counts overlapping work.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::SpanId;

/// A half-open `[start, end)` time range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interval {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Interval {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }
}

/// The timing of one span as seen by an [`Activity`].
///
/// An end time before the start time means the span is still running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpanInterval {
    pub id: SpanId,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl SpanInterval {
    pub fn is_running(&self) -> bool {
        self.end < self.start
    }
}

/// Merged active time for a span and everything rolled up into it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    /// Sorted by start, pairwise non-overlapping.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub completed_intervals: Vec<Interval>,

    /// Start of the earliest span still running, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub earliest_running: Option<DateTime<Utc>>,

    #[serde(skip)]
    all_running: HashMap<SpanId, DateTime<Utc>>,
}

impl Activity {
    pub fn is_empty(&self) -> bool {
        self.completed_intervals.is_empty() && self.earliest_running.is_none()
    }

    /// Fold a span's timing in. Returns whether anything changed.
    pub fn add(&mut self, span: &SpanInterval) -> bool {
        let mut changed = false;

        if span.is_running() {
            if self.all_running.insert(span.id, span.start) != Some(span.start) {
                changed = true;
            }
            if self.update_earliest() {
                changed = true;
            }
            return changed;
        }

        self.all_running.remove(&span.id);
        if self.update_earliest() {
            changed = true;
        }

        let ival = Interval::new(span.start, span.end);
        if self
            .completed_intervals
            .iter()
            .any(|existing| existing.start <= ival.start && ival.end <= existing.end)
        {
            return changed;
        }

        let idx = self
            .completed_intervals
            .partition_point(|existing| existing.start < ival.start);
        self.completed_intervals.insert(idx, ival);
        self.merge_intervals();
        true
    }

    pub fn is_running(&self) -> bool {
        self.earliest_running.is_some()
    }

    /// Itemized active time as of `now`.
    ///
    /// Completed intervals are yielded in order until one starts at or after
    /// the earliest running start; at that point a single running interval
    /// from the later of that start and the last yielded end up to `now`
    /// replaces everything after it.
    pub fn intervals(&self, now: DateTime<Utc>) -> Vec<Interval> {
        let mut out = Vec::new();
        let mut last_end = None;
        for ival in &self.completed_intervals {
            if let Some(earliest) = self.earliest_running {
                if ival.start >= earliest {
                    out.extend(running_interval(earliest, last_end, now));
                    return out;
                }
            }
            out.push(*ival);
            last_end = Some(ival.end);
        }
        if let Some(earliest) = self.earliest_running {
            out.extend(running_interval(earliest, last_end, now));
        }
        out
    }

    /// Total active time as of `now`.
    pub fn duration(&self, now: DateTime<Utc>) -> Duration {
        self.intervals(now)
            .iter()
            .fold(Duration::zero(), |total, ival| total + ival.duration())
    }

    /// `now` if anything is running, else the end of the last completed
    /// interval.
    pub fn end_time_or_fallback(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if self.is_running() {
            return Some(now);
        }
        self.completed_intervals.last().map(|ival| ival.end)
    }

    fn update_earliest(&mut self) -> bool {
        let earliest = self.all_running.values().min().copied();
        if earliest != self.earliest_running {
            self.earliest_running = earliest;
            return true;
        }
        false
    }

    fn merge_intervals(&mut self) {
        let mut merged: Vec<Interval> = Vec::with_capacity(self.completed_intervals.len());
        for ival in self.completed_intervals.drain(..) {
            match merged.last_mut() {
                Some(last) if ival.start < last.end => {
                    if ival.end > last.end {
                        last.end = ival.end;
                    }
                }
                _ => merged.push(ival),
            }
        }
        self.completed_intervals = merged;
    }
}

fn running_interval(
    earliest: DateTime<Utc>,
    last_end: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Option<Interval> {
    let start = match last_end {
        Some(end) if end > earliest => end,
        _ => earliest,
    };
    (start < now).then(|| Interval::new(start, now))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, h, m, s).unwrap()
    }

    fn ival(start: DateTime<Utc>, end: DateTime<Utc>) -> Interval {
        Interval::new(start, end)
    }

    fn id(n: u8) -> SpanId {
        SpanId([0, 0, 0, 0, 0, 0, 0, n])
    }

    fn assert_sorted_disjoint(activity: &Activity) {
        for pair in activity.completed_intervals.windows(2) {
            assert!(pair[0].start <= pair[1].start, "not sorted: {:?}", pair);
            assert!(pair[0].end <= pair[1].start, "overlapping: {:?}", pair);
        }
    }

    #[test]
    fn test_completed_only() {
        let activity = Activity {
            completed_intervals: vec![
                ival(at(4, 13, 0), at(4, 14, 0)),
                ival(at(4, 15, 0), at(4, 20, 58)),
            ],
            ..Default::default()
        };
        let expected = Duration::minutes(6) + Duration::seconds(58);
        assert_eq!(activity.duration(at(5, 0, 0)), expected);
        assert_eq!(activity.duration(at(23, 0, 0)), expected);
    }

    #[test]
    fn test_running_starts_after_last_end() {
        let activity = Activity {
            completed_intervals: vec![
                ival(at(21, 40, 0), at(21, 40, 1)),
                ival(at(21, 40, 1), at(21, 42, 19)),
            ],
            earliest_running: Some(at(21, 40, 2)),
            ..Default::default()
        };
        let expected = Duration::hours(1) + Duration::minutes(59) + Duration::seconds(59);
        assert_eq!(activity.duration(at(23, 39, 59)), expected);
    }

    #[test]
    fn test_later_intervals_are_subsumed_by_running() {
        let activity = Activity {
            completed_intervals: vec![
                ival(at(21, 40, 0), at(21, 40, 1)),
                ival(at(21, 40, 1), at(21, 42, 19)),
                ival(at(21, 42, 20), at(21, 42, 21)),
                ival(at(21, 42, 22), at(21, 42, 23)),
            ],
            earliest_running: Some(at(21, 40, 2)),
            ..Default::default()
        };
        let expected = Duration::hours(1) + Duration::minutes(59) + Duration::seconds(59);
        assert_eq!(activity.duration(at(23, 39, 59)), expected);
        assert_eq!(activity.intervals(at(23, 39, 59)).len(), 3);
    }

    #[test]
    fn test_add_keeps_intervals_sorted_and_disjoint() {
        let mut activity = Activity::default();
        let spans = [
            (at(10, 5, 0), at(10, 6, 0)),
            (at(10, 0, 0), at(10, 1, 0)),
            (at(10, 0, 30), at(10, 2, 0)),
            (at(10, 5, 30), at(10, 5, 40)),
            (at(9, 59, 0), at(10, 7, 0)),
            (at(11, 0, 0), at(11, 0, 1)),
        ];
        for (n, (start, end)) in spans.into_iter().enumerate() {
            activity.add(&SpanInterval {
                id: id(n as u8),
                start,
                end,
            });
            assert_sorted_disjoint(&activity);
        }
        assert_eq!(
            activity.completed_intervals,
            vec![
                ival(at(9, 59, 0), at(10, 7, 0)),
                ival(at(11, 0, 0), at(11, 0, 1)),
            ]
        );
    }

    #[test]
    fn test_add_contained_interval_reports_unchanged() {
        let mut activity = Activity::default();
        let outer = SpanInterval {
            id: id(1),
            start: at(1, 0, 0),
            end: at(2, 0, 0),
        };
        assert!(activity.add(&outer));
        assert!(!activity.add(&outer));
        assert!(!activity.add(&SpanInterval {
            id: id(2),
            start: at(1, 10, 0),
            end: at(1, 20, 0),
        }));
    }

    #[test]
    fn test_running_then_completed() {
        let mut activity = Activity::default();
        let running = SpanInterval {
            id: id(1),
            start: at(1, 0, 0),
            end: DateTime::<Utc>::default(),
        };
        assert!(running.is_running());
        assert!(activity.add(&running));
        assert!(!activity.add(&running));
        assert_eq!(activity.earliest_running, Some(at(1, 0, 0)));
        assert_eq!(activity.end_time_or_fallback(at(3, 0, 0)), Some(at(3, 0, 0)));

        let earlier = SpanInterval {
            id: id(2),
            start: at(0, 30, 0),
            end: DateTime::<Utc>::default(),
        };
        assert!(activity.add(&earlier));
        assert_eq!(activity.earliest_running, Some(at(0, 30, 0)));

        assert!(activity.add(&SpanInterval {
            end: at(0, 45, 0),
            ..earlier
        }));
        assert_eq!(activity.earliest_running, Some(at(1, 0, 0)));

        assert!(activity.add(&SpanInterval {
            end: at(2, 0, 0),
            ..running
        }));
        assert!(!activity.is_running());
        assert_eq!(activity.end_time_or_fallback(at(3, 0, 0)), Some(at(2, 0, 0)));
        assert_eq!(
            activity.duration(at(3, 0, 0)),
            Duration::minutes(15) + Duration::hours(1)
        );
    }

    #[test]
    fn test_duration_is_monotonic_in_now() {
        let mut activity = Activity::default();
        activity.add(&SpanInterval {
            id: id(1),
            start: at(1, 0, 0),
            end: at(1, 30, 0),
        });
        activity.add(&SpanInterval {
            id: id(2),
            start: at(1, 10, 0),
            end: DateTime::<Utc>::default(),
        });
        let mut last = Duration::zero();
        for minute in 0..59 {
            let d = activity.duration(at(2, minute, 0));
            assert!(d >= last);
            last = d;
        }
    }

    #[test]
    fn test_empty_fallback() {
        let activity = Activity::default();
        assert!(activity.is_empty());
        assert_eq!(activity.end_time_or_fallback(at(1, 0, 0)), None);
        assert_eq!(activity.duration(at(1, 0, 0)), Duration::zero());
    }
}
