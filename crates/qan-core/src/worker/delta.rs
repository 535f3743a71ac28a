//! Delta computation between two cumulative snapshots of one row.

use crate::metrics::{Counters, TimingCounter};

/// What a current row is diffed against.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Baseline<'a> {
    /// Row was not in the previous snapshot.
    FirstSeen,
    /// A cumulative counter went down: the source was reset since.
    Reset,
    /// Every cumulative counter is >= its previous value.
    Advanced(&'a Counters),
}

impl<'a> Baseline<'a> {
    pub fn classify(prev: Option<&'a Counters>, curr: &Counters) -> Self {
        match prev {
            None => Baseline::FirstSeen,
            Some(prev) if regressed(prev, curr) => Baseline::Reset,
            Some(prev) => Baseline::Advanced(prev),
        }
    }
}

/// Compute u64 delta, returning `None` on counter regression.
pub fn du64(curr: u64, prev: u64) -> Option<u64> {
    curr.checked_sub(prev)
}

fn regressed(prev: &Counters, curr: &Counters) -> bool {
    if du64(curr.count, prev.count).is_none() {
        return true;
    }
    let timing_down = curr.timings.iter().any(|t| {
        prev.timing(t.name)
            .is_some_and(|p| du64(t.total, p.total).is_none())
    });
    let number_down = curr.numbers.iter().any(|(name, v)| {
        prev.number(name)
            .is_some_and(|p| du64(*v, p).is_none())
    });
    timing_down || number_down
}

/// Counters accumulated since `baseline`.
///
/// First-seen and reset rows count from zero. Min/max are taken from the
/// current row as-is.
pub fn delta(curr: &Counters, baseline: Baseline<'_>) -> Counters {
    let Baseline::Advanced(prev) = baseline else {
        return curr.clone();
    };

    let timings = curr
        .timings
        .iter()
        .map(|t| TimingCounter {
            total: prev
                .timing(t.name)
                .and_then(|p| du64(t.total, p.total))
                .unwrap_or(t.total),
            ..*t
        })
        .collect();

    let numbers = curr
        .numbers
        .iter()
        .map(|(name, v)| {
            let d = prev
                .number(name)
                .and_then(|p| du64(*v, p))
                .unwrap_or(*v);
            (*name, d)
        })
        .collect();

    Counters {
        count: curr.count - prev.count,
        timings,
        numbers,
    }
}
