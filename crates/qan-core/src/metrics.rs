//! Per-class metric accumulation.
//!
//! A [`Metrics`] bag maps metric names to running statistics. Rows are folded
//! in one at a time through [`Metrics::fold`]; folding is commutative and
//! associative, so rows of one class may arrive in any order.
//!
//! Timings are kept in integer picoseconds. Averages are derived on read.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub const PICOS_PER_MILLI: u64 = 1_000_000_000;
pub const PICOS_PER_SEC: f64 = 1e12;

/// One named timing counter of a row.
///
/// `total` is cumulative; `min`/`max` are extremes reported by the source
/// (lifetime or per-event) and are never diffed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingCounter {
    pub name: &'static str,
    pub total: u64,
    pub min: Option<u64>,
    pub max: Option<u64>,
}

/// Counters of one row: execution count, timings, plain counters.
///
/// The same type carries cumulative values (as captured) and deltas
/// (after diffing against the previous snapshot).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Counters {
    pub count: u64,
    pub timings: Vec<TimingCounter>,
    pub numbers: Vec<(&'static str, u64)>,
}

impl Counters {
    pub fn timing(&self, name: &str) -> Option<&TimingCounter> {
        self.timings.iter().find(|t| t.name == name)
    }

    pub fn number(&self, name: &str) -> Option<u64> {
        self.numbers
            .iter()
            .find_map(|(n, v)| (*n == name).then_some(*v))
    }
}

/// Running statistics of a timing metric, in picoseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeStats {
    pub sum: u64,
    pub cnt: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<u64>,
}

impl TimeStats {
    /// Folds `count` executions totalling `total` picoseconds.
    pub fn fold(&mut self, total: u64, count: u64, min: Option<u64>, max: Option<u64>) {
        self.sum = self.sum.saturating_add(total);
        self.cnt = self.cnt.saturating_add(count);
        self.min = merge_opt(self.min, min, u64::min);
        self.max = merge_opt(self.max, max, u64::max);
    }

    /// Average per execution in picoseconds, 0 when nothing was folded.
    pub fn avg(&self) -> u64 {
        if self.cnt == 0 {
            0
        } else {
            self.sum / self.cnt
        }
    }

    pub fn sum_secs(&self) -> f64 {
        self.sum as f64 / PICOS_PER_SEC
    }

    pub fn avg_secs(&self) -> f64 {
        self.avg() as f64 / PICOS_PER_SEC
    }
}

fn merge_opt(a: Option<u64>, b: Option<u64>, pick: fn(u64, u64) -> u64) -> Option<u64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(pick(a, b)),
        (a, None) => a,
        (None, b) => b,
    }
}

/// Running sum of a plain counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NumberStats {
    pub sum: u64,
}

/// Metric bag of a class.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metrics {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub time_metrics: BTreeMap<String, TimeStats>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub number_metrics: BTreeMap<String, NumberStats>,
}

impl Metrics {
    /// Folds one delta row into the bag.
    ///
    /// Every timing gets the row's execution count; plain counters only
    /// contribute their sum.
    pub fn fold(&mut self, delta: &Counters) {
        for t in &delta.timings {
            self.time_metrics
                .entry(t.name.to_string())
                .or_default()
                .fold(t.total, delta.count, t.min, t.max);
        }
        for (name, value) in &delta.numbers {
            let stats = self.number_metrics.entry(name.to_string()).or_default();
            stats.sum = stats.sum.saturating_add(*value);
        }
    }
}
