//! Report model: the output of one successful worker run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::interval::Interval;
use crate::metrics::{Counters, Metrics};

/// Example execution of a class.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Example {
    pub query: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub db: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<DateTime<Utc>>,
    /// Query time of this execution in picoseconds.
    #[serde(default)]
    pub query_time: u64,
}

/// One class of queries and its statistics for an interval.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Class {
    pub id: String,
    #[serde(default)]
    pub fingerprint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub example: Option<Example>,
    pub total_queries: u64,
    pub metrics: Metrics,
}

impl Class {
    pub fn new(id: impl Into<String>, fingerprint: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fingerprint: fingerprint.into(),
            ..Default::default()
        }
    }

    /// Folds one delta row into the class.
    pub fn fold(&mut self, delta: &Counters) {
        self.total_queries = self.total_queries.saturating_add(delta.count);
        self.metrics.fold(delta);
    }

    /// Keeps `example` if it is slower than the current one.
    pub fn offer_example(&mut self, example: Example) {
        match &self.example {
            Some(current) if current.query_time >= example.query_time => {}
            _ => self.example = Some(example),
        }
    }
}

/// Aggregated statistics of one interval.
///
/// `classes` is ordered by class id. `global` folds every row of the
/// interval regardless of class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    pub interval: Interval,
    pub global: Class,
    pub classes: Vec<Class>,
}

impl Report {
    pub fn class(&self, id: &str) -> Option<&Class> {
        self.classes
            .binary_search_by(|c| c.id.as_str().cmp(id))
            .ok()
            .map(|i| &self.classes[i])
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(data: &str) -> serde_json::Result<Self> {
        serde_json::from_str(data)
    }
}
