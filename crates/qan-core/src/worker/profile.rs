//! Profiler rows: one document per executed operation.
//!
//! Documents carry no class identity, so they are fingerprinted. Each
//! document counts as one execution; a document read again in the next
//! snapshot yields a zero delta and is not counted twice.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use xxhash_rust::xxh3::xxh3_64;

use super::{ClassKey, RowKind};
use crate::fingerprint::{FingerprintError, Fingerprinter};
use crate::metrics::{Counters, PICOS_PER_MILLI, TimingCounter};
use crate::report::Example;

/// Profiler document of one operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProfileDoc {
    pub op: String,
    pub ns: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<Value>,
    pub millis: u64,
    pub nreturned: u64,
    #[serde(alias = "nscanned")]
    pub docs_examined: u64,
    pub response_length: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ts: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub client: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub user: String,
    /// Remaining profiler fields. They take part in the row identity.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ProfileDoc {
    /// Database part of the namespace.
    pub fn db(&self) -> &str {
        self.ns.split_once('.').map_or(self.ns.as_str(), |(db, _)| db)
    }
}

pub struct ProfileRows {
    fingerprinter: Fingerprinter,
    example_queries: bool,
}

impl ProfileRows {
    pub fn new(fingerprinter: Fingerprinter, example_queries: bool) -> Self {
        Self {
            fingerprinter,
            example_queries,
        }
    }
}

impl Default for ProfileRows {
    fn default() -> Self {
        Self::new(Fingerprinter::default(), false)
    }
}

fn hex_hash(data: &[u8]) -> String {
    format!("{:016X}", xxh3_64(data))
}

impl RowKind for ProfileRows {
    type Row = ProfileDoc;

    fn row_key(&self, row: &ProfileDoc) -> Option<String> {
        serde_json::to_vec(row).ok().map(|bytes| hex_hash(&bytes))
    }

    fn classify(&self, row: &ProfileDoc) -> Result<ClassKey, FingerprintError> {
        let fingerprint = self.fingerprinter.fingerprint(row)?;
        Ok(ClassKey {
            id: hex_hash(fingerprint.as_bytes()),
            fingerprint: Some(fingerprint),
        })
    }

    fn counters(&self, row: &ProfileDoc) -> Counters {
        let query_time = row.millis.saturating_mul(PICOS_PER_MILLI);
        Counters {
            count: 1,
            timings: vec![TimingCounter {
                name: "Query_time",
                total: query_time,
                min: Some(query_time),
                max: Some(query_time),
            }],
            numbers: vec![
                ("Docs_examined", row.docs_examined),
                ("Docs_returned", row.nreturned),
                ("Bytes_sent", row.response_length),
            ],
        }
    }

    fn example(&self, row: &ProfileDoc) -> Option<Example> {
        if !self.example_queries {
            return None;
        }
        let query = row
            .command
            .as_ref()
            .filter(|c| c.as_object().is_some_and(|o| !o.is_empty()))
            .or(row.query.as_ref())?;
        Some(Example {
            query: query.to_string(),
            db: row.db().to_string(),
            ts: row.ts,
            query_time: row.millis.saturating_mul(PICOS_PER_MILLI),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interval::Interval;
    use crate::report::Report;
    use crate::source::replay::ReplaySource;
    use crate::worker::{NoText, Worker};
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    fn doc(value: Value) -> ProfileDoc {
        serde_json::from_value(value).unwrap()
    }

    fn find(id: u64, user_id: u64, millis: u64) -> ProfileDoc {
        doc(json!({
            "op": "query",
            "ns": "shop.orders",
            "query": {"find": "orders", "filter": {"user_id": user_id}},
            "millis": millis,
            "nreturned": 2,
            "docsExamined": 10,
            "responseLength": 300,
            "ts": format!("2024-03-01T10:00:{:02}Z", id),
        }))
    }

    fn run(iters: Vec<Vec<ProfileDoc>>, examples: bool) -> Vec<Option<Report>> {
        let n = iters.len() as u64;
        let kind = ProfileRows::new(Fingerprinter::default(), examples);
        let mut worker = Worker::new("qan-profiler", kind, ReplaySource::new(iters), NoText);
        let mut prev = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        (1..=n)
            .map(|number| {
                let stop = prev + Duration::minutes(1);
                let interval = Interval {
                    number,
                    start_time: prev,
                    stop_time: stop,
                };
                prev = stop;
                worker.setup(interval).unwrap();
                let res = worker.run().unwrap();
                worker.cleanup();
                res
            })
            .collect()
    }

    #[test]
    fn legacy_nscanned_is_docs_examined() {
        let d = doc(json!({"op": "query", "ns": "a.b", "nscanned": 42}));
        assert_eq!(d.docs_examined, 42);
        assert_eq!(d.db(), "a");
    }

    #[test]
    fn counters_convert_millis_to_picoseconds() {
        let c = ProfileRows::default().counters(&find(1, 7, 3));
        assert_eq!(c.count, 1);
        let qt = c.timing("Query_time").unwrap();
        assert_eq!(qt.total, 3_000_000_000);
        assert_eq!(qt.min, Some(3_000_000_000));
        assert_eq!(c.number("Docs_examined"), Some(10));
        assert_eq!(c.number("Docs_returned"), Some(2));
        assert_eq!(c.number("Bytes_sent"), Some(300));
    }

    #[test]
    fn class_id_is_hash_of_fingerprint() {
        let kind = ProfileRows::default();
        let a = kind.classify(&find(1, 7, 3)).unwrap();
        let b = kind.classify(&find(2, 99, 8)).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.fingerprint.as_deref(), Some("FIND orders user_id"));
        assert_eq!(a.id.len(), 16);
    }

    #[test]
    fn identical_documents_share_identity() {
        let kind = ProfileRows::default();
        assert_eq!(kind.row_key(&find(1, 7, 3)), kind.row_key(&find(1, 7, 3)));
        assert_ne!(kind.row_key(&find(1, 7, 3)), kind.row_key(&find(2, 7, 3)));
    }

    #[test]
    fn executions_differing_only_in_unmodelled_fields_are_distinct() {
        let exec = |lsid: &str| {
            doc(json!({
                "op": "query",
                "ns": "shop.orders",
                "query": {"find": "orders", "filter": {"user_id": 1}},
                "millis": 2,
                "ts": "2024-03-01T10:00:01.123Z",
                "lsid": {"id": lsid},
                "keysExamined": 1,
            }))
        };
        let kind = ProfileRows::default();
        assert_eq!(exec("s1").extra["keysExamined"], 1);
        assert_ne!(kind.row_key(&exec("s1")), kind.row_key(&exec("s2")));

        let res = run(vec![vec![], vec![exec("s1"), exec("s2")]], false);
        assert_eq!(res[1].as_ref().unwrap().classes[0].total_queries, 2);
    }

    #[test]
    fn documents_read_twice_count_once() {
        let res = run(
            vec![
                vec![find(1, 1, 5), find(2, 2, 5)],
                vec![find(2, 2, 5), find(3, 3, 4), find(4, 4, 9)],
            ],
            false,
        );
        assert!(res[0].is_none());

        let report = res[1].as_ref().unwrap();
        assert_eq!(report.classes.len(), 1);
        let class = &report.classes[0];
        assert_eq!(class.fingerprint, "FIND orders user_id");
        assert_eq!(class.total_queries, 2);
        let qt = class.metrics.time_metrics["Query_time"];
        assert_eq!(qt.sum, 13 * PICOS_PER_MILLI);
        assert_eq!(qt.min, Some(4 * PICOS_PER_MILLI));
        assert_eq!(qt.max, Some(9 * PICOS_PER_MILLI));
        assert_eq!(class.metrics.number_metrics["Docs_examined"].sum, 20);
        assert!(class.example.is_none());
    }

    #[test]
    fn slowest_document_is_the_example() {
        let res = run(
            vec![vec![], vec![find(3, 3, 4), find(4, 4, 9), find(5, 5, 1)]],
            true,
        );
        let class = &res[1].as_ref().unwrap().classes[0];
        let example = class.example.as_ref().unwrap();
        assert_eq!(example.db, "shop");
        assert_eq!(example.query_time, 9 * PICOS_PER_MILLI);
        assert!(example.query.contains("\"user_id\":4"));
        assert_eq!(
            example.ts,
            Some(Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 4).unwrap())
        );
    }

    #[test]
    fn malformed_document_is_skipped_and_noticed() {
        let bad = doc(json!({"op": "query", "ns": "shop.orders", "query": "oops", "millis": 1}));
        let kind = ProfileRows::default();
        let mut worker = Worker::new(
            "qan-profiler",
            kind,
            ReplaySource::new(vec![vec![], vec![bad, find(1, 1, 2)], vec![find(2, 2, 2)]]),
            NoText,
        );
        let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        for number in 1..=2u64 {
            let interval = Interval {
                number,
                start_time: t0 + Duration::minutes(number as i64 - 1),
                stop_time: t0 + Duration::minutes(number as i64),
            };
            worker.setup(interval).unwrap();
            let res = worker.run().unwrap();
            worker.cleanup();
            if number == 2 {
                let report = res.unwrap();
                assert_eq!(report.classes.len(), 1);
                assert_eq!(report.global.total_queries, 1);
            }
        }
        assert_eq!(worker.stats().map(|s| s.skipped), Some(1));
        assert!(worker.status().contains_key("qan-profiler-notice"));

        // A clean interval clears the notice.
        worker
            .setup(Interval {
                number: 3,
                start_time: t0 + Duration::minutes(2),
                stop_time: t0 + Duration::minutes(3),
            })
            .unwrap();
        assert!(worker.run().unwrap().is_some());
        worker.cleanup();
        assert!(!worker.status().contains_key("qan-profiler-notice"));
    }

    #[test]
    fn commands_are_grouped_by_command_shape() {
        let agg = |id: u64| {
            doc(json!({
                "op": "command",
                "ns": "shop.$cmd",
                "command": {
                    "aggregate": "orders",
                    "pipeline": [{"$match": {"status": "A", "n": id}}],
                },
                "millis": id,
            }))
        };
        let res = run(vec![vec![], vec![agg(1), agg(2), find(1, 1, 1)]], false);
        let report = res[1].as_ref().unwrap();
        let fps: Vec<&str> = report.classes.iter().map(|c| c.fingerprint.as_str()).collect();
        assert_eq!(fps.len(), 2);
        assert!(fps.contains(&"FIND orders user_id"));
        let aggregate = report
            .classes
            .iter()
            .find(|c| c.fingerprint.starts_with("AGGREGATE"))
            .unwrap();
        assert_eq!(aggregate.total_queries, 2);
    }
}
