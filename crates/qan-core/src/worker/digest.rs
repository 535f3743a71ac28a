//! Digest-table rows: one row per (schema, digest) with cumulative counters.

use serde::{Deserialize, Serialize};

use super::{ClassKey, RowKind};
use crate::fingerprint::FingerprintError;
use crate::metrics::{Counters, TimingCounter};

/// Row of a statement digest summary table. Timers are in picoseconds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DigestRow {
    pub schema: String,
    pub digest: String,
    pub count_star: u64,
    pub sum_timer_wait: u64,
    pub min_timer_wait: u64,
    pub avg_timer_wait: u64,
    pub max_timer_wait: u64,
    pub sum_lock_time: u64,
    pub sum_errors: u64,
    pub sum_warnings: u64,
    pub sum_rows_affected: u64,
    pub sum_rows_sent: u64,
    pub sum_rows_examined: u64,
    pub sum_created_tmp_disk_tables: u64,
    pub sum_created_tmp_tables: u64,
    pub sum_select_full_join: u64,
    pub sum_select_scan: u64,
    pub sum_sort_merge_passes: u64,
    pub sum_no_index_used: u64,
    pub sum_no_good_index_used: u64,
}

/// Digest rows are pre-keyed: the class is the digest, its text comes
/// from the text source.
#[derive(Debug, Clone, Copy, Default)]
pub struct DigestRows;

impl RowKind for DigestRows {
    type Row = DigestRow;

    fn row_key(&self, row: &DigestRow) -> Option<String> {
        // The catch-all row for statements past the table limit has no digest.
        if row.digest.is_empty() {
            return None;
        }
        Some(format!("{}\u{1f}{}", row.schema, row.digest))
    }

    fn classify(&self, row: &DigestRow) -> Result<ClassKey, FingerprintError> {
        Ok(ClassKey {
            id: row.digest.clone(),
            fingerprint: None,
        })
    }

    fn counters(&self, row: &DigestRow) -> Counters {
        let ran = row.count_star > 0;
        Counters {
            count: row.count_star,
            timings: vec![
                TimingCounter {
                    name: "Query_time",
                    total: row.sum_timer_wait,
                    min: ran.then_some(row.min_timer_wait),
                    max: ran.then_some(row.max_timer_wait),
                },
                TimingCounter {
                    name: "Lock_time",
                    total: row.sum_lock_time,
                    min: None,
                    max: None,
                },
            ],
            numbers: vec![
                ("Rows_affected", row.sum_rows_affected),
                ("Rows_sent", row.sum_rows_sent),
                ("Rows_examined", row.sum_rows_examined),
                ("Errors", row.sum_errors),
                ("Warnings", row.sum_warnings),
                ("Tmp_tables", row.sum_created_tmp_tables),
                ("Tmp_disk_tables", row.sum_created_tmp_disk_tables),
                ("Full_join", row.sum_select_full_join),
                ("Full_scan", row.sum_select_scan),
                ("Merge_passes", row.sum_sort_merge_passes),
                ("No_index_used", row.sum_no_index_used),
                ("No_good_index_used", row.sum_no_good_index_used),
            ],
        }
    }
}
