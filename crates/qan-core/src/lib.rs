//! qan-core - query analytics engine.
//!
//! Provides:
//! - `interval` - tick → numbered interval sequencing, wall-clock ticker
//! - `worker` - snapshot-diff worker (`setup → run → cleanup` per interval)
//! - `fingerprint` - class keys for profiler documents
//! - `metrics` - per-class metric accumulation
//! - `report` - report model (classes, global class, examples)
//! - `source` - row and text sources (replay, `pg_stat_statements`)
//! - `sink` - report sinks
//! - `config` - per-instance configuration files
//! - `analyzer` - per-instance driver tying the above together

pub mod analyzer;
pub mod config;
pub mod fingerprint;
pub mod interval;
pub mod metrics;
pub mod report;
pub mod sink;
pub mod source;
pub mod worker;
