//! Row and text sources feeding the worker.
//!
//! - [`replay`]: snapshots recorded as JSON files (or held in memory)
//! - [`pg_statements`]: live `pg_stat_statements` of a PostgreSQL server

pub mod pg_statements;
pub mod replay;

pub use pg_statements::{PgConnection, PgStatementsSource, PgStatementsTexts, pg_statements};
pub use replay::{ReplaySource, StaticTexts};
