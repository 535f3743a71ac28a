//! `pg_stat_statements` as a digest source.
//!
//! Each capture reads the whole view, grouped by (database, queryid), and
//! maps it onto [`DigestRow`]: the queryid is the digest, the database is
//! the schema. Class texts are looked up by queryid.
//!
//! Connects using the standard libpq environment variables:
//! PGHOST (default: localhost), PGPORT (default: 5432), PGUSER (default:
//! $USER), PGPASSWORD, PGDATABASE (default: same as PGUSER).

use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use crossbeam_channel::Sender;
use postgres::{Client, NoTls, Row};
use tracing::{debug, info, warn};

use crate::metrics::PICOS_PER_MILLI;
use crate::worker::{DigestRow, DoneSender, RowSource, SourceError, TextSource};

const TEXT_QUERY: &str = "SELECT COALESCE(query, '') FROM pg_stat_statements WHERE queryid = $1 LIMIT 1";

/// Lazily (re)established connection shared by the row and text sources.
pub struct PgConnection {
    connection_string: String,
    client: Option<Client>,
    server_version_num: Option<i32>,
    last_error: Option<String>,
}

impl PgConnection {
    pub fn new(connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
            client: None,
            server_version_num: None,
            last_error: None,
        }
    }

    pub fn from_env() -> Result<Self, SourceError> {
        let user = std::env::var("PGUSER")
            .or_else(|_| std::env::var("USER"))
            .map_err(|_| SourceError::Unavailable("PGUSER or USER not set".to_string()))?;

        let host = std::env::var("PGHOST").unwrap_or_else(|_| "localhost".to_string());
        let port = std::env::var("PGPORT").unwrap_or_else(|_| "5432".to_string());
        let password = std::env::var("PGPASSWORD").unwrap_or_default();
        let database = std::env::var("PGDATABASE").unwrap_or_else(|_| user.clone());

        let connection_string = if password.is_empty() {
            format!("host={} port={} user={} dbname={}", host, port, user, database)
        } else {
            format!(
                "host={} port={} user={} password={} dbname={}",
                host, port, user, password, database
            )
        };
        Ok(Self::new(connection_string))
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    fn ensure_connected(&mut self) -> Result<(), SourceError> {
        if self.client.is_none() {
            match Client::connect(&self.connection_string, NoTls) {
                Ok(mut client) => {
                    self.server_version_num = client
                        .query_one("SHOW server_version_num", &[])
                        .ok()
                        .and_then(|row| row.try_get::<_, String>(0).ok())
                        .and_then(|v| v.parse::<i32>().ok());
                    info!(server_version_num = ?self.server_version_num, "connected to PostgreSQL");
                    self.client = Some(client);
                    self.last_error = None;
                }
                Err(e) => {
                    let msg = format_postgres_error(&e);
                    self.last_error = Some(msg.clone());
                    self.server_version_num = None;
                    return Err(SourceError::Unavailable(msg));
                }
            }
        }
        Ok(())
    }

    fn client(&mut self) -> Result<&mut Client, SourceError> {
        self.ensure_connected()?;
        self.client
            .as_mut()
            .ok_or_else(|| SourceError::Unavailable("not connected".to_string()))
    }

    /// Drops the connection after a failed query; the next use reconnects.
    fn disconnect(&mut self, e: &postgres::Error) -> String {
        let msg = format_postgres_error(e);
        warn!(error = %msg, "PostgreSQL query failed, dropping connection");
        self.client = None;
        self.last_error = Some(msg.clone());
        msg
    }

    fn fetch_statements(&mut self) -> Result<Vec<DigestRow>, SourceError> {
        self.ensure_connected()?;
        let query = build_statements_query(self.server_version_num);
        let client = self.client()?;
        let rows = match client.query(query.as_str(), &[]) {
            Ok(rows) => rows,
            Err(e) => return Err(SourceError::Fetch(self.disconnect(&e))),
        };
        rows.iter()
            .map(digest_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| SourceError::Fetch(format_postgres_error(&e)))
    }

    fn fetch_text(&mut self, queryid: i64) -> Result<Option<String>, SourceError> {
        let client = self.client()?;
        match client.query_opt(TEXT_QUERY, &[&queryid]) {
            Ok(row) => Ok(row.and_then(|r| r.try_get::<_, String>(0).ok())),
            Err(e) => Err(SourceError::Fetch(self.disconnect(&e))),
        }
    }
}

fn lock(conn: &Mutex<PgConnection>) -> Result<MutexGuard<'_, PgConnection>, SourceError> {
    conn.lock()
        .map_err(|_| SourceError::Unavailable("connection lock poisoned".to_string()))
}

/// Row source over `pg_stat_statements`.
pub struct PgStatementsSource {
    conn: Arc<Mutex<PgConnection>>,
}

/// Statement text lookup by queryid.
pub struct PgStatementsTexts {
    conn: Arc<Mutex<PgConnection>>,
}

/// Row and text sources sharing one connection.
pub fn pg_statements(conn: PgConnection) -> (PgStatementsSource, PgStatementsTexts) {
    let conn = Arc::new(Mutex::new(conn));
    (
        PgStatementsSource { conn: conn.clone() },
        PgStatementsTexts { conn },
    )
}

impl RowSource<DigestRow> for PgStatementsSource {
    fn start(
        &mut self,
        rows: Sender<DigestRow>,
        _last_fetch_secs: f64,
        done: DoneSender,
    ) -> Result<(), SourceError> {
        lock(&self.conn)?.ensure_connected()?;

        let conn = self.conn.clone();
        thread::Builder::new()
            .name("qan-pg-statements".to_string())
            .spawn(move || {
                let fetched = lock(&conn).and_then(|mut c| c.fetch_statements());
                let result = fetched.and_then(|batch| {
                    debug!(rows = batch.len(), "pg_stat_statements fetched");
                    batch
                        .into_iter()
                        .try_for_each(|row| rows.send(row).map_err(|_| SourceError::Disconnected))
                });
                drop(rows);
                let _ = done.send(result);
            })
            .map_err(|e| SourceError::Unavailable(format!("cannot spawn fetch thread: {}", e)))?;
        Ok(())
    }
}

impl TextSource for PgStatementsTexts {
    fn text(&mut self, id: &str) -> Result<String, SourceError> {
        let queryid: i64 = id
            .parse()
            .map_err(|_| SourceError::NotFound(id.to_string()))?;
        lock(&self.conn)?
            .fetch_text(queryid)?
            .ok_or_else(|| SourceError::NotFound(id.to_string()))
    }
}

/// Milliseconds as reported by the view to integer picoseconds.
pub fn ms_to_ps(ms: f64) -> u64 {
    if ms.is_finite() && ms > 0.0 {
        (ms * PICOS_PER_MILLI as f64).round() as u64
    } else {
        0
    }
}

fn to_u64(v: i64) -> u64 {
    u64::try_from(v).unwrap_or(0)
}

fn digest_row(row: &Row) -> Result<DigestRow, postgres::Error> {
    let queryid: i64 = row.try_get("queryid")?;
    let calls = to_u64(row.try_get("calls")?);
    let total = ms_to_ps(row.try_get("total_exec_time")?);
    Ok(DigestRow {
        schema: row.try_get("datname")?,
        digest: queryid.to_string(),
        count_star: calls,
        sum_timer_wait: total,
        min_timer_wait: ms_to_ps(row.try_get("min_exec_time")?),
        avg_timer_wait: if calls > 0 { total / calls } else { 0 },
        max_timer_wait: ms_to_ps(row.try_get("max_exec_time")?),
        sum_rows_sent: to_u64(row.try_get("rows")?),
        ..Default::default()
    })
}

/// Builds version-aware query for pg_stat_statements.
///
/// Rows of different users and top-level flags share one (database,
/// queryid) digest. No row limit: a row dropping out and back in would be
/// counted from zero again.
pub fn build_statements_query(server_version_num: Option<i32>) -> String {
    let (total, min, max) = if server_version_num.unwrap_or(0) >= 130000 {
        ("s.total_exec_time", "s.min_exec_time", "s.max_exec_time")
    } else {
        ("s.total_time", "s.min_time", "s.max_time")
    };

    format!(
        r#"
            SELECT
                COALESCE(d.datname, '') as datname,
                s.queryid,
                SUM(s.calls)::bigint as calls,
                SUM({total})::double precision as total_exec_time,
                MIN({min})::double precision as min_exec_time,
                MAX({max})::double precision as max_exec_time,
                SUM(s.rows)::bigint as rows
            FROM pg_stat_statements s
            LEFT JOIN pg_database d ON d.oid = s.dbid
            WHERE s.queryid IS NOT NULL
            GROUP BY d.datname, s.queryid
        "#
    )
}

/// Formats PostgreSQL error message for display.
pub fn format_postgres_error(e: &postgres::Error) -> String {
    if let Some(db_error) = e.as_db_error() {
        format!("{}: {}", db_error.severity(), db_error.message())
    } else {
        let msg = e.to_string();
        if msg.contains("Connection refused") {
            "connection refused".to_string()
        } else if msg.contains("password authentication failed") {
            "password authentication failed".to_string()
        } else {
            msg
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;

    #[test]
    fn query_uses_exec_time_columns_on_pg13() {
        let q = build_statements_query(Some(130005));
        assert!(q.contains("SUM(s.total_exec_time)"));
        assert!(q.contains("MIN(s.min_exec_time)"));
        assert!(!q.contains("s.total_time"));
        assert!(!q.contains("LIMIT"));
    }

    #[test]
    fn query_selects_only_mapped_counters() {
        let q = build_statements_query(Some(160002));
        assert!(q.contains("SUM(s.rows)::bigint as rows\n"));
        assert!(!q.contains("temp_blks"));
    }

    #[test]
    fn query_falls_back_to_legacy_columns() {
        for version in [None, Some(120010)] {
            let q = build_statements_query(version);
            assert!(q.contains("SUM(s.total_time)"));
            assert!(q.contains("MAX(s.max_time)"));
            assert!(!q.contains("exec_time)::"));
        }
    }

    #[test]
    fn millis_to_picos() {
        assert_eq!(ms_to_ps(1.0), PICOS_PER_MILLI);
        assert_eq!(ms_to_ps(0.25), 250_000_000);
        assert_eq!(ms_to_ps(-3.0), 0);
        assert_eq!(ms_to_ps(f64::NAN), 0);
    }

    #[test]
    fn negative_counters_clamp_to_zero() {
        assert_eq!(to_u64(-1), 0);
        assert_eq!(to_u64(17), 17);
    }

    #[test]
    fn unreachable_server_fails_setup() {
        let conn = PgConnection::new(
            "host=/nonexistent/qan-socket-dir port=5432 user=qan dbname=qan connect_timeout=1",
        );
        let (mut source, mut texts) = pg_statements(conn);

        let (rows_tx, _rows_rx) = bounded(1);
        let (done_tx, done_rx) = bounded(1);
        let res = source.start(rows_tx, 0.0, done_tx);
        assert!(matches!(res, Err(SourceError::Unavailable(_))));
        // Nothing was started.
        assert!(done_rx.try_recv().is_err());

        assert!(matches!(texts.text("42"), Err(SourceError::Unavailable(_))));
        assert_eq!(
            texts.text("not-a-queryid"),
            Err(SourceError::NotFound("not-a-queryid".to_string()))
        );
        assert!(lock(&source.conn).unwrap().last_error().is_some());
    }
}
