//! qand - Query analytics daemon.
//!
//! Captures query statistics of one instance every interval, diffs them
//! against the previous capture and writes one JSON report per interval.

use tikv_jemallocator::Jemalloc;
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use chrono::Utc;
use clap::Parser;
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use qan_core::analyzer::{Analyzer, AnalyzerHandle};
use qan_core::config::{QanConfig, SourceKind};
use qan_core::sink::JsonDirSink;
use qan_core::source::{PgConnection, ReplaySource, StaticTexts, pg_statements};
use qan_core::worker::{DigestRow, DigestRows, NoText, ProfileDoc, ProfileRows, RowKind, Worker};

/// Query analytics daemon.
#[derive(Parser)]
#[command(name = "qand", about = "Query analytics daemon", version)]
struct Args {
    /// Instance config file (qan-<uuid>.conf). CLI options override it.
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Instance id when no config file is given.
    #[arg(long, default_value = "local")]
    uuid: String,

    /// Interval length in seconds.
    #[arg(short, long)]
    interval: Option<u64>,

    /// Statistics source: perfschema, profiler or pg_statements.
    #[arg(short, long, value_parser = parse_source)]
    source: Option<SourceKind>,

    /// Keep the slowest query of each class as its example.
    #[arg(long)]
    example_queries: bool,

    /// Replay recorded snapshots (iter*.json) instead of reading a live source.
    #[arg(long, value_name = "DIR")]
    replay_dir: Option<PathBuf>,

    /// With --replay-dir: do not wait for wall-clock intervals.
    #[arg(long)]
    fast: bool,

    /// Output directory for reports.
    #[arg(short, long, default_value = "./reports")]
    output_dir: PathBuf,

    /// Save the effective config as qan-<uuid>.conf in this directory.
    #[arg(long, value_name = "DIR")]
    save_config: Option<PathBuf>,

    /// Increase logging verbosity (-v for debug, -vv for trace). Default is info level.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,
}

fn parse_source(s: &str) -> Result<SourceKind, String> {
    match s.trim() {
        "perfschema" => Ok(SourceKind::Perfschema),
        "profiler" => Ok(SourceKind::Profiler),
        "pg_statements" | "pg-statements" => Ok(SourceKind::PgStatements),
        other => Err(format!(
            "unknown source '{}' (expected perfschema, profiler or pg_statements)",
            other
        )),
    }
}

/// Initializes the tracing subscriber with the appropriate log level.
/// Default level is INFO. Use -q for quiet mode (errors only).
fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let mut filter = EnvFilter::from_default_env();
    for target in ["qand", "qan_core"] {
        if let Ok(directive) = format!("{}={}", target, level).parse() {
            filter = filter.add_directive(directive);
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Config file (if any) with CLI overrides applied.
fn effective_config(args: &Args) -> Result<QanConfig, Box<dyn Error>> {
    let mut config = match &args.config {
        Some(path) => QanConfig::load(path)?,
        None => QanConfig {
            uuid: args.uuid.clone(),
            ..Default::default()
        },
    };
    if let Some(interval) = args.interval {
        config.interval = interval;
    }
    if let Some(source) = args.source {
        config.source = source;
    }
    if args.example_queries {
        config.example_queries = true;
    }
    config.validate()?;
    Ok(config)
}

/// Starts the analyzer on wall-clock ticks, or on back-to-back ticks for a
/// fast replay.
fn start<K: RowKind + 'static>(
    analyzer: Analyzer<K>,
    interval: Duration,
    fast: bool,
) -> Result<AnalyzerHandle, Box<dyn Error>> {
    if !fast {
        return Ok(analyzer.spawn(interval)?);
    }
    let (tick_tx, ticks) = crossbeam_channel::bounded(1);
    thread::Builder::new()
        .name("qand-replay-ticks".to_string())
        .spawn(move || while tick_tx.send(Utc::now()).is_ok() {})?;
    Ok(analyzer.spawn_with_ticks(ticks)?)
}

fn replay_dir(args: &Args, source: SourceKind) -> Result<&PathBuf, Box<dyn Error>> {
    args.replay_dir
        .as_ref()
        .ok_or_else(|| format!("source {} needs --replay-dir", source).into())
}

fn run(args: Args) -> Result<(), Box<dyn Error>> {
    let config = effective_config(&args)?;

    info!("qand {} starting", env!("CARGO_PKG_VERSION"));
    info!(
        "Config: uuid={}, interval={}s, source={}, example_queries={}, output={}",
        config.uuid,
        config.interval,
        config.source,
        config.example_queries,
        args.output_dir.display()
    );
    debug!(key_filters = ?config.key_filters, "fingerprint key filters");

    if let Some(dir) = &args.save_config {
        let path = config.save(dir)?;
        info!("Config saved to {}", path.display());
    }

    let name = format!("qan-{}", config.uuid);
    let sink = JsonDirSink::new(&args.output_dir, &config.uuid)?;
    debug!("Writing reports to {}", sink.dir().display());
    let interval = Duration::from_secs(config.interval);
    let fast = args.fast && args.replay_dir.is_some();

    let mut handle = match config.source {
        SourceKind::Profiler => {
            let dir = replay_dir(&args, config.source)?;
            let kind = ProfileRows::new(config.fingerprinter()?, config.example_queries);
            let source = ReplaySource::<ProfileDoc>::from_dir(dir)?;
            info!("Replaying {} profiler snapshots from {}", source.remaining(), dir.display());
            let worker = Worker::new(format!("{}-worker", name), kind, source, NoText);
            start(Analyzer::new(&name, worker, sink), interval, fast)?
        }
        SourceKind::Perfschema => {
            let dir = replay_dir(&args, config.source)?;
            let source = ReplaySource::<DigestRow>::from_dir(dir)?;
            let texts = StaticTexts::from_dir(dir)?;
            info!("Replaying {} digest snapshots from {}", source.remaining(), dir.display());
            let worker = Worker::new(format!("{}-worker", name), DigestRows, source, texts);
            start(Analyzer::new(&name, worker, sink), interval, fast)?
        }
        SourceKind::PgStatements => match &args.replay_dir {
            Some(dir) => {
                let source = ReplaySource::<DigestRow>::from_dir(dir)?;
                let texts = StaticTexts::from_dir(dir)?;
                info!("Replaying {} digest snapshots from {}", source.remaining(), dir.display());
                let worker = Worker::new(format!("{}-worker", name), DigestRows, source, texts);
                start(Analyzer::new(&name, worker, sink), interval, fast)?
            }
            None => {
                let pg_host = std::env::var("PGHOST").unwrap_or_else(|_| "localhost".to_string());
                let pg_port = std::env::var("PGPORT").unwrap_or_else(|_| "5432".to_string());
                let (source, texts) = pg_statements(PgConnection::from_env()?);
                info!("PostgreSQL source: {}:{}", pg_host, pg_port);
                let worker = Worker::new(format!("{}-worker", name), DigestRows, source, texts);
                start(Analyzer::new(&name, worker, sink), interval, false)?
            }
        },
    };

    // Setup graceful shutdown
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        r.store(false, Ordering::SeqCst);
    }) {
        warn!("Failed to set Ctrl-C handler: {}", e);
    }

    info!("Starting analyzer {}", handle.name());
    let sleep_interval = Duration::from_millis(100);
    while running.load(Ordering::SeqCst) && !handle.is_finished() {
        thread::sleep(sleep_interval);
    }

    info!("Shutting down...");
    handle.stop();
    for (key, value) in handle.status() {
        debug!("status {}: {}", key, value);
    }
    info!("Shutdown complete");
    Ok(())
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    if let Err(e) = run(args) {
        error!("{}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_source_names() {
        assert_eq!(parse_source("perfschema"), Ok(SourceKind::Perfschema));
        assert_eq!(parse_source("profiler"), Ok(SourceKind::Profiler));
        assert_eq!(parse_source("pg_statements"), Ok(SourceKind::PgStatements));
        assert_eq!(parse_source("pg-statements"), Ok(SourceKind::PgStatements));
        assert!(parse_source("mysql").is_err());
    }

    #[test]
    fn cli_overrides_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = QanConfig {
            uuid: "db1".to_string(),
            interval: 60,
            ..Default::default()
        }
        .save(dir.path())
        .unwrap();

        let args = Args::parse_from([
            "qand",
            "--config",
            path.to_str().unwrap(),
            "--interval",
            "5",
            "--source",
            "profiler",
            "--example-queries",
        ]);
        let config = effective_config(&args).unwrap();
        assert_eq!(config.uuid, "db1");
        assert_eq!(config.interval, 5);
        assert_eq!(config.source, SourceKind::Profiler);
        assert!(config.example_queries);
    }

    #[test]
    fn zero_interval_is_rejected() {
        let args = Args::parse_from(["qand", "--interval", "0"]);
        assert!(effective_config(&args).is_err());
    }

    #[test]
    fn fast_replay_writes_reports() {
        let replay = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        for (n, count) in [(1, 1), (2, 3), (3, 6)] {
            std::fs::write(
                replay.path().join(format!("iter{:02}.json", n)),
                format!(r#"[{{"schema": "s", "digest": "d1", "count_star": {}}}]"#, count),
            )
            .unwrap();
        }

        let args = Args::parse_from([
            "qand",
            "--uuid",
            "replay",
            "--replay-dir",
            replay.path().to_str().unwrap(),
            "--fast",
            "--output-dir",
            out.path().to_str().unwrap(),
        ]);
        run(args).unwrap();

        let reports = std::fs::read_dir(out.path()).unwrap().count();
        assert_eq!(reports, 2);
    }
}
