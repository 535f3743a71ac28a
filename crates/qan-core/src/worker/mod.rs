//! Snapshot-diff worker.
//!
//! One worker serves one monitored instance. Each interval it runs
//! `setup → run → cleanup`:
//!
//! ```text
//!  setup(interval)            run()                          cleanup()
//!  ───────────────            ─────                          ─────────
//!  RowSource::start ──rows──▶ drain rows, wait for done ──▶  drop capture
//!                  ──done──▶  diff against previous snapshot
//!                             fold deltas into classes
//!                             retain current snapshot
//! ```
//!
//! Only one snapshot is retained: the previous interval's. A report is
//! produced only when the new interval directly follows it; otherwise the
//! new snapshot simply becomes the baseline for the next interval.
//!
//! Row shapes are abstracted behind [`RowKind`]: [`DigestRows`] for
//! pre-keyed digest tables and [`ProfileRows`] for profiler documents that
//! need fingerprinting.

pub mod delta;
pub mod digest;
pub mod profile;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, bounded, select};
use tracing::{debug, info, warn};

use crate::fingerprint::FingerprintError;
use crate::interval::Interval;
use crate::metrics::Counters;
use crate::report::{Class, Example, Report};
use delta::{Baseline, delta};

pub use digest::{DigestRow, DigestRows};
pub use profile::{ProfileDoc, ProfileRows};

/// Capacity of the row channel between a source and the worker.
pub const ROW_BUFFER: usize = 100;
/// Maximum number of class texts kept per worker.
pub const MAX_CACHED_TEXTS: usize = 1000;

/// Error type for row and text sources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    /// Source could not be engaged (connection, configuration).
    Unavailable(String),
    /// Source failed while producing rows.
    Fetch(String),
    /// Source went away without signalling completion.
    Disconnected,
    /// Replay source has no snapshots left.
    Exhausted,
    /// Text source has nothing for this id.
    NotFound(String),
}

impl fmt::Display for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceError::Unavailable(msg) => write!(f, "source unavailable: {}", msg),
            SourceError::Fetch(msg) => write!(f, "fetch failed: {}", msg),
            SourceError::Disconnected => write!(f, "source disconnected"),
            SourceError::Exhausted => write!(f, "no more snapshots"),
            SourceError::NotFound(id) => write!(f, "no text for {}", id),
        }
    }
}

impl std::error::Error for SourceError {}

/// Completion channel of a capture: exactly one `Ok(())` or `Err(..)`.
pub type DoneSender = Sender<Result<(), SourceError>>;

/// Produces the rows of one snapshot.
///
/// `start` returns immediately. Rows are sent on `rows`, followed by exactly
/// one completion message on `done`. An `Err` from `start` means nothing was
/// started.
pub trait RowSource<R>: Send {
    fn start(
        &mut self,
        rows: Sender<R>,
        last_fetch_secs: f64,
        done: DoneSender,
    ) -> Result<(), SourceError>;
}

impl<R, F> RowSource<R> for F
where
    F: FnMut(Sender<R>, f64, DoneSender) -> Result<(), SourceError> + Send,
{
    fn start(
        &mut self,
        rows: Sender<R>,
        last_fetch_secs: f64,
        done: DoneSender,
    ) -> Result<(), SourceError> {
        self(rows, last_fetch_secs, done)
    }
}

/// Resolves human-readable text (fingerprint, digest text) of a class id.
pub trait TextSource: Send {
    fn text(&mut self, id: &str) -> Result<String, SourceError>;
}

impl<F> TextSource for F
where
    F: FnMut(&str) -> Result<String, SourceError> + Send,
{
    fn text(&mut self, id: &str) -> Result<String, SourceError> {
        self(id)
    }
}

/// Text source for row kinds that carry their own fingerprint.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoText;

impl TextSource for NoText {
    fn text(&mut self, id: &str) -> Result<String, SourceError> {
        Err(SourceError::NotFound(id.to_string()))
    }
}

/// Class a row folds into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassKey {
    pub id: String,
    /// `None` when the text has to be looked up through a [`TextSource`].
    pub fingerprint: Option<String>,
}

/// Shape of the rows a worker diffs.
pub trait RowKind: Send {
    type Row: Send + 'static;

    /// Identity pairing a row with its predecessor. `None` skips the row.
    fn row_key(&self, row: &Self::Row) -> Option<String>;

    fn classify(&self, row: &Self::Row) -> Result<ClassKey, FingerprintError>;

    /// Cumulative counters of the row.
    fn counters(&self, row: &Self::Row) -> Counters;

    fn example(&self, _row: &Self::Row) -> Option<Example> {
        None
    }
}

/// Error type for the worker lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerError {
    /// Source could not be started; nothing was captured.
    Setup(SourceError),
    /// Capture failed; the previous snapshot is kept.
    Capture(SourceError),
    /// `run` called without a successful `setup`.
    NotSetUp,
}

impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerError::Setup(e) => write!(f, "setup: {}", e),
            WorkerError::Capture(e) => write!(f, "capture: {}", e),
            WorkerError::NotSetUp => write!(f, "run called without setup"),
        }
    }
}

impl std::error::Error for WorkerError {}

/// Figures of the last successful capture.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkerStats {
    pub interval: u64,
    pub rows: usize,
    pub classes: usize,
    pub skipped: usize,
    pub run_time: Duration,
}

struct Snapshot<R> {
    interval: Interval,
    rows: HashMap<String, R>,
}

struct Capture<R> {
    interval: Interval,
    rows: Receiver<R>,
    done: Receiver<Result<(), SourceError>>,
    started: Instant,
}

impl<R> Capture<R> {
    /// Collects every row and the completion signal.
    ///
    /// The row channel is emptied even when the source reports an error;
    /// dropping the receivers afterwards unblocks a source still sending.
    fn drain(self) -> Result<Vec<R>, SourceError> {
        let mut rows = Vec::new();
        let outcome = loop {
            select! {
                recv(self.rows) -> msg => match msg {
                    Ok(row) => rows.push(row),
                    Err(_) => break self.done.recv().unwrap_or(Err(SourceError::Disconnected)),
                },
                recv(self.done) -> msg => break msg.unwrap_or(Err(SourceError::Disconnected)),
            }
        };
        rows.extend(self.rows.try_iter());
        outcome.map(|()| rows)
    }
}

/// Snapshot-diff worker for one instance.
pub struct Worker<K: RowKind> {
    name: String,
    kind: K,
    source: Box<dyn RowSource<K::Row>>,
    texts: Box<dyn TextSource>,
    text_cache: HashMap<String, String>,
    prev: Option<Snapshot<K::Row>>,
    capture: Option<Capture<K::Row>>,
    last_fetch: Option<Instant>,
    last_stats: Option<WorkerStats>,
    notice: Option<String>,
}

impl<K: RowKind> Worker<K> {
    pub fn new(
        name: impl Into<String>,
        kind: K,
        source: impl RowSource<K::Row> + 'static,
        texts: impl TextSource + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            source: Box::new(source),
            texts: Box::new(texts),
            text_cache: HashMap::new(),
            prev: None,
            capture: None,
            last_fetch: None,
            last_stats: None,
            notice: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Starts capturing the snapshot of `interval`.
    pub fn setup(&mut self, interval: Interval) -> Result<(), WorkerError> {
        if self.capture.is_some() {
            warn!(worker = %self.name, "previous capture was not cleaned up, discarding it");
            self.cleanup();
        }

        let last_fetch_secs = self
            .last_fetch
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0);

        let (row_tx, row_rx) = bounded(ROW_BUFFER);
        let (done_tx, done_rx) = bounded(1);
        self.source
            .start(row_tx, last_fetch_secs, done_tx)
            .map_err(WorkerError::Setup)?;

        self.last_fetch = Some(Instant::now());
        self.capture = Some(Capture {
            interval,
            rows: row_rx,
            done: done_rx,
            started: Instant::now(),
        });
        debug!(worker = %self.name, interval = interval.number, "capture started");
        Ok(())
    }

    /// Finishes the capture and diffs it against the previous snapshot.
    ///
    /// `Ok(None)` when there is no adjacent previous snapshot (first
    /// interval, interval out of sequence, clock moved backward).
    pub fn run(&mut self) -> Result<Option<Report>, WorkerError> {
        let capture = self.capture.take().ok_or(WorkerError::NotSetUp)?;
        let interval = capture.interval;
        let started = capture.started;

        let rows = match capture.drain() {
            Ok(rows) => rows,
            Err(e) => {
                warn!(worker = %self.name, interval = interval.number, error = %e,
                    "capture failed, keeping previous snapshot");
                return Err(WorkerError::Capture(e));
            }
        };

        let row_count = rows.len();
        let (curr, unkeyed) = self.snapshot(interval, rows);

        let prev = match self.prev.take() {
            None => {
                info!(worker = %self.name, interval = interval.number,
                    "first interval, waiting for a second snapshot");
                None
            }
            Some(prev) => match interval.follows(&prev.interval) {
                Ok(()) => Some(prev),
                Err(gap) => {
                    info!(worker = %self.name, interval = interval.number, %gap,
                        "interval out of sequence, resetting baseline");
                    None
                }
            },
        };

        let (report, skipped) = match prev {
            Some(prev) => {
                let (report, skipped) = self.aggregate(&prev, &curr);
                if skipped == 0 {
                    self.notice = None;
                }
                (Some(report), skipped)
            }
            None => (None, 0),
        };

        self.prev = Some(curr);
        self.last_stats = Some(WorkerStats {
            interval: interval.number,
            rows: row_count,
            classes: report.as_ref().map_or(0, |r| r.classes.len()),
            skipped: skipped + unkeyed,
            run_time: started.elapsed(),
        });
        Ok(report)
    }

    /// Releases the capture channels. Idempotent.
    pub fn cleanup(&mut self) {
        if self.capture.take().is_some() {
            debug!(worker = %self.name, "capture discarded");
        }
    }

    pub fn stats(&self) -> Option<&WorkerStats> {
        self.last_stats.as_ref()
    }

    /// Flattened status for health reporting.
    pub fn status(&self) -> BTreeMap<String, String> {
        let mut status = BTreeMap::new();
        let line = match &self.last_stats {
            Some(s) => format!(
                "rows: {}, classes: {}, skipped: {}, interval: {}, time: {} ms",
                s.rows,
                s.classes,
                s.skipped,
                s.interval,
                s.run_time.as_millis()
            ),
            None => String::new(),
        };
        status.insert(format!("{}-last", self.name), line);
        if let Some(notice) = &self.notice {
            status.insert(format!("{}-notice", self.name), notice.clone());
        }
        status
    }

    /// Keys captured rows. Returns the snapshot and the number of rows
    /// without identity.
    fn snapshot(&self, interval: Interval, rows: Vec<K::Row>) -> (Snapshot<K::Row>, usize) {
        let mut keyed = HashMap::with_capacity(rows.len());
        let mut unkeyed = 0;
        for row in rows {
            match self.kind.row_key(&row) {
                Some(key) => {
                    if keyed.insert(key, row).is_some() {
                        debug!(worker = %self.name, "duplicate row identity in snapshot");
                    }
                }
                None => unkeyed += 1,
            }
        }
        (
            Snapshot {
                interval,
                rows: keyed,
            },
            unkeyed,
        )
    }

    /// Diffs `curr` against `prev` and folds the deltas into classes.
    fn aggregate(
        &mut self,
        prev: &Snapshot<K::Row>,
        curr: &Snapshot<K::Row>,
    ) -> (Report, usize) {
        let mut classes: BTreeMap<String, Class> = BTreeMap::new();
        let mut need_text: HashSet<String> = HashSet::new();
        let mut global = Class::default();
        let mut skipped = 0;
        let mut resets = 0;

        for (key, row) in &curr.rows {
            let counters = self.kind.counters(row);
            let prev_counters = prev.rows.get(key).map(|r| self.kind.counters(r));
            let baseline = Baseline::classify(prev_counters.as_ref(), &counters);
            if baseline == Baseline::Reset {
                resets += 1;
            }

            let d = delta(&counters, baseline);
            if d.count == 0 {
                continue;
            }

            let class_key = match self.kind.classify(row) {
                Ok(k) => k,
                Err(e) => {
                    warn!(worker = %self.name, error = %e, "cannot classify row, skipping it");
                    self.notice = Some(e.to_string());
                    skipped += 1;
                    continue;
                }
            };

            let class = classes.entry(class_key.id.clone()).or_insert_with(|| {
                match &class_key.fingerprint {
                    Some(fp) => Class::new(class_key.id.clone(), fp.clone()),
                    None => {
                        need_text.insert(class_key.id.clone());
                        Class::new(class_key.id.clone(), String::new())
                    }
                }
            });
            class.fold(&d);
            if let Some(example) = self.kind.example(row) {
                class.offer_example(example);
            }
            global.fold(&d);
        }

        if resets > 0 {
            info!(worker = %self.name, rows = resets, "counters reset since previous snapshot");
        }

        for id in need_text {
            let text = self.resolve_text(&id);
            if let Some(class) = classes.get_mut(&id) {
                class.fingerprint = text;
            }
        }

        let report = Report {
            interval: curr.interval,
            global,
            classes: classes.into_values().collect(),
        };
        (report, skipped)
    }

    /// Class text from the cache or the text source. Failures yield an
    /// empty text and are not cached.
    fn resolve_text(&mut self, id: &str) -> String {
        if let Some(text) = self.text_cache.get(id) {
            return text.clone();
        }
        match self.texts.text(id) {
            Ok(text) => {
                if self.text_cache.len() < MAX_CACHED_TEXTS {
                    self.text_cache.insert(id.to_string(), text.clone());
                }
                text
            }
            Err(e) => {
                warn!(worker = %self.name, class = %id, error = %e, "cannot get class text");
                String::new()
            }
        }
    }
}
