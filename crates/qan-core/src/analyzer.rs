//! Per-instance analyzer: drives a worker one interval at a time.
//!
//! ```text
//!  Ticker ──▶ IntervalIter ──Interval──▶ analyzer thread
//!                                          setup → run → cleanup
//!                                          Report ──▶ ReportSink
//! ```
//!
//! Intervals are processed strictly one after another. A failing interval
//! is logged and the analyzer moves on to the next one.

use std::collections::BTreeMap;
use std::io;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender, bounded, select};
use tracing::{debug, error, info};

use crate::interval::{Interval, IntervalIter, Ticker};
use crate::metrics::TimeStats;
use crate::sink::ReportSink;
use crate::worker::{RowKind, SourceError, Worker, WorkerError};

type SharedStatus = Arc<Mutex<BTreeMap<String, String>>>;

/// Result of processing one interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Report with this many classes was handed to the sink.
    Reported(usize),
    /// No adjacent previous snapshot yet.
    NoResult,
    /// Setup, capture or delivery failed; logged.
    Failed,
    /// Source has nothing left to capture.
    Exhausted,
}

pub struct Analyzer<K: RowKind> {
    name: String,
    worker: Worker<K>,
    sink: Box<dyn ReportSink>,
    status: SharedStatus,
}

impl<K: RowKind + 'static> Analyzer<K> {
    pub fn new(name: impl Into<String>, worker: Worker<K>, sink: impl ReportSink + 'static) -> Self {
        Self {
            name: name.into(),
            worker,
            sink: Box::new(sink),
            status: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    /// Runs `setup → run → cleanup` for one interval and delivers the report.
    pub fn process_interval(&mut self, interval: Interval) -> Outcome {
        self.update_status(|name, s| {
            s.insert(format!("{}-interval-start", name), interval.start_time.to_rfc3339());
            s.insert(format!("{}-interval-end", name), interval.stop_time.to_rfc3339());
        });

        let outcome = self.collect(interval);
        let worker_status = self.worker.status();
        self.update_status(|_, s| s.extend(worker_status));
        outcome
    }

    fn collect(&mut self, interval: Interval) -> Outcome {
        if let Err(e) = self.worker.setup(interval) {
            self.worker.cleanup();
            return match e {
                WorkerError::Setup(SourceError::Exhausted) => {
                    info!(analyzer = %self.name, interval = interval.number, "source exhausted");
                    Outcome::Exhausted
                }
                e => {
                    error!(analyzer = %self.name, interval = interval.number, error = %e,
                        "worker setup failed");
                    Outcome::Failed
                }
            };
        }

        let result = self.worker.run();
        self.worker.cleanup();

        match result {
            Ok(None) => {
                debug!(analyzer = %self.name, interval = interval.number, "no result for interval");
                Outcome::NoResult
            }
            Ok(Some(report)) => match self.sink.write(&report) {
                Ok(()) => {
                    let query_time = report.global.metrics.time_metrics.get("Query_time");
                    info!(
                        analyzer = %self.name,
                        interval = interval.number,
                        interval_secs = interval.duration().as_secs(),
                        classes = report.classes.len(),
                        queries = report.global.total_queries,
                        query_time_secs = query_time.map_or(0.0, TimeStats::sum_secs),
                        avg_query_time_secs = query_time.map_or(0.0, TimeStats::avg_secs),
                        "report ready"
                    );
                    Outcome::Reported(report.classes.len())
                }
                Err(e) => {
                    error!(analyzer = %self.name, interval = interval.number, error = %e,
                        "cannot deliver report");
                    Outcome::Failed
                }
            },
            Err(e) => {
                error!(analyzer = %self.name, interval = interval.number, error = %e,
                    "worker run failed");
                Outcome::Failed
            }
        }
    }

    fn update_status(&self, f: impl FnOnce(&str, &mut BTreeMap<String, String>)) {
        if let Ok(mut status) = self.status.lock() {
            f(&self.name, &mut status);
        }
    }

    fn set_state(&self, state: &str) {
        self.update_status(|name, s| {
            s.insert(name.to_string(), state.to_string());
        });
    }

    fn run(mut self, intervals: Receiver<Interval>, stop: Receiver<()>) {
        self.set_state("Running");
        info!(analyzer = %self.name, worker = %self.worker.name(), "analyzer started");
        loop {
            let interval = select! {
                recv(intervals) -> msg => match msg {
                    Ok(interval) => interval,
                    Err(_) => break,
                },
                recv(stop) -> _ => break,
            };
            if self.process_interval(interval) == Outcome::Exhausted {
                break;
            }
        }
        self.set_state("Stopped");
        info!(analyzer = %self.name, "analyzer stopped");
    }

    /// Runs on wall-clock intervals of `period`.
    pub fn spawn(self, period: Duration) -> io::Result<AnalyzerHandle> {
        let (ticker, ticks) = Ticker::start(period);
        let mut handle = self.spawn_with_ticks(ticks)?;
        handle.ticker = Some(ticker);
        Ok(handle)
    }

    /// Runs on externally supplied ticks. The analyzer ends when the tick
    /// channel closes or the source is exhausted.
    pub fn spawn_with_ticks(self, ticks: Receiver<DateTime<Utc>>) -> io::Result<AnalyzerHandle> {
        let iter = IntervalIter::start(ticks);
        let intervals = iter.intervals().clone();
        let (stop_tx, stop_rx) = bounded(0);
        let name = self.name.clone();
        let status = self.status.clone();

        let thread = thread::Builder::new()
            .name(format!("qan-{}", name))
            .spawn(move || self.run(intervals, stop_rx))?;

        Ok(AnalyzerHandle {
            name,
            stop_tx: Some(stop_tx),
            ticker: None,
            iter: Some(iter),
            thread: Some(thread),
            status,
        })
    }
}

/// Control of a running analyzer.
pub struct AnalyzerHandle {
    name: String,
    stop_tx: Option<Sender<()>>,
    ticker: Option<Ticker>,
    iter: Option<IntervalIter>,
    thread: Option<JoinHandle<()>>,
    status: SharedStatus,
}

impl AnalyzerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Flattened status map. Never blocks on the interval in progress.
    pub fn status(&self) -> BTreeMap<String, String> {
        self.status.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().is_none_or(|t| t.is_finished())
    }

    /// Waits until the analyzer ends by itself, then releases the tick side.
    pub fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        self.stop();
    }

    /// Stops the analyzer after the interval in progress. Idempotent.
    pub fn stop(&mut self) {
        // Dropping the sender wakes the thread's `recv(stop)` arm.
        self.stop_tx.take();
        if let Some(mut ticker) = self.ticker.take() {
            ticker.stop();
        }
        if let Some(mut iter) = self.iter.take() {
            iter.stop();
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
            debug!(analyzer = %self.name, "analyzer thread joined");
        }
    }
}

impl Drop for AnalyzerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::Report;
    use crate::source::replay::{ReplaySource, StaticTexts};
    use crate::worker::{DigestRow, DigestRows};
    use chrono::{Duration as ChronoDuration, TimeZone};

    fn row(count: u64) -> DigestRow {
        DigestRow {
            schema: "db".to_string(),
            digest: "d1".to_string(),
            count_star: count,
            sum_timer_wait: count * 1_000_000,
            min_timer_wait: 1_000_000,
            max_timer_wait: 1_000_000,
            ..Default::default()
        }
    }

    fn analyzer(snapshots: usize) -> (Analyzer<DigestRows>, Receiver<Report>) {
        let iters = (1..=snapshots as u64).map(|n| vec![row(n * 2)]).collect();
        let worker = Worker::new(
            "qan-worker",
            DigestRows,
            ReplaySource::new(iters),
            StaticTexts::from_pairs([("d1", "select ?")]),
        );
        let (tx, rx) = bounded(16);
        (Analyzer::new("qan-analyzer", worker, tx), rx)
    }

    fn tick(n: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2015, 1, 1, 0, 0, 0).unwrap() + ChronoDuration::minutes(n)
    }

    #[test]
    fn processes_intervals_in_order() {
        let (mut a, reports) = analyzer(2);
        let first = Interval {
            number: 1,
            start_time: DateTime::<Utc>::default(),
            stop_time: tick(1),
        };
        let second = Interval {
            number: 2,
            start_time: tick(1),
            stop_time: tick(2),
        };
        let third = Interval {
            number: 3,
            start_time: tick(2),
            stop_time: tick(3),
        };

        assert_eq!(a.process_interval(first), Outcome::NoResult);
        assert_eq!(a.process_interval(second), Outcome::Reported(1));
        assert_eq!(a.process_interval(third), Outcome::Exhausted);

        let report = reports.try_recv().unwrap();
        assert_eq!(report.interval, second);
        assert_eq!(report.classes[0].fingerprint, "select ?");
        assert_eq!(report.classes[0].total_queries, 2);
        assert!(reports.try_recv().is_err());

        let status = a.status.lock().unwrap().clone();
        assert_eq!(status["qan-analyzer-interval-end"], tick(3).to_rfc3339());
        assert!(status["qan-worker-last"].starts_with("rows: 1,"));
    }

    #[test]
    fn sink_failure_is_reported_as_failed() {
        let (mut a, reports) = analyzer(2);
        drop(reports);
        a.process_interval(Interval {
            number: 1,
            start_time: DateTime::<Utc>::default(),
            stop_time: tick(1),
        });
        let outcome = a.process_interval(Interval {
            number: 2,
            start_time: tick(1),
            stop_time: tick(2),
        });
        assert_eq!(outcome, Outcome::Failed);
    }

    #[test]
    fn driven_by_ticks_until_source_exhausted() {
        let (a, reports) = analyzer(3);
        let (tick_tx, ticks) = bounded(1);
        let handle = a.spawn_with_ticks(ticks).unwrap();

        for n in 1..=4 {
            tick_tx.send(tick(n)).unwrap();
        }

        let numbers: Vec<u64> = (0..2)
            .map(|_| {
                reports
                    .recv_timeout(Duration::from_secs(5))
                    .unwrap()
                    .interval
                    .number
            })
            .collect();
        assert_eq!(numbers, vec![2, 3]);

        // Fourth interval finds the replay exhausted and ends the analyzer.
        let status_handle = handle.status.clone();
        handle.join();
        let status = status_handle.lock().unwrap().clone();
        assert_eq!(status["qan-analyzer"], "Stopped");
        assert_eq!(status["qan-analyzer-interval-end"], tick(4).to_rfc3339());
    }

    #[test]
    fn stop_is_idempotent_and_reports_stopped() {
        let (a, _reports) = analyzer(10);
        let (tick_tx, ticks) = bounded(1);
        let mut handle = a.spawn_with_ticks(ticks).unwrap();
        tick_tx.send(tick(1)).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !handle.status().contains_key("qan-worker-last")
            && std::time::Instant::now() < deadline
        {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(handle.status()["qan-analyzer"], "Running");

        handle.stop();
        handle.stop();
        assert!(handle.is_finished());
        assert_eq!(handle.status()["qan-analyzer"], "Stopped");
    }

    #[test]
    fn wall_clock_ticks_produce_reports() {
        let (a, reports) = analyzer(10);
        let mut handle = a.spawn(Duration::from_millis(50)).unwrap();
        let report = reports.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(report.interval.number, 2);
        assert!(report.interval.duration() > Duration::ZERO);
        handle.stop();
    }
}
