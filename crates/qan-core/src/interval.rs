//! Interval sequencing.
//!
//! Turns a stream of clock ticks into numbered, time-bounded [`Interval`]s.
//!
//! ```text
//!   Ticker ──tick──▶ IntervalIter (IntervalSequencer) ──Interval──▶ Analyzer
//!          bounded(1)                                 rendezvous
//! ```
//!
//! The sequencer never corrects anything: it numbers ticks in arrival order.
//! Deciding whether two intervals are adjacent is left to the worker, see
//! [`Interval::follows`].

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded, select};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

/// A numbered sampling window.
///
/// `start_time` is the previous interval's `stop_time`, or the Unix epoch
/// for the first interval a sequencer emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interval {
    pub number: u64,
    pub start_time: DateTime<Utc>,
    pub stop_time: DateTime<Utc>,
}

/// Why an interval is not the successor of another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceGap {
    /// Interval number did not advance by exactly one.
    Number { expected: u64, got: u64 },
    /// Interval time did not move forward.
    ClockBackward {
        prev: DateTime<Utc>,
        got: DateTime<Utc>,
    },
}

impl fmt::Display for SequenceGap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SequenceGap::Number { expected, got } => {
                write!(f, "expected interval {}, got {}", expected, got)
            }
            SequenceGap::ClockBackward { prev, got } => {
                write!(f, "interval time {} is not after {}", got, prev)
            }
        }
    }
}

impl Interval {
    /// Checks that `self` directly follows `prev`: number advanced by one,
    /// start strictly later and stop not earlier.
    pub fn follows(&self, prev: &Interval) -> Result<(), SequenceGap> {
        let expected = prev.number.wrapping_add(1);
        if self.number != expected {
            return Err(SequenceGap::Number {
                expected,
                got: self.number,
            });
        }
        if self.start_time <= prev.start_time {
            return Err(SequenceGap::ClockBackward {
                prev: prev.start_time,
                got: self.start_time,
            });
        }
        if self.stop_time < prev.stop_time {
            return Err(SequenceGap::ClockBackward {
                prev: prev.stop_time,
                got: self.stop_time,
            });
        }
        Ok(())
    }

    /// Length of the window. Zero for the first interval of a sequencer.
    pub fn duration(&self) -> Duration {
        (self.stop_time - self.start_time)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}

/// Numbers ticks into intervals.
#[derive(Debug)]
pub struct IntervalSequencer {
    last_stop_time: Option<DateTime<Utc>>,
    next_number: u64,
}

impl Default for IntervalSequencer {
    fn default() -> Self {
        Self::new()
    }
}

impl IntervalSequencer {
    pub fn new() -> Self {
        Self {
            last_stop_time: None,
            next_number: 1,
        }
    }

    /// Emits the interval ending at `tick`.
    pub fn next(&mut self, tick: DateTime<Utc>) -> Interval {
        let interval = Interval {
            number: self.next_number,
            start_time: self.last_stop_time.unwrap_or_default(),
            stop_time: tick,
        };
        self.last_stop_time = Some(tick);
        self.next_number += 1;
        interval
    }
}

/// Sequencer running on its own thread.
///
/// Every tick received produces exactly one interval. Intervals are handed
/// over through a rendezvous channel: the sequencer does not read the next
/// tick until the consumer has taken the previous interval.
pub struct IntervalIter {
    intervals: Receiver<Interval>,
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl IntervalIter {
    pub fn start(ticks: Receiver<DateTime<Utc>>) -> Self {
        let (interval_tx, intervals) = bounded(0);
        let (stop_tx, stop_rx) = bounded::<()>(0);

        let handle = thread::spawn(move || {
            let mut sequencer = IntervalSequencer::new();
            loop {
                let tick = select! {
                    recv(ticks) -> tick => match tick {
                        Ok(t) => t,
                        Err(_) => break,
                    },
                    recv(stop_rx) -> _ => break,
                };
                let interval = sequencer.next(tick);
                trace!(number = interval.number, "interval ready");
                select! {
                    send(interval_tx, interval) -> res => if res.is_err() { break },
                    recv(stop_rx) -> _ => break,
                }
            }
            debug!("interval iterator stopped");
        });

        Self {
            intervals,
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        }
    }

    /// Channel the intervals come out of.
    pub fn intervals(&self) -> &Receiver<Interval> {
        &self.intervals
    }

    /// Stops the sequencer thread. Idempotent.
    pub fn stop(&mut self) {
        // Dropping the sender wakes the thread's `recv(stop_rx)` arm.
        self.stop_tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for IntervalIter {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Wall-clock tick source aligned on multiples of the period.
///
/// A tick that cannot be delivered because the previous one is still
/// waiting in the buffer is dropped; the next interval then simply spans
/// more than one period.
pub struct Ticker {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Ticker {
    /// Granularity of the shutdown check while sleeping.
    const SLEEP_SLICE: Duration = Duration::from_millis(100);

    pub fn start(period: Duration) -> (Self, Receiver<DateTime<Utc>>) {
        let (tx, rx) = bounded(1);
        let running = Arc::new(AtomicBool::new(true));
        let r = running.clone();

        let handle = thread::spawn(move || {
            while r.load(Ordering::SeqCst) {
                let mut remaining = until_next_boundary(Utc::now(), period);
                while remaining > Duration::ZERO && r.load(Ordering::SeqCst) {
                    let sleep_time = remaining.min(Self::SLEEP_SLICE);
                    thread::sleep(sleep_time);
                    remaining = remaining.saturating_sub(sleep_time);
                }
                if !r.load(Ordering::SeqCst) {
                    break;
                }
                match tx.try_send(Utc::now()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(t)) => debug!(tick = %t, "tick dropped, consumer busy"),
                    Err(TrySendError::Disconnected(_)) => break,
                }
            }
        });

        (
            Self {
                running,
                handle: Some(handle),
            },
            rx,
        )
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Time left until the next multiple of `period` since the epoch.
pub fn until_next_boundary(now: DateTime<Utc>, period: Duration) -> Duration {
    let period_ms = period.as_millis() as i64;
    if period_ms <= 0 {
        return Duration::ZERO;
    }
    let now_ms = now.timestamp_millis();
    let next = (now_ms.div_euclid(period_ms) + 1) * period_ms;
    Duration::from_millis((next - now_ms) as u64)
}
