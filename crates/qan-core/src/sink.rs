//! Report sinks.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crossbeam_channel::Sender;
use tracing::debug;

use crate::report::Report;

/// Error type for report delivery.
#[derive(Debug)]
pub enum SinkError {
    Io(io::Error),
    Encode(String),
    Closed,
}

impl fmt::Display for SinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SinkError::Io(e) => write!(f, "report write failed: {}", e),
            SinkError::Encode(msg) => write!(f, "report encoding failed: {}", msg),
            SinkError::Closed => write!(f, "report receiver closed"),
        }
    }
}

impl std::error::Error for SinkError {}

impl From<io::Error> for SinkError {
    fn from(e: io::Error) -> Self {
        SinkError::Io(e)
    }
}

/// Receives the reports of an analyzer.
pub trait ReportSink: Send {
    fn write(&mut self, report: &Report) -> Result<(), SinkError>;
}

/// Forwards reports over a channel.
impl ReportSink for Sender<Report> {
    fn write(&mut self, report: &Report) -> Result<(), SinkError> {
        self.send(report.clone()).map_err(|_| SinkError::Closed)
    }
}

/// Writes one pretty-printed JSON file per report:
/// `<instance>-<interval number>-<stop unix>.json`.
pub struct JsonDirSink {
    dir: PathBuf,
    instance: String,
}

impl JsonDirSink {
    /// Creates `dir` if needed.
    pub fn new(dir: impl Into<PathBuf>, instance: impl Into<String>) -> Result<Self, SinkError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            instance: instance.into(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn file_name(&self, report: &Report) -> String {
        format!(
            "{}-{}-{}.json",
            self.instance,
            report.interval.number,
            report.interval.stop_time.timestamp()
        )
    }
}

impl ReportSink for JsonDirSink {
    fn write(&mut self, report: &Report) -> Result<(), SinkError> {
        let data = report
            .to_json()
            .map_err(|e| SinkError::Encode(e.to_string()))?;
        let path = self.dir.join(self.file_name(report));
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, data)?;
        fs::rename(&tmp_path, &path)?;
        debug!(path = %path.display(), classes = report.classes.len(), "report written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interval::Interval;
    use crate::report::Class;
    use chrono::{TimeZone, Utc};
    use crossbeam_channel::bounded;

    fn report() -> Report {
        Report {
            interval: Interval {
                number: 12,
                start_time: Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(),
                stop_time: Utc.with_ymd_and_hms(2024, 6, 1, 12, 1, 0).unwrap(),
            },
            global: Class::default(),
            classes: vec![Class::new("abc", "select ?")],
        }
    }

    #[test]
    fn json_dir_sink_writes_one_file_per_report() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("reports");
        let mut sink = JsonDirSink::new(&out, "db1").unwrap();
        assert!(out.is_dir());

        sink.write(&report()).unwrap();

        let path = out.join("db1-12-1717243260.json");
        let back = Report::from_json(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(back, report());

        let names: Vec<_> = fs::read_dir(&out)
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names.len(), 1);
    }

    #[test]
    fn channel_sink_forwards_until_closed() {
        let (tx, rx) = bounded(1);
        let mut sink: Sender<Report> = tx;
        sink.write(&report()).unwrap();
        assert_eq!(rx.recv().unwrap().interval.number, 12);

        drop(rx);
        assert!(matches!(sink.write(&report()), Err(SinkError::Closed)));
    }
}
