//! Replay of recorded snapshots.
//!
//! A replay directory holds one `iterNN.json` file per snapshot (a JSON
//! array of rows), consumed in file-name order, and an optional
//! `texts.json` object mapping class ids to their text.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::Path;
use std::thread;

use crossbeam_channel::Sender;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::worker::{DoneSender, RowSource, SourceError, TextSource};

pub const TEXTS_FILE: &str = "texts.json";

/// Serves one recorded snapshot per capture.
pub struct ReplaySource<R> {
    snapshots: VecDeque<Vec<R>>,
}

impl<R> ReplaySource<R> {
    pub fn new(snapshots: Vec<Vec<R>>) -> Self {
        Self {
            snapshots: snapshots.into(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.snapshots.len()
    }
}

impl<R: DeserializeOwned> ReplaySource<R> {
    /// Loads every `iter*.json` file of `dir`.
    pub fn from_dir(dir: &Path) -> Result<Self, SourceError> {
        let entries = fs::read_dir(dir)
            .map_err(|e| SourceError::Unavailable(format!("{}: {}", dir.display(), e)))?;

        let mut files: Vec<_> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with("iter") && n.ends_with(".json"))
            })
            .collect();
        files.sort();

        let snapshots = files
            .iter()
            .map(|path| {
                let data = fs::read_to_string(path)
                    .map_err(|e| SourceError::Unavailable(format!("{}: {}", path.display(), e)))?;
                serde_json::from_str::<Vec<R>>(&data)
                    .map_err(|e| SourceError::Unavailable(format!("{}: {}", path.display(), e)))
            })
            .collect::<Result<Vec<_>, _>>()?;

        debug!(dir = %dir.display(), snapshots = snapshots.len(), "replay loaded");
        Ok(Self::new(snapshots))
    }
}

impl<R: Send + 'static> RowSource<R> for ReplaySource<R> {
    fn start(
        &mut self,
        rows: Sender<R>,
        _last_fetch_secs: f64,
        done: DoneSender,
    ) -> Result<(), SourceError> {
        let snapshot = self.snapshots.pop_front().ok_or(SourceError::Exhausted)?;
        thread::spawn(move || {
            for row in snapshot {
                if rows.send(row).is_err() {
                    let _ = done.send(Err(SourceError::Disconnected));
                    return;
                }
            }
            drop(rows);
            let _ = done.send(Ok(()));
        });
        Ok(())
    }
}

/// Fixed id → text table.
#[derive(Debug, Clone, Default)]
pub struct StaticTexts {
    texts: HashMap<String, String>,
}

impl StaticTexts {
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            texts: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Loads `texts.json` of a replay directory; empty when the file is absent.
    pub fn from_dir(dir: &Path) -> Result<Self, SourceError> {
        let path = dir.join(TEXTS_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = fs::read_to_string(&path)
            .map_err(|e| SourceError::Unavailable(format!("{}: {}", path.display(), e)))?;
        let texts = serde_json::from_str(&data)
            .map_err(|e| SourceError::Unavailable(format!("{}: {}", path.display(), e)))?;
        Ok(Self { texts })
    }

    pub fn len(&self) -> usize {
        self.texts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.texts.is_empty()
    }
}

impl TextSource for StaticTexts {
    fn text(&mut self, id: &str) -> Result<String, SourceError> {
        self.texts
            .get(id)
            .cloned()
            .ok_or_else(|| SourceError::NotFound(id.to_string()))
    }
}
