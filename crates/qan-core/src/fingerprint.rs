//! Query fingerprinting for profiler documents.
//!
//! Maps a raw profile document onto a stable class key of the form
//! `OPERATION [collection] [field,field,...]`. Only field *names* take part;
//! values, operators (`$`-prefixed keys) and keys matching one of the
//! configured exclusion patterns are dropped.
//!
//! | document                                              | fingerprint       |
//! |-------------------------------------------------------|-------------------|
//! | `{op: remove, ns: db.col, query: {a: 1}}`             | `REMOVE col a`    |
//! | `{op: insert, ns: db.col, query: {...}}`              | `INSERT col`      |
//! | `{op: command, command: {geoNear: "places", ...}}`    | `GEONEAR places`  |

use std::fmt;

use regex::Regex;
use serde_json::{Map, Value};

use crate::worker::profile::ProfileDoc;

/// Recursion limit when collecting field names.
pub const MAX_DEPTH_LEVEL: usize = 10;

/// Exclusion patterns used when none are configured.
pub const DEFAULT_KEY_FILTERS: &[&str] = &["^shardVersion$"];

type Document = Map<String, Value>;

/// Error type for fingerprinting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FingerprintError {
    /// The query-bearing field is missing its expected shape.
    /// `raw` is the JSON of the offending value when it could be encoded.
    QueryField { raw: Option<String> },
    /// A key filter is not a valid regular expression.
    InvalidFilter { pattern: String, message: String },
}

impl fmt::Display for FingerprintError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FingerprintError::QueryField { raw: Some(raw) } => {
                write!(f, "cannot get query field from the profile document for query {}", raw)
            }
            FingerprintError::QueryField { raw: None } => {
                write!(f, "cannot get query field from the profile document")
            }
            FingerprintError::InvalidFilter { pattern, message } => {
                write!(f, "invalid key filter '{}': {}", pattern, message)
            }
        }
    }
}

impl std::error::Error for FingerprintError {}

/// Canonicalizes profile documents into class keys.
#[derive(Debug, Clone)]
pub struct Fingerprinter {
    key_filters: Vec<Regex>,
}

impl Default for Fingerprinter {
    fn default() -> Self {
        Self::new(DEFAULT_KEY_FILTERS).unwrap_or_else(|_| Self {
            key_filters: Vec::new(),
        })
    }
}

impl Fingerprinter {
    /// Builds a fingerprinter skipping keys that match any of `patterns`.
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self, FingerprintError> {
        let key_filters = patterns
            .iter()
            .map(|p| {
                Regex::new(p.as_ref()).map_err(|e| FingerprintError::InvalidFilter {
                    pattern: p.as_ref().to_string(),
                    message: e.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { key_filters })
    }

    pub fn fingerprint(&self, doc: &ProfileDoc) -> Result<String, FingerprintError> {
        let real_query = query_field(doc)?;
        let mut keys = Vec::new();
        if let Some(q) = real_query {
            self.collect_doc_keys(q, 0, &mut keys);
        }

        let query = query_document(doc)?;

        if let Some(Value::Object(sort)) = query.and_then(|q| q.get("sort")) {
            keys.extend(
                sort.keys()
                    .filter(|k| !self.is_filtered(k) && !k.starts_with('$'))
                    .cloned(),
            );
        }

        let mut op = String::new();
        let mut collection = String::new();
        match doc.op.as_str() {
            "remove" | "update" => {
                op = doc.op.clone();
                collection = ns_collection(&doc.ns).to_string();
            }
            "insert" => {
                op = doc.op.clone();
                collection = ns_collection(&doc.ns).to_string();
                keys.clear();
            }
            "query" => {
                op = "find".to_string();
                collection = ns_collection(&doc.ns).to_string();
            }
            _ => {
                if let Some(query) = query
                    && let Some((name, value)) = query.iter().next()
                {
                    op = name.clone();
                    collection = value.as_str().unwrap_or_default().to_string();
                    self.command_overrides(query, &mut keys, &mut collection);
                }
            }
        }

        keys.sort();
        keys.dedup();

        let op = op.to_uppercase();
        let keys = keys.join(",");
        let parts: Vec<&str> = [op.as_str(), collection.as_str(), keys.as_str()]
            .into_iter()
            .filter(|p| !p.is_empty())
            .collect();
        Ok(parts.join(" "))
    }

    /// Command-specific key extraction. `query` is the command document,
    /// whose first key names the command.
    fn command_overrides(&self, query: &Document, keys: &mut Vec<String>, collection: &mut String) {
        let Some(command) = query.keys().next() else {
            return;
        };
        match command.as_str() {
            "group" => {
                keys.clear();
                if let Some(Value::Object(group)) = query.get("group") {
                    for field in ["key", "cond"] {
                        if let Some(Value::Object(doc)) = group.get(field) {
                            self.collect_doc_keys(doc, 0, keys);
                        }
                    }
                    if let Some(Value::String(ns)) = group.get("ns") {
                        *collection = ns.clone();
                    }
                }
            }
            "distinct" => {
                keys.clear();
                if let Some(Value::String(key)) = query.get("key")
                    && !self.is_filtered(key)
                {
                    keys.push(key.clone());
                }
            }
            "aggregate" => {
                keys.clear();
                if let Some(pipeline) = query.get("pipeline") {
                    self.collect_keys(pipeline, 0, keys);
                }
            }
            "geoNear" => keys.clear(),
            _ => {}
        }
    }

    /// Collects field names of `value` down to [`MAX_DEPTH_LEVEL`].
    ///
    /// Operator keys are not emitted but their values are still walked.
    /// Array items that are documents are walked at the array's level.
    fn collect_keys(&self, value: &Value, level: usize, out: &mut Vec<String>) {
        match value {
            Value::Object(doc) => self.collect_doc_keys(doc, level, out),
            Value::Array(items) => {
                for item in items.iter().filter(|i| i.is_object()) {
                    self.collect_keys(item, level, out);
                }
            }
            _ => {}
        }
    }

    fn collect_doc_keys(&self, doc: &Document, level: usize, out: &mut Vec<String>) {
        if level > MAX_DEPTH_LEVEL {
            return;
        }
        for (key, v) in doc {
            if self.is_filtered(key) {
                continue;
            }
            if !key.starts_with('$') {
                out.push(key.clone());
            }
            self.collect_keys(v, level + 1, out);
        }
    }

    fn is_filtered(&self, key: &str) -> bool {
        self.key_filters.iter().any(|re| re.is_match(key))
    }
}

/// Document carrying the operation: `command` when present and non-empty
/// (OP_COMMAND / OP_MSG profiles), `query` otherwise.
fn query_document(doc: &ProfileDoc) -> Result<Option<&Document>, FingerprintError> {
    if let Some(command) = doc.command.as_ref().map(as_document).transpose()?.flatten()
        && !command.is_empty()
    {
        return Ok(Some(command));
    }
    Ok(doc.query.as_ref().map(as_document).transpose()?.flatten())
}

/// Extracts the filter part of the operation document.
fn query_field(doc: &ProfileDoc) -> Result<Option<&Document>, FingerprintError> {
    let Some(query) = query_document(doc)? else {
        return Ok(None);
    };

    let from_command = doc
        .command
        .as_ref()
        .and_then(Value::as_object)
        .is_some_and(|m| !m.is_empty());
    if from_command
        && matches!(doc.op.as_str(), "update" | "remove")
        && let Some(q) = query.get("q")
    {
        return require_document(q).map(Some);
    }

    // 3.0 profiles may nest the filter under "query".
    if let Some(q) = query.get("query") {
        return require_document(q).map(Some);
    }
    // 3.2+ find commands keep it under "filter".
    if let Some(q) = query.get("filter") {
        return require_document(q).map(Some);
    }
    if query.len() == 1 && query.contains_key("find") {
        return Ok(None);
    }
    Ok(Some(query))
}

/// `null` is treated as absent; any other non-document is an error.
fn as_document(value: &Value) -> Result<Option<&Document>, FingerprintError> {
    match value {
        Value::Null => Ok(None),
        Value::Object(map) => Ok(Some(map)),
        other => Err(FingerprintError::QueryField {
            raw: serde_json::to_string(other).ok(),
        }),
    }
}

fn require_document(value: &Value) -> Result<&Document, FingerprintError> {
    value.as_object().ok_or_else(|| FingerprintError::QueryField {
        raw: serde_json::to_string(value).ok(),
    })
}

/// Collection part of a `db.collection` namespace. Empty unless the
/// namespace has exactly two segments.
fn ns_collection(ns: &str) -> &str {
    let mut parts = ns.split('.');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(_), Some(collection), None) => collection,
        _ => "",
    }
}
