//! Structured result aggregation
//!
//! Result logs carry one JSON payload per `[INFO]` line, each describing an
//! operation with a list of per-shape measurements. Records merge into a
//! single document keyed by (operation name, data type, shape signature);
//! for a repeated key the merge is a field-wise union where the
//! most-recently-merged value wins per field and a field present in only one
//! source is carried through unchanged. The merge is associative and
//! idempotent, so collection passes can arrive in any grouping.
//!
//! Fields that are expected but missing after all passes render as the
//! explicit `"N/A"` sentinel rather than being omitted.

use crate::errors::{Result, RunError};
use indexmap::IndexMap;
use serde_json::Value;
use std::path::Path;
use tracing::debug;

/// Sentinel rendered for expected-but-missing fields
pub const NOT_AVAILABLE: &str = "N/A";

/// Identity of one aggregated entry
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResultKey {
    pub op_name: String,
    pub dtype: String,
    pub shape_detail: String,
}

impl ResultKey {
    /// Stable label used as the document key
    pub fn label(&self) -> String {
        format!("{}_{}_{}", self.op_name, self.dtype, self.shape_detail)
    }
}

/// Fields of one aggregated entry, insertion-ordered
pub type ResultEntry = IndexMap<String, Value>;

/// Merged result document, keyed by entry label
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergedResults {
    entries: IndexMap<String, ResultEntry>,
}

impl MergedResults {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &ResultKey) -> Option<&ResultEntry> {
        self.entries.get(&key.label())
    }

    /// Merge one entry under its key: last write wins per field, untouched
    /// fields are carried through.
    pub fn merge_entry(&mut self, key: &ResultKey, fields: ResultEntry) {
        let entry = self.entries.entry(key.label()).or_insert_with(|| {
            let mut base = ResultEntry::new();
            base.insert("op_name".to_string(), Value::String(key.op_name.clone()));
            base.insert("dtype".to_string(), Value::String(key.dtype.clone()));
            base.insert(
                "shape_detail".to_string(),
                Value::String(key.shape_detail.clone()),
            );
            base
        });
        for (field, value) in fields {
            entry.insert(field, value);
        }
    }

    /// Merge a whole document into this one
    pub fn merge(&mut self, other: MergedResults) {
        for (label, fields) in other.entries {
            let entry = self.entries.entry(label).or_default();
            for (field, value) in fields {
                entry.insert(field, value);
            }
        }
    }

    /// Ingest a structured result log: every `[INFO] {json}` line contributes
    /// one entry per shape in its `result` list. Unparseable payloads are an
    /// error; non-`[INFO]` lines are ignored.
    pub fn ingest_log(&mut self, content: &str) -> Result<usize> {
        let mut ingested = 0;
        for line in content.lines() {
            let Some(payload) = line.strip_prefix("[INFO]") else {
                continue;
            };
            let data: Value =
                serde_json::from_str(payload.trim()).map_err(|e| RunError::ResultParse {
                    message: format!("bad result line {:?}: {}", line, e),
                })?;
            let op_name = string_field(&data, "op_name")?;
            let dtype = string_field(&data, "dtype")?;
            let results = data
                .get("result")
                .and_then(Value::as_array)
                .ok_or_else(|| RunError::ResultParse {
                    message: format!("result list missing in {:?}", line),
                })?;
            for result in results {
                let shape_detail = string_field(result, "shape_detail")?;
                let key = ResultKey {
                    op_name: op_name.clone(),
                    dtype: dtype.clone(),
                    shape_detail,
                };
                let mut fields = ResultEntry::new();
                if let Some(object) = result.as_object() {
                    for (field, value) in object {
                        if field != "shape_detail" {
                            fields.insert(field.clone(), value.clone());
                        }
                    }
                }
                self.merge_entry(&key, fields);
                ingested += 1;
            }
        }
        Ok(ingested)
    }

    /// Ingest every result log found under the given host directories
    pub fn ingest_host_logs(&mut self, host_dirs: &[std::path::PathBuf]) -> Result<usize> {
        let mut ingested = 0;
        for dir in host_dirs {
            let path = dir.join(crate::layout::RESULT_LOG);
            if !path.exists() {
                debug!(path = %path.display(), "no result log, skipping");
                continue;
            }
            let content = std::fs::read_to_string(&path).map_err(RunError::Io)?;
            ingested += self.ingest_log(&content)?;
        }
        Ok(ingested)
    }

    /// Render the final document, filling expected-but-missing fields with
    /// the `"N/A"` sentinel so no record is silently dropped.
    pub fn to_document(&self, expected_fields: &[&str]) -> Value {
        let mut doc = serde_json::Map::new();
        for (label, entry) in &self.entries {
            let mut rendered = serde_json::Map::new();
            for (field, value) in entry {
                rendered.insert(field.clone(), value.clone());
            }
            for field in expected_fields {
                rendered
                    .entry(field.to_string())
                    .or_insert_with(|| Value::String(NOT_AVAILABLE.to_string()));
            }
            doc.insert(label.clone(), Value::Object(rendered));
        }
        Value::Object(doc)
    }

    /// Write the final document as pretty JSON
    pub fn save(&self, path: &Path, expected_fields: &[&str]) -> Result<()> {
        let doc = self.to_document(expected_fields);
        let rendered = serde_json::to_string_pretty(&doc).map_err(RunError::Json)?;
        std::fs::write(path, rendered).map_err(RunError::Io)?;
        Ok(())
    }
}

fn string_field(value: &Value, field: &str) -> Result<String> {
    value
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            RunError::ResultParse {
                message: format!("missing string field {:?}", field),
            }
            .into()
        })
}
