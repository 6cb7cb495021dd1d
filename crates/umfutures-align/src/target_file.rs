/*
[INPUT]:  The target position file written by the upstream strategy
[OUTPUT]: Parsed targets + metadata, state writes with atomic publish
[POS]:    I/O layer - the file-based signal path into the engine
[UPDATE]: When the file schema or the finished-state contract changes
*/

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use rust_decimal::Decimal;
use serde_json::Value;
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::warn;

/// One position element of the target file.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetPosition {
    pub id: i64,
    pub symbol: String,
    pub quantity: Decimal,
}

/// The metadata element. Numeric fields are echoed back into feedback
/// reports verbatim, so they stay as plain f64.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TargetMeta {
    pub is_finished: Option<i64>,
    pub booksize: f64,
    pub targetvalue: f64,
    pub longtarget: f64,
    pub shorttarget: f64,
    pub update_timestamp: f64,
    pub error_string: String,
}

/// Alignment state encoded in the `isFinished` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishedState {
    /// 0 - the planner must run
    Pending,
    /// 1 - aligned, skip
    Done,
    /// 2 - errored, human intervention expected
    Error,
    /// Missing or unrecognised value
    Unknown,
}

impl FinishedState {
    fn from_value(value: Option<i64>) -> Self {
        match value {
            Some(0) => FinishedState::Pending,
            Some(1) => FinishedState::Done,
            Some(2) => FinishedState::Error,
            _ => FinishedState::Unknown,
        }
    }
}

/// Parsed view over one read of the file.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetSnapshot {
    pub targets: Vec<TargetPosition>,
    pub meta: TargetMeta,
}

impl TargetSnapshot {
    pub fn state(&self) -> FinishedState {
        FinishedState::from_value(self.meta.is_finished)
    }

    pub fn symbols(&self) -> Vec<&str> {
        self.targets.iter().map(|t| t.symbol.as_str()).collect()
    }
}

#[derive(Error, Debug)]
pub enum TargetFileError {
    #[error("io error on target file: {0}")]
    Io(#[from] std::io::Error),

    #[error("target file is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("target file is not a JSON array")]
    NotAnArray,

    #[error("no element carries isFinished")]
    MissingFinishedField,
}

/// Two-pass scan over the heterogeneous array: position elements are the
/// objects carrying all of id/symbol/quantity, the metadata element is the
/// first object carrying isFinished. Malformed elements are skipped, not
/// fatal.
pub fn parse_snapshot(value: &Value) -> Result<TargetSnapshot, TargetFileError> {
    let items = value.as_array().ok_or(TargetFileError::NotAnArray)?;

    let mut targets = Vec::new();
    for item in items {
        let (Some(id), Some(symbol), Some(quantity)) =
            (item.get("id"), item.get("symbol"), item.get("quantity"))
        else {
            continue;
        };

        let Some(id) = id.as_i64() else {
            warn!(raw = %item, "target element with non-integer id skipped");
            continue;
        };
        let Some(symbol) = symbol.as_str() else {
            warn!(raw = %item, "target element with non-string symbol skipped");
            continue;
        };
        let Some(quantity) = parse_quantity(quantity) else {
            warn!(%symbol, raw = %quantity, "target element with bad quantity skipped");
            continue;
        };

        targets.push(TargetPosition {
            id,
            symbol: symbol.to_string(),
            quantity,
        });
    }

    let mut meta = TargetMeta::default();
    for item in items {
        let Some(object) = item.as_object() else {
            continue;
        };
        if let Some(finished) = object.get("isFinished") {
            // First occurrence wins
            meta.is_finished = finished.as_i64();
            meta.booksize = number_or_zero(object.get("booksize"));
            meta.targetvalue = number_or_zero(object.get("targetvalue"));
            meta.longtarget = number_or_zero(object.get("longtarget"));
            meta.shorttarget = number_or_zero(object.get("shorttarget"));
            meta.update_timestamp = number_or_zero(object.get("update_timestamp"));
            meta.error_string = object
                .get("errorstring")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            break;
        }
    }

    Ok(TargetSnapshot { targets, meta })
}

fn parse_quantity(value: &Value) -> Option<Decimal> {
    match value {
        Value::String(s) => Decimal::from_str(s.trim()).ok(),
        Value::Number(n) => Decimal::from_str(&n.to_string()).ok(),
        _ => None,
    }
}

fn number_or_zero(value: Option<&Value>) -> f64 {
    value.and_then(Value::as_f64).unwrap_or(0.0)
}

/// The target file with a process-wide lock around every read and write so
/// the gateway never interleaves with itself; an external writer following
/// the same rename discipline composes safely, and transient parse errors
/// from one that does not simply retry on the next poll.
#[derive(Debug)]
pub struct TargetStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl TargetStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read and parse the file.
    pub async fn read(&self) -> Result<TargetSnapshot, TargetFileError> {
        let _guard = self.lock.lock().await;
        let content = fs::read_to_string(&self.path).await?;
        let value: Value = serde_json::from_str(&content)?;
        parse_snapshot(&value)
    }

    /// Update `isFinished` (and `update_timestamp`, plus `errorstring` when
    /// given) on the first element carrying the field, preserving every
    /// other field untouched, and publish with a temp-file rename.
    pub async fn write_finished(
        &self,
        status: i64,
        error_string: Option<&str>,
    ) -> Result<(), TargetFileError> {
        let _guard = self.lock.lock().await;
        let content = fs::read_to_string(&self.path).await?;
        let mut value: Value = serde_json::from_str(&content)?;

        let items = value.as_array_mut().ok_or(TargetFileError::NotAnArray)?;
        let mut updated = false;
        for item in items.iter_mut() {
            let Some(object) = item.as_object_mut() else {
                continue;
            };
            if object.contains_key("isFinished") {
                object.insert("isFinished".to_string(), Value::from(status));
                object.insert("update_timestamp".to_string(), Value::from(epoch_secs()));
                if let Some(error_string) = error_string {
                    object.insert("errorstring".to_string(), Value::from(error_string));
                }
                updated = true;
                break;
            }
        }
        if !updated {
            return Err(TargetFileError::MissingFinishedField);
        }

        let serialized = serde_json::to_string_pretty(&value)?;
        // Atomic publish: write to temp file then rename
        let temp_path = self.path.with_extension("json.tmp");
        fs::write(&temp_path, serialized).await?;
        fs::rename(&temp_path, &self.path).await?;
        Ok(())
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample() -> Value {
        serde_json::json!([
            {"id": 1, "symbol": "BTCUSDT", "quantity": "2.5"},
            {"id": 2, "symbol": "ETHUSDT", "quantity": "-10"},
            {
                "booksize": 100000.0,
                "targetvalue": 52000.0,
                "longtarget": 26000.0,
                "shorttarget": 26000.0,
                "isFinished": 0,
                "errorstring": "",
                "update_timestamp": 1753958400.0,
                "custom_field": "keep me",
            },
        ])
    }

    #[test]
    fn two_pass_parse_extracts_targets_and_meta() {
        let snapshot = parse_snapshot(&sample()).unwrap();

        assert_eq!(snapshot.targets.len(), 2);
        assert_eq!(snapshot.targets[0].symbol, "BTCUSDT");
        assert_eq!(snapshot.targets[1].quantity, Decimal::from(-10));
        assert_eq!(snapshot.state(), FinishedState::Pending);
        assert_eq!(snapshot.meta.targetvalue, 52000.0);
    }

    #[test]
    fn empty_array_parses_to_unknown_state() {
        let snapshot = parse_snapshot(&serde_json::json!([])).unwrap();
        assert!(snapshot.targets.is_empty());
        assert_eq!(snapshot.state(), FinishedState::Unknown);
    }

    #[test]
    fn metadata_only_file_has_no_targets() {
        let snapshot = parse_snapshot(&serde_json::json!([
            {"isFinished": 1, "targetvalue": 5.0},
        ]))
        .unwrap();
        assert!(snapshot.targets.is_empty());
        assert_eq!(snapshot.state(), FinishedState::Done);
    }

    #[test]
    fn first_is_finished_occurrence_wins() {
        let snapshot = parse_snapshot(&serde_json::json!([
            {"isFinished": 0},
            {"isFinished": 1},
        ]))
        .unwrap();
        assert_eq!(snapshot.state(), FinishedState::Pending);
    }

    #[test]
    fn malformed_quantity_skips_only_that_element() {
        let snapshot = parse_snapshot(&serde_json::json!([
            {"id": 1, "symbol": "BTCUSDT", "quantity": "not-a-number"},
            {"id": 2, "symbol": "ETHUSDT", "quantity": "3"},
            {"isFinished": 0},
        ]))
        .unwrap();
        assert_eq!(snapshot.targets.len(), 1);
        assert_eq!(snapshot.targets[0].symbol, "ETHUSDT");
    }

    #[test]
    fn non_array_file_is_an_error() {
        let result = parse_snapshot(&serde_json::json!({"isFinished": 0}));
        assert!(matches!(result, Err(TargetFileError::NotAnArray)));
    }

    #[tokio::test]
    async fn write_finished_updates_in_place_and_preserves_unknown_fields() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pos_update.json");
        tokio::fs::write(&path, serde_json::to_string_pretty(&sample()).unwrap())
            .await
            .unwrap();

        let store = TargetStore::new(&path);
        store.write_finished(1, None).await.unwrap();

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        let value: Value = serde_json::from_str(&content).unwrap();
        let snapshot = parse_snapshot(&value).unwrap();

        assert_eq!(snapshot.state(), FinishedState::Done);
        assert!(snapshot.meta.update_timestamp > 0.0);
        // Unknown fields survive the round trip
        assert_eq!(value[2]["custom_field"], "keep me");
        // Position elements are untouched
        assert_eq!(snapshot.targets.len(), 2);
    }

    #[tokio::test]
    async fn write_finished_records_error_string() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pos_update.json");
        tokio::fs::write(&path, serde_json::to_string_pretty(&sample()).unwrap())
            .await
            .unwrap();

        let store = TargetStore::new(&path);
        store
            .write_finished(2, Some("rule table unavailable"))
            .await
            .unwrap();

        let snapshot = store.read().await.unwrap();
        assert_eq!(snapshot.state(), FinishedState::Error);
        assert_eq!(snapshot.meta.error_string, "rule table unavailable");
    }

    #[tokio::test]
    async fn write_finished_without_metadata_element_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pos_update.json");
        tokio::fs::write(&path, "[]").await.unwrap();

        let store = TargetStore::new(&path);
        let result = store.write_finished(1, None).await;
        assert!(matches!(result, Err(TargetFileError::MissingFinishedField)));
    }
}
