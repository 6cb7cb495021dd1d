/*
[INPUT]:  Targets, post-alignment positions, per-symbol error slots, file meta
[OUTPUT]: Timestamped feedback report consumed by the upstream strategy
[POS]:    I/O layer - alignment result publication
[UPDATE]: When the report schema or naming convention changes
*/

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::Local;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::Value;
use tokio::fs;
use tracing::info;

use crate::target_file::{TargetMeta, TargetPosition};

#[derive(Debug, Clone, Serialize)]
struct SymbolEntry {
    id: i64,
    symbol: String,
    current_quantity: String,
    change_quantity: String,
    error_message: String,
}

#[derive(Debug, Clone, Serialize)]
struct Summary {
    #[serde(rename = "isFinished")]
    is_finished: i64,
    error_total: usize,
    targetvalue: f64,
    longtarget: f64,
    shorttarget: f64,
    update_timestamp: f64,
}

/// Writes `feedback_<YYYYMMDD_HHMMSS>_<ms>_0.json` files under the results
/// directory, creating it on demand.
#[derive(Debug)]
pub struct FeedbackWriter {
    results_dir: PathBuf,
}

impl FeedbackWriter {
    pub fn new(results_dir: impl Into<PathBuf>) -> Self {
        Self {
            results_dir: results_dir.into(),
        }
    }

    pub fn results_dir(&self) -> &Path {
        &self.results_dir
    }

    /// Emit one report: a per-symbol entry per target followed by the
    /// summary object echoing the target-file metadata.
    pub async fn write(
        &self,
        targets: &[TargetPosition],
        current: &HashMap<String, Decimal>,
        errors: &HashMap<String, String>,
        meta: &TargetMeta,
    ) -> std::io::Result<PathBuf> {
        let mut report: Vec<Value> = Vec::with_capacity(targets.len() + 1);
        let mut error_total = 0usize;

        for target in targets {
            let current_quantity = current
                .get(&target.symbol)
                .copied()
                .unwrap_or(Decimal::ZERO);
            let change_quantity = target.quantity - current_quantity;
            let error_message = errors.get(&target.symbol).cloned().unwrap_or_default();
            if !error_message.is_empty() {
                error_total += 1;
            }

            let entry = SymbolEntry {
                id: target.id,
                symbol: target.symbol.clone(),
                current_quantity: current_quantity.to_string(),
                change_quantity: change_quantity.to_string(),
                error_message,
            };
            report.push(serde_json::to_value(entry).expect("entry serializes"));
        }

        let summary = Summary {
            is_finished: 1,
            error_total,
            targetvalue: meta.targetvalue,
            longtarget: meta.longtarget,
            shorttarget: meta.shorttarget,
            update_timestamp: meta.update_timestamp,
        };
        report.push(serde_json::to_value(summary).expect("summary serializes"));

        fs::create_dir_all(&self.results_dir).await?;

        let now = Local::now();
        let filename = format!(
            "feedback_{}_{}_0.json",
            now.format("%Y%m%d_%H%M%S"),
            now.timestamp_subsec_millis()
        );
        let path = self.results_dir.join(filename);

        let content = serde_json::to_string_pretty(&report).expect("report serializes");
        fs::write(&path, content).await?;

        info!(path = %path.display(), entries = targets.len(), "feedback report written");
        Ok(path)
    }
}
