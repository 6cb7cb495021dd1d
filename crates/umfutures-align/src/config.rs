/*
[INPUT]:  YAML configuration file
[OUTPUT]: Parsed gateway configuration with defaults for every knob
[POS]:    Configuration layer - engine setup
[UPDATE]: When adding new configuration options
*/

use std::path::PathBuf;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Top-level configuration for the alignment gateway.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewayConfig {
    /// Target position file written by the upstream strategy
    #[serde(default = "defaults::target_file")]
    pub target_file: PathBuf,
    /// Directory for feedback reports
    #[serde(default = "defaults::results_dir")]
    pub results_dir: PathBuf,
    /// Cached exchange-info blob used to load trading rules
    #[serde(default)]
    pub exchange_info_file: Option<PathBuf>,
    /// Target-file poll interval in milliseconds
    #[serde(default = "defaults::file_poll_interval_ms")]
    pub file_poll_interval_ms: u64,
    /// Periodic account snapshot cadence in seconds
    #[serde(default = "defaults::account_refresh_secs")]
    pub account_refresh_secs: u64,
    /// How long an alignment cycle waits for a snapshot
    #[serde(default = "defaults::snapshot_timeout_secs")]
    pub snapshot_timeout_secs: u64,
    /// How long an alignment cycle waits for order completion
    #[serde(default = "defaults::completion_timeout_secs")]
    pub completion_timeout_secs: u64,
    /// Absolute tolerance floor for position comparisons
    #[serde(default = "defaults::tolerance_threshold")]
    pub tolerance_threshold: Decimal,
    /// Relative tolerance as a fraction of the target quantity
    #[serde(default = "defaults::relative_tolerance")]
    pub relative_tolerance: Decimal,
    /// Adjustments above this size go through the TWAP executor
    #[serde(default = "defaults::twap_min_slice_size")]
    pub twap_min_slice_size: Decimal,
    /// Delay between TWAP slices in milliseconds
    #[serde(default = "defaults::twap_interval_ms")]
    pub twap_interval_ms: u64,
    /// Per-slice fallback timer forcing progress without a fill callback
    #[serde(default = "defaults::twap_slice_timeout_secs")]
    pub twap_slice_timeout_secs: u64,
    /// Watchdog that force-completes a stuck final slice
    #[serde(default = "defaults::twap_final_watchdog_secs")]
    pub twap_final_watchdog_secs: u64,
    /// Order lifecycle supervision
    #[serde(default)]
    pub orders: OrderConfig,
}

/// Order state machine supervision knobs.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OrderConfig {
    /// PendingSubmit orders older than this expire
    #[serde(default = "defaults::submit_timeout_ms")]
    pub submit_timeout_ms: u64,
    /// PendingCancel orders older than this error out
    #[serde(default = "defaults::cancel_timeout_ms")]
    pub cancel_timeout_ms: u64,
    /// Janitor sweep cadence
    #[serde(default = "defaults::cleanup_interval_ms")]
    pub cleanup_interval_ms: u64,
    /// Terminal records are retained this long for duplicate suppression
    #[serde(default = "defaults::retention_hours")]
    pub retention_hours: u64,
    /// Recent-fill suppression window
    #[serde(default = "defaults::recent_fill_window_secs")]
    pub recent_fill_window_secs: u64,
    /// Tolerance used when matching duplicate orders
    #[serde(default = "defaults::duplicate_tolerance")]
    pub duplicate_tolerance: Decimal,
}

impl Default for OrderConfig {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("empty order config deserializes")
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("empty gateway config deserializes")
    }
}

impl GatewayConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn file_poll_interval(&self) -> Duration {
        Duration::from_millis(self.file_poll_interval_ms)
    }

    pub fn account_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.account_refresh_secs)
    }

    pub fn snapshot_timeout(&self) -> Duration {
        Duration::from_secs(self.snapshot_timeout_secs)
    }

    pub fn completion_timeout(&self) -> Duration {
        Duration::from_secs(self.completion_timeout_secs)
    }

    pub fn twap_interval(&self) -> Duration {
        Duration::from_millis(self.twap_interval_ms)
    }

    pub fn twap_slice_timeout(&self) -> Duration {
        Duration::from_secs(self.twap_slice_timeout_secs)
    }

    pub fn twap_final_watchdog(&self) -> Duration {
        Duration::from_secs(self.twap_final_watchdog_secs)
    }
}

impl OrderConfig {
    pub fn submit_timeout(&self) -> Duration {
        Duration::from_millis(self.submit_timeout_ms)
    }

    pub fn cancel_timeout(&self) -> Duration {
        Duration::from_millis(self.cancel_timeout_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_hours * 3600)
    }

    pub fn recent_fill_window(&self) -> Duration {
        Duration::from_secs(self.recent_fill_window_secs)
    }
}

mod defaults {
    use rust_decimal::Decimal;
    use std::path::PathBuf;
    use std::str::FromStr;

    pub fn target_file() -> PathBuf {
        PathBuf::from("config/pos_update.json")
    }

    pub fn results_dir() -> PathBuf {
        PathBuf::from("results")
    }

    pub fn file_poll_interval_ms() -> u64 {
        100
    }

    pub fn account_refresh_secs() -> u64 {
        5
    }

    pub fn snapshot_timeout_secs() -> u64 {
        10
    }

    pub fn completion_timeout_secs() -> u64 {
        15
    }

    pub fn tolerance_threshold() -> Decimal {
        Decimal::from_str("0.000001").expect("valid tolerance")
    }

    pub fn relative_tolerance() -> Decimal {
        Decimal::from_str("0.05").expect("valid relative tolerance")
    }

    pub fn twap_min_slice_size() -> Decimal {
        Decimal::from(100)
    }

    pub fn twap_interval_ms() -> u64 {
        3000
    }

    pub fn twap_slice_timeout_secs() -> u64 {
        30
    }

    pub fn twap_final_watchdog_secs() -> u64 {
        10
    }

    pub fn submit_timeout_ms() -> u64 {
        5000
    }

    pub fn cancel_timeout_ms() -> u64 {
        3000
    }

    pub fn cleanup_interval_ms() -> u64 {
        1000
    }

    pub fn retention_hours() -> u64 {
        24
    }

    pub fn recent_fill_window_secs() -> u64 {
        30
    }

    pub fn duplicate_tolerance() -> Decimal {
        Decimal::from_str("0.000001").expect("valid duplicate tolerance")
    }
}
