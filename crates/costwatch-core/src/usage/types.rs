//! Usage report as emitted by the external usage command, and the
//! per-period snapshot the scheduler works with.

use serde::{Deserialize, Serialize};

use crate::error::FetchError;

/// Full monthly usage document
///
/// ```json
/// { "monthly": [{ "month": "2025-07", "totalCost": 40.23,
///                 "modelsUsed": ["claude-sonnet-4"], "modelBreakdowns": [] }],
///   "totals": { "totalCost": 40.23 } }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageReport {
    pub monthly: Vec<MonthlyUsage>,
    pub totals: UsageTotals,
}

/// Usage for one calendar month
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonthlyUsage {
    /// Period key (`YYYY-MM`)
    pub month: String,
    /// Cost in USD
    pub total_cost: f64,
    pub models_used: Vec<String>,
    #[serde(default)]
    pub model_breakdowns: Vec<ModelBreakdown>,
}

/// Per-model cost split within a month
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelBreakdown {
    pub model_name: String,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_creation_tokens: u64,
    #[serde(default)]
    pub cache_read_tokens: u64,
    #[serde(default)]
    pub cost: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageTotals {
    pub total_cost: f64,
}

impl UsageReport {
    /// Parse the raw command output
    pub fn parse(bytes: &[u8]) -> Result<Self, FetchError> {
        serde_json::from_slice(bytes).map_err(FetchError::Malformed)
    }

    /// Snapshot for `period`, or `None` when the report has no entry for it
    pub fn snapshot_for(&self, period: &str) -> Option<UsageSnapshot> {
        self.monthly
            .iter()
            .find(|entry| entry.month == period)
            .map(|entry| UsageSnapshot {
                period: entry.month.clone(),
                total_cost: entry.total_cost,
                models_used: entry.models_used.clone(),
            })
    }
}

/// Cost figures for the current period; produced fresh every fetch
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageSnapshot {
    pub period: String,
    pub total_cost: f64,
    pub models_used: Vec<String>,
}
