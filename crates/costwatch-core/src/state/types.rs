use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Persisted dedup record
///
/// ```json
/// { "lastNotificationDate": "2025-07-15", "lastExceedanceDate": "2025-07-15" }
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorState {
    /// Day an alert was last delivered successfully
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_notification_date: Option<NaiveDate>,
    /// Day the threshold was last seen exceeded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_exceedance_date: Option<NaiveDate>,
}

impl MonitorState {
    pub fn notified_on(&self, day: NaiveDate) -> bool {
        self.last_notification_date == Some(day)
    }

    pub fn exceeded_on(&self, day: NaiveDate) -> bool {
        self.last_exceedance_date == Some(day)
    }
}
