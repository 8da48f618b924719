use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The settled figures for one business date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailySales {
    pub date: NaiveDate,
    #[serde(default)]
    pub cash_revenue: i64,
    #[serde(default)]
    pub rake: i64,
    #[serde(default)]
    pub total_revenue: i64,
    #[serde(default)]
    pub receipt_count: usize,
    pub closed_at: DateTime<Utc>,
}

impl fmt::Display for DailySales {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: cash {} + rake {} = {} ({} receipts)",
            self.date, self.cash_revenue, self.rake, self.total_revenue, self.receipt_count
        )
    }
}
