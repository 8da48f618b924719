use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryAction {
    PlayerAdded,
    BuyIn,
    CashOut,
    ReceiptCreated,
    ReceiptCompleted,
    RakeConfirmed,
    DayClosed,
}

impl fmt::Display for HistoryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HistoryAction::PlayerAdded => "player_added",
            HistoryAction::BuyIn => "buy_in",
            HistoryAction::CashOut => "cash_out",
            HistoryAction::ReceiptCreated => "receipt_created",
            HistoryAction::ReceiptCompleted => "receipt_completed",
            HistoryAction::RakeConfirmed => "rake_confirmed",
            HistoryAction::DayClosed => "day_closed",
        };
        write!(f, "{}", s)
    }
}

/// One line of the audit log. Entries are only ever appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub action: HistoryAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<i64>,
    #[serde(default)]
    pub details: String,
    pub business_date: NaiveDate,
}

impl HistoryEntry {
    pub fn new(action: HistoryAction, business_date: NaiveDate, details: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            action,
            player_id: None,
            player_name: None,
            amount: None,
            details: details.into(),
            business_date,
        }
    }

    pub fn with_player(mut self, id: impl Into<String>, name: impl Into<String>) -> Self {
        self.player_id = Some(id.into());
        self.player_name = Some(name.into());
        self
    }

    pub fn with_amount(mut self, amount: i64) -> Self {
        self.amount = Some(amount);
        self
    }
}

impl fmt::Display for HistoryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:<18} {}",
            self.timestamp.format("%Y-%m-%d %H:%M"),
            self.action.to_string(),
            self.details
        )?;
        if let Some(amount) = self.amount {
            write!(f, " ({})", amount)?;
        }
        Ok(())
    }
}
