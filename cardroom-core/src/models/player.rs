use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// A club member. The chip and money totals are derived from the player's
/// sessions, see [`crate::calc::recompute_player`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Player {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub current_chips: i64,
    #[serde(default)]
    pub total_buy_in: i64,
    #[serde(default)]
    pub total_cash_out: i64,
    #[serde(default)]
    pub total_profit: i64,
    #[serde(default)]
    pub games_played: u32,
    #[serde(default)]
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_played: Option<DateTime<Utc>>,
}

impl Player {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            current_chips: 0,
            total_buy_in: 0,
            total_cash_out: 0,
            total_profit: 0,
            games_played: 0,
            is_active: false,
            created_at: Utc::now(),
            last_played: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}

impl fmt::Display for Player {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (chips: {}, buy-in: {}, cash-out: {}, profit: {:+})",
            self.name, self.current_chips, self.total_buy_in, self.total_cash_out, self.total_profit
        )
    }
}
