use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Completed,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Active => write!(f, "active"),
            SessionStatus::Completed => write!(f, "completed"),
        }
    }
}

/// One seat at the table: a buy-in and, once the player leaves, a cash-out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameSession {
    pub id: String,
    pub player_id: String,
    pub buy_in: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cash_out: Option<i64>,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub status: SessionStatus,
}

impl GameSession {
    pub fn new(player_id: impl Into<String>, buy_in: i64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            player_id: player_id.into(),
            buy_in,
            cash_out: None,
            start_time: Utc::now(),
            end_time: None,
            status: SessionStatus::Active,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }

    /// Closes the session with the given chip count.
    pub fn complete(&mut self, cash_out: i64) {
        self.cash_out = Some(cash_out);
        self.end_time = Some(Utc::now());
        self.status = SessionStatus::Completed;
    }

    /// Profit for a completed session, `None` while still active.
    pub fn profit(&self) -> Option<i64> {
        self.cash_out.map(|out| out - self.buy_in)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_new_is_active() {
        let session = GameSession::new("p1", 5000);

        assert!(session.is_active());
        assert_eq!(session.buy_in, 5000);
        assert!(session.profit().is_none());
    }

    #[test]
    fn test_session_complete() {
        let mut session = GameSession::new("p1", 5000);
        session.complete(7200);

        assert!(!session.is_active());
        assert_eq!(session.profit(), Some(2200));
        assert!(session.end_time.is_some());
    }

    #[test]
    fn test_session_status_json() {
        let json = serde_json::to_string(&SessionStatus::Completed).unwrap();
        assert_eq!(json, "\"completed\"");
    }
}
