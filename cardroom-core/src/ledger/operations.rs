//! Ledger operations: the front-desk actions that mutate the document.
//!
//! Every operation reports which sections it touched so the caller can
//! persist and replicate exactly those.

use chrono::{Duration, Utc};
use thiserror::Error;

use super::{LedgerDocument, Section};
use crate::calc::{calculate_daily_stats, recompute_player, DailyStats};
use crate::models::{
    DailySales, GameSession, HistoryAction, HistoryEntry, Player, Receipt, ReceiptItem,
    ReceiptStatus,
};

/// Errors raised by ledger operations.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Player not found: {0}")]
    PlayerNotFound(String),
    #[error("A player named '{0}' already exists")]
    DuplicatePlayer(String),
    #[error("Player name must not be empty")]
    EmptyName,
    #[error("Invalid amount: {0}")]
    InvalidAmount(i64),
    #[error("Player {0} has no active session")]
    NoActiveSession(String),
    #[error("Receipt not found: {0}")]
    ReceiptNotFound(String),
    #[error("Receipt {0} is already completed")]
    ReceiptAlreadyCompleted(String),
    #[error("Receipt has no items")]
    EmptyReceipt,
    #[error("Rake has not been confirmed for {0}")]
    RakeNotConfirmed(chrono::NaiveDate),
    #[error("Invalid value for section {0}: {1}")]
    InvalidSection(Section, #[source] serde_json::Error),
}

/// The result of an operation plus the sections it replaced.
#[derive(Debug, Clone)]
pub struct Applied<T> {
    pub value: T,
    pub sections: &'static [Section],
}

impl<T> Applied<T> {
    fn new(value: T, sections: &'static [Section]) -> Self {
        Self { value, sections }
    }
}

impl LedgerDocument {
    fn log(&mut self, entry: HistoryEntry) {
        self.history.push(entry);
    }

    fn recompute(&mut self, player_id: &str) {
        if let Some(player) = self.players.iter_mut().find(|p| p.id == player_id) {
            recompute_player(player, &self.sessions);
        }
    }

    /// Registers a new player. Names are unique, case-insensitively.
    pub fn add_player(&mut self, name: &str) -> Result<Applied<Player>, LedgerError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(LedgerError::EmptyName);
        }
        if self
            .players
            .iter()
            .any(|p| p.name.eq_ignore_ascii_case(name))
        {
            return Err(LedgerError::DuplicatePlayer(name.to_string()));
        }

        let player = Player::new(name);
        self.players.push(player.clone());

        let date = self.settings.current_business_date;
        self.log(
            HistoryEntry::new(HistoryAction::PlayerAdded, date, "Player registered")
                .with_player(&player.id, &player.name),
        );

        Ok(Applied::new(player, &[Section::Players, Section::History]))
    }

    /// Buys chips for a player. A player with an open session re-buys into
    /// it, otherwise a new session starts.
    pub fn buy_in(
        &mut self,
        player_id: &str,
        amount: i64,
    ) -> Result<Applied<GameSession>, LedgerError> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount(amount));
        }
        let player = self
            .player(player_id)
            .cloned()
            .ok_or_else(|| LedgerError::PlayerNotFound(player_id.to_string()))?;

        let session = match self
            .sessions
            .iter_mut()
            .find(|s| s.player_id == player.id && s.is_active())
        {
            Some(session) => {
                session.buy_in += amount;
                session.clone()
            }
            None => {
                let session = GameSession::new(&player.id, amount);
                self.sessions.push(session.clone());
                session
            }
        };

        self.recompute(&player.id);
        let date = self.settings.current_business_date;
        self.log(
            HistoryEntry::new(HistoryAction::BuyIn, date, "Buy-in")
                .with_player(&player.id, &player.name)
                .with_amount(amount),
        );

        Ok(Applied::new(
            session,
            &[Section::Sessions, Section::Players, Section::History],
        ))
    }

    /// Closes the player's open session with the given chip count.
    pub fn cash_out(
        &mut self,
        player_id: &str,
        amount: i64,
    ) -> Result<Applied<GameSession>, LedgerError> {
        if amount < 0 {
            return Err(LedgerError::InvalidAmount(amount));
        }
        let player = self
            .player(player_id)
            .cloned()
            .ok_or_else(|| LedgerError::PlayerNotFound(player_id.to_string()))?;

        let session = self
            .sessions
            .iter_mut()
            .find(|s| s.player_id == player.id && s.is_active())
            .ok_or_else(|| LedgerError::NoActiveSession(player.name.clone()))?;
        session.complete(amount);
        let session = session.clone();

        self.recompute(&player.id);
        let date = self.settings.current_business_date;
        self.log(
            HistoryEntry::new(HistoryAction::CashOut, date, "Cash-out")
                .with_player(&player.id, &player.name)
                .with_amount(amount),
        );

        Ok(Applied::new(
            session,
            &[Section::Sessions, Section::Players, Section::History],
        ))
    }

    /// Opens a pending receipt for a player on the current business date.
    pub fn add_receipt(
        &mut self,
        player_id: &str,
        items: Vec<ReceiptItem>,
    ) -> Result<Applied<Receipt>, LedgerError> {
        if items.is_empty() {
            return Err(LedgerError::EmptyReceipt);
        }
        let player = self
            .player(player_id)
            .cloned()
            .ok_or_else(|| LedgerError::PlayerNotFound(player_id.to_string()))?;

        let date = self.settings.current_business_date;
        let receipt = Receipt::new(&player.id, &player.name, items, date);
        self.receipts.push(receipt.clone());

        self.log(
            HistoryEntry::new(
                HistoryAction::ReceiptCreated,
                date,
                format!("Receipt {}", receipt.id),
            )
            .with_player(&player.id, &player.name)
            .with_amount(receipt.total),
        );

        Ok(Applied::new(receipt, &[Section::Receipts, Section::History]))
    }

    /// Marks a receipt as paid.
    pub fn complete_receipt(&mut self, receipt_id: &str) -> Result<Applied<Receipt>, LedgerError> {
        let receipt = self
            .receipts
            .iter_mut()
            .find(|r| r.id == receipt_id)
            .ok_or_else(|| LedgerError::ReceiptNotFound(receipt_id.to_string()))?;
        if receipt.is_completed() {
            return Err(LedgerError::ReceiptAlreadyCompleted(receipt_id.to_string()));
        }
        receipt.status = ReceiptStatus::Completed;
        let receipt = receipt.clone();

        let date = self.settings.current_business_date;
        self.log(
            HistoryEntry::new(
                HistoryAction::ReceiptCompleted,
                date,
                format!("Receipt {}", receipt.id),
            )
            .with_player(&receipt.player_id, &receipt.player_name)
            .with_amount(receipt.total),
        );

        Ok(Applied::new(receipt, &[Section::Receipts, Section::History]))
    }

    /// Records the house take for the current business date.
    pub fn confirm_rake(&mut self, amount: i64) -> Result<Applied<i64>, LedgerError> {
        if amount < 0 {
            return Err(LedgerError::InvalidAmount(amount));
        }
        self.settings.confirmed_rake = amount;
        self.settings.rake_confirmed = true;

        let date = self.settings.current_business_date;
        self.log(
            HistoryEntry::new(HistoryAction::RakeConfirmed, date, "Rake confirmed")
                .with_amount(amount),
        );

        Ok(Applied::new(amount, &[Section::Settings, Section::History]))
    }

    /// Stats for the current business date.
    pub fn daily_stats(&self) -> DailyStats {
        calculate_daily_stats(
            &self.receipts_for_current_day(),
            self.settings.confirmed_rake,
        )
    }

    /// Settles the current business date.
    ///
    /// Requires a confirmed rake. Writes (or replaces) the day's
    /// [`DailySales`] row, then advances the business date by one day and
    /// resets the rake.
    pub fn close_day(&mut self) -> Result<Applied<DailySales>, LedgerError> {
        let date = self.settings.current_business_date;
        if !self.settings.rake_confirmed {
            return Err(LedgerError::RakeNotConfirmed(date));
        }

        let stats = self.daily_stats();
        let sales = DailySales {
            date,
            cash_revenue: stats.cash_revenue,
            rake: self.settings.confirmed_rake,
            total_revenue: stats.total_revenue,
            receipt_count: stats.completed_receipts + stats.pending_receipts,
            closed_at: Utc::now(),
        };

        self.daily_sales.retain(|d| d.date != date);
        self.daily_sales.push(sales.clone());

        self.log(
            HistoryEntry::new(HistoryAction::DayClosed, date, format!("Closed {}", date))
                .with_amount(sales.total_revenue),
        );

        self.settings.current_business_date = date + Duration::days(1);
        self.settings.confirmed_rake = 0;
        self.settings.rake_confirmed = false;

        Ok(Applied::new(
            sales,
            &[Section::DailySales, Section::History, Section::Settings],
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ItemType;
    use chrono::NaiveDate;

    fn doc_with_player() -> (LedgerDocument, String) {
        let mut doc = LedgerDocument::new();
        doc.settings.current_business_date = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
        let player = doc.add_player("Tanaka").unwrap().value;
        (doc, player.id)
    }

    #[test]
    fn test_add_player() {
        let (doc, id) = doc_with_player();

        assert_eq!(doc.players.len(), 1);
        assert_eq!(doc.players[0].id, id);
        assert_eq!(doc.history.len(), 1);
        assert_eq!(doc.history[0].action, HistoryAction::PlayerAdded);
    }

    #[test]
    fn test_add_player_rejects_duplicates_and_empty() {
        let (mut doc, _) = doc_with_player();

        assert!(matches!(
            doc.add_player("tanaka"),
            Err(LedgerError::DuplicatePlayer(_))
        ));
        assert!(matches!(doc.add_player("  "), Err(LedgerError::EmptyName)));
    }

    #[test]
    fn test_buy_in_and_rebuy() {
        let (mut doc, id) = doc_with_player();

        let first = doc.buy_in(&id, 5000).unwrap();
        assert_eq!(
            first.sections,
            &[Section::Sessions, Section::Players, Section::History]
        );
        let rebuy = doc.buy_in(&id, 2000).unwrap().value;

        assert_eq!(doc.sessions.len(), 1);
        assert_eq!(rebuy.buy_in, 7000);
        assert_eq!(doc.players[0].current_chips, 7000);
        assert!(doc.players[0].is_active);
    }

    #[test]
    fn test_buy_in_validation() {
        let (mut doc, id) = doc_with_player();

        assert!(matches!(
            doc.buy_in(&id, 0),
            Err(LedgerError::InvalidAmount(0))
        ));
        assert!(matches!(
            doc.buy_in("ghost", 1000),
            Err(LedgerError::PlayerNotFound(_))
        ));
    }

    #[test]
    fn test_cash_out_updates_totals() {
        let (mut doc, id) = doc_with_player();
        doc.buy_in(&id, 5000).unwrap();

        let session = doc.cash_out(&id, 6500).unwrap().value;

        assert_eq!(session.profit(), Some(1500));
        let player = doc.player(&id).unwrap();
        assert_eq!(player.total_profit, 1500);
        assert_eq!(player.current_chips, 0);
        assert!(!player.is_active);
    }

    #[test]
    fn test_cash_out_without_session() {
        let (mut doc, id) = doc_with_player();
        assert!(matches!(
            doc.cash_out(&id, 100),
            Err(LedgerError::NoActiveSession(_))
        ));
    }

    #[test]
    fn test_receipt_lifecycle() {
        let (mut doc, id) = doc_with_player();

        let receipt = doc
            .add_receipt(
                &id,
                vec![
                    ReceiptItem::new("スタック購入", 1000, ItemType::Neutral),
                    ReceiptItem::new("ドリンク", 500, ItemType::Positive),
                ],
            )
            .unwrap()
            .value;
        assert_eq!(receipt.total, 1550);
        assert_eq!(receipt.player_name, "Tanaka");

        doc.complete_receipt(&receipt.id).unwrap();
        assert!(doc.receipts[0].is_completed());
        assert!(matches!(
            doc.complete_receipt(&receipt.id),
            Err(LedgerError::ReceiptAlreadyCompleted(_))
        ));
        assert!(matches!(
            doc.add_receipt(&id, vec![]),
            Err(LedgerError::EmptyReceipt)
        ));
    }

    #[test]
    fn test_close_day_requires_rake() {
        let (mut doc, _) = doc_with_player();
        assert!(matches!(
            doc.close_day(),
            Err(LedgerError::RakeNotConfirmed(_))
        ));
    }

    #[test]
    fn test_close_day_settles_and_advances() {
        let (mut doc, id) = doc_with_player();
        let receipt = doc
            .add_receipt(&id, vec![ReceiptItem::new("chips", 1000, ItemType::Neutral)])
            .unwrap()
            .value;
        doc.complete_receipt(&receipt.id).unwrap();
        doc.add_receipt(&id, vec![ReceiptItem::new("chips", 2000, ItemType::Neutral)])
            .unwrap();
        doc.confirm_rake(300).unwrap();

        let sales = doc.close_day().unwrap().value;

        assert_eq!(sales.cash_revenue, 1000);
        assert_eq!(sales.total_revenue, 1300);
        assert_eq!(sales.receipt_count, 2);
        assert_eq!(doc.daily_sales.len(), 1);
        assert_eq!(
            doc.settings.current_business_date,
            NaiveDate::from_ymd_opt(2025, 1, 2).unwrap()
        );
        assert!(!doc.settings.rake_confirmed);
        assert_eq!(doc.settings.confirmed_rake, 0);
        assert_eq!(doc.daily_stats().completed_receipts, 0);
    }
}
