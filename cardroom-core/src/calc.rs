//! Receipt, settlement and player-total arithmetic.

use serde::{Deserialize, Serialize};

use crate::models::{GameSession, ItemType, Player, Receipt, ReceiptItem, ReceiptStatus};

/// Tax added on top of taxable (`positive`) lines, in percent. Rounded down.
pub const TAX_PERCENT: i64 = 10;

/// Totals a receipt.
///
/// Neutral lines count at face value, positive lines add their amount plus
/// `floor(amount * 10%)`, negative lines are subtracted. Saturates at the
/// `i64` bounds instead of overflowing.
pub fn calculate_receipt_total(items: &[ReceiptItem]) -> i64 {
    items
        .iter()
        .map(|item| match item.item_type {
            ItemType::Neutral => item.amount,
            ItemType::Positive => item.amount.saturating_add(tax_on(item.amount)),
            ItemType::Negative => item.amount.saturating_abs().saturating_neg(),
        })
        .fold(0i64, i64::saturating_add)
}

fn tax_on(amount: i64) -> i64 {
    match amount.checked_mul(TAX_PERCENT) {
        Some(scaled) => scaled.div_euclid(100),
        // floor(a * p / 100) with a = 100q + r
        None => amount.div_euclid(100) * TAX_PERCENT + (amount.rem_euclid(100) * TAX_PERCENT) / 100,
    }
}

/// Revenue summary for a set of receipts plus the confirmed rake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyStats {
    pub cash_revenue: i64,
    pub total_revenue: i64,
    pub completed_receipts: usize,
    pub pending_receipts: usize,
}

/// Only completed receipts count towards cash revenue.
pub fn calculate_daily_stats(receipts: &[Receipt], confirmed_rake: i64) -> DailyStats {
    let mut stats = DailyStats::default();

    for receipt in receipts {
        match receipt.status {
            ReceiptStatus::Completed => {
                stats.cash_revenue = stats.cash_revenue.saturating_add(receipt.total);
                stats.completed_receipts += 1;
            }
            ReceiptStatus::Pending => stats.pending_receipts += 1,
        }
    }

    stats.total_revenue = stats.cash_revenue.saturating_add(confirmed_rake);
    stats
}

/// Recomputes a player's derived totals from the sessions that reference it.
pub fn recompute_player(player: &mut Player, sessions: &[GameSession]) {
    let mut current_chips = 0;
    let mut total_buy_in = 0;
    let mut total_cash_out = 0;
    let mut settled_buy_in = 0;
    let mut games_played = 0;
    let mut is_active = false;
    let mut last_played = None;

    for session in sessions.iter().filter(|s| s.player_id == player.id) {
        games_played += 1;
        total_buy_in += session.buy_in;

        match session.cash_out {
            Some(out) => {
                total_cash_out += out;
                settled_buy_in += session.buy_in;
            }
            None => {
                current_chips += session.buy_in;
                is_active = true;
            }
        }

        if last_played.map_or(true, |t| session.start_time > t) {
            last_played = Some(session.start_time);
        }
    }

    player.current_chips = current_chips;
    player.total_buy_in = total_buy_in;
    player.total_cash_out = total_cash_out;
    player.total_profit = total_cash_out - settled_buy_in;
    player.games_played = games_played;
    player.is_active = is_active;
    player.last_played = last_played;
}
