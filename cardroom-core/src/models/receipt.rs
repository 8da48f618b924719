use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::calc::calculate_receipt_total;

/// How a receipt line contributes to the total.
///
/// `Positive` lines are taxable sales, `Negative` lines are deductions and
/// `Neutral` lines (chip purchases) pass through untaxed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemType {
    Positive,
    Negative,
    Neutral,
}

impl fmt::Display for ItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemType::Positive => write!(f, "positive"),
            ItemType::Negative => write!(f, "negative"),
            ItemType::Neutral => write!(f, "neutral"),
        }
    }
}

impl FromStr for ItemType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "positive" => Ok(ItemType::Positive),
            "negative" => Ok(ItemType::Negative),
            "neutral" => Ok(ItemType::Neutral),
            _ => Err(format!(
                "Invalid item type '{}'. Valid options: positive, negative, neutral",
                s
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiptItem {
    pub name: String,
    pub amount: i64,
    #[serde(rename = "type")]
    pub item_type: ItemType,
}

impl ReceiptItem {
    pub fn new(name: impl Into<String>, amount: i64, item_type: ItemType) -> Self {
        Self {
            name: name.into(),
            amount,
            item_type,
        }
    }
}

impl FromStr for ReceiptItem {
    type Err = String;

    /// Parses `name:amount[:type]`. The type defaults to `positive` and the
    /// name may itself contain colons.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || format!("Invalid receipt item '{}'. Expected name:amount[:type]", s);

        let mut parts: Vec<&str> = s.rsplitn(3, ':').collect();
        parts.reverse();

        let (name, amount, item_type) = match parts.as_slice() {
            [name, amount] => (*name, *amount, ItemType::Positive),
            [name, amount, kind] => match kind.parse::<ItemType>() {
                Ok(kind) => (*name, *amount, kind),
                // No type given; the last colon separates name and amount
                Err(_) if kind.trim().parse::<i64>().is_ok() => {
                    let name = s.rsplit_once(':').map(|(n, _)| n).ok_or_else(invalid)?;
                    (name, *kind, ItemType::Positive)
                }
                Err(e) => return Err(e),
            },
            _ => return Err(invalid()),
        };

        let name = name.trim();
        if name.is_empty() {
            return Err(invalid());
        }
        let amount = amount
            .trim()
            .parse::<i64>()
            .map_err(|_| format!("Invalid amount '{}' in receipt item", amount))?;

        Ok(Self::new(name, amount, item_type))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReceiptStatus {
    Pending,
    Completed,
}

impl fmt::Display for ReceiptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReceiptStatus::Pending => write!(f, "pending"),
            ReceiptStatus::Completed => write!(f, "completed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    pub id: String,
    pub player_id: String,
    #[serde(default)]
    pub player_name: String,
    #[serde(default)]
    pub items: Vec<ReceiptItem>,
    pub total: i64,
    pub status: ReceiptStatus,
    pub created_at: DateTime<Utc>,
    pub business_date: NaiveDate,
}

impl Receipt {
    /// Creates a pending receipt; the total is computed from the items.
    pub fn new(
        player_id: impl Into<String>,
        player_name: impl Into<String>,
        items: Vec<ReceiptItem>,
        business_date: NaiveDate,
    ) -> Self {
        let total = calculate_receipt_total(&items);
        Self {
            id: Uuid::new_v4().to_string(),
            player_id: player_id.into(),
            player_name: player_name.into(),
            items,
            total,
            status: ReceiptStatus::Pending,
            created_at: Utc::now(),
            business_date,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == ReceiptStatus::Completed
    }
}

impl fmt::Display for Receipt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Receipt {} [{}]", self.id, self.status)?;
        writeln!(f, "Player: {}", self.player_name)?;
        writeln!(f, "Date: {}", self.business_date)?;
        for item in &self.items {
            writeln!(f, "  {:<20} {:>8} ({})", item.name, item.amount, item.item_type)?;
        }
        write!(f, "Total: {}", self.total)
    }
}
