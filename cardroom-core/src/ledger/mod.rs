//! The ledger document: every piece of club state in one aggregate.
//!
//! The document is split into named sections. Sections are the unit of
//! persistence and replication: a write always replaces a whole section,
//! and the last write to a section wins.

mod operations;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::models::{DailySales, GameSession, HistoryEntry, Player, Receipt, SystemSettings};

pub use operations::{Applied, LedgerError};

/// A top-level section of the [`LedgerDocument`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Section {
    Players,
    Sessions,
    Receipts,
    DailySales,
    History,
    Settings,
}

impl Section {
    pub const ALL: [Section; 6] = [
        Section::Players,
        Section::Sessions,
        Section::Receipts,
        Section::DailySales,
        Section::History,
        Section::Settings,
    ];

    /// Wire name, as used in `DATA_UPDATE` messages and HTTP bodies.
    pub fn name(&self) -> &'static str {
        match self {
            Section::Players => "players",
            Section::Sessions => "sessions",
            Section::Receipts => "receipts",
            Section::DailySales => "dailySales",
            Section::History => "history",
            Section::Settings => "settings",
        }
    }

    /// Storage key / file name for this section.
    pub fn filename(&self) -> &'static str {
        match self {
            Section::Players => "players.json",
            Section::Sessions => "sessions.json",
            Section::Receipts => "receipts.json",
            Section::DailySales => "daily-sales.json",
            Section::History => "history.json",
            Section::Settings => "settings.json",
        }
    }

    /// Parses a section name. Accepts the wire name as well as the
    /// kebab/snake spellings of `dailySales`, case-insensitively.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().replace(|c: char| c == '-' || c == '_', "").as_str() {
            "players" => Some(Section::Players),
            "sessions" => Some(Section::Sessions),
            "receipts" => Some(Section::Receipts),
            "dailysales" => Some(Section::DailySales),
            "history" => Some(Section::History),
            "settings" => Some(Section::Settings),
            _ => None,
        }
    }
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for Section {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Section::parse(s).ok_or_else(|| {
            format!(
                "Invalid section '{}'. Valid options: players, sessions, receipts, dailySales, history, settings",
                s
            )
        })
    }
}

/// Checks that a JSON value deserializes into the section's type.
pub fn validate_section(section: Section, value: &Value) -> Result<(), LedgerError> {
    let result = match section {
        Section::Players => Vec::<Player>::deserialize(value).map(|_| ()),
        Section::Sessions => Vec::<GameSession>::deserialize(value).map(|_| ()),
        Section::Receipts => Vec::<Receipt>::deserialize(value).map(|_| ()),
        Section::DailySales => Vec::<DailySales>::deserialize(value).map(|_| ()),
        Section::History => Vec::<HistoryEntry>::deserialize(value).map(|_| ()),
        Section::Settings => SystemSettings::deserialize(value).map(|_| ()),
    };
    result.map_err(|e| LedgerError::InvalidSection(section, e))
}

/// All club state shared between devices.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerDocument {
    #[serde(default)]
    pub players: Vec<Player>,
    #[serde(default)]
    pub sessions: Vec<GameSession>,
    #[serde(default)]
    pub receipts: Vec<Receipt>,
    #[serde(default)]
    pub daily_sales: Vec<DailySales>,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    #[serde(default)]
    pub settings: SystemSettings,
}

impl LedgerDocument {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serializes one section to JSON.
    pub fn section_value(&self, section: Section) -> Value {
        let value = match section {
            Section::Players => serde_json::to_value(&self.players),
            Section::Sessions => serde_json::to_value(&self.sessions),
            Section::Receipts => serde_json::to_value(&self.receipts),
            Section::DailySales => serde_json::to_value(&self.daily_sales),
            Section::History => serde_json::to_value(&self.history),
            Section::Settings => serde_json::to_value(&self.settings),
        };
        // The models only contain maps with string keys, so this cannot fail.
        value.unwrap_or(Value::Null)
    }

    /// Replaces one section wholesale with a JSON value.
    ///
    /// The value must deserialize into the section's type; on error the
    /// document is left untouched.
    pub fn set_section(&mut self, section: Section, value: Value) -> Result<(), LedgerError> {
        let invalid = |e: serde_json::Error| LedgerError::InvalidSection(section, e);
        match section {
            Section::Players => self.players = serde_json::from_value(value).map_err(invalid)?,
            Section::Sessions => self.sessions = serde_json::from_value(value).map_err(invalid)?,
            Section::Receipts => self.receipts = serde_json::from_value(value).map_err(invalid)?,
            Section::DailySales => {
                self.daily_sales = serde_json::from_value(value).map_err(invalid)?
            }
            Section::History => self.history = serde_json::from_value(value).map_err(invalid)?,
            Section::Settings => self.settings = serde_json::from_value(value).map_err(invalid)?,
        }
        Ok(())
    }

    pub fn player(&self, id: &str) -> Option<&Player> {
        self.players.iter().find(|p| p.id == id)
    }

    /// Finds a player by id, or by case-insensitive name.
    pub fn find_player(&self, id_or_name: &str) -> Option<&Player> {
        self.player(id_or_name).or_else(|| {
            self.players
                .iter()
                .find(|p| p.name.eq_ignore_ascii_case(id_or_name))
        })
    }

    pub fn active_session(&self, player_id: &str) -> Option<&GameSession> {
        self.sessions
            .iter()
            .find(|s| s.player_id == player_id && s.is_active())
    }

    /// Receipts stamped with the current business date.
    pub fn receipts_for_current_day(&self) -> Vec<Receipt> {
        let date = self.settings.current_business_date;
        self.receipts
            .iter()
            .filter(|r| r.business_date == date)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_section_names_and_files() {
        assert_eq!(Section::DailySales.name(), "dailySales");
        assert_eq!(Section::DailySales.filename(), "daily-sales.json");
        assert_eq!(Section::Players.filename(), "players.json");
    }

    #[test]
    fn test_section_parse() {
        assert_eq!(Section::parse("players"), Some(Section::Players));
        assert_eq!(Section::parse("dailySales"), Some(Section::DailySales));
        assert_eq!(Section::parse("daily-sales"), Some(Section::DailySales));
        assert_eq!(Section::parse("DAILY_SALES"), Some(Section::DailySales));
        assert_eq!(Section::parse("tables"), None);
        assert!("tables".parse::<Section>().is_err());
    }

    #[test]
    fn test_section_serde_matches_name() {
        for section in Section::ALL {
            let json = serde_json::to_value(section).unwrap();
            assert_eq!(json, section.name());
        }
    }

    #[test]
    fn test_document_json_field_names() {
        let json = serde_json::to_value(LedgerDocument::new()).unwrap();
        assert!(json.get("dailySales").is_some());
        assert!(json.get("settings").is_some());
    }

    #[test]
    fn test_empty_object_parses_as_default_document() {
        let doc: LedgerDocument = serde_json::from_str("{}").unwrap();
        assert!(doc.players.is_empty());
        assert!(doc.history.is_empty());
    }

    #[test]
    fn test_set_section_replaces_wholesale() {
        let mut doc = LedgerDocument::new();
        doc.players.push(Player::new("Old").with_id("old"));

        let replacement = vec![Player::new("New").with_id("new")];
        doc.set_section(Section::Players, serde_json::to_value(&replacement).unwrap())
            .unwrap();

        assert_eq!(doc.players, replacement);
    }

    #[test]
    fn test_set_section_invalid_value_leaves_document() {
        let mut doc = LedgerDocument::new();
        doc.players.push(Player::new("Keep").with_id("keep"));

        let result = doc.set_section(Section::Players, json!({"not": "a list"}));

        assert!(matches!(
            result,
            Err(LedgerError::InvalidSection(Section::Players, _))
        ));
        assert_eq!(doc.players.len(), 1);
    }

    #[test]
    fn test_section_value_roundtrip() {
        let mut doc = LedgerDocument::new();
        doc.settings.confirmed_rake = 500;

        let value = doc.section_value(Section::Settings);
        assert_eq!(value["confirmedRake"], 500);

        let mut other = LedgerDocument::new();
        other.set_section(Section::Settings, value).unwrap();
        assert_eq!(other.settings, doc.settings);
    }

    #[test]
    fn test_find_player_by_name() {
        let mut doc = LedgerDocument::new();
        doc.players.push(Player::new("Tanaka").with_id("p1"));

        assert_eq!(doc.find_player("p1").map(|p| p.name.as_str()), Some("Tanaka"));
        assert_eq!(doc.find_player("tanaka").map(|p| p.id.as_str()), Some("p1"));
        assert!(doc.find_player("nobody").is_none());
    }
}
