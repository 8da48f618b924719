use chrono::{Local, NaiveDate};
use serde::{Deserialize, Serialize};

/// Club-wide settings; a single object in the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemSettings {
    #[serde(default)]
    pub confirmed_rake: i64,
    #[serde(default)]
    pub rake_confirmed: bool,
    #[serde(default)]
    pub owner_mode: bool,
    #[serde(default = "today")]
    pub current_business_date: NaiveDate,
}

fn today() -> NaiveDate {
    Local::now().date_naive()
}

impl Default for SystemSettings {
    fn default() -> Self {
        Self {
            confirmed_rake: 0,
            rake_confirmed: false,
            owner_mode: false,
            current_business_date: today(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = SystemSettings::default();

        assert_eq!(settings.confirmed_rake, 0);
        assert!(!settings.rake_confirmed);
        assert!(!settings.owner_mode);
        assert_eq!(settings.current_business_date, today());
    }

    #[test]
    fn test_settings_partial_json() {
        let settings: SystemSettings =
            serde_json::from_str(r#"{"confirmedRake":300,"currentBusinessDate":"2025-03-01"}"#)
                .unwrap();

        assert_eq!(settings.confirmed_rake, 300);
        assert!(!settings.rake_confirmed);
        assert_eq!(
            settings.current_business_date,
            NaiveDate::from_ymd_opt(2025, 3, 1).unwrap()
        );
    }
}
