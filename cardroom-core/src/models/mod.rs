mod daily_sales;
mod history;
mod player;
mod receipt;
mod session;
mod settings;

pub use daily_sales::DailySales;
pub use history::{HistoryAction, HistoryEntry};
pub use player::Player;
pub use receipt::{ItemType, Receipt, ReceiptItem, ReceiptStatus};
pub use session::{GameSession, SessionStatus};
pub use settings::SystemSettings;
