#![deny(clippy::print_stdout, clippy::print_stderr)]

//! The worker-facing domain: clients, shifts, priced tasks, expenses with
//! the photo policy, and the bot command menu.

use thiserror::Error;

use crew_money::Money;

pub mod botmenu;
pub mod clients;
pub mod expenses;
pub mod shifts;
pub mod tasks;

pub use botmenu::BotCommand;
pub use botmenu::MenuConfig;
pub use clients::Client;
pub use expenses::Expense;
pub use expenses::ExpenseStatus;
pub use expenses::OcrStatus;
pub use shifts::Shift;
pub use shifts::ShiftStatus;
pub use tasks::Task;
pub use tasks::TaskStatus;

pub type WorklogResult<T> = Result<T, WorklogError>;

#[derive(Debug, Error)]
pub enum WorklogError {
    #[error("resource not found: {0}")]
    NotFound(String),
    #[error("state conflict: {0}")]
    StaleState(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("photo required for expenses above {threshold}")]
    PhotoRequired { threshold: Money },
    #[error(transparent)]
    Pricing(#[from] crew_pricing::PricingError),
    #[error("storage failure: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Store(#[from] crew_store::StoreError),
    #[error(transparent)]
    Audit(#[from] crew_audit::AuditError),
    #[error(transparent)]
    Money(#[from] crew_money::MoneyError),
}

/// Expense acceptance policy, sourced from the environment at startup.
#[derive(Debug, Clone)]
pub struct ExpensePolicy {
    /// Amounts strictly above this require a photo reference.
    pub photo_threshold: Money,
    pub ocr_enabled: bool,
}

impl Default for ExpensePolicy {
    fn default() -> Self {
        Self {
            photo_threshold: Money::parse("400").unwrap_or(Money::ZERO),
            ocr_enabled: false,
        }
    }
}
