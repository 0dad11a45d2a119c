//! Error types for the rule engine

use thiserror::Error;

/// Errors raised while defining or selecting rules
#[derive(Error, Debug)]
pub enum RuleError {
    /// A rule with the same display name already exists
    #[error("rule '{0}' is already defined")]
    DuplicateName(String),

    /// Rule id not present in the table
    #[error("no rule with id {0}")]
    NoSuchRule(u64),

    /// Invalid cron expression
    #[error("invalid cron expression '{expr}': {reason}")]
    InvalidCron { expr: String, reason: String },

    /// Malformed `whenChanged` cell reference
    #[error("invalid whenChanged spec: '{0}'")]
    BadCellReference(String),
}
