use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RouterError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Shard unavailable: {0}")]
    UnavailableShard(String),

    #[error("Circuit breaker is OPEN for shard '{shard}'")]
    CircuitOpen { shard: String },

    #[error("Query execution failed: {0}")]
    QueryExecution(String),

    #[error("{}", transaction_abort_message(.failed_statement, .message))]
    TransactionAbort {
        /// Zero-based index of the statement that failed, `None` when the
        /// failure happened outside a statement (BEGIN, COMMIT, timeout).
        failed_statement: Option<usize>,
        message: String,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Lock error: {0}")]
    Lock(String),
}

fn transaction_abort_message(failed_statement: &Option<usize>, message: &str) -> String {
    match failed_statement {
        Some(index) => format!(
            "Transaction aborted at statement {} and rolled back: {}",
            index, message
        ),
        None => format!("Transaction aborted and rolled back: {}", message),
    }
}

impl RouterError {
    /// Wire name of the error kind, as reported to callers.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "ValidationError",
            Self::UnavailableShard(_) => "UnavailableShard",
            Self::CircuitOpen { .. } => "CircuitOpenError",
            Self::QueryExecution(_) => "QueryExecutionError",
            Self::TransactionAbort { .. } => "TransactionAbortError",
            Self::Config(_) => "ConfigError",
            Self::Lock(_) => "InternalError",
        }
    }

    /// True when the request itself was at fault, not the shard. Such
    /// errors say nothing about shard health.
    pub fn is_caller_error(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}

pub type Result<T> = std::result::Result<T, RouterError>;

impl<T> From<std::sync::PoisonError<T>> for RouterError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::Lock(err.to_string())
    }
}
