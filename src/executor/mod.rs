pub mod query;
pub mod transaction;

#[cfg(test)]
mod testing;

pub use query::{QueryExecutor, QueryOutcome};
pub use transaction::{BatchStatement, TransactionExecutor, TransactionOutcome};
