pub mod state;

pub use state::{CompletionCallback, Transaction, TransactionId, TransactionStatus};
