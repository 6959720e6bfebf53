use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{Level, event};

use crate::core::{Result, ViewError};
use crate::graph::ViewGraph;

static NEXT_TXN_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionId(pub u64);

impl TransactionId {
    fn next() -> Self {
        Self(NEXT_TXN_ID.fetch_add(1, Ordering::SeqCst))
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn_{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Active,
    Committed,
    RolledBack,
}

impl TransactionStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "ACTIVE"),
            Self::Committed => write!(f, "COMMITTED"),
            Self::RolledBack => write!(f, "ROLLED_BACK"),
        }
    }
}

/// Completion callback. Receives the graph the transaction was used with
/// and the final status.
pub type CompletionCallback = Box<dyn FnOnce(&mut ViewGraph, TransactionStatus) -> Result<()>>;

/// Explicit transaction handle the flush engine registers its completion
/// work with. The engine never begins or ends transactions on its own;
/// the caller drives the boundary and passes the handle through the call
/// chain.
///
/// After-completion callbacks run in registration order on commit and in
/// reverse registration order on rollback, so rolling back unwinds later
/// flushes before earlier ones. That asymmetry is part of the contract.
pub struct Transaction {
    id: TransactionId,
    status: TransactionStatus,
    before_completion: Vec<CompletionCallback>,
    after_completion: Vec<CompletionCallback>,
}

impl Transaction {
    pub fn begin() -> Self {
        let id = TransactionId::next();
        event!(Level::DEBUG, txn = %id, "transaction started");
        Self {
            id,
            status: TransactionStatus::Active,
            before_completion: Vec::new(),
            after_completion: Vec::new(),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn status(&self) -> TransactionStatus {
        self.status
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    pub fn on_before_completion(
        &mut self,
        callback: impl FnOnce(&mut ViewGraph, TransactionStatus) -> Result<()> + 'static,
    ) -> Result<()> {
        self.check_active()?;
        self.before_completion.push(Box::new(callback));
        Ok(())
    }

    pub fn on_after_completion(
        &mut self,
        callback: impl FnOnce(&mut ViewGraph, TransactionStatus) -> Result<()> + 'static,
    ) -> Result<()> {
        self.check_active()?;
        self.after_completion.push(Box::new(callback));
        Ok(())
    }

    /// Commit: before-completion callbacks first (a failure there rolls
    /// back instead), then after-completion callbacks in registration
    /// order. All callbacks run even if one fails; the first failure is
    /// returned.
    pub fn commit(&mut self, graph: &mut ViewGraph) -> Result<()> {
        self.check_active()?;

        let before = std::mem::take(&mut self.before_completion);
        for callback in before {
            if let Err(err) = callback(graph, TransactionStatus::Active) {
                event!(Level::WARN, txn = %self.id, error = %err,
                    "before-completion callback failed, rolling back");
                // the triggering error wins over secondary callback errors
                let _ = self.complete(graph, TransactionStatus::RolledBack);
                return Err(err);
            }
        }

        event!(Level::DEBUG, txn = %self.id, "transaction committing");
        self.complete(graph, TransactionStatus::Committed)
    }

    /// Roll back: after-completion callbacks run in reverse registration
    /// order. All callbacks run even if one fails; the first failure is
    /// returned.
    pub fn rollback(&mut self, graph: &mut ViewGraph) -> Result<()> {
        self.check_active()?;
        event!(Level::DEBUG, txn = %self.id, "transaction rolling back");
        self.before_completion.clear();
        self.complete(graph, TransactionStatus::RolledBack)
    }

    fn complete(&mut self, graph: &mut ViewGraph, status: TransactionStatus) -> Result<()> {
        self.status = status;
        let mut callbacks = std::mem::take(&mut self.after_completion);
        if status == TransactionStatus::RolledBack {
            callbacks.reverse();
        }
        let mut first_error = None;
        for callback in callbacks {
            if let Err(err) = callback(graph, status) {
                event!(Level::WARN, txn = %self.id, error = %err,
                    "after-completion callback failed");
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn check_active(&self) -> Result<()> {
        if self.status.is_terminal() {
            return Err(ViewError::TransactionCompleted(self.status.to_string()));
        }
        Ok(())
    }
}
