use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use super::Transaction;

/// Hands out explicit transactions with unique ids
#[derive(Debug, Clone)]
pub struct TransactionManager {
    /// Atomic counter for generating unique transaction IDs
    next_tx_id: Arc<AtomicU64>,
}

impl TransactionManager {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_tx_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Starts an explicit transaction; it binds a connection on first use
    #[must_use]
    pub fn begin(&self) -> Transaction {
        Transaction::explicit(self.next_tx_id.fetch_add(1, Ordering::SeqCst))
    }

    /// The id the next transaction will get
    #[must_use]
    pub fn current_tx_id(&self) -> u64 {
        self.next_tx_id.load(Ordering::SeqCst)
    }
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_manager_new() {
        let tm = TransactionManager::new();
        assert_eq!(tm.current_tx_id(), 1);
    }

    #[test]
    fn test_begin_increments() {
        let tm = TransactionManager::new();
        let tx1 = tm.begin();
        let tx2 = tm.begin();
        let tx3 = tm.begin();

        assert_eq!(tx1.id(), Some(1));
        assert_eq!(tx2.id(), Some(2));
        assert_eq!(tx3.id(), Some(3));
        assert!(!tx1.is_auto_commit());
        assert_eq!(tm.current_tx_id(), 4);
    }

    #[test]
    fn test_clone_shares_counter() {
        let tm1 = TransactionManager::new();
        let tm2 = tm1.clone();

        let tx1 = tm1.begin();
        let tx2 = tm2.begin();

        assert_eq!(tx1.id(), Some(1));
        assert_eq!(tx2.id(), Some(2));
        assert_eq!(tm1.current_tx_id(), 3);
        assert_eq!(tm2.current_tx_id(), 3);
    }
}
