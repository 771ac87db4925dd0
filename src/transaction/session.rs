use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, warn};
use crate::backend::Connection;
use crate::core::{DriverError, StoreError};

/// Connection bound to an explicit transaction, shared by the operations
/// running inside it
pub type SharedConnection = Arc<Mutex<Box<dyn Connection>>>;

struct Binding {
    connection: SharedConnection,
    /// Session hook run before the connection is closed
    close_sql: Option<String>,
}

/// Transaction handle
///
/// An auto-commit transaction never holds a connection: each operation opens
/// and closes its own. An explicit transaction binds one connection on first
/// use and keeps it until `close`.
pub struct Transaction {
    /// `None` for auto-commit
    id: Option<u64>,
    binding: Mutex<Option<Binding>>,
    /// Lock authorizations held by this transaction
    authorizations: Mutex<HashSet<String>>,
}

impl Transaction {
    /// Pseudo-transaction for operations outside any explicit transaction
    #[must_use]
    pub fn auto_commit() -> Self {
        Self {
            id: None,
            binding: Mutex::new(None),
            authorizations: Mutex::new(HashSet::new()),
        }
    }

    pub(crate) fn explicit(id: u64) -> Self {
        Self {
            id: Some(id),
            binding: Mutex::new(None),
            authorizations: Mutex::new(HashSet::new()),
        }
    }

    #[must_use]
    pub const fn id(&self) -> Option<u64> {
        self.id
    }

    #[must_use]
    pub const fn is_auto_commit(&self) -> bool {
        self.id.is_none()
    }

    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.binding.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    /// The bound connection, opening and binding one with `open` on first use
    pub fn bind_with(
        &self,
        open: impl FnOnce() -> Result<Box<dyn Connection>, StoreError>,
        close_sql: Option<String>,
    ) -> Result<SharedConnection, StoreError> {
        if self.is_auto_commit() {
            return Err(StoreError::IllegalState(
                "auto-commit transactions do not bind connections".to_string(),
            ));
        }
        let mut binding = self.binding.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(b) = binding.as_ref() {
            return Ok(Arc::clone(&b.connection));
        }
        let mut conn = open()?;
        conn.set_auto_commit(false)?;
        debug!(tx = ?self.id, "bound connection to transaction");
        let connection = Arc::new(Mutex::new(conn));
        *binding = Some(Binding {
            connection: Arc::clone(&connection),
            close_sql,
        });
        Ok(connection)
    }

    pub fn add_authorization(&self, authorization: impl Into<String>) {
        self.authorizations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(authorization.into());
    }

    #[must_use]
    pub fn has_authorization(&self, authorization: &str) -> bool {
        self.authorizations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(authorization)
    }

    #[must_use]
    pub fn authorizations(&self) -> Vec<String> {
        self.authorizations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Commits the bound connection; a transaction that never touched the
    /// database has nothing to commit
    pub fn commit(&self) -> Result<(), StoreError> {
        self.with_connection(|conn| conn.commit())?;
        debug!(tx = ?self.id, "committed");
        Ok(())
    }

    pub fn rollback(&self) -> Result<(), StoreError> {
        self.with_connection(|conn| conn.rollback())?;
        debug!(tx = ?self.id, "rolled back");
        Ok(())
    }

    /// Releases the bound connection. Failures are logged, never returned,
    /// and a second close is a no-op.
    pub fn close(&self) {
        let binding = self.binding.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(binding) = binding else {
            return;
        };
        let mut conn = binding.connection.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(sql) = &binding.close_sql {
            match conn.prepare(sql) {
                Ok(mut stmt) => {
                    if let Err(e) = stmt.execute(&[]) {
                        warn!(error = %e, "session close hook failed");
                    }
                    if let Err(e) = stmt.close() {
                        warn!(error = %e, "failed to close statement");
                    }
                }
                Err(e) => warn!(error = %e, "session close hook failed"),
            }
        }
        if let Err(e) = conn.close() {
            warn!(error = %e, tx = ?self.id, "failed to close transaction connection");
        }
        debug!(tx = ?self.id, "released transaction connection");
    }

    fn with_connection(
        &self,
        f: impl FnOnce(&mut dyn Connection) -> Result<(), DriverError>,
    ) -> Result<(), StoreError> {
        let binding = self.binding.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(b) = binding.as_ref() {
            let mut conn = b.connection.lock().unwrap_or_else(PoisonError::into_inner);
            f(conn.as_mut())?;
        }
        Ok(())
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("bound", &self.is_bound())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::recording::Call;
    use crate::backend::{ConnectionProvider, RecordingBackend};

    #[test]
    fn test_auto_commit_never_binds() {
        let tx = Transaction::auto_commit();
        assert!(tx.is_auto_commit());
        let backend = RecordingBackend::new();
        assert!(matches!(
            tx.bind_with(|| Ok(backend.connect()?), None),
            Err(StoreError::IllegalState(_))
        ));
    }

    #[test]
    fn test_binds_once_and_closes_once() {
        let backend = RecordingBackend::new();
        let tx = Transaction::explicit(1);
        let a = tx.bind_with(|| Ok(backend.connect()?), Some("RESET ROLE".to_string())).unwrap();
        let b = tx.bind_with(|| Ok(backend.connect()?), None).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        drop((a, b));
        tx.commit().unwrap();
        tx.close();
        tx.close();
        let calls = backend.calls();
        assert_eq!(calls.iter().filter(|c| matches!(c, Call::Connect)).count(), 1);
        assert_eq!(calls.iter().filter(|c| matches!(c, Call::Close)).count(), 1);
        assert!(calls.contains(&Call::AutoCommit(false)));
        assert!(calls.contains(&Call::Commit));
        assert!(backend.statements().iter().any(|s| s == "RESET ROLE"));
        assert_eq!(backend.open_connections(), 0);
    }

    #[test]
    fn test_authorizations() {
        let tx = Transaction::explicit(2);
        tx.add_authorization("abc");
        assert!(tx.has_authorization("abc"));
        assert!(!tx.has_authorization("xyz"));
        assert_eq!(tx.authorizations(), vec!["abc".to_string()]);
    }
}
