// Transaction module - connection binding, id allocation and feature locks

mod session;
mod manager;
mod lock;

pub use session::{SharedConnection, Transaction};
pub use manager::TransactionManager;
pub use lock::{FeatureLock, LockManager};
