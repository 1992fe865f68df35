//! # Clique Coordination
//!
//! Coordination services over the cluster core: a Redlock-style distributed
//! lock manager holding quorum read/write locks across a key's replica set,
//! and a distributed semaphore manager routing every semaphore to its single
//! owner node. Both mirror their state into a durable [`Table`] when one is
//! configured, so holders and timers survive a restart.

// Module declarations
pub mod config;
pub mod error;
pub mod lock;
pub mod semaphore;
pub mod table;

// Re-exports
pub use config::{LockConfig, SemaphoreConfig};
pub use error::{CoordinationError, CoordinationResult};
pub use lock::{LockKind, LockManager};
pub use semaphore::{SemaphoreInfo, SemaphoreManager};
pub use table::{MemTable, Table, TableValue};
