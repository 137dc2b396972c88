//! Persistence for contacts and call history.
//!
//! The client only talks to the [`traits::Backend`] supertrait; backends are
//! pluggable. [`memory::MemoryStore`] is the in-process implementation used
//! by tests and single-run deployments.

pub mod error;
pub mod memory;
pub mod traits;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use traits::{Backend, CallLogStore, ContactStore};
