use async_trait::async_trait;
use ringcore::types::{CallRecord, Contact, Msisdn};

use super::error::Result;

/// CRUD over a user's saved contacts.
#[async_trait]
pub trait ContactStore: Send + Sync {
    async fn add_contact(&self, owner: &Msisdn, name: &str, mobile: &Msisdn) -> Result<Contact>;
    async fn contacts(&self, owner: &Msisdn) -> Result<Vec<Contact>>;
    /// Returns false if no contact with that id belongs to `owner`.
    async fn delete_contact(&self, owner: &Msisdn, id: u64) -> Result<bool>;
}

/// Append-only call history per user, listed newest first.
#[async_trait]
pub trait CallLogStore: Send + Sync {
    async fn append_call(&self, owner: &Msisdn, record: CallRecord) -> Result<()>;
    async fn call_history(&self, owner: &Msisdn) -> Result<Vec<CallRecord>>;
}

// A complete storage backend.
pub trait Backend: ContactStore + CallLogStore {}

// Blanket implementation for any type that implements both traits
impl<T> Backend for T where T: ContactStore + CallLogStore {}
