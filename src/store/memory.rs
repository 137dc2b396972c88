use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use ringcore::types::{CallRecord, Contact, Msisdn};
use tokio::sync::Mutex;

use super::error::Result;
use super::traits::{CallLogStore, ContactStore};

/// In-memory backend. Contents live as long as the process.
pub struct MemoryStore {
    contacts: Mutex<HashMap<Msisdn, Vec<Contact>>>,
    calls: Mutex<HashMap<Msisdn, Vec<CallRecord>>>,
    next_contact_id: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            contacts: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
            next_contact_id: AtomicU64::new(1),
        }
    }
}

#[async_trait]
impl ContactStore for MemoryStore {
    async fn add_contact(&self, owner: &Msisdn, name: &str, mobile: &Msisdn) -> Result<Contact> {
        let contact = Contact {
            id: self.next_contact_id.fetch_add(1, Ordering::SeqCst),
            name: name.to_string(),
            mobile: mobile.clone(),
        };
        self.contacts
            .lock()
            .await
            .entry(owner.clone())
            .or_default()
            .push(contact.clone());
        Ok(contact)
    }

    async fn contacts(&self, owner: &Msisdn) -> Result<Vec<Contact>> {
        Ok(self
            .contacts
            .lock()
            .await
            .get(owner)
            .cloned()
            .unwrap_or_default())
    }

    async fn delete_contact(&self, owner: &Msisdn, id: u64) -> Result<bool> {
        let mut contacts = self.contacts.lock().await;
        let Some(list) = contacts.get_mut(owner) else {
            return Ok(false);
        };
        let before = list.len();
        list.retain(|c| c.id != id);
        Ok(list.len() != before)
    }
}

#[async_trait]
impl CallLogStore for MemoryStore {
    async fn append_call(&self, owner: &Msisdn, record: CallRecord) -> Result<()> {
        self.calls
            .lock()
            .await
            .entry(owner.clone())
            .or_default()
            .push(record);
        Ok(())
    }

    async fn call_history(&self, owner: &Msisdn) -> Result<Vec<CallRecord>> {
        // Newest first, matching how the dashboard lists it.
        Ok(self
            .calls
            .lock()
            .await
            .get(owner)
            .map(|records| records.iter().rev().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use ringcore::types::CallLogStatus;

    fn owner() -> Msisdn {
        "+1000000".parse().unwrap()
    }

    fn peer() -> Msisdn {
        "+2000000".parse().unwrap()
    }

    #[tokio::test]
    async fn test_contact_workflow() {
        let store = MemoryStore::new();

        let a = store.add_contact(&owner(), "Ada", &peer()).await.unwrap();
        let b = store
            .add_contact(&owner(), "Grace", &"+3000000".parse().unwrap())
            .await
            .unwrap();
        assert_ne!(a.id, b.id);

        let listed = store.contacts(&owner()).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].name, "Ada");

        // Contacts are per-owner.
        assert!(store.contacts(&peer()).await.unwrap().is_empty());

        assert!(store.delete_contact(&owner(), a.id).await.unwrap());
        assert!(!store.delete_contact(&owner(), a.id).await.unwrap());
        assert_eq!(store.contacts(&owner()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_call_history_newest_first() {
        let store = MemoryStore::new();
        for (i, status) in [CallLogStatus::Outgoing, CallLogStatus::IncomingAnswered]
            .into_iter()
            .enumerate()
        {
            store
                .append_call(
                    &owner(),
                    CallRecord {
                        caller: owner(),
                        receiver: peer(),
                        status,
                        duration_secs: i as i64,
                        timestamp: Utc::now(),
                    },
                )
                .await
                .unwrap();
        }

        let history = store.call_history(&owner()).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].status, CallLogStatus::IncomingAnswered);
        assert_eq!(history[1].status, CallLogStatus::Outgoing);
        assert!(store.call_history(&peer()).await.unwrap().is_empty());
    }
}
