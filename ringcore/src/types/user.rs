use serde::{Deserialize, Serialize};

use super::identity::Msisdn;

/// A saved contact, owned by one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub id: u64,
    pub name: String,
    pub mobile: Msisdn,
}
