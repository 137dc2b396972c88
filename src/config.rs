use ringcore::types::Msisdn;

use crate::calls::CallManagerConfig;

/// Client configuration. The identity is the authenticated user's mobile
/// number; session management itself lives outside this crate.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub identity: Msisdn,
    /// `ws://host:port` endpoint of the signaling relay.
    pub relay_url: String,
    pub calls: CallManagerConfig,
}

impl ClientConfig {
    pub fn new(identity: Msisdn, relay_url: impl Into<String>) -> Self {
        Self {
            identity,
            relay_url: relay_url.into(),
            calls: CallManagerConfig::default(),
        }
    }
}
