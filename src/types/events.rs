use std::sync::Arc;
use tokio::sync::broadcast;

pub use ringcore::types::events::*;

// The size of the broadcast channel buffer.
const CHANNEL_CAPACITY: usize = 100;

// Macro to generate EventBus fields and constructor
macro_rules! define_event_bus {
    ($(($field:ident, $type:ty)),* $(,)?) => {
        /// Typed event bus with a separate broadcast channel per event type.
        /// Subscribers pick exactly the events they care about; dispatching
        /// to a channel with no subscribers is a no-op.
        #[derive(Debug)]
        pub struct EventBus {
            $(
                pub $field: broadcast::Sender<$type>,
            )*
        }

        impl EventBus {
            pub fn new() -> Self {
                Self {
                    $(
                        $field: broadcast::channel(CHANNEL_CAPACITY).0,
                    )*
                }
            }
        }
    };
}

define_event_bus! {
    // Connection events
    (connected, Arc<Connected>),
    (disconnected, Arc<Disconnected>),

    // Call events
    (incoming_call, Arc<IncomingCall>),
    (call_connected, Arc<CallConnected>),
    (call_rejected, Arc<CallRejected>),
    (call_ended, Arc<CallEnded>),
    (call_failed, Arc<CallFailed>),

    // Presence events
    (presence, Arc<PresenceUpdate>),
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
