pub mod call;
pub mod events;
pub mod identity;
pub mod presence;
pub mod user;

pub use call::{CallDirection, CallEndReason, CallFailReason, CallLogStatus, CallRecord};
pub use identity::Msisdn;
pub use presence::Presence;
pub use user::Contact;
