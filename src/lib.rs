pub mod coalescer;
pub mod event;
pub mod hub;
pub mod source;

pub use coalescer::{BatchHandler, ChangeCoalescer, ChangeCoalescerBuilder, DEFAULT_THROTTLE};
pub use event::{ChangeEvent, ChangeType, PendingChange};
pub use hub::ChangeHub;
pub use source::{ChangeHandler, ChangeSource, SubscriptionHandle};
