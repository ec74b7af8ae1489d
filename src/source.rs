use crate::event::ChangeEvent;

/// Called by a change source for each event delivered to a subscription.
pub type ChangeHandler = Box<dyn FnMut(ChangeEvent) + Send + 'static>;

/// Identifies one active subscription on a ChangeSource.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscriptionHandle {
    pub(crate) id: String,
}

/// A push source of per-record change events, scoped to one owner and one
/// collection per subscription. ChangeHub is the in-process implementation;
/// a network-backed source implements the same contract.
///
/// Sources are expected to filter events by owner before delivery. They may
/// deliver the same logical change more than once, so subscribers must cope
/// with duplicates.
pub trait ChangeSource: Send + Sync {
    fn subscribe(
        &self,
        owner_id: &str,
        collection: &str,
        handler: ChangeHandler,
    ) -> SubscriptionHandle;

    fn unsubscribe(&self, handle: SubscriptionHandle);
}
