use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};

use anyhow::Result;

use crate::{
    event::{ChangeEvent, ChangeType, PendingChange},
    source::{ChangeSource, SubscriptionHandle},
};

/// Minimum spacing between flushes while changes are pending.
pub const DEFAULT_THROTTLE: Duration = Duration::from_millis(2000);

/// Receives each flushed batch in first-buffered order. Called at most once
/// per throttle interval while changes are pending, and once more on stop()
/// if anything is still buffered.
pub type BatchHandler = Box<dyn Fn(Vec<PendingChange>) + Send + Sync + 'static>;

/// Coalesces a bursty stream of per-record change events into infrequent
/// batched callbacks. Events are merged by record id so each batch carries
/// only the net effect for every record, and a one-shot timer bounds both
/// callback frequency and worst-case delivery latency to the throttle
/// interval.
pub struct ChangeCoalescer {
    source: Arc<dyn ChangeSource>,
    collection: String,
    enabled: bool,
    shared: Arc<Shared>,
}

struct Shared {
    throttle: Duration,
    on_batch: BatchHandler,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    owner_id: Option<String>,
    subscription: Option<SubscriptionHandle>,
    pending: HashMap<String, PendingChange>,
    order: Vec<String>,
    // Bumped on every flush and cancellation. A sleeping timer thread whose
    // epoch no longer matches does nothing when it wakes.
    epoch: u64,
    timer_armed: bool,
}

impl State {
    /// Merge one event into the buffer, keyed by record id. The buffer holds
    /// at most one entry per id: the net effect of everything seen for that
    /// record this window.
    fn merge(&mut self, event: ChangeEvent) {
        let Some(id) = event.record_id().map(|s| s.to_string()) else {
            log::warn!(
                "change event for '{}' has no record id, dropping",
                event.collection
            );
            return;
        };
        let next = PendingChange::from(event);
        let buffered = self.pending.get(&id).map(|p| p.change_type);
        match (buffered, next.change_type) {
            (None, _) => {
                self.order.push(id.clone());
                self.pending.insert(id, next);
            }
            // Created and destroyed within one window: nets out to nothing.
            (Some(ChangeType::Insert), ChangeType::Delete) => {
                self.pending.remove(&id);
                self.order.retain(|buffered_id| buffered_id != &id);
            }
            // Still a creation from the consumer's point of view; keep the
            // freshest snapshot.
            (Some(ChangeType::Insert), _) => {
                if let Some(prev) = self.pending.get_mut(&id) {
                    prev.record = next.record;
                }
            }
            // The record predates this window, so only the latest mutation
            // matters. A Delete replaces rather than drops, since the
            // consumer must still learn the record is gone.
            (Some(_), _) => {
                self.pending.insert(id, next);
            }
        }
    }

    fn take_batch(&mut self) -> Vec<PendingChange> {
        let order = std::mem::take(&mut self.order);
        order
            .into_iter()
            .filter_map(|id| self.pending.remove(&id))
            .collect()
    }
}

impl Shared {
    fn on_event(shared: &Arc<Self>, event: ChangeEvent) {
        let timer = {
            let Ok(mut state) = shared.state.lock() else {
                return;
            };
            // Events can trail in from the delivery thread after stop()
            let Some(owner_id) = state.owner_id.clone() else {
                return;
            };
            match event.owner_id() {
                Some(owner) if owner == owner_id => {}
                _ => {
                    log::debug!(
                        "dropping change event for foreign owner on '{}'",
                        event.collection
                    );
                    return;
                }
            }
            state.merge(event);
            if !state.timer_armed && !state.pending.is_empty() {
                state.timer_armed = true;
                Some(state.epoch)
            } else {
                None
            }
        };
        // Arm a one-shot flush the moment the buffer goes non-empty. Later
        // events never extend it, which bounds delivery latency to one
        // throttle interval.
        if let Some(epoch) = timer {
            let shared = shared.clone();
            thread::spawn(move || {
                thread::sleep(shared.throttle);
                Shared::flush_if_current(&shared, epoch);
            });
        }
    }

    fn flush_if_current(shared: &Arc<Self>, epoch: u64) {
        let batch = {
            let Ok(mut state) = shared.state.lock() else {
                return;
            };
            if state.epoch != epoch {
                return; // cancelled by force_flush() or stop()
            }
            state.epoch += 1;
            state.timer_armed = false;
            state.take_batch()
        };
        Self::deliver(shared, batch);
    }

    fn flush_now(shared: &Arc<Self>) -> Result<()> {
        let batch = {
            let mut state = shared
                .state
                .lock()
                .map_err(|_| anyhow::anyhow!("Failed to acquire state lock"))?;
            state.epoch += 1;
            state.timer_armed = false;
            state.take_batch()
        };
        Self::deliver(shared, batch);
        Ok(())
    }

    /// Hands the batch to the consumer with the state lock released. The
    /// Insert+Delete no-op path can leave the buffer empty when the timer
    /// fires; an empty flush is skipped entirely.
    fn deliver(shared: &Arc<Self>, batch: Vec<PendingChange>) {
        if batch.is_empty() {
            return;
        }
        log::debug!("flushing {} coalesced changes", batch.len());
        (shared.on_batch)(batch);
    }
}

impl ChangeCoalescer {
    pub fn builder() -> ChangeCoalescerBuilder {
        ChangeCoalescerBuilder::default()
    }

    /// Open the subscription for `owner_id` and begin coalescing. Events
    /// published before start() returns are not buffered. Does nothing when
    /// the coalescer was built with enabled(false).
    pub fn start(&self, owner_id: &str) -> Result<()> {
        if owner_id.is_empty() {
            anyhow::bail!("owner_id must not be empty");
        }
        if !self.enabled {
            log::debug!(
                "coalescer for '{}' is disabled, not subscribing",
                self.collection
            );
            return Ok(());
        }
        {
            let mut state = self
                .shared
                .state
                .lock()
                .map_err(|_| anyhow::anyhow!("Failed to acquire state lock"))?;
            if state.owner_id.is_some() {
                anyhow::bail!("coalescer for '{}' is already started", self.collection);
            }
            state.owner_id = Some(owner_id.to_string());
        }
        let shared = self.shared.clone();
        let handle = self.source.subscribe(
            owner_id,
            &self.collection,
            Box::new(move |event| Shared::on_event(&shared, event)),
        );
        let mut state = self
            .shared
            .state
            .lock()
            .map_err(|_| anyhow::anyhow!("Failed to acquire state lock"))?;
        state.subscription = Some(handle);
        Ok(())
    }

    /// Number of distinct records currently buffered.
    pub fn pending_count(&self) -> Result<usize> {
        let state = self
            .shared
            .state
            .lock()
            .map_err(|_| anyhow::anyhow!("Failed to acquire state lock"))?;
        Ok(state.order.len())
    }

    /// Collapse the wait: cancel any armed timer and flush immediately.
    pub fn force_flush(&self) -> Result<()> {
        Shared::flush_now(&self.shared)
    }

    /// Cancel the timer, close the subscription, and flush whatever is still
    /// buffered so nothing is silently dropped. Calling stop() twice is a
    /// no-op the second time.
    pub fn stop(&self) -> Result<()> {
        let subscription = {
            let mut state = self
                .shared
                .state
                .lock()
                .map_err(|_| anyhow::anyhow!("Failed to acquire state lock"))?;
            state.owner_id = None;
            state.epoch += 1;
            state.timer_armed = false;
            state.subscription.take()
        };
        let Some(handle) = subscription else {
            return Ok(());
        };
        self.source.unsubscribe(handle);
        Shared::flush_now(&self.shared)
    }
}

impl Drop for ChangeCoalescer {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

/// Builds a ChangeCoalescer. The source, collection, and batch callback are
/// required; the throttle defaults to two seconds.
pub struct ChangeCoalescerBuilder {
    source: Option<Arc<dyn ChangeSource>>,
    collection: Option<String>,
    throttle: Duration,
    enabled: bool,
    on_batch: Option<BatchHandler>,
}

impl Default for ChangeCoalescerBuilder {
    fn default() -> Self {
        Self {
            source: None,
            collection: None,
            throttle: DEFAULT_THROTTLE,
            enabled: true,
            on_batch: None,
        }
    }
}

impl ChangeCoalescerBuilder {
    pub fn source(mut self, source: Arc<dyn ChangeSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn collection(mut self, collection: &str) -> Self {
        self.collection = Some(collection.to_string());
        self
    }

    pub fn throttle(mut self, throttle: Duration) -> Self {
        self.throttle = throttle;
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn on_batch(
        mut self,
        on_batch: impl Fn(Vec<PendingChange>) + Send + Sync + 'static,
    ) -> Self {
        self.on_batch = Some(Box::new(on_batch));
        self
    }

    pub fn build(self) -> Result<ChangeCoalescer> {
        let source = self
            .source
            .ok_or_else(|| anyhow::anyhow!("a change source is required"))?;
        let collection = self
            .collection
            .ok_or_else(|| anyhow::anyhow!("a collection is required"))?;
        let on_batch = self
            .on_batch
            .ok_or_else(|| anyhow::anyhow!("an on_batch callback is required"))?;
        if self.throttle.is_zero() {
            anyhow::bail!("throttle must be greater than zero");
        }
        Ok(ChangeCoalescer {
            source,
            collection,
            enabled: self.enabled,
            shared: Arc::new(Shared {
                throttle: self.throttle,
                on_batch,
                state: Mutex::new(State::default()),
            }),
        })
    }
}
