use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex, Weak,
};

use crate::utils::lock;

pub type SubscriptionId = u64;

type Callback<T> = Box<dyn Fn(&T) + Send + Sync + 'static>;

/// An explicit list of change listeners.
///
/// Callbacks run synchronously on the notifying thread, in subscription order,
/// and must not subscribe, unsubscribe or mutate the owner of this list.
pub struct Subscribers<T> {
    next_id: AtomicU64,
    callbacks: Mutex<Vec<(SubscriptionId, Callback<T>)>>,
}

impl<T> Default for Subscribers<T> {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            callbacks: Mutex::new(Vec::new()),
        }
    }
}

impl<T> Subscribers<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.callbacks).push((id, Box::new(callback)));
        id
    }

    /// Returns `false` when `id` was not (or no longer) subscribed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut callbacks = lock(&self.callbacks);
        let before = callbacks.len();
        callbacks.retain(|(existing, _)| *existing != id);
        callbacks.len() != before
    }

    pub fn notify(&self, value: &T) {
        for (_, callback) in lock(&self.callbacks).iter() {
            callback(value);
        }
    }

    pub fn clear(&self) {
        lock(&self.callbacks).clear();
    }

    pub fn len(&self) -> usize {
        lock(&self.callbacks).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handle returned by `on_*_changed` methods.
pub struct Subscription<T> {
    id: SubscriptionId,
    subscribers: Weak<Subscribers<T>>,
}

impl<T> Subscription<T> {
    pub(crate) fn new(id: SubscriptionId, subscribers: &Arc<Subscribers<T>>) -> Self {
        Self {
            id,
            subscribers: Arc::downgrade(subscribers),
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Safe to call any number of times, and after the owner is gone.
    pub fn unsubscribe(&self) {
        if let Some(subscribers) = self.subscribers.upgrade() {
            subscribers.unsubscribe(self.id);
        }
    }
}
