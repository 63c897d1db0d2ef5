//! Keyed callback registries backing every subscribable piece of state.
//!
//! Callbacks run on the thread that produced the change, after the registry
//! lock has been released, so a callback may freely read back into the
//! component that notified it.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::error;

use crate::{lock, AppError};

type Callback<V> = Arc<dyn Fn(&V) + Send + Sync>;

struct Registry<K, V> {
    next_id: u64,
    by_key: HashMap<K, Vec<(u64, Callback<V>)>>,
}

impl<K, V> Default for Registry<K, V> {
    fn default() -> Self {
        Self {
            next_id: 0,
            by_key: HashMap::new(),
        }
    }
}

pub struct Subscribers<K, V> {
    inner: Arc<Mutex<Registry<K, V>>>,
}

impl<K, V> Clone for Subscribers<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> Default for Subscribers<K, V> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Registry::default())),
        }
    }
}

impl<K, V> fmt::Debug for Subscribers<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscribers")
            .field("count", &self.len())
            .finish()
    }
}

impl<K, V> Subscribers<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: 'static,
{
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, key: K, callback: F) -> Subscription
    where
        F: Fn(&V) + Send + Sync + 'static,
    {
        let id = {
            let mut registry = lock(&self.inner);
            let id = registry.next_id;
            registry.next_id += 1;
            registry
                .by_key
                .entry(key.clone())
                .or_default()
                .push((id, Arc::new(callback)));
            id
        };

        let weak = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                let mut registry = lock(&inner);
                if let Some(callbacks) = registry.by_key.get_mut(&key) {
                    callbacks.retain(|(existing, _)| *existing != id);
                    if callbacks.is_empty() {
                        registry.by_key.remove(&key);
                    }
                }
            }
        })
    }

    /// Returns the number of callbacks invoked.
    pub fn notify(&self, key: &K, value: &V) -> usize {
        let callbacks: Vec<Callback<V>> = {
            let registry = lock(&self.inner);
            match registry.by_key.get(key) {
                Some(callbacks) => callbacks.iter().map(|(_, cb)| Arc::clone(cb)).collect(),
                None => return 0,
            }
        };
        for callback in &callbacks {
            callback(value);
        }
        callbacks.len()
    }

    #[must_use]
    pub fn has_subscribers(&self, key: &K) -> bool {
        lock(&self.inner).by_key.contains_key(key)
    }

    pub fn clear(&self) {
        lock(&self.inner).by_key.clear();
    }
}

impl<K, V> Subscribers<K, V> {
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.inner).by_key.values().map(Vec::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handle returned by every `subscribe` call.
///
/// Dropping the handle keeps the callback registered; call
/// [`Subscription::unsubscribe`] to remove it.
#[must_use = "keep the subscription to be able to unsubscribe"]
pub struct Subscription {
    remove: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    fn new(remove: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            remove: Some(Box::new(remove)),
        }
    }

    pub fn unsubscribe(mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.remove.is_some())
            .finish()
    }
}

/// Process-wide "session expired" signal. Fires at most once per session.
#[derive(Clone, Default)]
pub struct AuthSignal {
    raised: Arc<AtomicBool>,
    subscribers: Subscribers<(), AppError>,
}

impl fmt::Debug for AuthSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthSignal")
            .field("raised", &self.is_raised())
            .finish()
    }
}

impl AuthSignal {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&AppError) + Send + Sync + 'static,
    {
        self.subscribers.subscribe((), callback)
    }

    /// Returns `true` if this call raised the signal.
    pub fn raise(&self, cause: &AppError) -> bool {
        if self.raised.swap(true, Ordering::SeqCst) {
            return false;
        }
        error!(code = cause.code(), message = %cause.message, "session expired, forcing logout");
        self.subscribers.notify(&(), cause);
        true
    }

    #[must_use]
    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::SeqCst)
    }

    /// Re-arms the signal for a new session.
    pub fn reset(&self) {
        self.raised.store(false, Ordering::SeqCst);
    }
}
