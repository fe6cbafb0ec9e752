use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::Mutex;

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Registry<T> {
    next_id: u64,
    listeners: Vec<(u64, Listener<T>)>,
}

/// Fan-out bus for session notifications.
///
/// Listeners stay registered for as long as their [`Subscription`] guard is
/// alive. Emission snapshots the listener list first, so a callback may
/// subscribe or drop guards without deadlocking the bus.
pub struct EventBus<T> {
    registry: Arc<Mutex<Registry<T>>>,
}

impl<T> EventBus<T> {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                next_id: 0,
                listeners: Vec::new(),
            })),
        }
    }

    /// Register a listener and hand back the guard that keeps it alive.
    pub fn subscribe<F>(&self, listener: F) -> Subscription<T>
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let mut registry = self.registry.lock();
        let id = registry.next_id;
        registry.next_id += 1;
        registry.listeners.push((id, Arc::new(listener)));
        Subscription {
            registry: Arc::clone(&self.registry),
            id: Some(id),
            _marker: PhantomData,
        }
    }

    pub fn emit(&self, event: &T) {
        let snapshot: Vec<Listener<T>> = {
            let registry = self.registry.lock();
            registry
                .listeners
                .iter()
                .map(|(_, listener)| Arc::clone(listener))
                .collect()
        };
        for listener in snapshot {
            listener(event);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.registry.lock().listeners.len()
    }
}

impl<T> Clone for EventBus<T> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
        }
    }
}

impl<T> Default for EventBus<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Keeps one listener registered; dropping it unsubscribes.
pub struct Subscription<T> {
    registry: Arc<Mutex<Registry<T>>>,
    id: Option<u64>,
    _marker: PhantomData<fn(&T)>,
}

impl<T> Subscription<T> {
    /// Leave the listener registered for the lifetime of the bus.
    pub fn detach(mut self) {
        self.id = None;
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            let mut registry = self.registry.lock();
            registry.listeners.retain(|(listener_id, _)| *listener_id != id);
        }
    }
}
