use karta_core::events::{Event, EventKind};
use karta_core::results::TestIncident;
use parking_lot::{Mutex, RwLock};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crate::error::EventBusError;
use crate::listener::TestEventListener;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusState {
    Created,
    Started,
    Closed,
}

/// Synchronous fan-out of lifecycle events to registered listeners.
pub struct EventBus {
    listeners: RwLock<Vec<Arc<dyn TestEventListener>>>,
    state: Mutex<BusState>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
            state: Mutex::new(BusState::Created),
        }
    }

    pub fn state(&self) -> BusState {
        *self.state.lock()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Registers a listener. Listeners added after `start` are started
    /// immediately and see every subsequent event; nothing is replayed.
    pub fn add_listener(&self, listener: Arc<dyn TestEventListener>) {
        // held across the push: a concurrent `start` sees this listener or has already finished
        let state = self.state.lock();
        if *state == BusState::Started {
            start_listener(listener.as_ref());
        }
        tracing::debug!(listener = listener.name(), "event listener registered");
        self.listeners.write().push(listener);
        drop(state);
    }

    pub fn start(&self) {
        let mut state = self.state.lock();
        if *state != BusState::Created {
            return;
        }
        for listener in self.snapshot() {
            start_listener(listener.as_ref());
        }
        *state = BusState::Started;
    }

    /// Delivers `event` to every listener in registration order before returning.
    ///
    /// Listener errors and panics are logged and never reach the caller.
    pub fn raise_event(&self, event: Event) -> Result<(), EventBusError> {
        if self.state() == BusState::Closed {
            return Err(EventBusError::Closed {
                run_name: event.run_name,
                kind: event.kind.as_str(),
            });
        }

        for listener in self.snapshot() {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| listener.on_event(&event)));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(err)) => tracing::warn!(
                    listener = listener.name(),
                    event = event.kind.as_str(),
                    error = %err,
                    "event listener failed"
                ),
                Err(_) => tracing::warn!(
                    listener = listener.name(),
                    event = event.kind.as_str(),
                    "event listener panicked"
                ),
            }
        }
        Ok(())
    }

    pub fn raise_incident(
        &self,
        run_name: impl Into<String>,
        incident: TestIncident,
    ) -> Result<(), EventBusError> {
        self.raise_event(Event::new(run_name, EventKind::Incident { incident }))
    }

    /// Closes every listener. Later `raise_event` calls fail with [`EventBusError::Closed`].
    pub fn close(&self) {
        let mut state = self.state.lock();
        if *state == BusState::Closed {
            return;
        }
        *state = BusState::Closed;
        drop(state);

        for listener in self.snapshot() {
            if let Err(err) = listener.close() {
                tracing::warn!(listener = listener.name(), error = %err, "event listener close failed");
            }
        }
    }

    fn snapshot(&self) -> Vec<Arc<dyn TestEventListener>> {
        self.listeners.read().clone()
    }
}

fn start_listener(listener: &dyn TestEventListener) {
    if let Err(err) = listener.start() {
        tracing::warn!(listener = listener.name(), error = %err, "event listener start failed");
    }
}
