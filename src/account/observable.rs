//! Typed observable state container
//!
//! Readers always see a complete snapshot: [`ObservableStore::update`] applies
//! its closure to the value in place and publishes once the closure returns.

use tokio::sync::watch;

#[derive(Debug)]
pub struct ObservableStore<T> {
    tx: watch::Sender<T>,
}

impl<T: Clone> ObservableStore<T> {
    pub fn new(initial: T) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    /// Copy of the current state
    pub fn get(&self) -> T {
        self.tx.borrow().clone()
    }

    /// Read the current state without copying it
    pub fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.tx.borrow())
    }

    /// Apply `patch` atomically and notify subscribers
    pub fn update(&self, patch: impl FnOnce(&mut T)) {
        self.tx.send_modify(patch);
    }

    /// Replace the whole state
    pub fn set(&self, value: T) {
        self.tx.send_replace(value);
    }

    /// Receiver of state changes; dropping it unsubscribes
    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.tx.subscribe()
    }
}
