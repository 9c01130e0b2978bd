//! Process-local observable state.
//!
//! Nothing here is persisted or synced, and mutators never read it. The
//! durable side of playback (current episode, progress, speed, volume)
//! lives in the cache.

pub mod player;

use tokio::sync::watch;

pub use player::{Player, PlayerState};

/// A value that notifies subscribers only when it actually changes.
pub struct Observable<T> {
    tx: watch::Sender<T>,
}

impl<T: Clone + PartialEq> Observable<T> {
    pub fn new(value: T) -> Self {
        let (tx, _) = watch::channel(value);
        Self { tx }
    }

    pub fn get(&self) -> T {
        self.tx.borrow().clone()
    }

    /// Returns whether the value changed.
    pub fn set(&self, value: T) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == value {
                false
            } else {
                *current = value;
                true
            }
        })
    }

    pub fn update(&self, f: impl FnOnce(&mut T)) -> bool {
        let mut next = self.get();
        f(&mut next);
        self.set(next)
    }

    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.tx.subscribe()
    }
}

impl<T: Clone + PartialEq + Default> Default for Observable<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unchanged_set_does_not_notify() {
        let value = Observable::new(1);
        let mut rx = value.subscribe();
        assert!(!value.set(1));
        assert!(!rx.has_changed().unwrap());

        assert!(value.set(2));
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), 2);
    }

    #[test]
    fn test_update() {
        let value: Observable<Vec<u8>> = Observable::default();
        assert!(value.update(|v| v.push(3)));
        assert!(!value.update(|_| {}));
        assert_eq!(value.get(), vec![3]);
    }
}
