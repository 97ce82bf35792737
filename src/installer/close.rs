use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub type CloseHandler = Arc<dyn Fn() + Send + Sync>;

const MIN_DEBOUNCE: Duration = Duration::from_millis(100);

/// Dismissal callbacks keyed by UI context, fired together by `handle_close`.
///
/// Firing is debounced on a wall-clock window: a second `handle_close` inside
/// the window is dropped even if it came from a different surface.
pub struct CloseHandlers {
    handlers: Mutex<BTreeMap<String, CloseHandler>>,
    last_fired: Mutex<Option<Instant>>,
    debounce: Duration,
}

impl CloseHandlers {
    pub fn new(debounce: Duration) -> Self {
        Self {
            handlers: Mutex::new(BTreeMap::new()),
            last_fired: Mutex::new(None),
            debounce: debounce.max(MIN_DEBOUNCE),
        }
    }

    pub fn debounce(&self) -> Duration {
        self.debounce
    }

    /// Replaces any handler already registered under `key`.
    pub fn register(&self, key: impl Into<String>, handler: CloseHandler) {
        let mut handlers = match self.handlers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        handlers.insert(key.into(), handler);
    }

    pub fn unregister(&self, key: &str) -> bool {
        let mut handlers = match self.handlers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        handlers.remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        match self.handlers.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invokes every registered handler once. Returns how many ran; zero when
    /// the call fell inside the debounce window.
    pub fn handle_close(&self) -> usize {
        {
            let mut last_fired = match self.last_fired.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let now = Instant::now();
            if let Some(previous) = *last_fired {
                if now.duration_since(previous) < self.debounce {
                    tracing::debug!("close gesture debounced");
                    return 0;
                }
            }
            *last_fired = Some(now);
        }

        // Handlers may re-register; call them without holding the lock.
        let handlers = match self.handlers.lock() {
            Ok(guard) => guard.values().cloned().collect::<Vec<_>>(),
            Err(poisoned) => poisoned.into_inner().values().cloned().collect::<Vec<_>>(),
        };
        for handler in &handlers {
            handler();
        }
        handlers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::CloseHandlers;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn counter(handlers: &CloseHandlers, key: &str) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let hits = count.clone();
        handlers.register(key, Arc::new(move || {
            hits.fetch_add(1, Ordering::SeqCst);
        }));
        count
    }

    #[test]
    fn duplicate_gestures_inside_window_are_dropped() {
        let handlers = CloseHandlers::new(Duration::from_millis(150));
        let dialog = counter(&handlers, "dialog");

        assert_eq!(handlers.handle_close(), 1);
        assert_eq!(handlers.handle_close(), 0);
        assert_eq!(dialog.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn fires_again_after_window() {
        let handlers = CloseHandlers::new(Duration::from_millis(100));
        let dialog = counter(&handlers, "dialog");

        handlers.handle_close();
        std::thread::sleep(Duration::from_millis(130));
        handlers.handle_close();
        assert_eq!(dialog.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn window_has_a_floor_and_keys_replace() {
        let handlers = CloseHandlers::new(Duration::from_millis(10));
        assert_eq!(handlers.debounce(), Duration::from_millis(100));

        let first = counter(&handlers, "panel");
        let second = counter(&handlers, "panel");
        assert_eq!(handlers.len(), 1);
        handlers.handle_close();
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);

        assert!(handlers.unregister("panel"));
        assert!(handlers.is_empty());
    }
}
