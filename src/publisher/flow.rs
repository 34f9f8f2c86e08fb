use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::Notify;

/// Throttle signal from the publisher to the feed reader.
///
/// Engages when the spool depth rises above `high_water` and releases only
/// once it falls below `low_water`.
pub struct FlowControl {
    throttled: AtomicBool,
    notify: Notify,
    high_water: usize,
    low_water: usize,
    activations: AtomicU64,
}

impl FlowControl {
    pub fn new(high_water: usize, low_water: usize) -> Self {
        Self {
            throttled: AtomicBool::new(false),
            notify: Notify::new(),
            high_water,
            low_water: low_water.min(high_water),
            activations: AtomicU64::new(0),
        }
    }

    /// Re-evaluate against the current depth; returns whether intake is throttled.
    pub fn update(&self, depth: usize) -> bool {
        let throttled = self.throttled.load(Ordering::SeqCst);

        if !throttled && depth > self.high_water {
            self.throttled.store(true, Ordering::SeqCst);
            self.activations.fetch_add(1, Ordering::Relaxed);
            log::warn!(
                "🚦 Throttling feed intake: spool depth {} above high-water {}",
                depth,
                self.high_water
            );
            return true;
        }

        if throttled && depth < self.low_water {
            self.throttled.store(false, Ordering::SeqCst);
            self.notify.notify_waiters();
            log::info!(
                "✅ Feed intake resumed: spool depth {} below low-water {}",
                depth,
                self.low_water
            );
            return false;
        }

        throttled
    }

    pub fn is_throttled(&self) -> bool {
        self.throttled.load(Ordering::SeqCst)
    }

    pub fn activations(&self) -> u64 {
        self.activations.load(Ordering::Relaxed)
    }

    /// Resolves immediately unless throttled, otherwise on release.
    pub async fn wait_ready(&self) {
        loop {
            let released = self.notify.notified();
            if !self.is_throttled() {
                return;
            }
            released.await;
        }
    }
}
