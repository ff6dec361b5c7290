//! Single-slot, overwrite-on-full hand-off between the frame pipeline and
//! its consumers. Neither side ever waits for the other.

use std::sync::Mutex;

pub struct FrameSlot<T> {
    slot: Mutex<Option<T>>,
}

impl<T> FrameSlot<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    /// Store `value`, discarding any unconsumed one. Returns `true` if a
    /// previous value was dropped.
    pub fn publish(&self, value: T) -> bool {
        self.lock().replace(value).is_some()
    }

    /// Take the latest value, or `None` if nothing new arrived.
    pub fn take(&self) -> Option<T> {
        self.lock().take()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<T>> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<T> Default for FrameSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_take_empty() {
        let slot: FrameSlot<u32> = FrameSlot::new();
        assert_eq!(slot.take(), None);
    }

    #[test]
    fn test_publish_overwrites() {
        let slot = FrameSlot::new();
        assert!(!slot.publish(1));
        assert!(slot.publish(2));
        assert_eq!(slot.take(), Some(2));
        assert_eq!(slot.take(), None);
    }

    #[test]
    fn test_consumer_sees_latest_only() {
        let slot = Arc::new(FrameSlot::new());
        let producer = {
            let slot = Arc::clone(&slot);
            std::thread::spawn(move || {
                for i in 0..1000u32 {
                    slot.publish(i);
                }
            })
        };
        let mut last = None;
        while !producer.is_finished() {
            if let Some(v) = slot.take() {
                assert!(last.map_or(true, |l| v > l), "went backwards");
                last = Some(v);
            }
        }
        producer.join().unwrap();
        if let Some(v) = slot.take() {
            last = Some(v);
        }
        assert_eq!(last, Some(999));
    }
}
