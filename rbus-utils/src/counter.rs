use std::fmt;
use std::sync::atomic::{AtomicIsize, Ordering};

use serde_json::json;

type Current = AtomicIsize;
type Max = AtomicIsize;

/// Gauge-style counter that also remembers its high-water mark.
///
/// Shared between tasks by reference (usually inside an `Arc`); every
/// operation is a single atomic.
pub struct Counter(Current, Max);

impl Clone for Counter {
    fn clone(&self) -> Self {
        Counter(
            AtomicIsize::new(self.0.load(Ordering::SeqCst)),
            AtomicIsize::new(self.1.load(Ordering::SeqCst)),
        )
    }
}

impl fmt::Debug for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, r#"{{ "count":{}, "max":{} }}"#, self.count(), self.max())
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

impl Counter {
    #[inline]
    pub fn new() -> Self {
        Counter(AtomicIsize::new(0), AtomicIsize::new(0))
    }

    #[inline]
    pub fn inc(&self) {
        let prev = self.0.fetch_add(1, Ordering::SeqCst);
        self.1.fetch_max(prev + 1, Ordering::SeqCst);
    }

    #[inline]
    pub fn dec(&self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }

    #[inline]
    pub fn count(&self) -> isize {
        self.0.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn max(&self) -> isize {
        self.1.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "count": self.count(),
            "max": self.max()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_keeps_high_water_mark() {
        let c = Counter::new();
        for _ in 0..5 {
            c.inc();
        }
        for _ in 0..3 {
            c.dec();
        }
        assert_eq!(c.count(), 2);
        assert_eq!(c.max(), 5);
        assert_eq!(c.to_json(), json!({"count": 2, "max": 5}));
    }
}
