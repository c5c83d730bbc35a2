use std::sync::atomic::{AtomicIsize, Ordering};
use std::sync::Arc;

/// Timestamp in milliseconds since the Unix epoch.
pub type TimestampMillis = i64;

#[inline]
pub fn timestamp_millis() -> TimestampMillis {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).map(|t| t.as_millis() as i64).unwrap_or_default()
}

/// Thread-safe gauge tracking a current and a high-water value.
#[derive(Clone, Debug, Default)]
pub struct Counter(Arc<AtomicIsize>, Arc<AtomicIsize>);

impl Counter {
    #[inline]
    pub fn new() -> Self {
        Counter(Arc::new(AtomicIsize::new(0)), Arc::new(AtomicIsize::new(0)))
    }

    #[inline]
    pub fn inc(&self) {
        let curr = self.0.fetch_add(1, Ordering::SeqCst) + 1;
        self.1.fetch_max(curr, Ordering::SeqCst);
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
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter() {
        let c = Counter::new();
        c.inc();
        c.inc();
        c.dec();
        assert_eq!(c.count(), 1);
        assert_eq!(c.max(), 2);
    }
}
