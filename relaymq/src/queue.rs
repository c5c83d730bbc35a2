use crossbeam::queue::SegQueue;
use tokio::sync::Notify;

/// Bounded MPSC queue with non-blocking producers.
///
/// `push` never suspends; when the queue is full the value comes back to the
/// producer, which applies its overflow policy (drop for best-effort
/// delivery, session teardown for guaranteed delivery). The single consumer
/// side suspends in [`Queue::pop_wait`].
pub struct Queue<T> {
    cap: usize,
    inner: SegQueue<T>,
    notify: Notify,
}

impl<T> Drop for Queue<T> {
    #[inline]
    fn drop(&mut self) {
        log::debug!("Queue Drop ... len: {}", self.len());
    }
}

impl<T> Queue<T> {
    #[inline]
    pub fn new(cap: usize) -> Self {
        Self { cap, inner: SegQueue::new(), notify: Notify::new() }
    }

    #[inline]
    pub fn push(&self, v: T) -> Result<(), T> {
        if self.inner.len() >= self.cap {
            return Err(v);
        }
        self.inner.push(v);
        self.notify.notify_one();
        Ok(())
    }

    #[inline]
    pub fn pop(&self) -> Option<T> {
        self.inner.pop()
    }

    /// Take the next value, suspending until one is available.
    #[inline]
    pub async fn pop_wait(&self) -> T {
        loop {
            if let Some(v) = self.pop() {
                return v;
            }
            // a push between the failed pop and this await leaves a permit,
            // so the wakeup cannot be lost
            self.notify.notified().await;
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.cap
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_bounded_push() {
        let q = Queue::new(2);
        assert!(q.push(1).is_ok());
        assert!(q.push(2).is_ok());
        assert_eq!(q.push(3), Err(3));
        assert_eq!(q.pop(), Some(1));
        assert!(q.push(3).is_ok());
        assert_eq!(q.len(), 2);
    }

    #[tokio::test]
    async fn test_pop_wait() {
        let q = Arc::new(Queue::new(8));

        let q1 = q.clone();
        let consumer = tokio::spawn(async move { q1.pop_wait().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        q.push(42u64).unwrap();

        assert_eq!(consumer.await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_pop_wait_no_lost_wakeup() {
        let q = Arc::new(Queue::new(8));
        q.push(1u64).unwrap();
        // value pushed before any waiter existed is still received
        assert_eq!(q.pop_wait().await, 1);
    }
}
