use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;

use crate::error::QueueKind;
use crate::sync::lock;

struct QueueState<T> {
    items: VecDeque<T>,
    /// Items handed to a worker and not yet finished or re-appended
    leased: usize,
    closed: bool,
}

/// FIFO queue with a hard capacity shared by every worker of one pool
///
/// Items a worker is holding still count against the capacity until the
/// worker's [`Lease`] is dropped, so re-appending a deferred item can never
/// push the queue past its cap.
pub struct BoundedQueue<T> {
    kind: QueueKind,
    capacity: usize,
    state: Mutex<QueueState<T>>,
    available: Notify,
}

impl<T> BoundedQueue<T> {
    pub fn new(kind: QueueKind, capacity: usize) -> Self {
        Self {
            kind,
            capacity,
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                leased: 0,
                closed: false,
            }),
            available: Notify::new(),
        }
    }

    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append an item, or hand it back when the queue is full or closed
    pub fn try_push(&self, item: T) -> Result<(), T> {
        {
            let mut state = lock(&self.state);
            if state.closed || state.items.len() + state.leased >= self.capacity {
                return Err(item);
            }
            state.items.push_back(item);
        }
        self.available.notify_one();
        Ok(())
    }

    /// Take the oldest item without waiting
    pub fn pop(&self) -> Option<(T, Lease<'_, T>)> {
        let mut state = lock(&self.state);
        let item = state.items.pop_front()?;
        state.leased += 1;
        Some((item, Lease { queue: self, active: true }))
    }

    /// Take the oldest item, waiting at most `poll` for one to arrive
    pub async fn next(&self, poll: Duration) -> Option<(T, Lease<'_, T>)> {
        if let Some(entry) = self.pop() {
            return Some(entry);
        }

        let notified = self.available.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if let Some(entry) = self.pop() {
            return Some(entry);
        }

        let _ = tokio::time::timeout(poll, notified).await;
        self.pop()
    }

    /// Number of items waiting to be taken
    pub fn len(&self) -> usize {
        lock(&self.state).items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Waiting items plus items held by workers
    pub fn occupancy(&self) -> usize {
        let state = lock(&self.state);
        state.items.len() + state.leased
    }

    /// Drop every waiting item for which `keep` returns false
    pub fn retain(&self, keep: impl FnMut(&T) -> bool) -> usize {
        let mut state = lock(&self.state);
        let before = state.items.len();
        state.items.retain(keep);
        before - state.items.len()
    }

    /// Visit every waiting item in order
    pub fn for_each(&self, mut visit: impl FnMut(&T)) {
        let state = lock(&self.state);
        state.items.iter().for_each(|item| visit(item));
    }

    /// Refuse further pushes; items already queued can still be taken
    pub fn close(&self) {
        lock(&self.state).closed = true;
        self.available.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    fn release(&self) {
        let mut state = lock(&self.state);
        state.leased = state.leased.saturating_sub(1);
    }

    fn push_back_leased(&self, item: T) {
        {
            let mut state = lock(&self.state);
            state.leased = state.leased.saturating_sub(1);
            state.items.push_back(item);
        }
        self.available.notify_one();
    }
}

/// A worker's claim on one queue slot
///
/// Dropping the lease frees the slot; [`Lease::requeue`] turns it back into
/// a waiting item at the back of the queue.
pub struct Lease<'a, T> {
    queue: &'a BoundedQueue<T>,
    active: bool,
}

impl<T> Lease<'_, T> {
    pub fn requeue(mut self, item: T) {
        self.active = false;
        self.queue.push_back_leased(item);
    }
}

impl<T> Drop for Lease<'_, T> {
    fn drop(&mut self) {
        if self.active {
            self.queue.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let queue = BoundedQueue::new(QueueKind::Event, 10);
        for i in 0..3 {
            queue.try_push(i).unwrap();
        }

        let order: Vec<i32> = std::iter::from_fn(|| queue.pop().map(|(item, _lease)| item)).collect();
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[test]
    fn test_capacity_is_never_exceeded() {
        let queue = BoundedQueue::new(QueueKind::LoadUnload, 3);
        let accepted = (0..10).filter(|i| queue.try_push(*i).is_ok()).count();

        assert_eq!(accepted, 3);
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.try_push(99), Err(99));
    }

    #[test]
    fn test_leased_items_hold_their_slot() {
        let queue = BoundedQueue::new(QueueKind::Event, 2);
        queue.try_push(1).unwrap();
        queue.try_push(2).unwrap();

        let (item, lease) = queue.pop().unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.occupancy(), 2);
        assert!(queue.try_push(3).is_err());

        // Re-append goes to the back and still fits
        lease.requeue(item);
        assert_eq!(queue.occupancy(), 2);
        let order: Vec<i32> = std::iter::from_fn(|| queue.pop().map(|(item, _lease)| item)).collect();
        assert_eq!(order, vec![2, 1]);

        assert_eq!(queue.occupancy(), 0);
        assert!(queue.try_push(3).is_ok());
    }

    #[test]
    fn test_retain_and_close() {
        let queue = BoundedQueue::new(QueueKind::Checkpoint, 10);
        for i in 0..6 {
            queue.try_push(i).unwrap();
        }

        assert_eq!(queue.retain(|i| i % 2 == 0), 3);
        assert_eq!(queue.len(), 3);

        queue.close();
        assert!(queue.is_closed());
        assert!(queue.try_push(100).is_err());
        assert!(queue.pop().is_some());
    }

    #[tokio::test]
    async fn test_next_times_out_when_empty() {
        let queue: BoundedQueue<u8> = BoundedQueue::new(QueueKind::Event, 1);
        let start = std::time::Instant::now();
        assert!(queue.next(Duration::from_millis(20)).await.is_none());
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[tokio::test]
    async fn test_next_wakes_on_push() {
        let queue = std::sync::Arc::new(BoundedQueue::new(QueueKind::Event, 4));
        let pusher = {
            let queue = std::sync::Arc::clone(&queue);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                queue.try_push(7u8).unwrap();
            })
        };

        let got = queue.next(Duration::from_secs(5)).await.map(|(item, _lease)| item);
        assert_eq!(got, Some(7));
        pusher.await.unwrap();
    }
}
