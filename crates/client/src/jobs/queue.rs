//! The ready queue: a bounded max-heap ordered by priority (descending)
//! then submission age (ascending). Dequeue waits on a notifier; close
//! wakes every waiter and stops dispatch, leaving queued rows durable for
//! the next start.

use std::collections::BinaryHeap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, PartialEq, Eq)]
struct QueueEntry {
    priority: i32,
    created_at: DateTime<Utc>,
    seq: u64,
    job_id: Uuid,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Max-heap: the greatest entry dequeues first.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.created_at.cmp(&self.created_at))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

struct QueueInner {
    heap: BinaryHeap<QueueEntry>,
    seq: u64,
    closed: bool,
}

pub struct JobQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    capacity: usize,
}

#[derive(Debug, thiserror::Error)]
#[error("job queue is full ({0} entries)")]
pub struct QueueFull(pub usize);

impl JobQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                heap: BinaryHeap::new(),
                seq: 0,
                closed: false,
            }),
            notify: Notify::new(),
            capacity,
        }
    }

    pub fn push(
        &self,
        job_id: Uuid,
        priority: i32,
        created_at: DateTime<Utc>,
    ) -> Result<(), QueueFull> {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed || inner.heap.len() >= self.capacity {
                return Err(QueueFull(self.capacity));
            }
            inner.seq += 1;
            let seq = inner.seq;
            inner.heap.push(QueueEntry {
                priority,
                created_at,
                seq,
                job_id,
            });
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Next ready job, waiting until one arrives. Returns `None` once the
    /// queue is closed or `shutdown` fires.
    pub async fn pop(&self, shutdown: &CancellationToken) -> Option<Uuid> {
        loop {
            {
                let mut inner = self.inner.lock().unwrap();
                if inner.closed {
                    return None;
                }
                if let Some(entry) = inner.heap.pop() {
                    return Some(entry.job_id);
                }
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = shutdown.cancelled() => return None,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn close(&self) {
        self.inner.lock().unwrap().closed = true;
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn dequeues_by_priority_then_age() {
        let queue = JobQueue::new(16);
        let shutdown = CancellationToken::new();
        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::seconds(1);

        let low = Uuid::new_v4();
        let urgent_old = Uuid::new_v4();
        let urgent_new = Uuid::new_v4();

        queue.push(low, 0, t0).unwrap();
        queue.push(urgent_new, 3, t1).unwrap();
        queue.push(urgent_old, 3, t0).unwrap();

        assert_eq!(queue.pop(&shutdown).await, Some(urgent_old));
        assert_eq!(queue.pop(&shutdown).await, Some(urgent_new));
        assert_eq!(queue.pop(&shutdown).await, Some(low));
    }

    #[tokio::test]
    async fn fifo_within_a_priority_band() {
        let queue = JobQueue::new(16);
        let shutdown = CancellationToken::new();
        let t = Utc::now();

        let ids: Vec<Uuid> = (0..4).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            queue.push(*id, 1, t).unwrap();
        }
        for id in &ids {
            assert_eq!(queue.pop(&shutdown).await, Some(*id));
        }
    }

    #[tokio::test]
    async fn capacity_is_enforced() {
        let queue = JobQueue::new(2);
        queue.push(Uuid::new_v4(), 0, Utc::now()).unwrap();
        queue.push(Uuid::new_v4(), 0, Utc::now()).unwrap();
        assert!(queue.push(Uuid::new_v4(), 0, Utc::now()).is_err());
    }

    #[tokio::test]
    async fn close_wakes_waiters_with_none() {
        let queue = std::sync::Arc::new(JobQueue::new(4));
        let shutdown = CancellationToken::new();

        let waiter = {
            let queue = queue.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { queue.pop(&shutdown).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        queue.close();
        assert_eq!(waiter.await.unwrap(), None);
    }
}
