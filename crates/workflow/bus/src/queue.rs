//! Four-tier priority queue with a starvation bound
//!
//! Dequeues prefer the highest non-empty tier. Every dequeue that skips a
//! non-empty tier counts as "passing it over"; once a tier has been passed
//! over `fairness_window` times it is served ahead of higher tiers, the
//! longest-waiting such tier first. FIFO order holds within a tier.

use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::Notify;
use workflow_types::Priority;

const TIERS: usize = 4;

struct Tiers<T> {
    queues: [VecDeque<T>; TIERS],
    passed_over: [u32; TIERS],
    closed: bool,
}

impl<T> Tiers<T> {
    fn take(&mut self, fairness_window: u32) -> Option<(Priority, T)> {
        // Longest-waiting starving tier wins (ties go to the lower tier),
        // otherwise strict priority
        let starving = (0..TIERS)
            .rev()
            .filter(|&i| !self.queues[i].is_empty() && self.passed_over[i] >= fairness_window)
            .fold(None, |best: Option<usize>, i| match best {
                Some(b) if self.passed_over[b] >= self.passed_over[i] => Some(b),
                _ => Some(i),
            });
        let idx = starving.or_else(|| (0..TIERS).find(|&i| !self.queues[i].is_empty()))?;

        let item = self.queues[idx].pop_front()?;
        for i in 0..TIERS {
            if i == idx || self.queues[i].is_empty() {
                self.passed_over[i] = 0;
            } else {
                self.passed_over[i] += 1;
            }
        }
        Priority::from_index(idx).map(|p| (p, item))
    }
}

/// Shared priority queue drained by the bus consumers
pub struct PriorityQueues<T> {
    tiers: Mutex<Tiers<T>>,
    notify: Notify,
    fairness_window: u32,
}

impl<T> PriorityQueues<T> {
    pub fn new(fairness_window: u32) -> Self {
        Self {
            tiers: Mutex::new(Tiers {
                queues: Default::default(),
                passed_over: [0; TIERS],
                closed: false,
            }),
            notify: Notify::new(),
            fairness_window: fairness_window.max(1),
        }
    }

    /// Enqueue an item. Returns `false` once the queue is closed.
    pub fn push(&self, priority: Priority, item: T) -> bool {
        {
            let mut tiers = self.tiers.lock();
            if tiers.closed {
                return false;
            }
            tiers.queues[priority.index()].push_back(item);
        }
        self.notify.notify_one();
        true
    }

    /// Dequeue without waiting
    pub fn try_pop(&self) -> Option<(Priority, T)> {
        self.tiers.lock().take(self.fairness_window)
    }

    /// Wait for the next item and run `f` on it inside the queue's
    /// critical section, so consumers hand items on in dequeue order.
    ///
    /// Returns `None` once closed and drained.
    pub async fn pop_with<R>(&self, mut f: impl FnMut(Priority, T) -> R) -> Option<R> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut tiers = self.tiers.lock();
                if let Some((priority, item)) = tiers.take(self.fairness_window) {
                    return Some(f(priority, item));
                }
                if tiers.closed {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Stop accepting items and wake every waiting consumer
    pub fn close(&self) {
        self.tiers.lock().closed = true;
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.tiers.lock().closed
    }

    pub fn len(&self) -> usize {
        self.tiers.lock().queues.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn depth(&self, priority: Priority) -> usize {
        self.tiers.lock().queues[priority.index()].len()
    }
}
