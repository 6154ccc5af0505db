use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

struct Inner<T> {
    items: VecDeque<T>,
    stopped: bool,
}

/// Blocking hand-off between the network thread and a consumer thread.
pub struct SyncQueue<T> {
    inner: Mutex<Inner<T>>,
    available: Condvar,
}

impl<T> Default for SyncQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SyncQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                stopped: false,
            }),
            available: Condvar::new(),
        }
    }

    /// No-op once the queue is stopped.
    pub fn push(&self, item: T) {
        let mut inner = self.inner.lock();
        if inner.stopped {
            return;
        }
        inner.items.push_back(item);
        drop(inner);
        self.available.notify_one();
    }

    /// Blocks until an item arrives or the queue is stopped.
    pub fn pop(&self) -> Option<T> {
        let mut inner = self.inner.lock();
        loop {
            if inner.stopped {
                return None;
            }
            if let Some(item) = inner.items.pop_front() {
                return Some(item);
            }
            self.available.wait(&mut inner);
        }
    }

    /// Like [`pop`](Self::pop), but gives up once `timeout` has passed.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        loop {
            if inner.stopped {
                return None;
            }
            if let Some(item) = inner.items.pop_front() {
                return Some(item);
            }
            if self.available.wait_until(&mut inner, deadline).timed_out() {
                if inner.stopped {
                    return None;
                }
                return inner.items.pop_front();
            }
        }
    }

    pub fn try_pop(&self) -> Option<T> {
        let mut inner = self.inner.lock();
        if inner.stopped {
            return None;
        }
        inner.items.pop_front()
    }

    pub fn stop(&self) {
        let mut inner = self.inner.lock();
        inner.stopped = true;
        inner.items.clear();
        drop(inner);
        self.available.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.lock().stopped
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
