//! Keyed work queue.
//!
//! Every key has its own FIFO of pending operations. A key is handed to at
//! most one worker at a time: while it is processing or parked for a retry,
//! new operations for it accumulate but are not dispatched. Keys become ready
//! in the order they first had work.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::debug;

use crate::event::{ChangeSet, Operation, ReconcileEvent};
use crate::key::ObjectKey;

/// A dequeued unit of work.
#[derive(Debug)]
pub struct WorkItem<K, C> {
    pub key: ObjectKey,
    pub op: Operation<K, C>,
    /// Failed attempts so far for this operation.
    pub attempt: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Ready,
    Processing,
    Parked,
}

struct Entry<K, C> {
    pending: VecDeque<Operation<K, C>>,
    status: Option<Status>,
    attempt: u32,
}

impl<K, C> Default for Entry<K, C> {
    fn default() -> Self {
        Self {
            pending: VecDeque::new(),
            status: None,
            attempt: 0,
        }
    }
}

struct Inner<K, C> {
    entries: HashMap<ObjectKey, Entry<K, C>>,
    ready: VecDeque<ObjectKey>,
    shutdown: bool,
}

pub struct WorkQueue<K, C> {
    inner: Mutex<Inner<K, C>>,
    notify: Notify,
}

impl<K, C> WorkQueue<K, C>
where
    K: Send + Sync + 'static,
    C: ChangeSet,
{
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                ready: VecDeque::new(),
                shutdown: false,
            }),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<K, C>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue an operation. Returns false once the queue is shut down.
    ///
    /// An `Updated` directly behind another pending `Updated` or `Created`
    /// for the same key is folded into it.
    pub fn push(&self, key: ObjectKey, op: Operation<K, C>) -> bool {
        let mut inner = self.lock();
        if inner.shutdown {
            return false;
        }

        let entry = inner.entries.entry(key.clone()).or_default();
        match (entry.pending.back_mut(), op) {
            (Some(Operation::Updated(pending)), Operation::Updated(changes)) => {
                pending.merge(changes);
            }
            (Some(Operation::Created), Operation::Updated(_)) => {}
            (_, op) => entry.pending.push_back(op),
        }

        if entry.status.is_none() {
            entry.status = Some(Status::Ready);
            inner.ready.push_back(key);
            drop(inner);
            self.notify.notify_one();
        }
        true
    }

    /// Wait for the next ready key. Returns `None` after [`shutdown`].
    ///
    /// [`shutdown`]: WorkQueue::shutdown
    pub async fn pop(&self) -> Option<WorkItem<K, C>> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.lock();
                if inner.shutdown {
                    return None;
                }
                while let Some(key) = inner.ready.pop_front() {
                    let Some(entry) = inner.entries.get_mut(&key) else {
                        continue;
                    };
                    let Some(op) = entry.pending.pop_front() else {
                        inner.entries.remove(&key);
                        continue;
                    };
                    entry.status = Some(Status::Processing);
                    let attempt = entry.attempt;
                    let more = !inner.ready.is_empty();
                    drop(inner);
                    if more {
                        self.notify.notify_one();
                    }
                    return Some(WorkItem { key, op, attempt });
                }
            }

            notified.await;
        }
    }

    /// Release a key after its operation finished or was abandoned.
    pub fn done(&self, key: &ObjectKey) {
        let mut inner = self.lock();
        let Some(entry) = inner.entries.get_mut(key) else {
            return;
        };
        entry.attempt = 0;
        if entry.pending.is_empty() {
            inner.entries.remove(key);
            return;
        }
        entry.status = Some(Status::Ready);
        inner.ready.push_back(key.clone());
        drop(inner);
        self.notify.notify_one();
    }

    /// Put a failed operation back at the front of its key and hold the key
    /// for `delay`.
    pub fn retry(self: &Arc<Self>, key: ObjectKey, op: Operation<K, C>, delay: Duration) {
        {
            let mut inner = self.lock();
            let Some(entry) = inner.entries.get_mut(&key) else {
                return;
            };
            entry.attempt += 1;
            entry.status = Some(Status::Parked);
            entry.pending.push_front(op);
        }

        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.unpark(&key);
        });
    }

    fn unpark(&self, key: &ObjectKey) {
        let mut inner = self.lock();
        if inner.shutdown {
            return;
        }
        let Some(entry) = inner.entries.get_mut(key) else {
            return;
        };
        if entry.status != Some(Status::Parked) {
            return;
        }
        entry.status = Some(Status::Ready);
        inner.ready.push_back(key.clone());
        drop(inner);
        debug!(key = %key, "Retry backoff elapsed");
        self.notify.notify_one();
    }

    /// Stop handing out work. Pending and parked operations are dropped.
    pub fn shutdown(&self) {
        let mut inner = self.lock();
        inner.shutdown = true;
        inner.ready.clear();
        inner.entries.clear();
        drop(inner);
        self.notify.notify_waiters();
    }

    pub fn is_shutdown(&self) -> bool {
        self.lock().shutdown
    }

    /// Number of keys with pending or in-flight work.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, C> Default for WorkQueue<K, C>
where
    K: Send + Sync + 'static,
    C: ChangeSet,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Cloneable handle for components outside the engine that need to trigger
/// reconciliation.
pub struct QueueHandle<K, C> {
    queue: Arc<WorkQueue<K, C>>,
}

impl<K, C> Clone for QueueHandle<K, C> {
    fn clone(&self) -> Self {
        Self {
            queue: Arc::clone(&self.queue),
        }
    }
}

impl<K, C> QueueHandle<K, C>
where
    K: Send + Sync + 'static,
    C: ChangeSet,
{
    pub(crate) fn new(queue: Arc<WorkQueue<K, C>>) -> Self {
        Self { queue }
    }

    pub fn push(&self, event: ReconcileEvent<K, C>) -> bool {
        self.queue.push(event.key, event.op)
    }

    pub fn update(&self, key: ObjectKey, changes: C) -> bool {
        self.queue.push(key, Operation::Updated(changes))
    }
}
