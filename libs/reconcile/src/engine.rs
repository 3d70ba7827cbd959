//! Watch-driven reconciliation engine.
//!
//! One reflector task mirrors the watch stream into the local cache and turns
//! every cache change into a queued [`ReconcileEvent`]. Once the cache has
//! synced, a fixed pool of workers drains the queue, dispatching each event to
//! the [`Handler`] inside its own task so a panic only fails that attempt.
//!
//! Per key the lifecycle is: pending, processing, then succeeded, retrying
//! (parked until its backoff elapses) or abandoned.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{Stream, StreamExt};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use crate::error::EngineError;
use crate::event::{ChangeSet, Operation, ReconcileEvent, WatchEvent};
use crate::handler::{Handler, HandlerError};
use crate::key::ObjectKey;
use crate::queue::{QueueHandle, WorkItem, WorkQueue};
use crate::ratelimit::RateLimiter;
use crate::store::{Reader, Store, StoreChange};

/// Default attempt budget per operation.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default worker pool size.
pub const DEFAULT_WORKERS: usize = 2;

/// Observer invoked by the reflector for every queued event.
pub type EventHook<K, C> = Box<dyn Fn(&ReconcileEvent<K, C>) + Send + Sync>;

/// Configuration for one engine.
#[derive(Debug)]
pub struct EngineConfig {
    /// Name used in logs.
    pub name: String,

    /// Number of concurrent workers.
    pub workers: usize,

    /// Handler invocations per operation before it is abandoned.
    pub max_attempts: u32,

    /// Delay between attempts.
    pub rate_limiter: RateLimiter,
}

impl EngineConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            workers: DEFAULT_WORKERS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            rate_limiter: RateLimiter::default(),
        }
    }
}

/// Counters describing what an engine has done so far.
#[derive(Debug, Default)]
pub struct EngineStats {
    succeeded: AtomicU64,
    retried: AtomicU64,
    abandoned: AtomicU64,
    skipped: AtomicU64,
}

/// Point-in-time copy of [`EngineStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub succeeded: u64,
    pub retried: u64,
    pub abandoned: u64,
    pub skipped: u64,
}

impl EngineStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            succeeded: self.succeeded.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
        }
    }

    fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Generic control loop for one resource type.
pub struct Engine<H: Handler> {
    config: EngineConfig,
    handler: Arc<H>,
    store: Store<H::Object>,
    queue: Arc<WorkQueue<H::Object, H::Changes>>,
    stats: Arc<EngineStats>,
    hooks: Vec<EventHook<H::Object, H::Changes>>,
}

impl<H: Handler> Engine<H> {
    pub fn new(config: EngineConfig, handler: Arc<H>) -> Self {
        Self::with_store(config, Store::new(), handler)
    }

    /// Build an engine around an existing store, for handlers that need a
    /// reader on their own cache before the engine exists.
    pub fn with_store(config: EngineConfig, store: Store<H::Object>, handler: Arc<H>) -> Self {
        Self {
            config,
            handler,
            store,
            queue: Arc::new(WorkQueue::new()),
            stats: Arc::default(),
            hooks: Vec::new(),
        }
    }

    /// Read handle on this engine's cache.
    pub fn reader(&self) -> Reader<H::Object> {
        self.store.reader()
    }

    /// Handle for enqueueing events from outside the engine.
    pub fn queue(&self) -> QueueHandle<H::Object, H::Changes> {
        QueueHandle::new(Arc::clone(&self.queue))
    }

    pub fn stats(&self) -> Arc<EngineStats> {
        Arc::clone(&self.stats)
    }

    /// Register an observer for events produced by the reflector.
    pub fn on_event<F>(&mut self, hook: F)
    where
        F: Fn(&ReconcileEvent<H::Object, H::Changes>) + Send + Sync + 'static,
    {
        self.hooks.push(Box::new(hook));
    }

    /// Run until `shutdown` flips to true (or its sender is dropped).
    ///
    /// No event is dispatched before the watch stream reports that the
    /// initial listing is complete. On shutdown, in-flight handler calls run
    /// to completion and everything still queued is dropped.
    #[instrument(skip_all, fields(engine = %self.config.name))]
    pub async fn run<S>(
        self,
        stream: S,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), EngineError>
    where
        S: Stream<Item = WatchEvent<H::Object>> + Send + 'static,
    {
        let Engine {
            config,
            handler,
            store,
            queue,
            stats,
            hooks,
        } = self;

        if !init_handler(handler.as_ref(), &config, &mut shutdown).await? {
            return Ok(());
        }

        let reader = store.reader();
        let reflector = tokio::spawn(reflect(
            store,
            stream,
            Arc::clone(&handler),
            Arc::clone(&queue),
            hooks,
        ));

        let synced = tokio::select! {
            synced = reader.wait_synced() => synced,
            _ = wait_for_shutdown(&mut shutdown) => {
                info!("Shutdown before initial sync");
                reflector.abort();
                queue.shutdown();
                return Ok(());
            }
        };
        if !synced {
            queue.shutdown();
            return Err(EngineError::NeverSynced);
        }

        info!(
            objects = reader.len(),
            workers = config.workers,
            "Cache synced, starting workers"
        );

        let worker = Arc::new(Worker {
            name: config.name.clone(),
            handler,
            reader,
            queue: Arc::clone(&queue),
            stats: Arc::clone(&stats),
            rate_limiter: config.rate_limiter,
            max_attempts: config.max_attempts.max(1),
        });

        let mut workers = JoinSet::new();
        for id in 0..config.workers.max(1) {
            let worker = Arc::clone(&worker);
            workers.spawn(async move { worker.run(id).await });
        }

        wait_for_shutdown(&mut shutdown).await;
        info!("Shutdown signal received, draining workers");

        queue.shutdown();
        reflector.abort();
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Worker task failed");
            }
        }

        let totals = stats.snapshot();
        info!(
            succeeded = totals.succeeded,
            retried = totals.retried,
            abandoned = totals.abandoned,
            skipped = totals.skipped,
            "Engine stopped"
        );
        Ok(())
    }
}

/// Returns Ok(false) when shutdown arrives before init succeeds.
async fn init_handler<H: Handler>(
    handler: &H,
    config: &EngineConfig,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<bool, EngineError> {
    let mut attempt = 0;
    loop {
        let result = tokio::select! {
            result = handler.init() => result,
            _ = wait_for_shutdown(shutdown) => return Ok(false),
        };
        match result {
            Ok(()) => return Ok(true),
            Err(HandlerError::Transient(msg)) if attempt + 1 < config.max_attempts => {
                let delay = config.rate_limiter.when(attempt);
                attempt += 1;
                warn!(
                    error = %msg,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Handler init failed, retrying"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = wait_for_shutdown(shutdown) => return Ok(false),
                }
            }
            Err(e) => return Err(EngineError::Init(e)),
        }
    }
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    // A dropped sender also means shutdown.
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn reflect<H, S>(
    mut store: Store<H::Object>,
    stream: S,
    handler: Arc<H>,
    queue: Arc<WorkQueue<H::Object, H::Changes>>,
    hooks: Vec<EventHook<H::Object, H::Changes>>,
) where
    H: Handler,
    S: Stream<Item = WatchEvent<H::Object>> + Send + 'static,
{
    let mut stream = std::pin::pin!(stream);
    while let Some(event) = stream.next().await {
        for change in store.apply(event) {
            let key = change.key();
            let op = match change {
                StoreChange::Added(_) => Operation::Created,
                StoreChange::Modified { old, new } => {
                    let changes = handler.changes(&old, &new);
                    if changes.is_empty() {
                        debug!(key = %key, "Ignoring update without relevant changes");
                        continue;
                    }
                    Operation::Updated(changes)
                }
                StoreChange::Removed(last) => Operation::Deleted(last),
            };

            let event = ReconcileEvent::new(key, op);
            for hook in &hooks {
                hook(&event);
            }
            queue.push(event.key, event.op);
        }
    }
    debug!("Watch stream ended");
}

struct Worker<H: Handler> {
    name: String,
    handler: Arc<H>,
    reader: Reader<H::Object>,
    queue: Arc<WorkQueue<H::Object, H::Changes>>,
    stats: Arc<EngineStats>,
    rate_limiter: RateLimiter,
    max_attempts: u32,
}

impl<H: Handler> Worker<H> {
    async fn run(&self, id: usize) {
        debug!(engine = %self.name, worker = id, "Worker started");
        while let Some(item) = self.queue.pop().await {
            self.process(item).await;
        }
        debug!(engine = %self.name, worker = id, "Worker stopped");
    }

    #[instrument(
        skip_all,
        fields(engine = %self.name, key = %item.key, op = item.op.kind(), attempt = item.attempt)
    )]
    async fn process(&self, item: WorkItem<H::Object, H::Changes>) {
        let WorkItem { key, op, attempt } = item;

        let Some(result) = self.dispatch(&key, &op).await else {
            debug!("Cached object no longer matches event, skipping");
            EngineStats::incr(&self.stats.skipped);
            self.queue.done(&key);
            return;
        };

        match result {
            Ok(()) => {
                debug!("Reconciled");
                EngineStats::incr(&self.stats.succeeded);
                self.queue.done(&key);
            }
            Err(HandlerError::Permanent(msg)) => {
                error!(error = %msg, "Handler failed permanently, abandoning");
                EngineStats::incr(&self.stats.abandoned);
                self.queue.done(&key);
            }
            Err(HandlerError::Transient(msg)) => {
                let failures = attempt + 1;
                if failures >= self.max_attempts {
                    error!(error = %msg, attempts = failures, "Retry budget exhausted, abandoning");
                    EngineStats::incr(&self.stats.abandoned);
                    self.queue.done(&key);
                } else {
                    let delay = self.rate_limiter.when(attempt);
                    warn!(
                        error = %msg,
                        delay_ms = delay.as_millis() as u64,
                        "Handler failed, retrying"
                    );
                    EngineStats::incr(&self.stats.retried);
                    self.queue.retry(key, op, delay);
                }
            }
        }
    }

    /// Invoke the handler against the cached object. `None` means the event is
    /// stale: the object vanished (create/update) or came back (delete).
    async fn dispatch(
        &self,
        key: &ObjectKey,
        op: &Operation<H::Object, H::Changes>,
    ) -> Option<Result<(), HandlerError>> {
        let handler = Arc::clone(&self.handler);
        let task = match op {
            Operation::Created => {
                let obj = self.reader.get(key)?;
                tokio::spawn(async move { handler.on_create(obj).await })
            }
            Operation::Updated(changes) => {
                let obj = self.reader.get(key)?;
                let changes = changes.clone();
                tokio::spawn(async move { handler.on_update(obj, changes).await })
            }
            Operation::Deleted(last) => {
                if self.reader.get(key).is_some() {
                    return None;
                }
                let last = Arc::clone(last);
                tokio::spawn(async move { handler.on_delete(last).await })
            }
        };

        Some(match task.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(HandlerError::Transient("handler panicked".to_string())),
            Err(e) => Err(HandlerError::transient(e)),
        })
    }
}
