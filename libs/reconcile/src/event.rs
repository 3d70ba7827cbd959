//! Event vocabulary shared by the reflector, the queue and handlers.

use std::fmt::Debug;
use std::sync::Arc;

use crate::key::ObjectKey;

/// Field-level change summary carried by `Updated` events.
pub trait ChangeSet: Clone + Debug + Send + Sync + 'static {
    /// Fold a later change summary for the same object into this one.
    fn merge(&mut self, other: Self);

    /// True when nothing the handler cares about changed.
    fn is_empty(&self) -> bool;
}

/// What happened to an object.
#[derive(Debug, Clone)]
pub enum Operation<K, C> {
    Created,
    Updated(C),
    /// Carries the last object seen in the cache.
    Deleted(Arc<K>),
}

impl<K, C> Operation<K, C> {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated(_) => "updated",
            Self::Deleted(_) => "deleted",
        }
    }
}

/// A normalised notification queued for dispatch.
#[derive(Debug, Clone)]
pub struct ReconcileEvent<K, C> {
    pub key: ObjectKey,
    pub op: Operation<K, C>,
}

impl<K, C> ReconcileEvent<K, C> {
    pub fn new(key: ObjectKey, op: Operation<K, C>) -> Self {
        Self { key, op }
    }
}

/// Raw notifications from a watch stream.
#[derive(Debug, Clone)]
pub enum WatchEvent<K> {
    /// Object added or modified.
    Applied(K),
    /// Object removed.
    Deleted(K),
    /// A full relist begins; objects not re-applied before `Synced` are gone.
    Restarted,
    /// The initial listing or a relist has completed.
    Synced,
}
