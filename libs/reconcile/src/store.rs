//! Local object cache fed by a watch stream.
//!
//! The [`Store`] is owned by the reflector task and is the only writer. Any
//! number of [`Reader`] handles can look objects up concurrently. Readers can
//! wait for the initial listing to complete before trusting the cache.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, PoisonError, RwLock};

use kube::{Resource, ResourceExt};
use tokio::sync::watch;

use crate::event::WatchEvent;
use crate::key::ObjectKey;

type Cache<K> = Arc<RwLock<BTreeMap<ObjectKey, Arc<K>>>>;

/// A change the cache observed after applying a watch event.
#[derive(Debug, Clone)]
pub enum StoreChange<K> {
    Added(Arc<K>),
    Modified { old: Arc<K>, new: Arc<K> },
    Removed(Arc<K>),
}

impl<K: Resource> StoreChange<K> {
    pub fn key(&self) -> ObjectKey {
        match self {
            Self::Added(obj) | Self::Removed(obj) => ObjectKey::from_object(obj.as_ref()),
            Self::Modified { new, .. } => ObjectKey::from_object(new.as_ref()),
        }
    }
}

/// Writer side of the cache.
pub struct Store<K> {
    cache: Cache<K>,
    synced: watch::Sender<bool>,
    relist: Option<BTreeSet<ObjectKey>>,
}

impl<K: Resource + Clone> Store<K> {
    pub fn new() -> Self {
        let (synced, _) = watch::channel(false);
        Self {
            cache: Arc::default(),
            synced,
            relist: None,
        }
    }

    pub fn reader(&self) -> Reader<K> {
        Reader {
            cache: self.cache.clone(),
            synced: self.synced.subscribe(),
        }
    }

    /// Apply one watch event and report what changed.
    ///
    /// Re-delivery of an object whose `resourceVersion` matches the cached
    /// copy produces no change.
    pub fn apply(&mut self, event: WatchEvent<K>) -> Vec<StoreChange<K>> {
        match event {
            WatchEvent::Applied(obj) => {
                let key = ObjectKey::from_object(&obj);
                if let Some(seen) = self.relist.as_mut() {
                    seen.insert(key.clone());
                }

                let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
                if let Some(old) = cache.get(&key) {
                    let version = obj.resource_version();
                    if version.is_some() && old.resource_version() == version {
                        return Vec::new();
                    }
                }

                let new = Arc::new(obj);
                match cache.insert(key, new.clone()) {
                    Some(old) => vec![StoreChange::Modified { old, new }],
                    None => vec![StoreChange::Added(new)],
                }
            }
            WatchEvent::Deleted(obj) => {
                let key = ObjectKey::from_object(&obj);
                if let Some(seen) = self.relist.as_mut() {
                    seen.remove(&key);
                }
                let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
                cache
                    .remove(&key)
                    .map(StoreChange::Removed)
                    .into_iter()
                    .collect()
            }
            WatchEvent::Restarted => {
                self.relist = Some(BTreeSet::new());
                Vec::new()
            }
            WatchEvent::Synced => {
                let mut removed = Vec::new();
                if let Some(seen) = self.relist.take() {
                    let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
                    let stale: Vec<ObjectKey> = cache
                        .keys()
                        .filter(|k| !seen.contains(*k))
                        .cloned()
                        .collect();
                    for key in stale {
                        if let Some(obj) = cache.remove(&key) {
                            removed.push(StoreChange::Removed(obj));
                        }
                    }
                }
                self.synced.send_replace(true);
                removed
            }
        }
    }
}

impl<K: Resource + Clone> Default for Store<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// Read-only handle onto a [`Store`].
pub struct Reader<K> {
    cache: Cache<K>,
    synced: watch::Receiver<bool>,
}

impl<K> Clone for Reader<K> {
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
            synced: self.synced.clone(),
        }
    }
}

impl<K> Reader<K> {
    pub fn get(&self, key: &ObjectKey) -> Option<Arc<K>> {
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Snapshot of every cached object, in key order.
    pub fn list(&self) -> Vec<Arc<K>> {
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn keys(&self) -> Vec<ObjectKey> {
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.cache.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_synced(&self) -> bool {
        *self.synced.borrow()
    }

    /// Wait until the initial listing has completed.
    ///
    /// Returns false if the store was dropped before it ever synced.
    pub async fn wait_synced(&self) -> bool {
        let mut synced = self.synced.clone();
        let ok = synced.wait_for(|s| *s).await.is_ok();
        ok
    }
}
