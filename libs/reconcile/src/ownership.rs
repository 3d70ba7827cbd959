//! Reference-counted ownership graph.
//!
//! Owners point at dependents. A dependent stays alive while at least one
//! owner references it; once the last edge goes it is orphaned. Orphans that
//! own dependents themselves release those in turn. Orphans are reported in
//! breadth-first order, each level sorted, so cascades are reproducible.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

#[derive(Debug, Clone)]
pub struct OwnershipGraph<T> {
    dependents: BTreeMap<T, BTreeSet<T>>,
    owners: BTreeMap<T, BTreeSet<T>>,
}

impl<T: Ord + Clone> Default for OwnershipGraph<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Ord + Clone> OwnershipGraph<T> {
    pub fn new() -> Self {
        Self {
            dependents: BTreeMap::new(),
            owners: BTreeMap::new(),
        }
    }

    /// Replace the dependents of `owner` and return whatever was orphaned.
    pub fn set_dependents<I>(&mut self, owner: T, deps: I) -> Vec<T>
    where
        I: IntoIterator<Item = T>,
    {
        let desired: BTreeSet<T> = deps.into_iter().collect();
        let current = self.dependents.remove(&owner).unwrap_or_default();

        let mut candidates = BTreeSet::new();
        for dep in current.difference(&desired) {
            if self.unlink(&owner, dep) {
                candidates.insert(dep.clone());
            }
        }
        for dep in &desired {
            self.owners
                .entry(dep.clone())
                .or_default()
                .insert(owner.clone());
        }
        if !desired.is_empty() {
            self.dependents.insert(owner, desired);
        }

        self.cascade(candidates)
    }

    /// Drop `owner` and every edge it holds, returning the orphaned cascade.
    pub fn remove_owner(&mut self, owner: &T) -> Vec<T> {
        let current = self.dependents.remove(owner).unwrap_or_default();
        let mut candidates = BTreeSet::new();
        for dep in &current {
            if self.unlink(owner, dep) {
                candidates.insert(dep.clone());
            }
        }
        self.cascade(candidates)
    }

    pub fn owners_of(&self, dependent: &T) -> Vec<T> {
        self.owners
            .get(dependent)
            .map(|o| o.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn dependents_of(&self, owner: &T) -> Vec<T> {
        self.dependents
            .get(owner)
            .map(|d| d.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.dependents.is_empty() && self.owners.is_empty()
    }

    /// Remove one edge. Returns true when `dep` has no owners left.
    fn unlink(&mut self, owner: &T, dep: &T) -> bool {
        let Some(owners) = self.owners.get_mut(dep) else {
            return true;
        };
        owners.remove(owner);
        if owners.is_empty() {
            self.owners.remove(dep);
            true
        } else {
            false
        }
    }

    fn cascade(&mut self, orphans: BTreeSet<T>) -> Vec<T> {
        let mut released = Vec::new();
        let mut seen = BTreeSet::new();
        let mut level: VecDeque<T> = orphans.into_iter().collect();

        while !level.is_empty() {
            let mut next = BTreeSet::new();
            while let Some(orphan) = level.pop_front() {
                if !seen.insert(orphan.clone()) {
                    continue;
                }
                let deps = self.dependents.remove(&orphan).unwrap_or_default();
                for dep in &deps {
                    if self.unlink(&orphan, dep) {
                        next.insert(dep.clone());
                    }
                }
                released.push(orphan);
            }
            level = next.into_iter().collect();
        }

        released
    }
}
