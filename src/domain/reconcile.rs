//! Partition reconciliation
//!
//! Pure diff between the local rows of one partition and a remote snapshot.
//! The plan is computed in memory and handed to a store, which applies it in
//! one transaction. An unchanged snapshot yields a plan with nothing to write,
//! which is what makes repeated passes idempotent.

use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::hash::Hash;

/// A record coming from the directory, identified by a stable key.
pub trait RemoteRecord {
    type Key: Eq + Hash + Clone + Debug;

    fn sync_key(&self) -> Self::Key;
}

/// A local row mirroring a remote record of type `R`.
pub trait LocalRecord<R: RemoteRecord> {
    fn sync_key(&self) -> R::Key;

    /// `true` when any mutable field differs from the remote copy.
    fn is_stale(&self, remote: &R) -> bool;
}

#[derive(Debug, Clone)]
pub struct Matched<L, R> {
    pub local: L,
    pub remote: R,
    pub stale: bool,
}

#[derive(Debug, Clone)]
pub struct PartitionPlan<L, R> {
    /// Remote records with no local row, in remote order.
    pub inserts: Vec<R>,
    /// Local rows paired with their remote record, in remote order.
    pub matched: Vec<Matched<L, R>>,
    /// Local rows whose key is absent remotely.
    pub orphans: Vec<L>,
    /// Extra local rows sharing a key with an earlier row.
    pub duplicates: Vec<L>,
    /// Remote records dropped because their key was already seen.
    pub remote_duplicates: usize,
}

impl<L, R> PartitionPlan<L, R> {
    pub fn updates(&self) -> impl Iterator<Item = &Matched<L, R>> {
        self.matched.iter().filter(|m| m.stale)
    }

    pub fn update_count(&self) -> usize {
        self.updates().count()
    }

    pub fn unchanged_count(&self) -> usize {
        self.matched.len() - self.update_count()
    }

    /// Nothing to insert, update or delete.
    pub fn is_noop(&self) -> bool {
        self.inserts.is_empty()
            && self.orphans.is_empty()
            && self.duplicates.is_empty()
            && self.update_count() == 0
    }
}

/// Diff one partition.
///
/// `local` must already be restricted to the partition. When several local
/// rows share a key the first one wins and the rest land in `duplicates`, so
/// callers order `local` by preference (lowest id first).
pub fn plan_partition<L, R>(local: Vec<L>, remote: Vec<R>) -> PartitionPlan<L, R>
where
    R: RemoteRecord,
    L: LocalRecord<R>,
{
    let mut seen_remote: HashSet<R::Key> = HashSet::with_capacity(remote.len());
    let mut remote_duplicates = 0;
    let remote: Vec<R> = remote
        .into_iter()
        .filter(|r| {
            let fresh = seen_remote.insert(r.sync_key());
            if !fresh {
                remote_duplicates += 1;
            }
            fresh
        })
        .collect();

    let mut by_key: HashMap<R::Key, L> = HashMap::with_capacity(local.len());
    let mut local_order = Vec::with_capacity(local.len());
    let mut duplicates = Vec::new();
    for row in local {
        let key = row.sync_key();
        if by_key.contains_key(&key) {
            duplicates.push(row);
        } else {
            local_order.push(key.clone());
            by_key.insert(key, row);
        }
    }

    let mut inserts = Vec::new();
    let mut matched = Vec::new();
    for record in remote {
        match by_key.remove(&record.sync_key()) {
            Some(local) => {
                let stale = local.is_stale(&record);
                matched.push(Matched {
                    local,
                    remote: record,
                    stale,
                });
            }
            None => inserts.push(record),
        }
    }
    let orphans = local_order
        .into_iter()
        .filter_map(|key| by_key.remove(&key))
        .collect();

    PartitionPlan {
        inserts,
        matched,
        orphans,
        duplicates,
        remote_duplicates,
    }
}
