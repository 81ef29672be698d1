//! Group reconciliation
//!
//! The whole group set is one partition keyed by `remote_code`. The
//! configured external-cohort group exists only locally and is never pruned.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::domain::entities::{Group, PoolId};
use crate::domain::reconcile::{plan_partition, LocalRecord, RemoteRecord};
use crate::domain::remote::{DirectoryApi, RemoteGroup};
use crate::domain::repositories::{GroupChangeSet, GroupFields, GroupStore};
use crate::error::SyncResult;

impl RemoteRecord for RemoteGroup {
    type Key = String;

    fn sync_key(&self) -> String {
        self.code.clone()
    }
}

impl LocalRecord<RemoteGroup> for Group {
    fn sync_key(&self) -> String {
        self.remote_code.clone()
    }

    fn is_stale(&self, remote: &RemoteGroup) -> bool {
        self.name != remote.name
            || self.parent_code != remote.parent_code
            || self.sort_order != remote.sort_order.unwrap_or(0)
    }
}

fn fields_of(remote: &RemoteGroup) -> GroupFields {
    GroupFields {
        remote_code: remote.code.clone(),
        name: remote.name.clone(),
        parent_code: remote.parent_code.clone(),
        sort_order: remote.sort_order.unwrap_or(0),
    }
}

#[derive(Debug, Clone, Default)]
pub struct GroupSyncOptions {
    pub default_pool_id: Option<PoolId>,
    /// Local-only group codes that must survive a pass.
    pub protected_codes: HashSet<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GroupSyncReport {
    pub fetched: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub deleted: usize,
    pub protected: usize,
    /// Users removed along with their deleted group.
    pub members_removed: u64,
}

pub struct GroupSyncService {
    directory: Arc<dyn DirectoryApi>,
    store: Arc<dyn GroupStore>,
    options: GroupSyncOptions,
}

impl GroupSyncService {
    pub fn new(directory: Arc<dyn DirectoryApi>, store: Arc<dyn GroupStore>, options: GroupSyncOptions) -> Self {
        Self {
            directory,
            store,
            options,
        }
    }

    pub async fn run(&self) -> SyncResult<GroupSyncReport> {
        info!("🔄 Group sync started");

        let remote = self.directory.list_groups().await?;
        let local = self.store.load_groups().await?;
        let fetched = remote.len();

        let plan = plan_partition(local, remote);
        if plan.remote_duplicates > 0 {
            warn!("⚠️ Directory reported {} duplicate group code(s), first kept", plan.remote_duplicates);
        }

        let (protected, orphans): (Vec<Group>, Vec<Group>) = plan
            .orphans
            .iter()
            .cloned()
            .partition(|g| self.options.protected_codes.contains(&g.remote_code));

        let changes = GroupChangeSet {
            inserts: plan.inserts.iter().map(fields_of).collect(),
            default_pool_id: self.options.default_pool_id,
            updates: plan.updates().map(|m| (m.local.id, fields_of(&m.remote))).collect(),
            deletes: orphans.iter().chain(plan.duplicates.iter()).map(|g| g.id).collect(),
        };

        let mut report = GroupSyncReport {
            fetched,
            inserted: changes.inserts.len(),
            updated: changes.updates.len(),
            unchanged: plan.unchanged_count(),
            deleted: changes.deletes.len(),
            protected: protected.len(),
            members_removed: 0,
        };

        if changes.is_empty() {
            info!("✅ Group sync: {} group(s) unchanged, nothing to write", report.unchanged);
            return Ok(report);
        }

        report.members_removed = self.store.apply_group_changes(&changes).await?;
        if report.members_removed > 0 {
            info!("🧹 Removed {} user(s) of deleted group(s)", report.members_removed);
        }
        info!(
            "✅ Group sync: +{} ~{} -{} ({} unchanged, {} protected)",
            report.inserted, report.updated, report.deleted, report.unchanged, report.protected
        );
        Ok(report)
    }
}
