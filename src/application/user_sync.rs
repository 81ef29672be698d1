//! User reconciliation
//!
//! One partition per group, keyed by `username`. Every partition is planned
//! first; the quota gate then checks the combined demand against committed
//! state; only after it passes is each group written in its own transaction.
//! A gate rejection therefore writes nothing at all.

#![allow(clippy::uninlined_format_args)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::domain::entities::{Group, GroupGrant, PoolId, User, UserGrant, UserId};
use crate::domain::quota::{PendingDemand, QuotaGate};
use crate::domain::reconcile::{plan_partition, LocalRecord, RemoteRecord};
use crate::domain::remote::{DirectoryApi, RemoteUser};
use crate::domain::repositories::{
    GrantBackfill, GrantSeed, GroupStore, NewUser, QuotaLedger, UserChangeSet, UserProfile, UserStore,
};
use crate::error::SyncResult;
use crate::infrastructure::page_fetcher::PageFetcher;

impl RemoteRecord for RemoteUser {
    type Key = String;

    fn sync_key(&self) -> String {
        self.username.clone()
    }
}

impl LocalRecord<RemoteUser> for User {
    fn sync_key(&self) -> String {
        self.username.clone()
    }

    fn is_stale(&self, remote: &RemoteUser) -> bool {
        self.display_name != remote.name || self.email != remote.email || self.position != remote.position
    }
}

fn profile_of(remote: &RemoteUser) -> UserProfile {
    UserProfile {
        display_name: remote.name.clone(),
        email: remote.email.clone(),
        position: remote.position.clone(),
    }
}

#[derive(Debug, Clone)]
pub struct UserSyncOptions {
    /// System account never removed by the sync.
    pub reserved_username: String,
    /// Local group that receives the external-assessor cohort.
    pub external_group_code: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UserSyncReport {
    pub groups: usize,
    pub fetched: usize,
    pub provisioned: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub backfilled: usize,
    pub deleted: usize,
    pub duplicates_removed: usize,
    pub reserved_kept: usize,
}

/// Planned writes for one group partition.
#[derive(Debug)]
struct GroupPlan {
    group: Group,
    changes: UserChangeSet,
    pending: PendingDemand,
    orphan_usernames: Vec<String>,
    fetched: usize,
    unchanged: usize,
    orphans: usize,
    duplicates: usize,
    reserved_kept: usize,
}

pub struct UserSyncService {
    directory: Arc<dyn DirectoryApi>,
    groups: Arc<dyn GroupStore>,
    users: Arc<dyn UserStore>,
    ledger: Arc<dyn QuotaLedger>,
    fetcher: PageFetcher,
    options: UserSyncOptions,
}

impl UserSyncService {
    pub fn new(
        directory: Arc<dyn DirectoryApi>,
        groups: Arc<dyn GroupStore>,
        users: Arc<dyn UserStore>,
        ledger: Arc<dyn QuotaLedger>,
        fetcher: PageFetcher,
        options: UserSyncOptions,
    ) -> Self {
        Self {
            directory,
            groups,
            users,
            ledger,
            fetcher,
            options,
        }
    }

    pub async fn run(&self) -> SyncResult<UserSyncReport> {
        info!("🔄 User sync started");

        let groups = self.groups.load_groups().await?;
        let external_code = self.options.external_group_code.as_deref();

        // 1. plan every partition; any fetch failure aborts before a write
        let mut plans = Vec::with_capacity(groups.len() + 1);
        for group in groups.iter().filter(|g| Some(g.remote_code.as_str()) != external_code) {
            let code = group.remote_code.clone();
            let label = format!("users of {}", code);
            let remote = self
                .fetcher
                .fetch_all(&label, |start, length| {
                    let code = code.clone();
                    async move { self.directory.list_users_by_group(&code, start, length).await }
                })
                .await?;
            plans.push(self.plan_group(group.clone(), remote, false).await?);
        }

        if let Some(code) = external_code {
            match groups.iter().find(|g| g.remote_code == code) {
                Some(group) => {
                    let remote = self
                        .fetcher
                        .fetch_all("external assessors", |start, length| async move {
                            self.directory.list_external_assessors(start, length).await
                        })
                        .await?;
                    plans.push(self.plan_group(group.clone(), remote, true).await?);
                }
                None => warn!("⚠️ External group '{}' does not exist locally, skipping assessors", code),
            }
        }

        // 2. gate the combined demand against committed state
        let mut pending = PendingDemand::new();
        for plan in &plans {
            pending.merge(&plan.pending);
        }
        QuotaGate::enforce(self.ledger.as_ref(), &pending).await?;

        warn_about_moves(&plans);

        // 3. one transaction per group
        let mut report = UserSyncReport {
            groups: plans.len(),
            ..Default::default()
        };
        for plan in plans {
            report.fetched += plan.fetched;
            report.provisioned += plan.changes.provisions.len();
            report.updated += plan.changes.profile_updates.len();
            report.unchanged += plan.unchanged;
            report.backfilled += plan.changes.backfills.len();
            report.deleted += plan.orphans;
            report.duplicates_removed += plan.duplicates;
            report.reserved_kept += plan.reserved_kept;

            if plan.duplicates > 0 {
                info!(
                    "🧹 Group {}: removing {} duplicate user row(s)",
                    plan.group.remote_code, plan.duplicates
                );
            }
            if plan.changes.is_empty() {
                debug!("Group {}: nothing to write", plan.group.remote_code);
                continue;
            }
            self.users.apply_user_changes(plan.group.id, &plan.changes).await?;
            debug!(
                "💾 Group {}: +{} ~{} -{}",
                plan.group.remote_code,
                plan.changes.provisions.len(),
                plan.changes.profile_updates.len(),
                plan.changes.deletes.len()
            );
        }

        info!(
            "✅ User sync: {} group(s), +{} ~{} -{} ({} unchanged, {} back-filled, {} duplicate(s) removed)",
            report.groups,
            report.provisioned,
            report.updated,
            report.deleted,
            report.unchanged,
            report.backfilled,
            report.duplicates_removed
        );
        Ok(report)
    }

    async fn plan_group(&self, group: Group, remote: Vec<RemoteUser>, is_external: bool) -> SyncResult<GroupPlan> {
        let local = self.users.load_users(group.id).await?;
        let user_grants = self.users.load_user_grants(group.id).await?;
        let group_grants = self.users.load_group_grants(group.id).await?;
        let fetched = remote.len();

        // the reserved account is never planned, so none of its rows are touched
        let reserved = self.options.reserved_username.as_str();
        let (kept, local): (Vec<User>, Vec<User>) = local.into_iter().partition(|u| u.username == reserved);
        let remote: Vec<RemoteUser> = remote.into_iter().filter(|u| u.username != reserved).collect();
        let reserved_kept = kept.len();

        let plan = plan_partition(local, remote);
        if plan.remote_duplicates > 0 {
            warn!(
                "⚠️ Group {}: directory reported {} duplicate username(s), first kept",
                group.remote_code, plan.remote_duplicates
            );
        }

        let mut pending = PendingDemand::new();
        let mut changes = UserChangeSet::default();

        // (a) orphans
        let mut orphan_usernames = Vec::new();
        for orphan in &plan.orphans {
            orphan_usernames.push(orphan.username.clone());
            changes.deletes.push(orphan.id);
        }
        // (b) duplicates; the lowest id was kept by the plan
        changes.deletes.extend(plan.duplicates.iter().map(|u| u.id));

        // (c) new users
        let seeds = grant_seeds(&group_grants);
        for remote in &plan.inserts {
            for seed in &seeds {
                pending.add(seed.pool_id, seed.amount);
            }
            changes.provisions.push(NewUser {
                username: remote.username.clone(),
                profile: profile_of(remote),
                is_external,
                role_id: group.role_id,
                grants: seeds.clone(),
            });
        }

        // (d) existing users: profile refresh and missing pool rows
        let held = pools_by_user(&user_grants);
        for matched in &plan.matched {
            if matched.stale {
                changes.profile_updates.push((matched.local.id, profile_of(&matched.remote)));
            }
            let owned = held.get(&matched.local.id);
            for seed in &seeds {
                if owned.is_some_and(|pools| pools.contains(&seed.pool_id)) {
                    continue;
                }
                pending.add(seed.pool_id, seed.amount);
                changes.backfills.push(GrantBackfill {
                    user_id: matched.local.id,
                    seed: seed.clone(),
                });
            }
        }

        Ok(GroupPlan {
            fetched,
            unchanged: plan.unchanged_count(),
            orphans: orphan_usernames.len(),
            duplicates: plan.duplicates.len(),
            reserved_kept,
            orphan_usernames,
            pending,
            changes,
            group,
        })
    }
}

fn grant_seeds(group_grants: &[GroupGrant]) -> Vec<GrantSeed> {
    group_grants
        .iter()
        .map(|g| GrantSeed {
            pool_id: g.pool_id,
            amount: g.initial_grant,
        })
        .collect()
}

fn pools_by_user(grants: &[UserGrant]) -> HashMap<UserId, HashSet<PoolId>> {
    let mut pools: HashMap<UserId, HashSet<PoolId>> = HashMap::new();
    for grant in grants {
        pools.entry(grant.user_id).or_default().insert(grant.pool_id);
    }
    pools
}

/// A username provisioned in one group and orphaned in another moved groups;
/// it ends the pass with fresh grants in the new group.
fn warn_about_moves(plans: &[GroupPlan]) {
    let orphaned: HashMap<&str, &str> = plans
        .iter()
        .flat_map(|p| p.orphan_usernames.iter().map(move |u| (u.as_str(), p.group.remote_code.as_str())))
        .collect();
    for plan in plans {
        for user in &plan.changes.provisions {
            if let Some(from) = orphaned.get(user.username.as_str()) {
                warn!(
                    "⚠️ User {} moved from group {} to {}; re-provisioned with the new group's grants",
                    user.username, from, plan.group.remote_code
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use crate::test_utils::{remote_user, FakeDirectory, FakeFailure, MemoryStore};

    fn service(directory: Arc<FakeDirectory>, store: Arc<MemoryStore>, external: Option<&str>) -> UserSyncService {
        UserSyncService::new(
            directory,
            store.clone(),
            store.clone(),
            store,
            PageFetcher::new(2, 3),
            UserSyncOptions {
                reserved_username: "admin".into(),
                external_group_code: external.map(str::to_string),
            },
        )
    }

    #[tokio::test]
    async fn provisions_new_users_with_role_and_grants() {
        let store = Arc::new(MemoryStore::default());
        store.seed_pool(1, 1000);
        let hr = store.seed_group_with_role("HR", "People", Some(4));
        store.seed_group_grant(hr, 1, 30);

        let directory = Arc::new(
            FakeDirectory::default().with_users("HR", vec![remote_user("kim"), remote_user("lee"), remote_user("park")]),
        );
        let report = service(directory, store.clone(), None).run().await.unwrap();

        assert_eq!(report.provisioned, 3);
        assert_eq!(store.users().len(), 3);
        assert_eq!(store.roles().len(), 3);
        let grants = store.user_grants();
        assert_eq!(grants.len(), 3);
        assert!(grants.iter().all(|g| g.pool_id == 1 && g.granted_total == 30 && g.remaining == 30));
    }

    #[tokio::test]
    async fn existing_balances_are_left_alone_and_missing_pools_backfilled() {
        let store = Arc::new(MemoryStore::default());
        store.seed_pool(1, 1000);
        store.seed_pool(2, 1000);
        let hr = store.seed_group("HR", "People");
        store.seed_group_grant(hr, 1, 30);
        store.seed_group_grant(hr, 2, 10);
        let kim = store.seed_user(hr, "kim", "Old Name");
        store.seed_user_grant(kim, 1, 30, 3);

        let directory = Arc::new(FakeDirectory::default().with_users("HR", vec![remote_user("kim")]));
        let report = service(directory, store.clone(), None).run().await.unwrap();

        assert_eq!((report.provisioned, report.updated, report.backfilled), (0, 1, 1));
        let grants = store.user_grants();
        let pool1 = grants.iter().find(|g| g.pool_id == 1).unwrap();
        assert_eq!((pool1.granted_total, pool1.remaining), (30, 3));
        let pool2 = grants.iter().find(|g| g.pool_id == 2).unwrap();
        assert_eq!((pool2.granted_total, pool2.remaining), (10, 10));
        assert_eq!(store.users()[0].display_name, "User kim");
    }

    #[tokio::test]
    async fn orphans_go_but_the_reserved_account_stays() {
        let store = Arc::new(MemoryStore::default());
        let hr = store.seed_group("HR", "People");
        store.seed_user(hr, "admin", "Administrator");
        store.seed_user(hr, "gone", "Former");

        let directory = Arc::new(FakeDirectory::default().with_users("HR", vec![]));
        let report = service(directory, store.clone(), None).run().await.unwrap();

        assert_eq!((report.deleted, report.reserved_kept), (1, 1));
        let usernames: Vec<_> = store.users().into_iter().map(|u| u.username).collect();
        assert_eq!(usernames, vec!["admin"]);
    }

    #[tokio::test]
    async fn reserved_account_rows_are_never_touched() {
        let store = Arc::new(MemoryStore::default());
        store.seed_pool(1, 1000);
        let hr = store.seed_group("HR", "People");
        store.seed_group_grant(hr, 1, 30);
        let first = store.seed_user(hr, "admin", "Administrator");
        let second = store.seed_user(hr, "admin", "Administrator");

        // reported with a different profile, and with no pool row held locally
        let directory = Arc::new(FakeDirectory::default().with_users("HR", vec![remote_user("admin")]));
        let report = service(directory, store.clone(), None).run().await.unwrap();

        assert_eq!(report.reserved_kept, 2);
        assert_eq!(
            (report.provisioned, report.updated, report.backfilled, report.deleted, report.duplicates_removed),
            (0, 0, 0, 0, 0)
        );
        let users = store.users();
        assert_eq!(users.iter().map(|u| u.id).collect::<Vec<_>>(), vec![first, second]);
        assert!(users.iter().all(|u| u.display_name == "Administrator"));
        assert!(store.user_grants().is_empty());
    }

    #[tokio::test]
    async fn duplicate_rows_collapse_to_the_lowest_id() {
        let store = Arc::new(MemoryStore::default());
        let hr = store.seed_group("HR", "People");
        let first = store.seed_user(hr, "kim", "User kim");
        store.seed_user(hr, "kim", "User kim");
        store.seed_user(hr, "kim", "User kim");

        let directory = Arc::new(FakeDirectory::default().with_users("HR", vec![remote_user("kim")]));
        let report = service(directory, store.clone(), None).run().await.unwrap();

        assert_eq!(report.duplicates_removed, 2);
        let users = store.users();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].id, first);
    }

    #[tokio::test]
    async fn gate_rejection_writes_nothing() {
        let store = Arc::new(MemoryStore::default());
        store.seed_pool(1, 1000);
        let hr = store.seed_group("HR", "People");
        let it = store.seed_group("IT", "Technology");
        store.seed_group_grant(hr, 1, 30);
        store.seed_group_grant(it, 1, 30);
        let veteran = store.seed_user(hr, "veteran", "User veteran");
        store.seed_user_grant(veteran, 1, 950, 12);
        store.seed_user(it, "leaver", "Leaver");

        let directory = Arc::new(
            FakeDirectory::default()
                .with_users("HR", vec![remote_user("veteran"), remote_user("new-hr")])
                .with_users("IT", vec![remote_user("new-it")]),
        );
        let err = service(directory, store.clone(), None).run().await.unwrap_err();

        match err {
            SyncError::QuotaExceeded { violations } => {
                assert_eq!(violations.len(), 1);
                assert_eq!((violations[0].issued, violations[0].pending), (950, 60));
            }
            other => panic!("expected quota rejection, got {other:?}"),
        }
        assert_eq!(store.write_count(), 0);
        assert_eq!(store.users().len(), 2);
    }

    #[tokio::test]
    async fn fetch_failure_in_any_group_aborts_before_writing() {
        let store = Arc::new(MemoryStore::default());
        let hr = store.seed_group("HR", "People");
        store.seed_group("IT", "Technology");
        store.seed_user(hr, "gone", "Former");

        let directory = Arc::new(FakeDirectory::default().with_users("HR", vec![]));
        directory.fail_users("IT", FakeFailure::Down);
        let err = service(directory, store.clone(), None).run().await.unwrap_err();

        assert!(err.is_remote_down());
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn external_assessors_form_their_own_cohort() {
        let store = Arc::new(MemoryStore::default());
        store.seed_pool(1, 1000);
        let ext = store.seed_group("EXT", "External assessors");
        store.seed_group_grant(ext, 1, 5);

        let directory = Arc::new(FakeDirectory::default().with_external_assessors(vec![remote_user("900101-1")]));
        let report = service(directory, store.clone(), Some("EXT")).run().await.unwrap();

        assert_eq!(report.provisioned, 1);
        let users = store.users();
        assert!(users[0].is_external);
        assert_eq!(users[0].group_id, ext);
    }

    #[tokio::test]
    async fn second_pass_is_a_noop() {
        let store = Arc::new(MemoryStore::default());
        store.seed_pool(1, 1000);
        let hr = store.seed_group("HR", "People");
        store.seed_group_grant(hr, 1, 30);

        let directory = Arc::new(FakeDirectory::default().with_users("HR", (0..5).map(|i| remote_user(&format!("u{i}"))).collect()));
        let service = service(directory, store.clone(), None);
        service.run().await.unwrap();
        let writes = store.write_count();
        let grants_before = store.user_grants();

        let report = service.run().await.unwrap();
        assert_eq!((report.provisioned, report.unchanged), (0, 5));
        assert_eq!(store.write_count(), writes);
        assert_eq!(store.user_grants(), grants_before);
    }
}
