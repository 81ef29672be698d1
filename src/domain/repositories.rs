//! Repository interfaces for directory reconciliation
//!
//! Each sync variant reads through one store trait and writes a whole
//! partition through a single `apply_*` call, which implementations must run
//! in one transaction.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;

use crate::domain::entities::{
    AttachmentEntry, Group, GroupGrant, GroupId, Institution, PoolId, RoleId, User,
    UserGrant, UserId,
};
use crate::error::SyncResult;

// ===============================
// GROUPS
// ===============================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupFields {
    pub remote_code: String,
    pub name: String,
    pub parent_code: Option<String>,
    pub sort_order: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupChangeSet {
    pub inserts: Vec<GroupFields>,
    /// Pool assigned to newly inserted groups.
    pub default_pool_id: Option<PoolId>,
    pub updates: Vec<(GroupId, GroupFields)>,
    pub deletes: Vec<GroupId>,
}

impl GroupChangeSet {
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }
}

#[async_trait]
pub trait GroupStore: Send + Sync {
    async fn load_groups(&self) -> SyncResult<Vec<Group>>;

    /// Deleting a group also deletes its member users, with their grants
    /// and role assignments. Returns the number of members removed.
    async fn apply_group_changes(&self, changes: &GroupChangeSet) -> SyncResult<u64>;
}

// ===============================
// USERS
// ===============================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserProfile {
    pub display_name: String,
    pub email: Option<String>,
    pub position: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrantSeed {
    pub pool_id: PoolId,
    pub amount: i64,
}

/// A user seen for the first time in its group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewUser {
    pub username: String,
    pub profile: UserProfile,
    pub is_external: bool,
    pub role_id: Option<RoleId>,
    pub grants: Vec<GrantSeed>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrantBackfill {
    pub user_id: UserId,
    pub seed: GrantSeed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserChangeSet {
    pub provisions: Vec<NewUser>,
    pub profile_updates: Vec<(UserId, UserProfile)>,
    pub backfills: Vec<GrantBackfill>,
    /// Orphans and duplicate rows.
    pub deletes: Vec<UserId>,
}

impl UserChangeSet {
    pub fn is_empty(&self) -> bool {
        self.provisions.is_empty()
            && self.profile_updates.is_empty()
            && self.backfills.is_empty()
            && self.deletes.is_empty()
    }
}

#[async_trait]
pub trait UserStore: Send + Sync {
    /// Users of one group, ordered by id ascending.
    async fn load_users(&self, group_id: GroupId) -> SyncResult<Vec<User>>;

    /// Grant rows of the users currently in `group_id`.
    async fn load_user_grants(&self, group_id: GroupId) -> SyncResult<Vec<UserGrant>>;

    async fn load_group_grants(&self, group_id: GroupId) -> SyncResult<Vec<GroupGrant>>;

    async fn apply_user_changes(&self, group_id: GroupId, changes: &UserChangeSet) -> SyncResult<()>;
}

/// Committed capacity and issuance, read by the quota gate.
#[async_trait]
pub trait QuotaLedger: Send + Sync {
    async fn pool_capacities(&self) -> SyncResult<HashMap<PoolId, i64>>;

    /// Σ `granted_total` per pool over rows with a non-zero grant.
    async fn issued_totals(&self) -> SyncResult<HashMap<PoolId, i64>>;
}

// ===============================
// INSTITUTIONS
// ===============================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstitutionUpsert {
    pub remote_id: String,
    pub code: String,
    pub name: String,
    pub region: Option<String>,
    pub attachments: Vec<AttachmentEntry>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PartitionWriteStats {
    pub upserted: u64,
    pub deleted: u64,
}

#[async_trait]
pub trait InstitutionStore: Send + Sync {
    async fn load_institutions(&self, level: i64) -> SyncResult<Vec<Institution>>;

    /// Tombstoned files of `level`, keyed by remote_id.
    async fn load_tombstones(&self, level: i64) -> SyncResult<HashMap<String, HashSet<String>>>;

    /// Upsert on (level, remote_id), then delete rows of `level` whose
    /// remote_id is not in `known_remote_ids`. One transaction.
    async fn apply_institution_changes(
        &self,
        level: i64,
        upserts: &[InstitutionUpsert],
        known_remote_ids: &[String],
    ) -> SyncResult<PartitionWriteStats>;

    /// Record a deliberate removal and strip the file from the stored list,
    /// if the institution is currently stored. The tombstone survives the
    /// row being pruned and re-created. Returns `false` when the pair was
    /// already tombstoned.
    async fn tombstone_attachment(&self, level: i64, remote_id: &str, file: &str) -> SyncResult<bool>;
}
