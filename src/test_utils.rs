//! Test utilities for directory-sync
//!
//! Shared infrastructure for unit and integration tests: a scripted
//! `FakeDirectory`, an in-memory `MemoryStore` implementing every store
//! trait, and `TestDatabase` for SQLite-backed tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::Result;
use async_trait::async_trait;

use crate::domain::entities::{
    AttachmentEntry, Group, GroupGrant, GroupId, Institution, InstitutionId, PoolId, RoleAssignment, RoleId, User,
    UserGrant, UserId,
};
use crate::domain::remote::{DirectoryApi, Page, RemoteGroup, RemoteInstitution, RemoteUser};
use crate::domain::repositories::{
    GroupChangeSet, GroupStore, InstitutionStore, InstitutionUpsert, PartitionWriteStats, QuotaLedger, UserChangeSet,
    UserStore,
};
use crate::error::{SyncError, SyncResult};
use crate::infrastructure::database_connection::DatabaseConnection;
use crate::infrastructure::sqlite_store::SqliteSyncStore;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Test database configuration
pub struct TestDatabase {
    pub connection: DatabaseConnection,
}

impl TestDatabase {
    /// Fresh in-memory database with the schema applied
    pub async fn new() -> Result<Self> {
        let db = DatabaseConnection::new("sqlite::memory:").await?;
        db.migrate().await?;
        Ok(Self { connection: db })
    }

    pub fn pool(&self) -> sqlx::Pool<sqlx::Sqlite> {
        self.connection.pool().clone()
    }

    pub fn store(&self) -> SqliteSyncStore {
        SqliteSyncStore::new(self.pool())
    }
}

// ===============================
// FAKE DIRECTORY
// ===============================

/// Scripted failure for a fake directory call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeFailure {
    Down,
    Rejected(u16),
}

impl FakeFailure {
    fn into_error(self, operation: &str) -> SyncError {
        match self {
            Self::Down => SyncError::RemoteDown {
                operation: operation.to_string(),
                detail: "scripted outage".into(),
            },
            Self::Rejected(status) => SyncError::RemoteRejected {
                operation: operation.to_string(),
                status: Some(status),
                detail: "scripted rejection".into(),
            },
        }
    }
}

#[derive(Default)]
struct DirectoryState {
    groups: Vec<RemoteGroup>,
    groups_failure: Option<FakeFailure>,
    users: HashMap<String, Vec<RemoteUser>>,
    user_failures: HashMap<String, FakeFailure>,
    external: Vec<RemoteUser>,
    institutions: HashMap<i64, Vec<RemoteInstitution>>,
    institution_failures: HashMap<i64, FakeFailure>,
    attachments: HashMap<String, Vec<AttachmentEntry>>,
    attachment_failures: HashMap<String, FakeFailure>,
}

/// In-memory `DirectoryApi` that pages its data like the real service.
#[derive(Default)]
pub struct FakeDirectory {
    state: Mutex<DirectoryState>,
    calls: AtomicUsize,
}

fn page_of<T: Clone>(items: &[T], start: u64, length: u64) -> Page<T> {
    let start = (start as usize).min(items.len());
    let end = start.saturating_add(length as usize).min(items.len());
    Page::new(items.len() as u64, items[start..end].to_vec())
}

impl FakeDirectory {
    pub fn with_groups(self, groups: Vec<RemoteGroup>) -> Self {
        self.set_groups(groups);
        self
    }

    pub fn with_groups_down(self) -> Self {
        lock(&self.state).groups_failure = Some(FakeFailure::Down);
        self
    }

    pub fn with_users(self, group_code: &str, users: Vec<RemoteUser>) -> Self {
        self.set_users(group_code, users);
        self
    }

    pub fn with_external_assessors(self, users: Vec<RemoteUser>) -> Self {
        lock(&self.state).external = users;
        self
    }

    pub fn with_institutions(self, level: i64, institutions: Vec<RemoteInstitution>) -> Self {
        self.set_institutions(level, institutions);
        self
    }

    pub fn with_attachments(self, code: &str, entries: Vec<AttachmentEntry>) -> Self {
        self.set_attachments(code, entries);
        self
    }

    pub fn set_groups(&self, groups: Vec<RemoteGroup>) {
        lock(&self.state).groups = groups;
    }

    pub fn set_users(&self, group_code: &str, users: Vec<RemoteUser>) {
        lock(&self.state).users.insert(group_code.to_string(), users);
    }

    pub fn set_institutions(&self, level: i64, institutions: Vec<RemoteInstitution>) {
        lock(&self.state).institutions.insert(level, institutions);
    }

    pub fn set_attachments(&self, code: &str, entries: Vec<AttachmentEntry>) {
        let mut state = lock(&self.state);
        state.attachment_failures.remove(code);
        state.attachments.insert(code.to_string(), entries);
    }

    pub fn fail_users(&self, group_code: &str, failure: FakeFailure) {
        lock(&self.state).user_failures.insert(group_code.to_string(), failure);
    }

    pub fn fail_institutions(&self, level: i64, failure: FakeFailure) {
        lock(&self.state).institution_failures.insert(level, failure);
    }

    pub fn fail_attachments(&self, code: &str, failure: FakeFailure) {
        lock(&self.state).attachment_failures.insert(code.to_string(), failure);
    }

    /// Total directory calls served so far.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn record_call(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl DirectoryApi for FakeDirectory {
    async fn list_groups(&self) -> SyncResult<Vec<RemoteGroup>> {
        self.record_call();
        let state = lock(&self.state);
        match state.groups_failure {
            Some(failure) => Err(failure.into_error("list_groups")),
            None => Ok(state.groups.clone()),
        }
    }

    async fn list_users_by_group(&self, group_code: &str, start: u64, length: u64) -> SyncResult<Page<RemoteUser>> {
        self.record_call();
        let state = lock(&self.state);
        if let Some(failure) = state.user_failures.get(group_code) {
            return Err(failure.into_error("list_users_by_group"));
        }
        let users = state.users.get(group_code).map(Vec::as_slice).unwrap_or_default();
        Ok(page_of(users, start, length))
    }

    async fn list_external_assessors(&self, start: u64, length: u64) -> SyncResult<Page<RemoteUser>> {
        self.record_call();
        Ok(page_of(&lock(&self.state).external, start, length))
    }

    async fn list_institutions(&self, level: i64, start: u64, length: u64) -> SyncResult<Page<RemoteInstitution>> {
        self.record_call();
        let state = lock(&self.state);
        if let Some(failure) = state.institution_failures.get(&level) {
            return Err(failure.into_error("list_institutions"));
        }
        let institutions = state.institutions.get(&level).map(Vec::as_slice).unwrap_or_default();
        Ok(page_of(institutions, start, length))
    }

    async fn list_attachments(&self, institution_code: &str) -> SyncResult<Vec<AttachmentEntry>> {
        self.record_call();
        let state = lock(&self.state);
        if let Some(failure) = state.attachment_failures.get(institution_code) {
            return Err(failure.into_error("list_attachments"));
        }
        Ok(state.attachments.get(institution_code).cloned().unwrap_or_default())
    }
}

// ===============================
// MEMORY STORE
// ===============================

#[derive(Default)]
struct MemoryState {
    next_id: i64,
    groups: Vec<Group>,
    group_grants: Vec<GroupGrant>,
    users: Vec<User>,
    user_grants: Vec<UserGrant>,
    roles: Vec<RoleAssignment>,
    pools: HashMap<PoolId, i64>,
    institutions: Vec<Institution>,
    tombstones: HashSet<(i64, String, String)>,
    failing_user_groups: HashSet<GroupId>,
    failing_levels: HashSet<i64>,
    writes: usize,
}

impl MemoryState {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn delete_user(&mut self, user_id: UserId) {
        self.users.retain(|u| u.id != user_id);
        self.user_grants.retain(|g| g.user_id != user_id);
        self.roles.retain(|r| r.user_id != user_id);
    }

    fn insert_grant(&mut self, user_id: UserId, pool_id: PoolId, amount: i64) {
        if !self.user_grants.iter().any(|g| g.user_id == user_id && g.pool_id == pool_id) {
            self.user_grants.push(UserGrant {
                user_id,
                pool_id,
                granted_total: amount,
                remaining: amount,
            });
        }
    }
}

fn injected_failure(what: &str) -> SyncError {
    SyncError::Store(sqlx::Error::Protocol(format!("injected write failure: {}", what)))
}

/// In-memory implementation of every store trait.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn seed_pool(&self, pool_id: PoolId, capacity: i64) {
        lock(&self.state).pools.insert(pool_id, capacity);
    }

    pub fn seed_group(&self, code: &str, name: &str) -> GroupId {
        self.seed_group_with_role(code, name, None)
    }

    pub fn seed_group_with_role(&self, code: &str, name: &str, role_id: Option<RoleId>) -> GroupId {
        let mut state = lock(&self.state);
        let id = state.next_id();
        state.groups.push(Group {
            id,
            remote_code: code.to_string(),
            name: name.to_string(),
            parent_code: None,
            sort_order: 1,
            role_id,
            default_pool_id: None,
        });
        id
    }

    pub fn seed_group_grant(&self, group_id: GroupId, pool_id: PoolId, initial_grant: i64) {
        lock(&self.state).group_grants.push(GroupGrant {
            group_id,
            pool_id,
            initial_grant,
        });
    }

    pub fn seed_user(&self, group_id: GroupId, username: &str, display_name: &str) -> UserId {
        let mut state = lock(&self.state);
        let id = state.next_id();
        state.users.push(User {
            id,
            username: username.to_string(),
            group_id,
            display_name: display_name.to_string(),
            email: None,
            position: None,
            is_external: false,
        });
        id
    }

    pub fn seed_user_grant(&self, user_id: UserId, pool_id: PoolId, granted_total: i64, remaining: i64) {
        lock(&self.state).user_grants.push(UserGrant {
            user_id,
            pool_id,
            granted_total,
            remaining,
        });
    }

    pub fn seed_institution(&self, level: i64, remote_id: &str, code: &str, attachments: Vec<AttachmentEntry>) -> InstitutionId {
        let mut state = lock(&self.state);
        let id = state.next_id();
        state.institutions.push(Institution {
            id,
            level,
            remote_id: remote_id.to_string(),
            code: code.to_string(),
            name: format!("Institution {}", code),
            region: None,
            attachments,
        });
        id
    }

    pub fn fail_user_writes(&self, group_id: GroupId) {
        lock(&self.state).failing_user_groups.insert(group_id);
    }

    pub fn fail_institution_writes(&self, level: i64) {
        lock(&self.state).failing_levels.insert(level);
    }

    pub fn groups(&self) -> Vec<Group> {
        lock(&self.state).groups.clone()
    }

    pub fn users(&self) -> Vec<User> {
        lock(&self.state).users.clone()
    }

    pub fn user_grants(&self) -> Vec<UserGrant> {
        lock(&self.state).user_grants.clone()
    }

    pub fn roles(&self) -> Vec<RoleAssignment> {
        lock(&self.state).roles.clone()
    }

    pub fn institutions(&self, level: i64) -> Vec<Institution> {
        lock(&self.state)
            .institutions
            .iter()
            .filter(|i| i.level == level)
            .cloned()
            .collect()
    }

    /// Number of `apply_*` calls that reached the store.
    pub fn write_count(&self) -> usize {
        lock(&self.state).writes
    }
}

#[async_trait]
impl GroupStore for MemoryStore {
    async fn load_groups(&self) -> SyncResult<Vec<Group>> {
        let mut groups = lock(&self.state).groups.clone();
        groups.sort_by_key(|g| g.id);
        Ok(groups)
    }

    async fn apply_group_changes(&self, changes: &GroupChangeSet) -> SyncResult<u64> {
        let mut state = lock(&self.state);
        state.writes += 1;
        for fields in &changes.inserts {
            let id = state.next_id();
            state.groups.push(Group {
                id,
                remote_code: fields.remote_code.clone(),
                name: fields.name.clone(),
                parent_code: fields.parent_code.clone(),
                sort_order: fields.sort_order,
                role_id: None,
                default_pool_id: changes.default_pool_id,
            });
        }
        for (id, fields) in &changes.updates {
            if let Some(group) = state.groups.iter_mut().find(|g| g.id == *id) {
                group.remote_code = fields.remote_code.clone();
                group.name = fields.name.clone();
                group.parent_code = fields.parent_code.clone();
                group.sort_order = fields.sort_order;
            }
        }
        let members: Vec<UserId> = state
            .users
            .iter()
            .filter(|u| changes.deletes.contains(&u.group_id))
            .map(|u| u.id)
            .collect();
        for id in &members {
            state.delete_user(*id);
        }
        state.groups.retain(|g| !changes.deletes.contains(&g.id));
        state.group_grants.retain(|g| !changes.deletes.contains(&g.group_id));
        Ok(members.len() as u64)
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn load_users(&self, group_id: GroupId) -> SyncResult<Vec<User>> {
        let mut users: Vec<User> = lock(&self.state)
            .users
            .iter()
            .filter(|u| u.group_id == group_id)
            .cloned()
            .collect();
        users.sort_by_key(|u| u.id);
        Ok(users)
    }

    async fn load_user_grants(&self, group_id: GroupId) -> SyncResult<Vec<UserGrant>> {
        let state = lock(&self.state);
        let members: HashSet<UserId> = state.users.iter().filter(|u| u.group_id == group_id).map(|u| u.id).collect();
        Ok(state
            .user_grants
            .iter()
            .filter(|g| members.contains(&g.user_id))
            .copied()
            .collect())
    }

    async fn load_group_grants(&self, group_id: GroupId) -> SyncResult<Vec<GroupGrant>> {
        Ok(lock(&self.state)
            .group_grants
            .iter()
            .filter(|g| g.group_id == group_id)
            .copied()
            .collect())
    }

    async fn apply_user_changes(&self, group_id: GroupId, changes: &UserChangeSet) -> SyncResult<()> {
        let mut state = lock(&self.state);
        if state.failing_user_groups.contains(&group_id) {
            return Err(injected_failure("users"));
        }
        state.writes += 1;
        for id in &changes.deletes {
            state.delete_user(*id);
        }
        for (id, profile) in &changes.profile_updates {
            if let Some(user) = state.users.iter_mut().find(|u| u.id == *id) {
                user.display_name = profile.display_name.clone();
                user.email = profile.email.clone();
                user.position = profile.position.clone();
            }
        }
        for backfill in &changes.backfills {
            state.insert_grant(backfill.user_id, backfill.seed.pool_id, backfill.seed.amount);
        }
        for new_user in &changes.provisions {
            let id = state.next_id();
            state.users.push(User {
                id,
                username: new_user.username.clone(),
                group_id,
                display_name: new_user.profile.display_name.clone(),
                email: new_user.profile.email.clone(),
                position: new_user.profile.position.clone(),
                is_external: new_user.is_external,
            });
            if let Some(role_id) = new_user.role_id {
                state.roles.push(RoleAssignment { user_id: id, role_id });
            }
            for seed in &new_user.grants {
                state.insert_grant(id, seed.pool_id, seed.amount);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl QuotaLedger for MemoryStore {
    async fn pool_capacities(&self) -> SyncResult<HashMap<PoolId, i64>> {
        Ok(lock(&self.state).pools.clone())
    }

    async fn issued_totals(&self) -> SyncResult<HashMap<PoolId, i64>> {
        let mut issued = HashMap::new();
        for grant in lock(&self.state).user_grants.iter().filter(|g| g.granted_total != 0) {
            *issued.entry(grant.pool_id).or_insert(0) += grant.granted_total;
        }
        Ok(issued)
    }
}

#[async_trait]
impl InstitutionStore for MemoryStore {
    async fn load_institutions(&self, level: i64) -> SyncResult<Vec<Institution>> {
        let mut institutions = self.institutions(level);
        institutions.sort_by_key(|i| i.id);
        Ok(institutions)
    }

    async fn load_tombstones(&self, level: i64) -> SyncResult<HashMap<String, HashSet<String>>> {
        let state = lock(&self.state);
        let mut tombstones: HashMap<String, HashSet<String>> = HashMap::new();
        for (_, remote_id, file) in state.tombstones.iter().filter(|(l, _, _)| *l == level) {
            tombstones.entry(remote_id.clone()).or_default().insert(file.clone());
        }
        Ok(tombstones)
    }

    async fn apply_institution_changes(
        &self,
        level: i64,
        upserts: &[InstitutionUpsert],
        known_remote_ids: &[String],
    ) -> SyncResult<PartitionWriteStats> {
        let mut state = lock(&self.state);
        if state.failing_levels.contains(&level) {
            return Err(injected_failure("institutions"));
        }
        state.writes += 1;

        let mut stats = PartitionWriteStats::default();
        for upsert in upserts {
            let existing = state
                .institutions
                .iter_mut()
                .find(|i| i.level == level && i.remote_id == upsert.remote_id);
            match existing {
                Some(institution) => {
                    institution.code = upsert.code.clone();
                    institution.name = upsert.name.clone();
                    institution.region = upsert.region.clone();
                    institution.attachments = upsert.attachments.clone();
                }
                None => {
                    let id = state.next_id();
                    state.institutions.push(Institution {
                        id,
                        level,
                        remote_id: upsert.remote_id.clone(),
                        code: upsert.code.clone(),
                        name: upsert.name.clone(),
                        region: upsert.region.clone(),
                        attachments: upsert.attachments.clone(),
                    });
                }
            }
            stats.upserted += 1;
        }

        let doomed: HashSet<InstitutionId> = state
            .institutions
            .iter()
            .filter(|i| i.level == level && !known_remote_ids.contains(&i.remote_id))
            .map(|i| i.id)
            .collect();
        state.institutions.retain(|i| !doomed.contains(&i.id));
        stats.deleted = doomed.len() as u64;
        Ok(stats)
    }

    async fn tombstone_attachment(&self, level: i64, remote_id: &str, file: &str) -> SyncResult<bool> {
        let mut state = lock(&self.state);
        let inserted = state
            .tombstones
            .insert((level, remote_id.to_string(), file.to_string()));
        if let Some(institution) = state
            .institutions
            .iter_mut()
            .find(|i| i.level == level && i.remote_id == remote_id)
        {
            institution.attachments.retain(|entry| entry.file != file);
        }
        Ok(inserted)
    }
}

/// Remote user with the display name derived from the username.
pub fn remote_user(username: &str) -> RemoteUser {
    RemoteUser {
        username: username.to_string(),
        name: format!("User {}", username),
        email: None,
        position: None,
    }
}

pub fn remote_group(code: &str, name: &str) -> RemoteGroup {
    RemoteGroup {
        code: code.to_string(),
        name: name.to_string(),
        parent_code: None,
        sort_order: Some(1),
    }
}

pub fn remote_institution(remote_id: &str, code: &str) -> RemoteInstitution {
    RemoteInstitution {
        remote_id: remote_id.to_string(),
        code: code.to_string(),
        name: format!("Institution {}", code),
        region: None,
    }
}
