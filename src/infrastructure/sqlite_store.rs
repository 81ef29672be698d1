//! SQLite implementation of the sync stores
//!
//! One `SqliteSyncStore` serves every collaborator trait. Each `apply_*`
//! call runs in its own transaction, so a failed partition leaves the
//! previous committed state untouched.

#![allow(clippy::uninlined_format_args)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use tracing::debug;

use crate::domain::entities::{
    AttachmentEntry, Group, GroupGrant, GroupId, Institution, PoolId, User, UserGrant,
};
use crate::domain::repositories::{
    GroupChangeSet, GroupStore, InstitutionStore, InstitutionUpsert, PartitionWriteStats, QuotaLedger, UserChangeSet,
    UserStore,
};
use crate::error::SyncResult;

/// Rows per multi-value insert when staging known remote ids.
const KNOWN_ID_CHUNK: usize = 500;

#[derive(Clone)]
pub struct SqliteSyncStore {
    pool: Arc<SqlitePool>,
}

impl SqliteSyncStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool: Arc::new(pool) }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn row_to_group(row: &SqliteRow) -> SyncResult<Group> {
    Ok(Group {
        id: row.try_get("id")?,
        remote_code: row.try_get("remote_code")?,
        name: row.try_get("name")?,
        parent_code: row.try_get("parent_code")?,
        sort_order: row.try_get::<Option<i64>, _>("sort_order")?.unwrap_or(0),
        role_id: row.try_get("role_id")?,
        default_pool_id: row.try_get("default_pool_id")?,
    })
}

fn row_to_user(row: &SqliteRow) -> SyncResult<User> {
    Ok(User {
        id: row.try_get("id")?,
        username: row.try_get("username")?,
        group_id: row.try_get("group_id")?,
        display_name: row.try_get("display_name")?,
        email: row.try_get("email")?,
        position: row.try_get("position")?,
        is_external: row.try_get("is_external")?,
    })
}

fn row_to_institution(row: &SqliteRow) -> SyncResult<Institution> {
    let attachments: String = row.try_get("attachments")?;
    Ok(Institution {
        id: row.try_get("id")?,
        level: row.try_get("level")?,
        remote_id: row.try_get("remote_id")?,
        code: row.try_get("code")?,
        name: row.try_get("name")?,
        region: row.try_get("region")?,
        attachments: serde_json::from_str(&attachments)?,
    })
}

// ===============================
// GROUPS
// ===============================

#[async_trait]
impl GroupStore for SqliteSyncStore {
    async fn load_groups(&self) -> SyncResult<Vec<Group>> {
        let rows = sqlx::query(
            r#"
            SELECT id, remote_code, name, parent_code, sort_order, role_id, default_pool_id
            FROM groups
            ORDER BY id
            "#,
        )
        .fetch_all(&*self.pool)
        .await?;

        rows.iter().map(row_to_group).collect()
    }

    async fn apply_group_changes(&self, changes: &GroupChangeSet) -> SyncResult<u64> {
        let mut tx = self.pool.begin().await?;

        for group in &changes.inserts {
            sqlx::query(
                r#"
                INSERT INTO groups (remote_code, name, parent_code, sort_order, default_pool_id)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(&group.remote_code)
            .bind(&group.name)
            .bind(&group.parent_code)
            .bind(group.sort_order)
            .bind(changes.default_pool_id)
            .execute(&mut *tx)
            .await?;
        }

        for (id, group) in &changes.updates {
            sqlx::query(
                r#"
                UPDATE groups
                SET remote_code = ?, name = ?, parent_code = ?, sort_order = ?, updated_at = CURRENT_TIMESTAMP
                WHERE id = ?
                "#,
            )
            .bind(&group.remote_code)
            .bind(&group.name)
            .bind(&group.parent_code)
            .bind(group.sort_order)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        }

        // members go first; their grants and roles cascade
        let mut members_removed = 0;
        for id in &changes.deletes {
            members_removed += sqlx::query("DELETE FROM users WHERE group_id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
            sqlx::query("DELETE FROM groups WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(members_removed)
    }
}

// ===============================
// USERS
// ===============================

#[async_trait]
impl UserStore for SqliteSyncStore {
    async fn load_users(&self, group_id: GroupId) -> SyncResult<Vec<User>> {
        let rows = sqlx::query(
            r#"
            SELECT id, username, group_id, display_name, email, position, is_external
            FROM users
            WHERE group_id = ?
            ORDER BY id ASC
            "#,
        )
        .bind(group_id)
        .fetch_all(&*self.pool)
        .await?;

        rows.iter().map(row_to_user).collect()
    }

    async fn load_user_grants(&self, group_id: GroupId) -> SyncResult<Vec<UserGrant>> {
        let rows = sqlx::query(
            r#"
            SELECT ug.user_id, ug.pool_id, ug.granted_total, ug.remaining
            FROM user_grants ug
            JOIN users u ON u.id = ug.user_id
            WHERE u.group_id = ?
            "#,
        )
        .bind(group_id)
        .fetch_all(&*self.pool)
        .await?;

        rows.iter()
            .map(|row| -> SyncResult<UserGrant> {
                Ok(UserGrant {
                    user_id: row.try_get("user_id")?,
                    pool_id: row.try_get("pool_id")?,
                    granted_total: row.try_get("granted_total")?,
                    remaining: row.try_get("remaining")?,
                })
            })
            .collect()
    }

    async fn load_group_grants(&self, group_id: GroupId) -> SyncResult<Vec<GroupGrant>> {
        let rows = sqlx::query("SELECT group_id, pool_id, initial_grant FROM group_grants WHERE group_id = ? ORDER BY pool_id")
            .bind(group_id)
            .fetch_all(&*self.pool)
            .await?;

        rows.iter()
            .map(|row| -> SyncResult<GroupGrant> {
                Ok(GroupGrant {
                    group_id: row.try_get("group_id")?,
                    pool_id: row.try_get("pool_id")?,
                    initial_grant: row.try_get("initial_grant")?,
                })
            })
            .collect()
    }

    async fn apply_user_changes(&self, group_id: GroupId, changes: &UserChangeSet) -> SyncResult<()> {
        let mut tx = self.pool.begin().await?;

        // grants and role assignments cascade
        for id in &changes.deletes {
            sqlx::query("DELETE FROM users WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }

        for (id, profile) in &changes.profile_updates {
            sqlx::query(
                r#"
                UPDATE users
                SET display_name = ?, email = ?, position = ?, updated_at = CURRENT_TIMESTAMP
                WHERE id = ?
                "#,
            )
            .bind(&profile.display_name)
            .bind(&profile.email)
            .bind(&profile.position)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        }

        // existing balances are never overwritten
        for backfill in &changes.backfills {
            sqlx::query(
                "INSERT OR IGNORE INTO user_grants (user_id, pool_id, granted_total, remaining) VALUES (?, ?, ?, ?)",
            )
            .bind(backfill.user_id)
            .bind(backfill.seed.pool_id)
            .bind(backfill.seed.amount)
            .bind(backfill.seed.amount)
            .execute(&mut *tx)
            .await?;
        }

        for user in &changes.provisions {
            let user_id = sqlx::query(
                r#"
                INSERT INTO users (username, group_id, display_name, email, position, is_external)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&user.username)
            .bind(group_id)
            .bind(&user.profile.display_name)
            .bind(&user.profile.email)
            .bind(&user.profile.position)
            .bind(user.is_external)
            .execute(&mut *tx)
            .await?
            .last_insert_rowid();

            if let Some(role_id) = user.role_id {
                sqlx::query("INSERT OR IGNORE INTO role_assignments (user_id, role_id) VALUES (?, ?)")
                    .bind(user_id)
                    .bind(role_id)
                    .execute(&mut *tx)
                    .await?;
            }

            for seed in &user.grants {
                sqlx::query(
                    "INSERT OR IGNORE INTO user_grants (user_id, pool_id, granted_total, remaining) VALUES (?, ?, ?, ?)",
                )
                .bind(user_id)
                .bind(seed.pool_id)
                .bind(seed.amount)
                .bind(seed.amount)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        debug!(
            "💾 Group {}: {} provisioned, {} updated, {} back-filled, {} deleted",
            group_id,
            changes.provisions.len(),
            changes.profile_updates.len(),
            changes.backfills.len(),
            changes.deletes.len()
        );
        Ok(())
    }
}

#[async_trait]
impl QuotaLedger for SqliteSyncStore {
    async fn pool_capacities(&self) -> SyncResult<HashMap<PoolId, i64>> {
        let rows = sqlx::query("SELECT id, capacity FROM capability_pools")
            .fetch_all(&*self.pool)
            .await?;

        rows.iter()
            .map(|row| -> SyncResult<(PoolId, i64)> { Ok((row.try_get("id")?, row.try_get("capacity")?)) })
            .collect()
    }

    async fn issued_totals(&self) -> SyncResult<HashMap<PoolId, i64>> {
        let rows = sqlx::query(
            r#"
            SELECT pool_id, SUM(granted_total) AS issued
            FROM user_grants
            WHERE granted_total <> 0
            GROUP BY pool_id
            "#,
        )
        .fetch_all(&*self.pool)
        .await?;

        rows.iter()
            .map(|row| -> SyncResult<(PoolId, i64)> { Ok((row.try_get("pool_id")?, row.try_get("issued")?)) })
            .collect()
    }
}

// ===============================
// INSTITUTIONS
// ===============================

#[async_trait]
impl InstitutionStore for SqliteSyncStore {
    async fn load_institutions(&self, level: i64) -> SyncResult<Vec<Institution>> {
        let rows = sqlx::query(
            r#"
            SELECT id, level, remote_id, code, name, region, attachments
            FROM institutions
            WHERE level = ?
            ORDER BY id
            "#,
        )
        .bind(level)
        .fetch_all(&*self.pool)
        .await?;

        rows.iter().map(row_to_institution).collect()
    }

    async fn load_tombstones(&self, level: i64) -> SyncResult<HashMap<String, HashSet<String>>> {
        let rows = sqlx::query("SELECT remote_id, file FROM attachment_tombstones WHERE level = ?")
            .bind(level)
            .fetch_all(&*self.pool)
            .await?;

        let mut tombstones: HashMap<String, HashSet<String>> = HashMap::new();
        for row in rows {
            tombstones
                .entry(row.try_get("remote_id")?)
                .or_default()
                .insert(row.try_get("file")?);
        }
        Ok(tombstones)
    }

    async fn apply_institution_changes(
        &self,
        level: i64,
        upserts: &[InstitutionUpsert],
        known_remote_ids: &[String],
    ) -> SyncResult<PartitionWriteStats> {
        let mut tx = self.pool.begin().await?;
        let mut stats = PartitionWriteStats::default();

        for institution in upserts {
            let attachments = serde_json::to_string(&institution.attachments)?;
            stats.upserted += sqlx::query(
                r#"
                INSERT INTO institutions (level, remote_id, code, name, region, attachments)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT(level, remote_id) DO UPDATE SET
                    code = excluded.code,
                    name = excluded.name,
                    region = excluded.region,
                    attachments = excluded.attachments,
                    updated_at = CURRENT_TIMESTAMP
                "#,
            )
            .bind(level)
            .bind(&institution.remote_id)
            .bind(&institution.code)
            .bind(&institution.name)
            .bind(&institution.region)
            .bind(attachments)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }

        // known ids are staged in a temp table; a level can exceed the bind limit
        sqlx::query("CREATE TEMP TABLE IF NOT EXISTS known_institutions (remote_id TEXT PRIMARY KEY)")
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM known_institutions").execute(&mut *tx).await?;
        for chunk in known_remote_ids.chunks(KNOWN_ID_CHUNK) {
            let mut insert: QueryBuilder<Sqlite> = QueryBuilder::new("INSERT OR IGNORE INTO known_institutions (remote_id) ");
            insert.push_values(chunk, |mut row, remote_id| {
                row.push_bind(remote_id);
            });
            insert.build().execute(&mut *tx).await?;
        }

        stats.deleted = sqlx::query(
            "DELETE FROM institutions WHERE level = ? AND remote_id NOT IN (SELECT remote_id FROM known_institutions)",
        )
        .bind(level)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;
        Ok(stats)
    }

    async fn tombstone_attachment(&self, level: i64, remote_id: &str, file: &str) -> SyncResult<bool> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO attachment_tombstones (level, remote_id, file) VALUES (?, ?, ?)",
        )
        .bind(level)
        .bind(remote_id)
        .bind(file)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            == 1;

        let stored: Option<String> =
            sqlx::query_scalar("SELECT attachments FROM institutions WHERE level = ? AND remote_id = ?")
                .bind(level)
                .bind(remote_id)
                .fetch_optional(&mut *tx)
                .await?;

        if let Some(stored) = stored {
            let mut attachments: Vec<AttachmentEntry> = serde_json::from_str(&stored)?;
            let before = attachments.len();
            attachments.retain(|entry| entry.file != file);
            if attachments.len() != before {
                sqlx::query(
                    "UPDATE institutions SET attachments = ?, updated_at = CURRENT_TIMESTAMP WHERE level = ? AND remote_id = ?",
                )
                .bind(serde_json::to_string(&attachments)?)
                .bind(level)
                .bind(remote_id)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        debug!("🪦 Tombstoned {} for institution {}/{} (new: {})", file, level, remote_id, inserted);
        Ok(inserted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::repositories::{GrantBackfill, GrantSeed, GroupFields, NewUser, UserProfile};
    use crate::infrastructure::database_connection::DatabaseConnection;

    async fn store() -> SqliteSyncStore {
        let db = DatabaseConnection::new("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        SqliteSyncStore::new(db.pool().clone())
    }

    fn profile(name: &str) -> UserProfile {
        UserProfile {
            display_name: name.to_string(),
            email: None,
            position: None,
        }
    }

    fn upsert(remote_id: &str, files: &[&str]) -> InstitutionUpsert {
        InstitutionUpsert {
            remote_id: remote_id.to_string(),
            code: format!("C{}", remote_id),
            name: format!("Institution {}", remote_id),
            region: None,
            attachments: files.iter().map(|f| AttachmentEntry::new("2025", *f)).collect(),
        }
    }

    #[tokio::test]
    async fn group_changes_round_trip() {
        let store = store().await;
        let fields = GroupFields {
            remote_code: "HR".into(),
            name: "Human Resources".into(),
            parent_code: None,
            sort_order: 1,
        };
        store
            .apply_group_changes(&GroupChangeSet {
                inserts: vec![fields.clone()],
                default_pool_id: Some(7),
                ..Default::default()
            })
            .await
            .unwrap();

        let groups = store.load_groups().await.unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].default_pool_id, Some(7));
        assert_eq!(groups[0].role_id, None);

        store
            .apply_group_changes(&GroupChangeSet {
                deletes: vec![groups[0].id],
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(store.load_groups().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn deleting_a_group_takes_its_members_and_their_grants() {
        let store = store().await;
        store
            .apply_group_changes(&GroupChangeSet {
                inserts: vec![GroupFields {
                    remote_code: "OLD".into(),
                    name: "Dissolved".into(),
                    parent_code: None,
                    sort_order: 0,
                }],
                ..Default::default()
            })
            .await
            .unwrap();
        let group_id = store.load_groups().await.unwrap()[0].id;
        sqlx::query("INSERT INTO users (id, username, group_id) VALUES (1, 'kim', ?)")
            .bind(group_id)
            .execute(store.pool())
            .await
            .unwrap();
        sqlx::query("INSERT INTO user_grants (user_id, pool_id, granted_total, remaining) VALUES (1, 1, 40, 40)")
            .execute(store.pool())
            .await
            .unwrap();

        let removed = store
            .apply_group_changes(&GroupChangeSet {
                deletes: vec![group_id],
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(removed, 1);
        assert!(store.load_users(group_id).await.unwrap().is_empty());
        assert!(store.issued_totals().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn provisioning_writes_role_and_grants() {
        let store = store().await;
        let changes = UserChangeSet {
            provisions: vec![NewUser {
                username: "kim".into(),
                profile: profile("Kim"),
                is_external: false,
                role_id: Some(3),
                grants: vec![GrantSeed { pool_id: 1, amount: 30 }, GrantSeed { pool_id: 2, amount: 5 }],
            }],
            ..Default::default()
        };
        store.apply_user_changes(10, &changes).await.unwrap();

        let users = store.load_users(10).await.unwrap();
        assert_eq!(users.len(), 1);
        let grants = store.load_user_grants(10).await.unwrap();
        assert_eq!(grants.len(), 2);
        assert!(grants.iter().all(|g| g.granted_total == g.remaining));

        let (roles,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM role_assignments WHERE role_id = 3")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(roles, 1);

        let issued = store.issued_totals().await.unwrap();
        assert_eq!(issued.get(&1), Some(&30));
        assert_eq!(issued.get(&2), Some(&5));
    }

    #[tokio::test]
    async fn backfill_never_overwrites_an_existing_balance() {
        let store = store().await;
        sqlx::query("INSERT INTO users (id, username, group_id) VALUES (1, 'lee', 10)")
            .execute(store.pool())
            .await
            .unwrap();
        sqlx::query("INSERT INTO user_grants (user_id, pool_id, granted_total, remaining) VALUES (1, 1, 30, 4)")
            .execute(store.pool())
            .await
            .unwrap();

        let changes = UserChangeSet {
            backfills: vec![
                GrantBackfill { user_id: 1, seed: GrantSeed { pool_id: 1, amount: 99 } },
                GrantBackfill { user_id: 1, seed: GrantSeed { pool_id: 2, amount: 20 } },
            ],
            ..Default::default()
        };
        store.apply_user_changes(10, &changes).await.unwrap();

        let mut grants = store.load_user_grants(10).await.unwrap();
        grants.sort_by_key(|g| g.pool_id);
        assert_eq!((grants[0].granted_total, grants[0].remaining), (30, 4));
        assert_eq!((grants[1].granted_total, grants[1].remaining), (20, 20));
    }

    #[tokio::test]
    async fn institution_partition_upserts_and_prunes_only_its_level() {
        let store = store().await;
        store
            .apply_institution_changes(1, &[upsert("a", &[]), upsert("b", &[])], &["a".into(), "b".into()])
            .await
            .unwrap();
        store
            .apply_institution_changes(2, &[upsert("a", &[])], &["a".into()])
            .await
            .unwrap();

        let stats = store
            .apply_institution_changes(1, &[upsert("a", &["x.pdf"])], &["a".into()])
            .await
            .unwrap();
        assert_eq!(stats.deleted, 1);

        let level1 = store.load_institutions(1).await.unwrap();
        assert_eq!(level1.len(), 1);
        assert_eq!(level1[0].attachments, vec![AttachmentEntry::new("2025", "x.pdf")]);
        assert_eq!(store.load_institutions(2).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn empty_snapshot_clears_the_level() {
        let store = store().await;
        store
            .apply_institution_changes(3, &[upsert("a", &[])], &["a".into()])
            .await
            .unwrap();
        let stats = store.apply_institution_changes(3, &[], &[]).await.unwrap();
        assert_eq!(stats.deleted, 1);
        assert!(store.load_institutions(3).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn tombstone_strips_the_file_once() {
        let store = store().await;
        store
            .apply_institution_changes(1, &[upsert("a", &["keep.pdf", "drop.pdf"])], &["a".into()])
            .await
            .unwrap();

        assert!(store.tombstone_attachment(1, "a", "drop.pdf").await.unwrap());
        assert!(!store.tombstone_attachment(1, "a", "drop.pdf").await.unwrap());

        let institution = &store.load_institutions(1).await.unwrap()[0];
        assert_eq!(institution.attachments, vec![AttachmentEntry::new("2025", "keep.pdf")]);
        let tombstones = store.load_tombstones(1).await.unwrap();
        assert!(tombstones["a"].contains("drop.pdf"));
    }

    #[tokio::test]
    async fn tombstones_outlive_a_pruned_row() {
        let store = store().await;
        store
            .apply_institution_changes(1, &[upsert("a", &["drop.pdf"])], &["a".into()])
            .await
            .unwrap();
        store.tombstone_attachment(1, "a", "drop.pdf").await.unwrap();

        store.apply_institution_changes(1, &[], &[]).await.unwrap();
        assert!(store.load_institutions(1).await.unwrap().is_empty());

        let tombstones = store.load_tombstones(1).await.unwrap();
        assert!(tombstones["a"].contains("drop.pdf"));
        assert!(store.load_tombstones(2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn prune_handles_more_ids_than_the_bind_limit() {
        let store = store().await;
        store
            .apply_institution_changes(1, &[upsert("a", &[]), upsert("gone", &[])], &["a".into(), "gone".into()])
            .await
            .unwrap();

        let mut known: Vec<String> = (0..40_000).map(|i| format!("r{}", i)).collect();
        known.push("a".into());
        let stats = store.apply_institution_changes(1, &[], &known).await.unwrap();

        assert_eq!(stats.deleted, 1);
        let level1 = store.load_institutions(1).await.unwrap();
        assert_eq!(level1.len(), 1);
        assert_eq!(level1[0].remote_id, "a");
    }
}
