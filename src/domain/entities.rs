//! Domain entities
//!
//! Local mirror of the directory: groups, users and institutions, plus the
//! capability pools (Ai) and the per-group / per-user grants drawn from them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type PoolId = i64;
pub type GroupId = i64;
pub type UserId = i64;
pub type InstitutionId = i64;
pub type RoleId = i64;

/// Budget with a total issuable capacity (`Ai`). Capacity is administrative only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityPool {
    pub id: PoolId,
    pub name: String,
    pub capacity: i64,
}

/// Organizational unit mirrored from the directory hierarchy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: GroupId,
    pub remote_code: String,
    pub name: String,
    pub parent_code: Option<String>,
    pub sort_order: i64,
    /// Role handed to every user provisioned into this group.
    pub role_id: Option<RoleId>,
    pub default_pool_id: Option<PoolId>,
}

/// Initial grant (`Group_ai`) applied when a user is provisioned into the group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupGrant {
    pub group_id: GroupId,
    pub pool_id: PoolId,
    pub initial_grant: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    /// Staff login id, or national id for external assessors.
    pub username: String,
    pub group_id: GroupId,
    pub display_name: String,
    pub email: Option<String>,
    pub position: Option<String>,
    pub is_external: bool,
}

/// Per-user balance (`User_ai`). Unique per (user, pool).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserGrant {
    pub user_id: UserId,
    pub pool_id: PoolId,
    /// Monotonic; only admin top-ups raise it after provisioning.
    pub granted_total: i64,
    /// Live balance, consumed by interactive usage.
    pub remaining: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleAssignment {
    pub user_id: UserId,
    pub role_id: RoleId,
}

/// One certification file attached to an institution for a given year.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttachmentEntry {
    #[serde(deserialize_with = "crate::domain::remote::string_or_number")]
    pub year: String,
    pub file: String,
}

impl AttachmentEntry {
    pub fn new(year: impl Into<String>, file: impl Into<String>) -> Self {
        Self {
            year: year.into(),
            file: file.into(),
        }
    }
}

/// Institution (`Academy`), unique per (level, remote_id).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Institution {
    pub id: InstitutionId,
    pub level: i64,
    pub remote_id: String,
    pub code: String,
    pub name: String,
    pub region: Option<String>,
    pub attachments: Vec<AttachmentEntry>,
}

/// Deliberately removed (institution, file) pair (`SarHistory`). Append-only.
/// Keyed by the directory identity so it outlives the local row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentTombstone {
    pub level: i64,
    pub remote_id: String,
    pub file: String,
    pub removed_at: DateTime<Utc>,
}
