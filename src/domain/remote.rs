//! Directory service contract
//!
//! Wire shapes returned by the directory and the `DirectoryApi` trait the
//! sync services are written against. The HTTP implementation lives in
//! `infrastructure::directory_client`; tests inject in-memory fakes.

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};

use crate::domain::entities::AttachmentEntry;
use crate::error::SyncResult;

/// One page of a listing: `{ total, data[] }`.
///
/// `total` is kept raw because the directory sends it as a number, as a
/// numeric string, or not at all.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    #[serde(default)]
    pub total: serde_json::Value,
    #[serde(default = "Vec::new")]
    pub data: Vec<T>,
}

impl<T> Page<T> {
    pub fn new(total: u64, data: Vec<T>) -> Self {
        Self {
            total: serde_json::Value::from(total),
            data,
        }
    }

    /// Remote-reported total; `None` when missing or malformed.
    pub fn total_count(&self) -> Option<u64> {
        match &self.total {
            serde_json::Value::Number(n) => n.as_u64(),
            serde_json::Value::String(s) => s.trim().parse::<u64>().ok(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteGroup {
    pub code: String,
    pub name: String,
    #[serde(default)]
    pub parent_code: Option<String>,
    #[serde(default)]
    pub sort_order: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteUser {
    pub username: String,
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub position: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteInstitution {
    #[serde(alias = "id", deserialize_with = "string_or_number")]
    pub remote_id: String,
    pub code: String,
    pub name: String,
    #[serde(default)]
    pub region: Option<String>,
}

/// Remote directory collaborator.
#[async_trait]
pub trait DirectoryApi: Send + Sync {
    /// Full group set, unpaged.
    async fn list_groups(&self) -> SyncResult<Vec<RemoteGroup>>;

    async fn list_users_by_group(
        &self,
        group_code: &str,
        start: u64,
        length: u64,
    ) -> SyncResult<Page<RemoteUser>>;

    async fn list_external_assessors(&self, start: u64, length: u64) -> SyncResult<Page<RemoteUser>>;

    async fn list_institutions(
        &self,
        level: i64,
        start: u64,
        length: u64,
    ) -> SyncResult<Page<RemoteInstitution>>;

    /// Attachments of a single institution, unpaged.
    async fn list_attachments(&self, institution_code: &str) -> SyncResult<Vec<AttachmentEntry>>;
}

/// Accepts `"2024"` and `2024` alike.
pub(crate) fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Int(i64),
        Float(f64),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Text(s) => s,
        Raw::Int(n) => n.to_string(),
        Raw::Float(f) => f.to_string(),
    })
}
