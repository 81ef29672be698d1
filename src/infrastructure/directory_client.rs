//! HTTP client for the directory service
//!
//! Every call goes through `RetryPolicy::execute`, so timeouts, backoff and
//! down/rejected classification are uniform across endpoints. The two static
//! credential headers from config are attached to every request.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, ClientBuilder};
use serde::de::DeserializeOwned;
use tracing::{debug, info};
use url::Url;

use crate::domain::entities::AttachmentEntry;
use crate::domain::remote::{DirectoryApi, Page, RemoteGroup, RemoteInstitution, RemoteUser};
use crate::error::{SyncError, SyncResult};
use crate::infrastructure::config::DirectoryConfig;
use crate::infrastructure::retry_policy::{AttemptFailure, RetryPolicy};

#[derive(Clone)]
pub struct HttpDirectoryClient {
    client: Client,
    base_url: Url,
    policy: RetryPolicy,
}

impl HttpDirectoryClient {
    /// Build a client from config. Fails on a malformed base URL or header.
    pub fn from_config(config: &DirectoryConfig, policy: RetryPolicy) -> SyncResult<Self> {
        let mut base_url = Url::parse(&config.base_url)
            .map_err(|e| SyncError::Config(format!("Invalid directory base_url '{}': {}", config.base_url, e)))?;
        // Url::join drops the last segment unless the path ends with '/'
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let mut headers = HeaderMap::new();
        for credential in &config.credentials {
            let name = HeaderName::from_bytes(credential.header.as_bytes())
                .map_err(|e| SyncError::Config(format!("Invalid credential header '{}': {}", credential.header, e)))?;
            let mut value = HeaderValue::from_str(&credential.value)
                .map_err(|e| SyncError::Config(format!("Invalid value for header '{}': {}", credential.header, e)))?;
            value.set_sensitive(true);
            headers.insert(name, value);
        }

        let client = ClientBuilder::new()
            .default_headers(headers)
            .user_agent(&config.user_agent)
            .gzip(true)
            .build()
            .map_err(|e| SyncError::Config(format!("Failed to create HTTP client: {e}")))?;

        info!(
            "🌐 Directory client ready: {} (timeout {:?}, max attempts {})",
            base_url,
            policy.request_timeout(),
            policy.max_attempts
        );

        Ok(Self {
            client,
            base_url,
            policy,
        })
    }

    fn endpoint(&self, path: &str, query: &[(&str, String)]) -> SyncResult<Url> {
        let mut url = self
            .base_url
            .join(path)
            .map_err(|e| SyncError::Config(format!("Invalid endpoint path '{path}': {e}")))?;
        if !query.is_empty() {
            url.query_pairs_mut()
                .extend_pairs(query.iter().map(|(k, v)| (*k, v.as_str())));
        }
        Ok(url)
    }

    async fn get_json<T: DeserializeOwned>(&self, operation: &str, url: Url) -> SyncResult<T> {
        debug!("🌐 HTTP GET ({}): {}", operation, url);
        self.policy
            .execute(operation, || {
                let request = self.client.get(url.clone());
                async move {
                    let response = request
                        .send()
                        .await
                        .map_err(|e| AttemptFailure::NoResponse(e.to_string()))?;
                    let status = response.status();
                    if !status.is_success() {
                        let detail = response.text().await.unwrap_or_default();
                        return Err(AttemptFailure::Status {
                            status: status.as_u16(),
                            detail: truncate(&detail, 200),
                        });
                    }
                    response
                        .json::<T>()
                        .await
                        .map_err(|e| AttemptFailure::Decode(e.to_string()))
                }
            })
            .await
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

fn paging(start: u64, length: u64) -> [(&'static str, String); 2] {
    [("start", start.to_string()), ("length", length.to_string())]
}

#[async_trait]
impl DirectoryApi for HttpDirectoryClient {
    async fn list_groups(&self) -> SyncResult<Vec<RemoteGroup>> {
        let url = self.endpoint("groups", &[])?;
        let page: Page<RemoteGroup> = self.get_json("list_groups", url).await?;
        Ok(page.data)
    }

    async fn list_users_by_group(
        &self,
        group_code: &str,
        start: u64,
        length: u64,
    ) -> SyncResult<Page<RemoteUser>> {
        let mut url = self.endpoint("groups", &paging(start, length))?;
        url.path_segments_mut()
            .map_err(|()| SyncError::Config("Directory base_url cannot be a base".into()))?
            .pop_if_empty()
            .push(group_code)
            .push("users");
        self.get_json("list_users_by_group", url).await
    }

    async fn list_external_assessors(&self, start: u64, length: u64) -> SyncResult<Page<RemoteUser>> {
        let url = self.endpoint("external-assessors", &paging(start, length))?;
        self.get_json("list_external_assessors", url).await
    }

    async fn list_institutions(
        &self,
        level: i64,
        start: u64,
        length: u64,
    ) -> SyncResult<Page<RemoteInstitution>> {
        let [start, length] = paging(start, length);
        let url = self.endpoint("institutions", &[("level", level.to_string()), start, length])?;
        self.get_json("list_institutions", url).await
    }

    async fn list_attachments(&self, institution_code: &str) -> SyncResult<Vec<AttachmentEntry>> {
        let mut url = self.endpoint("institutions", &[])?;
        url.path_segments_mut()
            .map_err(|()| SyncError::Config("Directory base_url cannot be a base".into()))?
            .pop_if_empty()
            .push(institution_code)
            .push("attachments");
        self.get_json("list_attachments", url).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::config::{CredentialHeader, DirectoryConfig};

    fn config(base_url: &str) -> DirectoryConfig {
        DirectoryConfig {
            base_url: base_url.to_string(),
            credentials: vec![
                CredentialHeader { header: "X-Api-Key".into(), value: "key".into() },
                CredentialHeader { header: "X-Api-Secret".into(), value: "secret".into() },
            ],
            ..DirectoryConfig::default()
        }
    }

    #[test]
    fn endpoints_keep_the_base_path() {
        let client = HttpDirectoryClient::from_config(&config("https://dir.example.org/api/v1"), RetryPolicy::default())
            .unwrap();
        let url = client.endpoint("institutions", &[("level", "2".into())]).unwrap();
        assert_eq!(url.as_str(), "https://dir.example.org/api/v1/institutions?level=2");
    }

    #[test]
    fn group_codes_are_path_escaped() {
        let client =
            HttpDirectoryClient::from_config(&config("https://dir.example.org/api/"), RetryPolicy::default()).unwrap();
        let mut url = client.endpoint("groups", &paging(0, 50)).unwrap();
        url.path_segments_mut().unwrap().pop_if_empty().push("HR/01").push("users");
        assert_eq!(url.as_str(), "https://dir.example.org/api/groups/HR%2F01/users?start=0&length=50");
    }

    #[test]
    fn malformed_settings_are_config_errors() {
        assert!(matches!(
            HttpDirectoryClient::from_config(&config("not a url"), RetryPolicy::default()),
            Err(SyncError::Config(_))
        ));

        let mut bad_header = config("https://dir.example.org/");
        bad_header.credentials[0].header = "bad header".into();
        assert!(matches!(
            HttpDirectoryClient::from_config(&bad_header, RetryPolicy::default()),
            Err(SyncError::Config(_))
        ));
    }
}
