//! Institution reconciliation
//!
//! Each level is its own partition keyed by `(level, remote_id)`. Every
//! remote institution has its attachment list re-fetched, filtered against
//! the deletion history, and compared with the stored copy. Changed and new
//! rows are upserted and vanished ones deleted in a single transaction.

#![allow(clippy::uninlined_format_args)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::domain::attachments::{resolve_attachments, AttachmentSource, ResolvedAttachments};
use crate::domain::entities::{AttachmentEntry, Institution};
use crate::domain::reconcile::{plan_partition, LocalRecord, RemoteRecord};
use crate::domain::remote::{DirectoryApi, RemoteInstitution};
use crate::domain::repositories::{InstitutionStore, InstitutionUpsert};
use crate::error::{SyncError, SyncResult};
use crate::infrastructure::executor::run_bounded;
use crate::infrastructure::page_fetcher::PageFetcher;

impl RemoteRecord for RemoteInstitution {
    type Key = String;

    fn sync_key(&self) -> String {
        self.remote_id.clone()
    }
}

impl LocalRecord<RemoteInstitution> for Institution {
    fn sync_key(&self) -> String {
        self.remote_id.clone()
    }

    fn is_stale(&self, remote: &RemoteInstitution) -> bool {
        self.code != remote.code || self.name != remote.name || self.region != remote.region
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InstitutionSyncReport {
    pub level: i64,
    pub fetched: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub deleted: u64,
    /// Institutions whose attachment fetch was rejected and kept their stored list.
    pub attachment_fallbacks: usize,
    /// Attachment entries dropped because they were tombstoned.
    pub attachments_suppressed: usize,
}

pub struct InstitutionSyncService {
    directory: Arc<dyn DirectoryApi>,
    store: Arc<dyn InstitutionStore>,
    fetcher: PageFetcher,
    attachment_concurrency: usize,
}

impl InstitutionSyncService {
    pub fn new(
        directory: Arc<dyn DirectoryApi>,
        store: Arc<dyn InstitutionStore>,
        fetcher: PageFetcher,
        attachment_concurrency: usize,
    ) -> Self {
        Self {
            directory,
            store,
            fetcher,
            attachment_concurrency,
        }
    }

    /// Sync several levels in order. A level failing for any reason other
    /// than the directory being down does not stop the remaining levels; the
    /// first such failure is returned once all levels were attempted.
    pub async fn run_levels(&self, levels: &[i64]) -> SyncResult<Vec<InstitutionSyncReport>> {
        let mut reports = Vec::with_capacity(levels.len());
        let mut first_failure: Option<SyncError> = None;

        for &level in levels {
            match self.run_level(level).await {
                Ok(report) => reports.push(report),
                Err(e) if e.is_remote_down() => return Err(e),
                Err(e) => {
                    error!("❌ Institution level {} failed, continuing with the next level: {}", level, e);
                    first_failure.get_or_insert(e);
                }
            }
        }

        match first_failure {
            Some(e) => Err(e),
            None => Ok(reports),
        }
    }

    pub async fn run_level(&self, level: i64) -> SyncResult<InstitutionSyncReport> {
        info!("🔄 Institution sync started for level {}", level);

        let label = format!("institutions level {}", level);
        let remote = self
            .fetcher
            .fetch_all(&label, |start, length| async move {
                self.directory.list_institutions(level, start, length).await
            })
            .await?;

        let local = self.store.load_institutions(level).await?;
        let tombstones = self.store.load_tombstones(level).await?;

        let mut attachments = self.resolve_all_attachments(&remote, &local, &tombstones).await?;
        let known_remote_ids: Vec<String> = {
            let mut seen = HashSet::new();
            remote
                .iter()
                .filter(|r| seen.insert(r.remote_id.clone()))
                .map(|r| r.remote_id.clone())
                .collect()
        };

        let mut report = InstitutionSyncReport {
            level,
            fetched: remote.len(),
            attachment_fallbacks: attachments
                .values()
                .filter(|a| a.source == AttachmentSource::PreviousList)
                .count(),
            attachments_suppressed: attachments.values().map(|a| a.suppressed).sum(),
            ..Default::default()
        };

        let plan = plan_partition(local, remote);
        if plan.remote_duplicates > 0 {
            warn!(
                "⚠️ Level {}: directory reported {} duplicate institution id(s), first kept",
                level, plan.remote_duplicates
            );
        }

        let mut upserts = Vec::new();
        for record in &plan.inserts {
            let entries = take_entries(&mut attachments, &record.remote_id);
            upserts.push(upsert_of(record, entries));
            report.inserted += 1;
        }
        for matched in &plan.matched {
            let entries = take_entries(&mut attachments, &matched.remote.remote_id);
            if matched.stale || entries != matched.local.attachments {
                upserts.push(upsert_of(&matched.remote, entries));
                report.updated += 1;
            } else {
                report.unchanged += 1;
            }
        }

        if upserts.is_empty() && plan.orphans.is_empty() && plan.duplicates.is_empty() {
            info!("✅ Level {}: {} institution(s) unchanged, nothing to write", level, report.unchanged);
            return Ok(report);
        }

        let stats = self
            .store
            .apply_institution_changes(level, &upserts, &known_remote_ids)
            .await?;
        report.deleted = stats.deleted;

        info!(
            "✅ Level {}: +{} ~{} -{} ({} unchanged, {} attachment fallback(s), {} tombstoned entr(ies) suppressed)",
            level,
            report.inserted,
            report.updated,
            report.deleted,
            report.unchanged,
            report.attachment_fallbacks,
            report.attachments_suppressed
        );
        Ok(report)
    }

    /// Fetch every institution's attachments with bounded concurrency and
    /// settle each list. A `RemoteDown` on any fetch aborts the level.
    async fn resolve_all_attachments(
        &self,
        remote: &[RemoteInstitution],
        local: &[Institution],
        tombstones: &HashMap<String, HashSet<String>>,
    ) -> SyncResult<HashMap<String, ResolvedAttachments>> {
        let stored: HashMap<&str, &Institution> = local.iter().map(|i| (i.remote_id.as_str(), i)).collect();

        let records: Vec<&RemoteInstitution> = remote.iter().collect();
        let fetched = run_bounded(records, self.attachment_concurrency, |record| async move {
            self.directory.list_attachments(&record.code).await
        })
        .await;

        let mut resolved = HashMap::with_capacity(remote.len());
        for (record, result) in remote.iter().zip(fetched) {
            let existing = stored.get(record.remote_id.as_str());
            let previous = existing.map(|i| i.attachments.as_slice());
            let dead = tombstones.get(&record.remote_id);
            let attachments = resolve_attachments(&record.code, result, previous, dead)?;
            resolved.entry(record.remote_id.clone()).or_insert(attachments);
        }
        Ok(resolved)
    }
}

fn take_entries(attachments: &mut HashMap<String, ResolvedAttachments>, remote_id: &str) -> Vec<AttachmentEntry> {
    attachments
        .remove(remote_id)
        .map(|resolved| resolved.entries)
        .unwrap_or_default()
}

fn upsert_of(remote: &RemoteInstitution, attachments: Vec<AttachmentEntry>) -> InstitutionUpsert {
    InstitutionUpsert {
        remote_id: remote.remote_id.clone(),
        code: remote.code.clone(),
        name: remote.name.clone(),
        region: remote.region.clone(),
        attachments,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{remote_institution, FakeDirectory, FakeFailure, MemoryStore};

    fn service(directory: Arc<FakeDirectory>, store: Arc<MemoryStore>) -> InstitutionSyncService {
        InstitutionSyncService::new(directory, store, PageFetcher::new(2, 3), 5)
    }

    fn entry(year: &str, file: &str) -> AttachmentEntry {
        AttachmentEntry::new(year, file)
    }

    #[tokio::test]
    async fn new_institutions_are_stored_with_attachments() {
        let store = Arc::new(MemoryStore::default());
        let directory = Arc::new(
            FakeDirectory::default()
                .with_institutions(1, vec![remote_institution("10", "A"), remote_institution("11", "B"), remote_institution("12", "C")])
                .with_attachments("A", vec![entry("2024", "a.pdf")]),
        );

        let report = service(directory, store.clone()).run_level(1).await.unwrap();

        assert_eq!(report.inserted, 3);
        let stored = store.institutions(1);
        assert_eq!(stored.len(), 3);
        let a = stored.iter().find(|i| i.code == "A").unwrap();
        assert_eq!(a.attachments, vec![entry("2024", "a.pdf")]);
    }

    #[tokio::test]
    async fn tombstoned_files_never_return() {
        let store = Arc::new(MemoryStore::default());
        store.seed_institution(1, "10", "A", vec![entry("2024", "keep.pdf"), entry("2024", "drop.pdf")]);
        store.tombstone_attachment(1, "10", "drop.pdf").await.unwrap();

        let directory = Arc::new(
            FakeDirectory::default()
                .with_institutions(1, vec![remote_institution("10", "A")])
                .with_attachments("A", vec![entry("2024", "keep.pdf"), entry("2024", "drop.pdf")]),
        );
        let service = service(directory, store.clone());

        for _ in 0..2 {
            let report = service.run_level(1).await.unwrap();
            assert_eq!(report.attachments_suppressed, 1);
            assert_eq!(store.institutions(1)[0].attachments, vec![entry("2024", "keep.pdf")]);
        }
    }

    #[tokio::test]
    async fn tombstones_apply_when_an_institution_returns() {
        let store = Arc::new(MemoryStore::default());
        let listing = vec![entry("2024", "keep.pdf"), entry("2024", "drop.pdf")];
        let directory = Arc::new(
            FakeDirectory::default()
                .with_institutions(1, vec![remote_institution("10", "A")])
                .with_attachments("A", listing),
        );
        let service = service(directory.clone(), store.clone());
        service.run_level(1).await.unwrap();
        store.tombstone_attachment(1, "10", "drop.pdf").await.unwrap();

        directory.set_institutions(1, vec![]);
        let report = service.run_level(1).await.unwrap();
        assert_eq!(report.deleted, 1);

        directory.set_institutions(1, vec![remote_institution("10", "A")]);
        let report = service.run_level(1).await.unwrap();

        assert_eq!((report.inserted, report.attachments_suppressed), (1, 1));
        assert_eq!(store.institutions(1)[0].attachments, vec![entry("2024", "keep.pdf")]);
    }

    #[tokio::test]
    async fn rejected_attachment_fetch_keeps_the_stored_list() {
        let store = Arc::new(MemoryStore::default());
        store.seed_institution(1, "10", "A", vec![entry("2023", "old.pdf")]);

        let directory = Arc::new(FakeDirectory::default().with_institutions(1, vec![remote_institution("10", "A")]));
        directory.fail_attachments("A", FakeFailure::Rejected(404));

        let report = service(directory, store.clone()).run_level(1).await.unwrap();

        assert_eq!(report.attachment_fallbacks, 1);
        assert_eq!(store.institutions(1)[0].attachments, vec![entry("2023", "old.pdf")]);
    }

    #[tokio::test]
    async fn attachment_outage_aborts_without_writing() {
        let store = Arc::new(MemoryStore::default());
        store.seed_institution(1, "10", "A", vec![entry("2023", "old.pdf")]);
        store.seed_institution(1, "99", "Z", vec![]);

        let directory = Arc::new(FakeDirectory::default().with_institutions(1, vec![remote_institution("10", "A")]));
        directory.fail_attachments("A", FakeFailure::Down);

        let err = service(directory, store.clone()).run_level(1).await.unwrap_err();

        assert!(err.is_remote_down());
        assert_eq!(store.write_count(), 0);
        assert_eq!(store.institutions(1).len(), 2);
    }

    #[tokio::test]
    async fn vanished_institutions_are_deleted_within_the_level_only() {
        let store = Arc::new(MemoryStore::default());
        store.seed_institution(1, "10", "A", vec![]);
        store.seed_institution(1, "11", "B", vec![]);
        store.seed_institution(2, "11", "B", vec![]);

        let directory = Arc::new(FakeDirectory::default().with_institutions(1, vec![remote_institution("10", "A")]));
        let report = service(directory, store.clone()).run_level(1).await.unwrap();

        assert_eq!(report.deleted, 1);
        assert_eq!(store.institutions(1).len(), 1);
        assert_eq!(store.institutions(2).len(), 1);
    }

    #[tokio::test]
    async fn unchanged_level_is_not_rewritten() {
        let store = Arc::new(MemoryStore::default());
        let directory = Arc::new(
            FakeDirectory::default()
                .with_institutions(1, vec![remote_institution("10", "A")])
                .with_attachments("A", vec![entry("2024", "a.pdf")]),
        );
        let service = service(directory, store.clone());

        service.run_level(1).await.unwrap();
        let writes = store.write_count();
        let report = service.run_level(1).await.unwrap();

        assert_eq!(report.unchanged, 1);
        assert_eq!(store.write_count(), writes);
    }

    #[tokio::test]
    async fn failing_level_does_not_block_the_others() {
        let store = Arc::new(MemoryStore::default());
        store.fail_institution_writes(2);
        let directory = Arc::new(
            FakeDirectory::default()
                .with_institutions(1, vec![remote_institution("10", "A")])
                .with_institutions(2, vec![remote_institution("20", "B")])
                .with_institutions(3, vec![remote_institution("30", "C")]),
        );

        let err = service(directory, store.clone()).run_levels(&[1, 2, 3]).await.unwrap_err();

        assert!(matches!(err, SyncError::Store(_)));
        assert_eq!(store.institutions(1).len(), 1);
        assert!(store.institutions(2).is_empty());
        assert_eq!(store.institutions(3).len(), 1);
    }

    #[tokio::test]
    async fn directory_outage_stops_remaining_levels() {
        let store = Arc::new(MemoryStore::default());
        let directory = Arc::new(
            FakeDirectory::default()
                .with_institutions(1, vec![remote_institution("10", "A")])
                .with_institutions(3, vec![remote_institution("30", "C")]),
        );
        directory.fail_institutions(2, FakeFailure::Down);

        let err = service(directory, store.clone()).run_levels(&[1, 2, 3]).await.unwrap_err();

        assert!(err.is_remote_down());
        assert_eq!(store.institutions(1).len(), 1);
        assert!(store.institutions(3).is_empty());
    }
}
