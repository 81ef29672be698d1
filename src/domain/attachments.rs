//! Deletion-history filter for institution attachments
//!
//! A tombstoned (institution, file) pair must never come back, no matter how
//! often the directory re-supplies it. A failed attachment fetch must never
//! erase what is already stored either.

use std::collections::HashSet;

use tracing::{debug, warn};

use crate::domain::entities::AttachmentEntry;
use crate::error::{SyncError, SyncResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentSource {
    Fetched,
    /// Fetch was rejected; the previously stored list was kept.
    PreviousList,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAttachments {
    pub entries: Vec<AttachmentEntry>,
    pub source: AttachmentSource,
    pub suppressed: usize,
}

/// Drop every entry whose exact file string is tombstoned. Order is preserved.
pub fn filter_tombstoned(
    entries: Vec<AttachmentEntry>,
    tombstones: Option<&HashSet<String>>,
) -> (Vec<AttachmentEntry>, usize) {
    let Some(tombstones) = tombstones.filter(|t| !t.is_empty()) else {
        return (entries, 0);
    };
    let before = entries.len();
    let kept: Vec<AttachmentEntry> = entries
        .into_iter()
        .filter(|entry| !tombstones.contains(&entry.file))
        .collect();
    let suppressed = before - kept.len();
    (kept, suppressed)
}

/// Decide the attachment list an institution ends the pass with.
///
/// A rejected fetch falls back to `previous`; a `RemoteDown` is returned so
/// the whole pass stops before anything is written.
pub fn resolve_attachments(
    institution_code: &str,
    fetched: SyncResult<Vec<AttachmentEntry>>,
    previous: Option<&[AttachmentEntry]>,
    tombstones: Option<&HashSet<String>>,
) -> SyncResult<ResolvedAttachments> {
    match fetched {
        Ok(entries) => {
            let (entries, suppressed) = filter_tombstoned(entries, tombstones);
            if suppressed > 0 {
                debug!(
                    "🪦 Suppressed {} tombstoned attachment(s) for institution {}",
                    suppressed, institution_code
                );
            }
            Ok(ResolvedAttachments {
                entries,
                source: AttachmentSource::Fetched,
                suppressed,
            })
        }
        Err(err @ SyncError::RemoteDown { .. }) => Err(err),
        Err(err) => {
            warn!(
                "⚠️ Attachment fetch failed for institution {}, keeping stored list: {}",
                institution_code, err
            );
            let previous = previous.map(<[AttachmentEntry]>::to_vec).unwrap_or_default();
            let (entries, suppressed) = filter_tombstoned(previous, tombstones);
            Ok(ResolvedAttachments {
                entries,
                source: AttachmentSource::PreviousList,
                suppressed,
            })
        }
    }
}
