//! Application layer module
//!
//! One service per reconciliation variant plus the schedule driver that
//! runs them.

pub mod group_sync;
pub mod institution_sync;
pub mod scheduler;
pub mod user_sync;

pub use group_sync::{GroupSyncOptions, GroupSyncReport, GroupSyncService};
pub use institution_sync::{InstitutionSyncReport, InstitutionSyncService};
pub use scheduler::{JobRunner, ScheduleEntry, Scheduler, SyncJob, SyncJobs};
pub use user_sync::{UserSyncOptions, UserSyncReport, UserSyncService};
