//! Schedule driver
//!
//! Fires each configured job once a day at its wall-clock time in a fixed
//! UTC offset, and once at start-up in configured order. Jobs run one at a
//! time on the scheduler task. A failing job is logged and never stops the
//! schedule. Shutdown is observed while waiting, between jobs.

#![allow(clippy::uninlined_format_args)]

use std::fmt;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, FixedOffset, NaiveTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::application::group_sync::GroupSyncService;
use crate::application::institution_sync::InstitutionSyncService;
use crate::application::user_sync::UserSyncService;
use crate::error::SyncError;
use crate::infrastructure::config::{parse_time_of_day, ConfigError, ScheduleConfig, ScheduleEntryConfig};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncJob {
    Groups,
    Users,
    Institutions(Vec<i64>),
}

impl fmt::Display for SyncJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Groups => write!(f, "group sync"),
            Self::Users => write!(f, "user sync"),
            Self::Institutions(levels) => write!(f, "institution sync {:?}", levels),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleEntry {
    pub job: SyncJob,
    pub at: NaiveTime,
}

impl ScheduleEntry {
    pub fn from_config(entry: &ScheduleEntryConfig) -> Result<Self, ConfigError> {
        let job = match entry.job.as_str() {
            "groups" => SyncJob::Groups,
            "users" => SyncJob::Users,
            "institutions" => SyncJob::Institutions(entry.levels.clone()),
            other => {
                return Err(ConfigError::Validation {
                    message: format!("unknown schedule job '{}'", other),
                });
            }
        };
        Ok(Self {
            job,
            at: parse_time_of_day(&entry.at)?,
        })
    }

    /// First instant strictly after `after` whose wall-clock time is `self.at`.
    pub fn next_occurrence(&self, after: DateTime<FixedOffset>) -> DateTime<FixedOffset> {
        let offset = *after.offset();
        let local = after.date_naive().and_time(self.at);
        let utc = local - ChronoDuration::seconds(i64::from(offset.local_minus_utc()));
        let candidate = DateTime::<FixedOffset>::from_naive_utc_and_offset(utc, offset);
        if candidate > after {
            candidate
        } else {
            candidate + ChronoDuration::days(1)
        }
    }
}

/// Runs one job to completion.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run_job(&self, job: &SyncJob) -> anyhow::Result<()>;
}

/// The three sync services behind one runner.
pub struct SyncJobs {
    groups: GroupSyncService,
    users: UserSyncService,
    institutions: InstitutionSyncService,
}

impl SyncJobs {
    pub fn new(groups: GroupSyncService, users: UserSyncService, institutions: InstitutionSyncService) -> Self {
        Self {
            groups,
            users,
            institutions,
        }
    }
}

#[async_trait]
impl JobRunner for SyncJobs {
    async fn run_job(&self, job: &SyncJob) -> anyhow::Result<()> {
        match job {
            SyncJob::Groups => {
                self.groups.run().await.context("group sync")?;
            }
            SyncJob::Users => {
                self.users.run().await.context("user sync")?;
            }
            SyncJob::Institutions(levels) => {
                self.institutions
                    .run_levels(levels)
                    .await
                    .with_context(|| format!("institution sync {:?}", levels))?;
            }
        }
        Ok(())
    }
}

pub struct Scheduler {
    runner: Arc<dyn JobRunner>,
    entries: Vec<ScheduleEntry>,
    offset: FixedOffset,
    run_on_startup: bool,
}

impl Scheduler {
    pub fn new(runner: Arc<dyn JobRunner>, entries: Vec<ScheduleEntry>, offset: FixedOffset, run_on_startup: bool) -> Self {
        Self {
            runner,
            entries,
            offset,
            run_on_startup,
        }
    }

    pub fn from_config(runner: Arc<dyn JobRunner>, config: &ScheduleConfig) -> Result<Self, ConfigError> {
        let offset = FixedOffset::east_opt(config.utc_offset_hours * 3600).ok_or_else(|| ConfigError::Validation {
            message: format!("invalid utc_offset_hours {}", config.utc_offset_hours),
        })?;
        let entries = config
            .entries
            .iter()
            .map(ScheduleEntry::from_config)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(runner, entries, offset, config.run_on_startup))
    }

    /// Earliest instant after `after` at which some entry is due, with the
    /// indices of every entry due then, in configured order.
    pub fn next_due(&self, after: DateTime<FixedOffset>) -> Option<(DateTime<FixedOffset>, Vec<usize>)> {
        let occurrences: Vec<DateTime<FixedOffset>> = self.entries.iter().map(|e| e.next_occurrence(after)).collect();
        let earliest = occurrences.iter().min().copied()?;
        let due = occurrences
            .iter()
            .enumerate()
            .filter(|(_, at)| **at == earliest)
            .map(|(i, _)| i)
            .collect();
        Some((earliest, due))
    }

    fn now(&self) -> DateTime<FixedOffset> {
        Utc::now().with_timezone(&self.offset)
    }

    async fn run_entry(&self, index: usize) {
        let job = &self.entries[index].job;
        info!("▶️ Starting {}", job);
        let started = std::time::Instant::now();
        match self.runner.run_job(job).await {
            Ok(()) => info!("✅ {} finished in {:?}", job, started.elapsed()),
            Err(e) => match e.downcast_ref::<SyncError>() {
                Some(SyncError::QuotaExceeded { .. }) => warn!("🚫 {} aborted by quota gate: {:#}", job, e),
                Some(SyncError::RemoteDown { .. }) => error!("❌ {} abandoned, directory down: {:#}", job, e),
                _ => error!("❌ {} failed: {:#}", job, e),
            },
        }
    }

    /// Run until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            "🗓️ Scheduler started with {} entr(ies) at UTC{}",
            self.entries.len(),
            self.offset
        );

        if self.run_on_startup {
            for index in 0..self.entries.len() {
                if shutdown.is_cancelled() {
                    info!("Scheduler stopped during start-up run");
                    return;
                }
                self.run_entry(index).await;
            }
        }

        // Fired occurrences are tracked so a fast job cannot fire twice.
        let mut cursor = self.now();
        loop {
            let Some((due_at, due)) = self.next_due(cursor) else {
                info!("No schedule entries, waiting for shutdown");
                shutdown.cancelled().await;
                return;
            };

            let wait = (due_at - self.now()).to_std().unwrap_or_default();
            info!("⏰ Next run at {} (in {:?})", due_at, wait);

            tokio::select! {
                () = shutdown.cancelled() => {
                    info!("Scheduler received shutdown signal");
                    return;
                }
                () = tokio::time::sleep(wait) => {}
            }

            for index in due {
                if shutdown.is_cancelled() {
                    info!("Scheduler stopped between jobs");
                    return;
                }
                self.run_entry(index).await;
            }
            cursor = due_at.max(self.now());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Mutex;

    fn kst() -> FixedOffset {
        FixedOffset::east_opt(9 * 3600).unwrap()
    }

    fn entry(job: SyncJob, hh: u32, mm: u32) -> ScheduleEntry {
        ScheduleEntry {
            job,
            at: NaiveTime::from_hms_opt(hh, mm, 0).unwrap(),
        }
    }

    #[derive(Default)]
    struct RecordingRunner {
        jobs: Mutex<Vec<SyncJob>>,
        fail_users: bool,
    }

    #[async_trait]
    impl JobRunner for RecordingRunner {
        async fn run_job(&self, job: &SyncJob) -> anyhow::Result<()> {
            self.jobs.lock().unwrap().push(job.clone());
            if self.fail_users && *job == SyncJob::Users {
                return Err(SyncError::RemoteDown {
                    operation: "list_users_by_group".into(),
                    detail: "503".into(),
                }
                .into());
            }
            Ok(())
        }
    }

    #[test]
    fn next_occurrence_rolls_to_tomorrow_once_passed() {
        let e = entry(SyncJob::Groups, 1, 0);
        let before = kst().with_ymd_and_hms(2026, 3, 1, 0, 30, 0).unwrap();
        let after = kst().with_ymd_and_hms(2026, 3, 1, 1, 0, 0).unwrap();

        assert_eq!(e.next_occurrence(before), kst().with_ymd_and_hms(2026, 3, 1, 1, 0, 0).unwrap());
        assert_eq!(e.next_occurrence(after), kst().with_ymd_and_hms(2026, 3, 2, 1, 0, 0).unwrap());
    }

    #[test]
    fn next_occurrence_uses_the_configured_offset() {
        let e = entry(SyncJob::Users, 1, 30);
        let now = kst().with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        let next = e.next_occurrence(now);
        // 01:30 KST is 16:30 UTC the day before
        assert_eq!(next.with_timezone(&Utc), Utc.with_ymd_and_hms(2026, 2, 28, 16, 30, 0).unwrap());
    }

    #[test]
    fn default_schedule_fires_in_time_order() {
        let scheduler = Scheduler::from_config(Arc::new(RecordingRunner::default()), &ScheduleConfig::default()).unwrap();
        let mut cursor = kst().with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        let mut fired = Vec::new();
        for _ in 0..4 {
            let (at, due) = scheduler.next_due(cursor).unwrap();
            fired.push((at.format("%H:%M").to_string(), due));
            cursor = at;
        }
        assert_eq!(
            fired,
            vec![
                ("01:00".to_string(), vec![0]),
                ("01:30".to_string(), vec![1]),
                ("02:00".to_string(), vec![2]),
                ("03:00".to_string(), vec![3]),
            ]
        );
    }

    #[test]
    fn simultaneous_entries_keep_configured_order() {
        let scheduler = Scheduler::new(
            Arc::new(RecordingRunner::default()),
            vec![entry(SyncJob::Users, 2, 0), entry(SyncJob::Groups, 2, 0)],
            kst(),
            false,
        );
        let (_, due) = scheduler.next_due(kst().with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap()).unwrap();
        assert_eq!(due, vec![0, 1]);
    }

    #[tokio::test]
    async fn startup_runs_every_job_and_survives_failures() {
        let runner = Arc::new(RecordingRunner {
            fail_users: true,
            ..Default::default()
        });
        let scheduler = Scheduler::from_config(runner.clone(), &ScheduleConfig::default()).unwrap();
        let shutdown = CancellationToken::new();

        let handle = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { scheduler.run(shutdown).await })
        };
        while runner.jobs.lock().unwrap().len() < 4 {
            tokio::task::yield_now().await;
        }
        shutdown.cancel();
        handle.await.unwrap();

        let jobs = runner.jobs.lock().unwrap().clone();
        assert_eq!(
            jobs,
            vec![
                SyncJob::Groups,
                SyncJob::Users,
                SyncJob::Institutions(vec![1]),
                SyncJob::Institutions(vec![2, 3, 4, 5, 6]),
            ]
        );
    }

    #[tokio::test]
    async fn cancelled_before_start_runs_nothing() {
        let runner = Arc::new(RecordingRunner::default());
        let scheduler = Scheduler::from_config(runner.clone(), &ScheduleConfig::default()).unwrap();
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        scheduler.run(shutdown).await;
        assert!(runner.jobs.lock().unwrap().is_empty());
    }

    #[test]
    fn unknown_jobs_are_rejected() {
        let bad = ScheduleEntryConfig {
            job: "reports".into(),
            at: "04:00".into(),
            levels: vec![],
        };
        assert!(ScheduleEntry::from_config(&bad).is_err());
    }
}
