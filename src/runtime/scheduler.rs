/// Background cron scheduler service
///
/// Manages published schedules using tokio-cron-scheduler. Each job fire is
/// gated by its `FireGuard` and handed to the schedule worker pool; published
/// schedules are persisted and recovered at startup.

use crate::{
    runtime::{
        dispatcher::DispatchOutcome,
        guard::{FireGuard, SkipReason},
        lifecycle::RunStatus,
        worker::ScheduleWorkerPool,
    },
    schedule::{ScheduleJob, ScheduleStorage},
};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::sync::RwLock;
use tokio_cron_scheduler::{Job, JobScheduler};
use uuid::Uuid;

/// Scheduler-side bookkeeping of one registered job
struct ActiveJob {
    uuid: Uuid,
    job: ScheduleJob,
    guard: Arc<FireGuard>,
}

/// Entry of `list_active_jobs`
#[derive(Debug, Clone, Serialize)]
pub struct ActiveJobInfo {
    pub id: String,
    pub job_id: String,
    pub name: String,
    pub cron_expression: String,
    pub flow_version_id: String,
    pub next_fire_time: Option<DateTime<Utc>>,
    pub running: bool,
}

/// What happened to one fire
#[derive(Debug, Clone, PartialEq)]
pub enum FireOutcome {
    Executed { run_id: String, status: RunStatus },
    SkippedOverlap,
    SkippedMisfire { due: DateTime<Utc> },
    Failed(String),
}

pub struct CronSchedulerService {
    scheduler: Arc<RwLock<JobScheduler>>,
    jobs: Arc<RwLock<HashMap<String, ActiveJob>>>, // schedule_id -> registered job
    workers: Arc<ScheduleWorkerPool>,
    storage: Option<ScheduleStorage>,
    misfire_grace: Duration,
}

impl CronSchedulerService {
    pub async fn new(workers: ScheduleWorkerPool, misfire_grace: Duration) -> Result<Self> {
        let scheduler = JobScheduler::new().await?;

        Ok(Self {
            scheduler: Arc::new(RwLock::new(scheduler)),
            jobs: Arc::new(RwLock::new(HashMap::new())),
            workers: Arc::new(workers),
            storage: None,
            misfire_grace,
        })
    }

    /// Persist published schedules and recover them on `start`
    pub fn with_storage(mut self, storage: ScheduleStorage) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Recover persisted schedules and start ticking
    pub async fn start(&self) -> Result<()> {
        tracing::info!("⏰ Starting cron scheduler service");

        let recovered = self.recover_published().await?;

        {
            let scheduler = self.scheduler.read().await;
            scheduler.start().await?;
        }

        tracing::info!("✅ Cron scheduler started with {} recovered schedules", recovered);
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        tracing::info!("⏹️ Stopping cron scheduler service");

        {
            let mut jobs = self.jobs.write().await;
            jobs.clear();
            tracing::debug!("🧹 Cleared job map during shutdown");
        }

        {
            let mut scheduler = self.scheduler.write().await;
            scheduler.shutdown().await?;
        }

        tracing::info!("✅ Cron scheduler stopped");
        Ok(())
    }

    /// Register `job`, replacing any job with the same id
    ///
    /// The job map stays write-locked from unscheduling the previous job until
    /// the new one is recorded, and a replaced job hands its `FireGuard` on.
    pub async fn add_job(&self, job: ScheduleJob) -> Result<()> {
        let schedule = job.cron_schedule()?;
        let cron = job.normalized_cron();

        let mut jobs = self.jobs.write().await;
        let guard = match jobs.remove(&job.id) {
            Some(previous) => {
                self.unschedule(&previous).await;
                previous.guard.reschedule(schedule);
                previous.guard
            }
            None => Arc::new(FireGuard::new(schedule, self.misfire_grace)),
        };

        let cron_job = {
            let job = job.clone();
            let guard = Arc::clone(&guard);
            let workers = Arc::clone(&self.workers);

            Job::new_async(cron.as_str(), move |_uuid, _l| {
                let job = job.clone();
                let guard = Arc::clone(&guard);
                let workers = Arc::clone(&workers);

                Box::pin(async move {
                    tracing::debug!("🔔 Cron fire for schedule {}", job.id);
                    fire_job(&job, &guard, &workers).await;
                })
            })?
        };

        let uuid = {
            let scheduler = self.scheduler.read().await;
            scheduler.add(cron_job).await?
        };

        tracing::info!("📅 Scheduled {} ({}) -> version {}", job.job_id(), cron, job.flow_version_id);

        jobs.insert(job.id.clone(), ActiveJob { uuid, job, guard });
        Ok(())
    }

    /// Unregister a job; `false` when it was not scheduled
    pub async fn remove_job(&self, schedule_id: &str) -> Result<bool> {
        let mut jobs = self.jobs.write().await;
        let Some(active) = jobs.remove(schedule_id) else {
            return Ok(false);
        };

        self.unschedule(&active).await;
        Ok(true)
    }

    /// Replace a job definition
    pub async fn update_job(&self, job: ScheduleJob) -> Result<()> {
        self.add_job(job).await
    }

    async fn unschedule(&self, active: &ActiveJob) {
        let scheduler = self.scheduler.read().await;
        if let Err(e) = scheduler.remove(&active.uuid).await {
            tracing::warn!("⚠️ Failed to remove job {} from scheduler: {}", active.job.job_id(), e);
        } else {
            tracing::debug!("🛑 Removed cron job {}", active.job.job_id());
        }
    }

    pub async fn list_active_jobs(&self) -> Vec<ActiveJobInfo> {
        let jobs = self.jobs.read().await;
        let mut active: Vec<ActiveJobInfo> = jobs
            .values()
            .map(|active| ActiveJobInfo {
                id: active.job.id.clone(),
                job_id: active.job.job_id(),
                name: active.job.name.clone(),
                cron_expression: active.job.cron_expression.clone(),
                flow_version_id: active.job.flow_version_id.clone(),
                next_fire_time: active.job.next_fire_time(),
                running: active.guard.is_running(),
            })
            .collect();
        active.sort_by(|a, b| a.id.cmp(&b.id));
        active
    }

    /// Persist and schedule (add or update)
    pub async fn publish(&self, job: ScheduleJob) -> Result<()> {
        job.cron_schedule()?;

        if let Some(storage) = &self.storage {
            storage.save_schedule(&job).await?;
        }

        if job.is_active {
            self.update_job(job).await
        } else {
            self.remove_job(&job.id).await.map(|_| ())
        }
    }

    /// Forget a schedule; `false` when it was neither stored nor scheduled
    pub async fn unpublish(&self, schedule_id: &str) -> Result<bool> {
        let deleted = match &self.storage {
            Some(storage) => storage.delete_schedule(schedule_id).await?,
            None => false,
        };
        let removed = self.remove_job(schedule_id).await?;
        Ok(deleted || removed)
    }

    /// Schedule every active persisted job, skipping the ones that fail
    pub async fn recover_published(&self) -> Result<usize> {
        let Some(storage) = &self.storage else {
            return Ok(0);
        };

        let mut recovered = 0;
        for job in storage.list_active().await? {
            let job_id = job.job_id();
            match self.add_job(job).await {
                Ok(()) => recovered += 1,
                Err(e) => tracing::warn!("⚠️ Skipping schedule {} during recovery: {:#}", job_id, e),
            }
        }

        tracing::info!("📊 Recovered {} published schedules", recovered);
        Ok(recovered)
    }

    /// Fire a registered job right now, as the cron callback would
    pub async fn fire(&self, schedule_id: &str) -> Option<FireOutcome> {
        let (job, guard) = {
            let jobs = self.jobs.read().await;
            let active = jobs.get(schedule_id)?;
            (active.job.clone(), Arc::clone(&active.guard))
        };
        Some(fire_job(&job, &guard, &self.workers).await)
    }
}

async fn fire_job(job: &ScheduleJob, guard: &Arc<FireGuard>, workers: &ScheduleWorkerPool) -> FireOutcome {
    let permit = match guard.try_begin(Utc::now()) {
        Ok(permit) => permit,
        Err(SkipReason::Overlap) => {
            tracing::warn!("⏭️ Skipping fire of {}: previous run still executing", job.job_id());
            return FireOutcome::SkippedOverlap;
        }
        Err(SkipReason::Misfire { due }) => {
            tracing::warn!("⏭️ Skipping fire of {}: tick due at {} missed the grace window", job.job_id(), due);
            return FireOutcome::SkippedMisfire { due };
        }
    };

    if permit.missed > 0 {
        tracing::info!("🔁 Coalesced {} missed ticks of {} into one run", permit.missed, job.job_id());
    }

    let outcome = match workers.submit(job.clone()).await {
        Ok(DispatchOutcome { run_id, status, response }) => {
            if status == RunStatus::Completed {
                tracing::info!("✅ Schedule {} run {} completed", job.id, run_id);
            } else {
                tracing::error!("❌ Schedule {} run {} failed with status {}", job.id, run_id, response.status);
            }
            FireOutcome::Executed { run_id, status }
        }
        Err(e) => {
            tracing::error!("❌ Schedule {} could not be executed: {:#}", job.id, e);
            FireOutcome::Failed(e.to_string())
        }
    };

    drop(permit);
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExecutionMode, LogConfig};
    use crate::listeners::ListenerRegistry;
    use crate::logs::{ExecutionKey, LogStore};
    use crate::runtime::dispatcher::Dispatcher;
    use crate::runtime::lifecycle::RunTracker;
    use crate::runtime::program::{ExecutedNode, GraphProgram};
    use crate::runtime::registry::ProgramRegistry;
    use crate::runtime::test_support::ScriptedInterpreter;

    async fn service(delay: Duration) -> CronSchedulerService {
        service_with_logs(delay).await.0
    }

    async fn service_with_logs(delay: Duration) -> (CronSchedulerService, Arc<LogStore>) {
        let interpreter = ScriptedInterpreter::new(vec![ExecutedNode::new("tick", "Cron")]).with_delay(delay);
        let programs = ProgramRegistry::new();
        programs.register(Arc::new(
            GraphProgram::new("v1", Arc::new(interpreter)).with_entry_node("tick").for_schedule(),
        ));

        let logs = Arc::new(LogStore::new(&LogConfig::default()));
        let dispatcher = Arc::new(Dispatcher::new(
            ExecutionMode::Local,
            Arc::new(programs),
            Arc::new(RunTracker::default()),
            Arc::clone(&logs),
            Arc::new(ListenerRegistry::new(Duration::from_secs(60))),
        ));
        let workers = ScheduleWorkerPool::spawn(2, dispatcher).unwrap();
        let scheduler = CronSchedulerService::new(workers, Duration::from_secs(300)).await.unwrap();
        (scheduler, logs)
    }

    #[tokio::test]
    async fn overlapping_fires_run_once() {
        let scheduler = service(Duration::from_millis(300)).await;
        scheduler
            .add_job(ScheduleJob::new("s1", "every minute", "* * * * *", "v1"))
            .await
            .unwrap();

        let (first, second) = tokio::join!(scheduler.fire("s1"), scheduler.fire("s1"));
        let outcomes = [first.unwrap(), second.unwrap()];

        let executed = outcomes
            .iter()
            .filter(|o| matches!(o, FireOutcome::Executed { status: RunStatus::Completed, .. }))
            .count();
        let skipped = outcomes.iter().filter(|o| **o == FireOutcome::SkippedOverlap).count();
        assert_eq!(executed, 1);
        assert_eq!(skipped, 1);
    }

    #[tokio::test]
    async fn update_replaces_and_remove_forgets() {
        let scheduler = service(Duration::ZERO).await;
        scheduler
            .add_job(ScheduleJob::new("s1", "hourly", "0 * * * *", "v1"))
            .await
            .unwrap();
        scheduler
            .update_job(ScheduleJob::new("s1", "half hourly", "*/30 * * * *", "v1"))
            .await
            .unwrap();

        let active = scheduler.list_active_jobs().await;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].name, "half hourly");
        assert_eq!(active[0].job_id, "schedule_s1");
        assert!(active[0].next_fire_time.is_some());

        assert!(scheduler.remove_job("s1").await.unwrap());
        assert!(!scheduler.remove_job("s1").await.unwrap());
        assert!(scheduler.fire("s1").await.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_adds_leave_one_removable_job() {
        let (scheduler, logs) = service_with_logs(Duration::ZERO).await;
        scheduler.start().await.unwrap();

        let every_second = ScheduleJob::new("s1", "every second", "* * * * * *", "v1");
        let (first, second) = tokio::join!(
            scheduler.add_job(every_second.clone()),
            scheduler.add_job(every_second)
        );
        first.unwrap();
        second.unwrap();
        assert_eq!(scheduler.list_active_jobs().await.len(), 1);

        assert!(scheduler.remove_job("s1").await.unwrap());
        tokio::time::sleep(Duration::from_millis(500)).await;

        let key = ExecutionKey::schedule("s1");
        let settled = logs.read(&key, None).len();
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(logs.read(&key, None).len(), settled);

        scheduler.stop().await.unwrap();
    }

    #[tokio::test]
    async fn republishing_during_a_run_keeps_it_exclusive() {
        let scheduler = service(Duration::from_millis(300)).await;
        scheduler
            .add_job(ScheduleJob::new("s1", "hourly", "0 * * * *", "v1"))
            .await
            .unwrap();

        let (first, second) = tokio::join!(scheduler.fire("s1"), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            scheduler
                .update_job(ScheduleJob::new("s1", "every minute", "* * * * *", "v1"))
                .await
                .unwrap();
            scheduler.fire("s1").await
        });

        assert!(matches!(first.unwrap(), FireOutcome::Executed { status: RunStatus::Completed, .. }));
        assert_eq!(second.unwrap(), FireOutcome::SkippedOverlap);
        assert_eq!(scheduler.list_active_jobs().await[0].name, "every minute");
    }

    #[tokio::test]
    async fn invalid_cron_is_rejected() {
        let scheduler = service(Duration::ZERO).await;
        let result = scheduler
            .add_job(ScheduleJob::new("s1", "broken", "every tuesday", "v1"))
            .await;
        assert!(result.is_err());
        assert!(scheduler.list_active_jobs().await.is_empty());
    }

    #[tokio::test]
    async fn recovery_skips_broken_schedules() {
        let storage = ScheduleStorage::in_memory().await.unwrap();
        storage
            .save_schedule(&ScheduleJob::new("good", "ok", "0 3 * * *", "v1"))
            .await
            .unwrap();
        storage
            .save_schedule(&ScheduleJob::new("bad", "broken", "not a cron", "v1"))
            .await
            .unwrap();

        let scheduler = service(Duration::ZERO).await.with_storage(storage);
        assert_eq!(scheduler.recover_published().await.unwrap(), 1);

        let ids: Vec<_> = scheduler.list_active_jobs().await.into_iter().map(|j| j.id).collect();
        assert_eq!(ids, vec!["good".to_string()]);
    }

    #[tokio::test]
    async fn publish_persists_and_unpublish_deletes() {
        let storage = ScheduleStorage::in_memory().await.unwrap();
        let scheduler = service(Duration::ZERO).await.with_storage(storage.clone());

        scheduler
            .publish(ScheduleJob::new("s1", "nightly", "0 3 * * *", "v1"))
            .await
            .unwrap();
        assert!(storage.get_schedule("s1").await.unwrap().is_some());

        let outcome = scheduler.fire("s1").await.unwrap();
        assert!(matches!(outcome, FireOutcome::Executed { status: RunStatus::Completed, .. }));

        assert!(scheduler.unpublish("s1").await.unwrap());
        assert!(storage.get_schedule("s1").await.unwrap().is_none());
        assert!(scheduler.list_active_jobs().await.is_empty());
    }
}
