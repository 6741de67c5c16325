/// Dedicated worker pool for cron fires
///
/// Each worker is an OS thread owning a current-thread tokio runtime. Fires are
/// queued on a shared channel and their outcome comes back on a oneshot, so
/// scheduled programs never run on the runtime serving HTTP requests.

use crate::runtime::dispatcher::{DispatchOutcome, DispatchRequest, Dispatcher};
use crate::schedule::ScheduleJob;
use anyhow::{anyhow, Context, Result};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};

struct FireRequest {
    job: ScheduleJob,
    reply: oneshot::Sender<DispatchOutcome>,
}

pub struct ScheduleWorkerPool {
    tx: mpsc::Sender<FireRequest>,
    size: usize,
}

impl ScheduleWorkerPool {
    /// Start `size` worker threads (at least one)
    pub fn spawn(size: usize, dispatcher: Arc<Dispatcher>) -> Result<Self> {
        let size = size.max(1);
        let (tx, rx) = mpsc::channel::<FireRequest>(size * 16);
        let rx = Arc::new(Mutex::new(rx));

        for index in 0..size {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .context("Failed to build schedule worker runtime")?;
            let rx = Arc::clone(&rx);
            let dispatcher = Arc::clone(&dispatcher);

            std::thread::Builder::new()
                .name(format!("flowgate-cron-{}", index))
                .spawn(move || runtime.block_on(worker_loop(index, rx, dispatcher)))
                .context("Failed to spawn schedule worker thread")?;
        }

        tracing::info!("🧵 Started {} schedule worker threads", size);
        Ok(Self { tx, size })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Execute one fire of `job` on a worker and wait for its outcome
    pub async fn submit(&self, job: ScheduleJob) -> Result<DispatchOutcome> {
        let (reply, outcome) = oneshot::channel();
        self.tx
            .send(FireRequest { job, reply })
            .await
            .map_err(|_| anyhow!("Schedule worker pool is shut down"))?;

        outcome.await.context("Schedule worker dropped the fire before replying")
    }
}

async fn worker_loop(index: usize, rx: Arc<Mutex<mpsc::Receiver<FireRequest>>>, dispatcher: Arc<Dispatcher>) {
    tracing::debug!("🧵 Schedule worker {} ready", index);

    loop {
        let next = rx.lock().await.recv().await;
        let Some(FireRequest { job, reply }) = next else {
            break;
        };

        let mut request = DispatchRequest::schedule_fire(&job.flow_version_id, &job.id);
        if let (Some(tenant), Some(project)) = (&job.tenant_id, &job.project_id) {
            request = request.with_project(tenant, project);
        }

        let outcome = dispatcher.dispatch(request).await;
        if reply.send(outcome).is_err() {
            tracing::debug!("📭 Fire of schedule {} finished after its caller went away", job.id);
        }
    }

    tracing::debug!("🧵 Schedule worker {} stopped", index);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExecutionMode, LogConfig};
    use crate::listeners::ListenerRegistry;
    use crate::logs::{ExecutionKey, LogStore};
    use crate::runtime::lifecycle::{RunStatus, RunTracker};
    use crate::runtime::registry::ProgramRegistry;
    use crate::runtime::test_support::SideEffectProgram;
    use std::time::Duration;

    #[tokio::test]
    async fn fires_run_on_worker_threads() {
        let logs = Arc::new(LogStore::new(&LogConfig::default()));
        let programs = ProgramRegistry::new();
        programs.register(Arc::new(SideEffectProgram::new("v1")));
        let dispatcher = Arc::new(Dispatcher::new(
            ExecutionMode::Local,
            Arc::new(programs),
            Arc::new(RunTracker::default()),
            Arc::clone(&logs),
            Arc::new(ListenerRegistry::new(Duration::from_secs(60))),
        ));

        let pool = ScheduleWorkerPool::spawn(2, dispatcher).unwrap();
        let outcome = pool.submit(ScheduleJob::new("s1", "nightly", "0 3 * * *", "v1")).await.unwrap();

        assert_eq!(outcome.status, RunStatus::Completed);
        let lines = logs.read(&ExecutionKey::schedule("s1"), None);
        assert!(lines.iter().any(|e| e.message == "module side effect"));
    }
}
