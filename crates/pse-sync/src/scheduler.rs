use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

use crate::job::{JobAction, SyncJob};

/// Builds a scheduler firing `run` on `cron`. A tick that arrives while the
/// previous run is still going is skipped, so runs never overlap.
pub async fn build_scheduler<F, Fut>(cron: &str, run: F) -> Result<JobScheduler>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let run = Arc::new(run);
    let running = Arc::new(Mutex::new(()));
    let job = Job::new_async(cron, move |_uuid, _l| {
        let run = Arc::clone(&run);
        let running = Arc::clone(&running);
        Box::pin(async move {
            let Ok(_guard) = running.try_lock_owned() else {
                warn!("previous scheduled run still in progress; skipping tick");
                return;
            };
            run().await;
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

/// Runs `sync` on `cron` until Ctrl-C.
pub async fn run_scheduled_sync(cron: &str, job: Arc<SyncJob>) -> Result<()> {
    let mut sched = build_scheduler(cron, move || {
        let job = Arc::clone(&job);
        async move {
            let report = job.run(JobAction::Sync).await;
            info!(run_id = %report.run_id, status = ?report.status, "scheduled sync finished");
        }
    })
    .await?;
    sched.start().await.context("starting scheduler")?;
    info!(%cron, "scheduler running; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}
