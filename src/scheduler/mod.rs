use anyhow::{Context, Result};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

pub type JobFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Wrapper around tokio-cron-scheduler for periodic mirror runs
pub struct Scheduler {
    inner: JobScheduler,
}

impl Scheduler {
    /// Create a new scheduler
    pub async fn new() -> Result<Self> {
        let inner = JobScheduler::new()
            .await
            .context("Failed to create job scheduler")?;
        Ok(Self { inner })
    }

    /// Add a cron job that never overlaps itself: a tick that fires while the
    /// previous run is still going is skipped.
    pub async fn add_exclusive_job<F>(&self, cron_expr: &str, name: &str, task: F) -> Result<()>
    where
        F: Fn() -> JobFuture + Send + Sync + 'static,
    {
        let job_name = name.to_string();
        let running = Arc::new(Mutex::new(()));
        let task = Arc::new(task);

        let job = Job::new_async(cron_expr, move |_uuid, _lock| {
            let name = job_name.clone();
            let running = Arc::clone(&running);
            let task = Arc::clone(&task);
            Box::pin(async move {
                let Ok(_guard) = running.try_lock() else {
                    warn!("Previous '{}' run still in progress, skipping tick", name);
                    return;
                };
                info!("Running scheduled task: {}", name);
                task().await;
            })
        })
        .with_context(|| format!("Failed to create cron job: {}", name))?;

        self.inner
            .add(job)
            .await
            .with_context(|| format!("Failed to add job: {}", name))?;

        info!("Scheduled task '{}' with cron: {}", name, cron_expr);
        Ok(())
    }

    /// Start the scheduler
    pub async fn start(&self) -> Result<()> {
        self.inner
            .start()
            .await
            .context("Failed to start scheduler")?;
        info!("Scheduler started");
        Ok(())
    }

    /// Shutdown the scheduler
    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner
            .shutdown()
            .await
            .context("Failed to shutdown scheduler")?;
        info!("Scheduler stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_invalid_cron_rejected() {
        let scheduler = Scheduler::new().await.unwrap();
        let result = scheduler
            .add_exclusive_job("every now and then", "mirror", || Box::pin(async {}))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_valid_cron_accepted() {
        let scheduler = Scheduler::new().await.unwrap();
        scheduler
            .add_exclusive_job("0 */10 * * * *", "mirror", || Box::pin(async {}))
            .await
            .unwrap();
    }
}
