//! Cron scheduler: the only clock in the engine.
//!
//! Every registered job gets its own loop that sleeps until the next cron
//! firing, runs the handler, and records the outcome in `scheduled_jobs`.
//! Handler errors and panics are logged against the job and never stop the
//! loop. `stop()` signals every loop through a watch channel and waits for
//! them, so a handler that is already running finishes first.

pub mod cron;

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;

pub use cron::CronSchedule;

use crate::error::CoreError;
use crate::models::job::{JobRunStatus, ScheduledJob};
use crate::store::JobStore;

pub type JobFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
pub type JobHandler = Arc<dyn Fn() -> JobFuture + Send + Sync>;

/// A job as handed to [`Scheduler::register_job`].
pub struct JobSpec {
    pub name: String,
    pub schedule: String,
    pub handler: JobHandler,
}

impl JobSpec {
    pub fn new<F, Fut>(name: &str, schedule: &str, handler: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            name: name.to_string(),
            schedule: schedule.to_string(),
            handler: Arc::new(move || -> JobFuture { Box::pin(handler()) }),
        }
    }
}

struct RegisteredJob {
    name: String,
    schedule: CronSchedule,
    handler: JobHandler,
    in_flight: AtomicBool,
}

pub struct Scheduler {
    jobs: RwLock<Vec<Arc<RegisteredJob>>>,
    store: JobStore,
    shutdown: watch::Sender<bool>,
    loops: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

impl Scheduler {
    pub fn new(store: JobStore) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            jobs: RwLock::new(Vec::new()),
            store,
            shutdown,
            loops: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        }
    }

    /// Register a job. The schedule is validated here; job names are unique.
    /// A job registered while the scheduler runs starts ticking immediately.
    pub async fn register_job(&self, owner: &str, spec: JobSpec) -> Result<ScheduledJob, CoreError> {
        let schedule = CronSchedule::parse(&spec.schedule)?;
        let job = Arc::new(RegisteredJob {
            name: spec.name,
            schedule,
            handler: spec.handler,
            in_flight: AtomicBool::new(false),
        });

        {
            let mut jobs = self.jobs.write().await;
            if jobs.iter().any(|j| j.name == job.name) {
                return Err(CoreError::Conflict(format!("Job '{}' is already registered", job.name)));
            }
            jobs.push(job.clone());
        }

        let record = self
            .store
            .upsert_registration(
                owner,
                &job.name,
                job.schedule.as_str(),
                job.schedule.next_after(Utc::now()),
            )
            .await?;
        tracing::info!(job = %job.name, owner, "[Scheduler] Registered job ({})", job.schedule);

        if self.is_running() {
            let handle = self.spawn_loop(job);
            self.loops.lock().await.push(handle);
        }
        Ok(record)
    }

    pub async fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            tracing::warn!("[Scheduler] Already running");
            return;
        }
        self.shutdown.send_replace(false);

        let jobs = self.jobs.read().await.clone();
        let mut loops = self.loops.lock().await;
        for job in jobs {
            loops.push(self.spawn_loop(job));
        }
        tracing::info!("[Scheduler] Started {} job(s)", loops.len());
    }

    /// Stop every job loop, waiting for in-flight handlers to finish.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shutdown.send_replace(true);

        let handles: Vec<_> = self.loops.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!("[Scheduler] Job loop ended abnormally: {}", e);
            }
        }
        tracing::info!("[Scheduler] Stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run a job once, right now, outside its schedule.
    pub async fn run_now(&self, name: &str) -> Result<JobRunStatus, CoreError> {
        let job = self
            .jobs
            .read()
            .await
            .iter()
            .find(|j| j.name == name)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("Job '{}' is not registered", name)))?;

        run_job(&job, &self.store)
            .await
            .ok_or_else(|| CoreError::Conflict(format!("Job '{}' is already running", name)))
    }

    /// Health records of all jobs known to the store.
    pub async fn jobs(&self) -> Result<Vec<ScheduledJob>, CoreError> {
        self.store.list().await
    }

    pub async fn job_names(&self) -> Vec<String> {
        self.jobs.read().await.iter().map(|j| j.name.clone()).collect()
    }

    fn spawn_loop(&self, job: Arc<RegisteredJob>) -> JoinHandle<()> {
        let store = self.store.clone();
        let shutdown_rx = self.shutdown.subscribe();
        tokio::spawn(job_loop(job, store, shutdown_rx))
    }
}

async fn job_loop(job: Arc<RegisteredJob>, store: JobStore, mut shutdown_rx: watch::Receiver<bool>) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let now = Utc::now();
        let Some(next) = job.schedule.next_after(now) else {
            tracing::warn!(job = %job.name, "[Scheduler] Schedule never fires again, loop ends");
            break;
        };
        if let Err(e) = store.record_next_run(&job.name, Some(next)).await {
            tracing::warn!(job = %job.name, "[Scheduler] Could not record next run: {}", e);
        }
        let wait = (next - now).to_std().unwrap_or_default();

        tokio::select! {
            _ = tokio::time::sleep(wait) => {
                run_job(&job, &store).await;
            }
            _ = shutdown_rx.changed() => {
                break;
            }
        }
    }
    tracing::debug!(job = %job.name, "[Scheduler] Job loop stopped");
}

/// Run one invocation and record it. Returns `None` when the previous
/// invocation of the same job is still running.
async fn run_job(job: &RegisteredJob, store: &JobStore) -> Option<JobRunStatus> {
    if job.in_flight.swap(true, Ordering::SeqCst) {
        tracing::warn!(job = %job.name, "[Scheduler] Previous run still in flight, skipping");
        return None;
    }

    let started = Utc::now();
    tracing::debug!(job = %job.name, "[Scheduler] Running job");
    let (status, error) = match tokio::spawn((job.handler)()).await {
        Ok(Ok(())) => (JobRunStatus::Succeeded, None),
        Ok(Err(e)) => {
            tracing::error!(job = %job.name, "[Scheduler] Job failed: {:#}", e);
            (JobRunStatus::Failed, Some(format!("{:#}", e)))
        }
        Err(e) => {
            tracing::error!(job = %job.name, "[Scheduler] Job panicked: {}", e);
            (JobRunStatus::Failed, Some(format!("panicked: {}", e)))
        }
    };

    if let Err(e) = store.record_run(&job.name, status, error, started).await {
        tracing::warn!(job = %job.name, "[Scheduler] Could not record run: {}", e);
    }
    job.in_flight.store(false, Ordering::SeqCst);
    Some(status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn scheduler() -> Scheduler {
        Scheduler::new(JobStore::new(Database::open_in_memory().unwrap()))
    }

    fn counting_job(name: &str, schedule: &str, hits: Arc<AtomicUsize>) -> JobSpec {
        JobSpec::new(name, schedule, move || {
            let hits = hits.clone();
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                anyhow::Ok(())
            }
        })
    }

    #[tokio::test]
    async fn test_invalid_cron_rejected() {
        let sched = scheduler();
        let err = sched
            .register_job("test", counting_job("bad", "every minute", Arc::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Config(_)));
        assert!(sched.job_names().await.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected() {
        let sched = scheduler();
        sched
            .register_job("test", counting_job("sweep", "0 * * * *", Arc::default()))
            .await
            .unwrap();
        let err = sched
            .register_job("test", counting_job("sweep", "30 * * * *", Arc::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_run_now_records_history() {
        let sched = scheduler();
        let hits = Arc::new(AtomicUsize::new(0));
        let record = sched
            .register_job("orchestrator", counting_job("cycle", "0 0 1 1 *", hits.clone()))
            .await
            .unwrap();
        assert_eq!(record.owner, "orchestrator");
        assert!(record.next_run_at.is_some());

        assert_eq!(sched.run_now("cycle").await.unwrap(), JobRunStatus::Succeeded);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        let jobs = sched.jobs().await.unwrap();
        assert_eq!(jobs[0].run_count, 1);
        assert_eq!(jobs[0].last_status, Some(JobRunStatus::Succeeded));

        assert!(matches!(sched.run_now("missing").await, Err(CoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_failing_job_keeps_firing_and_others_run() {
        let sched = scheduler();
        let failures = Arc::new(AtomicUsize::new(0));
        let f = failures.clone();
        sched
            .register_job(
                "test",
                JobSpec::new("flaky", "* * * * * *", move || {
                    let f = f.clone();
                    async move {
                        f.fetch_add(1, Ordering::SeqCst);
                        Err::<(), _>(anyhow::anyhow!("upstream unavailable"))
                    }
                }),
            )
            .await
            .unwrap();
        sched
            .register_job(
                "test",
                JobSpec::new("panicky", "* * * * * *", || async {
                    if true {
                        panic!("handler bug");
                    }
                    anyhow::Ok(())
                }),
            )
            .await
            .unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        sched
            .register_job("test", counting_job("healthy", "* * * * * *", hits.clone()))
            .await
            .unwrap();

        sched.start().await;
        tokio::time::sleep(Duration::from_millis(2600)).await;
        sched.stop().await;

        assert!(failures.load(Ordering::SeqCst) >= 2);
        assert!(hits.load(Ordering::SeqCst) >= 2);

        let jobs = sched.jobs().await.unwrap();
        let flaky = jobs.iter().find(|j| j.name == "flaky").unwrap();
        assert_eq!(flaky.last_status, Some(JobRunStatus::Failed));
        assert_eq!(flaky.last_error.as_deref(), Some("upstream unavailable"));
        let panicky = jobs.iter().find(|j| j.name == "panicky").unwrap();
        assert!(panicky.run_count >= 2);
        assert_eq!(panicky.last_status, Some(JobRunStatus::Failed));
    }

    #[tokio::test]
    async fn test_stop_waits_for_in_flight_handler() {
        let sched = Arc::new(scheduler());
        let started = Arc::new(tokio::sync::Notify::new());
        let finished = Arc::new(AtomicBool::new(false));

        let (s, done) = (started.clone(), finished.clone());
        sched
            .register_job(
                "test",
                JobSpec::new("slow", "* * * * * *", move || {
                    let (s, done) = (s.clone(), done.clone());
                    async move {
                        s.notify_one();
                        tokio::time::sleep(Duration::from_millis(300)).await;
                        done.store(true, Ordering::SeqCst);
                        anyhow::Ok(())
                    }
                }),
            )
            .await
            .unwrap();

        sched.start().await;
        tokio::time::timeout(Duration::from_secs(3), started.notified())
            .await
            .unwrap();

        // Overlapping manual run is refused while the scheduled one is in flight.
        assert!(matches!(sched.run_now("slow").await, Err(CoreError::Conflict(_))));

        sched.stop().await;
        assert!(finished.load(Ordering::SeqCst));
        assert!(!sched.is_running());
    }
}
