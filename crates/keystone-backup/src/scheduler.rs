//! Scheduler: a cron-like dispatcher for the fixed set of named jobs in
//! §4.I. The job set is closed — jobs are data (a cron expression plus an
//! enabled flag), not dynamically attached callbacks, per the design notes'
//! guidance against duck-typed/callback-driven scheduling.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cron::Schedule;
use tokio::sync::{Mutex, Notify};
use tokio::time::Duration;

use crate::error::{BackupError, Result};

/// Names of the fourteen jobs the scheduler knows about, with their
/// configuration-default cron expressions.
pub const JOB_DEFAULTS: &[(&str, &str)] = &[
    ("daily_backup", "0 30 2 * * *"),
    ("retention_apply", "0 0 3 * * *"),
    ("weekly_backup", "0 0 1 * * Sun"),
    ("monthly_backup", "0 30 0 1 * *"),
    ("key_rotation", "0 0 4 1 * *"),
    ("automated_verification", "0 30 4 * * *"),
    ("daily_report", "0 0 6 * * *"),
    ("cloud_cleanup", "0 0 5 * * Sun"),
    ("license_sync", "0 0 */6 * * *"),
    ("license_validation", "0 */15 * * * *"),
    ("expired_offline_cleanup", "0 0 * * * *"),
    ("log_retention_cleanup", "0 0 2 * * *"),
    ("weekly_integrity_check", "0 0 3 * * Sun"),
    ("monthly_storage_analysis", "0 0 4 1 * *"),
];

type JobFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type JobHandler = Arc<dyn Fn() -> JobFuture + Send + Sync>;

struct JobDef {
    cron_expression: String,
    enabled: bool,
    handler: JobHandler,
    running: Arc<AtomicBool>,
}

/// Registry of named, cron-driven jobs. Only one instance of a given job
/// runs at a time; a second trigger while the first is in flight is dropped
/// with a single warning, never queued (§4.I, §5).
pub struct Scheduler {
    jobs: Mutex<HashMap<String, JobDef>>,
    shutdown: Arc<Notify>,
    stopped: Arc<AtomicBool>,
}

impl Scheduler {
    /// Construct an empty scheduler. Jobs are registered with
    /// [`Scheduler::register`] before calling [`Scheduler::start`].
    pub fn new() -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            shutdown: Arc::new(Notify::new()),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Register a job under `name` with its cron expression, initial
    /// enabled state, and async handler. Replaces any prior registration of
    /// the same name.
    pub async fn register<F, Fut>(
        &self,
        name: &str,
        cron_expression: &str,
        enabled: bool,
        handler: F,
    ) -> Result<()>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Schedule::from_str(cron_expression)
            .map_err(|e| BackupError::Config(format!("invalid cron expression for {name}: {e}")))?;

        let mut jobs = self.jobs.lock().await;
        jobs.insert(
            name.to_string(),
            JobDef {
                cron_expression: cron_expression.to_string(),
                enabled,
                handler: Arc::new(move || Box::pin(handler())),
                running: Arc::new(AtomicBool::new(false)),
            },
        );
        Ok(())
    }

    /// Enable or disable a registered job without re-registering its handler.
    pub async fn set_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .get_mut(name)
            .ok_or_else(|| BackupError::Config(format!("unknown job {name}")))?;
        job.enabled = enabled;
        Ok(())
    }

    /// Start the dispatch loop: once a minute, check each enabled job's
    /// cron schedule and spawn it if due and not already running. Returns
    /// immediately; the loop runs on its own task until [`Scheduler::stop`]
    /// is called.
    pub fn start(self: &Arc<Self>) {
        self.stopped.store(false, Ordering::SeqCst);
        let this = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        this.dispatch_due_jobs().await;
                    }
                    _ = this.shutdown.notified() => {
                        break;
                    }
                }
            }
        });
    }

    async fn dispatch_due_jobs(&self) {
        let now = chrono::Utc::now();
        let jobs = self.jobs.lock().await;
        for (name, job) in jobs.iter() {
            if !job.enabled {
                continue;
            }
            let Ok(schedule) = Schedule::from_str(&job.cron_expression) else {
                continue;
            };
            if !is_due(&schedule, now) {
                continue;
            }
            if job.running.swap(true, Ordering::SeqCst) {
                tracing::warn!(job = name, "trigger dropped: previous run still in flight");
                continue;
            }

            let handler = job.handler.clone();
            let running = job.running.clone();
            let name = name.clone();
            tokio::spawn(async move {
                handler().await;
                running.store(false, Ordering::SeqCst);
                tracing::debug!(job = %name, "job finished");
            });
        }
    }

    /// Stop accepting new triggers and wait up to `grace` for in-flight
    /// jobs to finish.
    pub async fn stop(&self, grace: Duration) {
        self.stopped.store(true, Ordering::SeqCst);
        self.shutdown.notify_waiters();

        let deadline = tokio::time::Instant::now() + grace;
        loop {
            if !self.any_running().await || tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    async fn any_running(&self) -> bool {
        let jobs = self.jobs.lock().await;
        jobs.values().any(|j| j.running.load(Ordering::SeqCst))
    }

    /// Whether job `name` is currently running.
    pub async fn is_running(&self, name: &str) -> bool {
        let jobs = self.jobs.lock().await;
        jobs.get(name).is_some_and(|j| j.running.load(Ordering::SeqCst))
    }

    /// Names of every registered job.
    pub async fn job_names(&self) -> Vec<String> {
        let jobs = self.jobs.lock().await;
        jobs.keys().cloned().collect()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

fn is_due(schedule: &Schedule, now: chrono::DateTime<chrono::Utc>) -> bool {
    match schedule.upcoming(chrono::Utc).next() {
        Some(next_run) => {
            let diff = next_run - now;
            diff.num_seconds() >= 0 && diff.num_seconds() < 60
        }
        None => false,
    }
}
