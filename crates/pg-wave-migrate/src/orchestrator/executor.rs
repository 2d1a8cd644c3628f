//! Runs the tables of one wave concurrently under a permit budget and a deadline.

use crate::config::{
    MigrationConfig, DEFAULT_LAUNCH_DELAY_MS, DEFAULT_WAVE_TIMEOUT_SECS, DEFAULT_WORKERS,
};
use crate::graph::Wave;
use crate::transfer::{JobError, TableMigrator};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::{Id, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How long cancelled jobs get to stop their processes before being aborted.
const CANCEL_GRACE: Duration = Duration::from_secs(10);

/// Executor tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// Table jobs allowed to run at once.
    pub workers: usize,
    /// Budget for a whole wave, measured from its start.
    pub wave_timeout: Duration,
    /// Pause between successive job launches.
    pub launch_delay: Duration,
    /// Kill in-flight jobs once the deadline passes instead of leaving them running.
    pub terminate_on_timeout: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            wave_timeout: Duration::from_secs(DEFAULT_WAVE_TIMEOUT_SECS),
            launch_delay: Duration::from_millis(DEFAULT_LAUNCH_DELAY_MS),
            terminate_on_timeout: true,
        }
    }
}

impl From<&MigrationConfig> for ExecutorConfig {
    fn from(config: &MigrationConfig) -> Self {
        Self {
            workers: config.get_workers(),
            wave_timeout: config.get_wave_timeout(),
            launch_delay: config.get_launch_delay(),
            terminate_on_timeout: config.terminate_on_timeout,
        }
    }
}

/// Outcome of one wave.
#[derive(Debug)]
pub struct WaveReport {
    pub number: usize,
    /// Tables whose job returned success.
    pub completed: BTreeSet<String>,
    /// Every job failure observed, including jobs that died without a result.
    pub failures: Vec<JobError>,
    /// The deadline passed before every job finished.
    pub timed_out: bool,
    /// Tables still running (or never started) when the deadline passed.
    pub unfinished: BTreeSet<String>,
    pub elapsed: Duration,
}

impl WaveReport {
    /// A wave succeeds only if every job succeeded before the deadline.
    pub fn is_success(&self) -> bool {
        !self.timed_out && self.failures.is_empty()
    }

    /// Tables that did not complete, failed or unfinished, sorted.
    pub fn failed_tables(&self) -> Vec<String> {
        let mut tables: BTreeSet<String> = self.failures.iter().map(|f| f.table.clone()).collect();
        tables.extend(self.unfinished.iter().cloned());
        tables.into_iter().collect()
    }

    /// One-line reason for a failed wave.
    pub fn failure_reason(&self) -> String {
        if self.timed_out {
            format!(
                "timed out after {:.0?} with {} job(s) unfinished",
                self.elapsed,
                self.unfinished.len()
            )
        } else {
            match self.failures.first() {
                Some(first) if self.failures.len() == 1 => first.to_string(),
                Some(first) => format!("{} (and {} more)", first, self.failures.len() - 1),
                None => "no failures".to_string(),
            }
        }
    }
}

/// Launches one job per table of a wave and waits for all of them.
///
/// The permit budget is shared across waves; a wave never holds permits after
/// [`WaveExecutor::execute`] returns when `terminate_on_timeout` is set.
pub struct WaveExecutor {
    migrator: Arc<dyn TableMigrator>,
    permits: Arc<Semaphore>,
    config: ExecutorConfig,
}

impl WaveExecutor {
    pub fn new(migrator: Arc<dyn TableMigrator>, config: ExecutorConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.workers.max(1)));
        Self {
            migrator,
            permits,
            config,
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Run every table of `wave` and report the outcome.
    ///
    /// Individual job failures do not stop sibling jobs. Cancelling `cancel`
    /// terminates outstanding jobs; they are reported as failures.
    pub async fn execute(&self, wave: &Wave, cancel: &CancellationToken) -> WaveReport {
        let started = tokio::time::Instant::now();
        let deadline = started + self.config.wave_timeout;
        let wave_cancel = cancel.child_token();

        info!(
            "Wave {}: starting {} table(s) with {} worker(s)",
            wave.number,
            wave.len(),
            self.config.workers
        );

        let mut jobs: JoinSet<(String, Result<(), JobError>)> = JoinSet::new();
        let mut tasks: HashMap<Id, String> = HashMap::new();
        let mut remaining: BTreeSet<String> = wave.tables.clone();
        let mut completed = BTreeSet::new();
        let mut failures = Vec::new();
        let mut timed_out = false;

        for (idx, table) in wave.tables.iter().enumerate() {
            if idx > 0 && !self.config.launch_delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.launch_delay) => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                    _ = wave_cancel.cancelled() => {}
                }
            }
            if wave_cancel.is_cancelled() {
                let unlaunched: Vec<String> = wave.tables.iter().skip(idx).cloned().collect();
                warn!(
                    "Wave {}: cancelled with {} table(s) not yet launched",
                    wave.number,
                    unlaunched.len()
                );
                for table in unlaunched {
                    remaining.remove(&table);
                    failures.push(JobError::aborted(table, "cancelled before start"));
                }
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                // Unlaunched tables stay in `remaining` and are reported unfinished.
                timed_out = true;
                break;
            }

            let migrator = Arc::clone(&self.migrator);
            let permits = Arc::clone(&self.permits);
            let job_cancel = wave_cancel.clone();
            let name = table.clone();
            let handle = jobs.spawn(async move {
                let table = name;
                let _permit = tokio::select! {
                    biased;
                    _ = job_cancel.cancelled() => {
                        return (table.clone(), Err(JobError::aborted(&table, "cancelled before start")));
                    }
                    permit = permits.acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => return (table.clone(), Err(JobError::aborted(&table, "worker pool closed"))),
                    },
                };
                debug!("{}: started", table);
                let result = migrator.migrate_table(&table, &job_cancel).await;
                (table, result)
            });
            tasks.insert(handle.id(), table.clone());
        }

        while !timed_out {
            let joined = tokio::time::timeout_at(deadline, jobs.join_next()).await;
            match joined {
                Err(_) => timed_out = true,
                Ok(None) => break,
                Ok(Some(Ok((table, result)))) => {
                    remaining.remove(&table);
                    match result {
                        Ok(()) => {
                            info!("{}: migrated", table);
                            completed.insert(table);
                        }
                        Err(e) => {
                            if failures.is_empty() {
                                error!("Wave {}: {}", wave.number, e);
                            } else {
                                warn!("Wave {}: {}", wave.number, e);
                            }
                            failures.push(e);
                        }
                    }
                }
                Ok(Some(Err(join_error))) => {
                    error!("Wave {}: job task failed: {}", wave.number, join_error);
                    if let Some(table) = tasks.remove(&join_error.id()) {
                        remaining.remove(&table);
                        failures.push(JobError::aborted(table, format!("job task failed: {}", join_error)));
                    }
                }
            }
        }

        if timed_out {
            error!(
                "Wave {} exceeded its {:?} timeout; unfinished: {}",
                wave.number,
                self.config.wave_timeout,
                remaining.iter().cloned().collect::<Vec<_>>().join(", ")
            );
            if self.config.terminate_on_timeout {
                wave_cancel.cancel();
                let drained = tokio::time::timeout(CANCEL_GRACE, async {
                    while jobs.join_next().await.is_some() {}
                })
                .await;
                if drained.is_err() {
                    warn!("Aborting {} job(s) that ignored cancellation", jobs.len());
                }
                jobs.shutdown().await;
            } else {
                warn!("Leaving {} job(s) running after timeout", jobs.len());
                jobs.detach_all();
            }
        }

        // Every launched job has reported by now unless the deadline passed.
        let unfinished = if timed_out { remaining } else { BTreeSet::new() };

        let report = WaveReport {
            number: wave.number,
            completed,
            failures,
            timed_out,
            unfinished,
            elapsed: started.elapsed(),
        };

        if report.is_success() {
            info!(
                "Wave {}: {} table(s) completed in {:.1?}",
                wave.number,
                report.completed.len(),
                report.elapsed
            );
        }
        report
    }
}
