//! Stage worker loop.
//!
//! One worker serves one topic. Each iteration claims up to `max_concurrent_jobs`
//! messages, runs them concurrently under a semaphore, then sleeps. Every sleep
//! races the cancellation token so shutdown is prompt.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::retry::{RetryCoordinator, RetryDecision};
use super::stages::StageRegistry;
use super::status::JobStatusReporter;
use crate::database::models::JobKind;
use crate::database::repositories::JobRepository;
use crate::database::time::now_ms;
use crate::queue::{QueueBackend, QueueMessage, TopicLayout};
use crate::{Error, Result};

/// Error recorded on jobs found running when a worker starts.
pub const STALE_JOB_ERROR: &str = "worker interrupted before completion";

/// Which `running` jobs a worker fails when it starts.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum StaleRecovery {
    /// Only jobs started longer ago than the job timeout. Safe with several instances.
    #[default]
    Timeout,
    /// Every running job of the kind. Only for single-instance deployments.
    All,
}

/// Configuration for a stage worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageWorkerConfig {
    /// Messages claimed and processed per iteration.
    pub max_concurrent_jobs: usize,
    /// Sleep after an iteration that found nothing.
    pub poll_interval_ms: u64,
    /// Sleep after every iteration.
    pub iteration_delay_ms: u64,
    /// Upper bound on one job's execution.
    pub job_timeout_secs: u64,
    /// Sleep after the queue itself failed.
    pub claim_error_backoff_ms: u64,
    #[serde(default)]
    pub stale_recovery: StaleRecovery,
}

impl Default for StageWorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 5,
            poll_interval_ms: 5_000,
            iteration_delay_ms: 5_000,
            job_timeout_secs: 300,
            claim_error_backoff_ms: 30_000,
            stale_recovery: StaleRecovery::default(),
        }
    }
}

impl StageWorkerConfig {
    pub fn with_job_timeout_secs(mut self, secs: u64) -> Self {
        self.job_timeout_secs = secs;
        self
    }
}

/// Result of processing one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    Completed,
    Failed(RetryDecision),
    /// The retry coordinator could not place the message anywhere.
    Lost,
}

pub struct StageWorker {
    kind: JobKind,
    config: StageWorkerConfig,
    queue: Arc<dyn QueueBackend>,
    layout: TopicLayout,
    registry: Arc<StageRegistry>,
    status: Arc<dyn JobStatusReporter>,
    retry: Arc<RetryCoordinator>,
    semaphore: Arc<Semaphore>,
    cancellation_token: CancellationToken,
    tasks: parking_lot::Mutex<Option<JoinSet<()>>>,
}

impl StageWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        kind: JobKind,
        config: StageWorkerConfig,
        queue: Arc<dyn QueueBackend>,
        layout: TopicLayout,
        registry: Arc<StageRegistry>,
        status: Arc<dyn JobStatusReporter>,
        retry: Arc<RetryCoordinator>,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            kind,
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_jobs.max(1))),
            config,
            queue,
            layout,
            registry,
            status,
            retry,
            cancellation_token,
            tasks: parking_lot::Mutex::new(Some(JoinSet::new())),
        }
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    pub fn is_running(&self) -> bool {
        !self.cancellation_token.is_cancelled()
    }

    /// Fail jobs of this kind left `running` by an earlier process.
    ///
    /// With [`StaleRecovery::Timeout`] a job counts as stale once it has run longer than
    /// the job timeout, so a crash shortly before restart leaves its job `running` until
    /// a later start. [`StaleRecovery::All`] fails every running job of the kind.
    pub async fn recover_stale_jobs(&self, jobs: &dyn JobRepository) -> Result<u64> {
        let cutoff = match self.config.stale_recovery {
            StaleRecovery::Timeout => {
                let timeout_ms = i64::try_from(self.config.job_timeout_secs.saturating_mul(1000))
                    .unwrap_or(i64::MAX);
                now_ms().saturating_sub(timeout_ms)
            }
            StaleRecovery::All => i64::MAX,
        };
        let recovered = jobs.fail_stale_running(self.kind, cutoff, STALE_JOB_ERROR).await?;
        if recovered > 0 {
            warn!(
                kind = %self.kind,
                recovered,
                mode = %self.config.stale_recovery,
                "Failed stale running jobs"
            );
        }
        Ok(recovered)
    }

    /// Spawn the polling loop.
    pub fn start(self: &Arc<Self>) {
        info!(
            kind = %self.kind,
            max_concurrent_jobs = self.config.max_concurrent_jobs,
            "Starting stage worker"
        );

        let worker = Arc::clone(self);
        let mut tasks = self.tasks.lock();
        if let Some(ref mut join_set) = *tasks {
            join_set.spawn(async move { worker.run_loop().await });
        }
    }

    async fn run_loop(self: Arc<Self>) {
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);
        let iteration_delay = Duration::from_millis(self.config.iteration_delay_ms);
        let claim_backoff = Duration::from_millis(self.config.claim_error_backoff_ms);

        loop {
            if self.cancellation_token.is_cancelled() {
                break;
            }

            let pause = match self.run_once().await {
                Ok(0) => poll_interval,
                Ok(processed) => {
                    debug!(kind = %self.kind, processed, "Processed batch");
                    Duration::ZERO
                }
                Err(e) => {
                    error!(kind = %self.kind, error = %e, "Failed to claim jobs");
                    claim_backoff
                }
            };

            if !self.sleep(pause + iteration_delay).await {
                break;
            }
        }

        debug!(kind = %self.kind, "Stage worker loop exited");
    }

    /// Sleep unless cancelled first. Returns false on cancellation.
    async fn sleep(&self, duration: Duration) -> bool {
        if duration.is_zero() {
            return !self.cancellation_token.is_cancelled();
        }
        tokio::select! {
            _ = self.cancellation_token.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    /// Claim one batch and process it to completion. Returns the batch size.
    pub async fn run_once(self: &Arc<Self>) -> Result<usize> {
        let topic = self.layout.working(self.kind);
        let messages = self
            .queue
            .claim_batch(&topic, self.config.max_concurrent_jobs.max(1))
            .await?;
        let claimed = messages.len();
        if claimed == 0 {
            return Ok(0);
        }

        let mut batch = JoinSet::new();
        for message in messages {
            let permit = self
                .semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| Error::Other("worker semaphore closed".to_string()))?;
            let worker = Arc::clone(self);
            batch.spawn(async move {
                let _permit = permit;
                worker.process(message).await;
            });
        }

        while let Some(joined) = batch.join_next().await {
            if let Err(e) = joined {
                error!(kind = %self.kind, error = %e, "Job task panicked");
            }
        }

        Ok(claimed)
    }

    /// Run one claimed message through its handler and record the outcome.
    pub async fn process(&self, message: QueueMessage) -> ProcessOutcome {
        let job_id = message.id.clone();
        info!(
            job_id = %job_id,
            kind = %message.kind,
            audiobook_id = %message.audiobook_id,
            attempt = message.retry_count,
            "Processing job"
        );

        if let Err(e) = self.status.mark_running(&job_id).await {
            warn!(job_id = %job_id, error = %e, "Failed to mark job running");
        }

        let Some(handler) = self.registry.get(message.kind) else {
            let reason = format!("no handler registered for {} jobs", message.kind);
            return self.fail(message, &reason).await;
        };

        let timeout = Duration::from_secs(self.config.job_timeout_secs);
        let result = match tokio::time::timeout(timeout, handler.execute(&message)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!(
                "job exceeded {}s timeout",
                self.config.job_timeout_secs
            ))),
        };

        match result {
            Ok(()) => {
                if let Err(e) = self.status.mark_completed(&job_id).await {
                    warn!(job_id = %job_id, error = %e, "Failed to mark job completed");
                }
                info!(job_id = %job_id, kind = %message.kind, handler = handler.name(), "Job completed");

                if let Err(e) = handler.on_completed(&message).await {
                    warn!(job_id = %job_id, error = %e, "Post-completion hook failed");
                }
                ProcessOutcome::Completed
            }
            Err(e) => self.fail(message, &e.to_string()).await,
        }
    }

    async fn fail(&self, message: QueueMessage, reason: &str) -> ProcessOutcome {
        let job_id = message.id.clone();
        warn!(job_id = %job_id, kind = %message.kind, error = %reason, "Job failed");
        match self.retry.handle_failure(message, reason).await {
            Ok(decision) => ProcessOutcome::Failed(decision),
            Err(e) => {
                error!(job_id = %job_id, error = %e, "Failed to requeue or dead-letter job");
                ProcessOutcome::Lost
            }
        }
    }

    /// Cancel the loop and wait for it to exit.
    pub async fn stop(&self) {
        info!(kind = %self.kind, "Stopping stage worker");
        self.cancellation_token.cancel();

        let join_set = {
            let mut tasks = self.tasks.lock();
            tasks.take()
        };

        if let Some(mut join_set) = join_set {
            while join_set.join_next().await.is_some() {}
        }

        info!(kind = %self.kind, "Stage worker stopped");
    }
}
