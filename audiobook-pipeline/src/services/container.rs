//! Service container.
//!
//! Builds the stores, queue, producer, retry coordinator and trigger from a
//! [`PipelineConfig`], then runs one [`StageWorker`] per configured stage role and,
//! with the api role, the internal HTTP server.

use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::api::{ApiServer, AppState};
use crate::config::{PipelineConfig, StatusReporting, TriggerMode};
use crate::database::models::JobKind;
use crate::database::repositories::{
    CatalogRepository, JobRepository, OutputRepository, SqlxCatalogRepository,
    SqlxJobRepository, SqlxOutputRepository, SqlxTranscriptRepository, TranscriptRepository,
};
use crate::pipeline::{
    EmbeddingStage, HttpStageNotifier, InProcessStageNotifier, JobStatusReporter, Producer,
    RetryCoordinator, StageNotifier, StageRegistry, StageWorker, StoreStatusReporter,
    SummarizeTagStage, SummarizeTrigger, TranscriptionStage, WebhookStatusReporter,
};
use crate::providers::{
    EmbeddingProvider, GeminiClient, RevAiClient, TextGenerator, TranscriptionProvider,
};
use crate::queue::{QueueBackend, SqliteQueue, TopicLayout};
use crate::utils::http_client::build_client;
use crate::{Error, Result};

/// Default shutdown timeout.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Request timeout for the webhook reporter and the HTTP notifier.
const INTERNAL_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// External capability clients. Any of them may be absent when the matching
/// role is not configured.
#[derive(Clone, Default)]
pub struct Providers {
    pub transcription: Option<Arc<dyn TranscriptionProvider>>,
    pub text: Option<Arc<dyn TextGenerator>>,
    pub embedding: Option<Arc<dyn EmbeddingProvider>>,
}

impl Providers {
    /// Rev.ai for transcription, Gemini for text and embeddings.
    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        let transcription = config
            .rev_ai
            .clone()
            .map(RevAiClient::new)
            .transpose()?
            .map(|c| Arc::new(c) as Arc<dyn TranscriptionProvider>);

        let gemini = config
            .gemini
            .clone()
            .map(GeminiClient::new)
            .transpose()?
            .map(Arc::new);

        Ok(Self {
            transcription,
            text: gemini.clone().map(|c| c as Arc<dyn TextGenerator>),
            embedding: gemini.map(|c| c as Arc<dyn EmbeddingProvider>),
        })
    }
}

pub struct ServiceContainer {
    pub pool: SqlitePool,
    pub config: PipelineConfig,
    pub jobs: Arc<dyn JobRepository>,
    pub catalog: Arc<dyn CatalogRepository>,
    pub transcripts: Arc<dyn TranscriptRepository>,
    pub outputs: Arc<dyn OutputRepository>,
    pub queue: Arc<dyn QueueBackend>,
    pub layout: TopicLayout,
    pub producer: Arc<Producer>,
    pub retry: Arc<RetryCoordinator>,
    pub trigger: Arc<SummarizeTrigger>,
    workers: Vec<Arc<StageWorker>>,
    api_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    cancellation_token: CancellationToken,
}

impl ServiceContainer {
    /// Build with the HTTP providers described by `config`.
    pub fn new(pool: SqlitePool, config: PipelineConfig) -> Result<Self> {
        let providers = Providers::from_config(&config)?;
        Self::with_providers(pool, config, providers)
    }

    /// Build with caller-supplied providers.
    pub fn with_providers(
        pool: SqlitePool,
        config: PipelineConfig,
        providers: Providers,
    ) -> Result<Self> {
        let cancellation_token = CancellationToken::new();

        let jobs: Arc<dyn JobRepository> = Arc::new(SqlxJobRepository::new(pool.clone()));
        let catalog: Arc<dyn CatalogRepository> =
            Arc::new(SqlxCatalogRepository::new(pool.clone()));
        let transcripts: Arc<dyn TranscriptRepository> =
            Arc::new(SqlxTranscriptRepository::new(pool.clone()));
        let outputs: Arc<dyn OutputRepository> = Arc::new(SqlxOutputRepository::new(pool.clone()));
        let queue: Arc<dyn QueueBackend> = Arc::new(SqliteQueue::new(pool.clone()));
        let layout = TopicLayout::new(config.jobs_prefix.clone());

        let status: Arc<dyn JobStatusReporter> = match config.status_reporting {
            StatusReporting::Store => Arc::new(StoreStatusReporter::new(jobs.clone())),
            StatusReporting::Webhook => Arc::new(WebhookStatusReporter::new(
                build_client(INTERNAL_REQUEST_TIMEOUT)?,
                config.api_base_url.clone(),
                internal_key(&config)?,
            )),
        };

        let retry = Arc::new(RetryCoordinator::new(
            queue.clone(),
            layout.clone(),
            status.clone(),
            config.retry,
        ));
        let producer = Arc::new(Producer::new(
            jobs.clone(),
            queue.clone(),
            layout.clone(),
            config.retry,
        ));
        let trigger = Arc::new(SummarizeTrigger::new(
            catalog.clone(),
            transcripts.clone(),
            outputs.clone(),
            jobs.clone(),
            producer.clone(),
        ));

        let mut registry = StageRegistry::new();
        if config.roles.runs(JobKind::Transcribe) {
            let provider = providers
                .transcription
                .clone()
                .ok_or_else(|| Error::config("transcribe role needs a transcription provider"))?;
            let notifier: Arc<dyn StageNotifier> = match config.trigger_mode {
                TriggerMode::InProcess => Arc::new(InProcessStageNotifier::new(trigger.clone())),
                TriggerMode::Http => Arc::new(HttpStageNotifier::new(
                    build_client(INTERNAL_REQUEST_TIMEOUT)?,
                    config.api_base_url.clone(),
                    internal_key(&config)?,
                )),
            };
            registry.register(Arc::new(
                TranscriptionStage::new(
                    provider,
                    transcripts.clone(),
                    catalog.clone(),
                    notifier,
                    producer.clone(),
                    config.worker.transcription(),
                )
                .with_cancellation(cancellation_token.child_token()),
            ));
        }
        if config.roles.runs(JobKind::Summarize) || config.roles.runs(JobKind::Tag) {
            let generator = providers
                .text
                .clone()
                .ok_or_else(|| Error::config("summarize and tag roles need a text generator"))?;
            registry.register(Arc::new(SummarizeTagStage::new(
                generator,
                catalog.clone(),
                transcripts.clone(),
                outputs.clone(),
            )));
        }
        if config.roles.runs(JobKind::Embed) {
            let provider = providers
                .embedding
                .clone()
                .ok_or_else(|| Error::config("embed role needs an embedding provider"))?;
            registry.register(Arc::new(EmbeddingStage::new(
                provider,
                catalog.clone(),
                transcripts.clone(),
                outputs.clone(),
                config.embedding,
            )));
        }
        let registry = Arc::new(registry);

        let workers = config
            .roles
            .stages
            .iter()
            .map(|&kind| {
                Arc::new(StageWorker::new(
                    kind,
                    config.worker.worker_config(kind),
                    queue.clone(),
                    layout.clone(),
                    registry.clone(),
                    status.clone(),
                    retry.clone(),
                    cancellation_token.child_token(),
                ))
            })
            .collect();

        Ok(Self {
            pool,
            config,
            jobs,
            catalog,
            transcripts,
            outputs,
            queue,
            layout,
            producer,
            retry,
            trigger,
            workers,
            api_task: parking_lot::Mutex::new(None),
            cancellation_token,
        })
    }

    /// Handler state for the internal API.
    pub fn app_state(&self) -> AppState {
        AppState {
            jobs: self.jobs.clone(),
            catalog: self.catalog.clone(),
            producer: self.producer.clone(),
            retry: self.retry.clone(),
            trigger: self.trigger.clone(),
            queue: self.queue.clone(),
            layout: self.layout.clone(),
        }
    }

    pub fn workers(&self) -> &[Arc<StageWorker>] {
        &self.workers
    }

    /// Recover stale jobs, start the workers and, with the api role, the server.
    pub async fn start(&self) -> Result<()> {
        for worker in &self.workers {
            // Workers reporting over the webhook cannot see the store.
            if self.config.status_reporting == StatusReporting::Store {
                worker.recover_stale_jobs(self.jobs.as_ref()).await?;
            }
            worker.start();
        }

        if self.config.roles.api {
            let server = ApiServer::new(
                self.config.api.clone(),
                self.app_state(),
                internal_key(&self.config)?,
                self.cancellation_token.child_token(),
            );
            let handle = tokio::spawn(async move {
                if let Err(e) = server.run().await {
                    error!(error = %e, "API server failed");
                }
            });
            *self.api_task.lock() = Some(handle);
        }

        info!(
            api = self.config.roles.api,
            stages = ?self.config.roles.stages,
            "Services started"
        );
        Ok(())
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_with_timeout(DEFAULT_SHUTDOWN_TIMEOUT).await
    }

    /// Stop the workers, drain in-flight jobs and close the pool.
    pub async fn shutdown_with_timeout(&self, timeout: Duration) -> Result<()> {
        info!("Shutting down services (timeout: {:?})", timeout);
        self.cancellation_token.cancel();

        let drained = tokio::time::timeout(timeout, async {
            for worker in &self.workers {
                worker.stop().await;
            }
            let api_task = self.api_task.lock().take();
            if let Some(handle) = api_task
                && let Err(e) = handle.await
            {
                warn!(error = %e, "API server task ended abnormally");
            }
        })
        .await;

        if drained.is_err() {
            warn!("Shutdown timeout reached, forcing shutdown");
        }

        info!("Closing database pool...");
        self.pool.close().await;

        info!("Services shut down");
        Ok(())
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }
}

fn internal_key(config: &PipelineConfig) -> Result<String> {
    config
        .internal_api_key
        .clone()
        .ok_or_else(|| Error::config("INTERNAL_API_KEY is not set"))
}
