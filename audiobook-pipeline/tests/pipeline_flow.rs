use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use tempfile::TempDir;

use audiobook_pipeline::config::PipelineConfig;
use audiobook_pipeline::database::models::{
    AiOutputDbModel, AudiobookDbModel, ChapterDbModel, JobDbModel, JobKind, JobStatus,
    JobStatusUpdate, OutputType, StageOutput, TranscriptDbModel,
};
use audiobook_pipeline::database::{init_pool, run_migrations};
use audiobook_pipeline::pipeline::StageWorker;
use audiobook_pipeline::pipeline::worker::STALE_JOB_ERROR;
use audiobook_pipeline::providers::{
    EmbeddingProvider, Monologue, ProviderJobStatus, RawTranscript, TextGenerator,
    TranscriptElement, TranscriptionProvider,
};
use audiobook_pipeline::queue::{
    ESCALATED_PRIORITY, InputScope, QueueBackend, QueueStats, queue_stats,
};
use audiobook_pipeline::services::{Providers, ServiceContainer};
use audiobook_pipeline::{Error, Result};

const SUMMARY_RESPONSE: &str = r#"{"summary": "A detective unravels a quiet village's secrets.", "tags": ["Fiction", "thriller", "mystery"]}"#;

/// Completes every submission immediately; the transcript echoes the audio reference.
struct FakeTranscriber;

#[async_trait]
impl TranscriptionProvider for FakeTranscriber {
    fn name(&self) -> &'static str {
        "fake-transcriber"
    }

    async fn submit(&self, audio_ref: &str, _job_id: &str) -> Result<String> {
        Ok(audio_ref.to_string())
    }

    async fn poll_status(&self, _handle: &str) -> Result<ProviderJobStatus> {
        Ok(ProviderJobStatus::Completed)
    }

    async fn fetch_result(&self, handle: &str) -> Result<RawTranscript> {
        Ok(RawTranscript {
            monologues: vec![Monologue {
                speaker: Some(0),
                elements: vec![TranscriptElement {
                    kind: "text".to_string(),
                    value: format!("narration-{handle}"),
                    ts: Some(0.0),
                    end_ts: Some(1.0),
                    confidence: Some(0.9),
                }],
            }],
        })
    }
}

/// Replays scripted results, then falls back to a fixed response. Records prompts.
struct ScriptedTextGenerator {
    script: Mutex<VecDeque<std::result::Result<String, String>>>,
    fallback: String,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedTextGenerator {
    fn new(fallback: &str) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: fallback.to_string(),
            prompts: Mutex::new(Vec::new()),
        }
    }

    fn failing_first(self, failures: usize, message: &str) -> Self {
        self.script
            .lock()
            .extend((0..failures).map(|_| Err(message.to_string())));
        self
    }

    fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }
}

#[async_trait]
impl TextGenerator for ScriptedTextGenerator {
    fn model(&self) -> &str {
        "scripted-model"
    }

    async fn generate_text(
        &self,
        prompt: &str,
        _temperature: f32,
        _max_tokens: u32,
    ) -> Result<String> {
        self.prompts.lock().push(prompt.to_string());
        match self.script.lock().pop_front() {
            Some(Ok(text)) => Ok(text),
            Some(Err(message)) => Err(Error::provider("scripted", message)),
            None => Ok(self.fallback.clone()),
        }
    }
}

struct FakeEmbedder;

#[async_trait]
impl EmbeddingProvider for FakeEmbedder {
    fn model(&self) -> &str {
        "fake-embedding"
    }

    async fn generate_embedding(&self, _text: &str) -> Result<Vec<f64>> {
        Ok(vec![0.1, 0.2, 0.3])
    }
}

struct Harness {
    _dir: TempDir,
    container: ServiceContainer,
    generator: Arc<ScriptedTextGenerator>,
}

impl Harness {
    fn worker(&self, kind: JobKind) -> Arc<StageWorker> {
        self.container
            .workers()
            .iter()
            .find(|w| w.kind() == kind)
            .cloned()
            .expect("worker for kind")
    }

    async fn stats(&self, kind: JobKind) -> QueueStats {
        queue_stats(self.container.queue.as_ref(), &self.container.layout, kind)
            .await
            .unwrap()
    }

    async fn job(&self, id: &str) -> JobDbModel {
        self.container.jobs.get_job(id).await.unwrap()
    }
}

async fn harness(generator: ScriptedTextGenerator) -> Harness {
    harness_with(generator, &[]).await
}

async fn harness_with(generator: ScriptedTextGenerator, extra: &[(&str, &str)]) -> Harness {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("pipeline.db");
    let pool = init_pool(&format!("sqlite:{}?mode=rwc", db_path.display()))
        .await
        .unwrap();
    run_migrations(&pool).await.unwrap();

    let mut vars: HashMap<&str, &str> = HashMap::from([
        ("PIPELINE_ROLES", "transcribe,summarize,tag,embed"),
        ("REV_AI_API_KEY", "test-rev"),
        ("GEMINI_API_KEY", "test-gemini"),
        ("MAX_CONCURRENT_JOBS", "1"),
        ("TRANSCRIPTION_POLL_INTERVAL", "1"),
    ]);
    vars.extend(extra.iter().copied());
    let config = PipelineConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string())).unwrap();

    let generator = Arc::new(generator);
    let providers = Providers {
        transcription: Some(Arc::new(FakeTranscriber)),
        text: Some(generator.clone()),
        embedding: Some(Arc::new(FakeEmbedder)),
    };
    let container = ServiceContainer::with_providers(pool, config, providers).unwrap();

    Harness {
        _dir: dir,
        container,
        generator,
    }
}

async fn seed_book(container: &ServiceContainer, chapters: i64) -> (AudiobookDbModel, Vec<ChapterDbModel>) {
    let book = AudiobookDbModel::new("The Quiet Village");
    container.catalog.create_audiobook(&book).await.unwrap();
    container
        .catalog
        .add_allowed_tags(&["fiction", "mystery"])
        .await
        .unwrap();

    let mut rows = Vec::new();
    for n in 1..=chapters {
        let chapter = ChapterDbModel::new(&book.id, n).with_file_path(format!("ch{n}.mp3"));
        container.catalog.create_chapter(&chapter).await.unwrap();
        rows.push(chapter);
    }
    (book, rows)
}

async fn enqueue_transcription(
    container: &ServiceContainer,
    book: &AudiobookDbModel,
    chapter: &ChapterDbModel,
) -> JobDbModel {
    container
        .producer
        .create_and_enqueue(
            &book.id,
            Some(&chapter.id),
            JobKind::Transcribe,
            chapter.file_path.as_deref(),
            None,
        )
        .await
        .unwrap()
}

#[tokio::test]
async fn test_single_chapter_flows_through_every_stage() {
    let h = harness(ScriptedTextGenerator::new(SUMMARY_RESPONSE)).await;
    let (book, chapters) = seed_book(&h.container, 1).await;
    enqueue_transcription(&h.container, &book, &chapters[0]).await;

    assert_eq!(h.worker(JobKind::Transcribe).run_once().await.unwrap(), 1);

    let transcript = h
        .container
        .transcripts
        .get_transcript(&book.id, Some(&chapters[0].id))
        .await
        .unwrap()
        .expect("chapter transcript");
    assert_eq!(transcript.content, "narration-ch1.mp3");
    assert!(transcript.processing_time_seconds.is_some());

    // First chapter triggers summarize; the last chapter chains embed.
    assert_eq!(h.stats(JobKind::Summarize).await.pending, 1);
    assert_eq!(h.stats(JobKind::Embed).await.pending, 1);

    assert_eq!(h.worker(JobKind::Summarize).run_once().await.unwrap(), 1);
    assert_eq!(h.worker(JobKind::Embed).run_once().await.unwrap(), 1);

    let summary = h
        .container
        .outputs
        .get_output(&book.id, OutputType::Summary)
        .await
        .unwrap()
        .expect("summary output");
    assert_eq!(summary.model_used, "scripted-model");
    match summary.get_output().unwrap() {
        StageOutput::SummaryWithTags { summary, tags } => {
            assert_eq!(summary, "A detective unravels a quiet village's secrets.");
            assert_eq!(tags, vec!["Fiction".to_string(), "mystery".to_string()]);
        }
        other => panic!("unexpected output: {other:?}"),
    }

    let embedding = h
        .container
        .outputs
        .get_output(&book.id, OutputType::Embedding)
        .await
        .unwrap()
        .expect("embedding output");
    match embedding.get_output().unwrap() {
        StageOutput::Embedding { vector, .. } => assert_eq!(vector, vec![0.1, 0.2, 0.3]),
        other => panic!("unexpected output: {other:?}"),
    }

    let jobs = h
        .container
        .jobs
        .list_jobs_for_audiobook(&book.id)
        .await
        .unwrap();
    assert_eq!(jobs.len(), 3);
    for job in &jobs {
        assert_eq!(job.status(), Some(JobStatus::Completed), "job {}", job.kind);
        assert!(job.is_consistent(), "job {} is inconsistent", job.kind);
    }
}

#[tokio::test]
async fn test_summarize_starts_after_first_chapter() {
    let h = harness(ScriptedTextGenerator::new(SUMMARY_RESPONSE)).await;
    let (book, chapters) = seed_book(&h.container, 3).await;
    for chapter in &chapters {
        enqueue_transcription(&h.container, &book, chapter).await;
    }

    let transcribe = h.worker(JobKind::Transcribe);
    assert_eq!(transcribe.run_once().await.unwrap(), 1);

    assert_eq!(h.stats(JobKind::Transcribe).await.pending, 2);
    assert_eq!(h.stats(JobKind::Summarize).await.pending, 1);
    assert_eq!(h.stats(JobKind::Embed).await.pending, 0);

    assert_eq!(h.worker(JobKind::Summarize).run_once().await.unwrap(), 1);
    let prompts = h.generator.prompts();
    assert_eq!(prompts.len(), 1);
    assert!(prompts[0].contains("narration-ch1.mp3"));
    assert!(!prompts[0].contains("narration-ch2.mp3"));

    assert_eq!(transcribe.run_once().await.unwrap(), 1);
    assert_eq!(transcribe.run_once().await.unwrap(), 1);

    assert_eq!(h.stats(JobKind::Summarize).await.pending, 0);
    assert_eq!(h.stats(JobKind::Embed).await.pending, 1);

    let again = h.container.trigger.trigger(&book.id).await;
    assert!(matches!(again, Err(Error::Conflict(_))), "{again:?}");
}

#[tokio::test]
async fn test_trigger_rejects_untranscribed_first_chapter() {
    let h = harness(ScriptedTextGenerator::new(SUMMARY_RESPONSE)).await;
    let (book, _) = seed_book(&h.container, 2).await;

    let result = h.container.trigger.trigger(&book.id).await;
    assert!(matches!(result, Err(Error::Validation(_))), "{result:?}");

    let missing = h.container.trigger.trigger("no-such-book").await;
    assert!(matches!(missing, Err(Error::NotFound { .. })), "{missing:?}");
}

#[tokio::test]
async fn test_failures_escalate_then_dead_letter_then_manual_retry() {
    let generator = ScriptedTextGenerator::new(SUMMARY_RESPONSE).failing_first(3, "quota exceeded");
    let h = harness(generator).await;
    let (book, chapters) = seed_book(&h.container, 1).await;

    let transcript =
        TranscriptDbModel::new(&book.id, Some(chapters[0].id.clone()), "A quiet village.", &[], 0.9)
            .unwrap();
    h.container.transcripts.save_transcript(&transcript).await.unwrap();

    let job = h
        .container
        .producer
        .create_and_enqueue(&book.id, None, JobKind::Summarize, None, Some(InputScope::AllUnits))
        .await
        .unwrap();
    let summarize = h.worker(JobKind::Summarize);

    assert_eq!(summarize.run_once().await.unwrap(), 1);
    let after_first = h.job(&job.id).await;
    assert_eq!(after_first.status(), Some(JobStatus::Pending));
    assert_eq!(after_first.retry_count, 1);
    assert!(after_first.error_message.as_deref().unwrap_or_default().contains("quota exceeded"));
    assert!(after_first.is_consistent());
    assert_eq!(h.stats(JobKind::Summarize).await.pending, 1);

    assert_eq!(summarize.run_once().await.unwrap(), 1);
    assert_eq!(summarize.run_once().await.unwrap(), 1);

    let exhausted = h.job(&job.id).await;
    assert_eq!(exhausted.status(), Some(JobStatus::Failed));
    assert_eq!(exhausted.retry_count, 3);
    assert!(exhausted.error_message.as_deref().unwrap_or_default().contains("quota exceeded"));
    assert!(exhausted.is_consistent());

    let stats = h.stats(JobKind::Summarize).await;
    assert_eq!((stats.pending, stats.failed), (0, 1));
    assert_eq!(summarize.run_once().await.unwrap(), 0);

    let message = h
        .container
        .retry
        .retry_dead_letter(JobKind::Summarize, &job.id)
        .await
        .unwrap();
    assert_eq!(message.retry_count, 0);
    assert_eq!(message.priority, ESCALATED_PRIORITY);

    let reset = h.job(&job.id).await;
    assert_eq!(reset.status(), Some(JobStatus::Pending));
    assert_eq!(reset.retry_count, 0);

    assert_eq!(summarize.run_once().await.unwrap(), 1);
    assert_eq!(h.job(&job.id).await.status(), Some(JobStatus::Completed));
    assert!(
        h.container
            .outputs
            .get_output(&book.id, OutputType::Summary)
            .await
            .unwrap()
            .is_some()
    );

    let gone = h.container.retry.retry_dead_letter(JobKind::Summarize, &job.id).await;
    assert!(matches!(gone, Err(Error::NotFound { .. })), "{gone:?}");
}

#[tokio::test]
async fn test_manual_retry_blocked_by_newer_job_keeps_message_parked() {
    let h = harness(ScriptedTextGenerator::new(SUMMARY_RESPONSE)).await;
    let (book, _) = seed_book(&h.container, 1).await;
    let summarize = |container: &ServiceContainer| {
        let producer = container.producer.clone();
        let book_id = book.id.clone();
        async move {
            producer
                .create_and_enqueue(&book_id, None, JobKind::Summarize, None, Some(InputScope::AllUnits))
                .await
        }
    };

    let older = summarize(&h.container).await.unwrap();
    let working = h.container.layout.working(JobKind::Summarize);
    let dead_letter = h.container.layout.dead_letter(JobKind::Summarize);
    let mut message = h.container.queue.claim_next(&working).await.unwrap().unwrap();
    message.retry_count = 3;
    h.container
        .jobs
        .apply_status_update(&older.id, &JobStatusUpdate::failed("quota exceeded").with_retry_count(3))
        .await
        .unwrap();
    h.container.queue.move_to_dead_letter(&dead_letter, &message).await.unwrap();

    let newer = summarize(&h.container).await.unwrap();

    let blocked = h.container.retry.retry_dead_letter(JobKind::Summarize, &older.id).await;
    assert!(matches!(blocked, Err(Error::Conflict(_))), "{blocked:?}");

    let stats = h.stats(JobKind::Summarize).await;
    assert_eq!((stats.pending, stats.failed), (1, 1));
    assert!(h.container.queue.contains(&dead_letter, &older.id).await.unwrap());
    assert_eq!(h.job(&older.id).await.status(), Some(JobStatus::Failed));
    assert_eq!(h.job(&newer.id).await.status(), Some(JobStatus::Pending));
}

#[tokio::test]
async fn test_transcription_without_file_path_dead_letters() {
    let h = harness(ScriptedTextGenerator::new(SUMMARY_RESPONSE)).await;
    let (book, chapters) = seed_book(&h.container, 1).await;

    let job = h
        .container
        .producer
        .create_and_enqueue(&book.id, Some(&chapters[0].id), JobKind::Transcribe, None, None)
        .await
        .unwrap();

    let transcribe = h.worker(JobKind::Transcribe);
    for _ in 0..3 {
        assert_eq!(transcribe.run_once().await.unwrap(), 1);
    }

    let failed = h.job(&job.id).await;
    assert_eq!(failed.status(), Some(JobStatus::Failed));
    assert!(failed.error_message.as_deref().unwrap_or_default().contains("no file path"));
    assert_eq!(h.stats(JobKind::Transcribe).await.failed, 1);
    assert_eq!(h.stats(JobKind::Summarize).await.pending, 0);
}

#[tokio::test]
async fn test_duplicate_active_job_is_rejected() {
    let h = harness(ScriptedTextGenerator::new(SUMMARY_RESPONSE)).await;
    let (book, chapters) = seed_book(&h.container, 1).await;
    enqueue_transcription(&h.container, &book, &chapters[0]).await;

    let duplicate = h
        .container
        .producer
        .create_and_enqueue(
            &book.id,
            Some(&chapters[0].id),
            JobKind::Transcribe,
            chapters[0].file_path.as_deref(),
            None,
        )
        .await;
    assert!(matches!(duplicate, Err(Error::Conflict(_))), "{duplicate:?}");
    assert_eq!(h.stats(JobKind::Transcribe).await.pending, 1);
}

#[tokio::test]
async fn test_save_output_is_idempotent_per_type() {
    let h = harness(ScriptedTextGenerator::new(SUMMARY_RESPONSE)).await;
    let (book, _) = seed_book(&h.container, 1).await;

    let first = StageOutput::Tags {
        tags: vec!["fiction".into()],
    };
    let second = StageOutput::Tags {
        tags: vec!["mystery".into()],
    };
    for output in [&first, &second] {
        let row = AiOutputDbModel::new(&book.id, output, "scripted-model").unwrap();
        h.container.outputs.save_output(&row).await.unwrap();
    }

    let stored = h
        .container
        .outputs
        .get_output(&book.id, OutputType::Tags)
        .await
        .unwrap()
        .expect("tags output");
    assert_eq!(stored.get_output().unwrap(), second);

    let (count,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM ai_output WHERE audiobook_id = ? AND output_type = 'tags'")
            .bind(&book.id)
            .fetch_one(&h.container.pool)
            .await
            .unwrap();
    assert_eq!(count, 1);
}

#[tokio::test]
async fn test_stale_running_jobs_are_failed_on_recovery() {
    let h = harness(ScriptedTextGenerator::new(SUMMARY_RESPONSE)).await;
    let (book, chapters) = seed_book(&h.container, 1).await;
    let job = enqueue_transcription(&h.container, &book, &chapters[0]).await;

    let mut running = JobStatusUpdate::new(JobStatus::Running);
    running.started_at = Some(Utc::now() - ChronoDuration::hours(2));
    h.container.jobs.apply_status_update(&job.id, &running).await.unwrap();

    let recovered = h
        .worker(JobKind::Transcribe)
        .recover_stale_jobs(h.container.jobs.as_ref())
        .await
        .unwrap();
    assert_eq!(recovered, 1);

    let failed = h.job(&job.id).await;
    assert_eq!(failed.status(), Some(JobStatus::Failed));
    assert_eq!(failed.error_message.as_deref(), Some(STALE_JOB_ERROR));
    assert!(failed.is_consistent());

    // Summarize jobs are untouched by the transcribe worker's recovery.
    assert_eq!(
        h.worker(JobKind::Summarize)
            .recover_stale_jobs(h.container.jobs.as_ref())
            .await
            .unwrap(),
        0
    );
}

#[tokio::test]
async fn test_recent_running_jobs_survive_timeout_recovery() {
    let h = harness(ScriptedTextGenerator::new(SUMMARY_RESPONSE)).await;
    let (book, chapters) = seed_book(&h.container, 1).await;
    let job = enqueue_transcription(&h.container, &book, &chapters[0]).await;

    let running = JobStatusUpdate::new(JobStatus::Running);
    h.container.jobs.apply_status_update(&job.id, &running).await.unwrap();

    let recovered = h
        .worker(JobKind::Transcribe)
        .recover_stale_jobs(h.container.jobs.as_ref())
        .await
        .unwrap();
    assert_eq!(recovered, 0);
    assert_eq!(h.job(&job.id).await.status(), Some(JobStatus::Running));
}

#[tokio::test]
async fn test_recover_all_fails_recently_started_jobs() {
    let h = harness_with(
        ScriptedTextGenerator::new(SUMMARY_RESPONSE),
        &[("STALE_RECOVERY", "all")],
    )
    .await;
    let (book, chapters) = seed_book(&h.container, 1).await;
    let job = enqueue_transcription(&h.container, &book, &chapters[0]).await;

    let running = JobStatusUpdate::new(JobStatus::Running);
    h.container.jobs.apply_status_update(&job.id, &running).await.unwrap();

    let recovered = h
        .worker(JobKind::Transcribe)
        .recover_stale_jobs(h.container.jobs.as_ref())
        .await
        .unwrap();
    assert_eq!(recovered, 1);

    let failed = h.job(&job.id).await;
    assert_eq!(failed.status(), Some(JobStatus::Failed));
    assert_eq!(failed.error_message.as_deref(), Some(STALE_JOB_ERROR));
}
