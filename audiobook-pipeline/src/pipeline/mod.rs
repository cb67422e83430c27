//! Stage pipeline: producer, workers, retry handling and the early summarize trigger.
//!
//! Jobs flow transcribe → summarize/tag → embed. Each kind has its own queue topic
//! and its own [`StageWorker`]; stages never share in-process state and coordinate
//! only through the queue and the stores.

pub mod producer;
pub mod retry;
pub mod stages;
pub mod status;
pub mod trigger;
pub mod worker;

pub use producer::Producer;
pub use retry::{RetryCoordinator, RetryDecision, RetryPolicy};
pub use stages::{
    EmbeddingStage, StageHandler, StageRegistry, SummarizeTagStage, TranscriptionStage,
};
pub use status::{JobStatusReporter, StoreStatusReporter, WebhookStatusReporter};
pub use trigger::{
    HttpStageNotifier, InProcessStageNotifier, StageNotifier, SummarizeTrigger, TriggerResponse,
};
pub use worker::{ProcessOutcome, StageWorker, StageWorkerConfig, StaleRecovery};
