//! Process configuration, read once from the environment at startup.
//!
//! Every setting has a default except the credentials of the roles that need them.
//! A bad value is a [`crate::Error::Configuration`] and stops the process.

use std::str::FromStr;
use std::time::Duration;

use crate::api::server::ApiServerConfig;
use crate::database::models::JobKind;
use crate::pipeline::retry::RetryPolicy;
use crate::pipeline::stages::embed::{DEFAULT_EMBEDDING_MAX_CHARS, EmbeddingSettings};
use crate::pipeline::stages::transcribe::TranscriptionSettings;
use crate::pipeline::worker::{StageWorkerConfig, StaleRecovery};
use crate::providers::{GeminiConfig, RevAiConfig};
use crate::queue::DEFAULT_PREFIX;
use crate::{Error, Result};

pub const DEFAULT_DATABASE_URL: &str = "sqlite:audiobooks.db?mode=rwc";
pub const DEFAULT_API_BASE_URL: &str = "http://localhost:8080";
pub const DEFAULT_ROLES: &str = "api,transcribe,summarize,tag,embed";
/// Worker headroom over the transcription polling budget, covering submit and fetch.
pub const TRANSCRIPTION_JOB_SLACK_SECS: u64 = 120;

/// How the transcription stage reaches the summarize trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum TriggerMode {
    /// Call the trigger directly; requires the same database.
    InProcess,
    /// POST to the internal API at `API_BASE_URL`.
    Http,
}

/// Where workers write job status transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum StatusReporting {
    Store,
    Webhook,
}

/// Components this process runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Roles {
    pub api: bool,
    pub stages: Vec<JobKind>,
}

impl Roles {
    pub fn parse(raw: &str) -> Result<Self> {
        let mut roles = Self {
            api: false,
            stages: Vec::new(),
        };
        for role in raw.split(',').map(str::trim).filter(|r| !r.is_empty()) {
            if role.eq_ignore_ascii_case("api") {
                roles.api = true;
                continue;
            }
            let kind = JobKind::parse(&role.to_ascii_lowercase())
                .ok_or_else(|| Error::config(format!("unknown role '{role}' in PIPELINE_ROLES")))?;
            if !roles.stages.contains(&kind) {
                roles.stages.push(kind);
            }
        }
        if !roles.api && roles.stages.is_empty() {
            return Err(Error::config("PIPELINE_ROLES selects nothing to run"));
        }
        Ok(roles)
    }

    pub fn runs(&self, kind: JobKind) -> bool {
        self.stages.contains(&kind)
    }

    fn needs_text_provider(&self) -> bool {
        self.runs(JobKind::Summarize) || self.runs(JobKind::Tag) || self.runs(JobKind::Embed)
    }
}

/// Worker timing, in seconds unless noted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSettings {
    pub max_concurrent_jobs: usize,
    pub poll_interval_secs: u64,
    pub iteration_delay_secs: u64,
    pub transcription_timeout_secs: u64,
    pub ai_timeout_secs: u64,
    pub transcription_poll_interval_secs: u64,
    pub stale_recovery: StaleRecovery,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 5,
            poll_interval_secs: 5,
            iteration_delay_secs: 5,
            transcription_timeout_secs: 1800,
            ai_timeout_secs: 300,
            transcription_poll_interval_secs: 5,
            stale_recovery: StaleRecovery::Timeout,
        }
    }
}

impl WorkerSettings {
    pub fn job_timeout_secs(&self, kind: JobKind) -> u64 {
        match kind {
            JobKind::Transcribe => self
                .transcription_timeout_secs
                .saturating_add(TRANSCRIPTION_JOB_SLACK_SECS),
            JobKind::Summarize | JobKind::Tag | JobKind::Embed => self.ai_timeout_secs,
        }
    }

    pub fn worker_config(&self, kind: JobKind) -> StageWorkerConfig {
        StageWorkerConfig {
            max_concurrent_jobs: self.max_concurrent_jobs,
            poll_interval_ms: self.poll_interval_secs * 1000,
            iteration_delay_ms: self.iteration_delay_secs * 1000,
            stale_recovery: self.stale_recovery,
            ..StageWorkerConfig::default()
        }
        .with_job_timeout_secs(self.job_timeout_secs(kind))
    }

    pub fn transcription(&self) -> TranscriptionSettings {
        TranscriptionSettings {
            poll_interval: Duration::from_secs(self.transcription_poll_interval_secs),
            timeout: Duration::from_secs(self.transcription_timeout_secs),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub database_url: String,
    pub jobs_prefix: String,
    pub api_base_url: String,
    pub api: ApiServerConfig,
    pub internal_api_key: Option<String>,
    pub roles: Roles,
    pub trigger_mode: TriggerMode,
    pub status_reporting: StatusReporting,
    pub worker: WorkerSettings,
    pub retry: RetryPolicy,
    pub rev_ai: Option<RevAiConfig>,
    pub gemini: Option<GeminiConfig>,
    pub embedding: EmbeddingSettings,
    pub log_dir: Option<String>,
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let roles = Roles::parse(&var("PIPELINE_ROLES").unwrap_or_else(|| DEFAULT_ROLES.into()))?;
        let trigger_mode = parse_enum(&var, "TRIGGER_MODE", TriggerMode::InProcess)?;
        let status_reporting = parse_enum(&var, "STATUS_REPORTING", StatusReporting::Store)?;

        let api_base_url = var("API_BASE_URL").unwrap_or_else(|| DEFAULT_API_BASE_URL.into());
        url::Url::parse(&api_base_url)
            .map_err(|e| Error::config(format!("API_BASE_URL '{api_base_url}' is invalid: {e}")))?;

        let mut api = ApiServerConfig::default();
        if let Some(bind_address) = var("API_BIND_ADDRESS") {
            api.bind_address = bind_address;
        }
        api.port = parse_num(&var, "API_PORT", api.port)?;

        let internal_api_key = var("INTERNAL_API_KEY");
        let needs_internal_key = roles.api
            || (!roles.stages.is_empty()
                && (trigger_mode == TriggerMode::Http
                    || status_reporting == StatusReporting::Webhook));
        if needs_internal_key && internal_api_key.is_none() {
            return Err(Error::config(
                "INTERNAL_API_KEY is required for the api role, the http trigger and webhook status reporting",
            ));
        }

        let worker = WorkerSettings {
            max_concurrent_jobs: parse_positive(&var, "MAX_CONCURRENT_JOBS", 5)?,
            poll_interval_secs: parse_positive(&var, "JOB_POLL_INTERVAL", 5)?,
            iteration_delay_secs: parse_num(&var, "JOB_ITERATION_DELAY", 5)?,
            transcription_timeout_secs: parse_positive(&var, "TRANSCRIPTION_JOB_TIMEOUT", 1800)?,
            ai_timeout_secs: parse_positive(&var, "AI_JOB_TIMEOUT", 300)?,
            transcription_poll_interval_secs: parse_positive(&var, "TRANSCRIPTION_POLL_INTERVAL", 5)?,
            stale_recovery: parse_enum(&var, "STALE_RECOVERY", StaleRecovery::Timeout)?,
        };

        let rev_ai = match var("REV_AI_API_KEY") {
            Some(key) => {
                let mut config = RevAiConfig::new(key);
                if let Some(base_url) = var("REV_AI_URL") {
                    validate_url("REV_AI_URL", &base_url)?;
                    config = config.with_base_url(base_url);
                }
                Some(config)
            }
            None if roles.runs(JobKind::Transcribe) => {
                return Err(Error::config("REV_AI_API_KEY is required for the transcribe role"));
            }
            None => None,
        };

        let gemini = match var("GEMINI_API_KEY") {
            Some(key) => {
                let mut config = GeminiConfig::new(key);
                if let Some(base_url) = var("GEMINI_URL") {
                    validate_url("GEMINI_URL", &base_url)?;
                    config = config.with_base_url(base_url);
                }
                if let Some(model) = var("GEMINI_MODEL") {
                    config.model = model;
                }
                if let Some(model) = var("GEMINI_EMBEDDING_MODEL") {
                    config.embedding_model = model;
                }
                Some(config)
            }
            None if roles.needs_text_provider() => {
                return Err(Error::config(
                    "GEMINI_API_KEY is required for the summarize, tag and embed roles",
                ));
            }
            None => None,
        };

        let embedding = EmbeddingSettings {
            max_chars: parse_positive(&var, "EMBEDDING_MAX_CHARS", DEFAULT_EMBEDDING_MAX_CHARS)?,
            dimensions: var("EMBEDDING_DIMENSIONS")
                .map(|_| parse_positive(&var, "EMBEDDING_DIMENSIONS", 0))
                .transpose()?,
        };

        Ok(Self {
            database_url: var("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.into()),
            jobs_prefix: var("JOBS_PREFIX").unwrap_or_else(|| DEFAULT_PREFIX.into()),
            api_base_url,
            api,
            internal_api_key,
            roles,
            trigger_mode,
            status_reporting,
            worker,
            retry: RetryPolicy::default(),
            rev_ai,
            gemini,
            embedding,
            log_dir: var("LOG_DIR"),
        })
    }
}

fn validate_url(key: &str, value: &str) -> Result<()> {
    url::Url::parse(value)
        .map(|_| ())
        .map_err(|e| Error::config(format!("{key} '{value}' is invalid: {e}")))
}

fn parse_num<T>(var: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match var(key) {
        Some(raw) => raw
            .parse()
            .map_err(|e| Error::config(format!("{key} '{raw}' is invalid: {e}"))),
        None => Ok(default),
    }
}

fn parse_positive<T>(var: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr + PartialOrd + Default,
    T::Err: std::fmt::Display,
{
    let value = parse_num(var, key, default)?;
    if value <= T::default() {
        return Err(Error::config(format!("{key} must be greater than zero")));
    }
    Ok(value)
}

fn parse_enum<T>(var: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
{
    match var(key) {
        Some(raw) => raw
            .to_ascii_lowercase()
            .parse()
            .map_err(|_| Error::config(format!("{key} '{raw}' is not a recognised value"))),
        None => Ok(default),
    }
}
