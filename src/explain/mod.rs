//! Explanation dispatch -- natural-language rationale for detected anomalies.
//!
//! The reasoning service sits behind the narrow [`ReasoningService`] trait. The
//! [`Explainer`] wraps it with optional retries under one hard timeout and a
//! fallback text, so callers always get *some* explanation back.

pub mod local;
pub mod openai;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::SecondsFormat;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{ExplainConfig, ProviderKind};
use crate::storage::{AnomalyCandidate, AnomalyRecord};

pub use self::local::LocalService;
pub use self::openai::OpenAiService;

/// System text for anomaly explanations.
pub const EXPLAIN_SYSTEM: &str = "You are a cybersecurity AI that explains network anomalies.";

/// System text for free-text questions about the anomaly history.
pub const CHAT_SYSTEM: &str = "You are an expert cybersecurity assistant.";

/// Reply to a blank chat question; the reasoning service is not called.
pub const EMPTY_QUESTION_REPLY: &str = "Please ask a valid question.";

/// Longest explanation excerpt carried into prompt context per history row.
const CONTEXT_EXCERPT_CHARS: usize = 200;

#[derive(Debug, Error)]
pub enum ExplainError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API error: {status} {body}")]
    Api { status: u16, body: String },
    #[error("failed to parse response: {0}")]
    Parse(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("reasoning service not configured: {0}")]
    NotConfigured(String),
}

/// A single request to the reasoning service.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub system: String,
    pub prompt: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// External reasoning capability: text in, text out.
#[async_trait]
pub trait ReasoningService: Send + Sync {
    /// Short identifier for logs.
    fn name(&self) -> &'static str;

    async fn complete(&self, request: &CompletionRequest) -> Result<String, ExplainError>;
}

/// Explanation text and whether it is the degraded fallback.
#[derive(Debug, Clone, PartialEq)]
pub struct Explanation {
    pub text: String,
    pub degraded: bool,
}

/// Text recorded when the reasoning service could not produce an explanation.
pub fn fallback_explanation(err: &ExplainError) -> String {
    format!("explanation unavailable: {err}")
}

/// Prompt describing one anomaly plus prior anomalies as context.
pub fn explain_prompt(candidate: &AnomalyCandidate, history: &[AnomalyRecord]) -> String {
    let source = match candidate.source_address() {
        "" => "unknown",
        addr => addr,
    };
    let mut prompt = format!(
        "Analyze this security event and provide a structured summary: \
         Unusual activity detected: IP={source}, PacketSize={}, ResponseTime={}, AnomalyScore={:.3}",
        candidate.packet_size(),
        candidate.response_time(),
        candidate.score(),
    );

    if history.is_empty() {
        prompt.push_str("\n\nNo prior anomalies have been recorded.");
    } else {
        prompt.push_str("\n\nRecent anomalies (most recent first):\n");
        prompt.push_str(&history_context(history));
    }
    prompt
}

/// Prompt answering a free-text question against the anomaly history.
pub fn chat_prompt(question: &str, history: &[AnomalyRecord]) -> String {
    let context = if history.is_empty() {
        "(no anomalies recorded yet)".to_string()
    } else {
        history_context(history)
    };
    format!(
        "You are a cybersecurity AI. Answer user questions based on the following network anomalies:\n\n\
         {context}\n\nUser's Question: {question}"
    )
}

/// One line per record: `timestamp | address | size bytes | time ms | status | explanation`.
pub fn history_context(history: &[AnomalyRecord]) -> String {
    history
        .iter()
        .map(|r| {
            format!(
                "{} | {} | {} bytes | {} ms | {} | {}",
                r.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
                if r.source_address.is_empty() { "-" } else { &r.source_address },
                r.packet_size,
                r.response_time,
                r.status,
                excerpt(&r.explanation),
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn excerpt(text: &str) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= CONTEXT_EXCERPT_CHARS {
        flat
    } else {
        let cut: String = flat.chars().take(CONTEXT_EXCERPT_CHARS).collect();
        format!("{cut}...")
    }
}

/// Dispatches explanation and chat requests with timeout, retry and fallback.
#[derive(Clone)]
pub struct Explainer {
    service: Arc<dyn ReasoningService>,
    timeout: Duration,
    retries: u32,
    history_limit: usize,
    temperature: f32,
    max_tokens: u32,
    chat_max_tokens: u32,
}

impl Explainer {
    pub fn new(service: Arc<dyn ReasoningService>, cfg: &ExplainConfig) -> Self {
        Self {
            service,
            timeout: cfg.timeout(),
            retries: cfg.retries,
            history_limit: cfg.history_limit,
            temperature: cfg.temperature,
            max_tokens: cfg.max_tokens,
            chat_max_tokens: cfg.chat_max_tokens,
        }
    }

    /// Build the configured reasoning service.
    ///
    /// A missing API key is not fatal: every call then degrades to the fallback.
    pub fn from_config(cfg: &ExplainConfig) -> Result<Self, ExplainError> {
        let service: Arc<dyn ReasoningService> = match cfg.provider {
            ProviderKind::Openai => {
                let key = cfg.api_key();
                if key.is_none() {
                    warn!(
                        env = %cfg.api_key_env,
                        "API key not set, explanations will use the fallback text"
                    );
                }
                Arc::new(OpenAiService::new(&cfg.endpoint, &cfg.model, key)?)
            }
            ProviderKind::Local => Arc::new(LocalService),
        };
        Ok(Self::new(service, cfg))
    }

    pub fn service_name(&self) -> &'static str {
        self.service.name()
    }

    /// How many prior anomalies to pass as context.
    pub fn history_limit(&self) -> usize {
        self.history_limit
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Explain one anomaly. Never fails; service errors yield the fallback text.
    pub async fn explain(&self, candidate: &AnomalyCandidate, history: &[AnomalyRecord]) -> Explanation {
        let context = &history[..history.len().min(self.history_limit)];
        let request = CompletionRequest {
            system: EXPLAIN_SYSTEM.to_string(),
            prompt: explain_prompt(candidate, context),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };

        match self.dispatch(&request).await {
            Ok(text) => Explanation {
                text,
                degraded: false,
            },
            Err(e) => {
                warn!(
                    source = %candidate.source_address(),
                    error = %e,
                    "explanation unavailable, using fallback"
                );
                Explanation {
                    text: fallback_explanation(&e),
                    degraded: true,
                }
            }
        }
    }

    /// Answer a free-text question about recent anomalies. Same fallback contract
    /// as [`Explainer::explain`].
    pub async fn answer(&self, question: &str, history: &[AnomalyRecord]) -> String {
        let question = question.trim();
        if question.is_empty() {
            return EMPTY_QUESTION_REPLY.to_string();
        }

        let context = &history[..history.len().min(self.history_limit)];
        let request = CompletionRequest {
            system: CHAT_SYSTEM.to_string(),
            prompt: chat_prompt(question, context),
            temperature: self.temperature,
            max_tokens: self.chat_max_tokens,
        };

        match self.dispatch(&request).await {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "chat answer unavailable, using fallback");
                fallback_explanation(&e)
            }
        }
    }

    /// Try the service up to `retries + 1` times. The timeout bounds the whole
    /// sequence, not each attempt.
    async fn dispatch(&self, request: &CompletionRequest) -> Result<String, ExplainError> {
        // Dropping the timed-out future cancels the in-flight request.
        match tokio::time::timeout(self.timeout, self.attempt_all(request)).await {
            Ok(result) => result,
            Err(_) => Err(ExplainError::Timeout(self.timeout)),
        }
    }

    async fn attempt_all(&self, request: &CompletionRequest) -> Result<String, ExplainError> {
        let attempts = self.retries + 1;
        let mut last_err = ExplainError::Parse("no attempt made".to_string());

        for attempt in 1..=attempts {
            let started = Instant::now();
            let result = match self.service.complete(request).await {
                Ok(text) if text.trim().is_empty() => Err(ExplainError::Parse("empty response".to_string())),
                Ok(text) => Ok(text.trim().to_string()),
                Err(e) => Err(e),
            };

            match result {
                Ok(text) => {
                    debug!(
                        service = self.service.name(),
                        attempt,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "reasoning service answered"
                    );
                    return Ok(text);
                }
                Err(e) => {
                    debug!(service = self.service.name(), attempt, attempts, error = %e, "reasoning call failed");
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }
}
