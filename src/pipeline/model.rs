//! Hosted-model access: the [`VisionModel`] seam and its edgequake-llm adapter.
//!
//! The extractor only ever sees [`VisionModel::invoke`]: a prompt, an image
//! or text payload and a tier in; free text out. Prompt engineering lives in
//! [`crate::prompts`] and reply parsing in [`crate::pipeline::parse`], so this
//! module is only about getting one reply back reliably.
//!
//! ## Retry Strategy
//!
//! Throttling (429) and overload (503) are transient and frequent under
//! concurrent load. Each attempt runs under the `api_timeout_secs` timeout and
//! failed attempts back off exponentially (`retry_backoff_ms * 2^(attempt-1)`).
//! These infrastructure retries are invisible to the extractor: a call that
//! succeeds on its third network attempt is still a single model call.
//!
//! Permanent provider errors (bad credentials, an invalid request, an unknown
//! model, a prompt over the token limit) would fail identically on every
//! attempt and are returned at once; see [`is_transient`].

use crate::config::{ModelTier, PipelineConfig};
use crate::error::{ModelCallError, TradeDocError};
use crate::prompts::with_document_text;
use crate::retry::RetryPolicy;
use crate::types::DocumentPayload;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::{
    ChatMessage, CompletionOptions, ImageData, LLMProvider, LlmError, ProviderFactory,
};
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

/// One hosted-model call.
#[derive(Debug, Clone, Copy)]
pub struct ModelRequest<'a> {
    pub tier: ModelTier,
    pub prompt: &'a str,
    pub payload: &'a DocumentPayload,
    pub max_tokens: usize,
    pub temperature: f32,
}

/// The raw reply of one call plus its bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelReply {
    pub text: String,
    pub model_id: String,
    pub input_tokens: usize,
    pub output_tokens: usize,
    pub duration_ms: u64,
    /// Infrastructure retries spent before the reply arrived.
    pub retries: u32,
}

/// Anything that can answer a prompt about a document on a given tier.
#[async_trait]
pub trait VisionModel: Send + Sync {
    async fn invoke(&self, request: &ModelRequest<'_>) -> Result<ModelReply, ModelCallError>;

    /// Model id behind a tier, for the audit trail.
    fn model_id(&self, tier: ModelTier) -> String;
}

/// [`VisionModel`] backed by two edgequake-llm providers, one per tier.
pub struct LlmVisionModel {
    cheap: Arc<dyn LLMProvider>,
    capable: Arc<dyn LLMProvider>,
    cheap_model_id: String,
    capable_model_id: String,
    policy: RetryPolicy,
}

impl std::fmt::Debug for LlmVisionModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmVisionModel")
            .field("cheap_model_id", &self.cheap_model_id)
            .field("capable_model_id", &self.capable_model_id)
            .field("policy", &self.policy)
            .finish()
    }
}

impl LlmVisionModel {
    /// Wrap two pre-constructed providers.
    pub fn new(
        cheap: Arc<dyn LLMProvider>,
        capable: Arc<dyn LLMProvider>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            cheap,
            capable,
            cheap_model_id: config.cheap_model_id.clone(),
            capable_model_id: config.capable_model_id.clone(),
            policy: RetryPolicy::for_model(config),
        }
    }

    /// Build both tiers from the configured (or auto-detected) provider.
    pub fn from_config(config: &PipelineConfig) -> Result<Self, TradeDocError> {
        let provider = resolve_provider_name(config)?;
        let cheap = create_provider(&provider, &config.cheap_model_id)?;
        let capable = create_provider(&provider, &config.capable_model_id)?;
        debug!(
            "Model tiers on '{}': cheap={} capable={}",
            provider, config.cheap_model_id, config.capable_model_id
        );
        Ok(Self::new(cheap, capable, config))
    }

    fn provider(&self, tier: ModelTier) -> &Arc<dyn LLMProvider> {
        match tier {
            ModelTier::Cheap => &self.cheap,
            ModelTier::Capable => &self.capable,
        }
    }
}

#[async_trait]
impl VisionModel for LlmVisionModel {
    async fn invoke(&self, request: &ModelRequest<'_>) -> Result<ModelReply, ModelCallError> {
        let start = Instant::now();
        let tier = request.tier;
        let provider = self.provider(tier);
        let messages = vec![build_message(request.prompt, request.payload)];
        let options = CompletionOptions {
            temperature: Some(request.temperature),
            max_tokens: Some(request.max_tokens),
            ..Default::default()
        };

        let mut last_err: Option<ModelCallError> = None;

        for attempt in 0..=self.policy.max_retries {
            if attempt > 0 {
                let backoff = self.policy.backoff(attempt);
                warn!(
                    "{} model: retry {}/{} after {}ms",
                    tier,
                    attempt,
                    self.policy.max_retries,
                    backoff.as_millis()
                );
                sleep(backoff).await;
            }

            match timeout(self.policy.timeout, provider.chat(&messages, Some(&options))).await {
                Ok(Ok(response)) => {
                    let duration = start.elapsed();
                    debug!(
                        "{} model: {} input tokens, {} output tokens, {:?}",
                        tier, response.prompt_tokens, response.completion_tokens, duration
                    );
                    return Ok(ModelReply {
                        text: response.content,
                        model_id: self.model_id(tier),
                        input_tokens: response.prompt_tokens as usize,
                        output_tokens: response.completion_tokens as usize,
                        duration_ms: duration.as_millis() as u64,
                        retries: attempt,
                    });
                }
                Ok(Err(e)) if !is_transient(&e) => {
                    warn!("{} model: permanent failure, not retrying: {}", tier, e);
                    return Err(ModelCallError::Provider {
                        tier,
                        retries: attempt,
                        detail: e.to_string(),
                    });
                }
                Ok(Err(e)) => {
                    warn!("{} model: attempt {} failed: {}", tier, attempt + 1, e);
                    last_err = Some(ModelCallError::Provider {
                        tier,
                        retries: attempt,
                        detail: e.to_string(),
                    });
                }
                Err(_) => {
                    warn!(
                        "{} model: attempt {} timed out after {}s",
                        tier,
                        attempt + 1,
                        self.policy.timeout.as_secs()
                    );
                    last_err = Some(ModelCallError::Timeout {
                        tier,
                        secs: self.policy.timeout.as_secs(),
                    });
                }
            }
        }

        Err(last_err.unwrap_or(ModelCallError::Provider {
            tier,
            retries: self.policy.max_retries,
            detail: "Unknown error".to_string(),
        }))
    }

    fn model_id(&self, tier: ModelTier) -> String {
        match tier {
            ModelTier::Cheap => self.cheap_model_id.clone(),
            ModelTier::Capable => self.capable_model_id.clone(),
        }
    }
}

/// HTTP statuses that mark an `ApiError` as a client-side failure.
const PERMANENT_STATUSES: [&str; 5] = ["400", "401", "403", "404", "422"];

/// Whether another attempt at the same request could succeed.
pub fn is_transient(error: &LlmError) -> bool {
    match error {
        LlmError::AuthError(_)
        | LlmError::InvalidRequest(_)
        | LlmError::ModelNotFound(_)
        | LlmError::ConfigError(_)
        | LlmError::NotSupported(_)
        | LlmError::TokenLimitExceeded { .. } => false,
        LlmError::ApiError(msg) => !PERMANENT_STATUSES.iter().any(|code| msg.contains(code)),
        _ => true,
    }
}

/// One user turn: the instructions, plus the page image when there is one.
pub fn build_message(prompt: &str, payload: &DocumentPayload) -> ChatMessage {
    let text = message_text(prompt, payload);
    let images = image_attachment(payload).into_iter().collect();
    ChatMessage::user_with_images(&text, images)
}

/// Text documents are inlined below the instructions; images travel as attachments.
fn message_text(prompt: &str, payload: &DocumentPayload) -> String {
    match payload {
        DocumentPayload::Image { .. } => prompt.to_string(),
        DocumentPayload::Text(text) => with_document_text(prompt, text),
    }
}

fn image_attachment(payload: &DocumentPayload) -> Option<ImageData> {
    match payload {
        DocumentPayload::Image { data, mime } => {
            Some(ImageData::new(STANDARD.encode(data), mime.as_str()).with_detail("high"))
        }
        DocumentPayload::Text(_) => None,
    }
}

/// Provider name from config, then `EDGEQUAKE_LLM_PROVIDER`, then whichever
/// API key is present.
fn resolve_provider_name(config: &PipelineConfig) -> Result<String, TradeDocError> {
    if let Some(ref name) = config.provider_name {
        return Ok(name.clone());
    }
    if let Ok(name) = std::env::var("EDGEQUAKE_LLM_PROVIDER") {
        if !name.is_empty() {
            return Ok(name);
        }
    }
    for (var, name) in [
        ("ANTHROPIC_API_KEY", "anthropic"),
        ("OPENAI_API_KEY", "openai"),
        ("GEMINI_API_KEY", "gemini"),
    ] {
        if std::env::var(var).is_ok_and(|v| !v.is_empty()) {
            return Ok(name.to_string());
        }
    }
    Err(TradeDocError::ProviderNotConfigured {
        provider: "auto".to_string(),
        hint: "No LLM provider could be detected from the environment.\n\
               Set ANTHROPIC_API_KEY or OPENAI_API_KEY, or pass --provider."
            .to_string(),
    })
}

fn create_provider(
    provider_name: &str,
    model: &str,
) -> Result<Arc<dyn LLMProvider>, TradeDocError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        TradeDocError::ProviderNotConfigured {
            provider: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })
}
