//! Image description client: one vision-LLM call per image.
//!
//! [`ImageDescriber::describe`] issues exactly one external call and never
//! retries; the [`crate::pipeline::scheduler`] owns attempts and backoff.
//! Failures are classified so the scheduler knows whether another attempt
//! can help:
//!
//! | Failure | Class |
//! |---------|-------|
//! | timeout, network error, rate limit, unparsable response | transient |
//! | API / provider error naming 429 or 5xx | transient |
//! | auth, invalid request, unknown model, token limit, unsupported | permanent |
//! | other API / provider errors, empty or unreadable image | permanent |

use crate::config::ServiceConfig;
use crate::error::{DescribeError, ServiceError};
use crate::pipeline::encode::to_image_data;
use crate::prompts::{describe_user_prompt, DESCRIBE_SYSTEM_PROMPT};
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider, LlmError, ProviderFactory};
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Surrounding document text used to ground a description.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DescribeContext {
    pub before: String,
    pub after: String,
}

/// Describes a single image. Implementations perform one call per
/// invocation and hold no per-call state.
#[async_trait]
pub trait ImageDescriber: Send + Sync {
    async fn describe(&self, image: &[u8], context: &DescribeContext)
        -> Result<String, DescribeError>;
}

/// [`ImageDescriber`] backed by any `edgequake-llm` vision provider.
pub struct LlmImageDescriber {
    provider: Arc<dyn LLMProvider>,
    timeout: Duration,
    options: CompletionOptions,
}

impl LlmImageDescriber {
    pub fn new(provider: Arc<dyn LLMProvider>, timeout: Duration) -> Self {
        Self {
            provider,
            timeout,
            options: CompletionOptions {
                temperature: Some(0.2),
                max_tokens: Some(1024),
                ..Default::default()
            },
        }
    }

    /// Build from config, or `Ok(None)` when no provider can be found and
    /// descriptions should be skipped.
    pub fn from_config(config: &ServiceConfig) -> Result<Option<Self>, ServiceError> {
        let timeout = Duration::from_secs(config.api_timeout_secs);
        Ok(resolve_provider(config)?.map(|p| Self::new(p, timeout)))
    }
}

#[async_trait]
impl ImageDescriber for LlmImageDescriber {
    async fn describe(
        &self,
        image: &[u8],
        context: &DescribeContext,
    ) -> Result<String, DescribeError> {
        if image.is_empty() {
            return Err(DescribeError::Permanent {
                detail: "image is empty".into(),
            });
        }

        let prompt = describe_user_prompt(&context.before, &context.after);
        let messages = vec![
            ChatMessage::system(DESCRIBE_SYSTEM_PROMPT),
            ChatMessage::user_with_images(prompt.as_str(), vec![to_image_data(image)]),
        ];

        let start = Instant::now();
        let call = self.provider.chat(&messages, Some(&self.options));
        let response = match tokio::time::timeout(self.timeout, call).await {
            Err(_) => {
                return Err(DescribeError::Transient {
                    detail: format!("request timed out after {}s", self.timeout.as_secs()),
                })
            }
            Ok(Err(e)) => return Err(classify_llm_error(&e)),
            Ok(Ok(r)) => r,
        };

        debug!(
            "Description: {} input tokens, {} output tokens, {:?}",
            response.prompt_tokens,
            response.completion_tokens,
            start.elapsed()
        );

        let text = response.content.trim();
        if text.is_empty() {
            return Err(DescribeError::Transient {
                detail: "model returned an empty description".into(),
            });
        }
        Ok(text.to_string())
    }
}

/// Map a provider error onto the transient/permanent split by its kind.
pub fn classify_llm_error(err: &LlmError) -> DescribeError {
    let detail = err.to_string();
    match err {
        LlmError::RateLimited(_)
        | LlmError::NetworkError(_)
        | LlmError::Timeout
        | LlmError::SerializationError(_) => DescribeError::Transient { detail },
        LlmError::AuthError(_)
        | LlmError::InvalidRequest(_)
        | LlmError::ModelNotFound(_)
        | LlmError::TokenLimitExceeded { .. }
        | LlmError::ConfigError(_)
        | LlmError::NotSupported(_) => DescribeError::Permanent { detail },
        LlmError::ApiError(_) | LlmError::ProviderError(_) | LlmError::Unknown(_) => {
            classify_provider_error(&detail)
        }
    }
}

static RE_TRANSIENT_STATUS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(429|5\d\d)\b").unwrap());

const TRANSIENT_MARKERS: &[&str] = &[
    "rate limit",
    "rate_limit",
    "too many requests",
    "timed out",
    "overloaded",
    "temporarily unavailable",
    "service unavailable",
];

/// Classify a free-form API or provider message, which only carries the
/// HTTP status in its text.
pub fn classify_provider_error(message: &str) -> DescribeError {
    let lower = message.to_ascii_lowercase();
    let transient = RE_TRANSIENT_STATUS.is_match(&lower)
        || TRANSIENT_MARKERS.iter().any(|m| lower.contains(m));
    let detail = message.to_string();
    if transient {
        DescribeError::Transient { detail }
    } else {
        DescribeError::Permanent { detail }
    }
}

/// Resolve the vision provider, from most-specific to least-specific:
///
/// 1. `config.provider`, used as-is.
/// 2. `config.provider_name` (+ `config.model`); a failure here is a
///    configuration error, the caller asked for this provider explicitly.
/// 3. `EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`, both set.
/// 4. `OPENAI_API_KEY` present → OpenAI.
/// 5. `ProviderFactory::from_env` auto-detection.
///
/// Steps 3-5 are best effort: when nothing resolves, `Ok(None)` is returned
/// and the service runs without image descriptions.
pub fn resolve_provider(
    config: &ServiceConfig,
) -> Result<Option<Arc<dyn LLMProvider>>, ServiceError> {
    if let Some(ref provider) = config.provider {
        return Ok(Some(Arc::clone(provider)));
    }

    let model = config.model.as_deref().unwrap_or("gpt-4.1-nano");

    if let Some(ref name) = config.provider_name {
        return ProviderFactory::create_llm_provider(name, model)
            .map(Some)
            .map_err(|e| {
                ServiceError::InvalidConfig(format!("LLM provider '{name}' unavailable: {e}"))
            });
    }

    if let (Ok(prov), Ok(env_model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !env_model.is_empty() {
            match ProviderFactory::create_llm_provider(&prov, &env_model) {
                Ok(p) => return Ok(Some(p)),
                Err(e) => warn!("EDGEQUAKE_LLM_PROVIDER={prov} unavailable: {e}"),
            }
        }
    }

    if std::env::var("OPENAI_API_KEY").is_ok_and(|k| !k.is_empty()) {
        match ProviderFactory::create_llm_provider("openai", model) {
            Ok(p) => return Ok(Some(p)),
            Err(e) => warn!("OpenAI provider unavailable: {e}"),
        }
    }

    match ProviderFactory::from_env() {
        Ok((llm_provider, _embedding)) => {
            info!("Auto-detected LLM provider from environment");
            Ok(Some(llm_provider))
        }
        Err(e) => {
            warn!("No LLM provider configured, image descriptions disabled: {e}");
            Ok(None)
        }
    }
}
