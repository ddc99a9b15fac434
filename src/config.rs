//! Configuration for the task service.
//!
//! All runtime behaviour is controlled through [`ServiceConfig`], built via
//! its [`ServiceConfigBuilder`]. The binary maps environment variables and
//! flags onto the builder; library users and tests set only what they need
//! and rely on the defaults for the rest.

use crate::error::ServiceError;
use crate::retry::RetryPolicy;
use edgequake_llm::LLMProvider;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Configuration for the conversion service.
///
/// # Example
/// ```rust
/// use edgequake_md_service::ServiceConfig;
///
/// let config = ServiceConfig::builder()
///     .data_dir("/var/lib/md-service")
///     .max_concurrent_descriptions(8)
///     .retention_hours(48)
///     .build()
///     .unwrap();
/// assert_eq!(config.max_concurrent_descriptions, 8);
/// ```
#[derive(Clone)]
pub struct ServiceConfig {
    /// Root directory; task directories live under `{data_dir}/tasks/{id}`.
    pub data_dir: PathBuf,

    /// Largest accepted upload in bytes. Default: 500 MiB.
    pub max_upload_size: u64,

    /// Tasks allowed in `Running` at once. Default: 2.
    ///
    /// Further tasks stay `Queued` until a run slot frees.
    pub max_concurrent_tasks: usize,

    /// Description calls in flight at once, across *all* tasks. Default: 5.
    pub max_concurrent_descriptions: usize,

    /// Total call attempts per image before the job is marked failed. Default: 3.
    pub description_max_retries: u32,

    /// Base delay for description retries in milliseconds. Default: 1000.
    ///
    /// Doubles after each attempt: 1 s → 2 s → 4 s.
    pub retry_base_delay_ms: u64,

    /// Add random jitter on top of the exponential delay. Default: false.
    pub retry_jitter: bool,

    /// Per-description-call timeout in seconds. Default: 60.
    pub api_timeout_secs: u64,

    /// Characters of surrounding page text sent as grounding context. Default: 500.
    pub describe_context_chars: usize,

    /// LLM model identifier, e.g. "gpt-4.1-nano".
    pub model: Option<String>,

    /// LLM provider name (e.g. "openai", "anthropic", "ollama").
    pub provider_name: Option<String>,

    /// Pre-constructed LLM provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Directory holding the pdfium shared library. `None` = system library.
    pub pdfium_lib_path: Option<PathBuf>,

    /// Per-attempt webhook request timeout in seconds. Default: 10.
    pub webhook_timeout_secs: u64,

    /// Webhook delivery attempts before giving up. Default: 3.
    pub webhook_max_retries: u32,

    /// Base delay between webhook attempts in milliseconds. Default: 5000.
    pub webhook_retry_delay_ms: u64,

    /// How often the retention sweeper runs, in seconds. Default: 900.
    pub cleanup_interval_secs: u64,

    /// Age after which finished tasks are deleted, in hours. Default: 24.
    pub retention_hours: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            max_upload_size: 500 * 1024 * 1024,
            max_concurrent_tasks: 2,
            max_concurrent_descriptions: 5,
            description_max_retries: 3,
            retry_base_delay_ms: 1000,
            retry_jitter: false,
            api_timeout_secs: 60,
            describe_context_chars: 500,
            model: None,
            provider_name: None,
            provider: None,
            pdfium_lib_path: None,
            webhook_timeout_secs: 10,
            webhook_max_retries: 3,
            webhook_retry_delay_ms: 5000,
            cleanup_interval_secs: 15 * 60,
            retention_hours: 24,
        }
    }
}

impl fmt::Debug for ServiceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceConfig")
            .field("data_dir", &self.data_dir)
            .field("max_upload_size", &self.max_upload_size)
            .field("max_concurrent_tasks", &self.max_concurrent_tasks)
            .field("max_concurrent_descriptions", &self.max_concurrent_descriptions)
            .field("description_max_retries", &self.description_max_retries)
            .field("retry_base_delay_ms", &self.retry_base_delay_ms)
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("pdfium_lib_path", &self.pdfium_lib_path)
            .field("webhook_max_retries", &self.webhook_max_retries)
            .field("cleanup_interval_secs", &self.cleanup_interval_secs)
            .field("retention_hours", &self.retention_hours)
            .finish()
    }
}

impl ServiceConfig {
    /// Create a new builder for `ServiceConfig`.
    pub fn builder() -> ServiceConfigBuilder {
        ServiceConfigBuilder {
            config: Self::default(),
        }
    }

    /// `{data_dir}/tasks`, parent of every task directory.
    pub fn tasks_dir(&self) -> PathBuf {
        self.data_dir.join("tasks")
    }

    pub fn description_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from_millis(self.retry_base_delay_ms).with_jitter(self.retry_jitter)
    }

    pub fn webhook_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from_millis(self.webhook_retry_delay_ms)
    }

    pub fn retention_window(&self) -> Duration {
        Duration::from_secs(self.retention_hours.saturating_mul(3600))
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

/// Builder for [`ServiceConfig`].
pub struct ServiceConfigBuilder {
    config: ServiceConfig,
}

impl ServiceConfigBuilder {
    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.data_dir = dir.into();
        self
    }

    pub fn max_upload_size(mut self, bytes: u64) -> Self {
        self.config.max_upload_size = bytes;
        self
    }

    pub fn max_concurrent_tasks(mut self, n: usize) -> Self {
        self.config.max_concurrent_tasks = n.max(1);
        self
    }

    pub fn max_concurrent_descriptions(mut self, n: usize) -> Self {
        self.config.max_concurrent_descriptions = n.max(1);
        self
    }

    pub fn description_max_retries(mut self, n: u32) -> Self {
        self.config.description_max_retries = n.max(1);
        self
    }

    pub fn retry_base_delay_ms(mut self, ms: u64) -> Self {
        self.config.retry_base_delay_ms = ms;
        self
    }

    pub fn retry_jitter(mut self, v: bool) -> Self {
        self.config.retry_jitter = v;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs.max(1);
        self
    }

    pub fn describe_context_chars(mut self, n: usize) -> Self {
        self.config.describe_context_chars = n;
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn pdfium_lib_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.pdfium_lib_path = Some(path.into());
        self
    }

    pub fn webhook_timeout_secs(mut self, secs: u64) -> Self {
        self.config.webhook_timeout_secs = secs.max(1);
        self
    }

    pub fn webhook_max_retries(mut self, n: u32) -> Self {
        self.config.webhook_max_retries = n.max(1);
        self
    }

    pub fn webhook_retry_delay_ms(mut self, ms: u64) -> Self {
        self.config.webhook_retry_delay_ms = ms;
        self
    }

    pub fn cleanup_interval_secs(mut self, secs: u64) -> Self {
        self.config.cleanup_interval_secs = secs;
        self
    }

    pub fn retention_hours(mut self, hours: u64) -> Self {
        self.config.retention_hours = hours;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ServiceConfig, ServiceError> {
        let c = &self.config;
        if c.data_dir.as_os_str().is_empty() {
            return Err(ServiceError::InvalidConfig("data_dir must not be empty".into()));
        }
        if c.max_upload_size == 0 {
            return Err(ServiceError::InvalidConfig(
                "max_upload_size must be ≥ 1 byte".into(),
            ));
        }
        if c.cleanup_interval_secs == 0 {
            return Err(ServiceError::InvalidConfig(
                "cleanup_interval_secs must be ≥ 1".into(),
            ));
        }
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let c = ServiceConfig::default();
        assert_eq!(c.max_upload_size, 500 * 1024 * 1024);
        assert_eq!(c.max_concurrent_descriptions, 5);
        assert_eq!(c.description_max_retries, 3);
        assert_eq!(c.retention_window(), Duration::from_secs(24 * 3600));
        assert_eq!(c.tasks_dir(), PathBuf::from("./data/tasks"));
    }

    #[test]
    fn builder_clamps_zero_concurrency() {
        let c = ServiceConfig::builder()
            .max_concurrent_descriptions(0)
            .max_concurrent_tasks(0)
            .description_max_retries(0)
            .build()
            .unwrap();
        assert_eq!(c.max_concurrent_descriptions, 1);
        assert_eq!(c.max_concurrent_tasks, 1);
        assert_eq!(c.description_max_retries, 1);
    }

    #[test]
    fn huge_retention_saturates() {
        let c = ServiceConfig::builder()
            .retention_hours(u64::MAX)
            .build()
            .unwrap();
        assert_eq!(c.retention_window(), Duration::from_secs(u64::MAX));
    }

    #[test]
    fn build_rejects_zero_upload_limit() {
        let err = ServiceConfig::builder().max_upload_size(0).build().unwrap_err();
        assert!(matches!(err, ServiceError::InvalidConfig(_)));
    }

    #[test]
    fn retry_policies_follow_config() {
        let c = ServiceConfig::builder()
            .retry_base_delay_ms(200)
            .webhook_retry_delay_ms(50)
            .build()
            .unwrap();
        assert_eq!(c.description_retry_policy().delay(1), Duration::from_millis(400));
        assert_eq!(c.webhook_retry_policy().delay(0), Duration::from_millis(50));
    }

    #[test]
    fn debug_hides_provider() {
        let s = format!("{:?}", ServiceConfig::default());
        assert!(s.contains("ServiceConfig"));
        assert!(s.contains("provider: None"));
    }
}
