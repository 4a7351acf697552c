use serde::Deserialize;

/// Root application configuration. Loaded from environment variables
/// with the prefix `TRUNKLINE__` and double-underscore separators.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub workers: WorkersConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub limiter: LimiterConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub campaign: CampaignConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// Static bearer token for the development verifier. Empty disables it.
    #[serde(default)]
    pub dev_token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkersConfig {
    /// Dispatcher workers per process. 0 means 4 x available cores.
    #[serde(default)]
    pub count: usize,
    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,
    #[serde(default = "default_dequeue_wait_secs")]
    pub dequeue_wait_secs: u64,
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
    /// Fractional jitter applied symmetrically (0.25 = +/-25%).
    #[serde(default = "default_backoff_jitter")]
    pub backoff_jitter: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LimiterConfig {
    #[serde(default = "default_per_number_rate")]
    pub per_number_rate: u64,
    #[serde(default = "default_workspace_rate")]
    pub workspace_rate: u64,
    #[serde(default = "default_global_rate")]
    pub global_rate: u64,
    /// Use the Redis-backed shared buckets when true.
    #[serde(default)]
    pub shared: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_total_timeout_ms")]
    pub total_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookConfig {
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    #[serde(default = "default_dedupe_ttl_secs")]
    pub dedupe_ttl_secs: u64,
    #[serde(default = "default_status_grace_secs")]
    pub status_grace_secs: u64,
    /// Webhook handler tasks per kind.
    #[serde(default = "default_handler_count")]
    pub handler_count: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CampaignConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_batch_poll_ms")]
    pub batch_poll_ms: u64,
    #[serde(default = "default_batch_deadline_secs")]
    pub batch_deadline_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
    #[serde(default = "default_redis_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default functions
fn default_node_id() -> String {
    "node-01".to_string()
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_http_port() -> u16 {
    8080
}
fn default_visibility_timeout_secs() -> u64 {
    60
}
fn default_dequeue_wait_secs() -> u64 {
    5
}
fn default_drain_timeout_secs() -> u64 {
    30
}
fn default_max_attempts() -> u32 {
    5
}
fn default_backoff_base_ms() -> u64 {
    1_000
}
fn default_backoff_factor() -> f64 {
    2.0
}
fn default_backoff_cap_ms() -> u64 {
    300_000
}
fn default_backoff_jitter() -> f64 {
    0.25
}
fn default_per_number_rate() -> u64 {
    80
}
fn default_workspace_rate() -> u64 {
    200
}
fn default_global_rate() -> u64 {
    500
}
fn default_base_url() -> String {
    "https://graph.facebook.com".to_string()
}
fn default_api_version() -> String {
    "v22.0".to_string()
}
fn default_connect_timeout_ms() -> u64 {
    5_000
}
fn default_total_timeout_ms() -> u64 {
    30_000
}
fn default_max_body_bytes() -> usize {
    1024 * 1024
}
fn default_dedupe_ttl_secs() -> u64 {
    72 * 3600
}
fn default_status_grace_secs() -> u64 {
    30
}
fn default_handler_count() -> usize {
    2
}
fn default_batch_size() -> usize {
    500
}
fn default_batch_poll_ms() -> u64 {
    250
}
fn default_batch_deadline_secs() -> u64 {
    600
}
fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}
fn default_redis_connect_timeout_ms() -> u64 {
    5_000
}
fn default_metrics_port() -> u16 {
    9091
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            http_port: default_http_port(),
            dev_token: String::new(),
        }
    }
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            count: 0,
            visibility_timeout_secs: default_visibility_timeout_secs(),
            dequeue_wait_secs: default_dequeue_wait_secs(),
            drain_timeout_secs: default_drain_timeout_secs(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_factor: default_backoff_factor(),
            backoff_cap_ms: default_backoff_cap_ms(),
            backoff_jitter: default_backoff_jitter(),
        }
    }
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            per_number_rate: default_per_number_rate(),
            workspace_rate: default_workspace_rate(),
            global_rate: default_global_rate(),
            shared: false,
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_version: default_api_version(),
            connect_timeout_ms: default_connect_timeout_ms(),
            total_timeout_ms: default_total_timeout_ms(),
        }
    }
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            max_body_bytes: default_max_body_bytes(),
            dedupe_ttl_secs: default_dedupe_ttl_secs(),
            status_grace_secs: default_status_grace_secs(),
            handler_count: default_handler_count(),
        }
    }
}

impl Default for CampaignConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            batch_poll_ms: default_batch_poll_ms(),
            batch_deadline_secs: default_batch_deadline_secs(),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            connect_timeout_ms: default_redis_connect_timeout_ms(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            port: default_metrics_port(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            api: ApiConfig::default(),
            workers: WorkersConfig::default(),
            retry: RetryConfig::default(),
            limiter: LimiterConfig::default(),
            upstream: UpstreamConfig::default(),
            webhook: WebhookConfig::default(),
            campaign: CampaignConfig::default(),
            redis: RedisConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder().add_source(
            config::Environment::with_prefix("TRUNKLINE")
                .separator("__")
                .try_parsing(true)
                .list_separator(","),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Effective dispatcher worker count for this process.
    pub fn worker_count(&self) -> usize {
        if self.workers.count > 0 {
            return self.workers.count;
        }
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        cores * 4
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = AppConfig::default();
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.backoff_base_ms, 1_000);
        assert_eq!(config.retry.backoff_cap_ms, 300_000);
        assert_eq!(config.limiter.per_number_rate, 80);
        assert_eq!(config.webhook.max_body_bytes, 1024 * 1024);
        assert_eq!(config.webhook.dedupe_ttl_secs, 72 * 3600);
        assert_eq!(config.campaign.batch_size, 500);
        assert_eq!(config.workers.visibility_timeout_secs, 60);
    }

    #[test]
    fn test_worker_count_falls_back_to_cores() {
        let config = AppConfig::default();
        assert!(config.worker_count() >= 4);

        let mut fixed = AppConfig::default();
        fixed.workers.count = 7;
        assert_eq!(fixed.worker_count(), 7);
    }
}
