//! HTTPS client for the WhatsApp Cloud API.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, error, warn};
use uuid::Uuid;

use trunkline_core::config::UpstreamConfig;
use trunkline_core::{TrunklineError, TrunklineResult};

use crate::outcome::{classify_failure, Outcome};
use crate::UpstreamApi;

/// Phone number details fetched from the upstream graph.
#[derive(Debug, Clone)]
pub struct PhoneNumberInfo {
    pub display_phone_number: String,
    pub verified_name: Option<String>,
    pub quality_rating: Option<String>,
    pub messaging_limit_tier: Option<String>,
}

/// Reqwest-backed Cloud API client with configured timeouts.
pub struct CloudApiClient {
    http: reqwest::Client,
    base_url: String,
}

impl CloudApiClient {
    pub fn new(config: &UpstreamConfig) -> TrunklineResult<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .timeout(Duration::from_millis(config.total_timeout_ms))
            .build()
            .map_err(|e| TrunklineError::Upstream(format!("http client build failed: {e}")))?;

        let base_url = format!(
            "{}/{}",
            config.base_url.trim_end_matches('/'),
            config.api_version
        );

        Ok(Self { http, base_url })
    }

    fn parse_retry_after(response: &reqwest::Response) -> Option<Duration> {
        response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
    }

    /// Fetch quality rating and messaging-limit tier for a number. Used by
    /// the derived-attribute refresh path, not the send path.
    pub async fn fetch_phone_number(
        &self,
        phone_number_id: &str,
        access_token: &str,
    ) -> TrunklineResult<PhoneNumberInfo> {
        let url = format!("{}/{}", self.base_url, phone_number_id);
        let response = self
            .http
            .get(&url)
            .bearer_auth(access_token)
            .query(&[(
                "fields",
                "display_phone_number,verified_name,quality_rating,messaging_limit_tier",
            )])
            .send()
            .await
            .map_err(|e| TrunklineError::Upstream(format!("phone number fetch failed: {e}")))?;

        let status = response.status();
        let data: Value = response
            .json()
            .await
            .map_err(|e| TrunklineError::Upstream(format!("phone number body unreadable: {e}")))?;

        if !status.is_success() {
            let message = data["error"]["message"]
                .as_str()
                .unwrap_or("unknown error")
                .to_string();
            return Err(TrunklineError::Upstream(format!(
                "phone number fetch {status}: {message}"
            )));
        }

        Ok(PhoneNumberInfo {
            display_phone_number: data["display_phone_number"]
                .as_str()
                .unwrap_or_default()
                .to_string(),
            verified_name: data["verified_name"].as_str().map(str::to_string),
            quality_rating: data["quality_rating"].as_str().map(str::to_string),
            messaging_limit_tier: data["messaging_limit_tier"].as_str().map(str::to_string),
        })
    }
}

#[async_trait]
impl UpstreamApi for CloudApiClient {
    async fn send(
        &self,
        path: &str,
        body: &Value,
        idempotency_key: Uuid,
        access_token: &str,
    ) -> TrunklineResult<Outcome> {
        let url = format!("{}{}", self.base_url, path);

        let response = match self
            .http
            .post(&url)
            .bearer_auth(access_token)
            .header("X-Idempotency-Key", idempotency_key.to_string())
            .json(body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                // Timeouts, DNS failures, TLS errors: all retryable.
                warn!(error = %e, path, "Upstream request failed before a response");
                metrics::counter!("upstream.transport_errors").increment(1);
                return Ok(Outcome::Transient {
                    retry_after: None,
                    reason: format!("transport error: {e}"),
                });
            }
        };

        let status = response.status().as_u16();
        let retry_after = Self::parse_retry_after(&response);
        let data: Value = match response.json().await {
            Ok(data) => data,
            Err(e) if (200..300).contains(&status) => {
                // A 2xx we cannot parse: the send may or may not have landed.
                // Treat as transient; the idempotency key makes the retry safe.
                error!(error = %e, path, "Unparseable 2xx body from upstream");
                metrics::counter!("upstream.bad_success_body").increment(1);
                return Ok(Outcome::Transient {
                    retry_after: None,
                    reason: format!("unparseable 2xx body: {e}"),
                });
            }
            Err(e) => Value::String(format!("unreadable body: {e}")),
        };

        if (200..300).contains(&status) {
            if let Some(id) = data["messages"][0]["id"].as_str() {
                debug!(upstream_message_id = id, "Upstream accepted message");
                return Ok(Outcome::Accepted {
                    upstream_message_id: id.to_string(),
                });
            }
            // Mark-as-read acks with {"success": true} and no message id.
            if data["success"].as_bool() == Some(true) {
                return Ok(Outcome::Accepted {
                    upstream_message_id: idempotency_key.to_string(),
                });
            }
            error!(body = %data, "2xx without a message id from upstream");
            metrics::counter!("upstream.bad_success_body").increment(1);
            return Ok(Outcome::Transient {
                retry_after: None,
                reason: "2xx without messages[0].id".to_string(),
            });
        }

        let error_code = data["error"]["code"].as_i64().unwrap_or(status as i64);
        let error_message = data["error"]["message"]
            .as_str()
            .unwrap_or("unknown error")
            .to_string();

        metrics::counter!("upstream.rejections", "status" => status.to_string()).increment(1);
        Ok(classify_failure(status, error_code, error_message, retry_after))
    }
}
