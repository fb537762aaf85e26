//! HTTP mediation.
//!
//! [`HttpMediator`] performs the outbound webhook call: signed POST to the
//! mediation target, outcome classified from the HTTP result. The
//! [`Mediator`] trait is what pools invoke; the production implementation
//! is [`crate::processor::JobProcessor`], which resolves the persisted job
//! around the raw HTTP call.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::Deserialize;
use sha2::Sha256;
use tracing::{debug, info, warn};

use fc_common::{MediationOutcome, MessagePointer, WarningCategory, WarningSeverity};

use crate::warning::WarningService;

/// Webhook identity header: the dispatch job id.
pub const ID_HEADER: &str = "X-FlowCatalyst-ID";
/// Hex HMAC-SHA256 over `timestamp || body`.
pub const SIGNATURE_HEADER: &str = "X-FlowCatalyst-SIGNATURE";
/// Decimal epoch seconds used in the signature.
pub const TIMESTAMP_HEADER: &str = "X-FlowCatalyst-TIMESTAMP";

/// Receivers must reject timestamps outside this skew window (seconds).
pub const SIGNATURE_SKEW_WINDOW_SECS: i64 = 300;

type HmacSha256 = Hmac<Sha256>;

/// Sign a webhook body. Returns `(hex_signature, epoch_seconds)`; the
/// signature covers the decimal timestamp concatenated with the body.
pub fn sign_webhook(body: &str, signing_secret: &str, epoch_seconds: i64) -> String {
    let mut mac = HmacSha256::new_from_slice(signing_secret.as_bytes())
        .expect("HMAC accepts any key length");
    mac.update(epoch_seconds.to_string().as_bytes());
    mac.update(body.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// What pools call to deliver one consumed envelope.
#[async_trait]
pub trait Mediator: Send + Sync {
    async fn mediate(&self, pointer: &MessagePointer) -> MediationOutcome;
}

/// A fully prepared outbound call.
#[derive(Debug, Clone)]
pub struct DeliveryRequest {
    pub message_id: String,
    pub target: String,
    pub auth_token: Option<String>,
    pub content_type: String,
    pub body: String,
    pub timeout: Duration,
}

/// Body of a positive-status response; `{"ack": false}` downgrades a 2xx to
/// a retriable failure, optionally with an explicit delay.
#[derive(Debug, Deserialize)]
struct TargetResponse {
    #[serde(default = "default_ack")]
    ack: bool,
    #[serde(rename = "delaySeconds")]
    delay_seconds: Option<u32>,
}

fn default_ack() -> bool {
    true
}

#[derive(Debug, Clone)]
pub struct HttpMediatorConfig {
    /// Fallback request timeout when the job specifies none.
    pub default_timeout: Duration,
    pub connect_timeout: Duration,
    /// Secret for webhook signing; None disables signature headers.
    pub signing_secret: Option<String>,
}

impl Default for HttpMediatorConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            signing_secret: None,
        }
    }
}

pub struct HttpMediator {
    client: Client,
    config: HttpMediatorConfig,
    warning_service: Option<Arc<WarningService>>,
}

impl HttpMediator {
    pub fn new(config: HttpMediatorConfig) -> Self {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .pool_max_idle_per_host(10)
            .build()
            .expect("reqwest client construction cannot fail with static options");

        Self {
            client,
            config,
            warning_service: None,
        }
    }

    pub fn with_warning_service(mut self, warning_service: Arc<WarningService>) -> Self {
        self.warning_service = Some(warning_service);
        self
    }

    fn warn_config(&self, message_id: &str, target: &str, status: u16, description: &str) {
        if let Some(ref ws) = self.warning_service {
            ws.add_warning(
                WarningCategory::Configuration,
                WarningSeverity::Error,
                format!("HTTP {status} {description} for message {message_id}: target {target}"),
                "HttpMediator".to_string(),
            );
        }
    }

    /// Execute one outbound call and classify the result.
    ///
    /// 2xx -> Success (unless the body nacks), 4xx -> ErrorConfig,
    /// 5xx -> ErrorProcess, timeout or socket failure -> ErrorConnection.
    pub async fn deliver(&self, request: &DeliveryRequest) -> MediationOutcome {
        let timestamp = Utc::now().timestamp();

        let mut http = self
            .client
            .post(&request.target)
            .timeout(if request.timeout.is_zero() {
                self.config.default_timeout
            } else {
                request.timeout
            })
            .header("Content-Type", &request.content_type)
            .header(ID_HEADER, &request.message_id)
            .header(TIMESTAMP_HEADER, timestamp.to_string());

        if let Some(ref secret) = self.config.signing_secret {
            let signature = sign_webhook(&request.body, secret, timestamp);
            http = http.header(SIGNATURE_HEADER, signature);
        }

        if let Some(ref token) = request.auth_token {
            http = http.bearer_auth(token);
        }

        debug!(
            message_id = %request.message_id,
            target = %request.target,
            "Mediating message"
        );

        let response = match http.body(request.body.clone()).send().await {
            Ok(response) => response,
            Err(e) => {
                return if e.is_timeout() {
                    warn!(message_id = %request.message_id, error = %e, "Request timeout");
                    MediationOutcome::error_connection("Request timeout")
                } else {
                    warn!(message_id = %request.message_id, error = %e, "Connection failed");
                    MediationOutcome::error_connection(format!("Connection error: {e}"))
                };
            }
        };

        let status = response.status();
        let status_code = status.as_u16();

        if status.is_success() {
            // A positive status can still carry a negative acknowledgement.
            if let Ok(body) = response.text().await {
                if let Ok(parsed) = serde_json::from_str::<TargetResponse>(&body) {
                    if !parsed.ack {
                        debug!(
                            message_id = %request.message_id,
                            delay_seconds = ?parsed.delay_seconds,
                            "Target responded ack=false"
                        );
                        return MediationOutcome::error_process(
                            Some(status_code),
                            parsed.delay_seconds,
                            "Target returned ack=false",
                        );
                    }
                }
            }

            info!(message_id = %request.message_id, status_code, "Message delivered");
            return MediationOutcome::success(status_code);
        }

        if status.is_client_error() {
            warn!(
                message_id = %request.message_id,
                status_code,
                "Client error from target; dropping after record"
            );
            self.warn_config(
                &request.message_id,
                &request.target,
                status_code,
                status.canonical_reason().unwrap_or("Client error"),
            );
            return MediationOutcome::error_config(
                status_code,
                format!("HTTP {status_code}: client error"),
            );
        }

        if status.is_server_error() {
            warn!(message_id = %request.message_id, status_code, "Server error; will retry");
            return MediationOutcome::error_process(
                Some(status_code),
                None,
                format!("HTTP {status_code}: server error"),
            );
        }

        warn!(message_id = %request.message_id, status_code, "Unexpected status; will retry");
        MediationOutcome::error_process(
            Some(status_code),
            None,
            format!("HTTP {status_code}: unexpected status"),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_deterministic_and_timestamp_bound() {
        let sig1 = sign_webhook("{\"a\":1}", "secret", 1_700_000_000);
        let sig2 = sign_webhook("{\"a\":1}", "secret", 1_700_000_000);
        let sig3 = sign_webhook("{\"a\":1}", "secret", 1_700_000_001);

        assert_eq!(sig1, sig2);
        assert_ne!(sig1, sig3);
        assert_eq!(sig1.len(), 64);
    }

    #[test]
    fn signature_depends_on_body_and_secret() {
        let base = sign_webhook("body", "secret", 1);
        assert_ne!(base, sign_webhook("other", "secret", 1));
        assert_ne!(base, sign_webhook("body", "other", 1));
    }

    #[test]
    fn target_response_defaults_to_ack() {
        let parsed: TargetResponse = serde_json::from_str("{}").unwrap();
        assert!(parsed.ack);

        let parsed: TargetResponse =
            serde_json::from_str(r#"{"ack":false,"delaySeconds":45}"#).unwrap();
        assert!(!parsed.ack);
        assert_eq!(parsed.delay_seconds, Some(45));
    }
}
