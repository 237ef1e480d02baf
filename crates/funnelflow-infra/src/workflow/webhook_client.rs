//! Outbound HTTP client for WEBHOOK steps.
//!
//! Sends the JSON body with the configured user agent and, when a signing
//! secret is configured, an `X-Funnelflow-Signature: sha256=<hex>` header
//! carrying the HMAC-SHA256 of the exact body bytes.

use std::future::Future;
use std::pin::Pin;

use funnelflow_core::workflow::collaborator::{
    WebhookClient, WebhookError, WebhookRequest, WebhookResponse,
};
use funnelflow_types::config::WebhookSettings;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the body signature.
pub const SIGNATURE_HEADER: &str = "X-Funnelflow-Signature";

// ---------------------------------------------------------------------------
// Signing
// ---------------------------------------------------------------------------

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// `sha256=<hex>` HMAC of `body` under `secret`.
pub fn sign_body(secret: &[u8], body: &[u8]) -> Result<String, WebhookError> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| WebhookError::InvalidRequest(format!("invalid signing key: {e}")))?;
    mac.update(body);
    Ok(format!("sha256={}", hex_encode(&mac.finalize().into_bytes())))
}

// ---------------------------------------------------------------------------
// HttpWebhookClient
// ---------------------------------------------------------------------------

pub struct HttpWebhookClient {
    http: reqwest::Client,
    signing_secret: Option<String>,
}

impl HttpWebhookClient {
    pub fn new(settings: &WebhookSettings) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .user_agent(settings.user_agent.clone())
            .timeout(settings.effective_timeout(None))
            .build()?;
        Ok(Self {
            http,
            signing_secret: settings.signing_secret.clone(),
        })
    }

    async fn send(&self, request: &WebhookRequest) -> Result<WebhookResponse, WebhookError> {
        let method: reqwest::Method = request
            .method
            .parse()
            .map_err(|_| WebhookError::InvalidRequest(format!("invalid method: {}", request.method)))?;
        let has_body = method != reqwest::Method::GET;

        let body = if has_body {
            serde_json::to_vec(&request.body)
                .map_err(|e| WebhookError::InvalidRequest(format!("unserializable body: {e}")))?
        } else {
            Vec::new()
        };

        let mut builder = self
            .http
            .request(method, &request.url)
            .timeout(request.timeout);
        for (key, value) in &request.headers {
            builder = builder.header(key.as_str(), value.as_str());
        }
        if let Some(secret) = &self.signing_secret {
            builder = builder.header(SIGNATURE_HEADER, sign_body(secret.as_bytes(), &body)?);
        }
        if has_body {
            builder = builder
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                WebhookError::Timeout(request.timeout)
            } else if e.is_builder() {
                WebhookError::InvalidRequest(e.to_string())
            } else {
                WebhookError::Transport(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let body = response.text().await.map_err(|e| {
            if e.is_timeout() {
                WebhookError::Timeout(request.timeout)
            } else {
                WebhookError::Transport(e.to_string())
            }
        })?;

        tracing::debug!(url = request.url.as_str(), status, "webhook responded");
        Ok(WebhookResponse { status, body })
    }
}

impl WebhookClient for HttpWebhookClient {
    fn call<'a>(
        &'a self,
        request: &'a WebhookRequest,
    ) -> Pin<Box<dyn Future<Output = Result<WebhookResponse, WebhookError>> + Send + 'a>> {
        Box::pin(self.send(request))
    }
}
