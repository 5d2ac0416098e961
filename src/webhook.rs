// ABOUTME: Outbound webhook payload formatting and dispatch per client api_format
// ABOUTME: URL resolution: number override -> client default -> drop; retries are a Router concern

use std::time::Duration;

use base64::Engine;
use serde_json::json;
use thiserror::Error;

use crate::domain::{ApiFormat, Client};
use crate::envelope::Envelope;

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("no webhook URL configured for this destination")]
    NoUrlConfigured,
    #[error("webhook request failed: {0}")]
    RequestFailed(String),
    #[error("webhook returned HTTP {0}")]
    NonSuccessStatus(u16),
}

/// Resolve the webhook URL: number-specific override first, else the
/// client's default, else `None` (drop + error log, spec §4.9).
pub fn resolve_url(client: &Client, number_override: Option<&str>) -> Option<String> {
    number_override
        .map(str::to_string)
        .or_else(|| client.settings.default_webhook.clone())
}

fn basic_auth_header(username: &str, password: &str) -> String {
    let token = base64::engine::general_purpose::STANDARD.encode(format!("{username}:{password}"));
    format!("Basic {token}")
}

fn bearer_header(username: &str, password: &str) -> String {
    let token = base64::engine::general_purpose::STANDARD.encode(format!("{username}:{password}"));
    format!("Bearer {token}")
}

/// Build the JSON payload and auth header for `client`'s `api_format`
///. `password` is the client's plaintext API credential as
/// resolved by the (out-of-scope) repository's decryption step.
pub fn build_request(client: &Client, password: &str, envelope: &Envelope) -> (serde_json::Value, String) {
    match client.settings.api_format {
        ApiFormat::Generic => {
            let media: Vec<_> = envelope
                .files
                .iter()
                .map(|f| {
                    json!({
                        "filename": f.filename,
                        "content_type": f.mime_type,
                        "base64": base64::engine::general_purpose::STANDARD.encode(&f.bytes),
                    })
                })
                .collect();
            let body = json!({
                "id": envelope.log_id,
                "from": envelope.from,
                "to": envelope.to,
                "text": envelope.text,
                "type": envelope.kind.as_str(),
                "timestamp": envelope.received_at.to_rfc3339(),
                "media": media,
            });
            (body, basic_auth_header(&client.username, password))
        }
        ApiFormat::Bicom => {
            let media_urls: Vec<String> = envelope
                .files
                .iter()
                .map(|f| {
                    format!(
                        "data:{};base64,{}",
                        f.mime_type,
                        base64::engine::general_purpose::STANDARD.encode(&f.bytes)
                    )
                })
                .collect();
            let body = json!({
                "from": envelope.from,
                "to": envelope.to,
                "text": envelope.text,
                "media_urls": media_urls,
            });
            (body, bearer_header(&client.username, password))
        }
        ApiFormat::Telnyx => {
            let body = json!({
                "data": {
                    "event_type": "message.received",
                    "payload": {
                        "id": envelope.log_id,
                        "from": {"phone_number": envelope.from},
                        "to": [{"phone_number": envelope.to}],
                        "text": envelope.text,
                        "type": envelope.kind.as_str(),
                        "received_at": envelope.received_at.to_rfc3339(),
                    }
                }
            });
            (body, basic_auth_header(&client.username, password))
        }
    }
}

/// Dispatches webhooks over HTTP with a per-client timeout override or the
/// global default (10s, spec §4.9).
pub struct WebhookDispatcher {
    http: reqwest::Client,
    default_timeout: Duration,
}

impl WebhookDispatcher {
    pub fn new(default_timeout: Duration) -> Self {
        WebhookDispatcher {
            http: reqwest::Client::new(),
            default_timeout,
        }
    }

    pub async fn send(
        &self,
        client: &Client,
        password: &str,
        number_override: Option<&str>,
        envelope: &Envelope,
    ) -> Result<(), WebhookError> {
        let url = resolve_url(client, number_override).ok_or(WebhookError::NoUrlConfigured)?;
        let (body, auth) = build_request(client, password, envelope);
        let timeout = client
            .settings
            .webhook_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout);

        let response = self
            .http
            .post(&url)
            .timeout(timeout)
            .header("Authorization", auth)
            .json(&body)
            .send()
            .await
            .map_err(|e| WebhookError::RequestFailed(e.to_string()))?;

        if response.status().as_u16() >= 300 {
            return Err(WebhookError::NonSuccessStatus(response.status().as_u16()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ApiFormat, ClientSettings, ClientType};
    use crate::envelope::MessageKind;

    fn test_client(api_format: ApiFormat, default_webhook: Option<&str>) -> Client {
        Client {
            id: 1,
            username: "bicom".into(),
            password_encrypted: String::new(),
            name: "Bicom".into(),
            address: None,
            client_type: ClientType::Web,
            timezone: None,
            settings: ClientSettings {
                api_format,
                default_webhook: default_webhook.map(str::to_string),
                ..Default::default()
            },
        }
    }

    #[test]
    fn number_override_wins_over_client_default() {
        let client = test_client(ApiFormat::Generic, Some("https://default"));
        let url = resolve_url(&client, Some("https://override"));
        assert_eq!(url.as_deref(), Some("https://override"));
    }

    #[test]
    fn no_webhook_configured_resolves_to_none() {
        let client = test_client(ApiFormat::Generic, None);
        assert!(resolve_url(&client, None).is_none());
    }

    #[test]
    fn generic_format_matches_spec_s1_shape() {
        let client = test_client(ApiFormat::Generic, Some("https://ex/hook"));
        let env = Envelope::new("+14155559876", "+12505551234", MessageKind::Sms).with_text("Hi");
        let (body, auth) = build_request(&client, "apikey", &env);
        assert_eq!(body["from"], "+12505551234");
        assert_eq!(body["to"], "+14155559876");
        assert_eq!(body["text"], "Hi");
        assert!(auth.starts_with("Basic "));
    }

    #[test]
    fn bicom_format_uses_bearer_and_data_urls() {
        let client = test_client(ApiFormat::Bicom, Some("https://ex/hook"));
        let mut env = Envelope::new("+1", "+2", MessageKind::Mms);
        env.files.push(crate::envelope::FileAttachment::new(
            "a.jpg",
            "image/jpeg",
            vec![1, 2, 3],
        ));
        let (body, auth) = build_request(&client, "apikey", &env);
        assert!(auth.starts_with("Bearer "));
        let urls = body["media_urls"].as_array().unwrap();
        assert!(urls[0].as_str().unwrap().starts_with("data:image/jpeg;base64,"));
    }

    #[test]
    fn telnyx_format_wraps_event_envelope() {
        let client = test_client(ApiFormat::Telnyx, Some("https://ex/hook"));
        let env = Envelope::new("+1", "+2", MessageKind::Sms).with_text("hi");
        let (body, _auth) = build_request(&client, "apikey", &env);
        assert_eq!(body["data"]["event_type"], "message.received");
        assert_eq!(body["data"]["payload"]["text"], "hi");
    }
}
