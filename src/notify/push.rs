use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::StatusCode;
use thiserror::Error;
use tracing::debug;
use web_push::{
    ContentEncoding, SubscriptionInfo, VapidSignatureBuilder, WebPushError, WebPushMessage,
    WebPushMessageBuilder,
};

use crate::error::AppError;
use crate::notify::format::PushPayload;

#[derive(Debug, Error)]
pub enum PushError {
    /// Endpoint gone or never valid. The subscription should be dropped.
    #[error("push subscription is invalid or expired: {0}")]
    InvalidSubscription(String),

    #[error("push delivery failed: {0}")]
    Transient(String),
}

#[derive(Debug, Clone)]
pub struct PushOptions {
    pub ttl_secs: u64,
    /// VAPID `sub` claim (mailto: or https: URL).
    pub subject: String,
}

#[async_trait]
pub trait PushSender: Send + Sync {
    async fn send(
        &self,
        subscription: &str,
        payload: &PushPayload,
        opts: &PushOptions,
    ) -> Result<(), PushError>;
}

/// Parse a stored browser `PushSubscription` JSON object.
pub fn parse_subscription(subscription: &str) -> Result<SubscriptionInfo, PushError> {
    let info: SubscriptionInfo = serde_json::from_str(subscription.trim())
        .map_err(|e| PushError::InvalidSubscription(format!("unparseable subscription: {e}")))?;
    if !info.endpoint.starts_with("https://") && !info.endpoint.starts_with("http://") {
        return Err(PushError::InvalidSubscription(format!("bad endpoint {}", info.endpoint)));
    }
    if info.keys.p256dh.is_empty() || info.keys.auth.is_empty() {
        return Err(PushError::InvalidSubscription("subscription keys missing".to_string()));
    }
    Ok(info)
}

/// Web Push delivery: VAPID-signed, `aes128gcm`-encrypted payloads POSTed
/// to the subscription endpoint.
pub struct WebPushSender {
    client: reqwest::Client,
    /// Base64url P-256 private key (VAPID_PRIVATE_KEY).
    private_key: Option<String>,
}

impl WebPushSender {
    pub fn new(private_key: Option<String>, timeout: Duration) -> Result<Self, AppError> {
        if let Some(key) = &private_key {
            VapidSignatureBuilder::from_base64_no_sub(key, base64::URL_SAFE_NO_PAD)
                .map_err(|e| AppError::Config(format!("VAPID_PRIVATE_KEY is not a valid key: {e}")))?;
        }
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, private_key })
    }

    fn build_message(
        &self,
        info: &SubscriptionInfo,
        body: &[u8],
        opts: &PushOptions,
    ) -> Result<WebPushMessage, PushError> {
        let key = self
            .private_key
            .as_deref()
            .ok_or_else(|| PushError::Transient("VAPID keys not configured".to_string()))?;

        let mut signer = VapidSignatureBuilder::from_base64(key, base64::URL_SAFE_NO_PAD, info).map_err(build_error)?;
        signer.add_claim("sub", opts.subject.as_str());
        let signature = signer.build().map_err(build_error)?;

        let mut builder = WebPushMessageBuilder::new(info);
        builder.set_ttl(u32::try_from(opts.ttl_secs).unwrap_or(u32::MAX));
        builder.set_payload(ContentEncoding::Aes128Gcm, body);
        builder.set_vapid_signature(signature);
        builder.build().map_err(build_error)
    }
}

/// Key and endpoint problems belong to the subscription; anything else is
/// treated as retryable.
fn build_error(e: WebPushError) -> PushError {
    match e {
        WebPushError::InvalidUri | WebPushError::MissingCryptoKeys | WebPushError::InvalidCryptoKeys => {
            PushError::InvalidSubscription(e.to_string())
        }
        other => PushError::Transient(other.to_string()),
    }
}

#[async_trait]
impl PushSender for WebPushSender {
    async fn send(
        &self,
        subscription: &str,
        payload: &PushPayload,
        opts: &PushOptions,
    ) -> Result<(), PushError> {
        let info = parse_subscription(subscription)?;
        let body = serde_json::to_vec(payload).map_err(|e| PushError::Transient(e.to_string()))?;
        let message = self.build_message(&info, &body, opts)?;

        let mut request = self
            .client
            .post(message.endpoint.to_string())
            .header("TTL", message.ttl.to_string());
        if let Some(encrypted) = message.payload {
            request = request
                .header(CONTENT_ENCODING, encrypted.content_encoding.to_str())
                .header(CONTENT_TYPE, "application/octet-stream");
            for (name, value) in encrypted.crypto_headers {
                request = request.header(name, value);
            }
            request = request.body(encrypted.content);
        }

        let resp = request.send().await.map_err(|e| PushError::Transient(e.to_string()))?;
        let status = resp.status();
        debug!(%status, count = payload.data.count, "push service responded");
        classify_status(status)
    }
}

pub fn classify_status(status: StatusCode) -> Result<(), PushError> {
    if status.is_success() {
        Ok(())
    } else if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
        Err(PushError::InvalidSubscription(format!("endpoint returned {status}")))
    } else {
        Err(PushError::Transient(format!("endpoint returned {status}")))
    }
}

#[cfg(test)]
pub mod testing {
    use std::sync::Mutex;

    use super::*;

    /// Records payloads and answers with a scripted result.
    #[derive(Default)]
    pub struct RecordingSender {
        pub sent: Mutex<Vec<(String, String)>>,
        pub fail_with: Mutex<Option<fn() -> PushError>>,
    }

    impl RecordingSender {
        pub fn failing(f: fn() -> PushError) -> Self {
            Self { sent: Mutex::new(Vec::new()), fail_with: Mutex::new(Some(f)) }
        }

        pub fn titles(&self) -> Vec<String> {
            self.sent.lock().unwrap().iter().map(|(_, t)| t.clone()).collect()
        }
    }

    #[async_trait]
    impl PushSender for RecordingSender {
        async fn send(&self, subscription: &str, payload: &PushPayload, _: &PushOptions) -> Result<(), PushError> {
            if let Some(f) = *self.fail_with.lock().unwrap() {
                return Err(f());
            }
            self.sent.lock().unwrap().push((subscription.to_string(), payload.title.clone()));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Key material from the RFC 8291 worked example.
    const P256DH: &str =
        "BCVxsr7N_eNgVRqvHtD0zTZsEc6-VV-JvLexhqUzORcxaOzi6-AYWXvTBHm4bjyPjs7Vd8pZGH6SRpkNtoIAiw4";
    const AUTH: &str = "BTBZMqHH6r4Tts7J_aSIgg";
    const VAPID_PRIVATE: &str = "yfWPiYE-n46HLnH0KqZOF1fJJU3MYrct3AELtAQ-oRw";

    fn subscription(endpoint: &str) -> String {
        format!(r#"{{"endpoint":"{endpoint}","keys":{{"p256dh":"{P256DH}","auth":"{AUTH}"}}}}"#)
    }

    #[test]
    fn subscriptions_must_carry_endpoint_and_keys() {
        let info = parse_subscription(&subscription("https://push.example/abc")).unwrap();
        assert_eq!(info.endpoint, "https://push.example/abc");

        for bad in [
            "https://push.example/abc".to_string(),
            "garbage".to_string(),
            r#"{"endpoint":"https://push.example/abc","keys":{"p256dh":"","auth":""}}"#.to_string(),
            subscription("ftp://push.example/abc"),
        ] {
            assert!(matches!(parse_subscription(&bad), Err(PushError::InvalidSubscription(_))), "{bad}");
        }
    }

    #[test]
    fn message_is_signed_and_encrypted() {
        let sender = WebPushSender::new(Some(VAPID_PRIVATE.to_string()), Duration::from_secs(1)).unwrap();
        let info = parse_subscription(&subscription("https://push.example/abc")).unwrap();
        let opts = PushOptions { ttl_secs: 600, subject: "mailto:ops@example.com".to_string() };

        let message = sender.build_message(&info, br#"{"title":"x"}"#, &opts).unwrap();
        assert_eq!(message.ttl, 600);
        let encrypted = message.payload.unwrap();
        assert_eq!(encrypted.content_encoding.to_str(), "aes128gcm");
        assert_ne!(encrypted.content, br#"{"title":"x"}"#.to_vec());
        assert!(encrypted
            .crypto_headers
            .iter()
            .any(|(name, value)| name.eq_ignore_ascii_case("authorization") && value.starts_with("vapid")));
    }

    #[test]
    fn invalid_private_key_is_a_config_error() {
        assert!(matches!(
            WebPushSender::new(Some("not-a-key".to_string()), Duration::from_secs(1)),
            Err(AppError::Config(_))
        ));
        let unsigned = WebPushSender::new(None, Duration::from_secs(1)).unwrap();
        let info = parse_subscription(&subscription("https://push.example/abc")).unwrap();
        let opts = PushOptions { ttl_secs: 60, subject: "mailto:ops@example.com".to_string() };
        assert!(matches!(unsigned.build_message(&info, b"{}", &opts), Err(PushError::Transient(_))));
    }

    #[test]
    fn gone_and_not_found_invalidate_the_subscription() {
        assert!(classify_status(StatusCode::CREATED).is_ok());
        assert!(matches!(classify_status(StatusCode::GONE), Err(PushError::InvalidSubscription(_))));
        assert!(matches!(classify_status(StatusCode::NOT_FOUND), Err(PushError::InvalidSubscription(_))));
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            Err(PushError::Transient(_))
        ));
    }
}
