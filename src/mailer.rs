//! Delivery gateway abstraction for sending rendered email.
//!
//! This module defines the `Mailer` trait to abstract email delivery,
//! enabling testability with mock implementations. The production
//! implementation sends over async SMTP (lettre). Before a message is built,
//! base64 `data:` images embedded in the HTML body are extracted into
//! content-addressed inline attachments referenced by `cid:` URLs — a pure
//! pre-processing step that does not alter visible rendering.

use std::collections::HashSet;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{BroadsideError, Result};

/// Identifier returned by the transport for one accepted message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct DeliveryId(pub String);

impl std::fmt::Display for DeliveryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A fully rendered email ready for delivery.
#[derive(Debug, Clone, Default)]
pub struct OutgoingEmail {
    pub to: String,
    pub subject: String,
    pub html: String,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub attachments: Vec<EmailAttachment>,
}

/// A file attached to an outgoing email.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailAttachment {
    pub file_name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

/// Trait for delivering one rendered email.
///
/// This abstraction allows for different implementations (production vs.
/// testing) and keeps the batch executor testable without a live SMTP server.
#[async_trait]
pub trait Mailer: Send + Sync {
    /// Deliver one email, returning the transport's identifier for it.
    ///
    /// # Errors
    /// Returns an error on address parse failures, message assembly failures,
    /// or transport (network/auth) failures. The batch executor counts these
    /// per recipient and continues.
    async fn send(&self, email: &OutgoingEmail) -> Result<DeliveryId>;
}

// ============================================================================
// Inline image extraction
// ============================================================================

/// An image lifted out of the HTML body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineImage {
    /// Content-addressed id; identical payloads share one attachment.
    pub content_id: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

/// Extract base64 `data:image/...` payloads from an HTML body.
///
/// Each occurrence is replaced with a `cid:` reference to a content-addressed
/// inline attachment. The scan is order-preserving and anything that does not
/// parse as a base64 image data URI is copied through untouched.
pub fn extract_inline_images(html: &str) -> (String, Vec<InlineImage>) {
    const PREFIX: &str = "data:image/";

    let mut out = String::with_capacity(html.len());
    let mut images: Vec<InlineImage> = Vec::new();
    let mut rest = html;

    while let Some(pos) = rest.find(PREFIX) {
        let (before, tail) = rest.split_at(pos);
        out.push_str(before);

        match parse_data_uri(&tail[PREFIX.len()..]) {
            Some((subtype, payload, consumed)) => {
                match BASE64.decode(payload) {
                    Ok(bytes) => {
                        let content_id = content_address(&bytes);
                        out.push_str("cid:");
                        out.push_str(&content_id);
                        if !images.iter().any(|img| img.content_id == content_id) {
                            images.push(InlineImage {
                                content_id,
                                content_type: format!("image/{}", subtype),
                                bytes,
                            });
                        }
                        rest = &tail[PREFIX.len() + consumed..];
                    }
                    Err(_) => {
                        // Not valid base64 after all: copy the URI through.
                        out.push_str(&tail[..PREFIX.len() + consumed]);
                        rest = &tail[PREFIX.len() + consumed..];
                    }
                }
            }
            None => {
                out.push_str(PREFIX);
                rest = &tail[PREFIX.len()..];
            }
        }
    }

    out.push_str(rest);
    (out, images)
}

/// Parse `<subtype>;base64,<payload>` after a `data:image/` prefix.
///
/// Returns the subtype, the payload, and the number of bytes consumed past
/// the prefix.
fn parse_data_uri(input: &str) -> Option<(&str, &str, usize)> {
    const MARKER: &str = ";base64,";

    let subtype_end = input.find(|c: char| !c.is_ascii_alphanumeric() && c != '+' && c != '-' && c != '.')?;
    let subtype = &input[..subtype_end];
    if subtype.is_empty() || !input[subtype_end..].starts_with(MARKER) {
        return None;
    }

    let payload_start = subtype_end + MARKER.len();
    let payload_len = input[payload_start..]
        .find(|c: char| !c.is_ascii_alphanumeric() && c != '+' && c != '/' && c != '=')
        .unwrap_or(input.len() - payload_start);
    if payload_len == 0 {
        return None;
    }

    let payload = &input[payload_start..payload_start + payload_len];
    Some((subtype, payload, payload_start + payload_len))
}

fn content_address(bytes: &[u8]) -> String {
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    format!("img-{:016x}", hasher.finish())
}

// ============================================================================
// Production implementation using lettre
// ============================================================================

/// TLS mode for the SMTP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsMode {
    /// Implicit TLS from the first byte (SMTPS).
    Tls,
    /// Opportunistic STARTTLS upgrade.
    Starttls,
    /// Plaintext; local relays only.
    None,
}

/// SMTP transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub from_name: String,
    pub from_address: String,
    pub tls: TlsMode,
    /// Per-send timeout in milliseconds.
    pub timeout_ms: u64,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 587,
            username: String::new(),
            password: String::new(),
            from_name: "Broadside".to_string(),
            from_address: "no-reply@localhost".to_string(),
            tls: TlsMode::Starttls,
            timeout_ms: 10_000,
        }
    }
}

/// Production mailer sending over async SMTP.
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpMailer {
    /// Build a mailer from SMTP settings. The transport is constructed once
    /// and reused for every send.
    pub fn new(config: &SmtpConfig) -> Result<Self> {
        let from: Mailbox = format!("{} <{}>", config.from_name, config.from_address).parse()?;

        let mut builder = match config.tls {
            TlsMode::Tls => AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)?,
            TlsMode::Starttls => AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)?,
            TlsMode::None => AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host),
        };
        builder = builder
            .port(config.port)
            .timeout(Some(Duration::from_millis(config.timeout_ms)));
        if !config.username.is_empty() {
            builder = builder.credentials(Credentials::new(
                config.username.clone(),
                config.password.clone(),
            ));
        }

        Ok(Self {
            transport: builder.build(),
            from,
        })
    }
}

fn content_type(value: &str) -> Result<ContentType> {
    ContentType::parse(value)
        .map_err(|e| BroadsideError::Validation(format!("Invalid content type '{}': {}", value, e)))
}

#[async_trait]
impl Mailer for SmtpMailer {
    #[tracing::instrument(skip(self, email), fields(to = %email.to, subject = %email.subject))]
    async fn send(&self, email: &OutgoingEmail) -> Result<DeliveryId> {
        let (html, inline_images) = extract_inline_images(&email.html);

        let mut builder = Message::builder()
            .from(self.from.clone())
            .to(email.to.parse()?)
            .subject(email.subject.clone());
        for cc in &email.cc {
            builder = builder.cc(cc.parse()?);
        }
        for bcc in &email.bcc {
            builder = builder.bcc(bcc.parse()?);
        }

        let mut related = MultiPart::related().singlepart(SinglePart::html(html));
        for image in inline_images {
            related = related.singlepart(
                Attachment::new_inline(image.content_id)
                    .body(image.bytes, content_type(&image.content_type)?),
            );
        }

        let message = if email.attachments.is_empty() {
            builder.multipart(related)?
        } else {
            let mut mixed = MultiPart::mixed().multipart(related);
            for attachment in &email.attachments {
                mixed = mixed.singlepart(
                    Attachment::new(attachment.file_name.clone())
                        .body(attachment.bytes.clone(), content_type(&attachment.content_type)?),
                );
            }
            builder.multipart(mixed)?
        };

        let response = self.transport.send(message).await?;
        let delivery_id = DeliveryId(response.message().collect::<Vec<_>>().join(" "));

        tracing::debug!(delivery_id = %delivery_id, "Email accepted by SMTP relay");
        Ok(delivery_id)
    }
}

// ============================================================================
// Test/Mock implementation
// ============================================================================

/// Mock mailer for testing.
///
/// Records every send attempt and supports per-address failure injection,
/// without touching a real transport.
///
/// # Example
/// ```ignore
/// let mock = MockMailer::new();
/// mock.fail_address("broken@example.com");
/// // ... run a batch ...
/// assert_eq!(mock.call_count(), 5);
/// ```
#[derive(Default)]
pub struct MockMailer {
    calls: Mutex<Vec<OutgoingEmail>>,
    fail_for: Mutex<HashSet<String>>,
}

impl MockMailer {
    /// Create a new mock mailer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every send to `address` fail with a transport error.
    pub fn fail_address(&self, address: &str) {
        self.fail_for.lock().insert(address.to_string());
    }

    /// Get all send attempts, in order.
    pub fn calls(&self) -> Vec<OutgoingEmail> {
        self.calls.lock().clone()
    }

    /// Number of send attempts, including failed ones.
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl Mailer for MockMailer {
    async fn send(&self, email: &OutgoingEmail) -> Result<DeliveryId> {
        let attempt = {
            let mut calls = self.calls.lock();
            calls.push(email.clone());
            calls.len()
        };

        if self.fail_for.lock().contains(&email.to) {
            return Err(BroadsideError::Other(anyhow::anyhow!(
                "simulated transport failure for {}",
                email.to
            )));
        }

        Ok(DeliveryId(format!("mock-{}", attempt)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // "hello" in base64
    const PAYLOAD: &str = "aGVsbG8=";

    #[test]
    fn extracts_single_inline_image() {
        let html = format!(r#"<img src="data:image/png;base64,{}">"#, PAYLOAD);
        let (rewritten, images) = extract_inline_images(&html);

        assert_eq!(images.len(), 1);
        assert_eq!(images[0].content_type, "image/png");
        assert_eq!(images[0].bytes, b"hello");
        assert_eq!(
            rewritten,
            format!(r#"<img src="cid:{}">"#, images[0].content_id)
        );
    }

    #[test]
    fn identical_payloads_share_one_attachment() {
        let html = format!(
            r#"<img src="data:image/png;base64,{p}"><img src="data:image/png;base64,{p}">"#,
            p = PAYLOAD
        );
        let (rewritten, images) = extract_inline_images(&html);
        assert_eq!(images.len(), 1);
        assert_eq!(rewritten.matches("cid:").count(), 2);
    }

    #[test]
    fn distinct_payloads_become_distinct_attachments() {
        let html = format!(
            r#"<img src="data:image/png;base64,{}"><img src="data:image/jpeg;base64,{}">"#,
            PAYLOAD, "d29ybGQ=",
        );
        let (_, images) = extract_inline_images(&html);
        assert_eq!(images.len(), 2);
        assert_eq!(images[1].content_type, "image/jpeg");
        assert_eq!(images[1].bytes, b"world");
    }

    #[test]
    fn non_base64_data_uris_are_untouched() {
        let html = r#"<img src="data:image/svg+xml,<svg/>">"#;
        let (rewritten, images) = extract_inline_images(html);
        assert!(images.is_empty());
        assert_eq!(rewritten, html);
    }

    #[test]
    fn html_without_images_is_unchanged() {
        let html = "<p>Hi {{name}}</p>";
        let (rewritten, images) = extract_inline_images(html);
        assert!(images.is_empty());
        assert_eq!(rewritten, html);
    }

    #[tokio::test]
    async fn mock_mailer_records_calls_and_injects_failures() {
        let mock = MockMailer::new();
        mock.fail_address("broken@example.com");

        let ok = OutgoingEmail {
            to: "ana@example.com".to_string(),
            subject: "hi".to_string(),
            ..Default::default()
        };
        let bad = OutgoingEmail {
            to: "broken@example.com".to_string(),
            ..Default::default()
        };

        assert!(mock.send(&ok).await.is_ok());
        assert!(mock.send(&bad).await.is_err());
        assert_eq!(mock.call_count(), 2);
        assert_eq!(mock.calls()[1].to, "broken@example.com");
    }
}
