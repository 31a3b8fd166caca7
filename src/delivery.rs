//! Per-recipient delivery loop shared by the batch executor and the reminder
//! sweep.
//!
//! One bad address never abandons a batch: every delivery error is caught,
//! counted, and logged, and the loop moves on to the next recipient.

use metrics::counter;
use serde_json::{Map, Value};

use crate::contacts::ContactRecord;
use crate::domain::template::MessageTemplate;
use crate::mailer::{EmailAttachment, Mailer, OutgoingEmail};
use crate::storage::FileStore;
use crate::template::compile;

/// Outcome of delivering one slice of recipients.
#[derive(Debug, Default)]
pub(crate) struct SliceOutcome {
    pub sent: u64,
    pub failed: u64,
    pub last_error: Option<String>,
}

/// Render and deliver a template to each recipient in the slice, in order.
pub(crate) async fn deliver_slice<M: Mailer + ?Sized>(
    mailer: &M,
    template: &MessageTemplate,
    attachments: &[EmailAttachment],
    recipients: &[ContactRecord],
    base: &Map<String, Value>,
) -> SliceOutcome {
    let mut outcome = SliceOutcome::default();

    for recipient in recipients {
        let ctx = recipient.render_context(base);
        let subject = template
            .subject
            .as_deref()
            .map(|s| compile(s, &ctx))
            .unwrap_or_default();
        let html = compile(&template.body, &ctx);

        let email = OutgoingEmail {
            to: recipient.email.clone(),
            subject,
            html,
            cc: Vec::new(),
            bcc: Vec::new(),
            attachments: attachments.to_vec(),
        };

        match mailer.send(&email).await {
            Ok(delivery_id) => {
                outcome.sent += 1;
                counter!("broadside_emails_sent_total").increment(1);
                tracing::debug!(to = %recipient.email, delivery_id = %delivery_id, "Email delivered");
            }
            Err(e) => {
                outcome.failed += 1;
                outcome.last_error = Some(e.to_string());
                counter!("broadside_emails_failed_total").increment(1);
                tracing::warn!(
                    to = %recipient.email,
                    error = %e,
                    "Email delivery failed, continuing batch"
                );
            }
        }
    }

    outcome
}

/// Load a template's attachment files. An unreadable attachment is skipped
/// with a warning; the message still goes out.
pub(crate) async fn load_attachments<F: FileStore + ?Sized>(
    files: &F,
    template: &MessageTemplate,
) -> Vec<EmailAttachment> {
    let mut attachments = Vec::new();
    for attachment in &template.attachments {
        match files.read(&attachment.path).await {
            Ok(bytes) => attachments.push(EmailAttachment {
                file_name: attachment.file_name.clone(),
                content_type: content_type_for(&attachment.file_name).to_string(),
                bytes,
            }),
            Err(e) => {
                tracing::warn!(
                    path = %attachment.path,
                    error = %e,
                    "Attachment could not be read, sending without it"
                );
            }
        }
    }
    attachments
}

fn content_type_for(file_name: &str) -> &'static str {
    match file_name.rsplit('.').next().map(str::to_ascii_lowercase).as_deref() {
        Some("pdf") => "application/pdf",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("csv") => "text/csv",
        Some("txt") => "text/plain",
        Some("html") => "text/html",
        Some("zip") => "application/zip",
        _ => "application/octet-stream",
    }
}
