//! Delivery executor: recipient resolution and per-recipient idempotent
//! email dispatch.
//!
//! Upstream contact data is untrusted and variable: a recipient may be a
//! bare string or an object using any of several address field names, so
//! normalization (trim, lowercase, de-duplicate) is mandatory before
//! dispatch. Within one capsule, each recipient is processed under its
//! own idempotency claim; a capsule succeeds only if every recipient
//! succeeded, but recipients already marked `sent` are never re-emailed
//! on a later attempt.

use crate::email::EmailChannel;
use crate::errors::DeliveryError;
use crate::idempotency::{ClaimOutcome, IdempotencyGuard};
use crate::render::render_message;
use crate::storage::blob::BlobStore;
use crate::storage::capsule::{Capsule, RecipientKind};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Address field names accepted on structured contact objects.
const CONTACT_FIELDS: &[&str] = &["email", "address", "contact_email", "value"];

/// One normalized recipient of a capsule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    pub email: String,
    /// True when the send goes to the capsule owner's own address;
    /// affects only the rendered content.
    pub self_addressed: bool,
}

/// Per-capsule delivery report.
#[derive(Debug, Default)]
pub struct DeliveryReport {
    /// Sends attempted and accepted this run.
    pub sent: usize,
    /// Recipients skipped because a `sent` marker already existed or a
    /// peer attempt was in flight.
    pub skipped: usize,
    /// Per-recipient failure descriptions.
    pub failures: Vec<String>,
}

impl DeliveryReport {
    /// A capsule is successful only if every recipient succeeded.
    pub fn all_sent(&self) -> bool {
        self.failures.is_empty()
    }
}

pub struct DeliveryExecutor {
    guard: Arc<IdempotencyGuard>,
    email: Arc<dyn EmailChannel>,
    blob: Option<Arc<dyn BlobStore>>,
    blob_bucket: String,
    signed_url_ttl_secs: u64,
}

impl DeliveryExecutor {
    pub fn new(
        guard: Arc<IdempotencyGuard>,
        email: Arc<dyn EmailChannel>,
        blob: Option<Arc<dyn BlobStore>>,
        blob_bucket: String,
        signed_url_ttl_secs: u64,
    ) -> Self {
        Self {
            guard,
            email,
            blob,
            blob_bucket,
            signed_url_ttl_secs,
        }
    }

    /// Deliver one capsule to its full recipient set.
    pub async fn deliver(&self, capsule: &Capsule) -> Result<DeliveryReport, DeliveryError> {
        let recipients = resolve_recipients(capsule)?;
        let media_links = self.resolve_media_links(capsule).await;

        let mut report = DeliveryReport::default();
        for recipient in &recipients {
            match self.guard.claim(&capsule.id, &recipient.email).await? {
                ClaimOutcome::AlreadySent => {
                    debug!(
                        capsule = %capsule.id,
                        recipient = %recipient.email,
                        "Already delivered, skipping"
                    );
                    report.skipped += 1;
                    continue;
                }
                ClaimOutcome::InFlight => {
                    debug!(
                        capsule = %capsule.id,
                        recipient = %recipient.email,
                        "Peer send in flight, skipping"
                    );
                    report.skipped += 1;
                    continue;
                }
                ClaimOutcome::Proceed => {}
            }

            let media_links = match &media_links {
                Ok(links) => links.clone(),
                Err(err) => {
                    // Media signing failed; this recipient's send fails
                    // rather than going out with missing attachments.
                    self.guard.release(&capsule.id, &recipient.email).await?;
                    report.failures.push(err.to_string());
                    continue;
                }
            };

            let message = render_message(capsule, recipient.self_addressed, &media_links);
            match self.email.send(&recipient.email, &message).await {
                Ok(receipt) => {
                    self.guard.mark_sent(&capsule.id, &recipient.email).await?;
                    info!(
                        capsule = %capsule.id,
                        recipient = %recipient.email,
                        provider_id = ?receipt.id,
                        "Capsule email sent"
                    );
                    report.sent += 1;
                }
                Err(err) => {
                    warn!(
                        capsule = %capsule.id,
                        recipient = %recipient.email,
                        error = %err,
                        "Capsule email failed"
                    );
                    self.guard.release(&capsule.id, &recipient.email).await?;
                    report.failures.push(err.to_string());
                }
            }
        }

        Ok(report)
    }

    /// The planned recipient set, for dry-run logging.
    pub fn plan_recipients(&self, capsule: &Capsule) -> Result<Vec<Recipient>, DeliveryError> {
        resolve_recipients(capsule)
    }

    async fn resolve_media_links(&self, capsule: &Capsule) -> Result<Vec<String>, DeliveryError> {
        let mut links = Vec::with_capacity(capsule.media_count());
        for media_id in &capsule.media_ids {
            let blob = self
                .blob
                .as_ref()
                .ok_or_else(|| DeliveryError::MediaResolve {
                    media_id: media_id.clone(),
                    details: "no blob store configured".to_string(),
                })?;
            let url = blob
                .create_signed_url(&self.blob_bucket, media_id, self.signed_url_ttl_secs)
                .await?;
            links.push(url);
        }
        links.extend(capsule.media_urls.iter().cloned());
        Ok(links)
    }
}

/// Resolve and normalize the recipient set for a capsule.
pub fn resolve_recipients(capsule: &Capsule) -> Result<Vec<Recipient>, DeliveryError> {
    match capsule.recipient_kind {
        RecipientKind::SelfContact => {
            // Graceful fallback: a malformed or empty stored self-contact
            // falls back to the account's registered email.
            let email = capsule
                .self_contact
                .as_ref()
                .and_then(extract_address)
                .or_else(|| normalize_address(&capsule.owner_email))
                .ok_or_else(|| DeliveryError::NoRecipients {
                    capsule_id: capsule.id.clone(),
                })?;
            Ok(vec![Recipient {
                email,
                self_addressed: true,
            }])
        }
        RecipientKind::Others => {
            let owner = normalize_address(&capsule.owner_email);
            let mut seen = HashSet::new();
            let mut recipients = Vec::new();
            for contact in &capsule.recipients {
                let Some(email) = extract_address(contact) else {
                    warn!(
                        capsule = %capsule.id,
                        contact = %contact,
                        "Skipping unparseable contact"
                    );
                    continue;
                };
                if seen.insert(email.clone()) {
                    let self_addressed = owner.as_deref() == Some(email.as_str());
                    recipients.push(Recipient {
                        email,
                        self_addressed,
                    });
                }
            }
            if recipients.is_empty() {
                return Err(DeliveryError::NoRecipients {
                    capsule_id: capsule.id.clone(),
                });
            }
            Ok(recipients)
        }
    }
}

/// Pull an email address out of a heterogeneous contact shape.
fn extract_address(contact: &Value) -> Option<String> {
    match contact {
        Value::String(s) => normalize_address(s),
        Value::Object(fields) => CONTACT_FIELDS
            .iter()
            .filter_map(|name| fields.get(*name))
            .filter_map(|v| v.as_str())
            .find_map(normalize_address),
        _ => None,
    }
}

fn normalize_address(raw: &str) -> Option<String> {
    let normalized = raw.trim().to_lowercase();
    // Minimal shape check; the provider does full validation.
    if normalized.len() >= 3 && normalized.contains('@') && !normalized.starts_with('@') {
        Some(normalized)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::email::RecordingEmailChannel;
    use crate::storage::blob::MemoryBlobStore;
    use crate::storage::capsule::test_fixtures::scheduled_capsule;
    use crate::storage::kv::MemoryKvStore;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;

    fn executor(
        email: Arc<RecordingEmailChannel>,
        blob: Option<Arc<dyn BlobStore>>,
    ) -> DeliveryExecutor {
        let kv = Arc::new(MemoryKvStore::new());
        let guard = Arc::new(IdempotencyGuard::new(kv, ChronoDuration::minutes(10)));
        DeliveryExecutor::new(guard, email, blob, "capsule-media".to_string(), 3600)
    }

    #[test]
    fn test_heterogeneous_contact_shapes_normalize() {
        let mut capsule = scheduled_capsule("c1");
        capsule.recipient_kind = RecipientKind::Others;
        capsule.recipients = vec![
            json!("  Friend@Example.COM "),
            json!({"email": "other@example.com"}),
            json!({"address": "third@example.com"}),
            json!({"contact_email": "fourth@example.com"}),
            json!({"name": "no address here"}),
            json!(42),
        ];

        let recipients = resolve_recipients(&capsule).unwrap();
        let emails: Vec<&str> = recipients.iter().map(|r| r.email.as_str()).collect();
        assert_eq!(
            emails,
            vec![
                "friend@example.com",
                "other@example.com",
                "third@example.com",
                "fourth@example.com"
            ]
        );
    }

    #[test]
    fn test_duplicate_recipients_are_collapsed() {
        let mut capsule = scheduled_capsule("c1");
        capsule.recipient_kind = RecipientKind::Others;
        capsule.recipients = vec![
            json!("friend@example.com"),
            json!("FRIEND@example.com  "),
            json!({"email": "friend@example.com"}),
        ];

        let recipients = resolve_recipients(&capsule).unwrap();
        assert_eq!(recipients.len(), 1);
    }

    #[test]
    fn test_self_contact_falls_back_to_owner_email() {
        let mut capsule = scheduled_capsule("c1");
        capsule.self_contact = Some(json!({"broken": true}));

        let recipients = resolve_recipients(&capsule).unwrap();
        assert_eq!(recipients[0].email, "me@example.com");
        assert!(recipients[0].self_addressed);
    }

    #[test]
    fn test_owner_address_in_others_is_self_addressed() {
        let mut capsule = scheduled_capsule("c1");
        capsule.recipient_kind = RecipientKind::Others;
        capsule.recipients = vec![json!("ME@example.com"), json!("friend@example.com")];

        let recipients = resolve_recipients(&capsule).unwrap();
        assert!(recipients[0].self_addressed);
        assert!(!recipients[1].self_addressed);
    }

    #[test]
    fn test_no_valid_recipients_is_an_error() {
        let mut capsule = scheduled_capsule("c1");
        capsule.recipient_kind = RecipientKind::Others;
        capsule.recipients = vec![json!("not-an-email"), json!(null)];

        assert!(matches!(
            resolve_recipients(&capsule),
            Err(DeliveryError::NoRecipients { .. })
        ));
    }

    #[tokio::test]
    async fn test_deliver_marks_sent_and_records_email() {
        let email = Arc::new(RecordingEmailChannel::new());
        let exec = executor(email.clone(), None);
        let capsule = scheduled_capsule("c1");

        let report = exec.deliver(&capsule).await.unwrap();
        assert!(report.all_sent());
        assert_eq!(report.sent, 1);
        assert_eq!(email.sent_to("me@example.com").await, 1);

        // Second run skips via the persisted marker.
        let again = exec.deliver(&capsule).await.unwrap();
        assert!(again.all_sent());
        assert_eq!(again.sent, 0);
        assert_eq!(again.skipped, 1);
        assert_eq!(email.sent_to("me@example.com").await, 1);
    }

    #[tokio::test]
    async fn test_partial_failure_releases_only_failed_marker() {
        let email = Arc::new(RecordingEmailChannel::new());
        email.fail_address("b@example.com").await;
        let exec = executor(email.clone(), None);

        let mut capsule = scheduled_capsule("c1");
        capsule.recipient_kind = RecipientKind::Others;
        capsule.recipients = vec![json!("a@example.com"), json!("b@example.com")];

        let report = exec.deliver(&capsule).await.unwrap();
        assert!(!report.all_sent());
        assert_eq!(report.sent, 1);
        assert_eq!(report.failures.len(), 1);

        // Retry: A's marker persists, only B is attempted.
        email.clear_failures().await;
        let retry = exec.deliver(&capsule).await.unwrap();
        assert!(retry.all_sent());
        assert_eq!(email.sent_to("a@example.com").await, 1);
        assert_eq!(email.sent_to("b@example.com").await, 1);
    }

    #[tokio::test]
    async fn test_media_failure_fails_recipient_without_sending() {
        let email = Arc::new(RecordingEmailChannel::new());
        let blob = Arc::new(MemoryBlobStore::new());
        blob.set_failing(true);
        let exec = executor(email.clone(), Some(blob as Arc<dyn BlobStore>));

        let mut capsule = scheduled_capsule("c1");
        capsule.media_ids = vec!["m1".to_string()];

        let report = exec.deliver(&capsule).await.unwrap();
        assert!(!report.all_sent());
        assert!(email.sent().await.is_empty());
    }

    #[tokio::test]
    async fn test_signed_urls_appear_in_rendered_mail() {
        let email = Arc::new(RecordingEmailChannel::new());
        let blob: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());
        let exec = executor(email.clone(), Some(blob));

        let mut capsule = scheduled_capsule("c1");
        capsule.media_ids = vec!["m1.jpg".to_string()];
        capsule.media_urls = vec!["https://direct.example/m2.jpg".to_string()];

        let report = exec.deliver(&capsule).await.unwrap();
        assert!(report.all_sent());

        let sent = email.sent().await;
        assert!(sent[0].1.html_body.contains("blob.test/capsule-media/m1.jpg"));
        assert!(sent[0].1.html_body.contains("https://direct.example/m2.jpg"));
    }
}
