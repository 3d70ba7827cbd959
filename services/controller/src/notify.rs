//! Placement notifications.
//!
//! Delivery is fire-and-forget: failures are logged and never reach the
//! reconciliation that raised them.

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

/// Annotation on a SelectiveDeployment naming who to notify.
pub const CONTACT_ANNOTATION: &str = "edgeplane.io/contact";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum NotificationKind {
    /// Some controllers could not be pinned or some clauses are invalid.
    PlacementPartial,
    /// No controller could be pinned.
    PlacementFailed,
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::PlacementPartial => "placement-partial",
            Self::PlacementFailed => "placement-failed",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Recipient {
    pub namespace: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact: Option<String>,
}

pub trait Notifier: Send + Sync {
    fn notify(&self, kind: NotificationKind, recipient: &Recipient);
}

/// Writes notifications to the log only.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, kind: NotificationKind, recipient: &Recipient) {
        info!(
            kind = %kind,
            namespace = %recipient.namespace,
            name = %recipient.name,
            contact = ?recipient.contact,
            "Placement notification"
        );
    }
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    kind: NotificationKind,
    #[serde(flatten)]
    recipient: &'a Recipient,
}

/// POSTs each notification as JSON to a webhook from a background task.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

impl Notifier for WebhookNotifier {
    fn notify(&self, kind: NotificationKind, recipient: &Recipient) {
        let request = self
            .client
            .post(&self.url)
            .json(&WebhookPayload { kind, recipient });
        let name = format!("{}/{}", recipient.namespace, recipient.name);

        tokio::spawn(async move {
            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    info!(kind = %kind, sd = %name, "Notification delivered");
                }
                Ok(response) => {
                    warn!(
                        kind = %kind,
                        sd = %name,
                        status = %response.status(),
                        "Notification rejected"
                    );
                }
                Err(e) => {
                    warn!(kind = %kind, sd = %name, error = %e, "Notification failed");
                }
            }
        });
    }
}
