//! Completion mail for the requester.

use std::sync::Arc;

use tracing::{info, warn};

use nomflow_core::{RequestStatus, UploadRequest};
use nomflow_events::topics::EMAIL_NOTIFICATION;
use nomflow_events::{Message, MessageBroker, NotificationRequest};

pub const COMPLETION_SUBJECT: &str = "OPTISAM: Nominative user upload request completed";

const COMPLETION_BODY: &str = r#"<body style="margin: 0;">
  <div style="max-width: 600px; margin: 0 auto; padding: 20px;">
    <p>Hello,</p>
    <p>Nominative user upload request completed.</p>
    <p>Thanks</p>
    <p>Bonjour,</p>
    <p>Demande de téléchargement d'utilisateur nominatif terminée.</p>
    <p>Merci</p>
  </div>
</body>"#;

/// Build the completion mail for `request`, or `None` when nobody can be addressed.
pub fn completion_notification(request: &UploadRequest) -> Option<NotificationRequest> {
    let recipient = request.created_by.as_deref().map(str::trim)?;
    if recipient.is_empty() {
        return None;
    }
    Some(NotificationRequest {
        mail_subject: COMPLETION_SUBJECT.to_string(),
        mail_message: COMPLETION_BODY.to_string(),
        mail_to: vec![recipient.to_string()],
    })
}

/// Fire-and-forget publisher of completion mails.
#[derive(Clone)]
pub struct NotificationDispatcher {
    broker: Arc<dyn MessageBroker>,
    topic: String,
}

impl NotificationDispatcher {
    pub fn new(broker: Arc<dyn MessageBroker>) -> Self {
        Self {
            broker,
            topic: EMAIL_NOTIFICATION.to_string(),
        }
    }

    /// Send the completion mail for a request that just reached `status`.
    ///
    /// Failures are logged, never returned: the status is already persisted.
    pub async fn notify_completion(&self, request: &UploadRequest, status: RequestStatus) {
        let Some(notification) = completion_notification(request) else {
            warn!(
                upload_id = %request.upload_id,
                request_id = %request.request_id,
                "completed request has no created_by; notification skipped"
            );
            return;
        };

        let message = match Message::json(&notification) {
            Ok(m) => m,
            Err(e) => {
                warn!(upload_id = %request.upload_id, error = %e, "failed to encode notification");
                return;
            }
        };

        match self.broker.publish(&self.topic, message).await {
            Ok(()) => info!(
                upload_id = %request.upload_id,
                status = %status,
                "completion notification sent"
            ),
            Err(e) => warn!(
                upload_id = %request.upload_id,
                error = %e,
                "failed to send completion notification"
            ),
        }
    }
}
