// Outbox mailer
//
// Each message is written as one JSON envelope into an outbox directory,
// where the site's mail relay picks it up. Envelopes are published with an
// atomic rename so the relay never reads a partial file.

use crate::errors::ExecutionError;
use crate::executor::Mailer;
use crate::models::MailMessage;
use crate::storage::write_atomic;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{info, instrument};
use uuid::Uuid;

/// On-disk envelope format consumed by the relay
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEnvelope {
    pub message_id: String,
    pub from: String,
    pub queued_at: DateTime<Utc>,
    #[serde(flatten)]
    pub message: MailMessage,
}

pub struct OutboxMailer {
    outbox_dir: PathBuf,
    from_address: String,
}

impl OutboxMailer {
    pub fn new(outbox_dir: impl Into<PathBuf>, from_address: impl Into<String>) -> Self {
        Self {
            outbox_dir: outbox_dir.into(),
            from_address: from_address.into(),
        }
    }

    pub fn outbox_dir(&self) -> &PathBuf {
        &self.outbox_dir
    }
}

#[async_trait]
impl Mailer for OutboxMailer {
    #[instrument(skip(self, message), fields(recipients = message.to.len(), subject = %message.subject))]
    async fn send(&self, message: &MailMessage) -> Result<(), ExecutionError> {
        if message.to.is_empty() {
            return Err(ExecutionError::MailFailed(
                "message has no recipients".to_string(),
            ));
        }

        let envelope = OutboxEnvelope {
            message_id: Uuid::new_v4().to_string(),
            from: self.from_address.clone(),
            queued_at: Utc::now(),
            message: message.clone(),
        };
        let json = serde_json::to_vec_pretty(&envelope)
            .map_err(|e| ExecutionError::MailFailed(format!("Failed to encode message: {}", e)))?;

        let path = self
            .outbox_dir
            .join(format!("{}.json", envelope.message_id));
        let target = path.clone();
        tokio::task::spawn_blocking(move || write_atomic(&target, &json))
            .await
            .map_err(|e| ExecutionError::MailFailed(format!("outbox writer failed: {}", e)))?
            .map_err(|e| {
                ExecutionError::MailFailed(format!(
                    "Failed to queue message in {}: {}",
                    path.display(),
                    e
                ))
            })?;

        info!(message_id = %envelope.message_id, "Report mail queued");
        Ok(())
    }
}
