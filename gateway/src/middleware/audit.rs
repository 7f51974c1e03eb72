use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::errors::AppError;
use crate::models::audit::{AuditLogEntry, UsageLogEntry};
use crate::store::CredentialStore;

/// Fire-and-forget usage log writer. Fires off a Tokio task so the response
/// never waits on the insert; failures are logged and dropped.
#[derive(Clone)]
pub struct UsageRecorder {
    store: Arc<dyn CredentialStore>,
}

impl UsageRecorder {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self { store }
    }

    /// The handle is only awaited by tests.
    pub fn record(&self, entry: UsageLogEntry) -> JoinHandle<()> {
        let store = self.store.clone();
        tokio::spawn(async move {
            if let Err(e) = store.append_usage_log(&entry).await {
                tracing::error!(
                    correlation_id = %entry.correlation_id,
                    "failed to write usage log: {}",
                    e
                );
            } else {
                tracing::debug!(correlation_id = %entry.correlation_id, "usage log recorded");
            }
        })
    }
}

/// Admin mutation trail. Written inline: a mutation whose audit row cannot be
/// stored is reported as failed.
#[derive(Clone)]
pub struct AuditRecorder {
    store: Arc<dyn CredentialStore>,
}

impl AuditRecorder {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self { store }
    }

    pub async fn record(&self, entry: &AuditLogEntry) -> Result<(), AppError> {
        self.store.append_audit_log(entry).await.map_err(|e| {
            tracing::error!(
                action = entry.action.as_str(),
                resource_id = %entry.resource_id,
                "failed to write audit log: {}",
                e
            );
            AppError::from(e)
        })
    }
}
