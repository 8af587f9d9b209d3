//! Audit log sink. Every change to an externally-visible record, every
//! suppressed duplicate, and every rollback deletion lands here.

use std::sync::Arc;

use tastebase_shared::{AuditEntry, Result, TastebaseError};
use tastebase_storage::Storage;
use tracing::debug;

/// Largest batch accepted by [`AuditLog::log_batch`].
pub const MAX_AUDIT_BATCH: usize = 100;

/// Reject entries that would be useless or misleading in the log.
pub fn validate_entry(entry: &AuditEntry) -> Result<()> {
    if entry.table.trim().is_empty() {
        return Err(TastebaseError::validation("audit entry is missing a table"));
    }
    if entry.source.trim().is_empty() {
        return Err(TastebaseError::validation("audit entry is missing a source"));
    }
    if let Some(confidence) = entry.confidence {
        if !(0.0..=1.0).contains(&confidence) {
            return Err(TastebaseError::validation(format!(
                "audit confidence {confidence} is outside [0, 1]"
            )));
        }
    }
    Ok(())
}

#[derive(Clone)]
pub struct AuditLog {
    storage: Arc<Storage>,
}

impl AuditLog {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    pub async fn log_change(&self, entry: AuditEntry) -> Result<()> {
        self.log_batch(std::slice::from_ref(&entry)).await
    }

    /// Validate every entry, then write them all in one transaction.
    pub async fn log_batch(&self, entries: &[AuditEntry]) -> Result<()> {
        if entries.len() > MAX_AUDIT_BATCH {
            return Err(TastebaseError::validation(format!(
                "audit batch of {} exceeds the limit of {MAX_AUDIT_BATCH}",
                entries.len()
            )));
        }
        for entry in entries {
            validate_entry(entry)?;
        }
        self.storage.insert_audit_entries(entries).await?;
        debug!(count = entries.len(), "audit entries written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tastebase_shared::{ChangeType, new_record_id};

    async fn audit() -> (Arc<Storage>, AuditLog) {
        let tmp = std::env::temp_dir().join(format!("tb_audit_{}.db", new_record_id()));
        let storage = Arc::new(Storage::open(&tmp).await.unwrap());
        (storage.clone(), AuditLog::new(storage))
    }

    #[test]
    fn malformed_entries_rejected() {
        assert!(validate_entry(&AuditEntry::new("", ChangeType::Insert, "cli")).is_err());
        assert!(validate_entry(&AuditEntry::new("chefs", ChangeType::Insert, " ")).is_err());
        let bad = AuditEntry::new("chefs", ChangeType::DuplicateSuppressed, "cli").confidence(1.2);
        assert!(validate_entry(&bad).is_err());
        let good = AuditEntry::new("chefs", ChangeType::DuplicateSuppressed, "cli").confidence(0.9);
        assert!(validate_entry(&good).is_ok());
    }

    #[tokio::test]
    async fn invalid_entry_blocks_whole_batch() {
        let (storage, audit) = audit().await;
        let batch = vec![
            AuditEntry::new("chefs", ChangeType::Insert, "test").record("c1"),
            AuditEntry::new("chefs", ChangeType::Insert, "").record("c1"),
        ];
        assert!(audit.log_batch(&batch).await.is_err());
        assert!(storage.list_audit_entries("chefs", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn oversized_batch_rejected() {
        let (_, audit) = audit().await;
        let batch: Vec<_> = (0..=MAX_AUDIT_BATCH)
            .map(|i| AuditEntry::new("chefs", ChangeType::Insert, "test").record(i.to_string()))
            .collect();
        let err = audit.log_batch(&batch).await.unwrap_err();
        assert_eq!(err.code(), "validation");
    }

    #[tokio::test]
    async fn log_change_persists() {
        let (storage, audit) = audit().await;
        audit
            .log_change(AuditEntry::new("restaurants", ChangeType::Update, "test").record("r1"))
            .await
            .unwrap();
        assert_eq!(storage.list_audit_entries("restaurants", Some("r1")).await.unwrap().len(), 1);
    }
}
