// services/ledger_service.rs
//
// Sole writer of transaction records. A pending row is written only after
// the provider has acknowledged the push; the asynchronous callback later
// settles it to completed or failed.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::errors::{AppError, Result};
use crate::models::qr_code::QrCode;
use crate::models::transaction::{CallbackOutcome, Transaction, TransactionStatus};

/// Storage seam for the ledger. The production implementation lives in
/// `database::transactions`; tests use an in-memory store.
#[async_trait]
pub trait TransactionStore: Send + Sync {
    async fn insert(&self, transaction: &Transaction) -> Result<()>;

    async fn find_by_checkout_id(&self, checkout_request_id: &str) -> Result<Option<Transaction>>;

    /// Applies `outcome` to the row with this checkout request id if, and
    /// only if, it is still pending. One atomic update; returns the settled
    /// row, or `None` when no pending row matched.
    async fn settle_pending(
        &self,
        checkout_request_id: &str,
        outcome: &CallbackOutcome,
        updated_at: DateTime<Utc>,
    ) -> Result<Option<Transaction>>;

    async fn list_recent(
        &self,
        phone_number: Option<&str>,
        limit: i64,
    ) -> Result<Vec<Transaction>>;

    async fn find_qr_code(&self, id: &str) -> Result<Option<QrCode>>;
}

#[derive(Debug, PartialEq)]
pub enum ReconcileResult {
    /// The pending row was settled by this callback.
    Applied(Transaction),
    /// The row was already terminal; duplicate or late callback, no-op.
    AlreadySettled(TransactionStatus),
    /// The row showed up pending after the settle attempt found nothing:
    /// the callback raced the pending insert. The provider will retry.
    StillPending,
    /// No row carries this reference; logged as an anomaly.
    Unknown,
}

#[derive(Clone)]
pub struct Ledger {
    store: Arc<dyn TransactionStore>,
}

impl Ledger {
    pub fn new(store: Arc<dyn TransactionStore>) -> Self {
        Ledger { store }
    }

    /// Records an acknowledged push as pending. A failure here leaves a
    /// dangling provider-side prompt with no local record, which the caller
    /// must surface as a warning rather than roll back.
    pub async fn record_pending(
        &self,
        qr_code_id: Option<String>,
        amount: u64,
        phone_number: String,
        merchant_request_id: String,
        checkout_request_id: String,
    ) -> Result<Transaction> {
        let transaction = Transaction::pending(
            qr_code_id,
            amount,
            phone_number,
            merchant_request_id,
            checkout_request_id,
        );

        self.store
            .insert(&transaction)
            .await
            .map_err(|e| AppError::Persistence(e.to_string()))?;

        info!(
            "Recorded pending transaction {} for {}",
            transaction.id, transaction.checkout_request_id
        );
        Ok(transaction)
    }

    /// Settles a pending transaction from a provider callback. Idempotent:
    /// terminal rows are never touched again, and an unknown reference is an
    /// anomaly to log, not an error to raise.
    pub async fn reconcile(
        &self,
        checkout_request_id: &str,
        outcome: &CallbackOutcome,
    ) -> Result<ReconcileResult> {
        if let Some(settled) = self
            .store
            .settle_pending(checkout_request_id, outcome, Utc::now())
            .await?
        {
            info!(
                "Transaction {} settled as {}",
                settled.id,
                settled.status.as_str()
            );
            return Ok(ReconcileResult::Applied(settled));
        }

        match self.store.find_by_checkout_id(checkout_request_id).await? {
            Some(existing) if existing.status.is_terminal() => {
                debug!(
                    "Duplicate callback for {} ignored; already {}",
                    checkout_request_id,
                    existing.status.as_str()
                );
                Ok(ReconcileResult::AlreadySettled(existing.status))
            }
            Some(_) => {
                warn!(
                    "Callback for {} raced the pending insert; row is pending again",
                    checkout_request_id
                );
                Ok(ReconcileResult::StillPending)
            }
            None => {
                warn!(
                    "Callback for unknown checkout request id {}",
                    checkout_request_id
                );
                Ok(ReconcileResult::Unknown)
            }
        }
    }

    pub async fn find_by_checkout_id(
        &self,
        checkout_request_id: &str,
    ) -> Result<Option<Transaction>> {
        self.store.find_by_checkout_id(checkout_request_id).await
    }

    pub async fn list_recent(
        &self,
        phone_number: Option<&str>,
        limit: i64,
    ) -> Result<Vec<Transaction>> {
        self.store.list_recent(phone_number, limit).await
    }

    /// Resolves a scanned QR id to the account it pays. Read-only; the
    /// record is written by the generation flow.
    pub async fn resolve_qr_code(&self, id: &str) -> Result<QrCode> {
        self.store
            .find_qr_code(id)
            .await?
            .ok_or_else(|| AppError::QrCodeNotFound(id.to_string()))
    }
}

#[cfg(test)]
pub mod memory {
    use super::*;
    use std::collections::HashMap;
    use std::sync::RwLock;

    /// In-memory store keyed by checkout request id, mirroring the unique
    /// index the Mongo store relies on.
    #[derive(Default)]
    pub struct MemoryStore {
        transactions: RwLock<HashMap<String, Transaction>>,
        qr_codes: RwLock<HashMap<String, QrCode>>,
    }

    impl MemoryStore {
        pub fn with_qr_code(self, qr: QrCode) -> Self {
            self.qr_codes.write().unwrap().insert(qr.id.clone(), qr);
            self
        }
    }

    #[async_trait]
    impl TransactionStore for MemoryStore {
        async fn insert(&self, transaction: &Transaction) -> Result<()> {
            let mut transactions = self.transactions.write().unwrap();
            if transactions.contains_key(&transaction.checkout_request_id) {
                return Err(AppError::Persistence(format!(
                    "duplicate checkout request id {}",
                    transaction.checkout_request_id
                )));
            }
            transactions.insert(transaction.checkout_request_id.clone(), transaction.clone());
            Ok(())
        }

        async fn find_by_checkout_id(
            &self,
            checkout_request_id: &str,
        ) -> Result<Option<Transaction>> {
            Ok(self
                .transactions
                .read()
                .unwrap()
                .get(checkout_request_id)
                .cloned())
        }

        async fn settle_pending(
            &self,
            checkout_request_id: &str,
            outcome: &CallbackOutcome,
            updated_at: DateTime<Utc>,
        ) -> Result<Option<Transaction>> {
            let mut transactions = self.transactions.write().unwrap();
            match transactions.get_mut(checkout_request_id) {
                Some(tx) if tx.status == TransactionStatus::Pending => {
                    match outcome {
                        CallbackOutcome::Success { receipt_number } => {
                            tx.status = TransactionStatus::Completed;
                            tx.mpesa_receipt_number = receipt_number.clone();
                        }
                        CallbackOutcome::Failure { reason } => {
                            tx.status = TransactionStatus::Failed;
                            tx.failure_reason = Some(reason.clone());
                        }
                    }
                    tx.updated_at = updated_at;
                    Ok(Some(tx.clone()))
                }
                _ => Ok(None),
            }
        }

        async fn list_recent(
            &self,
            phone_number: Option<&str>,
            limit: i64,
        ) -> Result<Vec<Transaction>> {
            let transactions = self.transactions.read().unwrap();
            let mut rows: Vec<Transaction> = transactions
                .values()
                .filter(|tx| phone_number.map_or(true, |p| tx.phone_number == p))
                .cloned()
                .collect();
            rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            rows.truncate(limit as usize);
            Ok(rows)
        }

        async fn find_qr_code(&self, id: &str) -> Result<Option<QrCode>> {
            Ok(self.qr_codes.read().unwrap().get(id).cloned())
        }
    }
}
