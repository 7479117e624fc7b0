// database/transactions.rs
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::TryStreamExt;
use mongodb::{
    bson::{doc, DateTime as BsonDateTime, Document},
    options::{IndexOptions, ReturnDocument},
    Collection, Database, IndexModel,
};

use crate::errors::Result;
use crate::models::qr_code::QrCode;
use crate::models::transaction::{CallbackOutcome, Transaction, TransactionStatus};
use crate::services::ledger_service::TransactionStore;

const TRANSACTIONS: &str = "transactions";
const QR_CODES: &str = "qr_codes";

#[derive(Clone)]
pub struct MongoTransactionStore {
    db: Database,
}

impl MongoTransactionStore {
    pub fn new(db: Database) -> Self {
        MongoTransactionStore { db }
    }

    fn transactions(&self) -> Collection<Transaction> {
        self.db.collection(TRANSACTIONS)
    }

    fn qr_codes(&self) -> Collection<QrCode> {
        self.db.collection(QR_CODES)
    }

    /// The checkout request id is the reconciliation key; a unique index
    /// keeps one row per push attempt and makes `settle_pending` atomic.
    pub async fn ensure_indexes(&self) -> Result<()> {
        let model = IndexModel::builder()
            .keys(doc! { "checkout_request_id": 1 })
            .options(IndexOptions::builder().unique(true).build())
            .build();
        self.transactions().create_index(model).await?;
        Ok(())
    }
}

fn settlement_update(outcome: &CallbackOutcome, updated_at: DateTime<Utc>) -> Document {
    let mut set = doc! {
        "updated_at": BsonDateTime::from_chrono(updated_at),
    };
    match outcome {
        CallbackOutcome::Success { receipt_number } => {
            set.insert("status", TransactionStatus::Completed.as_str());
            if let Some(receipt) = receipt_number {
                set.insert("mpesa_receipt_number", receipt.as_str());
            }
        }
        CallbackOutcome::Failure { reason } => {
            set.insert("status", TransactionStatus::Failed.as_str());
            set.insert("failure_reason", reason.as_str());
        }
    }
    doc! { "$set": set }
}

#[async_trait]
impl TransactionStore for MongoTransactionStore {
    async fn insert(&self, transaction: &Transaction) -> Result<()> {
        self.transactions().insert_one(transaction).await?;
        Ok(())
    }

    async fn find_by_checkout_id(&self, checkout_request_id: &str) -> Result<Option<Transaction>> {
        let found = self
            .transactions()
            .find_one(doc! { "checkout_request_id": checkout_request_id })
            .await?;
        Ok(found)
    }

    async fn settle_pending(
        &self,
        checkout_request_id: &str,
        outcome: &CallbackOutcome,
        updated_at: DateTime<Utc>,
    ) -> Result<Option<Transaction>> {
        let filter = doc! {
            "checkout_request_id": checkout_request_id,
            "status": TransactionStatus::Pending.as_str(),
        };
        let settled = self
            .transactions()
            .find_one_and_update(filter, settlement_update(outcome, updated_at))
            .return_document(ReturnDocument::After)
            .await?;
        Ok(settled)
    }

    async fn list_recent(
        &self,
        phone_number: Option<&str>,
        limit: i64,
    ) -> Result<Vec<Transaction>> {
        let filter = match phone_number {
            Some(phone) => doc! { "phone_number": phone },
            None => doc! {},
        };
        let cursor = self
            .transactions()
            .find(filter)
            .sort(doc! { "created_at": -1 })
            .limit(limit)
            .await?;
        let rows = cursor.try_collect().await?;
        Ok(rows)
    }

    async fn find_qr_code(&self, id: &str) -> Result<Option<QrCode>> {
        let found = self.qr_codes().find_one(doc! { "_id": id }).await?;
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settlement_update_sets_receipt_on_success() {
        let update = settlement_update(
            &CallbackOutcome::Success {
                receipt_number: Some("ABC123".into()),
            },
            Utc::now(),
        );
        let set = update.get_document("$set").unwrap();
        assert_eq!(set.get_str("status").unwrap(), "completed");
        assert_eq!(set.get_str("mpesa_receipt_number").unwrap(), "ABC123");
        assert!(set.get_datetime("updated_at").is_ok());
    }

    #[test]
    fn settlement_update_sets_reason_on_failure() {
        let update = settlement_update(
            &CallbackOutcome::Failure {
                reason: "Request cancelled by user".into(),
            },
            Utc::now(),
        );
        let set = update.get_document("$set").unwrap();
        assert_eq!(set.get_str("status").unwrap(), "failed");
        assert_eq!(
            set.get_str("failure_reason").unwrap(),
            "Request cancelled by user"
        );
        assert!(set.get_str("mpesa_receipt_number").is_err());
    }
}
