use chrono::{DateTime, Utc};
use mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Durable record of one push attempt. One row per submission; re-paying the
/// same QR code creates a new row, never an update of an earlier one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Transaction {
    #[serde(rename = "_id")]
    pub id: Uuid,
    pub qr_code_id: Option<String>,
    pub amount: u64,
    pub phone_number: String,
    pub mpesa_receipt_number: Option<String>,
    pub merchant_request_id: String,
    pub checkout_request_id: String,
    pub status: TransactionStatus,
    pub failure_reason: Option<String>,
    // Stored as real BSON datetimes so index sorts are chronological.
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Completed => "completed",
            TransactionStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransactionStatus::Pending)
    }
}

impl Transaction {
    pub fn pending(
        qr_code_id: Option<String>,
        amount: u64,
        phone_number: String,
        merchant_request_id: String,
        checkout_request_id: String,
    ) -> Self {
        let now = Utc::now();
        Transaction {
            id: Uuid::new_v4(),
            qr_code_id,
            amount,
            phone_number,
            mpesa_receipt_number: None,
            merchant_request_id,
            checkout_request_id,
            status: TransactionStatus::Pending,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }
}

// Asynchronous result notification, as posted by the provider.
#[derive(Debug, Deserialize)]
pub struct CallbackEnvelope {
    #[serde(rename = "Body")]
    pub body: CallbackBody,
}

#[derive(Debug, Deserialize)]
pub struct CallbackBody {
    #[serde(rename = "stkCallback")]
    pub stk_callback: StkCallback,
}

#[derive(Debug, Deserialize)]
pub struct StkCallback {
    #[serde(rename = "MerchantRequestID")]
    pub merchant_request_id: String,

    #[serde(rename = "CheckoutRequestID")]
    pub checkout_request_id: String,

    #[serde(rename = "ResultCode")]
    pub result_code: i32,

    #[serde(rename = "ResultDesc")]
    pub result_desc: String,

    #[serde(rename = "CallbackMetadata", default)]
    pub callback_metadata: Option<CallbackMetadata>,
}

#[derive(Debug, Deserialize)]
pub struct CallbackMetadata {
    #[serde(rename = "Item")]
    pub items: Vec<CallbackItem>,
}

#[derive(Debug, Deserialize)]
pub struct CallbackItem {
    #[serde(rename = "Name")]
    pub name: String,

    #[serde(rename = "Value", default)]
    pub value: serde_json::Value,
}

/// What a callback means for the ledger, independent of the wire shape.
#[derive(Debug, Clone, PartialEq)]
pub enum CallbackOutcome {
    Success { receipt_number: Option<String> },
    Failure { reason: String },
}

impl StkCallback {
    fn metadata_string(&self, name: &str) -> Option<String> {
        let metadata = self.callback_metadata.as_ref()?;
        metadata
            .items
            .iter()
            .find(|item| item.name == name)
            .map(|item| match &item.value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            })
    }

    pub fn outcome(&self) -> CallbackOutcome {
        if self.result_code == 0 {
            CallbackOutcome::Success {
                receipt_number: self.metadata_string("MpesaReceiptNumber"),
            }
        } else {
            CallbackOutcome::Failure {
                reason: self.result_desc.clone(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_success_callback_and_extracts_receipt() {
        let payload = json!({
            "Body": {
                "stkCallback": {
                    "MerchantRequestID": "29115-34620561-1",
                    "CheckoutRequestID": "ws_CO_191220191020363925",
                    "ResultCode": 0,
                    "ResultDesc": "The service request is processed successfully.",
                    "CallbackMetadata": {
                        "Item": [
                            { "Name": "Amount", "Value": 50.0 },
                            { "Name": "MpesaReceiptNumber", "Value": "NLJ7RT61SV" },
                            { "Name": "TransactionDate", "Value": 20191219102115u64 },
                            { "Name": "PhoneNumber", "Value": 254712345678u64 }
                        ]
                    }
                }
            }
        });

        let envelope: CallbackEnvelope = serde_json::from_value(payload).unwrap();
        let callback = envelope.body.stk_callback;
        assert_eq!(callback.checkout_request_id, "ws_CO_191220191020363925");
        assert_eq!(
            callback.outcome(),
            CallbackOutcome::Success {
                receipt_number: Some("NLJ7RT61SV".to_string())
            }
        );
    }

    #[test]
    fn parses_failure_callback_without_metadata() {
        let payload = json!({
            "Body": {
                "stkCallback": {
                    "MerchantRequestID": "29115-34620561-1",
                    "CheckoutRequestID": "ws_CO_191220191020363925",
                    "ResultCode": 1032,
                    "ResultDesc": "Request cancelled by user"
                }
            }
        });

        let envelope: CallbackEnvelope = serde_json::from_value(payload).unwrap();
        assert_eq!(
            envelope.body.stk_callback.outcome(),
            CallbackOutcome::Failure {
                reason: "Request cancelled by user".to_string()
            }
        );
    }

    #[test]
    fn timestamps_serialize_as_bson_datetimes() {
        let tx = Transaction::pending(
            None,
            50,
            "254712345678".into(),
            "29115-34620561-1".into(),
            "ws_CO_123".into(),
        );
        let doc = mongodb::bson::to_document(&tx).unwrap();
        assert!(matches!(
            doc.get("created_at"),
            Some(mongodb::bson::Bson::DateTime(_))
        ));
        assert!(matches!(
            doc.get("updated_at"),
            Some(mongodb::bson::Bson::DateTime(_))
        ));
    }

    #[test]
    fn pending_constructor_starts_in_pending() {
        let tx = Transaction::pending(
            Some("qr-1".into()),
            50,
            "254712345678".into(),
            "29115-34620561-1".into(),
            "ws_CO_123".into(),
        );
        assert_eq!(tx.status, TransactionStatus::Pending);
        assert!(tx.mpesa_receipt_number.is_none());
        assert!(!tx.status.is_terminal());
        assert!(TransactionStatus::Completed.is_terminal());
        assert!(TransactionStatus::Failed.is_terminal());
    }
}
