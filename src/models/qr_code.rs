use chrono::{DateTime, Utc};
use mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime;
use serde::{Deserialize, Serialize};

/// Mapping from a scanned QR id to the account it pays. Written by the
/// generation flow; this service only ever reads it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QrCode {
    #[serde(rename = "_id")]
    pub id: String,
    pub account_number: String,
    pub user_id: Option<String>,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub created_at: DateTime<Utc>,
}
