// handlers/payment_handlers.rs
use axum::{
    body::Bytes,
    extract::{Json, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use tracing::{error, info, warn};

use crate::errors::{AppError, AppJson, Result};
use crate::models::transaction::CallbackEnvelope;
use crate::services::ledger_service::ReconcileResult;
use crate::services::payment_request::{PaymentRequest, RawAmount};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentPushRequest {
    pub phone_or_paybill: Option<String>,
    pub amount: RawAmount,
    pub qr_code_id: Option<String>,
    pub account_reference: Option<String>,
    pub transaction_desc: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    pub checkout_request_id: String,
}

#[derive(Debug, Deserialize)]
pub struct TransactionsQuery {
    pub phone_number: Option<String>,
    pub limit: Option<i64>,
}

/// POST /api/payment-push
///
/// Validates, signs and submits one push, then records it as pending. The
/// pending row is written only after the provider's synchronous ack; if that
/// write fails the push has already reached the payer's phone, so the caller
/// still gets a success response carrying an explicit warning.
pub async fn initiate_payment_push(
    State(state): State<AppState>,
    AppJson(body): AppJson<PaymentPushRequest>,
) -> Result<impl IntoResponse> {
    let target = match (&body.phone_or_paybill, &body.qr_code_id) {
        (Some(phone), _) => phone.clone(),
        (None, Some(qr_id)) => state.ledger.resolve_qr_code(qr_id).await?.account_number,
        (None, None) => {
            return Err(AppError::validation(
                "either phoneOrPaybill or qrCodeId is required",
            ))
        }
    };

    let request = PaymentRequest::build(
        &target,
        &body.amount,
        body.account_reference
            .as_deref()
            .unwrap_or(&state.config.account_reference),
        body.transaction_desc
            .as_deref()
            .unwrap_or(&state.config.transaction_desc),
        body.qr_code_id,
    )?;

    let ack = state.mpesa.initiate_stk_push(&request).await?;

    let recorded = state
        .ledger
        .record_pending(
            request.qr_code_id.clone(),
            request.amount,
            request.phone_number.clone(),
            ack.merchant_request_id.clone(),
            ack.checkout_request_id.clone(),
        )
        .await;

    let response = match recorded {
        Ok(transaction) => serde_json::json!({
            "success": true,
            "data": {
                "merchant_request_id": ack.merchant_request_id,
                "checkout_request_id": ack.checkout_request_id,
                "customer_message": ack.customer_message,
                "transaction_id": transaction.id,
            },
        }),
        Err(e) => {
            // The prompt is already on the payer's phone; there is nothing
            // to roll back. Flag the bookkeeping gap for manual follow-up.
            error!(
                "Push {} acknowledged but the pending record failed: {}",
                ack.checkout_request_id, e
            );
            serde_json::json!({
                "success": true,
                "data": {
                    "merchant_request_id": ack.merchant_request_id,
                    "checkout_request_id": ack.checkout_request_id,
                    "customer_message": ack.customer_message,
                },
                "warning": "payment prompt sent but the transaction could not be recorded",
            })
        }
    };

    Ok(Json(response))
}

/// POST /api/payment-callback
///
/// The provider retries on any non-2xx, so this always answers 200 with a
/// minimal ack; reconciliation problems are logged, never returned. The body
/// is taken raw so a malformed payload cannot fail in the extractor and
/// bounce before the handler runs.
pub async fn payment_callback(
    State(state): State<AppState>,
    body: Bytes,
) -> impl IntoResponse {
    match serde_json::from_slice::<CallbackEnvelope>(&body) {
        Ok(envelope) => {
            let callback = envelope.body.stk_callback;
            info!(
                "Callback for {}: result code {}",
                callback.checkout_request_id, callback.result_code
            );

            match state
                .ledger
                .reconcile(&callback.checkout_request_id, &callback.outcome())
                .await
            {
                Ok(ReconcileResult::Applied(_)) | Ok(ReconcileResult::AlreadySettled(_)) => {}
                Ok(ReconcileResult::StillPending) => {
                    warn!(
                        "Callback for {} raced the pending insert; row left pending",
                        callback.checkout_request_id
                    );
                }
                Ok(ReconcileResult::Unknown) => {
                    warn!(
                        "Callback for unknown reference {} ignored",
                        callback.checkout_request_id
                    );
                }
                Err(e) => {
                    error!(
                        "Reconciliation of {} failed: {}",
                        callback.checkout_request_id, e
                    );
                }
            }
        }
        Err(e) => {
            warn!("Malformed provider callback ignored: {}", e);
        }
    }

    Json(serde_json::json!({
        "ResultCode": 0,
        "ResultDesc": "Success"
    }))
}

/// GET /api/payment-status?checkout_request_id=...
pub async fn check_payment_status(
    State(state): State<AppState>,
    Query(query): Query<StatusQuery>,
) -> Result<impl IntoResponse> {
    match state
        .ledger
        .find_by_checkout_id(&query.checkout_request_id)
        .await?
    {
        Some(transaction) => Ok((
            StatusCode::OK,
            Json(serde_json::json!({
                "success": true,
                "data": {
                    "transaction_id": transaction.id,
                    "status": transaction.status.as_str(),
                    "amount": transaction.amount,
                    "phone_number": transaction.phone_number,
                    "mpesa_receipt_number": transaction.mpesa_receipt_number,
                    "failure_reason": transaction.failure_reason,
                    "updated_at": transaction.updated_at.to_rfc3339(),
                },
            })),
        )),
        None => Ok((
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({
                "success": false,
                "message": format!("no transaction for {}", query.checkout_request_id),
            })),
        )),
    }
}

/// GET /api/transactions?phone_number=&limit=
pub async fn list_transactions(
    State(state): State<AppState>,
    Query(query): Query<TransactionsQuery>,
) -> Result<impl IntoResponse> {
    let limit = query.limit.unwrap_or(50).clamp(1, 200);
    let transactions = state
        .ledger
        .list_recent(query.phone_number.as_deref(), limit)
        .await?;

    let rows: Vec<serde_json::Value> = transactions
        .iter()
        .map(|tx| {
            serde_json::json!({
                "transaction_id": tx.id,
                "qr_code_id": tx.qr_code_id,
                "amount": tx.amount,
                "phone_number": tx.phone_number,
                "mpesa_receipt_number": tx.mpesa_receipt_number,
                "status": tx.status.as_str(),
                "failure_reason": tx.failure_reason,
                "created_at": tx.created_at.to_rfc3339(),
                "updated_at": tx.updated_at.to_rfc3339(),
            })
        })
        .collect();

    Ok(Json(serde_json::json!({
        "success": true,
        "count": rows.len(),
        "transactions": rows,
    })))
}
