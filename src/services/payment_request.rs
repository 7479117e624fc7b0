// services/payment_request.rs
//
// Validates and normalizes a raw payment request before anything touches the
// network. Rejections here are the only cancellable point of the flow.
use serde::Deserialize;

use crate::errors::{AppError, Result};

/// Amount as it arrives over the wire: the mobile client sends a string,
/// other callers send a JSON number.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawAmount {
    Number(f64),
    Text(String),
}

/// A validated, normalized push request, ready for signing and submission.
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentRequest {
    pub phone_number: String,
    pub amount: u64,
    pub account_reference: String,
    pub transaction_desc: String,
    pub qr_code_id: Option<String>,
}

impl PaymentRequest {
    pub fn build(
        phone: &str,
        amount: &RawAmount,
        account_reference: &str,
        transaction_desc: &str,
        qr_code_id: Option<String>,
    ) -> Result<Self> {
        Ok(PaymentRequest {
            phone_number: normalize_phone(phone)?,
            amount: parse_amount(amount)?,
            account_reference: account_reference.to_string(),
            transaction_desc: transaction_desc.to_string(),
            qr_code_id,
        })
    }
}

/// Normalizes a subscriber number to `254XXXXXXXXX` form:
/// leading `0` becomes `254`, a leading `+` is stripped, a bare 9-digit
/// subscriber number gets the country code prefixed. The result must be
/// 12 digits on the 7 or 1 network prefix; anything else is rejected.
pub fn normalize_phone(input: &str) -> Result<String> {
    let trimmed = input.trim();
    let digits = trimmed.strip_prefix('+').unwrap_or(trimmed);

    let normalized = if let Some(rest) = digits.strip_prefix('0') {
        format!("254{}", rest)
    } else if digits.starts_with("254") {
        digits.to_string()
    } else if digits.len() == 9 && digits.chars().all(|c| c.is_ascii_digit()) {
        format!("254{}", digits)
    } else {
        digits.to_string()
    };

    let valid = normalized.len() == 12
        && normalized.starts_with("254")
        && matches!(normalized.as_bytes()[3], b'7' | b'1')
        && normalized.chars().all(|c| c.is_ascii_digit());

    if !valid {
        return Err(AppError::validation(format!(
            "phone number {:?} is not a valid Kenyan subscriber number",
            input
        )));
    }

    Ok(normalized)
}

/// Parses and validates the amount. The provider only accepts whole
/// shillings, so fractional amounts are floored, not rounded.
pub fn parse_amount(raw: &RawAmount) -> Result<u64> {
    let value = match raw {
        RawAmount::Number(n) => *n,
        RawAmount::Text(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| AppError::validation(format!("amount {:?} is not a number", s)))?,
    };

    if !value.is_finite() || value <= 0.0 {
        return Err(AppError::validation("amount must be greater than 0"));
    }

    let floored = value.floor() as u64;
    if floored == 0 {
        return Err(AppError::validation("amount must be at least 1"));
    }

    Ok(floored)
}
