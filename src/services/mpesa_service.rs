// services/mpesa_service.rs
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as base64, Engine as _};
use chrono::{DateTime, Utc};
use reqwest::{header, Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{error, info};

use crate::config::AppConfig;
use crate::errors::{AppError, Result};
use crate::services::payment_request::PaymentRequest;

/// Timestamp format the provider expects in both the request body and the
/// signed password. One value is generated per attempt and used for both.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";

/// Tokens are reused while at least this much of their lifetime remains.
const TOKEN_REFRESH_MARGIN_SECS: i64 = 60;

#[derive(Debug, Deserialize)]
pub struct AuthResponse {
    pub access_token: String,
    pub expires_in: String,
}

#[derive(Debug, Serialize)]
pub struct StkPushRequest {
    #[serde(rename = "BusinessShortCode")]
    pub business_short_code: String,
    #[serde(rename = "Password")]
    pub password: String,
    #[serde(rename = "Timestamp")]
    pub timestamp: String,
    #[serde(rename = "TransactionType")]
    pub transaction_type: String,
    #[serde(rename = "Amount")]
    pub amount: u64,
    #[serde(rename = "PartyA")]
    pub party_a: String,
    #[serde(rename = "PartyB")]
    pub party_b: String,
    #[serde(rename = "PhoneNumber")]
    pub phone_number: String,
    #[serde(rename = "CallBackURL")]
    pub callback_url: String,
    #[serde(rename = "AccountReference")]
    pub account_reference: String,
    #[serde(rename = "TransactionDesc")]
    pub transaction_desc: String,
}

#[derive(Debug, Deserialize)]
pub struct StkPushResponse {
    #[serde(rename = "MerchantRequestID")]
    pub merchant_request_id: String,
    #[serde(rename = "CheckoutRequestID")]
    pub checkout_request_id: String,
    #[serde(rename = "ResponseCode")]
    pub response_code: String,
    #[serde(rename = "ResponseDescription")]
    pub response_description: String,
    #[serde(rename = "CustomerMessage")]
    pub customer_message: String,
}

#[derive(Debug, Deserialize)]
struct ProviderErrorBody {
    #[serde(rename = "errorMessage")]
    error_message: Option<String>,
}

/// Synchronous acknowledgement of a queued push. The checkout request id is
/// only a correlating reference; the payment result arrives later on the
/// callback endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct StkPushAck {
    pub merchant_request_id: String,
    pub checkout_request_id: String,
    pub response_description: String,
    pub customer_message: String,
}

/// Derives the time-bound request password: base64 of
/// `shortCode + passkey + timestamp`. Pure; the caller supplies the one
/// timestamp that also goes into the request body.
pub fn derive_password(short_code: &str, passkey: &str, timestamp: &str) -> String {
    base64.encode(format!("{}{}{}", short_code, passkey, timestamp))
}

/// Client-credentials exchange with the provider. Trait so tests can drive
/// the token cache without network calls.
#[async_trait]
pub trait TokenFetcher: Send + Sync {
    async fn fetch(&self) -> Result<AuthResponse>;
}

pub struct HttpTokenFetcher {
    client: Client,
    auth_url: String,
    consumer_key: String,
    consumer_secret: String,
}

#[async_trait]
impl TokenFetcher for HttpTokenFetcher {
    async fn fetch(&self) -> Result<AuthResponse> {
        let credentials = base64.encode(format!("{}:{}", self.consumer_key, self.consumer_secret));

        let response = self
            .client
            .get(&self.auth_url)
            .header(header::AUTHORIZATION, format!("Basic {}", credentials))
            .send()
            .await
            .map_err(|e| AppError::Auth(format!("credential exchange failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!("M-Pesa auth failed: {} - {}", status, body);
            return Err(AppError::Auth(format!(
                "credential exchange returned {}",
                status
            )));
        }

        response
            .json::<AuthResponse>()
            .await
            .map_err(|_| AppError::Auth("no access token in provider response".to_string()))
    }
}

/// Owns the cached access token. Concurrent readers may reuse a
/// stale-but-valid token; concurrent refreshes harmlessly overwrite each
/// other.
pub struct TokenProvider {
    fetcher: Arc<dyn TokenFetcher>,
    cached: Arc<RwLock<Option<(String, DateTime<Utc>)>>>,
}

impl TokenProvider {
    pub fn new(fetcher: Arc<dyn TokenFetcher>) -> Self {
        TokenProvider {
            fetcher,
            cached: Arc::new(RwLock::new(None)),
        }
    }

    pub async fn access_token(&self) -> Result<String> {
        {
            let cached = self.cached.read().unwrap();
            if let Some((token, expiry)) = cached.as_ref() {
                if *expiry > Utc::now() + chrono::Duration::seconds(TOKEN_REFRESH_MARGIN_SECS) {
                    return Ok(token.clone());
                }
            }
        }

        info!("Requesting new M-Pesa access token");
        let auth = self.fetcher.fetch().await?;
        let ttl_secs = auth.expires_in.parse::<i64>().unwrap_or(3599);
        let expiry = Utc::now() + chrono::Duration::seconds(ttl_secs);

        let mut cached = self.cached.write().unwrap();
        *cached = Some((auth.access_token.clone(), expiry));
        Ok(auth.access_token)
    }

    /// Drops the cached token so the next call re-fetches. Called when the
    /// provider reports an authorization failure against a cached token.
    pub fn invalidate(&self) {
        let mut cached = self.cached.write().unwrap();
        *cached = None;
    }
}

pub struct MpesaService {
    config: AppConfig,
    client: Client,
    tokens: TokenProvider,
}

impl MpesaService {
    pub fn new(config: AppConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to create HTTP client");

        let fetcher = HttpTokenFetcher {
            client: client.clone(),
            auth_url: config.mpesa_auth_url(),
            consumer_key: config.mpesa_consumer_key.clone(),
            consumer_secret: config.mpesa_consumer_secret.clone(),
        };

        MpesaService {
            config,
            client,
            tokens: TokenProvider::new(Arc::new(fetcher)),
        }
    }

    pub async fn access_token(&self) -> Result<String> {
        self.tokens.access_token().await
    }

    /// Submits one signed STK push and interprets the synchronous ack.
    /// Never retried: the push prompts the payer's phone, and a blind retry
    /// would duplicate the prompt.
    pub async fn initiate_stk_push(&self, request: &PaymentRequest) -> Result<StkPushAck> {
        info!(
            "STK push for {} - KSh {}",
            request.phone_number, request.amount
        );

        let access_token = self.tokens.access_token().await?;
        let timestamp = Utc::now().format(TIMESTAMP_FORMAT).to_string();
        let password = derive_password(
            &self.config.mpesa_short_code,
            &self.config.mpesa_passkey,
            &timestamp,
        );

        let envelope = StkPushRequest {
            business_short_code: self.config.mpesa_short_code.clone(),
            password,
            timestamp,
            transaction_type: "CustomerPayBillOnline".to_string(),
            amount: request.amount,
            party_a: request.phone_number.clone(),
            party_b: self.config.mpesa_short_code.clone(),
            phone_number: request.phone_number.clone(),
            callback_url: self.config.mpesa_callback_url.clone(),
            account_reference: request.account_reference.clone(),
            transaction_desc: request.transaction_desc.clone(),
        };

        let response = self
            .client
            .post(self.config.mpesa_stk_url())
            .header(header::AUTHORIZATION, format!("Bearer {}", access_token))
            .header(header::CONTENT_TYPE, "application/json")
            .json(&envelope)
            .send()
            .await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            self.tokens.invalidate();
            error!("STK push rejected: access token no longer valid");
            return Err(AppError::Auth(
                "provider rejected the access token".to_string(),
            ));
        }

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!("STK push failed: {} - {}", status, body);
            let message = serde_json::from_str::<ProviderErrorBody>(&body)
                .ok()
                .and_then(|b| b.error_message)
                .unwrap_or_else(|| format!("payment provider returned {}", status));
            return Err(AppError::Submission(message));
        }

        let ack: StkPushResponse = response
            .json()
            .await
            .map_err(|_| AppError::submission("malformed response from payment provider"))?;

        if ack.response_code != "0" {
            error!(
                "STK push not accepted: {} - {}",
                ack.response_code, ack.response_description
            );
            return Err(AppError::Submission(ack.response_description));
        }

        info!("STK push queued: {}", ack.checkout_request_id);
        Ok(StkPushAck {
            merchant_request_id: ack.merchant_request_id,
            checkout_request_id: ack.checkout_request_id,
            response_description: ack.response_description,
            customer_message: ack.customer_message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn password_is_deterministic_base64_of_the_concatenation() {
        assert_eq!(derive_password("a", "b", "c"), base64.encode("abc"));
        assert_eq!(
            derive_password("174379", "passkey", "20240101120000"),
            derive_password("174379", "passkey", "20240101120000")
        );
    }

    #[test]
    fn different_timestamps_produce_different_passwords() {
        let a = derive_password("174379", "passkey", "20240101120000");
        let b = derive_password("174379", "passkey", "20240101120001");
        assert_ne!(a, b);
    }

    struct CountingFetcher {
        calls: AtomicUsize,
        ttl: &'static str,
    }

    #[async_trait]
    impl TokenFetcher for CountingFetcher {
        async fn fetch(&self) -> Result<AuthResponse> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(AuthResponse {
                access_token: format!("token-{}", n),
                expires_in: self.ttl.to_string(),
            })
        }
    }

    struct FailingFetcher;

    #[async_trait]
    impl TokenFetcher for FailingFetcher {
        async fn fetch(&self) -> Result<AuthResponse> {
            Err(AppError::Auth("credential exchange returned 400".into()))
        }
    }

    #[tokio::test]
    async fn reuses_a_cached_token_within_its_lifetime() {
        let fetcher = Arc::new(CountingFetcher {
            calls: AtomicUsize::new(0),
            ttl: "3599",
        });
        let provider = TokenProvider::new(fetcher.clone());

        assert_eq!(provider.access_token().await.unwrap(), "token-0");
        assert_eq!(provider.access_token().await.unwrap(), "token-0");
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn refetches_when_the_token_is_close_to_expiry() {
        let fetcher = Arc::new(CountingFetcher {
            calls: AtomicUsize::new(0),
            ttl: "30",
        });
        let provider = TokenProvider::new(fetcher.clone());

        // 30s is inside the refresh margin, so every call refetches.
        assert_eq!(provider.access_token().await.unwrap(), "token-0");
        assert_eq!(provider.access_token().await.unwrap(), "token-1");
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn invalidation_forces_a_refetch() {
        let fetcher = Arc::new(CountingFetcher {
            calls: AtomicUsize::new(0),
            ttl: "3599",
        });
        let provider = TokenProvider::new(fetcher.clone());

        assert_eq!(provider.access_token().await.unwrap(), "token-0");
        provider.invalidate();
        assert_eq!(provider.access_token().await.unwrap(), "token-1");
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn fetch_failures_surface_as_auth_errors() {
        let provider = TokenProvider::new(Arc::new(FailingFetcher));
        match provider.access_token().await {
            Err(AppError::Auth(_)) => {}
            other => panic!("expected AuthError, got {:?}", other.map(|_| ())),
        }
    }
}
