use axum::{
    routing::{get, post},
    Router,
};

use crate::handlers::payment_handlers;
use crate::state::AppState;

pub fn payment_routes() -> Router<AppState> {
    Router::new()
        .route("/payment-push", post(payment_handlers::initiate_payment_push))
        .route("/payment-callback", post(payment_handlers::payment_callback))
        .route("/payment-status", get(payment_handlers::check_payment_status))
        .route("/transactions", get(payment_handlers::list_transactions))
}
