use mongodb::Database;
use std::sync::Arc;

use crate::config::AppConfig;
use crate::services::ledger_service::Ledger;
use crate::services::mpesa_service::MpesaService;

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub db: Database,
    pub mpesa: Arc<MpesaService>,
    pub ledger: Ledger,
}

impl AppState {
    pub fn new(config: AppConfig, db: Database, mpesa: Arc<MpesaService>, ledger: Ledger) -> Self {
        AppState {
            config,
            db,
            mpesa,
            ledger,
        }
    }
}
