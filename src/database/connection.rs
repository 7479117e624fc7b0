use mongodb::{bson::doc, Client, Database};
use tracing::info;

use crate::errors::Result;

pub const DB_NAME: &str = "qrpay";

pub async fn get_db_client(database_url: &str) -> Result<Database> {
    let client = Client::with_uri_str(database_url).await?;
    let db = client.database(DB_NAME);

    // Fail fast on an unreachable store rather than at first request.
    db.run_command(doc! { "ping": 1 }).await?;
    info!("Connected to database: {}", DB_NAME);

    Ok(db)
}
