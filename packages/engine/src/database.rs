use std::time::Duration;

use sea_orm::{ConnectOptions, Database, DatabaseConnection, DbErr};
use tracing::info;

/// Connect to the metadata store and sync the entity schema.
///
/// Uploads hold a connection across validation and the object write, so the
/// pool leans larger and the acquire timeout stays short: a saturated pool
/// should surface as `metadata-unavailable` quickly instead of queueing
/// callers behind slow uploads.
pub async fn init_db(db_url: &str) -> Result<DatabaseConnection, DbErr> {
    let mut opt = ConnectOptions::new(db_url.to_owned());

    opt.max_connections(64)
        .min_connections(4)
        .connect_timeout(Duration::from_secs(8))
        .acquire_timeout(Duration::from_secs(5))
        .idle_timeout(Duration::from_secs(60))
        .max_lifetime(Duration::from_secs(30 * 60))
        .sqlx_logging(false);

    let db = Database::connect(opt).await?;
    db.get_schema_registry("engine::entity::*")
        .sync(&db)
        .await?;
    info!("metadata schema synced");

    Ok(db)
}
