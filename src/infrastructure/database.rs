use crate::entities::{audit_logs, dictionary_entries, one_time_tokens, stored_objects};
use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection, Schema};
use std::env;
use std::time::Duration;
use tracing::info;

pub async fn setup_database() -> anyhow::Result<DatabaseConnection> {
    let db_url = env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;

    info!("📂 Database: {}", db_url);

    let mut opt = ConnectOptions::new(&db_url);
    opt.max_connections(100)
        .min_connections(5)
        .connect_timeout(Duration::from_secs(30))
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .sqlx_logging(true)
        .sqlx_logging_level(log::LevelFilter::Debug);

    let db = Database::connect(opt).await?;

    info!("✅ Database connected successfully");

    run_migrations(&db).await?;

    Ok(db)
}

pub async fn run_migrations(db: &DatabaseConnection) -> anyhow::Result<()> {
    let builder = db.get_database_backend();
    let schema = Schema::new(builder);

    info!("🔄 Running auto-migrations...");

    // Order matters for foreign keys: DictionaryEntries -> StoredObjects
    let stmts = vec![
        (
            "dictionary_entries",
            schema
                .create_table_from_entity(dictionary_entries::Entity)
                .if_not_exists()
                .to_owned(),
        ),
        (
            "stored_objects",
            schema
                .create_table_from_entity(stored_objects::Entity)
                .if_not_exists()
                .to_owned(),
        ),
        (
            "one_time_tokens",
            schema
                .create_table_from_entity(one_time_tokens::Entity)
                .if_not_exists()
                .to_owned(),
        ),
        (
            "audit_logs",
            schema
                .create_table_from_entity(audit_logs::Entity)
                .if_not_exists()
                .to_owned(),
        ),
    ];

    for (name, stmt) in stmts {
        let stmt = builder.build(&stmt);
        db.execute(stmt)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to create table '{}': {}", name, e))?;
        info!("   - Table '{}' checked/created", name);
    }

    let indexes = [
        "CREATE INDEX IF NOT EXISTS idx_stored_objects_entry_id ON stored_objects(entry_id)",
        "CREATE INDEX IF NOT EXISTS idx_stored_objects_location ON stored_objects(bucket, object_key)",
        "CREATE INDEX IF NOT EXISTS idx_stored_objects_status ON stored_objects(status)",
    ];

    for query in indexes {
        if let Err(e) = db
            .execute(sea_orm::Statement::from_string(builder, query.to_owned()))
            .await
        {
            tracing::warn!("   - Index creation warning: {} -> {}", query, e);
        }
    }

    Ok(())
}

/// Closes the pool on shutdown so in-flight statements finish cleanly
pub async fn shutdown_database(db: DatabaseConnection) {
    match db.close().await {
        Ok(()) => info!("📂 Database connections closed"),
        Err(e) => tracing::warn!("Failed to close database connections: {}", e),
    }
}
