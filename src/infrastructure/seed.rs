use crate::entities::{dictionary_entries, prelude::*};
use crate::services::validation::normalize_extension;
use sea_orm::{ActiveModelTrait, DatabaseConnection, EntityTrait, Set};
use serde::Deserialize;
use std::path::Path;
use tracing::info;

/// One dictionary entry as written in the seed file
#[derive(Debug, Deserialize)]
pub struct EntrySeed {
    pub id: String,
    pub name: String,
    pub model_domain: String,
    #[serde(default)]
    pub description: Option<String>,
    pub filename_extension: String,
    pub mime_type: String,
    #[serde(default)]
    pub gis: bool,
}

/// Inserts the entries that do not exist yet. Existing entries are left untouched.
pub async fn seed_dictionary(db: &DatabaseConnection, entries: Vec<EntrySeed>) -> anyhow::Result<usize> {
    let mut inserted = 0;

    for entry in entries {
        if DictionaryEntries::find_by_id(entry.id.clone())
            .one(db)
            .await?
            .is_some()
        {
            continue;
        }

        let model = dictionary_entries::ActiveModel {
            id: Set(entry.id),
            name: Set(entry.name),
            model_domain: Set(entry.model_domain),
            description: Set(entry.description),
            filename_extension: Set(normalize_extension(&entry.filename_extension)),
            mime_type: Set(entry.mime_type),
            gis: Set(entry.gis),
        };
        model.insert(db).await?;
        inserted += 1;
    }

    Ok(inserted)
}

/// Loads a JSON array of entries from `path` (set through `DICTIONARY_SEED_FILE`)
pub async fn seed_dictionary_from_file(
    db: &DatabaseConnection,
    path: impl AsRef<Path>,
) -> anyhow::Result<()> {
    let path = path.as_ref();
    info!("🌱 Seeding dictionary from {}", path.display());

    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;
    let entries: Vec<EntrySeed> = serde_json::from_str(&raw)?;
    let total = entries.len();

    let inserted = seed_dictionary(db, entries).await?;
    info!("🌱 Dictionary seeded: {} new of {} entries", inserted, total);
    Ok(())
}
