use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

pub const STATUS_ACTIVE: &str = "active";
pub const STATUS_DELETION_SCHEDULED: &str = "deletion_scheduled";

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "stored_objects")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub entry_id: String,
    pub model_domain: String,
    pub filename: String,
    pub filename_extension: String,
    pub description: Option<String>,
    pub owner: String,
    pub bucket: String,
    pub object_key: String,
    pub size: i64,
    /// WKT polygon in EPSG:4326
    pub spatial_extent: Option<String>,
    pub gis: bool,
    pub tags: Option<Json>,
    pub status: String,
    pub deletion_time: Option<DateTimeUtc>,
    pub scan_verdict: String,
    pub mime_type: String,
    pub created_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::dictionary_entries::Entity",
        from = "Column::EntryId",
        to = "super::dictionary_entries::Column::Id",
        on_update = "Cascade",
        on_delete = "Restrict"
    )]
    DictionaryEntries,
}

impl Related<super::dictionary_entries::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::DictionaryEntries.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
