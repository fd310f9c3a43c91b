use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// A catalogue record describing one accepted file type.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "dictionary_entries")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub name: String,
    pub model_domain: String,
    pub description: Option<String>,
    /// Declared extension without the leading dot, e.g. `csv`, `shp`, `gpkg`
    pub filename_extension: String,
    pub mime_type: String,
    /// Whether uploads against this entry get a spatial extent
    pub gis: bool,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::stored_objects::Entity")]
    StoredObjects,
}

impl Related<super::stored_objects::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::StoredObjects.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
