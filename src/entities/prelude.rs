pub use super::audit_logs::Entity as AuditLogs;
pub use super::dictionary_entries::Entity as DictionaryEntries;
pub use super::one_time_tokens::Entity as OneTimeTokens;
pub use super::stored_objects::Entity as StoredObjects;
