pub mod prelude;

pub mod audit_logs;
pub mod dictionary_entries;
pub mod one_time_tokens;
pub mod stored_objects;
