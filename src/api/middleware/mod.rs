pub mod auth;
pub mod csrf;
pub mod request_id;
