pub mod catalog;
pub mod download;
pub mod health;
pub mod security;
pub mod upload;
