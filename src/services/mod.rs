pub mod audit;
pub mod catalog;
pub mod geo;
pub mod guard;
pub mod ingestion;
pub mod scanner;
pub mod storage;
pub mod token_service;
pub mod transfer;
pub mod validation;
