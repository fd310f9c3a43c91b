pub mod database;
pub mod scanner;
pub mod seed;
pub mod storage;
