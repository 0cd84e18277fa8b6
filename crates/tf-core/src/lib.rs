pub mod config;
pub mod sqlite;
pub mod store;
pub mod types;
