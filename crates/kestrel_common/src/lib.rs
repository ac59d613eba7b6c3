pub mod config;
pub mod error;
pub mod plan_cache;
pub mod types;
