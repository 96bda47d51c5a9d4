//! Persistence layer for the tiger worker runtime.
//!
//! PostgreSQL via sqlx: row models with text-mapped status enums, one query
//! module per table, runtime migrations, and the transactional finalizer
//! that keeps run/task/lease/agent rows consistent.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;

pub use config::DbConfig;
