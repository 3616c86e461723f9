//! Storage layer for the maestro workflow engine.
//!
//! One PostgreSQL database per project: queries never take a project
//! filter. Each entity kind gets a narrow query module under [`queries`],
//! and [`live`] surfaces CREATE/UPDATE/DELETE events per table through
//! `LISTEN/NOTIFY`.

pub mod config;
pub mod live;
pub mod models;
pub mod order_by;
pub mod pool;
pub mod queries;
