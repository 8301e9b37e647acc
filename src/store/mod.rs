//! Durable session state: models and SQLite access.

pub mod db;
pub mod models;

pub use db::{CoachDb, DbHandle};
pub use models::*;
