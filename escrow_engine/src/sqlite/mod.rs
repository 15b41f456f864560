//! SQLite backend for the order and escrow engine.
mod sqlite_impl;

pub mod db;
pub use sqlite_impl::SqliteDatabase;
