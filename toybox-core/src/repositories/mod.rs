// src/repositories/mod.rs

pub mod sqlite;

pub use sqlite::user::SqliteLedger;
