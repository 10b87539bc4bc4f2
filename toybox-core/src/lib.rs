// src/lib.rs

pub mod db;
pub mod repositories;
pub mod eventbus;
pub mod sync;
pub mod chat;
pub mod commands;
pub mod toys;
pub mod tasks;
pub mod utils;
pub mod test_utils;

pub use db::Database;
pub use toybox_common::error::Error;
pub use toybox_common::{models, traits};
