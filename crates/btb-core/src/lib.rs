//! Core domain + application logic for the broadcast bot.
//!
//! Framework-agnostic: Telegram lives behind the [`messaging::port::MessagingPort`]
//! trait implemented in the adapter crate.

pub mod analytics;
pub mod broadcast;
pub mod campaign;
pub mod compose;
pub mod config;
pub mod dispatch;
pub mod domain;
pub mod errors;
pub mod formatting;
pub mod logging;
pub mod messaging;
pub mod scheduler;
pub mod security;
pub mod segment;
pub mod store;

pub use errors::{Error, Result};
