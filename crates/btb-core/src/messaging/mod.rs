//! Outbound messaging abstractions (Telegram today, behind a port).

#[cfg(test)]
pub(crate) mod fake;
pub mod port;
pub mod throttled;
pub mod types;
