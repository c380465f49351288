//! Core domain for the channel-sync engine: canonical entities, partial
//! update types, calendar-block rules, configuration, and the SQLite store.

pub mod calendar;
pub mod config;
pub mod store;
pub mod types;
