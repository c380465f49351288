//! Background daemon for the channel-sync engine.
//!
//! Serves the webhook receiver and trigger endpoints, runs the webhook
//! workers and the scheduled full reconciliation.

pub mod daemon;
