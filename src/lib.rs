//! nanmux: a multi-client coordinator for Wi-Fi Aware (NAN).
//!
//! Many independent clients share one NAN interface and one asynchronous HAL
//! command channel.  This crate merges their configurations, owns their
//! discovery sessions, pairs every HAL command with its completion, and
//! throttles follow-up messages per uid.  All HAL and event I/O goes through
//! the port traits in [`app::ports`]; everything else is pure logic that
//! runs on the host.

#![deny(unused_must_use)]

pub mod adapters;
pub mod app;
pub mod config;
pub mod diagnostics;
pub mod directory;
pub mod error;
pub mod merge;
pub mod messaging;
pub mod queue;
pub mod request;
pub mod scheduler;
pub mod transaction;
pub mod types;
