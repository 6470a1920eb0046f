//! Application core: the dispatcher and its vocabulary, zero I/O.
//!
//! [`service::AwareService`] drains one command FIFO on one worker.  The HAL
//! and the client callbacks are reached only through the **port traits** in
//! [`ports`], so the whole layer is testable against in-memory doubles.

pub mod commands;
pub mod events;
pub mod ports;
pub mod service;
