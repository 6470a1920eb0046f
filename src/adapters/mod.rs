//! Adapters: concrete implementations of the port traits.
//!
//! | Adapter    | Implements                          | Connects to              |
//! |------------|-------------------------------------|--------------------------|
//! | `log_sink` | ClientEventSink, SessionEventSink   | `log` facade             |
//! | `sim_hal`  | HalPort                             | in-process firmware model|
//! | `time`     | (clock for `advance`)               | `std::time::Instant`     |

pub mod log_sink;
pub mod sim_hal;
pub mod time;
