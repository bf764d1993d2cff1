//! Adapters: concrete implementations of the port traits.
//!
//! | Adapter    | Implements     | Connects to                 |
//! |------------|----------------|-----------------------------|
//! | `log_sink` | EventSink      | Serial log output           |
//! | `nvs`      | RegionStorage  | NVS / in-memory store       |
//! | `time`     | WallClock      | `gettimeofday` / SystemTime |
//! | `timer`    | RetryTimer     | Session mailbox             |

pub mod log_sink;
pub mod nvs;
pub mod time;
pub mod timer;
