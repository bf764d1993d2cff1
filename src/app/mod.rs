//! Application boundary: ports and outbound events.
//!
//! All interaction with the engine, secure element, flash and links goes
//! through the **port traits** defined in [`ports`], keeping the session
//! logic testable on the host without real peripherals.

pub mod events;
pub mod ports;
