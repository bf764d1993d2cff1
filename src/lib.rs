//! MeterLink secure-session library.
//!
//! Owns the lifecycle of the authenticated datagram session between a
//! metering endpoint and its head-end (over radio) or a local maintenance
//! tool (over the serial port). The cryptographic engine, secure element,
//! flash store and link layers are reached only through the port traits in
//! [`app::ports`]; everything ESP-IDF-specific is guarded by
//! `#[cfg(target_os = "espidf")]` inside the adapters.
//!
//! ```text
//!   producers (links, app, timer) ──▶ Mailbox ──▶ SessionController
//!                                                   │  ├── TransportMux
//!                                                   │  ├── SessionCache
//!                                                   │  ├── Backoff
//!                                                   │  └── PeerVerifier
//!                                                   ▼
//!                                        SecureChannelEngine (port)
//! ```

#![deny(unused_must_use)]

pub mod adapters;
pub mod app;
pub mod backoff;
pub mod cache;
pub mod config;
pub mod counters;
pub mod diagnostics;
pub mod error;
pub mod session;
pub mod task;
pub mod transport;
pub mod verifier;

pub use error::{Result, SessionError};
pub use session::{SessionHandle, SessionState, Transport, start};
