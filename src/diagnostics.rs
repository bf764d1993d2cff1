//! Session diagnostics.
//!
//! [`SessionReport`] is a point-in-time snapshot of everything the
//! telemetry surface exposes: state, backoff ceiling, auth timeouts,
//! counters and the last peer certificate. It serializes to JSON for the
//! maintenance console and can be dumped to the log with [`log_stats`].

use std::sync::Once;

use heapless::LinearMap;
use log::{debug, info};
use serde::Serialize;

use crate::config::AuthTimeoutConfig;
use crate::counters::Counter;
use crate::session::{SessionShared, SessionState, Transport};
use crate::verifier::SERIAL_MAX;
use crate::verifier::asn1::SubjectString;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeerSummary {
    pub serial: heapless::String<{ SERIAL_MAX * 2 }>,
    pub subject: SubjectString,
    pub not_after_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionReport {
    pub state: SessionState,
    pub transport: Transport,
    pub backoff_ceiling_secs: u32,
    pub auth: AuthTimeoutConfig,
    pub counters: LinearMap<&'static str, u32, { Counter::COUNT }>,
    pub last_session_success_secs: Option<u64>,
    pub peer: PeerSummary,
    pub buffers_in_use: usize,
    pub heap_free: u32,
}

impl SessionReport {
    pub(crate) fn collect(shared: &SessionShared) -> Self {
        let mut counters = LinearMap::new();
        for (counter, value) in shared.counters.snapshot().iter() {
            // Capacity equals Counter::COUNT.
            let _ = counters.insert(counter.name(), value);
        }
        let peer = shared.peer_certificate();
        Self {
            state: shared.state(),
            transport: shared.transport(),
            backoff_ceiling_secs: shared.ceiling_secs(),
            auth: shared.auth.snapshot(),
            counters,
            last_session_success_secs: shared.counters.last_session_success().map(|t| t.secs()),
            peer: PeerSummary {
                serial: peer.serial_hex(),
                subject: peer.subject.clone(),
                not_after_secs: peer.not_after.map(|t| t.secs()),
            },
            buffers_in_use: shared.pool.in_use(),
            heap_free: heap_free(),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(target_os = "espidf")]
fn heap_free() -> u32 {
    unsafe { esp_idf_svc::sys::esp_get_free_heap_size() }
}

/// Simulation builds report a fixed figure.
#[cfg(not(target_os = "espidf"))]
fn heap_free() -> u32 {
    307_200
}

static LOGGING: Once = Once::new();

/// Apply ESP-IDF link patches and install the IDF logger, once per boot.
/// A logger the application installed earlier is left in place.
pub fn init_logging() {
    LOGGING.call_once(|| {
        #[cfg(target_os = "espidf")]
        {
            esp_idf_svc::sys::link_patches();
            if let Err(e) = esp_idf_logger::init() {
                debug!("Diagnostics: logger already installed ({e})");
                return;
            }
        }
        debug!("Diagnostics: logging ready");
    });
}

/// Dump a report to the log, one line per group.
pub fn log_stats(report: &SessionReport) {
    info!(
        "STATS | state={:?} transport={:?} ceiling={}s buffers={} heap={}",
        report.state,
        report.transport,
        report.backoff_ceiling_secs,
        report.buffers_in_use,
        report.heap_free
    );
    info!(
        "STATS | auth min={}s max={}s initial={}s",
        report.auth.min_secs, report.auth.max_secs, report.auth.initial_secs
    );
    for (name, value) in report.counters.iter() {
        info!("STATS | {name}={value}");
    }
    if !report.peer.serial.is_empty() {
        info!(
            "STATS | peer serial={} subject={} not_after={:?}",
            report.peer.serial, report.peer.subject, report.peer.not_after_secs
        );
    }
}
