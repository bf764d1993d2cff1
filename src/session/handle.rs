//! Thread-safe façade over the session task.
//!
//! Every mutating call posts a [`Command`]; reads come from the atomics and
//! lock-guarded stores in [`SessionShared`]. Handles are cheap to clone.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_io_mini::Timer;
use futures_lite::future;
use log::{info, warn};

use super::command::{Command, InboundFrame, InboundMessage, OutboundMessage, RxIndication};
use super::controller::{SessionController, SessionPorts};
use super::mailbox::Mailbox;
use super::observers::ReceivePort;
use super::{CacheLoad, SessionShared, SessionState, Transport};
use crate::adapters::timer::MailboxTimer;
use crate::config::{AuthTimeoutConfig, SessionSettings, SessionTimeouts};
use crate::counters::Counters;
use crate::diagnostics::{self, SessionReport};
use crate::error::{Result, SessionError};
use crate::task::{self, Core};
use crate::transport::TxMetadata;
use crate::verifier::PeerCertificateRecord;

/// FreeRTOS priority of the session task.
const SESSION_TASK_PRIORITY: u8 = 5;

#[derive(Clone)]
pub struct SessionHandle {
    shared: Arc<SessionShared>,
    timeouts: SessionTimeouts,
}

impl SessionHandle {
    pub(crate) fn new(shared: Arc<SessionShared>, timeouts: SessionTimeouts) -> Self {
        Self { shared, timeouts }
    }

    // ── Registration ─────────────────────────────────────────────

    /// Deliver decrypted data for `port` to `handler`. Registering the same
    /// port again replaces the previous handler.
    pub fn register_receive_handler(
        &self,
        port: ReceivePort,
        handler: impl Fn(InboundMessage) + Send + Sync + 'static,
    ) -> Result<()> {
        self.shared
            .observers
            .set_receive_handler(port, Arc::new(handler))
    }

    pub fn register_state_changed(&self, cb: impl Fn(SessionState) + Send + Sync + 'static) {
        self.shared.observers.set_state_changed(Arc::new(cb));
    }

    pub fn register_connect_result(&self, cb: impl Fn(Result<()>) + Send + Sync + 'static) {
        self.shared.observers.set_connect_result(Arc::new(cb));
    }

    // ── Control ──────────────────────────────────────────────────

    /// Start a serial maintenance session, tearing down any radio session.
    /// `on_result` becomes the connect-result callback.
    pub fn connect_serial(&self, on_result: impl Fn(Result<()>) + Send + Sync + 'static) -> Result<()> {
        self.register_connect_result(on_result);
        self.post(Command::ConnectSerial)
    }

    pub fn disconnect_serial(&self) -> Result<()> {
        self.post(Command::DisconnectSerial)
    }

    /// Drop the radio session and cache, then run a fresh handshake.
    pub fn reconnect_radio(&self) -> Result<()> {
        self.post(Command::ReconnectRadio)
    }

    pub fn disconnect_radio(&self) -> Result<()> {
        self.post(Command::DisconnectRadio)
    }

    /// Security mode toggled; the controller re-evaluates it.
    pub fn security_mode_changed(&self) -> Result<()> {
        self.post(Command::SecurityModeChanged)
    }

    /// Post `Shutdown` and wait up to `timeout` for the acknowledgement.
    pub fn shutdown_and_wait(&self, timeout: Duration) -> bool {
        self.shared.shutdown_ack.reset();
        if self.post(Command::Shutdown).is_err() {
            return false;
        }
        let acked = future::block_on(future::or(
            async {
                self.shared.shutdown_ack.wait().await;
                true
            },
            async {
                Timer::after(timeout).await;
                false
            },
        ));
        if acked {
            info!("Session: shutdown complete");
        } else {
            warn!("Session: shutdown not acknowledged within {timeout:?}");
        }
        acked
    }

    /// [`Self::shutdown_and_wait`] with the configured acknowledgement timeout.
    pub fn shutdown(&self) -> bool {
        self.shutdown_and_wait(self.timeouts.shutdown_ack)
    }

    pub fn session_state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn transport(&self) -> Transport {
        self.shared.transport()
    }

    /// `true` when a radio session is connected. A cache load in progress
    /// is waited for, bounded by the cache-load timeout.
    pub fn is_session_established(&self) -> bool {
        if self.shared.cache_load() == CacheLoad::InProgress {
            let loaded = future::block_on(future::or(
                async {
                    self.shared.cache_ready.wait().await;
                    true
                },
                async {
                    Timer::after(self.timeouts.cache_load_wait).await;
                    false
                },
            ));
            if loaded {
                // Pass the wakeup on to any other waiter.
                self.shared.cache_ready.signal(());
            }
        }
        self.shared.state() == SessionState::Connected
            && self.shared.transport() == Transport::Radio
    }

    // ── Data ─────────────────────────────────────────────────────

    /// Queue plaintext for encryption. Radio callers pass the metadata the
    /// ciphertext datagram should carry.
    pub fn send_application_data(&self, bytes: &[u8], meta: Option<TxMetadata>) -> Result<()> {
        let payload = self
            .shared
            .pool
            .alloc_copy(bytes)
            .ok_or(SessionError::BufferExhausted)?;
        self.post(Command::ApplicationTx(OutboundMessage { meta, payload }))
    }

    /// Hand a ciphertext frame from a transport to the session.
    pub fn data_received(
        &self,
        transport: Transport,
        bytes: &[u8],
        indication: Option<RxIndication>,
    ) -> Result<()> {
        let payload = self
            .shared
            .pool
            .alloc_copy(bytes)
            .ok_or(SessionError::BufferExhausted)?;
        self.post(Command::TransportRx {
            transport,
            frame: InboundFrame { indication, payload },
        })
    }

    // ── Config ───────────────────────────────────────────────────

    pub fn auth_timeouts(&self) -> AuthTimeoutConfig {
        self.shared.auth.snapshot()
    }

    pub fn min_auth_timeout_secs(&self) -> u32 {
        self.shared.auth.min_secs()
    }

    pub fn max_auth_timeout_secs(&self) -> u32 {
        self.shared.auth.max_secs()
    }

    pub fn initial_auth_timeout_secs(&self) -> u32 {
        self.shared.auth.initial_secs()
    }

    pub fn set_min_auth_timeout_secs(&self, secs: u32) -> Result<()> {
        self.shared.auth.set_min_secs(secs)
    }

    pub fn set_max_auth_timeout_secs(&self, secs: u32) -> Result<()> {
        self.shared.auth.set_max_secs(secs)
    }

    pub fn set_initial_auth_timeout_secs(&self, secs: u32) -> Result<()> {
        self.shared.auth.set_initial_secs(secs)
    }

    /// Ceiling the next backoff draw will use.
    pub fn backoff_ceiling_secs(&self) -> u32 {
        self.shared.ceiling_secs()
    }

    // ── Telemetry ────────────────────────────────────────────────

    pub fn counters(&self) -> Counters {
        self.shared.counters.snapshot()
    }

    pub fn reset_counters(&self) {
        self.shared.counters.reset();
    }

    /// Zero the counters and restore the default auth timeouts.
    pub fn reset_all(&self) -> Result<()> {
        self.shared.counters.reset();
        self.shared.auth.reset()
    }

    pub fn peer_certificate(&self) -> PeerCertificateRecord {
        self.shared.peer_certificate()
    }

    pub fn report(&self) -> SessionReport {
        SessionReport::collect(&self.shared)
    }

    /// Pool buffers currently held by queued or in-flight messages.
    pub fn buffers_in_use(&self) -> usize {
        self.shared.pool.in_use()
    }

    fn post(&self, cmd: Command) -> Result<()> {
        self.shared.mailbox.post(cmd).map_err(|cmd| {
            warn!("Session: mailbox full, {} dropped", cmd.name());
            SessionError::BufferExhausted
        })
    }
}

/// Spawn the retry timer and the session task; return the handle.
pub fn start(ports: SessionPorts, settings: SessionSettings) -> anyhow::Result<SessionHandle> {
    diagnostics::init_logging();
    let mailbox = Mailbox::new();
    let timer = MailboxTimer::spawn(mailbox.clone(), settings.timer_stack_kb)
        .context("spawning retry timer")?;
    let (controller, handle) =
        SessionController::new(ports, &settings, Box::new(timer), mailbox);

    task::spawn_on_core(
        Core::App,
        SESSION_TASK_PRIORITY,
        settings.session_stack_kb,
        "session\0",
        move || controller.run(),
    )
    .context("spawning session task")?;

    info!("Session: started");
    Ok(handle)
}
