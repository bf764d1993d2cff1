//! Session controller: the only code that mutates session state.
//!
//! ```text
//!              ConnectRadio / ConnectSerial
//!   ┌──────┐ ─────────────────────────────▶ ┌────────────┐
//!   │ None │                                │ Connecting │──┐ engine fault
//!   └──────┘ ◀── teardown ── ┌───────────┐ ◀┘            │  │
//!       ▲                    │ Connected │ ◀── connect ok─┘  ▼
//!       │                    └───────────┘ ── read fault ─▶ ┌────────┐
//!       │                          │ peer close / idle      │ Failed │
//!       │                          ▼                        └────────┘
//!       └──── DisconnectSerial / ReconnectRadio ── ShuttingDown   │
//!                                                                 │
//!             retry timer ─▶ ConnectRadio ◀── backoff (radio) ────┘
//! ```
//!
//! The controller runs on its own task, pends on the [`Mailbox`] with a
//! state-dependent timeout, and processes one [`Command`] at a time. The
//! engine's I/O and verify hooks are built per call from disjoint borrows
//! of the controller, so the engine never holds a reference between calls.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};

use super::buffer::BufferPool;
use super::command::{Command, InboundFrame, InboundMessage, OutboundMessage, RxIndication};
use super::handle::SessionHandle;
use super::mailbox::Mailbox;
use super::observers::ReceivePort;
use super::{SessionShared, SessionState, Transport};
use crate::app::events::SessionEvent;
use crate::app::ports::{
    ElementError, EngineFault, EngineHooks, EventSink, IdentityStore, LinkError, PeerCertificate,
    RadioLink, RecvOutcome, RetransmitWindow, RetryTimer, SecureChannelEngine, SecureElement,
    SecurityModeSource, SerialLink, SharedStorage, WallClock,
};
use crate::backoff::Backoff;
use crate::cache::SessionCache;
use crate::config::{AuthTimeoutStore, SessionSettings, SessionTimeouts};
use crate::counters::{Counter, CounterStore};
use crate::diagnostics::{self, SessionReport};
use crate::error::SessionError;
use crate::transport::{self, TransportMux};
use crate::verifier::PeerVerifier;

// ---------------------------------------------------------------------------
// Construction inputs
// ---------------------------------------------------------------------------

/// Platform ports the controller drives. Built once at boot.
pub struct SessionPorts {
    pub engine: Box<dyn SecureChannelEngine>,
    pub element: Box<dyn SecureElement>,
    pub identity: Box<dyn IdentityStore>,
    pub storage: SharedStorage,
    pub radio: Box<dyn RadioLink>,
    pub serial: Box<dyn SerialLink>,
    pub clock: Arc<dyn WallClock>,
    pub security_mode: Box<dyn SecurityModeSource>,
    pub events: Box<dyn EventSink>,
}

/// Whether the task loop keeps running after a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopControl {
    Continue,
    Halt,
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

pub struct SessionController {
    state: SessionState,
    transport: Transport,
    /// Mailbox pend timeout; `None` blocks indefinitely.
    wait: Option<Duration>,
    /// Set when the last pend timed out, cleared by any command.
    rx_timed_out: bool,
    shared: Arc<SessionShared>,
    engine: Box<dyn SecureChannelEngine>,
    element: Box<dyn SecureElement>,
    identity: Box<dyn IdentityStore>,
    mux: TransportMux,
    cache: SessionCache,
    backoff: Backoff,
    retry_timer: Box<dyn RetryTimer>,
    clock: Arc<dyn WallClock>,
    security_mode: Box<dyn SecurityModeSource>,
    events: Box<dyn EventSink>,
    timeouts: SessionTimeouts,
    drop_on_expired_cert: bool,
}

impl SessionController {
    /// Open persisted config, counters and cache, and pair the controller
    /// with a handle sharing `mailbox`.
    pub fn new(
        ports: SessionPorts,
        settings: &SessionSettings,
        retry_timer: Box<dyn RetryTimer>,
        mailbox: Mailbox,
    ) -> (Self, SessionHandle) {
        let auth = AuthTimeoutStore::open(ports.storage.clone());
        let counters = CounterStore::open(ports.storage.clone());
        let cache = SessionCache::open(ports.storage);
        let backoff = Backoff::new(auth.initial_secs());

        let shared = Arc::new(SessionShared::new(
            mailbox,
            BufferPool::default(),
            auth,
            counters,
        ));
        let handle = SessionHandle::new(Arc::clone(&shared), settings.timeouts);

        let controller = Self {
            state: SessionState::None,
            transport: Transport::None,
            wait: None,
            rx_timed_out: false,
            shared,
            engine: ports.engine,
            element: ports.element,
            identity: ports.identity,
            mux: TransportMux::new(ports.radio, ports.serial),
            cache,
            backoff,
            retry_timer,
            clock: ports.clock,
            security_mode: ports.security_mode,
            events: ports.events,
            timeouts: settings.timeouts,
            drop_on_expired_cert: settings.drop_session_on_expired_cert,
        };
        (controller, handle)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    /// Current mailbox pend timeout.
    pub fn wait(&self) -> Option<Duration> {
        self.wait
    }

    /// Task body: wait for security mode, then serve the mailbox until
    /// `Shutdown` is processed.
    pub fn run(mut self) {
        info!("Session: task started");
        self.boot();
        loop {
            let cmd = self.shared.mailbox.pend(self.wait);
            if self.step(cmd) == LoopControl::Halt {
                break;
            }
        }
        info!("Session: task halted");
    }

    /// Block until security mode is enabled, then queue the first radio
    /// connect.
    pub fn boot(&mut self) {
        self.wait_for_security_mode();
    }

    /// Process one pend result. `None` is a pend timeout.
    pub fn step(&mut self, cmd: Option<Command>) -> LoopControl {
        match cmd {
            Some(cmd) => {
                self.rx_timed_out = false;
                self.dispatch(cmd)
            }
            None => {
                self.rx_timed_out = true;
                self.transport_rx(None);
                LoopControl::Continue
            }
        }
    }

    /// Process every queued command without blocking.
    pub fn poll(&mut self) -> LoopControl {
        while let Some(cmd) = self.shared.mailbox.try_pend() {
            if self.step(Some(cmd)) == LoopControl::Halt {
                return LoopControl::Halt;
            }
        }
        LoopControl::Continue
    }

    fn dispatch(&mut self, cmd: Command) -> LoopControl {
        debug!(
            "Session: {} (state={:?}, transport={:?})",
            cmd.name(),
            self.state,
            self.transport
        );
        match cmd {
            Command::ConnectSerial => {
                self.disconnect_radio(true);
                self.connect_serial();
            }
            Command::DisconnectSerial => {
                if self.transport == Transport::Serial {
                    self.disconnect_serial();
                    self.connect_radio(false);
                }
            }
            Command::ConnectRadio => self.connect_radio(false),
            Command::DisconnectRadio => self.disconnect_radio(false),
            Command::ReconnectRadio => self.reconnect_radio(),
            Command::TransportRx { transport, frame } => {
                if transport == self.transport {
                    self.transport_rx(Some(frame));
                } else if self.transport == Transport::None {
                    debug!("Session: {transport:?} frame with no session");
                    self.shared.counters.increment(Counter::InNoSessionErrors);
                } else {
                    debug!(
                        "Session: ignoring {transport:?} frame, active transport is {:?}",
                        self.transport
                    );
                }
            }
            Command::ApplicationTx(msg) => self.application_tx(msg),
            Command::SecurityModeChanged => {
                self.disconnect_serial();
                self.disconnect_radio(false);
                self.invalidate_cache();
                self.wait_for_security_mode();
            }
            Command::Shutdown => {
                self.retry_timer.cancel();
                self.disconnect_serial();
                self.set_state(SessionState::ShuttingDown);
                diagnostics::log_stats(&SessionReport::collect(&self.shared));
                self.shared.shutdown_ack.signal(());
                info!("Session: shutdown acknowledged");
                return LoopControl::Halt;
            }
        }
        LoopControl::Continue
    }

    // ── Radio ────────────────────────────────────────────────────

    fn connect_radio(&mut self, quick_only: bool) {
        match self.transport {
            Transport::Serial => {
                info!("Session: serial session active, radio connect deferred");
                return;
            }
            Transport::Radio => {
                debug!("Session: radio session already {:?}", self.state);
                return;
            }
            Transport::None => {}
        }
        if !self.wait_for_valid_time() {
            return;
        }

        let created = transport::radio_profile(self.element.as_mut()).and_then(|profile| {
            self.engine
                .create_context(&profile)
                .map_err(SessionError::from)
        });
        if let Err(e) = created {
            warn!("Session: radio context unavailable: {e}");
            self.start_backoff();
            return;
        }

        self.transport = Transport::Radio;
        self.wait = Some(self.timeouts.radio_transport);
        self.enter_state(SessionState::Connecting);

        self.shared.begin_cache_load();
        let resumed = self.resume_from_cache();
        self.shared.finish_cache_load();
        if resumed {
            info!("Session: radio session resumed from cache");
            self.wait = Some(self.timeouts.radio_session);
            self.set_state(SessionState::Connected);
            self.shared
                .observers
                .notify_state_changed(SessionState::Connected);
            return;
        }
        if quick_only {
            return;
        }

        let window = self.handshake_window();
        if let Err(fault) = self.engine.create_session(window) {
            error!("Session: radio session create failed: {fault}");
            self.fail(SessionError::from(fault));
            return;
        }
        self.start_handshake();
    }

    /// Restore the engine from a cached session. Legacy material is
    /// re-exported so the next boot finds current-format blobs.
    fn resume_from_cache(&mut self) -> bool {
        let Some(resumed) = self.cache.load() else {
            return false;
        };
        if let Err(fault) = self.engine.restore_session(resumed.material()) {
            warn!("Session: cached session rejected: {fault}");
            return false;
        }
        self.shared
            .peer
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .not_after = resumed.cert_not_after();
        if resumed.is_legacy() {
            self.save_major();
            self.save_minor();
        }
        true
    }

    /// Drop any radio session and disarm the retry timer. A pending
    /// backoff (`Failed` with no transport) also returns to `None`.
    fn disconnect_radio(&mut self, quiet: bool) {
        self.retry_timer.cancel();
        match self.transport {
            Transport::Radio => self.teardown(quiet),
            Transport::None if self.state == SessionState::Failed => {
                info!("Session: backoff abandoned");
                self.wait = None;
                self.set_state(SessionState::None);
            }
            _ => {}
        }
    }

    fn reconnect_radio(&mut self) {
        self.disconnect_serial();
        self.disconnect_radio(false);
        self.connect_radio(true);
        self.disconnect_radio(false);
        self.invalidate_cache();
        self.connect_radio(false);
    }

    // ── Serial ───────────────────────────────────────────────────

    fn connect_serial(&mut self) {
        if self.transport == Transport::Serial {
            self.teardown(false);
        }

        let created = transport::serial_profile(self.identity.as_ref()).and_then(|profile| {
            self.engine
                .create_context(&profile)
                .map_err(SessionError::from)
        });
        if let Err(e) = created {
            warn!("Session: serial context unavailable: {e}");
            self.shared.observers.notify_connect_result(Err(e));
            return;
        }

        self.transport = Transport::Serial;
        self.wait = Some(self.timeouts.serial_transport);
        self.enter_state(SessionState::Connecting);

        let window = self.handshake_window();
        if let Err(fault) = self.engine.create_session(window) {
            error!("Session: serial session create failed: {fault}");
            self.fail(SessionError::from(fault));
            return;
        }
        self.start_handshake();
    }

    fn disconnect_serial(&mut self) {
        if self.transport != Transport::Serial {
            return;
        }
        self.teardown(false);
        self.mux.serial_closed();
    }

    // ── Shared transitions ───────────────────────────────────────

    fn start_handshake(&mut self) {
        match self.with_engine(None, |engine, hooks| engine.connect(hooks)) {
            Ok(()) => self.enter_state(SessionState::Connected),
            Err(fault) if fault.is_would_block() => debug!("Session: handshake in flight"),
            Err(fault) => {
                warn!("Session: handshake start failed: {fault}");
                self.fail(SessionError::from(fault));
            }
        }
    }

    /// Free the engine session (sending close-notify unless `quiet`) and
    /// return to `None`.
    fn teardown(&mut self, quiet: bool) {
        self.with_engine(None, |engine, hooks| engine.shutdown(hooks, quiet));
        self.transport = Transport::None;
        self.wait = None;
        self.set_state(SessionState::None);
    }

    fn set_state(&mut self, next: SessionState) {
        if self.state != next {
            self.events.emit(&SessionEvent::StateChanged {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.shared.publish(next, self.transport);
    }

    fn enter_state(&mut self, next: SessionState) {
        self.set_state(next);
        match next {
            SessionState::Connecting | SessionState::Suspended => {
                if self.transport == Transport::Radio {
                    self.shared.observers.notify_state_changed(next);
                }
            }
            SessionState::Connected => self.on_connected(),
            SessionState::ShuttingDown => {
                if self.transport == Transport::Serial {
                    self.post(Command::DisconnectSerial);
                } else {
                    self.post(Command::ReconnectRadio);
                }
            }
            SessionState::Failed => self.fail(SessionError::NotConnected),
            SessionState::None => {}
        }
    }

    fn on_connected(&mut self) {
        let transport = self.transport;
        let peer_serial = self.shared.peer_certificate().serial;
        info!("Session: {transport:?} session established");
        self.events.emit(&SessionEvent::SessionEstablished {
            transport,
            peer_serial,
        });
        match transport {
            Transport::Radio => {
                self.mark_success();
                self.shared
                    .observers
                    .notify_state_changed(SessionState::Connected);
                self.wait = Some(self.timeouts.radio_session);
                self.backoff.reset(self.shared.auth.initial_secs());
                self.shared.publish_ceiling(self.backoff.ceiling_secs());
                self.save_major();
                self.save_minor();
            }
            Transport::Serial => self.wait = Some(self.timeouts.serial_session),
            Transport::None => {}
        }
        self.shared.observers.notify_connect_result(Ok(()));
    }

    /// Enter `Failed` and run the transport's recovery.
    fn fail(&mut self, reason: SessionError) {
        let transport = self.transport;
        self.set_state(SessionState::Failed);
        self.events.emit(&SessionEvent::SessionFailed {
            transport,
            peer_serial: self.shared.peer_certificate().serial,
        });
        match transport {
            Transport::Radio => self.start_backoff(),
            Transport::Serial => self.post(Command::DisconnectSerial),
            Transport::None => {}
        }
        self.shared.observers.notify_connect_result(Err(reason));
    }

    /// Tear down radio, drop the cache and arm the retry timer with a
    /// randomized delay.
    fn start_backoff(&mut self) {
        if self.transport == Transport::Radio {
            self.teardown(false);
        }
        self.invalidate_cache();
        self.set_state(SessionState::Failed);

        let cfg = self.shared.auth.snapshot();
        let element = self.element.as_mut();
        let delay = self.backoff.next_delay(&cfg, || random_u32(element));
        let next_ceiling_secs = self.backoff.ceiling_secs();
        self.shared.publish_ceiling(next_ceiling_secs);
        self.wait = None;
        self.retry_timer.arm(delay);
        self.events.emit(&SessionEvent::BackoffScheduled {
            delay,
            next_ceiling_secs,
        });
    }


    // ── Receive path ─────────────────────────────────────────────

    fn transport_rx(&mut self, frame: Option<InboundFrame>) {
        let radio = self.transport == Transport::Radio;
        match self.state {
            SessionState::Connecting => {
                let had_frame = frame.is_some();
                let rx = frame.as_ref().map(|f| &*f.payload);
                let result = self.with_engine(rx, |engine, hooks| engine.connect(hooks));
                let counter = match result {
                    Ok(()) => {
                        self.enter_state(SessionState::Connected);
                        Counter::InNonApplication
                    }
                    Err(EngineFault::Duplicate) => Counter::InDuplicates,
                    Err(EngineFault::WouldBlock) => return,
                    Err(fault) => {
                        warn!("Session: handshake failed: {fault}");
                        self.fail(SessionError::from(fault));
                        Counter::InNoSessionErrors
                    }
                };
                if radio && had_frame {
                    self.shared.counters.increment(counter);
                }
            }
            SessionState::Connected => match frame {
                Some(frame) => self.decrypt(frame),
                None if self.transport == Transport::Serial => {
                    info!("Session: serial session idle, closing");
                    self.enter_state(SessionState::ShuttingDown);
                }
                None => {}
            },
            _ => {
                if frame.is_some() {
                    self.shared.counters.increment(Counter::InNoSessionErrors);
                }
            }
        }
    }

    fn decrypt(&mut self, frame: InboundFrame) {
        let radio = self.transport == Transport::Radio;
        let pool = self.shared.pool.clone();
        let Some(mut plain) = pool.alloc(pool.max_len()) else {
            warn!("Session: no buffer for plaintext");
            self.fail(SessionError::BufferExhausted);
            return;
        };

        let result = self.with_engine(Some(&frame.payload[..]), |engine, hooks| {
            engine.read(hooks, &mut plain)
        });
        match result {
            Ok(0) => {
                info!("Session: peer closed the session");
                if radio {
                    self.shared.counters.increment(Counter::InNonApplication);
                }
                self.enter_state(SessionState::ShuttingDown);
            }
            Ok(n) => {
                plain.truncate(n);
                if radio {
                    self.mark_success();
                    self.save_minor();
                    self.shared.counters.increment(Counter::InUcast);
                }
                self.deliver(frame.indication, plain);
            }
            Err(fault) if fault.is_would_block() => {
                if radio {
                    self.shared.counters.increment(Counter::InDuplicates);
                }
            }
            Err(fault) => {
                if matches!(fault, EngineFault::Decrypt) {
                    self.events.emit(&SessionEvent::DecryptionFailed);
                }
                if radio {
                    self.check_staleness();
                    self.shared.counters.increment(Counter::InSecurityErrors);
                }
                warn!("Session: record rejected: {fault}");
                self.fail(SessionError::Decrypt(fault));
            }
        }

        if radio && self.state == SessionState::Connected {
            self.check_cert_expiry();
        }
    }

    fn deliver(&mut self, indication: Option<RxIndication>, payload: super::buffer::PoolBuf) {
        let transport = self.transport;
        let port = match (transport, indication) {
            (Transport::Serial, _) => ReceivePort::Serial,
            (Transport::Radio, Some(ind)) => ReceivePort::Radio(ind.port),
            (Transport::Radio, None) => {
                warn!("Session: radio plaintext without indication dropped");
                return;
            }
            (Transport::None, _) => return,
        };

        match self.shared.observers.receive_handler(port) {
            Some(handler) => handler(InboundMessage {
                transport,
                indication,
                payload,
            }),
            None if transport == Transport::Radio => {
                warn!("Session: no handler for {port:?}, dropping session");
                drop(payload);
                self.fail(SessionError::Unroutable);
            }
            None => debug!("Session: serial plaintext dropped, no handler"),
        }
    }

    /// A radio security error after a long silence suggests the head-end
    /// forgot us; force a full handshake.
    fn check_staleness(&mut self) {
        let (Some(now), Some(last)) = (
            self.clock.now(),
            self.shared.counters.last_session_success(),
        ) else {
            return;
        };
        if now.secs().saturating_sub(last.secs()) > self.timeouts.radio_session.as_secs() {
            info!("Session: last success is stale, forcing reconnect");
            self.post(Command::ReconnectRadio);
        }
    }

    fn check_cert_expiry(&mut self) {
        if !self.drop_on_expired_cert {
            return;
        }
        let Some(now) = self.clock.now() else {
            return;
        };
        if self.shared.peer_certificate().is_expired(now) {
            warn!("Session: peer certificate expired, reconnecting");
            self.post(Command::ReconnectRadio);
        }
    }

    // ── Send path ────────────────────────────────────────────────

    fn application_tx(&mut self, msg: OutboundMessage) {
        if self.state != SessionState::Connected {
            debug!("Session: application data with no session dropped");
            self.shared.counters.increment(Counter::OutNoSessionErrors);
            return;
        }

        self.mux.attach(msg.meta);
        let result = self.with_engine(None, |engine, hooks| engine.write(hooks, &msg.payload));
        self.mux.attach(None);

        match result {
            Ok(0) => warn!("Session: write produced no record"),
            Ok(_) => {
                if self.transport == Transport::Radio {
                    self.save_minor();
                }
            }
            Err(fault) => warn!("Session: application write failed: {fault}"),
        }
    }

    // ── Waiting ──────────────────────────────────────────────────

    /// Poll the wall clock until it is valid. A `ConnectSerial` or
    /// `Shutdown` arriving meanwhile is re-queued and aborts the wait.
    fn wait_for_valid_time(&mut self) -> bool {
        let mut logged = false;
        while self.clock.now().is_none() {
            if !logged {
                info!("Session: waiting for valid time");
                logged = true;
            }
            match self.shared.mailbox.pend(Some(self.timeouts.time_check)) {
                Some(cmd @ (Command::ConnectSerial | Command::Shutdown)) => {
                    match self.shared.mailbox.post(cmd) {
                        Ok(()) => return false,
                        Err(cmd) => warn!("Session: mailbox full, {} dropped", cmd.name()),
                    }
                }
                Some(cmd) => debug!("Session: no valid time, {} dropped", cmd.name()),
                None => {}
            }
        }
        true
    }

    fn wait_for_security_mode(&mut self) {
        while !self.security_mode.is_enabled() {
            info!("Session: security mode disabled, idling");
            match self.shared.mailbox.pend(None) {
                Some(Command::Shutdown) => {
                    self.post(Command::Shutdown);
                    return;
                }
                Some(cmd) => debug!("Session: security mode off, {} dropped", cmd.name()),
                None => {}
            }
        }
        self.post(Command::ConnectRadio);
    }

    // ── Helpers ──────────────────────────────────────────────────

    fn post(&self, cmd: Command) {
        if let Err(cmd) = self.shared.mailbox.post(cmd) {
            warn!("Session: mailbox full, {} dropped", cmd.name());
        }
    }

    fn mark_success(&self) {
        if let Some(now) = self.clock.now() {
            self.shared.counters.set_last_session_success(now);
        }
    }

    fn save_major(&mut self) {
        let not_after = self.shared.peer_certificate().not_after;
        if let Err(e) = self.cache.save_major(self.engine.as_mut(), not_after) {
            warn!("Session: major cache save failed: {e}");
        }
    }

    fn save_minor(&mut self) {
        if let Err(e) = self.cache.save_minor(self.engine.as_mut()) {
            warn!("Session: minor cache save failed: {e}");
        }
    }

    fn invalidate_cache(&mut self) {
        if let Err(e) = self.cache.invalidate() {
            warn!("Session: cache invalidate failed: {e}");
        }
    }

    fn handshake_window(&self) -> RetransmitWindow {
        match self.transport {
            Transport::Serial => SessionTimeouts::window_for(self.timeouts.serial_transport),
            _ => SessionTimeouts::window_for(self.timeouts.radio_transport),
        }
    }

    /// Run one engine operation with hooks borrowed from this controller.
    fn with_engine<R>(
        &mut self,
        rx: Option<&[u8]>,
        op: impl FnOnce(&mut dyn SecureChannelEngine, &mut dyn EngineHooks) -> R,
    ) -> R {
        let wait_cap = self.handshake_window().max;
        let Self {
            state,
            transport,
            wait,
            rx_timed_out,
            shared,
            engine,
            element,
            identity,
            mux,
            events,
            ..
        } = self;
        let mut hooks = ControllerHooks {
            state: *state,
            rx,
            rx_timed_out,
            wait,
            wait_cap,
            mux,
            counters: &shared.counters,
            verifier: PeerVerifier {
                transport: *transport,
                element: element.as_mut(),
                identity: identity.as_mut(),
                record: &shared.peer,
                events: events.as_mut(),
            },
        };
        op(engine.as_mut(), &mut hooks)
    }
}

fn random_u32(element: &mut dyn SecureElement) -> u32 {
    let mut bytes = [0u8; 4];
    match element.random(&mut bytes) {
        Ok(()) => u32::from_le_bytes(bytes),
        Err(e) => {
            warn!("Session: element random failed ({e}), using ceiling");
            u32::MAX
        }
    }
}

// ---------------------------------------------------------------------------
// Engine hooks
// ---------------------------------------------------------------------------

struct ControllerHooks<'a> {
    state: SessionState,
    /// Ciphertext handed to the engine by the current command, if any.
    rx: Option<&'a [u8]>,
    rx_timed_out: &'a mut bool,
    wait: &'a mut Option<Duration>,
    /// Longest pend timeout retransmission may stretch `wait` to.
    wait_cap: Duration,
    mux: &'a mut TransportMux,
    counters: &'a CounterStore,
    verifier: PeerVerifier<'a>,
}

impl EngineHooks for ControllerHooks<'_> {
    fn recv(&mut self, buf: &mut [u8]) -> RecvOutcome {
        if let Some(bytes) = self.rx.take() {
            let n = bytes.len().min(buf.len());
            buf[..n].copy_from_slice(&bytes[..n]);
            return RecvOutcome::Data(n);
        }
        if *self.rx_timed_out && self.state == SessionState::Connecting {
            *self.rx_timed_out = false;
            if let Some(wait) = self.wait.as_mut() {
                *wait = wait.saturating_mul(2).min(self.wait_cap);
            }
            return RecvOutcome::TimedOut;
        }
        RecvOutcome::WouldBlock
    }

    fn send(&mut self, datagram: &[u8]) -> core::result::Result<usize, LinkError> {
        self.mux.send(
            self.verifier.transport,
            self.state,
            datagram,
            self.counters,
        )
    }

    fn verify_peer(&mut self, preverified: bool, cert: &PeerCertificate<'_>) -> bool {
        self.verifier.verify(preverified, cert)
    }

    fn sign(&mut self, digest: &[u8], out: &mut [u8]) -> core::result::Result<usize, ElementError> {
        self.verifier.sign(digest, out)
    }
}
