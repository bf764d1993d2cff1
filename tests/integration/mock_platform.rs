//! Mock platform for session integration tests.
//!
//! Every port records what the controller did to it behind an
//! `Arc<Mutex<..>>`, so tests keep a handle on the state after the boxed
//! port has moved into the controller. The engine is scripted: each
//! `connect`/`read` pops the next canned result.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use meterlink::adapters::nvs::RegionStore;
use meterlink::app::events::SessionEvent;
use meterlink::app::ports::{
    CertificateKind, ElementError, EngineFault, EngineHooks, EventSink, IdentityStore, KeySlot,
    LinkError, ManufacturingSubject, PeerCertificate, RadioLink, RadioRequest, RawPublicKey,
    RecvOutcome, RetransmitWindow, RetryTimer, SecureChannelEngine, SecureElement,
    SecurityModeSource, SerialLink, SessionMaterial, SharedStorage, StorageError, WallClock,
};
use meterlink::config::{SessionSettings, SessionTimeouts};
use meterlink::session::controller::{SessionController, SessionPorts};
use meterlink::session::mailbox::Mailbox;
use meterlink::session::{SessionHandle, Transport};
use meterlink::transport::{ChannelProfile, TxMetadata};
use meterlink::verifier::KEY_ID_LEN;
use meterlink::verifier::asn1::Timestamp;

/// 2026-01-01T00:00:00Z.
pub const NOW: u64 = 1_767_225_600;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap()
}

// ── DER helpers ───────────────────────────────────────────────

/// DER `Name` from `(id-at attribute, value)` pairs.
pub fn name(attrs: &[(u8, &str)]) -> Vec<u8> {
    let mut rdns = Vec::new();
    for &(attr, value) in attrs {
        let mut atv = vec![0x06, 3, 0x55, 0x04, attr, 0x0C, value.len() as u8];
        atv.extend_from_slice(value.as_bytes());
        let mut seq = vec![0x30, atv.len() as u8];
        seq.extend(atv);
        rdns.push(0x31);
        rdns.push(seq.len() as u8);
        rdns.extend(seq);
    }
    let mut out = vec![0x30, rdns.len() as u8];
    out.extend(rdns);
    out
}

pub fn utc_time(text: &str) -> Vec<u8> {
    let mut out = vec![0x17, text.len() as u8];
    out.extend_from_slice(text.as_bytes());
    out
}

/// Stand-in certificate: any complete DER SEQUENCE.
pub fn certificate_der() -> Vec<u8> {
    name(&[(0x0A, "Acme Metering"), (0x03, "device-0001")])
}

pub fn head_end_subject() -> Vec<u8> {
    name(&[(0x06, "US"), (0x0A, "Acme"), (0x03, "head-end-01")])
}

pub fn tool_subject() -> Vec<u8> {
    name(&[(0x06, "US"), (0x0A, "Acme"), (0x03, "field-tool")])
}

pub fn network_point(fill: u8) -> Vec<u8> {
    let mut p = vec![0x04];
    p.extend_from_slice(&[fill; 64]);
    p
}

fn copy_out(src: &[u8], out: &mut [u8]) -> Option<usize> {
    let dst = out.get_mut(..src.len())?;
    dst.copy_from_slice(src);
    Some(src.len())
}

// ── Engine ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum EngineCall {
    CreateContext(Transport),
    CreateSession(RetransmitWindow),
    Restore { legacy: bool },
    Connect,
    Read,
    Write(Vec<u8>),
    Shutdown { quiet: bool },
}

#[derive(Debug, Clone)]
pub struct PeerCert {
    pub serial: Vec<u8>,
    pub not_after: Vec<u8>,
    pub subject: Vec<u8>,
    pub public_key: Option<Vec<u8>>,
}

impl PeerCert {
    pub fn head_end() -> Self {
        Self {
            serial: vec![0x01, 0x02, 0x03],
            not_after: utc_time("351231235959Z"),
            subject: head_end_subject(),
            public_key: Some(network_point(0x42)),
        }
    }

    pub fn field_tool() -> Self {
        Self {
            serial: vec![0x0F],
            not_after: utc_time("351231235959Z"),
            subject: tool_subject(),
            public_key: None,
        }
    }
}

#[derive(Debug)]
pub struct EngineState {
    pub calls: Vec<EngineCall>,
    pub profiles: Vec<ChannelProfile>,
    /// Results of successive `connect` calls; empty means `WouldBlock`.
    pub connect_script: VecDeque<Result<(), EngineFault>>,
    /// Results of successive `read` calls; empty echoes the ciphertext.
    pub read_script: VecDeque<Result<Vec<u8>, EngineFault>>,
    pub peer: Option<PeerCert>,
    pub fail_context: bool,
    pub reject_restore: bool,
    pub has_session: bool,
    pub received: Vec<Vec<u8>>,
    pub timeouts_seen: usize,
    pub major: Vec<u8>,
    pub minor: Vec<u8>,
}

impl Default for EngineState {
    fn default() -> Self {
        Self {
            calls: Vec::new(),
            profiles: Vec::new(),
            connect_script: VecDeque::new(),
            read_script: VecDeque::new(),
            peer: None,
            fail_context: false,
            reject_restore: false,
            has_session: false,
            received: Vec::new(),
            timeouts_seen: 0,
            major: vec![0xAA; 96],
            minor: vec![0xBB; 24],
        }
    }
}

impl EngineState {
    fn pull(&mut self, hooks: &mut dyn EngineHooks) -> Option<Vec<u8>> {
        let mut buf = [0u8; 1536];
        match hooks.recv(&mut buf) {
            RecvOutcome::Data(n) => {
                self.received.push(buf[..n].to_vec());
                Some(buf[..n].to_vec())
            }
            RecvOutcome::TimedOut => {
                self.timeouts_seen += 1;
                None
            }
            RecvOutcome::WouldBlock => None,
        }
    }
}

pub struct ScriptedEngine(pub Arc<Mutex<EngineState>>);

impl SecureChannelEngine for ScriptedEngine {
    fn create_context(&mut self, profile: &ChannelProfile) -> Result<(), EngineFault> {
        let mut s = lock(&self.0);
        s.calls.push(EngineCall::CreateContext(profile.transport));
        s.profiles.push(profile.clone());
        if s.fail_context {
            return Err(EngineFault::Fatal(-1));
        }
        Ok(())
    }

    fn create_session(&mut self, window: RetransmitWindow) -> Result<(), EngineFault> {
        let mut s = lock(&self.0);
        s.calls.push(EngineCall::CreateSession(window));
        s.has_session = true;
        Ok(())
    }

    fn restore_session(&mut self, material: SessionMaterial<'_>) -> Result<(), EngineFault> {
        let mut s = lock(&self.0);
        let legacy = matches!(material, SessionMaterial::Legacy { .. });
        s.calls.push(EngineCall::Restore { legacy });
        if s.reject_restore {
            return Err(EngineFault::Fatal(-2));
        }
        s.has_session = true;
        Ok(())
    }

    fn export_major(&mut self, out: &mut [u8]) -> Result<usize, EngineFault> {
        let s = lock(&self.0);
        if !s.has_session {
            return Err(EngineFault::NoSession);
        }
        copy_out(&s.major, out).ok_or(EngineFault::Export)
    }

    fn export_minor(&mut self, out: &mut [u8]) -> Result<usize, EngineFault> {
        let s = lock(&self.0);
        if !s.has_session {
            return Err(EngineFault::NoSession);
        }
        copy_out(&s.minor, out).ok_or(EngineFault::Export)
    }

    fn connect(&mut self, hooks: &mut dyn EngineHooks) -> Result<(), EngineFault> {
        let mut s = lock(&self.0);
        s.calls.push(EngineCall::Connect);
        s.pull(hooks);
        let next = s.connect_script.pop_front().unwrap_or(Err(EngineFault::WouldBlock));
        match next {
            Ok(()) => {
                if let Some(peer) = s.peer.clone() {
                    let cert = PeerCertificate {
                        serial: &peer.serial,
                        not_after: &peer.not_after,
                        subject: &peer.subject,
                        public_key: peer.public_key.as_deref(),
                    };
                    if !hooks.verify_peer(true, &cert) {
                        return Err(EngineFault::PeerUntrusted);
                    }
                }
                let _ = hooks.send(b"finished");
                Ok(())
            }
            Err(EngineFault::WouldBlock) => {
                let _ = hooks.send(b"flight");
                Err(EngineFault::WouldBlock)
            }
            Err(fault) => Err(fault),
        }
    }

    fn read(&mut self, hooks: &mut dyn EngineHooks, out: &mut [u8]) -> Result<usize, EngineFault> {
        let mut s = lock(&self.0);
        s.calls.push(EngineCall::Read);
        let cipher = s.pull(hooks).unwrap_or_default();
        match s.read_script.pop_front() {
            Some(Ok(plain)) => copy_out(&plain, out).ok_or(EngineFault::Fatal(-3)),
            Some(Err(fault)) => Err(fault),
            None => copy_out(&cipher, out).ok_or(EngineFault::Fatal(-3)),
        }
    }

    fn write(&mut self, hooks: &mut dyn EngineHooks, data: &[u8]) -> Result<usize, EngineFault> {
        lock(&self.0).calls.push(EngineCall::Write(data.to_vec()));
        hooks.send(data).map_err(|_| EngineFault::Fatal(-4))
    }

    fn shutdown(&mut self, hooks: &mut dyn EngineHooks, quiet: bool) {
        let mut s = lock(&self.0);
        s.calls.push(EngineCall::Shutdown { quiet });
        s.has_session = false;
        if !quiet {
            let _ = hooks.send(b"close_notify");
        }
    }
}

// ── Secure element / identity ─────────────────────────────────

#[derive(Debug)]
pub struct ElementState {
    pub head_end_subject: Vec<u8>,
    pub master_station_subject: Vec<u8>,
    pub key: RawPublicKey,
    pub random: [u8; 4],
    pub missing_device_cert: bool,
    pub key_writes: usize,
}

impl Default for ElementState {
    fn default() -> Self {
        Self {
            head_end_subject: head_end_subject(),
            master_station_subject: name(&[(0x03, "master-station")]),
            key: [0x42; 64],
            random: [0; 4],
            missing_device_cert: false,
            key_writes: 0,
        }
    }
}

pub struct MockElement(pub Arc<Mutex<ElementState>>);

impl SecureElement for MockElement {
    fn certificate(&mut self, kind: CertificateKind, out: &mut [u8]) -> Result<usize, ElementError> {
        let s = lock(&self.0);
        let bytes = match kind {
            CertificateKind::Device if s.missing_device_cert => {
                return Err(ElementError::NotProvisioned);
            }
            CertificateKind::Device | CertificateKind::NetworkRootCa => certificate_der(),
            CertificateKind::HeadEndSubject => s.head_end_subject.clone(),
            CertificateKind::MasterStationSubject => s.master_station_subject.clone(),
        };
        copy_out(&bytes, out).ok_or(ElementError::BufferTooSmall)
    }

    fn sign(&mut self, _digest: &[u8]) -> Result<[u8; 64], ElementError> {
        Ok([0x11; 64])
    }

    fn read_key(&mut self, _slot: KeySlot) -> Result<RawPublicKey, ElementError> {
        Ok(lock(&self.0).key)
    }

    fn write_key(&mut self, _slot: KeySlot, key: &RawPublicKey) -> Result<(), ElementError> {
        let mut s = lock(&self.0);
        s.key = *key;
        s.key_writes += 1;
        Ok(())
    }

    fn random(&mut self, out: &mut [u8]) -> Result<(), ElementError> {
        let s = lock(&self.0);
        for (dst, src) in out.iter_mut().zip(s.random.iter().cycle()) {
            *dst = *src;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct IdentityState {
    pub network_keys: Vec<RawPublicKey>,
    pub key_ids: Vec<[u8; KEY_ID_LEN]>,
}

pub struct MockIdentity(pub Arc<Mutex<IdentityState>>);

impl IdentityStore for MockIdentity {
    fn manufacturing_root_ca(&self, out: &mut [u8]) -> Result<usize, StorageError> {
        copy_out(&certificate_der(), out).ok_or(StorageError::OutOfBounds)
    }

    fn manufacturing_subject(
        &self,
        which: ManufacturingSubject,
        out: &mut [u8],
    ) -> Result<usize, StorageError> {
        match which {
            ManufacturingSubject::Rom => copy_out(&tool_subject(), out).ok_or(StorageError::OutOfBounds),
            ManufacturingSubject::Provisioned => Err(StorageError::NotFound),
        }
    }

    fn write_network_key(&mut self, key: &RawPublicKey) -> Result<(), StorageError> {
        lock(&self.0).network_keys.push(*key);
        Ok(())
    }

    fn write_subject_key_id(&mut self, key_id: &[u8; KEY_ID_LEN]) -> Result<(), StorageError> {
        lock(&self.0).key_ids.push(*key_id);
        Ok(())
    }
}

// ── Links ─────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct LinkLog {
    pub radio: Vec<(TxMetadata, Vec<u8>)>,
    pub serial: Vec<Vec<u8>>,
    pub serial_closed: usize,
}

pub struct MockRadio(pub Arc<Mutex<LinkLog>>);

impl RadioLink for MockRadio {
    fn send(&mut self, request: RadioRequest<'_>) -> Result<(), LinkError> {
        lock(&self.0).radio.push((request.meta, request.payload.to_vec()));
        Ok(())
    }

    fn head_end_context(&self) -> Option<u8> {
        Some(3)
    }
}

pub struct MockSerial(pub Arc<Mutex<LinkLog>>);

impl SerialLink for MockSerial {
    fn write(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
        lock(&self.0).serial.push(bytes.to_vec());
        Ok(())
    }

    fn session_closed(&mut self) {
        lock(&self.0).serial_closed += 1;
    }
}

// ── Clock / timer / mode / events ─────────────────────────────

/// Wall clock; zero reads as "not yet valid".
#[derive(Debug, Default)]
pub struct MockClock(pub AtomicU64);

impl MockClock {
    pub fn set(&self, secs: u64) {
        self.0.store(secs, Ordering::SeqCst);
    }
}

impl WallClock for MockClock {
    fn now(&self) -> Option<Timestamp> {
        match self.0.load(Ordering::SeqCst) {
            0 => None,
            secs => Some(Timestamp(secs)),
        }
    }
}

#[derive(Debug, Default)]
pub struct TimerLog {
    pub armed: Vec<Duration>,
    pub cancels: usize,
}

pub struct MockTimer(pub Arc<Mutex<TimerLog>>);

impl RetryTimer for MockTimer {
    fn arm(&mut self, after: Duration) {
        lock(&self.0).armed.push(after);
    }

    fn cancel(&mut self) {
        lock(&self.0).cancels += 1;
    }
}

pub struct MockSecurityMode(pub Arc<AtomicBool>);

impl SecurityModeSource for MockSecurityMode {
    fn is_enabled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct RecordingSink(pub Arc<Mutex<Vec<SessionEvent>>>);

impl EventSink for RecordingSink {
    fn emit(&mut self, event: &SessionEvent) {
        lock(&self.0).push(event.clone());
    }
}

// ── Platform ──────────────────────────────────────────────────

pub struct Platform {
    pub engine: Arc<Mutex<EngineState>>,
    pub element: Arc<Mutex<ElementState>>,
    pub identity: Arc<Mutex<IdentityState>>,
    pub store: Arc<Mutex<RegionStore>>,
    pub links: Arc<Mutex<LinkLog>>,
    pub clock: Arc<MockClock>,
    pub timer: Arc<Mutex<TimerLog>>,
    pub security: Arc<AtomicBool>,
    pub events: Arc<Mutex<Vec<SessionEvent>>>,
}

impl Platform {
    /// Valid clock, security mode on, empty flash.
    pub fn new() -> Self {
        let clock = Arc::new(MockClock::default());
        clock.set(NOW);
        Self {
            engine: Arc::default(),
            element: Arc::default(),
            identity: Arc::default(),
            store: Arc::new(Mutex::new(RegionStore::new())),
            links: Arc::default(),
            clock,
            timer: Arc::default(),
            security: Arc::new(AtomicBool::new(true)),
            events: Arc::default(),
        }
    }

    /// Same flash and secure element, fresh everything else (a reboot).
    pub fn reboot(&self) -> Self {
        let next = Self::new();
        Self {
            store: Arc::clone(&self.store),
            element: Arc::clone(&self.element),
            ..next
        }
    }

    pub fn ports(&self) -> SessionPorts {
        let storage: SharedStorage = self.store.clone();
        SessionPorts {
            engine: Box::new(ScriptedEngine(Arc::clone(&self.engine))),
            element: Box::new(MockElement(Arc::clone(&self.element))),
            identity: Box::new(MockIdentity(Arc::clone(&self.identity))),
            storage,
            radio: Box::new(MockRadio(Arc::clone(&self.links))),
            serial: Box::new(MockSerial(Arc::clone(&self.links))),
            clock: self.clock.clone(),
            security_mode: Box::new(MockSecurityMode(Arc::clone(&self.security))),
            events: Box::new(RecordingSink(Arc::clone(&self.events))),
        }
    }

    pub fn controller(&self, settings: &SessionSettings) -> (SessionController, SessionHandle) {
        SessionController::new(
            self.ports(),
            settings,
            Box::new(MockTimer(Arc::clone(&self.timer))),
            Mailbox::new(),
        )
    }

    pub fn engine(&self) -> MutexGuard<'_, EngineState> {
        lock(&self.engine)
    }

    pub fn links(&self) -> MutexGuard<'_, LinkLog> {
        lock(&self.links)
    }

    pub fn timer(&self) -> MutexGuard<'_, TimerLog> {
        lock(&self.timer)
    }

    pub fn events(&self) -> Vec<SessionEvent> {
        lock(&self.events).clone()
    }

    pub fn engine_calls(&self) -> Vec<EngineCall> {
        self.engine().calls.clone()
    }
}

impl Default for Platform {
    fn default() -> Self {
        Self::new()
    }
}

/// Short timeouts so blocking waits finish quickly.
pub fn fast_settings() -> SessionSettings {
    SessionSettings {
        timeouts: SessionTimeouts {
            time_check: Duration::from_millis(10),
            shutdown_ack: Duration::from_secs(2),
            cache_load_wait: Duration::from_millis(50),
            ..SessionTimeouts::default()
        },
        ..SessionSettings::default()
    }
}
