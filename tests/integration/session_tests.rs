//! Controller scenarios driven synchronously through `step`/`poll`.
//!
//! Each test owns a [`Platform`] of recording mocks and a controller that
//! never runs on its own thread, so every assertion sees a settled state.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use meterlink::app::events::SessionEvent;
use meterlink::app::ports::{EngineFault, RetransmitWindow};
use meterlink::cache::format::LegacyBlob;
use meterlink::cache::{LEGACY_REGION, MAJOR_REGION};
use meterlink::counters::Counter;
use meterlink::session::command::{Command, RxIndication};
use meterlink::session::controller::SessionController;
use meterlink::session::observers::ReceivePort;
use meterlink::session::{SessionHandle, SessionState, Transport};
use meterlink::transport::{Destination, HANDSHAKE_PORT, TxMetadata};
use meterlink::verifier::asn1::Timestamp;
use meterlink::verifier::subject_key_id;
use meterlink::{SessionError, config::SessionSettings};

use crate::mock_platform::{
    EngineCall, NOW, PeerCert, Platform, fast_settings, name, network_point, utc_time,
};

const METER_PORT: u16 = 7;

fn ind(port: u16) -> Option<RxIndication> {
    Some(RxIndication {
        port,
        source: Destination::Context(3),
    })
}

fn boot(p: &Platform, settings: &SessionSettings) -> (SessionController, SessionHandle) {
    let (mut ctl, handle) = p.controller(settings);
    ctl.boot();
    ctl.poll();
    (ctl, handle)
}

/// Boot and complete a radio handshake with the default head-end.
fn connected_radio(p: &Platform, settings: &SessionSettings) -> (SessionController, SessionHandle) {
    p.engine().peer = Some(PeerCert::head_end());
    let (mut ctl, handle) = boot(p, settings);
    assert_eq!(ctl.state(), SessionState::Connecting);

    p.engine().connect_script.push_back(Ok(()));
    handle
        .data_received(Transport::Radio, b"server-flight", ind(HANDSHAKE_PORT))
        .unwrap();
    ctl.poll();
    assert_eq!(ctl.state(), SessionState::Connected);
    assert_eq!(ctl.transport(), Transport::Radio);
    (ctl, handle)
}

fn collect_port(handle: &SessionHandle, port: u16) -> Arc<Mutex<Vec<Vec<u8>>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    handle
        .register_receive_handler(ReceivePort::Radio(port), move |msg| {
            sink.lock().unwrap().push(msg.payload.to_vec());
        })
        .unwrap();
    seen
}

// ── Cold boot ─────────────────────────────────────────────────

#[test]
fn cold_boot_without_time_sends_nothing_until_serial_connects() {
    let p = Platform::new();
    p.clock.set(0);
    p.engine().peer = Some(PeerCert::field_tool());
    p.engine().connect_script.push_back(Ok(()));

    let (mut ctl, handle) = p.controller(&fast_settings());
    ctl.boot();
    handle.connect_serial(|_| {}).unwrap();
    ctl.poll();

    assert!(!p.engine_calls().contains(&EngineCall::CreateContext(Transport::Radio)));
    assert!(p.links().radio.is_empty(), "no radio handshake without time");
    assert_eq!(ctl.transport(), Transport::Serial);
    assert_eq!(ctl.state(), SessionState::Connected);
    assert!(!handle.is_session_established());
}

#[test]
fn radio_connect_waits_for_valid_time() {
    let p = Platform::new();
    p.clock.set(0);
    let (mut ctl, _handle) = p.controller(&fast_settings());
    ctl.boot();

    let clock = Arc::clone(&p.clock);
    let setter = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        clock.set(NOW);
    });
    ctl.poll();
    setter.join().unwrap();

    assert_eq!(ctl.transport(), Transport::Radio);
    assert_eq!(ctl.state(), SessionState::Connecting);
    assert!(!p.links().radio.is_empty(), "first flight sent");
}

#[test]
fn radio_handshake_uses_transport_window() {
    let p = Platform::new();
    let settings = fast_settings();
    let (ctl, _handle) = boot(&p, &settings);

    let window = RetransmitWindow {
        initial: settings.timeouts.radio_transport,
        max: settings.timeouts.radio_transport * 5,
    };
    assert!(p.engine_calls().contains(&EngineCall::CreateSession(window)));
    assert_eq!(ctl.wait(), Some(settings.timeouts.radio_transport));

    let (meta, payload) = p.links().radio[0].clone();
    assert_eq!(meta.port, HANDSHAKE_PORT);
    assert_eq!(payload, b"flight");
}

// ── Live session failure ──────────────────────────────────────

#[test]
fn decrypt_failure_fails_session_and_schedules_backoff() {
    let p = Platform::new();
    let settings = fast_settings();
    let (mut ctl, handle) = connected_radio(&p, &settings);
    assert!(
        p.store.lock().unwrap().contents(MAJOR_REGION).unwrap().iter().any(|&b| b != 0),
        "major blob saved on connect"
    );

    p.engine().read_script.push_back(Err(EngineFault::Decrypt));
    handle
        .data_received(Transport::Radio, b"garbled", ind(METER_PORT))
        .unwrap();
    ctl.poll();

    assert_eq!(ctl.state(), SessionState::Failed);
    assert_eq!(ctl.transport(), Transport::None);
    let events = p.events();
    assert!(events.contains(&SessionEvent::DecryptionFailed));
    assert!(events.iter().any(|e| matches!(e, SessionEvent::SessionFailed { .. })));
    assert_eq!(p.timer().armed, vec![Duration::from_secs(30)]);
    assert!(
        p.store.lock().unwrap().contents(MAJOR_REGION).unwrap().iter().all(|&b| b == 0),
        "cache invalidated"
    );
    assert_eq!(handle.counters().get(Counter::InSecurityErrors), 1);
    assert_eq!(handle.buffers_in_use(), 0);

    // Recent success: no forced reconnect queued.
    ctl.poll();
    assert_eq!(ctl.state(), SessionState::Failed);
}

#[test]
fn stale_session_forces_reconnect_after_security_error() {
    let p = Platform::new();
    let settings = fast_settings();
    let (mut ctl, handle) = connected_radio(&p, &settings);

    p.clock.set(NOW + settings.timeouts.radio_session.as_secs() + 1);
    p.engine().read_script.push_back(Err(EngineFault::Decrypt));
    handle
        .data_received(Transport::Radio, b"garbled", ind(METER_PORT))
        .unwrap();
    ctl.poll();

    // ReconnectRadio ran: a fresh handshake is in flight.
    assert_eq!(ctl.transport(), Transport::Radio);
    assert_eq!(ctl.state(), SessionState::Connecting);
}

#[test]
fn stale_reconnect_disarms_pending_retry() {
    let p = Platform::new();
    let settings = fast_settings();
    let (mut ctl, handle) = connected_radio(&p, &settings);
    let cancels = p.timer().cancels;

    p.clock.set(NOW + settings.timeouts.radio_session.as_secs() + 1);
    p.engine().read_script.push_back(Err(EngineFault::Decrypt));
    handle
        .data_received(Transport::Radio, b"garbled", ind(METER_PORT))
        .unwrap();
    ctl.poll();

    assert_eq!(p.timer().armed.len(), 1, "backoff armed by the failure");
    assert!(p.timer().cancels > cancels, "reconnect disarmed it");
    assert_eq!(ctl.state(), SessionState::Connecting);
    assert!(
        p.store.lock().unwrap().contents(MAJOR_REGION).unwrap().iter().all(|&b| b == 0),
        "no stale material survives the reconnect"
    );
}

// ── Backoff ───────────────────────────────────────────────────

#[test]
fn backoff_ceiling_doubles_per_failure_and_resets_on_success() {
    let p = Platform::new();
    p.engine().peer = Some(PeerCert::head_end());
    p.engine().connect_script.push_back(Err(EngineFault::Fatal(-80)));
    let (mut ctl, handle) = boot(&p, &fast_settings());

    assert_eq!(ctl.state(), SessionState::Failed);
    assert_eq!(handle.backoff_ceiling_secs(), 3_600);

    p.engine().connect_script.push_back(Err(EngineFault::Fatal(-80)));
    ctl.step(Some(Command::ConnectRadio));
    assert_eq!(ctl.state(), SessionState::Failed);
    assert_eq!(handle.backoff_ceiling_secs(), 7_200);

    for delay in &p.timer().armed {
        assert!((30..=3_600).contains(&delay.as_secs()));
    }

    ctl.step(Some(Command::ConnectRadio));
    p.engine().connect_script.push_back(Ok(()));
    handle
        .data_received(Transport::Radio, b"server-flight", ind(HANDSHAKE_PORT))
        .unwrap();
    ctl.poll();
    assert_eq!(ctl.state(), SessionState::Connected);
    assert_eq!(handle.backoff_ceiling_secs(), 1_800);
}

#[test]
fn untrusted_head_end_is_rejected() {
    let p = Platform::new();
    let mut rogue = PeerCert::head_end();
    rogue.subject = name(&[(0x03, "rogue")]);
    p.engine().peer = Some(rogue);

    let (mut ctl, handle) = boot(&p, &fast_settings());
    let results = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&results);
    handle.register_connect_result(move |r| sink.lock().unwrap().push(r));

    p.engine().connect_script.push_back(Ok(()));
    handle
        .data_received(Transport::Radio, b"server-flight", ind(HANDSHAKE_PORT))
        .unwrap();
    ctl.poll();

    assert_eq!(ctl.state(), SessionState::Failed);
    assert_eq!(
        results.lock().unwrap().as_slice(),
        &[Err(SessionError::CertificateUntrusted)]
    );
    assert_eq!(handle.counters().get(Counter::InNoSessionErrors), 1);
    assert_eq!(p.timer().armed.len(), 1);
}

#[test]
fn missing_device_certificate_backs_off_without_context() {
    let p = Platform::new();
    p.element.lock().unwrap().missing_device_cert = true;
    let (ctl, _handle) = boot(&p, &fast_settings());

    assert!(p.engine_calls().is_empty());
    assert_eq!(ctl.state(), SessionState::Failed);
    assert_eq!(p.timer().armed.len(), 1);
}

#[test]
fn rx_timeout_while_connecting_doubles_wait() {
    let p = Platform::new();
    let settings = fast_settings();
    let (mut ctl, _handle) = boot(&p, &settings);

    ctl.step(None);
    assert_eq!(p.engine().timeouts_seen, 1);
    assert_eq!(ctl.wait(), Some(settings.timeouts.radio_transport * 2));
    assert_eq!(ctl.state(), SessionState::Connecting);
}

#[test]
fn retransmission_wait_stops_at_window_max() {
    let p = Platform::new();
    let settings = fast_settings();
    let (mut ctl, _handle) = boot(&p, &settings);

    for _ in 0..6 {
        ctl.step(None);
    }

    assert_eq!(p.engine().timeouts_seen, 6);
    assert_eq!(ctl.wait(), Some(settings.timeouts.radio_transport * 5));
}

// ── Commands during backoff ───────────────────────────────────

/// Connect, then fail the live session so the retry timer is armed.
fn backing_off(p: &Platform) -> (SessionController, SessionHandle) {
    let (mut ctl, handle) = connected_radio(p, &fast_settings());
    p.engine().read_script.push_back(Err(EngineFault::Decrypt));
    handle
        .data_received(Transport::Radio, b"garbled", ind(METER_PORT))
        .unwrap();
    ctl.poll();
    assert_eq!(ctl.state(), SessionState::Failed);
    assert_eq!(ctl.transport(), Transport::None);
    assert_eq!(p.timer().armed.len(), 1);
    (ctl, handle)
}

#[test]
fn disconnect_radio_during_backoff_disarms_retry() {
    let p = Platform::new();
    let (mut ctl, handle) = backing_off(&p);
    let cancels = p.timer().cancels;

    handle.disconnect_radio().unwrap();
    ctl.poll();

    assert_eq!(ctl.state(), SessionState::None);
    assert_eq!(handle.session_state(), SessionState::None);
    assert_eq!(ctl.wait(), None);
    assert_eq!(p.timer().cancels, cancels + 1);
    assert_eq!(p.timer().armed.len(), 1, "nothing re-armed");
}

#[test]
fn security_mode_change_during_backoff_disarms_retry() {
    let p = Platform::new();
    let (mut ctl, _handle) = backing_off(&p);
    let cancels = p.timer().cancels;

    ctl.step(Some(Command::SecurityModeChanged));

    assert_eq!(ctl.state(), SessionState::None);
    assert_eq!(ctl.transport(), Transport::None);
    assert_eq!(p.timer().cancels, cancels + 1);
    assert!(
        p.store.lock().unwrap().contents(MAJOR_REGION).unwrap().iter().all(|&b| b == 0)
    );

    // Security mode is still on: the queued ConnectRadio starts afresh.
    ctl.poll();
    assert_eq!(ctl.transport(), Transport::Radio);
    assert_eq!(ctl.state(), SessionState::Connecting);
}

#[test]
fn serial_connect_during_backoff_disarms_retry() {
    let p = Platform::new();
    let (mut ctl, handle) = backing_off(&p);
    let cancels = p.timer().cancels;

    handle.connect_serial(|_| {}).unwrap();
    ctl.poll();

    assert_eq!(ctl.transport(), Transport::Serial);
    assert_eq!(ctl.state(), SessionState::Connecting);
    assert_eq!(p.timer().cancels, cancels + 1);
    assert_eq!(p.timer().armed.len(), 1);
}

// ── Network key learning ──────────────────────────────────────

#[test]
fn new_head_end_key_is_persisted() {
    let p = Platform::new();
    let mut peer = PeerCert::head_end();
    peer.public_key = Some(network_point(0x55));
    p.engine().peer = Some(peer);

    let (mut ctl, handle) = boot(&p, &fast_settings());
    p.engine().connect_script.push_back(Ok(()));
    handle
        .data_received(Transport::Radio, b"server-flight", ind(HANDSHAKE_PORT))
        .unwrap();
    ctl.poll();

    assert_eq!(ctl.state(), SessionState::Connected);
    assert_eq!(p.element.lock().unwrap().key, [0x55; 64]);
    assert_eq!(p.identity.lock().unwrap().network_keys, vec![[0x55; 64]]);
    assert_eq!(
        p.identity.lock().unwrap().key_ids,
        vec![subject_key_id(&network_point(0x55))]
    );
    assert!(p.events().contains(&SessionEvent::NetworkKeyRotated));
    assert_eq!(handle.peer_certificate().serial.as_slice(), &[1, 2, 3]);
}

// ── Data path ─────────────────────────────────────────────────

#[test]
fn received_data_reaches_handler_and_frees_buffers() {
    let p = Platform::new();
    let (mut ctl, handle) = connected_radio(&p, &fast_settings());
    let seen = collect_port(&handle, METER_PORT);

    handle
        .data_received(Transport::Radio, b"meter-read", ind(METER_PORT))
        .unwrap();
    ctl.poll();

    assert_eq!(seen.lock().unwrap().as_slice(), &[b"meter-read".to_vec()]);
    assert_eq!(handle.counters().get(Counter::InUcast), 1);
    assert_eq!(handle.buffers_in_use(), 0);
}

#[test]
fn radio_data_without_handler_drops_session() {
    let p = Platform::new();
    let (mut ctl, handle) = connected_radio(&p, &fast_settings());

    handle
        .data_received(Transport::Radio, b"orphan", ind(99))
        .unwrap();
    ctl.poll();

    assert_eq!(ctl.state(), SessionState::Failed);
    assert_eq!(handle.buffers_in_use(), 0);
}

#[test]
fn frame_for_inactive_transport_is_dropped() {
    let p = Platform::new();
    let (mut ctl, handle) = boot(&p, &fast_settings());
    let calls_before = p.engine_calls().len();

    handle
        .data_received(Transport::Serial, b"stray", None)
        .unwrap();
    ctl.poll();

    assert_eq!(p.engine_calls().len(), calls_before);
    assert_eq!(ctl.state(), SessionState::Connecting);
    assert_eq!(handle.counters().get(Counter::InNoSessionErrors), 0);
    assert_eq!(handle.buffers_in_use(), 0);
}

#[test]
fn frames_with_no_session_are_counted_for_either_transport() {
    let p = Platform::new();
    let (mut ctl, handle) = p.controller(&fast_settings());

    handle
        .data_received(Transport::Serial, b"early", None)
        .unwrap();
    handle
        .data_received(Transport::Radio, b"early", ind(METER_PORT))
        .unwrap();
    ctl.poll();

    assert_eq!(handle.counters().get(Counter::InNoSessionErrors), 2);
    assert_eq!(ctl.state(), SessionState::None);
    assert!(p.engine_calls().is_empty());
    assert_eq!(handle.buffers_in_use(), 0);
}

#[test]
fn application_data_without_session_is_counted() {
    let p = Platform::new();
    let (mut ctl, handle) = p.controller(&fast_settings());

    handle.send_application_data(b"reading", None).unwrap();
    ctl.poll();

    assert_eq!(handle.counters().get(Counter::OutNoSessionErrors), 1);
    assert!(p.links().radio.is_empty());
    assert_eq!(handle.buffers_in_use(), 0);
}

#[test]
fn application_data_carries_caller_metadata() {
    let p = Platform::new();
    let (mut ctl, handle) = connected_radio(&p, &fast_settings());
    let meta = TxMetadata {
        port: 9,
        qos: 0,
        destination: Destination::Context(3),
        confirm_tag: Some(77),
    };

    handle.send_application_data(b"reading", Some(meta)).unwrap();
    ctl.poll();

    let links = p.links();
    let (sent_meta, payload) = links.radio.last().unwrap();
    assert_eq!(*sent_meta, meta);
    assert_eq!(payload, b"reading");
    assert_eq!(handle.counters().get(Counter::OutUcast), 1);
}

#[test]
fn expired_peer_certificate_triggers_reconnect_when_enabled() {
    let p = Platform::new();
    let mut peer = PeerCert::head_end();
    peer.not_after = utc_time("251231235959Z");
    p.engine().peer = Some(peer);
    let settings = SessionSettings {
        drop_session_on_expired_cert: true,
        ..fast_settings()
    };
    let (mut ctl, handle) = connected_radio(&p, &settings);
    let _seen = collect_port(&handle, METER_PORT);

    handle
        .data_received(Transport::Radio, b"meter-read", ind(METER_PORT))
        .unwrap();
    ctl.poll();

    assert!(p.engine_calls().contains(&EngineCall::Shutdown { quiet: false }));
    assert_eq!(ctl.state(), SessionState::Connecting);
}

// ── Serial ────────────────────────────────────────────────────

#[test]
fn serial_idle_timeout_closes_and_resumes_radio() {
    let p = Platform::new();
    let settings = fast_settings();
    p.engine().peer = Some(PeerCert::field_tool());
    p.engine().connect_script.push_back(Ok(()));
    let (mut ctl, handle) = p.controller(&settings);

    let results = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&results);
    handle
        .connect_serial(move |r| sink.lock().unwrap().push(r.is_ok()))
        .unwrap();
    ctl.poll();

    assert_eq!(ctl.transport(), Transport::Serial);
    assert_eq!(ctl.state(), SessionState::Connected);
    assert_eq!(ctl.wait(), Some(settings.timeouts.serial_session));
    assert_eq!(results.lock().unwrap().as_slice(), &[true]);

    ctl.step(None);
    assert_eq!(ctl.state(), SessionState::ShuttingDown);

    ctl.poll();
    assert_eq!(p.links().serial_closed, 1);
    assert_eq!(ctl.transport(), Transport::Radio);
    assert_eq!(ctl.state(), SessionState::Connecting);
}

#[test]
fn serial_connect_preempts_radio_quietly() {
    let p = Platform::new();
    let (mut ctl, handle) = connected_radio(&p, &fast_settings());
    let radio_sent = p.links().radio.len();

    handle.connect_serial(|_| {}).unwrap();
    ctl.poll();

    assert!(p.engine_calls().contains(&EngineCall::Shutdown { quiet: true }));
    assert_eq!(p.links().radio.len(), radio_sent, "no close-notify on radio");
    assert_eq!(ctl.transport(), Transport::Serial);
}

#[test]
fn radio_connect_deferred_while_serial_active() {
    let p = Platform::new();
    let (mut ctl, handle) = p.controller(&fast_settings());
    handle.connect_serial(|_| {}).unwrap();
    ctl.poll();
    assert_eq!(ctl.transport(), Transport::Serial);

    ctl.step(Some(Command::ConnectRadio));

    assert!(!p.engine_calls().contains(&EngineCall::CreateContext(Transport::Radio)));
    assert_eq!(ctl.transport(), Transport::Serial);
}

#[test]
fn serial_handshake_failure_reports_and_restores_radio() {
    let p = Platform::new();
    p.engine().connect_script.push_back(Err(EngineFault::Timeout));
    let (mut ctl, handle) = p.controller(&fast_settings());

    let results = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&results);
    handle
        .connect_serial(move |r| sink.lock().unwrap().push(r))
        .unwrap();
    ctl.poll();

    assert_eq!(
        results.lock().unwrap().as_slice(),
        &[Err(SessionError::TransportTimeout)]
    );
    assert_eq!(p.links().serial_closed, 1);
    assert_eq!(ctl.transport(), Transport::Radio);
}

// ── Cache ─────────────────────────────────────────────────────

#[test]
fn legacy_cache_is_migrated_on_first_boot() {
    let p = Platform::new();
    let not_after = Timestamp(NOW + 86_400);
    let legacy = LegacyBlob {
        available: true,
        cert_not_after: Some(not_after),
        state: heapless::Vec::from_slice(&[0x5A; 200]).unwrap(),
    };
    p.store
        .lock()
        .unwrap()
        .preload(LEGACY_REGION, legacy.encode().to_vec());

    let (ctl, handle) = boot(&p, &fast_settings());
    assert_eq!(ctl.state(), SessionState::Connected);
    assert!(p.engine_calls().contains(&EngineCall::Restore { legacy: true }));
    assert!(
        p.store.lock().unwrap().contents(LEGACY_REGION).unwrap().iter().all(|&b| b == 0),
        "legacy region erased"
    );
    assert_eq!(handle.peer_certificate().not_after, Some(not_after));
    assert!(handle.is_session_established());

    let rebooted = p.reboot();
    let (ctl, _handle) = boot(&rebooted, &fast_settings());
    assert_eq!(ctl.state(), SessionState::Connected);
    assert!(
        rebooted
            .engine_calls()
            .contains(&EngineCall::Restore { legacy: false })
    );
}

#[test]
fn rejected_cache_falls_back_to_full_handshake() {
    let p = Platform::new();
    connected_radio(&p, &fast_settings());

    let rebooted = p.reboot();
    rebooted.engine().reject_restore = true;
    let (ctl, _handle) = boot(&rebooted, &fast_settings());

    let calls = rebooted.engine_calls();
    assert!(calls.contains(&EngineCall::Restore { legacy: false }));
    assert!(calls.iter().any(|c| matches!(c, EngineCall::CreateSession(_))));
    assert_eq!(ctl.state(), SessionState::Connecting);
}

#[test]
fn reconnect_radio_discards_cache() {
    let p = Platform::new();
    let (mut ctl, _handle) = connected_radio(&p, &fast_settings());

    ctl.step(Some(Command::ReconnectRadio));

    assert_eq!(ctl.state(), SessionState::Connecting);
    assert!(
        p.store.lock().unwrap().contents(MAJOR_REGION).unwrap().iter().all(|&b| b == 0)
    );
}

#[test]
fn security_mode_change_tears_down_and_waits() {
    let p = Platform::new();
    let (mut ctl, _handle) = connected_radio(&p, &fast_settings());

    // Still enabled: the controller reconnects straight away.
    ctl.step(Some(Command::SecurityModeChanged));
    assert_eq!(ctl.transport(), Transport::None);
    assert!(matches!(ctl.poll(), meterlink::session::controller::LoopControl::Continue));
    assert_eq!(ctl.transport(), Transport::Radio);
}

#[test]
fn shutdown_halts_and_acknowledges() {
    let p = Platform::new();
    let (mut ctl, handle) = p.controller(&fast_settings());
    handle.connect_serial(|_| {}).unwrap();
    ctl.poll();

    let control = ctl.step(Some(Command::Shutdown));

    assert_eq!(control, meterlink::session::controller::LoopControl::Halt);
    assert_eq!(ctl.state(), SessionState::ShuttingDown);
    assert_eq!(p.links().serial_closed, 1);
}
