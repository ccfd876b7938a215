//! End-to-end UDP receive tests: a real loopback socket feeds a session
//! whose audio sink is a recording probe.

mod common;

use std::net::UdpSocket;
use std::thread;
use std::time::Duration;

use audiopipe::audio::StreamParams;
use audiopipe::network::{Session, SessionConfig, Transport};

use common::{mono_packet, probe_factory};

fn start_udp_session(jitter_ms: u32) -> (Session, common::SinkProbe, UdpSocket) {
    let (factory, probe) = probe_factory();
    let config = SessionConfig::new(0, jitter_ms, Transport::Udp);
    let session = Session::start_with_sink(config, factory).expect("failed to start session");

    let sender = UdpSocket::bind("127.0.0.1:0").expect("failed to bind sender socket");
    sender
        .connect(("127.0.0.1", session.local_addr().port()))
        .expect("failed to connect sender socket");
    (session, probe, sender)
}

#[test]
fn test_udp_happy_path() {
    let (mut session, probe, sender) = start_udp_session(10);

    for seq in 0..100u32 {
        sender.send(&mono_packet(seq)).expect("send failed");
        thread::sleep(Duration::from_millis(5));
    }

    // Let the player drain everything that arrived.
    thread::sleep(Duration::from_millis(500));

    let snapshot = session.snapshot();
    assert_eq!(snapshot.counters.packets, 100);
    assert_eq!(snapshot.counters.parse_errors, 0);
    assert_eq!(snapshot.counters.payload_errors, 0);

    assert_eq!(
        snapshot.stream,
        Some(StreamParams {
            sample_rate: 48_000,
            channels: 1,
            samples_per_channel: 240,
        })
    );

    let buffer = snapshot.buffer.expect("audio pipeline initialized");
    assert_eq!(buffer.pushed, 100);
    assert_eq!(buffer.overflow_dropped, 0);
    assert_eq!(buffer.late, 0, "FIFO mode never counts late frames");
    assert!(buffer.primed);
    // Every real frame was delivered exactly once.
    assert_eq!(buffer.played - buffer.missing, 100);
    assert_eq!(buffer.buffered, 0);

    // The probe saw one open with the learned format, and at least the
    // 100 real frames (plus silence substitutions after the drain).
    assert_eq!(probe.opened(), 1);
    assert!(probe.frames_written() >= 100);

    assert!(session.is_running());
    session.stop();
    assert!(!session.is_running());
}

#[test]
fn test_sink_buffer_request_covers_capacity() {
    // jitter 20 ms at 5 ms frames: base target 4, adaptive ceiling 12,
    // capacity max(4 + 16, 12 + 4) = 20 frames.
    let (mut session, probe, sender) = start_udp_session(20);

    sender.send(&mono_packet(0)).expect("send failed");
    thread::sleep(Duration::from_millis(300));

    let (params, min_buffer_bytes) = probe.open_request().expect("sink opened");
    assert_eq!(params.frame_bytes(), 480);
    assert_eq!(min_buffer_bytes, 480 * (20 + 2));

    let buffer = session.snapshot().buffer.expect("pipeline initialized");
    assert_eq!(buffer.target_frames, 4);

    session.stop();
}

#[test]
fn test_malformed_datagram_counts_parse_error_without_audio_init() {
    let (mut session, probe, sender) = start_udp_session(20);

    sender.send(&[0xDEu8; 10]).expect("send failed");
    thread::sleep(Duration::from_millis(300));

    let snapshot = session.snapshot();
    assert_eq!(snapshot.counters.packets, 1);
    assert_eq!(snapshot.counters.parse_errors, 1);
    assert!(snapshot.stream.is_none(), "garbage must not initialize audio");
    assert!(snapshot.buffer.is_none());
    assert_eq!(probe.opened(), 0);
    assert!(session.is_running());

    session.stop();
}

#[test]
fn test_payload_size_mismatch_counts_payload_error() {
    let (mut session, _probe, sender) = start_udp_session(20);

    // First packet fixes the expected frame geometry at 240 samples.
    sender.send(&mono_packet(0)).expect("send failed");
    thread::sleep(Duration::from_millis(200));

    // A well-formed packet with a different frame size is a payload
    // mismatch, dropped before the jitter buffer.
    sender
        .send(&common::packet(1, 48_000, 1, 120, 7))
        .expect("send failed");
    thread::sleep(Duration::from_millis(300));

    let snapshot = session.snapshot();
    assert_eq!(snapshot.counters.packets, 2);
    assert_eq!(snapshot.counters.parse_errors, 0);
    assert_eq!(snapshot.counters.payload_errors, 1);
    assert_eq!(snapshot.buffer.expect("pipeline initialized").pushed, 1);

    session.stop();
}

#[test]
fn test_stop_is_idempotent_and_restart_is_fresh() {
    let (mut session, _probe, sender) = start_udp_session(20);

    sender.send(&mono_packet(0)).expect("send failed");
    thread::sleep(Duration::from_millis(200));
    assert_eq!(session.snapshot().counters.packets, 1);

    session.stop();
    session.stop();
    assert!(!session.is_running());
    drop(session);

    // A new session starts from zeroed counters and no pipeline.
    let (mut fresh, probe, _sender) = start_udp_session(20);
    let snapshot = fresh.snapshot();
    assert_eq!(snapshot.counters.packets, 0);
    assert!(snapshot.buffer.is_none());
    assert_eq!(probe.opened(), 0);
    fresh.stop();
}

#[test]
fn test_bind_conflict_is_an_error() {
    let taken = UdpSocket::bind("0.0.0.0:0").expect("failed to reserve a port");
    let port = taken.local_addr().unwrap().port();

    let (factory, _probe) = probe_factory();
    let config = SessionConfig::new(port, 20, Transport::Udp);
    assert!(Session::start_with_sink(config, factory).is_err());
}

#[test]
fn test_starved_stream_raises_jitter_target() {
    // 20 ms of buffering at 5 ms frames: base target 4.
    let (mut session, _probe, sender) = start_udp_session(20);

    for seq in 0..10u32 {
        sender.send(&mono_packet(seq)).expect("send failed");
        thread::sleep(Duration::from_millis(5));
    }

    // Then go silent. The player keeps hitting its pop deadline, the
    // sampler sees bad windows, and the controller raises the target
    // within two windows.
    thread::sleep(Duration::from_millis(2600));

    let buffer = session.snapshot().buffer.expect("pipeline initialized");
    assert!(
        buffer.target_frames > 4,
        "expected a raise above the base target, got {}",
        buffer.target_frames
    );

    session.stop();
}
