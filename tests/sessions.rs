//! Session orchestration driven end to end through the simulated transport.
//!
//! Every test plays the firmware side with a [`SimController`]: it pushes
//! notifications, drops links and inspects what the host wrote.

use std::sync::Arc;
use std::time::Duration;

use audiovisor::command::Command;
use audiovisor::prelude::*;

/// Upper bound for the pump to catch up with pushed notifications.
const SETTLE: Duration = Duration::from_secs(2);

fn frame(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn manager(sim: &Arc<SimTransport>) -> SessionManager {
    SessionManager::new(sim.clone(), SessionConfig::default())
}

/// Wait until `pred` holds for the published registry state.
async fn wait_until(sessions: &SessionManager, what: &str, pred: impl FnMut(&RegistryState) -> bool) {
    let mut rx = sessions.subscribe();
    tokio::time::timeout(SETTLE, rx.wait_for(pred))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
        .expect("registry closed");
}

fn frames_of(state: &RegistryState, id: &str) -> u64 {
    state.get(&SessionId::from(id)).map_or(0, |s| s.frames)
}

// ── Lifecycle ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn disconnecting_one_session_leaves_the_other_untouched() {
    let sim = Arc::new(SimTransport::new());
    let ctl_a = sim.push(SimDevice::new("a", "AV-LEFT"));
    let ctl_b = sim.push(SimDevice::new("b", "AV-UP"));
    let sessions = manager(&sim);

    let a = sessions.connect(DeviceKind::Lr).await.unwrap();
    let b = sessions.connect(DeviceKind::Ud).await.unwrap();
    assert_eq!(a.as_str(), "a");
    assert_eq!(b.as_str(), "b");

    assert!(ctl_a.notify(frame(&[10.0, 20.0])).await);
    assert!(ctl_b.notify(frame(&[30.0, 40.0, 50.0, 60.0])).await);
    wait_until(&sessions, "one frame each", |s| {
        frames_of(s, "a") == 1 && frames_of(s, "b") == 1
    })
    .await;
    let before = sessions.session(&b).unwrap();

    sessions.disconnect(Some(&a)).await;

    let state = sessions.state();
    assert_eq!(state.len(), 1);
    assert!(!state.contains(&a));
    let after = state.get(&b).unwrap();
    assert_eq!(after.kind, DeviceKind::Ud);
    assert_eq!(after.frames, before.frames);
    for ch in Channel::ALL {
        assert_eq!(after.buffers.samples(ch), before.buffers.samples(ch));
    }
    assert_eq!(after.buffers.samples(Channel::Up), vec![5.0]);
    drop(state);

    assert!(!ctl_a.is_connected());
    assert!(ctl_b.is_connected());
    assert!(!ctl_a.notify(frame(&[1.0, 1.0])).await);
}

#[tokio::test]
async fn disconnect_twice_is_the_same_as_once() {
    let sim = Arc::new(SimTransport::new());
    let ctl = sim.push(SimDevice::new("a", "AudioVisor"));
    let sessions = manager(&sim);
    let id = sessions.connect(DeviceKind::Lr).await.unwrap();

    sessions.disconnect(Some(&id)).await;
    sessions.disconnect(Some(&id)).await;

    assert!(sessions.state().is_empty());
    assert!(!sessions.is_connected(&id));
    assert_eq!(ctl.disconnect_calls(), 1);
    assert_eq!(sessions.status(), None);
}

#[tokio::test]
async fn disconnect_without_target_closes_everything() {
    let sim = Arc::new(SimTransport::new());
    let ctls: Vec<_> = ["a", "b", "c"]
        .into_iter()
        .map(|id| sim.push(SimDevice::new(id, "AudioVisor")))
        .collect();
    let sessions = manager(&sim);
    for _ in 0..3 {
        sessions.connect(DeviceKind::Lr).await.unwrap();
    }
    assert_eq!(sessions.state().len(), 3);

    sessions.disconnect(None).await;

    assert!(sessions.state().is_empty());
    assert!(ctls.iter().all(|c| c.disconnect_calls() == 1));
}

#[tokio::test]
async fn device_dropping_the_link_ends_its_session() {
    let sim = Arc::new(SimTransport::new());
    let ctl = sim.push(SimDevice::new("a", "AudioVisor"));
    let sessions = manager(&sim);
    let id = sessions.connect(DeviceKind::Lr).await.unwrap();

    ctl.drop_link().await;
    wait_until(&sessions, "session removal", |s| s.is_empty()).await;
    assert!(!sessions.is_connected(&id));

    // The same device pairing again gets a fresh session.
    let ctl = sim.push(SimDevice::new("a", "AudioVisor"));
    let again = sessions.connect(DeviceKind::Lr).await.unwrap();
    assert_eq!(again, id);
    assert!(ctl.notify(frame(&[1.0, 2.0])).await);
    wait_until(&sessions, "frame on new session", |s| frames_of(s, "a") == 1).await;
    assert!(sessions.is_connected(&id));
}

#[tokio::test]
async fn second_connect_with_same_id_is_rejected() {
    let sim = Arc::new(SimTransport::new());
    let first = sim.push(SimDevice::new("same", "AudioVisor"));
    let second = sim.push(SimDevice::new("same", "AudioVisor"));
    let sessions = manager(&sim);

    let id = sessions.connect(DeviceKind::Lr).await.unwrap();
    assert_eq!(sessions.connect(DeviceKind::Ud).await, None);
    assert!(sessions
        .status()
        .is_some_and(|s| s.contains("already connected")));

    // The live session keeps its kind and link.
    assert_eq!(sessions.session(&id).unwrap().kind, DeviceKind::Lr);
    assert!(first.is_connected());
    assert_eq!(first.disconnect_calls(), 0);
    assert!(!second.is_connected());
}

#[tokio::test]
async fn concurrent_connects_are_all_registered() {
    let sim = Arc::new(SimTransport::new());
    sim.push(SimDevice::new("slow", "AV-1").with_connect_delay(Duration::from_millis(60)));
    sim.push(SimDevice::new("fast", "AV-2").with_connect_delay(Duration::from_millis(5)));
    sim.push(SimDevice::new("mid", "AV-3").with_connect_delay(Duration::from_millis(30)));
    let sessions = manager(&sim);

    let (a, b, c) = tokio::join!(
        sessions.connect(DeviceKind::Lr),
        sessions.connect(DeviceKind::Ud),
        sessions.connect(DeviceKind::Lr),
    );

    let mut ids: Vec<_> = [a, b, c].into_iter().map(|id| id.unwrap()).collect();
    ids.sort();
    assert_eq!(
        ids,
        vec![SessionId::from("fast"), SessionId::from("mid"), SessionId::from("slow")]
    );
    assert_eq!(sessions.state().len(), 3);
}

#[tokio::test]
async fn devices_without_ids_pairing_together_both_register() {
    let sim = Arc::new(SimTransport::new());
    let ctl_a = sim.push(SimDevice::new("unused", "AV-1").without_id());
    let ctl_b = sim.push(SimDevice::new("unused", "AV-2").without_id());
    let sessions = manager(&sim);

    let (a, b) = tokio::join!(
        sessions.connect(DeviceKind::Lr),
        sessions.connect(DeviceKind::Lr),
    );

    let (a, b) = (a.unwrap(), b.unwrap());
    assert_ne!(a, b);
    assert!(a.as_str().starts_with("device-") && b.as_str().starts_with("device-"));
    assert_eq!(sessions.state().len(), 2);
    assert_eq!(sessions.status(), None);
    assert!(ctl_a.is_connected() && ctl_b.is_connected());
}

#[tokio::test]
async fn losing_a_pairing_race_releases_the_link() {
    let sim = Arc::new(SimTransport::new());
    let delay = Duration::from_millis(20);
    let first = sim.push(SimDevice::new("same", "AV-1").with_connect_delay(delay));
    let second = sim.push(SimDevice::new("same", "AV-2").with_connect_delay(delay));
    let sessions = manager(&sim);

    // Both pass the early id check before either registers.
    let (a, b) = tokio::join!(
        sessions.connect(DeviceKind::Lr),
        sessions.connect(DeviceKind::Lr),
    );

    assert_eq!([&a, &b].iter().filter(|r| r.is_some()).count(), 1);
    assert_eq!(sessions.state().len(), 1);
    assert!(sessions
        .status()
        .is_some_and(|s| s.contains("already connected")));

    let (winner, loser) = if a.is_some() { (first, second) } else { (second, first) };
    assert!(winner.is_connected());
    assert_eq!(winner.disconnect_calls(), 0);
    assert!(!loser.is_connected());
    assert_eq!(loser.disconnect_calls(), 1);
}

#[tokio::test]
async fn unknown_names_are_not_paired() {
    let sim = Arc::new(SimTransport::new());
    sim.push(SimDevice::new("x", "SomeHeadphones"));
    let sessions = manager(&sim);

    assert_eq!(sessions.connect(DeviceKind::Lr).await, None);
    assert!(sessions.state().is_empty());
    assert_eq!(sim.pending(), 1);
}

// ── Ingestion ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn short_payload_is_dropped_without_touching_buffers() {
    let sim = Arc::new(SimTransport::new());
    let ctl = sim.push(SimDevice::new("a", "AudioVisor"));
    let sessions = manager(&sim);
    let id = sessions.connect(DeviceKind::Lr).await.unwrap();

    assert!(ctl.notify(frame(&[4.0, 8.0])).await);
    assert!(ctl.notify(vec![1, 2, 3]).await);
    assert!(ctl.notify(Vec::new()).await);
    wait_until(&sessions, "two drops", |s| {
        s.get(&id).is_some_and(|s| s.dropped == 2)
    })
    .await;

    let s = sessions.session(&id).unwrap();
    assert_eq!(s.frames, 1);
    assert_eq!(s.buffers.samples(Channel::Left), vec![0.4]);
    assert_eq!(s.buffers.samples(Channel::Right), vec![0.8]);
    assert!(s.buffers.get(Channel::Up).is_none());
}

#[tokio::test]
async fn raw_tap_sees_every_payload_before_decoding() {
    let sim = Arc::new(SimTransport::new());
    let ctl = sim.push(SimDevice::new("a", "AudioVisor"));
    let sessions = manager(&sim);
    let id = sessions.connect(DeviceKind::Lr).await.unwrap();
    let mut raw = sessions.subscribe_raw();

    let good = frame(&[1.0, 2.0]);
    assert!(ctl.notify(good.clone()).await);
    assert!(ctl.notify(vec![9, 9]).await);

    for expected in [good, vec![9, 9]] {
        let p = tokio::time::timeout(SETTLE, raw.recv()).await.unwrap().unwrap();
        assert_eq!(p.id, id);
        assert_eq!(&p.bytes[..], &expected[..]);
    }
    wait_until(&sessions, "one frame and one drop", |s| {
        s.get(&id).is_some_and(|s| s.frames == 1 && s.dropped == 1)
    })
    .await;
}

#[tokio::test]
async fn buffers_keep_the_newest_samples() {
    let sim = Arc::new(SimTransport::new());
    let ctl = sim.push(SimDevice::new("a", "AudioVisor"));
    let sessions = manager(&sim);
    let id = sessions.connect(DeviceKind::Lr).await.unwrap();

    for i in 0..600 {
        assert!(ctl.notify(frame(&[i as f32, 0.0])).await);
    }
    wait_until(&sessions, "600 frames", |s| frames_of(s, "a") == 600).await;

    let left = sessions.session(&id).unwrap().buffers.samples(Channel::Left);
    let expected: Vec<f32> = (88..600).map(|i| i as f32 / 10.0).collect();
    assert_eq!(left.len(), 512);
    assert_eq!(left, expected);
}

#[tokio::test]
async fn levels_and_rolling_average_follow_frames() {
    let sim = Arc::new(SimTransport::new());
    let ctl = sim.push(SimDevice::new("a", "AudioVisor"));
    let sessions = manager(&sim);
    let id = sessions.connect(DeviceKind::Lr).await.unwrap();

    let s = sessions.session(&id).unwrap();
    assert_eq!(s.average_rms(), 0.0);
    assert_eq!(s.latest_db(), f64::NEG_INFINITY);

    for _ in 0..4 {
        assert!(ctl.notify(frame(&[5.0, 5.0])).await);
    }
    wait_until(&sessions, "four frames", |s| frames_of(s, "a") == 4).await;

    let s = sessions.session(&id).unwrap();
    assert_eq!(s.rolling.len(), 4);
    assert!(s.latest_rms > 0.0);
    assert!(s.average_rms() > 0.0);
    assert!(s.latest_db().is_finite());
}

#[tokio::test]
async fn ascii_firmware_is_decoded_unscaled() {
    let sim = Arc::new(SimTransport::new());
    let ctl = sim.push(SimDevice::new("a", "CIRCUITPY"));
    let config = SessionConfig {
        decoder: DecodeStrategy::AsciiDecimal,
        ..SessionConfig::default()
    };
    let sessions = SessionManager::new(sim.clone(), config);
    let id = sessions.connect(DeviceKind::Lr).await.unwrap();

    assert!(ctl.notify(b"6.5\n".to_vec()).await);
    // Binary floats are not text.
    assert!(ctl.notify(frame(&[1.0, 2.0])).await);
    wait_until(&sessions, "ascii frame and a drop", |s| {
        s.get(&id).is_some_and(|s| s.frames == 1 && s.dropped == 1)
    })
    .await;

    let s = sessions.session(&id).unwrap();
    assert_eq!(s.buffers.samples(Channel::Left)[0], 6.5);
    assert_eq!(s.buffers.samples(Channel::Right)[0], 6.5);
}

// ── Commands ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn broadcast_reports_partial_failure_and_still_reaches_others() {
    let sim = Arc::new(SimTransport::new());
    let ctl_a = sim.push(SimDevice::new("a", "AudioVisor"));
    let ctl_b = sim.push(SimDevice::new("b", "AudioVisor"));
    let sessions = manager(&sim);
    sessions.connect(DeviceKind::Lr).await.unwrap();
    sessions.connect(DeviceKind::Lr).await.unwrap();

    ctl_a.set_fail_writes(true);
    assert!(!sessions.send(&[0x10, 0x40], None).await);

    assert!(ctl_a.writes().is_empty());
    assert_eq!(ctl_b.writes(), vec![vec![0x10, 0x40]]);
    assert!(sessions.status().is_some_and(|s| s.contains("write rejected")));
    assert_eq!(sessions.state().len(), 2);

    ctl_a.set_fail_writes(false);
    assert!(sessions.send(&[0x11, 0x05], None).await);
    assert_eq!(ctl_a.writes(), vec![vec![0x11, 0x05]]);
}

#[tokio::test]
async fn send_edge_cases() {
    let sim = Arc::new(SimTransport::new());
    sim.push(SimDevice::new("ro", "AudioVisor").without_write());
    let sessions = manager(&sim);

    // Nothing connected: a broadcast trivially succeeds.
    assert!(sessions.send(&[0x10, 1], None).await);

    let ghost = SessionId::from("ghost");
    assert!(!sessions.send(&[0x10, 1], Some(&ghost)).await);
    assert!(sessions.status().is_some_and(|s| s.contains("not connected")));

    let ro = sessions.connect(DeviceKind::Lr).await.unwrap();
    assert!(!sessions.session(&ro).unwrap().has_write);
    assert!(!sessions.send(&[0x10, 1], Some(&ro)).await);
    assert!(sessions
        .status()
        .is_some_and(|s| s.contains("no write characteristic")));
}

#[tokio::test]
async fn control_changes_send_only_what_changed() {
    let sim = Arc::new(SimTransport::new());
    let ctl = sim.push(SimDevice::new("a", "AudioVisor"));
    let sessions = manager(&sim);
    let id = sessions.connect(DeviceKind::Lr).await.unwrap();

    let first = ControlSettings::clamped(60, 200);
    sessions.update_controls(first, None).await;
    assert_eq!(
        ctl.commands(),
        vec![Command::SetBrightness(200), Command::SetSensitivity(60)]
    );

    // Out-of-range brightness is clamped; sensitivity is unchanged.
    sessions
        .update_controls(first.with_brightness(300), Some(&id))
        .await;
    assert_eq!(ctl.commands().last(), Some(&Command::SetBrightness(255)));
    assert_eq!(ctl.writes().len(), 3);

    // Same values again: nothing on the wire.
    sessions.update_controls(sessions.controls(), None).await;
    assert_eq!(ctl.writes().len(), 3);

    sessions.resend_controls(Some(&id)).await;
    assert_eq!(
        ctl.commands()[3..],
        [Command::SetBrightness(255), Command::SetSensitivity(60)]
    );
    assert_eq!(sessions.controls(), ControlSettings::clamped(60, 255));
}

#[tokio::test]
async fn latest_control_value_wins() {
    let sim = Arc::new(SimTransport::new());
    let ctl = sim.push(SimDevice::new("a", "AudioVisor"));
    let sessions = manager(&sim);
    sessions.connect(DeviceKind::Lr).await.unwrap();

    let mut settings = ControlSettings::default();
    for value in [10, 20, 30, 40] {
        settings = settings.with_sensitivity(value);
        sessions.update_controls(settings, None).await;
    }

    assert_eq!(ctl.commands().last(), Some(&Command::SetSensitivity(40)));
    assert_eq!(sessions.controls().sensitivity, 40);
}

// ── Simulated firmware ────────────────────────────────────────────────────────

#[tokio::test]
async fn synthetic_devices_stream_on_their_own() {
    let sim = Arc::new(SimTransport::synthetic());
    let sessions = manager(&sim);
    let id = sessions.connect(DeviceKind::Ud).await.unwrap();
    assert_eq!(id.as_str(), "sim-0001");

    wait_until(&sessions, "generated frames", |s| frames_of(s, "sim-0001") >= 5).await;
    let s = sessions.session(&id).unwrap();
    assert_eq!(s.buffers.channels().count(), 4);

    sessions.disconnect(Some(&id)).await;
    assert!(sessions.state().is_empty());
}
