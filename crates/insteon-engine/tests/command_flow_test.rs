//! End-to-end command execution against the scripted hub.

use insteon_engine::command::{Command, CommandKind, DeviceFrame};
use insteon_engine::error::ErrorKind;
use insteon_engine::session::{CancelToken, HubSession};
use insteon_engine::testkit::{self, FakeHub, Reply};
use insteon_engine::transport::SessionConfig;
use insteon_wire::DeviceAddress;
use std::sync::Arc;
use std::time::Duration;

fn fast_config() -> SessionConfig {
    let mut config = SessionConfig::new("test");
    config.command_spacing_ms = 1;
    config.retry_base_delay_ms = 5;
    config.poll_interval_ms = 2;
    config
}

fn session_with(hub: Arc<FakeHub>) -> HubSession {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    HubSession::new(hub, fast_config())
}

fn target() -> DeviceAddress {
    DeviceAddress::new(0x1A, 0x2B, 0x3C)
}

#[tokio::test]
async fn test_device_standard_command_succeeds() {
    let hub = Arc::new(FakeHub::new());
    let command = Command::device("on", target(), DeviceFrame::standard(0x11, 0xFF));

    let mut buffer = testkit::echo_ack(&command);
    buffer.extend(testkit::direct_ack(
        target(),
        DeviceAddress::new(0x01, 0x01, 0x01),
        0x11,
        0xFF,
    ));
    hub.push_buffer(buffer);

    let session = session_with(hub.clone());
    let reply = session.run(command).await;

    assert!(reply.outcome.success);
    assert_eq!(reply.outcome.attempts, 1);
    let ack = reply.response.standard.expect("direct ack captured");
    assert_eq!(ack.cmd2, 0xFF);
    assert_eq!(hub.sent_lines(), vec!["/3?02621A2B3C0F11FF=I=3".to_string()]);
    // the shared buffer is cleared before the attempt
    assert_eq!(hub.clear_count(), 1);
}

#[tokio::test]
async fn test_silent_hub_exhausts_attempts() {
    let hub = Arc::new(FakeHub::new());
    for _ in 0..3 {
        hub.push_reply(Reply::Silence);
    }
    let command = Command::device("on", target(), DeviceFrame::standard(0x11, 0xFF))
        .with_response_timeout(Duration::from_millis(50));

    let session = session_with(hub.clone());
    let reply = session.run(command).await;

    assert!(!reply.outcome.success);
    assert_eq!(reply.outcome.attempts, 3);
    assert_eq!(reply.outcome.error, ErrorKind::NoHubResponse);
    assert_eq!(hub.sent_lines().len(), 3);
}

#[tokio::test]
async fn test_nak_echo_retried_to_success() {
    let hub = Arc::new(FakeHub::new());
    let command = Command::raw_im("get_version", 0x60, String::new(), CommandKind::ImAck);
    hub.push_buffer(testkit::echo_nak(&command));
    hub.push_buffer(testkit::echo_ack(&command));

    let session = session_with(hub.clone());
    let reply = session.run(command).await;

    assert!(reply.outcome.success);
    assert_eq!(reply.outcome.attempts, 2);
}

#[tokio::test]
async fn test_fatal_transport_error_fails_immediately() {
    let hub = Arc::new(FakeHub::new());
    hub.push_reply(Reply::Fail(
        insteon_engine::error::TransportError::Failed("dns".into()),
    ));
    let command = Command::raw_im("get_version", 0x60, String::new(), CommandKind::ImAck);

    let session = session_with(hub.clone());
    let reply = session.run(command).await;

    assert!(!reply.outcome.success);
    assert_eq!(reply.outcome.error, ErrorKind::TransportFatal);
    assert_eq!(reply.outcome.attempts, 1);
}

#[tokio::test]
async fn test_gate_serializes_concurrent_commands() {
    let hub = Arc::new(FakeHub::default().with_wire_delay_ms(10));
    let first = Command::raw_im("probe_a", 0x60, String::new(), CommandKind::ImAck);
    let second = Command::raw_im("probe_b", 0x60, String::new(), CommandKind::ImAck);
    hub.push_buffer(testkit::echo_ack(&first));
    hub.push_buffer(testkit::echo_ack(&second));

    let session = Arc::new(session_with(hub.clone()));
    let a = tokio::spawn({
        let session = session.clone();
        async move { session.run(first).await }
    });
    let b = tokio::spawn({
        let session = session.clone();
        async move { session.run(second).await }
    });
    let (a, b) = (a.await.unwrap(), b.await.unwrap());

    assert!(a.outcome.success);
    assert!(b.outcome.success);
    // the gate never let the two exchanges overlap on the wire
    assert_eq!(hub.max_concurrency(), 1);
}

#[tokio::test]
async fn test_gate_released_during_backoff() {
    let hub = Arc::new(FakeHub::new());
    // the flaky command's first attempt goes unanswered
    hub.push_reply(Reply::Silence);
    // the interloper, sent during the flaky command's backoff, is answered
    let interloper = Command::raw_im("interloper", 0x61, String::new(), CommandKind::ImAck);
    hub.push_buffer(testkit::echo_ack(&interloper));
    // the flaky command's second attempt also goes unanswered
    hub.push_reply(Reply::Silence);

    let mut config = fast_config();
    config.retry_base_delay_ms = 300;
    let session = Arc::new(HubSession::new(hub.clone(), config));

    let flaky = Command::raw_im("flaky", 0x60, String::new(), CommandKind::ImAck)
        .with_max_attempts(2)
        .with_response_timeout(Duration::from_millis(30));
    let handle = tokio::spawn({
        let session = session.clone();
        async move { session.run(flaky).await }
    });

    // land inside the inter-attempt backoff window (30ms timeout + 300ms)
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(session.current_command(), None);
    let reply = session.run(interloper).await;
    assert!(reply.outcome.success);

    let failed = handle.await.unwrap();
    assert!(!failed.outcome.success);
    assert_eq!(failed.outcome.attempts, 2);
    // the interloper's exchange interleaved between the two attempts
    assert_eq!(
        hub.sent_lines(),
        vec!["/3?0260=I=3", "/3?0261=I=3", "/3?0260=I=3"]
    );
}

#[tokio::test]
async fn test_cancellation_during_response_wait() {
    let hub = Arc::new(FakeHub::new());
    hub.push_reply(Reply::Silence);
    let command = Command::device("on", target(), DeviceFrame::standard(0x11, 0xFF))
        .with_response_timeout(Duration::from_secs(30));

    let session = session_with(hub.clone());
    let cancel = CancelToken::new();
    let trip = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trip.cancel();
    });
    let reply = session.run_cancellable(command, &cancel).await;

    assert!(reply.outcome.is_cancelled());
    assert!(!reply.outcome.is_fault());
}

#[tokio::test]
async fn test_fire_and_forget_completes_on_send() {
    let hub = Arc::new(FakeHub::new());
    let command = Command::hub_config("set_flags", "S2", "14");

    let session = session_with(hub.clone());
    let reply = session.run(command).await;

    assert!(reply.outcome.success);
    assert_eq!(hub.sent_lines(), vec!["/2?S214".to_string()]);
}
