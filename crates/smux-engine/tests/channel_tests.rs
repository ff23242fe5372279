//! Channel lifecycle, data path and flow control tests
//!
//! All tests drive a single engine against a recording transport, playing
//! the peer by feeding hand-built frames.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use common::*;
use smux_engine::{
    options, tiocm, ChannelEvent, ErrorKind, LocalState, MuxConfig, MuxEngine, MuxError,
    RemoteState, RxFlag, Transport, TransportError,
};
use smux_protocol::{
    close_flags, open_flags, status_flags, Command, HEADER_SIZE, MAX_PAYLOAD_SIZE, WAKEUP_REQ,
};

fn is_disconnect(e: &ChannelEvent) -> bool {
    matches!(
        e,
        ChannelEvent::Disconnected { .. } | ChannelEvent::LocalClosed | ChannelEvent::RemoteClosed
    )
}

// ============================================================================
// Open / close handshake
// ============================================================================

#[tokio::test(start_paused = true)]
async fn remote_open_then_local_open_connects_once() {
    let (engine, transport) = start(MuxConfig::default());
    wake_by_peer(&engine, &transport).await;
    let client = RecordingClient::new();

    engine.feed_bytes(&frame(Command::Open, 5, 0), RxFlag::Normal);
    engine.open(5, client.clone()).unwrap();
    assert_eq!(
        engine.channel_state(5).unwrap().local_state,
        LocalState::Opening
    );
    settle().await;

    let sent = transport.take_packets();
    assert!(sent
        .iter()
        .any(|p| p.cmd() == Command::Open && p.lcid() == 5 && p.flags() == open_flags::ACK));
    let open = sent
        .iter()
        .find(|p| p.cmd() == Command::Open && !p.has_flags(open_flags::ACK))
        .expect("OPEN request sent");
    assert!(!open.has_flags(open_flags::POWER_COLLAPSE));

    engine.feed_bytes(&frame(Command::Open, 5, open_flags::ACK), RxFlag::Normal);
    settle().await;

    assert!(engine.channel_state(5).unwrap().is_fully_open());
    assert_eq!(client.events(), vec![ChannelEvent::Connected]);
}

#[tokio::test(start_paused = true)]
async fn local_open_then_remote_open_connects_once() {
    let (engine, transport) = start(MuxConfig::default());
    wake_by_peer(&engine, &transport).await;
    let client = RecordingClient::new();

    engine.open(2, client.clone()).unwrap();
    settle().await;
    engine.feed_bytes(&frame(Command::Open, 2, open_flags::ACK), RxFlag::Normal);
    settle().await;
    assert!(client.events().is_empty());

    engine.feed_bytes(&frame(Command::Open, 2, 0), RxFlag::Normal);
    settle().await;
    assert_eq!(client.events(), vec![ChannelEvent::Connected]);

    // A duplicate OPEN from the peer changes nothing
    engine.feed_bytes(&frame(Command::Open, 2, 0), RxFlag::Normal);
    settle().await;
    assert_eq!(client.count(|e| *e == ChannelEvent::Connected), 1);
}

#[tokio::test(start_paused = true)]
async fn open_errors() {
    let (engine, transport) = start(MuxConfig::default());
    let client = RecordingClient::new();

    let err = engine.open(16, client.clone()).unwrap_err();
    assert!(matches!(err, MuxError::InvalidChannel(16)));

    open_channel(&engine, &transport, 1, client.clone()).await;
    let err = engine.open(1, client.clone()).unwrap_err();
    assert!(matches!(err, MuxError::AlreadyOpen { lcid: 1 }));

    engine.close(1).unwrap();
    let err = engine.open(1, client).unwrap_err();
    assert!(matches!(err, MuxError::TryAgain { lcid: 1 }));
    assert_eq!(err.kind(), ErrorKind::ChannelStateViolation);
}

#[tokio::test(start_paused = true)]
async fn close_is_idempotent() {
    let (engine, transport) = start(MuxConfig::default());
    let client = RecordingClient::new();

    engine.close(7).unwrap();
    settle().await;
    assert!(transport.take().is_empty());

    open_channel(&engine, &transport, 7, client.clone()).await;
    client.take_events();

    engine.close(7).unwrap();
    engine.close(7).unwrap();
    settle().await;
    assert_eq!(
        engine.channel_state(7).unwrap().local_state,
        LocalState::Closing
    );
    let closes: Vec<_> = transport
        .take_packets()
        .into_iter()
        .filter(|p| p.cmd() == Command::Close)
        .collect();
    assert_eq!(closes.len(), 1);
    assert_eq!(closes[0].flags(), 0);
    assert!(client.events().is_empty());

    engine.feed_bytes(&frame(Command::Close, 7, close_flags::ACK), RxFlag::Normal);
    settle().await;
    assert_eq!(client.events(), vec![ChannelEvent::LocalClosed]);

    engine.feed_bytes(&frame(Command::Close, 7, 0), RxFlag::Normal);
    settle().await;
    assert_eq!(
        client.take_events(),
        vec![
            ChannelEvent::LocalClosed,
            ChannelEvent::RemoteClosed,
            ChannelEvent::Disconnected {
                transport_reset: false
            },
        ]
    );
    let acks = transport.take_packets();
    assert!(acks
        .iter()
        .any(|p| p.cmd() == Command::Close && p.flags() == close_flags::ACK));

    let snapshot = engine.channel_state(7).unwrap();
    assert_eq!(snapshot.local_state, LocalState::Closed);
    assert_eq!(snapshot.remote_state, RemoteState::Closed);
    assert!(!snapshot.has_client);
}

#[tokio::test(start_paused = true)]
async fn close_withdraws_unsent_open() {
    let (engine, transport) = start(MuxConfig::default());
    let client = RecordingClient::new();

    engine.open(4, client.clone()).unwrap();
    engine.close(4).unwrap();
    settle().await;

    assert!(transport.take().is_empty());
    assert_eq!(transport.power_on_count(), 0);
    assert_eq!(
        client.events(),
        vec![
            ChannelEvent::LocalClosed,
            ChannelEvent::Disconnected {
                transport_reset: false
            },
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn reopen_starts_without_flow_control() {
    let (engine, transport) = start(MuxConfig::default());
    let client = RecordingClient::new();
    open_channel(&engine, &transport, 1, client.clone()).await;

    engine.feed_bytes(
        &frame(
            Command::Status,
            1,
            status_flags::FLOW_CONTROL | status_flags::DCD,
        ),
        RxFlag::Normal,
    );
    engine.set_option(1, options::REMOTE_TX_STOP, 0).unwrap();
    settle().await;
    assert!(engine.channel_state(1).unwrap().tx_flow_control);

    engine.close(1).unwrap();
    settle().await;
    engine.feed_bytes(&frame(Command::Close, 1, close_flags::ACK), RxFlag::Normal);
    engine.feed_bytes(&frame(Command::Close, 1, 0), RxFlag::Normal);
    settle().await;

    let snapshot = engine.channel_state(1).unwrap();
    assert!(!snapshot.tx_flow_control);
    assert!(!snapshot.rx_flow_control);
    assert_eq!(snapshot.remote_status, 0);
    assert_eq!(engine.tiocm_get(1).unwrap(), 0);

    open_channel(&engine, &transport, 1, client.clone()).await;
    client.take_events();
    engine.write(1, 9, b"hello").unwrap();
    settle().await;

    let sent = transport.take_packets();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].cmd(), Command::Data);
    assert_eq!(sent[0].payload, b"hello");
    assert_eq!(
        client.events(),
        vec![ChannelEvent::WriteDone { token: 9, len: 5 }]
    );
}

#[tokio::test(start_paused = true)]
async fn tx_stop_set_before_open_reaches_peer() {
    let (engine, transport) = start(MuxConfig::default());
    wake_by_peer(&engine, &transport).await;

    engine.set_option(3, options::REMOTE_TX_STOP, 0).unwrap();
    engine.open(3, RecordingClient::new()).unwrap();
    engine.feed_bytes(&frame(Command::Open, 3, 0), RxFlag::Normal);
    engine.feed_bytes(&frame(Command::Open, 3, open_flags::ACK), RxFlag::Normal);
    settle().await;

    let status: Vec<_> = transport
        .take_packets()
        .into_iter()
        .filter(|p| p.cmd() == Command::Status)
        .collect();
    assert_eq!(status.len(), 1);
    assert_eq!(status[0].lcid(), 3);
    assert_eq!(status[0].flags(), status_flags::FLOW_CONTROL);
}

// ============================================================================
// Data path
// ============================================================================

#[tokio::test(start_paused = true)]
async fn write_on_unopened_channel_fails() {
    let (engine, transport) = start(MuxConfig::default());

    let err = engine.write(3, 1, b"abc").unwrap_err();
    assert!(matches!(err, MuxError::ChannelNotOpen { lcid: 3 }));
    assert_eq!(err.kind(), ErrorKind::ChannelStateViolation);

    let err = engine.write(0, 1, &vec![0u8; MAX_PAYLOAD_SIZE + 1]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ClientContractViolation);

    settle().await;
    assert!(transport.take().is_empty());
}

#[tokio::test(start_paused = true)]
async fn received_data_keeps_wire_order() {
    let (engine, transport) = start(MuxConfig::default());
    let client = RecordingClient::new();
    open_channel(&engine, &transport, 2, client.clone()).await;

    let mut stream = Vec::new();
    for i in 0..5u8 {
        stream.extend(data_frame(2, &[i; 3]));
    }
    for chunk in stream.chunks(5) {
        engine.feed_bytes(chunk, RxFlag::Normal);
    }
    settle().await;

    let expected: Vec<Vec<u8>> = (0..5u8).map(|i| vec![i; 3]).collect();
    assert_eq!(client.received(), expected);
}

#[tokio::test(start_paused = true)]
async fn data_for_closed_channel_is_dropped() {
    let (engine, transport) = start(MuxConfig::default());
    let client = RecordingClient::new();
    wake_by_peer(&engine, &transport).await;

    engine.open(9, client.clone()).unwrap();
    engine.feed_bytes(&data_frame(9, b"early"), RxFlag::Normal);
    settle().await;

    assert!(client.received().is_empty());
    assert_eq!(client.buffer_requests.load(std::sync::atomic::Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn write_completes_with_token() {
    let (engine, transport) = start(MuxConfig::default());
    let client = RecordingClient::new();
    open_channel(&engine, &transport, 3, client.clone()).await;
    client.take_events();

    engine.write(3, 42, b"hello").unwrap();
    settle().await;

    let sent = transport.take_packets();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].cmd(), Command::Data);
    assert_eq!(sent[0].lcid(), 3);
    assert_eq!(sent[0].payload, b"hello");
    assert_eq!(
        client.events(),
        vec![ChannelEvent::WriteDone { token: 42, len: 5 }]
    );
}

#[tokio::test(start_paused = true)]
async fn transport_failure_fails_write() {
    let (engine, transport) = start(MuxConfig::default());
    let client = RecordingClient::new();
    open_channel(&engine, &transport, 3, client.clone()).await;
    client.take_events();

    transport.set_fail_writes(true);
    engine.write(3, 8, b"lost").unwrap();
    settle().await;

    assert_eq!(client.events(), vec![ChannelEvent::WriteFail { token: 8 }]);
    assert_eq!(engine.stats().transport_errors, 1);
}

#[tokio::test(start_paused = true)]
async fn channels_are_served_round_robin() {
    let (engine, transport) = start(MuxConfig::default());
    let a = RecordingClient::new();
    let b = RecordingClient::new();
    open_channel(&engine, &transport, 1, a).await;
    open_channel(&engine, &transport, 2, b).await;

    for token in 0..3 {
        engine.write(1, token, b"a").unwrap();
    }
    for token in 0..3 {
        engine.write(2, token, b"b").unwrap();
    }
    settle().await;

    let order: Vec<u8> = transport.take_packets().iter().map(|p| p.lcid()).collect();
    assert_eq!(order, vec![1, 2, 1, 2, 1, 2]);
}

// ============================================================================
// Transmit flow control
// ============================================================================

#[tokio::test(start_paused = true)]
async fn tx_watermarks_round_trip() {
    let (engine, transport) = start(MuxConfig::default());
    let client = RecordingClient::new();
    open_channel(&engine, &transport, 1, client.clone()).await;
    client.take_events();

    for token in 1..=4 {
        engine.write(1, token, b"data").unwrap();
    }
    assert!(engine.is_channel_full(1));
    let err = engine.write(1, 5, b"data").unwrap_err();
    assert!(matches!(err, MuxError::WouldOverflow { lcid: 1, pending: 4 }));
    assert_eq!(err.kind(), ErrorKind::ResourceExhaustion);

    settle().await;
    assert!(engine.is_channel_low(1));
    assert_eq!(client.count(|e| *e == ChannelEvent::HighWatermark), 1);
    assert_eq!(client.count(|e| *e == ChannelEvent::LowWatermark), 1);

    let done: Vec<u64> = client
        .events()
        .iter()
        .filter_map(|e| match e {
            ChannelEvent::WriteDone { token, .. } => Some(*token),
            _ => None,
        })
        .collect();
    assert_eq!(done, vec![1, 2, 3, 4]);
    assert_eq!(transport.take_packets().len(), 4);
}

#[tokio::test(start_paused = true)]
async fn remote_flow_control_holds_data() {
    let (engine, transport) = start(MuxConfig::default());
    let client = RecordingClient::new();
    open_channel(&engine, &transport, 6, client.clone()).await;
    client.take_events();

    engine.feed_bytes(
        &frame(Command::Status, 6, status_flags::FLOW_CONTROL),
        RxFlag::Normal,
    );
    engine.write(6, 1, b"held").unwrap();
    engine.tiocm_set(6, tiocm::DTR, 0).unwrap();
    settle().await;

    // Control traffic passes the held DATA
    let sent = transport.take_packets();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].cmd(), Command::Status);
    assert_eq!(sent[0].flags(), status_flags::RTC);
    assert!(engine.channel_state(6).unwrap().tx_flow_control);

    engine.feed_bytes(&frame(Command::Status, 6, 0), RxFlag::Normal);
    settle().await;

    let sent = transport.take_packets();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].payload, b"held");
    // FLOW only gates transmission; the TIOCM view never changed
    assert_eq!(
        client.count(|e| matches!(e, ChannelEvent::TiocmUpdate { .. })),
        0
    );
}

#[tokio::test(start_paused = true)]
async fn remote_status_maps_to_tiocm() {
    let (engine, transport) = start(MuxConfig::default());
    let client = RecordingClient::new();
    open_channel(&engine, &transport, 0, client.clone()).await;
    client.take_events();

    engine.feed_bytes(
        &frame(
            Command::Status,
            0,
            status_flags::RTC | status_flags::RTR | status_flags::DCD,
        ),
        RxFlag::Normal,
    );
    settle().await;

    let expected = tiocm::DSR | tiocm::CTS | tiocm::CD;
    assert_eq!(engine.tiocm_get(0).unwrap(), expected);
    assert_eq!(
        client.events(),
        vec![ChannelEvent::TiocmUpdate {
            old: 0,
            new: expected
        }]
    );

    engine.tiocm_set(0, tiocm::RTS, 0).unwrap();
    assert_eq!(engine.tiocm_get(0).unwrap(), expected | tiocm::RTS);
}

#[tokio::test(start_paused = true)]
async fn flow_only_status_raises_no_tiocm_update() {
    let (engine, transport) = start(MuxConfig::default());
    let client = RecordingClient::new();
    open_channel(&engine, &transport, 4, client.clone()).await;
    client.take_events();

    engine.feed_bytes(
        &frame(Command::Status, 4, status_flags::FLOW_CONTROL),
        RxFlag::Normal,
    );
    settle().await;
    assert!(engine.channel_state(4).unwrap().tx_flow_control);
    assert!(client.events().is_empty());

    engine.feed_bytes(
        &frame(
            Command::Status,
            4,
            status_flags::FLOW_CONTROL | status_flags::RI,
        ),
        RxFlag::Normal,
    );
    settle().await;
    assert_eq!(
        client.events(),
        vec![ChannelEvent::TiocmUpdate {
            old: 0,
            new: tiocm::RI
        }]
    );
}

#[tokio::test(start_paused = true)]
async fn client_tx_stop_sends_status() {
    let (engine, transport) = start(MuxConfig::default());
    let client = RecordingClient::new();
    open_channel(&engine, &transport, 3, client).await;

    engine.set_option(3, options::REMOTE_TX_STOP, 0).unwrap();
    settle().await;
    let sent = transport.take_packets();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].flags(), status_flags::FLOW_CONTROL);

    engine.set_option(3, 0, options::REMOTE_TX_STOP).unwrap();
    settle().await;
    let sent = transport.take_packets();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].flags(), 0);
}

// ============================================================================
// Receive retry
// ============================================================================

#[tokio::test(start_paused = true)]
async fn retry_gives_up_after_max_backoff() {
    let (engine, transport) = start(MuxConfig::default());
    let client = RecordingClient::new();
    open_channel(&engine, &transport, 1, client.clone()).await;
    client.take_events();

    client.set_mode(RxMode::TryAgain);
    engine.feed_bytes(&data_frame(1, b"stuck"), RxFlag::Normal);
    settle().await;
    assert_eq!(engine.channel_state(1).unwrap().rx_retry_len, 1);

    tokio::time::sleep(Duration::from_secs(3)).await;

    assert_eq!(client.events(), vec![ChannelEvent::ReadFail { len: 5 }]);
    // First attempt plus one per backoff step from 1 ms to 1024 ms
    assert_eq!(
        client.buffer_requests.load(std::sync::atomic::Ordering::SeqCst),
        12
    );
    assert_eq!(engine.stats().retry_abandoned, 1);
    assert_eq!(engine.channel_state(1).unwrap().rx_retry_len, 0);
}

#[tokio::test(start_paused = true)]
async fn retry_preserves_order() {
    let (engine, transport) = start(MuxConfig::default());
    let client = RecordingClient::new();
    open_channel(&engine, &transport, 1, client.clone()).await;

    client.set_mode(RxMode::TryAgain);
    for payload in [b"a", b"b", b"c"] {
        engine.feed_bytes(&data_frame(1, payload), RxFlag::Normal);
    }
    settle().await;
    assert!(client.received().is_empty());
    assert_eq!(engine.channel_state(1).unwrap().rx_retry_len, 3);

    client.set_mode(RxMode::Accept);
    engine.feed_bytes(&data_frame(1, b"d"), RxFlag::Normal);
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(
        client.received(),
        vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]
    );
}

#[tokio::test(start_paused = true)]
async fn rejected_buffer_fails_read() {
    let (engine, transport) = start(MuxConfig::default());
    let client = RecordingClient::new();
    open_channel(&engine, &transport, 1, client.clone()).await;
    client.take_events();

    client.set_mode(RxMode::Reject);
    engine.feed_bytes(&data_frame(1, b"nope"), RxFlag::Normal);
    settle().await;

    assert_eq!(client.events(), vec![ChannelEvent::ReadFail { len: 4 }]);
    assert_eq!(engine.channel_state(1).unwrap().rx_retry_len, 0);
}

#[tokio::test(start_paused = true)]
async fn retry_queue_is_bounded() {
    let (engine, transport) = start(MuxConfig::default());
    let client = RecordingClient::new();
    open_channel(&engine, &transport, 1, client.clone()).await;
    client.take_events();

    client.set_mode(RxMode::TryAgain);
    for i in 0..33u8 {
        engine.feed_bytes(&data_frame(1, &[i]), RxFlag::Normal);
    }
    settle().await;

    assert_eq!(engine.channel_state(1).unwrap().rx_retry_len, 32);
    assert_eq!(client.events(), vec![ChannelEvent::ReadFail { len: 1 }]);
}

#[tokio::test(start_paused = true)]
async fn retry_backlog_asserts_remote_flow_control() {
    let (engine, transport) = start(MuxConfig::default());
    let client = RecordingClient::new();
    open_channel(&engine, &transport, 2, client.clone()).await;
    client.take_events();
    engine.set_option(2, options::AUTO_REMOTE_TX_STOP, 0).unwrap();

    client.set_mode(RxMode::TryAgain);
    for i in 0..16u8 {
        engine.feed_bytes(&data_frame(2, &[i]), RxFlag::Normal);
    }
    settle().await;

    assert_eq!(client.count(|e| *e == ChannelEvent::RxRetryHighWatermark), 1);
    assert!(engine.channel_state(2).unwrap().rx_flow_control);
    let sent = transport.take_packets();
    assert!(sent
        .iter()
        .any(|p| p.cmd() == Command::Status && p.flags() == status_flags::FLOW_CONTROL));

    client.set_mode(RxMode::Accept);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(client.received().len(), 16);
    assert_eq!(client.count(|e| *e == ChannelEvent::RxRetryLowWatermark), 1);
    assert!(!engine.channel_state(2).unwrap().rx_flow_control);
    let sent = transport.take_packets();
    assert!(sent
        .iter()
        .any(|p| p.cmd() == Command::Status && p.flags() == 0));
}

#[tokio::test(start_paused = true)]
async fn close_discards_retry_queue() {
    let (engine, transport) = start(MuxConfig::default());
    let client = RecordingClient::new();
    open_channel(&engine, &transport, 1, client.clone()).await;
    client.take_events();

    client.set_mode(RxMode::TryAgain);
    engine.feed_bytes(&data_frame(1, b"xy"), RxFlag::Normal);
    engine.close(1).unwrap();
    assert_eq!(engine.channel_state(1).unwrap().rx_retry_len, 0);

    client.set_mode(RxMode::Accept);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(client.received().is_empty());
    assert_eq!(client.count(|e| *e == ChannelEvent::ReadFail { len: 2 }), 1);
}

// ============================================================================
// Loopback modes
// ============================================================================

#[tokio::test(start_paused = true)]
async fn local_loopback_never_touches_transport() {
    let (engine, transport) = start(MuxConfig::default());
    let client = RecordingClient::new();

    engine.set_option(2, options::LOCAL_LOOPBACK, 0).unwrap();
    engine.open(2, client.clone()).unwrap();
    settle().await;
    assert_eq!(client.events(), vec![ChannelEvent::Connected]);

    engine.write(2, 9, b"ping").unwrap();
    settle().await;

    assert_eq!(client.received(), vec![b"ping".to_vec()]);
    assert_eq!(
        client.count(|e| *e == ChannelEvent::WriteDone { token: 9, len: 4 }),
        1
    );
    assert!(transport.take().is_empty());
    assert_eq!(transport.power_on_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn byte_loopback_connects_to_itself() {
    let config = MuxConfig {
        byte_loopback: true,
        ..MuxConfig::default()
    };
    let (engine, transport) = start(config);
    let client = RecordingClient::new();

    engine.open(4, client.clone()).unwrap();
    settle().await;
    assert!(engine.channel_state(4).unwrap().is_fully_open());

    engine.write(4, 1, b"echo").unwrap();
    settle().await;

    assert_eq!(client.received(), vec![b"echo".to_vec()]);
    assert!(transport.take().is_empty());
    assert_eq!(engine.stats().remote_wakeups, 1);
}

#[tokio::test(start_paused = true)]
async fn remote_loopback_request_is_echoed() {
    let (engine, transport) = start(MuxConfig::default());
    wake_by_peer(&engine, &transport).await;

    engine.feed_bytes(
        &frame(Command::Open, 8, open_flags::REMOTE_LOOPBACK),
        RxFlag::Normal,
    );
    settle().await;
    let sent = transport.take_packets();
    assert_eq!(sent.len(), 2);
    assert_eq!(
        sent[0].flags(),
        open_flags::ACK | open_flags::REMOTE_LOOPBACK
    );
    assert_eq!(sent[1].cmd(), Command::Open);
    assert_eq!(sent[1].flags(), 0);

    engine.feed_bytes(&data_frame(8, b"bounce"), RxFlag::Normal);
    settle().await;
    let sent = transport.take_packets();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].cmd(), Command::Data);
    assert_eq!(sent[0].payload, b"bounce");

    engine.feed_bytes(&frame(Command::Close, 8, 0), RxFlag::Normal);
    settle().await;
    let sent = transport.take_packets();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].flags(), close_flags::ACK);
    assert_eq!(sent[1].flags(), 0);
}

// ============================================================================
// Transport reset
// ============================================================================

#[tokio::test(start_paused = true)]
async fn transport_reset_purges_everything() {
    let (engine, transport) = start(MuxConfig::default());
    let open = RecordingClient::new();
    let opening = RecordingClient::new();
    open_channel(&engine, &transport, 1, open.clone()).await;
    open.take_events();

    // Hold a write in the queue behind remote flow control
    engine.feed_bytes(
        &frame(Command::Status, 1, status_flags::FLOW_CONTROL),
        RxFlag::Normal,
    );
    engine.write(1, 77, b"queued").unwrap();
    engine.open(2, opening.clone()).unwrap();
    settle().await;
    open.take_events();

    // Leave the parser mid-header
    engine.feed_bytes(&[0xFC, 0x33, 0x00], RxFlag::Normal);
    assert_ne!(engine.parser_state(), smux_engine::RxState::Idle);

    engine.on_transport_reset();
    settle().await;

    assert_eq!(
        open.events(),
        vec![
            ChannelEvent::WriteFail { token: 77 },
            ChannelEvent::Disconnected {
                transport_reset: true
            },
        ]
    );
    assert_eq!(opening.count(is_disconnect), 1);
    assert_eq!(
        opening.events(),
        vec![ChannelEvent::Disconnected {
            transport_reset: true
        }]
    );

    for lcid in 0..engine.num_channels() {
        let snapshot = engine.channel_state(lcid).unwrap();
        assert_eq!(snapshot.local_state, LocalState::Closed);
        assert_eq!(snapshot.remote_state, RemoteState::Closed);
        assert_eq!(snapshot.tx_queue_len, 0);
        assert_eq!(snapshot.rx_retry_len, 0);
        assert!(!snapshot.has_client);
    }
    assert_eq!(engine.power_state(), smux_engine::PowerState::Off);
    assert_eq!(engine.parser_state(), smux_engine::RxState::Idle);
    assert_eq!(transport.power_off_count(), 1);
}

/// Transport that resets the engine while a DATA frame is being written
#[derive(Default)]
struct ResetOnDataWrite {
    engine: OnceLock<MuxEngine>,
    armed: AtomicBool,
}

impl Transport for ResetOnDataWrite {
    fn write_bytes(&self, data: &[u8]) -> Result<(), TransportError> {
        if data.len() > HEADER_SIZE && self.armed.swap(false, Ordering::SeqCst) {
            if let Some(engine) = self.engine.get() {
                engine.on_transport_reset();
            }
        }
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn reset_during_write_reports_only_disconnect() {
    let transport = Arc::new(ResetOnDataWrite::default());
    let engine = MuxEngine::start(MuxConfig::default(), transport.clone());
    let _ = transport.engine.set(engine.clone());
    let client = RecordingClient::new();

    engine.feed_bytes(&[WAKEUP_REQ], RxFlag::Normal);
    engine.open(1, client.clone()).unwrap();
    engine.feed_bytes(&frame(Command::Open, 1, 0), RxFlag::Normal);
    engine.feed_bytes(&frame(Command::Open, 1, open_flags::ACK), RxFlag::Normal);
    settle().await;
    assert_eq!(client.take_events(), vec![ChannelEvent::Connected]);

    transport.armed.store(true, Ordering::SeqCst);
    engine.write(1, 5, b"in flight").unwrap();
    settle().await;

    assert_eq!(
        client.events(),
        vec![ChannelEvent::Disconnected {
            transport_reset: true
        }]
    );
}

#[tokio::test(start_paused = true)]
async fn parser_failure_waits_for_reset() {
    let (engine, transport) = start(MuxConfig::default());
    let client = RecordingClient::new();
    open_channel(&engine, &transport, 1, client.clone()).await;

    engine.feed_bytes(&[0xFC], RxFlag::Normal);
    engine.feed_bytes(&[0x33], RxFlag::Frame);
    assert_eq!(engine.parser_state(), smux_engine::RxState::Failure);
    assert_eq!(engine.stats().parser_failures, 1);

    engine.feed_bytes(&data_frame(1, b"ignored"), RxFlag::Normal);
    settle().await;
    assert!(client.received().is_empty());

    engine.on_transport_reset();
    assert_eq!(engine.parser_state(), smux_engine::RxState::Idle);
}
