mod common;

use std::time::Duration;

use rstest::{fixture, rstest};
use stoneamqp::protocol::{
    condition, AmqpError, Begin, Close, End, Frame, Open, Performative, AMQP_HEADER,
};
use stoneamqp::{setup_local_tracing, AmqpConfig, ConnectionEvent, ConnectionState};

use common::{encode, Peer};

#[fixture]
#[once]
fn tracing() {
    setup_local_tracing().expect("failed to setup tracing");
}

#[rstest]
#[case::plain(*b"AMQP\x00\x01\x00\x00")]
#[case::sasl(*b"AMQP\x03\x01\x00\x00")]
fn valid_header_is_echoed_once(_tracing: (), #[case] header: [u8; 8]) {
    let mut peer = Peer::new(AmqpConfig::default());
    peer.send_raw(&header);

    assert_eq!(peer.connection.state(), ConnectionState::HeaderExchanged);
    assert_eq!(peer.take_written().as_ref(), &header);
    assert_eq!(peer.connection.transport().writes(), 1);
}

#[rstest]
#[case::bad_magic(*b"AMQX\x00\x01\x00\x00")]
#[case::bad_version(*b"AMQP\x00\x01\x00\x01")]
#[case::old_version(*b"AMQP\x00\x00\x09\x01")]
#[case::tls(*b"AMQP\x02\x01\x00\x00")]
#[case::unknown_id(*b"AMQP\x07\x01\x00\x00")]
#[case::http(*b"GET / HT")]
fn malformed_header_gets_canonical_header_and_close(_tracing: (), #[case] header: [u8; 8]) {
    let mut peer = Peer::new(AmqpConfig::default());
    peer.send_raw(&header);

    assert_eq!(peer.connection.state(), ConnectionState::End);
    assert_eq!(peer.connection.transport().written(), &AMQP_HEADER);
    assert!(peer.connection.transport().is_closed());
    assert_eq!(peer.events(), vec![ConnectionEvent::Closed { error: None }]);

    // nothing more is written whatever arrives afterwards
    peer.send_raw(&header);
    assert_eq!(peer.connection.transport().written(), &AMQP_HEADER);
}

#[rstest]
fn header_arriving_byte_by_byte(_tracing: ()) {
    let mut peer = Peer::new(AmqpConfig::default());
    for byte in AMQP_HEADER {
        assert_eq!(peer.connection.state(), ConnectionState::Start);
        peer.send_raw(&[byte]);
    }
    assert_eq!(peer.connection.state(), ConnectionState::HeaderExchanged);
    assert_eq!(peer.take_written().as_ref(), &AMQP_HEADER);
}

#[rstest]
fn open_is_clamped_to_both_sides(_tracing: ()) {
    let mut peer = Peer::new(AmqpConfig::default());
    peer.send_raw(&[0x41, 0x4D, 0x51, 0x50, 0x00, 0x01, 0x00, 0x00]);
    peer.send(
        0,
        Open {
            container_id: "x".to_string(),
            max_frame_size: 600,
            channel_max: 10,
            ..Default::default()
        },
    );

    assert_eq!(peer.connection.state(), ConnectionState::Opened);
    let written = peer.take_written();
    assert_eq!(&written[..8], &AMQP_HEADER);
    match common::decode_all(&written).as_slice() {
        [Frame {
            channel: 0,
            performative: Some(Performative::Open(open)),
            ..
        }] => {
            assert_eq!(open.max_frame_size, 600);
            assert_eq!(open.channel_max, 10);
            assert_eq!(open.container_id, "test-broker");
        }
        other => panic!("expected one Open, got {:?}", other),
    }
    assert_eq!(peer.connection.max_frame_size(), 600);
    assert_eq!(peer.connection.channel_max(), 10);
    assert_eq!(peer.connection.remote_container_id(), Some("x"));
    assert_eq!(
        peer.events(),
        vec![ConnectionEvent::Opened {
            remote_container_id: "x".to_string()
        }]
    );
}

#[rstest]
fn server_defaults_win_when_smaller(_tracing: ()) {
    let mut peer = Peer::new(AmqpConfig {
        max_frame_size: 4096,
        channel_max: 3,
        idle_timeout_ms: 30_000,
        ..Default::default()
    });
    peer.send_raw(&AMQP_HEADER);
    peer.send(
        0,
        Open {
            max_frame_size: 1 << 20,
            channel_max: 100,
            idle_time_out: Some(120_000),
            ..Default::default()
        },
    );
    assert_eq!(peer.connection.max_frame_size(), 4096);
    assert_eq!(peer.connection.channel_max(), 3);
    assert_eq!(peer.connection.idle_timeout(), Some(Duration::from_secs(30)));
}

#[rstest]
fn pipelined_chunk_matches_separate_chunks(_tracing: ()) {
    let open = encode(
        0,
        Open {
            container_id: "client".to_string(),
            max_frame_size: 1024,
            ..Default::default()
        },
    );

    let mut together = Peer::new(AmqpConfig::default());
    let mut chunk = AMQP_HEADER.to_vec();
    chunk.extend_from_slice(&open);
    together.send_raw(&chunk);

    let mut apart = Peer::new(AmqpConfig::default());
    apart.send_raw(&AMQP_HEADER);
    apart.send_raw(&open);

    assert_eq!(together.connection.state(), ConnectionState::Opened);
    assert_eq!(apart.connection.state(), ConnectionState::Opened);
    let together_bytes = together.take_written();
    assert_eq!(together_bytes, apart.take_written());
    assert_eq!(&together_bytes[..8], &AMQP_HEADER);
    assert_eq!(common::decode_all(&together_bytes).len(), 1);
}

#[rstest]
fn channel_is_reused_after_end(_tracing: ()) {
    let mut peer = Peer::opened(AmqpConfig::default());
    let first = peer.begin(3);
    assert_eq!(first, 0);

    peer.send(3, End::default());
    assert_eq!(
        peer.performatives(),
        vec![(first, Performative::End(End::default()))]
    );
    assert!(peer.connection.session(first).is_none());

    let second = peer.begin(3);
    assert_eq!(second, 0);
    assert_eq!(peer.connection.state(), ConnectionState::Opened);
    assert_eq!(peer.connection.session_count(), 1);
}

#[rstest]
fn duplicate_begin_is_answered_with_end(_tracing: ()) {
    let mut peer = Peer::opened(AmqpConfig::default());
    let local = peer.begin(5);
    peer.events();

    peer.send(5, Begin::default());
    match peer.performatives().as_slice() {
        [(channel, Performative::End(End { error: Some(error) }))] => {
            assert_eq!(*channel, local);
            assert_eq!(error.condition.as_str(), condition::ILLEGAL_STATE);
        }
        other => panic!("expected End, got {:?}", other),
    }
    assert_eq!(peer.connection.state(), ConnectionState::Opened);
    assert!(peer.connection.session(local).is_some());
    assert!(peer.events().is_empty());
}

#[rstest]
fn sessions_take_the_lowest_free_channel(_tracing: ()) {
    let mut peer = Peer::opened(AmqpConfig::default());
    assert_eq!(peer.begin(10), 0);
    assert_eq!(peer.begin(11), 1);
    assert_eq!(peer.begin(12), 2);

    peer.send(11, End::default());
    peer.take_written();
    assert_eq!(peer.begin(13), 1);
}

#[rstest]
fn idle_peer_is_disconnected(_tracing: ()) {
    let mut peer = Peer::opened(AmqpConfig {
        idle_timeout_ms: 1000,
        ..Default::default()
    });

    peer.advance(Duration::from_millis(1500));
    peer.connection.tick(peer.now);
    assert_eq!(peer.connection.state(), ConnectionState::Opened);

    // an empty frame counts as traffic
    peer.send_raw(&[0, 0, 0, 8, 2, 0, 0, 0]);
    peer.advance(Duration::from_millis(1900));
    peer.connection.tick(peer.now);
    assert_eq!(peer.connection.state(), ConnectionState::Opened);

    peer.advance(Duration::from_millis(200));
    peer.connection.tick(peer.now);
    assert_eq!(peer.connection.state(), ConnectionState::End);
    match peer.performatives().as_slice() {
        [(0, Performative::Close(Close { error: Some(error) }))] => {
            assert_eq!(error.condition.as_str(), condition::CONNECTION_FORCED)
        }
        other => panic!("expected Close, got {:?}", other),
    }
    assert!(peer.connection.transport().is_closed());
}

#[rstest]
fn peer_close_is_answered(_tracing: ()) {
    let mut peer = Peer::opened(AmqpConfig::default());
    peer.begin(0);
    peer.events();

    let error = AmqpError::new(condition::NOT_ALLOWED, "going away");
    peer.send(
        0,
        Close {
            error: Some(error.clone()),
        },
    );

    assert_eq!(peer.connection.state(), ConnectionState::End);
    assert_eq!(peer.connection.remote_error(), Some(&error));
    assert_eq!(
        peer.performatives(),
        vec![(0, Performative::Close(Close::default()))]
    );
    assert!(peer.connection.transport().is_closed());
    assert_eq!(
        peer.events(),
        vec![ConnectionEvent::Closed { error: Some(error) }]
    );
}

#[rstest]
fn second_open_is_an_illegal_state(_tracing: ()) {
    let mut peer = Peer::opened(AmqpConfig::default());
    peer.send(0, Open::default());

    assert_eq!(peer.connection.state(), ConnectionState::Discarding);
    match peer.performatives().as_slice() {
        [(0, Performative::Close(Close { error: Some(error) }))] => {
            assert_eq!(error.condition.as_str(), condition::ILLEGAL_STATE)
        }
        other => panic!("expected Close, got {:?}", other),
    }
    assert!(peer.connection.transport().is_write_closed());
}

#[rstest]
fn header_after_open_is_a_framing_error(_tracing: ()) {
    let mut peer = Peer::opened(AmqpConfig::default());
    peer.send_raw(&AMQP_HEADER);

    assert_eq!(peer.connection.state(), ConnectionState::End);
    match peer.performatives().as_slice() {
        [(0, Performative::Close(Close { error: Some(error) }))] => {
            assert_eq!(error.condition.as_str(), condition::FRAMING_ERROR)
        }
        other => panic!("expected Close, got {:?}", other),
    }
}

#[rstest]
fn frame_on_channel_above_channel_max(_tracing: ()) {
    let mut peer = Peer::new(AmqpConfig::default());
    peer.send_raw(&AMQP_HEADER);
    peer.send(
        0,
        Open {
            channel_max: 1,
            ..Default::default()
        },
    );
    peer.take_written();

    peer.send(2, Begin::default());
    assert_eq!(peer.connection.state(), ConnectionState::End);
    match peer.performatives().as_slice() {
        [(0, Performative::Close(Close { error: Some(error) }))] => {
            assert_eq!(error.condition.as_str(), condition::FRAMING_ERROR)
        }
        other => panic!("expected Close, got {:?}", other),
    }
}

#[rstest]
fn deeply_nested_body_is_a_decode_error(_tracing: ()) {
    let mut peer = Peer::opened(AmqpConfig::default());
    let body = vec![0u8; 60_000];
    let mut frame = Vec::with_capacity(8 + body.len());
    frame.extend_from_slice(&(8 + body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&[2, 0, 0, 0]);
    frame.extend_from_slice(&body);
    peer.send_raw(&frame);

    assert_eq!(peer.connection.state(), ConnectionState::Discarding);
    match peer.performatives().as_slice() {
        [(0, Performative::Close(Close { error: Some(error) }))] => {
            assert_eq!(error.condition.as_str(), condition::DECODE_ERROR)
        }
        other => panic!("expected Close, got {:?}", other),
    }
}

#[rstest]
fn local_open_and_begin_before_peer_header(_tracing: ()) {
    let mut peer = Peer::new(AmqpConfig::default());
    peer.connection.open().unwrap();
    let channel = peer.connection.begin_session().unwrap();
    assert_eq!(channel, 0);
    assert_eq!(peer.connection.state(), ConnectionState::OpenPipe);

    let sent = peer.performatives();
    assert!(matches!(sent[0], (0, Performative::Open(_))));
    assert!(matches!(sent[1], (0, Performative::Begin(Begin { remote_channel: None, .. }))));

    peer.send_raw(&AMQP_HEADER);
    peer.send(0, Open::default());
    peer.send(
        7,
        Begin {
            remote_channel: Some(channel),
            ..Default::default()
        },
    );
    assert_eq!(peer.connection.state(), ConnectionState::Opened);
    assert!(peer.take_written().is_empty());
    let session = peer.connection.session(channel).unwrap();
    assert_eq!(session.remote_channel(), Some(7));

    // later frames on remote channel 7 reach that session
    peer.send(7, End::default());
    assert_eq!(
        peer.performatives(),
        vec![(channel, Performative::End(End::default()))]
    );
    assert!(peer.connection.session(channel).is_none());
}

#[rstest]
fn local_close_waits_for_the_peer(_tracing: ()) {
    let mut peer = Peer::opened(AmqpConfig::default());
    let error = AmqpError::new(condition::NOT_ALLOWED, "bye");
    peer.connection.close(Some(error.clone()));

    assert_eq!(peer.connection.state(), ConnectionState::Discarding);
    assert_eq!(
        peer.performatives(),
        vec![(
            0,
            Performative::Close(Close {
                error: Some(error.clone())
            })
        )]
    );

    // ignored while discarding
    peer.send(0, Begin::default());
    assert!(peer.take_written().is_empty());

    peer.send(0, Close::default());
    assert_eq!(peer.connection.state(), ConnectionState::End);
    assert_eq!(
        peer.events(),
        vec![ConnectionEvent::Closed { error: Some(error) }]
    );
}
