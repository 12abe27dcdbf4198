//! Integration tests for xwire.
//!
//! A fake server on the far end of a `tokio::io::duplex` pipe performs the
//! setup handshake, answers extension queries, and then writes whatever
//! frames each test needs.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tracing_test::traced_test;

use xwire::dispatch::{ErrorSpec, EventSpec, Extension, ExtensionInfo};
use xwire::event::Event;
use xwire::ext::damage::{
    BadDamageError, Damage, Destroy, NotifyEvent, QueryVersionReply, Rectangle, ReportLevel,
};
use xwire::ext::xc_misc::{GetXIDList, XcMisc};
use xwire::message::{decode_request, encode_request};
use xwire::protocol::xproto::{GetInputFocus, QueryExtension};
use xwire::protocol::{
    encode_error_frame, encode_event_frame, encode_reply_frame, ByteOrder, RequestHeader, Setup,
    SetupRequest, WireWriter, REQUEST_HEADER_SIZE,
};
use xwire::{Connection, ConnectionBuilder, WireError, XwireError};

const ORDER: ByteOrder = ByteOrder::Little;

const DAMAGE_INFO: ExtensionInfo = ExtensionInfo {
    name: "DAMAGE",
    major_opcode: 143,
    first_event: 91,
    first_error: 152,
};

const XC_MISC_INFO: ExtensionInfo = ExtensionInfo {
    name: "XC-MISC",
    major_opcode: 130,
    first_event: 0,
    first_error: 0,
};

fn setup(resource_id_mask: u32) -> Setup {
    Setup {
        protocol_major_version: 11,
        protocol_minor_version: 0,
        release_number: 12_101_004,
        resource_id_base: 0x0420_0000,
        resource_id_mask,
        motion_buffer_size: 256,
        maximum_request_length: u16::MAX,
        image_byte_order: 0,
        bitmap_format_bit_order: 0,
        bitmap_format_scanline_unit: 32,
        bitmap_format_scanline_pad: 32,
        min_keycode: 8,
        max_keycode: 255,
        vendor: "xwire test server".to_string(),
        pixmap_formats: Vec::new(),
        roots: Vec::new(),
    }
}

struct FakeServer {
    stream: DuplexStream,
}

impl FakeServer {
    async fn handshake(mut stream: DuplexStream, setup: &Setup) -> Self {
        let mut request = [0u8; 12];
        stream.read_exact(&mut request).await.unwrap();
        let request = SetupRequest::decode(&request).unwrap();
        assert_eq!(request.order, ORDER);
        stream.write_all(&setup.encode(ORDER).unwrap()).await.unwrap();
        Self { stream }
    }

    async fn read_request(&mut self) -> Vec<u8> {
        let mut header = [0u8; REQUEST_HEADER_SIZE];
        self.stream.read_exact(&mut header).await.unwrap();
        let len = RequestHeader::decode(&header, ORDER).unwrap().byte_len();
        let mut bytes = header.to_vec();
        bytes.resize(len, 0);
        self.stream
            .read_exact(&mut bytes[REQUEST_HEADER_SIZE..])
            .await
            .unwrap();
        bytes
    }

    async fn answer_query(&mut self, sequence: u16, known: &[ExtensionInfo]) {
        let bytes = self.read_request().await;
        let query: QueryExtension = decode_request(&bytes, None, ORDER).unwrap();
        let body = match known.iter().find(|info| info.name.as_bytes() == query.name) {
            Some(info) => [1, info.major_opcode, info.first_event, info.first_error],
            None => [0; 4],
        };
        self.send(&encode_reply_frame(ORDER, 0, sequence, &body)).await;
    }

    async fn send(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
    }

    /// Answer a `GetInputFocus` round trip.
    async fn answer_sync(&mut self, sequence: u16) {
        let request = self.read_request().await;
        assert_eq!(request, [43, 0, 1, 0]);
        self.send(&focus_reply(sequence)).await;
    }
}

fn focus_reply(sequence: u16) -> bytes::Bytes {
    encode_reply_frame(ORDER, 1, sequence, &0x3a5u32.to_le_bytes())
}

fn version_reply(sequence: u16, major: u32, minor: u32) -> bytes::Bytes {
    let mut w = WireWriter::new(ORDER);
    w.u32(major);
    w.u32(minor);
    encode_reply_frame(ORDER, 0, sequence, w.as_slice())
}

async fn open_with(
    builder: ConnectionBuilder,
    queries: u16,
    setup: Setup,
    known: &[ExtensionInfo],
) -> (Result<Connection, XwireError>, FakeServer) {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let server = async move {
        let mut server = FakeServer::handshake(server, &setup).await;
        for sequence in 1..=queries {
            server.answer_query(sequence, known).await;
        }
        server
    };
    tokio::join!(builder.byte_order(ORDER).establish(client), server)
}

async fn open(builder: ConnectionBuilder, queries: u16) -> (Connection, FakeServer) {
    let (conn, server) = open_with(
        builder,
        queries,
        setup(0x001f_ffff),
        &[DAMAGE_INFO, XC_MISC_INFO],
    )
    .await;
    (conn.unwrap(), server)
}

async fn open_damage() -> (Connection, Damage, FakeServer) {
    let (conn, server) = open(Connection::builder().extension::<Damage>(), 1).await;
    let damage = Damage::new(&conn).unwrap();
    (conn, damage, server)
}

#[tokio::test]
async fn test_extension_registered_from_query() {
    let (conn, damage, _server) = open_damage().await;
    assert_eq!(damage.info(), &DAMAGE_INFO);
    assert_eq!(conn.extension::<Damage>().unwrap(), DAMAGE_INFO);
    assert!(matches!(
        conn.extension::<XcMisc>(),
        Err(XwireError::ExtensionNotRegistered("XC-MISC"))
    ));
}

/// DAMAGE Destroy with major opcode 143 reaches the socket byte-exact.
#[tokio::test]
async fn test_destroy_request_bytes() {
    let (_conn, damage, mut server) = open_damage().await;

    let sequence = damage.destroy_unchecked(7).await.unwrap();
    assert_eq!(sequence, 2);
    assert_eq!(server.read_request().await, [143, 2, 2, 0, 7, 0, 0, 0]);
}

#[tokio::test]
async fn test_subtract_unchecked_request_bytes() {
    let (_conn, damage, mut server) = open_damage().await;

    let sequence = damage.subtract_unchecked(7, 0, 0).await.unwrap();
    assert_eq!(sequence, 2);
    assert_eq!(
        server.read_request().await,
        [143, 3, 4, 0, 7, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]
    );
}

#[tokio::test]
async fn test_replies_out_of_order() {
    let (_conn, damage, mut server) = open_damage().await;

    let first = damage.query_version(1, 1).await.unwrap();
    let second = damage.query_version(1, 0).await.unwrap();
    assert_eq!((first.sequence(), second.sequence()), (2, 3));

    server.read_request().await;
    server.read_request().await;
    server.send(&version_reply(3, 1, 0)).await;
    server.send(&version_reply(2, 1, 1)).await;

    assert_eq!(
        second.reply().await.unwrap(),
        QueryVersionReply {
            major_version: 1,
            minor_version: 0,
        }
    );
    assert_eq!(
        first.reply().await.unwrap(),
        QueryVersionReply {
            major_version: 1,
            minor_version: 1,
        }
    );
}

#[tokio::test]
async fn test_unknown_event_code() {
    let (conn, _damage, mut server) = open_damage().await;

    server
        .send(&encode_event_frame(ORDER, 64, 3, 1, &[0xAA; 28]).unwrap())
        .await;

    match conn.wait_for_event().await.unwrap() {
        Event::Unknown(raw) => {
            assert_eq!(raw.code(), 64);
            assert_eq!(raw.bytes().len(), 32);
            assert_eq!(raw.bytes()[4], 0xAA);
        }
        other => panic!("expected an unknown event, got {other:?}"),
    }
}

#[tokio::test]
#[traced_test]
async fn test_orphan_reply_then_valid_reply() {
    let (_conn, damage, mut server) = open_damage().await;

    let cookie = damage.query_version(1, 1).await.unwrap();
    server.read_request().await;

    // Sequence 1 was the extension query, already answered.
    server.send(&version_reply(1, 9, 9)).await;
    server.send(&version_reply(2, 1, 1)).await;

    assert_eq!(
        cookie.reply().await.unwrap(),
        QueryVersionReply {
            major_version: 1,
            minor_version: 1,
        }
    );
    assert!(logs_contain("discarding unmatched reply"));
}

#[tokio::test]
async fn test_damage_notify_event() {
    let (conn, _damage, mut server) = open_damage().await;

    let notify = NotifyEvent {
        level: ReportLevel::RawRectangles,
        more: false,
        sequence: 1,
        drawable: 0x3a5,
        damage: 0x0420_0001,
        timestamp: 12_345,
        area: Rectangle {
            x: 10,
            y: 20,
            width: 30,
            height: 40,
        },
        geometry: Rectangle {
            x: 0,
            y: 0,
            width: 1920,
            height: 1080,
        },
    };
    server.send(&notify.encode(ORDER, 91).unwrap()).await;

    // The event precedes the reply on the wire, so it is queued by the time
    // the round trip completes.
    let (synced, ()) = tokio::join!(conn.sync(), server.answer_sync(2));
    synced.unwrap();

    let event = conn.poll_for_event().unwrap().expect("event queued");
    match &event {
        Event::Extension(ext) => {
            assert_eq!(ext.extension, "DAMAGE");
            assert_eq!(ext.name, "DamageNotify");
        }
        other => panic!("expected a decoded event, got {other:?}"),
    }
    assert_eq!(event.downcast_ref::<NotifyEvent>(), Some(&notify));
    assert!(conn.poll_for_event().unwrap().is_none());
}

#[tokio::test]
async fn test_sent_event_is_decoded() {
    let (conn, _damage, mut server) = open_damage().await;

    let mut bytes = NotifyEvent {
        level: ReportLevel::NonEmpty,
        more: false,
        sequence: 1,
        drawable: 1,
        damage: 2,
        timestamp: 3,
        area: Rectangle::default(),
        geometry: Rectangle::default(),
    }
    .encode(ORDER, 91)
    .unwrap()
    .to_vec();
    bytes[0] |= 0x80;
    server.send(&bytes).await;

    let event = conn.wait_for_event().await.unwrap();
    assert!(event.raw().is_send_event());
    assert_eq!(event.downcast_ref::<NotifyEvent>().map(|n| n.damage), Some(2));
}

#[tokio::test]
async fn test_malformed_event_is_delivered() {
    let (conn, _damage, mut server) = open_damage().await;

    // Report level 9 does not exist.
    server
        .send(&encode_event_frame(ORDER, 91, 9, 1, &[0; 28]).unwrap())
        .await;

    match conn.wait_for_event().await.unwrap() {
        Event::Malformed { raw, error } => {
            assert_eq!(raw.code(), 91);
            assert_eq!(
                error,
                WireError::InvalidValue {
                    field: "report level",
                    value: 9,
                }
            );
        }
        other => panic!("expected a malformed event, got {other:?}"),
    }
}

#[tokio::test]
async fn test_checked_request_fails() {
    let (_conn, damage, mut server) = open_damage().await;

    let cookie = damage.destroy(0xdead).await.unwrap();
    assert_eq!(cookie.sequence(), 2);

    let server_side = async {
        let request = server.read_request().await;
        let destroy: Destroy = decode_request(&request, Some(143), ORDER).unwrap();
        assert_eq!(destroy.damage, 0xdead);
        server
            .send(&encode_error_frame(ORDER, 152, 2, 0xdead, 2, 143))
            .await;
        server.answer_sync(3).await;
    };
    let (outcome, ()) = tokio::join!(cookie.check(), server_side);

    match outcome {
        Err(XwireError::Protocol(error)) => {
            assert_eq!(error.extension, Some("DAMAGE"));
            assert_eq!(error.name, "BadDamage");
            assert_eq!(error.sequence, 2);
            assert_eq!(
                error.detail_ref::<BadDamageError>(),
                Some(&BadDamageError {
                    damage: 0xdead,
                    minor_opcode: 2,
                    major_opcode: 143,
                })
            );
        }
        other => panic!("expected BadDamage, got {other:?}"),
    }
}

#[tokio::test]
async fn test_checked_request_succeeds() {
    let (conn, damage, mut server) = open_damage().await;

    let cookie = damage
        .create(0x0420_0001, 0x3a5, ReportLevel::BoundingBox)
        .await
        .unwrap();

    let server_side = async {
        server.read_request().await;
        server.answer_sync(3).await;
    };
    let (outcome, ()) = tokio::join!(cookie.check(), server_side);
    outcome.unwrap();
    assert_eq!(conn.pending_replies(), 0);
}

#[tokio::test]
async fn test_unchecked_error_goes_to_error_stream() {
    let (conn, damage, mut server) = open_damage().await;

    let sequence = damage.destroy_unchecked(0xbeef).await.unwrap();
    server.read_request().await;
    server
        .send(&encode_error_frame(ORDER, 152, sequence as u16, 0xbeef, 2, 143))
        .await;

    let error = conn.wait_for_error().await.unwrap();
    assert_eq!(error.name, "BadDamage");
    assert_eq!(error.sequence, sequence);
    assert_eq!(error.bad_value, 0xbeef);
    assert!(conn.poll_for_error().unwrap().is_none());
}

#[tokio::test]
async fn test_core_error_is_named() {
    let (conn, _damage, mut server) = open_damage().await;

    let cookie = conn.send_with_reply(None, &GetInputFocus).await.unwrap();
    server.read_request().await;
    // BadImplementation.
    server.send(&encode_error_frame(ORDER, 17, 2, 0, 0, 43)).await;

    match cookie.reply().await {
        Err(XwireError::Protocol(error)) => {
            assert_eq!(error.extension, None);
            assert_eq!(error.name, "Implementation");
        }
        other => panic!("expected a protocol error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_truncated_reply_fails_only_its_cookie() {
    let (conn, server) = open(Connection::builder().extension::<XcMisc>(), 1).await;
    let mut server = server;
    let xc_misc = XcMisc::new(&conn).unwrap();

    let cookie = xc_misc.get_xid_list(1000).await.unwrap();
    let request = server.read_request().await;
    let list: GetXIDList = decode_request(&request, Some(130), ORDER).unwrap();
    assert_eq!(list.count, 1000);

    // Claims 1000 ids, carries two.
    let mut w = WireWriter::new(ORDER);
    w.u32(1000);
    w.pad(20);
    w.u32_list(&[1, 2]);
    server
        .send(&encode_reply_frame(ORDER, 0, 2, w.as_slice()))
        .await;

    assert!(matches!(
        cookie.reply().await,
        Err(XwireError::Wire(WireError::Truncated { .. }))
    ));

    let (synced, ()) = tokio::join!(conn.sync(), server.answer_sync(3));
    synced.unwrap();
    assert!(!conn.is_closed());
}

#[tokio::test]
async fn test_generate_id_refills_from_xc_misc() {
    let (conn, mut server) = open_with(
        Connection::builder().optional_extension::<XcMisc>(),
        1,
        setup(0x3),
        &[XC_MISC_INFO],
    )
    .await;
    let conn = conn.unwrap();

    for expected in [0x0420_0001, 0x0420_0002, 0x0420_0003] {
        assert_eq!(conn.generate_id().await.unwrap(), expected);
    }

    let server_side = async {
        let request = server.read_request().await;
        assert_eq!(request, [130, 1, 1, 0]);
        let mut w = WireWriter::new(ORDER);
        w.u32(0x0420_0100);
        w.u32(2);
        server
            .send(&encode_reply_frame(ORDER, 0, 2, w.as_slice()))
            .await;
    };
    let (id, ()) = tokio::join!(conn.generate_id(), server_side);
    assert_eq!(id.unwrap(), 0x0420_0100);
    assert_eq!(conn.generate_id().await.unwrap(), 0x0420_0101);
}

#[tokio::test]
async fn test_generate_id_without_xc_misc() {
    let (conn, mut server) = open_with(Connection::builder(), 0, setup(0x1), &[]).await;
    let conn = conn.unwrap();
    assert_eq!(conn.generate_id().await.unwrap(), 0x0420_0001);

    let server_side = async {
        server.answer_query(1, &[]).await;
    };
    let (id, ()) = tokio::join!(conn.generate_id(), server_side);
    assert!(matches!(id, Err(XwireError::IdsExhausted)));
}

#[tokio::test]
async fn test_required_extension_missing() {
    let (conn, _server) = open_with(
        Connection::builder().extension::<Damage>(),
        1,
        setup(0x001f_ffff),
        &[XC_MISC_INFO],
    )
    .await;
    assert!(matches!(conn, Err(XwireError::ExtensionNotPresent(name)) if name == "DAMAGE"));
}

/// Claims a notify event at offset 0, like DAMAGE.
struct Shadow;

impl Extension for Shadow {
    const NAME: &'static str = "SHADOW";
    const EVENTS: &'static [EventSpec] = &[EventSpec::new::<NotifyEvent>(0, "ShadowNotify")];
    const ERRORS: &'static [ErrorSpec] = &[];
}

#[tokio::test]
async fn test_conflicting_event_codes_refused() {
    let shadow = ExtensionInfo {
        name: "SHADOW",
        major_opcode: 150,
        first_event: 91,
        first_error: 0,
    };
    let (conn, _server) = open_with(
        Connection::builder()
            .extension::<Damage>()
            .optional_extension::<Shadow>(),
        2,
        setup(0x001f_ffff),
        &[DAMAGE_INFO, shadow],
    )
    .await;

    match conn {
        Err(XwireError::DispatchConflict {
            kind,
            code,
            existing,
            incoming,
        }) => {
            assert_eq!(kind, "event");
            assert_eq!(code, 91);
            assert_eq!(existing, "DAMAGE");
            assert_eq!(incoming, "SHADOW");
        }
        other => panic!("expected a dispatch conflict, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_reply_timeout() {
    let (conn, mut server) = open(
        Connection::builder().reply_timeout(Duration::from_secs(1)),
        0,
    )
    .await;

    let cookie = conn.send_with_reply(None, &GetInputFocus).await.unwrap();
    server.read_request().await;
    assert!(matches!(cookie.reply().await, Err(XwireError::Timeout)));

    // The late reply is discarded without harm.
    server.send(&focus_reply(1)).await;
    let cookie = conn.send_with_reply(None, &GetInputFocus).await.unwrap();
    server.read_request().await;
    server.send(&focus_reply(2)).await;
    assert_eq!(cookie.reply().await.unwrap().focus, 0x3a5);
}

#[tokio::test]
async fn test_oversized_frame_closes_connection() {
    let (conn, mut server) = open(Connection::builder().max_frame_size(4096), 0).await;

    let cookie = conn.send_with_reply(None, &GetInputFocus).await.unwrap();
    server.read_request().await;

    // A reply header declaring 1 MiB of payload.
    let mut frame = focus_reply(1).to_vec();
    frame[4..8].copy_from_slice(&(256u32 * 1024).to_le_bytes());
    server.send(&frame).await;

    assert!(matches!(
        cookie.reply().await,
        Err(XwireError::ConnectionClosed)
    ));
    assert!(matches!(
        conn.wait_for_event().await,
        Err(XwireError::ConnectionClosed)
    ));
    assert!(conn.is_closed());
}

#[tokio::test]
async fn test_request_too_large() {
    let mut small = setup(0x001f_ffff);
    small.maximum_request_length = 2;
    let (conn, _server) = open_with(Connection::builder(), 0, small, &[]).await;
    let conn = conn.unwrap();

    // 8 bytes of header and length, 28 of padded name: 9 units.
    let err = conn
        .send_with_reply(None, &QueryExtension::new("A-VERY-LONG-EXTENSION-NAME"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        XwireError::Wire(WireError::RequestTooLarge { length: 9, max: 2 })
    ));
    assert_eq!(conn.pending_replies(), 0);
}

#[test]
fn test_encoded_request_matches_connection_output() {
    let bytes = encode_request(&Destroy { damage: 7 }, Some(143), ORDER, u16::MAX).unwrap();
    assert_eq!(&bytes[..], &[143, 2, 2, 0, 7, 0, 0, 0]);
}
