// router_tests.rs - end-to-end tests against a scripted mock device
// =========================================================================
//
// Every test talks to a mock ADS device on an ephemeral loopback port. The
// mock encodes and decodes frames with its own little-endian helpers,
// independent of the library's codec, so these tests pin down the wire
// format as well as the router behavior.

use rust_ads::{
    ads_state, trans_mode, AdsError, AdsNotificationAttrib, AmsAddr, AmsNetId, AmsRouter,
};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const DEVICE_NET_ID: &str = "5.0.0.1.1.1";
const PLC_PORT: u16 = 851;

const CMD_READ: u16 = 2;
const CMD_WRITE_CONTROL: u16 = 5;
const CMD_ADD_NOTIFICATION: u16 = 6;
const CMD_DEL_NOTIFICATION: u16 = 7;
const CMD_DEVICE_NOTIFICATION: u16 = 8;
const CMD_READ_WRITE: u16 = 9;
const AMS_REQUEST: u16 = 0x0004;
const AMS_RESPONSE: u16 = 0x0005;

// =========================================================================
// MOCK DEVICE WIRE HELPERS
// =========================================================================

#[derive(Debug, Clone)]
struct WireFrame {
    target: ([u8; 6], u16),
    source: ([u8; 6], u16),
    cmd_id: u16,
    state_flags: u16,
    invoke_id: u32,
    payload: Vec<u8>,
}

async fn read_frame(stream: &mut TcpStream) -> Option<WireFrame> {
    let mut head = [0u8; 6];
    stream.read_exact(&mut head).await.ok()?;
    let length = u32::from_le_bytes([head[2], head[3], head[4], head[5]]) as usize;
    assert!(length >= 32, "mock received a frame shorter than an AoE header");
    let mut body = vec![0u8; length];
    stream.read_exact(&mut body).await.ok()?;
    let mut target_id = [0u8; 6];
    target_id.copy_from_slice(&body[0..6]);
    let mut source_id = [0u8; 6];
    source_id.copy_from_slice(&body[8..14]);
    Some(WireFrame {
        target: (target_id, u16::from_le_bytes([body[6], body[7]])),
        source: (source_id, u16::from_le_bytes([body[14], body[15]])),
        cmd_id: u16::from_le_bytes([body[16], body[17]]),
        state_flags: u16::from_le_bytes([body[18], body[19]]),
        invoke_id: u32::from_le_bytes([body[28], body[29], body[30], body[31]]),
        payload: body[32..].to_vec(),
    })
}

fn encode_frame(
    target: ([u8; 6], u16),
    source: ([u8; 6], u16),
    cmd_id: u16,
    state_flags: u16,
    invoke_id: u32,
    payload: &[u8],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(6 + 32 + payload.len());
    out.extend_from_slice(&[0, 0]);
    out.extend_from_slice(&((32 + payload.len()) as u32).to_le_bytes());
    out.extend_from_slice(&target.0);
    out.extend_from_slice(&target.1.to_le_bytes());
    out.extend_from_slice(&source.0);
    out.extend_from_slice(&source.1.to_le_bytes());
    out.extend_from_slice(&cmd_id.to_le_bytes());
    out.extend_from_slice(&state_flags.to_le_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes()); // error code
    out.extend_from_slice(&invoke_id.to_le_bytes());
    out.extend_from_slice(payload);
    out
}

/// Answers `request` with a response frame carrying `payload`, with the
/// addresses swapped back and the invoke id echoed.
async fn reply(stream: &mut TcpStream, request: &WireFrame, payload: &[u8]) {
    let bytes = encode_frame(
        request.source,
        request.target,
        request.cmd_id,
        AMS_RESPONSE,
        request.invoke_id,
        payload,
    );
    stream.write_all(&bytes).await.unwrap();
}

/// Pushes an unsolicited `DEVICE_NOTIFICATION` frame to the client.
async fn send_notification(
    stream: &mut TcpStream,
    client: ([u8; 6], u16),
    stamps: &[(u64, Vec<(u32, Vec<u8>)>)],
) {
    let mut body = Vec::new();
    body.extend_from_slice(&(stamps.len() as u32).to_le_bytes());
    for (timestamp, samples) in stamps {
        body.extend_from_slice(&timestamp.to_le_bytes());
        body.extend_from_slice(&(samples.len() as u32).to_le_bytes());
        for (handle, data) in samples {
            body.extend_from_slice(&handle.to_le_bytes());
            body.extend_from_slice(&(data.len() as u32).to_le_bytes());
            body.extend_from_slice(data);
        }
    }
    let mut payload = Vec::with_capacity(4 + body.len());
    payload.extend_from_slice(&(body.len() as u32).to_le_bytes());
    payload.extend_from_slice(&body);
    let device = (net_id(DEVICE_NET_ID).0, PLC_PORT);
    let bytes = encode_frame(
        client,
        device,
        CMD_DEVICE_NOTIFICATION,
        AMS_REQUEST,
        0,
        &payload,
    );
    stream.write_all(&bytes).await.unwrap();
}

fn net_id(text: &str) -> AmsNetId {
    text.parse().unwrap()
}

fn u32_at(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

fn u16_at(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([buf[offset], buf[offset + 1]])
}

/// Router with one open port, one route to a freshly bound mock listener,
/// and the accepted device-side stream.
async fn setup() -> (AmsRouter, u16, AmsAddr, TcpStream, TcpListener) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dest = match listener.local_addr().unwrap() {
        SocketAddr::V4(addr) => addr,
        SocketAddr::V6(_) => unreachable!(),
    };
    let ads = AmsRouter::new();
    let port = ads.open_port().unwrap();
    ads.add_route_to(net_id(DEVICE_NET_ID), dest).await.unwrap();
    let (device, _) = listener.accept().await.unwrap();
    (ads, port, AmsAddr::new(net_id(DEVICE_NET_ID), PLC_PORT), device, listener)
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 2 s");
}

// =========================================================================
// SCENARIOS
// =========================================================================

#[tokio::test]
async fn read_round_trip() {
    let (ads, port, plc, mut device, _listener) = setup().await;

    let mock = tokio::spawn(async move {
        let request = read_frame(&mut device).await.unwrap();
        assert_eq!(request.cmd_id, CMD_READ);
        assert_eq!(request.state_flags, AMS_REQUEST);
        assert_eq!(request.target, (net_id(DEVICE_NET_ID).0, PLC_PORT));
        // The local NetId is derived from the loopback socket.
        assert_eq!(request.source, ([127, 0, 0, 1, 1, 1], port));
        assert_eq!(u32_at(&request.payload, 0), 0x4040);
        assert_eq!(u32_at(&request.payload, 4), 1);
        assert_eq!(u32_at(&request.payload, 8), 4);

        let mut payload = Vec::new();
        payload.extend_from_slice(&0u32.to_le_bytes());
        payload.extend_from_slice(&4u32.to_le_bytes());
        payload.extend_from_slice(&[0x01, 0x02, 0x03, 0x04]);
        reply(&mut device, &request, &payload).await;
    });

    let mut buf = [0u8; 4];
    let bytes_read = ads.read(port, &plc, 0x4040, 1, &mut buf).await.unwrap();
    assert_eq!(bytes_read, 4);
    assert_eq!(buf, [0x01, 0x02, 0x03, 0x04]);
    mock.await.unwrap();
}

#[tokio::test]
async fn write_control_state_change() {
    let (ads, port, plc, mut device, _listener) = setup().await;

    let mock = tokio::spawn(async move {
        let request = read_frame(&mut device).await.unwrap();
        assert_eq!(request.cmd_id, CMD_WRITE_CONTROL);
        assert_eq!(u16_at(&request.payload, 0), ads_state::RECONFIG);
        assert_eq!(u16_at(&request.payload, 2), 0);
        assert_eq!(u32_at(&request.payload, 4), 0);
        reply(&mut device, &request, &0u32.to_le_bytes()).await;
    });

    ads.write_control(port, &plc, ads_state::RECONFIG, 0, &[])
        .await
        .unwrap();
    mock.await.unwrap();
}

#[tokio::test]
async fn timeout_then_success_with_late_response_dropped() {
    let (ads, port, plc, mut device, _listener) = setup().await;
    ads.set_timeout(port, 100).unwrap();

    let mock = tokio::spawn(async move {
        // Sit on the first request until the caller has timed out and
        // retried, then answer the stale invoke id first: the client must
        // drop it and still complete the retry correctly.
        let first = read_frame(&mut device).await.unwrap();
        let second = read_frame(&mut device).await.unwrap();
        assert_ne!(first.invoke_id, second.invoke_id);

        let mut stale = Vec::new();
        stale.extend_from_slice(&0u32.to_le_bytes());
        stale.extend_from_slice(&2u32.to_le_bytes());
        stale.extend_from_slice(&[0xDE, 0xAD]);
        reply(&mut device, &first, &stale).await;

        let mut fresh = Vec::new();
        fresh.extend_from_slice(&0u32.to_le_bytes());
        fresh.extend_from_slice(&2u32.to_le_bytes());
        fresh.extend_from_slice(&[0x11, 0x22]);
        reply(&mut device, &second, &fresh).await;
    });

    let mut buf = [0u8; 2];
    let started = Instant::now();
    let err = ads.read(port, &plc, 0x4040, 1, &mut buf).await.unwrap_err();
    let elapsed = started.elapsed();
    assert!(matches!(err, AdsError::Timeout(100)));
    assert!(elapsed >= Duration::from_millis(100), "timed out early: {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(1000), "timed out late: {:?}", elapsed);

    ads.set_timeout(port, 5000).unwrap();
    let bytes_read = ads.read(port, &plc, 0x4040, 1, &mut buf).await.unwrap();
    assert_eq!(bytes_read, 2);
    assert_eq!(buf, [0x11, 0x22]);
    mock.await.unwrap();
}

#[tokio::test]
async fn notification_samples_arrive_in_wire_order() {
    let (ads, port, plc, mut device, _listener) = setup().await;

    let seen: Arc<Mutex<Vec<(u64, Vec<u8>, u32)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);

    let mock = tokio::spawn(async move {
        let request = read_frame(&mut device).await.unwrap();
        assert_eq!(request.cmd_id, CMD_ADD_NOTIFICATION);
        assert_eq!(u32_at(&request.payload, 0), 0x4020);
        assert_eq!(u32_at(&request.payload, 4), 0);
        assert_eq!(u32_at(&request.payload, 8), 2); // sample length
        assert_eq!(u32_at(&request.payload, 12), trans_mode::SERVER_ON_CHANGE);
        assert_eq!(request.payload.len(), 24 + 16);

        let mut payload = Vec::new();
        payload.extend_from_slice(&0u32.to_le_bytes());
        payload.extend_from_slice(&0xABCDu32.to_le_bytes());
        reply(&mut device, &request, &payload).await;

        // Two stamps: the first with two samples, the second with one.
        let client = request.source;
        send_notification(
            &mut device,
            client,
            &[
                (1000, vec![(0xABCD, vec![0x01, 0x02]), (0xABCD, vec![0x03, 0x04])]),
                (2000, vec![(0xABCD, vec![0x05, 0x06])]),
            ],
        )
        .await;
        device
    });

    let attrib = AdsNotificationAttrib::server_on_change(2, 10_000);
    let handle = ads
        .add_notification(
            port,
            &plc,
            0x4020,
            0,
            &attrib,
            move |source, header, data, user| {
                assert_eq!(source.port, PLC_PORT);
                sink.lock().unwrap().push((header.timestamp, data.to_vec(), user));
            },
            7,
        )
        .await
        .unwrap();
    assert_eq!(handle, 0xABCD);

    wait_until(|| seen.lock().unwrap().len() == 3).await;
    let seen = seen.lock().unwrap();
    assert_eq!(
        seen.as_slice(),
        &[
            (1000, vec![0x01, 0x02], 7),
            (1000, vec![0x03, 0x04], 7),
            (2000, vec![0x05, 0x06], 7),
        ]
    );
    mock.await.unwrap();
}

#[tokio::test]
async fn connection_loss_fails_pending_and_reconnects() {
    let (ads, port, plc, mut device, listener) = setup().await;

    let mock = tokio::spawn(async move {
        let request = read_frame(&mut device).await.unwrap();
        assert_eq!(request.cmd_id, CMD_READ);
        // Drop the connection with the request still outstanding.
        drop(device);
    });

    let mut buf = [0u8; 4];
    let err = ads.read(port, &plc, 0x4040, 1, &mut buf).await.unwrap_err();
    assert!(matches!(err, AdsError::TransportClosed));
    mock.await.unwrap();

    // A later send without re-adding the route keeps failing.
    let err = ads.read(port, &plc, 0x4040, 1, &mut buf).await.unwrap_err();
    assert!(matches!(err, AdsError::TransportClosed));

    // Re-adding the route builds a fresh connection that works.
    let dest = match listener.local_addr().unwrap() {
        SocketAddr::V4(addr) => addr,
        SocketAddr::V6(_) => unreachable!(),
    };
    ads.add_route_to(net_id(DEVICE_NET_ID), dest).await.unwrap();
    let (mut device, _) = listener.accept().await.unwrap();

    let mock = tokio::spawn(async move {
        let request = read_frame(&mut device).await.unwrap();
        let mut payload = Vec::new();
        payload.extend_from_slice(&0u32.to_le_bytes());
        payload.extend_from_slice(&1u32.to_le_bytes());
        payload.push(0x55);
        reply(&mut device, &request, &payload).await;
    });
    let mut buf = [0u8; 1];
    assert_eq!(ads.read(port, &plc, 0x4040, 1, &mut buf).await.unwrap(), 1);
    assert_eq!(buf, [0x55]);
    mock.await.unwrap();
}

#[tokio::test]
async fn close_port_revokes_notifications_device_side() {
    let (ads, port, plc, mut device, _listener) = setup().await;

    let deliveries = Arc::new(Mutex::new(0u32));
    let sink = Arc::clone(&deliveries);

    let mock = tokio::spawn(async move {
        let request = read_frame(&mut device).await.unwrap();
        assert_eq!(request.cmd_id, CMD_ADD_NOTIFICATION);
        let client = request.source;
        let mut payload = Vec::new();
        payload.extend_from_slice(&0u32.to_le_bytes());
        payload.extend_from_slice(&0x7777u32.to_le_bytes());
        reply(&mut device, &request, &payload).await;

        // Port closure must delete the handle on the device.
        let request = read_frame(&mut device).await.unwrap();
        assert_eq!(request.cmd_id, CMD_DEL_NOTIFICATION);
        assert_eq!(u32_at(&request.payload, 0), 0x7777);
        reply(&mut device, &request, &0u32.to_le_bytes()).await;

        // The device fires once more; the client must discard it silently.
        send_notification(&mut device, client, &[(3000, vec![(0x7777, vec![0xFF])])]).await;
    });

    let attrib = AdsNotificationAttrib::server_cycle(1, 10_000);
    ads.add_notification(
        port,
        &plc,
        0x4020,
        4,
        &attrib,
        move |_, _, _, _| *sink.lock().unwrap() += 1,
        0,
    )
    .await
    .unwrap();

    ads.close_port(port).await.unwrap();
    mock.await.unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(*deliveries.lock().unwrap(), 0);
    assert!(matches!(ads.get_timeout(port), Err(AdsError::InvalidPort(_))));
}

#[tokio::test]
async fn ads_error_codes_pass_through() {
    let (ads, port, plc, mut device, _listener) = setup().await;

    let mock = tokio::spawn(async move {
        // Error carried in the response body's result field.
        let request = read_frame(&mut device).await.unwrap();
        let mut payload = Vec::new();
        payload.extend_from_slice(&0x710u32.to_le_bytes());
        payload.extend_from_slice(&0u32.to_le_bytes());
        reply(&mut device, &request, &payload).await;

        // Error carried in the AoE header itself.
        let request = read_frame(&mut device).await.unwrap();
        let mut frame = encode_frame(
            request.source,
            request.target,
            request.cmd_id,
            AMS_RESPONSE,
            request.invoke_id,
            &[],
        );
        frame[6 + 24..6 + 28].copy_from_slice(&0x6u32.to_le_bytes());
        device.write_all(&frame).await.unwrap();
    });

    let mut buf = [0u8; 4];
    let err = ads.read(port, &plc, 0x4040, 1, &mut buf).await.unwrap_err();
    assert!(matches!(err, AdsError::Ads(0x710)));
    let err = ads.read(port, &plc, 0x4040, 1, &mut buf).await.unwrap_err();
    assert!(matches!(err, AdsError::Ads(0x6)));
    mock.await.unwrap();
}

#[tokio::test]
async fn read_write_round_trip() {
    let (ads, port, plc, mut device, _listener) = setup().await;

    let mock = tokio::spawn(async move {
        let request = read_frame(&mut device).await.unwrap();
        assert_eq!(request.cmd_id, CMD_READ_WRITE);
        assert_eq!(u32_at(&request.payload, 0), 0xF080);
        assert_eq!(u32_at(&request.payload, 4), 5);
        assert_eq!(u32_at(&request.payload, 8), 8); // read length first
        assert_eq!(u32_at(&request.payload, 12), 3); // then write length
        assert_eq!(&request.payload[16..], &[0xA, 0xB, 0xC]);

        let mut payload = Vec::new();
        payload.extend_from_slice(&0u32.to_le_bytes());
        payload.extend_from_slice(&4u32.to_le_bytes());
        payload.extend_from_slice(&[1, 2, 3, 4]);
        reply(&mut device, &request, &payload).await;
    });

    let mut buf = [0u8; 8];
    let bytes_read = ads
        .read_write(port, &plc, 0xF080, 5, &mut buf, &[0xA, 0xB, 0xC])
        .await
        .unwrap();
    assert_eq!(bytes_read, 4);
    assert_eq!(&buf[..4], &[1, 2, 3, 4]);
    mock.await.unwrap();
}

#[tokio::test]
async fn read_state_and_device_info() {
    let (ads, port, plc, mut device, _listener) = setup().await;

    let mock = tokio::spawn(async move {
        let request = read_frame(&mut device).await.unwrap();
        assert_eq!(request.cmd_id, 4); // READ_STATE
        assert!(request.payload.is_empty());
        let mut payload = Vec::new();
        payload.extend_from_slice(&0u32.to_le_bytes());
        payload.extend_from_slice(&ads_state::RUN.to_le_bytes());
        payload.extend_from_slice(&0u16.to_le_bytes());
        reply(&mut device, &request, &payload).await;

        let request = read_frame(&mut device).await.unwrap();
        assert_eq!(request.cmd_id, 1); // READ_DEVICE_INFO
        let mut payload = Vec::new();
        payload.extend_from_slice(&0u32.to_le_bytes());
        payload.push(3);
        payload.push(1);
        payload.extend_from_slice(&4024u16.to_le_bytes());
        let mut name = [0u8; 16];
        name[..14].copy_from_slice(b"TwinCAT System");
        payload.extend_from_slice(&name);
        reply(&mut device, &request, &payload).await;
    });

    let (ads_st, dev_st) = ads.read_state(port, &plc).await.unwrap();
    assert_eq!(ads_st, ads_state::RUN);
    assert_eq!(dev_st, 0);

    let (name, version) = ads.read_device_info(port, &plc).await.unwrap();
    assert_eq!(name, "TwinCAT System");
    assert_eq!((version.version, version.revision, version.build), (3, 1, 4024));
    mock.await.unwrap();
}

// =========================================================================
// ROUTING & LIFECYCLE
// =========================================================================

#[tokio::test]
async fn one_connection_is_shared_and_refcounted_by_routes() {
    let (ads, port, _plc, mut device, listener) = setup().await;
    let second_id = net_id("5.0.0.2.1.1");
    let dest = match listener.local_addr().unwrap() {
        SocketAddr::V4(addr) => addr,
        SocketAddr::V6(_) => unreachable!(),
    };

    // Second NetId to the same IP shares the existing connection.
    ads.add_route_to(second_id, dest).await.unwrap();
    let no_new_conn = tokio::time::timeout(Duration::from_millis(50), listener.accept()).await;
    assert!(no_new_conn.is_err(), "router opened a second connection to the same IP");

    // Deleting one route keeps the shared connection usable via the other.
    ads.del_route(&net_id(DEVICE_NET_ID));
    let mock = tokio::spawn(async move {
        let request = read_frame(&mut device).await.unwrap();
        let mut payload = Vec::new();
        payload.extend_from_slice(&0u32.to_le_bytes());
        payload.extend_from_slice(&1u32.to_le_bytes());
        payload.push(0x42);
        reply(&mut device, &request, &payload).await;
        // Deleting the last route must close the socket.
        assert!(read_frame(&mut device).await.is_none());
    });

    let addr = AmsAddr::new(second_id, PLC_PORT);
    let mut buf = [0u8; 1];
    assert_eq!(ads.read(port, &addr, 0x4040, 0, &mut buf).await.unwrap(), 1);

    ads.del_route(&second_id);
    mock.await.unwrap();

    let err = ads.read(port, &addr, 0x4040, 0, &mut buf).await.unwrap_err();
    assert!(matches!(err, AdsError::NoRoute(_)));
}

#[tokio::test]
async fn notifications_keep_a_routeless_connection_alive() {
    let (ads, port, plc, mut device, _listener) = setup().await;

    let mock = tokio::spawn(async move {
        let request = read_frame(&mut device).await.unwrap();
        assert_eq!(request.cmd_id, CMD_ADD_NOTIFICATION);
        let mut payload = Vec::new();
        payload.extend_from_slice(&0u32.to_le_bytes());
        payload.extend_from_slice(&0x99u32.to_le_bytes());
        reply(&mut device, &request, &payload).await;
        device
    });

    let attrib = AdsNotificationAttrib::server_cycle(4, 10_000);
    ads.add_notification(port, &plc, 0x4020, 0, &attrib, |_, _, _, _| {}, 0)
        .await
        .unwrap();
    let mut device = mock.await.unwrap();

    // The route is gone but a notification still references the
    // connection, so the socket must stay open.
    ads.del_route(&net_id(DEVICE_NET_ID));
    let still_open = tokio::time::timeout(Duration::from_millis(100), read_frame(&mut device)).await;
    assert!(still_open.is_err(), "connection was destroyed while a notification remained");

    // Closing the port drops the last notification (the device-side delete
    // cannot be sent without a route) and with it the connection.
    ads.close_port(port).await.unwrap();
    let eof = tokio::time::timeout(Duration::from_millis(1000), read_frame(&mut device))
        .await
        .expect("connection still open after last notification was removed");
    assert!(eof.is_none());
}

#[tokio::test]
async fn requests_need_an_open_port_and_a_route() {
    let ads = AmsRouter::new();
    let unrouted = AmsAddr::new(net_id("9.9.9.9.1.1"), PLC_PORT);
    let mut buf = [0u8; 1];

    let err = ads.read(30000, &unrouted, 0, 0, &mut buf).await.unwrap_err();
    assert!(matches!(err, AdsError::InvalidPort(30000)));

    let port = ads.open_port().unwrap();
    let err = ads.read(port, &unrouted, 0, 0, &mut buf).await.unwrap_err();
    assert!(matches!(err, AdsError::NoRoute(_)));
}
