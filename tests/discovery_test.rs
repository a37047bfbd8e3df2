//! Peer discovery and stream negotiation over real localhost sockets

use std::net::UdpSocket;
use std::time::{Duration, Instant};

use rosc::{OscPacket, OscType};

use mixel::defines::{ALIVE, PING_PERIOD_MS};
use mixel::net::toolkit::StreamProtocol;
use mixel::net::{Connection, Streaming};

/// Two instances on the same host discover each other within a couple of
/// ping periods.
#[test]
fn two_instances_discover_each_other() {
    let mut a = Connection::new();
    let mut b = Connection::new();
    let id_a = a.init().expect("instance A failed to start");
    let id_b = b.init().expect("instance B failed to start");
    assert_ne!(id_a, id_b, "instances must take distinct ports");

    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline && (a.num_hosts() < 2 || b.num_hosts() < 2) {
        std::thread::sleep(Duration::from_millis(100));
    }

    assert_eq!(a.num_hosts(), 2, "A should list B");
    assert_eq!(b.num_hosts(), 2, "B should list A");

    let peer_of_a = a.info(1);
    assert_eq!(peer_of_a.port_handshake, b.info(0).port_handshake);
    assert_eq!(peer_of_a.alive, ALIVE);

    // a silent peer is removed after ALIVE missed pings
    b.terminate();
    drop(b);
    let removal_deadline = Instant::now()
        + Duration::from_millis((ALIVE as u64 + 4) * PING_PERIOD_MS);
    while Instant::now() < removal_deadline && a.num_hosts() > 1 {
        std::thread::sleep(Duration::from_millis(100));
    }
    assert_eq!(a.num_hosts(), 1, "silent peer must be dropped");

    a.terminate();
}

/// Request, offer and disconnect round-trip against the negotiation
/// listener, as a consumer would drive it.
#[test]
fn stream_request_offer_disconnect() {
    let mut streaming = Streaming::new(0);
    streaming.init().expect("streaming listener failed to start");
    streaming.enable(true);
    streaming.set_resolution(640, 360);
    let producer_port = streaming.port();

    // consumer asks for a stream, replies expected on its own socket
    let client = UdpSocket::bind("127.0.0.1:0").unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    let reply_port = client.local_addr().unwrap().port();
    let request = rosc::encoder::encode(&OscPacket::Message(rosc::OscMessage {
        addr: "/vimix/request".to_string(),
        args: vec![
            OscType::Int(reply_port as i32),
            OscType::String("tester".to_string()),
        ],
    }))
    .unwrap();
    client
        .send_to(&request, ("127.0.0.1", producer_port))
        .unwrap();

    // the offer must advertise RAW (same host) and the output resolution
    let mut buf = [0u8; rosc::decoder::MTU];
    let (size, _) = client.recv_from(&mut buf).expect("no offer received");
    let (_, packet) = rosc::decoder::decode_udp(&buf[..size]).unwrap();
    let OscPacket::Message(offer) = packet else {
        panic!("expected an OSC message")
    };
    assert_eq!(offer.addr, "/vimix/offer");
    assert_eq!(offer.args[1], OscType::Int(StreamProtocol::UdpRaw as i32));
    assert_eq!(offer.args[2], OscType::Int(640));
    assert_eq!(offer.args[3], OscType::Int(360));
    let OscType::Int(stream_port) = offer.args[0].clone() else {
        panic!("offer must carry the stream port")
    };

    // the producer queued the accepted stream for the render thread
    let accepted = streaming.drain_new_streams();
    assert_eq!(accepted.len(), 1);
    assert_eq!(accepted[0].client_name, "tester");
    assert_eq!(accepted[0].port as i32, stream_port);
    streaming.register(accepted[0].clone(), 42);

    // disconnect stops the matching streamer
    let disconnect = rosc::encoder::encode(&OscPacket::Message(rosc::OscMessage {
        addr: "/vimix/disconnect".to_string(),
        args: vec![OscType::Int(stream_port)],
    }))
    .unwrap();
    client
        .send_to(&disconnect, ("127.0.0.1", producer_port))
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    let mut stops = Vec::new();
    while Instant::now() < deadline && stops.is_empty() {
        stops = streaming.drain_stop_requests();
        std::thread::sleep(Duration::from_millis(50));
    }
    assert_eq!(stops.len(), 1);
    let grabber = streaming.match_stop(&stops[0].0, stops[0].1);
    assert_eq!(grabber, Some(42));
    assert!(!streaming.busy());

    streaming.terminate();
}

/// A request while connections are refused is answered with a reject.
#[test]
fn refused_request_gets_reject() {
    let mut streaming = Streaming::new(0);
    streaming.init().expect("streaming listener failed to start");
    // not enabled

    let client = UdpSocket::bind("127.0.0.1:0").unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    let reply_port = client.local_addr().unwrap().port();
    let request = rosc::encoder::encode(&OscPacket::Message(rosc::OscMessage {
        addr: "/vimix/request".to_string(),
        args: vec![
            OscType::Int(reply_port as i32),
            OscType::String("tester".to_string()),
        ],
    }))
    .unwrap();
    client
        .send_to(&request, ("127.0.0.1", streaming.port()))
        .unwrap();

    let mut buf = [0u8; rosc::decoder::MTU];
    let (size, _) = client.recv_from(&mut buf).expect("no reply received");
    let (_, packet) = rosc::decoder::decode_udp(&buf[..size]).unwrap();
    let OscPacket::Message(reply) = packet else {
        panic!("expected an OSC message")
    };
    assert_eq!(reply.addr, "/vimix/reject");
    assert!(streaming.drain_new_streams().is_empty());

    streaming.terminate();
}
