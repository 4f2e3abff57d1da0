use std::net::SocketAddr;

use super::*;
use crate::bitstream::{packet_bit_len, BitReader};
use crate::rng::SharedRng;

fn addr(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

fn secret(fill: u8) -> [u8; SECRET_BYTE_SIZE] {
    [fill; SECRET_BYTE_SIZE]
}

fn decode(datagram: &[u8]) -> HandshakeMessage {
    let bit_len = packet_bit_len(datagram).expect("terminator present");
    let mut r = BitReader::new(datagram, bit_len);
    assert!(r.read_bit(), "handshake bit must lead");
    HandshakeMessage::decode(&mut r, bit_len - 1).expect("well-formed handshake packet")
}

#[test]
fn cookie_is_deterministic() {
    let s = secret(7);
    let a = addr("10.0.0.1:7777");
    let c1 = generate_cookie(&s, 12.5, &a);
    let c2 = generate_cookie(&s, 12.5, &a);
    assert_eq!(c1, c2);
    assert!(cookies_match(&c1, &c2));
}

#[test]
fn cookie_changes_with_any_input() {
    let s = secret(7);
    let a = addr("10.0.0.1:7777");
    let base = generate_cookie(&s, 12.5, &a);

    // One byte of the secret altered.
    let mut flipped = s;
    flipped[33] ^= 0x01;
    assert!(!cookies_match(&base, &generate_cookie(&flipped, 12.5, &a)));

    // Different timestamp, address, or port.
    assert!(!cookies_match(&base, &generate_cookie(&s, 12.6, &a)));
    assert!(!cookies_match(
        &base,
        &generate_cookie(&s, 12.5, &addr("10.0.0.2:7777"))
    ));
    assert!(!cookies_match(
        &base,
        &generate_cookie(&s, 12.5, &addr("10.0.0.1:7778"))
    ));
}

#[test]
fn packet_sizes_are_exact() {
    let exchange = HandshakeMessage::Exchange {
        restart: false,
        secret_id: 1,
        timestamp: 3.25,
        cookie: [0xAB; COOKIE_BYTE_SIZE],
    };
    let bytes = exchange.encode();
    // Meaningful bits = packet size; the terminator sits right after.
    assert_eq!(packet_bit_len(&bytes), Some(HANDSHAKE_PACKET_SIZE_BITS));

    let restart = HandshakeMessage::RestartRequest.encode();
    assert_eq!(
        packet_bit_len(&restart),
        Some(RESTART_HANDSHAKE_PACKET_SIZE_BITS)
    );

    let response = HandshakeMessage::RestartResponse {
        secret_id: 0,
        timestamp: 3.25,
        cookie: [1; COOKIE_BYTE_SIZE],
        original_cookie: [2; COOKIE_BYTE_SIZE],
    };
    assert_eq!(
        packet_bit_len(&response.encode()),
        Some(RESTART_RESPONSE_SIZE_BITS)
    );
}

#[test]
fn packet_codec_round_trip() {
    let messages = [
        HandshakeMessage::RestartRequest,
        HandshakeMessage::Exchange {
            restart: true,
            secret_id: 1,
            timestamp: -1.0,
            cookie: [0x5C; COOKIE_BYTE_SIZE],
        },
        HandshakeMessage::RestartResponse {
            secret_id: 0,
            timestamp: 99.0,
            cookie: [3; COOKIE_BYTE_SIZE],
            original_cookie: [4; COOKIE_BYTE_SIZE],
        },
    ];
    for message in messages {
        assert_eq!(decode(&message.encode()), message);
    }
}

#[test]
fn malformed_sizes_are_rejected() {
    // A truncated exchange packet: neither 2, 227 nor 387 bits.
    let bytes = HandshakeMessage::Exchange {
        restart: false,
        secret_id: 0,
        timestamp: 1.0,
        cookie: [0; COOKIE_BYTE_SIZE],
    }
    .encode();
    let truncated = &bytes[..bytes.len() - 4];
    // Re-terminate at an arbitrary boundary.
    let bit_len = truncated.len() * 8;
    let mut r = BitReader::new(truncated, bit_len);
    r.read_bit();
    assert!(HandshakeMessage::decode(&mut r, bit_len - 1).is_err());
}

#[test]
fn probe_matches_challenge_size() {
    // Anti-amplification: the unauthenticated probe must be at least as
    // large as anything the server sends back for it.
    let mut client = ClientHandshake::new();
    let probe = client.begin(0.0);

    let rng = SharedRng::from_seed(11);
    let mut server = ServerHandshake::new(rng, 0.0);
    let msg = decode(&probe);
    match server.incoming_connectionless(addr("127.0.0.1:4000"), msg, 0.5) {
        ServerOutcome::Reply(challenge) => assert_eq!(probe.len(), challenge.len()),
        _ => panic!("probe should earn a challenge"),
    }
}

fn run_handshake(
    server: &mut ServerHandshake,
    client: &mut ClientHandshake,
    client_addr: SocketAddr,
    now: f64,
) -> HandshakeInit {
    let probe = client.begin(now);
    let challenge = match server.incoming_connectionless(client_addr, decode(&probe), now + 0.01) {
        ServerOutcome::Reply(bytes) => bytes,
        _ => panic!("expected challenge"),
    };
    let response = match client.incoming(decode(&challenge), now + 0.02) {
        ClientOutcome::Reply(bytes) => bytes,
        _ => panic!("expected challenge response"),
    };
    let (ack, init) =
        match server.incoming_connectionless(client_addr, decode(&response), now + 0.03) {
            ServerOutcome::Complete { reply, init } => (reply, init),
            _ => panic!("expected completion"),
        };
    match client.incoming(decode(&ack), now + 0.04) {
        ClientOutcome::Initialized {
            server_seq,
            client_seq,
            restarted,
        } => {
            assert_eq!(restarted, init.restarted);
            if !restarted {
                assert_eq!(server_seq, init.server_seq);
                assert_eq!(client_seq, init.client_seq);
            }
        }
        _ => panic!("expected client initialization"),
    }
    init
}

#[test]
fn end_to_end_handshake_agrees_on_sequences() {
    let rng = SharedRng::from_seed(42);
    let mut server = ServerHandshake::new(rng, 0.0);
    let mut client = ClientHandshake::new();
    let client_addr = addr("192.168.1.50:9000");

    let init = run_handshake(&mut server, &mut client, client_addr, 1.0);
    assert!(!init.restarted);
    assert!(client.is_initialized());
    assert_eq!(client.server_seq(), init.server_seq);
    assert_eq!(client.client_seq(), init.client_seq);
    assert_eq!(
        server.last_challenge_success_address(),
        Some(client_addr)
    );
    assert_eq!(client.authorised_cookie(), Some(&init.cookie));
}

#[test]
fn stale_cookie_outside_lifetime_is_dropped() {
    let rng = SharedRng::from_seed(1);
    let mut server = ServerHandshake::new(rng, 0.0);
    let mut client = ClientHandshake::new();
    let client_addr = addr("10.1.1.1:5555");

    let probe = client.begin(0.0);
    let challenge = match server.incoming_connectionless(client_addr, decode(&probe), 1.0) {
        ServerOutcome::Reply(bytes) => bytes,
        _ => panic!(),
    };
    let response = match client.incoming(decode(&challenge), 1.1) {
        ClientOutcome::Reply(bytes) => bytes,
        _ => panic!(),
    };
    // The echo arrives long past the maximum cookie lifetime.
    let late = 1.0 + MAX_COOKIE_LIFETIME + 1.0;
    assert!(matches!(
        server.incoming_connectionless(client_addr, decode(&response), late),
        ServerOutcome::Drop
    ));
}

#[test]
fn tampered_cookie_is_dropped() {
    let rng = SharedRng::from_seed(2);
    let mut server = ServerHandshake::new(rng, 0.0);
    let mut client = ClientHandshake::new();
    let client_addr = addr("10.1.1.2:5555");

    let probe = client.begin(0.0);
    let challenge = match server.incoming_connectionless(client_addr, decode(&probe), 0.5) {
        ServerOutcome::Reply(bytes) => bytes,
        _ => panic!(),
    };
    let response = match client.incoming(decode(&challenge), 0.6) {
        ClientOutcome::Reply(bytes) => bytes,
        _ => panic!(),
    };
    let tampered = match decode(&response) {
        HandshakeMessage::Exchange {
            restart,
            secret_id,
            timestamp,
            mut cookie,
        } => {
            cookie[5] ^= 0x80;
            HandshakeMessage::Exchange {
                restart,
                secret_id,
                timestamp,
                cookie,
            }
        }
        _ => panic!(),
    };
    assert!(matches!(
        server.incoming_connectionless(client_addr, tampered, 0.7),
        ServerOutcome::Drop
    ));

    // An echo from a different source address fails too: the cookie binds
    // the address.
    assert!(matches!(
        server.incoming_connectionless(addr("10.9.9.9:5555"), decode(&response), 0.7),
        ServerOutcome::Drop
    ));
}

#[test]
fn previous_secret_stays_valid_until_rotated_past() {
    let rng = SharedRng::from_seed(3);
    let mut server = ServerHandshake::new(rng, 0.0);
    let mut client = ClientHandshake::new();
    let client_addr = addr("172.16.0.4:6000");

    let probe = client.begin(0.0);
    let challenge_time = 1.0;
    let challenge =
        match server.incoming_connectionless(client_addr, decode(&probe), challenge_time) {
            ServerOutcome::Reply(bytes) => bytes,
            _ => panic!(),
        };
    let response = match client.incoming(decode(&challenge), 1.1) {
        ClientOutcome::Reply(bytes) => bytes,
        _ => panic!(),
    };

    // Drive one secret rotation; the challenge's secret is now "previous"
    // but the cookie is older than the rotation, so it still validates.
    let rotate_time = SECRET_UPDATE_TIME + SECRET_UPDATE_TIME_VARIANCE + 0.5;
    server.tick(rotate_time);
    assert!(matches!(
        server.incoming_connectionless(client_addr, decode(&response), rotate_time + 0.1),
        ServerOutcome::Complete { .. }
    ));
}

#[test]
fn restart_request_is_rate_limited() {
    let rng = SharedRng::from_seed(4);
    let mut server = ServerHandshake::new(rng, 0.0);
    let unknown = addr("203.0.113.9:1234");

    assert!(server.notify_unknown_packet(unknown, 5.0).is_some());
    // Immediately repeated: throttled.
    assert!(server.notify_unknown_packet(unknown, 5.5).is_none());
    // After the minimum interval it may ask again.
    assert!(server
        .notify_unknown_packet(unknown, 5.0 + RESTART_REQUEST_MIN_INTERVAL + 0.1)
        .is_some());
}

#[test]
fn restart_handshake_preserves_session_sequences() {
    let rng = SharedRng::from_seed(5);
    let mut server = ServerHandshake::new(rng, 0.0);
    let mut client = ClientHandshake::new();
    let old_addr = addr("198.51.100.7:7000");

    let init = run_handshake(&mut server, &mut client, old_addr, 1.0);
    let original_cookie = init.cookie;
    let server_seq = client.server_seq();
    let client_seq = client.client_seq();

    // The client's NAT rebinds; the server sees an unknown address and
    // requests a restart.
    let new_addr = addr("198.51.100.7:7031");
    let restart_req = server
        .notify_unknown_packet(new_addr, 30.0)
        .expect("restart request");

    let probe = match client.incoming(decode(&restart_req), 30.0) {
        ClientOutcome::Reply(bytes) => bytes,
        _ => panic!("client should restart"),
    };
    let challenge = match server.incoming_connectionless(new_addr, decode(&probe), 30.1) {
        ServerOutcome::Reply(bytes) => bytes,
        _ => panic!(),
    };
    let response = match client.incoming(decode(&challenge), 30.2) {
        ClientOutcome::Reply(bytes) => bytes,
        _ => panic!(),
    };
    // The response carries the original cookie for session lookup.
    match decode(&response) {
        HandshakeMessage::RestartResponse {
            original_cookie: oc,
            ..
        } => assert_eq!(oc, original_cookie),
        other => panic!("expected restart response, got {other:?}"),
    }
    let (ack, restart_init) =
        match server.incoming_connectionless(new_addr, decode(&response), 30.3) {
            ServerOutcome::Complete { reply, init } => (reply, init),
            _ => panic!(),
        };
    assert!(restart_init.restarted);
    assert_eq!(restart_init.original_cookie, Some(original_cookie));

    match client.incoming(decode(&ack), 30.4) {
        ClientOutcome::Initialized {
            server_seq: s,
            client_seq: c,
            restarted,
        } => {
            assert!(restarted);
            // Sequences survive the restart unchanged.
            assert_eq!(s, server_seq);
            assert_eq!(c, client_seq);
        }
        _ => panic!("client should re-initialize"),
    }
}

#[test]
fn client_resends_after_silence() {
    let mut client = ClientHandshake::new();
    let probe = client.begin(0.0);
    // Nothing back yet; before the resend interval stays quiet.
    assert!(client.tick(0.5).is_none());
    // Past it the probe goes out again.
    let resent = client.tick(0.0 + HANDSHAKE_RESEND_INTERVAL + 0.1).unwrap();
    assert_eq!(probe, resent);
}

#[test]
fn client_restarts_probe_past_min_cookie_lifetime() {
    let rng = SharedRng::from_seed(6);
    let mut server = ServerHandshake::new(rng, 0.0);
    let mut client = ClientHandshake::new();
    let client_addr = addr("10.2.2.2:8000");

    let probe = client.begin(0.0);
    let challenge = match server.incoming_connectionless(client_addr, decode(&probe), 0.1) {
        ServerOutcome::Reply(bytes) => bytes,
        _ => panic!(),
    };
    let response = match client.incoming(decode(&challenge), 0.2) {
        ClientOutcome::Reply(bytes) => bytes,
        _ => panic!(),
    };
    // Shortly after, the resend repeats the stored challenge response.
    let resent = client.tick(0.2 + HANDSHAKE_RESEND_INTERVAL + 0.1).unwrap();
    assert_eq!(resent, response);
    // Much later the stored response is presumed stale; back to the probe.
    let restarted = client.tick(MIN_COOKIE_LIFETIME + 5.0).unwrap();
    assert_eq!(decode(&restarted), decode(&probe));
}
