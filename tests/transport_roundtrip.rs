use std::sync::Arc;
use std::time::Duration;

use gale::channel::{ChannelKind, ControlMessage};
use gale::connection::ConnectionEvent;
use gale::driver::{ClientDriver, DriverConfig, DriverEvent, ServerDriver};
use gale::names::NameTable;
use gale::rng::SharedRng;
use tokio::sync::mpsc;

async fn start_pair() -> (
    ServerDriver,
    mpsc::Receiver<DriverEvent>,
    ClientDriver,
    mpsc::Receiver<DriverEvent>,
) {
    let names = Arc::new(NameTable::new());
    let (server, server_events) = ServerDriver::bind(
        "127.0.0.1:0".parse().unwrap(),
        DriverConfig::default(),
        SharedRng::from_seed(1001),
        names.clone(),
    )
    .await
    .expect("server bind");
    let server_addr = server.local_addr().expect("local addr");

    let (client, client_events) = ClientDriver::connect(
        server_addr,
        DriverConfig::default(),
        SharedRng::from_seed(2002),
        names,
    )
    .await
    .expect("client connect");

    (server, server_events, client, client_events)
}

fn drain(rx: &mut mpsc::Receiver<DriverEvent>, into: &mut Vec<DriverEvent>) {
    while let Ok(event) = rx.try_recv() {
        into.push(event);
    }
}

#[tokio::test]
async fn handshake_login_and_data_over_loopback() {
    let (mut server, mut server_events, mut client, mut client_events) = start_pair().await;

    let mut server_seen = Vec::new();
    let mut client_seen = Vec::new();

    // Drive both sides until the login exchange completes.
    for _ in 0..400 {
        server.tick().await;
        client.tick().await;
        drain(&mut server_events, &mut server_seen);
        drain(&mut client_events, &mut client_seen);

        let joined = server_seen.iter().any(|e| {
            matches!(
                e,
                DriverEvent::Connection {
                    event: ConnectionEvent::JoinComplete,
                    ..
                }
            )
        });
        if joined {
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    assert!(
        server_seen
            .iter()
            .any(|e| matches!(e, DriverEvent::Connected { .. })),
        "server should report the connection"
    );
    assert!(
        client_seen
            .iter()
            .any(|e| matches!(e, DriverEvent::Connected { .. })),
        "client should report the connection"
    );
    assert!(
        client_seen.iter().any(|e| matches!(
            e,
            DriverEvent::Connection {
                event: ConnectionEvent::Control(ControlMessage::Welcome { .. }),
                ..
            }
        )),
        "client should be welcomed"
    );
    assert!(
        server_seen.iter().any(|e| matches!(
            e,
            DriverEvent::Connection {
                event: ConnectionEvent::JoinComplete,
                ..
            }
        )),
        "server should see the join complete"
    );

    // Open a data channel client-side and push a payload through it.
    let ch = client
        .open_channel(ChannelKind::Actor)
        .expect("actor channel");
    assert!(client.send_data(ch, b"replicated state", true));

    let mut got_payload = None;
    for _ in 0..400 {
        client.tick().await;
        server.tick().await;
        drain(&mut server_events, &mut server_seen);

        got_payload = server_seen.iter().find_map(|e| match e {
            DriverEvent::Connection {
                event: ConnectionEvent::Data { payload, .. },
                ..
            } => Some(payload.clone()),
            _ => None,
        });
        if got_payload.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    let payload = got_payload.expect("server should receive channel data");
    assert_eq!(&payload[..16], b"replicated state");

    client.shutdown();
    server.shutdown();
}

#[tokio::test]
async fn large_payload_fragments_across_packets() {
    let (mut server, mut server_events, mut client, mut client_events) = start_pair().await;

    let mut server_seen = Vec::new();
    let mut scratch = Vec::new();

    // Wait for the connection.
    for _ in 0..400 {
        server.tick().await;
        client.tick().await;
        drain(&mut client_events, &mut scratch);
        if client.is_connected() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    assert!(client.is_connected());

    let ch = client
        .open_channel(ChannelKind::Actor)
        .expect("actor channel");
    let big: Vec<u8> = (0..4096u32).map(|i| (i % 253) as u8).collect();
    assert!(client.send_data(ch, &big, true));

    let mut got = None;
    for _ in 0..400 {
        client.tick().await;
        server.tick().await;
        drain(&mut server_events, &mut server_seen);
        got = server_seen.iter().find_map(|e| match e {
            DriverEvent::Connection {
                event:
                    ConnectionEvent::Data {
                        payload,
                        payload_bits,
                        ..
                    },
                ..
            } => Some((payload.clone(), *payload_bits)),
            _ => None,
        });
        if got.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    let (payload, payload_bits) = got.expect("reassembled payload");
    assert_eq!(payload_bits, big.len() * 8);
    assert_eq!(payload[..big.len()], big[..]);

    client.shutdown();
    server.shutdown();
}
