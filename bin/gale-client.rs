use std::net::SocketAddr;
use std::sync::Arc;

use gale::channel::{ChannelKind, ControlMessage};
use gale::connection::ConnectionEvent;
use gale::driver::{ClientDriver, DriverConfig, DriverEvent};
use gale::names::NameTable;
use gale::rng::SharedRng;

fn parse_args() -> Result<SocketAddr, String> {
    let mut server = None;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--help" | "-h" => {
                eprintln!("usage: gale-client <server_addr>");
                std::process::exit(0);
            }
            other => {
                server = Some(other.parse().map_err(|_| format!("bad address {other}"))?);
            }
        }
    }
    server.ok_or_else(|| "server address required".to_string())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let server_addr = parse_args()?;

    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let names = Arc::new(NameTable::new());
    let (mut driver, mut events) = ClientDriver::connect(
        server_addr,
        DriverConfig::default(),
        SharedRng::from_entropy(),
        names,
    )
    .await?;

    let event_task = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                DriverEvent::Connected { addr } => eprintln!("connected to {addr}"),
                DriverEvent::Disconnected { addr } => {
                    eprintln!("disconnected from {addr}");
                    break;
                }
                DriverEvent::Connection { event, .. } => match event {
                    ConnectionEvent::Control(ControlMessage::Welcome { map, .. }) => {
                        eprintln!("welcomed into {map}");
                    }
                    ConnectionEvent::Data { ch_index, payload, .. } => {
                        eprintln!("ch{ch_index}: {} bytes", payload.len());
                    }
                    _ => {}
                },
            }
        }
    });

    // Once logged in, open a voice channel and chatter on it.
    let mut voice_ch = None;
    let mut ticks: u64 = 0;
    loop {
        driver.tick().await;
        ticks += 1;
        if driver.is_connected() && voice_ch.is_none() && ticks > 120 {
            if let Some(ch) = driver.open_channel(ChannelKind::Voice) {
                eprintln!("voice channel {ch} open");
                voice_ch = Some(ch);
            }
        }
        if let Some(ch) = voice_ch {
            if ticks % 60 == 0 {
                driver.send_data(ch, b"voice frame", false);
            }
        }
        tokio::time::sleep(std::time::Duration::from_millis(16)).await;
        if event_task.is_finished() {
            break;
        }
    }
    Ok(())
}
