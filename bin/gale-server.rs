use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use gale::channel::ControlMessage;
use gale::config::{DriverFileConfig, FileConfig};
use gale::connection::{ConnectionConfig, ConnectionEvent};
use gale::driver::{DriverConfig, DriverEvent, ServerDriver};
use gale::names::NameTable;
use gale::rng::SharedRng;

struct Args {
    bind_addr: Option<SocketAddr>,
    config: Option<PathBuf>,
}

fn parse_args() -> Result<Args, String> {
    let mut args = Args {
        bind_addr: None,
        config: None,
    };
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" => {
                let path = iter.next().ok_or("--config requires a path")?;
                args.config = Some(PathBuf::from(path));
            }
            "--help" | "-h" => {
                eprintln!("usage: gale-server [--config <file>] [bind_addr]");
                std::process::exit(0);
            }
            other => {
                args.bind_addr = Some(other.parse().map_err(|_| format!("bad address {other}"))?);
            }
        }
    }
    Ok(args)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = parse_args()?;
    let file_config = match &args.config {
        Some(path) => DriverFileConfig::load_from_file(path)?,
        None => DriverFileConfig::default(),
    };

    tracing_subscriber::fmt()
        .with_max_level(file_config.log_level_as_tracing())
        .init();

    let bind_addr = match args.bind_addr {
        Some(addr) => addr,
        None => file_config.bind_addr.parse()?,
    };

    let config = DriverConfig {
        tick_hz: file_config.tick_hz,
        max_connections: file_config.max_connections,
        connection: ConnectionConfig {
            max_channels: file_config.max_channels,
            timeout: file_config.idle_timeout.as_secs_f64(),
            keepalive_interval: file_config.keepalive_interval.as_secs_f64(),
            network_version: file_config.network_version,
            map_name: file_config.map_name.clone(),
            game_name: file_config.game_name.clone(),
            ..ConnectionConfig::default()
        },
    };

    let names = Arc::new(NameTable::new());
    let (mut driver, mut events) =
        ServerDriver::bind(bind_addr, config, SharedRng::from_entropy(), names).await?;

    eprintln!("gale server listening on {}", driver.local_addr()?);

    let event_task = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                DriverEvent::Connected { addr } => eprintln!("+ {addr}"),
                DriverEvent::Disconnected { addr } => eprintln!("- {addr}"),
                DriverEvent::Connection { addr, event } => match event {
                    ConnectionEvent::Control(ControlMessage::Join) => {
                        eprintln!("{addr} joined");
                    }
                    ConnectionEvent::Data { ch_index, payload, .. } => {
                        eprintln!("{addr} ch{ch_index}: {} bytes", payload.len());
                    }
                    _ => {}
                },
            }
        }
    });

    driver.run().await;
    event_task.abort();
    Ok(())
}
