//! Simple echo server using Relink.
//!
//! Run:
//! - cargo run -p relink --example server
//! - cargo run -p relink --example server -- 127.0.0.1:7777

use std::{
    env,
    net::SocketAddr,
    thread,
    time::{Duration, Instant},
};

use relink::{Config, Host, PeerEvent};

fn parse_bind_addr() -> Option<SocketAddr> {
    let mut args = env::args().skip(1);
    args.next().and_then(|s| s.parse().ok())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Basic config; tweak here if you want to demo features quickly
    let mut config = Config::default();
    // Uncomment to try features:
    // config.key = Some("sesame".into());
    // config.max_connections = 8;

    config.max_connections = 100;

    let bind_addr = parse_bind_addr().unwrap_or_else(|| "127.0.0.1:9000".parse().unwrap());
    let mut host = Host::bind_with_config(bind_addr, config)?;
    let local = host.local_addr()?;
    println!("Relink echo server listening on {}", local);
    println!("Connect with the client example to see echoes.");

    loop {
        host.manual_poll(Instant::now());

        while let Some(event) = host.recv() {
            match event {
                PeerEvent::Connected { addr } => {
                    println!("[connect] {}", addr);
                }
                PeerEvent::Data { addr, payload } => {
                    let text = String::from_utf8_lossy(&payload);
                    println!("[data] from={} payload=\"{}\"", addr, text);

                    // Echo back with guaranteed in-order delivery
                    if let Err(e) = host.send_reliable(addr, &payload) {
                        eprintln!("failed to queue echo: {}", e);
                    }
                }
                PeerEvent::ConnectionFailed { addr, reason } => {
                    println!("[failed] {} ({:?})", addr, reason);
                }
                PeerEvent::Disconnected { addr, reason } => {
                    println!("[disconnect] {} ({:?})", addr, reason);
                }
            }
        }

        thread::sleep(Duration::from_millis(10));
    }
}
