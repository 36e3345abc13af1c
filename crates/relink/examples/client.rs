//! Simple client that connects to a Relink server and prints echoes.
//!
//! Run the server first:
//! - cargo run -p relink --example server -- 127.0.0.1:7777
//!
//! Then run the client:
//! - cargo run -p relink --example client -- 127.0.0.1:7777
//! - cargo run -p relink --example client -- 127.0.0.1:7777 10 200
//!   (sends 10 messages, 200ms apart)

use std::{
    env,
    net::SocketAddr,
    thread,
    time::{Duration, Instant},
};

use relink::{Host, PeerEvent};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Args: <server_addr> [count] [interval_ms]
    let mut args = env::args().skip(1);
    let server_addr: SocketAddr = args
        .next()
        .unwrap_or_else(|| "127.0.0.1:9000".to_string())
        .parse()?;
    let count: usize = args.next().unwrap_or_else(|| "5".into()).parse().unwrap_or(5);
    let interval_ms: u64 = args
        .next()
        .unwrap_or_else(|| "300".into())
        .parse()
        .unwrap_or(300);

    let mut host = Host::bind_any()?;
    let local = host.local_addr()?;
    println!(
        "Relink client bound to {} -> sending {} messages to {} (every {}ms)",
        local, count, server_addr, interval_ms
    );

    host.connect(server_addr);

    let mut sent = 0usize;
    let mut connected = false;
    let mut next_send = Instant::now();

    loop {
        host.manual_poll(Instant::now());

        while let Some(event) = host.recv() {
            match event {
                PeerEvent::Connected { addr } => {
                    println!("[connect] {}", addr);
                    connected = true;
                }
                PeerEvent::Data { addr, payload } => {
                    let text = String::from_utf8_lossy(&payload);
                    println!("[reply] from={} payload=\"{}\"", addr, text);
                }
                PeerEvent::ConnectionFailed { addr, reason } => {
                    println!("[failed] {} ({:?})", addr, reason);
                    return Ok(());
                }
                PeerEvent::Disconnected { addr, reason } => {
                    println!("[disconnect] {} ({:?})", addr, reason);
                    return Ok(());
                }
            }
        }

        if connected && sent < count && Instant::now() >= next_send {
            let msg = format!("hello {} from {}", sent, local);
            host.send_reliable(server_addr, msg.as_bytes())?;
            sent += 1;
            next_send = Instant::now() + Duration::from_millis(interval_ms);

            if sent == count {
                // give the last echo time to come back, then leave
                thread::sleep(Duration::from_millis(interval_ms));
                host.manual_poll(Instant::now());
                while let Some(event) = host.recv() {
                    if let PeerEvent::Data { payload, .. } = event {
                        println!("[reply] payload=\"{}\"", String::from_utf8_lossy(&payload));
                    }
                }
                host.disconnect(server_addr)?;
                host.manual_poll(Instant::now());
                println!("done");
                return Ok(());
            }
        }

        thread::sleep(Duration::from_millis(10));
    }
}
