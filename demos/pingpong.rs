//! Two in-process transport stacks exchange request/response pairs over
//! an in-memory link, printing round-trip times and the engine metrics.
//!
//!     cargo run --example pingpong -- -n 1000 -s 500

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::Instant;

use getopts::Options;
use homa_rs::phy::Loopback;
use homa_rs::{Config, Error, Message, RecvFlags, Stack};

const CLIENT_ADDR: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
const SERVER_ADDR: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);

fn pump(client: &Stack, server: &Stack, client_dev: &Loopback, server_dev: &Loopback) {
    loop {
        let mut moved = false;
        while let Some((dst, _, frame)) = client_dev.dequeue() {
            moved = true;
            if dst == SERVER_ADDR {
                server.handle_packet(CLIENT_ADDR, &frame);
            }
        }
        while let Some((dst, _, frame)) = server_dev.dequeue() {
            moved = true;
            if dst == CLIENT_ADDR {
                client.handle_packet(SERVER_ADDR, &frame);
            }
        }
        if !moved {
            break;
        }
    }
}

/// Ferry frames and run the pacers until a receive succeeds; the demo
/// has no background threads, so transmission is driven from here.
fn drive_recv(
    recv: impl Fn() -> Result<Message, Error>,
    client_stack: &Stack,
    server_stack: &Stack,
    client_dev: &Loopback,
    server_dev: &Loopback,
) -> Message {
    loop {
        pump(client_stack, server_stack, client_dev, server_dev);
        match recv() {
            Ok(message) => return message,
            Err(Error::WouldBlock) => {
                client_stack.pacer_xmit();
                server_stack.pacer_xmit();
            }
            Err(err) => panic!("receive failed: {err}"),
        }
    }
}

fn main() {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    let mut opts = Options::new();
    opts.optopt("n", "count", "number of RPCs to issue", "COUNT");
    opts.optopt("s", "size", "request payload size in bytes", "BYTES");
    opts.optopt("p", "port", "server port", "PORT");
    opts.optflag("h", "help", "print this help menu");
    let matches = match opts.parse(&args[1..]) {
        Ok(m) => m,
        Err(e) => {
            eprintln!("{e}");
            return;
        }
    };
    if matches.opt_present("h") {
        print!("{}", opts.usage("Usage: pingpong [options]"));
        return;
    }
    let count: usize = matches
        .opt_str("n")
        .and_then(|v| v.parse().ok())
        .unwrap_or(1000);
    let size: usize = matches
        .opt_str("s")
        .and_then(|v| v.parse().ok())
        .unwrap_or(500);
    let port: u16 = matches
        .opt_str("p")
        .and_then(|v| v.parse().ok())
        .unwrap_or(500);

    let client_dev = Arc::new(Loopback::default());
    let server_dev = Arc::new(Loopback::default());
    let client_stack = Stack::new(client_dev.clone(), Config::default());
    let server_stack = Stack::new(server_dev.clone(), Config::default());

    let server = server_stack.open();
    server.bind(port).unwrap();
    let client = client_stack.open();
    let dest = SocketAddrV4::new(SERVER_ADDR, port);

    let request: Vec<u8> = (0..size).map(|_| rand::random()).collect();
    let nonblocking = RecvFlags {
        nonblocking: true,
        ..RecvFlags::default()
    };

    let mut total_rtt = std::time::Duration::ZERO;
    let mut min_rtt = std::time::Duration::MAX;
    let started = Instant::now();
    for i in 0..count {
        let begin = Instant::now();
        let id = client.send(dest, &request).unwrap();
        let msg = drive_recv(
            || server.recv(nonblocking),
            &client_stack,
            &server_stack,
            &client_dev,
            &server_dev,
        );
        server.reply(msg.peer, msg.id, &msg.payload).unwrap();
        let resp = drive_recv(
            || client.recv_response(id, nonblocking),
            &client_stack,
            &server_stack,
            &client_dev,
            &server_dev,
        );
        assert_eq!(resp.payload, request);
        let rtt = begin.elapsed();
        total_rtt += rtt;
        min_rtt = min_rtt.min(rtt);
        if (i + 1) % 10_000 == 0 {
            println!("{} RPCs done", i + 1);
        }
    }
    let elapsed = started.elapsed();

    println!(
        "{count} RPCs of {size} bytes in {:.1} ms ({:.1} us/RPC avg, {:.1} us best)",
        elapsed.as_secs_f64() * 1e3,
        total_rtt.as_secs_f64() * 1e6 / count as f64,
        min_rtt.as_secs_f64() * 1e6,
    );
    println!("--- client metrics ---");
    print!("{}", client_stack.print_metrics());
    println!("--- server metrics ---");
    print!("{}", server_stack.print_metrics());
}
