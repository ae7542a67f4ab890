use std::process;

use clank::{Connection, EventSink, Headers, Server, ServerConfig};

/// Answers every message with `received: <message>`.
struct EchoSink;

impl EventSink for EchoSink {
    fn on_open(&mut self, conn: &mut Connection, headers: &Headers) {
        println!(
            "open {} from {} ({})",
            conn.id(),
            conn.peer_addr(),
            headers.get("user-agent").unwrap_or("unknown agent")
        );
    }

    fn on_message(&mut self, conn: &mut Connection, text: &str) {
        println!("message {}: {:.50}", conn.id(), text);
        if let Err(e) = conn.send(&format!("received: {}", text)) {
            eprintln!("send to {} failed: {}", conn.id(), e);
        }
    }

    fn on_error(&mut self, conn: &mut Connection, _headers: &Headers) {
        eprintln!("handshake with {} failed", conn.peer_addr());
    }

    fn on_close(&mut self, conn: &Connection) {
        println!("close {}", conn.id());
    }
}

fn main() {
    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            process::exit(2);
        }
    };

    println!("Starting clank echo server on {}...", config);

    let mut server = match Server::bind(&config, EchoSink) {
        Ok(server) => server,
        Err(e) => {
            eprintln!("{}", e);
            process::exit(1);
        }
    };

    println!("Listening on {}", server.local_addr());

    if let Err(e) = server.run() {
        eprintln!("event loop failed: {}", e);
        process::exit(1);
    }
}
