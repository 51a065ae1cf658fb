//! Example Sender
//!
//! Connects to a running `receiver` and sends a burst of chunk indices.

use std::thread;
use std::time::Duration;

use venom_sync::{ChunkSender, QueueFull};

fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let mut args = std::env::args().skip(1);
    let namespace = args.next().unwrap_or_else(|| "venom_demo".to_string());
    let count: u64 = args.next().and_then(|n| n.parse().ok()).unwrap_or(10);

    let sender = match ChunkSender::connect(&namespace) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("[Sender] Failed to connect to '{}': {}", namespace, e);
            eprintln!("[Sender] Is the receiver running?");
            std::process::exit(1);
        }
    };

    println!("[Sender] Connected to {}", sender.namespace());

    for chunk in 0..count {
        let mut pending = chunk;
        loop {
            match sender.try_send(pending) {
                Ok(outcome) => {
                    if let Some(old) = outcome.evicted() {
                        println!("[Sender] chunk {} evicted chunk {}", chunk, old);
                    }
                    break;
                }
                Err(QueueFull(value)) => {
                    pending = value;
                    thread::sleep(Duration::from_millis(1));
                }
            }
        }
        println!("[Sender] sent chunk {}", chunk);
        thread::sleep(Duration::from_millis(50));
    }
}
