//! Example Receiver
//!
//! Creates a chunk channel and prints every chunk index that arrives.
//! Start `sender` in another terminal with the same namespace.
//! Press Enter to stop.

use std::io::BufRead;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use venom_sync::{ChannelConfig, ChunkReceiver, Deadline, UserTrigger, WaitSet};

fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let namespace = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "venom_demo".to_string());

    println!("[Receiver] Starting with namespace: {}", namespace);

    let receiver = match ChunkReceiver::create(&namespace, ChannelConfig::default()) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("[Receiver] Failed to create channel: {}", e);
            std::process::exit(1);
        }
    };

    let stop = Arc::new(UserTrigger::new());
    let mut waitset: WaitSet<'_, 2> = match receiver.wait_set() {
        Ok(w) => w,
        Err(e) => {
            eprintln!("[Receiver] Failed to create wait set: {}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = waitset
        .attach_condition(&receiver)
        .and_then(|_| waitset.attach_condition(stop.as_ref()))
    {
        eprintln!("[Receiver] Failed to attach: {}", e);
        std::process::exit(1);
    }

    {
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            let _ = std::io::stdin().lock().lines().next();
            stop.fire();
        });
    }

    println!("[Receiver] Waiting for chunks... (Enter or 30s idle to quit)");

    let mut count = 0u64;
    'outer: loop {
        let fired = waitset.wait(Deadline::Timeout(Duration::from_secs(30)));
        if fired.is_empty() {
            println!("[Receiver] Idle");
            break;
        }
        for notification in fired {
            if notification.originates_from(stop.as_ref()) {
                println!("[Receiver] Stop requested");
                break 'outer;
            }
            while let Some(chunk) = receiver.try_recv() {
                count += 1;
                println!("[Receiver] chunk {} (#{}, {} queued)", chunk, count, receiver.len());
            }
        }
    }

    println!("[Receiver] Received {} chunks", count);
}
