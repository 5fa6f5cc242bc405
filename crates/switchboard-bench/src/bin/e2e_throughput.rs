//! End-to-end throughput benchmark for Switchboard.
//!
//! Clients join one room over real WebSockets and send as fast as they can;
//! every `message.new` received counts. The server needs the room seeded and
//! rate-limit rules loose enough for the load, for example:
//!
//! ```toml
//! [admission]
//! max_connections_per_identity = 1000
//! rules = [{ name = "bench", pattern = ".*", limit = 1000000000, window_secs = 1, action = "log_only" }]
//!
//! [[rooms]]
//! name = "bench"
//! ```

use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use switchboard_protocol::{codec, InboundFrame, OutboundFrame};
use tokio::sync::Barrier;
use tokio_tungstenite::{connect_async, tungstenite::Message};

const SERVER_URL: &str = "ws://127.0.0.1:8080/ws";
const ROOM: &str = "bench";
const WARMUP_SECS: u64 = 2;
const BENCH_SECS: u64 = 10;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    let num_clients = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(16);
    let url = args.get(2).cloned().unwrap_or_else(|| SERVER_URL.to_string());

    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║       Switchboard End-to-End Throughput Benchmark            ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Make sure the server is running: cargo run --release        ║");
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    run_room_benchmark(num_clients, url).await;
}

async fn run_room_benchmark(num_clients: usize, url: String) {
    println!("📊 Room Benchmark: {} clients in {:?}", num_clients, ROOM);
    println!("   Warmup: {}s, Measurement: {}s", WARMUP_SECS, BENCH_SECS);
    println!();

    let message_count = Arc::new(AtomicU64::new(0));
    let barrier = Arc::new(Barrier::new(num_clients + 1));

    let mut handles = Vec::new();

    for client_id in 0..num_clients {
        let msg_count = Arc::clone(&message_count);
        let barrier = Arc::clone(&barrier);
        let url = url.clone();

        let handle = tokio::spawn(async move {
            if let Err(e) = run_client(&url, msg_count, barrier).await {
                eprintln!("Client {} error: {}", client_id, e);
            }
        });
        handles.push(handle);
    }

    barrier.wait().await;
    println!("✓ All {} clients joined", num_clients);

    println!("⏳ Warming up for {}s...", WARMUP_SECS);
    tokio::time::sleep(Duration::from_secs(WARMUP_SECS)).await;

    message_count.store(0, Ordering::SeqCst);
    let start = Instant::now();

    println!("📈 Measuring for {}s...", BENCH_SECS);
    tokio::time::sleep(Duration::from_secs(BENCH_SECS)).await;

    let elapsed = start.elapsed();
    let total_messages = message_count.load(Ordering::SeqCst);

    let msgs_per_sec = total_messages as f64 / elapsed.as_secs_f64();
    let msgs_per_sec_per_client = msgs_per_sec / num_clients as f64;

    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║                         RESULTS                              ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!(
        "║  Clients:              {:>10}                           ║",
        num_clients
    );
    println!(
        "║  Duration:             {:>10.2}s                          ║",
        elapsed.as_secs_f64()
    );
    println!(
        "║  Messages Received:    {:>10}                           ║",
        total_messages
    );
    println!(
        "║  Throughput:           {:>10.0} msg/s                    ║",
        msgs_per_sec
    );
    println!(
        "║  Per-Client:           {:>10.0} msg/s                    ║",
        msgs_per_sec_per_client
    );
    println!("╚══════════════════════════════════════════════════════════════╝");

    for handle in handles {
        handle.abort();
    }
}

fn decode(message: &Message) -> Option<OutboundFrame> {
    match message {
        Message::Text(text) => codec::decode_outbound(text).ok(),
        _ => None,
    }
}

async fn run_client(
    url: &str,
    message_count: Arc<AtomicU64>,
    barrier: Arc<Barrier>,
) -> Result<(), BoxError> {
    let (ws, _) = connect_async(url).await?;
    let (mut sender, mut receiver) = ws.split();

    // connection.established, or a close frame on rejection.
    match receiver.next().await {
        Some(Ok(message)) => match decode(&message) {
            Some(OutboundFrame::ConnectionEstablished { .. }) => {}
            _ => return Err(format!("unexpected handshake: {:?}", message).into()),
        },
        Some(Err(e)) => return Err(e.into()),
        None => return Err("connection closed during handshake".into()),
    }

    let join = codec::encode_inbound(&InboundFrame::join(ROOM))?;
    sender.send(Message::Text(join)).await?;
    loop {
        match receiver.next().await {
            Some(Ok(message)) => match decode(&message) {
                Some(OutboundFrame::RoomJoined { .. }) => break,
                Some(OutboundFrame::Error { error }) => {
                    return Err(format!("join failed: {}", error.message).into())
                }
                _ => {}
            },
            Some(Err(e)) => return Err(e.into()),
            None => return Err("connection closed before join".into()),
        }
    }

    barrier.wait().await;

    let send_text = codec::encode_inbound(&InboundFrame::send_to_room(ROOM, "x".repeat(64)))?;

    let recv_count = Arc::clone(&message_count);
    let recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = receiver.next().await {
            if let Some(OutboundFrame::MessageNew { .. }) = decode(&message) {
                recv_count.fetch_add(1, Ordering::Relaxed);
            }
        }
    });

    loop {
        if sender.send(Message::Text(send_text.clone())).await.is_err() {
            break;
        }
        tokio::task::yield_now().await;
    }

    recv_task.abort();
    Ok(())
}
