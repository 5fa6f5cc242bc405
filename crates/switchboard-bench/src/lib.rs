//! Shared setup for the Switchboard benchmarks.

use switchboard_admission::{KeyStrategy, LimiterKind, RuleAction, RuleConfig};
use switchboard_core::{ConnectRequest, Hub, HubConfig, RoomSpec};
use switchboard_protocol::{InboundFrame, OutboundFrame};
use switchboard_transport::{memory_pair, MemoryClient};

/// Room every benchmark client joins.
pub const BENCH_ROOM: &str = "bench";

/// A hub with one public room and limits loose enough for benchmark load.
///
/// # Panics
///
/// Panics if the hub cannot be built.
pub async fn bench_hub() -> Hub {
    let mut config = HubConfig::default();
    config.admission.max_connections_per_identity = 100_000;
    config.admission.limiter = LimiterKind::FixedWindow;
    config.admission.rules = vec![RuleConfig {
        name: "bench".to_string(),
        pattern: ".*".to_string(),
        required_group: None,
        limit: u32::MAX,
        window_secs: 1,
        burst: None,
        priority: 0,
        strategy: KeyStrategy::Global,
        action: RuleAction::LogOnly,
    }];
    config.rooms.push(RoomSpec::public(BENCH_ROOM));
    Hub::new(config).await.expect("bench hub")
}

/// Open a session over the in-memory transport and wait for the handshake.
///
/// # Panics
///
/// Panics if the session is rejected.
pub async fn connect(hub: &Hub, addr: &str) -> MemoryClient {
    let (transport, mut client) = memory_pair(addr);
    let hub = hub.clone();
    let request = ConnectRequest::new(addr);
    tokio::spawn(async move { hub.serve(transport, request).await });

    match client.next_frame().await {
        Ok(OutboundFrame::ConnectionEstablished { .. }) => client,
        other => panic!("handshake failed: {:?}", other),
    }
}

/// Connect and join [`BENCH_ROOM`].
///
/// # Panics
///
/// Panics if the session is rejected or the join fails.
pub async fn connect_joined(hub: &Hub, addr: &str) -> MemoryClient {
    let mut client = connect(hub, addr).await;
    client
        .send(&InboundFrame::join(BENCH_ROOM))
        .expect("send join");
    client
        .next_matching(|f| matches!(f, OutboundFrame::RoomJoined { .. }))
        .await
        .expect("room joined");
    client
}
