use bytes::Bytes;
use tracing::info;
use treadsync::{
    sim::SimStep,
    types::{Clock, SystemClock},
    GattProfile, MemorySessionStore, Result, Session, SimulatedTreadmill,
    SyncConfig, SyncEngine,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("🧪 Treadsync Simulated Sync Example");

    let now = SystemClock.now_epoch();
    let yesterday = now.saturating_sub(86_400);
    let sessions = [
        Session::new(yesterday, yesterday + 1_500, 3_100),
        Session::new(yesterday + 7_200, yesterday + 9_000, 4_250),
        Session::new(yesterday + 14_400, yesterday + 15_000, 980),
    ];

    // Tracker clock ten minutes fast, one corrupted frame mid-stream
    let treadmill = SimulatedTreadmill::new(GattProfile::default(), now.saturating_add(600))
        .with_records(sessions[..2].iter().copied())
        .then(SimStep::Frame(Bytes::from_static(&[0xDE, 0xAD, 0xBE, 0xEF, 0x00, 0x01, 0x02])))
        .with_records([sessions[2]])
        .then_complete();
    let writes = treadmill.write_log();

    let store = MemorySessionStore::new();
    let engine = SyncEngine::new(treadmill, store.clone(), SyncConfig::default());

    let report = engine.sync().await?;
    info!("✅ {}", report.message);

    println!("\n📈 Stored Sessions:");
    for session in store.sessions().await {
        println!("  {}", session.summary());
    }
    println!("  Writes seen by the tracker: {}", writes.lock().await.len());

    Ok(())
}
