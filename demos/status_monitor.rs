use tokio::time::Instant;
use tracing::{error, info, warn};
use treadsync::{BtleplugLink, MemorySessionStore, Result, SyncConfig, SyncEngine, SyncState};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("📊 Treadsync Status Monitor Example");

    let link = match BtleplugLink::new().await {
        Ok(link) => link,
        Err(e) => {
            error!("❌ Bluetooth unavailable: {}", e);
            return Err(e);
        }
    };
    let store = MemorySessionStore::new();
    let engine = SyncEngine::new(link, store.clone(), SyncConfig::default());

    // Observe every published snapshot while the run is in flight
    let mut status = engine.subscribe();
    let run = engine.start().await;
    let start_time = Instant::now();
    info!("🔍 Monitoring {}...", run.run());

    loop {
        let snapshot = status.borrow_and_update().clone();
        if snapshot.run == run.run() {
            let elapsed = start_time.elapsed();
            println!(
                "\n📊 Status Update ({:02}:{:02})",
                elapsed.as_secs() / 60,
                elapsed.as_secs() % 60
            );
            println!("┌─────────────────────────────────────────┐");
            println!("│ State:    {:29} │", snapshot.state.to_string());
            println!(
                "│ Device:   {:29} │",
                snapshot.device_name.as_deref().unwrap_or("-")
            );
            println!("│ Received: {:29} │", snapshot.sessions_received);
            if let Some(saved) = snapshot.sessions_saved {
                println!("│ Saved:    {saved:29} │");
            }
            println!("└─────────────────────────────────────────┘");
            println!("  {}", snapshot.message);

            if snapshot.has_drift_warning() {
                warn!("⏰ Treadmill clock drift exceeds the warning threshold");
            }
            if matches!(snapshot.state, SyncState::Failed(_)) {
                warn!("❌ {}", snapshot.state);
            }
            if snapshot.outcome.is_some() {
                break;
            }
        }

        if status.changed().await.is_err() {
            break;
        }
    }

    let report = run.wait().await?;
    println!("\n📊 Final Sync Summary:");
    println!("  Outcome: {:?}", report.outcome);
    println!("  Sessions received: {}", report.sessions.len());
    println!("  Steps stored: {}", store.total_steps().await);

    info!("🎉 Status monitoring completed!");
    Ok(())
}
