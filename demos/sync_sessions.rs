use tracing::{error, info, warn};
use treadsync::{BtleplugLink, MemorySessionStore, Result, SyncConfig, SyncEngine, SyncOutcome};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("🏃 Treadsync Session Sync Example");
    info!("Searching for the treadmill tracker...");

    let link = BtleplugLink::new().await?;
    let store = MemorySessionStore::new();
    let engine = SyncEngine::new(link, store.clone(), SyncConfig::default());

    let report = engine.sync().await?;

    match &report.outcome {
        SyncOutcome::Synced => info!("✅ {}", report.message),
        SyncOutcome::PartiallyStored | SyncOutcome::PartialSync(_) => {
            warn!("⚠️  {}", report.message);
        }
        SyncOutcome::NoData(_) => error!("❌ {}", report.message),
    }

    if let Some(drift) = report.drift {
        if drift.warning {
            warn!(
                "⏰ Treadmill clock was off by {}s and has been corrected",
                drift.offset_secs
            );
        }
    }

    println!("\n📈 Synced Sessions:");
    for session in store.sessions().await {
        println!("  {}", session.summary());
    }
    println!("  Total Steps: {}", store.total_steps().await);

    // Running again is safe: re-offered sessions are reported as duplicates
    if let Some(commit) = &report.commit {
        info!(
            "💾 {} stored, {} already present, {} attempt(s)",
            commit.stored, commit.duplicates, commit.attempts
        );
    }

    Ok(())
}
