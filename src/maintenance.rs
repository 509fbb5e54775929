use std::time::Duration;

use tracing::{debug, info, warn};

use crate::store::Store;

/// Background task that compacts the WAL once enough records piled up.
pub async fn run_compactor(store: Store, threshold: u64, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        if let Err(e) = compact_if_needed(&store, threshold).await {
            warn!("compaction failed: {e}");
        }
    }
}

/// Compact when at least `threshold` records were appended since the last
/// compaction. Returns whether a compaction ran.
pub async fn compact_if_needed(
    store: &Store,
    threshold: u64,
) -> Result<bool, crate::store::StoreError> {
    let appends = store.wal_appends_since_compact().await;
    if appends < threshold {
        debug!("compactor: {appends} appends, below threshold {threshold}");
        return Ok(false);
    }
    store.compact().await?;
    info!("compacted WAL after {appends} appends");
    Ok(true)
}
