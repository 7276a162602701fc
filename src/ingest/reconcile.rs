// Reconciliation Sweep
// Periodic full-snapshot fetch repairing drift the event stream missed

use crate::error::MedicResult;
use crate::network::Controller;
use crate::state::EntityCache;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    pub updated: usize,
    pub removed: usize,
}

/// Feed the current snapshot through the cache and drop entities the controller no longer has
///
/// Only entities last written before the fetch started can be removed; anything
/// the realtime channel delivered meanwhile is newer than the snapshot.
pub async fn reconcile_once(controller: &dyn Controller, cache: &EntityCache) -> MedicResult<ReconcileStats> {
    let mark = cache.revision();
    let states = controller.get_states().await?;
    let live: HashSet<String> = states.iter().map(|s| s.entity_id.clone()).collect();

    let updated = states.len();
    for state in states {
        cache.put(state);
    }

    let removed = cache.remove_absent(&live, mark).len();
    Ok(ReconcileStats { updated, removed })
}

/// Reconciliation task; a failed fetch is retried on the next tick
pub async fn run_reconciliation(
    instance_id: String,
    controller: Arc<dyn Controller>,
    cache: Arc<EntityCache>,
    interval: Duration,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match reconcile_once(controller.as_ref(), &cache).await {
            Ok(stats) => debug!(
                instance = %instance_id,
                updated = stats.updated,
                removed = stats.removed,
                "reconciliation complete"
            ),
            Err(e) => warn!(instance = %instance_id, error = %e, "reconciliation fetch failed"),
        }
    }
    info!(instance = %instance_id, "reconciliation stopped");
}
