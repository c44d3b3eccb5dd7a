//! Periodic re-indexing.
//!
//! The scheduler never touches status or the index itself. On every tick it
//! asks the indexer whether each tenant's source listing changed since the
//! last successful run and, if so, calls [`Indexer::trigger_rebuild`]: the
//! same entry point a user-initiated rebuild uses, lease and all.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use groundwork_core::models::IndexingState;
use tokio::sync::watch;

use crate::indexer::{Indexer, TriggerOutcome};

/// What one scheduler pass did for a tenant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickAction {
    /// A job is already running.
    Busy,
    Unchanged,
    Triggered(TriggerOutcome),
}

/// Check every registered tenant once.
pub async fn tick(indexer: &Arc<Indexer>) -> Vec<(String, Result<TickAction>)> {
    let mut actions = Vec::new();
    for tenant in indexer.tenant_ids() {
        let action = check_tenant(indexer, &tenant).await;
        actions.push((tenant, action));
    }
    actions
}

async fn check_tenant(indexer: &Arc<Indexer>, tenant_id: &str) -> Result<TickAction> {
    let status = indexer.get_status(tenant_id).await?;
    if status.state == IndexingState::Indexing {
        return Ok(TickAction::Busy);
    }
    let Some(selector) = indexer.default_selector(tenant_id) else {
        return Ok(TickAction::Unchanged);
    };

    // A tenant that has never finished a run has no checksum, so it always
    // counts as changed.
    if !indexer.source_changed(tenant_id, &selector).await? {
        return Ok(TickAction::Unchanged);
    }

    let outcome = indexer.trigger_rebuild(tenant_id, &selector).await?;
    tracing::info!(tenant = %tenant_id, ?outcome, "scheduled rebuild");
    Ok(TickAction::Triggered(outcome))
}

/// Spawn the scheduler loop. Send `true` on the returned channel to stop it.
pub fn spawn(indexer: Arc<Indexer>, every: Duration) -> watch::Sender<bool> {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        let mut timer = tokio::time::interval(every);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tracing::info!(interval_secs = every.as_secs(), "scheduler started");

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    for (tenant, action) in tick(&indexer).await {
                        if let Err(e) = action {
                            tracing::warn!(tenant = %tenant, error = %e, "scheduled check failed");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        tracing::info!("scheduler stopped");
                        break;
                    }
                }
            }
        }
    });

    shutdown_tx
}
