use std::time::Duration;

use chrono::Utc;
use escrow_engine::{gateway::ProviderRegistry, ReconciliationScheduler, SqliteDatabase};
use log::*;
use tokio::{task::JoinHandle, time::MissedTickBehavior};

/// Starts the reconciliation worker. Do not await the returned JoinHandle, as it will run indefinitely.
///
/// Each tick confirms payments that the provider has settled but never told us about, and pays out escrow whose
/// holding period has ended. A tick that overruns the interval delays the next one rather than stacking up.
pub fn start_reconciliation_worker(
    scheduler: ReconciliationScheduler<SqliteDatabase, ProviderRegistry>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("🕰️ Reconciliation worker started. Running every {}s", interval.as_secs());
        loop {
            timer.tick().await;
            debug!("🕰️ Running reconciliation job");
            let report = scheduler.tick(Utc::now()).await;
            info!("🕰️ Payments: {}. Payouts: {}", report.payments, report.transfers);
            if let Some(reason) = report.payments.aborted.as_ref().or(report.transfers.aborted.as_ref()) {
                error!("🕰️ Reconciliation did not complete and will be retried next tick. {reason}");
            }
        }
    })
}
