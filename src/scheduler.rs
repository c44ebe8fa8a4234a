use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::PipelineConfig;
use crate::error::StoreError;
use crate::storage::Storage;
use crate::telemetry::metric_inc;
use crate::transport::Transport;
use crate::types::{Delivery, DeliveryId, DeliveryStatus};
use crate::worker::DeliveryWorker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Success,
    RetryScheduled,
    Error,
}

/// Per-row result of one cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryResult {
    pub id: DeliveryId,
    pub status: ResultStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DeliveryResult {
    fn from_row(row: &Delivery) -> Self {
        let (status, error) = match row.status {
            DeliveryStatus::Success => (ResultStatus::Success, None),
            DeliveryStatus::Retrying => (ResultStatus::RetryScheduled, None),
            DeliveryStatus::Failed => (ResultStatus::Error, row.error_message.clone()),
            other => (ResultStatus::Error, Some(format!("unexpected status {}", other))),
        };
        Self { id: row.id.clone(), status, error }
    }

    fn from_error(id: DeliveryId, error: impl ToString) -> Self {
        Self {
            id,
            status: ResultStatus::Error,
            error: Some(error.to_string()),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    pub processed: usize,
    pub results: Vec<DeliveryResult>,
}

impl CycleReport {
    pub fn count(&self, status: ResultStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }
}

/// Claims due deliveries in bounded batches and runs the worker on them.
///
/// A cycle is a one-shot job: claim, deliver concurrently, commit, return.
/// Claiming is the only exclusion mechanism, so overlapping cycles (from
/// several processes or triggers) never work the same row twice.
pub struct Scheduler {
    storage: Arc<dyn Storage>,
    worker: Arc<DeliveryWorker>,
    config: Arc<PipelineConfig>,
}

impl Scheduler {
    pub fn new(
        storage: Arc<dyn Storage>,
        transport: Arc<dyn Transport>,
        config: Arc<PipelineConfig>,
    ) -> Self {
        let worker = Arc::new(DeliveryWorker::new(storage.clone(), transport, config.clone()));
        Self { storage, worker, config }
    }

    pub async fn run_cycle(&self) -> Result<CycleReport, StoreError> {
        self.run_cycle_at(Utc::now()).await
    }

    /// Run one cycle as of `now`.
    ///
    /// Fails only when the batch cannot be claimed. Storage failures while
    /// committing a single row are reported in that row's result; the row
    /// is released (or left to claim expiry) without its attempt counted.
    pub async fn run_cycle_at(&self, now: DateTime<Utc>) -> Result<CycleReport, StoreError> {
        let stale_before = self.stale_before(now);
        let claimed = self
            .storage
            .claim_due(now, self.config.batch_size, stale_before)
            .await?;

        if claimed.is_empty() {
            return Ok(CycleReport::default());
        }
        tracing::debug!(count = claimed.len(), "claimed deliveries");
        metric_inc("webhook.scheduler.cycle");

        let cycle_started = Instant::now();
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_deliveries.max(1)));
        let ids: Vec<DeliveryId> = claimed.iter().map(|row| row.id.clone()).collect();
        let mut tasks = JoinSet::new();

        for (index, row) in claimed.into_iter().enumerate() {
            let worker = self.worker.clone();
            let semaphore = semaphore.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let started_at = now
                    + chrono::Duration::from_std(cycle_started.elapsed()).unwrap_or(chrono::Duration::zero());
                let id = row.id.clone();
                let result = match worker.process(row, started_at).await {
                    Ok(row) => DeliveryResult::from_row(&row),
                    Err(err) => DeliveryResult::from_error(id, err),
                };
                (index, result)
            });
        }

        let mut slots: Vec<Option<DeliveryResult>> = vec![None; ids.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, result)) => slots[index] = Some(result),
                Err(err) => tracing::error!(error = %err, "delivery task aborted"),
            }
        }

        let results: Vec<DeliveryResult> = slots
            .into_iter()
            .zip(ids)
            .map(|(slot, id)| slot.unwrap_or_else(|| DeliveryResult::from_error(id, "delivery task aborted")))
            .collect();

        let report = CycleReport {
            processed: results.len(),
            results,
        };
        tracing::info!(
            processed = report.processed,
            success = report.count(ResultStatus::Success),
            retry_scheduled = report.count(ResultStatus::RetryScheduled),
            error = report.count(ResultStatus::Error),
            "delivery cycle finished"
        );
        Ok(report)
    }

    /// Claim and deliver a single row if it is due. `None` when the row is
    /// held by another worker or not due yet.
    pub async fn process_one(
        &self,
        id: &DeliveryId,
        now: DateTime<Utc>,
    ) -> Result<Option<DeliveryResult>, StoreError> {
        let Some(row) = self.storage.claim(id, now, self.stale_before(now)).await? else {
            return Ok(None);
        };
        let result = match self.worker.process(row, now).await {
            Ok(row) => DeliveryResult::from_row(&row),
            Err(err) => DeliveryResult::from_error(id.clone(), err),
        };
        Ok(Some(result))
    }

    fn stale_before(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - chrono::Duration::from_std(self.config.claim_ttl()).unwrap_or(chrono::Duration::zero())
    }

    /// Run cycles on a fixed interval until `shutdown` flips to `true`.
    ///
    /// A cycle in progress always runs to completion before the loop exits.
    pub async fn run(&self, every: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            }

            if let Err(err) = self.run_cycle().await {
                metric_inc("webhook.scheduler.cycle_failed");
                tracing::error!(error = %err, "delivery cycle failed");
            }
        }
        tracing::info!("scheduler stopped");
    }
}
