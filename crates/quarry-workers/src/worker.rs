//! Uniform stage-worker skeleton: consume from a stage queue, gate on retry
//! budget and task status, run the stage callback off the consumer loop, and
//! map its result onto ack / reject / requeue-to-tail.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use lapin::message::Delivery;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Instrument};

use quarry_core::builder::BuildSubstrate;
use quarry_core::bus::{self, MessageHeaders, QueueBus};
use quarry_core::config::Config;
use quarry_core::control;
use quarry_core::coord::CoordStore;
use quarry_core::db::Store;
use quarry_core::error::{Disposition, StageError};
use quarry_core::storage::SharedStorage;
use quarry_core::telemetry;

/// Shared handles passed to every stage.
pub struct WorkerContext {
    pub cfg: Arc<Config>,
    pub cs: Arc<CoordStore>,
    pub bus: Arc<QueueBus>,
    pub db: Arc<Store>,
    pub storage: SharedStorage,
    pub brs: Arc<BuildSubstrate>,
}

/// A decoded delivery.
pub struct Envelope {
    pub body: Vec<u8>,
    pub json: serde_json::Value,
    pub headers: MessageHeaders,
}

impl Envelope {
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T, StageError> {
        serde_json::from_slice(&self.body)
            .map_err(|e| StageError::PoisonMessage(format!("schema mismatch: {e}")))
    }
}

#[async_trait]
pub trait StageWorker: Send + Sync + 'static {
    fn queue(&self) -> &'static str;

    /// Priority queues pass `Some(max)`; the default is an unprioritized
    /// durable queue.
    fn priority_max(&self) -> Option<u8> {
        None
    }

    /// Task id used for the cancel and retry gates. `None` skips both.
    fn task_id(&self, body: &serde_json::Value) -> Option<String> {
        body.get("task_id").and_then(|v| v.as_str()).map(str::to_string)
    }

    async fn handle(&self, ctx: &WorkerContext, envelope: Envelope) -> Result<(), StageError>;
}

/// Run one stage's consumer loop until cancellation.
pub async fn run_stage(
    ctx: Arc<WorkerContext>,
    stage: Arc<dyn StageWorker>,
    cancel: CancellationToken,
) -> Result<()> {
    let queue = stage.queue();
    ctx.bus.declare(queue, stage.priority_max()).await?;
    let tag = format!("{}-{}", queue, &ctx.cfg.instance);
    let mut consumer = ctx.bus.consume(queue, &tag, ctx.cfg.prefetch_count).await?;

    info!("consuming {queue} (prefetch {})", ctx.cfg.prefetch_count);

    loop {
        let delivery = tokio::select! {
            () = cancel.cancelled() => {
                info!("{queue}: consumer loop stopping");
                return Ok(());
            }
            next = consumer.next() => match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(e)) => {
                    warn!("{queue}: consume error: {e}");
                    continue;
                }
                None => {
                    // Stream ended: broker went away. The supervisor restarts us.
                    anyhow::bail!("{queue}: consumer stream closed");
                }
            },
        };

        let ctx = Arc::clone(&ctx);
        let stage = Arc::clone(&stage);
        tokio::spawn(async move {
            if let Err(e) = process_delivery(&ctx, stage.as_ref(), delivery).await {
                error!("{}: delivery processing failed: {e:#}", stage.queue());
            }
        });
    }
}

async fn process_delivery(
    ctx: &WorkerContext,
    stage: &dyn StageWorker,
    delivery: Delivery,
) -> Result<()> {
    let queue = stage.queue();
    let headers = bus::delivery_headers(&delivery);

    let json: serde_json::Value = match serde_json::from_slice(&delivery.data) {
        Ok(v) => v,
        Err(e) => {
            warn!("{queue}: undecodable message dropped: {e}");
            return bus::reject(&delivery).await;
        }
    };

    // Retry gate: messages over budget are discarded, not reassigned.
    if headers.retry >= ctx.cfg.task_retry_limit {
        let task_id = stage.task_id(&json).unwrap_or_default();
        telemetry::log_action("worker", "retry_budget_exhausted", &task_id, queue);
        warn!("{queue}: dropping message after {} retries", headers.retry);
        return bus::ack(&delivery).await;
    }

    // Cancel gate: canceled or terminal tasks are acked and skipped.
    let task_id = stage.task_id(&json);
    if let Some(tid) = &task_id {
        match control::task_is_active(&ctx.cs, tid).await {
            Ok(true) => {}
            Ok(false) => {
                info!("{queue}: task {tid} no longer active, skipping");
                return bus::ack(&delivery).await;
            }
            Err(e) => {
                warn!("{queue}: task status check failed: {e:#}");
                return requeue(ctx, queue, &delivery, &headers).await;
            }
        }
    }

    let span = tracing::info_span!(
        "stage",
        queue,
        task_id = task_id.as_deref().unwrap_or(""),
        trace_id = headers
            .trace_context()
            .map(|t| t.trace_id)
            .unwrap_or_default()
    );

    let envelope = Envelope {
        body: delivery.data.clone(),
        json,
        headers: headers.clone(),
    };

    let outcome = stage.handle(ctx, envelope).instrument(span).await;

    match outcome {
        Ok(()) => bus::ack(&delivery).await,
        Err(e) => {
            let disposition = e.disposition();
            match &disposition {
                Disposition::Ack => info!("{queue}: {e}; acking"),
                Disposition::Reject => warn!("{queue}: {e}; rejecting without requeue"),
                Disposition::RequeueTail => warn!("{queue}: {e:#}; requeueing to tail"),
            }
            let result = match disposition {
                Disposition::Ack => bus::ack(&delivery).await,
                Disposition::Reject => bus::reject(&delivery).await,
                Disposition::RequeueTail => requeue(ctx, queue, &delivery, &headers).await,
            };
            if e.exits_process() {
                error!("{queue}: fatal stage error, exiting for supervisor restart");
                std::process::exit(1);
            }
            result
        }
    }
}

/// Requeue-to-tail: republish as a fresh message with `x-retry` incremented,
/// then ack the original so it leaves the queue head.
async fn requeue(
    ctx: &WorkerContext,
    queue: &str,
    delivery: &Delivery,
    headers: &MessageHeaders,
) -> Result<()> {
    ctx.bus
        .republish_tail(queue, &delivery.data, &headers.incremented(), None)
        .await
        .with_context(|| format!("republish to {queue}"))?;
    bus::ack(delivery).await
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Probe;

    #[async_trait]
    impl StageWorker for Probe {
        fn queue(&self) -> &'static str {
            "probe_queue"
        }
        async fn handle(&self, _ctx: &WorkerContext, _envelope: Envelope) -> Result<(), StageError> {
            Ok(())
        }
    }

    #[test]
    fn default_task_id_reads_the_task_id_field() {
        let probe = Probe;
        let json: serde_json::Value =
            serde_json::from_str(r#"{"task_id": "T9", "other": 1}"#).unwrap();
        assert_eq!(probe.task_id(&json).as_deref(), Some("T9"));
        let no_tid: serde_json::Value = serde_json::from_str(r#"{"other": 1}"#).unwrap();
        assert!(probe.task_id(&no_tid).is_none());
    }

    #[test]
    fn envelope_decode_maps_schema_errors_to_poison() {
        let envelope = Envelope {
            body: b"{\"harness\": 3}".to_vec(),
            json: serde_json::Value::Null,
            headers: MessageHeaders::default(),
        };
        let result: Result<quarry_core::types::CminMessage, StageError> = envelope.decode();
        assert!(matches!(result, Err(StageError::PoisonMessage(_))));
    }
}
