//! Durable AMQP queue bus. Queues are declared durable; priority queues get
//! `x-max-priority`. Requeue-to-tail republishes the body as a fresh message
//! with mutated headers instead of using broker-native redelivery, so retry
//! counts survive and the message really goes to the end of the queue.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::warn;

use crate::retry::BackoffPolicy;
use crate::telemetry::TraceContext;

pub const HEADER_RETRY: &str = "x-retry";
pub const HEADER_TRACEPARENT: &str = "traceparent";

/// Headers this system reads and writes on queue messages. Domain-specific
/// extras (e.g. `slice_result`) ride in `extra` and are forwarded unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageHeaders {
    pub retry: u32,
    pub traceparent: Option<String>,
    pub extra: BTreeMap<String, String>,
}

impl MessageHeaders {
    pub fn with_trace(ctx: &TraceContext) -> Self {
        Self {
            traceparent: Some(ctx.to_header()),
            ..Self::default()
        }
    }

    pub fn trace_context(&self) -> Option<TraceContext> {
        self.traceparent.as_deref().and_then(TraceContext::parse)
    }

    /// Copy with the retry counter incremented, for requeue-to-tail.
    pub fn incremented(&self) -> Self {
        Self {
            retry: self.retry + 1,
            traceparent: self.traceparent.clone(),
            extra: self.extra.clone(),
        }
    }

    pub fn to_field_table(&self) -> FieldTable {
        let mut table = FieldTable::default();
        table.insert(HEADER_RETRY.into(), AMQPValue::LongInt(self.retry as i32));
        if let Some(tp) = &self.traceparent {
            table.insert(HEADER_TRACEPARENT.into(), AMQPValue::LongString(tp.as_str().into()));
        }
        for (k, v) in &self.extra {
            table.insert(k.as_str().into(), AMQPValue::LongString(v.as_str().into()));
        }
        table
    }

    pub fn from_field_table(table: Option<&FieldTable>) -> Self {
        let mut headers = Self::default();
        let Some(table) = table else {
            return headers;
        };
        for (key, value) in table.inner() {
            match key.as_str() {
                HEADER_RETRY => {
                    headers.retry = match value {
                        AMQPValue::LongInt(n) => (*n).max(0) as u32,
                        AMQPValue::LongLongInt(n) => (*n).max(0) as u32,
                        AMQPValue::ShortShortUInt(n) => *n as u32,
                        AMQPValue::ShortUInt(n) => *n as u32,
                        AMQPValue::LongUInt(n) => *n,
                        _ => 0,
                    };
                }
                HEADER_TRACEPARENT => {
                    if let AMQPValue::LongString(s) = value {
                        headers.traceparent = Some(String::from_utf8_lossy(s.as_bytes()).into_owned());
                    }
                }
                other => {
                    if let AMQPValue::LongString(s) = value {
                        headers
                            .extra
                            .insert(other.to_string(), String::from_utf8_lossy(s.as_bytes()).into_owned());
                    }
                }
            }
        }
        headers
    }
}

struct BusState {
    /// Held so the underlying socket outlives the channel handle.
    _conn: Connection,
    channel: Channel,
}

pub struct QueueBus {
    addr: String,
    state: Mutex<BusState>,
    backoff: BackoffPolicy,
}

impl QueueBus {
    pub async fn connect(addr: &str) -> Result<Self> {
        let state = Self::open(addr).await?;
        Ok(Self {
            addr: addr.to_string(),
            state: Mutex::new(state),
            backoff: BackoffPolicy::default(),
        })
    }

    async fn open(addr: &str) -> Result<BusState> {
        let conn = Connection::connect(addr, ConnectionProperties::default())
            .await
            .context("connect to broker")?;
        let channel = conn.create_channel().await.context("create channel")?;
        Ok(BusState { _conn: conn, channel })
    }

    async fn channel(&self) -> Result<Channel> {
        let guard = self.state.lock().await;
        if guard.channel.status().connected() {
            return Ok(guard.channel.clone());
        }
        drop(guard);
        self.reconnect().await
    }

    async fn reconnect(&self) -> Result<Channel> {
        let mut attempt: u32 = 0;
        let policy = BackoffPolicy::reconnect();
        loop {
            match Self::open(&self.addr).await {
                Ok(state) => {
                    let channel = state.channel.clone();
                    *self.state.lock().await = state;
                    return Ok(channel);
                }
                Err(e) => {
                    attempt += 1;
                    if attempt >= policy.max_attempts {
                        return Err(e).context("broker reconnect budget exhausted");
                    }
                    let delay = policy.delay(attempt - 1);
                    warn!("broker reconnect failed (attempt {attempt}): {e:#}; retrying in {delay:?}");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Declare a durable queue; `priority_max` adds `x-max-priority`.
    pub async fn declare(&self, name: &str, priority_max: Option<u8>) -> Result<()> {
        let channel = self.channel().await?;
        let mut args = FieldTable::default();
        if let Some(max) = priority_max {
            args.insert("x-max-priority".into(), AMQPValue::ShortShortUInt(max));
        }
        channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                args,
            )
            .await
            .with_context(|| format!("declare queue {name}"))?;
        Ok(())
    }

    /// Publish raw bytes. Connection/channel errors are retried with the
    /// shared backoff policy.
    pub async fn publish(
        &self,
        queue: &str,
        body: &[u8],
        priority: Option<u8>,
        headers: &MessageHeaders,
    ) -> Result<()> {
        let mut attempt: u32 = 0;
        loop {
            let channel = self.channel().await?;
            let mut props = BasicProperties::default()
                .with_delivery_mode(2)
                .with_headers(headers.to_field_table());
            if let Some(p) = priority {
                props = props.with_priority(p);
            }
            let result = async {
                channel
                    .basic_publish("", queue, BasicPublishOptions::default(), body, props)
                    .await?
                    .await?;
                Ok::<(), lapin::Error>(())
            }
            .await;
            match result {
                Ok(()) => return Ok(()),
                Err(e) => {
                    attempt += 1;
                    if attempt >= self.backoff.max_attempts {
                        return Err(e).with_context(|| format!("publish to {queue}"));
                    }
                    let delay = self.backoff.delay(attempt - 1);
                    warn!("publish to {queue} failed: {e}; retrying in {delay:?}");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    pub async fn publish_json<T: Serialize>(
        &self,
        queue: &str,
        message: &T,
        priority: Option<u8>,
        headers: &MessageHeaders,
    ) -> Result<()> {
        let body = serde_json::to_vec(message).context("serialize message")?;
        self.publish(queue, &body, priority, headers).await
    }

    /// Republish a delivery's body to the tail of its own queue with the
    /// given (typically retry-incremented) headers.
    pub async fn republish_tail(
        &self,
        queue: &str,
        body: &[u8],
        headers: &MessageHeaders,
        priority: Option<u8>,
    ) -> Result<()> {
        self.publish(queue, body, priority, headers).await
    }

    /// Start consuming with per-consumer prefetch.
    pub async fn consume(&self, queue: &str, tag: &str, prefetch: u16) -> Result<lapin::Consumer> {
        let channel = self.channel().await?;
        channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .context("set prefetch")?;
        let consumer = channel
            .basic_consume(queue, tag, BasicConsumeOptions::default(), FieldTable::default())
            .await
            .with_context(|| format!("consume from {queue}"))?;
        Ok(consumer)
    }
}

pub async fn ack(delivery: &Delivery) -> Result<()> {
    delivery
        .acker
        .ack(BasicAckOptions::default())
        .await
        .context("ack delivery")
        .map(|_| ())
}

pub async fn reject(delivery: &Delivery) -> Result<()> {
    delivery
        .acker
        .nack(BasicNackOptions {
            requeue: false,
            ..BasicNackOptions::default()
        })
        .await
        .context("nack delivery")
        .map(|_| ())
}

/// Headers of a delivery, decoded.
pub fn delivery_headers(delivery: &Delivery) -> MessageHeaders {
    MessageHeaders::from_field_table(delivery.properties.headers().as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_round_trip_through_field_table() {
        let mut headers = MessageHeaders {
            retry: 2,
            traceparent: Some("00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01".into()),
            extra: BTreeMap::new(),
        };
        headers.extra.insert("slice_result".into(), "/no_results".into());

        let table = headers.to_field_table();
        let back = MessageHeaders::from_field_table(Some(&table));
        assert_eq!(back, headers);
    }

    #[test]
    fn missing_table_decodes_to_defaults() {
        let headers = MessageHeaders::from_field_table(None);
        assert_eq!(headers.retry, 0);
        assert!(headers.traceparent.is_none());
        assert!(headers.extra.is_empty());
    }

    #[test]
    fn incremented_bumps_only_retry() {
        let headers = MessageHeaders {
            retry: 1,
            traceparent: None,
            extra: BTreeMap::new(),
        };
        let next = headers.incremented();
        assert_eq!(next.retry, 2);
        assert_eq!(next.extra, headers.extra);
    }

    #[test]
    fn retry_header_tolerates_integer_widths() {
        let mut table = FieldTable::default();
        table.insert(HEADER_RETRY.into(), AMQPValue::LongLongInt(5));
        let headers = MessageHeaders::from_field_table(Some(&table));
        assert_eq!(headers.retry, 5);

        let mut table = FieldTable::default();
        table.insert(HEADER_RETRY.into(), AMQPValue::ShortShortUInt(3));
        let headers = MessageHeaders::from_field_table(Some(&table));
        assert_eq!(headers.retry, 3);
    }
}
