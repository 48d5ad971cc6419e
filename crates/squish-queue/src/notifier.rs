//! Realtime job events.
//!
//! Publishers never block: [`Notifier::publish`] does a `try_send` into a
//! bounded channel and drops the event when the channel is full. A pump task
//! drains the channel into an [`EventSink`]. Subscribers get a stream of
//! events from the moment they subscribe; nothing is replayed, so a
//! subscriber that reconnects re-reads the job record to resync.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use redis::AsyncCommands;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use squish_models::{JobEvent, JobId};

use crate::error::QueueResult;
use crate::metrics;

/// Stream of events for one job.
pub type EventStream = Pin<Box<dyn Stream<Item = JobEvent> + Send>>;

/// Destination for published events.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn deliver(&self, event: JobEvent) -> QueueResult<()>;
}

/// Source of per-job event subscriptions.
#[async_trait]
pub trait EventSource: Send + Sync {
    async fn subscribe(&self, job_id: &JobId) -> QueueResult<EventStream>;
}

// ============================================================================
// Publisher handle
// ============================================================================

/// Cheap, cloneable publisher handle.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: mpsc::Sender<JobEvent>,
}

impl Notifier {
    /// Default channel capacity.
    pub const DEFAULT_CAPACITY: usize = 1024;

    /// Start a pump task delivering into `sink`. The task ends when every
    /// `Notifier` clone has been dropped.
    pub fn spawn(sink: Arc<dyn EventSink>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<JobEvent>(capacity.max(1));
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let job_id = event.job_id().clone();
                if let Err(e) = sink.deliver(event).await {
                    warn!(job_id = %job_id, error = %e, "Failed to deliver job event");
                }
            }
            debug!("Notifier pump stopped");
        });
        (Self { tx }, handle)
    }

    /// Fire and forget.
    pub fn publish(&self, event: JobEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                metrics::record_event_dropped();
                debug!(job_id = %event.job_id(), "Notifier channel full, event dropped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

// ============================================================================
// In-process hub
// ============================================================================

/// Per-job broadcast channels for subscribers in this process.
#[derive(Debug)]
pub struct EventHub {
    channels: RwLock<HashMap<JobId, broadcast::Sender<JobEvent>>>,
    capacity: usize,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(64)
    }
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    pub async fn subscriber_count(&self, job_id: &JobId) -> usize {
        self.channels
            .read()
            .await
            .get(job_id)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    /// Send to current subscribers; channels without receivers are dropped.
    pub async fn publish(&self, event: JobEvent) {
        let job_id = event.job_id().clone();
        let closing = matches!(event, JobEvent::Deleted { .. });
        let mut channels = self.channels.write().await;

        if let Some(tx) = channels.get(&job_id) {
            if tx.send(event).is_err() || closing {
                channels.remove(&job_id);
            }
        }
    }
}

#[async_trait]
impl EventSink for EventHub {
    async fn deliver(&self, event: JobEvent) -> QueueResult<()> {
        self.publish(event).await;
        Ok(())
    }
}

#[async_trait]
impl EventSource for EventHub {
    async fn subscribe(&self, job_id: &JobId) -> QueueResult<EventStream> {
        let mut channels = self.channels.write().await;
        let rx = channels
            .entry(job_id.clone())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();
        Ok(receiver_stream(rx))
    }
}

/// Turn a broadcast receiver into a stream, skipping over lag.
fn receiver_stream(rx: broadcast::Receiver<JobEvent>) -> EventStream {
    let stream = futures_util::stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => return Some((event, rx)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Subscriber lagged, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });
    Box::pin(stream)
}

// ============================================================================
// Redis pub/sub bridge
// ============================================================================

/// Events over Redis pub/sub, for workers and API processes on different hosts.
pub struct RedisEventBus {
    client: redis::Client,
    prefix: String,
}

impl RedisEventBus {
    pub fn new(redis_url: &str, prefix: impl Into<String>) -> QueueResult<Self> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            client,
            prefix: prefix.into(),
        })
    }

    /// Get the channel name for a job.
    pub fn channel_name(&self, job_id: &JobId) -> String {
        format!("{}:events:{}", self.prefix, job_id)
    }
}

#[async_trait]
impl EventSink for RedisEventBus {
    async fn deliver(&self, event: JobEvent) -> QueueResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let channel = self.channel_name(event.job_id());
        let payload = serde_json::to_string(&event)?;

        debug!("Publishing job event to {}", channel);
        conn.publish::<_, _, ()>(channel, payload).await?;
        Ok(())
    }
}

#[async_trait]
impl EventSource for RedisEventBus {
    async fn subscribe(&self, job_id: &JobId) -> QueueResult<EventStream> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(self.channel_name(job_id)).await?;

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            let payload: String = msg.get_payload().ok()?;
            serde_json::from_str(&payload).ok()
        });
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use squish_models::JobStatus;

    #[tokio::test]
    async fn test_hub_delivers_to_subscribers() {
        let hub = Arc::new(EventHub::default());
        let job_id = JobId::new();
        let mut stream = hub.subscribe(&job_id).await.unwrap();

        hub.publish(JobEvent::progress(job_id.clone(), 40)).await;
        hub.publish(JobEvent::status_changed(
            job_id.clone(),
            JobStatus::Processing,
            JobStatus::Completed,
        ))
        .await;

        assert!(matches!(stream.next().await, Some(JobEvent::Progress { value: 40, .. })));
        assert!(matches!(stream.next().await, Some(JobEvent::StatusChanged { .. })));
    }

    #[tokio::test]
    async fn test_hub_forgets_jobs_without_subscribers() {
        let hub = EventHub::default();
        let job_id = JobId::new();
        let stream = hub.subscribe(&job_id).await.unwrap();
        assert_eq!(hub.subscriber_count(&job_id).await, 1);

        drop(stream);
        hub.publish(JobEvent::progress(job_id.clone(), 1)).await;
        assert_eq!(hub.subscriber_count(&job_id).await, 0);
    }

    #[tokio::test]
    async fn test_deleted_event_ends_stream() {
        let hub = EventHub::default();
        let job_id = JobId::new();
        let mut stream = hub.subscribe(&job_id).await.unwrap();

        hub.publish(JobEvent::deleted(job_id.clone())).await;
        assert!(matches!(stream.next().await, Some(JobEvent::Deleted { .. })));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_notifier_pumps_into_sink() {
        let hub = Arc::new(EventHub::default());
        let job_id = JobId::new();
        let mut stream = hub.subscribe(&job_id).await.unwrap();

        let (notifier, _pump) = Notifier::spawn(hub.clone(), 8);
        notifier.publish(JobEvent::progress(job_id.clone(), 10));

        assert!(matches!(stream.next().await, Some(JobEvent::Progress { value: 10, .. })));
    }

    #[tokio::test]
    async fn test_publish_never_blocks_when_full() {
        struct Stuck;

        #[async_trait]
        impl EventSink for Stuck {
            async fn deliver(&self, _event: JobEvent) -> QueueResult<()> {
                std::future::pending::<()>().await;
                Ok(())
            }
        }

        let (notifier, _pump) = Notifier::spawn(Arc::new(Stuck), 1);
        let job_id = JobId::new();
        for value in 0..100 {
            notifier.publish(JobEvent::progress(job_id.clone(), value));
        }
    }
}
