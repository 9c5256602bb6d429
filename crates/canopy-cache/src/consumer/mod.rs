//! Stream consumers
//!
//! Each consumer is a member of a consumer group on one stream. It reads
//! small batches, hands each event to a [`StreamHandler`], and acknowledges
//! only what was applied. Unacknowledged messages stay pending and are
//! claimed again after `reclaim_idle`, by this member or another one, so
//! handlers must recompute desired state from the message alone.
//!
//! The run loop is a state machine:
//!
//! ```text
//! Polling ──messages──▶ Processing ──▶ Acking ──ok──▶ Polling
//!    │                                   │
//!    └──error──▶ BackoffWaiting ◀─failures┘
//! ```

mod path_rename;
mod update;

pub use path_rename::PathRenameHandler;
pub use update::{repair_ops, UpdateHandler};

use async_trait::async_trait;
use canopy_config::ConsumerConfig;
use canopy_core::InvalidationEvent;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::{CacheBackend, StreamId, StreamMessage};
use crate::codec;
use crate::error::CacheResult;

/// Applies one decoded event to the cache
#[async_trait]
pub trait StreamHandler: Send + Sync {
    /// Stream this handler consumes
    fn stream(&self) -> &'static str;

    /// Consumer group on that stream
    fn group(&self) -> &'static str;

    /// Apply an event; [`crate::CacheError::Codec`] marks it as poison
    async fn handle(&self, event: InvalidationEvent) -> CacheResult<()>;
}

/// Run-loop state
#[derive(Debug, Clone, PartialEq)]
pub enum ConsumerState {
    /// Waiting for messages
    Polling,
    /// Handling a batch
    Processing(Vec<StreamMessage>),
    /// Acknowledging handled messages
    Acking {
        /// Messages to acknowledge
        ids: Vec<StreamId>,
        /// Messages left pending for redelivery
        failed: usize,
    },
    /// Sleeping before the next poll
    BackoffWaiting {
        /// Consecutive failed cycles
        attempt: u32,
    },
}

/// Consumer-group member driving a [`StreamHandler`]
pub struct StreamConsumer<H> {
    cache: Arc<dyn CacheBackend>,
    handler: H,
    config: ConsumerConfig,
    cancel: CancellationToken,
    group_ready: bool,
}

impl<H: StreamHandler> StreamConsumer<H> {
    /// Create a consumer; nothing is read until [`Self::run`] or [`Self::run_once`]
    pub fn new(
        cache: Arc<dyn CacheBackend>,
        handler: H,
        config: ConsumerConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            cache,
            handler,
            config,
            cancel,
            group_ready: false,
        }
    }

    /// Loop until the cancellation token fires
    ///
    /// Messages in flight when cancelled stay pending for the next run.
    pub async fn run(mut self) -> CacheResult<()> {
        info!(
            stream = self.handler.stream(),
            group = self.handler.group(),
            consumer = %self.config.consumer_name,
            "Starting stream consumer"
        );

        let cancel = self.cancel.clone();
        let mut attempt = 0u32;
        let mut state = ConsumerState::Polling;
        loop {
            state = match state {
                ConsumerState::Polling => {
                    let block = self.config.block();
                    let polled = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        polled = self.poll(block) => polled,
                    };
                    match polled {
                        Ok(messages) if messages.is_empty() => ConsumerState::Polling,
                        Ok(messages) => ConsumerState::Processing(messages),
                        Err(e) => {
                            warn!(stream = self.handler.stream(), error = %e, "Stream poll failed");
                            attempt += 1;
                            ConsumerState::BackoffWaiting { attempt }
                        }
                    }
                }
                ConsumerState::Processing(messages) => {
                    let (ids, failed) = self.process(messages).await;
                    ConsumerState::Acking { ids, failed }
                }
                ConsumerState::Acking { ids, failed } => {
                    let acked = self.ack(&ids).await;
                    if let Err(e) = &acked {
                        warn!(stream = self.handler.stream(), error = %e, "Acknowledgement failed");
                    }
                    if failed > 0 || acked.is_err() {
                        attempt += 1;
                        ConsumerState::BackoffWaiting { attempt }
                    } else {
                        attempt = 0;
                        ConsumerState::Polling
                    }
                }
                ConsumerState::BackoffWaiting { attempt } => {
                    let delay = self.calculate_retry_delay(attempt);
                    debug!(stream = self.handler.stream(), attempt, ?delay, "Backing off");
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => ConsumerState::Polling,
                    }
                }
            };
        }

        info!(stream = self.handler.stream(), "Stream consumer stopped");
        Ok(())
    }

    /// One non-blocking cycle; returns how many messages were read
    pub async fn run_once(&mut self) -> CacheResult<usize> {
        let messages = self.poll(Duration::ZERO).await?;
        let read = messages.len();
        if read > 0 {
            let (ids, _failed) = self.process(messages).await;
            self.ack(&ids).await?;
        }
        Ok(read)
    }

    /// Cycle until nothing new is left; returns how many messages were read
    pub async fn drain(&mut self) -> CacheResult<usize> {
        let mut total = 0;
        loop {
            let read = self.run_once().await?;
            if read == 0 {
                return Ok(total);
            }
            total += read;
        }
    }

    /// Capped exponential backoff for the given consecutive failure count
    fn calculate_retry_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.config.base_retry_delay().as_millis() as u64;
        let factor = 1u64 << attempt.saturating_sub(1).min(20);
        let delay_ms = base_ms.saturating_mul(factor);
        let delay_ms = delay_ms.min(self.config.max_retry_delay().as_millis() as u64);
        Duration::from_millis(delay_ms)
    }

    async fn ensure_group(&mut self) -> CacheResult<()> {
        if !self.group_ready {
            self.cache
                .create_group(self.handler.stream(), self.handler.group())
                .await?;
            self.group_ready = true;
        }
        Ok(())
    }

    /// Reclaim idle pending messages first, then read new ones
    async fn poll(&mut self, block: Duration) -> CacheResult<Vec<StreamMessage>> {
        self.ensure_group().await?;
        let stream = self.handler.stream();
        let group = self.handler.group();

        let reclaimed = self
            .cache
            .claim_idle(
                stream,
                group,
                &self.config.consumer_name,
                self.config.reclaim_idle(),
                self.config.batch_size,
            )
            .await?;
        if !reclaimed.is_empty() {
            info!(stream, count = reclaimed.len(), "Reclaimed idle pending messages");
            return Ok(reclaimed);
        }

        self.cache
            .read_group(stream, group, &self.config.consumer_name, self.config.batch_size, block)
            .await
    }

    /// Handle a batch; returns ids to acknowledge and how many stay pending
    async fn process(&self, messages: Vec<StreamMessage>) -> (Vec<StreamId>, usize) {
        let stream = self.handler.stream();
        let mut ids = Vec::with_capacity(messages.len());
        let mut failed = 0;

        for message in messages {
            let outcome = match codec::decode_event(&message) {
                Ok(event) => self.handler.handle(event).await,
                Err(e) => Err(e),
            };
            match outcome {
                Ok(()) => ids.push(message.id),
                Err(e) if e.is_poison() => {
                    error!(stream, message_id = %message.id, error = %e, "Dropping poison message");
                    ids.push(message.id);
                }
                Err(e) => {
                    warn!(
                        stream,
                        message_id = %message.id,
                        deliveries = message.deliveries,
                        error = %e,
                        "Message handling failed, leaving it pending"
                    );
                    failed += 1;
                }
            }
        }
        (ids, failed)
    }

    async fn ack(&self, ids: &[StreamId]) -> CacheResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.cache
            .ack(self.handler.stream(), self.handler.group(), ids)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CacheError;
    use crate::memory::MemoryCache;
    use canopy_core::PathRenameEvent;
    use parking_lot::Mutex;

    /// Records events and fails the ones whose old prefix is `/fail/`
    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<InvalidationEvent>>,
    }

    #[async_trait]
    impl StreamHandler for Arc<Recorder> {
        fn stream(&self) -> &'static str {
            "test_stream"
        }

        fn group(&self) -> &'static str {
            "test_group"
        }

        async fn handle(&self, event: InvalidationEvent) -> CacheResult<()> {
            if let InvalidationEvent::PathRename(rename) = &event {
                if rename.old_prefix == "/fail/" {
                    return Err(CacheError::Backend("temporarily down".into()));
                }
            }
            self.seen.lock().push(event);
            Ok(())
        }
    }

    fn rename(old: &str) -> Vec<(String, String)> {
        codec::encode_event(&InvalidationEvent::PathRename(PathRenameEvent {
            owner_id: 1,
            old_prefix: old.to_string(),
            new_prefix: "/new/".to_string(),
        }))
        .unwrap()
    }

    fn consumer(cache: &MemoryCache, recorder: &Arc<Recorder>, config: ConsumerConfig) -> StreamConsumer<Arc<Recorder>> {
        StreamConsumer::new(
            Arc::new(cache.clone()),
            Arc::clone(recorder),
            config,
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_acks_handled_and_poison_messages() {
        let cache = MemoryCache::new();
        let recorder = Arc::new(Recorder::default());
        let mut consumer = consumer(&cache, &recorder, ConsumerConfig::default());

        assert_eq!(consumer.run_once().await.unwrap(), 0);
        cache.stream_add("test_stream", rename("/a/")).await.unwrap();
        cache
            .stream_add("test_stream", vec![("event".into(), "garbage".into())])
            .await
            .unwrap();
        cache.stream_add("test_stream", rename("/fail/")).await.unwrap();

        assert_eq!(consumer.drain().await.unwrap(), 3);
        assert_eq!(recorder.seen.lock().len(), 1);
        // only the transient failure stays pending
        assert_eq!(cache.pending_count("test_stream", "test_group").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_idle_pending_messages_reclaimed() {
        let cache = MemoryCache::new();
        let recorder = Arc::new(Recorder::default());
        let config = ConsumerConfig {
            reclaim_idle_ms: 0,
            ..ConsumerConfig::default()
        };

        cache.create_group("test_stream", "test_group").await.unwrap();
        cache.stream_add("test_stream", rename("/a/")).await.unwrap();
        // a crashed member read the message and never acknowledged it
        let stolen = cache
            .read_group("test_stream", "test_group", "crashed", 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(stolen.len(), 1);

        let mut consumer = consumer(&cache, &recorder, config);
        assert_eq!(consumer.run_once().await.unwrap(), 1);
        assert_eq!(recorder.seen.lock().len(), 1);
        assert_eq!(cache.pending_count("test_stream", "test_group").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let cache = MemoryCache::new();
        let recorder = Arc::new(Recorder::default());
        let cancel = CancellationToken::new();
        let config = ConsumerConfig {
            block_ms: 20,
            ..ConsumerConfig::default()
        };
        let consumer = StreamConsumer::new(Arc::new(cache.clone()), Arc::clone(&recorder), config, cancel.clone());
        let handle = tokio::spawn(consumer.run());

        cache.stream_add("test_stream", rename("/a/")).await.unwrap();
        for _ in 0..100 {
            if !recorder.seen.lock().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(recorder.seen.lock().len(), 1);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_retry_delay_is_capped_exponential() {
        let config = ConsumerConfig {
            base_retry_delay_ms: 100,
            max_retry_delay_ms: 1000,
            ..ConsumerConfig::default()
        };
        let consumer = StreamConsumer::new(
            Arc::new(MemoryCache::new()),
            Arc::new(Recorder::default()),
            config,
            CancellationToken::new(),
        );
        assert_eq!(consumer.calculate_retry_delay(1), Duration::from_millis(100));
        assert_eq!(consumer.calculate_retry_delay(3), Duration::from_millis(400));
        assert_eq!(consumer.calculate_retry_delay(10), Duration::from_millis(1000));
        assert_eq!(consumer.calculate_retry_delay(64), Duration::from_millis(1000));
    }
}
