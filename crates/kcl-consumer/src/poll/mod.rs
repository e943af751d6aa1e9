//! The per-shard data loop: iterator acquisition, `get_records`, delivery
//! to a push callback, checkpoint policy, and end-of-shard / iterator-expiry
//! handling. A `loop {}` inside one spawned task rather than a recursive
//! `async fn` chain, so a long-lived shard never grows an unbounded call
//! stack.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kcl_kinesis::{IteratorStart, Record, StreamClient};
use kcl_store::StateStore;
use kcl_types::{ConsumerConfig, Error, InitialPosition, SequenceNumber, ShardId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};

/// One batch of records handed to the downstream consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub shard_id: ShardId,
    pub stream_name: String,
    pub records: Vec<Record>,
    pub millis_behind_latest: i64,
}

/// What the downstream consumer decided after a delivery. `set_checkpoint`
/// is only consulted when `useAutoCheckpoints=false`; `continue_polling`
/// only when `usePausedPolling=true`.
#[derive(Debug, Clone, Default)]
pub struct DeliveryOutcome {
    pub set_checkpoint: Option<SequenceNumber>,
    pub continue_polling: bool,
}

/// The public record-emission surface: implemented by the embedding
/// application, not by this crate.
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn deliver(&self, delivery: Delivery) -> DeliveryOutcome;
    async fn delivery_failed(&self, shard_id: &ShardId, error: &Error);
}

/// The Polling Consumer's back-reference to its owning Lease Manager: a
/// stop callback only, not a shared object graph. A plain `Weak`
/// upgrade-and-spawn inside the closure avoids a permanent `Arc` cycle
/// between manager and consumer.
pub type StopCallback = Arc<dyn Fn(ShardId) + Send + Sync>;

struct PollPolicy {
    limit: i32,
    poll_delay: std::time::Duration,
    no_records_poll_delay: std::time::Duration,
    initial_position: InitialPosition,
    use_auto_checkpoints: bool,
    use_paused_polling: bool,
}

impl From<&ConsumerConfig> for PollPolicy {
    fn from(cfg: &ConsumerConfig) -> Self {
        PollPolicy {
            limit: cfg.limit,
            poll_delay: cfg.poll_delay,
            no_records_poll_delay: cfg.no_records_poll_delay,
            initial_position: cfg.initial_position_in_stream,
            use_auto_checkpoints: cfg.use_auto_checkpoints,
            use_paused_polling: cfg.use_paused_polling,
        }
    }
}

pub struct PollingConsumer<S: RecordSink> {
    shard_id: ShardId,
    stream_name: String,
    stream: StreamClient,
    store: Arc<StateStore>,
    sink: Arc<S>,
    on_stop: StopCallback,
    policy: PollPolicy,
    running: AtomicBool,
    lease_expiration: Mutex<DateTime<Utc>>,
    iterator: Mutex<Option<String>>,
    checkpoint: Mutex<Option<SequenceNumber>>,
    pending_checkpoint: Mutex<Option<SequenceNumber>>,
    resume: Notify,
}

impl<S: RecordSink + 'static> PollingConsumer<S> {
    pub fn new(
        shard_id: ShardId,
        stream_name: String,
        stream: StreamClient,
        store: Arc<StateStore>,
        sink: Arc<S>,
        on_stop: StopCallback,
        config: &ConsumerConfig,
        initial_checkpoint: Option<SequenceNumber>,
        lease_expiration: DateTime<Utc>,
    ) -> Arc<Self> {
        Arc::new(PollingConsumer {
            shard_id,
            stream_name,
            stream,
            store,
            sink,
            on_stop,
            policy: PollPolicy::from(config),
            running: AtomicBool::new(true),
            lease_expiration: Mutex::new(lease_expiration),
            iterator: Mutex::new(None),
            checkpoint: Mutex::new(initial_checkpoint),
            pending_checkpoint: Mutex::new(None),
            resume: Notify::new(),
        })
    }

    /// Called by the Lease Manager on lease renewal; never decreases
    /// liveness unexpectedly.
    pub async fn update_lease_expiration(&self, expiration: DateTime<Utc>) {
        let mut guard = self.lease_expiration.lock().await;
        if expiration > *guard {
            *guard = expiration;
        }
    }

    /// Cancels the pending timer only; an in-flight fetch runs to
    /// completion and its result is discarded.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.resume.notify_waiters();
    }

    /// Resumes polling when `usePausedPolling=true`.
    pub fn continue_polling(&self) {
        self.resume.notify_one();
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Drives the poll loop until `stop()` is called, the lease expires,
    /// or end-of-shard / a fatal error is reached. Runs as one spawned
    /// task's `loop {}`, never recursing.
    pub async fn run(self: Arc<Self>) {
        while self.is_running() {
            if Utc::now() > *self.lease_expiration.lock().await {
                tracing::debug!(shard_id = %self.shard_id, "lease expired, stopping polling consumer");
                break;
            }

            if let Some(seq) = self.pending_checkpoint.lock().await.take() {
                if let Err(err) = self.store.store_shard_checkpoint(&self.shard_id, seq).await {
                    tracing::warn!(shard_id = %self.shard_id, error = %err, "failed to flush pending checkpoint");
                }
            }

            let iterator = match self.ensure_iterator().await {
                Ok(it) => it,
                Err(err) => {
                    tracing::warn!(shard_id = %self.shard_id, error = %err, "failed to acquire shard iterator");
                    self.sink.delivery_failed(&self.shard_id, &err).await;
                    tokio::time::sleep(self.policy.no_records_poll_delay).await;
                    continue;
                }
            };

            match self.stream.get_records(&iterator, self.policy.limit).await {
                Ok(batch) => {
                    let caught_up = batch.millis_behind_latest <= 0;
                    let end_of_shard = batch.next_shard_iterator.is_none();
                    *self.iterator.lock().await = batch.next_shard_iterator.clone();

                    if batch.records.is_empty() {
                        if end_of_shard {
                            self.handle_end_of_shard().await;
                            break;
                        }
                        let delay = if caught_up { self.policy.no_records_poll_delay } else { std::time::Duration::ZERO };
                        tokio::time::sleep(delay).await;
                        continue;
                    }

                    self.deliver_and_checkpoint(batch.records, batch.millis_behind_latest).await;

                    if end_of_shard {
                        self.handle_end_of_shard().await;
                        break;
                    }
                }
                Err(Error::ExpiredIterator { .. }) => {
                    tracing::debug!(shard_id = %self.shard_id, "iterator expired, reacquiring without advancing checkpoint");
                    *self.iterator.lock().await = None;
                    continue;
                }
                Err(err) => {
                    tracing::warn!(shard_id = %self.shard_id, error = %err, "get_records failed");
                    self.sink.delivery_failed(&self.shard_id, &err).await;
                    tokio::time::sleep(self.policy.no_records_poll_delay).await;
                    continue;
                }
            }

            if self.policy.use_paused_polling {
                self.resume.notified().await;
            } else {
                tokio::time::sleep(self.policy.poll_delay).await;
            }
        }

        (self.on_stop)(self.shard_id.clone());
    }

    async fn ensure_iterator(&self) -> Result<String, Error> {
        if let Some(existing) = self.iterator.lock().await.clone() {
            return Ok(existing);
        }

        let checkpoint = self.checkpoint.lock().await.clone();
        let fresh = if let Some(seq) = checkpoint.clone() {
            match self
                .stream
                .get_shard_iterator(&self.shard_id, IteratorStart::AfterSequenceNumber(seq))
                .await
            {
                Ok(it) => it,
                Err(Error::Fatal { .. }) => {
                    tracing::warn!(shard_id = %self.shard_id, "checkpointed sequence rejected, falling back to initial position");
                    self.stream
                        .get_shard_iterator(&self.shard_id, self.initial_start())
                        .await?
                }
                Err(other) => return Err(other),
            }
        } else {
            self.stream.get_shard_iterator(&self.shard_id, self.initial_start()).await?
        };

        *self.iterator.lock().await = Some(fresh.clone());
        Ok(fresh)
    }

    fn initial_start(&self) -> IteratorStart {
        match self.policy.initial_position {
            InitialPosition::Latest => IteratorStart::Latest,
            InitialPosition::TrimHorizon => IteratorStart::TrimHorizon,
        }
    }

    async fn deliver_and_checkpoint(&self, records: Vec<Record>, millis_behind_latest: i64) {
        let last_sequence = records.last().map(|r| r.sequence_number.clone());
        let delivery = Delivery {
            shard_id: self.shard_id.clone(),
            stream_name: self.stream_name.clone(),
            records,
            millis_behind_latest,
        };
        let outcome = self.sink.deliver(delivery).await;

        let to_checkpoint = if self.policy.use_auto_checkpoints {
            last_sequence
        } else {
            outcome.set_checkpoint
        };

        if let Some(seq) = to_checkpoint {
            *self.checkpoint.lock().await = Some(seq.clone());
            if self.policy.use_paused_polling {
                // Stash it: the write happens at the onset of the *next*
                // fetch, so the downstream's handling of this batch is
                // known-complete before we advance.
                *self.pending_checkpoint.lock().await = Some(seq);
            } else if let Err(err) = self.store.store_shard_checkpoint(&self.shard_id, seq).await {
                tracing::warn!(shard_id = %self.shard_id, error = %err, "failed to store checkpoint");
            }
        }

        if self.policy.use_paused_polling && !outcome.continue_polling {
            // The caller will resume us later via `continue_polling()`.
        }
    }

    async fn handle_end_of_shard(&self) {
        tracing::debug!(shard_id = %self.shard_id, "end of shard reached");
        match self.stream.list_shards().await {
            Ok(shards) => {
                if let Err(err) = self.store.mark_shard_as_depleted(&self.shard_id, &shards).await {
                    tracing::warn!(shard_id = %self.shard_id, error = %err, "failed to mark shard depleted");
                }
            }
            Err(err) => tracing::warn!(shard_id = %self.shard_id, error = %err, "failed to list shards for depletion seeding"),
        }
        self.running.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RecordingSink;

    #[async_trait]
    impl RecordSink for RecordingSink {
        async fn deliver(&self, _delivery: Delivery) -> DeliveryOutcome {
            DeliveryOutcome::default()
        }
        async fn delivery_failed(&self, _shard_id: &ShardId, _error: &Error) {}
    }

    #[test]
    fn policy_reads_config_defaults() {
        let cfg = kcl_types::ConsumerConfigBuilder::new("s", "g", "app").build();
        let policy = PollPolicy::from(&cfg);
        assert_eq!(policy.limit, 10_000);
        assert!(policy.use_auto_checkpoints);
        assert!(!policy.use_paused_polling);
    }
}
