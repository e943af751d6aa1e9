//! The per-consumer reconciliation control loop: a periodic tick that walks
//! every shard against the decision table, with jittered sleep between
//! ticks and no recursive call chain.

pub mod decision;

use crate::poll::{PollingConsumer, RecordSink};
use chrono::Utc;
use decision::{decide, Decision, ShardContext};
use kcl_kinesis::StreamClient;
use kcl_store::StateStore;
use kcl_types::{ConsumerConfig, ConsumerId, Error, ShardId};
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Told when the owned-lease set changes, or when the stream disappears.
#[async_trait::async_trait]
pub trait DownstreamSink: Send + Sync {
    async fn reconcile(&self, owned: HashMap<ShardId, kcl_store::ShardView>);
    async fn stream_gone(&self);
}

enum RunState {
    Idle,
    Running,
}

pub struct LeaseManager<R: RecordSink + 'static, D: DownstreamSink + 'static> {
    consumer_id: ConsumerId,
    app_name: String,
    host: String,
    store: Arc<StateStore>,
    stream: StreamClient,
    config: ConsumerConfig,
    record_sink: Arc<R>,
    downstream: Arc<D>,
    state: Mutex<RunState>,
    running: Arc<AtomicBool>,
    polling: Mutex<HashMap<ShardId, (Arc<PollingConsumer<R>>, JoinHandle<()>)>>,
    /// Cached once `registerStreamConsumer` succeeds; gates leasing while
    /// `useEnhancedFanOut` is on.
    enhanced_consumer_arn: Mutex<Option<String>>,
}

impl<R: RecordSink + 'static, D: DownstreamSink + 'static> LeaseManager<R, D> {
    pub fn new(
        consumer_id: ConsumerId,
        app_name: String,
        host: String,
        store: StateStore,
        stream: StreamClient,
        config: ConsumerConfig,
        record_sink: Arc<R>,
        downstream: Arc<D>,
    ) -> Arc<Self> {
        Arc::new(LeaseManager {
            consumer_id,
            app_name,
            host,
            store: Arc::new(store),
            stream,
            config,
            record_sink,
            downstream,
            state: Mutex::new(RunState::Idle),
            running: Arc::new(AtomicBool::new(false)),
            polling: Mutex::new(HashMap::new()),
            enhanced_consumer_arn: Mutex::new(None),
        })
    }

    /// `Idle -> Running`. Repeated calls are a no-op.
    pub async fn start(self: &Arc<Self>) {
        let mut state = self.state.lock().await;
        if matches!(*state, RunState::Running) {
            return;
        }
        *state = RunState::Running;
        self.running.store(true, Ordering::SeqCst);

        let manager = Arc::clone(self);
        tokio::spawn(async move { manager.reconcile_loop().await });
    }

    /// `Running -> Idle`. Clears the pending timer; in-flight work is not
    /// cancelled.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        *self.state.lock().await = RunState::Idle;
    }

    async fn reconcile_loop(self: Arc<Self>) {
        while self.running.load(Ordering::SeqCst) {
            if let Err(err) = self.reconcile_tick().await {
                tracing::warn!(error = %err, "reconciliation tick failed, continuing");
            }

            let jitter = rand::thread_rng().gen_range(0.9..1.1);
            let delay = self.config.reconcile_every.mul_f64(jitter);
            tokio::time::sleep(delay).await;
        }
    }

    #[tracing::instrument(skip_all, fields(consumer_group = %self.config.consumer_group, stream_name = %self.config.stream_name))]
    async fn reconcile_tick(self: &Arc<Self>) -> Result<(), Error> {
        let summary = match self.stream.describe_stream_summary().await {
            Ok(summary) if summary.stream_status == "ACTIVE" || summary.stream_status == "UPDATING" => summary,
            Ok(_) | Err(Error::NotFound(_)) => {
                tracing::info!("stream no longer exists, stopping lease manager");
                self.downstream.stream_gone().await;
                self.stop().await;
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        if self.config.use_enhanced_fan_out && self.ensure_enhanced_consumer(&summary.stream_arn).await?.is_none() {
            tracing::debug!("enhanced consumer not yet registered, nothing to lease this tick");
            return Ok(());
        }

        self.store
            .register_consumer(self.app_name.clone(), self.host.clone(), std::process::id(), Utc::now())
            .await?;
        self.store.clear_old_consumers(self.config.heartbeat_failure_timeout).await?;

        let shards = self.stream.list_shards().await?;
        let renew_threshold = chrono::Duration::from_std(self.config.lease_term / 2).unwrap_or_default();
        let now = Utc::now();

        let stream_snapshot = self.store.get_stream_state().await?;
        let active_consumer_count = stream_snapshot.consumers.values().filter(|c| c.is_active).count().max(1);
        let max_active = if self.config.use_auto_shard_assignment {
            self.config
                .max_active_leases
                .map(|cap| cap as usize)
                .unwrap_or_else(|| div_ceil(shards.len(), active_consumer_count))
        } else {
            usize::MAX
        };

        let mut sorted_shards = shards.clone();
        sorted_shards.sort_by(|a, b| a.shard_id.cmp(&b.shard_id));

        let mut changed = false;
        let mut owned_count = 0usize;

        for shard in &sorted_shards {
            let (stream_state, view) = self
                .store
                .get_shard_and_stream_state(&shard.shard_id, shard.parent_shard_id.clone())
                .await?;

            let owner_known = view.lease_owner.as_ref().map(|o| stream_state.is_known_consumer(o)).unwrap_or(true);
            let ctx = ShardContext {
                self_id: &self.consumer_id,
                depleted: view.depleted,
                lease_owner: view.lease_owner.as_ref(),
                lease_expiration: view.lease_expiration,
                owner_known,
                parent_depleted_or_absent: stream_state.parent_depleted_or_absent(&view),
                owned_count,
                max_active,
                use_auto_shard_assignment: self.config.use_auto_shard_assignment,
                renew_threshold,
                now,
            };
            let (action, reason) = decide(&ctx);
            tracing::debug!(shard_id = %shard.shard_id, ?action, reason, "reconcile decision");

            match action {
                Decision::Skip => {
                    if view.lease_owner.as_ref() == Some(&self.consumer_id) {
                        owned_count += 1;
                    }
                }
                Decision::Renew => {
                    if self.store.lock_shard_lease(&shard.shard_id, view.version).await? {
                        let expiration = now + chrono::Duration::from_std(self.config.lease_term).unwrap_or_default();
                        self.update_lease_expiration(&shard.shard_id, expiration).await;
                        changed = true;
                    }
                    owned_count += 1;
                }
                Decision::Steal | Decision::Reclaim => {
                    if let Some(version) = self.store.release_shard_lease(&shard.shard_id, view.version).await? {
                        if self.store.lock_shard_lease(&shard.shard_id, version).await? {
                            self.spawn_polling_consumer(&shard.shard_id, view.checkpoint.clone(), now).await;
                            changed = true;
                            owned_count += 1;
                        }
                    }
                }
                Decision::Acquire => {
                    if self.store.lock_shard_lease(&shard.shard_id, view.version).await? {
                        self.spawn_polling_consumer(&shard.shard_id, view.checkpoint.clone(), now).await;
                        changed = true;
                        owned_count += 1;
                    }
                }
            }

            if reason == "max leases reached" {
                changed = true; // triggers a reconcile so peers rebalance
            }
        }

        if changed {
            let owned = self.store.get_owned_shards().await?;
            self.downstream.reconcile(owned).await;
        }

        Ok(())
    }

    /// Registers this consumer's enhanced fan-out consumer once and caches
    /// the ARN, returning it; registration failures are logged and retried
    /// on the next tick rather than surfaced to the caller.
    async fn ensure_enhanced_consumer(&self, stream_arn: &str) -> Result<Option<String>, Error> {
        if let Some(arn) = self.enhanced_consumer_arn.lock().await.clone() {
            return Ok(Some(arn));
        }

        match self.stream.register_stream_consumer(stream_arn, &self.consumer_id.to_string()).await {
            Ok(arn) => {
                *self.enhanced_consumer_arn.lock().await = Some(arn.clone());
                Ok(Some(arn))
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to register enhanced fan-out consumer, will retry");
                Ok(None)
            }
        }
    }

    async fn update_lease_expiration(&self, shard_id: &ShardId, expiration: chrono::DateTime<Utc>) {
        if let Some((consumer, _)) = self.polling.lock().await.get(shard_id) {
            consumer.update_lease_expiration(expiration).await;
        }
    }

    async fn spawn_polling_consumer(
        self: &Arc<Self>,
        shard_id: &ShardId,
        checkpoint: Option<kcl_types::SequenceNumber>,
        now: chrono::DateTime<Utc>,
    ) {
        let expiration = now + chrono::Duration::from_std(self.config.lease_term).unwrap_or_default();
        let weak_self: Weak<LeaseManager<R, D>> = Arc::downgrade(self);
        let on_stop: crate::poll::StopCallback = Arc::new(move |shard_id: ShardId| {
            if let Some(manager) = weak_self.upgrade() {
                tokio::spawn(async move {
                    manager.polling.lock().await.remove(&shard_id);
                });
            }
        });

        let consumer = PollingConsumer::new(
            shard_id.clone(),
            self.config.stream_name.clone(),
            self.stream.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.record_sink),
            on_stop,
            &self.config,
            checkpoint,
            expiration,
        );

        let driver = Arc::clone(&consumer);
        let handle = tokio::spawn(async move { driver.run().await });
        self.polling.lock().await.insert(shard_id.clone(), (consumer, handle));
    }
}

fn div_ceil(numerator: usize, denominator: usize) -> usize {
    if denominator == 0 {
        return numerator;
    }
    (numerator + denominator - 1) / denominator
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn div_ceil_matches_expected_shard_to_consumer_ratio() {
        assert_eq!(div_ceil(10, 3), 4);
        assert_eq!(div_ceil(9, 3), 3);
        assert_eq!(div_ceil(1, 1), 1);
    }
}
