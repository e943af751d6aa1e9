//! The public facade: wires the typed AWS clients, the coordination store,
//! the stream client, and the Lease Manager into one entry point for
//! embedding applications.

pub use kcl_consumer::{Delivery, DeliveryOutcome, DownstreamSink, LeaseManager, RecordSink, StopCallback};
pub use kcl_kinesis::{IteratorStart, Record, ShardDescriptor, StreamClient, StreamSummary};
pub use kcl_kv::CoordinationStore;
pub use kcl_store::{Mode, ShardView, StateStore};
pub use kcl_types::{
    BoxError, CapturedBacktrace, ConsumerConfig, ConsumerConfigBuilder, ConsumerId, Error, ExponentialBackoff,
    InitialPosition, NoRetry, Retry, Retryable, SequenceNumber, ShardId,
};

use aws_sdk_dynamodb::Client as DynamoClient;
use aws_sdk_kinesis::Client as KinesisClient;
use std::sync::Arc;

/// A running instance of the shard-coordination core for one
/// `(consumer_group, stream_name)` pair. Owns the Lease Manager and, through
/// it, every Polling Consumer it spawns.
pub struct Consumer<R: RecordSink + 'static, D: DownstreamSink + 'static> {
    manager: Arc<LeaseManager<R, D>>,
}

impl<R: RecordSink + 'static, D: DownstreamSink + 'static> Consumer<R, D> {
    /// Builds the AWS clients from the ambient environment/profile chain,
    /// ensures the coordination table and the coordination document exist,
    /// and returns a Lease Manager ready to `start()`.
    pub async fn bootstrap(config: ConsumerConfig, record_sink: Arc<R>, downstream: Arc<D>) -> Result<Self, Error> {
        let sdk_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        let dynamo = DynamoClient::new(&sdk_config);
        let kinesis = KinesisClient::new(&sdk_config);
        Self::bootstrap_with_clients(config, dynamo, kinesis, record_sink, downstream).await
    }

    /// Same as [`Self::bootstrap`] but with pre-built SDK clients, for
    /// callers that need custom endpoints, credentials, or retry
    /// configuration on the clients themselves (e.g. tests against a local
    /// DynamoDB/Kinesis stand-in).
    pub async fn bootstrap_with_clients(
        config: ConsumerConfig,
        dynamo: DynamoClient,
        kinesis: KinesisClient,
        record_sink: Arc<R>,
        downstream: Arc<D>,
    ) -> Result<Self, Error> {
        let kv = CoordinationStore::new(dynamo, config.kv_table_name.clone());
        kv.ensure_table().await?;
        if !config.kv_tags.is_empty() {
            let table_arn = kv.table_arn().await?;
            kv.tag_resource(&table_arn, &config.kv_tags).await?;
        }

        let stream = StreamClient::new(kinesis, config.stream_name.clone());
        let summary = stream.describe_stream_summary().await?;
        tracing::info!(stream_name = %summary.stream_name, status = %summary.stream_status, "stream reachable");

        let mode = if config.use_auto_shard_assignment {
            Mode::AutoAssignment
        } else {
            Mode::Standalone
        };
        let self_id = ConsumerId::from(config.consumer_id.clone());
        let store = StateStore::new(
            kv,
            config.consumer_group.clone(),
            config.stream_name.clone(),
            self_id.clone(),
            mode,
            config.lease_term,
        );
        store.init_stream_state(summary.stream_creation_timestamp).await?;

        let app_name = config.app_name.clone();
        let host = hostname();
        let manager = LeaseManager::new(self_id, app_name, host, store, stream, config, record_sink, downstream);

        Ok(Consumer { manager })
    }

    /// Starts the reconciliation loop. Idempotent.
    pub async fn start(&self) {
        self.manager.start().await;
    }

    /// Stops the reconciliation loop. In-flight polling consumers finish
    /// their current iteration rather than being cancelled.
    pub async fn stop(&self) {
        self.manager.stop().await;
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

/// Installs a `tracing_subscriber::fmt` subscriber reading `RUST_LOG`, for
/// binaries and examples. Libraries should not force-install a global
/// subscriber, so this is opt-in and never called from within this crate's
/// own code paths.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
}
