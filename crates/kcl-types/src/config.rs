//! Consumer configuration, with `Duration` fields deserializable via
//! `humantime_serde` so the same struct can be built programmatically or
//! loaded from TOML/env without a bespoke duration parser.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Where a fresh Polling Consumer should start reading a shard with no
/// persisted checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum InitialPosition {
    #[default]
    Latest,
    TrimHorizon,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    pub stream_name: String,
    pub consumer_group: String,
    pub consumer_id: String,
    pub app_name: String,

    pub use_auto_shard_assignment: bool,
    pub use_enhanced_fan_out: bool,

    #[serde(with = "humantime_serde")]
    pub lease_term: Duration,
    #[serde(with = "humantime_serde")]
    pub reconcile_every: Duration,
    #[serde(with = "humantime_serde")]
    pub heartbeat_failure_timeout: Duration,

    pub limit: i32,
    #[serde(with = "humantime_serde")]
    pub poll_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub no_records_poll_delay: Duration,

    pub initial_position_in_stream: InitialPosition,
    pub use_auto_checkpoints: bool,
    pub use_paused_polling: bool,

    pub should_deaggregate: bool,
    pub should_parse_json: bool,
    pub use_s3_for_large_items: bool,

    pub kv_table_name: String,
    pub kv_tags: std::collections::HashMap<String, String>,

    /// Only consulted when `use_auto_shard_assignment` is true: the cap is
    /// meaningless in standalone mode, where each consumer owns its own
    /// private partition of shards.
    pub max_active_leases: Option<u32>,
}

/// Builder for [`ConsumerConfig`], following its documented defaults.
#[derive(Debug, Clone)]
pub struct ConsumerConfigBuilder {
    stream_name: String,
    consumer_group: String,
    app_name: String,
    consumer_id: Option<String>,

    use_auto_shard_assignment: bool,
    use_enhanced_fan_out: bool,
    lease_term: Duration,
    reconcile_every: Duration,
    heartbeat_failure_timeout: Duration,
    limit: i32,
    poll_delay: Duration,
    no_records_poll_delay: Duration,
    initial_position_in_stream: InitialPosition,
    use_auto_checkpoints: bool,
    use_paused_polling: bool,
    should_deaggregate: bool,
    should_parse_json: bool,
    use_s3_for_large_items: bool,
    kv_table_name: Option<String>,
    kv_tags: std::collections::HashMap<String, String>,
    max_active_leases: Option<u32>,
}

impl ConsumerConfigBuilder {
    pub fn new(stream_name: impl Into<String>, consumer_group: impl Into<String>, app_name: impl Into<String>) -> Self {
        ConsumerConfigBuilder {
            stream_name: stream_name.into(),
            consumer_group: consumer_group.into(),
            app_name: app_name.into(),
            consumer_id: None,
            use_auto_shard_assignment: true,
            use_enhanced_fan_out: false,
            lease_term: Duration::from_secs(300),
            reconcile_every: Duration::from_secs(20),
            heartbeat_failure_timeout: Duration::from_secs(60),
            limit: 10_000,
            poll_delay: Duration::from_millis(250),
            no_records_poll_delay: Duration::from_secs(1),
            initial_position_in_stream: InitialPosition::Latest,
            use_auto_checkpoints: true,
            use_paused_polling: false,
            should_deaggregate: false,
            should_parse_json: false,
            use_s3_for_large_items: false,
            kv_table_name: None,
            kv_tags: Default::default(),
            max_active_leases: None,
        }
    }

    pub fn consumer_id(mut self, id: impl Into<String>) -> Self {
        self.consumer_id = Some(id.into());
        self
    }

    pub fn use_auto_shard_assignment(mut self, value: bool) -> Self {
        self.use_auto_shard_assignment = value;
        self
    }

    pub fn use_enhanced_fan_out(mut self, value: bool) -> Self {
        self.use_enhanced_fan_out = value;
        self
    }

    pub fn lease_term(mut self, value: Duration) -> Self {
        self.lease_term = value;
        self
    }

    pub fn reconcile_every(mut self, value: Duration) -> Self {
        self.reconcile_every = value;
        self
    }

    pub fn heartbeat_failure_timeout(mut self, value: Duration) -> Self {
        self.heartbeat_failure_timeout = value;
        self
    }

    pub fn limit(mut self, value: i32) -> Self {
        self.limit = value;
        self
    }

    pub fn poll_delay(mut self, value: Duration) -> Self {
        self.poll_delay = value;
        self
    }

    pub fn no_records_poll_delay(mut self, value: Duration) -> Self {
        self.no_records_poll_delay = value;
        self
    }

    pub fn initial_position_in_stream(mut self, value: InitialPosition) -> Self {
        self.initial_position_in_stream = value;
        self
    }

    pub fn use_auto_checkpoints(mut self, value: bool) -> Self {
        self.use_auto_checkpoints = value;
        self
    }

    pub fn use_paused_polling(mut self, value: bool) -> Self {
        self.use_paused_polling = value;
        self
    }

    pub fn kv_table_name(mut self, value: impl Into<String>) -> Self {
        self.kv_table_name = Some(value.into());
        self
    }

    pub fn max_active_leases(mut self, value: u32) -> Self {
        self.max_active_leases = Some(value);
        self
    }

    pub fn build(self) -> ConsumerConfig {
        let consumer_id = self.consumer_id.unwrap_or_else(|| {
            let host = hostname();
            format!("{host}:{}:{}", std::process::id(), uuid::Uuid::new_v4())
        });
        let kv_table_name = self
            .kv_table_name
            .unwrap_or_else(|| format!("{}-state", self.app_name));

        ConsumerConfig {
            stream_name: self.stream_name,
            consumer_group: self.consumer_group,
            consumer_id,
            app_name: self.app_name,
            use_auto_shard_assignment: self.use_auto_shard_assignment,
            use_enhanced_fan_out: self.use_enhanced_fan_out,
            lease_term: self.lease_term,
            reconcile_every: self.reconcile_every,
            heartbeat_failure_timeout: self.heartbeat_failure_timeout,
            limit: self.limit,
            poll_delay: self.poll_delay,
            no_records_poll_delay: self.no_records_poll_delay,
            initial_position_in_stream: self.initial_position_in_stream,
            use_auto_checkpoints: self.use_auto_checkpoints,
            use_paused_polling: self.use_paused_polling,
            should_deaggregate: self.should_deaggregate,
            should_parse_json: self.should_parse_json,
            use_s3_for_large_items: self.use_s3_for_large_items,
            kv_table_name,
            kv_tags: self.kv_tags,
            max_active_leases: self.max_active_leases,
        }
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = ConsumerConfigBuilder::new("my-stream", "my-group", "my-app").build();
        assert_eq!(cfg.lease_term, Duration::from_secs(300));
        assert_eq!(cfg.reconcile_every, Duration::from_secs(20));
        assert_eq!(cfg.heartbeat_failure_timeout, Duration::from_secs(60));
        assert_eq!(cfg.limit, 10_000);
        assert_eq!(cfg.poll_delay, Duration::from_millis(250));
        assert_eq!(cfg.no_records_poll_delay, Duration::from_secs(1));
        assert!(cfg.use_auto_shard_assignment);
        assert!(!cfg.use_enhanced_fan_out);
        assert!(cfg.use_auto_checkpoints);
        assert!(!cfg.use_paused_polling);
        assert_eq!(cfg.kv_table_name, "my-app-state");
    }

    #[test]
    fn kv_table_name_override_wins() {
        let cfg = ConsumerConfigBuilder::new("s", "g", "app")
            .kv_table_name("custom-table")
            .build();
        assert_eq!(cfg.kv_table_name, "custom-table");
    }

    #[test]
    fn consumer_id_defaults_to_host_pid_uuid_shape() {
        let cfg = ConsumerConfigBuilder::new("s", "g", "app").build();
        assert_eq!(cfg.consumer_id.split(':').count(), 3);
    }
}
