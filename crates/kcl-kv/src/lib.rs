//! A typed wrapper over the coordination key-value store: a thin struct
//! holding the underlying SDK client, one method per operation, and a single
//! error-classification function that every method funnels its result
//! through.
//!
//! The coordination document is stored as nested maps, one entry per shard
//! and per consumer, so that a lease renewal or checkpoint write only
//! contends with writes to that same shard's slot rather than with every
//! other mutation of the document.

use aws_sdk_dynamodb::error::SdkError;
use aws_sdk_dynamodb::types::{
    AttributeValue, BillingMode, KeySchemaElement, KeyType, ScalarAttributeType, Tag as DynamoTag,
};
use aws_sdk_dynamodb::Client as DynamoClient;
use chrono::{DateTime, Utc};
use kcl_types::{ConsumerId, ConsumerRecord, Error, SequenceNumber, ShardId, ShardRecord, StreamState, Version};
use std::collections::HashMap;
use std::time::Duration;

const PARTITION_KEY: &str = "pk";
const VERSION_ATTR: &str = "version";
const CONSUMER_GROUP_ATTR: &str = "consumer_group";
const STREAM_NAME_ATTR: &str = "stream_name";
const STREAM_CREATED_ON_ATTR: &str = "stream_created_on";
const SHARDS_ATTR: &str = "shards";
const CONSUMERS_ATTR: &str = "consumers";

/// Which nested map a single shard's leasing state lives under: the
/// document-global `shards` map in auto-assignment mode, or a private
/// partition under a specific consumer in standalone mode.
pub enum ShardPath<'a> {
    Global { shard_id: &'a str },
    PerConsumer { consumer_id: &'a str, shard_id: &'a str },
}

impl<'a> ShardPath<'a> {
    fn expression_parts(&self) -> (String, Vec<(String, String)>) {
        match self {
            ShardPath::Global { shard_id } => (
                format!("{SHARDS_ATTR}.#sid"),
                vec![("#sid".to_string(), shard_id.to_string())],
            ),
            ShardPath::PerConsumer { consumer_id, shard_id } => (
                format!("{CONSUMERS_ATTR}.#cid.{SHARDS_ATTR}.#sid"),
                vec![
                    ("#cid".to_string(), consumer_id.to_string()),
                    ("#sid".to_string(), shard_id.to_string()),
                ],
            ),
        }
    }
}

/// One coordination document, keyed by `{consumer_group}#{stream_name}`.
#[derive(Clone)]
pub struct CoordinationStore {
    client: DynamoClient,
    table_name: String,
}

impl CoordinationStore {
    pub fn new(client: DynamoClient, table_name: impl Into<String>) -> Self {
        CoordinationStore {
            client,
            table_name: table_name.into(),
        }
    }

    fn partition_key(consumer_group: &str, stream_name: &str) -> String {
        format!("{consumer_group}#{stream_name}")
    }

    /// Fetches the current document, or `None` if it has never been created.
    pub async fn get(&self, consumer_group: &str, stream_name: &str) -> Result<Option<StreamState>, Error> {
        let key = Self::partition_key(consumer_group, stream_name);
        let resp = self
            .client
            .get_item()
            .table_name(&self.table_name)
            .key(PARTITION_KEY, AttributeValue::S(key))
            .consistent_read(true)
            .send()
            .await
            .map_err(classify)?;

        let Some(item) = resp.item else {
            return Ok(None);
        };
        decode_item(&item)
    }

    /// Creates the document for the first time. Fails with
    /// [`Error::PreconditionFailed`] if one already exists.
    pub async fn put_if_absent(&self, state: &StreamState) -> Result<(), Error> {
        let key = Self::partition_key(&state.consumer_group, &state.stream_name);
        let item = encode_item(&key, state);

        self.client
            .put_item()
            .table_name(&self.table_name)
            .set_item(Some(item))
            .condition_expression("attribute_not_exists(#pk)")
            .expression_attribute_names("#pk", PARTITION_KEY)
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    /// Replaces the whole document, conditioned on `expected_version` still
    /// being current. Used only by mutations that genuinely touch more than
    /// one shard or consumer at once (clearing dead consumers, seeding
    /// children on depletion); per-shard and per-consumer writes go through
    /// [`Self::update_shard`] / [`Self::update_consumer_heartbeat`] instead.
    pub async fn update(&self, state: &StreamState, expected_version: Version) -> Result<(), Error> {
        let key = Self::partition_key(&state.consumer_group, &state.stream_name);
        let item = encode_item(&key, state);

        self.client
            .put_item()
            .table_name(&self.table_name)
            .set_item(Some(item))
            .condition_expression("#version = :expected")
            .expression_attribute_names("#version", VERSION_ATTR)
            .expression_attribute_values(":expected", AttributeValue::S(expected_version.to_string()))
            .send()
            .await
            .map_err(|err| match classify(err) {
                Error::PreconditionFailed { source, .. } => Error::PreconditionFailed {
                    key: key.clone(),
                    source,
                },
                other => other,
            })?;
        Ok(())
    }

    /// Writes one shard's record at `path`, conditioned on the existing slot
    /// (if any) still being at `expected_version`. `expected_version: None`
    /// requires the slot to not already exist at all — a true create-only
    /// write, used to seed lineage without ever overwriting a live slot.
    /// When `expected_version` is `Some`, a slot that does not yet exist is
    /// also accepted, so that the first write to a not-yet-materialized
    /// per-consumer partition always lands.
    pub async fn update_shard(
        &self,
        consumer_group: &str,
        stream_name: &str,
        path: ShardPath<'_>,
        record: &ShardRecord,
        expected_version: Option<Version>,
    ) -> Result<(), Error> {
        let key = Self::partition_key(consumer_group, stream_name);
        let (doc_path, names) = path.expression_parts();

        let mut request = self
            .client
            .update_item()
            .table_name(&self.table_name)
            .key(PARTITION_KEY, AttributeValue::S(key.clone()))
            .update_expression(format!("SET {doc_path} = :rec"))
            .expression_attribute_values(":rec", AttributeValue::M(shard_record_to_item(record)));

        for (name, value) in names {
            request = request.expression_attribute_names(name, value);
        }

        let condition = match expected_version {
            None => format!("attribute_not_exists({doc_path})"),
            Some(version) => {
                request = request
                    .expression_attribute_values(":expected", AttributeValue::S(version.to_string()))
                    .expression_attribute_names("#version", VERSION_ATTR);
                format!("attribute_not_exists({doc_path}) OR {doc_path}.#version = :expected")
            }
        };
        request = request.condition_expression(condition);

        request
            .send()
            .await
            .map_err(|err| match classify(err) {
                Error::PreconditionFailed { source, .. } => Error::PreconditionFailed { key, source },
                other => other,
            })?;
        Ok(())
    }

    /// Creates a new consumer's record, conditioned on that consumer slot
    /// not already existing.
    pub async fn put_consumer_if_absent(
        &self,
        consumer_group: &str,
        stream_name: &str,
        consumer_id: &str,
        record: &ConsumerRecord,
    ) -> Result<(), Error> {
        let key = Self::partition_key(consumer_group, stream_name);

        self.client
            .update_item()
            .table_name(&self.table_name)
            .key(PARTITION_KEY, AttributeValue::S(key.clone()))
            .update_expression(format!("SET {CONSUMERS_ATTR}.#cid = :rec"))
            .condition_expression(format!("attribute_not_exists({CONSUMERS_ATTR}.#cid)"))
            .expression_attribute_names("#cid", consumer_id)
            .expression_attribute_values(":rec", AttributeValue::M(consumer_record_to_item(record)))
            .send()
            .await
            .map_err(|err| match classify(err) {
                Error::PreconditionFailed { source, .. } => Error::PreconditionFailed { key, source },
                other => other,
            })?;
        Ok(())
    }

    /// Bumps a known consumer's heartbeat in place. Fails with
    /// [`Error::PreconditionFailed`] if that consumer has no record yet, so
    /// callers can fall back to [`Self::put_consumer_if_absent`].
    pub async fn update_consumer_heartbeat(
        &self,
        consumer_group: &str,
        stream_name: &str,
        consumer_id: &str,
        heartbeat: DateTime<Utc>,
    ) -> Result<(), Error> {
        let key = Self::partition_key(consumer_group, stream_name);

        self.client
            .update_item()
            .table_name(&self.table_name)
            .key(PARTITION_KEY, AttributeValue::S(key.clone()))
            .update_expression(format!("SET {CONSUMERS_ATTR}.#cid.heartbeat = :hb"))
            .condition_expression(format!("attribute_exists({CONSUMERS_ATTR}.#cid)"))
            .expression_attribute_names("#cid", consumer_id)
            .expression_attribute_values(":hb", AttributeValue::S(heartbeat.to_rfc3339()))
            .send()
            .await
            .map_err(|err| match classify(err) {
                Error::PreconditionFailed { source, .. } => Error::PreconditionFailed { key, source },
                other => other,
            })?;
        Ok(())
    }

    pub async fn delete(&self, consumer_group: &str, stream_name: &str) -> Result<(), Error> {
        let key = Self::partition_key(consumer_group, stream_name);
        self.client
            .delete_item()
            .table_name(&self.table_name)
            .key(PARTITION_KEY, AttributeValue::S(key))
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    /// Creates the backing table if it does not already exist, and blocks
    /// until it is `ACTIVE`. Idempotent: a `ResourceInUseException` from a
    /// racing caller is treated as success.
    pub async fn ensure_table(&self) -> Result<(), Error> {
        match self.client.describe_table().table_name(&self.table_name).send().await {
            Ok(resp) => {
                if resp.table.and_then(|t| t.table_status).map(|s| s.as_str() == "ACTIVE") == Some(true) {
                    return Ok(());
                }
            }
            Err(SdkError::ServiceError(e)) if e.err().is_resource_not_found_exception() => {
                self.create_table().await?;
            }
            Err(err) => return Err(classify(err)),
        }
        self.wait_for(|status| status == "ACTIVE").await
    }

    async fn create_table(&self) -> Result<(), Error> {
        let result = self
            .client
            .create_table()
            .table_name(&self.table_name)
            .attribute_definitions(
                aws_sdk_dynamodb::types::AttributeDefinition::builder()
                    .attribute_name(PARTITION_KEY)
                    .attribute_type(ScalarAttributeType::S)
                    .build()
                    .map_err(Error::fatal)?,
            )
            .key_schema(
                KeySchemaElement::builder()
                    .attribute_name(PARTITION_KEY)
                    .key_type(KeyType::Hash)
                    .build()
                    .map_err(Error::fatal)?,
            )
            .billing_mode(BillingMode::PayPerRequest)
            .send()
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(SdkError::ServiceError(e)) if e.err().is_resource_in_use_exception() => Ok(()),
            Err(err) => Err(classify(err)),
        }
    }

    /// Polls `describe_table` until `predicate` accepts the table's status,
    /// or the wait budget (60s) runs out.
    pub async fn wait_for(&self, predicate: impl Fn(&str) -> bool) -> Result<(), Error> {
        for _ in 0..60 {
            let resp = self
                .client
                .describe_table()
                .table_name(&self.table_name)
                .send()
                .await
                .map_err(classify)?;
            if let Some(status) = resp.table.and_then(|t| t.table_status) {
                if predicate(status.as_str()) {
                    return Ok(());
                }
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        Err(Error::Protocol("table did not reach the expected status within the wait budget"))
    }

    /// Looks up the table's ARN, for callers that need it to tag the
    /// resource after creation.
    pub async fn table_arn(&self) -> Result<String, Error> {
        let resp = self
            .client
            .describe_table()
            .table_name(&self.table_name)
            .send()
            .await
            .map_err(classify)?;
        resp.table
            .and_then(|t| t.table_arn)
            .ok_or(Error::Protocol("describe_table response missing table ARN"))
    }

    pub async fn tag_resource(&self, table_arn: &str, tags: &HashMap<String, String>) -> Result<(), Error> {
        if tags.is_empty() {
            return Ok(());
        }
        let dynamo_tags: Vec<DynamoTag> = tags
            .iter()
            .map(|(k, v)| DynamoTag::builder().key(k).value(v).build().map_err(Error::fatal))
            .collect::<Result<_, _>>()?;

        self.client
            .tag_resource()
            .resource_arn(table_arn)
            .set_tags(Some(dynamo_tags))
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    /// Lists every tag currently attached to the table, for callers that
    /// want to reconcile rather than blindly reapply `kv_tags`.
    pub async fn list_tags_of_resource(&self, table_arn: &str) -> Result<HashMap<String, String>, Error> {
        let mut tags = HashMap::new();
        let mut next_token = None;
        loop {
            let resp = self
                .client
                .list_tags_of_resource()
                .resource_arn(table_arn)
                .set_next_token(next_token)
                .send()
                .await
                .map_err(classify)?;
            for tag in resp.tags.unwrap_or_default() {
                if let (Some(key), Some(value)) = (tag.key, tag.value) {
                    tags.insert(key, value);
                }
            }
            next_token = resp.next_token;
            if next_token.is_none() {
                break;
            }
        }
        Ok(tags)
    }
}

fn av_string(value: impl Into<String>) -> AttributeValue {
    AttributeValue::S(value.into())
}

fn get_string(item: &HashMap<String, AttributeValue>, key: &str) -> Result<String, Error> {
    match item.get(key) {
        Some(AttributeValue::S(s)) => Ok(s.clone()),
        _ => Err(Error::Protocol("missing or malformed string attribute")),
    }
}

fn get_opt_string(item: &HashMap<String, AttributeValue>, key: &str) -> Option<String> {
    match item.get(key) {
        Some(AttributeValue::S(s)) => Some(s.clone()),
        _ => None,
    }
}

fn get_bool(item: &HashMap<String, AttributeValue>, key: &str) -> Result<bool, Error> {
    match item.get(key) {
        Some(AttributeValue::Bool(b)) => Ok(*b),
        _ => Err(Error::Protocol("missing or malformed bool attribute")),
    }
}

fn get_u32(item: &HashMap<String, AttributeValue>, key: &str) -> Result<u32, Error> {
    match item.get(key) {
        Some(AttributeValue::N(n)) => n.parse().map_err(Error::fatal),
        _ => Err(Error::Protocol("missing or malformed numeric attribute")),
    }
}

fn get_map(item: &HashMap<String, AttributeValue>, key: &str) -> Result<HashMap<String, AttributeValue>, Error> {
    match item.get(key) {
        Some(AttributeValue::M(m)) => Ok(m.clone()),
        _ => Err(Error::Protocol("missing or malformed map attribute")),
    }
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, Error> {
    DateTime::parse_from_rfc3339(s).map(|dt| dt.with_timezone(&Utc)).map_err(Error::fatal)
}

fn parse_version(s: &str) -> Result<Version, Error> {
    s.parse().map_err(Error::fatal)
}

fn shard_record_to_item(rec: &ShardRecord) -> HashMap<String, AttributeValue> {
    let mut item = HashMap::new();
    if let Some(parent) = &rec.parent {
        item.insert("parent".to_string(), av_string(parent.to_string()));
    }
    if let Some(checkpoint) = &rec.checkpoint {
        item.insert("checkpoint".to_string(), av_string(checkpoint.to_string()));
    }
    item.insert("depleted".to_string(), AttributeValue::Bool(rec.depleted));
    if let Some(owner) = &rec.lease_owner {
        item.insert("lease_owner".to_string(), av_string(owner.to_string()));
    }
    if let Some(expiration) = rec.lease_expiration {
        item.insert("lease_expiration".to_string(), av_string(expiration.to_rfc3339()));
    }
    item.insert(VERSION_ATTR.to_string(), av_string(rec.version.to_string()));
    item
}

fn shard_record_from_item(item: &HashMap<String, AttributeValue>) -> Result<ShardRecord, Error> {
    Ok(ShardRecord {
        parent: get_opt_string(item, "parent").map(ShardId::from),
        checkpoint: get_opt_string(item, "checkpoint").map(SequenceNumber::from),
        depleted: get_bool(item, "depleted")?,
        lease_owner: get_opt_string(item, "lease_owner").map(ConsumerId::from),
        lease_expiration: get_opt_string(item, "lease_expiration").map(|s| parse_datetime(&s)).transpose()?,
        version: parse_version(&get_string(item, VERSION_ATTR)?)?,
    })
}

fn consumer_record_to_item(rec: &ConsumerRecord) -> HashMap<String, AttributeValue> {
    let mut item = HashMap::new();
    item.insert("app_name".to_string(), av_string(rec.app_name.clone()));
    item.insert("host".to_string(), av_string(rec.host.clone()));
    item.insert("pid".to_string(), AttributeValue::N(rec.pid.to_string()));
    item.insert("started_on".to_string(), av_string(rec.started_on.to_rfc3339()));
    item.insert("heartbeat".to_string(), av_string(rec.heartbeat.to_rfc3339()));
    item.insert("is_active".to_string(), AttributeValue::Bool(rec.is_active));
    item.insert("is_standalone".to_string(), AttributeValue::Bool(rec.is_standalone));

    let shards = rec.shards.as_ref().map(shards_to_item).unwrap_or_default();
    item.insert(SHARDS_ATTR.to_string(), AttributeValue::M(shards));
    item
}

fn consumer_record_from_item(item: &HashMap<String, AttributeValue>) -> Result<ConsumerRecord, Error> {
    let is_standalone = get_bool(item, "is_standalone")?;
    let shards = if is_standalone {
        Some(shards_from_item(&get_map(item, SHARDS_ATTR)?)?)
    } else {
        None
    };

    Ok(ConsumerRecord {
        app_name: get_string(item, "app_name")?,
        host: get_string(item, "host")?,
        pid: get_u32(item, "pid")?,
        started_on: parse_datetime(&get_string(item, "started_on")?)?,
        heartbeat: parse_datetime(&get_string(item, "heartbeat")?)?,
        is_active: get_bool(item, "is_active")?,
        is_standalone,
        shards,
    })
}

fn shards_to_item(shards: &HashMap<ShardId, ShardRecord>) -> HashMap<String, AttributeValue> {
    shards
        .iter()
        .map(|(id, rec)| (id.to_string(), AttributeValue::M(shard_record_to_item(rec))))
        .collect()
}

fn shards_from_item(item: &HashMap<String, AttributeValue>) -> Result<HashMap<ShardId, ShardRecord>, Error> {
    item.iter()
        .map(|(id, value)| {
            let AttributeValue::M(m) = value else {
                return Err(Error::Protocol("shard entry is not a map"));
            };
            Ok((ShardId::from(id.clone()), shard_record_from_item(m)?))
        })
        .collect()
}

fn consumers_to_item(consumers: &HashMap<ConsumerId, ConsumerRecord>) -> HashMap<String, AttributeValue> {
    consumers
        .iter()
        .map(|(id, rec)| (id.to_string(), AttributeValue::M(consumer_record_to_item(rec))))
        .collect()
}

fn consumers_from_item(item: &HashMap<String, AttributeValue>) -> Result<HashMap<ConsumerId, ConsumerRecord>, Error> {
    item.iter()
        .map(|(id, value)| {
            let AttributeValue::M(m) = value else {
                return Err(Error::Protocol("consumer entry is not a map"));
            };
            Ok((ConsumerId::from(id.clone()), consumer_record_from_item(m)?))
        })
        .collect()
}

fn encode_item(key: &str, state: &StreamState) -> HashMap<String, AttributeValue> {
    let mut item = HashMap::new();
    item.insert(PARTITION_KEY.to_string(), av_string(key));
    item.insert(CONSUMER_GROUP_ATTR.to_string(), av_string(state.consumer_group.clone()));
    item.insert(STREAM_NAME_ATTR.to_string(), av_string(state.stream_name.clone()));
    item.insert(STREAM_CREATED_ON_ATTR.to_string(), av_string(state.stream_created_on.to_rfc3339()));
    item.insert(CONSUMERS_ATTR.to_string(), AttributeValue::M(consumers_to_item(&state.consumers)));
    item.insert(SHARDS_ATTR.to_string(), AttributeValue::M(shards_to_item(&state.shards)));
    item.insert(VERSION_ATTR.to_string(), av_string(state.version.to_string()));
    item
}

fn decode_item(item: &HashMap<String, AttributeValue>) -> Result<Option<StreamState>, Error> {
    Ok(Some(StreamState {
        consumer_group: get_string(item, CONSUMER_GROUP_ATTR)?,
        stream_name: get_string(item, STREAM_NAME_ATTR)?,
        stream_created_on: parse_datetime(&get_string(item, STREAM_CREATED_ON_ATTR)?)?,
        consumers: consumers_from_item(&get_map(item, CONSUMERS_ATTR)?)?,
        shards: shards_from_item(&get_map(item, SHARDS_ATTR)?)?,
        version: parse_version(&get_string(item, VERSION_ATTR)?)?,
    }))
}

/// Maps an `aws-sdk-dynamodb` failure onto the shared error taxonomy.
fn classify<E, R>(err: SdkError<E, R>) -> Error
where
    E: std::error::Error + ClassifyDynamoError + Send + Sync + 'static,
{
    if let SdkError::ServiceError(service_err) = &err {
        let inner = service_err.err();
        if inner.is_conditional_check_failed() {
            return Error::PreconditionFailed {
                key: String::new(),
                source: None,
            };
        }
        if inner.is_throughput_exceeded() || inner.is_throttling() {
            return Error::transient(err);
        }
        if inner.is_resource_not_found() {
            return Error::NotFound(inner.to_string());
        }
    }
    if matches!(err, SdkError::TimeoutError(_) | SdkError::DispatchFailure(_)) {
        return Error::transient(err);
    }
    Error::fatal(err)
}

/// Bridges the per-operation `*Error` kinds DynamoDB generates (each with its
/// own `is_*` accessors) onto one shared classification surface.
trait ClassifyDynamoError {
    fn is_conditional_check_failed(&self) -> bool {
        false
    }
    fn is_throughput_exceeded(&self) -> bool {
        false
    }
    fn is_throttling(&self) -> bool {
        false
    }
    fn is_resource_not_found(&self) -> bool {
        false
    }
}

impl ClassifyDynamoError for aws_sdk_dynamodb::operation::get_item::GetItemError {
    fn is_throughput_exceeded(&self) -> bool {
        self.is_provisioned_throughput_exceeded_exception()
    }
    fn is_resource_not_found(&self) -> bool {
        self.is_resource_not_found_exception()
    }
}

impl ClassifyDynamoError for aws_sdk_dynamodb::operation::put_item::PutItemError {
    fn is_conditional_check_failed(&self) -> bool {
        self.is_conditional_check_failed_exception()
    }
    fn is_throughput_exceeded(&self) -> bool {
        self.is_provisioned_throughput_exceeded_exception()
    }
    fn is_resource_not_found(&self) -> bool {
        self.is_resource_not_found_exception()
    }
}

impl ClassifyDynamoError for aws_sdk_dynamodb::operation::update_item::UpdateItemError {
    fn is_conditional_check_failed(&self) -> bool {
        self.is_conditional_check_failed_exception()
    }
    fn is_throughput_exceeded(&self) -> bool {
        self.is_provisioned_throughput_exceeded_exception()
    }
    fn is_resource_not_found(&self) -> bool {
        self.is_resource_not_found_exception()
    }
}

impl ClassifyDynamoError for aws_sdk_dynamodb::operation::delete_item::DeleteItemError {
    fn is_conditional_check_failed(&self) -> bool {
        self.is_conditional_check_failed_exception()
    }
    fn is_resource_not_found(&self) -> bool {
        self.is_resource_not_found_exception()
    }
}

impl ClassifyDynamoError for aws_sdk_dynamodb::operation::describe_table::DescribeTableError {
    fn is_resource_not_found(&self) -> bool {
        self.is_resource_not_found_exception()
    }
}

impl ClassifyDynamoError for aws_sdk_dynamodb::operation::create_table::CreateTableError {}

impl ClassifyDynamoError for aws_sdk_dynamodb::operation::tag_resource::TagResourceError {
    fn is_resource_not_found(&self) -> bool {
        self.is_resource_not_found_exception()
    }
}

impl ClassifyDynamoError for aws_sdk_dynamodb::operation::list_tags_of_resource::ListTagsOfResourceError {
    fn is_resource_not_found(&self) -> bool {
        self.is_resource_not_found_exception()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_state() -> StreamState {
        let mut state = StreamState::new("group".into(), "stream".into(), Utc::now());
        state.shards.insert(ShardId::from("shardId-0"), ShardRecord::new(None));
        state.consumers.insert(
            ConsumerId::from("consumer-a"),
            ConsumerRecord {
                app_name: "app".into(),
                host: "host".into(),
                pid: 42,
                started_on: Utc::now(),
                heartbeat: Utc::now(),
                is_active: true,
                is_standalone: true,
                shards: Some(HashMap::from([(ShardId::from("shardId-0"), ShardRecord::new(None))])),
            },
        );
        state
    }

    #[test]
    fn encode_then_decode_round_trips_the_document() {
        let state = sample_state();
        let item = encode_item("group#stream", &state);
        let decoded = decode_item(&item).unwrap().unwrap();
        assert_eq!(decoded, state);
    }

    #[test]
    fn encode_then_decode_round_trips_an_empty_document() {
        let state = StreamState::new("group".into(), "stream".into(), Utc::now());
        let item = encode_item("group#stream", &state);
        let decoded = decode_item(&item).unwrap().unwrap();
        assert_eq!(decoded, state);
    }

    #[test]
    fn missing_shards_attribute_is_a_protocol_error() {
        let state = sample_state();
        let mut item = encode_item("group#stream", &state);
        item.remove(SHARDS_ATTR);
        let err = decode_item(&item).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn global_shard_path_targets_the_document_level_shards_map() {
        let path = ShardPath::Global { shard_id: "shardId-0" };
        let (expr, names) = path.expression_parts();
        assert_eq!(expr, "shards.#sid");
        assert_eq!(names, vec![("#sid".to_string(), "shardId-0".to_string())]);
    }

    #[test]
    fn per_consumer_shard_path_nests_under_the_owning_consumer() {
        let path = ShardPath::PerConsumer {
            consumer_id: "consumer-a",
            shard_id: "shardId-0",
        };
        let (expr, names) = path.expression_parts();
        assert_eq!(expr, "consumers.#cid.shards.#sid");
        assert_eq!(
            names,
            vec![("#cid".to_string(), "consumer-a".to_string()), ("#sid".to_string(), "shardId-0".to_string())]
        );
    }
}
