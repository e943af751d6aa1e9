//! A typed wrapper over the stream service's data and control plane: one
//! method per RPC, a shared error-classification function, and pagination
//! handled inside the wrapper so callers never see a continuation token.

use aws_sdk_kinesis::error::SdkError;
use aws_sdk_kinesis::types::ShardIteratorType;
use aws_sdk_kinesis::Client as KinesisClient;
use chrono::{DateTime, Utc};
use kcl_types::{Error, SequenceNumber, ShardId};

/// Where a shard iterator should begin reading.
#[derive(Debug, Clone)]
pub enum IteratorStart {
    Latest,
    TrimHorizon,
    AtSequenceNumber(SequenceNumber),
    AfterSequenceNumber(SequenceNumber),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardDescriptor {
    pub shard_id: ShardId,
    /// Single parent per the lineage model: a merge's two source shards
    /// both report the same child shard id with the *other* parent
    /// recorded as `adjacent_parent_shard_id` upstream, but this system
    /// only tracks the side the service reports as the primary parent.
    pub parent_shard_id: Option<ShardId>,
    /// Seeds a depleted parent's children: the sequence number a fresh
    /// iterator on this shard starts from when no checkpoint exists yet.
    pub starting_sequence_number: SequenceNumber,
}

#[derive(Debug, Clone)]
pub struct StreamSummary {
    pub stream_name: String,
    pub stream_arn: String,
    pub shard_count: Option<i32>,
    pub retention_period_hours: i32,
    pub stream_status: String,
    /// When the upstream stream itself was created. Used to detect that a
    /// stream was deleted and recreated under the same name, which must
    /// invalidate any coordination document seeded against the old stream.
    pub stream_creation_timestamp: DateTime<Utc>,
}

fn to_chrono(ts: &aws_smithy_types::DateTime) -> Result<DateTime<Utc>, Error> {
    DateTime::from_timestamp(ts.secs(), ts.subsec_nanos())
        .ok_or(Error::Protocol("stream creation timestamp out of range"))
}

#[derive(Debug, Clone)]
pub struct RecordBatch {
    pub records: Vec<Record>,
    pub next_shard_iterator: Option<String>,
    pub millis_behind_latest: i64,
}

#[derive(Debug, Clone)]
pub struct Record {
    pub sequence_number: SequenceNumber,
    pub partition_key: String,
    pub data: Vec<u8>,
}

#[derive(Clone)]
pub struct StreamClient {
    client: KinesisClient,
    stream_name: String,
}

impl StreamClient {
    pub fn new(client: KinesisClient, stream_name: impl Into<String>) -> Self {
        StreamClient {
            client,
            stream_name: stream_name.into(),
        }
    }

    /// Prefers `describe_stream_summary`; falls back to the heavier
    /// `describe_stream` call for service endpoints that predate it.
    pub async fn describe_stream_summary(&self) -> Result<StreamSummary, Error> {
        match self
            .client
            .describe_stream_summary()
            .stream_name(&self.stream_name)
            .send()
            .await
        {
            Ok(resp) => {
                let desc = resp
                    .stream_description_summary
                    .ok_or(Error::Protocol("describe_stream_summary response missing description"))?;
                let stream_creation_timestamp = desc
                    .stream_creation_timestamp
                    .as_ref()
                    .ok_or(Error::Protocol("describe_stream_summary response missing creation timestamp"))
                    .and_then(to_chrono)?;
                Ok(StreamSummary {
                    stream_name: desc.stream_name,
                    stream_arn: desc.stream_arn,
                    shard_count: desc.open_shard_count,
                    retention_period_hours: desc.retention_period_hours.unwrap_or(24),
                    stream_status: desc.stream_status.as_str().to_string(),
                    stream_creation_timestamp,
                })
            }
            Err(SdkError::ServiceError(e)) if e.err().is_unknown_operation_exception() => {
                self.describe_stream_full().await
            }
            Err(err) => Err(classify(err)),
        }
    }

    async fn describe_stream_full(&self) -> Result<StreamSummary, Error> {
        let resp = self
            .client
            .describe_stream()
            .stream_name(&self.stream_name)
            .send()
            .await
            .map_err(classify)?;
        let desc = resp
            .stream_description
            .ok_or(Error::Protocol("describe_stream response missing description"))?;
        let stream_creation_timestamp = desc
            .stream_creation_timestamp
            .as_ref()
            .ok_or(Error::Protocol("describe_stream response missing creation timestamp"))
            .and_then(to_chrono)?;
        Ok(StreamSummary {
            stream_name: desc.stream_name,
            stream_arn: desc.stream_arn,
            shard_count: Some(desc.shards.len() as i32),
            retention_period_hours: desc.retention_period_hours,
            stream_status: desc.stream_status.as_str().to_string(),
            stream_creation_timestamp,
        })
    }

    /// Lists every shard, following continuation tokens internally.
    pub async fn list_shards(&self) -> Result<Vec<ShardDescriptor>, Error> {
        let mut out = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            let mut req = self.client.list_shards();
            req = match &next_token {
                Some(token) => req.next_token(token),
                None => req.stream_name(&self.stream_name),
            };
            let resp = req.send().await.map_err(classify)?;

            for shard in resp.shards.unwrap_or_default() {
                let starting_sequence_number = shard
                    .sequence_number_range
                    .map(|r| SequenceNumber::from(r.starting_sequence_number))
                    .ok_or(Error::Protocol("shard missing sequence_number_range"))?;
                out.push(ShardDescriptor {
                    shard_id: ShardId::from(shard.shard_id),
                    parent_shard_id: shard.parent_shard_id.map(ShardId::from),
                    starting_sequence_number,
                });
            }

            next_token = resp.next_token;
            if next_token.is_none() {
                break;
            }
        }
        Ok(out)
    }

    pub async fn get_shard_iterator(&self, shard_id: &ShardId, start: IteratorStart) -> Result<String, Error> {
        let mut req = self
            .client
            .get_shard_iterator()
            .stream_name(&self.stream_name)
            .shard_id(shard_id.to_string());

        req = match start {
            IteratorStart::Latest => req.shard_iterator_type(ShardIteratorType::Latest),
            IteratorStart::TrimHorizon => req.shard_iterator_type(ShardIteratorType::TrimHorizon),
            IteratorStart::AtSequenceNumber(seq) => req
                .shard_iterator_type(ShardIteratorType::AtSequenceNumber)
                .starting_sequence_number(seq.to_string()),
            IteratorStart::AfterSequenceNumber(seq) => req
                .shard_iterator_type(ShardIteratorType::AfterSequenceNumber)
                .starting_sequence_number(seq.to_string()),
        };

        let resp = req.send().await.map_err(classify)?;
        resp.shard_iterator
            .ok_or(Error::Protocol("get_shard_iterator response missing iterator"))
    }

    pub async fn get_records(&self, iterator: &str, limit: i32) -> Result<RecordBatch, Error> {
        let resp = self
            .client
            .get_records()
            .shard_iterator(iterator)
            .limit(limit)
            .send()
            .await
            .map_err(classify)?;

        let records = resp
            .records
            .into_iter()
            .map(|r| Record {
                sequence_number: SequenceNumber::from(r.sequence_number),
                partition_key: r.partition_key,
                data: r.data.into_inner(),
            })
            .collect();

        Ok(RecordBatch {
            records,
            next_shard_iterator: resp.next_shard_iterator,
            millis_behind_latest: resp.millis_behind_latest.unwrap_or(0),
        })
    }

    pub async fn register_stream_consumer(&self, stream_arn: &str, consumer_name: &str) -> Result<String, Error> {
        let resp = self
            .client
            .register_stream_consumer()
            .stream_arn(stream_arn)
            .consumer_name(consumer_name)
            .send()
            .await
            .map_err(classify)?;
        resp.consumer
            .and_then(|c| c.consumer_arn)
            .ok_or(Error::Protocol("register_stream_consumer response missing ARN"))
    }

    pub async fn deregister_stream_consumer(&self, consumer_arn: &str) -> Result<(), Error> {
        self.client
            .deregister_stream_consumer()
            .consumer_arn(consumer_arn)
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    /// Idempotent: a racing creator's `ResourceInUseException` is swallowed.
    pub async fn create_stream_if_absent(&self, shard_count: i32) -> Result<(), Error> {
        match self
            .client
            .create_stream()
            .stream_name(&self.stream_name)
            .shard_count(shard_count)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(SdkError::ServiceError(e)) if e.err().is_resource_in_use() => Ok(()),
            Err(err) => Err(classify(err)),
        }
    }

    pub async fn add_tags(&self, tags: std::collections::HashMap<String, String>) -> Result<(), Error> {
        if tags.is_empty() {
            return Ok(());
        }
        self.client
            .add_tags_to_stream()
            .stream_name(&self.stream_name)
            .set_tags(Some(tags))
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    /// Missing tags map to an empty result rather than an error.
    pub async fn list_tags(&self) -> Result<std::collections::HashMap<String, String>, Error> {
        let resp = self
            .client
            .list_tags_for_stream()
            .stream_name(&self.stream_name)
            .send()
            .await
            .map_err(classify)?;
        Ok(resp.tags.into_iter().map(|t| (t.key, t.value.unwrap_or_default())).collect())
    }

    /// Tolerates a racing encryption-enable call, matching
    /// `create_stream_if_absent`.
    pub async fn start_stream_encryption(&self, key_id: &str) -> Result<(), Error> {
        match self
            .client
            .start_stream_encryption()
            .stream_name(&self.stream_name)
            .encryption_type(aws_sdk_kinesis::types::EncryptionType::Kms)
            .key_id(key_id)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(SdkError::ServiceError(e)) if e.err().is_resource_in_use() => Ok(()),
            Err(err) => Err(classify(err)),
        }
    }
}

fn classify<E, R>(err: SdkError<E, R>) -> Error
where
    E: std::error::Error + ClassifyKinesisError + Send + Sync + 'static,
{
    if let SdkError::ServiceError(service_err) = &err {
        let inner = service_err.err();
        if inner.is_provisioned_throughput_exceeded() || inner.is_limit_exceeded() {
            return Error::transient(err);
        }
        if inner.is_expired_iterator() {
            // Not transient under this crate's retry policy: the Polling
            // Consumer must re-acquire an iterator, not merely re-issue the
            // same `get_records` call.
            return Error::expired_iterator(err);
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

trait ClassifyKinesisError {
    fn is_provisioned_throughput_exceeded(&self) -> bool {
        false
    }
    fn is_limit_exceeded(&self) -> bool {
        false
    }
    fn is_expired_iterator(&self) -> bool {
        false
    }
    fn is_resource_not_found(&self) -> bool {
        false
    }
    fn is_unknown_operation_exception(&self) -> bool {
        false
    }
    fn is_resource_in_use(&self) -> bool {
        false
    }
}

impl ClassifyKinesisError for aws_sdk_kinesis::operation::describe_stream_summary::DescribeStreamSummaryError {
    fn is_resource_not_found(&self) -> bool {
        self.is_resource_not_found_exception()
    }
    fn is_unknown_operation_exception(&self) -> bool {
        matches!(self, Self::Unhandled(_))
    }
}

impl ClassifyKinesisError for aws_sdk_kinesis::operation::describe_stream::DescribeStreamError {
    fn is_resource_not_found(&self) -> bool {
        self.is_resource_not_found_exception()
    }
}

impl ClassifyKinesisError for aws_sdk_kinesis::operation::list_shards::ListShardsError {
    fn is_limit_exceeded(&self) -> bool {
        self.is_limit_exceeded_exception()
    }
    fn is_resource_not_found(&self) -> bool {
        self.is_resource_not_found_exception()
    }
}

impl ClassifyKinesisError for aws_sdk_kinesis::operation::get_shard_iterator::GetShardIteratorError {
    fn is_provisioned_throughput_exceeded(&self) -> bool {
        self.is_provisioned_throughput_exceeded_exception()
    }
    fn is_resource_not_found(&self) -> bool {
        self.is_resource_not_found_exception()
    }
}

impl ClassifyKinesisError for aws_sdk_kinesis::operation::get_records::GetRecordsError {
    fn is_provisioned_throughput_exceeded(&self) -> bool {
        self.is_provisioned_throughput_exceeded_exception()
    }
    fn is_expired_iterator(&self) -> bool {
        self.is_expired_iterator_exception()
    }
    fn is_resource_not_found(&self) -> bool {
        self.is_resource_not_found_exception()
    }
}

impl ClassifyKinesisError for aws_sdk_kinesis::operation::register_stream_consumer::RegisterStreamConsumerError {
    fn is_limit_exceeded(&self) -> bool {
        self.is_limit_exceeded_exception()
    }
}

impl ClassifyKinesisError for aws_sdk_kinesis::operation::deregister_stream_consumer::DeregisterStreamConsumerError {
    fn is_resource_not_found(&self) -> bool {
        self.is_resource_not_found_exception()
    }
}

impl ClassifyKinesisError for aws_sdk_kinesis::operation::create_stream::CreateStreamError {
    fn is_limit_exceeded(&self) -> bool {
        self.is_limit_exceeded_exception()
    }
    fn is_resource_in_use(&self) -> bool {
        self.is_resource_in_use_exception()
    }
}

impl ClassifyKinesisError for aws_sdk_kinesis::operation::add_tags_to_stream::AddTagsToStreamError {
    fn is_resource_not_found(&self) -> bool {
        self.is_resource_not_found_exception()
    }
}

impl ClassifyKinesisError for aws_sdk_kinesis::operation::list_tags_for_stream::ListTagsForStreamError {
    fn is_resource_not_found(&self) -> bool {
        self.is_resource_not_found_exception()
    }
}

impl ClassifyKinesisError for aws_sdk_kinesis::operation::start_stream_encryption::StartStreamEncryptionError {
    fn is_resource_not_found(&self) -> bool {
        self.is_resource_not_found_exception()
    }
    fn is_resource_in_use(&self) -> bool {
        self.is_resource_in_use_exception()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_descriptor_carries_single_parent() {
        let root = ShardDescriptor {
            shard_id: ShardId::from("shardId-000000000000"),
            parent_shard_id: None,
            starting_sequence_number: SequenceNumber::from("0".to_string()),
        };
        let child = ShardDescriptor {
            shard_id: ShardId::from("shardId-000000000001"),
            parent_shard_id: Some(ShardId::from("shardId-000000000000")),
            starting_sequence_number: SequenceNumber::from("100".to_string()),
        };
        assert!(root.parent_shard_id.is_none());
        assert_eq!(child.parent_shard_id, Some(ShardId::from("shardId-000000000000")));
    }
}
