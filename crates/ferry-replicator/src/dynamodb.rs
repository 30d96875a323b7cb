//! DynamoDB source and lease store
//!
//! [`DynamoDbSource`] implements [`SourceStore`] over `aws-sdk-dynamodb`
//! (tables, scans) and `aws-sdk-dynamodbstreams` (shards, records).
//! [`DynamoDbLeaseStore`] keeps shard leases in a DynamoDB table of its own,
//! written with conditional puts on the lease counter.
//!
//! SDK failures are classified before they leave this module:
//! - throughput and request-rate errors become throttled source errors
//! - timeouts, dispatch failures and 5xx codes become retriable source errors
//! - everything else is a fatal source error

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_dynamodb::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_dynamodb::types::{
    AttributeDefinition as SdkAttributeDefinition, AttributeValue, BillingMode, KeySchemaElement,
    KeyType, ReturnConsumedCapacity, ScalarAttributeType, TableDescription, TableStatus,
};
use aws_sdk_dynamodbstreams::types::{OperationType, ShardIteratorType};
use base64::Engine;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::SourceSettings;
use crate::error::{ReplicationError, Result, SchemaConflict};
use crate::lease::{Checkpoint, LeaseStore, ShardLease};
use crate::source::{
    AttrValue, AttributeDefinition, ChangeKind, ChangeRecord, ContinuationToken, IteratorPosition,
    Item, RecordBatch, ScalarType, ScanPage, ScanRequest, SecondaryIndex, SequenceNumber,
    ShardDescriptor, ShardIterator, SourceStore, SourceTableDescription,
};

const THROTTLING_CODES: &[&str] = &[
    "ProvisionedThroughputExceededException",
    "ThrottlingException",
    "RequestLimitExceeded",
    "LimitExceededException",
    "TooManyRequestsException",
];

const TRANSIENT_CODES: &[&str] = &[
    "InternalServerError",
    "InternalFailure",
    "ServiceUnavailable",
    "ExpiredIteratorException",
];

/// Classify an `SdkError` into a typed source error
fn classify<E, R>(operation: &str, err: &SdkError<E, R>) -> ReplicationError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: fmt::Debug,
{
    match err {
        SdkError::ServiceError(service) => {
            let inner = service.err();
            let code = inner.code().unwrap_or("Unknown");
            let message = format!(
                "{} failed: {}: {}",
                operation,
                code,
                inner.message().unwrap_or("no message")
            );
            if THROTTLING_CODES.contains(&code) {
                ReplicationError::throttled(message)
            } else if TRANSIENT_CODES.contains(&code) {
                ReplicationError::source_transient(message)
            } else {
                ReplicationError::source(message)
            }
        }
        SdkError::TimeoutError(_) => {
            ReplicationError::source_transient(format!("{} timed out", operation))
        }
        SdkError::DispatchFailure(e) => {
            ReplicationError::source_transient(format!("{} dispatch failure: {:?}", operation, e))
        }
        SdkError::ResponseError(e) => {
            ReplicationError::source_transient(format!("{} response error: {:?}", operation, e))
        }
        SdkError::ConstructionFailure(e) => {
            ReplicationError::internal(format!("{} construction failure: {:?}", operation, e))
        }
        _ => ReplicationError::source(format!("{} failed: {:?}", operation, err)),
    }
}

/// Item conversion for one SDK crate's `AttributeValue`
macro_rules! attribute_reader {
    ($name:ident, $sdk:ident) => {
        mod $name {
            use super::*;
            use $sdk::types::AttributeValue;

            pub(super) fn value(attr: &AttributeValue) -> Result<AttrValue> {
                Ok(match attr {
                    AttributeValue::S(s) => AttrValue::String(s.clone()),
                    AttributeValue::N(n) => AttrValue::Number(n.clone()),
                    AttributeValue::B(b) => AttrValue::Binary(b.as_ref().to_vec()),
                    AttributeValue::Bool(b) => AttrValue::Bool(*b),
                    AttributeValue::Null(_) => AttrValue::Null,
                    AttributeValue::L(items) => {
                        AttrValue::List(items.iter().map(value).collect::<Result<_>>()?)
                    }
                    AttributeValue::M(map) => AttrValue::Map(item(map)?),
                    AttributeValue::Ss(set) => AttrValue::StringSet(set.clone()),
                    AttributeValue::Ns(set) => AttrValue::NumberSet(set.clone()),
                    AttributeValue::Bs(set) => {
                        AttrValue::BinarySet(set.iter().map(|b| b.as_ref().to_vec()).collect())
                    }
                    other => {
                        return Err(ReplicationError::source(format!(
                            "unsupported attribute value {:?}",
                            other
                        )))
                    }
                })
            }

            pub(super) fn item(map: &HashMap<String, AttributeValue>) -> Result<Item> {
                map.iter()
                    .map(|(k, v)| value(v).map(|v| (k.clone(), v)))
                    .collect()
            }
        }
    };
}

attribute_reader!(table_attrs, aws_sdk_dynamodb);
attribute_reader!(stream_attrs, aws_sdk_dynamodbstreams);

fn to_sdk(value: &AttrValue) -> AttributeValue {
    use aws_sdk_dynamodb::primitives::Blob;
    match value {
        AttrValue::String(s) => AttributeValue::S(s.clone()),
        AttrValue::Number(n) => AttributeValue::N(n.clone()),
        AttrValue::Binary(b) => AttributeValue::B(Blob::new(b.clone())),
        AttrValue::Bool(b) => AttributeValue::Bool(*b),
        AttrValue::Null => AttributeValue::Null(true),
        AttrValue::List(items) => AttributeValue::L(items.iter().map(to_sdk).collect()),
        AttrValue::Map(map) => AttributeValue::M(item_to_sdk(map)),
        AttrValue::StringSet(set) => AttributeValue::Ss(set.clone()),
        AttrValue::NumberSet(set) => AttributeValue::Ns(set.clone()),
        AttrValue::BinarySet(set) => {
            AttributeValue::Bs(set.iter().map(|b| Blob::new(b.clone())).collect())
        }
    }
}

fn item_to_sdk(item: &Item) -> HashMap<String, AttributeValue> {
    item.iter().map(|(k, v)| (k.clone(), to_sdk(v))).collect()
}

/// Exclusive start keys travel as base64 JSON so progress files can hold them
fn encode_token(key: &HashMap<String, AttributeValue>) -> Result<ContinuationToken> {
    let item = table_attrs::item(key)?;
    let json = serde_json::to_vec(&item)?;
    Ok(ContinuationToken(
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(json),
    ))
}

fn decode_token(token: &ContinuationToken) -> Result<HashMap<String, AttributeValue>> {
    let json = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(token.0.as_bytes())
        .map_err(|e| ReplicationError::internal(format!("corrupt continuation token: {}", e)))?;
    let item: Item = serde_json::from_slice(&json)?;
    Ok(item_to_sdk(&item))
}

fn scalar_type(t: &ScalarAttributeType) -> Result<ScalarType> {
    match t {
        ScalarAttributeType::S => Ok(ScalarType::String),
        ScalarAttributeType::N => Ok(ScalarType::Number),
        ScalarAttributeType::B => Ok(ScalarType::Binary),
        other => Err(ReplicationError::source(format!(
            "unsupported key attribute type {:?}",
            other
        ))),
    }
}

fn key_names(schema: &[KeySchemaElement]) -> (Option<String>, Option<String>) {
    let find = |kind: KeyType| {
        schema
            .iter()
            .find(|k| *k.key_type() == kind)
            .map(|k| k.attribute_name().to_string())
    };
    (find(KeyType::Hash), find(KeyType::Range))
}

fn describe(table: &TableDescription) -> Result<SourceTableDescription> {
    let name = table.table_name().unwrap_or_default().to_string();
    let mut types = BTreeMap::new();
    for def in table.attribute_definitions() {
        types.insert(
            def.attribute_name().to_string(),
            scalar_type(def.attribute_type())?,
        );
    }
    let definition = |attr: &str| -> Result<AttributeDefinition> {
        let scalar = types.get(attr).copied().ok_or_else(|| {
            ReplicationError::source(format!("{}: key attribute {} has no type", name, attr))
        })?;
        Ok(AttributeDefinition::new(attr, scalar))
    };

    let (partition, sort) = key_names(table.key_schema());
    let partition = partition
        .ok_or_else(|| ReplicationError::source(format!("{}: no partition key", name)))?;
    let mut description = SourceTableDescription::new(name.clone(), definition(&partition)?);
    if let Some(sort) = &sort {
        description = description.with_sort_key(definition(sort)?);
    }
    for (attr, scalar) in &types {
        if *attr != partition && Some(attr) != sort.as_ref() {
            description = description.with_attribute(AttributeDefinition::new(attr.clone(), *scalar));
        }
    }

    let global = table
        .global_secondary_indexes()
        .iter()
        .map(|i| (i.index_name(), i.key_schema()));
    let local = table
        .local_secondary_indexes()
        .iter()
        .map(|i| (i.index_name(), i.key_schema()));
    for (index_name, schema) in global.chain(local) {
        let (Some(index_name), (Some(partition_key), sort_key)) = (index_name, key_names(schema))
        else {
            continue;
        };
        description = description.with_index(SecondaryIndex {
            name: index_name.to_string(),
            partition_key,
            sort_key,
        });
    }

    if let Some(arn) = table.latest_stream_arn() {
        description = description.with_stream(arn);
    }
    description.item_count = table.item_count().and_then(|n| u64::try_from(n).ok());
    Ok(description)
}

/// Source store backed by DynamoDB and DynamoDB Streams
#[derive(Clone)]
pub struct DynamoDbSource {
    client: aws_sdk_dynamodb::Client,
    streams: aws_sdk_dynamodbstreams::Client,
}

impl DynamoDbSource {
    /// Build clients from the default provider chain plus `settings`
    pub async fn connect(settings: &SourceSettings) -> Result<Self> {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = &settings.region {
            loader = loader.region(aws_config::Region::new(region.clone()));
        }
        if let Some(endpoint) = &settings.endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        if let (Some(access_key), Some(secret_key)) =
            (&settings.access_key_id, &settings.secret_access_key)
        {
            let creds = aws_sdk_dynamodb::config::Credentials::new(
                access_key, secret_key, None, None, "ferry",
            );
            loader = loader.credentials_provider(creds);
        }
        let sdk_config = loader.load().await;
        debug!(
            region = ?sdk_config.region(),
            endpoint = ?settings.endpoint,
            "Created DynamoDB clients"
        );

        Ok(Self::from_clients(
            aws_sdk_dynamodb::Client::new(&sdk_config),
            aws_sdk_dynamodbstreams::Client::new(&sdk_config),
        ))
    }

    /// Wrap existing clients
    pub fn from_clients(
        client: aws_sdk_dynamodb::Client,
        streams: aws_sdk_dynamodbstreams::Client,
    ) -> Self {
        Self { client, streams }
    }

    /// Table client, shared with [`DynamoDbLeaseStore`]
    pub fn client(&self) -> &aws_sdk_dynamodb::Client {
        &self.client
    }
}

impl fmt::Debug for DynamoDbSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynamoDbSource").finish_non_exhaustive()
    }
}

#[async_trait]
impl SourceStore for DynamoDbSource {
    async fn list_tables(&self) -> Result<Vec<String>> {
        let mut tables = Vec::new();
        let mut start: Option<String> = None;
        loop {
            let out = self
                .client
                .list_tables()
                .set_exclusive_start_table_name(start.take())
                .send()
                .await
                .map_err(|e| classify("ListTables", &e))?;
            tables.extend(out.table_names().iter().cloned());
            match out.last_evaluated_table_name() {
                Some(last) => start = Some(last.to_string()),
                None => break,
            }
        }
        Ok(tables)
    }

    async fn describe_table(&self, table: &str) -> Result<SourceTableDescription> {
        let out = self
            .client
            .describe_table()
            .table_name(table)
            .send()
            .await
            .map_err(|e| {
                if e
                    .as_service_error()
                    .is_some_and(|s| s.is_resource_not_found_exception())
                {
                    SchemaConflict::TableMissing {
                        table: table.to_string(),
                    }
                    .into()
                } else {
                    classify("DescribeTable", &e)
                }
            })?;
        let description = out.table().ok_or_else(|| {
            ReplicationError::source(format!("DescribeTable returned no table for {}", table))
        })?;
        describe(description)
    }

    async fn scan(&self, request: ScanRequest) -> Result<ScanPage> {
        let start = request.start.as_ref().map(decode_token).transpose()?;
        let out = self
            .client
            .scan()
            .table_name(&request.table)
            .segment(request.segment as i32)
            .total_segments(request.total_segments as i32)
            .set_exclusive_start_key(start)
            .set_limit(request.limit.map(|l| l as i32))
            .consistent_read(true)
            .return_consumed_capacity(ReturnConsumedCapacity::Total)
            .send()
            .await
            .map_err(|e| classify("Scan", &e))?;

        let items = out
            .items()
            .iter()
            .map(table_attrs::item)
            .collect::<Result<Vec<_>>>()?;
        let next = out.last_evaluated_key().map(encode_token).transpose()?;
        let consumed_units = out
            .consumed_capacity()
            .and_then(|c| c.capacity_units())
            .unwrap_or(items.len() as f64);

        Ok(ScanPage {
            items,
            next,
            consumed_units,
        })
    }

    async fn list_shards(&self, stream_id: &str) -> Result<Vec<ShardDescriptor>> {
        let mut shards = Vec::new();
        let mut start: Option<String> = None;
        loop {
            let out = self
                .streams
                .describe_stream()
                .stream_arn(stream_id)
                .set_exclusive_start_shard_id(start.take())
                .send()
                .await
                .map_err(|e| classify("DescribeStream", &e))?;
            let Some(description) = out.stream_description() else {
                break;
            };
            for shard in description.shards() {
                let Some(id) = shard.shard_id() else {
                    continue;
                };
                let range = shard.sequence_number_range();
                shards.push(ShardDescriptor {
                    shard_id: id.to_string(),
                    parent_shard_id: shard.parent_shard_id().map(str::to_string),
                    starting_sequence: range
                        .and_then(|r| r.starting_sequence_number())
                        .map(SequenceNumber::new),
                    ending_sequence: range
                        .and_then(|r| r.ending_sequence_number())
                        .map(SequenceNumber::new),
                });
            }
            match description.last_evaluated_shard_id() {
                Some(last) => start = Some(last.to_string()),
                None => break,
            }
        }
        Ok(shards)
    }

    async fn shard_iterator(
        &self,
        stream_id: &str,
        shard_id: &str,
        position: IteratorPosition,
    ) -> Result<ShardIterator> {
        let (kind, sequence) = match position {
            IteratorPosition::TrimHorizon => (ShardIteratorType::TrimHorizon, None),
            IteratorPosition::AtSequence(seq) => (ShardIteratorType::AtSequenceNumber, Some(seq.0)),
            IteratorPosition::AfterSequence(seq) => {
                (ShardIteratorType::AfterSequenceNumber, Some(seq.0))
            }
        };
        let out = self
            .streams
            .get_shard_iterator()
            .stream_arn(stream_id)
            .shard_id(shard_id)
            .shard_iterator_type(kind)
            .set_sequence_number(sequence)
            .send()
            .await
            .map_err(|e| classify("GetShardIterator", &e))?;
        out.shard_iterator()
            .map(|s| ShardIterator(s.to_string()))
            .ok_or_else(|| {
                ReplicationError::source(format!("shard {} returned no iterator", shard_id))
            })
    }

    async fn get_records(&self, iterator: &ShardIterator, limit: u32) -> Result<RecordBatch> {
        let out = self
            .streams
            .get_records()
            .shard_iterator(&iterator.0)
            .limit(limit.min(1000) as i32)
            .send()
            .await
            .map_err(|e| classify("GetRecords", &e))?;

        let mut records = Vec::with_capacity(out.records().len());
        for record in out.records() {
            let kind = match record.event_name() {
                Some(OperationType::Insert) => ChangeKind::Insert,
                Some(OperationType::Modify) => ChangeKind::Modify,
                Some(OperationType::Remove) => ChangeKind::Remove,
                other => {
                    return Err(ReplicationError::source(format!(
                        "unsupported stream event {:?}",
                        other
                    )))
                }
            };
            let Some(change) = record.dynamodb() else {
                continue;
            };
            let sequence = change.sequence_number().ok_or_else(|| {
                ReplicationError::source("stream record without sequence number")
            })?;
            records.push(ChangeRecord {
                kind,
                keys: change
                    .keys()
                    .map(stream_attrs::item)
                    .transpose()?
                    .unwrap_or_default(),
                new_image: change.new_image().map(stream_attrs::item).transpose()?,
                sequence: SequenceNumber::new(sequence),
            });
        }

        Ok(RecordBatch {
            records,
            next_iterator: out
                .next_shard_iterator()
                .map(|s| ShardIterator(s.to_string())),
        })
    }
}

const LEASE_KEY: &str = "shard_id";
const SHARD_END: &str = "SHARD_END";

fn lease_to_item(lease: &ShardLease) -> HashMap<String, AttributeValue> {
    let mut item = HashMap::new();
    item.insert(LEASE_KEY.to_string(), AttributeValue::S(lease.shard_id.clone()));
    if let Some(owner) = &lease.owner {
        item.insert("owner".to_string(), AttributeValue::S(owner.clone()));
    }
    match &lease.checkpoint {
        Some(Checkpoint::Sequence(seq)) => {
            item.insert("checkpoint".to_string(), AttributeValue::S(seq.0.clone()));
        }
        Some(Checkpoint::ShardEnd) => {
            item.insert("checkpoint".to_string(), AttributeValue::S(SHARD_END.to_string()));
        }
        None => {}
    }
    item.insert("finished".to_string(), AttributeValue::Bool(lease.finished));
    item.insert(
        "expires_at".to_string(),
        AttributeValue::N(lease.expires_at.timestamp_millis().to_string()),
    );
    item.insert(
        "counter".to_string(),
        AttributeValue::N(lease.counter.to_string()),
    );
    item
}

fn lease_from_item(item: &HashMap<String, AttributeValue>) -> Result<ShardLease> {
    let text = |name: &str| item.get(name).and_then(|v| v.as_s().ok()).cloned();
    let number = |name: &str| -> Result<i64> {
        item.get(name)
            .and_then(|v| v.as_n().ok())
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| ReplicationError::lease(format!("lease item without {}", name)))
    };

    let shard_id = text(LEASE_KEY).ok_or_else(|| ReplicationError::lease("lease item without shard_id"))?;
    let checkpoint = text("checkpoint").map(|c| {
        if c == SHARD_END {
            Checkpoint::ShardEnd
        } else {
            Checkpoint::Sequence(SequenceNumber::new(c))
        }
    });
    let expires_at = DateTime::<Utc>::from_timestamp_millis(number("expires_at")?)
        .ok_or_else(|| ReplicationError::lease("lease expiry out of range"))?;
    let counter = u64::try_from(number("counter")?)
        .map_err(|_| ReplicationError::lease("negative lease counter"))?;

    Ok(ShardLease {
        shard_id,
        owner: text("owner"),
        checkpoint,
        finished: item
            .get("finished")
            .and_then(|v| v.as_bool().ok())
            .copied()
            .unwrap_or(false),
        expires_at,
        counter,
    })
}

/// Leases stored in a DynamoDB table keyed on `shard_id`
#[derive(Clone)]
pub struct DynamoDbLeaseStore {
    client: aws_sdk_dynamodb::Client,
    table: String,
}

impl DynamoDbLeaseStore {
    /// Store leases in `table`
    pub fn new(client: aws_sdk_dynamodb::Client, table: impl Into<String>) -> Self {
        Self {
            client,
            table: table.into(),
        }
    }

    /// Lease table name
    pub fn table(&self) -> &str {
        &self.table
    }

    async fn table_status(&self) -> Result<Option<TableStatus>> {
        match self.client.describe_table().table_name(&self.table).send().await {
            Ok(out) => Ok(out.table().and_then(|t| t.table_status()).cloned()),
            Err(e)
                if e
                    .as_service_error()
                    .is_some_and(|s| s.is_resource_not_found_exception()) =>
            {
                Ok(None)
            }
            Err(e) => Err(classify("DescribeTable", &e)),
        }
    }
}

impl fmt::Debug for DynamoDbLeaseStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynamoDbLeaseStore")
            .field("table", &self.table)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl LeaseStore for DynamoDbLeaseStore {
    async fn ensure_table(&self) -> Result<()> {
        if self.table_status().await?.is_none() {
            let attribute = SdkAttributeDefinition::builder()
                .attribute_name(LEASE_KEY)
                .attribute_type(ScalarAttributeType::S)
                .build()
                .map_err(|e| ReplicationError::internal(e.to_string()))?;
            let key = KeySchemaElement::builder()
                .attribute_name(LEASE_KEY)
                .key_type(KeyType::Hash)
                .build()
                .map_err(|e| ReplicationError::internal(e.to_string()))?;
            let created = self
                .client
                .create_table()
                .table_name(&self.table)
                .attribute_definitions(attribute)
                .key_schema(key)
                .billing_mode(BillingMode::PayPerRequest)
                .send()
                .await;
            match created {
                Ok(_) => info!(table = %self.table, "Created lease table"),
                // another worker created it first
                Err(e)
                    if e
                        .as_service_error()
                        .is_some_and(|s| s.is_resource_in_use_exception()) => {}
                Err(e) => return Err(classify("CreateTable", &e)),
            }
        }

        for _ in 0..120 {
            if let Some(TableStatus::Active) = self.table_status().await? {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        Err(ReplicationError::lease(format!(
            "lease table {} did not become active",
            self.table
        )))
    }

    async fn get(&self, shard_id: &str) -> Result<Option<ShardLease>> {
        let out = self
            .client
            .get_item()
            .table_name(&self.table)
            .key(LEASE_KEY, AttributeValue::S(shard_id.to_string()))
            .consistent_read(true)
            .send()
            .await
            .map_err(|e| classify("GetItem", &e))?;
        out.item().map(lease_from_item).transpose()
    }

    async fn list(&self) -> Result<Vec<ShardLease>> {
        let mut leases = Vec::new();
        let mut start = None;
        loop {
            let out = self
                .client
                .scan()
                .table_name(&self.table)
                .consistent_read(true)
                .set_exclusive_start_key(start.take())
                .send()
                .await
                .map_err(|e| classify("Scan", &e))?;
            for item in out.items() {
                leases.push(lease_from_item(item)?);
            }
            match out.last_evaluated_key() {
                Some(key) => start = Some(key.clone()),
                None => break,
            }
        }
        Ok(leases)
    }

    async fn compare_and_set(
        &self,
        expected_counter: Option<u64>,
        lease: ShardLease,
    ) -> Result<bool> {
        let mut put = self
            .client
            .put_item()
            .table_name(&self.table)
            .set_item(Some(lease_to_item(&lease)));
        put = match expected_counter {
            None => put.condition_expression("attribute_not_exists(shard_id)"),
            Some(counter) => put
                .condition_expression("#counter = :expected")
                .expression_attribute_names("#counter", "counter")
                .expression_attribute_values(":expected", AttributeValue::N(counter.to_string())),
        };

        match put.send().await {
            Ok(_) => Ok(true),
            Err(e)
                if e
                    .as_service_error()
                    .is_some_and(|s| s.is_conditional_check_failed_exception()) =>
            {
                debug!(table = %self.table, shard = %lease.shard_id, "Lease write lost a race");
                Ok(false)
            }
            Err(e) => Err(classify("PutItem", &e)),
        }
    }
}
