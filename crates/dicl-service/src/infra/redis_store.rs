//! Redis example store
//!
//! Each partition maps to two keys under the configured prefix:
//! `<prefix>:partition:<hash>:dim` holds the fixed embedding dimension and
//! `<prefix>:partition:<hash>:examples` is a hash of example id to JSON record.
//! `<prefix>:owners` maps every id to the partition holding it, so an id is
//! never stored under two partitions.
//! Batches are applied by a single server-side script, so either every record
//! lands or none does. Ranking happens client-side with the pinned metric.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use redis::{aio::MultiplexedConnection, AsyncCommands, Client, Script};
use tokio::sync::RwLock;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use dicl_common::{DiclError, DistanceMetric, ExampleId, Result};

use crate::domain::example::{Example, PartitionKey, ScoredExample, SearchQuery};
use crate::infra::example_store::{check_query, rank, validate_batch, ExampleStore, PartitionStats};

/// Check every partition's dimension and every id's owner, then write.
///
/// KEYS: owners, dim_1, examples_1, dim_2, examples_2, ...
/// ARGV: per partition `dimension, count, id_1, json_1, ..., id_n, json_n`
const UPSERT_SCRIPT: &str = r#"
local owners = KEYS[1]
local pos = 1
for i = 2, #KEYS, 2 do
  local dim = ARGV[pos]
  local existing = redis.call('GET', KEYS[i])
  if existing and existing ~= dim then
    return redis.error_reply('DIMENSION ' .. existing .. ' ' .. dim)
  end
  local n = tonumber(ARGV[pos + 1])
  for j = 0, n - 1 do
    local id = ARGV[pos + 2 + 2 * j]
    local owner = redis.call('HGET', owners, id)
    if owner and owner ~= KEYS[i + 1] then
      return redis.error_reply('OWNER ' .. id)
    end
  end
  pos = pos + 2 + 2 * n
end
local inserted = 0
pos = 1
for i = 2, #KEYS, 2 do
  local n = tonumber(ARGV[pos + 1])
  redis.call('SET', KEYS[i], ARGV[pos])
  for j = 0, n - 1 do
    local id = ARGV[pos + 2 + 2 * j]
    redis.call('HSET', owners, id, KEYS[i + 1])
    inserted = inserted + redis.call('HSET', KEYS[i + 1], id, ARGV[pos + 3 + 2 * j])
  end
  pos = pos + 2 + 2 * n
end
return inserted
"#;

/// Redis-backed example store
pub struct RedisExampleStore {
    client: Client,
    connection: Arc<RwLock<Option<MultiplexedConnection>>>,
    prefix: String,
    metric: DistanceMetric,
    script: Script,
}

impl RedisExampleStore {
    /// Connect to redis
    pub async fn new(redis_url: &str, metric: DistanceMetric) -> Result<Self> {
        let client = Client::open(redis_url)
            .map_err(|e| DiclError::Config(format!("Failed to create Redis client: {}", e)))?;

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| DiclError::Retrieval(format!("Failed to connect to Redis: {}", e)))?;

        Ok(Self {
            client,
            connection: Arc::new(RwLock::new(Some(connection))),
            prefix: "dicl".to_string(),
            metric,
            script: Script::new(UPSERT_SCRIPT),
        })
    }

    /// Use a custom key prefix
    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.prefix = prefix.to_string();
        self
    }

    fn partition_key(&self, partition: &PartitionKey) -> String {
        let hash = blake3::hash(
            format!(
                "{}\u{0}{}\u{0}{}",
                partition.function_name, partition.variant_name, partition.namespace
            )
            .as_bytes(),
        );
        format!("{}:partition:{}", self.prefix, hash.to_hex())
    }

    fn dimension_key(&self, partition: &PartitionKey) -> String {
        format!("{}:dim", self.partition_key(partition))
    }

    fn examples_key(&self, partition: &PartitionKey) -> String {
        format!("{}:examples", self.partition_key(partition))
    }

    /// Hash of example id to the examples key of the partition holding it
    fn owners_key(&self) -> String {
        format!("{}:owners", self.prefix)
    }

    async fn stored_dimension(
        &self,
        conn: &mut MultiplexedConnection,
        partition: &PartitionKey,
    ) -> Result<Option<usize>> {
        conn.get(self.dimension_key(partition))
            .await
            .map_err(|e| DiclError::Retrieval(format!("Redis GET failed: {}", e)))
    }

    async fn load_partition(
        &self,
        conn: &mut MultiplexedConnection,
        partition: &PartitionKey,
    ) -> Result<Vec<Example>> {
        let records: Vec<String> = conn
            .hvals(self.examples_key(partition))
            .await
            .map_err(|e| DiclError::Retrieval(format!("Redis HVALS failed: {}", e)))?;

        let mut examples = Vec::with_capacity(records.len());
        for record in records {
            match serde_json::from_str::<Example>(&record) {
                Ok(example) => examples.push(example),
                Err(e) => warn!(partition = %partition, error = %e, "Skipping unreadable example record"),
            }
        }
        Ok(examples)
    }

    /// Get a connection, reconnecting if needed
    async fn get_connection(&self) -> Result<MultiplexedConnection> {
        let guard = self.connection.read().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        drop(guard);

        let mut guard = self.connection.write().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }

        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| DiclError::Retrieval(format!("Failed to reconnect to Redis: {}", e)))?;

        *guard = Some(conn.clone());
        Ok(conn)
    }
}

#[async_trait]
impl ExampleStore for RedisExampleStore {
    #[instrument(skip(self, examples), fields(count = examples.len()))]
    async fn upsert(&self, examples: Vec<Example>) -> Result<usize> {
        if examples.is_empty() {
            return Ok(0);
        }

        let dimensions = validate_batch(&examples)?;

        let mut grouped: BTreeMap<PartitionKey, Vec<&Example>> = BTreeMap::new();
        for example in &examples {
            grouped.entry(example.partition()).or_default().push(example);
        }

        let mut invocation = self.script.prepare_invoke();
        invocation.key(self.owners_key());
        for (partition, members) in &grouped {
            invocation
                .key(self.dimension_key(partition))
                .key(self.examples_key(partition));
            invocation
                .arg(dimensions.get(partition).copied().unwrap_or_default())
                .arg(members.len());
            for example in members {
                let json = serde_json::to_string(example)?;
                invocation.arg(example.id.to_string()).arg(json);
            }
        }

        let mut conn = self.get_connection().await?;
        let inserted: usize = invocation.invoke_async(&mut conn).await.map_err(|e| {
            warn!("Example upsert rejected: {}", e);
            DiclError::StoreWrite(format!("Redis upsert failed: {}", e))
        })?;

        debug!(inserted, partitions = grouped.len(), "Upserted examples");
        Ok(inserted)
    }

    #[instrument(skip(self, query), fields(partition = %query.partition, k = query.k))]
    async fn search(&self, query: &SearchQuery) -> Result<Vec<ScoredExample>> {
        if query.k == 0 {
            return Ok(Vec::new());
        }
        check_query(query)?;

        let mut conn = self.get_connection().await?;
        let Some(dimension) = self.stored_dimension(&mut conn, &query.partition).await? else {
            return Ok(Vec::new());
        };
        if dimension != query.embedding.len() {
            return Err(DiclError::DimensionMismatch {
                expected: dimension,
                actual: query.embedding.len(),
            });
        }

        let examples = self.load_partition(&mut conn, &query.partition).await?;
        Ok(rank(examples.iter(), &query.embedding, self.metric, query.k))
    }

    async fn partition_stats(&self, partition: &PartitionKey) -> Result<PartitionStats> {
        let mut conn = self.get_connection().await?;
        let Some(dimension) = self.stored_dimension(&mut conn, partition).await? else {
            return Ok(PartitionStats::empty(partition.clone()));
        };

        let ids: Vec<String> = conn
            .hkeys(self.examples_key(partition))
            .await
            .map_err(|e| DiclError::Retrieval(format!("Redis HKEYS failed: {}", e)))?;
        let mut ids: Vec<ExampleId> = ids.iter().filter_map(|s| ExampleId::parse(s).ok()).collect();
        ids.sort();

        Ok(PartitionStats {
            partition: partition.clone(),
            count: ids.len(),
            dimension: Some(dimension),
            oldest: ids.first().and_then(|id| id.created_at()),
            newest: ids.last().and_then(|id| id.created_at()),
        })
    }

    async fn source_inference_ids(&self, partition: &PartitionKey) -> Result<HashSet<Uuid>> {
        let mut conn = self.get_connection().await?;
        let examples = self.load_partition(&mut conn, partition).await?;
        Ok(examples
            .into_iter()
            .filter_map(|e| e.source_inference_id)
            .collect())
    }

    fn metric(&self) -> DistanceMetric {
        self.metric
    }
}
