//! Example Store
//!
//! Durable, partitioned collection of examples with nearest-neighbor search.
//!
//! A partition's embedding dimension is fixed by its first write. Batches are
//! all-or-nothing: every record is validated before any is applied, and a
//! rejected batch leaves the partition exactly as it was.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ordered_float::OrderedFloat;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, instrument};
use uuid::Uuid;

use dicl_common::{DiclError, DistanceMetric, ExampleId, Result};

use crate::domain::example::{Example, PartitionKey, ScoredExample, SearchQuery};

/// Trait for example storage backends
#[async_trait]
pub trait ExampleStore: Send + Sync {
    /// Insert or replace a batch of examples atomically
    ///
    /// Returns the number of ids that were not present before.
    async fn upsert(&self, examples: Vec<Example>) -> Result<usize>;

    /// The `k` nearest examples of one partition, nearest first
    ///
    /// An empty or missing partition yields an empty result, not an error.
    async fn search(&self, query: &SearchQuery) -> Result<Vec<ScoredExample>>;

    /// Size and age summary of a partition
    async fn partition_stats(&self, partition: &PartitionKey) -> Result<PartitionStats>;

    /// Source inference ids already present in a partition
    async fn source_inference_ids(&self, partition: &PartitionKey) -> Result<HashSet<Uuid>>;

    /// Similarity metric this store ranks by
    fn metric(&self) -> DistanceMetric;
}

/// Summary of one partition
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PartitionStats {
    pub partition: PartitionKey,
    pub count: usize,
    /// Fixed by the first write; `None` for an empty partition
    pub dimension: Option<usize>,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

impl PartitionStats {
    pub fn empty(partition: PartitionKey) -> Self {
        Self {
            partition,
            count: 0,
            dimension: None,
            oldest: None,
            newest: None,
        }
    }
}

/// Check a batch in isolation and return the dimension it implies per partition
///
/// Ids must be UUIDv7 and may not appear under two partitions of one batch.
pub(crate) fn validate_batch(examples: &[Example]) -> Result<HashMap<PartitionKey, usize>> {
    let mut dimensions: HashMap<PartitionKey, usize> = HashMap::new();
    let mut owners: HashMap<ExampleId, PartitionKey> = HashMap::new();

    for example in examples {
        if !example.id.is_time_ordered() {
            return Err(DiclError::StoreWrite(format!(
                "example id {} is not a UUIDv7",
                example.id
            )));
        }
        if example.function_name.is_empty()
            || example.variant_name.is_empty()
            || example.namespace.is_empty()
        {
            return Err(DiclError::StoreWrite(format!(
                "example {} has an incomplete partition key",
                example.id
            )));
        }
        if example.embedding.is_empty() {
            return Err(DiclError::StoreWrite(format!(
                "example {} has an empty embedding",
                example.id
            )));
        }
        if example.embedding.iter().any(|x| !x.is_finite()) {
            return Err(DiclError::StoreWrite(format!(
                "example {} has a non-finite embedding value",
                example.id
            )));
        }

        let partition = example.partition();
        match owners.get(&example.id) {
            Some(owner) if *owner != partition => {
                return Err(DiclError::StoreWrite(format!(
                    "example {} appears in partitions {} and {}",
                    example.id, owner, partition
                )));
            }
            Some(_) => {}
            None => {
                owners.insert(example.id, partition.clone());
            }
        }

        match dimensions.get(&partition) {
            Some(&dimension) if dimension != example.dimension() => {
                return Err(DiclError::StoreWrite(format!(
                    "batch mixes dimensions {} and {} in partition {}",
                    dimension,
                    example.dimension(),
                    partition
                )));
            }
            Some(_) => {}
            None => {
                dimensions.insert(partition, example.dimension());
            }
        }
    }

    Ok(dimensions)
}

/// Reject a batch whose dimension disagrees with an existing partition
pub(crate) fn check_partition_dimension(
    partition: &PartitionKey,
    existing: Option<usize>,
    incoming: usize,
) -> Result<()> {
    match existing {
        Some(dimension) if dimension != incoming => Err(DiclError::StoreWrite(format!(
            "partition {} holds {}-dimensional embeddings, batch has {}",
            partition, dimension, incoming
        ))),
        _ => Ok(()),
    }
}

/// Score candidates and keep the `k` best
///
/// Ties on similarity go to the most recently created example.
pub(crate) fn rank<'a>(
    candidates: impl IntoIterator<Item = &'a Example>,
    query: &[f32],
    metric: DistanceMetric,
    k: usize,
) -> Vec<ScoredExample> {
    let mut scored: Vec<(f32, &Example)> = candidates
        .into_iter()
        .map(|example| (metric.similarity(query, &example.embedding), example))
        .collect();

    scored.sort_by(|a, b| {
        OrderedFloat(b.0)
            .cmp(&OrderedFloat(a.0))
            .then_with(|| b.1.id.cmp(&a.1.id))
    });
    scored.truncate(k);

    scored
        .into_iter()
        .enumerate()
        .map(|(rank, (similarity, example))| ScoredExample {
            example: example.clone(),
            similarity,
            rank,
        })
        .collect()
}

/// Reject malformed queries before touching storage
pub(crate) fn check_query(query: &SearchQuery) -> Result<()> {
    if query.embedding.is_empty() {
        return Err(DiclError::Retrieval("query embedding is empty".to_string()));
    }
    if query.embedding.iter().any(|x| !x.is_finite()) {
        return Err(DiclError::Retrieval(
            "query embedding has a non-finite value".to_string(),
        ));
    }
    Ok(())
}

#[derive(Debug, Default)]
struct Partition {
    dimension: usize,
    /// Keyed by time-ordered id, so iteration runs oldest to newest
    examples: BTreeMap<ExampleId, Example>,
}

#[derive(Debug, Default)]
struct StoreState {
    partitions: HashMap<PartitionKey, Partition>,
    /// Partition each id lives in; an id never moves between partitions
    owners: HashMap<ExampleId, PartitionKey>,
}

/// In-memory storage implementation
///
/// A single lock guards all partitions so a batch spanning several of them
/// is still applied atomically.
pub struct InMemoryExampleStore {
    state: RwLock<StoreState>,
    metric: DistanceMetric,
}

impl InMemoryExampleStore {
    pub fn new(metric: DistanceMetric) -> Self {
        Self {
            state: RwLock::new(StoreState::default()),
            metric,
        }
    }

    /// Total examples across partitions
    pub fn total_count(&self) -> usize {
        self.state.read().owners.len()
    }
}

impl Default for InMemoryExampleStore {
    fn default() -> Self {
        Self::new(DistanceMetric::default())
    }
}

#[async_trait]
impl ExampleStore for InMemoryExampleStore {
    #[instrument(skip(self, examples), fields(count = examples.len()))]
    async fn upsert(&self, examples: Vec<Example>) -> Result<usize> {
        if examples.is_empty() {
            return Ok(0);
        }

        let batch_dimensions = validate_batch(&examples)?;

        let mut state = self.state.write();
        for (partition, &dimension) in &batch_dimensions {
            let existing = state.partitions.get(partition).map(|p| p.dimension);
            check_partition_dimension(partition, existing, dimension)?;
        }
        for example in &examples {
            if let Some(owner) = state.owners.get(&example.id) {
                if *owner != example.partition() {
                    return Err(DiclError::StoreWrite(format!(
                        "example {} already belongs to partition {}",
                        example.id, owner
                    )));
                }
            }
        }

        let StoreState { partitions, owners } = &mut *state;
        let mut inserted = 0;
        for example in examples {
            let key = example.partition();
            owners.insert(example.id, key.clone());
            let partition = partitions.entry(key).or_insert_with(|| Partition {
                dimension: example.dimension(),
                examples: BTreeMap::new(),
            });
            if partition.examples.insert(example.id, example).is_none() {
                inserted += 1;
            }
        }

        debug!(inserted, "Upserted examples");
        Ok(inserted)
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<ScoredExample>> {
        if query.k == 0 {
            return Ok(Vec::new());
        }
        check_query(query)?;

        let state = self.state.read();
        let Some(partition) = state.partitions.get(&query.partition) else {
            return Ok(Vec::new());
        };

        if partition.dimension != query.embedding.len() {
            return Err(DiclError::DimensionMismatch {
                expected: partition.dimension,
                actual: query.embedding.len(),
            });
        }

        Ok(rank(
            partition.examples.values(),
            &query.embedding,
            self.metric,
            query.k,
        ))
    }

    async fn partition_stats(&self, partition: &PartitionKey) -> Result<PartitionStats> {
        let state = self.state.read();
        let Some(stored) = state.partitions.get(partition) else {
            return Ok(PartitionStats::empty(partition.clone()));
        };

        Ok(PartitionStats {
            partition: partition.clone(),
            count: stored.examples.len(),
            dimension: Some(stored.dimension),
            oldest: stored.examples.keys().next().and_then(|id| id.created_at()),
            newest: stored.examples.keys().next_back().and_then(|id| id.created_at()),
        })
    }

    async fn source_inference_ids(&self, partition: &PartitionKey) -> Result<HashSet<Uuid>> {
        let state = self.state.read();
        Ok(state
            .partitions
            .get(partition)
            .map(|p| {
                p.examples
                    .values()
                    .filter_map(|e| e.source_inference_id)
                    .collect()
            })
            .unwrap_or_default())
    }

    fn metric(&self) -> DistanceMetric {
        self.metric
    }
}
