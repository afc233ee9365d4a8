//! DICL Retrieval Engine
//!
//! Embeds a query with the partition's embedding model and asks the store for
//! its nearest examples.
//!
//! The engine cannot tell whether a partition was populated with the same
//! embedding model it is querying with; that is a configuration precondition.
//! It only detects the case where the dimensions differ, which surfaces as
//! `DiclError::DimensionMismatch` before the query is embedded.

use std::sync::Arc;

use tracing::{debug, instrument};

use dicl_common::{DiclError, DistanceMetric, Result};

use super::example::{PartitionKey, ScoredExample, SearchQuery};
use crate::infra::embedding::EmbeddingGateway;
use crate::infra::example_store::ExampleStore;

/// Example retriever over a store and the embedding models
#[derive(Clone)]
pub struct ExampleRetriever {
    store: Arc<dyn ExampleStore>,
    embeddings: Arc<EmbeddingGateway>,
}

impl ExampleRetriever {
    pub fn new(store: Arc<dyn ExampleStore>, embeddings: Arc<EmbeddingGateway>) -> Self {
        Self { store, embeddings }
    }

    pub fn store(&self) -> &Arc<dyn ExampleStore> {
        &self.store
    }

    pub fn embeddings(&self) -> &Arc<EmbeddingGateway> {
        &self.embeddings
    }

    /// Fail unless the store ranks by the metric the caller pinned
    pub fn check_metric(&self, pinned: DistanceMetric) -> Result<()> {
        let actual = self.store.metric();
        if actual != pinned {
            return Err(DiclError::Config(format!(
                "metric `{pinned}` is pinned but the example store ranks by `{actual}`"
            )));
        }
        Ok(())
    }

    /// Fail if the partition already holds vectors of another dimension
    ///
    /// Runs before the query is embedded, so a mismatched model is caught
    /// without a provider call. An empty partition accepts any dimension.
    pub async fn check_dimension(&self, partition: &PartitionKey, dimension: usize) -> Result<()> {
        match self.store.partition_stats(partition).await?.dimension {
            Some(expected) if expected != dimension => Err(DiclError::DimensionMismatch {
                expected,
                actual: dimension,
            }),
            _ => Ok(()),
        }
    }

    /// Embed `query_text` and return up to `k` nearest examples, nearest first
    #[instrument(skip(self, partition, query_text), fields(partition = %partition))]
    pub async fn retrieve(
        &self,
        partition: &PartitionKey,
        query_text: &str,
        k: usize,
        embedding_model: &str,
    ) -> Result<Vec<ScoredExample>> {
        let dimension = self.embeddings.client(embedding_model)?.dimension();
        self.check_dimension(partition, dimension).await?;

        let embedding = self.embeddings.embed(embedding_model, query_text).await?;
        self.retrieve_by_embedding(partition, embedding, k).await
    }

    /// Search with an embedding that was already computed
    pub async fn retrieve_by_embedding(
        &self,
        partition: &PartitionKey,
        embedding: Vec<f32>,
        k: usize,
    ) -> Result<Vec<ScoredExample>> {
        let query = SearchQuery {
            partition: partition.clone(),
            embedding,
            k,
        };
        let results = self.store.search(&query).await?;

        debug!(
            retrieved = results.len(),
            top_similarity = results.first().map(|r| r.similarity),
            "Retrieved examples"
        );

        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::domain::example::Example;
    use crate::infra::embedding::{EmbeddingClient, EmbeddingProvider, HashingEmbedding};
    use crate::infra::example_store::InMemoryExampleStore;

    fn retriever(store: Arc<InMemoryExampleStore>, dimension: usize) -> ExampleRetriever {
        let gateway = EmbeddingGateway::new().with_client(EmbeddingClient::new(
            "local",
            Arc::new(HashingEmbedding::new(dimension)),
            4,
            Duration::from_secs(1),
            true,
        ));
        ExampleRetriever::new(store, Arc::new(gateway))
    }

    #[tokio::test]
    async fn test_retrieve_nearest_first() {
        let store = Arc::new(InMemoryExampleStore::default());
        let partition = PartitionKey::new("ner", "dicl", "default");
        let hashing = HashingEmbedding::new(256);

        let mut examples = Vec::new();
        for text in ["Apple opened a store in Paris", "The weather is mild today", "Apple opened a shop in Paris"] {
            let embedding = hashing.embed(text).await.unwrap();
            examples.push(Example::new(&partition, text, format!("out:{text}"), embedding));
        }
        store.upsert(examples).await.unwrap();

        let retriever = retriever(store, 256);
        let results = retriever
            .retrieve(&partition, "Apple opened a store in Paris", 2, "local")
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].example.input, "Apple opened a store in Paris");
        assert!((results[0].similarity - 1.0).abs() < 1e-4);
        assert_eq!(results[1].example.input, "Apple opened a shop in Paris");
    }

    #[tokio::test]
    async fn test_empty_partition_yields_nothing() {
        let store = Arc::new(InMemoryExampleStore::default());
        let retriever = retriever(store, 16);
        let results = retriever
            .retrieve(&PartitionKey::new("f", "v", "ns"), "anything", 5, "local")
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_dimension_mismatch_is_fatal() {
        let store = Arc::new(InMemoryExampleStore::default());
        let partition = PartitionKey::new("f", "v", "ns");
        store
            .upsert(vec![Example::new(&partition, "in", "out", vec![1.0; 8])])
            .await
            .unwrap();

        let retriever = retriever(store, 16);
        let err = retriever.retrieve(&partition, "in", 1, "local").await.unwrap_err();
        assert!(matches!(err, DiclError::DimensionMismatch { expected: 8, actual: 16 }));
        assert!(err.is_configuration());
    }

    #[test]
    fn test_metric_pin() {
        let store = Arc::new(InMemoryExampleStore::new(DistanceMetric::Cosine));
        let retriever = retriever(store, 4);
        assert!(retriever.check_metric(DistanceMetric::Cosine).is_ok());
        assert!(retriever
            .check_metric(DistanceMetric::DotProduct)
            .unwrap_err()
            .is_configuration());
    }
}
