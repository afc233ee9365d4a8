//! Population from history: thresholds, latest values, demonstrations, dedupe

mod common;

use serde_json::json;
use uuid::Uuid;

use common::{at, chat_output, harness, record_demonstration, record_feedback, record_inference};
use dicl_common::DiclError;
use dicl_service::config::{DedupePolicy, MetricFilter, PopulationJob};
use dicl_service::{ExampleStore, Input, PartitionKey};

fn job(function_name: &str, metric: Option<(&str, f64)>, include_demonstrations: bool) -> PopulationJob {
    PopulationJob {
        function_name: function_name.to_string(),
        variant_name: "dicl".to_string(),
        namespace: None,
        source_variant: None,
        metric: metric.map(|(name, threshold)| MetricFilter {
            metric_name: name.to_string(),
            threshold,
        }),
        include_demonstrations,
        max_concurrency: 4,
        dedupe: DedupePolicy::None,
    }
}

fn summarize_partition() -> PartitionKey {
    PartitionKey::new("summarize", "dicl", "default")
}

async fn stored_outputs(h: &common::Harness, partition: &PartitionKey) -> Vec<String> {
    let stats = h.store.partition_stats(partition).await.unwrap();
    if stats.count == 0 {
        return Vec::new();
    }
    let mut outputs: Vec<String> = h
        .service
        .retrieve(
            &partition.function_name,
            &partition.variant_name,
            Some(&partition.namespace),
            &Input::from_user_text("anything"),
            Some(100),
        )
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.example.output)
        .collect();
    outputs.sort();
    outputs
}

#[tokio::test]
async fn test_only_values_past_threshold_are_ingested() {
    let h = harness();
    for (text, value) in [("low", 0.3), ("mid", 0.7), ("high", 0.9)] {
        let id = record_inference(&h.history, "summarize", "baseline", Uuid::now_v7(), text, chat_output(&format!("out-{text}")));
        record_feedback(&h.history, "jaccard", id, value, at(0));
    }

    let report = h.service.populate(&job("summarize", Some(("jaccard", 0.5)), false)).await.unwrap();

    assert_eq!(report.metric_candidates, 2);
    assert_eq!(report.inserted, 2);
    assert_eq!(stored_outputs(&h, &summarize_partition()).await, vec!["out-high", "out-mid"]);
}

#[tokio::test]
async fn test_threshold_boundary_is_inclusive() {
    let h = harness();
    let id = record_inference(&h.history, "summarize", "baseline", Uuid::now_v7(), "edge", chat_output("edge"));
    record_feedback(&h.history, "jaccard", id, 0.5, at(0));

    let report = h.service.populate(&job("summarize", Some(("jaccard", 0.5)), false)).await.unwrap();
    assert_eq!(report.inserted, 1);
}

#[tokio::test]
async fn test_latest_feedback_wins() {
    let h = harness();
    let regressed = record_inference(&h.history, "summarize", "baseline", Uuid::now_v7(), "a", chat_output("regressed"));
    record_feedback(&h.history, "jaccard", regressed, 0.9, at(0));
    record_feedback(&h.history, "jaccard", regressed, 0.2, at(10));

    let improved = record_inference(&h.history, "summarize", "baseline", Uuid::now_v7(), "b", chat_output("improved"));
    record_feedback(&h.history, "jaccard", improved, 0.8, at(10));
    record_feedback(&h.history, "jaccard", improved, 0.1, at(0));

    let report = h.service.populate(&job("summarize", Some(("jaccard", 0.5)), false)).await.unwrap();

    assert_eq!(report.inserted, 1);
    assert_eq!(stored_outputs(&h, &summarize_partition()).await, vec!["improved"]);
}

#[tokio::test]
async fn test_min_optimized_metric_keeps_low_values() {
    let h = harness();
    let fast = record_inference(&h.history, "summarize", "baseline", Uuid::now_v7(), "fast", chat_output("fast"));
    record_feedback(&h.history, "latency_ms", fast, 50.0, at(0));
    let slow = record_inference(&h.history, "summarize", "baseline", Uuid::now_v7(), "slow", chat_output("slow"));
    record_feedback(&h.history, "latency_ms", slow, 150.0, at(0));

    let report = h.service.populate(&job("summarize", Some(("latency_ms", 100.0)), false)).await.unwrap();

    assert_eq!(report.inserted, 1);
    assert_eq!(stored_outputs(&h, &summarize_partition()).await, vec!["fast"]);
}

#[tokio::test]
async fn test_episode_metric_applies_to_every_inference_in_episode() {
    let h = harness();
    let good_episode = Uuid::now_v7();
    let bad_episode = Uuid::now_v7();
    record_inference(&h.history, "summarize", "baseline", good_episode, "step one", chat_output("one"));
    record_inference(&h.history, "summarize", "baseline", good_episode, "step two", chat_output("two"));
    record_inference(&h.history, "summarize", "baseline", bad_episode, "step three", chat_output("three"));
    record_feedback(&h.history, "task_success", good_episode, 1.0, at(0));
    record_feedback(&h.history, "task_success", bad_episode, 0.0, at(0));

    let report = h.service.populate(&job("summarize", Some(("task_success", 1.0)), false)).await.unwrap();

    assert_eq!(report.inserted, 2);
    assert_eq!(stored_outputs(&h, &summarize_partition()).await, vec!["one", "two"]);
}

#[tokio::test]
async fn test_latest_demonstration_replaces_output() {
    let h = harness();
    let id = record_inference(&h.history, "summarize", "baseline", Uuid::now_v7(), "text", chat_output("model said"));
    record_demonstration(&h.history, id, json!("first correction").to_string(), at(0));
    record_demonstration(&h.history, id, json!("second correction").to_string(), at(5));

    let report = h.service.populate(&job("summarize", None, true)).await.unwrap();

    assert_eq!(report.demonstration_candidates, 1);
    assert_eq!(stored_outputs(&h, &summarize_partition()).await, vec!["second correction"]);
}

#[tokio::test]
async fn test_json_outputs_are_stored_canonically() {
    let h = harness();
    let output = json!({"raw": "{\"b\": 2, \"answer\": \"x\"}", "parsed": {"b": 2, "answer": "x"}}).to_string();
    let id = record_inference(&h.history, "extract", "baseline", Uuid::now_v7(), "doc", output);
    record_feedback(&h.history, "exact_match", id, 1.0, at(0));

    h.service.populate(&job("extract", Some(("exact_match", 1.0)), false)).await.unwrap();

    let outputs = stored_outputs(&h, &PartitionKey::new("extract", "dicl", "default")).await;
    assert_eq!(outputs, vec![r#"{"answer":"x","b":2}"#]);
}

#[tokio::test]
async fn test_dedupe_policies() {
    let h = harness();
    let id = record_inference(&h.history, "summarize", "baseline", Uuid::now_v7(), "text", chat_output("same"));
    record_feedback(&h.history, "jaccard", id, 0.9, at(0));
    record_demonstration(&h.history, id, json!("same").to_string(), at(1));

    // Both sources yield the same pair
    let keep_all = h.service.populate(&job("summarize", Some(("jaccard", 0.5)), true)).await.unwrap();
    assert_eq!(keep_all.inserted, 2);

    let mut within = job("summarize", Some(("jaccard", 0.5)), true);
    within.namespace = Some("within".to_string());
    within.dedupe = DedupePolicy::WithinRun;
    let report = h.service.populate(&within).await.unwrap();
    assert_eq!(report.inserted, 1);
    assert_eq!(report.duplicates_skipped, 1);

    let mut skip = within.clone();
    skip.dedupe = DedupePolicy::SkipIngested;
    let rerun = h.service.populate(&skip).await.unwrap();
    assert_eq!(rerun.inserted, 0);
    assert_eq!(
        h.store
            .partition_stats(&PartitionKey::new("summarize", "dicl", "within"))
            .await
            .unwrap()
            .count,
        1
    );
}

#[tokio::test]
async fn test_source_variant_filter() {
    let h = harness();
    let from_baseline = record_inference(&h.history, "summarize", "baseline", Uuid::now_v7(), "a", chat_output("from baseline"));
    let from_dicl = record_inference(&h.history, "summarize", "dicl", Uuid::now_v7(), "b", chat_output("from dicl"));
    record_feedback(&h.history, "jaccard", from_baseline, 1.0, at(0));
    record_feedback(&h.history, "jaccard", from_dicl, 1.0, at(0));

    let mut only_baseline = job("summarize", Some(("jaccard", 0.5)), false);
    only_baseline.source_variant = Some("baseline".to_string());
    let report = h.service.populate(&only_baseline).await.unwrap();

    assert_eq!(report.inserted, 1);
    assert_eq!(stored_outputs(&h, &summarize_partition()).await, vec!["from baseline"]);
}

#[tokio::test]
async fn test_undefined_metric_is_configuration_error() {
    let h = harness();
    let id = record_inference(&h.history, "summarize", "baseline", Uuid::now_v7(), "a", chat_output("x"));
    record_feedback(&h.history, "f1", id, 1.0, at(0));

    let err = h.service.populate(&job("summarize", Some(("f1", 0.5)), false)).await.unwrap_err();

    assert!(matches!(err, DiclError::Config(_)));
    assert_eq!(h.store.total_count(), 0);
}

#[tokio::test]
async fn test_non_dicl_target_is_rejected() {
    let h = harness();
    let mut target = job("summarize", None, true);
    target.variant_name = "baseline".to_string();
    let err = h.service.populate(&target).await.unwrap_err();
    assert!(err.is_configuration());
}

#[tokio::test]
async fn test_embedding_failures_are_dropped() {
    let h = harness();
    let id = record_inference(&h.history, "summarize", "baseline", Uuid::now_v7(), "a", chat_output("x"));
    record_feedback(&h.history, "jaccard", id, 1.0, at(0));

    let mut broken = job("summarize", Some(("jaccard", 0.5)), false);
    broken.variant_name = "dicl_broken".to_string();
    let report = h.service.populate(&broken).await.unwrap();

    assert_eq!(report.metric_candidates, 1);
    assert_eq!(report.embedding_failures, 1);
    assert_eq!(report.inserted, 0);
    assert_eq!(h.store.total_count(), 0);
}

#[tokio::test]
async fn test_nothing_to_do_is_not_an_error() {
    let h = harness();
    let report = h.service.populate(&job("summarize", Some(("jaccard", 0.5)), true)).await.unwrap();
    assert_eq!(report.inserted, 0);
    assert_eq!(report.partition, Some(summarize_partition()));
}
