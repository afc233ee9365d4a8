//! Serving DICL variants end to end over in-process providers

mod common;

use serde_json::json;
use uuid::Uuid;

use common::harness;
use dicl_common::DiclError;
use dicl_service::config::{DedupePolicy, MetricFilter, PopulationJob};
use dicl_service::infra::dummy::DEFAULT_REPLY;
use dicl_service::{
    Example, ExampleStore, FeedbackRequest, InferenceOutput, InferenceRequest, InferenceStage, Input,
    PartitionKey,
};

fn request(function_name: &str, variant_name: Option<&str>, text: &str) -> InferenceRequest {
    InferenceRequest {
        function_name: function_name.to_string(),
        variant_name: variant_name.map(str::to_string),
        episode_id: None,
        input: Input::from_user_text(text),
        dryrun: false,
    }
}

fn chat_content(output: &InferenceOutput) -> &str {
    match output {
        InferenceOutput::Chat { content } => content,
        other => panic!("expected chat output, got {other:?}"),
    }
}

#[tokio::test]
async fn test_stored_output_is_replayed_byte_for_byte() {
    let h = harness();
    let output = "  Ada Lovelace (née Byron): the first program.\n\t1843 ";
    let input = Input::from_user_text("Who wrote the first program?");
    h.service
        .ingest_demonstration("summarize", "dicl", None, &input, &json!(output))
        .await
        .unwrap();

    let response = h
        .service
        .infer(InferenceRequest {
            input,
            ..request("summarize", Some("dicl"), "")
        })
        .await
        .unwrap();

    assert_eq!(chat_content(&response.response.output), output);
    assert_eq!(response.response.examples_retrieved, 1);
    assert!(!response.response.no_examples_retrieved);
    assert_eq!(
        response.response.stages,
        vec![
            InferenceStage::Received,
            InferenceStage::Embedding,
            InferenceStage::Retrieving,
            InferenceStage::Composing,
            InferenceStage::Generating,
            InferenceStage::Complete,
        ]
    );
}

#[tokio::test]
async fn test_empty_partition_serves_without_examples() {
    let h = harness();
    let response = h.service.infer(request("summarize", Some("dicl"), "hello")).await.unwrap();

    assert_eq!(response.response.examples_retrieved, 0);
    assert!(response.response.no_examples_retrieved);
    assert!(response.response.fallback_reason.is_none());
    assert_eq!(chat_content(&response.response.output), DEFAULT_REPLY);
}

#[tokio::test]
async fn test_examples_are_rendered_nearest_first() {
    let h = harness();
    for (text, output) in [("The cat sat on the mat", "cat summary"), ("Stock markets fell", "market summary")] {
        h.service
            .ingest_demonstration("summarize", "dicl_echo", None, &Input::from_user_text(text), &json!(output))
            .await
            .unwrap();
    }

    let response = h
        .service
        .infer(request("summarize", Some("dicl_echo"), "The cat sat on the mat"))
        .await
        .unwrap();
    let transcript = chat_content(&response.response.output);

    assert_eq!(response.response.examples_retrieved, 2);
    assert!(transcript.starts_with("system: Summarize briefly."));
    let cat = transcript.find("assistant: cat summary").unwrap();
    let market = transcript.find("assistant: market summary").unwrap();
    assert!(cat < market);
}

#[tokio::test]
async fn test_embedding_failure_falls_back_to_zero_shot() {
    let h = harness();
    let response = h
        .service
        .infer(request("summarize", Some("dicl_broken"), "hello there"))
        .await
        .unwrap();

    assert!(response.response.no_examples_retrieved);
    assert!(response.response.fallback_reason.is_some());
    assert!(!response.response.stages.contains(&InferenceStage::Retrieving));
    assert!(chat_content(&response.response.output).contains("hello there"));
}

#[tokio::test]
async fn test_embedding_failure_without_fallback_fails_in_embedding_stage() {
    let h = harness();
    let err = h
        .service
        .infer(request("summarize", Some("dicl_strict"), "hello"))
        .await
        .unwrap_err();

    assert_eq!(err.stage, InferenceStage::Embedding);
    assert!(matches!(err.source, DiclError::Embedding(_)));
    assert!(err.is_retriable());
}

#[tokio::test]
async fn test_dimension_mismatch_is_fatal() {
    let h = harness();
    let partition = PartitionKey::new("summarize", "dicl", "default");
    h.service
        .upsert(vec![Example::new(&partition, "in", "out", vec![1.0; 8])])
        .await
        .unwrap();

    let err = h.service.infer(request("summarize", Some("dicl"), "hello")).await.unwrap_err();

    assert_eq!(err.stage, InferenceStage::Received);
    assert!(matches!(err.source, DiclError::DimensionMismatch { expected: 8, actual: 16 }));
    assert!(err.is_configuration());
}

#[tokio::test]
async fn test_dimension_mismatch_is_caught_before_embedding() {
    let h = harness();
    let partition = PartitionKey::new("summarize", "dicl_broken", "default");
    h.service
        .upsert(vec![Example::new(&partition, "in", "out", vec![1.0; 8])])
        .await
        .unwrap();

    // The broken embedding model would fall back to zero-shot if it were called
    let err = h
        .service
        .infer(request("summarize", Some("dicl_broken"), "hello"))
        .await
        .unwrap_err();

    assert_eq!(err.stage, InferenceStage::Received);
    assert!(matches!(err.source, DiclError::DimensionMismatch { expected: 8, actual: 16 }));
}

#[tokio::test]
async fn test_schema_failures_are_flagged_not_raised() {
    let h = harness();

    let invalid = h.service.infer(request("extract", Some("dicl_text"), "doc")).await.unwrap();
    assert!(!invalid.response.valid_output);
    assert!(!invalid.response.schema_errors.is_empty());
    assert!(matches!(invalid.response.output, InferenceOutput::Json { parsed: None, .. }));

    let valid = h.service.infer(request("extract", Some("dicl"), "doc")).await.unwrap();
    assert!(valid.response.valid_output);
    assert_eq!(
        valid.response.output,
        InferenceOutput::Json {
            raw: r#"{"answer":"Hello"}"#.to_string(),
            parsed: Some(json!({"answer": "Hello"})),
        }
    );
}

#[tokio::test]
async fn test_unpinned_requests_only_reach_weighted_variants() {
    let h = harness();
    for _ in 0..20 {
        let response = h.service.infer(request("summarize", None, "hi")).await.unwrap();
        assert_eq!(response.response.variant_name, "dicl");
    }
}

#[tokio::test]
async fn test_unknown_function_fails_on_receipt() {
    let h = harness();
    let err = h.service.infer(request("translate", None, "hi")).await.unwrap_err();
    assert_eq!(err.stage, InferenceStage::Received);
    assert!(matches!(err.source, DiclError::NotFound(_)));
}

#[tokio::test]
async fn test_dryrun_is_not_recorded() {
    let h = harness();
    let recorded = h.service.infer(request("summarize", Some("dicl"), "kept")).await.unwrap();
    let dry = h
        .service
        .infer(InferenceRequest {
            dryrun: true,
            ..request("summarize", Some("dicl"), "dropped")
        })
        .await
        .unwrap();

    assert!(h.history.inference(&recorded.inference_id).is_some());
    assert!(h.history.inference(&dry.inference_id).is_none());
}

#[tokio::test]
async fn test_feedback_validation() {
    let h = harness();
    let inference_id = Some(Uuid::now_v7());

    let undefined = FeedbackRequest {
        metric_name: "f1".into(),
        value: json!(0.5),
        inference_id,
        episode_id: None,
    };
    assert!(h.service.feedback(undefined).unwrap_err().is_configuration());

    let wrong_type = FeedbackRequest {
        metric_name: "exact_match".into(),
        value: json!(0.5),
        inference_id,
        episode_id: None,
    };
    assert!(h.service.feedback(wrong_type).is_err());

    let wrong_level = FeedbackRequest {
        metric_name: "task_success".into(),
        value: json!(true),
        inference_id,
        episode_id: None,
    };
    assert!(h.service.feedback(wrong_level).is_err());

    let orphan_demonstration = FeedbackRequest {
        metric_name: "demonstration".into(),
        value: json!("better"),
        inference_id: None,
        episode_id: Some(Uuid::now_v7()),
    };
    assert!(h.service.feedback(orphan_demonstration).is_err());
}

#[tokio::test]
async fn test_feedback_loop_populates_partition() {
    let h = harness();

    let served = h
        .service
        .infer(request("summarize", Some("baseline"), "Rust ownership explained"))
        .await
        .unwrap();
    let handles = h
        .service
        .feedback(FeedbackRequest {
            metric_name: "jaccard".into(),
            value: json!(0.95),
            inference_id: Some(served.inference_id),
            episode_id: Some(served.episode_id),
        })
        .unwrap();
    for handle in handles {
        handle.await.unwrap();
    }

    let report = h
        .service
        .populate(&PopulationJob {
            function_name: "summarize".into(),
            variant_name: "dicl".into(),
            namespace: None,
            source_variant: Some("baseline".into()),
            metric: Some(MetricFilter {
                metric_name: "jaccard".into(),
                threshold: 0.9,
            }),
            include_demonstrations: false,
            max_concurrency: 2,
            dedupe: DedupePolicy::SkipIngested,
        })
        .await
        .unwrap();
    assert_eq!(report.inserted, 1);

    let stats = h
        .store
        .partition_stats(&PartitionKey::new("summarize", "dicl", "default"))
        .await
        .unwrap();
    assert_eq!(stats.count, 1);
    assert_eq!(stats.dimension, Some(16));

    // The dicl variant now replays the accepted output for the same input
    let replayed = h
        .service
        .infer(request("summarize", Some("dicl"), "Rust ownership explained"))
        .await
        .unwrap();
    assert_eq!(chat_content(&replayed.response.output), DEFAULT_REPLY);
    assert_eq!(replayed.response.retrieved_ids.len(), 1);
}
