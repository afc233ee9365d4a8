//! Feedback delivery
//!
//! Feedback is forwarded to the gateway that owns the history tables. Delivery
//! runs in the background: a failed delivery is logged and never fails the
//! caller's request.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use dicl_common::{DiclError, Result};

use crate::config::GatewaySettings;

/// Reserved metric name carrying a reference output
pub const DEMONSTRATION_METRIC: &str = "demonstration";

/// A metric value or demonstration for one inference or episode
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackRequest {
    pub metric_name: String,
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inference_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub episode_id: Option<Uuid>,
}

/// Destination for feedback
#[async_trait]
pub trait FeedbackSink: Send + Sync {
    async fn send(&self, feedback: &FeedbackRequest) -> Result<()>;
}

/// Posts feedback to `<gateway>/feedback`
pub struct GatewayFeedbackClient {
    client: Client,
    url: String,
}

impl GatewayFeedbackClient {
    pub fn new(client: Client, base_url: &str) -> Self {
        Self {
            client,
            url: format!("{}/feedback", base_url.trim_end_matches('/')),
        }
    }

    pub fn from_settings(settings: &GatewaySettings) -> Result<Option<Self>> {
        let Some(url) = &settings.url else {
            return Ok(None);
        };
        let client = Client::builder()
            .timeout(Duration::from_millis(settings.timeout_ms))
            .build()
            .map_err(|e| DiclError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Some(Self::new(client, url)))
    }
}

#[async_trait]
impl FeedbackSink for GatewayFeedbackClient {
    async fn send(&self, feedback: &FeedbackRequest) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(feedback)
            .send()
            .await
            .map_err(|e| DiclError::Internal(format!("Feedback request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DiclError::Internal(format!(
                "Gateway rejected feedback ({}): {}",
                status, body
            )));
        }
        Ok(())
    }
}

/// Fire-and-forget fan-out to every configured sink
#[derive(Clone, Default)]
pub struct FeedbackDispatcher {
    sinks: Vec<Arc<dyn FeedbackSink>>,
}

impl FeedbackDispatcher {
    pub fn new(sinks: Vec<Arc<dyn FeedbackSink>>) -> Self {
        Self { sinks }
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    /// Hand the feedback to each sink on a background task
    pub fn dispatch(&self, feedback: FeedbackRequest) -> Vec<tokio::task::JoinHandle<()>> {
        self.sinks
            .iter()
            .cloned()
            .map(|sink| {
                let feedback = feedback.clone();
                tokio::spawn(async move {
                    match sink.send(&feedback).await {
                        Ok(()) => debug!(metric = %feedback.metric_name, "Feedback delivered"),
                        Err(e) => warn!(
                            metric = %feedback.metric_name,
                            error = %e,
                            "Feedback delivery failed"
                        ),
                    }
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    #[derive(Default)]
    struct Recording {
        seen: Mutex<Vec<FeedbackRequest>>,
    }

    #[async_trait]
    impl FeedbackSink for Recording {
        async fn send(&self, feedback: &FeedbackRequest) -> Result<()> {
            self.seen.lock().push(feedback.clone());
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl FeedbackSink for Failing {
        async fn send(&self, _feedback: &FeedbackRequest) -> Result<()> {
            Err(DiclError::Internal("gateway down".into()))
        }
    }

    #[tokio::test]
    async fn test_dispatch_isolates_failures() {
        let recording = Arc::new(Recording::default());
        let dispatcher = FeedbackDispatcher::new(vec![Arc::new(Failing), recording.clone()]);

        let feedback = FeedbackRequest {
            metric_name: "exact_match".into(),
            value: json!(true),
            inference_id: Some(Uuid::now_v7()),
            episode_id: None,
        };
        for handle in dispatcher.dispatch(feedback.clone()) {
            handle.await.unwrap();
        }

        assert_eq!(recording.seen.lock().as_slice(), &[feedback]);
    }

    #[test]
    fn test_serialization_skips_missing_ids() {
        let feedback = FeedbackRequest {
            metric_name: "jaccard".into(),
            value: json!(0.5),
            inference_id: None,
            episode_id: Some(Uuid::nil()),
        };
        let body = serde_json::to_value(&feedback).unwrap();
        assert!(body.get("inference_id").is_none());
        assert_eq!(body["episode_id"], Uuid::nil().to_string());
    }
}
