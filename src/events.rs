//! Progress event bus.
//!
//! Each job gets a broadcast channel; publishing is best-effort (a job with no
//! subscribers, or a lagging subscriber, never affects the pipeline).
//! Subscribers that reconnect reconcile through the job store snapshot.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::models::{Stage, TokenUsage};

const CHANNEL_CAPACITY: usize = 256;

/// A progress event, stamped with a UTC timestamp at construction.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum ProgressEvent {
    #[serde(rename = "job.queued")]
    JobQueued {
        job_id: String,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "analyzer.started")]
    AnalyzerStarted {
        job_id: String,
        stage: Stage,
        analyzer: String,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "analyzer.completed")]
    AnalyzerCompleted {
        job_id: String,
        stage: Stage,
        analyzer: String,
        processing_time_ms: u64,
        token_usage: TokenUsage,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "analyzer.error")]
    AnalyzerError {
        job_id: String,
        stage: Stage,
        analyzer: String,
        error_message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        processing_time_ms: Option<u64>,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "stage.completed")]
    StageCompleted {
        job_id: String,
        stage: Stage,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "insights.updated")]
    InsightsUpdated {
        job_id: String,
        counts: serde_json::Value,
        items: serde_json::Value,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "job.completed")]
    JobCompleted {
        job_id: String,
        total_processing_time_ms: u64,
        total_token_usage: TokenUsage,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "job.error")]
    JobError {
        job_id: String,
        error_code: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
}

impl ProgressEvent {
    #[must_use]
    pub fn job_id(&self) -> &str {
        match self {
            ProgressEvent::JobQueued { job_id, .. }
            | ProgressEvent::AnalyzerStarted { job_id, .. }
            | ProgressEvent::AnalyzerCompleted { job_id, .. }
            | ProgressEvent::AnalyzerError { job_id, .. }
            | ProgressEvent::StageCompleted { job_id, .. }
            | ProgressEvent::InsightsUpdated { job_id, .. }
            | ProgressEvent::JobCompleted { job_id, .. }
            | ProgressEvent::JobError { job_id, .. } => job_id,
        }
    }

    /// Whether this event terminates the job's stream.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProgressEvent::JobCompleted { .. } | ProgressEvent::JobError { .. }
        )
    }
}

/// Best-effort per-job progress channel registry.
#[derive(Debug, Clone, Default)]
pub struct EventBus {
    channels: Arc<RwLock<HashMap<String, broadcast::Sender<ProgressEvent>>>>,
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a job's progress stream, creating the channel if needed.
    pub fn subscribe(&self, job_id: &str) -> broadcast::Receiver<ProgressEvent> {
        let mut channels = self.channels.write().expect("event bus lock");
        channels
            .entry(job_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Publish an event. Channels for terminal events are dropped afterwards
    /// so finished jobs do not accumulate senders.
    pub fn publish(&self, event: ProgressEvent) {
        let job_id = event.job_id().to_string();
        let terminal = event.is_terminal();
        {
            let channels = self.channels.read().expect("event bus lock");
            if let Some(sender) = channels.get(&job_id) {
                // Send errors just mean nobody is listening.
                let _ = sender.send(event);
            }
        }
        if terminal {
            self.channels
                .write()
                .expect("event bus lock")
                .remove(&job_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe("job-1");

        bus.publish(ProgressEvent::JobQueued {
            job_id: "job-1".to_string(),
            timestamp: Utc::now(),
        });

        let event = rx.recv().await.expect("event");
        assert_eq!(event.job_id(), "job-1");
        assert!(matches!(event, ProgressEvent::JobQueued { .. }));
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_a_noop() {
        let bus = EventBus::new();
        bus.publish(ProgressEvent::StageCompleted {
            job_id: "nobody".to_string(),
            stage: Stage::A,
            timestamp: Utc::now(),
        });
    }

    #[tokio::test]
    async fn terminal_event_closes_the_channel() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe("job-2");

        bus.publish(ProgressEvent::JobCompleted {
            job_id: "job-2".to_string(),
            total_processing_time_ms: 10,
            total_token_usage: TokenUsage::default(),
            timestamp: Utc::now(),
        });

        let event = rx.recv().await.expect("terminal event");
        assert!(event.is_terminal());
        // Channel dropped: next recv observes closure.
        assert!(rx.recv().await.is_err());
    }

    #[test]
    fn events_serialize_with_dotted_names() {
        let event = ProgressEvent::AnalyzerStarted {
            job_id: "j".to_string(),
            stage: Stage::B,
            analyzer: "first_principles".to_string(),
            timestamp: Utc::now(),
        };
        let raw = serde_json::to_value(&event).unwrap();
        assert_eq!(raw["event"], "analyzer.started");
        assert_eq!(raw["stage"], "stage_b");
        assert!(raw["timestamp"].as_str().unwrap().contains('T'));
    }
}
