//! Pipeline lifecycle events.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// An event emitted while a run progresses.
///
/// Events are consumed by an [`EventSink`](crate::events::EventSink) for
/// logging or test assertions. Payloads never carry secret values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineEvent {
    /// The event type (e.g., "stage.started", "cleanup.finalized").
    #[serde(rename = "type")]
    pub event_type: String,

    /// When the event occurred (ISO 8601).
    pub timestamp: String,

    /// The event payload data.
    #[serde(default)]
    pub data: HashMap<String, serde_json::Value>,
}

impl PipelineEvent {
    /// Creates a new event.
    #[must_use]
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            timestamp: crate::utils::iso_timestamp(),
            data: HashMap::new(),
        }
    }

    /// Adds a data field to the event.
    #[must_use]
    pub fn add_data(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    /// Returns a data field.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.data.get(key)
    }

    /// Creates a "stage.started" event.
    #[must_use]
    pub fn stage_started(stage: &str, context: &str) -> Self {
        Self::new("stage.started")
            .add_data("stage", serde_json::json!(stage))
            .add_data("context", serde_json::json!(context))
    }

    /// Creates a "stage.completed" event.
    #[must_use]
    pub fn stage_completed(stage: &str, duration_ms: f64) -> Self {
        Self::new("stage.completed")
            .add_data("stage", serde_json::json!(stage))
            .add_data("duration_ms", serde_json::json!(duration_ms))
    }

    /// Creates a "stage.failed" event.
    #[must_use]
    pub fn stage_failed(stage: &str, kind: &str, error: &str) -> Self {
        Self::new("stage.failed")
            .add_data("stage", serde_json::json!(stage))
            .add_data("kind", serde_json::json!(kind))
            .add_data("error", serde_json::json!(error))
    }

    /// Creates a "stage.aborted" event.
    #[must_use]
    pub fn stage_aborted(stage: &str, reason: &str) -> Self {
        Self::new("stage.aborted")
            .add_data("stage", serde_json::json!(stage))
            .add_data("reason", serde_json::json!(reason))
    }

    /// Creates a "step.completed" event.
    #[must_use]
    pub fn step_completed(stage: &str, step: &str, exit_code: Option<i32>, duration_ms: f64) -> Self {
        Self::new("step.completed")
            .add_data("stage", serde_json::json!(stage))
            .add_data("step", serde_json::json!(step))
            .add_data("exit_code", serde_json::json!(exit_code))
            .add_data("duration_ms", serde_json::json!(duration_ms))
    }
}
