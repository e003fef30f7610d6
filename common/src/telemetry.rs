//! Telemetry for reporting deployment events
//!
//! Events are always logged locally. When `DEPLOY_TELEMETRY_ENDPOINT` is set
//! they are also posted there as JSON.

use crate::config::DeployEnv;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

/// All telemetry events emitted by the stack components.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TelemetryEvent {
    // === Planning ===
    /// Declaration graph was built and ordered
    PlanGenerated { stack: String, resources: usize },

    // === Migration ===
    /// Migration invocation started
    MigrationStarted { job: String, target: String },

    /// Migration applied successfully
    MigrationCompleted {
        job: String,
        duration_ms: u64,
        schema_bytes: usize,
    },

    /// Migration failed; `phase` names the step that failed
    MigrationFailed {
        job: String,
        error: String,
        phase: String,
    },

    // === Generic Events ===
    /// Component started
    ComponentStarted { component: String, version: String },

    /// Component error occurred
    ComponentError {
        component: String,
        error: String,
        context: String,
    },
}

impl TelemetryEvent {
    /// Get the event type name.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::PlanGenerated { .. } => "DB_STACK_PLAN_GENERATED",
            Self::MigrationStarted { .. } => "DB_STACK_MIGRATION_STARTED",
            Self::MigrationCompleted { .. } => "DB_STACK_MIGRATION_COMPLETED",
            Self::MigrationFailed { .. } => "DB_STACK_MIGRATION_FAILED",
            Self::ComponentStarted { .. } => "COMPONENT_STARTED",
            Self::ComponentError { .. } => "COMPONENT_ERROR",
        }
    }

    /// Convert event to a human-readable message.
    pub fn message(&self) -> String {
        match self {
            Self::PlanGenerated { stack, resources } => {
                format!("Plan for {} has {} resources", stack, resources)
            }
            Self::MigrationStarted { job, target } => {
                format!("Migration {} started against {}", job, target)
            }
            Self::MigrationCompleted {
                job,
                duration_ms,
                schema_bytes,
            } => {
                format!(
                    "Migration {} applied {} bytes in {}ms",
                    job, schema_bytes, duration_ms
                )
            }
            Self::MigrationFailed { job, error, phase } => {
                format!("Migration {} failed during {}: {}", job, phase, error)
            }
            Self::ComponentStarted { component, version } => {
                format!("{} v{} started", component, version)
            }
            Self::ComponentError {
                component,
                error,
                context,
            } => {
                format!("{} error in {}: {}", component, context, error)
            }
        }
    }

    fn payload(&self, component: &str) -> serde_json::Value {
        json!({
            "event": self.event_type(),
            "message": self.message(),
            "component": component,
            "data": self,
        })
    }
}

/// Telemetry client for sending deployment events.
#[derive(Clone)]
pub struct Telemetry {
    client: Arc<Client>,
    endpoint: Option<String>,
    component: String,
}

impl Telemetry {
    /// Create a new telemetry client from environment variables.
    pub fn from_env(component: &str) -> Self {
        Self::new(component, DeployEnv::telemetry_endpoint())
    }

    /// Create a telemetry client posting to `endpoint`, or logging only when `None`.
    pub fn new(component: &str, endpoint: Option<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client: Arc::new(client),
            endpoint,
            component: component.to_string(),
        }
    }

    /// Send a telemetry event (fire and forget, non-blocking).
    ///
    /// Errors are logged but do not affect the caller.
    pub fn send(&self, event: TelemetryEvent) {
        info!(event = %event.event_type(), "{}", event.message());

        let Some(endpoint) = self.endpoint.clone() else {
            return;
        };
        let client = Arc::clone(&self.client);
        let payload = event.payload(&self.component);

        thread::spawn(move || match client.post(&endpoint).json(&payload).send() {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => {
                warn!("Telemetry got status {}", resp.status());
            }
            Err(e) => {
                warn!("Telemetry send failed: {}", e);
            }
        });
    }

    /// Send a telemetry event synchronously (blocking).
    ///
    /// Use this right before exiting so the event is not lost with the process.
    pub fn send_sync(&self, event: TelemetryEvent) -> Result<(), reqwest::Error> {
        info!(event = %event.event_type(), "{}", event.message());

        if let Some(endpoint) = &self.endpoint {
            self.client
                .post(endpoint)
                .json(&event.payload(&self.component))
                .send()?
                .error_for_status()?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = TelemetryEvent::MigrationFailed {
            job: "initialize-db".to_string(),
            error: "timed out".to_string(),
            phase: "apply".to_string(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "MigrationFailed");
        assert_eq!(event.event_type(), "DB_STACK_MIGRATION_FAILED");
        assert!(event.message().contains("during apply"));
    }

    #[test]
    fn test_send_without_endpoint_is_local_only() {
        let telemetry = Telemetry::new("test", None);
        telemetry.send(TelemetryEvent::ComponentStarted {
            component: "test".to_string(),
            version: "0.0.0".to_string(),
        });
        assert!(telemetry
            .send_sync(TelemetryEvent::PlanGenerated {
                stack: "s".to_string(),
                resources: 0,
            })
            .is_ok());
    }
}
