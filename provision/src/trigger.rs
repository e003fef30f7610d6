//! Post-ready trigger
//!
//! Binds one job invocation to an upstream cluster:
//! `Pending → Armed → Fired → {Succeeded, Failed}`.
//! The trigger fires at most once per arming, only after the upstream
//! readiness signal is observed, and never for a failed or rolled-back
//! cluster. A failed job is not re-fired unless [`PostReadyTrigger::rearm`]
//! is called explicitly.

use crate::cluster::{ClusterHandle, ClusterStatus, Endpoint};
use crate::error::{Error, Result};
use crate::migration::JobHandle;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerState {
    Pending,
    Armed,
    Fired,
    Succeeded,
    Failed,
}

impl TriggerState {
    /// Whether `self → to` is a legal transition
    pub fn can_transition(self, to: TriggerState) -> bool {
        matches!(
            (self, to),
            (Self::Pending, Self::Armed)
                | (Self::Armed, Self::Fired)
                | (Self::Fired, Self::Succeeded)
                | (Self::Fired, Self::Failed)
                | (Self::Failed, Self::Armed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl fmt::Display for TriggerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Armed => "armed",
            Self::Fired => "fired",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

/// How the target job is invoked
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationType {
    /// Asynchronous, fire and forget from the engine's point of view
    #[default]
    Event,
    /// The caller waits on the job; a failed job is returned as its error
    RequestResponse,
}

impl FromStr for InvocationType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "event" => Ok(Self::Event),
            "request_response" => Ok(Self::RequestResponse),
            other => Err(Error::validation(format!("unknown invocation type: {}", other))),
        }
    }
}

/// Serializable declaration of a trigger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerDefinition {
    pub id: String,
    pub target_job: String,
    pub execute_after: Vec<String>,
    pub execute_before: Vec<String>,
    pub invocation_type: InvocationType,
    pub timeout_secs: u64,
}

impl TriggerDefinition {
    /// Trigger firing `job` after `upstream` is ready
    pub fn after(id: impl Into<String>, job: &JobHandle, upstream: &ClusterHandle) -> Self {
        Self {
            id: id.into(),
            target_job: job.id().to_string(),
            execute_after: vec![upstream.id().to_string()],
            execute_before: Vec::new(),
            invocation_type: InvocationType::default(),
            timeout_secs: job.definition().timeout_secs,
        }
    }

    /// Declare a resource that must wait for this trigger
    pub fn execute_before(mut self, resource: impl Into<String>) -> Self {
        self.execute_before.push(resource.into());
        self
    }

    pub fn invocation_type(mut self, invocation_type: InvocationType) -> Self {
        self.invocation_type = invocation_type;
        self
    }
}

/// Recorded state change
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Transition {
    pub from: TriggerState,
    pub to: TriggerState,
    pub at: DateTime<Utc>,
    /// Set on the transition into `Fired`
    pub invocation: Option<Uuid>,
}

struct Record {
    state: TriggerState,
    history: Vec<Transition>,
    last_error: Option<String>,
}

struct Inner {
    definition: TriggerDefinition,
    upstream: ClusterHandle,
    job: JobHandle,
    record: Mutex<Record>,
}

/// Orchestration primitive firing a job once after cluster readiness
#[derive(Clone)]
pub struct PostReadyTrigger {
    inner: Arc<Inner>,
}

impl fmt::Debug for PostReadyTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostReadyTrigger")
            .field("id", &self.inner.definition.id)
            .field("state", &self.state())
            .finish()
    }
}

impl PostReadyTrigger {
    pub fn new(definition: TriggerDefinition, job: JobHandle, upstream: &ClusterHandle) -> Self {
        Self {
            inner: Arc::new(Inner {
                definition,
                upstream: upstream.clone(),
                job,
                record: Mutex::new(Record {
                    state: TriggerState::Pending,
                    history: Vec::new(),
                    last_error: None,
                }),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.definition.id
    }

    pub fn definition(&self) -> &TriggerDefinition {
        &self.inner.definition
    }

    pub fn state(&self) -> TriggerState {
        self.lock().state
    }

    pub fn history(&self) -> Vec<Transition> {
        self.lock().history.clone()
    }

    /// Number of recorded `Fired` transitions
    pub fn fired_count(&self) -> usize {
        self.lock()
            .history
            .iter()
            .filter(|t| t.to == TriggerState::Fired)
            .count()
    }

    /// Error message of the most recent failed invocation
    pub fn last_error(&self) -> Option<String> {
        self.lock().last_error.clone()
    }

    /// Explicitly allow one more firing after a failure
    pub fn rearm(&self) -> Result<()> {
        if self.transition(TriggerState::Failed, TriggerState::Armed, None) {
            info!(trigger = %self.id(), "Trigger re-armed");
            Ok(())
        } else {
            Err(Error::validation(format!(
                "trigger {} can only be re-armed from failed, it is {}",
                self.id(),
                self.state()
            )))
        }
    }

    /// Arm if the upstream has started creating, without waiting on it.
    ///
    /// Lets a caller that drives creation itself hold the trigger `Armed`
    /// for the whole creation window.
    pub fn observe_upstream(&self) -> TriggerState {
        if self.inner.upstream.status() == ClusterStatus::Creating
            && self.transition(TriggerState::Pending, TriggerState::Armed, None)
        {
            info!(trigger = %self.id(), "Trigger armed, waiting for readiness");
        }
        self.state()
    }

    /// Follow the upstream readiness signal and fire when it is observed.
    ///
    /// Returns the state reached. An upstream failure surfaces as
    /// `Error::Provisioning` with the trigger left unfired; a rollback or a
    /// dropped signal returns the current, unfired state. With
    /// `InvocationType::RequestResponse` a failed job is returned as the
    /// job's error once the trigger has moved to `Failed`.
    #[instrument(skip_all, fields(trigger = %self.id(), upstream = %self.inner.upstream.id()))]
    pub async fn run(&self) -> Result<TriggerState> {
        let mut signal = self.inner.upstream.subscribe();

        loop {
            let status = signal.borrow_and_update().clone();
            match status {
                ClusterStatus::Declared => {}
                ClusterStatus::Creating => {
                    self.transition(TriggerState::Pending, TriggerState::Armed, None);
                }
                ClusterStatus::Ready { endpoint } => {
                    self.transition(TriggerState::Pending, TriggerState::Armed, None);
                    return self.fire(&endpoint).await;
                }
                ClusterStatus::Failed { reason } => {
                    warn!(%reason, "Upstream failed, trigger will not fire");
                    return Err(Error::provisioning(self.inner.upstream.id(), reason));
                }
                ClusterStatus::RolledBack => {
                    warn!("Upstream rolled back, trigger will not fire");
                    return Ok(self.state());
                }
            }

            if signal.changed().await.is_err() {
                warn!("Upstream signal closed before readiness");
                return Ok(self.state());
            }
        }
    }

    async fn fire(&self, endpoint: &Endpoint) -> Result<TriggerState> {
        let invocation = Uuid::new_v4();
        if !self.transition(TriggerState::Armed, TriggerState::Fired, Some(invocation)) {
            // Fired by someone else, or terminal and not re-armed
            return Ok(self.state());
        }
        info!(%invocation, job = %self.inner.job.id(), "Trigger fired");

        match self.inner.job.invoke(endpoint).await {
            Ok(report) => {
                self.transition(TriggerState::Fired, TriggerState::Succeeded, None);
                let duration_ms = report.duration.as_millis() as u64;
                info!(%invocation, duration_ms, "Trigger succeeded");
            }
            Err(e) => {
                self.lock().last_error = Some(e.to_string());
                self.transition(TriggerState::Fired, TriggerState::Failed, None);
                warn!(%invocation, error = %e, "Trigger failed, infrastructure left in place");
                if self.inner.definition.invocation_type == InvocationType::RequestResponse {
                    return Err(e);
                }
            }
        }
        Ok(self.state())
    }

    /// Compare-and-set on the state; records the transition when it applies
    fn transition(&self, from: TriggerState, to: TriggerState, invocation: Option<Uuid>) -> bool {
        let mut record = self.lock();
        if record.state != from || !from.can_transition(to) {
            return false;
        }
        record.state = to;
        record.history.push(Transition {
            from,
            to,
            at: Utc::now(),
            invocation,
        });
        true
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Record> {
        self.inner.record.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
