//! Provisioning engine seam
//!
//! The engine realizes declared resources against a live target. The core
//! only hands it nodes in dependency order and records what happened.

use crate::error::Result;
use crate::graph::ResourceNode;
use crate::trigger::TriggerState;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;

/// Outcome of realizing one resource
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Realized {
    /// Network address, for resources that have one
    pub endpoint_host: Option<String>,
}

/// External engine that creates resources
#[async_trait]
pub trait ProvisioningEngine: Send + Sync {
    /// Create `node` and return once it is fully provisioned
    async fn realize(&self, node: &ResourceNode) -> Result<Realized>;
}

/// What an apply pass did
#[derive(Debug, Clone, Default, Serialize)]
pub struct ApplyReport {
    /// Realized resources, in order
    pub realized: Vec<String>,
    /// Resources that failed, with the reason
    pub failed: Vec<(String, String)>,
    /// Resources not attempted because a dependency failed
    pub skipped: Vec<String>,
    /// State reached by each trigger that was run
    pub triggers: BTreeMap<String, TriggerState>,
}

impl ApplyReport {
    /// No resource failed and every trigger succeeded
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
            && self.skipped.is_empty()
            && self.triggers.values().all(|s| *s == TriggerState::Succeeded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_success_requires_successful_triggers() {
        let mut report = ApplyReport::default();
        assert!(report.is_success());

        report.triggers.insert("trigger:init".to_string(), TriggerState::Failed);
        assert!(!report.is_success());

        report.triggers.insert("trigger:init".to_string(), TriggerState::Succeeded);
        report.skipped.push("job:init".to_string());
        assert!(!report.is_success());
    }
}
