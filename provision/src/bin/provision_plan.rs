//! Render the database stack plan
//!
//! Builds the stack from the environment and prints the ordered resource
//! graph as JSON. `DB_CLIENTS` names extra boundaries (comma separated)
//! that are granted access to the database port.

use anyhow::{Context, Result};
use common::{init_logging, ConfigExt, Telemetry, TelemetryEvent};
use provision::{
    Collaborators, DatabaseStack, DeploymentContext, InMemoryObjectStore, InMemorySecretBackend,
    NetworkBoundary, PsqlApplier, RdsConfig, StackOptions,
};
use std::sync::Arc;
use tracing::info;

fn build() -> Result<(DatabaseStack, serde_json::Value)> {
    let ctx = DeploymentContext::from_env()?;
    let config = RdsConfig::load()?;
    let options = StackOptions::from_env()?;

    // Planning never touches live secrets or payloads
    let stack = DatabaseStack::new(
        &ctx,
        &config,
        options,
        Collaborators {
            secrets: Arc::new(InMemorySecretBackend::new()),
            objects: Arc::new(InMemoryObjectStore::new()),
            applier: Arc::new(PsqlApplier),
        },
    )
    .context("Invalid stack declaration")?;

    let port = u32::from(stack.cluster().port().get());
    for client in String::env_list("DB_CLIENTS") {
        let peer = NetworkBoundary::new(&ctx, &client);
        stack
            .add_client(&peer, port, Some("application client"), true)
            .with_context(|| format!("Failed to admit {}", client))?;
        info!(client = %client, port, "Client admitted");
    }

    let plan = stack.plan()?;
    Ok((stack, plan))
}

fn main() -> Result<()> {
    let _guard = init_logging("provision-plan");
    let telemetry = Telemetry::from_env("provision-plan");

    telemetry.send(TelemetryEvent::ComponentStarted {
        component: "provision-plan".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    });

    let (stack, plan) = match build() {
        Ok(built) => built,
        Err(e) => {
            let _ = telemetry.send_sync(TelemetryEvent::ComponentError {
                component: "provision-plan".to_string(),
                error: format!("{:#}", e),
                context: "plan".to_string(),
            });
            return Err(e);
        }
    };

    println!("{}", serde_json::to_string_pretty(&plan)?);

    let resources = plan["resources"].as_array().map_or(0, Vec::len);
    let _ = telemetry.send_sync(TelemetryEvent::PlanGenerated {
        stack: stack.context().stack_name.clone(),
        resources,
    });
    Ok(())
}
