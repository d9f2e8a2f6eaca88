//! # EdgeSync Agent
//!
//! Runs an endpoint configured from the environment and exposes a `system`
//! node describing the agent itself.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use edgesync_core::{AttributeType, Constraint, Node};
use edgesync_endpoint::{CloudLogLayer, Endpoint, EndpointConfig};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const DEFAULT_HEARTBEAT_SECS: i64 = 10;

fn system_node() -> Result<Node> {
    let node = Node::new("system");
    node.declare_interface("edgesync.agent")?;
    let runtime = node.add_object("runtime")?;
    runtime
        .add_attribute("version", Constraint::Static, AttributeType::STRING)?
        .set_static_value(env!("CARGO_PKG_VERSION"))?;
    runtime.add_attribute("uptime", Constraint::Measure, AttributeType::INTEGER)?;
    runtime.add_attribute("heartbeatInterval", Constraint::Parameter, AttributeType::INTEGER)?;
    Ok(node)
}

/// Uptime reporting period, set from the broker.
fn heartbeat(node: &Node) -> Duration {
    let seconds = node
        .object("runtime")
        .and_then(|runtime| runtime.attribute("heartbeatInterval"))
        .and_then(|attribute| match attribute.value() {
            Some(edgesync_core::Value::Integer(seconds)) => Some(seconds),
            _ => None,
        })
        .filter(|seconds| *seconds > 0)
        .unwrap_or(DEFAULT_HEARTBEAT_SECS);
    Duration::from_secs(seconds.unsigned_abs())
}

#[tokio::main]
async fn main() -> Result<()> {
    let (cloud_layer, cloud_handle) = CloudLogLayer::new();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish()
        .with(cloud_layer)
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting EdgeSync agent"
    );

    let config = EndpointConfig::from_env()?;
    let endpoint = Endpoint::builder(config.endpoint_id.clone())
        .config(config)
        .cloud_logging(cloud_handle)
        .build()
        .context("Failed to create endpoint")?;

    let node = system_node().context("Failed to build system node")?;
    endpoint
        .add_node(&node)
        .context("Failed to register system node")?;
    let uptime = node
        .object("runtime")
        .and_then(|runtime| runtime.attribute("uptime"))
        .context("System node has no uptime attribute")?;

    let supervisor = endpoint.start()?;
    let started = Instant::now();

    tracing::info!(endpoint = endpoint.id(), "Agent running, press Ctrl+C to stop");

    loop {
        tokio::select! {
            () = tokio::time::sleep(heartbeat(&node)) => {
                let seconds = i64::try_from(started.elapsed().as_secs()).unwrap_or(i64::MAX);
                if let Err(e) = uptime.set_value(seconds) {
                    tracing::warn!(error = %e, "Failed to update uptime");
                }
            }
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for Ctrl+C")?;
                tracing::info!("Shutting down");
                break;
            }
        }
    }

    supervisor.cancel();
    endpoint.close().await?;
    Ok(())
}
