use std::sync::Arc;

use anyhow::Context;

use botgate_control::{
    ControlConfig, InstanceHealthPoller, InstanceRegistry, LifecycleController, LocalRunner,
    StartOutcome, telemetry,
};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ControlConfig::from_env();
    let _log_guard = telemetry::init(&config)?;

    let runner = Arc::new(LocalRunner::new(
        config.bots.clone(),
        config.skip_console_bot_creation,
    ));
    tracing::info!(bots = config.bots.len(), "bot runner ready");

    let registry = InstanceRegistry::new().context("building health probe client")?;
    let controller = LifecycleController::new(config.clone(), registry.clone(), runner);

    let port = match controller.start(config.preferred_port).await {
        StartOutcome::Started(port) => port,
        StartOutcome::AlreadyRunning => {
            anyhow::bail!("control plane already running")
        }
        StartOutcome::Failed(e) => {
            return Err(anyhow::Error::new(e).context(format!(
                "could not start control plane from port {}",
                config.preferred_port
            )));
        }
    };
    tracing::info!(port, "control plane ready");

    let shutdown = CancellationToken::new();
    let poller = config.probe_interval.map(|interval| {
        InstanceHealthPoller::new(registry.clone(), interval, config.probe_timeout)
            .spawn(shutdown.clone())
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");

    shutdown.cancel();
    if let Some(poller) = poller {
        let _ = poller.await;
    }
    controller.stop(config.stop_timeout).await;

    Ok(())
}
