//! `tern run`: start the gateway (channels + agent loop + scheduler).

use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use tern_channels::{Channel, CliChannel};
use tern_core::bus::MessageBus;
use tern_core::cron::CronService;

use crate::commands::{build_agent_loop, state_dir};
use crate::config::load_config;

/// Wire everything together and run until ctrl-c.
pub async fn run() -> Result<()> {
    let config = load_config()?;
    let bus = Arc::new(MessageBus::new());
    let cancel = CancellationToken::new();

    let cron_service = Arc::new(CronService::new(state_dir().join("cron").join("jobs.json")));
    let agent = Arc::new(build_agent_loop(&config, bus.clone(), Some(cron_service.clone()))?);

    // Outbound dispatcher.
    let dispatcher_bus = bus.clone();
    let dispatcher_cancel = cancel.clone();
    let dispatcher =
        tokio::spawn(async move { dispatcher_bus.run_dispatcher(dispatcher_cancel).await });

    // Cron scheduler.
    let cron_bus = bus.clone();
    let cron_cancel = cancel.clone();
    let cron_task =
        tokio::spawn(async move { cron_service.run(cron_bus, cron_cancel).await });

    // CLI channel: subscribe for outbound, then read stdin.
    let mut channel_task = None;
    if config.channels.cli.enabled {
        let channel = Arc::new(CliChannel::new(bus.clone()));
        let send_channel = channel.clone();
        bus.subscribe_outbound(
            "cli",
            Arc::new(move |msg| {
                let channel = send_channel.clone();
                Box::pin(async move {
                    if let Err(e) = channel.send(&msg).await {
                        warn!(error = %e, "cli channel send failed");
                    }
                })
            }),
        )
        .await;

        let channel_cancel = cancel.clone();
        channel_task = Some(tokio::spawn(async move {
            if let Err(e) = channel.start(channel_cancel).await {
                warn!(error = %e, "cli channel exited with error");
            }
        }));
    }
    if config.channels.web.enabled {
        // The web transport is an external collaborator; it attaches to
        // the same bus contract when present.
        warn!("web channel enabled in config but no web transport is linked into this build");
    }

    // Agent loop in the foreground task.
    let agent_cancel = cancel.clone();
    let agent_task = tokio::spawn(async move { agent.run(agent_cancel).await });

    info!("tern gateway running; press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    cancel.cancel();

    let _ = agent_task.await;
    let _ = dispatcher.await;
    let _ = cron_task.await;
    if let Some(task) = channel_task {
        let _ = task.await;
    }
    Ok(())
}
