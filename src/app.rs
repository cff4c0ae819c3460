//! Builds the monitor from [`Settings`] and dispatches subcommands.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use costwatch_core::{
    shutdown_channel, CommandUsageSource, JsonStateStore, PidFileLock, ProcessUsageCommand,
    Scheduler, SchedulerConfig, ShutdownTrigger, StateStore, SystemClock, WebhookSink,
};

use crate::config::{Command, Settings};

/// Scheduler wired to the real usage command, webhook, state file and lock
pub type Monitor = Scheduler<CommandUsageSource<ProcessUsageCommand>, WebhookSink>;

pub fn build_monitor(settings: &Settings) -> Result<Monitor> {
    let state_dir = settings.state_dir()?;
    let command = ProcessUsageCommand::from_argv(&settings.usage_command)
        .context("usage_command must name a program")?;

    let source = CommandUsageSource::new(command)
        .with_guard_timeout(Duration::from_secs(settings.guard_timeout_secs))
        .with_fetch_timeout(Duration::from_secs(settings.fetch_timeout_secs))
        .with_max_output_bytes(settings.max_output_bytes);

    let sink = settings.webhook_url.as_ref().map(|url| {
        WebhookSink::new(url.clone()).with_timeout(Duration::from_secs(settings.sink_timeout_secs))
    });

    Ok(Scheduler::new(
        SchedulerConfig {
            threshold: settings.threshold_usd,
            interval: Duration::from_secs(settings.interval_secs),
            lock_name: settings.lock_name.clone(),
        },
        Arc::new(SystemClock),
        source,
        sink,
        Box::new(JsonStateStore::new(settings.state_file()?)),
        Box::new(PidFileLock::new(state_dir)),
    ))
}

/// Run the selected subcommand to completion
pub async fn execute(command: Command, settings: &Settings) -> Result<()> {
    match command {
        Command::Run => run(settings).await,
        Command::Check => check(settings).await,
        Command::Status => {
            print!("{}", status_report(settings)?);
            Ok(())
        }
    }
}

async fn run(settings: &Settings) -> Result<()> {
    if settings.webhook_url.is_none() {
        warn!("No webhook_url configured; threshold breaches will only be logged");
    }

    let mut monitor = build_monitor(settings)?;
    let (trigger, listener) = shutdown_channel();
    tokio::spawn(forward_signals(trigger));

    monitor.run(listener).await?;
    Ok(())
}

async fn check(settings: &Settings) -> Result<()> {
    let mut monitor = build_monitor(settings)?;
    let result = monitor.run_once().await?;
    info!(
        exceeded = result.exceeded,
        notification_sent = result.notification_sent,
        "Check complete"
    );
    Ok(())
}

/// Persisted state and the current lock holder, as printed by `status`
pub fn status_report(settings: &Settings) -> Result<String> {
    let state_dir = settings.state_dir()?;
    let store = JsonStateStore::new(settings.state_file()?);
    let state = store.load()?;
    let holder = PidFileLock::new(&state_dir).holder(&settings.lock_name)?;

    let mut out = String::new();
    out.push_str(&format!("State file: {}\n", store.path().display()));
    out.push_str(&format!(
        "Last notification: {}\n",
        state
            .last_notification_date
            .map_or_else(|| "never".to_string(), |d| d.to_string())
    ));
    out.push_str(&format!(
        "Last exceedance: {}\n",
        state
            .last_exceedance_date
            .map_or_else(|| "never".to_string(), |d| d.to_string())
    ));
    out.push_str(&match holder {
        Some(pid) => format!("Monitor: running (pid {})\n", pid),
        None => "Monitor: not running\n".to_string(),
    });
    Ok(out)
}

/// Fire `trigger` on SIGINT or SIGTERM
async fn forward_signals(trigger: ShutdownTrigger) {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
                _ = term.recv() => info!("Received SIGTERM"),
            }
        }
        Err(err) => {
            warn!(error = %err, "Failed to install SIGTERM handler; only Ctrl-C stops the monitor");
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = %err, "Failed to listen for Ctrl-C");
                return;
            }
            info!("Received SIGINT");
        }
    }
    trigger.trigger();
}
