use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use tidings::clock::{SharedClock, SystemClock};
use tidings::config::watcher::SettingsWatcher;
use tidings::config::Settings;
use tidings::metrics::{MetricsAggregator, WeeklyReportFactory, WEEKLY_REPORT_JOB};
use tidings::pipeline::{
    CoalesceQueue, CooldownGate, DedupeFilter, PermitGate, Processor, RetryPolicy,
};
use tidings::scheduler::job::{jobs_from_settings, ProviderRegistry};
use tidings::scheduler::SchedulerService;
use tidings::sender::{
    DiscordConfig, DiscordSender, MisskeyConfig, MisskeySender, SenderRegistry,
};

#[derive(Parser)]
#[command(name = "tidings", about = "Autonomous posting bot", version)]
struct Cli {
    /// Path to the settings document.
    #[arg(long, default_value = "config/settings.json")]
    config: PathBuf,

    /// Validate the configuration and exit.
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = tidings::logging::init() {
        eprintln!("failed to initialize logging: {e}");
        return ExitCode::from(1);
    }

    let settings = match Settings::load(&cli.config) {
        Ok(settings) => Arc::new(settings),
        Err(e) => {
            error!(path = %cli.config.display(), error = %e, "invalid configuration");
            return ExitCode::from(2);
        }
    };

    if cli.check {
        info!(path = %cli.config.display(), "configuration is valid");
        return ExitCode::SUCCESS;
    }

    match run(cli.config, settings).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(
            e @ (tidings::Error::Configuration(_)
            | tidings::Error::Validation(_)
            | tidings::Error::UnknownProvider(_)),
        ) => {
            error!(error = %e, "invalid configuration");
            ExitCode::from(2)
        }
        Err(e) => {
            error!(error = %e, "startup failed");
            ExitCode::from(1)
        }
    }
}

async fn run(config_path: PathBuf, settings: Arc<Settings>) -> tidings::Result<()> {
    let clock: SharedClock = Arc::new(SystemClock);
    let metrics = Arc::new(MetricsAggregator::new());
    let shutdown = CancellationToken::new();
    let abort = CancellationToken::new();

    let senders = build_senders(&settings)?;

    let mut registry = ProviderRegistry::builtin();
    registry.register(
        format!("builtin:{WEEKLY_REPORT_JOB}"),
        Arc::new(WeeklyReportFactory::new(metrics.clone(), clock.clone())),
    );
    let jobs = jobs_from_settings(&settings, &registry)?;
    if jobs.is_empty() {
        info!("no jobs configured; the scheduler will idle");
    }

    let queue = Arc::new(CoalesceQueue::new(
        settings.scheduler.coalesce_window_seconds,
        settings.scheduler.coalesce_threshold,
    ));
    let processor = Arc::new(Processor::new(
        senders,
        CooldownGate::from_settings(&settings.cooldown),
        DedupeFilter::from_settings(&settings.dedupe),
        PermitGate::from_settings(&settings.quotas),
        RetryPolicy::from_settings(&settings.retry),
        metrics.clone(),
        clock.clone(),
        abort.clone(),
    ));
    let service = Arc::new(SchedulerService::new(
        jobs,
        queue,
        processor,
        metrics.clone(),
        clock.clone(),
        settings.timezone(),
        &settings.scheduler,
        abort.clone(),
    ));

    let (watcher, _settings_rx) = SettingsWatcher::new(&config_path, settings);
    let watcher_task = tokio::spawn(watcher.run(shutdown.clone()));

    let slot_task = {
        let service = service.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { service.run_slots(shutdown).await })
    };
    let dispatch_task = {
        let service = service.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { service.run_dispatch(shutdown).await })
    };

    info!("tidings started");
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    shutdown.cancel();

    let _ = slot_task.await;
    let _ = dispatch_task.await;
    let _ = watcher_task.await;
    info!("tidings stopped");
    Ok(())
}

/// Wire the platform adapters selected by the profiles section.
/// Credentials come from the environment.
fn build_senders(settings: &Settings) -> tidings::Result<SenderRegistry> {
    let mut registry = SenderRegistry::new();

    if settings.profiles.discord.enabled {
        let sender = DiscordSender::new(DiscordConfig::from_env());
        if !sender.is_configured() {
            return Err(tidings::Error::config(
                "discord profile enabled but DISCORD_BOT_TOKEN is not set",
            ));
        }
        registry.register(Arc::new(sender));
    }
    if settings.profiles.misskey.enabled {
        let sender = MisskeySender::new(MisskeyConfig::from_env());
        if !sender.is_configured() {
            return Err(tidings::Error::config(
                "misskey profile enabled but MISSKEY_TOKEN is not set",
            ));
        }
        registry.register(Arc::new(sender));
    }

    if registry.is_empty() {
        return Err(tidings::Error::config("no sender profile is enabled"));
    }
    Ok(registry)
}
