use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use mendloop_core::event::{check_activation, check_event_syntax};
use mendloop_core::history::{HistoryDataManager, HistoryStore, JsonlHistoryBackend, NoopHistoryStore};
use mendloop_core::notification::ChannelHost;
use mendloop_core::observability::init_tracing;
use mendloop_core::{
    ActorService, Config, ControlLoopDefinition, ControlLoopEvent, ControlLoopNotification,
    ControlLoopProcessor, EngineServices, EventManager, FinalResult, NotificationType,
    TransactionMetrics,
};
use mendloop_sim::{register_all, Scenario};

#[derive(Parser)]
#[command(name = "mendloop")]
#[command(about = "Closed-loop fault remediation runner", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Process one event against a control-loop definition
    Run {
        /// Control-loop definition (YAML)
        #[arg(long)]
        definition: PathBuf,

        /// Onset event (JSON)
        #[arg(long)]
        event: PathBuf,

        /// Scenario for the simulated actors (YAML)
        #[arg(long)]
        scenario: Option<PathBuf>,

        /// Skip guard queries
        #[arg(long)]
        no_guard: bool,

        /// Print transaction metrics (Prometheus text format) to stderr when done
        #[arg(long)]
        metrics: bool,
    },
    /// Parse and check a control-loop definition
    Validate {
        definition: PathBuf,
    },
    /// Run the syntax and activation checks on an event
    CheckEvent {
        event: PathBuf,
    },
}

#[tokio::main]
async fn main() -> color_eyre::Result<ExitCode> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let config = load_config(cli.config.as_deref())
        .map_err(|e| color_eyre::eyre::eyre!("{:#}", e))?;
    init_tracing(&config.logging);

    let succeeded = match cli.command {
        Commands::Run {
            definition,
            event,
            scenario,
            no_guard,
            metrics,
        } => {
            run(
                config,
                &definition,
                &event,
                scenario.as_deref(),
                no_guard,
                metrics,
            )
            .await
        }
        Commands::Validate { definition } => validate(&definition),
        Commands::CheckEvent { event } => check_event(&event),
    }
    .map_err(|e| color_eyre::eyre::eyre!("{:#}", e))?;

    Ok(if succeeded {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display())),
        None => {
            let mut config = Config::default();
            config.apply_env_overrides();
            config.validate()?;
            Ok(config)
        }
    }
}

fn load_event(path: &Path) -> Result<ControlLoopEvent> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read event {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("Invalid event JSON in {}", path.display()))
}

fn load_definition(path: &Path) -> Result<ControlLoopDefinition> {
    ControlLoopDefinition::from_file(path)
        .with_context(|| format!("Failed to load definition {}", path.display()))
}

fn print_notification(notification: &ControlLoopNotification) -> Result<()> {
    println!("{}", serde_json::to_string(notification)?);
    Ok(())
}

async fn run(
    mut config: Config,
    definition: &Path,
    event: &Path,
    scenario: Option<&Path>,
    no_guard: bool,
    print_metrics: bool,
) -> Result<bool> {
    if no_guard {
        config.engine.guard_enabled = false;
    }
    let processor = ControlLoopProcessor::new(load_definition(definition)?)
        .context("Control-loop definition is invalid")?;
    let event = load_event(event)?;
    let scenario = match scenario {
        Some(path) => Scenario::from_file(path)
            .with_context(|| format!("Failed to load scenario {}", path.display()))?,
        None => Scenario::default(),
    };

    let mut actors = ActorService::new();
    register_all(&mut actors, &scenario)?;

    let history_manager = match (&config.history.path, config.history.enabled) {
        (Some(path), true) => Some(Arc::new(HistoryDataManager::new(
            &config.history,
            Arc::new(JsonlHistoryBackend::new(path)),
        ))),
        _ => None,
    };
    let history: Arc<dyn HistoryStore> = match &history_manager {
        Some(manager) => manager.clone(),
        None => Arc::new(NoopHistoryStore),
    };

    let metrics = if config.metrics.enabled || print_metrics {
        Some(Arc::new(TransactionMetrics::new(&config.metrics)?))
    } else {
        None
    };

    let mut services = EngineServices::new(actors)
        .with_history(history)
        .with_config(config.engine.clone());
    if let Some(metrics) = &metrics {
        services = services.with_metrics(metrics.clone());
    }

    let manager = match EventManager::new(services, Box::new(processor), event.clone()) {
        Ok(manager) => manager,
        Err(e) => {
            tracing::warn!("Event rejected: {}", e);
            let rejected = ControlLoopNotification::for_event(&event, NotificationType::Rejected)
                .with_message(e.to_string());
            print_notification(&rejected)?;
            if let Some(metrics) = &metrics {
                metrics.transaction_event(&rejected);
            }
            report_metrics(metrics.as_deref(), print_metrics)?;
            return Ok(false);
        }
    };

    let (host, mut notifications) = ChannelHost::new();
    manager.register(Arc::new(host));
    manager.start()?;

    let mut final_type = None;
    loop {
        tokio::select! {
            received = notifications.recv() => {
                let Some(notification) = received else {
                    break;
                };
                print_notification(&notification)?;
                if notification.notification.is_final() {
                    final_type = Some(notification.notification);
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("Interrupted, aborting control loop");
                manager.abort(
                    mendloop_core::EventState::Done,
                    FinalResult::FinalFailure,
                    "Control loop interrupted",
                );
            }
        }
    }
    manager.destroy();

    if let Some(history) = history_manager {
        history.stop().await;
    }

    tracing::info!(
        request_id = %manager.request_id(),
        result = ?manager.final_result(),
        "Control loop complete"
    );
    report_metrics(metrics.as_deref(), print_metrics)?;
    Ok(matches!(
        final_type,
        Some(NotificationType::FinalSuccess) | Some(NotificationType::FinalOpenloop)
    ))
}

fn report_metrics(metrics: Option<&TransactionMetrics>, print: bool) -> Result<()> {
    let Some(metrics) = metrics else {
        return Ok(());
    };
    for record in metrics.completed() {
        tracing::info!(
            request_id = %record.request_id,
            notification = %record.notification,
            status = record.status.as_str(),
            elapsed = ?record.elapsed,
            "Transaction"
        );
    }
    if print {
        eprint!("{}", metrics.encode()?);
    }
    Ok(())
}

fn validate(path: &Path) -> Result<bool> {
    let definition = load_definition(path)?;
    definition.validate().context("Control-loop definition is invalid")?;

    println!(
        "{} {} (trigger: {})",
        definition.control_loop.name,
        definition.control_loop.version.as_deref().unwrap_or("-"),
        definition.control_loop.trigger_policy
    );
    for policy in &definition.policies {
        println!(
            "  {}: {} {} retries={} timeout={}s success={} failure={}",
            policy.id,
            policy.actor,
            policy.operation,
            policy.retries,
            policy.timeout,
            policy.success,
            policy.failure
        );
    }
    Ok(true)
}

fn check_event(path: &Path) -> Result<bool> {
    let event = load_event(path)?;
    let checked = check_event_syntax(&event).and_then(|_| {
        if event.is_onset() {
            check_activation(&event)
        } else {
            Ok(())
        }
    });
    match checked {
        Ok(()) => {
            println!("OK");
            Ok(true)
        }
        Err(e) => {
            println!("{}", e);
            Ok(false)
        }
    }
}
