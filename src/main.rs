use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, warn};
use opsbot::ai::{MockBackend, OllamaBackend, OpenAIBackend, ReasoningProvider};
use opsbot::alerts::{LogNotifier, Notifier, SlackNotifier, WebhookNotifier};
use opsbot::collectors::{CommandEvidence, PrometheusSource};
use opsbot::config::{AIBackendConfig, AlertConfig, Config, DiagnosisConfig};
use opsbot::error::ConfigError;
use opsbot::ledger::JsonlStore;
use opsbot::remediation::SystemEffector;
use opsbot::{Collaborators, Orchestrator};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Environment variable consulted when an OpenAI-compatible backend names
/// no key
const DEFAULT_API_KEY_ENV: &str = "OPENAI_API_KEY";

/// Environment variable consulted when no Slack token is configured
const SLACK_TOKEN_ENV: &str = "SLACK_BOT_TOKEN";

/// Command-line arguments for the operations agent
#[derive(Parser)]
#[command(
    name = "opsbot",
    about = "Autonomous operations agent - detects anomalies, diagnoses them and remediates",
    long_about = "Samples infrastructure metrics, opens an incident for every sustained threshold \
                  violation, asks a reasoning provider for a root cause and, when policy allows, \
                  runs one bounded remediation action. Every incident is recorded in an \
                  append-only ledger."
)]
struct Cli {
    /// Path to configuration file
    #[arg(
        short,
        long,
        value_name = "FILE",
        help = "Configuration file path (TOML format)"
    )]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(
        short,
        long,
        help = "Enable verbose logging output (sets RUST_LOG=debug)"
    )]
    verbose: bool,

    /// Diagnose and report only
    #[arg(long, help = "Never execute remediation actions, whatever the configuration says")]
    no_remediate: bool,
}

impl Cli {
    /// Validate the CLI arguments
    ///
    /// Missing configuration files are accepted here; [`load_config`] falls
    /// back to defaults for them.
    fn validate(&self) -> Result<(), String> {
        if let Some(ref config_path) = self.config {
            if config_path.exists() {
                if !config_path.is_file() {
                    return Err(format!(
                        "Configuration path is not a file: {}",
                        config_path.display()
                    ));
                }

                if let Some(extension) = config_path.extension() {
                    if extension != "toml" {
                        warn!(
                            "Configuration file does not have .toml extension: {}",
                            config_path.display()
                        );
                    }
                }
            }
        }

        Ok(())
    }
}

/// Load and validate the configuration
///
/// A missing file means defaults, with a warning. A file that exists but
/// cannot be read, parsed or validated is an error.
fn load_config(path: Option<&Path>) -> Result<Config, ConfigError> {
    let config = match path {
        Some(path) if !path.exists() => {
            warn!(
                "Configuration file '{}' not found, using defaults",
                path.display()
            );
            Config::default()
        }
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            Config::from_file(path)?
        }
        None => {
            info!("Using default configuration");
            Config::default()
        }
    };

    config.validate()?;
    Ok(config)
}

/// The inline key, else the named environment variable, else
/// `OPENAI_API_KEY`; empty when none is set
fn resolve_api_key(api_key: Option<&str>, api_key_env: Option<&str>) -> String {
    if let Some(key) = api_key.filter(|key| !key.is_empty()) {
        return key.to_string();
    }
    let var = api_key_env.unwrap_or(DEFAULT_API_KEY_ENV);
    std::env::var(var).unwrap_or_default()
}

/// The configured Slack token, else `SLACK_BOT_TOKEN`
fn resolve_slack_token(configured: Option<&str>) -> Option<String> {
    configured
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .or_else(|| std::env::var(SLACK_TOKEN_ENV).ok())
        .filter(|token| !token.is_empty())
}

fn build_notifiers(config: &AlertConfig) -> Result<Vec<Arc<dyn Notifier>>> {
    let timeout = Duration::from_secs(config.webhook_timeout_seconds);
    let mut notifiers: Vec<Arc<dyn Notifier>> = vec![Arc::new(LogNotifier)];

    if let Some(url) = &config.webhook_url {
        let webhook = WebhookNotifier::new(url.clone(), timeout)
            .context("Failed to create webhook notifier")?;
        info!("Webhook notifications enabled");
        notifiers.push(Arc::new(webhook));
    }

    if let Some(token) = resolve_slack_token(config.slack_token.as_deref()) {
        let slack = SlackNotifier::new(token, config.slack_channel.clone(), timeout)
            .context("Failed to create Slack notifier")?;
        info!("Slack notifications enabled for {}", config.slack_channel);
        notifiers.push(Arc::new(slack));
    }

    Ok(notifiers)
}

fn build_provider(config: &DiagnosisConfig) -> Result<Arc<dyn ReasoningProvider>> {
    let request_timeout = config.call_timeout();
    let provider: Arc<dyn ReasoningProvider> = match &config.backend {
        AIBackendConfig::Ollama { endpoint, model } => Arc::new(
            OllamaBackend::new(endpoint.clone(), model.clone(), request_timeout)
                .context("Failed to create Ollama backend")?,
        ),
        AIBackendConfig::OpenAI {
            api_key,
            api_key_env,
            model,
            base_url,
        } => {
            let key = resolve_api_key(api_key.as_deref(), api_key_env.as_deref());
            if key.is_empty() {
                warn!("No API key configured for the OpenAI-compatible backend");
            }
            let backend = match base_url {
                Some(base_url) => OpenAIBackend::with_base_url(
                    key,
                    model.clone(),
                    base_url.clone(),
                    request_timeout,
                ),
                None => OpenAIBackend::new(key, model.clone(), request_timeout),
            };
            Arc::new(backend.context("Failed to create OpenAI-compatible backend")?)
        }
        AIBackendConfig::Mock => {
            warn!("Using the mock reasoning provider; no real diagnosis will happen");
            Arc::new(MockBackend::success())
        }
    };
    info!("Reasoning provider: {}", provider.name());
    Ok(provider)
}

async fn build_collaborators(config: &Config) -> Result<Collaborators> {
    let source =
        PrometheusSource::new(&config.source).context("Failed to create Prometheus source")?;

    let store = JsonlStore::open(config.ledger.path.clone())
        .await
        .with_context(|| format!("Failed to open ledger at {}", config.ledger.path.display()))?;

    Ok(Collaborators {
        source: Arc::new(source),
        provider: build_provider(&config.diagnosis)?,
        effector: Arc::new(SystemEffector::new()),
        evidence: Arc::new(CommandEvidence::new(config.evidence.clone())),
        store: Arc::new(store),
        notifiers: build_notifiers(&config.alerts)?,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        std::env::set_var("RUST_LOG", "debug");
    }
    env_logger::init();

    info!("Starting opsbot");

    if let Err(e) = cli.validate() {
        error!("Invalid arguments: {}", e);
        anyhow::bail!(e);
    }

    let mut config = load_config(cli.config.as_deref()).context("Failed to load configuration")?;
    if cli.no_remediate {
        info!("Remediation disabled from the command line");
        config.policy.auto_remediation = false;
    }

    let collaborators = build_collaborators(&config).await?;
    let orchestrator = Orchestrator::new(config, collaborators);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    ctrlc::set_handler(move || {
        info!("Received interrupt signal, shutting down gracefully...");
        if shutdown_tx.send(true).is_err() {
            error!("Failed to send shutdown signal");
        }
    })
    .context("Error setting interrupt handler")?;

    info!("opsbot is running. Press Ctrl+C to stop.");

    orchestrator
        .run(shutdown_rx)
        .await
        .context("Agent stopped with an error")?;

    info!("opsbot shutdown complete");
    Ok(())
}
