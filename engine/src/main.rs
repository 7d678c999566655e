use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{error, info};
use uuid::Uuid;

use tradepal_core::{resolve_model_requests, ApiKeys, ConfigStore, ResultBoard, SlotState};
use tradepal_observability::{init_process_logging, logs_dir, ProcessKind};
use tradepal_server::{serve, AppState};
use tradepal_types::ProviderId;
use tradepal_vault::{CredentialStore, FileStorage, MemoryStorage};

const LOG_RETENTION: Duration = Duration::from_secs(14 * 24 * 60 * 60);

const PROVIDER_KEY_VARS: [(ProviderId, &[&str]); 4] = [
    (ProviderId::OpenAi, &["OPENAI_API_KEY"]),
    (ProviderId::Anthropic, &["ANTHROPIC_API_KEY"]),
    (ProviderId::Google, &["GOOGLE_API_KEY", "GEMINI_API_KEY"]),
    (ProviderId::OpenRouter, &["OPENROUTER_API_KEY"]),
];

#[derive(Parser, Debug)]
#[command(name = "tradepal-engine")]
#[command(about = "TradePal multi-model comparison engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP API.
    Serve {
        #[arg(long, alias = "host", env = "TRADEPAL_HOST")]
        hostname: Option<String>,
        #[arg(long, env = "TRADEPAL_PORT")]
        port: Option<u16>,
        #[arg(long, env = "TRADEPAL_STATE_DIR")]
        state_dir: Option<String>,
        #[arg(long)]
        config: Option<String>,
    },
    /// Send one prompt to several models and print each answer.
    Compare {
        prompt: String,
        /// `provider:model`, repeatable.
        #[arg(long = "model", required = true)]
        models: Vec<String>,
        #[arg(long, env = "TRADEPAL_STATE_DIR")]
        state_dir: Option<String>,
        #[arg(long)]
        config: Option<String>,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            hostname,
            port,
            state_dir,
            config,
        } => {
            let state_dir = resolve_state_dir(state_dir);
            let _log_guard =
                init_process_logging(ProcessKind::Engine, &logs_dir(&state_dir), LOG_RETENTION)?;

            let config_path = resolve_config_path(&state_dir, config);
            let store = ConfigStore::new(&config_path, build_cli_overrides(hostname, port)).await?;
            let app_config = store.get();
            let server = &app_config.server;
            let addr: SocketAddr = format!("{}:{}", server.hostname, server.port)
                .parse()
                .context("invalid hostname or port")?;

            let startup_attempt_id = Uuid::new_v4().to_string();
            log_startup_paths(&state_dir, &config_path, &addr, &startup_attempt_id);

            let credentials = open_credentials(&state_dir)?;
            let state = match AppState::from_config(&app_config, credentials) {
                Ok(state) => state,
                Err(err) => {
                    error!(attempt_id = %startup_attempt_id, error = %err, "engine startup failed");
                    return Err(err);
                }
            };
            serve(addr, state).await?;
        }
        Command::Compare {
            prompt,
            models,
            state_dir,
            config,
            json,
        } => {
            let state_dir = resolve_state_dir(state_dir);
            let _log_guard =
                init_process_logging(ProcessKind::Cli, &logs_dir(&state_dir), LOG_RETENTION)?;

            let config_path = resolve_config_path(&state_dir, config);
            let app_config = ConfigStore::new(&config_path, None).await?.get();
            let requests = resolve_model_requests(&models, &[], &HashMap::new())?;
            let api_keys = api_keys_from_env(|key| std::env::var(key).ok());

            let state = AppState::from_config(&app_config, open_credentials(&state_dir)?)?;
            let (tx, mut rx) = mpsc::unbounded_channel();
            let orchestrator = state.orchestrator.clone();
            let worker_requests = requests.clone();
            let worker = tokio::spawn(async move {
                orchestrator
                    .compare_streaming(&prompt, &worker_requests, &api_keys, tx)
                    .await
            });

            let mut board = ResultBoard::new(&requests);
            while let Some(result) = rx.recv().await {
                if board.settle(&result) && !json {
                    if let Some(slot) = board.get(&result.model_id) {
                        print_slot(&slot.model_id, &slot.state);
                    }
                }
            }
            let results = worker.await.context("comparison task failed")?;
            for result in &results {
                board.settle(result);
            }

            if json {
                println!("{}", serde_json::to_string_pretty(board.snapshot())?);
            }
            if !board.is_finished() {
                anyhow::bail!("comparison ended with unsettled models");
            }
        }
    }

    Ok(())
}

fn print_slot(model_id: &str, state: &SlotState) {
    match state {
        SlotState::Succeeded { content } => println!("=== {model_id} ===\n{content}\n"),
        SlotState::Failed { error } => println!("=== {model_id} (error) ===\n{error}\n"),
        SlotState::Loading => {}
    }
}

fn build_cli_overrides(hostname: Option<String>, port: Option<u16>) -> Option<serde_json::Value> {
    if hostname.is_none() && port.is_none() {
        return None;
    }
    let mut server = serde_json::Map::new();
    if let Some(hostname) = hostname.filter(|h| !h.trim().is_empty()) {
        server.insert("hostname".to_string(), serde_json::Value::String(hostname));
    }
    if let Some(port) = port {
        server.insert("port".to_string(), serde_json::Value::from(port));
    }
    Some(serde_json::json!({ "server": server }))
}

/// Keys for the one-shot CLI. `GOOGLE_API_KEY` wins over `GEMINI_API_KEY`.
fn api_keys_from_env(lookup: impl Fn(&str) -> Option<String>) -> ApiKeys {
    let mut keys = ApiKeys::new();
    for (provider, vars) in PROVIDER_KEY_VARS {
        let key = vars
            .iter()
            .filter_map(|var| lookup(var))
            .map(|v| v.trim().to_string())
            .find(|v| !v.is_empty());
        if let Some(key) = key {
            keys.insert(provider, key);
        }
    }
    keys
}

fn open_credentials(state_dir: &Path) -> anyhow::Result<Arc<CredentialStore>> {
    let durable = FileStorage::open(state_dir.join("credentials.json"))
        .context("failed to open credential file")?;
    Ok(Arc::new(CredentialStore::new(
        Arc::new(durable),
        Arc::new(MemoryStorage::new()),
    )))
}

fn resolve_state_dir(flag: Option<String>) -> PathBuf {
    if let Some(dir) = flag.filter(|d| !d.trim().is_empty()) {
        return PathBuf::from(dir);
    }
    dirs::data_dir()
        .map(|dir| dir.join("tradepal"))
        .unwrap_or_else(|| PathBuf::from(".tradepal"))
}

fn resolve_config_path(state_dir: &Path, flag: Option<String>) -> PathBuf {
    flag.map(PathBuf::from)
        .unwrap_or_else(|| state_dir.join("config.json"))
}

fn log_startup_paths(state_dir: &Path, config_path: &Path, addr: &SocketAddr, attempt_id: &str) {
    let exe = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("<unknown>"));
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("<unknown>"));
    info!("starting tradepal-engine on http://{addr}");
    info!(
        "startup paths: attempt_id={} exe={} cwd={} state_dir={} config_path={}",
        attempt_id,
        exe.display(),
        cwd.display(),
        state_dir.display(),
        config_path.display()
    );
}
