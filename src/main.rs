use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use parley_core::config::{default_config_path, AppConfig, ModelConfig};
use parley_core::flow::FlowDocument;
use parley_core::traits::{ChannelAdapter, FlowStore, StateStore};
use parley_core::types::InboundEvent;

use parley_channels::{ConsoleAdapter, WhatsAppAdapter};
use parley_engine::registry::{compile, lint};
use parley_engine::{Collaborators, Engine, EngineSettings};
use parley_store::{MemoryStore, SqliteStore};

#[derive(Parser)]
#[command(name = "parley", version, about = "Resumable conversational workflow engine")]
struct Cli {
    /// Path to config file (defaults to ~/.parley/config.toml)
    #[arg(short, long, env = "PARLEY_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP gateway (WhatsApp webhook + management API)
    Serve {
        /// Flow that webhook events are routed to (overrides engine.default_flow)
        #[arg(long)]
        flow: Option<String>,
    },
    /// Manage flow documents
    Flow {
        #[command(subcommand)]
        action: FlowAction,
    },
    /// Talk to a flow from the terminal
    Chat {
        /// Flow id to run
        #[arg(long)]
        flow: Option<String>,
        /// Run a flow file in memory instead of the stored flow
        #[arg(long)]
        file: Option<PathBuf>,
        /// Contact id the conversation is stored under
        #[arg(long, default_value = "console")]
        contact: String,
    },
    /// Inspect or reset conversation state
    State {
        #[command(subcommand)]
        action: StateAction,
    },
    /// Show current configuration
    Config,
}

#[derive(Subcommand)]
enum FlowAction {
    /// Validate a flow document without storing it
    Validate { file: PathBuf },
    /// Validate and store a flow document
    Import {
        file: PathBuf,
        /// Store under this id instead of the document's own
        #[arg(long)]
        id: Option<String>,
    },
    /// List stored flows
    List,
}

#[derive(Subcommand)]
enum StateAction {
    /// Print a conversation's stored state
    Show { flow: String, contact: String },
    /// Delete a conversation's state so the next event starts fresh
    Reset { flow: String, contact: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("parley=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    // Validation needs no config
    if let Commands::Flow {
        action: FlowAction::Validate { file },
    } = &cli.command
    {
        return validate_flow(file);
    }

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Flow { action } => {
            let store = open_store(&config)?;
            match action {
                FlowAction::Validate { .. } => unreachable!("handled above"),
                FlowAction::Import { file, id } => {
                    let mut document = read_flow(&file)?;
                    if id.is_some() {
                        document.id = id;
                    }
                    let flow = compile(document.clone())?;
                    store.save_flow(&document).await?;
                    println!(
                        "Imported flow '{}' (version {}, {} nodes)",
                        flow.id,
                        flow.version,
                        flow.nodes().len()
                    );
                }
                FlowAction::List => {
                    let flows = store.list_flows().await?;
                    if flows.is_empty() {
                        println!("No flows stored.");
                    }
                    for flow in flows {
                        println!(
                            "{:<24} v{:<4} {:<32} {}",
                            flow.id,
                            flow.version,
                            flow.name.unwrap_or_default(),
                            flow.updated_at.format("%Y-%m-%d %H:%M")
                        );
                    }
                }
            }
        }
        Commands::State { action } => {
            let store = open_store(&config)?;
            match action {
                StateAction::Show { flow, contact } => match store.load_state(&flow, &contact).await? {
                    Some(state) => println!("{}", serde_json::to_string_pretty(&state)?),
                    None => println!("No conversation for {} in flow '{}'.", contact, flow),
                },
                StateAction::Reset { flow, contact } => {
                    if store.delete_state(&flow, &contact).await? {
                        println!("Conversation reset.");
                    } else {
                        println!("No conversation for {} in flow '{}'.", contact, flow);
                    }
                }
            }
        }
        Commands::Chat { flow, file, contact } => {
            run_chat(&config, flow, file, &contact).await?;
        }
        Commands::Serve { flow } => {
            let store = open_store(&config)?;
            let channel: Arc<dyn ChannelAdapter> = match &config.channels.whatsapp {
                Some(wa) => Arc::new(WhatsAppAdapter::new(wa.clone())),
                None => {
                    warn!("No WhatsApp channel configured, replies go to stdout");
                    Arc::new(ConsoleAdapter::new())
                }
            };
            let engine = Arc::new(build_engine(&config, store.clone(), store, channel));
            let default_flow = flow.or_else(|| config.engine.default_flow.clone());

            let server = parley_gateway::GatewayServer::new(config.gateway.clone(), engine, default_flow);
            let cancel = tokio_util::sync::CancellationToken::new();
            let cancel_clone = cancel.clone();

            // Graceful shutdown on Ctrl-C
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                info!("Shutting down gateway...");
                cancel_clone.cancel();
            });

            server.run(cancel).await?;
        }
    }

    Ok(())
}

async fn run_chat(
    config: &AppConfig,
    flow: Option<String>,
    file: Option<PathBuf>,
    contact: &str,
) -> anyhow::Result<()> {
    let channel: Arc<dyn ChannelAdapter> = Arc::new(ConsoleAdapter::new());

    let (engine, flow_id) = match file {
        Some(path) => {
            let store = Arc::new(MemoryStore::new());
            let engine = build_engine(config, store.clone(), store, channel);
            let installed = engine.flows().install(read_flow(&path)?).await?;
            (engine, installed.id.clone())
        }
        None => {
            let flow_id = flow
                .or_else(|| config.engine.default_flow.clone())
                .context("no flow given: pass --flow, --file or set engine.default_flow")?;
            let store = open_store(config)?;
            (build_engine(config, store.clone(), store, channel), flow_id)
        }
    };
    // Surface a missing or invalid flow before the first prompt
    engine.flows().get(&flow_id).await?;

    println!("Chatting with flow '{}' as {}. Ctrl-D to quit.", flow_id, contact);
    let stdin = io::stdin();
    loop {
        print!("> ");
        io::stdout().flush()?;
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let text = line.trim();
        if text.is_empty() {
            continue;
        }
        let report = engine
            .handle_event(&flow_id, InboundEvent::new("console", contact, text))
            .await?;
        info!(turn_id = report.turn_id, outcome = ?report.outcome, nodes = report.nodes.len(), "Turn finished");
    }
    Ok(())
}

fn build_engine(
    config: &AppConfig,
    flows: Arc<dyn FlowStore>,
    states: Arc<dyn StateStore>,
    channel: Arc<dyn ChannelAdapter>,
) -> Engine {
    let collaborators = Collaborators {
        model: parley_llm::create_client(config),
        channel,
        api: parley_integrations::create_api_client(config),
        payments: parley_integrations::create_payment_provider(config),
    };
    Engine::new(flows, states, collaborators, EngineSettings::from(&config.engine))
}

fn open_store(config: &AppConfig) -> anyhow::Result<Arc<SqliteStore>> {
    let path = config.database_path();
    let store = SqliteStore::open(&path)
        .with_context(|| format!("opening database {}", path.display()))?;
    Ok(Arc::new(store))
}

fn read_flow(path: &Path) -> anyhow::Result<FlowDocument> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("parsing {}", path.display()))
}

fn validate_flow(path: &Path) -> anyhow::Result<()> {
    let mut document = read_flow(path)?;
    if document.id.is_none() {
        // Validation only needs some id
        document.id = path.file_stem().map(|s| s.to_string_lossy().into_owned());
    }
    let flow = parley_core::flow::Flow::try_from(document)?;
    let warnings = lint(&flow);

    println!(
        "Flow '{}' is valid: {} nodes, {} edges",
        flow.id,
        flow.nodes().len(),
        flow.edges().len()
    );
    for w in &warnings {
        println!("  warning: edge {} condition {:?}: {}", w.edge_id, w.condition, w.error);
    }
    Ok(())
}

/// Load the explicit config file, then `~/.parley/config.toml`, then fall
/// back to a config built from the environment.
fn load_config(explicit: Option<&Path>) -> anyhow::Result<AppConfig> {
    if let Some(path) = explicit {
        return Ok(AppConfig::load(path)?);
    }
    let home_config = default_config_path();
    if home_config.exists() {
        info!(path = %home_config.display(), "Loading config from home directory");
        return Ok(AppConfig::load(&home_config)?);
    }
    eprintln!(
        "Warning: No config file found at {}. Using OPENAI_API_KEY or a local Ollama model.",
        home_config.display()
    );
    Ok(env_config())
}

fn env_config() -> AppConfig {
    let model = match std::env::var("OPENAI_API_KEY").ok() {
        Some(key) => model_config("openai", "gpt-4o-mini", Some(key)),
        None => model_config("ollama", "llama3.2", None),
    };
    AppConfig {
        engine: Default::default(),
        model,
        fallback_models: Vec::new(),
        gateway: Default::default(),
        channels: Default::default(),
        integrations: Default::default(),
        payments: Default::default(),
    }
}

fn model_config(provider: &str, model_id: &str, api_key: Option<String>) -> ModelConfig {
    ModelConfig {
        provider: provider.to_string(),
        model_id: model_id.to_string(),
        api_key,
        base_url: None,
        max_tokens: 1024,
        temperature: 0.2,
        retry: None,
        extra_headers: Default::default(),
    }
}
