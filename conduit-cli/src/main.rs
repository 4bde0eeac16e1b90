//! Conduit CLI - drive the wallet messaging core from a terminal.
//!
//! Every simulation wires a background hub, an in-memory browser, one
//! content script and bridge per tab and an auto-answering popup in a single
//! process, then runs one end-to-end scenario.

#![allow(clippy::print_stdout)] // CLI program intentionally uses stdout

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use conduit::prelude::{
    BridgeError, ConduitConfig, Event, EventType, Gateway, GatewayBuilder, HubError, IssueLevel,
    MessageType, PopupUi, TransactionRequest, handler_fn, load_config, load_config_from,
    save_config, type_filter,
};
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Conduit - cross-context messaging for browser-extension wallets
#[derive(Parser)]
#[command(name = "conduit")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Configuration file path
    #[arg(short, long, env = "CONDUIT_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an end-to-end scenario in memory
    Simulate(SimulateArgs),

    /// Manage configuration
    Config(ConfigArgs),
}

/// Arguments for the simulate command
#[derive(Args)]
struct SimulateArgs {
    /// Print the gateway status as JSON when done
    #[arg(long, global = true)]
    status: bool,

    #[command(subcommand)]
    command: SimulateCommands,
}

#[derive(Subcommand)]
enum SimulateCommands {
    /// A page sends a transaction the popup approves (or declines)
    SendTransaction(SendTransactionArgs),

    /// The background broadcasts an event to the tabs of one origin
    Broadcast(BroadcastArgs),

    /// Several tabs load; the page script is injected once per session
    Init(InitArgs),
}

/// Arguments for `simulate send-transaction`
#[derive(Args)]
struct SendTransactionArgs {
    /// dApp page URL
    #[arg(long, default_value = "https://dapp.example")]
    url: String,

    /// Transaction kind
    #[arg(long, default_value = "transfer")]
    tx_type: String,

    /// Transaction body as JSON
    #[arg(long, default_value = "{}")]
    payload: String,

    /// Hash the popup answers with
    #[arg(long, default_value = "0x5eed")]
    hash: String,

    /// Make the user decline in the popup
    #[arg(long)]
    decline: bool,

    /// Give up after this many seconds
    #[arg(long, default_value_t = 10)]
    timeout: u64,
}

/// Arguments for `simulate broadcast`
#[derive(Args)]
struct BroadcastArgs {
    /// Origin the event is addressed to (all tabs if omitted)
    #[arg(long)]
    url: Option<String>,

    /// Open tabs
    #[arg(long = "tab", default_values = ["https://dapp.example", "https://other.example"])]
    tabs: Vec<String>,

    /// Event to broadcast
    #[arg(long, value_enum, default_value_t = EventArg::AccountChanged)]
    event: EventArg,

    /// Event payload as JSON
    #[arg(long, default_value = "\"0xnew\"")]
    payload: String,
}

/// Arguments for `simulate init`
#[derive(Args)]
struct InitArgs {
    /// Number of tabs to open
    #[arg(long, default_value_t = 2)]
    tabs: u8,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum EventArg {
    AccountChanged,
    NetworkChanged,
    Disconnected,
}

impl From<EventArg> for EventType {
    fn from(arg: EventArg) -> Self {
        match arg {
            EventArg::AccountChanged => Self::AccountChanged,
            EventArg::NetworkChanged => Self::NetworkChanged,
            EventArg::Disconnected => Self::Disconnected,
        }
    }
}

/// Arguments for the config command
#[derive(Args)]
struct ConfigArgs {
    #[command(subcommand)]
    command: ConfigCommands,
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Show configuration file path
    Path,
    /// Write the default configuration
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
    /// Validate configuration
    Validate,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!("failed to create tokio runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match rt.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Initialize logging with the given verbosity level.
fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("conduit={level},conduit_cli={level},warn")));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(verbosity >= 2)
        .init();
}

/// Main async entry point.
async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Simulate(args) => cmd_simulate(args, cli.config.as_deref()).await,
        Commands::Config(args) => cmd_config(args, cli.config).await,
    }
}

/// Load the configuration from `path`, or the default location.
async fn load(path: Option<&Path>) -> Result<ConduitConfig> {
    let config = match path {
        Some(path) => load_config_from(path)
            .await
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => load_config().await.context("failed to load configuration")?,
    };
    if config.has_errors() {
        bail!("configuration is invalid; run `conduit config validate`");
    }
    Ok(config)
}

fn parse_json(raw: &str, what: &str) -> Result<Value> {
    serde_json::from_str(raw).with_context(|| format!("{what} is not valid JSON"))
}

/// Run a simulation.
async fn cmd_simulate(args: SimulateArgs, config_path: Option<&Path>) -> Result<()> {
    let gateway = GatewayBuilder::new().config(load(config_path).await?).build();
    gateway.start();

    match args.command {
        SimulateCommands::SendTransaction(a) => simulate_send_transaction(&gateway, a).await?,
        SimulateCommands::Broadcast(a) => simulate_broadcast(&gateway, a).await?,
        SimulateCommands::Init(a) => simulate_init(&gateway, a).await?,
    }

    if args.status {
        let status = gateway.status().await?;
        println!("{}", serde_json::to_string_pretty(&status)?);
    }
    gateway.shutdown();
    Ok(())
}

async fn simulate_send_transaction(gateway: &Gateway, args: SendTransactionArgs) -> Result<()> {
    let payload = parse_json(&args.payload, "--payload")?;
    let hash = args.hash;
    let decline = args.decline;

    gateway.serve_popups(move |runtime| {
        let hash = hash.clone();
        PopupUi::new(runtime).on(
            MessageType::SendTransaction,
            handler_fn(move |message, _| {
                let hash = hash.clone();
                async move {
                    let request: TransactionRequest = message
                        .payload_as()
                        .map_err(|e| HubError::InvalidPayload(e.to_string()))?;
                    tracing::info!(tx_type = %request.tx_type, "popup reviewing transaction");
                    if decline {
                        return Err(HubError::handler("user declined"));
                    }
                    Ok(json!(hash))
                }
            }),
        )
    });

    let tab = gateway.open_tab(args.url.parse()?).await?;
    let bridge = tab
        .bridge
        .as_ref()
        .context("page script was not injected into the tab")?;

    let reply = bridge.call(
        MessageType::SendTransaction,
        Some(serde_json::to_value(TransactionRequest {
            tx_type: args.tx_type,
            payload,
        })?),
    )?;
    println!("request {} sent", reply.correlation_id());

    match reply.with_timeout(Duration::from_secs(args.timeout)).await {
        Ok(hash) => println!("transaction submitted: {}", hash.as_str().unwrap_or_default()),
        Err(BridgeError::Rejected(reason)) => println!("transaction rejected: {reason}"),
        Err(e) => return Err(e.into()),
    }

    tab.close(gateway.browser()).await;
    Ok(())
}

async fn simulate_broadcast(gateway: &Gateway, args: BroadcastArgs) -> Result<()> {
    let event = Event::new(args.event.into(), parse_json(&args.payload, "--payload")?);

    let mut tabs = Vec::with_capacity(args.tabs.len());
    let mut watchers = Vec::with_capacity(args.tabs.len());
    for url in &args.tabs {
        let tab = gateway.open_tab(url.parse()?).await?;
        let mut page = tab.window.subscribe();
        let selector = type_filter(event.event_type);
        let url = tab.info.url.clone();
        watchers.push(tokio::spawn(async move {
            let got = tokio::time::timeout(Duration::from_millis(250), async {
                while let Some(value) = page.recv().await {
                    if selector(&value) {
                        return Some(value);
                    }
                }
                None
            })
            .await
            .ok()
            .flatten();
            (url, got)
        }));
        tabs.push(tab);
    }

    let reached = match &args.url {
        Some(url) => gateway.hub().broadcast_to_url(event, &url.parse()?).await?,
        None => gateway.hub().broadcast(event).await?,
    };
    println!("event delivered to {reached} tab(s)");

    for watcher in watchers {
        let (url, got) = watcher.await?;
        match got {
            Some(value) => println!("  {url}: {}", value["payload"]),
            None => println!("  {url}: -"),
        }
    }

    for tab in tabs {
        tab.close(gateway.browser()).await;
    }
    Ok(())
}

async fn simulate_init(gateway: &Gateway, args: InitArgs) -> Result<()> {
    let mut tabs = Vec::new();
    for i in 0..args.tabs {
        let tab = gateway.open_tab(format!("https://dapp{i}.example").parse()?).await?;
        println!(
            "tab {} ({}): {}",
            tab.info.id,
            tab.info.url,
            if tab.bridge.is_some() { "injected" } else { "already loaded" }
        );
        tabs.push(tab);
    }
    println!("injections this session: {}", gateway.browser().injections().len());

    for tab in tabs {
        tab.close(gateway.browser()).await;
    }
    Ok(())
}

/// Configuration management.
async fn cmd_config(args: ConfigArgs, config_path: Option<PathBuf>) -> Result<()> {
    let config_file = config_path.unwrap_or_else(conduit::config::config_path);

    match args.command {
        ConfigCommands::Path => {
            println!("{}", config_file.display());
        }
        ConfigCommands::Show => {
            let config = if config_file.exists() {
                load_config_from(&config_file).await?
            } else {
                println!("# {} does not exist, showing defaults", config_file.display());
                ConduitConfig::default()
            };
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        ConfigCommands::Init { force } => {
            if config_file.exists() && !force {
                println!("Configuration already exists at: {}", config_file.display());
                println!("Use --force to overwrite.");
                return Ok(());
            }
            save_config(&ConduitConfig::default(), &config_file).await?;
            println!("Configuration created: {}", config_file.display());
        }
        ConfigCommands::Validate => {
            if !config_file.exists() {
                println!("error: configuration file does not exist");
                return Ok(());
            }
            let config = load_config_from(&config_file).await?;
            let issues = config.validate();
            if issues.is_empty() {
                println!("Configuration is valid");
            }
            for issue in &issues {
                let level = match issue.level {
                    IssueLevel::Error => "error",
                    IssueLevel::Warning => "warning",
                };
                println!("{level}: {}: {}", issue.field, issue.message);
            }
            if config.has_errors() {
                bail!("configuration has errors");
            }
        }
    }

    Ok(())
}
