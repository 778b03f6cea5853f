use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod api;
mod config;
mod domain;
mod engine;
mod frouter;
mod measure;
mod probe;
mod proxy;
mod repository;

use domain::{PreferredEngine, ProxyConfigPatch};
use engine::{default_adapters, select_engine, BuildContext};
use measure::Measurer;
use probe::ProbeService;
use proxy::ProxyService;
use repository::{FRouterRepository, NodeRepository, SettingsRepository, Store};

#[derive(Parser)]
#[command(name = "vea")]
#[command(version = "0.1.0")]
#[command(about = "FRouter compiler and proxy engine supervisor", long_about = None)]
struct Cli {
    /// Config file (defaults to the user config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Root of engine installs, runtime dirs and geo data
    #[arg(long, global = true)]
    artifacts_dir: Option<PathBuf>,

    /// HTTP API address
    #[arg(long, global = true)]
    listen: Option<String>,

    /// Log level used when RUST_LOG is not set
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP API and supervise the proxy engine
    Serve,
    /// Start the proxy in the foreground until interrupted
    Start {
        /// FRouter to run; defaults to the persisted proxy config
        #[arg(long)]
        frouter: Option<String>,
        /// auto, singbox or clash
        #[arg(long)]
        engine: Option<String>,
    },
    /// Compile an FRouter and report problems
    Validate {
        #[arg(long)]
        frouter: String,
    },
    /// Print the engine config for an FRouter; the explain text goes to stderr
    Render {
        #[arg(long)]
        frouter: String,
        /// auto, singbox or clash
        #[arg(long)]
        engine: Option<String>,
    },
    /// Query a running server for the proxy status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => config::AppConfig::load_from(path)?,
        None => config::AppConfig::load().unwrap_or_default(),
    };
    config.merge_cli(cli.artifacts_dir.clone(), cli.listen.clone(), cli.log_level.clone());

    init_tracing(&config.log_level);

    match cli.command {
        Command::Serve => serve(config).await,
        Command::Start { frouter, engine } => start(config, frouter, engine).await,
        Command::Validate { frouter } => validate(config, &frouter),
        Command::Render { frouter, engine } => render(config, &frouter, engine),
        Command::Status => status(&config.listen).await,
    }
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn open_store(config: &config::AppConfig) -> Result<Arc<Store>> {
    let store = Store::open(&config.state_path())?;
    if config.default_engine != PreferredEngine::Auto {
        store.set_default_engine(config.default_engine)?;
    }
    Ok(Arc::new(store))
}

fn proxy_service(config: &config::AppConfig, store: &Arc<Store>) -> Arc<ProxyService> {
    Arc::new(ProxyService::new(
        store.clone(),
        store.clone(),
        store.clone(),
        store.clone(),
        default_adapters(),
        &config.artifacts_dir,
    ))
}

async fn serve(config: config::AppConfig) -> Result<()> {
    let store = open_store(&config)?;
    let proxy = proxy_service(&config, &store);
    let measurer = Arc::new(Measurer::new(
        store.clone(),
        store.clone(),
        default_adapters(),
        &config.artifacts_dir,
    ));
    let probes = Arc::new(ProbeService::new(store.clone(), store.clone(), measurer));

    if config.auto_start {
        proxy.auto_start().await;
    }

    let state = api::AppState::from_store(store, proxy.clone(), probes.clone());
    let result = api::serve(&config.listen, state, async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown requested");
    })
    .await;

    probes.shutdown();
    if let Err(e) = proxy.stop().await {
        tracing::warn!("failed to stop proxy on shutdown: {}", e);
    }
    result
}

async fn start(
    config: config::AppConfig,
    frouter: Option<String>,
    engine: Option<String>,
) -> Result<()> {
    let store = open_store(&config)?;
    let proxy = proxy_service(&config, &store);

    let mut proxy_config = store.get_proxy_config()?;
    proxy_config.apply_patch(ProxyConfigPatch {
        frouter_id: frouter,
        preferred_engine: engine,
        ..Default::default()
    });

    let status = proxy.start(proxy_config).await?;
    println!(
        "✓ {} running (pid {})",
        status.engine.map(|e| e.to_string()).unwrap_or_default(),
        status.pid.unwrap_or(0)
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    proxy.stop().await?;
    println!("✓ Stopped");
    Ok(())
}

fn validate(config: config::AppConfig, frouter_id: &str) -> Result<()> {
    let store = open_store(&config)?;
    let frouter = FRouterRepository::get(store.as_ref(), frouter_id)?;
    let nodes = NodeRepository::list(store.as_ref())?;

    match frouter::compile(&frouter, &nodes) {
        Ok(compiled) => {
            println!("✓ {} is valid", frouter_id);
            println!("  Default: {}", compiled.default);
            println!("  Rules: {}", compiled.rules.len());
            for warning in &compiled.warnings {
                println!("  warning: {}", warning);
            }
            Ok(())
        }
        Err(err) => {
            eprintln!("✗ {} is invalid:", frouter_id);
            for problem in &err.problems {
                eprintln!("  - {}", problem);
            }
            std::process::exit(1);
        }
    }
}

fn render(config: config::AppConfig, frouter_id: &str, engine: Option<String>) -> Result<()> {
    let store = open_store(&config)?;
    let frouter = FRouterRepository::get(store.as_ref(), frouter_id)?;
    let nodes = NodeRepository::list(store.as_ref())?;

    let default_engine = store.default_engine();
    let mut proxy_config = store.get_proxy_config()?;
    proxy_config.apply_patch(ProxyConfigPatch {
        frouter_id: Some(frouter_id.to_string()),
        preferred_engine: engine,
        ..Default::default()
    });
    let proxy_config = proxy_config.with_start_defaults(default_engine);

    let adapters = default_adapters();
    let selection = select_engine(
        proxy_config.inbound_mode,
        &frouter,
        &nodes,
        proxy_config.preferred_engine,
        default_engine,
        store.as_ref(),
        &adapters,
    )?;
    let adapter = adapters
        .get(&selection.engine)
        .ok_or_else(|| anyhow::anyhow!("engine {} is not available", selection.engine))?;

    let plan = frouter::compile_proxy_plan(selection.engine, &proxy_config, &frouter, &nodes)?;
    let rendered = adapter.build_config(&plan, &BuildContext::detect(&config.artifacts_dir))?;

    eprint!("{}", plan.explain());
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(&rendered)?;
    stdout.flush()?;
    Ok(())
}

async fn status(listen: &str) -> Result<()> {
    let base = url::Url::parse(&format!("http://{}/", listen))
        .with_context(|| format!("Invalid API address: {}", listen))?;
    let endpoint = base.join("proxy/status")?;

    let response = reqwest::Client::new()
        .get(endpoint.as_str())
        .send()
        .await
        .with_context(|| format!("Failed to reach vea at {}", base))?;
    if !response.status().is_success() {
        anyhow::bail!("API error: {}", response.status());
    }

    let status: serde_json::Value = response.json().await?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}
