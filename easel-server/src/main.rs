use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use easel_core::{
    CommandTrainer, Device, DirLoader, EaselConfig, GenerationService, ModelCache, Trainer,
    TrainingService, TrainingStore,
};
use easel_server::api;
use easel_server::state::AppState;

#[derive(Parser, Debug)]
#[command(author, version, about = "Easel image generation server")]
struct Args {
    /// Path to the TOML config file
    #[arg(long, default_value = "easel.toml")]
    config: PathBuf,

    /// Use the CPU even when an accelerator is configured
    #[arg(long)]
    cpu: bool,

    /// Device to run pipelines on (cpu, cuda[:N], metal[:N])
    #[arg(long)]
    device: Option<String>,

    /// Default model, overriding the config
    #[arg(long)]
    model: Option<String>,

    /// Host address to bind the server to
    #[arg(long)]
    host: Option<String>,

    /// Port to bind the server to
    #[arg(long)]
    port: Option<u16>,
}

fn load_config(args: &Args) -> Result<EaselConfig> {
    let mut config = if args.config.exists() {
        EaselConfig::load(&args.config)?
    } else {
        info!(path = %args.config.display(), "config file not found, using defaults");
        EaselConfig::default()
    };
    if let Some(device) = &args.device {
        config.server.device = device.parse()?;
    }
    if args.cpu {
        config.server.device = Device::Cpu;
    }
    if let Some(model) = &args.model {
        config.models.default = model.clone();
    }
    if let Some(host) = &args.host {
        config.server.host = host.clone();
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;

    let loader = Arc::new(DirLoader::new().context("failed to initialize model loader")?);
    let cache = Arc::new(ModelCache::new(loader, config.server.device));
    let generation = Arc::new(GenerationService::new(Arc::clone(&cache), &config));

    let trainer = config.training.command.as_ref().map(|command| {
        Arc::new(CommandTrainer::new(command, config.training.args.clone())) as Arc<dyn Trainer>
    });
    if trainer.is_none() {
        info!("no training command configured, /train will be rejected");
    }
    let training = Arc::new(TrainingService::new(
        TrainingStore::new(&config.storage.data_dir),
        trainer,
    ));

    let state = Arc::new(AppState {
        generation,
        training,
        cache,
    });
    let app = api::router(state);

    let address = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&address)
        .await
        .with_context(|| format!("failed to bind {address}"))?;
    info!(address = %address, device = %config.server.device, "easel server started");
    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}
