mod commands;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::AppConfig;
use gateway::{GatewayClient, MockGateway, RetryPolicy, SoapConfig, SriSoapClient};
use issuance::{DocumentLifecycleManager, IssuanceOptions, LifecycleSettings};
use sri_einv_core::models::DocumentType;
use sri_einv_core::state::ActorContext;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "sri-einv", version, about = "Issue and manage SRI electronic documents")]
struct Cli {
    /// Configuration file. Defaults to the per-user location.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Issue one document from a JSON payload.
    Create {
        #[arg(long = "type")]
        doc_type: DocumentType,
        file: PathBuf,
        #[arg(long, default_value = "cli")]
        user: String,
    },
    /// Issue every *.json payload found under a directory.
    CreateBatch {
        dir: PathBuf,
        #[arg(long, default_value = "cli")]
        user: String,
    },
    /// Run the payload checks without issuing anything.
    Validate { files: Vec<PathBuf> },
    Show { access_key: String },
    Annul {
        access_key: String,
        #[arg(long)]
        reason: String,
        #[arg(long)]
        user: String,
    },
    /// Resubmit a document parked while the gateway was unavailable.
    Reprocess {
        uuid: Uuid,
        #[arg(long, default_value = "cli")]
        user: String,
    },
    /// Ask the gateway for the authorization result of a sent document.
    Refresh {
        uuid: Uuid,
        #[arg(long, default_value = "cli")]
        user: String,
    },
    Pending,
    Key {
        #[command(subcommand)]
        action: KeyCommand,
    },
    Config {
        #[command(subcommand)]
        action: ConfigCommand,
    },
}

#[derive(Subcommand)]
enum KeyCommand {
    Validate { key: String },
    Decode { key: String },
}

#[derive(Subcommand)]
enum ConfigCommand {
    Show,
    /// Write the default configuration if none exists.
    Init,
}

fn init_tracing() {
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,sled=warn".to_string());
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(env_filter))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn load_config(path: Option<&PathBuf>) -> Result<AppConfig> {
    match path {
        Some(p) => config::load_from(p),
        None => config::load(),
    }
}

fn create_gateway_client(cfg: &AppConfig) -> Result<Arc<dyn GatewayClient>> {
    match cfg.gateway.kind.as_str() {
        "soap" => {
            let soap = SoapConfig {
                reception_url: cfg.gateway.reception_url.clone(),
                authorization_url: cfg.gateway.authorization_url.clone(),
                connect_timeout: cfg.gateway.connect_timeout(),
                request_timeout: cfg.gateway.request_timeout(),
                retry: RetryPolicy::new(cfg.gateway.retry_attempts, cfg.gateway.retry_delay()),
            };
            tracing::info!(url = %soap.reception_url, "Using SRI SOAP gateway");
            let client: Arc<dyn GatewayClient> =
                Arc::new(SriSoapClient::new(soap).context("Failed to build SOAP client")?);
            Ok(client)
        }
        _ => {
            tracing::info!("Using mock gateway");
            let client: Arc<dyn GatewayClient> = MockGateway::authorizing();
            Ok(client)
        }
    }
}

fn open_manager(cfg: &AppConfig) -> Result<DocumentLifecycleManager> {
    let options = IssuanceOptions {
        db_path: cfg.storage.db_path.clone(),
        audit_path: cfg.storage.audit_path.clone(),
        catalog_ttl: cfg.catalog.cache_ttl(),
        settings: LifecycleSettings {
            numeric_code: cfg.issuance.numeric_code.clone(),
            apply_default_taxes: cfg.issuance.apply_default_taxes,
            gateway_timeout: cfg.gateway.hard_timeout(),
        },
    };
    issuance::open(&options, create_gateway_client(cfg)?)
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    init_tracing();
    let cli = Cli::parse();

    let output = match cli.command {
        Command::Key { action } => match action {
            KeyCommand::Validate { key } => commands::validate_key(&key)?,
            KeyCommand::Decode { key } => commands::decode_key(&key)?,
        },
        Command::Config { action } => {
            let cfg = load_config(cli.config.as_ref())?;
            if let ConfigCommand::Init = action {
                match &cli.config {
                    Some(p) => config::store_to(p, &cfg)?,
                    None => config::store(&cfg)?,
                }
            }
            commands::show_config(&cfg)?
        }
        Command::Validate { files } => commands::validate_files(&files)?,
        command => {
            let cfg = load_config(cli.config.as_ref())?;
            let manager = open_manager(&cfg)?;
            let output = run(&manager, command).await?;
            manager.store().flush()?;
            output
        }
    };

    println!("{}", serde_json::to_string_pretty(&output.body)?);
    Ok(if output.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn run(manager: &DocumentLifecycleManager, command: Command) -> Result<commands::Output> {
    let actor = |user: String| ActorContext::new(user, None);
    match command {
        Command::Create { doc_type, file, user } => {
            commands::create(manager, &actor(user), doc_type, &file).await
        }
        Command::CreateBatch { dir, user } => commands::create_batch(manager, &actor(user), &dir).await,
        Command::Show { access_key } => commands::show(manager, &access_key).await,
        Command::Annul {
            access_key,
            reason,
            user,
        } => commands::annul(manager, &actor(user), &access_key, &reason).await,
        Command::Reprocess { uuid, user } => commands::reprocess(manager, &actor(user), uuid).await,
        Command::Refresh { uuid, user } => commands::refresh(manager, &actor(user), uuid).await,
        Command::Pending => commands::pending(manager).await,
        Command::Key { .. } | Command::Config { .. } | Command::Validate { .. } => {
            anyhow::bail!("command does not use the document store")
        }
    }
}
