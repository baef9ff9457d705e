mod config;
use clap::{Parser, Subcommand};
use config::Config;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod server;
use ods_core::{
    NotifyPeersOperation, ReconcilePackagesOperation, RegisterWithPeerOperation,
    RegisterWithPeerOperationRequest, SecretKey, Stage, UploadPackageOperation,
    UploadPackageOperationRequest,
};
use server::{open_context, run_server};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "ods")]
#[command(about = "Peer-to-peer package mirroring between trusted nodes")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server
    Server {
        /// Path to configuration file
        #[arg(short, long, default_value = "ods.yaml")]
        config: String,
    },

    /// Print this node's issuer id and key for provisioning to a peer
    Identity {
        #[arg(short, long, default_value = "ods.yaml")]
        config: String,
    },

    /// Generate a random base64 key for security.database_key
    Keygen,

    /// Publish a local file and notify every registered peer
    Upload {
        #[arg(short, long, default_value = "ods.yaml")]
        config: String,

        /// File to publish
        #[arg(short, long)]
        file: PathBuf,

        /// Name in the share; defaults to the file's name
        #[arg(short, long)]
        name: Option<String>,

        /// Prod, Test or Dev; anything else is treated as Prod
        #[arg(short, long, default_value = "Prod")]
        stage: String,

        /// Do not notify peers
        #[arg(long)]
        no_notify: bool,
    },

    /// Register with a remote node using its out-of-band issuer id and key
    Register {
        #[arg(short, long, default_value = "ods.yaml")]
        config: String,

        /// Remote node base url
        #[arg(long)]
        url: String,

        /// Remote node issuer id
        #[arg(long)]
        issuer: String,

        /// Remote node key (base64)
        #[arg(long)]
        key: String,
    },

    /// List registered peers
    Peers {
        #[arg(short, long, default_value = "ods.yaml")]
        config: String,
    },

    /// Run a single reconciliation pass and exit
    Reconcile {
        #[arg(short, long, default_value = "ods.yaml")]
        config: String,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ods=info,ods_core=info,ods_server=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    if let Err(error) = run(cli.command).await {
        tracing::error!("{:#}", error);
        std::process::exit(1);
    }
}

fn load(config: &str) -> anyhow::Result<Config> {
    tracing::debug!("Loading config from {}", config);
    Ok(Config::from_file(config)?)
}

async fn run(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Server { config } => {
            tracing::info!("Starting ODS server with config: {}", config);
            run_server(load(&config)?).await
        }
        Commands::Identity { config } => {
            let ctx = open_context(&load(&config)?)?;
            let identity = ctx.peers.identity()?;
            println!("issuer: {}", identity.issuer);
            println!("key:    {}", ctx.peers.node_key()?.to_base64());
            println!("name:   {}", identity.name);
            println!("url:    {}", identity.url.as_deref().unwrap_or("-"));
            println!("stage:  {}", identity.stage);
            Ok(())
        }
        Commands::Keygen => {
            println!("{}", SecretKey::generate().to_base64());
            Ok(())
        }
        Commands::Upload {
            config,
            file,
            name,
            stage,
            no_notify,
        } => {
            let ctx = open_context(&load(&config)?)?;
            let package = UploadPackageOperation::new(ctx.metadata.clone(), ctx.share.clone())
                .run(UploadPackageOperationRequest {
                    source: file,
                    filename: name,
                    stage: Stage::parse_lenient(&stage),
                })
                .await?;
            println!(
                "uploaded {} (id {}, {} bytes, sha256 {})",
                package.filename, package.id, package.file_size, package.sha256
            );

            if !no_notify {
                let result = NotifyPeersOperation::new(ctx.peers.clone(), ctx.connector.clone())
                    .run(package.id)
                    .await?;
                println!(
                    "notified {} peer(s), {} failed",
                    result.notified.len(),
                    result.failed.len()
                );
            }
            Ok(())
        }
        Commands::Register {
            config,
            url,
            issuer,
            key,
        } => {
            let ctx = open_context(&load(&config)?)?;
            let peer = RegisterWithPeerOperation::new(
                ctx.peers.clone(),
                ctx.connector.clone(),
                ctx.clock.clone(),
            )
            .run(RegisterWithPeerOperationRequest { url, issuer, key })
            .await?;
            println!("registered with {} ({}) at {}", peer.name, peer.issuer, peer.url);
            Ok(())
        }
        Commands::Peers { config } => {
            let ctx = open_context(&load(&config)?)?;
            for peer in ctx.peers.list_peers()? {
                println!(
                    "{}\t{}\t{}\t{}\tregistered {}",
                    peer.issuer,
                    peer.name,
                    peer.url,
                    peer.stage,
                    peer.registered_on.to_rfc3339()
                );
            }
            Ok(())
        }
        Commands::Reconcile { config } => {
            let ctx = open_context(&load(&config)?)?;
            let result = ReconcilePackagesOperation::new(ctx.metadata.clone(), ctx.share.clone())
                .run()
                .await?;
            println!(
                "verified {}, removed {} orphan file(s), {} orphan row(s), {} corrupted package(s)",
                result.verified,
                result.orphan_files.len(),
                result.orphan_packages.len(),
                result.corrupted_packages.len()
            );
            Ok(())
        }
    }
}
