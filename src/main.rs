//! Mantle - managed OpenShift cluster resource provider

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use mantle_api::metadata::{ARM_METADATA_URL, METADATA_REFRESH_INTERVAL};
use mantle_api::server::DEFAULT_DRAIN_TIMEOUT;
use mantle_api::{
    AppState, Environment, HttpMetadataSource, MetadataCache, Mode, ProvisioningPolicy,
    ServerConfig, SystemClock, TlsPem,
};
use mantle_common::model::{resource_key, Secret};
use mantle_common::telemetry::{init_telemetry, TelemetryConfig};
use mantle_common::Settings;
use mantle_install::azure::{ArmClient, ClientCredentials};
use mantle_install::{AzureClients, Backend, DnsRegistrar, Installer, KubeProbeFactory, LocalDispatcher};
use mantle_store::{CosmosConfig, CosmosStore, DocumentStore, MemoryStore};

/// Mantle - managed OpenShift cluster resource provider
#[derive(Parser, Debug)]
#[command(name = "mantle", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the frontend and the install backend
    Serve(ServeArgs),
    /// Print a stored cluster document
    DumpDocument(DumpArgs),
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Azure region served by this instance
    #[arg(long, env = "LOCATION")]
    location: String,

    /// Tenant of the service principal and of created clusters
    #[arg(long, env = "AZURE_TENANT_ID")]
    tenant_id: String,

    /// Subscription holding the service resources
    #[arg(long, env = "AZURE_SUBSCRIPTION_ID")]
    subscription_id: String,

    /// Service principal client id
    #[arg(long, env = "AZURE_CLIENT_ID")]
    client_id: String,

    /// Service principal client secret
    #[arg(long, env = "AZURE_CLIENT_SECRET", hide_env_values = true)]
    client_secret: String,

    /// Resource group holding the service DNS zone
    #[arg(long, env = "RESOURCEGROUP")]
    resource_group: String,

    /// Image pull secret handed to every cluster
    #[arg(long, env = "PULL_SECRET", hide_env_values = true)]
    pull_secret: String,

    /// development or production
    #[arg(long, env = "RP_MODE", default_value = "production")]
    mode: Mode,

    /// Listen address; defaults to the mode's address on port 8443
    #[arg(long, env = "LISTEN_ADDRESS")]
    listen: Option<SocketAddr>,

    /// PEM certificate chain for the listener
    #[arg(long, env = "TLS_CERT_FILE")]
    tls_cert: Option<PathBuf>,

    /// PEM private key for the listener
    #[arg(long, env = "TLS_KEY_FILE")]
    tls_key: Option<PathBuf>,

    /// Accept PUT/PATCH on clusters in the Failed state
    #[arg(
        long,
        env = "ALLOW_RETRY_FROM_FAILED",
        default_value_t = true,
        action = ArgAction::Set
    )]
    allow_retry_from_failed: bool,

    /// Kubeconfig for clusters whose documents carry no admin kubeconfig
    #[arg(long, env = "BOOTSTRAP_KUBECONFIG")]
    bootstrap_kubeconfig: Option<PathBuf>,

    /// Keep documents in memory (development only)
    #[arg(long)]
    in_memory_store: bool,

    #[command(flatten)]
    store: StoreArgs,
}

#[derive(Args, Debug)]
struct StoreArgs {
    /// Cosmos DB account name
    #[arg(long, env = "COSMOSDB_ACCOUNT")]
    cosmos_account: Option<String>,

    /// Cosmos DB master key
    #[arg(long, env = "COSMOSDB_KEY", hide_env_values = true)]
    cosmos_key: Option<String>,

    /// Cosmos DB database id
    #[arg(long, env = "COSMOSDB_DATABASE", default_value = "mantle")]
    cosmos_database: String,

    /// Cosmos DB collection id
    #[arg(long, env = "COSMOSDB_COLLECTION", default_value = "OpenShiftClusters")]
    cosmos_collection: String,
}

#[derive(Args, Debug)]
struct DumpArgs {
    /// Resource id of the cluster
    key: String,

    /// Print secrets instead of blanking them
    #[arg(long)]
    show_secrets: bool,

    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Json)]
    format: OutputFormat,

    #[command(flatten)]
    store: StoreArgs,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum OutputFormat {
    Json,
    Yaml,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // The listener and every outbound client share the aws-lc-rs provider.
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!(
            "CRITICAL: failed to install the aws-lc-rs crypto provider: {:?}",
            e
        );
        std::process::exit(1);
    }

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve(args) => run_serve(args).await,
        Commands::DumpDocument(args) => run_dump(args).await,
    }
}

fn http_client() -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(60))
        .build()
        .context("building HTTP client")
}

fn open_cosmos(args: &StoreArgs, http: reqwest::Client) -> anyhow::Result<CosmosStore> {
    let account = args
        .cosmos_account
        .clone()
        .ok_or_else(|| anyhow!("--cosmos-account is required"))?;
    let key = args
        .cosmos_key
        .clone()
        .ok_or_else(|| anyhow!("--cosmos-key is required"))?;
    let config = CosmosConfig {
        account,
        database: args.cosmos_database.clone(),
        collection: args.cosmos_collection.clone(),
        master_key: Secret::new(key),
    };
    CosmosStore::new(http, &config).context("configuring Cosmos DB store")
}

async fn run_serve(args: ServeArgs) -> anyhow::Result<()> {
    init_telemetry(TelemetryConfig {
        service_name: "mantle".to_string(),
        json: args.mode == Mode::Production,
    })?;
    info!(mode = %args.mode, location = %args.location, "starting mantle");

    let http = http_client()?;

    let store: Arc<dyn DocumentStore> = if args.in_memory_store {
        if args.mode != Mode::Development {
            bail!("--in-memory-store is only allowed in development mode");
        }
        warn!("documents are kept in memory and lost on exit");
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(open_cosmos(&args.store, http.clone())?)
    };

    let credentials = Arc::new(ClientCredentials::new(
        http.clone(),
        args.tenant_id.clone(),
        args.client_id.clone(),
        Secret::new(args.client_secret.clone()),
    ));
    let arm = Arc::new(ArmClient::new(http.clone(), credentials));
    let clients = AzureClients {
        deployments: arm.clone(),
        resource_groups: arm.clone(),
        subnets: arm.clone(),
        record_sets: arm.clone(),
    };

    let dns = Arc::new(
        DnsRegistrar::discover(
            clients.record_sets.clone(),
            &args.subscription_id,
            &args.resource_group,
        )
        .await
        .context("discovering the service DNS zone")?,
    );
    info!(zone = %dns.zone(), "using DNS zone");

    let settings = Settings {
        location: args.location.clone(),
        tenant_id: args.tenant_id.clone(),
        subscription_id: args.subscription_id.clone(),
        resource_group: args.resource_group.clone(),
        pull_secret: Secret::new(args.pull_secret.clone()),
        base_domain: dns.zone().to_string(),
    };

    let probes = match &args.bootstrap_kubeconfig {
        Some(path) => {
            let kubeconfig = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            KubeProbeFactory::new().with_fallback(Secret::new(kubeconfig), dns.zone())
        }
        None => {
            warn!("no --bootstrap-kubeconfig; clusters without an admin kubeconfig fail at await-bootstrap");
            KubeProbeFactory::new()
        }
    };

    let installer = Installer::new(
        store.clone(),
        settings,
        &clients,
        dns.clone(),
        Arc::new(probes),
    );
    let backend = Arc::new(Backend::new(
        store.clone(),
        installer,
        dns,
        clients.resource_groups.clone(),
    ));

    let shutdown = CancellationToken::new();
    let dispatcher = Arc::new(LocalDispatcher::new(backend.clone(), shutdown.child_token()));
    let resumed = backend
        .recover(dispatcher.as_ref())
        .await
        .context("resuming interrupted work")?;
    info!(resumed, "backend started");

    let env = Arc::new(match args.mode {
        Mode::Development => Environment::Development,
        Mode::Production => {
            let metadata = Arc::new(MetadataCache::new(
                Arc::new(HttpMetadataSource::new(http.clone(), ARM_METADATA_URL)),
                Arc::new(SystemClock),
                METADATA_REFRESH_INTERVAL,
            ));
            metadata.start();
            Environment::Production { metadata }
        }
    });

    let tls = match (&args.tls_cert, &args.tls_key) {
        (Some(cert), Some(key)) => Some(TlsPem {
            cert_pem: tokio::fs::read_to_string(cert)
                .await
                .with_context(|| format!("reading {}", cert.display()))?,
            key_pem: tokio::fs::read_to_string(key)
                .await
                .with_context(|| format!("reading {}", key.display()))?,
        }),
        (None, None) => None,
        _ => bail!("--tls-cert and --tls-key must be given together"),
    };
    if tls.is_none() && args.mode == Mode::Production {
        bail!("production mode requires --tls-cert and --tls-key");
    }

    let config = ServerConfig {
        addr: args.listen.unwrap_or_else(|| env.listen_address()),
        tls,
        drain_timeout: DEFAULT_DRAIN_TIMEOUT,
    };

    let state = AppState::new(
        store,
        dispatcher.clone(),
        env.clone(),
        args.location.clone(),
        args.tenant_id.clone(),
    )
    .with_policy(ProvisioningPolicy {
        allow_retry_from_failed: args.allow_retry_from_failed,
    })
    .with_cancellation(shutdown.child_token());

    let mut server = tokio::spawn(mantle_api::serve(config, state, shutdown.clone()));
    let exited_early = tokio::select! {
        result = &mut server => Some(result),
        _ = shutdown_signal() => {
            info!("shutdown signal received");
            None
        }
    };
    shutdown.cancel();
    let served = match exited_early {
        Some(result) => result,
        None => server.await,
    };

    dispatcher.shutdown().await;
    if let Environment::Production { metadata } = env.as_ref() {
        metadata.stop().await;
    }
    served.context("server task panicked")??;
    info!("mantle stopped");
    Ok(())
}

async fn run_dump(args: DumpArgs) -> anyhow::Result<()> {
    let store = open_cosmos(&args.store, http_client()?)?;
    let key = resource_key(&args.key);
    let mut doc = store
        .get(&key)
        .await
        .with_context(|| format!("reading document {}", key))?;
    if !args.show_secrets {
        doc.cluster.scrub_secrets();
    }
    let rendered = match args.format {
        OutputFormat::Json => serde_json::to_string_pretty(&doc)?,
        OutputFormat::Yaml => serde_yaml::to_string(&doc)?,
    };
    println!("{}", rendered);
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
