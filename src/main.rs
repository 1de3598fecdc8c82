//! DirectPV
//!
//! One binary, three roles:
//!
//! - `controller`: CSI identity and controller services plus the leader-elected
//!   reservation repairer
//! - `node-server`: CSI identity and node services plus the node-side
//!   reconcilers and the volume health monitor
//! - `conversion-webhook`: CRD schema conversion over plain HTTP; TLS is
//!   terminated in front of it

use clap::{Args as ClapArgs, Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tracing::{error, info, warn, Level};
use tracing_subscriber::filter::Directive;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use directpv::client::{self, Clients};
use directpv::config::{
    ControllerConfig, NodeConfig, WebhookConfig, DEFAULT_CSI_ENDPOINT, DEFAULT_LEASE_NAMESPACE,
    DEFAULT_WEBHOOK_ADDR,
};
use directpv::controller::{Dispatcher, LeaderElector, LeaseConfig, DEFAULT_WORKERS};
use directpv::csi::proto::controller_server::ControllerServer;
use directpv::csi::proto::identity_server::IdentityServer;
use directpv::csi::proto::node_server::NodeServer;
use directpv::csi::{self, ControllerService, IdentityService, NodeService, DRIVER_NAME};
use directpv::drive::DriveEventHandler;
use directpv::error::{Error, Result};
use directpv::initrequest::{InitRequestEventHandler, NodeEventHandler};
use directpv::lister::MAX_THREAD_COUNT;
use directpv::node::paths::{DEFAULT_MOUNT_ROOT, DEFAULT_TMPFS_DIR};
use directpv::node::{LinuxNodeOps, NodeOps};
use directpv::volume::{VolumeEventHandler, VolumeHealthMonitor, VolumeReservationRepairer};

const RESERVATION_LEASE: &str = "directpv-volume-reservation";

// =============================================================================
// CLI Arguments
// =============================================================================

/// DirectPV - node-local CSI provisioner for directly-attached drives
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the CSI controller server
    Controller,
    /// Run the CSI node server on this node
    NodeServer,
    /// Run the CRD conversion webhook
    ConversionWebhook {
        /// Listen address
        #[arg(long, env = "WEBHOOK_ADDR", default_value = DEFAULT_WEBHOOK_ADDR)]
        addr: String,
    },
}

#[derive(ClapArgs, Debug)]
struct CommonArgs {
    /// CSI endpoint
    #[arg(long, global = true, env = "CSI_ENDPOINT", default_value = DEFAULT_CSI_ENDPOINT)]
    csi_endpoint: String,

    /// Node ID, usually the Kubernetes node name
    #[arg(long, global = true, env = "NODE_ID", default_value = "")]
    node_id: String,

    /// Identity of this instance
    #[arg(long, global = true, env = "IDENTITY", default_value = DRIVER_NAME)]
    identity: String,

    /// Rack topology of this node
    #[arg(long, global = true, default_value = "default")]
    rack: String,

    /// Zone topology of this node
    #[arg(long, global = true, default_value = "default")]
    zone: String,

    /// Region topology of this node
    #[arg(long, global = true, default_value = "default")]
    region: String,

    /// Directory drives are mounted under
    #[arg(long, global = true, default_value = DEFAULT_MOUNT_ROOT)]
    mount_root: PathBuf,

    /// Directory of the read-only tmpfs used for suspended volumes
    #[arg(long, global = true, default_value = DEFAULT_TMPFS_DIR)]
    tmpfs_dir: PathBuf,

    /// Workers per event handler
    #[arg(long, global = true, default_value_t = DEFAULT_WORKERS)]
    workers: usize,

    /// Volume health check interval in seconds
    #[arg(long, global = true, default_value = "60")]
    health_interval_secs: u64,

    /// Run the reservation repairer under a lease
    #[arg(long, global = true, env = "LEADER_ELECTION")]
    leader_election: bool,

    /// Namespace of the leader election lease
    #[arg(long, global = true, default_value = DEFAULT_LEASE_NAMESPACE)]
    lease_namespace: String,

    /// Page size of list calls
    #[arg(long, global = true, default_value_t = MAX_THREAD_COUNT)]
    max_objects: u32,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, global = true, env = "LOG_JSON")]
    log_json: bool,
}

impl CommonArgs {
    fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            csi_endpoint: self.csi_endpoint.clone(),
            identity: self.identity.clone(),
            workers: self.workers,
            leader_election: self.leader_election,
            lease_namespace: self.lease_namespace.clone(),
            max_objects: self.max_objects,
        }
    }

    fn node_config(&self) -> NodeConfig {
        NodeConfig {
            csi_endpoint: self.csi_endpoint.clone(),
            node_id: self.node_id.clone(),
            identity: self.identity.clone(),
            rack: self.rack.clone(),
            zone: self.zone.clone(),
            region: self.region.clone(),
            mount_root: self.mount_root.clone(),
            tmpfs_dir: self.tmpfs_dir.clone(),
            workers: self.workers,
            health_interval: Duration::from_secs(self.health_interval_secs),
        }
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.common);

    info!("Starting DirectPV");
    info!("  Version: {}", directpv::VERSION);

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(cancel.clone()));

    let result = match &args.command {
        Command::Controller => run_controller(args.common.controller_config(), cancel).await,
        Command::NodeServer => run_node_server(args.common.node_config(), cancel).await,
        Command::ConversionWebhook { addr } => run_webhook(WebhookConfig::from_addr(addr)?, cancel).await,
    };
    if let Err(e) = &result {
        error!("DirectPV exited with error: {}", e);
    }
    info!("Shutdown complete");
    result
}

async fn shutdown_on_signal(cancel: CancellationToken) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!("Received shutdown signal");
            cancel.cancel();
        }
        Err(e) => warn!("Failed to listen for shutdown signal: {}", e),
    }
}

// =============================================================================
// Controller
// =============================================================================

async fn run_controller(config: ControllerConfig, cancel: CancellationToken) -> Result<()> {
    config.validate()?;
    info!("  CSI endpoint: {}", config.csi_endpoint);
    info!("  Leader election: {}", config.leader_election);

    let clients = client::init(&config.identity).await?.clone();

    let router = Server::builder()
        .add_service(IdentityServer::new(IdentityService::new()))
        .add_service(ControllerServer::new(
            ControllerService::new(clients.clone()).with_max_objects(config.max_objects),
        ));

    let repairer = run_reservation_repairer(&config, clients, cancel.clone());
    let server = csi::serve(router, &config.csi_endpoint, cancel.clone());

    // either side failing takes the process down
    let result = tokio::select! {
        r = server => r,
        r = repairer => r,
    };
    cancel.cancel();
    result
}

async fn run_reservation_repairer(
    config: &ControllerConfig,
    clients: Clients,
    cancel: CancellationToken,
) -> Result<()> {
    let dispatcher = Dispatcher::new(
        clients.volumes.clone(),
        Arc::new(VolumeReservationRepairer::new(clients.clone())),
        config.workers,
    );
    if !config.leader_election {
        dispatcher.run(cancel).await;
        return Ok(());
    }

    let kube = clients
        .kube
        .clone()
        .ok_or_else(|| Error::Configuration("leader election requires a cluster client".into()))?;
    let holder = format!("{}-{}", config.identity, uuid::Uuid::new_v4());
    let elector = LeaderElector::new(
        kube,
        LeaseConfig::new(RESERVATION_LEASE, &config.lease_namespace, holder),
    );
    elector.run(cancel, |token| dispatcher.run(token)).await
}

// =============================================================================
// Node server
// =============================================================================

async fn run_node_server(config: NodeConfig, cancel: CancellationToken) -> Result<()> {
    config.validate()?;
    info!("  Node ID: {}", config.node_id);
    info!("  CSI endpoint: {}", config.csi_endpoint);
    info!("  Mount root: {}", config.mount_root.display());

    let clients = client::init(&config.node_id).await?.clone();
    let ops: Arc<dyn NodeOps> = Arc::new(LinuxNodeOps::default());
    let service_config = config.service_config();
    let topology: BTreeMap<String, String> = service_config.topology().into_iter().collect();

    let node_service = NodeService::new(clients.clone(), ops.clone(), service_config);
    node_service.prepare_tmpfs().await?;

    let node_handler = Arc::new(NodeEventHandler::new(clients.clone(), ops.clone(), &config.node_id));
    node_handler.sync_devices().await?;

    let mut tasks = tokio::task::JoinSet::new();
    tasks.spawn(
        Dispatcher::new(
            clients.volumes.clone(),
            Arc::new(VolumeEventHandler::new(clients.clone(), ops.clone(), &config.node_id)),
            config.workers,
        )
        .run(cancel.clone()),
    );
    tasks.spawn(
        Dispatcher::new(
            clients.drives.clone(),
            Arc::new(DriveEventHandler::new(
                clients.clone(),
                ops.clone(),
                &config.node_id,
                config.mount_root.clone(),
            )),
            config.workers,
        )
        .run(cancel.clone()),
    );
    tasks.spawn(Dispatcher::new(clients.nodes.clone(), node_handler, config.workers).run(cancel.clone()));
    tasks.spawn(
        Dispatcher::new(
            clients.init_requests.clone(),
            Arc::new(InitRequestEventHandler::new(
                clients.clone(),
                ops.clone(),
                &config.node_id,
                config.mount_root.clone(),
                topology,
            )),
            config.workers,
        )
        .run(cancel.clone()),
    );
    tasks.spawn(
        VolumeHealthMonitor::new(clients.clone(), ops.clone(), &config.node_id, config.health_interval)
            .run(cancel.clone()),
    );

    let router = Server::builder()
        .add_service(IdentityServer::new(IdentityService::new()))
        .add_service(NodeServer::new(node_service));
    let result = csi::serve(router, &config.csi_endpoint, cancel.clone()).await;

    cancel.cancel();
    while tasks.join_next().await.is_some() {}
    result
}

// =============================================================================
// Conversion webhook
// =============================================================================

async fn run_webhook(config: WebhookConfig, cancel: CancellationToken) -> Result<()> {
    info!("  Webhook address: {}", config.addr);
    directpv::converter::webhook::serve(config.addr, cancel).await
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &CommonArgs) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "kube=info", "tower=warn", "h2=warn", "axum=info"] {
        if let Ok(directive) = directive.parse::<Directive>() {
            filter = filter.add_directive(directive);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
