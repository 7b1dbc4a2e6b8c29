//! Machina - node pool resolution, OS image updates and component state aggregation

use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, CustomResourceExt, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use machina_common::crd::{MachineConfigPool, MachineState};
use machina_common::events::KubeComponentEventPublisher;
use machina_common::telemetry::{init_telemetry, TelemetryConfig};
use machina_common::{FIELD_MANAGER, OPERATOR_NAMESPACE};
use machina_pool::{nodes_for_pool_name, pools_for_node_name, KubePoolLister};
use machina_state::{
    ensure_records, KubeStateStore, RateLimitingQueue, StateController, StateControllerConfig,
    SubController,
};
use machina_update::{EventProgress, RealCommandRunner, UpdateAgent, UpdateOrchestrator};

/// Machina - OS configuration rollout for cluster nodes
#[derive(Parser, Debug)]
#[command(name = "machina", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the MachineState controller
    ///
    /// Watches component health events and folds them into one
    /// MachineState record per component.
    Controller(ControllerArgs),

    /// Move the local host to an OS image
    Update(UpdateArgs),

    /// Print the pools a node belongs to (effective first), or a pool's nodes
    Pools {
        /// Node to resolve
        #[arg(long, env = "NODE_NAME", conflicts_with = "pool")]
        node: Option<String>,

        /// List the nodes whose effective pool is this one
        #[arg(long)]
        pool: Option<String>,
    },

    /// Print CRD manifests and exit
    Crd,
}

#[derive(Args, Debug)]
struct ControllerArgs {
    /// Number of queue workers
    #[arg(long, env = "MACHINA_WORKERS", default_value_t = 2)]
    workers: usize,

    /// Seconds between a record change and its sync
    #[arg(long, env = "MACHINA_UPDATE_DELAY_SECS", default_value_t = 5)]
    update_delay_secs: u64,

    /// Namespace component events are published in
    #[arg(long, env = "MACHINA_NAMESPACE", default_value = OPERATOR_NAMESPACE)]
    namespace: String,

    /// Do not start the bootstrap monitor
    #[arg(long, env = "MACHINA_DISABLE_BOOTSTRAP")]
    no_bootstrap: bool,
}

impl ControllerArgs {
    fn config(&self) -> StateControllerConfig {
        let sub_controllers = if self.no_bootstrap {
            Vec::new()
        } else {
            vec![SubController::Bootstrap]
        };
        StateControllerConfig {
            workers: self.workers,
            update_delay: Duration::from_secs(self.update_delay_secs),
            namespace: self.namespace.clone(),
            sub_controllers,
        }
    }
}

#[derive(Args, Debug)]
struct UpdateArgs {
    /// Image to move the host to
    #[arg(long)]
    image: String,

    /// Name of this node, attached to progress events
    #[arg(long, env = "NODE_NAME")]
    node: String,

    /// Update agent managing the host (rpm-ostree or bootc)
    #[arg(long, env = "MACHINA_UPDATE_AGENT", default_value = "rpm-ostree")]
    agent: UpdateAgent,

    /// Namespace progress events are published in
    #[arg(long, env = "MACHINA_NAMESPACE", default_value = OPERATOR_NAMESPACE)]
    namespace: String,

    /// Do not publish progress events
    #[arg(long)]
    no_events: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Commands::Crd = cli.command {
        for crd in [MachineConfigPool::crd(), MachineState::crd()] {
            let yaml = serde_yaml::to_string(&crd)
                .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
            println!("---\n{yaml}");
        }
        return Ok(());
    }

    init_telemetry(TelemetryConfig::for_service("machina"))?;

    match cli.command {
        Commands::Controller(args) => run_controller(args).await,
        Commands::Update(args) => run_update(args).await,
        Commands::Pools { node, pool } => print_pools(node, pool).await,
        Commands::Crd => Ok(()),
    }
}

/// Cancel the returned token on SIGINT
fn shutdown_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("received shutdown signal"),
            Err(e) => error!(error = %e, "failed to listen for shutdown signal"),
        }
        trigger.cancel();
    });
    cancel
}

/// Install or update the Machina CRDs with server-side apply
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    for crd in [MachineConfigPool::crd(), MachineState::crd()] {
        let name = crd.name_any();
        info!(crd = %name, "Installing CRD");
        crds.patch(&name, &params, &Patch::Apply(&crd))
            .await
            .map_err(|e| anyhow::anyhow!("Failed to install {} CRD: {}", name, e))?;
    }
    Ok(())
}

async fn run_controller(args: ControllerArgs) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    ensure_crds_installed(&client).await?;

    let store = Arc::new(KubeStateStore::new(client.clone()));
    ensure_records(store.as_ref()).await?;

    let controller = Arc::new(StateController::new(
        store,
        Arc::new(RateLimitingQueue::new()),
        args.config(),
    ));
    controller.start(client, shutdown_token()).await;

    info!("MachineState controller stopped");
    Ok(())
}

async fn run_update(args: UpdateArgs) -> anyhow::Result<()> {
    let mut orchestrator = UpdateOrchestrator::new(Arc::new(RealCommandRunner), args.agent);
    if !args.no_events {
        let client = Client::try_default()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;
        let publisher = Arc::new(KubeComponentEventPublisher::with_namespace(
            client,
            &args.namespace,
        ));
        orchestrator =
            orchestrator.with_progress(Arc::new(EventProgress::new(publisher, args.node.clone())));
    }

    orchestrator.initialize().await?;
    orchestrator.apply_update(&args.image).await?;

    info!(node = %args.node, image = %args.image, "OS update staged");
    Ok(())
}

async fn print_pools(node: Option<String>, pool: Option<String>) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;
    let lister = KubePoolLister::new(client);

    if let Some(pool) = pool {
        for node in nodes_for_pool_name(&lister, &pool).await? {
            println!("{}", node.name_any());
        }
        return Ok(());
    }

    let node = node.ok_or_else(|| anyhow::anyhow!("either --node or --pool is required"))?;
    match pools_for_node_name(&lister, &node).await? {
        Some(assignment) => {
            for name in assignment.names() {
                println!("{name}");
            }
        }
        None => info!(node = %node, "node is not managed by any pool"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn controller_defaults() {
        let cli = Cli::try_parse_from(["machina", "controller"]).unwrap();
        let Commands::Controller(args) = cli.command else {
            panic!("expected controller command");
        };
        let config = args.config();
        assert_eq!(config.workers, 2);
        assert_eq!(config.update_delay, Duration::from_secs(5));
        assert_eq!(config.namespace, OPERATOR_NAMESPACE);
        assert_eq!(config.sub_controllers, vec![SubController::Bootstrap]);
    }

    #[test]
    fn bootstrap_can_be_disabled() {
        let cli = Cli::try_parse_from(["machina", "controller", "--no-bootstrap", "--workers", "4"])
            .unwrap();
        let Commands::Controller(args) = cli.command else {
            panic!("expected controller command");
        };
        let config = args.config();
        assert_eq!(config.workers, 4);
        assert!(config.sub_controllers.is_empty());
    }

    #[rstest]
    #[case("rpm-ostree", UpdateAgent::RpmOstree)]
    #[case("bootc", UpdateAgent::Bootc)]
    fn update_agent_is_parsed(#[case] agent: &str, #[case] expected: UpdateAgent) {
        let cli = Cli::try_parse_from([
            "machina", "update", "--image", "quay.io/os:1", "--node", "n1", "--agent", agent,
        ])
        .unwrap();
        let Commands::Update(args) = cli.command else {
            panic!("expected update command");
        };
        assert_eq!(args.agent, expected);
        assert_eq!(args.node, "n1");
    }

    #[test]
    fn unknown_agent_is_rejected() {
        assert!(Cli::try_parse_from([
            "machina", "update", "--image", "img", "--node", "n1", "--agent", "yum",
        ])
        .is_err());
    }
}
