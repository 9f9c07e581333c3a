//! Beacon Demo CLI
//!
//! Drives a cluster of randomness beacon nodes through scenarios:
//! - `dkg`: bring up a cluster, run the DKG and check the first beacons
//! - `full`: additionally stop and restart nodes, then reshare the key to a
//!   new node set and check the beacon after the transition
//!
//! Without `--binary` the nodes run in-process on a simulated network.

use anyhow::Result;
use beacon_demo_core::config::parse_duration;
use beacon_demo_core::node::{MemoryNetwork, NodeFactory, PublicApi};
use beacon_demo_core::{
    BeaconValue, Clock, Cluster, DemoConfig, NodeIndex, Orchestrator, ReshareSpec, StorageConfig,
    StorageEngine, SystemClock,
};
use beacon_node_client::{HttpPublicApi, ProcessNodeFactory};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, Level};

/// Beacon Demo - threshold randomness beacon test harness
#[derive(Parser)]
#[command(name = "beacon-demo")]
#[command(about = "Run DKG, failure and resharing scenarios against a beacon cluster")]
#[command(version)]
struct Cli {
    /// Number of nodes in the initial group
    #[arg(short, long, env = "BEACON_DEMO_NODES", default_value_t = beacon_demo_core::DEFAULT_NODES)]
    nodes: usize,

    /// Threshold of the initial group
    #[arg(short, long, env = "BEACON_DEMO_THRESHOLD", default_value_t = beacon_demo_core::DEFAULT_THRESHOLD)]
    threshold: usize,

    /// Beacon period
    #[arg(short, long, env = "BEACON_DEMO_PERIOD", default_value = "2s", value_parser = parse_duration)]
    period: Duration,

    /// Node binary; the simulated network is used when absent
    #[arg(short, long, env = "BEACON_NODE_BIN")]
    binary: Option<PathBuf>,

    /// Serve the public API over TLS
    #[arg(long, env = "BEACON_DEMO_TLS")]
    tls: bool,

    /// Skip the public HTTP API check
    #[arg(long, env = "BEACON_DEMO_NO_HTTP")]
    no_http: bool,

    /// Storage engine of the nodes (bolt, postgres, memdb)
    #[arg(long, env = "BEACON_DEMO_DB", default_value = "bolt")]
    db: StorageEngine,

    /// PostgreSQL connection string; `{index}` is replaced by the node index
    #[arg(long, env = "BEACON_DEMO_PG_DSN")]
    pg_dsn: Option<String>,

    /// Buffer size of the memdb engine
    #[arg(long, env = "BEACON_DEMO_MEMDB_SIZE", default_value_t = 2000)]
    memdb_size: usize,

    /// Beacon id
    #[arg(long, env = "BEACON_DEMO_BEACON_ID", default_value = "")]
    beacon_id: String,

    /// Scheme id handed to the nodes
    #[arg(long, env = "BEACON_DEMO_SCHEME", default_value = beacon_demo_core::config::DEFAULT_SCHEME)]
    scheme: String,

    /// Working directory, wiped on start
    #[arg(long, env = "BEACON_DEMO_BASE_PATH")]
    base_path: Option<PathBuf>,

    /// Timeout of each node's protocol call
    #[arg(long, env = "BEACON_DEMO_DKG_TIMEOUT", default_value = "60s", value_parser = parse_duration)]
    dkg_timeout: Duration,

    /// Time left to the nodes to exit after the stop signal
    #[arg(long, env = "BEACON_DEMO_SHUTDOWN_GRACE", default_value = "10s", value_parser = parse_duration)]
    shutdown_grace: Duration,

    /// File receiving DKG timings
    #[arg(long, env = "BEACON_DEMO_DKG_LOG", default_value = "./test.log")]
    dkg_log: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the DKG and check the first beacons
    Dkg,

    /// Run the DKG, inject failures, then reshare
    Full {
        /// Nodes stopped and restarted after the DKG (comma-separated)
        #[arg(long, value_delimiter = ',', default_value = "2")]
        fail: Vec<NodeIndex>,

        /// Number of nodes joining at resharing
        #[arg(long, default_value_t = 2)]
        new_nodes: usize,

        /// Current nodes leaving at resharing (comma-separated)
        #[arg(long, value_delimiter = ',', default_value = "3")]
        drop: Vec<NodeIndex>,

        /// Threshold of the reshared group
        #[arg(long, default_value_t = 3)]
        new_threshold: usize,

        /// Binary run by restarted nodes and by nodes joining at resharing
        #[arg(long)]
        candidate_binary: Option<PathBuf>,
    },
}

impl Cli {
    fn demo_config(&self) -> Result<DemoConfig> {
        let base_path = self.base_path.clone().unwrap_or_else(|| {
            std::env::temp_dir().join(format!("beacon-demo-{}", uuid::Uuid::new_v4()))
        });
        let mut config = DemoConfig::new(self.nodes, self.threshold, self.period, base_path)?;
        config.tls = self.tls;
        config.with_http = !self.no_http;
        config.binary = self.binary.clone();
        config.beacon_id = self.beacon_id.clone();
        config.scheme = self.scheme.clone();
        config.storage = StorageConfig {
            engine: self.db,
            pg_dsn: self.pg_dsn.clone(),
            memdb_size: self.memdb_size,
        };
        config.dkg_log = self.dkg_log.clone();
        config.validate()?;
        Ok(config)
    }
}

/// Clusters created so far, stopped when the run ends
#[derive(Default)]
struct Run {
    cluster: Option<Cluster>,
    new_nodes: Option<Cluster>,
}

impl Run {
    fn clusters(&self) -> Vec<&Cluster> {
        self.cluster.iter().chain(self.new_nodes.iter()).collect()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.demo_config()?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let (factory, public): (Arc<dyn NodeFactory>, Arc<dyn PublicApi>) = match &config.binary {
        Some(binary) => {
            info!(binary = %binary.display(), "Running node binary");
            (
                Arc::new(ProcessNodeFactory::new(Arc::new(config.clone()), binary.clone())),
                Arc::new(HttpPublicApi::new(config.tls)),
            )
        }
        None => {
            info!("No node binary configured, running simulated nodes");
            let network = MemoryNetwork::new(clock.clone());
            (Arc::new(network.clone()), network.public_api())
        }
    };

    let orchestrator = Orchestrator::new(config, factory, public, clock)?;
    let mut run = Run::default();

    let result = match &cli.command {
        Commands::Dkg => run_dkg(&orchestrator, &cli, &mut run).await,
        Commands::Full {
            fail,
            new_nodes,
            drop,
            new_threshold,
            candidate_binary,
        } => {
            let reshare = ReshareOptions {
                fail,
                new_nodes: *new_nodes,
                drop,
                new_threshold: *new_threshold,
                candidate_binary: candidate_binary.as_ref(),
            };
            run_full(&orchestrator, &cli, &mut run, &reshare).await
        }
    };

    if let Err(e) = &result {
        error!(error = %e, "Scenario failed, printing node logs");
        for (index, log) in orchestrator.print_logs(&run.clusters()).await {
            println!("===== node {index} =====\n{log}");
        }
    }
    orchestrator.shutdown(&run.clusters(), cli.shutdown_grace).await;

    result
}

fn print_beacon(beacon: &BeaconValue) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(beacon)?);
    Ok(())
}

async fn run_dkg(orchestrator: &Orchestrator, cli: &Cli, run: &mut Run) -> Result<()> {
    let cluster = orchestrator.setup_cluster().await?;
    let cluster = run.cluster.insert(cluster);
    orchestrator.start_nodes(&cluster.nodes, &[]).await?;

    let epoch = orchestrator.run_dkg(cluster, cli.dkg_timeout).await?;
    orchestrator.wait_genesis(&epoch).await;
    let beacon = orchestrator.check_beacon(&epoch, &[]).await?;
    print_beacon(&beacon)?;

    info!(key = %epoch.group.public_key_hex(), "DKG scenario succeeded");
    Ok(())
}

struct ReshareOptions<'a> {
    fail: &'a [NodeIndex],
    new_nodes: usize,
    drop: &'a [NodeIndex],
    new_threshold: usize,
    candidate_binary: Option<&'a PathBuf>,
}

async fn run_full(
    orchestrator: &Orchestrator,
    cli: &Cli,
    run: &mut Run,
    options: &ReshareOptions<'_>,
) -> Result<()> {
    let cluster = orchestrator.setup_cluster().await?;
    let cluster = run.cluster.insert(cluster).clone();
    orchestrator.start_nodes(&cluster.nodes, &[]).await?;

    let epoch = orchestrator.run_dkg(&cluster, cli.dkg_timeout).await?;
    orchestrator.wait_genesis(&epoch).await;
    print_beacon(&orchestrator.check_beacon(&epoch, &[]).await?)?;

    // partial failure: the remaining nodes keep producing
    if !options.fail.is_empty() {
        orchestrator.stop_nodes(&cluster.nodes, options.fail).await;
        orchestrator.wait_period(&epoch).await;
        print_beacon(&orchestrator.check_beacon(&epoch, options.fail).await?)?;

        if let Some(candidate) = options.candidate_binary {
            for &index in options.fail {
                orchestrator.update_binary(&cluster, index, candidate)?;
            }
        }

        orchestrator.start_node(&[&cluster], options.fail).await?;
        orchestrator.wait(cli.period * 2).await;
        orchestrator.wait_period(&epoch).await;
        print_beacon(&orchestrator.check_beacon(&epoch, &[]).await?)?;
    }

    if let Some(candidate) = options.candidate_binary {
        orchestrator.update_global_binary(candidate);
    }
    let new_nodes = orchestrator.setup_new_nodes(&cluster, options.new_nodes).await?;
    let new_nodes = run.new_nodes.insert(new_nodes).clone();
    orchestrator.start_nodes(&new_nodes.nodes, &[]).await?;

    let reshare = ReshareSpec::dropping(&cluster.indices(), options.drop, options.new_threshold);
    let plan = orchestrator
        .create_resharing_group(&epoch, &new_nodes, &reshare)
        .await?;
    let next = orchestrator
        .run_resharing(&plan, &epoch, cli.dkg_timeout)
        .await?;

    orchestrator.wait_transition(&next).await;
    print_beacon(&orchestrator.check_beacon(&next, &[]).await?)?;

    info!(
        key = %next.group.public_key_hex(),
        members = ?next.group.member_indices(),
        threshold = next.group.threshold,
        "Full scenario succeeded"
    );
    Ok(())
}
