use clap::Parser;
use std::sync::Arc;
use std::time::Duration;

use fabric_core::config::Config;
use fabric_core::health_monitor::{FaultInjector, HealthMonitor, SimProber};
use fabric_core::optimizer::OptimizerFeedbackPort;
use fabric_core::path_computer::PathComputer;
use fabric_core::recovery::FailureRecoveryEngine;
use fabric_core::routing::{MockFlowProgrammer, RoutingController};
use fabric_core::snapshot::{StatusView, TracingEventSink};
use fabric_core::topology::{FatTreeConfig, TopologyModel};
use fabric_core::types::{CostBias, ElementId, ElementStatus, LinkId, NodeId};
use fabric_core::{FabricError, FabricResult};

#[derive(Parser)]
#[command(name = "fabric")]
#[command(about = "Self-healing SDN control plane for a Fat-Tree fabric", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Run the control plane against a simulated fabric
    Run {
        /// How long to run before shutting down, in seconds
        #[arg(long, default_value = "60")]
        duration_secs: u64,

        /// Probe interval override in milliseconds
        #[arg(long)]
        probe_interval_ms: Option<u64>,

        /// Element to take down during the run, e.g. "cr1" or "h1-es1"
        #[arg(long)]
        fail: Option<String>,

        /// Seconds into the run at which the element fails
        #[arg(long, default_value = "10")]
        fail_after_secs: u64,

        /// Seconds after the failure at which the element comes back;
        /// omit to leave it down
        #[arg(long)]
        recover_after_secs: Option<u64>,

        /// Disable the optimizer feedback port
        #[arg(long)]
        no_optimizer: bool,
    },
    /// Print the topology and its validation result
    Topology,
    /// Compute the multipath set between two hosts
    Paths {
        /// Source host, e.g. h1
        #[arg(long)]
        from: String,

        /// Destination host, e.g. h8
        #[arg(long)]
        to: String,

        /// Elements to treat as Down, comma-separated
        #[arg(long)]
        down: Option<String>,
    },
}

#[tokio::main]
async fn main() -> FabricResult<()> {
    let filter = tracing_subscriber::EnvFilter::from_default_env().add_directive(
        "fabric=info"
            .parse()
            .map_err(|e| FabricError::Configuration {
                message: format!("invalid log directive: {}", e),
            })?,
    );
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            duration_secs,
            probe_interval_ms,
            fail,
            fail_after_secs,
            recover_after_secs,
            no_optimizer,
        } => {
            let mut config = Config::default();
            if let Some(interval) = probe_interval_ms {
                config.probe.interval_ms = interval;
            }
            if no_optimizer {
                config.optimizer.enabled = false;
            }
            run_simulation(
                config,
                duration_secs,
                fail,
                fail_after_secs,
                recover_after_secs,
            )
            .await?;
        }
        Commands::Topology => {
            let topology = TopologyModel::new(FatTreeConfig::default())?;
            print_topology(&topology);
        }
        Commands::Paths { from, to, down } => {
            handle_paths_command(&from, &to, down.as_deref())?;
        }
    }

    Ok(())
}

async fn run_simulation(
    config: Config,
    duration_secs: u64,
    fail: Option<String>,
    fail_after_secs: u64,
    recover_after_secs: Option<u64>,
) -> FabricResult<()> {
    let topology = Arc::new(TopologyModel::new(FatTreeConfig::default())?);
    tracing::info!(
        nodes = topology.node_count(),
        links = topology.link_count(),
        "topology validated"
    );

    let faults = FaultInjector::new();
    let prober = Arc::new(SimProber::new(faults.clone()));
    let (events_tx, events_rx) = tokio::sync::mpsc::channel(config.snapshot.event_queue_depth);
    let mut monitor = HealthMonitor::new(
        Arc::clone(&topology),
        prober,
        config.probe.clone(),
        events_tx,
    );

    let computer = PathComputer::new(Arc::clone(&topology), config.path.clone());
    let controller = RoutingController::new(Arc::new(MockFlowProgrammer::new()));
    let optimizer = Arc::new(OptimizerFeedbackPort::new(config.optimizer.clone()));
    let (mut engine, mut snapshot_rx) = FailureRecoveryEngine::new(
        Arc::clone(&topology),
        computer,
        controller,
        optimizer,
        Arc::new(TracingEventSink),
        config,
    );
    engine.bootstrap().await?;
    let engine_task = engine.spawn(events_rx);
    monitor.start();

    // Scripted fault, mirroring pulling a cable mid-run
    let script = fail
        .map(|spec| parse_element(&topology, &spec))
        .transpose()?;
    let script_task = script.map(|element| {
        let faults = faults.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(fail_after_secs)).await;
            tracing::warn!(element = %element, "injecting failure");
            faults.fail(element.clone());
            if let Some(secs) = recover_after_secs {
                tokio::time::sleep(Duration::from_secs(secs)).await;
                tracing::warn!(element = %element, "restoring element");
                faults.restore(&element);
            }
        })
    });

    let deadline = tokio::time::sleep(Duration::from_secs(duration_secs));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            changed = snapshot_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshot_rx.borrow().clone();
                tracing::info!(
                    revision = snapshot.revision,
                    degraded_nodes = snapshot.status.degraded_nodes().count(),
                    degraded_links = snapshot.status.degraded_links().count(),
                    unreachable = snapshot.unreachable.len(),
                    "snapshot published"
                );
            }
        }
    }

    monitor.stop();
    engine_task.abort();
    if let Some(task) = script_task {
        task.abort();
    }

    let snapshot = snapshot_rx.borrow().clone();
    println!(
        "{}",
        serde_json::to_string_pretty(&snapshot).map_err(|e| FabricError::Internal {
            message: format!("snapshot serialization failed: {}", e),
        })?
    );
    Ok(())
}

fn handle_paths_command(from: &str, to: &str, down: Option<&str>) -> FabricResult<()> {
    let topology = Arc::new(TopologyModel::new(FatTreeConfig::default())?);
    let mut view = StatusView::all_up();
    if let Some(spec) = down {
        for part in spec.split(',').filter(|s| !s.is_empty()) {
            match parse_element(&topology, part.trim())? {
                ElementId::Node(node) => view.set_node_status(node, ElementStatus::Down),
                ElementId::Link(link) => view.set_link_status(link, ElementStatus::Down),
            }
        }
    }

    let computer = PathComputer::new(Arc::clone(&topology), Default::default());
    let entry = computer.compute(
        &NodeId::from(from),
        &NodeId::from(to),
        &view,
        &CostBias::neutral(),
    )?;
    println!("{} -> {}:", from, to);
    for wp in &entry.paths {
        let hops: Vec<&str> = wp.path.hops.iter().map(|h| h.as_str()).collect();
        println!(
            "  [{}] cost={:.2} weight={:.2}",
            hops.join(" "),
            wp.path.cost,
            wp.weight
        );
    }
    Ok(())
}

fn print_topology(topology: &TopologyModel) {
    println!(
        "fat-tree: {} nodes, {} links",
        topology.node_count(),
        topology.link_count()
    );
    for layer in [
        fabric_core::types::Layer::Core,
        fabric_core::types::Layer::Aggregation,
        fabric_core::types::Layer::Edge,
        fabric_core::types::Layer::Host,
    ] {
        let mut ids: Vec<String> = topology
            .nodes_in_layer(layer)
            .map(|n| n.id.to_string())
            .collect();
        ids.sort();
        println!("  {:?}: {}", layer, ids.join(" "));
    }
}

/// Parse "cr1" as a node or "h1-es1" as a link between two nodes
fn parse_element(topology: &TopologyModel, spec: &str) -> FabricResult<ElementId> {
    if let Some((a, b)) = spec.split_once('-') {
        let link = LinkId::new(NodeId::from(a), NodeId::from(b));
        if topology.link(&link).is_err() {
            return Err(FabricError::UnknownElement {
                element: spec.to_string(),
            });
        }
        return Ok(ElementId::Link(link));
    }
    let node = NodeId::from(spec);
    if !topology.contains(&node) {
        return Err(FabricError::UnknownElement {
            element: spec.to_string(),
        });
    }
    Ok(ElementId::Node(node))
}
