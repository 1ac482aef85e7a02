//! Simulate command implementation.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use synset_engine::{ReplicatedSet, ReplicationResult};
use synset_protocol::{MemberSet, Operation, ProtocolResult};
use synset_testkit::Cluster;
use tracing::info;

/// Store key and channel used by the simulated set.
const KEY: &str = "synset:simulation";

/// Values are drawn from `0..VALUE_RANGE`.
const VALUE_RANGE: i64 = 32;

/// Simulation result.
#[derive(Debug, Serialize)]
pub struct SimulationReport {
    /// Number of nodes.
    pub nodes: usize,
    /// Number of operations issued.
    pub operations: usize,
    /// Generator seed.
    pub seed: u64,
    /// Whether the broker was taken down mid-run.
    pub partitioned: bool,
    /// Whether every node matched the store once settled.
    pub converged: bool,
    /// Membership held by the shared store.
    pub store: Vec<i64>,
    /// Per-node state.
    pub node_reports: Vec<NodeReport>,
}

/// State of a single node after the run.
#[derive(Debug, Serialize)]
pub struct NodeReport {
    /// Node index.
    pub index: usize,
    /// Final membership.
    pub members: Vec<i64>,
    /// Operations issued on this node.
    pub local_operations: u64,
    /// Operations applied from peers.
    pub remote_operations: u64,
    /// Operations forwarded to the broker.
    pub forwarded: u64,
    /// Successful seed loads.
    pub seed_loads: u64,
    /// Failed seed loads.
    pub seed_failures: u64,
    /// Operations still waiting to be sent.
    pub outbound_len: usize,
}

/// Runs the simulate command.
pub fn run(
    nodes: usize,
    ops: usize,
    seed: Option<u64>,
    partition: bool,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    if nodes == 0 {
        return Err("At least one node is required".into());
    }
    if format != "text" && format != "json" {
        return Err(format!("Unknown format: {}", format).into());
    }

    let seed = seed.unwrap_or_else(rand::random);
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let report = runtime.block_on(simulate(nodes, ops, seed, partition))?;

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_text(&report);
    }

    if !report.converged {
        return Err("Cluster did not converge".into());
    }
    Ok(())
}

async fn simulate(
    nodes: usize,
    ops: usize,
    seed: u64,
    partition: bool,
) -> ReplicationResult<SimulationReport> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut cluster = Cluster::<i64>::new(KEY, nodes)?;
    cluster.settle().await;

    let down_at = ops / 3;
    let up_at = ops * 2 / 3;

    for i in 0..ops {
        if partition && i == down_at {
            info!(after = i, "taking broker down");
            cluster.broker().set_available(false);
            cluster.pump();
        }
        if partition && i == up_at {
            info!(after = i, "bringing broker back");
            cluster.broker().set_available(true);
        }

        let node = rng.gen_range(0..nodes);
        cluster.node(node).dispatch(random_operation(&mut rng)?);

        // Deliver at irregular points so nodes lag behind each other.
        if rng.gen_bool(0.3) {
            cluster.pump();
        }
    }

    cluster.broker().set_available(true);
    let settled = cluster.settle().await;
    let converged = settled && cluster.is_converged();
    info!(settled, converged, "simulation finished");

    Ok(SimulationReport {
        nodes,
        operations: ops,
        seed,
        partitioned: partition,
        converged,
        store: sorted(&cluster.stored()),
        node_reports: cluster
            .nodes()
            .enumerate()
            .map(|(index, set)| node_report(index, set))
            .collect(),
    })
}

fn random_operation(rng: &mut StdRng) -> ProtocolResult<Operation<i64>> {
    let value = rng.gen_range(0..VALUE_RANGE);
    match rng.gen_range(0..10) {
        0..=3 => Operation::add(value),
        4..=6 => Operation::remove(value),
        7 => Ok(Operation::Clear),
        8 => Operation::add_all(random_values(rng)),
        _ => Operation::replace_all(random_values(rng)),
    }
}

fn random_values(rng: &mut StdRng) -> Vec<i64> {
    let len = rng.gen_range(0..6);
    (0..len).map(|_| rng.gen_range(0..VALUE_RANGE)).collect()
}

fn node_report(index: usize, set: &ReplicatedSet<i64>) -> NodeReport {
    let stats = set.stats();
    NodeReport {
        index,
        members: sorted(&set.members()),
        local_operations: stats.local_operations,
        remote_operations: stats.remote_operations,
        forwarded: stats.forwarded,
        seed_loads: stats.seed_loads,
        seed_failures: stats.seed_failures,
        outbound_len: set.outbound_len(),
    }
}

fn sorted(set: &MemberSet<i64>) -> Vec<i64> {
    let mut values = set.to_values();
    values.sort_unstable();
    values
}

fn print_text(report: &SimulationReport) {
    println!(
        "Simulated {} node(s), {} operation(s), seed {}{}",
        report.nodes,
        report.operations,
        report.seed,
        if report.partitioned { ", with partition" } else { "" }
    );
    println!("Store: {:?}", report.store);
    for node in &report.node_reports {
        println!(
            "  node {}: {:?} (local {}, remote {}, forwarded {}, seeds {}/{} failed, queued {})",
            node.index,
            node.members,
            node.local_operations,
            node.remote_operations,
            node.forwarded,
            node.seed_loads,
            node.seed_failures,
            node.outbound_len
        );
    }
    println!("Converged: {}", if report.converged { "yes" } else { "no" });
}
