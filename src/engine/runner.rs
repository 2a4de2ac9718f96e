//! Workflow execution.
//!
//! Nodes run in dependency waves. A failing node aborts its own branch;
//! independent branches keep running. Every node result goes through the
//! cache, so re-running a finished workflow touches no data.
use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;
use petgraph::graph::NodeIndex;
use rayon::prelude::*;
use tracing::{error, info};

use crate::engine::cache::NodeCache;
use crate::engine::graph::Workflow;
use crate::engine::node::Sockets;
use crate::error::PipelineError;

/// How the engine schedules ready nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecPolicy {
    /// One node at a time on the current thread.
    Linear,
    /// Ready nodes of a wave run on a pool of this many threads.
    LocalParallel(usize),
    /// Batch-scheduler submission; not available in this build.
    Cluster,
}

/// Outcome of one workflow run.
#[derive(Debug, Default)]
pub struct RunReport {
    pub completed: Vec<String>,
    pub failed: Vec<(String, String)>,
    pub skipped: Vec<String>,
    /// Output sockets of every completed node, by node name.
    pub outputs: BTreeMap<String, Sockets>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Execute `workflow` with working directories under `base_dir`.
pub fn run(workflow: &Workflow, base_dir: &Path, policy: ExecPolicy) -> Result<RunReport> {
    if policy == ExecPolicy::Cluster {
        return Err(PipelineError::config(
            "cluster execution needs an external scheduler and is not available",
        ));
    }
    let order = workflow.sorted()?;
    let waves = waves_by_depth(workflow, &order);
    info!(workflow = %workflow.name, n_nodes = order.len(), n_waves = waves.len(), "run start");

    let mut produced: BTreeMap<NodeIndex, Sockets> = BTreeMap::new();
    let mut report = RunReport::default();
    let mut dead: Vec<NodeIndex> = Vec::new();

    for wave in waves {
        let ready: Vec<NodeIndex> = wave
            .iter()
            .copied()
            .filter(|idx| {
                let blocked = workflow.predecessors(*idx).iter().any(|p| dead.contains(p));
                if blocked {
                    report.skipped.push(workflow.node(*idx).name().to_string());
                }
                !blocked
            })
            .collect();
        // skipped nodes poison their own successors too
        for idx in &wave {
            if !ready.contains(idx) {
                dead.push(*idx);
            }
        }

        let results: Vec<(NodeIndex, Result<Sockets>)> = match policy {
            ExecPolicy::Linear => ready
                .iter()
                .map(|&idx| (idx, run_one(workflow, idx, &produced, base_dir)))
                .collect(),
            ExecPolicy::LocalParallel(n_threads) => {
                let pool = rayon::ThreadPoolBuilder::new().num_threads(n_threads).build()?;
                pool.install(|| {
                    ready
                        .par_iter()
                        .map(|&idx| (idx, run_one(workflow, idx, &produced, base_dir)))
                        .collect()
                })
            }
            ExecPolicy::Cluster => unreachable!(),
        };

        for (idx, result) in results {
            let name = workflow.node(idx).name().to_string();
            match result {
                Ok(outputs) => {
                    produced.insert(idx, outputs.clone());
                    report.outputs.insert(name.clone(), outputs);
                    report.completed.push(name);
                }
                Err(e) => {
                    error!(node = %name, error = %e, "node failed");
                    report.failed.push((name, format!("{e:#}")));
                    dead.push(idx);
                }
            }
        }
    }
    info!(
        workflow = %workflow.name,
        completed = report.completed.len(),
        failed = report.failed.len(),
        skipped = report.skipped.len(),
        "run finished"
    );
    Ok(report)
}

fn run_one(
    workflow: &Workflow,
    idx: NodeIndex,
    produced: &BTreeMap<NodeIndex, Sockets>,
    base_dir: &Path,
) -> Result<Sockets> {
    let node = workflow.node(idx);
    let inputs = workflow.gather_inputs(idx, produced)?;
    let cache = NodeCache::new(base_dir, &workflow.name, node.name())?;
    if let Some(outputs) = cache.lookup(&inputs)? {
        info!(node = %node.name(), "cached, skipping");
        return Ok(outputs);
    }
    let outputs = node.run(&inputs, cache.workdir())?;
    cache.store(&inputs, &outputs)?;
    Ok(outputs)
}

/// Group nodes into waves: a node's wave is one past its deepest
/// predecessor.
fn waves_by_depth(workflow: &Workflow, order: &[NodeIndex]) -> Vec<Vec<NodeIndex>> {
    let mut depth: BTreeMap<NodeIndex, usize> = BTreeMap::new();
    let mut max_depth = 0usize;
    for &idx in order {
        let d = workflow
            .predecessors(idx)
            .iter()
            .map(|p| depth.get(p).copied().unwrap_or(0) + 1)
            .max()
            .unwrap_or(0);
        depth.insert(idx, d);
        max_depth = max_depth.max(d);
    }
    let mut waves = vec![Vec::new(); max_depth + 1];
    for &idx in order {
        waves[depth[&idx]].push(idx);
    }
    waves
}

/// One fan-out unit of a cohort run.
#[derive(Debug, Clone)]
pub struct CohortItem {
    pub subject: String,
    pub session: String,
}

/// Build and run one workflow per cohort item, each under its own
/// directory. With `LocalParallel`, items run concurrently and each
/// workflow runs its own nodes linearly.
pub fn run_cohort<F>(
    build: F,
    items: &[CohortItem],
    base_dir: &Path,
    policy: ExecPolicy,
) -> Result<Vec<RunReport>>
where
    F: Fn(&CohortItem) -> Result<Workflow> + Sync,
{
    if policy == ExecPolicy::Cluster {
        return Err(PipelineError::config(
            "cluster execution needs an external scheduler and is not available",
        ));
    }
    let run_item = |item: &CohortItem| -> Result<RunReport> {
        let wf = build(item)?;
        let dir = base_dir.join(format!("{}_{}", item.subject, item.session));
        run(&wf, &dir, ExecPolicy::Linear)
    };
    match policy {
        ExecPolicy::Linear => items.iter().map(run_item).collect(),
        ExecPolicy::LocalParallel(n_threads) => {
            let pool = rayon::ThreadPoolBuilder::new().num_threads(n_threads).build()?;
            pool.install(|| items.par_iter().map(run_item).collect())
        }
        ExecPolicy::Cluster => unreachable!(),
    }
}
