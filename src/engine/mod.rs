//! Minimal workflow engine: a DAG of blocking nodes with per-node working
//! directories, an input-keyed result cache and wave-based scheduling.
pub mod cache;
pub mod graph;
pub mod node;
pub mod runner;

pub use cache::NodeCache;
pub use graph::{Edge, Workflow};
pub use node::{socket, Node, Payload, Sockets};
pub use runner::{run, run_cohort, CohortItem, ExecPolicy, RunReport};
