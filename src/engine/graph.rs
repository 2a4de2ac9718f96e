//! Workflow DAG: nodes connected socket-to-socket.
use std::collections::BTreeMap;

use anyhow::Result;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;

use crate::engine::node::{Node, Payload, Sockets};
use crate::error::PipelineError;

/// A socket-to-socket data dependency.
#[derive(Debug, Clone)]
pub struct Edge {
    pub from_socket: String,
    pub to_socket: String,
}

/// Directed acyclic graph of nodes plus externally supplied inputs.
pub struct Workflow {
    pub name: String,
    graph: DiGraph<Box<dyn Node>, Edge>,
    external: BTreeMap<(NodeIndex, String), Payload>,
}

impl Workflow {
    pub fn new(name: impl Into<String>) -> Self {
        Workflow { name: name.into(), graph: DiGraph::new(), external: BTreeMap::new() }
    }

    pub fn add(&mut self, node: Box<dyn Node>) -> NodeIndex {
        self.graph.add_node(node)
    }

    /// Wire `from_socket` of one node into `to_socket` of another.
    pub fn connect(
        &mut self,
        from: NodeIndex,
        from_socket: &str,
        to: NodeIndex,
        to_socket: &str,
    ) {
        self.graph.add_edge(
            from,
            to,
            Edge { from_socket: from_socket.to_string(), to_socket: to_socket.to_string() },
        );
    }

    /// Supply an input from outside the graph.
    pub fn set_input(&mut self, node: NodeIndex, socket: &str, value: Payload) {
        self.external.insert((node, socket.to_string()), value);
    }

    pub fn node(&self, idx: NodeIndex) -> &dyn Node {
        self.graph[idx].as_ref()
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn node_indices(&self) -> Vec<NodeIndex> {
        self.graph.node_indices().collect()
    }

    pub(crate) fn predecessors(&self, idx: NodeIndex) -> Vec<NodeIndex> {
        self.graph.neighbors_directed(idx, Direction::Incoming).collect()
    }

    pub(crate) fn successors(&self, idx: NodeIndex) -> Vec<NodeIndex> {
        self.graph.neighbors_directed(idx, Direction::Outgoing).collect()
    }

    /// Dependency-respecting node order; a cycle is a configuration error.
    pub fn sorted(&self) -> Result<Vec<NodeIndex>> {
        toposort(&self.graph, None).map_err(|c| {
            PipelineError::config(format!(
                "workflow `{}` has a cycle through `{}`",
                self.name,
                self.graph[c.node_id()].name()
            ))
        })
    }

    /// Assemble the input sockets of a node from external values and the
    /// outputs of its predecessors.
    pub(crate) fn gather_inputs(
        &self,
        idx: NodeIndex,
        produced: &BTreeMap<NodeIndex, Sockets>,
    ) -> Result<Sockets> {
        let mut inputs = Sockets::new();
        for ((n, socket), value) in &self.external {
            if *n == idx {
                inputs.insert(socket.clone(), value.clone());
            }
        }
        for edge_ref in self.graph.edges_directed(idx, Direction::Incoming) {
            use petgraph::visit::EdgeRef;
            let edge = edge_ref.weight();
            let src_outputs = produced.get(&edge_ref.source()).ok_or_else(|| {
                PipelineError::missing_cache(format!(
                    "`{}` ran before its upstream `{}`",
                    self.graph[idx].name(),
                    self.graph[edge_ref.source()].name()
                ))
            })?;
            let value = src_outputs.get(&edge.from_socket).ok_or_else(|| {
                PipelineError::missing_cache(format!(
                    "`{}` produced no `{}` socket",
                    self.graph[edge_ref.source()].name(),
                    edge.from_socket
                ))
            })?;
            inputs.insert(edge.to_socket.clone(), value.clone());
        }
        Ok(inputs)
    }
}
