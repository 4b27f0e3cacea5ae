//! Node graph ordering and connection mappings
//!
//! Two orders are available:
//!
//! - [`GraphOrder::PostOrder`] (default): depth-first from every start node
//!   (no incoming edge, or the first node if there is none), recording a
//!   node only after everything it points to. Downstream nodes therefore run
//!   first. Existing workflows were authored against this order.
//! - [`GraphOrder::Topological`]: Kahn's algorithm, upstream first, ties
//!   broken by declaration order.
//!
//! Either way, nodes left over (cycles, unreachable islands) are appended in
//! declaration order.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::executor::Executor;
use super::run::WorkflowRun;
use crate::processor::DataProcessor;
use crate::workflow::WorkflowDefinition;

/// Node ordering strategy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GraphOrder {
    /// Downstream before upstream
    #[default]
    PostOrder,
    /// Upstream before downstream
    Topological,
}

/// Executes node/connection workflows
#[derive(Debug, Clone, Copy, Default)]
pub struct GraphExecutor {
    order: GraphOrder,
}

impl GraphExecutor {
    /// Executor using `order`
    pub fn new(order: GraphOrder) -> Self {
        Self { order }
    }
}

impl Executor for GraphExecutor {
    fn plan(&self, definition: &WorkflowDefinition) -> Vec<usize> {
        let adjacency = adjacency(definition);
        match self.order {
            GraphOrder::PostOrder => post_order(&adjacency),
            GraphOrder::Topological => topological(&adjacency),
        }
    }

    /// Map the result across every outgoing connection into
    /// `context["<target>_input"]`.
    fn propagate(
        &self,
        definition: &WorkflowDefinition,
        unit_id: &str,
        result: &Value,
        run: &mut WorkflowRun,
        processor: &DataProcessor,
    ) {
        for connection in definition
            .connections()
            .iter()
            .filter(|c| c.source_node_id == unit_id)
        {
            let mapped = processor.apply_field_mapping(result, &connection.mapping);
            run.context_insert(format!("{}_input", connection.target_node_id), mapped);
        }
    }
}

/// Outgoing edges per node index, in connection order. Edges touching
/// unknown nodes are dropped.
fn adjacency(definition: &WorkflowDefinition) -> Vec<Vec<usize>> {
    let index: HashMap<&str, usize> = definition
        .units()
        .iter()
        .enumerate()
        .rev()
        .map(|(i, unit)| (unit.id.as_str(), i))
        .collect();

    let mut edges = vec![Vec::new(); definition.units().len()];
    for connection in definition.connections() {
        if let (Some(&from), Some(&to)) = (
            index.get(connection.source_node_id.as_str()),
            index.get(connection.target_node_id.as_str()),
        ) {
            edges[from].push(to);
        }
    }
    edges
}

fn has_incoming(adjacency: &[Vec<usize>]) -> Vec<bool> {
    let mut incoming = vec![false; adjacency.len()];
    for targets in adjacency {
        for &t in targets {
            incoming[t] = true;
        }
    }
    incoming
}

fn post_order(adjacency: &[Vec<usize>]) -> Vec<usize> {
    let n = adjacency.len();
    if n == 0 {
        return Vec::new();
    }

    let incoming = has_incoming(adjacency);
    let mut starts: Vec<usize> = (0..n).filter(|&i| !incoming[i]).collect();
    if starts.is_empty() {
        starts.push(0);
    }

    let mut visited = vec![false; n];
    let mut order = Vec::with_capacity(n);
    let mut stack: Vec<(usize, usize)> = Vec::new();

    for start in starts {
        if visited[start] {
            continue;
        }
        visited[start] = true;
        stack.push((start, 0));

        while let Some(&(node, edge)) = stack.last() {
            match adjacency[node].get(edge) {
                Some(&next) => {
                    if let Some(top) = stack.last_mut() {
                        top.1 += 1;
                    }
                    if !visited[next] {
                        visited[next] = true;
                        stack.push((next, 0));
                    }
                }
                None => {
                    stack.pop();
                    order.push(node);
                }
            }
        }
    }

    order.extend((0..n).filter(|&i| !visited[i]));
    order
}

fn topological(adjacency: &[Vec<usize>]) -> Vec<usize> {
    let n = adjacency.len();
    let mut in_degree = vec![0usize; n];
    for targets in adjacency {
        for &t in targets {
            in_degree[t] += 1;
        }
    }

    let mut ready: BTreeSet<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
    let mut placed = vec![false; n];
    let mut order = Vec::with_capacity(n);

    while let Some(node) = ready.pop_first() {
        placed[node] = true;
        order.push(node);
        for &t in &adjacency[node] {
            in_degree[t] -= 1;
            if in_degree[t] == 0 {
                ready.insert(t);
            }
        }
    }

    order.extend((0..n).filter(|&i| !placed[i]));
    order
}
