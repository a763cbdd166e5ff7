//! Step dependency graph.
//!
//! Uses `petgraph` to model a workflow version's steps as a directed graph
//! (edge from parent to child). Building the graph validates it: unknown
//! parents, duplicate readable ids and cycles are rejected. Replay uses it to
//! compute the subtree below a set of steps.

use std::collections::{HashMap, HashSet};

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Bfs, EdgeRef};
use petgraph::Direction;
use tasklane_types::workflow::{JobKind, StepDefinition};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("step '{step}' depends on unknown step '{parent}'")]
    UnknownParent { step: String, parent: String },

    #[error("duplicate step readable id '{0}'")]
    DuplicateStep(String),

    #[error("cycle detected involving step '{0}'")]
    Cycle(String),
}

pub struct StepGraph<'a> {
    graph: DiGraph<&'a StepDefinition, ()>,
    index: HashMap<&'a str, NodeIndex>,
}

impl<'a> StepGraph<'a> {
    pub fn build(steps: &'a [StepDefinition]) -> Result<Self, GraphError> {
        let mut graph = DiGraph::<&StepDefinition, ()>::new();
        let mut index = HashMap::new();

        for step in steps {
            let node = graph.add_node(step);
            if index.insert(step.readable_id.as_str(), node).is_some() {
                return Err(GraphError::DuplicateStep(step.readable_id.clone()));
            }
        }

        for step in steps {
            let child = index[step.readable_id.as_str()];
            for parent in &step.parents {
                let from = index.get(parent.as_str()).ok_or_else(|| GraphError::UnknownParent {
                    step: step.readable_id.clone(),
                    parent: parent.clone(),
                })?;
                graph.add_edge(*from, child, ());
            }
        }

        toposort(&graph, None)
            .map_err(|cycle| GraphError::Cycle(graph[cycle.node_id()].readable_id.clone()))?;

        Ok(Self { graph, index })
    }

    pub fn step(&self, readable_id: &str) -> Option<&'a StepDefinition> {
        self.index.get(readable_id).map(|node| self.graph[*node])
    }

    pub fn parents(&self, readable_id: &str) -> Vec<&'a StepDefinition> {
        self.neighbors(readable_id, Direction::Incoming)
    }

    pub fn children(&self, readable_id: &str) -> Vec<&'a StepDefinition> {
        self.neighbors(readable_id, Direction::Outgoing)
    }

    fn neighbors(&self, readable_id: &str, direction: Direction) -> Vec<&'a StepDefinition> {
        let Some(node) = self.index.get(readable_id) else {
            return Vec::new();
        };
        let mut out: Vec<&StepDefinition> = self
            .graph
            .edges_directed(*node, direction)
            .map(|edge| match direction {
                Direction::Incoming => self.graph[edge.source()],
                Direction::Outgoing => self.graph[edge.target()],
            })
            .collect();
        out.sort_by(|a, b| a.readable_id.cmp(&b.readable_id));
        out
    }

    /// The given steps plus everything downstream of them. Unknown ids are
    /// ignored.
    pub fn descendants(&self, readable_ids: &[&str]) -> HashSet<&'a str> {
        let mut found = HashSet::new();
        for id in readable_ids {
            let Some(start) = self.index.get(id) else {
                continue;
            };
            let mut bfs = Bfs::new(&self.graph, *start);
            while let Some(node) = bfs.next(&self.graph) {
                found.insert(self.graph[node].readable_id.as_str());
            }
        }
        found
    }

    /// Members of `subtree` with no parent inside it, excluding on-failure
    /// steps. Sorted by readable id.
    pub fn subtree_roots(&self, subtree: &HashSet<&str>) -> Vec<&'a StepDefinition> {
        let mut roots: Vec<&StepDefinition> = subtree
            .iter()
            .filter_map(|id| self.step(id))
            .filter(|step| step.job_kind != JobKind::OnFailure)
            .filter(|step| {
                !self
                    .parents(&step.readable_id)
                    .iter()
                    .any(|p| subtree.contains(p.readable_id.as_str()))
            })
            .collect();
        roots.sort_by(|a, b| a.readable_id.cmp(&b.readable_id));
        roots
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }
}
