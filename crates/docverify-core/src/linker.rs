use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap};

use crate::{Block, Error, Result};

/// Execution order for a document's blocks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    /// Block indices in the order they run.
    pub order: Vec<usize>,
    /// Block index -> indices of the blocks it depends on.
    pub dependencies: BTreeMap<usize, Vec<usize>>,
}

impl ExecutionPlan {
    /// Document order with no dependency tracking at all.
    pub fn document_order(blocks: &[Block]) -> Self {
        Self {
            order: blocks.iter().map(|b| b.index).collect(),
            dependencies: BTreeMap::new(),
        }
    }

    pub fn dependencies_of(&self, block: usize) -> &[usize] {
        self.dependencies
            .get(&block)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn position(&self, block: usize) -> Option<usize> {
        self.order.iter().position(|&b| b == block)
    }

    pub fn is_reordered(&self) -> bool {
        self.order.windows(2).any(|w| w[0] > w[1])
    }
}

/// Builds the dependency graph between blocks and orders it topologically,
/// breaking ties by document order.
pub fn link(blocks: &[Block]) -> Result<ExecutionPlan> {
    let mut graph: DiGraph<usize, ()> = DiGraph::with_capacity(blocks.len(), blocks.len());
    let nodes: Vec<NodeIndex> = blocks.iter().map(|b| graph.add_node(b.index)).collect();

    let mut definers: HashMap<&str, Vec<usize>> = HashMap::new();
    for block in blocks {
        for object in &block.defines {
            definers.entry(object.name.as_str()).or_default().push(block.index);
        }
    }

    let mut dependencies: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for block in blocks {
        for name in &block.requires {
            let Some(candidates) = definers.get(name.as_str()) else {
                if block.explicit_requires.contains(name) {
                    tracing::warn!(
                        "Block {} (line {}) depends on `{}`, which no block defines",
                        block.index,
                        block.line,
                        name
                    );
                } else {
                    tracing::debug!("Block {} references external object `{}`", block.index, name);
                }
                continue;
            };

            let definer = candidates
                .iter()
                .rev()
                .find(|&&d| d < block.index)
                .or_else(|| candidates.iter().find(|&&d| d > block.index));

            if let Some(&definer) = definer {
                graph.update_edge(nodes[definer], nodes[block.index], ());
                let deps = dependencies.entry(block.index).or_default();
                if !deps.contains(&definer) {
                    deps.push(definer);
                }
            }
        }
    }
    for deps in dependencies.values_mut() {
        deps.sort_unstable();
    }

    let mut cyclic: Vec<usize> = tarjan_scc(&graph)
        .into_iter()
        .filter(|component| component.len() > 1)
        .flatten()
        .map(|node| graph[node])
        .collect();
    if !cyclic.is_empty() {
        cyclic.sort_unstable();
        return Err(Error::DependencyCycle { blocks: cyclic });
    }

    // Kahn's algorithm with a min-heap keeps independent blocks in document order.
    let mut in_degree: Vec<usize> = nodes
        .iter()
        .map(|&n| graph.neighbors_directed(n, Direction::Incoming).count())
        .collect();
    let mut ready: BinaryHeap<Reverse<usize>> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, d)| **d == 0)
        .map(|(i, _)| Reverse(i))
        .collect();

    let mut order = Vec::with_capacity(blocks.len());
    while let Some(Reverse(index)) = ready.pop() {
        order.push(blocks[index].index);
        for next in graph.neighbors_directed(nodes[index], Direction::Outgoing) {
            let next = graph[next];
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.push(Reverse(next));
            }
        }
    }

    let plan = ExecutionPlan { order, dependencies };
    if plan.is_reordered() {
        tracing::info!("Execution plan reorders blocks to satisfy dependencies");
    }
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blocks(statements: &[&str]) -> Vec<Block> {
        statements
            .iter()
            .enumerate()
            .map(|(i, sql)| Block::parse(i, i + 1, i, 0, sql).unwrap())
            .collect()
    }

    #[test]
    fn test_independent_blocks_keep_document_order() {
        let plan = link(&blocks(&[
            "SELECT count(*) FROM parcels;",
            "SELECT count(*) FROM precincts;",
            "SELECT 1;",
        ]))
        .unwrap();
        assert_eq!(plan.order, vec![0, 1, 2]);
        assert!(plan.dependencies.is_empty());
        assert!(!plan.is_reordered());
    }

    #[test]
    fn test_definition_moves_ahead_of_use() {
        let plan = link(&blocks(&[
            "SELECT * FROM mvw_precinct;",
            "SELECT 1;",
            "CREATE MATERIALIZED VIEW mvw_precinct AS SELECT * FROM precincts;",
        ]))
        .unwrap();
        assert_eq!(plan.order, vec![1, 2, 0]);
        assert_eq!(plan.dependencies_of(0), &[2]);
        assert!(plan.is_reordered());
    }

    #[test]
    fn test_closest_preceding_definer_wins() {
        let plan = link(&blocks(&[
            "CREATE VIEW v AS SELECT 1;",
            "CREATE OR REPLACE VIEW v AS SELECT 2;",
            "SELECT * FROM v;",
        ]))
        .unwrap();
        assert_eq!(plan.dependencies_of(2), &[1]);
        assert_eq!(plan.order, vec![0, 1, 2]);
    }

    #[test]
    fn test_function_call_creates_dependency() {
        let plan = link(&blocks(&[
            "CREATE FUNCTION nearest_place(g geometry) RETURNS int AS $$ SELECT 1 $$ LANGUAGE sql;",
            "SELECT nearest_place(geom) FROM parcels;",
        ]))
        .unwrap();
        assert_eq!(plan.dependencies_of(1), &[0]);
    }

    #[test]
    fn test_cycle_is_reported_with_all_members() {
        let err = link(&blocks(&[
            "CREATE VIEW a AS SELECT * FROM b;",
            "SELECT 1;",
            "CREATE VIEW b AS SELECT * FROM a;",
        ]))
        .unwrap_err();
        match err {
            Error::DependencyCycle { blocks } => assert_eq!(blocks, vec![0, 2]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_every_definer_precedes_its_users() {
        let blocks = blocks(&[
            "SELECT * FROM summary;",
            "CREATE VIEW summary AS SELECT * FROM base;",
            "SELECT helper();",
            "CREATE TABLE base (id int);",
            "CREATE FUNCTION helper() RETURNS int AS $$ SELECT count(*)::int FROM summary $$ LANGUAGE sql;",
        ]);
        let plan = link(&blocks).unwrap();
        for (block, deps) in &plan.dependencies {
            for dep in deps {
                assert!(
                    plan.position(*dep).unwrap() < plan.position(*block).unwrap(),
                    "block {dep} must run before block {block}"
                );
            }
        }
        assert_eq!(plan.order, vec![3, 1, 0, 4, 2]);
    }

    #[test]
    fn test_document_order_has_no_dependencies() {
        let blocks = blocks(&["SELECT * FROM v;", "CREATE VIEW v AS SELECT 1;"]);
        let plan = ExecutionPlan::document_order(&blocks);
        assert_eq!(plan.order, vec![0, 1]);
        assert!(plan.dependencies_of(0).is_empty());
    }
}
