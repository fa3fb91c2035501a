//! Dependency resolver (C4).
//!
//! A direct port of `original_source/dataflow/deps.py`'s iterative
//! Kahn-style algorithm, including its exact cycle-error wording
//! ("Cyclic dependencies amongst ...").

use std::collections::HashSet;

use crate::error::{EngineError, EngineResult};

/// Topologically orders `0..n` given `(from, to)` edges: for every pair,
/// `from` precedes `to` in the result. Nodes with no edges at all appear
/// after every connected node, in unspecified (ascending) order.
pub fn processing_order(n: usize, pairs: &[(usize, usize)]) -> EngineResult<Vec<usize>> {
    let mut order = dependencies(pairs)?;

    let referenced: HashSet<usize> = order.iter().copied().collect();
    let mut unreferenced: Vec<usize> = (0..n).filter(|i| !referenced.contains(i)).collect();
    unreferenced.sort_unstable();
    order.extend(unreferenced);

    Ok(order)
}

/// The core of `_dependencies` from `deps.py`: resolves only the nodes
/// that appear in `pairs`, leaving nodes with no edges to the caller.
fn dependencies(pairs: &[(usize, usize)]) -> EngineResult<Vec<usize>> {
    let mut remaining: Vec<(usize, usize)> = pairs.to_vec();
    let mut order: Vec<usize> = Vec::new();

    while !remaining.is_empty() {
        let left: HashSet<usize> = remaining.iter().map(|(a, _)| *a).collect();
        let right: HashSet<usize> = remaining.iter().map(|(_, b)| *b).collect();

        let independent: HashSet<usize> = right.difference(&left).copied().collect();
        if independent.is_empty() {
            let mut cycle_nodes: Vec<usize> = left.into_iter().collect();
            cycle_nodes.sort_unstable();
            return Err(EngineError::Cycle { nodes: cycle_nodes });
        }

        let dependent: HashSet<usize> = remaining
            .iter()
            .filter(|(_, b)| independent.contains(b))
            .map(|(a, _)| *a)
            .collect();

        remaining.retain(|(_, b)| !independent.contains(b));

        let new_left: HashSet<usize> = remaining.iter().map(|(a, _)| *a).collect();
        let mut resolved: Vec<usize> = dependent.difference(&new_left).copied().collect();
        resolved.sort_unstable();
        order.extend(resolved);
    }

    order.reverse();
    Ok(order)
}

/// Walks backward from `target` over `wires` (as `(from, to)` pairs),
/// collecting every node that can reach it, then orders only that subset.
/// This is the scoped variant, rooted at a single target node.
pub fn scoped_order(n: usize, pairs: &[(usize, usize)], target: usize) -> EngineResult<Vec<usize>> {
    let mut required: HashSet<usize> = HashSet::new();
    required.insert(target);

    let mut frontier = vec![target];
    while let Some(node) = frontier.pop() {
        for (from, to) in pairs {
            if *to == node && required.insert(*from) {
                frontier.push(*from);
            }
        }
    }

    let scoped_pairs: Vec<(usize, usize)> = pairs
        .iter()
        .copied()
        .filter(|(a, b)| required.contains(a) && required.contains(b))
        .collect();

    let order = processing_order(n, &scoped_pairs)?;
    Ok(order.into_iter().filter(|node| required.contains(node)).collect())
}
