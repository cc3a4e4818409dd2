//! Cycle detection over structural dependency edges.
//!
//! The dependency graph is a typed digraph stored as adjacency sets. Only
//! `blocks` and `parent-child` edges are structural; `related`-style links
//! are excluded from cycle checks entirely.

use std::collections::{BTreeMap, BTreeSet};

use super::types::{DepType, Issue, IssueId};

/// Adjacency map of structural edges: issue → set of issues it depends on.
pub type StructuralGraph = BTreeMap<IssueId, BTreeSet<IssueId>>;

/// Build the structural adjacency map from a set of issues.
///
/// External targets and non-structural edge types are skipped. Tombstones
/// contribute no edges.
#[must_use]
pub fn structural_graph<'a, I>(issues: I) -> StructuralGraph
where
    I: IntoIterator<Item = &'a Issue>,
{
    let mut graph = StructuralGraph::new();
    for issue in issues {
        if issue.is_tombstone() {
            continue;
        }
        let targets: BTreeSet<IssueId> = issue
            .dependencies
            .iter()
            .filter(|e| e.dep_type.is_structural())
            .filter_map(|e| e.target.local().cloned())
            .collect();
        if !targets.is_empty() {
            graph.insert(issue.id.clone(), targets);
        }
    }
    graph
}

/// Whether adding the structural edge `from → to` would introduce a cycle.
///
/// A cycle exists iff `from` is already reachable from `to`. The self-edge
/// case falls out of the same check.
#[must_use]
pub fn would_cycle(graph: &StructuralGraph, from: &IssueId, to: &IssueId) -> bool {
    if from == to {
        return true;
    }
    let mut seen = BTreeSet::new();
    let mut stack = vec![to.clone()];
    while let Some(node) = stack.pop() {
        if node == *from {
            return true;
        }
        if !seen.insert(node.clone()) {
            continue;
        }
        if let Some(next) = graph.get(&node) {
            stack.extend(next.iter().cloned());
        }
    }
    false
}

/// Find one structural cycle in the graph, as an id path, or `None`.
///
/// Used by the doctor check and by the post-merge repair pass. The returned
/// path starts and ends at the same id.
#[must_use]
pub fn find_cycle(graph: &StructuralGraph) -> Option<Vec<IssueId>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        InProgress,
        Done,
    }

    fn visit(
        graph: &StructuralGraph,
        node: &IssueId,
        marks: &mut BTreeMap<IssueId, Mark>,
        path: &mut Vec<IssueId>,
    ) -> Option<Vec<IssueId>> {
        match marks.get(node) {
            Some(Mark::Done) => return None,
            Some(Mark::InProgress) => {
                // Found the back edge: slice the path from the first
                // occurrence of `node` and close the loop.
                let start = path.iter().position(|p| p == node)?;
                let mut cycle: Vec<IssueId> = path[start..].to_vec();
                cycle.push(node.clone());
                return Some(cycle);
            }
            None => {}
        }
        marks.insert(node.clone(), Mark::InProgress);
        path.push(node.clone());
        if let Some(next) = graph.get(node) {
            for n in next {
                if let Some(cycle) = visit(graph, n, marks, path) {
                    return Some(cycle);
                }
            }
        }
        path.pop();
        marks.insert(node.clone(), Mark::Done);
        None
    }

    let mut marks = BTreeMap::new();
    let mut path = Vec::new();
    for node in graph.keys() {
        if let Some(cycle) = visit(graph, node, &mut marks, &mut path) {
            return Some(cycle);
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> IssueId {
        IssueId::new(s).unwrap()
    }

    fn graph(edges: &[(&str, &str)]) -> StructuralGraph {
        let mut g = StructuralGraph::new();
        for (from, to) in edges {
            g.entry(id(from)).or_default().insert(id(to));
        }
        g
    }

    #[test]
    fn empty_graph_has_no_cycle() {
        assert!(find_cycle(&StructuralGraph::new()).is_none());
    }

    #[test]
    fn chain_is_acyclic() {
        let g = graph(&[("bd-aa1", "bd-bb2"), ("bd-bb2", "bd-cc3")]);
        assert!(find_cycle(&g).is_none());
        assert!(!would_cycle(&g, &id("bd-aa1"), &id("bd-cc3")));
    }

    #[test]
    fn closing_a_chain_is_a_cycle() {
        let g = graph(&[("bd-aa1", "bd-bb2"), ("bd-bb2", "bd-cc3")]);
        assert!(would_cycle(&g, &id("bd-cc3"), &id("bd-aa1")));
    }

    #[test]
    fn self_edge_is_a_cycle() {
        let g = StructuralGraph::new();
        assert!(would_cycle(&g, &id("bd-aa1"), &id("bd-aa1")));
    }

    #[test]
    fn find_cycle_returns_closed_path() {
        let g = graph(&[
            ("bd-aa1", "bd-bb2"),
            ("bd-bb2", "bd-cc3"),
            ("bd-cc3", "bd-aa1"),
        ]);
        let cycle = find_cycle(&g).expect("cycle should be found");
        assert!(cycle.len() >= 4);
        assert_eq!(cycle.first(), cycle.last());
    }

    #[test]
    fn structural_graph_skips_external_and_soft_edges() {
        use crate::model::types::{DepEdge, DepTarget};
        use chrono::Utc;

        let mut a = Issue::new(id("bd-aa1"), "a", Utc::now());
        a.dependencies.insert(DepEdge::local(id("bd-bb2"), DepType::Blocks));
        a.dependencies.insert(DepEdge::local(id("bd-cc3"), DepType::Related));
        a.dependencies.insert(DepEdge {
            target: DepTarget::External {
                project: "other".to_owned(),
                id: "x-1".to_owned(),
            },
            dep_type: DepType::Blocks,
        });

        let g = structural_graph([&a]);
        let targets = g.get(&id("bd-aa1")).expect("edge set");
        assert_eq!(targets.len(), 1);
        assert!(targets.contains(&id("bd-bb2")));
    }

    #[test]
    fn tombstones_contribute_no_edges() {
        use crate::model::types::DepEdge;
        use chrono::Utc;
        let mut t = Issue::tombstone(id("bd-aa1"), Utc::now(), None);
        t.dependencies
            .insert(DepEdge::local(id("bd-bb2"), DepType::Blocks));
        assert!(structural_graph([&t]).is_empty());
    }

    #[test]
    fn diamond_is_acyclic() {
        let g = graph(&[
            ("bd-aa1", "bd-bb2"),
            ("bd-aa1", "bd-cc3"),
            ("bd-bb2", "bd-dd4"),
            ("bd-cc3", "bd-dd4"),
        ]);
        assert!(find_cycle(&g).is_none());
    }
}
