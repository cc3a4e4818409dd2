//! Deterministic three-way merge over record sets. Pure logic, no I/O.
//!
//! Reconciles (base, local, remote) per identifier:
//!
//! - a side that didn't change a record loses to the side that did
//! - when both changed, the record with the later `updated_at` wins all
//!   scalars wholesale (record-level last-writer-wins; equal clocks break
//!   toward the remote)
//! - set-typed fields (labels, dependencies) merge element-wise against
//!   the base, and deletions always win over concurrent additions
//! - comments are append-only and merge by union
//! - a tombstone never resurrects: it propagates whenever the opposing
//!   live record is not strictly newer than the deletion
//! - a post-merge cycle check repairs any blocks/parent-child loop by
//!   dropping a newly-added edge, preferring to keep edges the base
//!   already had
//!
//! Record-level LWW is deliberate: concurrent edits to different scalar
//! fields of the same record do not combine; the later edit's record wins
//! whole. Sets still merge element-wise.

use std::collections::{BTreeMap, BTreeSet};

use crate::model::{Issue, IssueId, graph};

/// A record set keyed by id: the decoded, collapsed view of a journal.
pub type RecordSet = BTreeMap<IssueId, Issue>;

/// The merge result plus diagnostics about repairs.
#[derive(Clone, Debug, Default)]
pub struct MergeOutcome {
    pub merged: RecordSet,
    /// Human-readable notes about cycle repairs.
    pub diagnostics: Vec<String>,
}

/// Merge (base, local, remote) into one record set.
#[must_use]
pub fn merge(base: &RecordSet, local: &RecordSet, remote: &RecordSet) -> MergeOutcome {
    let mut out = MergeOutcome::default();

    let mut ids: BTreeSet<&IssueId> = BTreeSet::new();
    ids.extend(base.keys());
    ids.extend(local.keys());
    ids.extend(remote.keys());

    for id in ids {
        let b = base.get(id);
        let l = local.get(id);
        let r = remote.get(id);
        if let Some(winner) = merge_one(b, l, r) {
            out.merged.insert(id.clone(), winner);
        }
    }

    repair_cycles(&mut out, base);
    out
}

fn merge_one(b: Option<&Issue>, l: Option<&Issue>, r: Option<&Issue>) -> Option<Issue> {
    match (l, r) {
        // Gone from both sides: stays absent (garbage collected).
        (None, None) => None,
        // Present on exactly one side. With no base the record is new on
        // that side; with a base, the other side dropped it without a
        // tombstone; only a compaction does that, so keep the record.
        (Some(only), None) | (None, Some(only)) => Some(only.clone()),
        (Some(l), Some(r)) => Some(merge_both(b, l, r)),
    }
}

fn merge_both(b: Option<&Issue>, l: &Issue, r: &Issue) -> Issue {
    if l == r {
        return l.clone();
    }

    // Tombstones propagate unless the opposing live record is strictly
    // newer than the deletion.
    match (l.is_tombstone(), r.is_tombstone()) {
        (true, true) => {
            let l_at = l.deleted_at.unwrap_or(l.updated_at);
            let r_at = r.deleted_at.unwrap_or(r.updated_at);
            return if r_at >= l_at { r.clone() } else { l.clone() };
        }
        (true, false) => {
            let deleted_at = l.deleted_at.unwrap_or(l.updated_at);
            return if r.updated_at > deleted_at {
                r.clone()
            } else {
                l.clone()
            };
        }
        (false, true) => {
            let deleted_at = r.deleted_at.unwrap_or(r.updated_at);
            return if l.updated_at > deleted_at {
                l.clone()
            } else {
                r.clone()
            };
        }
        (false, false) => {}
    }

    // One side unchanged since base: the other side's edit stands.
    if let Some(b) = b {
        if r == b {
            return l.clone();
        }
        if l == b {
            return r.clone();
        }
    }

    // Both changed. Record-level LWW for scalars, element-wise merge with
    // deletion dominance for sets, union for comments.
    let winner = if r.updated_at >= l.updated_at { r } else { l };
    let mut merged = winner.clone();

    let empty_labels = BTreeSet::new();
    let base_labels = b.map_or(&empty_labels, |b| &b.labels);
    merged.labels = merge_sets(base_labels, &l.labels, &r.labels);

    let empty_deps = BTreeSet::new();
    let base_deps = b.map_or(&empty_deps, |b| &b.dependencies);
    merged.dependencies = merge_sets(base_deps, &l.dependencies, &r.dependencies);

    let mut comments: BTreeSet<_> = l.comments.iter().cloned().collect();
    comments.extend(r.comments.iter().cloned());
    merged.comments = comments.into_iter().collect();

    merged.updated_at = l.updated_at.max(r.updated_at);
    merged
}

/// Element-wise set merge: `(B ∪ ΔL ∪ ΔR) \ (ΩL ∪ ΩR)`, where Δ are
/// additions and Ω deletions relative to the base. A deletion on either
/// side beats a concurrent addition of the same element. This is what
/// keeps removed edges from coming back as zombies.
fn merge_sets<T: Ord + Clone>(
    base: &BTreeSet<T>,
    local: &BTreeSet<T>,
    remote: &BTreeSet<T>,
) -> BTreeSet<T> {
    let mut result: BTreeSet<T> = base.union(local).cloned().collect();
    result.extend(remote.iter().cloned());
    result.retain(|x| {
        let deleted_l = base.contains(x) && !local.contains(x);
        let deleted_r = base.contains(x) && !remote.contains(x);
        !(deleted_l || deleted_r)
    });
    result
}

/// Drop newly-added structural edges until the merged graph is acyclic.
/// Edges the base already had are preferred survivors; the repair is
/// recorded as a diagnostic, never silent.
fn repair_cycles(out: &mut MergeOutcome, base: &RecordSet) {
    // Bounded by the number of structural edges; each round removes one.
    loop {
        let structural = graph::structural_graph(out.merged.values());
        let Some(cycle) = graph::find_cycle(&structural) else {
            return;
        };

        match pick_cycle_victim(&cycle, base, &out.merged) {
            Some((owner, target)) => {
                remove_structural_edge(&mut out.merged, &owner, &target);
                out.diagnostics.push(format!(
                    "merge would create a dependency cycle; \
                     dropped newly-added edge {owner} -> {target}"
                ));
            }
            None => {
                // Every edge in the cycle predates the merge; the base
                // itself was cyclic. Break at the cycle's closing edge.
                let owner = cycle[cycle.len() - 2].clone();
                let target = cycle[cycle.len() - 1].clone();
                remove_structural_edge(&mut out.merged, &owner, &target);
                out.diagnostics.push(format!(
                    "dependency cycle found in base; removed edge {owner} -> {target}"
                ));
            }
        }
    }
}

type Edge = (IssueId, IssueId);

/// The first cycle edge that the base did not already have, i.e. the edge this
/// merge round introduced.
fn pick_cycle_victim(cycle: &[IssueId], base: &RecordSet, merged: &RecordSet) -> Option<Edge> {
    for pair in cycle.windows(2) {
        let (owner, target) = (&pair[0], &pair[1]);
        let in_base = base.get(owner).is_some_and(|b| {
            b.dependencies
                .iter()
                .any(|e| e.dep_type.is_structural() && e.target.local() == Some(target))
        });
        let in_merged = merged.get(owner).is_some_and(|m| {
            m.dependencies
                .iter()
                .any(|e| e.dep_type.is_structural() && e.target.local() == Some(target))
        });
        if in_merged && !in_base {
            return Some((owner.clone(), target.clone()));
        }
    }
    None
}

fn remove_structural_edge(merged: &mut RecordSet, owner: &IssueId, target: &IssueId) {
    if let Some(issue) = merged.get_mut(owner) {
        issue
            .dependencies
            .retain(|e| !(e.dep_type.is_structural() && e.target.local() == Some(target)));
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
