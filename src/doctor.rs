//! Integrity checks.
//!
//! `bd doctor` verifies the workspace without mutating it: id formats,
//! structural-cycle freedom, close bookkeeping, ephemeral containment, and
//! watermark agreement between store and journal. Each finding is a
//! human-readable line; an empty report means healthy.

use crate::error::Result;
use crate::journal::{self, codec, watermark};
use crate::model::graph;
use crate::store::Store;
use crate::workspace::Workspace;

/// Findings from an integrity check. Empty means healthy.
#[derive(Clone, Debug, Default)]
pub struct DoctorReport {
    pub problems: Vec<String>,
}

impl DoctorReport {
    #[must_use]
    pub fn healthy(&self) -> bool {
        self.problems.is_empty()
    }
}

/// Check the store and journal for invariant violations.
///
/// # Errors
/// Store or journal read errors; findings themselves are never errors.
pub fn check(store: &Store, ws: &Workspace) -> Result<DoctorReport> {
    let mut report = DoctorReport::default();
    let all = store.all_issues()?;
    let registry = store.registry()?;

    for issue in &all {
        if issue.is_tombstone() {
            continue;
        }
        if !registry.valid_status(&issue.status) {
            report.problems.push(format!(
                "{}: status '{}' is not registered for this workspace",
                issue.id, issue.status
            ));
        }
        if !registry.valid_type(&issue.issue_type) {
            report.problems.push(format!(
                "{}: type '{}' is not registered for this workspace",
                issue.id, issue.issue_type
            ));
        }
        match (issue.status.as_str(), issue.closed_at) {
            ("closed", None) => report
                .problems
                .push(format!("{}: closed without a closed_at timestamp", issue.id)),
            (status, Some(_)) if status != "closed" => report
                .problems
                .push(format!("{}: carries closed_at while status is '{status}'", issue.id)),
            _ => {}
        }
        if issue.priority > 4 {
            report
                .problems
                .push(format!("{}: priority {} out of range", issue.id, issue.priority));
        }
    }

    let structural = graph::structural_graph(all.iter());
    if let Some(cycle) = graph::find_cycle(&structural) {
        let path: Vec<&str> = cycle.iter().map(crate::model::IssueId::as_str).collect();
        report
            .problems
            .push(format!("dependency cycle: {}", path.join(" -> ")));
    }

    let journal_path = journal::read_path(&ws.dir);
    if journal_path.exists() {
        let bytes = std::fs::read(&journal_path)?;
        let (records, skipped) = codec::decode(&bytes);
        for s in &skipped {
            report.problems.push(format!(
                "journal line {}: unparseable ({})",
                s.line, s.detail
            ));
        }
        for record in &records {
            if record.ephemeral {
                report.problems.push(format!(
                    "{}: ephemeral record found in the journal",
                    record.id
                ));
            }
        }
        if watermark::has_changed(store, &journal_path)? {
            report.problems.push(
                "journal differs from the store's recorded hash; run `bd import` or `bd flush`"
                    .to_owned(),
            );
        }
    }

    Ok(report)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
