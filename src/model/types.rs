//! Core issue-tracker types.
//!
//! Foundation types used throughout beads: issue identifiers, dependency
//! edges, status/type registries, and the [`Issue`] record itself.
//!
//! Statuses and issue types are tagged strings validated against a
//! per-workspace registry, not closed enums. Projects add custom states
//! without code changes, and import/export preserves them.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// ValidationError
// ---------------------------------------------------------------------------

/// A value failed validation against its expected format.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidationError {
    /// The value that was rejected.
    pub value: String,
    /// Why the value is invalid.
    pub reason: String,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid value {:?}: {}", self.value, self.reason)
    }
}

impl std::error::Error for ValidationError {}

// ---------------------------------------------------------------------------
// IssueId
// ---------------------------------------------------------------------------

/// A validated issue identifier: `<prefix>-<suffix>`.
///
/// The suffix is either a content-derived hash (lowercase hex, at least 5
/// characters, never all digits) or a hierarchical child form
/// `<parent-suffix>.<n>` where `n` is a positive child index. Legacy numeric
/// suffixes are accepted on read so old journals import cleanly.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IssueId(String);

impl IssueId {
    /// Create a new `IssueId` from a string, validating format.
    ///
    /// # Errors
    /// Returns an error if the string is not `<prefix>-<suffix>` with a
    /// non-empty alphanumeric prefix and a hash, numeric, or child suffix.
    pub fn new(s: &str) -> Result<Self, ValidationError> {
        Self::validate(s)?;
        Ok(Self(s.to_owned()))
    }

    /// Return the full id string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The project prefix (everything before the last `-`).
    #[must_use]
    pub fn prefix(&self) -> &str {
        // Validation guarantees the separator exists.
        let idx = self.0.rfind('-').unwrap_or(0);
        &self.0[..idx]
    }

    /// The suffix (everything after the last `-`).
    #[must_use]
    pub fn suffix(&self) -> &str {
        let idx = self.0.rfind('-').map_or(0, |i| i + 1);
        &self.0[idx..]
    }

    /// Whether this is a hierarchical child id (`bd-a1b2c3d4.2`).
    #[must_use]
    pub fn is_child(&self) -> bool {
        self.suffix().contains('.')
    }

    /// The parent id of a child id, or `None` for top-level ids.
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        let suffix = self.suffix();
        let dot = suffix.rfind('.')?;
        Some(Self(format!("{}-{}", self.prefix(), &suffix[..dot])))
    }

    /// Build the k-th child id under this id.
    #[must_use]
    pub fn child(&self, k: u32) -> Self {
        Self(format!("{}.{k}", self.0))
    }

    fn validate(s: &str) -> Result<(), ValidationError> {
        let err = |reason: &str| ValidationError {
            value: s.to_owned(),
            reason: reason.to_owned(),
        };
        let Some(idx) = s.rfind('-') else {
            return Err(err("expected <prefix>-<suffix>"));
        };
        let (prefix, suffix) = (&s[..idx], &s[idx + 1..]);
        if prefix.is_empty() || !prefix.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(err("prefix must be non-empty alphanumeric"));
        }
        if suffix.is_empty() {
            return Err(err("suffix must be non-empty"));
        }
        // Child suffixes: <base>.<n>[.<n>...] with positive numeric indexes.
        let mut parts = suffix.split('.');
        let base = parts.next().unwrap_or_default();
        if base.is_empty() || !base.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()) {
            return Err(err(
                "suffix must be lowercase base-36 (hash) or numeric (legacy)",
            ));
        }
        for part in parts {
            if part.is_empty() || !part.chars().all(|c| c.is_ascii_digit()) || part == "0" {
                return Err(err("child index must be a positive integer"));
            }
        }
        Ok(())
    }
}

impl fmt::Display for IssueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for IssueId {
    type Err = ValidationError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for IssueId {
    type Error = ValidationError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::validate(&s)?;
        Ok(Self(s))
    }
}

impl From<IssueId> for String {
    fn from(id: IssueId) -> Self {
        id.0
    }
}

// ---------------------------------------------------------------------------
// DepType
// ---------------------------------------------------------------------------

/// The type of a dependency edge between two issues.
///
/// Only `Blocks` and `ParentChild` edges participate in cycle detection and
/// in the closed-while-blocked check; the rest are informational links.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DepType {
    Blocks,
    Related,
    ParentChild,
    DiscoveredFrom,
    WaitsFor,
    Supersedes,
    Duplicates,
    RelatesTo,
    RepliesTo,
}

impl DepType {
    /// Whether this edge type participates in cycle detection.
    #[must_use]
    pub const fn is_structural(self) -> bool {
        matches!(self, Self::Blocks | Self::ParentChild)
    }

    /// The canonical kebab-case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Blocks => "blocks",
            Self::Related => "related",
            Self::ParentChild => "parent-child",
            Self::DiscoveredFrom => "discovered-from",
            Self::WaitsFor => "waits-for",
            Self::Supersedes => "supersedes",
            Self::Duplicates => "duplicates",
            Self::RelatesTo => "relates-to",
            Self::RepliesTo => "replies-to",
        }
    }
}

impl fmt::Display for DepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DepType {
    type Err = ValidationError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "blocks" => Ok(Self::Blocks),
            "related" => Ok(Self::Related),
            "parent-child" => Ok(Self::ParentChild),
            "discovered-from" => Ok(Self::DiscoveredFrom),
            "waits-for" => Ok(Self::WaitsFor),
            "supersedes" => Ok(Self::Supersedes),
            "duplicates" => Ok(Self::Duplicates),
            "relates-to" => Ok(Self::RelatesTo),
            "replies-to" => Ok(Self::RepliesTo),
            _ => Err(ValidationError {
                value: s.to_owned(),
                reason: "unknown dependency type".to_owned(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// DepTarget
// ---------------------------------------------------------------------------

/// The target of a dependency edge: a local issue or an external reference
/// with explicit `external:<project>:<id>` syntax.
///
/// External targets are exempt from existence checks; the import engine
/// downgrades unresolvable local edges to external ones rather than failing.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DepTarget {
    /// An issue in this workspace.
    Local(IssueId),
    /// An issue owned by another project.
    External {
        /// The owning project's name.
        project: String,
        /// The id within that project.
        id: String,
    },
}

impl DepTarget {
    /// Parse a target string: `external:<project>:<id>` or a local id.
    ///
    /// # Errors
    /// Returns an error when the string is neither form.
    pub fn parse(s: &str) -> Result<Self, ValidationError> {
        if let Some(rest) = s.strip_prefix("external:") {
            let Some((project, id)) = rest.split_once(':') else {
                return Err(ValidationError {
                    value: s.to_owned(),
                    reason: "expected external:<project>:<id>".to_owned(),
                });
            };
            if project.is_empty() || id.is_empty() {
                return Err(ValidationError {
                    value: s.to_owned(),
                    reason: "external project and id must be non-empty".to_owned(),
                });
            }
            return Ok(Self::External {
                project: project.to_owned(),
                id: id.to_owned(),
            });
        }
        Ok(Self::Local(IssueId::new(s)?))
    }

    /// The local issue id, when this is a local target.
    #[must_use]
    pub const fn local(&self) -> Option<&IssueId> {
        match self {
            Self::Local(id) => Some(id),
            Self::External { .. } => None,
        }
    }
}

impl fmt::Display for DepTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(id) => fmt::Display::fmt(id, f),
            Self::External { project, id } => write!(f, "external:{project}:{id}"),
        }
    }
}

impl TryFrom<String> for DepTarget {
    type Error = ValidationError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<DepTarget> for String {
    fn from(t: DepTarget) -> Self {
        t.to_string()
    }
}

// ---------------------------------------------------------------------------
// DepEdge
// ---------------------------------------------------------------------------

/// A typed, directed dependency edge from the owning issue to `target`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DepEdge {
    /// The issue this edge points at.
    #[serde(rename = "id")]
    pub target: DepTarget,
    /// The edge type.
    #[serde(rename = "type")]
    pub dep_type: DepType,
}

impl DepEdge {
    /// Construct an edge to a local issue.
    #[must_use]
    pub const fn local(target: IssueId, dep_type: DepType) -> Self {
        Self {
            target: DepTarget::Local(target),
            dep_type,
        }
    }
}

// ---------------------------------------------------------------------------
// Status / IssueType registries
// ---------------------------------------------------------------------------

/// Built-in statuses, always valid in every workspace.
pub const BUILTIN_STATUSES: &[&str] = &["open", "in_progress", "blocked", "deferred", "closed"];

/// Built-in issue types, always valid in every workspace.
pub const BUILTIN_TYPES: &[&str] = &["task", "bug", "feature", "epic", "chore"];

/// Per-workspace registry of valid statuses and issue types.
///
/// Custom entries come from store config (`status.custom`, `type.custom`).
/// The engine accepts them without code changes and preserves them on
/// import/export.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StateRegistry {
    custom_statuses: BTreeSet<String>,
    custom_types: BTreeSet<String>,
}

impl StateRegistry {
    /// Build a registry from the comma-separated custom lists in config.
    #[must_use]
    pub fn new(custom_statuses: &str, custom_types: &str) -> Self {
        let split = |s: &str| {
            s.split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_owned)
                .collect::<BTreeSet<_>>()
        };
        Self {
            custom_statuses: split(custom_statuses),
            custom_types: split(custom_types),
        }
    }

    /// Whether `status` is valid in this workspace.
    #[must_use]
    pub fn valid_status(&self, status: &str) -> bool {
        BUILTIN_STATUSES.contains(&status) || self.custom_statuses.contains(status)
    }

    /// Whether `issue_type` is valid in this workspace.
    #[must_use]
    pub fn valid_type(&self, issue_type: &str) -> bool {
        BUILTIN_TYPES.contains(&issue_type) || self.custom_types.contains(issue_type)
    }
}

// ---------------------------------------------------------------------------
// Issue
// ---------------------------------------------------------------------------

/// One tracked item, live or tombstoned.
///
/// A tombstone carries only `id`, `deleted_at`, and optionally
/// `delete_reason`; the journal codec emits the minimal shape. Unknown JSON
/// keys round-trip through `extra` so newer journals survive older binaries.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub id: IssueId,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub title: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    /// Design notes.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub design: String,

    /// Free-form user notes.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub notes: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub acceptance_criteria: String,

    #[serde(default = "default_status")]
    pub status: String,

    /// 0 is most urgent. Serialized even when zero, because a dropped `priority: 0`
    /// would silently become the default on re-import.
    #[serde(default = "default_priority")]
    pub priority: u8,

    #[serde(default = "default_type")]
    pub issue_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_ref: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub labels: BTreeSet<String>,

    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub dependencies: BTreeSet<DepEdge>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub comments: Vec<Comment>,

    /// Owning project in a multi-project workspace; inherited from the
    /// discovered-from parent at creation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_repo: Option<String>,

    /// Defaults to the Unix epoch on omission; tombstone lines omit both
    /// timestamps and the decoder fills them from `deleted_at`.
    #[serde(default = "epoch_ts")]
    pub created_at: DateTime<Utc>,

    #[serde(default = "epoch_ts")]
    pub updated_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub close_reason: Option<String>,

    /// Ephemeral records live only in the store and are never journaled.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub ephemeral: bool,

    /// Set on tombstones.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete_reason: Option<String>,

    /// Unknown keys, preserved for forward compatibility.
    #[serde(flatten, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, serde_json::Value>,
}

fn default_status() -> String {
    "open".to_owned()
}

const fn default_priority() -> u8 {
    2
}

fn default_type() -> String {
    "task".to_owned()
}

const fn epoch_ts() -> DateTime<Utc> {
    DateTime::UNIX_EPOCH
}

impl Issue {
    /// A fresh open issue with defaults for everything but the basics.
    #[must_use]
    pub fn new(id: IssueId, title: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id,
            title: title.into(),
            description: String::new(),
            design: String::new(),
            notes: String::new(),
            acceptance_criteria: String::new(),
            status: default_status(),
            priority: default_priority(),
            issue_type: default_type(),
            assignee: None,
            created_by: None,
            external_ref: None,
            labels: BTreeSet::new(),
            dependencies: BTreeSet::new(),
            comments: Vec::new(),
            source_repo: None,
            created_at: now,
            updated_at: now,
            closed_at: None,
            close_reason: None,
            ephemeral: false,
            deleted_at: None,
            delete_reason: None,
            extra: BTreeMap::new(),
        }
    }

    /// A deletion marker for `id`. Carries only the identifier, the deletion
    /// timestamp, and optionally a reason.
    #[must_use]
    pub fn tombstone(id: IssueId, deleted_at: DateTime<Utc>, reason: Option<String>) -> Self {
        let mut t = Self::new(id, "", deleted_at);
        t.status = "tombstone".to_owned();
        t.created_at = deleted_at;
        t.deleted_at = Some(deleted_at);
        t.delete_reason = reason;
        t
    }

    /// Whether this record is a deletion marker.
    #[must_use]
    pub const fn is_tombstone(&self) -> bool {
        self.deleted_at.is_some()
    }
}

// ---------------------------------------------------------------------------
// Comment
// ---------------------------------------------------------------------------

/// A per-issue comment. Comments are append-only; the merge unions them
/// keyed on the full triple, so identity never depends on insertion order.
/// `created_at` leads so derived ordering matches the store's read order.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Comment {
    pub created_at: DateTime<Utc>,
    pub author: String,
    pub text: String,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
