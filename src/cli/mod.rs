//! CLI definitions and command handlers.
//!
//! The command surface is deliberately thin: every subcommand is a direct
//! driver for one core operation (store CRUD, flush, import, sync,
//! compact, doctor, daemon). Human formatting stays minimal and
//! `--json` emits machine-readable output.

use std::collections::BTreeSet;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};

use crate::error::BeadsError;
use crate::format::OutputFormat;
use crate::git::Git;
use crate::model::{DepTarget, DepType, Issue};
use crate::session::{OpenOptions, WorkspaceSession};
use crate::store::{FieldDiff, NewIssue, SearchFilter, Store};
use crate::workspace::{self, WORKSPACE_DIR};
use crate::{compact, daemon, doctor, flush, import, journal, sync};

/// Dependency-aware issue tracker (SQLite + JSONL)
///
/// beads keeps issues in two coupled representations: a local SQLite
/// database for fast queries and a JSONL journal (.beads/issues.jsonl)
/// for version control under git. `bd sync` reconciles both with remote
/// collaborators via a pull-first three-way merge.
///
/// QUICK START:
///
///   bd init --prefix px
///   bd create "Fix login flow" -p 1
///   bd list
///   bd sync
#[derive(Parser, Debug)]
#[command(name = "bd")]
#[command(version, about)]
#[command(after_help = "See 'bd <command> --help' for more on a specific command.")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Actor name for the audit trail (default: git user.name)
    #[arg(long, global = true)]
    pub actor: Option<String>,

    /// Output as JSON
    #[arg(long, global = true)]
    pub json: bool,

    /// Skip the automatic journal freshness check on startup
    #[arg(long, global = true)]
    pub no_auto_import: bool,

    /// Skip the automatic flush of records left dirty by a previous run
    #[arg(long, global = true)]
    pub no_auto_flush: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize a beads workspace in the current repository
    Init {
        /// Issue id prefix (e.g. "px")
        #[arg(long, default_value = "bd")]
        prefix: String,

        /// Branch that receives sync commits (for protected mainlines)
        #[arg(long)]
        sync_branch: Option<String>,
    },

    /// Create a new issue
    Create(CreateArgs),

    /// List issues
    List(ListArgs),

    /// Show issue details
    Show {
        /// Issue ids (prefixes accepted)
        ids: Vec<String>,
    },

    /// Update an issue's fields
    Update(UpdateArgs),

    /// Close an issue
    Close {
        /// Issue id (prefix accepted)
        id: String,

        /// Why the issue is closed
        #[arg(long)]
        reason: Option<String>,

        /// Close even while a blocks-dependency is still open
        #[arg(long)]
        force: bool,
    },

    /// Delete an issue (tombstone; propagates to all clones)
    Delete {
        /// Issue id (prefix accepted)
        id: String,

        /// Also delete children linked by parent-child edges
        #[arg(long)]
        cascade: bool,

        /// Why the issue is deleted
        #[arg(long)]
        reason: Option<String>,
    },

    /// Manage dependencies between issues
    #[command(subcommand)]
    Dep(DepCommands),

    /// Add a comment to an issue
    Comment {
        /// Issue id (prefix accepted)
        id: String,

        /// Comment text
        text: String,
    },

    /// Write pending changes to the journal
    Flush,

    /// Apply the journal to the database
    Import,

    /// Pull, merge, commit, and push the journal
    ///
    /// Conflict policy: for scalar fields the record with the later
    /// updated_at wins whole (a slower edit to a different field of the
    /// same issue is lost); labels and dependencies merge element-wise and
    /// a deletion always beats a concurrent addition.
    Sync,

    /// Purge tombstones no live record references
    ///
    /// Safe only once every clone has synced past the deletions; beads
    /// cannot prove that locally, so compaction never runs automatically.
    Compact,

    /// Check workspace integrity without modifying anything
    Doctor,

    /// Git merge driver for the journal (wired by `bd init`)
    #[command(hide = true)]
    MergeDriver {
        /// %O - the merge base
        base: PathBuf,
        /// %A - ours; receives the result
        local: PathBuf,
        /// %B - theirs
        remote: PathBuf,
    },

    /// Run the daemon: hold the store open and serve requests on a unix
    /// socket, with debounced auto-flush
    Daemon {
        /// Socket path (default: .beads/bd.sock)
        #[arg(long)]
        socket: Option<PathBuf>,
    },
}

#[derive(Args, Debug)]
pub struct CreateArgs {
    /// Issue title
    pub title: String,

    /// Longer description
    #[arg(short, long, default_value = "")]
    pub description: String,

    /// Priority 0-4 (0 is most urgent)
    #[arg(short, long)]
    pub priority: Option<u8>,

    /// Issue type (task, bug, feature, epic, chore, or a registered custom type)
    #[arg(short = 't', long = "type")]
    pub issue_type: Option<String>,

    /// Assignee
    #[arg(short, long)]
    pub assignee: Option<String>,

    /// Labels (repeatable)
    #[arg(short, long)]
    pub label: Vec<String>,

    /// Create as a child of this issue (hierarchical id)
    #[arg(long)]
    pub parent: Option<String>,

    /// Link back to the issue this work was discovered from
    #[arg(long)]
    pub discovered_from: Option<String>,

    /// Keep the issue out of the journal (local-only)
    #[arg(long)]
    pub ephemeral: bool,
}

#[derive(Args, Debug)]
pub struct ListArgs {
    /// Filter by status
    #[arg(short, long)]
    pub status: Option<String>,

    /// Filter by priority
    #[arg(short, long)]
    pub priority: Option<u8>,

    /// Filter by assignee
    #[arg(short, long)]
    pub assignee: Option<String>,

    /// Filter by label
    #[arg(short, long)]
    pub label: Option<String>,

    /// Substring match over title and description
    #[arg(long)]
    pub text: Option<String>,

    /// Only open issues whose blockers are all closed
    #[arg(long)]
    pub ready: bool,
}

#[derive(Args, Debug)]
pub struct UpdateArgs {
    /// Issue id (prefix accepted)
    pub id: String,

    #[arg(long)]
    pub title: Option<String>,

    #[arg(short, long)]
    pub description: Option<String>,

    #[arg(long)]
    pub design: Option<String>,

    #[arg(long)]
    pub notes: Option<String>,

    #[arg(long)]
    pub acceptance: Option<String>,

    #[arg(short, long)]
    pub status: Option<String>,

    #[arg(short, long)]
    pub priority: Option<u8>,

    #[arg(short = 't', long = "type")]
    pub issue_type: Option<String>,

    /// Assign (empty string clears)
    #[arg(short, long)]
    pub assignee: Option<String>,

    /// Add a label (repeatable)
    #[arg(long)]
    pub add_label: Vec<String>,

    /// Remove a label (repeatable)
    #[arg(long)]
    pub remove_label: Vec<String>,

    /// Permit closing while blocked
    #[arg(long)]
    pub force: bool,
}

#[derive(Subcommand, Debug)]
pub enum DepCommands {
    /// Add a typed edge: <from> depends on <to>
    ///
    /// <to> accepts an issue id, a prefix, or external:<project>:<id>.
    Add {
        from: String,
        to: String,

        /// Edge type (blocks, related, parent-child, discovered-from,
        /// waits-for, supersedes, duplicates, relates-to, replies-to)
        #[arg(short = 't', long = "type", default_value = "blocks")]
        dep_type: String,
    },

    /// Remove an edge
    Remove {
        from: String,
        to: String,

        #[arg(short = 't', long = "type", default_value = "blocks")]
        dep_type: String,
    },
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// Run one parsed command. Returns normally on success; errors map to
/// exit codes in `main`.
///
/// # Errors
/// Whatever the underlying operation reports, wrapped with CLI context.
pub fn run(cli: Cli) -> Result<()> {
    let cwd = std::env::current_dir().context("cannot determine working directory")?;
    let format = OutputFormat::resolve(None, cli.json);

    if let Commands::Init { prefix, sync_branch } = &cli.command {
        return init(&cwd, prefix, sync_branch.as_deref());
    }
    if let Commands::MergeDriver { base, local, remote } = &cli.command {
        let merged = sync::merge_files(base, local, remote)?;
        crate::journal::codec::atomic_write(local, &merged)?;
        return Ok(());
    }

    let options = OpenOptions {
        no_auto_import: cli.no_auto_import,
        no_auto_flush: cli.no_auto_flush,
    };
    let mut session = WorkspaceSession::open(&cwd, options)?;
    let actor = session.actor(cli.actor.as_deref());
    let auto_flush_enabled = !cli.no_auto_flush;

    match cli.command {
        Commands::Init { .. } | Commands::MergeDriver { .. } => unreachable!("handled above"),

        Commands::Create(args) => {
            let parent = args
                .parent
                .as_deref()
                .map(|p| session.store.resolve_partial_id(p))
                .transpose()?;
            let discovered_from = args
                .discovered_from
                .as_deref()
                .map(|p| session.store.resolve_partial_id(p))
                .transpose()?;
            let issue = session.store.create(
                NewIssue {
                    title: args.title,
                    description: args.description,
                    priority: args.priority,
                    issue_type: args.issue_type,
                    assignee: args.assignee,
                    labels: args.label.into_iter().collect::<BTreeSet<_>>(),
                    parent,
                    discovered_from,
                    ephemeral: args.ephemeral,
                    ..NewIssue::default()
                },
                &actor,
            )?;
            auto_flush(&mut session, auto_flush_enabled)?;
            println!("{}", issue.id);
        }

        Commands::List(args) => {
            let issues = session.store.search(&SearchFilter {
                status: args.status,
                priority: args.priority,
                assignee: args.assignee,
                label: args.label,
                text: args.text,
                ready: args.ready,
                ..SearchFilter::default()
            })?;
            print_issues(&issues, format)?;
        }

        Commands::Show { ids } => {
            if ids.is_empty() {
                bail!("no ids given.\n  Usage: bd show <id>...");
            }
            let mut issues = Vec::new();
            for raw in &ids {
                let id = session.store.resolve_partial_id(raw)?;
                issues.push(session.store.get(&id)?);
            }
            print_issues_full(&issues, format)?;
        }

        Commands::Update(args) => {
            let id = session.store.resolve_partial_id(&args.id)?;
            session.store.update(
                &id,
                FieldDiff {
                    title: args.title,
                    description: args.description,
                    design: args.design,
                    notes: args.notes,
                    acceptance_criteria: args.acceptance,
                    status: args.status,
                    priority: args.priority,
                    issue_type: args.issue_type,
                    assignee: args.assignee.map(|a| if a.is_empty() { None } else { Some(a) }),
                    add_labels: args.add_label.into_iter().collect(),
                    remove_labels: args.remove_label.into_iter().collect(),
                    force: args.force,
                    ..FieldDiff::default()
                },
                &actor,
            )?;
            auto_flush(&mut session, auto_flush_enabled)?;
            println!("{id}");
        }

        Commands::Close { id, reason, force } => {
            let id = session.store.resolve_partial_id(&id)?;
            session.store.update(
                &id,
                FieldDiff {
                    status: Some("closed".to_owned()),
                    close_reason: reason,
                    force,
                    ..FieldDiff::default()
                },
                &actor,
            )?;
            auto_flush(&mut session, auto_flush_enabled)?;
            println!("{id}");
        }

        Commands::Delete { id, cascade, reason } => {
            let id = session.store.resolve_partial_id(&id)?;
            let doomed = session.store.delete(&id, &actor, cascade, reason)?;
            auto_flush(&mut session, auto_flush_enabled)?;
            for d in doomed {
                println!("{d}");
            }
        }

        Commands::Dep(dep) => {
            run_dep(&mut session, dep, &actor)?;
            auto_flush(&mut session, auto_flush_enabled)?;
        }

        Commands::Comment { id, text } => {
            let id = session.store.resolve_partial_id(&id)?;
            session.store.add_comment(&id, &actor, &text)?;
            auto_flush(&mut session, auto_flush_enabled)?;
        }

        Commands::Flush => {
            let outcome = flush::flush(&mut session.store, &session.workspace, &session.cancel)?;
            println!(
                "flushed {} records ({} bytes)",
                outcome.records, outcome.bytes
            );
        }

        Commands::Import => {
            let outcome = import::import(&mut session.store, &session.workspace, &session.cancel)?;
            println!(
                "imported: {} created, {} updated, {} deleted, {} unchanged",
                outcome.created, outcome.updated, outcome.deleted, outcome.unchanged
            );
            for e in &outcome.parse_errors {
                eprintln!("warning: journal line {} skipped: {}", e.line, e.detail);
            }
        }

        Commands::Sync => {
            let report = sync::sync(
                &mut session.store,
                &session.workspace,
                &session.yaml,
                &session.cancel,
            )?;
            for note in &report.diagnostics {
                eprintln!("note: {note}");
            }
            println!(
                "sync complete: pulled={} committed={} pushed={} ({} records)",
                report.pulled, report.committed, report.pushed, report.merged_records
            );
        }

        Commands::Compact => {
            let outcome = compact::compact(&mut session.store, &session.workspace, &session.cancel)?;
            println!(
                "purged {} tombstones, retained {}",
                outcome.purged.len(),
                outcome.retained.len()
            );
        }

        Commands::Doctor => {
            let report = doctor::check(&session.store, &session.workspace)?;
            if report.healthy() {
                println!("ok");
            } else {
                for p in &report.problems {
                    println!("problem: {p}");
                }
                bail!("{} integrity problems found", report.problems.len());
            }
        }

        Commands::Daemon { socket } => {
            daemon::serve(session, socket)?;
        }
    }
    Ok(())
}

fn run_dep(session: &mut WorkspaceSession, dep: DepCommands, actor: &str) -> Result<()> {
    match dep {
        DepCommands::Add { from, to, dep_type } => {
            let from = session.store.resolve_partial_id(&from)?;
            let dep_type: DepType = dep_type
                .parse()
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            if to.starts_with("external:") {
                let target = DepTarget::parse(&to).map_err(|e| anyhow::anyhow!("{e}"))?;
                session
                    .store
                    .add_external_dependency(&from, &target, dep_type, actor)?;
            } else {
                let to = session.store.resolve_partial_id(&to)?;
                session.store.add_dependency(&from, &to, dep_type, actor)?;
            }
        }
        DepCommands::Remove { from, to, dep_type } => {
            let from = session.store.resolve_partial_id(&from)?;
            let dep_type: DepType = dep_type
                .parse()
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            let target = if to.starts_with("external:") {
                DepTarget::parse(&to).map_err(|e| anyhow::anyhow!("{e}"))?
            } else {
                DepTarget::Local(session.store.resolve_partial_id(&to)?)
            };
            session
                .store
                .remove_dependency(&from, &target, dep_type, actor)?;
        }
    }
    Ok(())
}

/// Mirror every successful mutation into the journal right away, so the
/// file under git always reflects the store. Opt out with
/// `--no-auto-flush`.
fn auto_flush(session: &mut WorkspaceSession, enabled: bool) -> Result<()> {
    if enabled {
        flush::flush_if_dirty(&mut session.store, &session.workspace, &session.cancel)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Init
// ---------------------------------------------------------------------------

fn init(cwd: &std::path::Path, prefix: &str, sync_branch: Option<&str>) -> Result<()> {
    let root = Git::toplevel(cwd)?.unwrap_or_else(|| cwd.to_path_buf());
    let ws_dir = root.join(WORKSPACE_DIR);
    std::fs::create_dir_all(&ws_dir)
        .with_context(|| format!("cannot create {}", ws_dir.display()))?;

    let store = Store::open(&ws_dir.join("beads.db"))?;
    store.set_config("issue-prefix", prefix)?;

    // Only the journal, config, and redirect belong under version
    // control; the database, lock, and socket stay local.
    let ignore_path = ws_dir.join(".gitignore");
    if !ignore_path.exists() {
        std::fs::write(
            &ignore_path,
            "beads.db*\n.sync.lock\nbd.sock\n*.tmp\n",
        )?;
    }

    let mut yaml = format!("issue-prefix: {prefix}\n");
    if let Some(branch) = sync_branch {
        yaml.push_str(&format!("sync-branch: {branch}\n"));
    }
    std::fs::write(ws_dir.join(crate::config::CONFIG_FILE), yaml)?;

    let journal_path = journal::write_path(&ws_dir);
    if !journal_path.exists() {
        crate::journal::codec::atomic_write(&journal_path, b"")?;
    }

    // Wire the journal merge driver so git-initiated merges delegate to
    // the record-level merge instead of producing text conflicts.
    if Git::toplevel(cwd)?.is_some() {
        let git = Git::new(&root);
        git.set_config("merge.beads.name", "beads journal merge")?;
        git.set_config("merge.beads.driver", "bd merge-driver %O %A %B")?;
        register_gitattributes(&root)?;
    }

    workspace::invalidate_cache();
    println!("initialized beads workspace at {}", ws_dir.display());
    Ok(())
}

fn register_gitattributes(root: &std::path::Path) -> Result<()> {
    let path = root.join(".gitattributes");
    let line = format!("{WORKSPACE_DIR}/{} merge=beads", journal::JOURNAL_FILE);
    let existing = std::fs::read_to_string(&path).unwrap_or_default();
    if existing.lines().any(|l| l.trim() == line) {
        return Ok(());
    }
    let mut content = existing;
    if !content.is_empty() && !content.ends_with('\n') {
        content.push('\n');
    }
    content.push_str(&line);
    content.push('\n');
    std::fs::write(&path, content)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

fn print_issues(issues: &[Issue], format: OutputFormat) -> Result<()> {
    if format == OutputFormat::Json {
        println!("{}", format.serialize(&issues)?);
        return Ok(());
    }
    for issue in issues {
        println!(
            "{}  p{}  {:<12} {}",
            issue.id, issue.priority, issue.status, issue.title
        );
    }
    Ok(())
}

fn print_issues_full(issues: &[Issue], format: OutputFormat) -> Result<()> {
    if format == OutputFormat::Json {
        println!("{}", format.serialize(&issues)?);
        return Ok(());
    }
    for issue in issues {
        println!("{}: {}", issue.id, issue.title);
        println!("  status: {}  priority: {}  type: {}", issue.status, issue.priority, issue.issue_type);
        if let Some(assignee) = &issue.assignee {
            println!("  assignee: {assignee}");
        }
        if !issue.description.is_empty() {
            println!("  {}", issue.description);
        }
        if !issue.labels.is_empty() {
            let labels: Vec<&str> = issue.labels.iter().map(String::as_str).collect();
            println!("  labels: {}", labels.join(", "));
        }
        for edge in &issue.dependencies {
            println!("  dep: {} {}", edge.dep_type.as_str(), edge.target);
        }
        for comment in &issue.comments {
            println!("  comment [{}]: {}", comment.author, comment.text);
        }
    }
    Ok(())
}

/// Map an error chain to the process exit code.
#[must_use]
pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<BeadsError>()
        .map_or(1, BeadsError::exit_code)
}
