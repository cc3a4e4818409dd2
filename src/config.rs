//! Workspace configuration.
//!
//! Two layers:
//! - `config.yaml` in the workspace: startup-critical top-level keys read
//!   before the store is available (`issue-prefix`, `no-db`, `sync-branch`,
//!   `daemon-auto-sync`). Nested keys are ignored at this layer.
//! - the store's config table: everything else, post-startup.
//!
//! Lookup resolves through an explicit, ordered provider chain:
//! env var → YAML → store table → built-in default. No ad-hoc fallback
//! chains at call sites.

use std::path::Path;

use serde::Deserialize;

use crate::error::{BeadsError, Result};
use crate::store::Store;

/// The YAML config filename inside a workspace.
pub const CONFIG_FILE: &str = "config.yaml";

/// Environment override for the sync branch.
pub const ENV_SYNC_BRANCH: &str = "BEADS_SYNC_BRANCH";

// ---------------------------------------------------------------------------
// YAML layer
// ---------------------------------------------------------------------------

/// Startup-critical keys from `config.yaml`. Missing file → all defaults.
/// Unknown and nested keys are ignored, so the file can carry settings for
/// other layers without breaking startup.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct YamlConfig {
    #[serde(rename = "issue-prefix")]
    pub issue_prefix: Option<String>,

    /// JSONL-only mode: operate without opening the database.
    #[serde(rename = "no-db", default)]
    pub no_db: bool,

    /// Branch that receives sync commits; unset means the current branch.
    #[serde(rename = "sync-branch")]
    pub sync_branch: Option<String>,

    /// Whether the daemon auto-syncs after its debounced flushes.
    #[serde(rename = "daemon-auto-sync", default)]
    pub daemon_auto_sync: bool,
}

impl YamlConfig {
    /// Load `config.yaml` from a workspace directory. A missing file is
    /// all-defaults, not an error.
    ///
    /// # Errors
    /// `Parse` when the file exists but is not valid YAML.
    pub fn load(workspace_dir: &Path) -> Result<Self> {
        let path = workspace_dir.join(CONFIG_FILE);
        if !path.is_file() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(&path)?;
        serde_yaml::from_str(&raw).map_err(|e| BeadsError::Parse {
            origin: path.display().to_string(),
            line: None,
            detail: e.to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Provider chain
// ---------------------------------------------------------------------------

/// The ordered providers a key resolves through, highest precedence first.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Provider {
    Env,
    Yaml,
    StoreTable,
    Default,
}

/// Resolution order for every key.
pub const PRECEDENCE: [Provider; 4] = [
    Provider::Env,
    Provider::Yaml,
    Provider::StoreTable,
    Provider::Default,
];

/// A resolved configuration view over one workspace.
pub struct Config<'a> {
    yaml: YamlConfig,
    store: Option<&'a Store>,
}

impl<'a> Config<'a> {
    #[must_use]
    pub const fn new(yaml: YamlConfig, store: Option<&'a Store>) -> Self {
        Self { yaml, store }
    }

    /// Resolve `key` through the provider chain.
    ///
    /// # Errors
    /// Fails on a store read error.
    pub fn get(&self, key: &str) -> Result<Option<String>> {
        for provider in PRECEDENCE {
            let value = match provider {
                Provider::Env => env_value(key),
                Provider::Yaml => self.yaml_value(key),
                Provider::StoreTable => match self.store {
                    Some(store) => store.get_config(key)?,
                    None => None,
                },
                Provider::Default => default_value(key),
            };
            if value.is_some() {
                return Ok(value);
            }
        }
        Ok(None)
    }

    fn yaml_value(&self, key: &str) -> Option<String> {
        match key {
            "issue-prefix" => self.yaml.issue_prefix.clone(),
            "sync-branch" => self.yaml.sync_branch.clone(),
            "no-db" => self.yaml.no_db.then(|| "true".to_owned()),
            "daemon-auto-sync" => self.yaml.daemon_auto_sync.then(|| "true".to_owned()),
            _ => None,
        }
    }

    /// The branch sync commits should target, or `None` for the current
    /// branch.
    ///
    /// # Errors
    /// Fails on a store read error.
    pub fn sync_branch(&self) -> Result<Option<String>> {
        Ok(self.get("sync-branch")?.filter(|s| !s.is_empty()))
    }

    /// The issue id prefix for this workspace.
    ///
    /// # Errors
    /// Fails on a store read error.
    pub fn issue_prefix(&self) -> Result<String> {
        Ok(self.get("issue-prefix")?.unwrap_or_else(|| "bd".to_owned()))
    }
}

fn env_value(key: &str) -> Option<String> {
    let var = match key {
        "sync-branch" => ENV_SYNC_BRANCH,
        "db" => "BEADS_DB",
        "dir" => crate::workspace::ENV_BEADS_DIR,
        _ => return None,
    };
    std::env::var(var).ok().filter(|v| !v.is_empty())
}

fn default_value(key: &str) -> Option<String> {
    match key {
        "issue-prefix" => Some("bd".to_owned()),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_yaml_is_all_defaults() {
        let dir = TempDir::new().unwrap();
        let yaml = YamlConfig::load(dir.path()).unwrap();
        assert_eq!(yaml, YamlConfig::default());
    }

    #[test]
    fn yaml_reads_top_level_keys_and_ignores_nesting() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            "issue-prefix: px\nsync-branch: beads-sync\nno-db: false\njira:\n  url: https://example.invalid\n",
        )
        .unwrap();
        let yaml = YamlConfig::load(dir.path()).unwrap();
        assert_eq!(yaml.issue_prefix.as_deref(), Some("px"));
        assert_eq!(yaml.sync_branch.as_deref(), Some("beads-sync"));
        assert!(!yaml.no_db);
    }

    #[test]
    fn malformed_yaml_is_a_parse_error() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), ":\n  - [broken").unwrap();
        let err = YamlConfig::load(dir.path()).unwrap_err();
        assert!(matches!(err, BeadsError::Parse { .. }));
    }

    #[test]
    fn store_value_beats_default_and_yaml_beats_store() {
        let store = Store::open_in_memory().unwrap();
        store.set_config("issue-prefix", "st").unwrap();

        let chain = Config::new(YamlConfig::default(), Some(&store));
        assert_eq!(chain.issue_prefix().unwrap(), "st");

        let yaml = YamlConfig {
            issue_prefix: Some("ya".to_owned()),
            ..YamlConfig::default()
        };
        let chain = Config::new(yaml, Some(&store));
        assert_eq!(chain.issue_prefix().unwrap(), "ya");
    }

    #[test]
    fn builtin_default_is_the_last_resort() {
        let chain = Config::new(YamlConfig::default(), None);
        assert_eq!(chain.issue_prefix().unwrap(), "bd");
        assert_eq!(chain.sync_branch().unwrap(), None);
    }
}
