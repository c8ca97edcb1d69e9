//! Project-level arbor configuration from `.arbor/config.toml`.
//!
//! A sibling `.arbor/local.toml` holds per-machine overrides and is merged
//! on top: tables deep-merge, everything else is replaced. Both files are
//! optional — a bare repository gets the defaults.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

const CONFIG_PATH: &str = ".arbor/config.toml";
const LOCAL_PATH: &str = ".arbor/local.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Where worktrees are created. Supports `~` and `${repo}` (the repo
    /// directory name); expanded by [`load`].
    pub trees_dir: String,
    /// Untracked files copied from the main repo into each new tree.
    pub copy: Vec<String>,
    /// Shell commands run in a fresh tree. Failures warn, never abort.
    pub setup: Vec<String>,
    /// Environment template written to `.arbor.env`; values may reference
    /// `${ports.<name>}`.
    pub env: BTreeMap<String, String>,
    pub ports: PortsConfig,
    /// Branch name template with `${ticketId}` and `${slug}` placeholders.
    pub branch_format: String,
    /// Ref new branches start from and are compared against.
    pub base_branch: String,
    pub max_trees: usize,
    pub github: GithubConfig,
    pub linear: LinearConfig,
    pub ai: Option<AiConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            trees_dir: "~/.arbor/trees/${repo}".to_string(),
            copy: Vec::new(),
            setup: Vec::new(),
            env: BTreeMap::new(),
            ports: PortsConfig::default(),
            branch_format: "${ticketId}-${slug}".to_string(),
            base_branch: "origin/main".to_string(),
            max_trees: 10,
            github: GithubConfig::default(),
            linear: LinearConfig::default(),
            ai: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortsConfig {
    /// Inclusive `[start, end]` range port bases are drawn from.
    pub base_range: (u16, u16),
    /// Service name → offset, e.g. `web = "+0"`, `api = "+1"`.
    pub mapping: BTreeMap<String, String>,
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            base_range: (3000, 3999),
            mapping: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GithubConfig {
    pub enabled: bool,
}

impl Default for GithubConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LinearConfig {
    pub enabled: bool,
    pub api_key: Option<String>,
    /// Team keys issues are filtered to; empty means all teams.
    pub teams: Vec<String>,
    pub statuses: StatusConfig,
}

/// Workflow status applied at each lifecycle transition. Values may be a
/// state name ("In Review") or a state type ("started").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusConfig {
    /// State types issues are listed from when picking work.
    pub issue_list: Vec<String>,
    pub on_new: Option<String>,
    pub on_ship: Option<String>,
    pub on_cleanup: Option<String>,
    pub on_cancel: Option<String>,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            issue_list: vec![
                "triage".to_string(),
                "backlog".to_string(),
                "unstarted".to_string(),
            ],
            on_new: Some("started".to_string()),
            on_ship: Some("In Review".to_string()),
            on_cleanup: Some("Done".to_string()),
            on_cancel: Some("Canceled".to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiConfig {
    pub provider: AiProvider,
    pub model: String,
    pub api_key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AiProvider {
    Anthropic,
    OpenAi,
    Gemini,
}

/// Load configuration for a repository, merging `local.toml` over
/// `config.toml` and expanding `trees_dir`.
pub fn load(repo_path: &Path) -> Result<Config> {
    let mut value = read_toml(&repo_path.join(CONFIG_PATH))?
        .unwrap_or(toml::Value::Table(toml::Table::new()));
    if let Some(local) = read_toml(&repo_path.join(LOCAL_PATH))? {
        value = merge(value, local);
    }

    let mut config: Config = value.try_into().context("invalid arbor configuration")?;
    expand_trees_dir(&mut config, repo_path);
    Ok(config)
}

fn read_toml(path: &Path) -> Result<Option<toml::Value>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let value = toml::from_str::<toml::Value>(&contents)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(Some(value))
}

/// Tables merge key-by-key, any other value in `overlay` replaces `base`.
fn merge(base: toml::Value, overlay: toml::Value) -> toml::Value {
    match (base, overlay) {
        (toml::Value::Table(mut base), toml::Value::Table(overlay)) => {
            for (key, value) in overlay {
                match base.remove(&key) {
                    Some(existing) => {
                        base.insert(key, merge(existing, value));
                    }
                    None => {
                        base.insert(key, value);
                    }
                }
            }
            toml::Value::Table(base)
        }
        (_, overlay) => overlay,
    }
}

fn expand_trees_dir(config: &mut Config, repo_path: &Path) {
    if let Some(rest) = config.trees_dir.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            config.trees_dir = format!("{}{rest}", home.display());
        }
    }
    if let Some(repo_name) = repo_path.file_name().and_then(|n| n.to_str()) {
        config.trees_dir = config.trees_dir.replace("${repo}", repo_name);
    }
}

impl Config {
    /// The base branch without a remote prefix, as PR hosts expect it.
    pub fn base_branch_short(&self) -> &str {
        self.base_branch
            .strip_prefix("origin/")
            .unwrap_or(&self.base_branch)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn missing_config_uses_defaults() {
        let repo = TempDir::new().unwrap();
        let config = load(repo.path()).unwrap();
        assert_eq!(config.branch_format, "${ticketId}-${slug}");
        assert_eq!(config.base_branch, "origin/main");
        assert_eq!(config.max_trees, 10);
        assert!(config.github.enabled);
        assert!(!config.linear.enabled);
    }

    #[test]
    fn parses_full_config() {
        let repo = TempDir::new().unwrap();
        fs::create_dir_all(repo.path().join(".arbor")).unwrap();
        fs::write(
            repo.path().join(CONFIG_PATH),
            r#"
trees_dir = "/tmp/trees"
copy = [".env.local"]
setup = ["npm install"]
branch_format = "${ticketId}/${slug}"
base_branch = "origin/develop"
max_trees = 4

[env]
DATABASE_URL = "pg://localhost/dev"
WEB_PORT = "${ports.web}"

[ports]
base_range = [3000, 3999]

[ports.mapping]
web = "+0"
api = "+1"

[linear]
enabled = true
api_key = "lin_api_x"
teams = ["ENG"]

[linear.statuses]
on_ship = "In Review"

[ai]
provider = "anthropic"
model = "claude-sonnet-4-5"
api_key = "sk-ant-x"
"#,
        )
        .unwrap();

        let config = load(repo.path()).unwrap();
        assert_eq!(config.trees_dir, "/tmp/trees");
        assert_eq!(config.copy, vec![".env.local"]);
        assert_eq!(config.ports.base_range, (3000, 3999));
        assert_eq!(
            config.ports.mapping.get("api").map(String::as_str),
            Some("+1")
        );
        assert_eq!(config.base_branch, "origin/develop");
        assert!(config.linear.enabled);
        assert_eq!(config.linear.statuses.on_ship.as_deref(), Some("In Review"));
        // Unset statuses keep their defaults.
        assert_eq!(config.linear.statuses.on_cleanup.as_deref(), Some("Done"));
        let ai = config.ai.unwrap();
        assert_eq!(ai.provider, AiProvider::Anthropic);
    }

    #[test]
    fn local_overrides_merge_over_config() {
        let repo = TempDir::new().unwrap();
        fs::create_dir_all(repo.path().join(".arbor")).unwrap();
        fs::write(
            repo.path().join(CONFIG_PATH),
            "max_trees = 4\n\n[linear]\nenabled = true\nteams = [\"ENG\"]\n",
        )
        .unwrap();
        fs::write(
            repo.path().join(LOCAL_PATH),
            "max_trees = 8\n\n[linear]\napi_key = \"lin_api_local\"\n",
        )
        .unwrap();

        let config = load(repo.path()).unwrap();
        assert_eq!(config.max_trees, 8);
        // Nested tables merge instead of replacing wholesale.
        assert!(config.linear.enabled);
        assert_eq!(config.linear.teams, vec!["ENG"]);
        assert_eq!(config.linear.api_key.as_deref(), Some("lin_api_local"));
    }

    #[test]
    fn trees_dir_expansion() {
        let repo = TempDir::new().unwrap();
        fs::create_dir_all(repo.path().join(".arbor")).unwrap();
        fs::write(
            repo.path().join(CONFIG_PATH),
            "trees_dir = \"~/worktrees/${repo}\"\n",
        )
        .unwrap();

        let config = load(repo.path()).unwrap();
        let repo_name = repo.path().file_name().unwrap().to_str().unwrap();
        assert!(!config.trees_dir.starts_with('~'));
        assert!(config.trees_dir.ends_with(repo_name));
    }

    #[test]
    fn base_branch_short_strips_origin() {
        let mut config = Config::default();
        assert_eq!(config.base_branch_short(), "main");
        config.base_branch = "develop".to_string();
        assert_eq!(config.base_branch_short(), "develop");
    }
}
