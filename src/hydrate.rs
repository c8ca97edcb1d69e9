//! Worktree provisioning: copied files, env files, workspace descriptors,
//! and the dependency template cache.
//!
//! Copying and file generation are part of the critical creation pipeline;
//! template hydration and setup commands are opportunistic and only ever
//! warn.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::json;
use tracing::{debug, warn};

use crate::config::Config;
use crate::ident;
use crate::ports;

pub const ENV_FILE: &str = ".arbor.env";
const SETUP_TIMEOUT: Duration = Duration::from_secs(120);

/// Copy the configured untracked files from the main repo into the tree.
/// Missing sources are skipped; a failing copy is an error.
pub fn copy_config_files(config: &Config, repo_path: &Path, tree_path: &Path) -> Result<()> {
    for file in &config.copy {
        let src = repo_path.join(file);
        if !src.exists() {
            debug!("copy source {} missing, skipping", src.display());
            continue;
        }
        let dst = tree_path.join(file);
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        std::fs::copy(&src, &dst)
            .with_context(|| format!("failed to copy {} into tree", src.display()))?;
    }
    Ok(())
}

/// Write `.arbor.env` with the tree's resolved ports substituted into the
/// configured environment template.
pub fn write_env_file(config: &Config, tree_path: &Path, port_base: u16) -> Result<()> {
    let lines: Vec<String> = config
        .env
        .iter()
        .map(|(key, value)| {
            let resolved = ports::substitute(value, &config.ports.mapping, port_base);
            format!("{key}={resolved}")
        })
        .collect();
    let path = tree_path.join(ENV_FILE);
    std::fs::write(&path, lines.join("\n"))
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

/// Central location for workspace descriptors: outside the worktrees
/// themselves, so they survive (and can be unlinked during) worktree
/// removal.
pub fn workspace_file_path(config: &Config, branch: &str) -> PathBuf {
    Path::new(&config.trees_dir)
        .join(".workspaces")
        .join(format!("{}.code-workspace", ident::sanitize_for_path(branch)))
}

/// Generate the editor workspace descriptor for a tree: the worktree folder
/// plus a title and a titlebar color derived from the tree's identity.
pub fn write_workspace_file(
    config: &Config,
    tree_path: &Path,
    branch: &str,
    ticket_id: Option<&str>,
    title: Option<&str>,
) -> Result<PathBuf> {
    let label = match (ticket_id, title) {
        (Some(ticket), Some(title)) => format!("{ticket}: {title}"),
        (Some(ticket), None) => ticket.to_string(),
        (None, _) => branch.to_string(),
    };
    let color = identity_color(ticket_id.unwrap_or(branch));
    let workspace = json!({
        "folders": [{ "path": tree_path }],
        "settings": {
            "window.title": format!("{label} — ${{activeEditorShort}}"),
            "workbench.colorCustomizations": {
                "titleBar.activeBackground": color,
                "titleBar.activeForeground": "#ffffff",
                "titleBar.inactiveBackground": darken(color, 0.3),
                "titleBar.inactiveForeground": "#cccccc",
                "statusBar.background": color,
                "statusBar.foreground": "#ffffff",
            },
        },
    });

    let path = workspace_file_path(config, branch);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    std::fs::write(&path, serde_json::to_string_pretty(&workspace)?)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(path)
}

pub fn remove_workspace_file(config: &Config, branch: &str) {
    let _ = std::fs::remove_file(workspace_file_path(config, branch));
}

/// Stable titlebar color for a tree identity.
fn identity_color(name: &str) -> &'static str {
    const PALETTE: [&str; 10] = [
        "#2e7d32", "#1565c0", "#6a1b9a", "#c62828", "#00695c", "#e65100", "#4527a0", "#283593",
        "#ad1457", "#37474f",
    ];
    let hash = name
        .bytes()
        .fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(u32::from(b)));
    PALETTE[(hash as usize) % PALETTE.len()]
}

fn darken(hex: &str, amount: f32) -> String {
    let parse = |range| u8::from_str_radix(hex.get(range).unwrap_or("00"), 16).unwrap_or(0);
    let scale = |channel: u8| {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let scaled = (f32::from(channel) * (1.0 - amount)) as u8;
        scaled
    };
    format!(
        "#{:02x}{:02x}{:02x}",
        scale(parse(1..3)),
        scale(parse(3..5)),
        scale(parse(5..7))
    )
}

// ── Dependency template cache ───────────────────────────────────────────

fn template_dir(config: &Config) -> PathBuf {
    Path::new(&config.trees_dir).join(".template")
}

fn clone_flag() -> &'static str {
    if cfg!(target_os = "macos") { "-Rc" } else { "-al" }
}

/// Seed `node_modules` from the saved template via hard links (clonefile on
/// macOS), skipping the expensive install in fresh trees. Returns whether a
/// template was applied; every failure is silent — this is a cache.
pub fn hydrate_modules(config: &Config, tree_path: &Path) -> bool {
    let src = template_dir(config).join("node_modules");
    if !src.exists() {
        return false;
    }
    let dst = tree_path.join("node_modules");
    std::process::Command::new("cp")
        .arg(clone_flag())
        .arg(&src)
        .arg(&dst)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .is_ok_and(|s| s.success())
}

/// Refresh the template from a tree's installed modules. Best-effort.
pub fn save_template(config: &Config, tree_path: &Path) {
    let src = tree_path.join("node_modules");
    if !src.exists() {
        return;
    }
    let tpl = template_dir(config);
    if std::fs::create_dir_all(&tpl).is_err() {
        return;
    }
    let dst = tpl.join("node_modules");
    if dst.exists() && std::fs::remove_dir_all(&dst).is_err() {
        return;
    }
    let _ = std::process::Command::new("cp")
        .arg(clone_flag())
        .arg(&src)
        .arg(&dst)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status();
}

/// Run the configured setup commands in the tree. Each failure is reported
/// as a warning and never aborts the pipeline.
pub async fn run_setup_commands(config: &Config, tree_path: &Path) {
    for cmd in &config.setup {
        debug!("running setup command: {cmd}");
        let result = tokio::time::timeout(
            SETUP_TIMEOUT,
            tokio::process::Command::new("sh")
                .arg("-c")
                .arg(cmd)
                .current_dir(tree_path)
                .output(),
        )
        .await;

        match result {
            Ok(Ok(output)) if output.status.success() => {}
            Ok(Ok(output)) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                warn!("setup command failed: {cmd}: {}", stderr.trim());
            }
            Ok(Err(e)) => warn!("setup command failed to start: {cmd}: {e}"),
            Err(_) => warn!("setup command timed out: {cmd}"),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config_with(trees_dir: &str) -> Config {
        Config {
            trees_dir: trees_dir.to_string(),
            ..Config::default()
        }
    }

    #[test]
    fn copy_skips_missing_and_creates_parents() {
        let repo = TempDir::new().unwrap();
        let tree = TempDir::new().unwrap();
        std::fs::create_dir_all(repo.path().join("config")).unwrap();
        std::fs::write(repo.path().join("config/.env.local"), "SECRET=1\n").unwrap();

        let mut config = config_with("/unused");
        config.copy = vec!["config/.env.local".into(), "not-there.txt".into()];

        copy_config_files(&config, repo.path(), tree.path()).unwrap();
        let copied = std::fs::read_to_string(tree.path().join("config/.env.local")).unwrap();
        assert_eq!(copied, "SECRET=1\n");
        assert!(!tree.path().join("not-there.txt").exists());
    }

    #[test]
    fn env_file_substitutes_ports() {
        let tree = TempDir::new().unwrap();
        let mut config = config_with("/unused");
        config.env.insert("API_URL".into(), "http://localhost:${ports.api}".into());
        config.env.insert("WEB_PORT".into(), "${ports.web}".into());
        config.ports.mapping.insert("web".into(), "+0".into());
        config.ports.mapping.insert("api".into(), "+1".into());

        write_env_file(&config, tree.path(), 3100).unwrap();
        let env = std::fs::read_to_string(tree.path().join(ENV_FILE)).unwrap();
        assert_eq!(env, "API_URL=http://localhost:3101\nWEB_PORT=3100");
    }

    #[test]
    fn workspace_descriptor_contains_folder_and_title() {
        let trees = TempDir::new().unwrap();
        let config = config_with(trees.path().to_str().unwrap());
        let tree = trees.path().join("ENG-5");
        std::fs::create_dir_all(&tree).unwrap();

        let path = write_workspace_file(&config, &tree, "eng-5-fix", Some("ENG-5"), Some("Fix it"))
            .unwrap();
        assert!(path.to_string_lossy().ends_with("eng-5-fix.code-workspace"));

        let raw = std::fs::read_to_string(&path).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(
            parsed.pointer("/folders/0/path").unwrap().as_str().unwrap(),
            tree.to_str().unwrap()
        );
        let title = parsed
            .pointer("/settings/window.title")
            .unwrap()
            .as_str()
            .unwrap();
        assert!(title.starts_with("ENG-5: Fix it"));

        remove_workspace_file(&config, "eng-5-fix");
        assert!(!path.exists());
    }

    #[test]
    fn workspace_path_flattens_branch_slashes() {
        let config = config_with("/trees");
        let path = workspace_file_path(&config, "feat/nested");
        assert!(path.to_string_lossy().ends_with(".workspaces/feat-nested.code-workspace"));
    }

    #[test]
    fn identity_color_is_stable() {
        assert_eq!(identity_color("ENG-42"), identity_color("ENG-42"));
        assert!(identity_color("ENG-42").starts_with('#'));
    }

    #[test]
    fn darken_scales_channels() {
        assert_eq!(darken("#ffffff", 0.5), "#7f7f7f");
        assert_eq!(darken("#000000", 0.5), "#000000");
    }

    #[test]
    fn template_round_trip_via_hard_links() {
        let trees = TempDir::new().unwrap();
        let config = config_with(trees.path().to_str().unwrap());

        let seeded = trees.path().join("seeded");
        std::fs::create_dir_all(seeded.join("node_modules/pkg")).unwrap();
        std::fs::write(seeded.join("node_modules/pkg/index.js"), "x\n").unwrap();
        save_template(&config, &seeded);

        let fresh = trees.path().join("fresh");
        std::fs::create_dir_all(&fresh).unwrap();
        assert!(hydrate_modules(&config, &fresh));
        assert!(fresh.join("node_modules/pkg/index.js").exists());
    }

    #[test]
    fn hydrate_without_template_is_false() {
        let trees = TempDir::new().unwrap();
        let config = config_with(trees.path().to_str().unwrap());
        let tree = trees.path().join("fresh");
        std::fs::create_dir_all(&tree).unwrap();
        assert!(!hydrate_modules(&config, &tree));
    }

    #[tokio::test]
    async fn setup_commands_run_and_tolerate_failure() {
        let tree = TempDir::new().unwrap();
        let mut config = config_with("/unused");
        config.setup = vec![
            "touch setup-ran".to_string(),
            "exit 3".to_string(),
            "touch still-runs".to_string(),
        ];

        run_setup_commands(&config, tree.path()).await;
        assert!(tree.path().join("setup-ran").exists());
        // The failing command did not stop the rest.
        assert!(tree.path().join("still-runs").exists());
    }
}
