//! Atomic persistence for the shared forest state.
//!
//! Any number of arbor processes mutate one JSON file. Every mutation is:
//! in-process write queue (serializes concurrent callers within this
//! process) → cross-process directory lock → load → apply → save. Saves go
//! through a `.tmp` sibling and an atomic rename, so readers never observe
//! a torn file.
//!
//! Change notification watches the *parent directory* of the state file:
//! after a rename the originally-watched inode stops reporting events, but
//! the directory keeps delivering them for the new file.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use notify::{RecursiveMode, Watcher};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};

use crate::lock;
use crate::state::{ForestState, STATE_VERSION, TreeRecord, tree_key};

pub struct StateStore {
    state_path: PathBuf,
    write_queue: Mutex<()>,
}

impl StateStore {
    pub fn new(state_path: PathBuf) -> Self {
        Self {
            state_path,
            write_queue: Mutex::new(()),
        }
    }

    /// The shared per-user store at `~/.arbor/state.json`.
    pub fn open_default() -> Result<Self> {
        let home = dirs::home_dir().context("could not resolve home directory")?;
        Ok(Self::new(home.join(".arbor").join("state.json")))
    }

    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    fn lock_path(&self) -> PathBuf {
        append_extension(&self.state_path, "lock")
    }

    fn tmp_path(&self) -> PathBuf {
        append_extension(&self.state_path, "tmp")
    }

    /// Load the current state. A missing or corrupt file is replaced with a
    /// persisted empty default; an outdated schema is migrated and saved.
    pub fn load(&self) -> Result<ForestState> {
        let raw = match std::fs::read_to_string(&self.state_path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return self.reset(),
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("failed to read {}", self.state_path.display())
                });
            }
        };

        match serde_json::from_str::<ForestState>(&raw) {
            Ok(mut state) => {
                // Newer-than-us files are left as parsed; only older
                // schemas are upgraded and written back.
                if state.version < STATE_VERSION {
                    debug!(
                        "migrating state from version {} to {STATE_VERSION}",
                        state.version
                    );
                    state.migrate();
                    self.save(&state)?;
                }
                Ok(state)
            }
            Err(e) => {
                warn!(
                    "state file {} is corrupt ({e}), starting fresh",
                    self.state_path.display()
                );
                self.reset()
            }
        }
    }

    fn reset(&self) -> Result<ForestState> {
        let empty = ForestState::empty();
        self.save(&empty)?;
        Ok(empty)
    }

    /// Serialize and atomically replace the state file.
    pub fn save(&self, state: &ForestState) -> Result<()> {
        if let Some(dir) = self.state_path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        let json = serde_json::to_string_pretty(state).context("failed to serialize state")?;
        let tmp = self.tmp_path();
        std::fs::write(&tmp, json)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.state_path)
            .with_context(|| format!("failed to replace {}", self.state_path.display()))?;
        Ok(())
    }

    /// Read-modify-write under both locks. The mutation is only persisted
    /// when `apply` returns `Ok`; an `Err` leaves the file untouched.
    pub async fn modify<T>(
        &self,
        apply: impl FnOnce(&mut ForestState) -> Result<T>,
    ) -> Result<T> {
        let _queue = self.write_queue.lock().await;
        let _lock = lock::acquire(&self.lock_path()).await?;
        let mut state = self.load()?;
        let value = apply(&mut state)?;
        self.save(&state)?;
        Ok(value)
    }

    pub async fn add_tree(&self, tree: TreeRecord) -> Result<()> {
        self.modify(|state| {
            state.trees.insert(tree.key(), tree);
            Ok(())
        })
        .await
    }

    pub async fn remove_tree(&self, repo_path: &Path, branch: &str) -> Result<()> {
        self.modify(|state| {
            state.trees.remove(&tree_key(repo_path, branch));
            Ok(())
        })
        .await
    }

    /// Apply `update` to the record if it still exists. A missing key is a
    /// silent no-op — a racing removal must not resurrect the tree.
    pub async fn update_tree(
        &self,
        repo_path: &Path,
        branch: &str,
        update: impl FnOnce(&mut TreeRecord),
    ) -> Result<()> {
        self.modify(|state| {
            if let Some(tree) = state.trees.get_mut(&tree_key(repo_path, branch)) {
                update(tree);
            }
            Ok(())
        })
        .await
    }

    /// Watch the state file for external changes.
    ///
    /// Returns the watcher (must be kept alive) and a receiver that yields
    /// the newly parsed state whenever the file's content actually changed.
    /// Events that leave the content byte-identical are suppressed.
    pub fn subscribe(&self) -> Result<(notify::RecommendedWatcher, mpsc::Receiver<ForestState>)> {
        let dir = self
            .state_path
            .parent()
            .context("state path has no parent directory")?
            .to_path_buf();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
        let file_name = self
            .state_path
            .file_name()
            .context("state path has no file name")?
            .to_owned();

        // Raw signal channel: capacity 1 is enough, a pending signal already
        // means "re-read".
        let (raw_tx, mut raw_rx) = mpsc::channel::<()>(1);
        let mut watcher =
            notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
                let Ok(event) = res else { return };
                if event
                    .paths
                    .iter()
                    .any(|p| p.file_name() == Some(file_name.as_os_str()))
                {
                    let _ = raw_tx.try_send(());
                }
            })
            .context("failed to create filesystem watcher")?;
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("failed to watch {}", dir.display()))?;

        let (state_tx, state_rx) = mpsc::channel(16);
        let state_path = self.state_path.clone();
        let mut last_seen = std::fs::read_to_string(&state_path).unwrap_or_default();
        tokio::spawn(async move {
            while raw_rx.recv().await.is_some() {
                let Ok(raw) = std::fs::read_to_string(&state_path) else {
                    continue;
                };
                if raw == last_seen {
                    continue;
                }
                // A parse failure means we raced the writer's rename;
                // `last_seen` stays put so the next event re-reads the
                // settled file and still fires.
                if let Ok(state) = serde_json::from_str::<ForestState>(&raw) {
                    last_seen = raw;
                    if state_tx.send(state).await.is_err() {
                        return;
                    }
                }
            }
        });

        Ok((watcher, state_rx))
    }
}

fn append_extension(path: &Path, ext: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(ext);
    PathBuf::from(name)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> StateStore {
        StateStore::new(dir.path().join("state.json"))
    }

    fn record(branch: &str) -> TreeRecord {
        TreeRecord {
            branch: branch.to_string(),
            repo_path: PathBuf::from("/repo"),
            path: Some(PathBuf::from("/trees").join(branch)),
            ticket_id: None,
            title: None,
            created_at: Utc::now(),
            pr_url: None,
            merge_notified: false,
            port_base: None,
        }
    }

    #[test]
    fn load_missing_file_synthesizes_default() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        let state = store.load().unwrap();
        assert_eq!(state.version, STATE_VERSION);
        assert!(state.trees.is_empty());
        // The default was persisted, not just returned.
        assert!(store.state_path().exists());
    }

    #[test]
    fn load_corrupt_file_resets() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        std::fs::write(store.state_path(), "{not json").unwrap();

        let state = store.load().unwrap();
        assert!(state.trees.is_empty());
    }

    #[test]
    fn load_migrates_old_versions_and_persists() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        std::fs::write(
            store.state_path(),
            r#"{
                "version": 1,
                "trees": {
                    "/repo:quick-fix": {
                        "branch": "quick-fix",
                        "repoPath": "/repo",
                        "ticketId": "quick-fix",
                        "title": "quick-fix",
                        "createdAt": "2026-01-05T10:00:00Z"
                    }
                }
            }"#,
        )
        .unwrap();

        let state = store.load().unwrap();
        assert_eq!(state.version, STATE_VERSION);
        let tree = state.get_tree(Path::new("/repo"), "quick-fix").unwrap();
        assert!(tree.ticket_id.is_none());

        // Migrated form was written back.
        let raw = std::fs::read_to_string(store.state_path()).unwrap();
        assert!(raw.contains("\"version\": 2"));
    }

    #[test]
    fn save_load_round_trip_is_byte_stable() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let mut state = ForestState::empty();
        for branch in ["b-one", "a-two", "c-three"] {
            let tree = record(branch);
            state.trees.insert(tree.key(), tree);
        }
        store.save(&state).unwrap();
        let first = std::fs::read_to_string(store.state_path()).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded, state);
        store.save(&loaded).unwrap();
        let second = std::fs::read_to_string(store.state_path()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn save_leaves_no_tmp_file() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.save(&ForestState::empty()).unwrap();
        assert!(!store.tmp_path().exists());
    }

    #[tokio::test]
    async fn add_update_remove_tree() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        store.add_tree(record("feature")).await.unwrap();
        store
            .update_tree(Path::new("/repo"), "feature", |t| {
                t.pr_url = Some("https://github.com/acme/app/pull/1".into());
            })
            .await
            .unwrap();

        let state = store.load().unwrap();
        let tree = state.get_tree(Path::new("/repo"), "feature").unwrap();
        assert_eq!(
            tree.pr_url.as_deref(),
            Some("https://github.com/acme/app/pull/1")
        );

        store.remove_tree(Path::new("/repo"), "feature").await.unwrap();
        let state = store.load().unwrap();
        assert!(state.trees.is_empty());
    }

    #[tokio::test]
    async fn update_missing_tree_is_noop() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        store
            .update_tree(Path::new("/repo"), "gone", |t| t.merge_notified = true)
            .await
            .unwrap();
        assert!(store.load().unwrap().trees.is_empty());
    }

    #[tokio::test]
    async fn failed_modify_does_not_persist() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        let result: Result<()> = store
            .modify(|state| {
                let tree = record("doomed");
                state.trees.insert(tree.key(), tree);
                anyhow::bail!("validation failed")
            })
            .await;
        assert!(result.is_err());
        assert!(store.load().unwrap().trees.is_empty());
    }

    /// No lost updates across concurrent writers: two store instances
    /// (standing in for two processes) racing through the same file end with
    /// every record present.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writers_lose_no_updates() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        let a = Arc::new(StateStore::new(path.clone()));
        let b = Arc::new(StateStore::new(path));

        let mut handles = Vec::new();
        for i in 0..8 {
            let writer = if i % 2 == 0 { Arc::clone(&a) } else { Arc::clone(&b) };
            handles.push(tokio::spawn(async move {
                writer.add_tree(record(&format!("branch-{i}"))).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let state = a.load().unwrap();
        assert_eq!(state.trees.len(), 8);
    }

    #[tokio::test]
    async fn subscribe_delivers_changed_state() {
        let dir = TempDir::new().unwrap();
        let reader = store(&dir);
        reader.save(&ForestState::empty()).unwrap();
        let (_watcher, mut rx) = reader.subscribe().unwrap();

        // Another process writes a new tree.
        let writer = StateStore::new(reader.state_path().to_path_buf());
        writer.add_tree(record("from-elsewhere")).await.unwrap();

        let state = tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("no change notification")
            .expect("channel closed");
        assert!(
            state
                .get_tree(Path::new("/repo"), "from-elsewhere")
                .is_some()
        );
    }

    #[tokio::test]
    async fn subscribe_suppresses_identical_content() {
        let dir = TempDir::new().unwrap();
        let reader = store(&dir);
        let mut state = ForestState::empty();
        let tree = record("steady");
        state.trees.insert(tree.key(), tree);
        reader.save(&state).unwrap();

        let (_watcher, mut rx) = reader.subscribe().unwrap();

        // Rewriting identical bytes fires a filesystem event but no change.
        reader.save(&state).unwrap();
        let result = tokio::time::timeout(Duration::from_millis(500), rx.recv()).await;
        assert!(result.is_err(), "identical save should not notify");
    }
}
