//! Working-tree snapshots for modes without a branch to diff against.
//!
//! A snapshot maps repository-relative paths to a content hash and line
//! count. Diffing two snapshots yields added/removed/changed paths plus
//! additive and deletive line counts.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

/// One file's recorded state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotEntry {
    /// Hex-encoded sha256 of the file contents.
    pub hash: String,
    /// Number of lines in the file.
    pub lines: usize,
}

/// Map of repository-relative path (with `/` separators) to entry.
pub type Snapshot = BTreeMap<String, SnapshotEntry>;

/// Difference between two snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub changed: Vec<String>,
    pub lines_added: usize,
    pub lines_removed: usize,
}

impl SnapshotDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }

    /// All touched paths (added + removed + changed), sorted.
    pub fn touched_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self
            .added
            .iter()
            .chain(self.removed.iter())
            .chain(self.changed.iter())
            .cloned()
            .collect();
        paths.sort();
        paths
    }
}

/// Capture a snapshot of every file under `root`, skipping `.git/`.
pub fn take_snapshot(root: &Path) -> Result<Snapshot> {
    let mut snapshot = Snapshot::new();
    walk(root, root, &mut snapshot)?;
    Ok(snapshot)
}

fn walk(root: &Path, dir: &Path, snapshot: &mut Snapshot) -> Result<()> {
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("failed to read directory {}", dir.display()))?;

    for entry in entries {
        let entry = entry.with_context(|| format!("failed to read entry in {}", dir.display()))?;
        let path = entry.path();
        let file_type = entry
            .file_type()
            .with_context(|| format!("failed to stat {}", path.display()))?;

        if file_type.is_dir() {
            if entry.file_name() == ".git" {
                continue;
            }
            walk(root, &path, snapshot)?;
        } else if file_type.is_file() {
            let contents = std::fs::read(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let hash = hex::encode(Sha256::digest(&contents));
            let lines = contents.iter().filter(|b| **b == b'\n').count();

            let rel = path
                .strip_prefix(root)
                .expect("walked path is always under root")
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");

            snapshot.insert(rel, SnapshotEntry { hash, lines });
        }
        // Symlinks and other special files are not snapshotted.
    }

    Ok(())
}

/// Diff two snapshots taken before and after an execution.
pub fn diff_snapshots(before: &Snapshot, after: &Snapshot) -> SnapshotDiff {
    let mut diff = SnapshotDiff::default();

    for (path, entry) in after {
        match before.get(path) {
            None => {
                diff.lines_added += entry.lines;
                diff.added.push(path.clone());
            }
            Some(prev) if prev.hash != entry.hash => {
                if entry.lines >= prev.lines {
                    diff.lines_added += entry.lines - prev.lines;
                } else {
                    diff.lines_removed += prev.lines - entry.lines;
                }
                diff.changed.push(path.clone());
            }
            Some(_) => {}
        }
    }

    for (path, entry) in before {
        if !after.contains_key(path) {
            diff.lines_removed += entry.lines;
            diff.removed.push(path.clone());
        }
    }

    diff
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_of_same_tree_diffs_empty() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "one\ntwo\n").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/b.txt"), "three\n").unwrap();

        let before = take_snapshot(dir.path()).unwrap();
        let after = take_snapshot(dir.path()).unwrap();

        let diff = diff_snapshots(&before, &after);
        assert!(diff.is_empty());
        assert_eq!(diff.lines_added, 0);
        assert_eq!(diff.lines_removed, 0);
    }

    #[test]
    fn detects_added_removed_and_changed() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("keep.txt"), "same\n").unwrap();
        std::fs::write(dir.path().join("edit.txt"), "old\n").unwrap();
        std::fs::write(dir.path().join("gone.txt"), "bye\nbye\n").unwrap();

        let before = take_snapshot(dir.path()).unwrap();

        std::fs::write(dir.path().join("edit.txt"), "new\nlonger\n").unwrap();
        std::fs::remove_file(dir.path().join("gone.txt")).unwrap();
        std::fs::write(dir.path().join("fresh.txt"), "hello\n").unwrap();

        let after = take_snapshot(dir.path()).unwrap();
        let diff = diff_snapshots(&before, &after);

        assert_eq!(diff.added, vec!["fresh.txt".to_owned()]);
        assert_eq!(diff.removed, vec!["gone.txt".to_owned()]);
        assert_eq!(diff.changed, vec!["edit.txt".to_owned()]);
        // fresh.txt (+1) and edit.txt (+1 net).
        assert_eq!(diff.lines_added, 2);
        // gone.txt (-2).
        assert_eq!(diff.lines_removed, 2);
    }

    #[test]
    fn git_dir_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join(".git")).unwrap();
        std::fs::write(dir.path().join(".git/HEAD"), "ref: refs/heads/main\n").unwrap();
        std::fs::write(dir.path().join("code.rs"), "fn main() {}\n").unwrap();

        let snapshot = take_snapshot(dir.path()).unwrap();
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.contains_key("code.rs"));
    }

    #[test]
    fn nested_paths_use_forward_slashes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("a/b")).unwrap();
        std::fs::write(dir.path().join("a/b/c.txt"), "x\n").unwrap();

        let snapshot = take_snapshot(dir.path()).unwrap();
        assert!(snapshot.contains_key("a/b/c.txt"));
    }

    #[test]
    fn touched_paths_is_sorted_union() {
        let diff = SnapshotDiff {
            added: vec!["z.txt".into()],
            removed: vec!["a.txt".into()],
            changed: vec!["m.txt".into()],
            lines_added: 0,
            lines_removed: 0,
        };
        assert_eq!(diff.touched_paths(), vec!["a.txt", "m.txt", "z.txt"]);
    }
}
