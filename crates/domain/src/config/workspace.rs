use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Workspace
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    #[serde(default = "d_ws_path")]
    pub path: PathBuf,
    #[serde(default = "d_state_path")]
    pub state_path: PathBuf,
    /// Additional directories a `user_request`'s `projectRoot` may point
    /// into, beyond `path` itself (§4.8, §6.5: "project root allow-list").
    /// A request naming a root outside `path` and this list is rejected.
    #[serde(default)]
    pub project_root_allowlist: Vec<PathBuf>,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./workspace"),
            state_path: PathBuf::from("./data/state"),
            project_root_allowlist: Vec::new(),
        }
    }
}

impl WorkspaceConfig {
    /// §4.8: "validate project root against allow-list". A root is
    /// permitted when it is `path` itself, a descendant of `path`, or a
    /// descendant of one of `project_root_allowlist`. Compares canonicalized
    /// paths when possible so `..`/symlink traversal can't escape the list;
    /// falls back to lexical prefix matching for paths that don't exist yet
    /// (e.g. a root the caller is about to create).
    pub fn is_project_root_allowed(&self, candidate: &std::path::Path) -> bool {
        let roots = std::iter::once(self.path.clone()).chain(self.project_root_allowlist.clone());
        for root in roots {
            if path_contains(&root, candidate) {
                return true;
            }
        }
        false
    }
}

fn path_contains(root: &std::path::Path, candidate: &std::path::Path) -> bool {
    match (root.canonicalize(), candidate.canonicalize()) {
        (Ok(root), Ok(candidate)) => candidate.starts_with(&root),
        _ => candidate.starts_with(root),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Skills
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillsConfig {
    #[serde(default = "d_skills_path")]
    pub path: PathBuf,
}

impl Default for SkillsConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./skills"),
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_ws_path() -> PathBuf {
    PathBuf::from("./workspace")
}
fn d_state_path() -> PathBuf {
    PathBuf::from("./data/state")
}
fn d_skills_path() -> PathBuf {
    PathBuf::from("./skills")
}
