//! Git worktree provisioning behind the workspace model.
//!
//! A workspace row promises an isolated checkout at `path` on `branch`,
//! cut from `base_branch`. This module keeps that promise: `provision`
//! turns a workflow/task pair into such a checkout (idempotently, so a
//! crashed run can re-provision), and `discard`/`discard_path` tear
//! checkouts down when a run ends without a PR to wait on.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;

use thiserror::Error;

// git takes a repo-level lock for worktree mutations; serialising them
// process-wide keeps concurrent task spawns from tripping over it.
static GIT_LOCK: Mutex<()> = Mutex::new(());

/// Errors from worktree provisioning.
#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("{0} is not inside a git repository")]
    NotARepository(PathBuf),

    #[error("git {args} exited with {code}: {stderr}")]
    Git {
        args: String,
        code: i32,
        stderr: String,
    },

    #[error("worktree io failure: {0}")]
    Io(#[from] std::io::Error),
}

/// What `provision` hands back; the fields line up with a workspace row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedWorktree {
    pub path: PathBuf,
    pub branch: String,
    pub base_branch: String,
}

/// One entry of `git worktree list`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeListing {
    pub path: PathBuf,
    pub branch: Option<String>,
}

/// Run git in `dir` and hand back trimmed stdout.
fn run_git(dir: &Path, args: &[&str]) -> Result<String, WorktreeError> {
    let output = Command::new("git").args(args).current_dir(dir).output()?;
    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        Err(WorktreeError::Git {
            args: args.join(" "),
            code: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

/// Lowercase a name to the alphanumeric-and-dashes form used in branch
/// names, worktree directories, and ephemeral worktree slugs.
pub fn slug(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect::<String>()
        .trim_matches('-')
        .to_string()
}

/// Branch naming convention: `caw/<workflow-slug>/<task-slug>`.
pub fn branch_name(workflow_name: &str, task_name: &str) -> String {
    format!("caw/{}/{}", slug(workflow_name), slug(task_name))
}

/// Worktree operations for one registered repository.
#[derive(Debug, Clone)]
pub struct Worktrees {
    repo: PathBuf,
    base: PathBuf,
}

impl Worktrees {
    /// Bind to a repository. Checkouts land under `<repo>/.caw/worktrees`,
    /// next to the repository-mode database.
    pub fn open(repo: impl Into<PathBuf>) -> Result<Self, WorktreeError> {
        let repo = repo.into();
        let base = repo.join(".caw").join("worktrees");
        Self::at(repo, base)
    }

    /// Bind to a repository with an explicit checkout directory.
    pub fn at(repo: impl Into<PathBuf>, base: impl Into<PathBuf>) -> Result<Self, WorktreeError> {
        let repo = repo.into();
        if run_git(&repo, &["rev-parse", "--git-dir"]).is_err() {
            return Err(WorktreeError::NotARepository(repo));
        }
        Ok(Self {
            repo,
            base: base.into(),
        })
    }

    pub fn repo(&self) -> &Path {
        &self.repo
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// The branch the repository currently has checked out, defaulting to
    /// `main` on detached HEAD.
    pub fn current_branch(&self) -> String {
        run_git(&self.repo, &["symbolic-ref", "--short", "HEAD"])
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "main".to_string())
    }

    fn has_branch(&self, branch: &str) -> bool {
        run_git(
            &self.repo,
            &["rev-parse", "--verify", "--quiet", &format!("refs/heads/{branch}")],
        )
        .is_ok()
    }

    /// Create (or find) the checkout for a workflow/task pair.
    ///
    /// The branch is cut from `base_branch` (the current branch when not
    /// given), so the returned fields can be written into a workspace row
    /// as-is. Re-provisioning after a crash returns the surviving
    /// checkout; a branch left behind by a removed checkout is reused
    /// rather than recreated.
    pub fn provision(
        &self,
        workflow_name: &str,
        task_name: &str,
        base_branch: Option<&str>,
    ) -> Result<ProvisionedWorktree, WorktreeError> {
        let _guard = GIT_LOCK.lock().unwrap_or_else(|e| e.into_inner());

        let branch = branch_name(workflow_name, task_name);
        let dir = self
            .base
            .join(format!("{}--{}", slug(workflow_name), slug(task_name)));
        let base = base_branch
            .map(|b| b.to_string())
            .unwrap_or_else(|| self.current_branch());

        if let Some(existing) = self.find(&dir)? {
            return Ok(ProvisionedWorktree {
                path: existing.path,
                branch: existing.branch.unwrap_or(branch),
                base_branch: base,
            });
        }

        std::fs::create_dir_all(&self.base)?;
        let dir_str = dir.to_string_lossy();
        let added = if self.has_branch(&branch) {
            run_git(&self.repo, &["worktree", "add", &dir_str, &branch])
        } else {
            run_git(
                &self.repo,
                &["worktree", "add", "-b", &branch, &dir_str, &base],
            )
        };

        if let Err(e) = added {
            // Drop whatever half-made state the failed add left behind.
            if dir.exists() {
                let _ = std::fs::remove_dir_all(&dir);
            }
            let _ = run_git(&self.repo, &["worktree", "prune"]);
            return Err(e);
        }

        tracing::info!(
            path = %dir.display(),
            branch = %branch,
            base = %base,
            "provisioned worktree"
        );

        Ok(ProvisionedWorktree {
            path: dir,
            branch,
            base_branch: base,
        })
    }

    /// Remove a checkout. Idempotent: a path git no longer knows about is
    /// cleaned off disk and reported as success.
    pub fn discard(&self, path: &Path) -> Result<(), WorktreeError> {
        let _guard = GIT_LOCK.lock().unwrap_or_else(|e| e.into_inner());

        let path_str = path.to_string_lossy();
        match run_git(&self.repo, &["worktree", "remove", "--force", &path_str]) {
            Ok(_) => Ok(()),
            Err(WorktreeError::Git { stderr, .. }) if stderr.contains("is not a working tree") => {
                if path.exists() {
                    let _ = std::fs::remove_dir_all(path);
                }
                Ok(())
            }
            Err(_) if !path.exists() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Drop bookkeeping for checkouts whose directories vanished.
    pub fn prune(&self) -> Result<(), WorktreeError> {
        run_git(&self.repo, &["worktree", "prune"]).map(|_| ())
    }

    /// All checkouts of the repository, the main one included.
    pub fn list(&self) -> Result<Vec<WorktreeListing>, WorktreeError> {
        let raw = run_git(&self.repo, &["worktree", "list", "--porcelain"])?;
        Ok(parse_worktree_list(&raw))
    }

    fn find(&self, path: &Path) -> Result<Option<WorktreeListing>, WorktreeError> {
        let wanted = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        Ok(self.list()?.into_iter().find(|listing| {
            listing
                .path
                .canonicalize()
                .unwrap_or_else(|_| listing.path.clone())
                == wanted
        }))
    }
}

/// Best-effort removal when only the checkout path is known (a workspace
/// row records its own path but not the owning repository). git resolves
/// the shared object store from inside the worktree itself. Returns
/// whether the checkout is gone.
pub fn discard_path(path: &str) -> bool {
    let removed = Command::new("git")
        .args(["-C", path, "worktree", "remove", "--force", path])
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false);
    removed || !Path::new(path).exists()
}

/// Parse `git worktree list --porcelain`: blank-line-separated blocks of
/// `worktree <path>` / `HEAD <sha>` / `branch refs/heads/<name>` lines,
/// with `detached` in place of `branch` for detached checkouts.
fn parse_worktree_list(raw: &str) -> Vec<WorktreeListing> {
    raw.split("\n\n").filter_map(parse_block).collect()
}

fn parse_block(block: &str) -> Option<WorktreeListing> {
    let mut path = None;
    let mut branch = None;
    for line in block.lines() {
        match line.split_once(' ') {
            Some(("worktree", rest)) => path = Some(PathBuf::from(rest)),
            Some(("branch", rest)) => {
                branch = Some(rest.strip_prefix("refs/heads/").unwrap_or(rest).to_string());
            }
            _ => {}
        }
    }
    Some(WorktreeListing {
        path: path?,
        branch,
    })
}
