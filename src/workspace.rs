//! Component D: the workspace manager.
//!
//! Bare-mirror cache + per-story working clone, branch allocation,
//! inode-preserving cleanup, and a network-retry wrapper. Shaped like
//! `FlowGit` (`core/src/flow_git.rs`) elsewhere in this codebase: same
//! `Command::new("git")` plumbing style, generalized from FlowGit's
//! single-repo checkpoint/rollback use case to this crate's
//! mirror-then-clone-then-branch setup sequence.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use crate::error::{WorkspaceError, WorkspaceResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    pub project_root: PathBuf,
    pub mirror_path: PathBuf,
    pub work_dir: PathBuf,
    pub branch_name: String,
    pub story_id: String,
}

/// Classifies a git stderr string as a transient network failure.
///
/// Lowercases the text, then matches any pattern from the network set AND
/// none of the non-network set (auth/permission failures that happen to
/// mention "access").
pub fn is_network_error(stderr: &str) -> bool {
    const NETWORK_PATTERNS: &[&str] = &[
        "could not read from remote",
        "connection refused",
        "connection reset",
        "connection timed out",
        "no route to host",
        "operation timed out",
        "name or service not known",
        "couldn't resolve host",
        "unable to access",
        "network is unreachable",
        "ssh_exchange_identification",
        "broken pipe",
    ];
    const NON_NETWORK_PATTERNS: &[&str] = &[
        "repository not found",
        "authentication failed",
        "permission denied",
        "invalid username",
        "could not find remote branch",
    ];

    let lowered = stderr.to_lowercase();
    let matches_network = NETWORK_PATTERNS.iter().any(|p| lowered.contains(p));
    let matches_non_network = NON_NETWORK_PATTERNS.iter().any(|p| lowered.contains(p));
    matches_network && !matches_non_network
}

/// Wraps an operation with the network-retry policy: delays `{0, 5s, 15s,
/// 30s}` applied to errors classified as network; any other error, or
/// exhaustion of all attempts, surfaces as a distinct result so callers can
/// suspend instead of treating it as fatal.
pub async fn with_network_retry<F>(
    delays: &[Duration],
    mut op: F,
) -> WorkspaceResult<()>
where
    F: FnMut() -> Result<(), String>,
{
    let mut last_error = String::new();
    for (attempt, delay) in delays.iter().enumerate() {
        if attempt > 0 {
            tokio::time::sleep(*delay).await;
        }
        match op() {
            Ok(()) => return Ok(()),
            Err(stderr) => {
                if !is_network_error(&stderr) {
                    return Err(WorkspaceError::GitFailed(stderr));
                }
                last_error = stderr;
            }
        }
    }
    Err(WorkspaceError::NetworkExhausted {
        attempts: delays.len() as u32,
        last_error,
    })
}

fn run_git(dir: &Path, args: &[&str]) -> Result<String, String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .map_err(|e| e.to_string())?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        Err(String::from_utf8_lossy(&output.stderr).to_string())
    }
}

/// Used when `git branch`/`git ls-remote` enumeration itself fails: attempts
/// `git switch -c <candidate>` directly, incrementing the suffix only on an
/// "already exists" error and aborting on anything else.
fn allocate_via_trial_loop(work_dir: &Path, base_name: &str) -> WorkspaceResult<String> {
    let mut candidate = base_name.to_string();
    let mut attempt = 1;
    loop {
        match run_git(work_dir, &["switch", "-c", &candidate]) {
            Ok(_) => return Ok(candidate),
            Err(stderr) if stderr.to_lowercase().contains("already exists") => {
                attempt += 1;
                if attempt > 10 {
                    return Err(WorkspaceError::BranchExhaustion {
                        base: base_name.to_string(),
                        attempts: 10,
                    });
                }
                candidate = format!("{base_name}-{attempt}");
            }
            Err(stderr) => return Err(WorkspaceError::GitFailed(stderr)),
        }
    }
}

pub struct WorkspaceManager {
    project_root: PathBuf,
    mirror_dir: String,
    branch_pattern: String,
    network_retry_delays: Vec<Duration>,
}

impl WorkspaceManager {
    pub fn new(
        project_root: impl Into<PathBuf>,
        mirror_dir: impl Into<String>,
        branch_pattern: impl Into<String>,
        network_retry_delays_secs: &[u64],
    ) -> Self {
        Self {
            project_root: project_root.into(),
            mirror_dir: mirror_dir.into(),
            branch_pattern: branch_pattern.into(),
            network_retry_delays: network_retry_delays_secs
                .iter()
                .map(|s| Duration::from_secs(*s))
                .collect(),
        }
    }

    fn mirror_path_for(&self, repo_name: &str) -> PathBuf {
        self.project_root
            .join(&self.mirror_dir)
            .join(format!("{repo_name}.git"))
    }

    /// Step 1: mirror maintenance. Clone bare if absent; otherwise lock and
    /// `remote update --prune`. Both wrapped in the network-retry policy.
    pub async fn ensure_mirror(&self, repo_url: &str, repo_name: &str) -> WorkspaceResult<PathBuf> {
        let mirror_path = self.mirror_path_for(repo_name);

        if !mirror_path.exists() {
            if let Some(parent) = mirror_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let url = repo_url.to_string();
            let dest = mirror_path.clone();
            with_network_retry(&self.network_retry_delays, move || {
                run_git(
                    Path::new("."),
                    &["clone", "--bare", &url, dest.to_str().unwrap()],
                )
                .map(|_| ())
            })
            .await?;
        } else {
            let lock_path = mirror_path.join(".update.lock");
            let _guard = advisory_lock(&lock_path)?;
            let mirror = mirror_path.clone();
            with_network_retry(&self.network_retry_delays, move || {
                run_git(&mirror, &["remote", "update", "--prune"]).map(|_| ())
            })
            .await?;
        }

        Ok(mirror_path)
    }

    /// Step 2: working clone via init-and-fetch. Never `git clone` into
    /// `work_dir` — its inode must survive story turnovers so container bind
    /// mounts stay valid.
    pub fn setup_working_clone(
        &self,
        work_dir: &Path,
        mirror_path: &Path,
        base_branch: &str,
        repo_url: &str,
    ) -> WorkspaceResult<()> {
        clear_dir_contents(work_dir)?;

        run_git(work_dir, &["init"]).map_err(WorkspaceError::GitFailed)?;
        run_git(
            work_dir,
            &["remote", "add", "origin", mirror_path.to_str().unwrap()],
        )
        .map_err(WorkspaceError::GitFailed)?;
        run_git(work_dir, &["fetch", "origin", "--tags"]).map_err(WorkspaceError::GitFailed)?;
        run_git(
            work_dir,
            &[
                "checkout",
                "-b",
                base_branch,
                &format!("origin/{base_branch}"),
            ],
        )
        .map_err(WorkspaceError::GitFailed)?;
        run_git(work_dir, &["remote", "add", "github", repo_url])
            .map_err(WorkspaceError::GitFailed)?;

        Ok(())
    }

    /// Step 3: identity, with `{AGENT_ID}` template substitution.
    pub fn set_identity(&self, work_dir: &Path, agent_id: &str) -> WorkspaceResult<()> {
        let name = format!("coder-agent-{agent_id}");
        let email = format!("{agent_id}@coder-agents.local");
        run_git(work_dir, &["config", "user.name", &name]).map_err(WorkspaceError::GitFailed)?;
        run_git(work_dir, &["config", "user.email", &email]).map_err(WorkspaceError::GitFailed)?;
        Ok(())
    }

    /// Step 4: branch allocation with collision resolution, appending
    /// `-2`, `-3`, ... up to 10 attempts before failing.
    ///
    /// If enumerating existing branches fails outright (a corrupt mirror,
    /// an unreachable `ls-remote`), falls back to a blind trial loop:
    /// attempt `git switch -c <name>` directly, incrementing the suffix
    /// only when git reports the branch already exists, and aborting on
    /// any other git error.
    pub fn allocate_branch(
        &self,
        work_dir: &Path,
        mirror_path: &Path,
        agent_id: &str,
        story_id: &str,
    ) -> WorkspaceResult<String> {
        let base_name = self
            .branch_pattern
            .replace("{AGENT_ID}", agent_id)
            .replace("{STORY_ID}", story_id);

        match (
            run_git(work_dir, &["branch"]),
            run_git(work_dir, &["ls-remote", "--heads", mirror_path.to_str().unwrap()]),
        ) {
            (Ok(local), Ok(remote)) => self.allocate_via_enumeration(work_dir, &base_name, &local, &remote),
            _ => allocate_via_trial_loop(work_dir, &base_name),
        }
    }

    fn allocate_via_enumeration(
        &self,
        work_dir: &Path,
        base_name: &str,
        local_branches: &str,
        remote_refs: &str,
    ) -> WorkspaceResult<String> {
        let exists = |name: &str| -> bool {
            local_branches.lines().any(|l| l.trim_start_matches("* ").trim() == name)
                || remote_refs.contains(&format!("refs/heads/{name}"))
        };

        let mut candidate = base_name.to_string();
        let mut attempt = 1;
        while exists(&candidate) {
            attempt += 1;
            if attempt > 10 {
                return Err(WorkspaceError::BranchExhaustion {
                    base: base_name.to_string(),
                    attempts: 10,
                });
            }
            candidate = format!("{base_name}-{attempt}");
        }

        run_git(work_dir, &["switch", "-c", &candidate]).map_err(WorkspaceError::GitFailed)?;
        Ok(candidate)
    }

    /// Full SETUP sequence, in order.
    pub async fn setup_workspace(
        &self,
        repo_url: &str,
        repo_name: &str,
        base_branch: &str,
        work_dir: &Path,
        agent_id: &str,
        story_id: &str,
    ) -> WorkspaceResult<Workspace> {
        let mirror_path = self.ensure_mirror(repo_url, repo_name).await?;
        self.setup_working_clone(work_dir, &mirror_path, base_branch, repo_url)?;
        self.set_identity(work_dir, agent_id)?;
        let branch_name = self.allocate_branch(work_dir, &mirror_path, agent_id, story_id)?;

        Ok(Workspace {
            project_root: self.project_root.clone(),
            mirror_path,
            work_dir: work_dir.to_path_buf(),
            branch_name,
            story_id: story_id.to_string(),
        })
    }
}

/// Empties `work_dir`'s contents in place without unlinking the directory
/// itself, preserving its inode across story turnovers.
pub fn clear_dir_contents(work_dir: &Path) -> WorkspaceResult<()> {
    std::fs::create_dir_all(work_dir)?;
    for entry in std::fs::read_dir(work_dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            std::fs::remove_dir_all(&path)?;
        } else {
            std::fs::remove_file(&path)?;
        }
    }
    Ok(())
}

/// `cleanup_workspace` (inode-preserving) followed by `cleanup_agent_resources`
/// semantics: errors are aggregated and reported, the sequence does not
/// short-circuit.
pub fn cleanup_agent_resources(work_dir: &Path, agent_state_dir: &Path) -> Vec<WorkspaceError> {
    let mut errors = Vec::new();

    if let Err(e) = clear_dir_contents(work_dir) {
        errors.push(e);
    }
    if agent_state_dir.exists() {
        if let Err(e) = std::fs::remove_dir_all(agent_state_dir) {
            errors.push(WorkspaceError::Io(e));
        }
    }

    errors
}

struct AdvisoryLockGuard {
    lock_path: PathBuf,
}

impl Drop for AdvisoryLockGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.lock_path);
    }
}

/// A simple exclusive advisory lock via lock-file creation. Production
/// deployments under heavy multi-agent contention would use `flock(2)`
/// through a crate like `fs2`; this is the minimal primitive actually
/// needed here (an indefinite-wait exclusive lock around `remote update`).
fn advisory_lock(lock_path: &Path) -> WorkspaceResult<AdvisoryLockGuard> {
    use std::fs::OpenOptions;
    loop {
        match OpenOptions::new().create_new(true).write(true).open(lock_path) {
            Ok(_) => {
                return Ok(AdvisoryLockGuard {
                    lock_path: lock_path.to_path_buf(),
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(e) => return Err(WorkspaceError::Io(e)),
        }
    }
}
