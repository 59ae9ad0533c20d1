//! External collaborator contracts (§6).
//!
//! These traits are the seams the Command Builder calls through; concrete
//! implementations (the real VCS client, the git-clone-backed working-dir
//! provider, the plan-storage discovery API, the comment renderer) live
//! outside this crate. Modeled on
//! `prodigy::abstractions::git::GitOperations`: `async_trait` + `anyhow`
//! for the same reason the teacher uses it there — these are I/O-bound
//! collaborators the core only ever calls through a trait object.

use crate::config::model::{PullRequest, Repo};
use anyhow::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::Span;

/// Fetches the list of files changed by a pull request.
#[async_trait]
pub trait VcsClient: Send + Sync {
    async fn get_modified_files(&self, base_repo: &Repo, pull: &PullRequest) -> Result<Vec<String>>;
}

/// Manages the on-disk checkout backing a PR's plan/apply work.
#[async_trait]
pub trait WorkingDir: Send + Sync {
    /// Clone (or fetch + checkout) the PR head into a workspace-specific
    /// directory, returning its absolute path. `logger` is the span the
    /// caller wants clone-related log lines attributed to (§6).
    async fn clone(
        &self,
        logger: &Span,
        base_repo: &Repo,
        head_repo: &Repo,
        pull: &PullRequest,
        workspace: &str,
    ) -> Result<PathBuf>;

    /// Look up the absolute path of an already-cloned workspace directory,
    /// without cloning. Used by apply, which must not re-clone (§4.5).
    async fn get_working_dir(&self, base_repo: &Repo, pull: &PullRequest, workspace: &str) -> Result<PathBuf>;

    /// The PR-wide root directory under which every workspace's checkout
    /// lives, used by apply-all to enumerate pending plans.
    async fn get_pull_dir(&self, base_repo: &Repo, pull: &PullRequest) -> Result<PathBuf>;
}

/// One plan discovered by [`PendingPlanFinder::find`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingPlan {
    pub repo_dir: PathBuf,
    pub repo_rel_dir: String,
    pub workspace: String,
}

/// Discovers plans already written to disk under a PR's working directory,
/// for apply-all (§4.5). The plan-storage layer's own persistence format is
/// out of scope (§1); only this discovery surface is consumed.
#[async_trait]
pub trait PendingPlanFinder: Send + Sync {
    async fn find(&self, pull_dir: &Path) -> Result<Vec<PendingPlan>>;
}

/// Renders the copy-pasteable comment strings a user can re-issue to repeat
/// a command (§4.5's `replan_comment_text`/`reapply_comment_text`).
pub trait CommentBuilder: Send + Sync {
    fn build_plan_comment(&self, dir: &str, workspace: &str, name: Option<&str>, args: &[String]) -> String;
    fn build_apply_comment(&self, dir: &str, workspace: &str, name: Option<&str>) -> String;
}

/// The default [`CommentBuilder`]: renders `atlantis plan/apply` commands
/// the way the real command-comment parser expects to read them back.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultCommentBuilder;

impl CommentBuilder for DefaultCommentBuilder {
    fn build_plan_comment(&self, dir: &str, workspace: &str, name: Option<&str>, args: &[String]) -> String {
        render_comment("plan", dir, workspace, name, args)
    }

    fn build_apply_comment(&self, dir: &str, workspace: &str, name: Option<&str>) -> String {
        render_comment("apply", dir, workspace, name, &[])
    }
}

fn render_comment(verb: &str, dir: &str, workspace: &str, name: Option<&str>, args: &[String]) -> String {
    let mut out = format!("atlantis {verb}");
    if let Some(name) = name {
        out.push_str(" -p ");
        out.push_str(name);
    } else {
        out.push_str(" -d ");
        out.push_str(dir);
        out.push_str(" -w ");
        out.push_str(workspace);
    }
    for arg in args {
        out.push(' ');
        out.push_str(arg);
    }
    out
}
