//! Top-level orchestrator: turns an incoming command event into a vector of
//! fully-resolved [`ProjectCommandContext`]s (§4.5).
//!
//! Mirrors the coordinator role `prodigy::cook::orchestrator` plays in the
//! teacher crate — the piece that calls, in sequence, into config loading,
//! matching, and execution-context assembly, and nothing else.

use crate::config::merger;
use crate::config::model::{
    Autoplan, CommandKind, MergedProjectConfig, Project, ProjectCommandContext, PullRequest,
    Repo, RepoConfig,
};
use crate::config::{parser, validator};
use crate::error::AtlantisError;
use crate::lock::registry::WorkingDirLockRegistry;
use crate::project::finder;
use crate::vcs::{CommentBuilder, PendingPlanFinder, VcsClient, WorkingDir};
use crate::workflow::step;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// How an explicit plan/apply command names its target project.
#[derive(Debug, Clone)]
pub enum ProjectSelector {
    /// `-p <name>`.
    Name(String),
    /// `-d <dir> -w <workspace>`.
    DirWorkspace { dir: String, workspace: String },
    /// No selector given: act on every project like autoplan, but without
    /// filtering on `autoplan.enabled` (§4.5 "Explicit plan command").
    Unfiltered,
}

/// What an explicit apply command targets.
#[derive(Debug, Clone)]
pub enum ApplyTarget {
    Project(ProjectSelector),
    All,
}

/// Ties the Config Merger, Project Finder, Lock Registry and Step
/// Materializer together behind the four entry points described in §4.5.
pub struct CommandBuilder {
    server_config: crate::config::model::ServerConfig,
    vcs: Arc<dyn VcsClient>,
    working_dir: Arc<dyn WorkingDir>,
    pending_plan_finder: Arc<dyn PendingPlanFinder>,
    comment_builder: Arc<dyn CommentBuilder>,
    locks: WorkingDirLockRegistry,
}

impl CommandBuilder {
    pub fn new(
        server_config: crate::config::model::ServerConfig,
        vcs: Arc<dyn VcsClient>,
        working_dir: Arc<dyn WorkingDir>,
        pending_plan_finder: Arc<dyn PendingPlanFinder>,
        comment_builder: Arc<dyn CommentBuilder>,
    ) -> Self {
        Self {
            server_config,
            vcs,
            working_dir,
            pending_plan_finder,
            comment_builder,
            locks: WorkingDirLockRegistry::new(),
        }
    }

    /// Autoplan: triggered by a new commit (§4.5 "Autoplan").
    pub async fn run_autoplan(
        &self,
        base_repo: &Repo,
        head_repo: &Repo,
        pull: &PullRequest,
        user: &str,
    ) -> Result<Vec<ProjectCommandContext>, AtlantisError> {
        let lock = self.locks.try_lock(&base_repo.full_name(), pull.num, "default")?;
        let contexts = self
            .plan_all(base_repo, head_repo, pull, user, true, &[], false)
            .await?;
        lock.unlock();
        Ok(contexts)
    }

    /// Explicit `plan` command: either targets one project, or (with no
    /// selector) behaves like autoplan but without the `autoplan.enabled`
    /// filter, carrying the comment's extra args and verbosity through
    /// (§4.5 "Explicit plan command").
    pub async fn run_plan(
        &self,
        base_repo: &Repo,
        head_repo: &Repo,
        pull: &PullRequest,
        user: &str,
        selector: ProjectSelector,
        comment_args: &[String],
        verbose: bool,
    ) -> Result<Vec<ProjectCommandContext>, AtlantisError> {
        match selector {
            ProjectSelector::Unfiltered => {
                let lock = self.locks.try_lock(&base_repo.full_name(), pull.num, "default")?;
                let contexts = self
                    .plan_all(base_repo, head_repo, pull, user, false, comment_args, verbose)
                    .await?;
                lock.unlock();
                Ok(contexts)
            }
            selector => {
                let span = command_span(base_repo, pull);
                let default_dir = self
                    .working_dir
                    .clone(&span, base_repo, head_repo, pull, "default")
                    .await
                    .map_err(AtlantisError::CloneFailure)?;
                let repo_config = self.read_repo_config(&default_dir).await?;
                let (dir, workspace, name) = identify_project(&selector, repo_config.as_ref())?;
                check_workspace_allowed(repo_config.as_ref(), &dir, &workspace)?;

                let lock = self.locks.try_lock(&base_repo.full_name(), pull.num, &workspace)?;
                let project_dir = if workspace != "default" {
                    self.working_dir
                        .clone(&span, base_repo, head_repo, pull, &workspace)
                        .await
                        .map_err(AtlantisError::CloneFailure)?
                } else {
                    default_dir.clone()
                };

                let project = project_for(&dir, &workspace, name.as_deref(), repo_config.as_ref());
                let merged = merger::merge_project(
                    &self.server_config,
                    &base_repo.full_name(),
                    repo_config.as_ref(),
                    &project,
                )?;
                let ctx = self.build_context(
                    CommandKind::Plan,
                    base_repo,
                    head_repo,
                    pull,
                    user,
                    &merged,
                    repo_config.as_ref(),
                    &project_dir,
                    comment_args,
                    verbose,
                )?;
                lock.unlock();
                Ok(vec![ctx])
            }
        }
    }

    /// Explicit `apply` command: one project (using the already-cloned
    /// working dir, never re-cloning) or apply-all (§4.5 "Explicit apply
    /// command").
    pub async fn run_apply(
        &self,
        base_repo: &Repo,
        head_repo: &Repo,
        pull: &PullRequest,
        user: &str,
        target: ApplyTarget,
    ) -> Result<Vec<ProjectCommandContext>, AtlantisError> {
        match target {
            ApplyTarget::Project(selector) => {
                let default_dir = self
                    .working_dir
                    .get_working_dir(base_repo, pull, "default")
                    .await
                    .map_err(AtlantisError::CloneFailure)?;
                let repo_config = self.read_repo_config(&default_dir).await?;
                let (dir, workspace, name) = identify_project(&selector, repo_config.as_ref())?;
                check_workspace_allowed(repo_config.as_ref(), &dir, &workspace)?;

                let lock = self.locks.try_lock(&base_repo.full_name(), pull.num, &workspace)?;
                let project_dir = self
                    .working_dir
                    .get_working_dir(base_repo, pull, &workspace)
                    .await
                    .map_err(AtlantisError::CloneFailure)?;

                let project = project_for(&dir, &workspace, name.as_deref(), repo_config.as_ref());
                let merged = merger::merge_project(
                    &self.server_config,
                    &base_repo.full_name(),
                    repo_config.as_ref(),
                    &project,
                )?;
                let ctx = self.build_context(
                    CommandKind::Apply,
                    base_repo,
                    head_repo,
                    pull,
                    user,
                    &merged,
                    repo_config.as_ref(),
                    &project_dir,
                    &[],
                    false,
                )?;
                lock.unlock();
                Ok(vec![ctx])
            }
            ApplyTarget::All => {
                let pull_lock = self.locks.try_lock_pull(&base_repo.full_name(), pull.num)?;
                let pull_dir = self
                    .working_dir
                    .get_pull_dir(base_repo, pull)
                    .await
                    .map_err(AtlantisError::CloneFailure)?;
                let pending = self
                    .pending_plan_finder
                    .find(&pull_dir)
                    .await
                    .map_err(AtlantisError::VcsFailure)?;

                let repo_config = match self.working_dir.get_working_dir(base_repo, pull, "default").await {
                    Ok(dir) => self.read_repo_config(&dir).await?,
                    Err(_) => None,
                };

                let mut contexts = Vec::with_capacity(pending.len());
                for plan in pending {
                    let project =
                        project_for(&plan.repo_rel_dir, &plan.workspace, None, repo_config.as_ref());
                    let merged = merger::merge_project(
                        &self.server_config,
                        &base_repo.full_name(),
                        repo_config.as_ref(),
                        &project,
                    )?;
                    contexts.push(self.build_context(
                        CommandKind::Apply,
                        base_repo,
                        head_repo,
                        pull,
                        user,
                        &merged,
                        repo_config.as_ref(),
                        &plan.repo_dir,
                        &[],
                        false,
                    )?);
                }
                pull_lock.unlock();
                Ok(contexts)
            }
        }
    }

    /// Shared by autoplan and the unfiltered explicit-plan path: clone the
    /// `default` workspace, read `atlantis.yaml` if present, and match
    /// projects either by config-declared globs or by walking the tree.
    async fn plan_all(
        &self,
        base_repo: &Repo,
        head_repo: &Repo,
        pull: &PullRequest,
        user: &str,
        filter_autoplan: bool,
        comment_args: &[String],
        verbose: bool,
    ) -> Result<Vec<ProjectCommandContext>, AtlantisError> {
        let modified_files = self
            .vcs
            .get_modified_files(base_repo, pull)
            .await
            .map_err(AtlantisError::VcsFailure)?;
        let dir = self
            .working_dir
            .clone(&command_span(base_repo, pull), base_repo, head_repo, pull, "default")
            .await
            .map_err(AtlantisError::CloneFailure)?;
        let repo_config = self.read_repo_config(&dir).await?;

        let mut contexts = Vec::new();
        match &repo_config {
            Some(rc) => {
                for project in finder::find_by_config(&modified_files, rc) {
                    let merged = merger::merge_project(
                        &self.server_config,
                        &base_repo.full_name(),
                        Some(rc),
                        project,
                    )?;
                    if filter_autoplan && !merged.autoplan.enabled {
                        debug!(dir = %project.dir, "skipping project with autoplan disabled");
                        continue;
                    }
                    contexts.push(self.build_context(
                        CommandKind::Plan,
                        base_repo,
                        head_repo,
                        pull,
                        user,
                        &merged,
                        Some(rc),
                        &dir,
                        comment_args,
                        verbose,
                    )?);
                }
            }
            None => {
                for tree_project in finder::find_by_tree(&modified_files, &dir) {
                    let project = Project {
                        dir: tree_project.path,
                        workspace: Project::default_workspace(),
                        name: None,
                        terraform_version: None,
                        workflow: None,
                        apply_requirements: None,
                        autoplan: Autoplan::default(),
                    };
                    let merged = merger::merge_project(
                        &self.server_config,
                        &base_repo.full_name(),
                        None,
                        &project,
                    )?;
                    contexts.push(self.build_context(
                        CommandKind::Plan,
                        base_repo,
                        head_repo,
                        pull,
                        user,
                        &merged,
                        None,
                        &dir,
                        comment_args,
                        verbose,
                    )?);
                }
            }
        }
        Ok(contexts)
    }

    async fn read_repo_config(&self, dir: &Path) -> Result<Option<RepoConfig>, AtlantisError> {
        let path = dir.join("atlantis.yaml");
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let raw = parser::parse_repo_config_raw(&bytes)?;
                Ok(Some(validator::validate_repo_config(raw)?))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(AtlantisError::CloneFailure(anyhow::Error::new(e))),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn build_context(
        &self,
        kind: CommandKind,
        base_repo: &Repo,
        head_repo: &Repo,
        pull: &PullRequest,
        user: &str,
        merged: &MergedProjectConfig,
        repo_config: Option<&RepoConfig>,
        dir: &Path,
        comment_args: &[String],
        verbose: bool,
    ) -> Result<ProjectCommandContext, AtlantisError> {
        let declarations = step::stage_for(kind, &merged.workflow);
        let replan_comment_text = self.comment_builder.build_plan_comment(
            &merged.dir,
            &merged.workspace,
            merged.name.as_deref(),
            comment_args,
        );
        let reapply_comment_text = self.comment_builder.build_apply_comment(
            &merged.dir,
            &merged.workspace,
            merged.name.as_deref(),
        );
        let mut ctx = ProjectCommandContext {
            base_repo: base_repo.clone(),
            head_repo: head_repo.clone(),
            pull: pull.clone(),
            user: user.to_string(),
            command_kind: kind,
            project_name: merged.name.clone(),
            dir: merged.dir.clone(),
            workspace: merged.workspace.clone(),
            terraform_version: merged.terraform_version.clone(),
            steps: Vec::new(),
            apply_requirements: merged.apply_requirements.clone(),
            autoplan_enabled: merged.autoplan.enabled,
            automerge_enabled: repo_config.map(|rc| rc.automerge).unwrap_or(false),
            comment_args: comment_args.to_vec(),
            verbose,
            logger: tracing::info_span!("project_command", repo = %base_repo.full_name(), pull = pull.num, dir = %merged.dir, workspace = %merged.workspace),
            pull_mergeable: pull.mergeable,
            replan_comment_text,
            reapply_comment_text,
        };
        ctx.steps = step::materialize_stage(&declarations, &ctx, dir)?;
        Ok(ctx)
    }
}

/// The span passed to `WorkingDir::clone` (§6), identifying the command
/// before a project/workspace is known.
fn command_span(base_repo: &Repo, pull: &PullRequest) -> tracing::Span {
    tracing::info_span!("clone", repo = %base_repo.full_name(), pull = pull.num)
}

/// §4.5 "Project identification".
fn identify_project(
    selector: &ProjectSelector,
    repo_config: Option<&RepoConfig>,
) -> Result<(String, String, Option<String>), AtlantisError> {
    match selector {
        ProjectSelector::Unfiltered => {
            unreachable!("Unfiltered is handled by the whole-repo path before this is called")
        }
        ProjectSelector::Name(name) => {
            let rc = repo_config.ok_or_else(|| AtlantisError::UnknownProject(name.clone()))?;
            let project = rc
                .projects
                .iter()
                .find(|p| p.name.as_deref() == Some(name.as_str()))
                .ok_or_else(|| AtlantisError::UnknownProject(name.clone()))?;
            Ok((project.dir.clone(), project.workspace.clone(), project.name.clone()))
        }
        ProjectSelector::DirWorkspace { dir, workspace } => match repo_config {
            None => Ok((dir.clone(), workspace.clone(), None)),
            Some(rc) => {
                let matches: Vec<&Project> = rc
                    .projects
                    .iter()
                    .filter(|p| &p.dir == dir && &p.workspace == workspace)
                    .collect();
                match matches.len() {
                    0 => Ok((dir.clone(), workspace.clone(), None)),
                    1 => {
                        let p = matches[0];
                        Ok((p.dir.clone(), p.workspace.clone(), p.name.clone()))
                    }
                    _ => Err(AtlantisError::ProjectAmbiguity {
                        dir: dir.clone(),
                        workspace: workspace.clone(),
                    }),
                }
            }
        },
    }
}

/// §4.5 "Workspace-allowed check".
fn check_workspace_allowed(
    repo_config: Option<&RepoConfig>,
    dir: &str,
    workspace: &str,
) -> Result<(), AtlantisError> {
    let Some(rc) = repo_config else { return Ok(()) };
    let at_dir: Vec<&Project> = rc.projects.iter().filter(|p| p.dir == dir).collect();
    if at_dir.is_empty() {
        return Ok(());
    }
    if at_dir.iter().any(|p| p.workspace == workspace) {
        return Ok(());
    }
    let mut allowed: Vec<&str> = at_dir.iter().map(|p| p.workspace.as_str()).collect();
    allowed.sort_unstable();
    allowed.dedup();
    Err(AtlantisError::WorkspaceNotAllowed {
        workspace: workspace.to_string(),
        allowed: allowed.join(", "),
    })
}

fn project_for(
    dir: &str,
    workspace: &str,
    name: Option<&str>,
    repo_config: Option<&RepoConfig>,
) -> Project {
    if let Some(rc) = repo_config {
        if let Some(p) = rc.projects.iter().find(|p| p.dir == dir && p.workspace == workspace) {
            return p.clone();
        }
    }
    Project {
        dir: dir.to_string(),
        workspace: workspace.to_string(),
        name: name.map(|s| s.to_string()),
        terraform_version: None,
        workflow: None,
        apply_requirements: None,
        autoplan: Autoplan::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::model::ServerConfig;
    use crate::vcs::{DefaultCommentBuilder, PendingPlan};
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct FakeVcs {
        modified_files: Vec<String>,
    }

    #[async_trait]
    impl VcsClient for FakeVcs {
        async fn get_modified_files(&self, _base_repo: &Repo, _pull: &PullRequest) -> anyhow::Result<Vec<String>> {
            Ok(self.modified_files.clone())
        }
    }

    struct FakeWorkingDir {
        root: PathBuf,
    }

    #[async_trait]
    impl WorkingDir for FakeWorkingDir {
        async fn clone(&self, _logger: &tracing::Span, _base_repo: &Repo, _head_repo: &Repo, _pull: &PullRequest, _workspace: &str) -> anyhow::Result<PathBuf> {
            Ok(self.root.clone())
        }
        async fn get_working_dir(&self, _base_repo: &Repo, _pull: &PullRequest, _workspace: &str) -> anyhow::Result<PathBuf> {
            Ok(self.root.clone())
        }
        async fn get_pull_dir(&self, _base_repo: &Repo, _pull: &PullRequest) -> anyhow::Result<PathBuf> {
            Ok(self.root.clone())
        }
    }

    struct FakePendingPlanFinder {
        plans: Mutex<Vec<PendingPlan>>,
    }

    #[async_trait]
    impl PendingPlanFinder for FakePendingPlanFinder {
        async fn find(&self, _pull_dir: &Path) -> anyhow::Result<Vec<PendingPlan>> {
            Ok(self.plans.lock().unwrap().clone())
        }
    }

    fn repo() -> Repo {
        Repo { owner: "acme".to_string(), name: "infra".to_string() }
    }

    fn pull() -> PullRequest {
        PullRequest {
            num: 7,
            author: "alice".to_string(),
            head_branch: "feature".to_string(),
            base_branch: "main".to_string(),
            mergeable: true,
        }
    }

    fn builder(
        root: PathBuf,
        modified_files: Vec<String>,
        pending: Vec<PendingPlan>,
    ) -> CommandBuilder {
        CommandBuilder::new(
            ServerConfig::empty(),
            Arc::new(FakeVcs { modified_files }),
            Arc::new(FakeWorkingDir { root }),
            Arc::new(FakePendingPlanFinder { plans: Mutex::new(pending) }),
            Arc::new(DefaultCommentBuilder),
        )
    }

    #[tokio::test]
    async fn scenario_1_empty_repo_config_single_tf_change() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("a")).unwrap();
        std::fs::write(tmp.path().join("a/main.tf"), "").unwrap();
        let b = builder(tmp.path().to_path_buf(), vec!["a/main.tf".to_string()], vec![]);

        let contexts = b.run_autoplan(&repo(), &repo(), &pull(), "alice").await.unwrap();
        assert_eq!(contexts.len(), 1);
        assert_eq!(contexts[0].dir, "a");
        assert_eq!(contexts[0].workspace, "default");
        assert_eq!(contexts[0].steps.len(), 2);
    }

    #[tokio::test]
    async fn scenario_2_autoplan_glob_miss_yields_no_contexts() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join("atlantis.yaml"),
            "version: 2\nprojects:\n- dir: a\n  autoplan:\n    when_modified: [\"*.tf\"]\n",
        )
        .unwrap();
        let b = builder(tmp.path().to_path_buf(), vec!["b/main.tf".to_string()], vec![]);

        let contexts = b.run_autoplan(&repo(), &repo(), &pull(), "alice").await.unwrap();
        assert!(contexts.is_empty());
    }

    #[tokio::test]
    async fn scenario_3_two_named_projects_same_dir_workspace_selected_by_name() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join("atlantis.yaml"),
            "version: 2\nprojects:\n- dir: .\n  name: myname\n- dir: .\n  name: myname2\n",
        )
        .unwrap();
        let b = builder(tmp.path().to_path_buf(), vec![], vec![]);

        let contexts = b
            .run_plan(
                &repo(),
                &repo(),
                &pull(),
                "alice",
                ProjectSelector::Name("myname".to_string()),
                &[],
                false,
            )
            .await
            .unwrap();
        assert_eq!(contexts.len(), 1);
        assert_eq!(contexts[0].project_name.as_deref(), Some("myname"));
    }

    #[tokio::test]
    async fn unknown_project_name_is_an_error() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("atlantis.yaml"), "version: 2\nprojects: []\n").unwrap();
        let b = builder(tmp.path().to_path_buf(), vec![], vec![]);

        let err = b
            .run_plan(
                &repo(),
                &repo(),
                &pull(),
                "alice",
                ProjectSelector::Name("nope".to_string()),
                &[],
                false,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AtlantisError::UnknownProject(_)));
    }

    #[tokio::test]
    async fn workspace_not_configured_is_rejected() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join("atlantis.yaml"),
            "version: 2\nprojects:\n- dir: a\n  workspace: staging\n",
        )
        .unwrap();
        let b = builder(tmp.path().to_path_buf(), vec![], vec![]);

        let err = b
            .run_plan(
                &repo(),
                &repo(),
                &pull(),
                "alice",
                ProjectSelector::DirWorkspace { dir: "a".to_string(), workspace: "default".to_string() },
                &[],
                false,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AtlantisError::WorkspaceNotAllowed { .. }));
    }

    #[tokio::test]
    async fn apply_all_builds_one_context_per_pending_plan() {
        let tmp = TempDir::new().unwrap();
        let pending = vec![
            PendingPlan { repo_dir: tmp.path().to_path_buf(), repo_rel_dir: "a".to_string(), workspace: "default".to_string() },
            PendingPlan { repo_dir: tmp.path().to_path_buf(), repo_rel_dir: "b".to_string(), workspace: "default".to_string() },
        ];
        let b = builder(tmp.path().to_path_buf(), vec![], pending);

        let contexts = b
            .run_apply(&repo(), &repo(), &pull(), "alice", ApplyTarget::All)
            .await
            .unwrap();
        assert_eq!(contexts.len(), 2);
        assert!(contexts.iter().all(|c| c.command_kind == CommandKind::Apply));
    }

    #[tokio::test]
    async fn autoplan_lock_contention_surfaces_lock_held() {
        let tmp = TempDir::new().unwrap();
        let b = builder(tmp.path().to_path_buf(), vec![], vec![]);
        let held = b.locks.try_lock(&repo().full_name(), pull().num, "default").unwrap();
        let err = b.run_autoplan(&repo(), &repo(), &pull(), "alice").await.unwrap_err();
        assert!(matches!(err, AtlantisError::LockHeld));
        drop(held);
    }
}
