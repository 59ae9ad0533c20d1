//! Canonical validated data model for server and repo configuration.
//!
//! Types here are never constructed directly from YAML — `config::parser`
//! deserializes into raw mirror structs and `config::validator` lifts those
//! into these, which is where `..`-checking, SemVer parsing, regex
//! compilation and name-uniqueness live. Once built, a value of any type in
//! this module is known-valid.

use crate::workflow::step::MaterializedStep;
use regex::Regex;
use semver::Version;
use std::collections::HashMap;
use tracing::Span;

/// One of the two `apply_requirements` a project or policy can demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApplyRequirement {
    Approved,
    Mergeable,
}

impl ApplyRequirement {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApplyRequirement::Approved => "approved",
            ApplyRequirement::Mergeable => "mergeable",
        }
    }
}

/// A key a server `RepoPolicy` may let `atlantis.yaml` override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OverridableKey {
    ApplyRequirements,
    Workflow,
}

impl OverridableKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            OverridableKey::ApplyRequirements => "apply_requirements",
            OverridableKey::Workflow => "workflow",
        }
    }
}

/// A repo-id matcher: either a literal id or an anchored `/regex/`.
///
/// The source contains a matcher that unconditionally returns true for any
/// pattern; that is a known defect in the upstream behavior, not something
/// this crate replicates (see DESIGN.md). Here a literal pattern matches
/// only an exact repo id, and a `/regex/` pattern is matched with the
/// compiled regex, anchored by the caller's pattern text.
#[derive(Debug, Clone)]
pub enum RepoIdPattern {
    Exact(String),
    Regex { raw: String, compiled: Regex },
}

impl RepoIdPattern {
    pub fn matches(&self, repo_id: &str) -> bool {
        match self {
            RepoIdPattern::Exact(s) => s == repo_id,
            RepoIdPattern::Regex { compiled, .. } => compiled.is_match(repo_id),
        }
    }

    pub fn raw(&self) -> &str {
        match self {
            RepoIdPattern::Exact(s) => s,
            RepoIdPattern::Regex { raw, .. } => raw,
        }
    }
}

/// A single server-side repo policy record (§3 RepoPolicy).
#[derive(Debug, Clone)]
pub struct RepoPolicy {
    pub id_pattern: RepoIdPattern,
    pub apply_requirements: Option<Vec<ApplyRequirement>>,
    pub workflow: Option<String>,
    pub allowed_overrides: Vec<OverridableKey>,
    pub allow_custom_workflows: bool,
}

/// Effective policy for one repo id, after folding every matching
/// `RepoPolicy` in declaration order with last-match-wins semantics.
#[derive(Debug, Clone, Default)]
pub struct EffectivePolicy {
    pub apply_requirements: Option<Vec<ApplyRequirement>>,
    pub workflow: Option<String>,
    pub allowed_overrides: Vec<OverridableKey>,
    pub allow_custom_workflows: bool,
}

/// A single workflow step declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Init { extra_args: Vec<String> },
    Plan { extra_args: Vec<String> },
    Apply { extra_args: Vec<String> },
    Run { argv: Vec<String> },
}

/// An ordered `plan`/`apply` pair of step sequences.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workflow {
    pub plan: Vec<Step>,
    pub apply: Vec<Step>,
}

impl Workflow {
    /// `{plan:[Init,Plan], apply:[Apply]}`, used whenever no workflow is
    /// selected by either tier of config (§4.2).
    pub fn default_workflow() -> Self {
        Workflow {
            plan: vec![
                Step::Init {
                    extra_args: Vec::new(),
                },
                Step::Plan {
                    extra_args: Vec::new(),
                },
            ],
            apply: vec![Step::Apply {
                extra_args: Vec::new(),
            }],
        }
    }
}

/// Autoplan settings for a project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Autoplan {
    pub enabled: bool,
    pub when_modified: Vec<String>,
}

impl Default for Autoplan {
    fn default() -> Self {
        Autoplan {
            enabled: true,
            when_modified: vec!["**/*.tf*".to_string()],
        }
    }
}

/// A single project declaration (§3 Project).
#[derive(Debug, Clone)]
pub struct Project {
    pub dir: String,
    pub workspace: String,
    pub name: Option<String>,
    pub terraform_version: Option<Version>,
    pub workflow: Option<String>,
    pub apply_requirements: Option<Vec<ApplyRequirement>>,
    pub autoplan: Autoplan,
}

impl Project {
    pub fn default_workspace() -> String {
        "default".to_string()
    }
}

/// The in-repo user configuration file, `atlantis.yaml`.
#[derive(Debug, Clone)]
pub struct RepoConfig {
    pub version: u32,
    pub automerge: bool,
    pub projects: Vec<Project>,
    pub workflows: HashMap<String, Workflow>,
}

/// The server-side repo-policy file.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub repos: Vec<RepoPolicy>,
    pub workflows: HashMap<String, Workflow>,
}

impl ServerConfig {
    pub fn empty() -> Self {
        ServerConfig {
            repos: Vec::new(),
            workflows: HashMap::new(),
        }
    }
}

/// The fully-resolved per-project record emitted by the Config Merger.
#[derive(Debug, Clone)]
pub struct MergedProjectConfig {
    pub dir: String,
    pub workspace: String,
    pub name: Option<String>,
    pub workflow: Workflow,
    pub terraform_version: Option<Version>,
    pub apply_requirements: Vec<ApplyRequirement>,
    pub autoplan: Autoplan,
}

/// Which half of a workflow (`plan` or `apply`) a command runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Plan,
    Apply,
}

/// A VCS repository reference, as handed to us by the (external) VCS client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repo {
    pub owner: String,
    pub name: String,
}

impl Repo {
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

/// A pull request reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequest {
    pub num: u64,
    pub author: String,
    pub head_branch: String,
    pub base_branch: String,
    pub mergeable: bool,
}

/// Execution context produced by the Command Builder, one per project that
/// requires work, handed off to the (external) step executor.
#[derive(Debug, Clone)]
pub struct ProjectCommandContext {
    pub base_repo: Repo,
    pub head_repo: Repo,
    pub pull: PullRequest,
    pub user: String,
    pub command_kind: CommandKind,
    pub project_name: Option<String>,
    pub dir: String,
    pub workspace: String,
    pub terraform_version: Option<Version>,
    /// Executable invocations the external executor should run, already
    /// materialized from the resolved workflow's step declarations against
    /// this context's working directory (§2, §4.6).
    pub steps: Vec<MaterializedStep>,
    pub apply_requirements: Vec<ApplyRequirement>,
    pub autoplan_enabled: bool,
    pub automerge_enabled: bool,
    pub comment_args: Vec<String>,
    pub verbose: bool,
    /// The tracing span commands in this context should log under, so every
    /// log line an executor emits carries `repo`/`pull`/`dir`/`workspace`
    /// without each call site re-specifying them (§3, SPEC_FULL.md §B).
    pub logger: Span,
    pub pull_mergeable: bool,
    pub replan_comment_text: String,
    pub reapply_comment_text: String,
}
