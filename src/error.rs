//! Crate-wide structured error type.
//!
//! One variant per error kind in the project-command pipeline. Message text
//! is part of the user-facing contract (PR comments quote it verbatim), so
//! variants carry pre-formatted strings rather than leaving formatting to
//! call sites.

use thiserror::Error;

/// All ways the project-command pipeline can fail to produce a result.
#[derive(Debug, Error)]
pub enum AtlantisError {
    #[error("parsing atlantis.yaml: {0}")]
    RepoConfigParse(String),

    #[error("parsing {file}: {detail}")]
    ServerConfigParse { file: String, detail: String },

    #[error("{0}")]
    ConfigPolicy(String),

    #[error("must specify project name: more than one project defined in atlantis.yaml matched dir: {dir:?} workspace: {workspace:?}")]
    ProjectAmbiguity { dir: String, workspace: String },

    #[error("no project with name {0:?} is defined in atlantis.yaml")]
    UnknownProject(String),

    #[error("running commands in workspace {workspace:?} is not allowed because this directory is only configured for the following workspaces: {allowed}")]
    WorkspaceNotAllowed { workspace: String, allowed: String },

    #[error("workspace was locked")]
    LockHeld,

    #[error("{0}")]
    VcsFailure(#[source] anyhow::Error),

    #[error("{0}")]
    CloneFailure(#[source] anyhow::Error),

    #[error("exit status {code}: running {cmd:?} in {dir}")]
    StepFailure {
        code: i32,
        cmd: String,
        dir: String,
    },

    #[error("no commands for run step")]
    EmptyRunStep,

    #[error("workflow {0:?} is not defined")]
    WorkflowNotDefined(String),
}

pub type Result<T> = std::result::Result<T, AtlantisError>;
