//! Translates workflow step declarations into executable invocations, and
//! defines the environment-variable contract the (external) step executor
//! must supply to `Run` steps (§4.6).

use crate::config::model::{CommandKind, ProjectCommandContext, Step};
use crate::error::AtlantisError;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// The 13 environment variables every `Run` step observes, per §4.6.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunEnvironment {
    pub workspace: String,
    pub terraform_version: String,
    pub dir: PathBuf,
    pub planfile: PathBuf,
    pub base_repo_name: String,
    pub base_repo_owner: String,
    pub head_repo_name: String,
    pub head_repo_owner: String,
    pub head_branch_name: String,
    pub base_branch_name: String,
    pub pull_num: u64,
    pub pull_author: String,
    pub user_name: String,
}

impl RunEnvironment {
    /// Build the environment contract for `ctx`'s `Run` steps. `dir` is the
    /// absolute working directory the executor has checked the project out
    /// into; `PLANFILE` is derived from it as `<dir>/<workspace>.tfplan`.
    pub fn build(ctx: &ProjectCommandContext, dir: &Path) -> Self {
        let planfile = dir.join(format!("{}.tfplan", ctx.workspace));
        RunEnvironment {
            workspace: ctx.workspace.clone(),
            terraform_version: ctx
                .terraform_version
                .as_ref()
                .map(|v| v.to_string())
                .unwrap_or_default(),
            dir: dir.to_path_buf(),
            planfile,
            base_repo_name: ctx.base_repo.name.clone(),
            base_repo_owner: ctx.base_repo.owner.clone(),
            head_repo_name: ctx.head_repo.name.clone(),
            head_repo_owner: ctx.head_repo.owner.clone(),
            head_branch_name: ctx.pull.head_branch.clone(),
            base_branch_name: ctx.pull.base_branch.clone(),
            pull_num: ctx.pull.num,
            pull_author: ctx.pull.author.clone(),
            user_name: ctx.user.clone(),
        }
    }

    /// Render as the `KEY=value` map the executor injects into the `Run`
    /// step's subprocess environment.
    pub fn as_map(&self) -> HashMap<String, String> {
        HashMap::from([
            ("WORKSPACE".to_string(), self.workspace.clone()),
            (
                "ATLANTIS_TERRAFORM_VERSION".to_string(),
                self.terraform_version.clone(),
            ),
            ("DIR".to_string(), self.dir.display().to_string()),
            ("PLANFILE".to_string(), self.planfile.display().to_string()),
            ("BASE_REPO_NAME".to_string(), self.base_repo_name.clone()),
            ("BASE_REPO_OWNER".to_string(), self.base_repo_owner.clone()),
            ("HEAD_REPO_NAME".to_string(), self.head_repo_name.clone()),
            ("HEAD_REPO_OWNER".to_string(), self.head_repo_owner.clone()),
            ("HEAD_BRANCH_NAME".to_string(), self.head_branch_name.clone()),
            ("BASE_BRANCH_NAME".to_string(), self.base_branch_name.clone()),
            ("PULL_NUM".to_string(), self.pull_num.to_string()),
            ("PULL_AUTHOR".to_string(), self.pull_author.clone()),
            ("USER_NAME".to_string(), self.user_name.clone()),
        ])
    }
}

/// A step declaration paired with the argv the executor should invoke.
/// `extra_args` for built-ins are appended after the canonical command
/// name; `Run` steps carry their own argv plus the environment contract.
#[derive(Debug, Clone, PartialEq)]
pub enum MaterializedStep {
    Init { argv: Vec<String> },
    Plan { argv: Vec<String> },
    Apply { argv: Vec<String> },
    Run { argv: Vec<String>, env: HashMap<String, String> },
}

fn canonical(cmd: &str, workspace: &str, planfile: &Path, extra_args: &[String]) -> Vec<String> {
    let mut argv = vec!["terraform".to_string(), cmd.to_string()];
    match cmd {
        "plan" => {
            argv.push("-out".to_string());
            argv.push(planfile.display().to_string());
        }
        "apply" => {
            argv.push(planfile.display().to_string());
        }
        _ => {}
    }
    argv.push("-input=false".to_string());
    argv.push("-no-color".to_string());
    let _ = workspace; // workspace selection is a prior `terraform workspace select` step, not part of this argv
    argv.extend(extra_args.iter().cloned());
    argv
}

/// Materialize one stage (`workflow.plan` or `workflow.apply`) of steps
/// into executable invocations for `ctx`, whose working directory is `dir`.
pub fn materialize_stage(
    steps: &[Step],
    ctx: &ProjectCommandContext,
    dir: &Path,
) -> Result<Vec<MaterializedStep>, AtlantisError> {
    let env = RunEnvironment::build(ctx, dir).as_map();
    steps
        .iter()
        .map(|step| match step {
            Step::Init { extra_args } => Ok(MaterializedStep::Init {
                argv: canonical("init", &ctx.workspace, &dir.join(format!("{}.tfplan", ctx.workspace)), extra_args),
            }),
            Step::Plan { extra_args } => Ok(MaterializedStep::Plan {
                argv: canonical("plan", &ctx.workspace, &dir.join(format!("{}.tfplan", ctx.workspace)), extra_args),
            }),
            Step::Apply { extra_args } => Ok(MaterializedStep::Apply {
                argv: canonical("apply", &ctx.workspace, &dir.join(format!("{}.tfplan", ctx.workspace)), extra_args),
            }),
            Step::Run { argv } => {
                if argv.is_empty() {
                    return Err(AtlantisError::EmptyRunStep);
                }
                Ok(MaterializedStep::Run {
                    argv: argv.clone(),
                    env: env.clone(),
                })
            }
        })
        .collect()
}

/// Build the `StepFailure` error for a non-zero exit, per §4.6/§7.
pub fn step_failure(code: i32, argv: &[String], dir: &Path) -> AtlantisError {
    AtlantisError::StepFailure {
        code,
        cmd: argv.join(" "),
        dir: dir.display().to_string(),
    }
}

/// Selects which half of a `Workflow` applies to `kind`, as the declarations
/// the Command Builder then passes to [`materialize_stage`] (§4.5, §4.6).
pub fn stage_for(kind: CommandKind, workflow: &crate::config::model::Workflow) -> Vec<Step> {
    match kind {
        CommandKind::Plan => workflow.plan.clone(),
        CommandKind::Apply => workflow.apply.clone(),
    }
}
