//! Structural validation and lifting from the raw parsed shape into the
//! canonical `config::model` types.

use super::model::{
    ApplyRequirement, Autoplan, OverridableKey, Project, RepoConfig, RepoIdPattern, RepoPolicy,
    ServerConfig, Step, Workflow,
};
use super::parser::{
    RawAutoplan, RawProject, RawRepoConfigFile, RawRepoPolicy, RawServerConfigFile, RawStage,
    RawStep, RawStepArgs, RawStepBody, RawWorkflow,
};
use crate::error::AtlantisError;
use once_cell::sync::Lazy;
use regex::Regex;
use semver::Version;
use std::collections::{HashMap, HashSet};

static URL_SAFE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9._~/-]+$").expect("static regex"));

fn err(path: &str, detail: impl std::fmt::Display) -> AtlantisError {
    AtlantisError::RepoConfigParse(format!("{path}: {detail}"))
}

/// `filepath.Clean`-style normalization: collapse `.`/empty segments, leave
/// `..` rejection to the caller (it has already run by the time this is
/// called). A project `dir` of `"/"` is treated as `"."`.
fn clean_dir(dir: &str) -> String {
    if dir == "/" {
        return ".".to_string();
    }
    let parts: Vec<&str> = dir.split('/').filter(|p| !p.is_empty() && *p != ".").collect();
    if parts.is_empty() {
        ".".to_string()
    } else {
        parts.join("/")
    }
}

fn parse_apply_requirements(
    path: &str,
    raw: Option<Vec<String>>,
) -> Result<Option<Vec<ApplyRequirement>>, AtlantisError> {
    let Some(items) = raw else { return Ok(None) };
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let req = match item.as_str() {
            "approved" => ApplyRequirement::Approved,
            "mergeable" => ApplyRequirement::Mergeable,
            other => {
                return Err(err(
                    path,
                    format!("invalid apply_requirement \"{other}\", must be one of: approved, mergeable"),
                ))
            }
        };
        out.push(req);
    }
    Ok(Some(out))
}

fn lift_step(path: &str, raw: RawStep) -> Result<Step, AtlantisError> {
    match raw {
        RawStep::Name(name) => match name.as_str() {
            "init" => Ok(Step::Init { extra_args: Vec::new() }),
            "plan" => Ok(Step::Plan { extra_args: Vec::new() }),
            "apply" => Ok(Step::Apply { extra_args: Vec::new() }),
            other => Err(err(path, format!("\"{other}\" is not a valid step"))),
        },
        RawStep::Keyed(map) => {
            if map.len() != 1 {
                return Err(err(path, "step map must have exactly one key"));
            }
            let (key, body) = map.into_iter().next().expect("len checked above");
            match (key.as_str(), body) {
                ("init", RawStepBody::Args(RawStepArgs { extra_args })) => {
                    Ok(Step::Init { extra_args })
                }
                ("plan", RawStepBody::Args(RawStepArgs { extra_args })) => {
                    Ok(Step::Plan { extra_args })
                }
                ("apply", RawStepBody::Args(RawStepArgs { extra_args })) => {
                    Ok(Step::Apply { extra_args })
                }
                ("run", RawStepBody::Run(cmd)) => {
                    let argv = shell_words::split(&cmd)
                        .map_err(|e| err(path, format!("invalid run command: {e}")))?;
                    if argv.is_empty() {
                        return Err(AtlantisError::EmptyRunStep);
                    }
                    Ok(Step::Run { argv })
                }
                (other, _) => Err(err(path, format!("\"{other}\" is not a valid step key"))),
            }
        }
    }
}

fn lift_stage(path: &str, raw: Option<RawStage>) -> Result<Vec<Step>, AtlantisError> {
    let Some(stage) = raw else { return Ok(Vec::new()) };
    stage
        .steps
        .into_iter()
        .enumerate()
        .map(|(i, s)| lift_step(&format!("{path}.steps.{i}"), s))
        .collect()
}

fn lift_workflow(path: &str, raw: RawWorkflow) -> Result<Workflow, AtlantisError> {
    Ok(Workflow {
        plan: lift_stage(&format!("{path}.plan"), raw.plan)?,
        apply: lift_stage(&format!("{path}.apply"), raw.apply)?,
    })
}

fn lift_workflows(
    raw: HashMap<String, RawWorkflow>,
) -> Result<HashMap<String, Workflow>, AtlantisError> {
    raw.into_iter()
        .map(|(name, wf)| {
            let lifted = lift_workflow(&format!("workflows.{name}"), wf)?;
            Ok((name, lifted))
        })
        .collect()
}

fn lift_autoplan(raw: Option<RawAutoplan>) -> Autoplan {
    let default = Autoplan::default();
    match raw {
        None => default,
        Some(a) => Autoplan {
            enabled: a.enabled.unwrap_or(default.enabled),
            when_modified: a
                .when_modified
                .filter(|v| !v.is_empty())
                .unwrap_or(default.when_modified),
        },
    }
}

fn lift_project(index: usize, raw: RawProject) -> Result<Project, AtlantisError> {
    let path = format!("projects.{index}");
    if raw.dir.is_empty() {
        return Err(err(&path, "dir: cannot be empty"));
    }
    if raw.dir.split('/').any(|p| p == "..") {
        return Err(err(&format!("{path}.dir"), "cannot contain '..'"));
    }
    let dir = clean_dir(&raw.dir);

    let workspace = raw
        .workspace
        .filter(|w| !w.is_empty())
        .unwrap_or_else(Project::default_workspace);

    let name = match raw.name {
        None => None,
        Some(n) => {
            if n.is_empty() {
                return Err(err(&format!("{path}.name"), "if set cannot be empty"));
            }
            if !URL_SAFE.is_match(&n) {
                return Err(err(
                    &format!("{path}.name"),
                    format!("\"{n}\" is not url safe"),
                ));
            }
            Some(n)
        }
    };

    let terraform_version = match raw.terraform_version {
        None => None,
        Some(v) => {
            let trimmed = v.strip_prefix('v').unwrap_or(&v);
            Some(Version::parse(trimmed).map_err(|e| {
                err(&format!("{path}.terraform_version"), format!("{v}: {e}"))
            })?)
        }
    };

    let apply_requirements =
        parse_apply_requirements(&format!("{path}.apply_requirements"), raw.apply_requirements)?;

    Ok(Project {
        dir,
        workspace,
        name,
        terraform_version,
        workflow: raw.workflow,
        apply_requirements,
        autoplan: lift_autoplan(raw.autoplan),
    })
}

/// Project uniqueness (§3 Invariants, testable property 3): every project
/// has a non-empty `name`-free collision check, and any `(dir, workspace)`
/// shared by more than one project requires all of them to carry distinct
/// names.
fn validate_project_uniqueness(projects: &[Project]) -> Result<(), AtlantisError> {
    let mut seen_names: HashSet<&str> = HashSet::new();
    for p in projects {
        if let Some(name) = &p.name {
            if !seen_names.insert(name.as_str()) {
                return Err(err(
                    "projects",
                    format!("found two or more projects with name \"{name}\" in atlantis.yaml"),
                ));
            }
        }
    }

    let mut by_key: HashMap<(&str, &str), Vec<&Project>> = HashMap::new();
    for p in projects {
        by_key.entry((p.dir.as_str(), p.workspace.as_str())).or_default().push(p);
    }
    for ((dir, workspace), group) in by_key {
        if group.len() > 1 {
            for p in &group {
                if p.name.is_none() {
                    return Err(err(
                        "projects",
                        format!(
                            "must set name for project at dir: \"{dir}\" workspace: \"{workspace}\" since there are multiple projects with the same dir and workspace"
                        ),
                    ));
                }
            }
        }
    }
    Ok(())
}

/// Parse + structurally validate an `atlantis.yaml` document.
///
/// Workflow-reference resolution is deliberately *not* performed here: a
/// project's `workflow` name may resolve against either the repo's own
/// workflows or the server's, and which is permitted depends on server
/// policy (§4.2). That check lives in `config::merger`, which has both
/// sides available (see DESIGN.md, "workflow resolution split").
pub fn validate_repo_config(raw: RawRepoConfigFile) -> Result<RepoConfig, AtlantisError> {
    if raw.version != 2 {
        return Err(AtlantisError::RepoConfigParse(format!(
            "version: must equal 2, found {}; did you forget to migrate from an older atlantis.yaml version?",
            raw.version
        )));
    }

    let projects = raw
        .projects
        .into_iter()
        .enumerate()
        .map(|(i, p)| lift_project(i, p))
        .collect::<Result<Vec<_>, _>>()?;
    validate_project_uniqueness(&projects)?;

    let workflows = lift_workflows(raw.workflows)?;

    Ok(RepoConfig {
        version: raw.version as u32,
        automerge: raw.automerge,
        projects,
        workflows,
    })
}

fn parse_overrides(raw: Option<Vec<String>>) -> Result<Vec<OverridableKey>, AtlantisError> {
    let Some(items) = raw else { return Ok(Vec::new()) };
    items
        .into_iter()
        .map(|s| match s.as_str() {
            "apply_requirements" => Ok(OverridableKey::ApplyRequirements),
            "workflow" => Ok(OverridableKey::Workflow),
            other => Err(err(
                "allowed_overrides",
                format!("\"{other}\" is not a valid override, must be one of: apply_requirements, workflow"),
            )),
        })
        .collect()
}

fn lift_repo_policy(raw: RawRepoPolicy) -> Result<RepoPolicy, AtlantisError> {
    let id_pattern = if raw.id.starts_with('/') && raw.id.ends_with('/') && raw.id.len() >= 2 {
        let inner = &raw.id[1..raw.id.len() - 1];
        let compiled = Regex::new(&format!("^(?:{inner})$")).map_err(|e| {
            AtlantisError::ServerConfigParse {
                file: "server config".to_string(),
                detail: format!("regex compile of repo.ID `{}`: {e}", raw.id),
            }
        })?;
        RepoIdPattern::Regex { raw: raw.id.clone(), compiled }
    } else {
        RepoIdPattern::Exact(raw.id.clone())
    };

    Ok(RepoPolicy {
        id_pattern,
        apply_requirements: parse_apply_requirements("repos.apply_requirements", raw.apply_requirements)?,
        workflow: raw.workflow,
        allowed_overrides: parse_overrides(raw.allowed_overrides)?,
        allow_custom_workflows: raw.allow_custom_workflows.unwrap_or(false),
    })
}

/// Parse + structurally validate a server repo-policy file.
pub fn validate_server_config(raw: RawServerConfigFile) -> Result<ServerConfig, AtlantisError> {
    let repos = raw
        .repos
        .into_iter()
        .map(lift_repo_policy)
        .collect::<Result<Vec<_>, _>>()?;
    let workflows = lift_workflows(raw.workflows)?;
    Ok(ServerConfig { repos, workflows })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parser::parse_repo_config_raw;

    fn lift(yaml: &str) -> Result<RepoConfig, AtlantisError> {
        validate_repo_config(parse_repo_config_raw(yaml.as_bytes()).unwrap())
    }

    #[test]
    fn defaults_round_trip() {
        let cfg = lift("version: 2\nprojects:\n- dir: .\n").unwrap();
        let p = &cfg.projects[0];
        assert_eq!(p.workspace, "default");
        assert!(p.autoplan.enabled);
        assert_eq!(p.autoplan.when_modified, vec!["**/*.tf*".to_string()]);
        assert!(p.apply_requirements.is_none());
        assert!(p.workflow.is_none());
        assert!(p.terraform_version.is_none());
    }

    #[test]
    fn rejects_bad_version() {
        let err = lift("version: 3\nprojects: []\n").unwrap_err();
        assert!(err.to_string().contains("version"));
    }

    #[test]
    fn rejects_dotdot() {
        let err = lift("version: 2\nprojects:\n- dir: ../etc\n").unwrap_err();
        assert!(err.to_string().contains(".."));
    }

    #[test]
    fn rejects_unknown_key() {
        let result = parse_repo_config_raw(b"version: 2\nbogus: true\n");
        assert!(result.is_err());
    }

    #[test]
    fn dir_slash_normalizes_to_dot() {
        let cfg = lift("version: 2\nprojects:\n- dir: /\n").unwrap();
        assert_eq!(cfg.projects[0].dir, ".");
    }

    #[test]
    fn duplicate_dir_workspace_without_names_fails() {
        let err = lift(
            "version: 2\nprojects:\n- dir: a\n- dir: a\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("must set name"));
    }

    #[test]
    fn duplicate_dir_workspace_with_distinct_names_ok() {
        let cfg = lift(
            "version: 2\nprojects:\n- dir: a\n  name: myname\n- dir: a\n  name: myname2\n",
        )
        .unwrap();
        assert_eq!(cfg.projects.len(), 2);
    }

    #[test]
    fn duplicate_names_fail() {
        let err = lift(
            "version: 2\nprojects:\n- dir: a\n  name: dup\n  workspace: w1\n- dir: b\n  name: dup\n  workspace: w2\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("found two or more projects"));
    }

    #[test]
    fn name_not_url_safe_rejected() {
        let err = lift("version: 2\nprojects:\n- dir: a\n  name: \"bad name!\"\n").unwrap_err();
        assert!(err.to_string().contains("url safe"));
    }

    #[test]
    fn terraform_version_parses_with_v_prefix() {
        let cfg = lift("version: 2\nprojects:\n- dir: a\n  terraform_version: v0.12.0\n").unwrap();
        assert_eq!(
            cfg.projects[0].terraform_version.as_ref().unwrap().to_string(),
            "0.12.0"
        );
    }

    #[test]
    fn run_step_splits_shell_words() {
        let cfg = lift(
            "version: 2\nworkflows:\n  custom:\n    plan:\n      steps:\n      - run: echo \"hi there\"\n",
        )
        .unwrap();
        let wf = &cfg.workflows["custom"];
        match &wf.plan[0] {
            Step::Run { argv } => assert_eq!(argv, &vec!["echo".to_string(), "hi there".to_string()]),
            other => panic!("unexpected step {other:?}"),
        }
    }

    #[test]
    fn server_regex_repo_id_compiles_and_matches() {
        let raw = crate::config::parser::parse_server_config_raw(
            "server",
            b"repos:\n- id: /^my-org\\/.*/\n",
        )
        .unwrap();
        let cfg = validate_server_config(raw).unwrap();
        assert!(cfg.repos[0].id_pattern.matches("my-org/repo1"));
        assert!(!cfg.repos[0].id_pattern.matches("other-org/repo1"));
    }

    #[test]
    fn server_bad_regex_reports_compile_error() {
        let raw = crate::config::parser::parse_server_config_raw(
            "server",
            b"repos:\n- id: /[/\n",
        )
        .unwrap();
        let err = validate_server_config(raw).unwrap_err();
        assert!(err.to_string().contains("regex compile of repo.ID"));
    }
}
