//! Combine server policy and in-repo config into a `MergedProjectConfig`.
//!
//! Modeled as a pure function over immutable values (§9 design note): no
//! shared map is mutated, everything is folded from `ServerConfig` and an
//! optional `RepoConfig` into one record per call.

use super::model::{
    EffectivePolicy, MergedProjectConfig, OverridableKey, Project, RepoConfig, ServerConfig,
    Workflow,
};
use crate::error::AtlantisError;

/// Fold every `RepoPolicy` whose `id_pattern` matches `repo_id`, in
/// declaration order, with later matches overriding earlier ones field by
/// field (§4.2 "Policy resolution").
pub fn effective_policy(server: &ServerConfig, repo_id: &str) -> EffectivePolicy {
    let mut eff = EffectivePolicy::default();
    for policy in &server.repos {
        if !policy.id_pattern.matches(repo_id) {
            continue;
        }
        if policy.apply_requirements.is_some() {
            eff.apply_requirements = policy.apply_requirements.clone();
        }
        if policy.workflow.is_some() {
            eff.workflow = policy.workflow.clone();
        }
        if !policy.allowed_overrides.is_empty() {
            eff.allowed_overrides = policy.allowed_overrides.clone();
        }
        eff.allow_custom_workflows = eff.allow_custom_workflows || policy.allow_custom_workflows;
    }
    eff
}

fn resolve_workflow(
    name: &str,
    repo_config: Option<&RepoConfig>,
    server: &ServerConfig,
    allow_custom_workflows: bool,
) -> Result<Workflow, AtlantisError> {
    if allow_custom_workflows {
        if let Some(wf) = repo_config.and_then(|rc| rc.workflows.get(name)) {
            return Ok(wf.clone());
        }
    }
    if let Some(wf) = server.workflows.get(name) {
        return Ok(wf.clone());
    }
    Err(AtlantisError::WorkflowNotDefined(name.to_string()))
}

/// Merge one project declaration (possibly defaulted, if there is no
/// `atlantis.yaml` entry for this dir/workspace) against server policy.
pub fn merge_project(
    server: &ServerConfig,
    repo_id: &str,
    repo_config: Option<&RepoConfig>,
    project: &Project,
) -> Result<MergedProjectConfig, AtlantisError> {
    let policy = effective_policy(server, repo_id);

    if let Some(rc) = repo_config {
        if !rc.workflows.is_empty() && !policy.allow_custom_workflows {
            return Err(AtlantisError::ConfigPolicy(
                "\"workflows\" cannot be specified in \"atlantis.yaml\" by default. \
                 A repo admin must enable custom workflows for this repo in the server-side config."
                    .to_string(),
            ));
        }
    }

    if project.apply_requirements.is_some()
        && !policy.allowed_overrides.contains(&OverridableKey::ApplyRequirements)
    {
        return Err(AtlantisError::ConfigPolicy(
            "\"apply_requirements\" cannot be specified in \"atlantis.yaml\" by default. \
             A repo admin must enable this option in the server-side config."
                .to_string(),
        ));
    }

    if project.workflow.is_some() && !policy.allowed_overrides.contains(&OverridableKey::Workflow) {
        return Err(AtlantisError::ConfigPolicy(
            "\"workflow\" cannot be specified in \"atlantis.yaml\" by default. \
             A repo admin must enable this option in the server-side config."
                .to_string(),
        ));
    }

    let apply_requirements = if policy.allowed_overrides.contains(&OverridableKey::ApplyRequirements)
    {
        project
            .apply_requirements
            .clone()
            .or_else(|| policy.apply_requirements.clone())
            .unwrap_or_default()
    } else {
        policy.apply_requirements.clone().unwrap_or_default()
    };

    let workflow_name = if policy.allowed_overrides.contains(&OverridableKey::Workflow) {
        project.workflow.clone().or_else(|| policy.workflow.clone())
    } else {
        policy.workflow.clone()
    };

    let workflow = match workflow_name {
        Some(name) => resolve_workflow(&name, repo_config, server, policy.allow_custom_workflows)?,
        None => Workflow::default_workflow(),
    };

    Ok(MergedProjectConfig {
        dir: project.dir.clone(),
        workspace: project.workspace.clone(),
        name: project.name.clone(),
        workflow,
        terraform_version: project.terraform_version.clone(),
        apply_requirements,
        autoplan: project.autoplan.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::model::{Autoplan, RepoIdPattern, RepoPolicy};

    fn project(dir: &str) -> Project {
        Project {
            dir: dir.to_string(),
            workspace: "default".to_string(),
            name: None,
            terraform_version: None,
            workflow: None,
            apply_requirements: None,
            autoplan: Autoplan::default(),
        }
    }

    #[test]
    fn no_policy_uses_default_workflow() {
        let server = ServerConfig::empty();
        let merged = merge_project(&server, "any/repo", None, &project("a")).unwrap();
        assert_eq!(merged.workflow, Workflow::default_workflow());
    }

    #[test]
    fn restricted_workflow_override_denied() {
        let server = ServerConfig {
            repos: vec![RepoPolicy {
                id_pattern: RepoIdPattern::Regex {
                    raw: "/.*/".to_string(),
                    compiled: regex::Regex::new("^(?:.*)$").unwrap(),
                },
                apply_requirements: None,
                workflow: None,
                allowed_overrides: Vec::new(),
                allow_custom_workflows: false,
            }],
            workflows: workflows_map([("projworkflow", Workflow::default_workflow())]),
        };
        let mut p = project("a");
        p.workflow = Some("projworkflow".to_string());
        let err = merge_project(&server, "thisproject", None, &p).unwrap_err();
        assert!(err.to_string().contains("\"workflow\" cannot be specified"));
    }

    #[test]
    fn last_match_server_policy_wins() {
        let w1 = Workflow {
            plan: vec![crate::config::model::Step::Init { extra_args: vec![] }],
            apply: vec![],
        };
        let w2 = Workflow {
            plan: vec![crate::config::model::Step::Plan { extra_args: vec![] }],
            apply: vec![],
        };
        let server = ServerConfig {
            repos: vec![
                RepoPolicy {
                    id_pattern: RepoIdPattern::Regex {
                        raw: "/.*/".to_string(),
                        compiled: regex::Regex::new("^(?:.*)$").unwrap(),
                    },
                    apply_requirements: None,
                    workflow: Some("w1".to_string()),
                    allowed_overrides: Vec::new(),
                    allow_custom_workflows: false,
                },
                RepoPolicy {
                    id_pattern: RepoIdPattern::Exact("thisproject".to_string()),
                    apply_requirements: None,
                    workflow: Some("w2".to_string()),
                    allowed_overrides: Vec::new(),
                    allow_custom_workflows: false,
                },
            ],
            workflows: workflows_map([("w1", w1), ("w2", w2.clone())]),
        };
        let merged = merge_project(&server, "thisproject", None, &project("a")).unwrap();
        assert_eq!(merged.workflow, w2);
    }

    fn workflows_map<const N: usize>(
        items: [(&str, Workflow); N],
    ) -> std::collections::HashMap<String, Workflow> {
        items.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
    }
}
