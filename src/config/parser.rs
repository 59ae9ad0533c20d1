//! YAML parsing of `atlantis.yaml` and the server repo-policy file.
//!
//! Deserialization targets mirror the YAML shape closely and reject unknown
//! keys (`deny_unknown_fields`); `config::validator` lifts these raw values
//! into the canonical `config::model` types, which is where SemVer parsing,
//! `..` checks, regex compilation and uniqueness validation happen.

use crate::error::AtlantisError;
use serde::Deserialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawRepoConfigFile {
    pub version: i64,
    #[serde(default)]
    pub automerge: bool,
    #[serde(default)]
    pub projects: Vec<RawProject>,
    #[serde(default)]
    pub workflows: HashMap<String, RawWorkflow>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawProject {
    pub dir: String,
    #[serde(default)]
    pub workspace: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub terraform_version: Option<String>,
    #[serde(default)]
    pub workflow: Option<String>,
    #[serde(default)]
    pub apply_requirements: Option<Vec<String>>,
    #[serde(default)]
    pub autoplan: Option<RawAutoplan>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawAutoplan {
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub when_modified: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawWorkflow {
    #[serde(default)]
    pub plan: Option<RawStage>,
    #[serde(default)]
    pub apply: Option<RawStage>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawStage {
    #[serde(default)]
    pub steps: Vec<RawStep>,
}

/// A step entry: either a bare built-in name (`init`, `plan`, `apply`) or a
/// single-key mapping (`{init: {extra_args: [...]}}`, `{run: "cmd ..."}`).
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawStep {
    Name(String),
    Keyed(HashMap<String, RawStepBody>),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawStepBody {
    Run(String),
    Args(RawStepArgs),
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct RawStepArgs {
    #[serde(default)]
    pub extra_args: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawRepoPolicy {
    pub id: String,
    #[serde(default)]
    pub apply_requirements: Option<Vec<String>>,
    #[serde(default)]
    pub workflow: Option<String>,
    #[serde(default)]
    pub allowed_overrides: Option<Vec<String>>,
    #[serde(default)]
    pub allow_custom_workflows: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawServerConfigFile {
    #[serde(default)]
    pub repos: Vec<RawRepoPolicy>,
    #[serde(default)]
    pub workflows: HashMap<String, RawWorkflow>,
}

/// Parse raw YAML bytes for `atlantis.yaml` into its mirror struct.
///
/// Structural validation (SemVer, `..`, uniqueness, workflow-reference
/// closure) happens afterwards in `config::validator::validate_repo_config`;
/// this function only does YAML-shape parsing.
pub fn parse_repo_config_raw(bytes: &[u8]) -> Result<RawRepoConfigFile, AtlantisError> {
    serde_yaml::from_slice(bytes).map_err(|e| AtlantisError::RepoConfigParse(e.to_string()))
}

/// Parse raw YAML bytes for the server repo-policy file into its mirror
/// struct. `file` is used only to build the error-wrapping message.
pub fn parse_server_config_raw(
    file: &str,
    bytes: &[u8],
) -> Result<RawServerConfigFile, AtlantisError> {
    serde_yaml::from_slice(bytes).map_err(|e| AtlantisError::ServerConfigParse {
        file: file.to_string(),
        detail: e.to_string(),
    })
}
