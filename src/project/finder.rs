//! Maps a modified-file list to the projects that need work.
//!
//! Glob matching is gitignore-style with `**` support, via the `ignore`
//! crate (the same crate `worktrunk` reaches for when it needs
//! gitignore-dialect matching) rather than a hand-rolled globber — see
//! DESIGN.md for the dialect note required by spec §9.

use crate::config::model::{Project, RepoConfig};
use ignore::gitignore::GitignoreBuilder;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::debug;

/// A directory identified as needing work, before any config is attached.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct TreeProject {
    pub path: String,
}

/// `find_by_config`: for each project in `repo_config`, the project matches
/// iff at least one modified path (expressed relative to `project.dir`)
/// matches at least one of its `autoplan.when_modified` globs.
///
/// Projects with `autoplan.enabled = false` are still returned here — the
/// autoplan filter is applied by the Command Builder, keeping this function
/// pure over modified-file matching alone (§4.3).
pub fn find_by_config<'a>(
    modified_files: &[String],
    repo_config: &'a RepoConfig,
) -> Vec<&'a Project> {
    let mut matched = Vec::new();
    for project in &repo_config.projects {
        if project_matches(modified_files, project) {
            matched.push(project);
        }
    }
    matched
}

fn project_matches(modified_files: &[String], project: &Project) -> bool {
    // Patterns are anchored to the project's own directory (§4.3), so paths
    // are stripped of the `project.dir` prefix below before matching — the
    // builder's root is therefore a no-op placeholder, not `project.dir`.
    let mut builder = GitignoreBuilder::new(".");
    for pattern in &project.autoplan.when_modified {
        if let Err(e) = builder.add_line(None, pattern) {
            debug!(pattern, error = %e, "skipping unparsable autoplan glob");
        }
    }
    let matcher = match builder.build() {
        Ok(m) => m,
        Err(e) => {
            debug!(error = %e, dir = %project.dir, "failed to build glob matcher");
            return false;
        }
    };

    let project_dir = Path::new(&project.dir);
    for file in modified_files {
        let rel = if project_dir == Path::new(".") {
            Path::new(file)
        } else {
            let Ok(rel) = Path::new(file).strip_prefix(project_dir) else {
                continue;
            };
            rel
        };
        if matcher.matched(rel, false).is_ignore() {
            return true;
        }
    }
    false
}

/// `find_by_tree`: fallback when no `atlantis.yaml` exists. For every
/// modified file ending in `.tf*`, walk upward from its directory to the
/// repo root and return the first ancestor directory that itself contains a
/// top-level `.tf*` file.
pub fn find_by_tree(modified_files: &[String], repo_root: &Path) -> Vec<TreeProject> {
    let mut found: BTreeSet<String> = BTreeSet::new();
    for file in modified_files {
        if !is_tf_file(file) {
            continue;
        }
        let mut dir = Path::new(file).parent().map(PathBuf::from).unwrap_or_default();
        loop {
            if dir_has_tf_file(repo_root, &dir) {
                found.insert(dir_to_string(&dir));
                break;
            }
            if dir.as_os_str().is_empty() {
                break;
            }
            match dir.parent() {
                Some(parent) => dir = parent.to_path_buf(),
                None => break,
            }
        }
    }
    found.into_iter().map(|path| TreeProject { path }).collect()
}

/// A file "ends in `.tf*`" per §4.3 iff its extension itself starts with
/// `tf` (`.tf`, `.tfvars`, `.tfplan`, ...) — a substring `contains(".tf")`
/// would also fire on e.g. `artifact.tfplan.zip`, whose real extension is
/// `zip`.
fn has_tf_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.starts_with("tf"))
        .unwrap_or(false)
}

fn is_tf_file(path: &str) -> bool {
    has_tf_extension(Path::new(path))
}

fn dir_to_string(dir: &Path) -> String {
    if dir.as_os_str().is_empty() {
        ".".to_string()
    } else {
        dir.to_string_lossy().replace('\\', "/")
    }
}

fn dir_has_tf_file(repo_root: &Path, rel_dir: &Path) -> bool {
    let abs = repo_root.join(rel_dir);
    let Ok(entries) = std::fs::read_dir(&abs) else {
        return false;
    };
    entries.flatten().any(|entry| has_tf_extension(&entry.path()))
}
