//! Per-`(repo, pull, workspace)` mutual exclusion, plus a PR-wide variant.
//!
//! Modeled on `prodigy::cook::execution::resume_lock::ResumeLockManager`'s
//! RAII-guard pattern, but backed by an in-memory map instead of a lock
//! file: the registry here is process-local (§5), so there is nothing to
//! recover across restarts and no stale-lock detection is needed.

use crate::error::AtlantisError;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::info;

type LockKey = (String, u64);

#[derive(Debug, Default)]
struct PrLockState {
    /// Set while a `try_lock_pull` guard is outstanding.
    pull_held: bool,
    /// Workspaces with an outstanding `try_lock` guard.
    workspaces: HashSet<String>,
}

impl PrLockState {
    fn is_empty(&self) -> bool {
        !self.pull_held && self.workspaces.is_empty()
    }
}

/// In-memory registry of working-directory locks, safe for concurrent use.
/// Cheap to clone: internally it's just an `Arc` around the mutex-guarded
/// map (§5, "only shared mutable state").
#[derive(Debug, Clone, Default)]
pub struct WorkingDirLockRegistry {
    locks: Arc<Mutex<HashMap<LockKey, PrLockState>>>,
}

impl WorkingDirLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for one workspace. Non-blocking: fails immediately
    /// with [`AtlantisError::LockHeld`] if the PR-wide lock or this exact
    /// workspace lock is already held.
    pub fn try_lock(
        &self,
        repo: &str,
        pull: u64,
        workspace: &str,
    ) -> Result<WorkspaceLock, AtlantisError> {
        let key: LockKey = (repo.to_string(), pull);
        let mut map = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        let state = map.entry(key.clone()).or_default();
        if state.pull_held || state.workspaces.contains(workspace) {
            return Err(AtlantisError::LockHeld);
        }
        state.workspaces.insert(workspace.to_string());
        info!(repo, pull, workspace, "acquired workspace lock");
        Ok(WorkspaceLock {
            locks: Arc::clone(&self.locks),
            key,
            workspace: workspace.to_string(),
            released: false,
        })
    }

    /// Acquire an exclusive lock covering every workspace for a PR. Fails if
    /// any per-workspace lock (or another PR-wide lock) is already held for
    /// that `(repo, pull)`.
    pub fn try_lock_pull(&self, repo: &str, pull: u64) -> Result<PullLock, AtlantisError> {
        let key: LockKey = (repo.to_string(), pull);
        let mut map = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        let state = map.entry(key.clone()).or_default();
        if state.pull_held || !state.workspaces.is_empty() {
            return Err(AtlantisError::LockHeld);
        }
        state.pull_held = true;
        info!(repo, pull, "acquired pr-wide lock");
        Ok(PullLock {
            locks: Arc::clone(&self.locks),
            key,
            released: false,
        })
    }
}

/// RAII guard for a single-workspace lock. Released on drop, guaranteeing
/// release on every exit path from the acquiring operation (panic, early
/// return, or task cancellation) — see spec §4.4/§5.
#[derive(Debug)]
pub struct WorkspaceLock {
    locks: Arc<Mutex<HashMap<LockKey, PrLockState>>>,
    key: LockKey,
    workspace: String,
    released: bool,
}

impl WorkspaceLock {
    /// Release the lock early. Also happens automatically on drop.
    pub fn unlock(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let mut map = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(state) = map.get_mut(&self.key) {
            state.workspaces.remove(&self.workspace);
            if state.is_empty() {
                map.remove(&self.key);
            }
        }
        info!(repo = %self.key.0, pull = self.key.1, workspace = %self.workspace, "released workspace lock");
    }
}

impl Drop for WorkspaceLock {
    fn drop(&mut self) {
        self.release();
    }
}

/// RAII guard for a PR-wide lock.
#[derive(Debug)]
pub struct PullLock {
    locks: Arc<Mutex<HashMap<LockKey, PrLockState>>>,
    key: LockKey,
    released: bool,
}

impl PullLock {
    pub fn unlock(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let mut map = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(state) = map.get_mut(&self.key) {
            state.pull_held = false;
            if state.is_empty() {
                map.remove(&self.key);
            }
        }
        info!(repo = %self.key.0, pull = self.key.1, "released pr-wide lock");
    }
}

impl Drop for PullLock {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concurrent_same_key_excludes() {
        let registry = WorkingDirLockRegistry::new();
        let first = registry.try_lock("org/repo", 1, "default").unwrap();
        let second = registry.try_lock("org/repo", 1, "default");
        assert!(matches!(second, Err(AtlantisError::LockHeld)));
        drop(first);
        assert!(registry.try_lock("org/repo", 1, "default").is_ok());
    }

    #[test]
    fn distinct_workspaces_do_not_conflict() {
        let registry = WorkingDirLockRegistry::new();
        let _a = registry.try_lock("org/repo", 1, "default").unwrap();
        let _b = registry.try_lock("org/repo", 1, "staging").unwrap();
    }

    #[test]
    fn pull_lock_excludes_workspace_locks_and_vice_versa() {
        let registry = WorkingDirLockRegistry::new();
        let pull_lock = registry.try_lock_pull("org/repo", 1).unwrap();
        assert!(registry.try_lock("org/repo", 1, "default").is_err());
        drop(pull_lock);
        let ws_lock = registry.try_lock("org/repo", 1, "default").unwrap();
        assert!(registry.try_lock_pull("org/repo", 1).is_err());
        drop(ws_lock);
        assert!(registry.try_lock_pull("org/repo", 1).is_ok());
    }

    #[test]
    fn unrelated_prs_do_not_conflict() {
        let registry = WorkingDirLockRegistry::new();
        let _a = registry.try_lock("org/repo", 1, "default").unwrap();
        assert!(registry.try_lock("org/repo", 2, "default").is_ok());
    }

    #[test]
    fn release_on_panic_unwind() {
        let registry = WorkingDirLockRegistry::new();
        let registry2 = registry.clone();
        let result = std::panic::catch_unwind(move || {
            let _lock = registry2.try_lock("org/repo", 1, "default").unwrap();
            panic!("simulated early exit");
        });
        assert!(result.is_err());
        assert!(registry.try_lock("org/repo", 1, "default").is_ok());
    }
}
