//! Project-command build pipeline for a PR-driven infrastructure-as-code
//! plan/apply server.
//!
//! This crate owns the core of one command: given an incoming VCS event
//! (a new commit, or an explicit `plan`/`apply` comment) it merges
//! server-side and repo-side configuration, works out which projects need
//! attention, takes out the appropriate working-directory locks, and
//! materializes the ordered command steps an external executor should run.
//! It does not talk to a VCS provider, spawn subprocesses, or serve HTTP —
//! those live behind the traits in [`vcs`] and are supplied by the caller.

pub mod command;
pub mod config;
pub mod error;
pub mod lock;
pub mod project;
pub mod vcs;
pub mod workflow;

pub use error::{AtlantisError, Result};

/// Install a `tracing` subscriber reading `RUST_LOG`, with `verbose` bumping
/// the default filter when the environment variable is unset. Mirrors
/// `prodigy::app::logging`'s shape: one `EnvFilter`-backed subscriber for the
/// whole process, installed once at startup.
pub fn init_tracing(verbose: u8) {
    use tracing_subscriber::EnvFilter;

    let default_directive = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
