//! # Keel Node
//!
//! Transports for the Keel git server: smart HTTP endpoints and a stdio
//! entry point suitable for SSH forced commands. Both hand a byte stream and
//! a repository handle to the protocol engine in `keel-git`.
//!
//! ## Quick Start
//!
//! ```bash
//! cargo run --bin keel-node -- serve --listen 127.0.0.1:8080
//! git clone http://127.0.0.1:8080/demo.git
//! ```
//!
//! ## Modules
//!
//! - [`api`] - Git smart HTTP endpoints
//! - [`config`] - Node configuration
//! - [`observability`] - Structured logging and request tracing
//! - [`repos`] - Repository registry
//! - [`stdio`] - Stdio/SSH transport
//!
//! ## Example: Building the router
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use keel_node::api::{create_router, AppState};
//! use keel_node::repos::RepoRegistry;
//!
//! let state = AppState::new(Arc::new(RepoRegistry::in_memory()));
//! let app = create_router(state);
//! ```

pub mod api;
pub mod config;
pub mod observability;
pub mod repos;
pub mod stdio;

use config::NodeConfig;
use repos::RepoRegistry;
use std::sync::Arc;

/// Builds the repository registry described by `config`.
pub fn registry_from_config(config: &NodeConfig) -> RepoRegistry {
    match &config.data_dir {
        Some(dir) => RepoRegistry::on_disk(dir, config.cache_config()),
        None => RepoRegistry::in_memory(),
    }
}

/// Builds the HTTP application state described by `config`.
pub fn app_state_from_config(config: &NodeConfig, repos: Arc<RepoRegistry>) -> api::AppState {
    api::AppState {
        repos,
        options: keel_git::ServeOptions {
            pack: config.pack_options(),
            policy: config.push_policy(),
            ..keel_git::ServeOptions::http()
        },
        auto_create: config.push.auto_create,
        idle_timeout: config.idle_timeout(),
    }
}
