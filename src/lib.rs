// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

pub mod application;
pub mod clusterfile;
pub mod commands;
pub mod config;
pub mod distributor;
pub mod fleet;
pub mod image;
pub mod plugin;
pub mod pool;
pub mod probe;
pub mod registry;
pub mod remote;
pub mod runtime;
pub mod test_env;
pub mod upgrade;

/// Error type returned across the collaborator traits (image engine, installer, application
/// driver, remote executor).
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub fn default_config_path() -> String {
    match std::env::var("KEEL_CONFIG") {
        Ok(conf) => conf,
        Err(_) => "/etc/keel/keel.toml".to_string(),
    }
}

/// Directory holding desired-state checkpoints, application records and upgrade locks.
pub fn default_state_dir() -> String {
    match std::env::var("KEEL_STATE_DIR") {
        Ok(dir) => dir,
        Err(_) => "/var/lib/keel".to_string(),
    }
}

pub fn default_image_store() -> String {
    match std::env::var("KEEL_IMAGE_STORE") {
        Ok(dir) => dir,
        Err(_) => "/var/lib/keel/images".to_string(),
    }
}

/// Gets the maximum number of hosts that per-host operations (probing, distribution) run against
/// at once.
pub fn default_parallelism() -> usize {
    match std::env::var("KEEL_PARALLELISM") {
        Ok(n) => n
            .parse::<usize>()
            .ok()
            .filter(|n| *n > 0)
            .unwrap_or(pool::DEFAULT_MAX_PARALLELISM),
        Err(_) => pool::DEFAULT_MAX_PARALLELISM,
    }
}
