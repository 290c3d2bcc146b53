// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::{io, path::PathBuf};

use {log::debug, serde::{Deserialize, Serialize}, thiserror::Error};

/// Settings is the model for the keel tool configuration file (`/etc/keel/keel.toml` by default).
///
/// The settings only describe how keel itself runs: where it keeps local state, where images
/// live, and how it reaches hosts. Everything about a particular cluster lives in that cluster's
/// desired-state document instead (see `clusterfile`).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub state_dir: PathBuf,
    pub image_store: PathBuf,
    /// Upper bound on the number of hosts probed or copied to at once.
    pub parallelism: usize,
    pub ssh: Ssh,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            state_dir: crate::default_state_dir().into(),
            image_store: crate::default_image_store().into(),
            parallelism: crate::default_parallelism(),
            ssh: Ssh::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("could not read settings file \"{path}\": {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("could not parse settings file \"{path}\": {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

impl Settings {
    /// Load settings from `path`, or from the default location if `path` is `None`.
    ///
    /// A settings file that does not exist at the default location is not an error; the built-in
    /// defaults are used instead. A file that was named explicitly must exist.
    pub fn load(path: Option<&str>) -> Result<Self, SettingsError> {
        let default_path = crate::default_config_path();
        let (path, explicit) = match path {
            Some(p) => (p, true),
            None => (default_path.as_str(), false),
        };

        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound && !explicit => {
                debug!("no settings file at \"{path}\", using defaults");
                return Ok(Settings::default());
            }
            Err(source) => {
                return Err(SettingsError::Read {
                    path: path.to_string(),
                    source,
                })
            }
        };

        toml::from_str(&contents).map_err(|source| SettingsError::Parse {
            path: path.to_string(),
            source,
        })
    }
}

/// How to reach hosts over ssh. May be overridden per cluster in the desired-state document.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Ssh {
    pub user: String,
    pub port: u16,
    pub identity_file: Option<PathBuf>,
    /// Seconds to wait for a connection before giving up on a host.
    pub connect_timeout: u64,
}

impl Default for Ssh {
    fn default() -> Self {
        Ssh {
            user: "root".to_string(),
            port: 22,
            identity_file: None,
            connect_timeout: 10,
        }
    }
}
