// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Launching the applications an image carries once the cluster itself is upgraded.

use std::{
    collections::BTreeMap,
    fmt, fs,
    path::{Path, PathBuf},
    sync::Mutex,
};

use {
    async_trait::async_trait,
    chrono::Local,
    log::info,
    serde::{Deserialize, Serialize},
    thiserror::Error,
};

use crate::{
    clusterfile::Application,
    fleet::{Fleet, Role},
    image::ImageExtension,
    remote::{shell_quote, Env},
    BoxError,
};

pub const APPLICATION_RECORD: &str = "application.toml";

/// Merge the Clusterfile's application declaration with what the fleet resolved from the image.
///
/// Non-empty `cmds` and `app_names` replace the declared ones. `env` is the cluster-wide
/// environment; variables the application declares itself take precedence over it.
pub fn construct_application(
    app: Option<&Application>,
    cmds: &[String],
    app_names: &[String],
    env: &BTreeMap<String, String>,
) -> Application {
    let mut app = app.cloned().unwrap_or_default();
    if !cmds.is_empty() {
        app.launch_cmds = cmds.to_vec();
    }
    if !app_names.is_empty() {
        app.app_names = app_names.to_vec();
    }
    let mut merged = env.clone();
    merged.extend(std::mem::take(&mut app.env));
    app.env = merged;
    app
}

#[async_trait]
pub trait AppDriver: Send + Sync {
    /// Launch the application on the fleet.
    async fn launch(&self, fleet: &Fleet) -> Result<(), BoxError>;

    /// Persist a record of what was launched.
    fn save(&self) -> Result<(), BoxError>;
}

pub trait AppDriverFactory: fmt::Debug + Send + Sync {
    fn new_app_driver(
        &self,
        app: Application,
        extension: &ImageExtension,
    ) -> Result<Box<dyn AppDriver>, BoxError>;
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("invalid application name \"{0}\"")]
    BadName(String),
    #[error("cluster has no master to launch applications from")]
    NoMaster,
    #[error("application was never launched, nothing to save")]
    NotLaunched,
    #[error("could not write application record \"{}\": {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not serialize application record: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// What was launched, saved under the cluster's state directory.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AppRecord {
    pub cluster: String,
    pub image: String,
    pub launch_cmds: Vec<String>,
    pub app_names: Vec<String>,
    pub launched_at: String,
}

/// Launches applications by running commands on the first master.
///
/// Explicit launch commands run as given. Otherwise each named application is launched by its
/// script at `<cluster root>/applications/<name>/launch.sh`.
pub struct CommandAppDriver {
    app: Application,
    state_dir: PathBuf,
    launched: Mutex<Option<AppRecord>>,
}

impl CommandAppDriver {
    fn commands(&self, cluster_root: &Path) -> Vec<String> {
        if !self.app.launch_cmds.is_empty() {
            return self.app.launch_cmds.clone();
        }
        self.app
            .app_names
            .iter()
            .map(|name| {
                let script = cluster_root.join("applications").join(name).join("launch.sh");
                shell_quote(&script.display().to_string())
            })
            .collect()
    }
}

#[async_trait]
impl AppDriver for CommandAppDriver {
    async fn launch(&self, fleet: &Fleet) -> Result<(), BoxError> {
        let commands = self.commands(fleet.cluster_root());
        if !commands.is_empty() {
            let masters = fleet.hosts_by_role(Role::Master);
            let master = masters.first().ok_or(AppError::NoMaster)?;
            let env: Env = self.app.env.clone();
            for command in commands.iter() {
                info!("launching on {master}: {command}");
                fleet.exec(master, &env, command).await?;
            }
        } else {
            info!("no applications to launch");
        }

        *self.launched.lock().unwrap() = Some(AppRecord {
            cluster: fleet.name().to_string(),
            image: fleet.image_name().to_string(),
            launch_cmds: self.app.launch_cmds.clone(),
            app_names: self.app.app_names.clone(),
            launched_at: Local::now().naive_local().format("%Y-%m-%dT%H:%M:%S").to_string(),
        });
        Ok(())
    }

    fn save(&self) -> Result<(), BoxError> {
        let record = self
            .launched
            .lock()
            .unwrap()
            .clone()
            .ok_or(AppError::NotLaunched)?;
        let dir = self.state_dir.join(&record.cluster);
        let path = dir.join(APPLICATION_RECORD);
        let write_err = |source| AppError::Write {
            path: path.clone(),
            source,
        };
        fs::create_dir_all(&dir).map_err(write_err)?;
        fs::write(&path, toml::to_string_pretty(&record).map_err(AppError::from)?)
            .map_err(write_err)?;
        info!("saved application record to \"{}\"", path.display());
        Ok(())
    }
}

#[derive(Debug)]
pub struct CommandAppDriverFactory {
    state_dir: PathBuf,
}

impl CommandAppDriverFactory {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        CommandAppDriverFactory {
            state_dir: state_dir.into(),
        }
    }
}

impl AppDriverFactory for CommandAppDriverFactory {
    fn new_app_driver(
        &self,
        mut app: Application,
        extension: &ImageExtension,
    ) -> Result<Box<dyn AppDriver>, BoxError> {
        if app.launch_cmds.is_empty() && app.app_names.is_empty() {
            app.launch_cmds = extension.launch.cmds.clone();
            app.app_names = extension.launch.app_names.clone();
        }
        for name in app.app_names.iter() {
            if name.is_empty() || name.contains('/') || name == ".." {
                return Err(Box::new(AppError::BadName(name.clone())));
            }
        }
        Ok(Box::new(CommandAppDriver {
            app,
            state_dir: self.state_dir.clone(),
            launched: Mutex::new(None),
        }))
    }
}
