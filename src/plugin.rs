// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Lifecycle hooks run at fixed points of an install or upgrade.
//!
//! Plugins come from two places: the image (files under its `plugins/` directory) and the
//! operator's Clusterfile. Image plugins always run first, since they may set up things the
//! operator's plugins rely on.

use std::{fmt, fs, io, path::PathBuf, sync::Arc};

use {
    log::{debug, error, info},
    serde::{Deserialize, Serialize},
    thiserror::Error,
};

use crate::{
    distributor::PLUGINS_DIR,
    fleet::{Fleet, Role},
    image::MountInfo,
    pool,
    remote::{Env, RemoteError},
};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    PreInstall,
    PostInstall,
    PreUpgrade,
    PostUpgrade,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Phase::PreInstall => "pre-install",
                Phase::PostInstall => "post-install",
                Phase::PreUpgrade => "pre-upgrade",
                Phase::PostUpgrade => "post-upgrade",
            }
        )
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PluginKind {
    #[default]
    Shell,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Plugin {
    pub name: String,
    #[serde(default)]
    pub kind: PluginKind,
    pub phase: Phase,
    /// Only run on hosts with one of these roles. Runs on every host when empty.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_roles: Vec<Role>,
    pub action: String,
}

#[derive(Deserialize)]
struct PluginFile {
    #[serde(default)]
    plugin: Vec<Plugin>,
}

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("could not read plugin file \"{}\": {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid plugin file \"{}\": {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("plugin '{name}' ({phase}) failed on {}", format_hosts(.failures))]
    Run {
        name: String,
        phase: Phase,
        failures: Vec<RemoteError>,
    },
}

fn format_hosts(failures: &[RemoteError]) -> String {
    failures
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Read the plugins shipped inside a mounted image.
///
/// Plugin files are `*.toml` files holding `[[plugin]]` tables. Files are read in name order,
/// and plugins keep their order within a file. Plugins do not vary by platform, so the first
/// mount is used.
pub fn load_plugins_from_image(mount_info: &MountInfo) -> Result<Vec<Plugin>, PluginError> {
    let Some(entry) = mount_info.entries().first() else {
        return Ok(Vec::new());
    };
    let dir = entry.mount_dir.join(PLUGINS_DIR);

    let read_err = |path: &PathBuf| {
        let path = path.clone();
        move |source| PluginError::Read { path, source }
    };

    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!("image {} ships no plugins", mount_info.image());
            return Ok(Vec::new());
        }
        Err(e) => return Err(read_err(&dir)(e)),
    };
    let mut files = entries
        .map(|e| e.map(|e| e.path()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(read_err(&dir))?;
    files.retain(|p| p.extension().is_some_and(|ext| ext == "toml"));
    files.sort();

    let mut plugins = Vec::new();
    for path in files {
        let text = fs::read_to_string(&path).map_err(read_err(&path))?;
        let file: PluginFile =
            toml::from_str(&text).map_err(|source| PluginError::Parse { path, source })?;
        plugins.extend(file.plugin);
    }
    info!(
        "loaded {} plugin(s) from image {}",
        plugins.len(),
        mount_info.image()
    );
    Ok(plugins)
}

/// Merge image plugins with operator plugins. Image plugins come first, in their original order,
/// followed by the operator's.
pub fn aggregate(image_plugins: Vec<Plugin>, operator_plugins: &[Plugin]) -> Vec<Plugin> {
    let mut plugins = image_plugins;
    plugins.extend(operator_plugins.iter().cloned());
    plugins
}

/// Run every plugin registered for `phase`, in order. Each plugin runs on all of its hosts
/// before the next one starts; the first plugin to fail on any host stops the run.
pub async fn run_plugins(fleet: &Fleet, plugins: &[Plugin], phase: Phase) -> Result<(), PluginError> {
    for plugin in plugins.iter().filter(|p| p.phase == phase) {
        let hosts: Vec<String> = fleet
            .hosts()
            .iter()
            .filter(|h| plugin.on_roles.is_empty() || plugin.on_roles.iter().any(|r| h.has_role(*r)))
            .map(|h| h.address.clone())
            .collect();
        info!("running {phase} plugin '{}' on {} host(s)", plugin.name, hosts.len());

        let extra = Env::from([
            ("PLUGIN_NAME".to_string(), plugin.name.clone()),
            ("PLUGIN_PHASE".to_string(), phase.to_string()),
        ]);
        let results = pool::run_bounded(hosts, fleet.parallelism(), |host| {
            let executor = Arc::clone(fleet.executor());
            let env = fleet.env_for(&host, &extra);
            let action = plugin.action.clone();
            async move { executor.exec(&host, &env, &action).await }
        })
        .await;

        let failures: Vec<RemoteError> = results.into_iter().filter_map(Result::err).collect();
        if !failures.is_empty() {
            for e in failures.iter() {
                error!("plugin '{}' failed: {e}", plugin.name);
            }
            return Err(PluginError::Run {
                name: plugin.name.clone(),
                phase,
                failures,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plugin(name: &str) -> Plugin {
        Plugin {
            name: name.to_string(),
            kind: PluginKind::Shell,
            phase: Phase::PreUpgrade,
            on_roles: vec![],
            action: "true".to_string(),
        }
    }

    #[test]
    fn image_plugins_first() {
        let merged = aggregate(vec![plugin("A"), plugin("B")], &[plugin("C")]);
        let names: Vec<&str> = merged.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["A", "B", "C"]);
    }

    #[test]
    fn plugin_file_format() {
        let file: PluginFile = toml::from_str(
            r#"
            [[plugin]]
            name = "drain"
            phase = "pre-upgrade"
            on_roles = ["worker"]
            action = "systemctl stop kubelet"

            [[plugin]]
            name = "notify"
            phase = "post-upgrade"
            action = "logger upgraded"
            "#,
        )
        .unwrap();
        assert_eq!(file.plugin.len(), 2);
        assert_eq!(file.plugin[0].on_roles, vec![Role::Worker]);
        assert_eq!(file.plugin[1].kind, PluginKind::Shell);
    }
}
