// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! The cluster runtime: what the installer is given, and the installer interface itself.

use std::{collections::BTreeMap, fmt, path::PathBuf, sync::Arc};

use async_trait::async_trait;

use crate::{
    clusterfile::ContainerRuntime, distributor::Distributor, fleet::Fleet, plugin::Plugin,
    BoxError,
};

pub mod installer;

pub use installer::{ScriptInstaller, ScriptInstallerFactory};

/// Image label carrying the cluster version the image installs.
pub const LABEL_CLUSTER_VERSION: &str = "io.keel.cluster.version";

/// Image label naming where the installer writes its resolved configuration on the hosts.
pub const LABEL_CONF_PATH: &str = "io.keel.cluster.conf-path";

/// Image label holding the upgrade command, relative to the cluster root when not absolute.
pub const LABEL_UPGRADE_CMD: &str = "io.keel.cluster.upgrade-cmd";

pub const DEFAULT_CONF_PATH: &str = "/etc/keel/cluster.toml";
pub const DEFAULT_UPGRADE_CMD: &str = "scripts/upgrade.sh";

/// Everything the installer needs that does not change for the length of one attempt.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub distributor: Arc<dyn Distributor>,
    pub plugins: Vec<Plugin>,
    pub container_runtime: ContainerRuntime,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClusterInstallInfo {
    pub version: Option<String>,
    pub container_runtime: String,
    pub conf_path: PathBuf,
    pub upgrade_cmd: String,
}

/// Derive install information from an image's labels.
pub fn cluster_install_info(
    labels: &BTreeMap<String, String>,
    container_runtime: &ContainerRuntime,
) -> ClusterInstallInfo {
    ClusterInstallInfo {
        version: labels.get(LABEL_CLUSTER_VERSION).cloned(),
        container_runtime: container_runtime.kind.clone(),
        conf_path: cluster_conf_path(labels),
        upgrade_cmd: labels
            .get(LABEL_UPGRADE_CMD)
            .cloned()
            .unwrap_or_else(|| DEFAULT_UPGRADE_CMD.to_string()),
    }
}

pub fn cluster_conf_path(labels: &BTreeMap<String, String>) -> PathBuf {
    labels
        .get(LABEL_CONF_PATH)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONF_PATH))
}

#[async_trait]
pub trait Installer: Send + Sync {
    /// Upgrade the running cluster to the image the installer was built for.
    async fn upgrade(&self) -> Result<(), BoxError>;
}

pub trait InstallerFactory: fmt::Debug + Send + Sync {
    fn new_installer(
        &self,
        fleet: Arc<Fleet>,
        config: RuntimeConfig,
        info: ClusterInstallInfo,
    ) -> Result<Box<dyn Installer>, BoxError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_info_defaults() {
        let info = cluster_install_info(&BTreeMap::new(), &ContainerRuntime::default());
        assert_eq!(info.version, None);
        assert_eq!(info.conf_path, PathBuf::from(DEFAULT_CONF_PATH));
        assert_eq!(info.upgrade_cmd, DEFAULT_UPGRADE_CMD);
        assert_eq!(info.container_runtime, "containerd");

        let labels = BTreeMap::from([
            (LABEL_CLUSTER_VERSION.to_string(), "v1.30.2".to_string()),
            (LABEL_CONF_PATH.to_string(), "/etc/kube/keel.toml".to_string()),
        ]);
        let info = cluster_install_info(&labels, &ContainerRuntime::default());
        assert_eq!(info.version.as_deref(), Some("v1.30.2"));
        assert_eq!(info.conf_path, PathBuf::from("/etc/kube/keel.toml"));
    }
}
