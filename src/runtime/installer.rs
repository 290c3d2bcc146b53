// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::{path::PathBuf, sync::Arc};

use {
    async_trait::async_trait,
    log::info,
    thiserror::Error,
};

use crate::{
    distributor::DistributeError,
    fleet::{Fleet, Role},
    plugin::{self, Phase, PluginError},
    pool,
    probe::{self, ConnectivityError},
    registry::{self, RegistryError},
    remote::{shell_quote, Env, RemoteError},
    runtime::{ClusterInstallInfo, Installer, InstallerFactory, RuntimeConfig},
    BoxError,
};

#[derive(Debug, Error)]
pub enum InstallError {
    #[error(transparent)]
    Connectivity(#[from] ConnectivityError),
    #[error(transparent)]
    Plugin(#[from] PluginError),
    #[error(transparent)]
    Distribute(#[from] DistributeError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("upgrade command failed: {0}")]
    Command(#[source] RemoteError),
    #[error("upgrade command failed on {} host(s): {}", .0.len(), format_failures(.0))]
    Commands(Vec<RemoteError>),
}

impl InstallError {
    /// The hosts the upgrade command failed on.
    pub fn failed_hosts(&self) -> Vec<&str> {
        match self {
            InstallError::Command(e) => vec![e.host()],
            InstallError::Commands(failures) => failures.iter().map(RemoteError::host).collect(),
            _ => Vec::new(),
        }
    }
}

fn format_failures(failures: &[RemoteError]) -> String {
    failures
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// An installer that drives the upgrade script shipped inside the image.
///
/// An upgrade runs these steps, stopping at the first failure:
///
/// 1. Check that every host accepts remote commands.
/// 2. Run `pre-upgrade` plugins.
/// 3. Copy the image payload (and Clusterfile configs) to every host.
/// 4. Load the local registry.
/// 5. Run the upgrade command on masters one at a time, then on every other host.
/// 6. Run `post-upgrade` plugins.
pub struct ScriptInstaller {
    fleet: Arc<Fleet>,
    config: RuntimeConfig,
    info: ClusterInstallInfo,
}

impl ScriptInstaller {
    pub fn new(fleet: Arc<Fleet>, config: RuntimeConfig, info: ClusterInstallInfo) -> Self {
        ScriptInstaller {
            fleet,
            config,
            info,
        }
    }

    fn upgrade_command(&self) -> String {
        let cmd = PathBuf::from(&self.info.upgrade_cmd);
        let cmd = if cmd.is_absolute() {
            cmd
        } else {
            self.fleet.cluster_root().join(cmd)
        };
        shell_quote(&cmd.display().to_string())
    }

    fn upgrade_env(&self, role: Role) -> Env {
        let mut env = Env::from([
            (
                "KEEL_CLUSTER_ROOT".to_string(),
                self.fleet.cluster_root().display().to_string(),
            ),
            (
                "KEEL_CONTAINER_RUNTIME".to_string(),
                self.config.container_runtime.kind.clone(),
            ),
            (
                "KEEL_CONF_PATH".to_string(),
                self.info.conf_path.display().to_string(),
            ),
            ("KEEL_ROLE".to_string(), role.to_string()),
        ]);
        if let Some(version) = &self.info.version {
            env.insert("KEEL_CLUSTER_VERSION".to_string(), version.clone());
        }
        env
    }

    async fn run_upgrade_command(&self) -> Result<(), InstallError> {
        let command = self.upgrade_command();

        let masters = self.fleet.hosts_by_role(Role::Master);
        for master in masters.iter() {
            info!("upgrading master {master}");
            self.fleet
                .exec(master, &self.upgrade_env(Role::Master), &command)
                .await
                .map_err(InstallError::Command)?;
        }

        let others: Vec<String> = self
            .fleet
            .all_hosts()
            .into_iter()
            .filter(|h| !masters.contains(h))
            .collect();
        if others.is_empty() {
            return Ok(());
        }
        info!("upgrading {} non-master host(s)", others.len());
        let results = pool::run_bounded(others, self.fleet.parallelism(), |host| {
            let fleet = Arc::clone(&self.fleet);
            let env = self.upgrade_env(Role::Worker);
            let command = command.clone();
            async move { fleet.exec(&host, &env, &command).await }
        })
        .await;
        let failures: Vec<RemoteError> = results.into_iter().filter_map(Result::err).collect();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(InstallError::Commands(failures))
        }
    }

    async fn run(&self) -> Result<(), InstallError> {
        let hosts = self.fleet.all_hosts();
        if let (_, Some(e)) = probe::check_hosts(&self.fleet, &hosts).await {
            return Err(e.into());
        }

        plugin::run_plugins(&self.fleet, &self.config.plugins, Phase::PreUpgrade).await?;

        self.config
            .distributor
            .distribute_rootfs(&hosts, self.fleet.cluster_root())
            .await?;

        registry::load_to_registry(&self.fleet, self.config.distributor.as_ref()).await?;

        self.run_upgrade_command().await?;

        plugin::run_plugins(&self.fleet, &self.config.plugins, Phase::PostUpgrade).await?;
        Ok(())
    }
}

#[async_trait]
impl Installer for ScriptInstaller {
    async fn upgrade(&self) -> Result<(), BoxError> {
        info!(
            "upgrading cluster '{}' to version {}",
            self.fleet.name(),
            self.info.version.as_deref().unwrap_or("<unlabeled>")
        );
        Ok(self.run().await?)
    }
}

#[derive(Debug, Default)]
pub struct ScriptInstallerFactory;

impl InstallerFactory for ScriptInstallerFactory {
    fn new_installer(
        &self,
        fleet: Arc<Fleet>,
        config: RuntimeConfig,
        info: ClusterInstallInfo,
    ) -> Result<Box<dyn Installer>, BoxError> {
        Ok(Box::new(ScriptInstaller::new(fleet, config, info)))
    }
}
