// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! The upgrade sequencer.
//!
//! An upgrade attempt is a fixed sequence of stages. Each stage must succeed before the next one
//! starts, and the first failure ends the attempt; nothing is retried and nothing is rolled back
//! automatically. Recovery is left to the operator, using the Clusterfile checkpoint written just
//! before the cluster is modified.
//!
//! Once the image is mounted, the mount is released exactly once before the attempt returns,
//! whether the attempt succeeded, failed, or was cancelled.

use std::{
    fmt, fs,
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use {
    log::{error, info, warn},
    thiserror::Error,
    tokio_util::sync::CancellationToken,
};

use crate::{
    application::{construct_application, AppDriverFactory},
    clusterfile::{valid_cluster_name, ClusterFile, ClusterFileError, ClusterFileStore, SaveOptions},
    distributor::{DistributeOption, Distributor, ScpDistributor},
    fleet::{Fleet, FleetError},
    image::{ImageEngine, ImageMounter, ImageSpec, ImageType, MountInfo, PullOptions},
    plugin,
    remote::RemoteExecutor,
    runtime::{self, InstallerFactory, RuntimeConfig},
    BoxError,
};

/// The stages of an upgrade attempt, in the order they run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    /// Read the operator's input: the Clusterfile, or the cluster's current record.
    LoadClusterfile,
    /// Make the image available locally and read its metadata.
    PullImage,
    Validate,
    /// Take the advisory lock that keeps two attempts off the same cluster.
    Lock,
    ResolveFleet,
    AcquireMount,
    BuildDistributor,
    AggregatePlugins,
    CheckpointPre,
    Install,
    LaunchApplication,
    SaveApplication,
    CheckpointPost,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Stage::LoadClusterfile => "load Clusterfile",
                Stage::PullImage => "pull image",
                Stage::Validate => "validate image",
                Stage::Lock => "lock cluster",
                Stage::ResolveFleet => "resolve fleet",
                Stage::AcquireMount => "mount image",
                Stage::BuildDistributor => "build distributor",
                Stage::AggregatePlugins => "load plugins",
                Stage::CheckpointPre => "checkpoint Clusterfile",
                Stage::Install => "upgrade cluster",
                Stage::LaunchApplication => "launch applications",
                Stage::SaveApplication => "save applications",
                Stage::CheckpointPost => "save Clusterfile",
            }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input: wrong image type, no hosts, missing image reference, a locked cluster.
    Configuration,
    /// Hosts could not be reached.
    Connectivity,
    /// The image could not be pulled, mounted or distributed.
    Acquisition,
    /// The installer or application driver failed.
    Execution,
    /// A checkpoint or record could not be written.
    Persistence,
    Cancelled,
}

#[derive(Debug, Error)]
#[error("failed to {stage}: {source}")]
pub struct UpgradeError {
    pub stage: Stage,
    pub kind: ErrorKind,
    #[source]
    pub source: BoxError,
}

impl UpgradeError {
    pub fn new(stage: Stage, kind: ErrorKind, source: impl Into<BoxError>) -> Self {
        UpgradeError {
            stage,
            kind,
            source: source.into(),
        }
    }
}

#[derive(Debug, Error)]
#[error("exit upgrade process, wrong image type: {0} (expected cluster-installer)")]
pub struct WrongImageType(pub ImageType);

#[derive(Debug, Error)]
#[error("upgrade was cancelled")]
pub struct Cancelled;

#[derive(Debug, Error)]
pub enum InputError {
    #[error("the Clusterfile does not name an image")]
    NoImage,
    #[error("invalid cluster name \"{0}\": it must be a single path component")]
    BadClusterName(String),
    #[error("cluster '{cluster}' is locked by another upgrade (remove \"{}\" if that upgrade is gone)", .path.display())]
    Locked { cluster: String, path: PathBuf },
    #[error("could not create lock \"{}\": {source}", .path.display())]
    LockIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct UpgradeOptions {
    /// Send every file to the hosts even if they already have it.
    pub ignore_cache: bool,
}

/// An advisory lock on one cluster, held for the length of an attempt.
#[derive(Debug)]
pub struct UpgradeLock {
    path: PathBuf,
}

impl UpgradeLock {
    pub const FILE: &'static str = "upgrade.lock";

    pub fn acquire(dir: &Path, cluster: &str) -> Result<Self, InputError> {
        if !valid_cluster_name(cluster) {
            return Err(InputError::BadClusterName(cluster.to_string()));
        }
        let cluster_dir = dir.join(cluster);
        let path = cluster_dir.join(Self::FILE);
        fs::create_dir_all(&cluster_dir).map_err(|source| InputError::LockIo {
            path: path.clone(),
            source,
        })?;
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(mut file) => {
                // Dropped, and so removed again, if the owner cannot be recorded.
                let lock = UpgradeLock { path };
                writeln!(file, "{}", std::process::id()).map_err(|source| InputError::LockIo {
                    path: lock.path.clone(),
                    source,
                })?;
                Ok(lock)
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Err(InputError::Locked {
                cluster: cluster.to_string(),
                path,
            }),
            Err(source) => Err(InputError::LockIo { path, source }),
        }
    }
}

impl Drop for UpgradeLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("could not remove lock \"{}\": {e}", self.path.display());
        }
    }
}

/// The collaborators an upgrade is carried out with.
#[derive(Debug, Clone)]
pub struct Upgrader {
    pub engine: Arc<dyn ImageEngine>,
    pub executor: Arc<dyn RemoteExecutor>,
    pub store: Arc<dyn ClusterFileStore>,
    pub installers: Arc<dyn InstallerFactory>,
    pub apps: Arc<dyn AppDriverFactory>,
    pub parallelism: usize,
    /// Where advisory locks are taken. No locking when `None`.
    pub lock_dir: Option<PathBuf>,
}

impl Upgrader {
    /// Upgrade using the Clusterfile at `path`, to the image that Clusterfile names.
    pub async fn upgrade_with_clusterfile(
        &self,
        path: &Path,
        opts: &UpgradeOptions,
        cancel: &CancellationToken,
    ) -> Result<(), UpgradeError> {
        let cf = ClusterFile::from_path(path)
            .map_err(|e| UpgradeError::new(Stage::LoadClusterfile, ErrorKind::Configuration, e))?;
        if cf.cluster.image.is_empty() {
            return Err(UpgradeError::new(
                Stage::LoadClusterfile,
                ErrorKind::Configuration,
                InputError::NoImage,
            ));
        }
        let image = self.pull_and_inspect(&cf.cluster.image).await?;
        self.upgrade(cf, &image, opts, cancel).await
    }

    /// Upgrade the cluster's current desired state to `image_ref`.
    ///
    /// The current Clusterfile is kept as-is apart from its image (and its app names, if
    /// `app_names` is given): plugins, configs and the application declaration carry over.
    pub async fn upgrade_with_image(
        &self,
        image_ref: &str,
        cluster: Option<&str>,
        app_names: Option<Vec<String>>,
        opts: &UpgradeOptions,
        cancel: &CancellationToken,
    ) -> Result<(), UpgradeError> {
        let image = self.pull_and_inspect(image_ref).await?;
        let mut cf = self
            .store
            .load_current(cluster)
            .map_err(|e| UpgradeError::new(Stage::LoadClusterfile, ErrorKind::Configuration, e))?;
        cf.retarget(image_ref, app_names);
        self.upgrade(cf, &image, opts, cancel).await
    }

    /// Record the checkpoint of `cluster`'s last attempt as its last-known-good state.
    ///
    /// `upgrade` never does this itself. Callers commit once an attempt has succeeded, so a
    /// failed attempt never replaces the record of the state before it.
    pub fn commit(&self, cluster: &str) -> Result<(), ClusterFileError> {
        self.store.commit(cluster)
    }

    pub async fn pull_and_inspect(&self, image_ref: &str) -> Result<ImageSpec, UpgradeError> {
        let acquisition = |e: BoxError| UpgradeError::new(Stage::PullImage, ErrorKind::Acquisition, e);
        let id = self
            .engine
            .pull(&PullOptions::new(image_ref))
            .await
            .map_err(acquisition)?;
        self.engine.inspect(&id).await.map_err(acquisition)
    }

    /// Run one upgrade attempt of the cluster described by `cf` to `image`.
    pub async fn upgrade(
        &self,
        cf: ClusterFile,
        image: &ImageSpec,
        opts: &UpgradeOptions,
        cancel: &CancellationToken,
    ) -> Result<(), UpgradeError> {
        if image.extension.kind != ImageType::ClusterInstaller {
            return Err(UpgradeError::new(
                Stage::Validate,
                ErrorKind::Configuration,
                WrongImageType(image.extension.kind),
            ));
        }
        if !valid_cluster_name(&cf.cluster.name) {
            return Err(UpgradeError::new(
                Stage::Validate,
                ErrorKind::Configuration,
                InputError::BadClusterName(cf.cluster.name.clone()),
            ));
        }

        let _lock = match &self.lock_dir {
            Some(dir) => Some(
                UpgradeLock::acquire(dir, &cf.cluster.name)
                    .map_err(|e| UpgradeError::new(Stage::Lock, ErrorKind::Configuration, e))?,
            ),
            None => None,
        };

        let fleet = Fleet::new(
            &cf.cluster,
            &image.extension,
            Arc::clone(&self.executor),
            self.parallelism,
        )
        .map_err(|e| UpgradeError::new(Stage::ResolveFleet, ErrorKind::Configuration, e))?;
        let image_name = if fleet.image_name().is_empty() {
            image.name.clone()
        } else {
            fleet.image_name().to_string()
        };
        let platforms = fleet.platforms(&fleet.all_hosts()).await.map_err(|e| {
            let kind = match &e {
                FleetError::Remote(_) => ErrorKind::Connectivity,
                _ => ErrorKind::Configuration,
            };
            UpgradeError::new(Stage::ResolveFleet, kind, e)
        })?;
        let fleet = Arc::new(fleet);

        info!("start to upgrade cluster '{}' with image \"{image_name}\"", fleet.name());

        let mounter = ImageMounter::new(Arc::clone(&self.engine), &platforms);
        let mount_info = mounter
            .mount(&image_name)
            .await
            .map_err(|e| UpgradeError::new(Stage::AcquireMount, ErrorKind::Acquisition, e))?;

        // From here on the mount must be released on every path out.
        let current = Mutex::new(Stage::BuildDistributor);
        let outcome = if cancel.is_cancelled() {
            Err(UpgradeError::new(Stage::AcquireMount, ErrorKind::Cancelled, Cancelled))
        } else {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    let stage = *current.lock().unwrap();
                    Err(UpgradeError::new(stage, ErrorKind::Cancelled, Cancelled))
                }
                result = self.run_mounted(&cf, image, &fleet, &mount_info, opts, &current) => result,
            }
        };

        if let Err(e) = mounter.umount(mount_info).await {
            error!("failed to unmount image \"{image_name}\": {e}");
        }

        if outcome.is_ok() {
            info!("succeeded in upgrading cluster with image \"{image_name}\"");
        }
        outcome
    }

    /// The stages that run while the image is mounted. `current` tracks the stage in progress so
    /// a cancellation can report where it happened.
    async fn run_mounted(
        &self,
        cf: &ClusterFile,
        image: &ImageSpec,
        fleet: &Arc<Fleet>,
        mount_info: &MountInfo,
        opts: &UpgradeOptions,
        current: &Mutex<Stage>,
    ) -> Result<(), UpgradeError> {
        let enter = |stage: Stage| *current.lock().unwrap() = stage;

        enter(Stage::BuildDistributor);
        let distributor: Arc<dyn Distributor> = Arc::new(
            ScpDistributor::new(
                mount_info,
                fleet,
                cf.configs.clone(),
                DistributeOption {
                    ignore_cache: opts.ignore_cache,
                },
            )
            .map_err(|e| UpgradeError::new(Stage::BuildDistributor, ErrorKind::Acquisition, e))?,
        );

        enter(Stage::AggregatePlugins);
        let image_plugins = plugin::load_plugins_from_image(mount_info).map_err(|e| {
            UpgradeError::new(Stage::AggregatePlugins, ErrorKind::Configuration, e)
        })?;
        let plugins = plugin::aggregate(image_plugins, &cf.plugins);

        // Saved before the cluster is touched, so a failed upgrade can be cleaned up from it.
        enter(Stage::CheckpointPre);
        self.store
            .save_all(cf, &SaveOptions::default())
            .map_err(|e| UpgradeError::new(Stage::CheckpointPre, ErrorKind::Persistence, e))?;

        enter(Stage::Install);
        let runtime_config = RuntimeConfig {
            distributor,
            plugins,
            container_runtime: cf.cluster.container_runtime.clone(),
        };
        let install_info = runtime::cluster_install_info(
            &image.extension.labels,
            &runtime_config.container_runtime,
        );
        let installer = self
            .installers
            .new_installer(Arc::clone(fleet), runtime_config, install_info)
            .map_err(|e| UpgradeError::new(Stage::Install, ErrorKind::Configuration, e))?;
        installer
            .upgrade()
            .await
            .map_err(|e| UpgradeError::new(Stage::Install, ErrorKind::Execution, e))?;

        enter(Stage::LaunchApplication);
        let app = construct_application(
            cf.application.as_ref(),
            fleet.launch_cmds(),
            fleet.launch_apps(),
            fleet.env(),
        );
        let app_driver = self
            .apps
            .new_app_driver(app, &image.extension)
            .map_err(|e| {
                UpgradeError::new(Stage::LaunchApplication, ErrorKind::Configuration, e)
            })?;
        app_driver
            .launch(fleet)
            .await
            .map_err(|e| UpgradeError::new(Stage::LaunchApplication, ErrorKind::Execution, e))?;

        enter(Stage::SaveApplication);
        app_driver
            .save()
            .map_err(|e| UpgradeError::new(Stage::SaveApplication, ErrorKind::Persistence, e))?;

        enter(Stage::CheckpointPost);
        let opts = SaveOptions {
            commit_to_cluster: false,
            conf_path: Some(runtime::cluster_conf_path(&image.extension.labels)),
        };
        self.store
            .save_all(cf, &opts)
            .map_err(|e| UpgradeError::new(Stage::CheckpointPost, ErrorKind::Persistence, e))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let lock = UpgradeLock::acquire(dir.path(), "prod").unwrap();
        assert!(matches!(
            UpgradeLock::acquire(dir.path(), "prod"),
            Err(InputError::Locked { .. })
        ));
        // Other clusters are unaffected.
        let _other = UpgradeLock::acquire(dir.path(), "staging").unwrap();

        drop(lock);
        assert!(UpgradeLock::acquire(dir.path(), "prod").is_ok());
    }

    #[test]
    fn lock_records_owner() {
        let dir = tempfile::tempdir().unwrap();
        let _lock = UpgradeLock::acquire(dir.path(), "prod").unwrap();
        let owner = fs::read_to_string(dir.path().join("prod").join(UpgradeLock::FILE)).unwrap();
        assert_eq!(owner.trim(), std::process::id().to_string());
    }

    #[test]
    fn lock_rejects_escaping_names() {
        let dir = tempfile::tempdir().unwrap();
        let state = dir.path().join("state");
        assert!(matches!(
            UpgradeLock::acquire(&state, "../outside"),
            Err(InputError::BadClusterName(_))
        ));
        assert!(!dir.path().join("outside").exists());
        assert!(!state.exists());
    }

    #[test]
    fn error_names_stage() {
        let e = UpgradeError::new(
            Stage::Validate,
            ErrorKind::Configuration,
            WrongImageType(ImageType::AppInstaller),
        );
        assert_eq!(
            e.to_string(),
            "failed to validate image: exit upgrade process, wrong image type: app-installer \
             (expected cluster-installer)"
        );
    }
}
