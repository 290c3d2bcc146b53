// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Cluster images: what an image declares about itself, and the engine used to pull, inspect and
//! mount images.

use std::{
    collections::BTreeMap,
    fmt,
    path::{Path, PathBuf},
};

use {
    async_trait::async_trait,
    serde::{Deserialize, Serialize},
};

use crate::{fleet::Platform, BoxError};

pub mod local;
pub mod mount;

pub use mount::{ImageMounter, MountEntry, MountError, MountInfo};

/// The kinds of image keel knows about. Only `ClusterInstaller` images can drive an upgrade.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ImageType {
    ClusterInstaller,
    AppInstaller,
}

impl fmt::Display for ImageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                ImageType::ClusterInstaller => "cluster-installer",
                ImageType::AppInstaller => "app-installer",
            }
        )
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Launch {
    #[serde(default)]
    pub cmds: Vec<String>,
    #[serde(default)]
    pub app_names: Vec<String>,
}

/// The metadata an image carries about how it installs and upgrades a cluster.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ImageExtension {
    #[serde(rename = "type")]
    pub kind: ImageType,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub launch: Launch,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// The result of inspecting an image.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ImageSpec {
    #[serde(default)]
    pub id: String,
    pub name: String,
    pub extension: ImageExtension,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PullPolicy {
    Always,
    /// Only fetch the image if it is not already present.
    #[default]
    Missing,
    Never,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PullOptions {
    pub image: String,
    pub policy: PullPolicy,
    /// Platform to pull for. `None` means the platform keel itself runs on.
    pub platform: Option<Platform>,
}

impl PullOptions {
    pub fn new(image: &str) -> Self {
        PullOptions {
            image: image.to_string(),
            policy: PullPolicy::Missing,
            platform: None,
        }
    }
}

/// The image engine: resolves references to images, reads their metadata, and makes their
/// payload available as a local directory.
#[async_trait]
pub trait ImageEngine: fmt::Debug + Send + Sync {
    /// Make `opts.image` available locally and return its id.
    async fn pull(&self, opts: &PullOptions) -> Result<String, BoxError>;

    /// Read the metadata of an image given its name or id.
    async fn inspect(&self, name_or_id: &str) -> Result<ImageSpec, BoxError>;

    /// Materialize the payload of `image` for `platform`, returning the directory holding it.
    async fn mount(&self, image: &str, platform: &Platform) -> Result<PathBuf, BoxError>;

    /// Release a directory returned by `mount`.
    async fn umount(&self, image: &str, mount_dir: &Path) -> Result<(), BoxError>;
}
