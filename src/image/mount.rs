// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::{
    collections::BTreeMap,
    path::PathBuf,
    sync::Arc,
};

use {
    futures::future,
    log::{debug, error, info},
    thiserror::Error,
};

use crate::{fleet::Platform, image::ImageEngine, BoxError};

#[derive(Debug, Error)]
pub enum MountError {
    #[error("failed to mount {image} for {platform}: {source}")]
    Mount {
        image: String,
        platform: Platform,
        #[source]
        source: BoxError,
    },
    #[error("failed to unmount {image} from \"{}\": {source}", .mount_dir.display())]
    Umount {
        image: String,
        mount_dir: PathBuf,
        #[source]
        source: BoxError,
    },
}

/// The payload of one image, materialized for one platform, and the hosts that run it.
#[derive(Debug, Clone, PartialEq)]
pub struct MountEntry {
    pub platform: Platform,
    pub hosts: Vec<String>,
    pub mount_dir: PathBuf,
}

/// Everything mounted for one upgrade attempt.
///
/// A MountInfo can only be released by handing it back to `ImageMounter::umount`, which consumes
/// it, so it cannot be released twice.
#[derive(Debug, PartialEq)]
pub struct MountInfo {
    image: String,
    entries: Vec<MountEntry>,
}

impl MountInfo {
    pub fn image(&self) -> &str {
        &self.image
    }

    pub fn entries(&self) -> &[MountEntry] {
        &self.entries
    }
}

/// Mounts an image once per distinct platform in the fleet.
#[derive(Debug)]
pub struct ImageMounter {
    engine: Arc<dyn ImageEngine>,
    platforms: BTreeMap<Platform, Vec<String>>,
}

impl ImageMounter {
    pub fn new(engine: Arc<dyn ImageEngine>, host_platforms: &BTreeMap<String, Platform>) -> Self {
        let mut platforms: BTreeMap<Platform, Vec<String>> = BTreeMap::new();
        for (host, platform) in host_platforms {
            platforms
                .entry(platform.clone())
                .or_default()
                .push(host.clone());
        }
        ImageMounter { engine, platforms }
    }

    /// Mount `image` for every platform.
    ///
    /// If one platform fails, the platforms already mounted are released before the error is
    /// returned, so a failed mount leaves nothing behind.
    pub async fn mount(&self, image: &str) -> Result<MountInfo, MountError> {
        let mut entries = Vec::new();
        for (platform, hosts) in self.platforms.iter() {
            match self.engine.mount(image, platform).await {
                Ok(mount_dir) => {
                    debug!("mounted {image} for {platform} at \"{}\"", mount_dir.display());
                    entries.push(MountEntry {
                        platform: platform.clone(),
                        hosts: hosts.clone(),
                        mount_dir,
                    });
                }
                Err(source) => {
                    let partial = MountInfo {
                        image: image.to_string(),
                        entries,
                    };
                    if let Err(e) = self.umount(partial).await {
                        error!("failed to release partial mount of {image}: {e}");
                    }
                    return Err(MountError::Mount {
                        image: image.to_string(),
                        platform: platform.clone(),
                        source,
                    });
                }
            }
        }

        info!("mounted {image} for {} platform(s)", entries.len());
        Ok(MountInfo {
            image: image.to_string(),
            entries,
        })
    }

    /// Release every entry of `info`. All entries are attempted; the first failure is returned.
    pub async fn umount(&self, info: MountInfo) -> Result<(), MountError> {
        let image = info.image;
        let releases = info.entries.into_iter().map(|entry| {
            let engine = Arc::clone(&self.engine);
            let image = image.clone();
            async move {
                engine
                    .umount(&image, &entry.mount_dir)
                    .await
                    .map_err(|source| MountError::Umount {
                        image,
                        mount_dir: entry.mount_dir,
                        source,
                    })
            }
        });

        let mut first_err = None;
        for result in future::join_all(releases).await {
            if let Err(e) = result {
                error!("{e}");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
