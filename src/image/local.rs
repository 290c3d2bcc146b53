// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! A directory-backed image store.
//!
//! Each image is a directory under the store root named after its reference (with `/` and `:`
//! replaced by `_`):
//!
//! ```text
//! <root>/keel_cluster_v2/
//!     image.toml               name + extension
//!     rootfs/linux-amd64/      payload for one platform
//!     rootfs/linux-arm64-v8/
//! ```
//!
//! Images are identified by the sha256 of their `image.toml`. The store does not fetch images
//! from anywhere; they must already be unpacked under the root.

use std::{
    collections::HashMap,
    fs, io,
    path::{Path, PathBuf},
    sync::Mutex,
};

use {
    async_trait::async_trait,
    log::debug,
    serde::Deserialize,
    sha2::{Digest, Sha256},
    thiserror::Error,
};

use crate::{
    fleet::Platform,
    image::{ImageEngine, ImageExtension, ImageSpec, PullOptions, PullPolicy},
    BoxError,
};

const DESCRIPTOR_FILE: &str = "image.toml";

#[derive(Debug, Error)]
pub enum LocalStoreError {
    #[error("image \"{0}\" not found in local store")]
    NotFound(String),
    #[error("image \"{image}\" has no payload for platform {platform}")]
    NoPlatform { image: String, platform: String },
    #[error("\"{}\" is not mounted", .0.display())]
    NotMounted(PathBuf),
    #[error("pull policy 'always' needs a remote registry, which the local store does not have")]
    CannotPull,
    #[error("could not read \"{}\": {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid image descriptor \"{}\": {source}", .path.display())]
    Descriptor {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Deserialize)]
struct Descriptor {
    name: String,
    extension: ImageExtension,
}

#[derive(Debug)]
pub struct LocalImageStore {
    root: PathBuf,
    /// Mount directories currently handed out, with their reference counts.
    mounts: Mutex<HashMap<PathBuf, usize>>,
}

impl LocalImageStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        LocalImageStore {
            root: root.into(),
            mounts: Mutex::new(HashMap::new()),
        }
    }

    fn image_dir(&self, image: &str) -> PathBuf {
        self.root.join(image.replace(['/', ':'], "_"))
    }

    fn read_descriptor(dir: &Path) -> Result<ImageSpec, LocalStoreError> {
        let path = dir.join(DESCRIPTOR_FILE);
        let raw = fs::read(&path).map_err(|source| LocalStoreError::Io {
            path: path.clone(),
            source,
        })?;
        let descriptor: Descriptor = toml::from_str(&String::from_utf8_lossy(&raw))
            .map_err(|source| LocalStoreError::Descriptor { path, source })?;
        Ok(ImageSpec {
            id: hex::encode(Sha256::digest(&raw)),
            name: descriptor.name,
            extension: descriptor.extension,
        })
    }

    fn find_by_id(&self, id: &str) -> Result<Option<ImageSpec>, LocalStoreError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(LocalStoreError::Io {
                    path: self.root.clone(),
                    source,
                })
            }
        };
        for entry in entries.flatten() {
            if !entry.path().join(DESCRIPTOR_FILE).exists() {
                continue;
            }
            let spec = Self::read_descriptor(&entry.path())?;
            if spec.id == id || spec.id.starts_with(id) {
                return Ok(Some(spec));
            }
        }
        Ok(None)
    }

    /// Directory names tried for `platform`, most specific first.
    fn platform_dirs(platform: &Platform) -> Vec<String> {
        let base = format!("{}-{}", platform.os, platform.architecture);
        match &platform.variant {
            Some(v) => vec![format!("{base}-{v}"), base],
            None => vec![base],
        }
    }
}

#[async_trait]
impl ImageEngine for LocalImageStore {
    async fn pull(&self, opts: &PullOptions) -> Result<String, BoxError> {
        if opts.policy == PullPolicy::Always {
            return Err(Box::new(LocalStoreError::CannotPull));
        }
        let dir = self.image_dir(&opts.image);
        if !dir.join(DESCRIPTOR_FILE).exists() {
            return Err(Box::new(LocalStoreError::NotFound(opts.image.clone())));
        }
        Ok(Self::read_descriptor(&dir)?.id)
    }

    async fn inspect(&self, name_or_id: &str) -> Result<ImageSpec, BoxError> {
        let dir = self.image_dir(name_or_id);
        if dir.join(DESCRIPTOR_FILE).exists() {
            return Ok(Self::read_descriptor(&dir)?);
        }
        match self.find_by_id(name_or_id)? {
            Some(spec) => Ok(spec),
            None => Err(Box::new(LocalStoreError::NotFound(name_or_id.to_string()))),
        }
    }

    async fn mount(&self, image: &str, platform: &Platform) -> Result<PathBuf, BoxError> {
        let rootfs = self.image_dir(image).join("rootfs");
        let dir = Self::platform_dirs(platform)
            .into_iter()
            .map(|name| rootfs.join(name))
            .find(|dir| dir.is_dir())
            .ok_or_else(|| LocalStoreError::NoPlatform {
                image: image.to_string(),
                platform: platform.to_string(),
            })?;

        *self
            .mounts
            .lock()
            .unwrap()
            .entry(dir.clone())
            .or_insert(0) += 1;
        debug!("mounted {image} ({platform}) at \"{}\"", dir.display());
        Ok(dir)
    }

    async fn umount(&self, image: &str, mount_dir: &Path) -> Result<(), BoxError> {
        let mut mounts = self.mounts.lock().unwrap();
        match mounts.get_mut(mount_dir) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                mounts.remove(mount_dir);
            }
            None => return Err(Box::new(LocalStoreError::NotMounted(mount_dir.to_path_buf()))),
        }
        debug!("unmounted {image} from \"{}\"", mount_dir.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_image() -> (tempfile::TempDir, LocalImageStore) {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("keel_cluster_v2");
        fs::create_dir_all(image.join("rootfs/linux-amd64")).unwrap();
        fs::create_dir_all(image.join("rootfs/linux-arm64")).unwrap();
        fs::write(
            image.join(DESCRIPTOR_FILE),
            r#"
            name = "keel/cluster:v2"
            [extension]
            type = "cluster-installer"
            [extension.labels]
            "io.keel.cluster.version" = "v2"
            "#,
        )
        .unwrap();
        let store = LocalImageStore::new(dir.path());
        (dir, store)
    }

    #[tokio::test]
    async fn pull_and_inspect() {
        let (_dir, store) = store_with_image();
        let id = store.pull(&PullOptions::new("keel/cluster:v2")).await.unwrap();
        assert_eq!(id.len(), 64);

        let by_name = store.inspect("keel/cluster:v2").await.unwrap();
        let by_id = store.inspect(&id[..12]).await.unwrap();
        assert_eq!(by_name, by_id);
        assert_eq!(by_id.extension.kind, crate::image::ImageType::ClusterInstaller);

        assert!(store.pull(&PullOptions::new("keel/other:v1")).await.is_err());
    }

    #[tokio::test]
    async fn mount_falls_back_to_base_platform() {
        let (_dir, store) = store_with_image();
        let arm = Platform::from_uname("Linux aarch64").unwrap();
        let dir = store.mount("keel/cluster:v2", &arm).await.unwrap();
        assert!(dir.ends_with("rootfs/linux-arm64"));

        store.umount("keel/cluster:v2", &dir).await.unwrap();
        assert!(store.umount("keel/cluster:v2", &dir).await.is_err());

        let s390 = Platform::new("linux", "s390x");
        assert!(store.mount("keel/cluster:v2", &s390).await.is_err());
    }
}
