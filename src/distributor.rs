// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Copies mounted image payload to cluster hosts.
//!
//! Transfers are content addressed: every destination directory on a host holds a manifest
//! (`.keel-manifest`) listing the sha256 of each file keel put there. Before copying, the host's
//! manifest is compared with the local payload and only files whose digest changed are sent.
//! Symlinks are recorded by their target and recreated on the host rather than copied.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt, fs,
    io::{self, Write},
    path::{Component, Path, PathBuf},
    sync::Arc,
};

use {
    async_trait::async_trait,
    log::{debug, info, warn},
    sha2::{Digest, Sha256},
    tempfile::{Builder, NamedTempFile},
    thiserror::Error,
};

use crate::{
    clusterfile::Config,
    fleet::Fleet,
    image::MountInfo,
    pool,
    remote::{shell_quote, Env, RemoteError, RemoteExecutor},
};

pub const MANIFEST_FILE: &str = ".keel-manifest";

/// Subtree of an image holding the local registry's data.
pub const REGISTRY_DIR: &str = "registry";

/// Subtree of an image holding its plugin definitions.
pub const PLUGINS_DIR: &str = "plugins";

/// Marks a manifest entry as a symlink: `link:<target>` in place of a digest.
pub const LINK_PREFIX: &str = "link:";

/// Relative path to sha256 hex digest, or to `link:<target>` for a symlink.
pub type Manifest = BTreeMap<PathBuf, String>;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("could not read \"{}\": {source}", .path.display())]
    Local {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("no mounted payload for this host's platform")]
    NoMount,
}

#[derive(Debug, Error)]
pub enum DistributeError {
    #[error("mount directory \"{}\" does not exist", .0.display())]
    MissingMount(PathBuf),
    #[error("config '{name}' is invalid: {reason}")]
    BadConfig { name: String, reason: String },
    #[error("failed to distribute to host(s): {}", format_failures(.0))]
    Hosts(Vec<(String, TransferError)>),
}

impl DistributeError {
    /// The hosts a transfer failed on.
    pub fn failed_hosts(&self) -> Vec<&str> {
        match self {
            DistributeError::Hosts(failures) => failures.iter().map(|(h, _)| h.as_str()).collect(),
            _ => Vec::new(),
        }
    }
}

fn format_failures(failures: &[(String, TransferError)]) -> String {
    failures
        .iter()
        .map(|(host, e)| format!("{host} ({e})"))
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DistributeOption {
    /// Send every file, ignoring what the hosts already have.
    pub ignore_cache: bool,
}

/// Moves image payload onto hosts. Handed to the installer as part of its runtime config.
#[async_trait]
pub trait Distributor: fmt::Debug + Send + Sync {
    /// Copy the image's payload (everything except the registry data) to `dest` on each of
    /// `hosts`, along with any Clusterfile config payloads meant for each host.
    async fn distribute_rootfs(&self, hosts: &[String], dest: &Path)
        -> Result<(), DistributeError>;

    /// Copy the image's registry data to `dest` on each of `hosts`.
    async fn distribute_registry(
        &self,
        hosts: &[String],
        dest: &Path,
    ) -> Result<(), DistributeError>;
}

/// A Distributor that transfers files one by one over the fleet's remote executor.
#[derive(Debug)]
pub struct ScpDistributor {
    mounts: Vec<(PathBuf, Vec<String>)>,
    configs: Vec<Config>,
    executor: Arc<dyn RemoteExecutor>,
    parallelism: usize,
    option: DistributeOption,
}

impl ScpDistributor {
    /// Bind a distributor to a mounted image.
    ///
    /// Fails if a mount directory is missing or a config payload would be written outside the
    /// destination directory or to a host outside the fleet.
    pub fn new(
        mount_info: &MountInfo,
        fleet: &Fleet,
        configs: Vec<Config>,
        option: DistributeOption,
    ) -> Result<Self, DistributeError> {
        let mut mounts = Vec::new();
        for entry in mount_info.entries() {
            if !entry.mount_dir.is_dir() {
                return Err(DistributeError::MissingMount(entry.mount_dir.clone()));
            }
            mounts.push((entry.mount_dir.clone(), entry.hosts.clone()));
        }

        for config in configs.iter() {
            if !is_contained(&config.path) {
                return Err(DistributeError::BadConfig {
                    name: config.name.clone(),
                    reason: format!(
                        "path \"{}\" must be relative and stay inside the cluster root",
                        config.path.display()
                    ),
                });
            }
            for host in config.hosts.iter().flatten() {
                if fleet.host(host).is_none() {
                    return Err(DistributeError::BadConfig {
                        name: config.name.clone(),
                        reason: format!("host {host} is not part of the cluster"),
                    });
                }
            }
        }

        Ok(ScpDistributor {
            mounts,
            configs,
            executor: Arc::clone(fleet.executor()),
            parallelism: fleet.parallelism(),
            option,
        })
    }

    fn mount_for(&self, host: &str) -> Option<&Path> {
        self.mounts
            .iter()
            .find(|(_, hosts)| hosts.iter().any(|h| h == host))
            .map(|(dir, _)| dir.as_path())
    }

    async fn distribute(
        &self,
        hosts: &[String],
        subtree: Option<&str>,
        exclude: &[&str],
        dest: &Path,
        with_configs: bool,
    ) -> Result<(), DistributeError> {
        // Hash each platform's payload once, no matter how many hosts share it.
        let mut manifests: BTreeMap<PathBuf, Arc<(PathBuf, Manifest)>> = BTreeMap::new();
        let mut jobs = Vec::new();
        let mut failures = Vec::new();

        for host in hosts {
            let Some(mount_dir) = self.mount_for(host) else {
                failures.push((host.clone(), TransferError::NoMount));
                continue;
            };
            let source = match subtree {
                Some(sub) => mount_dir.join(sub),
                None => mount_dir.to_path_buf(),
            };
            let local = match manifests.get(&source) {
                Some(m) => Arc::clone(m),
                None => match build_manifest(&source, exclude) {
                    Ok(m) => {
                        let m = Arc::new((source.clone(), m));
                        manifests.insert(source.clone(), Arc::clone(&m));
                        m
                    }
                    Err(e) => {
                        failures.push((host.clone(), e));
                        continue;
                    }
                },
            };

            let configs = if with_configs {
                self.configs
                    .iter()
                    .filter(|c| match &c.hosts {
                        Some(only) => only.iter().any(|h| h == host),
                        None => true,
                    })
                    .cloned()
                    .collect()
            } else {
                Vec::new()
            };

            jobs.push(HostJob {
                host: host.clone(),
                local,
                dest: dest.to_path_buf(),
                configs,
                ignore_cache: self.option.ignore_cache,
                executor: Arc::clone(&self.executor),
            });
        }

        let results = pool::run_bounded(jobs, self.parallelism, |job| async move {
            let host = job.host.clone();
            (host, job.run().await)
        })
        .await;

        for (host, result) in results {
            if let Err(e) = result {
                warn!("distribution to {host} failed: {e}");
                failures.push((host, e));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(DistributeError::Hosts(failures))
        }
    }
}

#[async_trait]
impl Distributor for ScpDistributor {
    async fn distribute_rootfs(
        &self,
        hosts: &[String],
        dest: &Path,
    ) -> Result<(), DistributeError> {
        info!("distributing image payload to {} host(s)", hosts.len());
        self.distribute(hosts, None, &[REGISTRY_DIR], dest, true).await
    }

    async fn distribute_registry(
        &self,
        hosts: &[String],
        dest: &Path,
    ) -> Result<(), DistributeError> {
        info!("distributing registry data to {}", hosts.join(", "));
        self.distribute(hosts, Some(REGISTRY_DIR), &[], dest, false)
            .await
    }
}

/// The transfer of one payload to one host.
struct HostJob {
    host: String,
    local: Arc<(PathBuf, Manifest)>,
    dest: PathBuf,
    configs: Vec<Config>,
    ignore_cache: bool,
    executor: Arc<dyn RemoteExecutor>,
}

impl HostJob {
    async fn run(self) -> Result<(), TransferError> {
        let (source, manifest) = &*self.local;

        let remote = if self.ignore_cache {
            Manifest::new()
        } else {
            self.remote_manifest().await?
        };
        let changed: Vec<(&PathBuf, &String)> = manifest
            .iter()
            .filter(|(path, digest)| remote.get(*path) != Some(*digest))
            .collect();
        debug!(
            "{}: {} of {} file(s) changed under \"{}\"",
            self.host,
            changed.len(),
            manifest.len(),
            self.dest.display()
        );

        let mut dirs: BTreeSet<PathBuf> = BTreeSet::from([self.dest.clone()]);
        for (path, _) in changed.iter() {
            if let Some(parent) = self.dest.join(path).parent() {
                dirs.insert(parent.to_path_buf());
            }
        }
        for config in self.configs.iter() {
            if let Some(parent) = self.dest.join(&config.path).parent() {
                dirs.insert(parent.to_path_buf());
            }
        }
        let mkdir = dirs
            .iter()
            .map(|d| shell_quote(&d.display().to_string()))
            .collect::<Vec<_>>()
            .join(" ");
        self.executor
            .exec(&self.host, &Env::new(), &format!("mkdir -p {mkdir}"))
            .await?;

        for (path, digest) in changed {
            let remote = self.dest.join(path);
            match digest.strip_prefix(LINK_PREFIX) {
                Some(target) => {
                    let command = format!(
                        "ln -sfn {} {}",
                        shell_quote(target),
                        shell_quote(&remote.display().to_string())
                    );
                    self.executor.exec(&self.host, &Env::new(), &command).await?;
                }
                None => {
                    self.executor
                        .copy(&self.host, &source.join(path), &remote)
                        .await?;
                }
            }
        }

        for config in self.configs.iter() {
            let staged = stage(&config.data)?;
            self.executor
                .copy(&self.host, staged.path(), &self.dest.join(&config.path))
                .await?;
        }

        // The manifest goes last, so an interrupted transfer is retried in full next time.
        let staged = stage(&render_manifest(manifest))?;
        self.executor
            .copy(&self.host, staged.path(), &self.dest.join(MANIFEST_FILE))
            .await?;
        Ok(())
    }

    async fn remote_manifest(&self) -> Result<Manifest, TransferError> {
        let path = self.dest.join(MANIFEST_FILE);
        let output = self
            .executor
            .output(
                &self.host,
                &format!("cat {} 2>/dev/null || true", shell_quote(&path.display().to_string())),
            )
            .await?;
        Ok(parse_manifest(&output))
    }
}

/// Write `contents` to a scratch file so it can be copied to a host. The file is removed when
/// the returned handle drops.
fn stage(contents: &str) -> Result<NamedTempFile, TransferError> {
    let local_err = |source| TransferError::Local {
        path: std::env::temp_dir(),
        source,
    };
    let mut file = Builder::new().prefix("keel-").tempfile().map_err(local_err)?;
    file.write_all(contents.as_bytes()).map_err(local_err)?;
    file.flush().map_err(local_err)?;
    Ok(file)
}

/// True if `path` is relative and never climbs out of the directory it is joined to.
fn is_contained(path: &Path) -> bool {
    path.components().next().is_some()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Hash every regular file and record every symlink under `root`, skipping top-level entries
/// named in `exclude`. Anything else (sockets, devices, fifos) is an error.
pub fn build_manifest(root: &Path, exclude: &[&str]) -> Result<Manifest, TransferError> {
    let mut manifest = Manifest::new();
    walk(root, root, exclude, &mut manifest)?;
    Ok(manifest)
}

fn walk(root: &Path, dir: &Path, exclude: &[&str], out: &mut Manifest) -> Result<(), TransferError> {
    let local_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| TransferError::Local { path, source }
    };

    let mut entries = fs::read_dir(dir)
        .map_err(local_err(dir))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(local_err(dir))?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let path = entry.path();
        let rel = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
        if dir == root && exclude.iter().any(|x| entry.file_name() == *x) {
            continue;
        }
        if rel.as_os_str() == MANIFEST_FILE {
            continue;
        }
        let file_type = entry.file_type().map_err(local_err(&path))?;
        if file_type.is_dir() {
            walk(root, &path, exclude, out)?;
        } else if file_type.is_file() {
            let data = fs::read(&path).map_err(local_err(&path))?;
            out.insert(rel, hex::encode(Sha256::digest(&data)));
        } else if file_type.is_symlink() {
            let target = fs::read_link(&path).map_err(local_err(&path))?;
            let target = match target.to_str() {
                Some(t) if !t.is_empty() && !t.contains(['\t', '\n']) => t.to_string(),
                _ => {
                    return Err(local_err(&path)(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("unsupported symlink target \"{}\"", target.display()),
                    )))
                }
            };
            out.insert(rel, format!("{LINK_PREFIX}{target}"));
        } else {
            return Err(local_err(&path)(io::Error::new(
                io::ErrorKind::Unsupported,
                "not a regular file, directory or symlink",
            )));
        }
    }
    Ok(())
}

pub fn render_manifest(manifest: &Manifest) -> String {
    manifest
        .iter()
        .map(|(path, digest)| format!("{digest}\t{}\n", path.display()))
        .collect()
}

/// Parse a manifest. Malformed lines are ignored, which only causes the files they named to be
/// sent again.
pub fn parse_manifest(text: &str) -> Manifest {
    text.lines()
        .filter_map(|line| {
            let (digest, path) = line.split_once('\t')?;
            let is_link = digest.len() > LINK_PREFIX.len() && digest.starts_with(LINK_PREFIX);
            if (digest.len() != 64 && !is_link) || path.is_empty() {
                return None;
            }
            Some((PathBuf::from(path), digest.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_excludes_top_level_only() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("registry")).unwrap();
        fs::create_dir_all(dir.path().join("bin/registry")).unwrap();
        fs::write(dir.path().join("registry/blob"), "layer").unwrap();
        fs::write(dir.path().join("bin/registry/tool"), "tool").unwrap();
        fs::write(dir.path().join("README"), "hello").unwrap();

        let manifest = build_manifest(dir.path(), &[REGISTRY_DIR]).unwrap();
        let paths: Vec<_> = manifest.keys().cloned().collect();
        assert_eq!(
            paths,
            vec![PathBuf::from("README"), PathBuf::from("bin/registry/tool")]
        );
        assert_eq!(
            manifest[&PathBuf::from("README")],
            hex::encode(Sha256::digest(b"hello"))
        );
    }

    #[cfg(unix)]
    #[test]
    fn manifest_records_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("usr/bin")).unwrap();
        fs::write(dir.path().join("usr/bin/kubectl"), "kubectl").unwrap();
        std::os::unix::fs::symlink("usr/bin", dir.path().join("bin")).unwrap();
        std::os::unix::fs::symlink("kubectl", dir.path().join("usr/bin/k")).unwrap();

        let manifest = build_manifest(dir.path(), &[]).unwrap();
        assert_eq!(manifest[&PathBuf::from("bin")], "link:usr/bin");
        assert_eq!(manifest[&PathBuf::from("usr/bin/k")], "link:kubectl");
        // Linked directories are not descended into.
        assert_eq!(manifest.len(), 3);
    }

    #[test]
    fn manifest_text_format() {
        let manifest = Manifest::from([
            (PathBuf::from("a/b"), "0".repeat(64)),
            (PathBuf::from("bin"), "link:usr/bin".to_string()),
            (PathBuf::from("c"), "f".repeat(64)),
        ]);
        let text = render_manifest(&manifest);
        let parsed = parse_manifest(&format!("{text}garbage\nabc\tshort\n"));
        assert_eq!(parsed, manifest);
    }

    #[test]
    fn contained_paths() {
        assert!(is_contained(Path::new("etc/calico.yaml")));
        assert!(!is_contained(Path::new("/etc/passwd")));
        assert!(!is_contained(Path::new("etc/../../x")));
        assert!(!is_contained(Path::new("")));
    }
}
