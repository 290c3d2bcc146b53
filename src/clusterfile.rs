// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! The desired-state document ("Clusterfile") and its local checkpoints.
//!
//! A Clusterfile is the authoritative description of what a cluster should be running. During
//! an upgrade it is written to local disk twice: once before anything on the cluster changes, so
//! an operator can recover from a failed attempt, and once after the upgrade succeeds.
//!
//! On disk, each cluster gets a directory under the state dir:
//!
//! - `Clusterfile.toml`: the most recent checkpoint of the desired state.
//! - `current.toml`: the last state committed as the cluster's canonical record. The upgrade
//!   itself never writes it; the caller commits once it considers the attempt good.

use std::{
    collections::BTreeMap,
    fmt, fs, io,
    path::{Component, Path, PathBuf},
};

use {
    log::{info, warn},
    serde::{Deserialize, Serialize},
    thiserror::Error,
};

use crate::{
    config::Ssh,
    fleet::{Platform, Role},
    plugin::Plugin,
};

pub const CHECKPOINT_FILE: &str = "Clusterfile.toml";
pub const CURRENT_FILE: &str = "current.toml";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ClusterFile {
    pub cluster: Cluster,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub plugins: Vec<Plugin>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub configs: Vec<Config>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application: Option<Application>,
    /// Where the installer left its resolved configuration. Only recorded by the checkpoint
    /// written after a successful upgrade.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_conf_path: Option<PathBuf>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Cluster {
    pub name: String,
    #[serde(default)]
    pub image: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub app_names: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    pub hosts: Vec<HostSpec>,
    #[serde(default)]
    pub registry: Registry,
    #[serde(default)]
    pub container_runtime: ContainerRuntime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh: Option<Ssh>,
}

/// A group of hosts sharing the same roles, platform and environment.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct HostSpec {
    pub ips: Vec<String>,
    pub roles: Vec<Role>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Registry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_registry: Option<LocalRegistry>,
}

/// A registry running inside the cluster, seeded from the image's `registry` payload.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LocalRegistry {
    #[serde(default = "default_registry_domain")]
    pub domain: String,
    #[serde(default = "default_registry_port")]
    pub port: u16,
    /// Replicate the registry to every candidate host instead of just one.
    #[serde(default)]
    pub ha: Option<bool>,
}

fn default_registry_domain() -> String {
    "registry.keel.local".to_string()
}

fn default_registry_port() -> u16 {
    5000
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ContainerRuntime {
    #[serde(rename = "type")]
    pub kind: String,
}

impl Default for ContainerRuntime {
    fn default() -> Self {
        ContainerRuntime {
            kind: "containerd".to_string(),
        }
    }
}

/// A configuration payload written to hosts alongside the image's rootfs.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Config {
    pub name: String,
    /// Destination, relative to the cluster root.
    pub path: PathBuf,
    /// Restrict the payload to these hosts. All hosts receive it when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hosts: Option<Vec<String>>,
    pub data: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Application {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub launch_cmds: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub app_names: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Error)]
pub enum ClusterFileError {
    #[error("could not parse Clusterfile: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("could not serialize Clusterfile: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("could not {action} \"{}\": {source}", .path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("no saved Clusterfile found under \"{}\"", .0.display())]
    NotFound(PathBuf),
    #[error("found {0} clusters in the state dir, specify which one to use")]
    Ambiguous(usize),
    #[error("invalid cluster name \"{0}\": it must be a single path component")]
    BadName(String),
}

/// Cluster names become directory names locally and on every host, so they must be exactly one
/// ordinary path component.
pub fn valid_cluster_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    !name.contains('/')
        && matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(_)), None)
        )
}

fn check_name(name: &str) -> Result<(), ClusterFileError> {
    if valid_cluster_name(name) {
        Ok(())
    } else {
        Err(ClusterFileError::BadName(name.to_string()))
    }
}

fn io_err(action: &'static str, path: &Path) -> impl FnOnce(io::Error) -> ClusterFileError {
    let path = path.to_path_buf();
    move |source| ClusterFileError::Io {
        action,
        path,
        source,
    }
}

impl ClusterFile {
    pub fn from_bytes(data: &[u8]) -> Result<Self, ClusterFileError> {
        let text = String::from_utf8_lossy(data);
        Ok(toml::from_str(&text)?)
    }

    pub fn from_path(path: &Path) -> Result<Self, ClusterFileError> {
        let data = fs::read(path).map_err(io_err("read", path))?;
        Self::from_bytes(&data)
    }

    pub fn to_toml(&self) -> Result<String, ClusterFileError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Point this document at a new image, keeping everything else it declares (plugins,
    /// configs, application, hosts).
    ///
    /// `app_names` replaces the cluster's application names only when given.
    pub fn retarget(&mut self, image: &str, app_names: Option<Vec<String>>) {
        self.cluster.image = image.to_string();
        if let Some(names) = app_names {
            self.cluster.app_names = names;
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SaveOptions {
    /// Also record the document as the cluster's canonical (last-known-good) state.
    pub commit_to_cluster: bool,
    /// Installer configuration path to record in the saved document.
    pub conf_path: Option<PathBuf>,
}

/// Durable storage for desired-state documents.
pub trait ClusterFileStore: fmt::Debug + Send + Sync {
    /// Checkpoint `doc`.
    fn save_all(&self, doc: &ClusterFile, opts: &SaveOptions) -> Result<(), ClusterFileError>;

    /// Load the cluster's canonical document. When `name` is `None`, the store must hold exactly
    /// one cluster.
    fn load_current(&self, name: Option<&str>) -> Result<ClusterFile, ClusterFileError>;

    /// Promote the cluster's latest checkpoint to its canonical record.
    fn commit(&self, name: &str) -> Result<(), ClusterFileError>;
}

/// Stores documents as TOML files under a local state directory.
#[derive(Debug, Clone)]
pub struct LocalClusterFileStore {
    root: PathBuf,
}

impl LocalClusterFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        LocalClusterFileStore { root: root.into() }
    }

    pub fn cluster_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn checkpoint_path(&self, name: &str) -> PathBuf {
        self.cluster_dir(name).join(CHECKPOINT_FILE)
    }

    pub fn current_path(&self, name: &str) -> PathBuf {
        self.cluster_dir(name).join(CURRENT_FILE)
    }

    fn only_cluster(&self) -> Result<String, ClusterFileError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ClusterFileError::NotFound(self.root.clone()))
            }
            Err(e) => return Err(io_err("list", &self.root)(e)),
        };
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(io_err("list", &self.root))?;
            let path = entry.path();
            if path.join(CHECKPOINT_FILE).exists() || path.join(CURRENT_FILE).exists() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        match names.len() {
            0 => Err(ClusterFileError::NotFound(self.root.clone())),
            1 => Ok(names.remove(0)),
            n => Err(ClusterFileError::Ambiguous(n)),
        }
    }
}

/// Write `contents` to `path` via a temporary file and a rename, so a crash never leaves a
/// truncated checkpoint behind.
fn write_atomic(path: &Path, contents: &str) -> Result<(), ClusterFileError> {
    let tmp = path.with_extension("toml.tmp");
    fs::write(&tmp, contents).map_err(io_err("write", &tmp))?;
    fs::rename(&tmp, path).map_err(io_err("rename", &tmp))
}

impl ClusterFileStore for LocalClusterFileStore {
    fn save_all(&self, doc: &ClusterFile, opts: &SaveOptions) -> Result<(), ClusterFileError> {
        check_name(&doc.cluster.name)?;
        let dir = self.cluster_dir(&doc.cluster.name);
        fs::create_dir_all(&dir).map_err(io_err("create", &dir))?;

        let mut doc = doc.clone();
        if let Some(conf_path) = &opts.conf_path {
            doc.install_conf_path = Some(conf_path.clone());
        }
        let contents = doc.to_toml()?;

        let checkpoint = self.checkpoint_path(&doc.cluster.name);
        write_atomic(&checkpoint, &contents)?;
        info!("saved Clusterfile checkpoint to \"{}\"", checkpoint.display());

        if opts.commit_to_cluster {
            let current = self.current_path(&doc.cluster.name);
            write_atomic(&current, &contents)?;
            info!("committed Clusterfile to \"{}\"", current.display());
        }
        Ok(())
    }

    fn load_current(&self, name: Option<&str>) -> Result<ClusterFile, ClusterFileError> {
        let name = match name {
            Some(name) => name.to_string(),
            None => self.only_cluster()?,
        };
        check_name(&name)?;

        let current = self.current_path(&name);
        if current.exists() {
            return ClusterFile::from_path(&current);
        }

        let checkpoint = self.checkpoint_path(&name);
        if checkpoint.exists() {
            warn!(
                "cluster '{name}' has no committed Clusterfile, using checkpoint \"{}\"",
                checkpoint.display()
            );
            return ClusterFile::from_path(&checkpoint);
        }

        Err(ClusterFileError::NotFound(self.cluster_dir(&name)))
    }

    fn commit(&self, name: &str) -> Result<(), ClusterFileError> {
        check_name(name)?;
        let checkpoint = self.checkpoint_path(name);
        let contents = match fs::read_to_string(&checkpoint) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ClusterFileError::NotFound(checkpoint))
            }
            Err(e) => return Err(io_err("read", &checkpoint)(e)),
        };
        let current = self.current_path(name);
        write_atomic(&current, &contents)?;
        info!("committed Clusterfile to \"{}\"", current.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"
        [cluster]
        name = "prod"
        image = "keel/cluster:v1"
        app_names = ["calico"]

        [[cluster.hosts]]
        ips = ["10.0.0.1"]
        roles = ["master"]

        [[cluster.hosts]]
        ips = ["10.0.0.2", "10.0.0.3"]
        roles = ["node"]

        [cluster.registry.local_registry]
        ha = true

        [[plugins]]
        name = "disk-check"
        phase = "pre-upgrade"
        action = "df -h"

        [[configs]]
        name = "calico"
        path = "etc/calico.yaml"
        data = "mtu: 1440"
    "#;

    #[test]
    fn parse_document() {
        let doc = ClusterFile::from_bytes(DOC.as_bytes()).unwrap();
        assert_eq!(doc.cluster.hosts.len(), 2);
        assert_eq!(doc.cluster.container_runtime.kind, "containerd");
        let registry = doc.cluster.registry.local_registry.as_ref().unwrap();
        assert_eq!(registry.ha, Some(true));
        assert_eq!(registry.port, 5000);
        assert_eq!(doc.plugins.len(), 1);
    }

    #[test]
    fn retarget_keeps_plugins_and_configs() {
        let mut doc = ClusterFile::from_bytes(DOC.as_bytes()).unwrap();
        doc.retarget("keel/cluster:v2", None);
        assert_eq!(doc.cluster.image, "keel/cluster:v2");
        assert_eq!(doc.cluster.app_names, vec!["calico".to_string()]);
        assert_eq!(doc.plugins.len(), 1);
        assert_eq!(doc.configs.len(), 1);

        doc.retarget("keel/cluster:v2", Some(vec!["cilium".to_string()]));
        assert_eq!(doc.cluster.app_names, vec!["cilium".to_string()]);
    }

    #[test]
    fn checkpoint_then_commit() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalClusterFileStore::new(dir.path());
        let doc = ClusterFile::from_bytes(DOC.as_bytes()).unwrap();

        store.save_all(&doc, &SaveOptions::default()).unwrap();
        assert!(store.checkpoint_path("prod").exists());
        assert!(!store.current_path("prod").exists());
        // Falls back to the checkpoint when nothing was committed yet.
        assert_eq!(store.load_current(None).unwrap(), doc);

        let opts = SaveOptions {
            commit_to_cluster: true,
            conf_path: Some("/etc/keel/install.toml".into()),
        };
        store.save_all(&doc, &opts).unwrap();
        let current = store.load_current(Some("prod")).unwrap();
        assert_eq!(
            current.install_conf_path,
            Some(PathBuf::from("/etc/keel/install.toml"))
        );
    }

    #[test]
    fn commit_promotes_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalClusterFileStore::new(dir.path());
        assert!(matches!(
            store.commit("prod"),
            Err(ClusterFileError::NotFound(_))
        ));

        let doc = ClusterFile::from_bytes(DOC.as_bytes()).unwrap();
        store.save_all(&doc, &SaveOptions::default()).unwrap();
        store.commit("prod").unwrap();
        assert_eq!(
            ClusterFile::from_path(&store.current_path("prod")).unwrap(),
            doc
        );
    }

    #[test]
    fn cluster_names() {
        assert!(valid_cluster_name("prod"));
        assert!(valid_cluster_name("prod-east.1"));
        assert!(!valid_cluster_name(""));
        assert!(!valid_cluster_name("."));
        assert!(!valid_cluster_name(".."));
        assert!(!valid_cluster_name("../../../.."));
        assert!(!valid_cluster_name("a/b"));
        assert!(!valid_cluster_name("prod/"));
        assert!(!valid_cluster_name("/prod"));

        let dir = tempfile::tempdir().unwrap();
        let store = LocalClusterFileStore::new(dir.path().join("state"));
        let mut doc = ClusterFile::from_bytes(DOC.as_bytes()).unwrap();
        doc.cluster.name = "..".to_string();
        assert!(matches!(
            store.save_all(&doc, &SaveOptions::default()),
            Err(ClusterFileError::BadName(_))
        ));
        assert!(matches!(
            store.load_current(Some("..")),
            Err(ClusterFileError::BadName(_))
        ));
        assert!(!dir.path().join("state").exists());
    }

    #[test]
    fn load_without_clusters() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalClusterFileStore::new(dir.path().join("missing"));
        assert!(matches!(
            store.load_current(None),
            Err(ClusterFileError::NotFound(_))
        ));
    }
}
