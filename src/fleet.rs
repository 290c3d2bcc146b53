// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! The fleet directory: which hosts make up a cluster, what roles they play, what platform they
//! run, and how to reach them.

use std::{
    collections::{BTreeMap, BTreeSet, HashSet},
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};

use {
    log::debug,
    serde::{Deserialize, Serialize},
    thiserror::Error,
};

use crate::{
    clusterfile::{valid_cluster_name, Cluster, Registry},
    image::ImageExtension,
    pool,
    remote::{Env, RemoteError, RemoteExecutor},
};

/// Base directory on every host under which a cluster's payload is installed.
pub const CLUSTER_ROOT_BASE: &str = "/var/lib/keel/data";

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Master,
    Worker,
    /// A generic node. Preferred over masters for hosting the local registry.
    Node,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Role::Master => "master",
                Role::Worker => "worker",
                Role::Node => "node",
            }
        )
    }
}

/// The OS and CPU architecture of a host, in the same terms image platforms use.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Platform {
    pub os: String,
    pub architecture: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl Platform {
    pub fn new(os: &str, architecture: &str) -> Self {
        Platform {
            os: os.to_string(),
            architecture: architecture.to_string(),
            variant: None,
        }
    }

    /// Interpret the output of `uname -s -m`, e.g. "Linux x86_64".
    pub fn from_uname(output: &str) -> Option<Self> {
        let mut fields = output.split_whitespace();
        let os = fields.next()?.to_lowercase();
        let machine = fields.next()?;
        let (architecture, variant) = match machine {
            "x86_64" | "amd64" => ("amd64", None),
            "aarch64" | "arm64" => ("arm64", Some("v8")),
            "armv7l" => ("arm", Some("v7")),
            "ppc64le" => ("ppc64le", None),
            "s390x" => ("s390x", None),
            "riscv64" => ("riscv64", None),
            _ => return None,
        };
        Some(Platform {
            os,
            architecture: architecture.to_string(),
            variant: variant.map(str::to_string),
        })
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.variant {
            Some(v) => write!(f, "{}/{}/{}", self.os, self.architecture, v),
            None => write!(f, "{}/{}", self.os, self.architecture),
        }
    }
}

impl FromStr for Platform {
    type Err = FleetError;

    /// Parse "os/arch" or "os/arch/variant".
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        match parts.as_slice() {
            [os, arch] if !os.is_empty() && !arch.is_empty() => Ok(Platform::new(os, arch)),
            [os, arch, variant] if !os.is_empty() && !arch.is_empty() => Ok(Platform {
                variant: Some(variant.to_string()),
                ..Platform::new(os, arch)
            }),
            _ => Err(FleetError::BadPlatform(s.to_string())),
        }
    }
}

#[derive(Debug, Error)]
pub enum FleetError {
    #[error("invalid cluster name \"{0}\": it must be a single path component")]
    BadName(String),
    #[error("cluster '{0}' declares no hosts")]
    NoHosts(String),
    #[error("host {0} has no roles")]
    NoRoles(String),
    #[error("host {0} is declared more than once")]
    DuplicateHost(String),
    #[error("host {0} is not part of this cluster")]
    UnknownHost(String),
    #[error("invalid platform \"{0}\"")]
    BadPlatform(String),
    #[error("could not determine platform of {host}: {detail}")]
    Platform { host: String, detail: String },
    #[error(transparent)]
    Remote(#[from] RemoteError),
}

/// A server in the cluster.
#[derive(Debug, Clone, PartialEq)]
pub struct Host {
    pub address: String,
    pub roles: BTreeSet<Role>,
    /// Declared platform, if the Clusterfile pins one. Otherwise it is discovered remotely.
    pub platform: Option<Platform>,
    pub env: BTreeMap<String, String>,
}

impl Host {
    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }
}

/// Fleet is the resolved view of a cluster's hosts for one upgrade attempt, merged with what the
/// image declares (launch commands, environment).
#[derive(Debug)]
pub struct Fleet {
    name: String,
    image: String,
    hosts: Vec<Host>,
    env: BTreeMap<String, String>,
    registry: Registry,
    launch_cmds: Vec<String>,
    launch_apps: Vec<String>,
    cluster_root: PathBuf,
    parallelism: usize,
    executor: Arc<dyn RemoteExecutor>,
}

impl Fleet {
    /// Resolve the fleet described by `cluster`, with the image's declarations merged in.
    ///
    /// Cluster-level settings win over image-level ones: the cluster's app names replace the
    /// image's launch apps when set, and cluster env entries override image env entries.
    pub fn new(
        cluster: &Cluster,
        extension: &ImageExtension,
        executor: Arc<dyn RemoteExecutor>,
        parallelism: usize,
    ) -> Result<Self, FleetError> {
        if !valid_cluster_name(&cluster.name) {
            return Err(FleetError::BadName(cluster.name.clone()));
        }
        let mut hosts = Vec::new();
        let mut seen = HashSet::new();
        for spec in cluster.hosts.iter() {
            for ip in spec.ips.iter() {
                if spec.roles.is_empty() {
                    return Err(FleetError::NoRoles(ip.clone()));
                }
                if !seen.insert(ip.clone()) {
                    return Err(FleetError::DuplicateHost(ip.clone()));
                }
                hosts.push(Host {
                    address: ip.clone(),
                    roles: spec.roles.iter().copied().collect(),
                    platform: spec.platform.clone(),
                    env: spec.env.clone(),
                });
            }
        }
        if hosts.is_empty() {
            return Err(FleetError::NoHosts(cluster.name.clone()));
        }

        let mut env = extension.env.clone();
        env.extend(cluster.env.clone());

        let launch_apps = if cluster.app_names.is_empty() {
            extension.launch.app_names.clone()
        } else {
            cluster.app_names.clone()
        };

        Ok(Fleet {
            name: cluster.name.clone(),
            image: cluster.image.clone(),
            hosts,
            env,
            registry: cluster.registry.clone(),
            launch_cmds: extension.launch.cmds.clone(),
            launch_apps,
            cluster_root: Path::new(CLUSTER_ROOT_BASE).join(&cluster.name),
            parallelism,
            executor,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn image_name(&self) -> &str {
        &self.image
    }

    pub fn hosts(&self) -> &[Host] {
        &self.hosts
    }

    pub fn host(&self, address: &str) -> Option<&Host> {
        self.hosts.iter().find(|h| h.address == address)
    }

    /// All host addresses, in declaration order.
    pub fn all_hosts(&self) -> Vec<String> {
        self.hosts.iter().map(|h| h.address.clone()).collect()
    }

    /// Addresses of hosts carrying `role`, in declaration order.
    pub fn hosts_by_role(&self, role: Role) -> Vec<String> {
        self.hosts
            .iter()
            .filter(|h| h.has_role(role))
            .map(|h| h.address.clone())
            .collect()
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn launch_cmds(&self) -> &[String] {
        &self.launch_cmds
    }

    pub fn launch_apps(&self) -> &[String] {
        &self.launch_apps
    }

    /// Where the cluster's payload lives on every host.
    pub fn cluster_root(&self) -> &Path {
        &self.cluster_root
    }

    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    pub fn executor(&self) -> &Arc<dyn RemoteExecutor> {
        &self.executor
    }

    /// The environment a command on `host` runs with: the cluster env, overridden by the host's
    /// own env, overridden by `extra`.
    pub fn env_for(&self, host: &str, extra: &Env) -> Env {
        let mut env = self.env.clone();
        if let Some(h) = self.host(host) {
            env.extend(h.env.clone());
        }
        env.extend(extra.clone());
        env
    }

    /// Run `command` on `host`.
    pub async fn exec(&self, host: &str, env: &Env, command: &str) -> Result<(), RemoteError> {
        self.executor
            .exec(host, &self.env_for(host, env), command)
            .await
    }

    /// Resolve the platform of each of `hosts`. Hosts with a declared platform are not contacted.
    pub async fn platforms(
        &self,
        hosts: &[String],
    ) -> Result<BTreeMap<String, Platform>, FleetError> {
        let mut resolved = BTreeMap::new();
        let mut to_probe = Vec::new();
        for address in hosts {
            let host = self
                .host(address)
                .ok_or_else(|| FleetError::UnknownHost(address.clone()))?;
            match &host.platform {
                Some(p) => {
                    resolved.insert(address.clone(), p.clone());
                }
                None => to_probe.push(address.clone()),
            }
        }

        let results = pool::run_bounded(to_probe, self.parallelism, |host| {
            let executor = Arc::clone(&self.executor);
            async move {
                let output = executor.output(&host, "uname -s -m").await;
                (host, output)
            }
        })
        .await;

        for (host, output) in results {
            let output = output?;
            let platform = Platform::from_uname(&output).ok_or_else(|| FleetError::Platform {
                host: host.clone(),
                detail: format!("unrecognized `uname` output \"{}\"", output.trim()),
            })?;
            debug!("host {host} runs {platform}");
            resolved.insert(host, platform);
        }

        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_env::{cluster_file, cluster_image, TestExecutor};

    #[test]
    fn uname_normalization() {
        assert_eq!(
            Platform::from_uname("Linux x86_64\n"),
            Some(Platform::new("linux", "amd64"))
        );
        let arm = Platform::from_uname("Linux aarch64").unwrap();
        assert_eq!(arm.to_string(), "linux/arm64/v8");
        assert_eq!(Platform::from_uname("Linux"), None);
        assert_eq!(Platform::from_uname("Linux sparc"), None);
    }

    #[test]
    fn parse_platform() {
        assert_eq!(
            "linux/amd64".parse::<Platform>().unwrap(),
            Platform::new("linux", "amd64")
        );
        assert_eq!(
            "linux/arm64/v8".parse::<Platform>().unwrap().variant,
            Some("v8".to_string())
        );
        assert!("linux".parse::<Platform>().is_err());
    }

    #[test]
    fn cluster_name_must_be_one_component() {
        let executor: Arc<dyn RemoteExecutor> = Arc::new(TestExecutor::new());
        let extension = cluster_image("img").extension;
        for name in ["../../../..", "..", "", "a/b"] {
            let cf = cluster_file(name, "img", &[("10.0.0.1", &[Role::Master])]);
            assert!(
                matches!(
                    Fleet::new(&cf.cluster, &extension, Arc::clone(&executor), 4),
                    Err(FleetError::BadName(_))
                ),
                "{name:?}"
            );
        }
    }
}
