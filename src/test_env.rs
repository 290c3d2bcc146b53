// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Test doubles for the collaborators of an upgrade, and a `TestEnvironment` tying them together.
//!
//! Remote hosts are simulated by `TestExecutor`, which keeps an in-memory file system per host, so
//! the real distributor, prober and installer can run against it unchanged.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;

use crate::{
    application::{AppDriver, AppDriverFactory},
    clusterfile::{
        Application, Cluster, ClusterFile, ClusterFileError, ClusterFileStore, ContainerRuntime,
        HostSpec, LocalClusterFileStore, LocalRegistry, Registry, SaveOptions,
    },
    fleet::{Fleet, Platform, Role},
    image::{ImageEngine, ImageExtension, ImageSpec, ImageType, Launch, PullOptions},
    plugin::Plugin,
    remote::{Env, RemoteError, RemoteExecutor},
    runtime::{ClusterInstallInfo, Installer, InstallerFactory, RuntimeConfig},
    upgrade::Upgrader,
    BoxError,
};

/// A single call made through the `TestExecutor`.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Exec { host: String, env: Env, command: String },
    Output { host: String, command: String },
    Copy { host: String, remote: PathBuf },
}

impl Call {
    pub fn host(&self) -> &str {
        match self {
            Call::Exec { host, .. } | Call::Output { host, .. } | Call::Copy { host, .. } => host,
        }
    }
}

/// A simulated fleet.
#[derive(Debug, Default)]
pub struct TestExecutor {
    unreachable: Mutex<HashSet<String>>,
    /// (host, command substring) pairs that fail.
    failing: Mutex<Vec<(String, String)>>,
    /// Same, but only for commands run through `exec`.
    failing_exec: Mutex<Vec<(String, String)>>,
    platforms: Mutex<HashMap<String, String>>,
    files: Mutex<HashMap<(String, PathBuf), Vec<u8>>>,
    calls: Mutex<Vec<Call>>,
}

impl TestExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call to `host` fails from now on.
    pub fn set_unreachable(&self, host: &str) {
        self.unreachable.lock().unwrap().insert(host.to_string());
    }

    /// Commands on `host` containing `pattern` fail from now on.
    pub fn fail_command(&self, host: &str, pattern: &str) {
        self.failing
            .lock()
            .unwrap()
            .push((host.to_string(), pattern.to_string()));
    }

    /// Commands run through `exec` on `host` containing `pattern` fail from now on. Copies and
    /// captured output are unaffected.
    pub fn fail_exec(&self, host: &str, pattern: &str) {
        self.failing_exec
            .lock()
            .unwrap()
            .push((host.to_string(), pattern.to_string()));
    }

    /// Set what `uname -s -m` prints on `host`. Hosts default to "Linux x86_64".
    pub fn set_uname(&self, host: &str, uname: &str) {
        self.platforms
            .lock()
            .unwrap()
            .insert(host.to_string(), uname.to_string());
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    /// Remote paths copied to `host`, in order.
    pub fn copies_to(&self, host: &str) -> Vec<PathBuf> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Copy { host: h, remote } if h == host => Some(remote),
                _ => None,
            })
            .collect()
    }

    /// Commands run on `host` through `exec`, in order.
    pub fn commands_on(&self, host: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Exec { host: h, command, .. } if h == host => Some(command),
                _ => None,
            })
            .collect()
    }

    /// Hosts that received at least one file.
    pub fn hosts_with_copies(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Copy { host, .. } => Some(host),
                _ => None,
            })
            .collect();
        hosts.sort();
        hosts.dedup();
        hosts
    }

    pub fn remote_file(&self, host: &str, path: &Path) -> Option<Vec<u8>> {
        self.files
            .lock()
            .unwrap()
            .get(&(host.to_string(), path.to_path_buf()))
            .cloned()
    }

    fn check(&self, host: &str, command: &str) -> Result<(), RemoteError> {
        self.check_with(host, command, &self.failing)
    }

    fn check_with(
        &self,
        host: &str,
        command: &str,
        failing: &Mutex<Vec<(String, String)>>,
    ) -> Result<(), RemoteError> {
        if self.unreachable.lock().unwrap().contains(host) {
            return Err(RemoteError::Failed {
                host: host.to_string(),
                command: command.to_string(),
                status: "exit status: 255".to_string(),
                stderr: "Permission denied (publickey,password).".to_string(),
            });
        }
        let failing = failing.lock().unwrap();
        if failing
            .iter()
            .any(|(h, pattern)| h == host && command.contains(pattern.as_str()))
        {
            return Err(RemoteError::Failed {
                host: host.to_string(),
                command: command.to_string(),
                status: "exit status: 1".to_string(),
                stderr: "injected failure".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteExecutor for TestExecutor {
    async fn exec(&self, host: &str, env: &Env, command: &str) -> Result<(), RemoteError> {
        self.calls.lock().unwrap().push(Call::Exec {
            host: host.to_string(),
            env: env.clone(),
            command: command.to_string(),
        });
        self.check(host, command)?;
        self.check_with(host, command, &self.failing_exec)
    }

    async fn output(&self, host: &str, command: &str) -> Result<String, RemoteError> {
        self.calls.lock().unwrap().push(Call::Output {
            host: host.to_string(),
            command: command.to_string(),
        });
        self.check(host, command)?;

        if command.starts_with("uname") {
            return Ok(self
                .platforms
                .lock()
                .unwrap()
                .get(host)
                .cloned()
                .unwrap_or_else(|| "Linux x86_64".to_string()));
        }
        if let Some(rest) = command.strip_prefix("cat ") {
            let path = rest.split_whitespace().next().unwrap_or("").trim_matches('\'');
            return Ok(self
                .remote_file(host, Path::new(path))
                .map(|data| String::from_utf8_lossy(&data).into_owned())
                .unwrap_or_default());
        }
        Ok(String::new())
    }

    async fn copy(&self, host: &str, local: &Path, remote: &Path) -> Result<(), RemoteError> {
        self.calls.lock().unwrap().push(Call::Copy {
            host: host.to_string(),
            remote: remote.to_path_buf(),
        });
        self.check(host, &format!("scp {}", remote.display()))?;
        let data = fs::read(local).map_err(|source| RemoteError::Spawn {
            host: host.to_string(),
            source,
        })?;
        self.files
            .lock()
            .unwrap()
            .insert((host.to_string(), remote.to_path_buf()), data);
        Ok(())
    }
}

/// An image engine serving images whose payload lives under a local directory.
///
/// Each platform mounts at `<root>/<os>-<arch>`, which must exist unless `mount_missing_payload`
/// is set.
#[derive(Debug)]
pub struct TestImageEngine {
    root: PathBuf,
    images: Mutex<HashMap<String, ImageSpec>>,
    fail_platform: Mutex<Option<Platform>>,
    missing_payload: Mutex<bool>,
    pub mounts: AtomicUsize,
    pub umounts: AtomicUsize,
}

impl TestImageEngine {
    pub fn new(root: &Path) -> Self {
        TestImageEngine {
            root: root.to_path_buf(),
            images: Mutex::new(HashMap::new()),
            fail_platform: Mutex::new(None),
            missing_payload: Mutex::new(false),
            mounts: AtomicUsize::new(0),
            umounts: AtomicUsize::new(0),
        }
    }

    pub fn add_image(&self, spec: ImageSpec) {
        self.images.lock().unwrap().insert(spec.name.clone(), spec);
    }

    pub fn fail_mount_for(&self, platform: Platform) {
        *self.fail_platform.lock().unwrap() = Some(platform);
    }

    /// Hand out mount directories that do not exist.
    pub fn mount_missing_payload(&self) {
        *self.missing_payload.lock().unwrap() = true;
    }

    pub fn payload_dir(&self, platform: &Platform) -> PathBuf {
        self.root
            .join(format!("{}-{}", platform.os, platform.architecture))
    }

    pub fn mount_count(&self) -> usize {
        self.mounts.load(Ordering::SeqCst)
    }

    pub fn umount_count(&self) -> usize {
        self.umounts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ImageEngine for TestImageEngine {
    async fn pull(&self, opts: &PullOptions) -> Result<String, BoxError> {
        match self.images.lock().unwrap().get(&opts.image) {
            Some(spec) => Ok(spec.id.clone()),
            None => Err(format!("image {} not found", opts.image).into()),
        }
    }

    async fn inspect(&self, name_or_id: &str) -> Result<ImageSpec, BoxError> {
        self.images
            .lock()
            .unwrap()
            .values()
            .find(|spec| spec.id == name_or_id || spec.name == name_or_id)
            .cloned()
            .ok_or_else(|| format!("image {name_or_id} not found").into())
    }

    async fn mount(&self, _image: &str, platform: &Platform) -> Result<PathBuf, BoxError> {
        if self.fail_platform.lock().unwrap().as_ref() == Some(platform) {
            return Err(format!("no payload for {platform}").into());
        }
        self.mounts.fetch_add(1, Ordering::SeqCst);
        if *self.missing_payload.lock().unwrap() {
            return Ok(self.root.join("does-not-exist"));
        }
        Ok(self.payload_dir(platform))
    }

    async fn umount(&self, _image: &str, _mount_dir: &Path) -> Result<(), BoxError> {
        self.umounts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// What a `RecordingInstaller` was asked to do.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedInstall {
    pub plugins: Vec<String>,
    pub info: ClusterInstallInfo,
}

/// An installer factory that records each upgrade and optionally fails it, or never finishes it.
#[derive(Debug, Default)]
pub struct RecordingInstallerFactory {
    pub installs: Arc<Mutex<Vec<RecordedInstall>>>,
    pub fail: bool,
    pub hang: bool,
}

struct RecordingInstaller {
    installs: Arc<Mutex<Vec<RecordedInstall>>>,
    record: RecordedInstall,
    fail: bool,
    hang: bool,
}

#[async_trait]
impl Installer for RecordingInstaller {
    async fn upgrade(&self) -> Result<(), BoxError> {
        self.installs.lock().unwrap().push(self.record.clone());
        if self.hang {
            std::future::pending::<()>().await;
        }
        if self.fail {
            return Err("installer failed".into());
        }
        Ok(())
    }
}

impl InstallerFactory for RecordingInstallerFactory {
    fn new_installer(
        &self,
        _fleet: Arc<Fleet>,
        config: RuntimeConfig,
        info: ClusterInstallInfo,
    ) -> Result<Box<dyn Installer>, BoxError> {
        Ok(Box::new(RecordingInstaller {
            installs: Arc::clone(&self.installs),
            record: RecordedInstall {
                plugins: config.plugins.iter().map(|p| p.name.clone()).collect(),
                info,
            },
            fail: self.fail,
            hang: self.hang,
        }))
    }
}

/// An application driver factory that records launches and can fail at each step.
#[derive(Debug, Default)]
pub struct RecordingAppFactory {
    pub launched: Arc<Mutex<Vec<Application>>>,
    pub saved: Arc<AtomicUsize>,
    pub fail_new: bool,
    pub fail_launch: bool,
    pub fail_save: bool,
}

struct RecordingApp {
    app: Application,
    launched: Arc<Mutex<Vec<Application>>>,
    saved: Arc<AtomicUsize>,
    fail_launch: bool,
    fail_save: bool,
}

#[async_trait]
impl AppDriver for RecordingApp {
    async fn launch(&self, _fleet: &Fleet) -> Result<(), BoxError> {
        if self.fail_launch {
            return Err("launch failed".into());
        }
        self.launched.lock().unwrap().push(self.app.clone());
        Ok(())
    }

    fn save(&self) -> Result<(), BoxError> {
        if self.fail_save {
            return Err("save failed".into());
        }
        self.saved.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl AppDriverFactory for RecordingAppFactory {
    fn new_app_driver(
        &self,
        app: Application,
        _extension: &ImageExtension,
    ) -> Result<Box<dyn AppDriver>, BoxError> {
        if self.fail_new {
            return Err("bad application".into());
        }
        Ok(Box::new(RecordingApp {
            app,
            launched: Arc::clone(&self.launched),
            saved: Arc::clone(&self.saved),
            fail_launch: self.fail_launch,
            fail_save: self.fail_save,
        }))
    }
}

/// A Clusterfile store backed by a real `LocalClusterFileStore` that can be told to fail its
/// n-th save (1-based).
#[derive(Debug)]
pub struct FaultyStore {
    inner: LocalClusterFileStore,
    pub fail_on_save: Option<usize>,
    pub saves: Mutex<Vec<SaveOptions>>,
}

impl FaultyStore {
    pub fn new(root: &Path, fail_on_save: Option<usize>) -> Self {
        FaultyStore {
            inner: LocalClusterFileStore::new(root),
            fail_on_save,
            saves: Mutex::new(Vec::new()),
        }
    }

    pub fn inner(&self) -> &LocalClusterFileStore {
        &self.inner
    }

    pub fn save_count(&self) -> usize {
        self.saves.lock().unwrap().len()
    }
}

impl ClusterFileStore for FaultyStore {
    fn save_all(&self, doc: &ClusterFile, opts: &SaveOptions) -> Result<(), ClusterFileError> {
        let n = {
            let mut saves = self.saves.lock().unwrap();
            saves.push(opts.clone());
            saves.len()
        };
        if self.fail_on_save == Some(n) {
            return Err(ClusterFileError::Io {
                action: "write",
                path: self.inner.checkpoint_path(&doc.cluster.name),
                source: std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
            });
        }
        self.inner.save_all(doc, opts)
    }

    fn load_current(&self, name: Option<&str>) -> Result<ClusterFile, ClusterFileError> {
        self.inner.load_current(name)
    }

    fn commit(&self, name: &str) -> Result<(), ClusterFileError> {
        self.inner.commit(name)
    }
}

/// Build a cluster-installer image spec.
pub fn cluster_image(name: &str) -> ImageSpec {
    ImageSpec {
        id: format!("id-{}", name.replace(['/', ':'], "-")),
        name: name.to_string(),
        extension: ImageExtension {
            kind: ImageType::ClusterInstaller,
            labels: BTreeMap::new(),
            launch: Launch::default(),
            env: BTreeMap::new(),
        },
    }
}

/// Build a Clusterfile with one host group per entry of `hosts`.
pub fn cluster_file(name: &str, image: &str, hosts: &[(&str, &[Role])]) -> ClusterFile {
    ClusterFile {
        cluster: Cluster {
            name: name.to_string(),
            image: image.to_string(),
            app_names: Vec::new(),
            env: BTreeMap::new(),
            hosts: hosts
                .iter()
                .map(|(ip, roles)| HostSpec {
                    ips: vec![ip.to_string()],
                    roles: roles.to_vec(),
                    platform: None,
                    env: BTreeMap::new(),
                })
                .collect(),
            registry: Registry::default(),
            container_runtime: ContainerRuntime::default(),
            ssh: None,
        },
        plugins: Vec::new(),
        configs: Vec::new(),
        application: None,
        install_conf_path: None,
    }
}

/// Give `cf` a local registry with the given HA flag.
pub fn with_local_registry(mut cf: ClusterFile, ha: Option<bool>) -> ClusterFile {
    cf.cluster.registry.local_registry = Some(LocalRegistry {
        domain: "registry.keel.local".to_string(),
        port: 5000,
        ha,
    });
    cf
}

/// A TestEnvironment holds the scratch directories and simulated collaborators for one test.
pub struct TestEnvironment {
    /// Holds every directory the test uses; removed when the environment is dropped.
    pub dir: tempfile::TempDir,
    pub executor: Arc<TestExecutor>,
    pub engine: Arc<TestImageEngine>,
}

impl TestEnvironment {
    /// Set up an environment with a `linux/amd64` payload containing `files` (path, contents).
    pub fn new(files: &[(&str, &str)]) -> Self {
        let dir = tempfile::tempdir().expect("could not create test directory");
        let payload_root = dir.path().join("payload");
        let engine = TestImageEngine::new(&payload_root);
        let amd64 = engine.payload_dir(&Platform::new("linux", "amd64"));
        fs::create_dir_all(&amd64).unwrap();
        for (path, contents) in files {
            let path = amd64.join(path);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, contents).unwrap();
        }

        TestEnvironment {
            dir,
            executor: Arc::new(TestExecutor::new()),
            engine: Arc::new(engine),
        }
    }

    pub fn state_dir(&self) -> PathBuf {
        self.dir.path().join("state")
    }

    pub fn payload_dir(&self) -> PathBuf {
        self.engine.payload_dir(&Platform::new("linux", "amd64"))
    }

    /// Write a plugin file into the image payload.
    pub fn add_image_plugins(&self, file: &str, plugins: &[Plugin]) {
        #[derive(serde::Serialize)]
        struct PluginFile<'a> {
            plugin: &'a [Plugin],
        }
        let dir = self.payload_dir().join(crate::distributor::PLUGINS_DIR);
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join(file),
            toml::to_string(&PluginFile { plugin: plugins }).unwrap(),
        )
        .unwrap();
    }

    /// Resolve a fleet for `cf` against the simulated hosts.
    pub fn fleet(&self, cf: &ClusterFile) -> Fleet {
        Fleet::new(
            &cf.cluster,
            &cluster_image(&cf.cluster.image).extension,
            Arc::clone(&self.executor) as Arc<dyn RemoteExecutor>,
            4,
        )
        .expect("invalid test fleet")
    }

    pub fn upgrader(
        &self,
        store: Arc<dyn ClusterFileStore>,
        installers: Arc<dyn InstallerFactory>,
        apps: Arc<dyn AppDriverFactory>,
    ) -> Upgrader {
        Upgrader {
            engine: Arc::clone(&self.engine) as Arc<dyn ImageEngine>,
            executor: Arc::clone(&self.executor) as Arc<dyn RemoteExecutor>,
            store,
            installers,
            apps,
            parallelism: 4,
            lock_dir: Some(self.state_dir()),
        }
    }
}
