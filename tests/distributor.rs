// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

#[cfg(test)]
mod tests {
    use std::{
        collections::BTreeMap,
        fs,
        path::{Path, PathBuf},
        sync::Arc,
    };

    use keel_lib::{
        clusterfile::{ClusterFile, Config},
        distributor::{
            parse_manifest, DistributeError, DistributeOption, Distributor, ScpDistributor,
            MANIFEST_FILE,
        },
        fleet::{Platform, Role},
        image::{ImageEngine, ImageMounter, MountInfo},
        test_env::*,
    };

    const DEST: &str = "/var/lib/keel/data/c1";

    fn cluster() -> ClusterFile {
        cluster_file("c1", "img", &[("h1", &[Role::Master]), ("h2", &[Role::Node])])
    }

    fn hosts() -> Vec<String> {
        vec!["h1".to_string(), "h2".to_string()]
    }

    async fn mount(env: &TestEnvironment) -> MountInfo {
        let platforms: BTreeMap<String, Platform> = hosts()
            .into_iter()
            .map(|h| (h, Platform::new("linux", "amd64")))
            .collect();
        ImageMounter::new(Arc::clone(&env.engine) as Arc<dyn ImageEngine>, &platforms)
            .mount("img")
            .await
            .unwrap()
    }

    fn distributor(
        env: &TestEnvironment,
        info: &MountInfo,
        configs: Vec<Config>,
        ignore_cache: bool,
    ) -> Result<ScpDistributor, DistributeError> {
        ScpDistributor::new(
            info,
            &env.fleet(&cluster()),
            configs,
            DistributeOption { ignore_cache },
        )
    }

    fn payload_copies(env: &TestEnvironment, host: &str) -> Vec<PathBuf> {
        env.executor
            .copies_to(host)
            .into_iter()
            .filter(|p| !p.ends_with(MANIFEST_FILE))
            .collect()
    }

    #[tokio::test]
    async fn unchanged_files_are_not_resent() {
        let env = TestEnvironment::new(&[("bin/kubelet", "v1"), ("etc/kubelet.conf", "a = 1")]);
        let info = mount(&env).await;
        let dest = Path::new(DEST);

        let d = distributor(&env, &info, Vec::new(), false).unwrap();
        d.distribute_rootfs(&hosts(), dest).await.unwrap();
        assert_eq!(payload_copies(&env, "h1").len(), 2);

        let manifest = env
            .executor
            .remote_file("h1", &dest.join(MANIFEST_FILE))
            .unwrap();
        let manifest = parse_manifest(&String::from_utf8(manifest).unwrap());
        assert_eq!(manifest.len(), 2);
        assert!(manifest.contains_key(Path::new("bin/kubelet")));

        // Only the changed file goes out the second time.
        env.executor.clear_calls();
        fs::write(env.payload_dir().join("bin/kubelet"), "v2").unwrap();
        let d = distributor(&env, &info, Vec::new(), false).unwrap();
        d.distribute_rootfs(&hosts(), dest).await.unwrap();
        assert_eq!(payload_copies(&env, "h1"), vec![dest.join("bin/kubelet")]);
        assert_eq!(payload_copies(&env, "h2"), vec![dest.join("bin/kubelet")]);

        env.executor.clear_calls();
        let d = distributor(&env, &info, Vec::new(), false).unwrap();
        d.distribute_rootfs(&hosts(), dest).await.unwrap();
        assert!(payload_copies(&env, "h1").is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlinks_are_recreated() {
        let env = TestEnvironment::new(&[("usr/bin/kubelet", "v1")]);
        std::os::unix::fs::symlink("usr/bin", env.payload_dir().join("bin")).unwrap();
        let info = mount(&env).await;
        let dest = Path::new(DEST);
        let link = format!("ln -sfn usr/bin {DEST}/bin");

        distributor(&env, &info, Vec::new(), false)
            .unwrap()
            .distribute_rootfs(&hosts(), dest)
            .await
            .unwrap();
        for host in hosts() {
            assert!(env.executor.commands_on(&host).contains(&link), "{host}");
            assert_eq!(
                payload_copies(&env, &host),
                vec![dest.join("usr/bin/kubelet")]
            );
        }
        let manifest = env
            .executor
            .remote_file("h1", &dest.join(MANIFEST_FILE))
            .unwrap();
        let manifest = parse_manifest(&String::from_utf8(manifest).unwrap());
        assert_eq!(manifest[Path::new("bin")], "link:usr/bin");

        // An unchanged link is not recreated.
        env.executor.clear_calls();
        distributor(&env, &info, Vec::new(), false)
            .unwrap()
            .distribute_rootfs(&hosts(), dest)
            .await
            .unwrap();
        assert!(!env.executor.commands_on("h1").contains(&link));
    }

    #[tokio::test]
    async fn ignore_cache_resends_everything() {
        let env = TestEnvironment::new(&[("bin/kubelet", "v1"), ("etc/kubelet.conf", "a = 1")]);
        let info = mount(&env).await;
        let dest = Path::new(DEST);

        distributor(&env, &info, Vec::new(), false)
            .unwrap()
            .distribute_rootfs(&hosts(), dest)
            .await
            .unwrap();
        env.executor.clear_calls();

        distributor(&env, &info, Vec::new(), true)
            .unwrap()
            .distribute_rootfs(&hosts(), dest)
            .await
            .unwrap();
        assert_eq!(payload_copies(&env, "h1").len(), 2);
        assert_eq!(payload_copies(&env, "h2").len(), 2);
    }

    #[tokio::test]
    async fn failed_host_is_reported() {
        let env = TestEnvironment::new(&[("bin/kubelet", "v1")]);
        env.executor.fail_command("h2", "mkdir");
        let info = mount(&env).await;

        let err = distributor(&env, &info, Vec::new(), false)
            .unwrap()
            .distribute_rootfs(&hosts(), Path::new(DEST))
            .await
            .unwrap_err();

        assert_eq!(err.failed_hosts(), vec!["h2"]);
        // The other host still got its payload.
        assert_eq!(payload_copies(&env, "h1"), vec![Path::new(DEST).join("bin/kubelet")]);
        assert!(env.executor.copies_to("h2").is_empty());
    }

    #[tokio::test]
    async fn rootfs_excludes_registry() {
        let env = TestEnvironment::new(&[("bin/kubelet", "v1"), ("registry/blob", "layer")]);
        let info = mount(&env).await;
        let dest = Path::new(DEST);
        let d = distributor(&env, &info, Vec::new(), false).unwrap();

        d.distribute_rootfs(&hosts(), dest).await.unwrap();
        assert_eq!(payload_copies(&env, "h1"), vec![dest.join("bin/kubelet")]);

        env.executor.clear_calls();
        d.distribute_registry(&["h1".to_string()], &dest.join("registry"))
            .await
            .unwrap();
        assert_eq!(payload_copies(&env, "h1"), vec![dest.join("registry/blob")]);
        assert!(env.executor.calls().iter().all(|c| c.host() == "h1"));
    }

    #[tokio::test]
    async fn configs_follow_their_hosts() {
        let env = TestEnvironment::new(&[("bin/kubelet", "v1")]);
        let info = mount(&env).await;
        let dest = Path::new(DEST);
        let configs = vec![
            Config {
                name: "all".to_string(),
                path: PathBuf::from("etc/cluster.env"),
                hosts: None,
                data: "A=1\n".to_string(),
            },
            Config {
                name: "master-only".to_string(),
                path: PathBuf::from("etc/admin.conf"),
                hosts: Some(vec!["h1".to_string()]),
                data: "admin".to_string(),
            },
        ];

        distributor(&env, &info, configs, false)
            .unwrap()
            .distribute_rootfs(&hosts(), dest)
            .await
            .unwrap();

        assert_eq!(
            env.executor.remote_file("h1", &dest.join("etc/admin.conf")),
            Some(b"admin".to_vec())
        );
        assert!(env
            .executor
            .remote_file("h2", &dest.join("etc/admin.conf"))
            .is_none());
        assert_eq!(
            env.executor.remote_file("h2", &dest.join("etc/cluster.env")),
            Some(b"A=1\n".to_vec())
        );
    }

    #[tokio::test]
    async fn bad_configs_are_rejected() {
        let env = TestEnvironment::new(&[("bin/kubelet", "v1")]);
        let info = mount(&env).await;

        let escaping = Config {
            name: "escape".to_string(),
            path: PathBuf::from("../../etc/passwd"),
            hosts: None,
            data: String::new(),
        };
        let err = distributor(&env, &info, vec![escaping], false).unwrap_err();
        assert!(matches!(err, DistributeError::BadConfig { .. }));

        let stranger = Config {
            name: "stranger".to_string(),
            path: PathBuf::from("etc/x"),
            hosts: Some(vec!["h9".to_string()]),
            data: String::new(),
        };
        let err = distributor(&env, &info, vec![stranger], false).unwrap_err();
        assert!(matches!(err, DistributeError::BadConfig { .. }));
    }
}
