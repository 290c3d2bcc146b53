// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

#[cfg(test)]
mod tests {
    use std::{
        path::{Path, PathBuf},
        sync::Mutex,
    };

    use async_trait::async_trait;

    use keel_lib::{
        distributor::{DistributeError, Distributor},
        fleet::{Role, CLUSTER_ROOT_BASE},
        registry::{load_to_registry, RegistryError},
        test_env::*,
    };

    /// Records registry distributions instead of performing them.
    #[derive(Debug, Default)]
    struct RecordingDistributor {
        registry: Mutex<Vec<(Vec<String>, PathBuf)>>,
    }

    #[async_trait]
    impl Distributor for RecordingDistributor {
        async fn distribute_rootfs(
            &self,
            _hosts: &[String],
            _dest: &Path,
        ) -> Result<(), DistributeError> {
            Ok(())
        }

        async fn distribute_registry(
            &self,
            hosts: &[String],
            dest: &Path,
        ) -> Result<(), DistributeError> {
            self.registry
                .lock()
                .unwrap()
                .push((hosts.to_vec(), dest.to_path_buf()));
            Ok(())
        }
    }

    fn targets(distributor: &RecordingDistributor) -> Vec<Vec<String>> {
        distributor
            .registry
            .lock()
            .unwrap()
            .iter()
            .map(|(hosts, _)| hosts.clone())
            .collect()
    }

    #[tokio::test]
    async fn no_local_registry_is_a_no_op() {
        let env = TestEnvironment::new(&[]);
        let cf = cluster_file("c1", "img", &[("m1", &[Role::Master]), ("n1", &[Role::Node])]);
        let distributor = RecordingDistributor::default();

        load_to_registry(&env.fleet(&cf), &distributor).await.unwrap();

        assert!(targets(&distributor).is_empty());
    }

    #[tokio::test]
    async fn no_deploy_hosts() {
        let env = TestEnvironment::new(&[]);
        let cf = with_local_registry(
            cluster_file("c1", "img", &[("w1", &[Role::Worker])]),
            Some(true),
        );
        let distributor = RecordingDistributor::default();

        let err = load_to_registry(&env.fleet(&cf), &distributor)
            .await
            .unwrap_err();

        assert!(matches!(err, RegistryError::NoDeployHosts));
        assert!(targets(&distributor).is_empty());
    }

    #[tokio::test]
    async fn without_ha_only_first_node() {
        let env = TestEnvironment::new(&[]);
        let cf = with_local_registry(
            cluster_file(
                "c1",
                "img",
                &[
                    ("m1", &[Role::Master]),
                    ("nodeA", &[Role::Node]),
                    ("nodeB", &[Role::Node]),
                ],
            ),
            Some(false),
        );
        let distributor = RecordingDistributor::default();

        load_to_registry(&env.fleet(&cf), &distributor).await.unwrap();

        let calls = distributor.registry.lock().unwrap().clone();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, vec!["nodeA"]);
        assert_eq!(
            calls[0].1,
            Path::new(CLUSTER_ROOT_BASE).join("c1").join("registry")
        );
    }

    #[tokio::test]
    async fn unset_ha_behaves_as_disabled() {
        let env = TestEnvironment::new(&[]);
        let cf = with_local_registry(
            cluster_file("c1", "img", &[("nodeA", &[Role::Node]), ("nodeB", &[Role::Node])]),
            None,
        );
        let distributor = RecordingDistributor::default();

        load_to_registry(&env.fleet(&cf), &distributor).await.unwrap();

        assert_eq!(targets(&distributor), vec![vec!["nodeA".to_string()]]);
    }

    #[tokio::test]
    async fn with_ha_every_node() {
        let env = TestEnvironment::new(&[]);
        let cf = with_local_registry(
            cluster_file(
                "c1",
                "img",
                &[
                    ("m1", &[Role::Master]),
                    ("nodeA", &[Role::Node]),
                    ("nodeB", &[Role::Node]),
                ],
            ),
            Some(true),
        );
        let distributor = RecordingDistributor::default();

        load_to_registry(&env.fleet(&cf), &distributor).await.unwrap();

        assert_eq!(
            targets(&distributor),
            vec![vec!["nodeA".to_string(), "nodeB".to_string()]]
        );
    }

    #[tokio::test]
    async fn falls_back_to_masters() {
        let env = TestEnvironment::new(&[]);
        let cf = with_local_registry(
            cluster_file(
                "c1",
                "img",
                &[
                    ("m1", &[Role::Master]),
                    ("m2", &[Role::Master]),
                    ("w1", &[Role::Worker]),
                ],
            ),
            Some(true),
        );
        let distributor = RecordingDistributor::default();

        load_to_registry(&env.fleet(&cf), &distributor).await.unwrap();

        assert_eq!(
            targets(&distributor),
            vec![vec!["m1".to_string(), "m2".to_string()]]
        );
    }
}
