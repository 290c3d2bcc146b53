// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use keel_lib::{fleet::Role, probe::check_hosts, test_env::*};

    fn hosts() -> Vec<String> {
        vec!["h1".to_string(), "h2".to_string(), "h3".to_string()]
    }

    #[tokio::test]
    async fn every_host_is_attempted() {
        let env = TestEnvironment::new(&[]);
        env.executor.set_unreachable("h2");
        let cf = cluster_file(
            "c1",
            "img",
            &[("h1", &[Role::Master]), ("h2", &[Role::Node]), ("h3", &[Role::Node])],
        );

        let (failed, err) = check_hosts(&env.fleet(&cf), &hosts()).await;

        assert_eq!(failed, vec!["h2"]);
        let err = err.unwrap();
        assert_eq!(err.failed, vec!["h2"]);
        assert!(err.to_string().contains("h2"));
        assert!(err.to_string().contains("[cluster.ssh]"));

        let attempted: BTreeSet<String> = env
            .executor
            .calls()
            .iter()
            .map(|c| c.host().to_string())
            .collect();
        assert_eq!(attempted, hosts().into_iter().collect());
    }

    #[tokio::test]
    async fn failures_keep_input_order() {
        let env = TestEnvironment::new(&[]);
        env.executor.set_unreachable("h3");
        env.executor.set_unreachable("h1");
        let cf = cluster_file(
            "c1",
            "img",
            &[("h1", &[Role::Master]), ("h2", &[Role::Node]), ("h3", &[Role::Node])],
        );

        let (failed, err) = check_hosts(&env.fleet(&cf), &hosts()).await;

        assert_eq!(failed, vec!["h1", "h3"]);
        assert!(err.is_some());
    }

    #[tokio::test]
    async fn all_reachable() {
        let env = TestEnvironment::new(&[]);
        let cf = cluster_file("c1", "img", &[("h1", &[Role::Master])]);

        let (failed, err) = check_hosts(&env.fleet(&cf), &["h1".to_string()]).await;

        assert!(failed.is_empty());
        assert!(err.is_none());
    }
}
