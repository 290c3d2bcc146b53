// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

#[cfg(test)]
mod tests {
    use keel_lib::{
        clusterfile::{ClusterFile, ClusterFileError, ClusterFileStore, LocalClusterFileStore, SaveOptions},
        fleet::Role,
        test_env::cluster_file,
    };

    fn commit() -> SaveOptions {
        SaveOptions {
            commit_to_cluster: true,
            conf_path: None,
        }
    }

    #[test]
    fn several_clusters_need_a_name() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalClusterFileStore::new(dir.path());
        let a = cluster_file("a", "img:v1", &[("10.0.0.1", &[Role::Master])]);
        let b = cluster_file("b", "img:v1", &[("10.0.1.1", &[Role::Master])]);
        store.save_all(&a, &commit()).unwrap();
        store.save_all(&b, &commit()).unwrap();

        assert!(matches!(
            store.load_current(None),
            Err(ClusterFileError::Ambiguous(2))
        ));
        assert_eq!(store.load_current(Some("b")).unwrap(), b);
    }

    #[test]
    fn checkpoint_does_not_replace_committed_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalClusterFileStore::new(dir.path());
        let v1 = cluster_file("prod", "img:v1", &[("10.0.0.1", &[Role::Master])]);
        store.save_all(&v1, &commit()).unwrap();

        let mut v2 = v1.clone();
        v2.retarget("img:v2", None);
        store.save_all(&v2, &SaveOptions::default()).unwrap();

        assert_eq!(store.load_current(Some("prod")).unwrap().cluster.image, "img:v1");
        let checkpoint = ClusterFile::from_path(&store.checkpoint_path("prod")).unwrap();
        assert_eq!(checkpoint.cluster.image, "img:v2");
    }

    #[test]
    fn written_document_parses_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalClusterFileStore::new(dir.path());
        let doc = cluster_file(
            "prod",
            "img:v1",
            &[("10.0.0.1", &[Role::Master]), ("10.0.0.2", &[Role::Node])],
        );
        store
            .save_all(
                &doc,
                &SaveOptions {
                    commit_to_cluster: false,
                    conf_path: Some("/etc/keel/cluster.toml".into()),
                },
            )
            .unwrap();

        let saved = std::fs::read_to_string(store.checkpoint_path("prod")).unwrap();
        let parsed = ClusterFile::from_bytes(saved.as_bytes()).unwrap();
        assert_eq!(parsed.cluster, doc.cluster);
        assert_eq!(
            parsed.install_conf_path.as_deref(),
            Some(std::path::Path::new("/etc/keel/cluster.toml"))
        );
        // The caller's document is left untouched.
        assert!(doc.install_conf_path.is_none());
    }
}
