// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Connectivity checks against cluster hosts.

use std::sync::Arc;

use {
    log::{debug, error},
    thiserror::Error,
};

use crate::{fleet::Fleet, pool, remote::Env};

/// The no-op command used to check that a host accepts remote commands.
const PROBE_COMMAND: &str = "ls >> /dev/null";

/// One or more hosts could not be reached.
#[derive(Debug, Error, PartialEq)]
#[error(
    "failed to connect to host(s): {}. If their ssh credentials changed, correct them in the \
     cluster's Clusterfile (the [cluster.ssh] section), otherwise check the hosts themselves",
    .failed.join(", ")
)]
pub struct ConnectivityError {
    pub failed: Vec<String>,
}

/// Probe every host in `hosts`.
///
/// Every host is tried, even after a failure. Returns the hosts that failed, in the order they
/// were given, along with a single error naming all of them if there were any.
pub async fn check_hosts(
    fleet: &Fleet,
    hosts: &[String],
) -> (Vec<String>, Option<ConnectivityError>) {
    let results = pool::run_bounded(hosts.to_vec(), fleet.parallelism(), |host| {
        let executor = Arc::clone(fleet.executor());
        let env = fleet.env_for(&host, &Env::new());
        async move {
            debug!("checking ssh client of {host}");
            let result = executor.exec(&host, &env, PROBE_COMMAND).await;
            (host, result)
        }
    })
    .await;

    let mut failed = Vec::new();
    for (host, result) in results {
        if let Err(e) = result {
            error!("failed to connect to host {host}: {e}");
            failed.push(host);
        }
    }

    let err = if failed.is_empty() {
        None
    } else {
        Some(ConnectivityError {
            failed: failed.clone(),
        })
    };
    (failed, err)
}
