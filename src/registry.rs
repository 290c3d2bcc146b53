// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Seeding the cluster's local image registry.

use {
    log::{info, warn},
    thiserror::Error,
};

use crate::{
    distributor::{DistributeError, Distributor, REGISTRY_DIR},
    fleet::{Fleet, Role},
};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("no deploy hosts found in the cluster: it needs at least one 'node' or 'master' host")]
    NoDeployHosts,
    #[error("failed to distribute registry: {0}")]
    Distribute(#[from] DistributeError),
}

/// Roles eligible to host the registry, in order of preference. The first role with any hosts
/// wins.
const DEPLOY_ROLE_PREFERENCE: [Role; 2] = [Role::Node, Role::Master];

/// Pick the hosts that could hold the registry, in fleet order.
pub fn deploy_hosts(fleet: &Fleet) -> Result<Vec<String>, RegistryError> {
    DEPLOY_ROLE_PREFERENCE
        .iter()
        .map(|role| fleet.hosts_by_role(*role))
        .find(|hosts| !hosts.is_empty())
        .ok_or(RegistryError::NoDeployHosts)
}

/// Narrow the candidates down to the hosts that actually receive registry data. Without HA only
/// the first candidate does.
pub fn registry_targets(candidates: Vec<String>, ha: bool) -> Vec<String> {
    if ha {
        candidates
    } else {
        candidates.into_iter().take(1).collect()
    }
}

/// Load the image's registry data onto the hosts that run the cluster's local registry.
///
/// Does nothing if the cluster has no local registry.
pub async fn load_to_registry(
    fleet: &Fleet,
    distributor: &dyn Distributor,
) -> Result<(), RegistryError> {
    let Some(local_registry) = &fleet.registry().local_registry else {
        warn!("no local registry configured, skipping registry load");
        return Ok(());
    };

    let candidates = deploy_hosts(fleet)?;
    let ha = local_registry.ha.unwrap_or(false);
    if !ha {
        info!(
            "registry HA is not enabled, limiting registry load to {}",
            candidates[0]
        );
    }
    let targets = registry_targets(candidates, ha);

    distributor
        .distribute_registry(&targets, &fleet.cluster_root().join(REGISTRY_DIR))
        .await?;

    info!("registry data loaded onto {}", targets.join(", "));
    Ok(())
}
