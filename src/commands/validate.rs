// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::path::PathBuf;

use clap::Args;

use crate::{
    clusterfile::ClusterFile,
    commands::{self, HandledResult},
    config::Settings,
    fleet::Fleet,
};

#[derive(Args, Debug, Clone)]
pub struct ValidateArgs {
    /// Clusterfile to validate. Defaults to the cluster's current desired state.
    #[arg(short = 'f', long = "Clusterfile")]
    clusterfile: Option<PathBuf>,

    #[arg(long)]
    cluster: Option<String>,
}

pub fn validate(settings: &Settings, args: &ValidateArgs) -> HandledResult<()> {
    let doc = commands::load_document(settings, args.clusterfile.as_deref(), args.cluster.as_deref())?;
    let fleet = commands::fleet_for(settings, &doc)?;

    print_summary(&doc, &fleet);

    Ok(())
}

fn print_summary(doc: &ClusterFile, fleet: &Fleet) {
    println!("cluster {} (image \"{}\")", fleet.name(), fleet.image_name());
    println!("  root: {}", fleet.cluster_root().display());
    println!("  hosts:");
    for host in fleet.hosts() {
        let roles: Vec<String> = host.roles.iter().map(|r| r.to_string()).collect();
        match &host.platform {
            Some(platform) => println!("    {} [{}] {platform}", host.address, roles.join(",")),
            None => println!("    {} [{}]", host.address, roles.join(",")),
        }
    }
    match &fleet.registry().local_registry {
        Some(reg) => println!(
            "  registry: {}:{} (ha: {})",
            reg.domain,
            reg.port,
            reg.ha.unwrap_or(false)
        ),
        None => println!("  registry: none"),
    }
    println!("  plugins: {}", doc.plugins.len());
    println!("  configs: {}", doc.configs.len());
    if let Some(app) = &doc.application {
        println!("  applications: {}", app.app_names.join(","));
    }
}
