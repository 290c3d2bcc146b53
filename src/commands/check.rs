// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::path::PathBuf;

use clap::Args;

use crate::{
    commands::{self, handled_error, HandledResult},
    config::Settings,
    probe,
};

#[derive(Args, Debug, Clone)]
pub struct CheckArgs {
    /// Check the hosts of this Clusterfile instead of a saved desired state.
    #[arg(short = 'f', long = "Clusterfile")]
    clusterfile: Option<PathBuf>,

    #[arg(long)]
    cluster: Option<String>,
}

pub async fn check(settings: &Settings, args: &CheckArgs) -> HandledResult<()> {
    let doc = commands::load_document(settings, args.clusterfile.as_deref(), args.cluster.as_deref())?;
    let fleet = commands::fleet_for(settings, &doc)?;

    let hosts = fleet.all_hosts();
    let (failed, err) = probe::check_hosts(&fleet, &hosts).await;
    for host in hosts.iter() {
        let status = if failed.contains(host) { "FAILED" } else { "OK" };
        println!("{host}: {status}");
    }

    match err {
        Some(e) => {
            eprintln!("{e}");
            handled_error()
        }
        None => Ok(()),
    }
}
