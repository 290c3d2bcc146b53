// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::{path::PathBuf, sync::Arc};

use {clap::Args, log::warn, tokio_util::sync::CancellationToken};

use crate::{
    application::CommandAppDriverFactory,
    clusterfile::LocalClusterFileStore,
    commands::{self, handled_error, Handle, HandledResult},
    config::Settings,
    image::local::LocalImageStore,
    runtime::ScriptInstallerFactory,
    upgrade::{Upgrader, UpgradeOptions},
};

#[derive(Args, Debug, Clone)]
pub struct UpgradeArgs {
    /// Cluster image to upgrade to. When given, the cluster's current Clusterfile is retargeted
    /// at this image.
    image: Option<String>,

    /// Upgrade using this Clusterfile, to the image it names.
    #[arg(short = 'f', long = "Clusterfile", conflicts_with = "image")]
    clusterfile: Option<PathBuf>,

    /// Which cluster to upgrade, when more than one has a saved desired state.
    #[arg(long)]
    cluster: Option<String>,

    /// Applications to launch after the upgrade, overriding the Clusterfile's.
    #[arg(long, value_delimiter = ',')]
    apps: Option<Vec<String>>,

    /// Copy every file of the image to the hosts, even those already present.
    #[arg(long)]
    ignore_cache: bool,
}

pub async fn upgrade(settings: &Settings, args: &UpgradeArgs) -> HandledResult<()> {
    if args.image.is_none() && args.clusterfile.is_none() {
        eprintln!("you'd better specify an image or a Clusterfile to upgrade with");
        return handled_error();
    }

    let doc = commands::load_document(settings, args.clusterfile.as_deref(), args.cluster.as_deref())?;

    let upgrader = Upgrader {
        engine: Arc::new(LocalImageStore::new(&settings.image_store)),
        executor: commands::executor(settings, Some(&doc)),
        store: Arc::new(LocalClusterFileStore::new(&settings.state_dir)),
        installers: Arc::new(ScriptInstallerFactory),
        apps: Arc::new(CommandAppDriverFactory::new(&settings.state_dir)),
        parallelism: settings.parallelism,
        lock_dir: Some(settings.state_dir.clone()),
    };
    let opts = UpgradeOptions {
        ignore_cache: args.ignore_cache,
    };

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling upgrade");
            on_interrupt.cancel();
        }
    });

    let result = match (&args.clusterfile, &args.image) {
        (Some(path), _) => upgrader.upgrade_with_clusterfile(path, &opts, &cancel).await,
        (None, Some(image)) => {
            upgrader
                .upgrade_with_image(
                    image,
                    Some(doc.cluster.name.as_str()),
                    args.apps.clone(),
                    &opts,
                    &cancel,
                )
                .await
        }
        (None, None) => unreachable!(),
    };
    result.handle_err(|e| eprintln!("{e}"))?;

    // Only a finished upgrade replaces the cluster's last-known-good record.
    upgrader
        .commit(&doc.cluster.name)
        .handle_err(|e| eprintln!("upgrade succeeded but could not commit the Clusterfile: {e}"))
}
