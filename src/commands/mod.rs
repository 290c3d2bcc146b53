// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

pub mod check;
pub mod upgrade;
pub mod validate;

use std::{path::Path, sync::Arc};

use {
    check::CheckArgs,
    upgrade::UpgradeArgs,
    validate::ValidateArgs,
};

use clap::{Parser, Subcommand};

use crate::{
    clusterfile::{ClusterFile, ClusterFileStore, LocalClusterFileStore},
    config::Settings,
    fleet::Fleet,
    image::{ImageExtension, ImageType},
    remote::{ssh::SshExecutor, RemoteExecutor},
};

/// A `HandledError` represents an error that has already been handled. When you call a function
/// that returns a `HandledError` or `HandledResult`, you don't need to do anything with that error,
/// other than just be aware that it happened, and return it on to your caller.
///
/// `main()` has a special responsibility: since its "caller" is, in a certain sense, the operating
/// system, `main()` must return a nonzero exit status when it gets a `HandledError`.
///
/// The primary way to construct a `HandledError` is with the `handle_err()` function, which turns a
/// generic error into a `HandledError`, and also runs some caller-provided code to handle the
/// error. That provided code would normally do something like report the error to stderr.
///
/// A `HandledError` inentionally has no data about what the specific error was; the process of
/// handling the error "consumes" that information, and it is no longer needed as the error was
/// already appropriately handled.
#[derive(Debug, PartialEq)]
pub struct HandledError {}

pub type HandledResult<T> = std::result::Result<T, HandledError>;

pub fn handled_error() -> HandledResult<()> {
    HandledResult::Err(HandledError {})
}

pub trait Handle<T, F> {
    fn handle_err(self, handler: F) -> HandledResult<T>;
}

impl<T, E, F: FnOnce(E)> Handle<T, F> for std::result::Result<T, E> {
    /// Handle an error by running the provided `handler` code, giving it the error.
    ///
    /// Then, return a `HandledResult`, so that transitive callers of this function know that they
    /// do not need to do anything further to handle the error.
    fn handle_err(self, handler: F) -> HandledResult<T> {
        self.map_err(|e| {
            handler(e);
            HandledError {}
        })
    }
}

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to the keel settings file.
    #[arg(long, global = true)]
    pub config: Option<String>,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Upgrade a running cluster to a new cluster image.
    Upgrade(UpgradeArgs),
    /// Check that every host of a cluster accepts remote commands.
    Check(CheckArgs),
    /// Parse a Clusterfile and print the fleet it describes.
    Validate(ValidateArgs),
}

fn load_settings(cli: &Cli) -> HandledResult<Settings> {
    Settings::load(cli.config.as_deref()).handle_err(|e| eprintln!("{e}"))
}

/// Load the Clusterfile at `path`, or the cluster's current desired state when `path` is `None`.
fn load_document(
    settings: &Settings,
    path: Option<&Path>,
    cluster: Option<&str>,
) -> HandledResult<ClusterFile> {
    match path {
        Some(path) => ClusterFile::from_path(path),
        None => LocalClusterFileStore::new(&settings.state_dir).load_current(cluster),
    }
    .handle_err(|e| eprintln!("{e}"))
}

/// Build the remote executor for a cluster: the settings' ssh options, unless the Clusterfile
/// overrides them.
fn executor(settings: &Settings, doc: Option<&ClusterFile>) -> Arc<dyn RemoteExecutor> {
    let ssh = doc
        .and_then(|doc| doc.cluster.ssh.clone())
        .unwrap_or_else(|| settings.ssh.clone());
    Arc::new(SshExecutor::new(ssh))
}

/// Resolve the fleet a Clusterfile describes, without an image.
fn fleet_for(settings: &Settings, doc: &ClusterFile) -> HandledResult<Fleet> {
    let extension = ImageExtension {
        kind: ImageType::ClusterInstaller,
        labels: Default::default(),
        launch: Default::default(),
        env: Default::default(),
    };
    Fleet::new(
        &doc.cluster,
        &extension,
        executor(settings, Some(doc)),
        settings.parallelism,
    )
    .handle_err(|e| eprintln!("Invalid cluster '{}': {e}", doc.cluster.name))
}

pub fn main(cli: &Cli) -> HandledResult<()> {
    let settings = load_settings(cli)?;

    if let Commands::Validate(args) = &cli.command {
        return validate::validate(&settings, args);
    }

    let rt = tokio::runtime::Runtime::new()
        .handle_err(|e| eprintln!("Error launching tokio runtime: {e}"))?;

    rt.block_on(async {
        match &cli.command {
            Commands::Upgrade(args) => upgrade::upgrade(&settings, args).await,
            Commands::Check(args) => check::check(&settings, args).await,
            Commands::Validate(_) => unreachable!(),
        }
    })
}
