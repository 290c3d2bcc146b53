// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use clap::Parser;

use keel_lib::commands::{self, Cli};

/// The keel binary upgrades running clusters from cluster images.
fn main() {
    let args = Cli::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().filter_or("KEEL_LOG", default_level))
        .init();

    if commands::main(&args).is_err() {
        std::process::exit(1);
    }
}
