// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "coinmix")]
#[command(about = "Coinjoin round coordinator")]
#[command(version)]
pub(crate) struct Cli {
    #[arg(short, long, global = true, help = "Path to config.toml")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Load and validate the configuration, then print the effective parameters
    CheckConfig,
    /// Run a local round with mock collaborators and simulated participants
    Simulate {
        #[arg(short, long, default_value = "4")]
        participants: usize,
        #[arg(long, default_value = "0", help = "Participants that never sign")]
        no_show: usize,
        #[arg(long, help = "Persist bans to this file instead of memory")]
        prison: Option<PathBuf>,
    },
}
