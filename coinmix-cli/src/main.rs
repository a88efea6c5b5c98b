// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![deny(unsafe_code)]

mod cli;
mod commands;
mod config;
mod output;

use clap::Parser;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use coinmix_core::Result;

use crate::cli::{Cli, Commands};
use crate::config::{Config, LogLevel};
use crate::output::Output;

/// `RUST_LOG` overrides the configured level. `COINMIX_LOG_JSON` switches to
/// JSON lines.
fn init_logging(level: LogLevel) {
    let use_json = std::env::var("COINMIX_LOG_JSON").is_ok();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()));

    if use_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}

fn main() {
    let out = Output::new();

    if let Err(e) = run(&out) {
        out.error(&e.to_string());
        std::process::exit(1);
    }
}

fn run(out: &Output) -> Result<()> {
    let cli = Cli::parse();
    let cfg = Config::load(cli.config.as_deref())?;
    init_logging(cfg.log_level);

    debug!(config = ?cli.config, "starting command");

    match cli.command {
        Commands::CheckConfig => commands::check_config::cmd_check_config(out, &cfg),
        Commands::Simulate {
            participants,
            no_show,
            prison,
        } => {
            let prison = prison.or_else(|| cfg.prison_path.clone());
            commands::simulate::cmd_simulate(out, &cfg, participants, no_show, prison.as_deref())
        }
    }
}
