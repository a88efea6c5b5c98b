// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

use coinmix_core::Result;

use super::format_secs;
use crate::config::Config;
use crate::output::Output;

pub fn cmd_check_config(out: &Output, cfg: &Config) -> Result<()> {
    let c = &cfg.coordinator;
    c.validate()?;

    out.header("Rounds");
    out.field(
        "Inputs per round",
        &format!(
            "{} to {}",
            c.min_input_count(),
            c.max_input_count_per_round
        ),
    );
    out.field(
        "Input amount",
        &format!(
            "{} to {} sats",
            c.min_registrable_amount.to_sat(),
            c.max_suggested_input_amount.to_sat()
        ),
    );
    out.field("Fee rate", &format!("{} sat/vB", c.fee_rate));
    out.field(
        "Vsize per input",
        &format!("{} vB", c.max_vsize_allocation_per_alice),
    );

    out.header("Timeouts");
    out.field("Input registration", &format_secs(c.input_registration_timeout));
    out.field(
        "Blame input registration",
        &format_secs(c.blame_input_registration_timeout),
    );
    out.field(
        "Connection confirmation",
        &format_secs(c.connection_confirmation_timeout),
    );
    out.field(
        "Output registration",
        &format!(
            "{} (fail-fast {})",
            format_secs(c.output_registration_timeout),
            format_secs(c.fail_fast_output_registration_timeout)
        ),
    );
    out.field(
        "Transaction signing",
        &format!(
            "{} (fail-fast {})",
            format_secs(c.transaction_signing_timeout),
            format_secs(c.fail_fast_transaction_signing_timeout)
        ),
    );

    out.header("Coordinator");
    out.field("Broadcast timeout", &format_secs(c.broadcast_timeout));
    out.field("Ban duration", &format_secs(c.ban_duration));
    out.field("Step interval", &format!("{}ms", c.round_step_interval.as_millis()));
    out.field("History", &format!("{} rounds", c.max_completed_history));
    out.field("Log level", &cfg.log_level.to_string());
    match &cfg.prison_path {
        Some(path) => out.field("Prison", &path.display().to_string()),
        None => out.field("Prison", "in memory"),
    }

    out.success("Configuration is valid");
    Ok(())
}
