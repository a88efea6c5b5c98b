// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::path::Path;
use std::time::Duration;

use bitcoin::Amount;
use serde::{Deserialize, Deserializer};

use crate::error::{CoordinatorError, Result};

/// Largest amount a single input may carry, 43 000 BTC.
pub const MAX_AMOUNT_PER_ALICE: u64 = 4_300_000_000_000;

const MAX_CONFIG_SIZE: u64 = 1024 * 1024;

fn deserialize_secs<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_secs)
}

fn deserialize_sats<'de, D>(deserializer: D) -> std::result::Result<Amount, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Amount::from_sat)
}

fn deserialize_multiplier<'de, D>(deserializer: D) -> std::result::Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = f64::deserialize(deserializer)?;
    if !(value > 0.0 && value <= 1.0) {
        return Err(serde::de::Error::custom(
            "min_input_count_multiplier must be in (0, 1]",
        ));
    }
    Ok(value)
}

/// Coordinator parameters. Read once per round, at round creation.
///
/// Durations are given in seconds in TOML. A zero timeout is valid and makes
/// the phase expire on the next scheduler tick.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CoordinatorConfig {
    pub max_input_count_per_round: usize,
    #[serde(deserialize_with = "deserialize_multiplier")]
    pub min_input_count_multiplier: f64,
    #[serde(deserialize_with = "deserialize_sats")]
    pub max_suggested_input_amount: Amount,
    #[serde(deserialize_with = "deserialize_sats")]
    pub min_registrable_amount: Amount,
    /// Fee rate in sat/vB applied to every input and output.
    pub fee_rate: u64,
    pub max_vsize_allocation_per_alice: u64,
    #[serde(deserialize_with = "deserialize_secs")]
    pub input_registration_timeout: Duration,
    #[serde(deserialize_with = "deserialize_secs")]
    pub blame_input_registration_timeout: Duration,
    #[serde(deserialize_with = "deserialize_secs")]
    pub connection_confirmation_timeout: Duration,
    #[serde(deserialize_with = "deserialize_secs")]
    pub output_registration_timeout: Duration,
    #[serde(deserialize_with = "deserialize_secs")]
    pub fail_fast_output_registration_timeout: Duration,
    #[serde(deserialize_with = "deserialize_secs")]
    pub transaction_signing_timeout: Duration,
    #[serde(deserialize_with = "deserialize_secs")]
    pub fail_fast_transaction_signing_timeout: Duration,
    #[serde(deserialize_with = "deserialize_secs")]
    pub ban_duration: Duration,
    #[serde(deserialize_with = "deserialize_secs")]
    pub round_step_interval: Duration,
    /// Upper bound on one broadcast attempt. An elapsed attempt counts as a
    /// failed broadcast.
    #[serde(deserialize_with = "deserialize_secs")]
    pub broadcast_timeout: Duration,
    pub max_completed_history: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_input_count_per_round: 100,
            min_input_count_multiplier: 0.5,
            max_suggested_input_amount: Amount::from_sat(MAX_AMOUNT_PER_ALICE),
            min_registrable_amount: Amount::from_sat(5_000),
            fee_rate: 2,
            max_vsize_allocation_per_alice: 255,
            input_registration_timeout: Duration::from_secs(3600),
            blame_input_registration_timeout: Duration::from_secs(180),
            connection_confirmation_timeout: Duration::from_secs(60),
            output_registration_timeout: Duration::from_secs(60),
            fail_fast_output_registration_timeout: Duration::from_secs(30),
            transaction_signing_timeout: Duration::from_secs(60),
            fail_fast_transaction_signing_timeout: Duration::from_secs(60),
            ban_duration: Duration::from_secs(24 * 3600),
            round_step_interval: Duration::from_secs(1),
            broadcast_timeout: Duration::from_secs(30),
            max_completed_history: 1000,
        }
    }
}

/// Read a TOML config file, refusing anything over 1 MiB.
pub fn read_config_file(path: &Path) -> Result<String> {
    let read_error = |e: std::io::Error| {
        CoordinatorError::Config(format!(
            "Failed to read config file {}: {}",
            path.display(),
            e
        ))
    };
    let metadata = std::fs::metadata(path).map_err(read_error)?;
    if metadata.len() > MAX_CONFIG_SIZE {
        return Err(CoordinatorError::Config("Config file too large".into()));
    }
    std::fs::read_to_string(path).map_err(read_error)
}

impl CoordinatorConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        Self::parse(&read_config_file(path)?)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| CoordinatorError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_input_count_per_round == 0 {
            return Err(CoordinatorError::Config(
                "max_input_count_per_round must be greater than 0".into(),
            ));
        }
        if !(self.min_input_count_multiplier > 0.0 && self.min_input_count_multiplier <= 1.0) {
            return Err(CoordinatorError::Config(
                "min_input_count_multiplier must be in (0, 1]".into(),
            ));
        }
        if self.max_suggested_input_amount.to_sat() > MAX_AMOUNT_PER_ALICE {
            return Err(CoordinatorError::Config(format!(
                "max_suggested_input_amount exceeds {MAX_AMOUNT_PER_ALICE} sats"
            )));
        }
        if self.min_registrable_amount > self.max_suggested_input_amount {
            return Err(CoordinatorError::Config(
                "min_registrable_amount exceeds max_suggested_input_amount".into(),
            ));
        }
        if self.round_step_interval.is_zero() {
            return Err(CoordinatorError::Config(
                "round_step_interval must be greater than 0".into(),
            ));
        }
        if self.broadcast_timeout.is_zero() {
            return Err(CoordinatorError::Config(
                "broadcast_timeout must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    /// `ceil(max_input_count_per_round * min_input_count_multiplier)`, at least 1.
    pub fn min_input_count(&self) -> usize {
        let raw = (self.max_input_count_per_round as f64 * self.min_input_count_multiplier).ceil();
        (raw as usize).clamp(1, self.max_input_count_per_round.max(1))
    }
}
