// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![forbid(unsafe_code)]

use bitcoin::{Amount, OutPoint};
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::round::{Phase, RoundId};

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("Round {round_id} is in {actual:?}, operation requires {expected}")]
    WrongPhase {
        round_id: RoundId,
        expected: &'static str,
        actual: Phase,
    },

    #[error("Input {0} is already registered")]
    AlreadyRegistered(OutPoint),

    #[error("Input {outpoint} is banned until {until}")]
    Banned {
        outpoint: OutPoint,
        until: DateTime<Utc>,
    },

    #[error("Input {0} is not whitelisted for this blame round")]
    NotWhitelisted(OutPoint),

    #[error("Round {0} is full")]
    RoundFull(RoundId),

    #[error("Amount {amount} outside allowed range: {reason}")]
    AmountOutOfRange { amount: Amount, reason: String },

    #[error("Script type not allowed: {0}")]
    ScriptNotAllowed(String),

    #[error("Insufficient funds: missing {missing}")]
    InsufficientFunds { missing: Amount },

    #[error("Invalid witness: {0}")]
    InvalidWitness(String),

    #[error("Invalid ownership proof for {0}")]
    InvalidOwnershipProof(OutPoint),

    #[error("Credentials rejected: {0}")]
    CredentialsRejected(String),

    #[error("Credential issuer error: {0}")]
    Credential(String),

    #[error("Round not found: {0}")]
    RoundNotFound(RoundId),

    #[error("Alice not found: {0}")]
    AliceNotFound(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Arena already started")]
    AlreadyStarted,

    #[error("Invalid config: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CoordinatorError {
    pub(crate) fn wrong_phase(round_id: RoundId, expected: &'static str, actual: Phase) -> Self {
        Self::WrongPhase {
            round_id,
            expected,
            actual,
        }
    }
}

pub type Result<T> = std::result::Result<T, CoordinatorError>;
