// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![forbid(unsafe_code)]

use std::fmt;
use std::time::Duration;

use bitcoin::{Amount, OutPoint, ScriptBuf, Transaction, TxOut, Witness};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::alice::{Alice, AliceId, Coin};
use crate::blame::BlameMetadata;
use crate::clock::{deadline, has_expired};
use crate::config::CoordinatorConfig;
use crate::error::{CoordinatorError, Result};
use crate::external::{Credential, IssuedCredentials};
use crate::multiparty::{input_vsize, CoinjoinState, ConstructionState};
use crate::prison::Prison;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoundId(pub [u8; 32]);

impl RoundId {
    /// Fresh id committing to a random nonce, the creation time and the
    /// round it succeeds, if any.
    pub fn new(created_at: DateTime<Utc>, blame_of: Option<&RoundId>) -> Self {
        let nonce: [u8; 32] = rand::rng().random();
        let mut hasher = Sha256::new();
        hasher.update(nonce);
        hasher.update(created_at.timestamp_micros().to_le_bytes());
        if let Some(parent) = blame_of {
            hasher.update(parent.0);
        }
        Self(hasher.finalize().into())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        bytes.try_into().ok().map(Self)
    }
}

impl fmt::Display for RoundId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for RoundId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RoundId({})", hex::encode(&self.0[..8]))
    }
}

impl Serialize for RoundId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for RoundId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        let id: [u8; 32] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("round id must be 32 bytes"))?;
        Ok(Self(id))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    InputRegistration,
    ConnectionConfirmation,
    OutputRegistration,
    TransactionSigning,
    Ended,
}

impl Phase {
    /// The next phase of a round that keeps going. `Ended` is only reached
    /// through ending the round, so it is never a successor.
    pub fn successor(self) -> Option<Phase> {
        match self {
            Phase::InputRegistration => Some(Phase::ConnectionConfirmation),
            Phase::ConnectionConfirmation => Some(Phase::OutputRegistration),
            Phase::OutputRegistration => Some(Phase::TransactionSigning),
            Phase::TransactionSigning | Phase::Ended => None,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::InputRegistration => "input_registration",
            Phase::ConnectionConfirmation => "connection_confirmation",
            Phase::OutputRegistration => "output_registration",
            Phase::TransactionSigning => "transaction_signing",
            Phase::Ended => "ended",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndRoundState {
    Success,
    TransactionBroadcastFailed,
    AbortedNotEnoughAlices,
    AbortedNotEnoughAlicesSigned,
    AbortedWithError,
}

impl fmt::Display for EndRoundState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EndRoundState::Success => "success",
            EndRoundState::TransactionBroadcastFailed => "transaction_broadcast_failed",
            EndRoundState::AbortedNotEnoughAlices => "aborted_not_enough_alices",
            EndRoundState::AbortedNotEnoughAlicesSigned => "aborted_not_enough_alices_signed",
            EndRoundState::AbortedWithError => "aborted_with_error",
        };
        f.write_str(name)
    }
}

/// Configuration captured when a round is created. Later config changes
/// never reach an existing round.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoundParameters {
    pub max_input_count: usize,
    pub min_input_count: usize,
    pub min_registrable_amount: Amount,
    pub max_suggested_input_amount: Amount,
    pub fee_rate: u64,
    pub max_vsize_allocation_per_alice: u64,
    pub input_registration_timeout: Duration,
    pub blame_input_registration_timeout: Duration,
    pub connection_confirmation_timeout: Duration,
    pub output_registration_timeout: Duration,
    pub fail_fast_output_registration_timeout: Duration,
    pub transaction_signing_timeout: Duration,
    pub fail_fast_transaction_signing_timeout: Duration,
}

impl RoundParameters {
    pub fn from_config(config: &CoordinatorConfig) -> Self {
        Self {
            max_input_count: config.max_input_count_per_round,
            min_input_count: config.min_input_count(),
            min_registrable_amount: config.min_registrable_amount,
            max_suggested_input_amount: config.max_suggested_input_amount,
            fee_rate: config.fee_rate,
            max_vsize_allocation_per_alice: config.max_vsize_allocation_per_alice,
            input_registration_timeout: config.input_registration_timeout,
            blame_input_registration_timeout: config.blame_input_registration_timeout,
            connection_confirmation_timeout: config.connection_confirmation_timeout,
            output_registration_timeout: config.output_registration_timeout,
            fail_fast_output_registration_timeout: config.fail_fast_output_registration_timeout,
            transaction_signing_timeout: config.transaction_signing_timeout,
            fail_fast_transaction_signing_timeout: config.fail_fast_transaction_signing_timeout,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OutputRequest {
    pub script_pubkey: ScriptBuf,
    /// Credential value spent on this output, fee included.
    pub amount: Amount,
    pub amount_credentials: Vec<Credential>,
    pub vsize_credentials: Vec<Credential>,
}

/// The locked skeleton handed to participants for signing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SigningRequest {
    pub round_id: RoundId,
    pub transaction: Transaction,
    pub prevouts: Vec<TxOut>,
}

/// What confirming a connection still needs after the phase checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmationStep {
    AlreadyConfirmed(IssuedCredentials),
    Issue { amount: Amount, vsize: u64 },
}

/// Read-only view of a round for observers and history.
#[derive(Debug, Clone, Serialize)]
pub struct RoundState {
    pub round_id: RoundId,
    pub phase: Phase,
    pub end_round_state: Option<EndRoundState>,
    pub parameters: RoundParameters,
    pub blame_of: Option<RoundId>,
    pub blame_whitelist: Vec<OutPoint>,
    pub input_count: usize,
    pub confirmed_count: usize,
    pub ready_count: usize,
    pub signed_count: usize,
    pub created_at: DateTime<Utc>,
    pub phase_started_at: DateTime<Utc>,
    pub phase_deadline: Option<DateTime<Utc>>,
}

impl RoundState {
    pub fn is_blame_round(&self) -> bool {
        self.blame_of.is_some()
    }
}

pub struct Round {
    id: RoundId,
    parameters: RoundParameters,
    phase: Phase,
    end_round_state: Option<EndRoundState>,
    coinjoin: CoinjoinState,
    alices: Vec<Alice>,
    blame: Option<BlameMetadata>,
    created_at: DateTime<Utc>,
    phase_started_at: DateTime<Utc>,
    fast_output_registration: bool,
    fast_signing: bool,
}

impl Round {
    pub fn new(
        parameters: RoundParameters,
        blame: Option<BlameMetadata>,
        now: DateTime<Utc>,
    ) -> Self {
        let id = RoundId::new(now, blame.as_ref().map(|b| &b.blame_of));
        Self {
            id,
            coinjoin: CoinjoinState::Construction(ConstructionState::new(parameters.fee_rate)),
            fast_output_registration: blame.is_some(),
            parameters,
            phase: Phase::InputRegistration,
            end_round_state: None,
            alices: Vec::new(),
            blame,
            created_at: now,
            phase_started_at: now,
            fast_signing: false,
        }
    }

    pub fn id(&self) -> RoundId {
        self.id
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn end_round_state(&self) -> Option<EndRoundState> {
        self.end_round_state
    }

    pub fn parameters(&self) -> &RoundParameters {
        &self.parameters
    }

    pub fn coinjoin(&self) -> &CoinjoinState {
        &self.coinjoin
    }

    pub fn alices(&self) -> &[Alice] {
        &self.alices
    }

    pub fn alice(&self, alice_id: &AliceId) -> Result<&Alice> {
        self.alices
            .iter()
            .find(|a| &a.id() == alice_id)
            .ok_or_else(|| CoordinatorError::AliceNotFound(alice_id.to_string()))
    }

    fn alice_mut(&mut self, alice_id: &AliceId) -> Result<&mut Alice> {
        self.alices
            .iter_mut()
            .find(|a| &a.id() == alice_id)
            .ok_or_else(|| CoordinatorError::AliceNotFound(alice_id.to_string()))
    }

    pub fn blame(&self) -> Option<&BlameMetadata> {
        self.blame.as_ref()
    }

    pub fn is_blame_round(&self) -> bool {
        self.blame.is_some()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn phase_started_at(&self) -> DateTime<Utc> {
        self.phase_started_at
    }

    pub fn is_ended(&self) -> bool {
        self.phase == Phase::Ended
    }

    pub fn confirmed_count(&self) -> usize {
        self.alices.iter().filter(|a| a.confirmed_connection()).count()
    }

    pub fn ready_count(&self) -> usize {
        self.alices.iter().filter(|a| a.ready_to_sign()).count()
    }

    pub fn signed_count(&self) -> usize {
        self.coinjoin
            .as_signing()
            .map(|s| s.signed_count())
            .unwrap_or(0)
    }

    pub fn is_full(&self) -> bool {
        self.alices.len() >= self.parameters.max_input_count
    }

    pub fn has_enough_alices(&self) -> bool {
        self.alices.len() >= self.parameters.min_input_count
    }

    /// True for blame rounds once every whitelisted outpoint has an Alice.
    pub fn whitelist_complete(&self) -> bool {
        self.blame.as_ref().is_some_and(|blame| {
            blame
                .whitelist
                .iter()
                .all(|outpoint| self.alices.iter().any(|a| &a.outpoint() == outpoint))
        })
    }

    /// Time budget of the current phase, `None` once ended.
    pub fn phase_timeout(&self) -> Option<Duration> {
        let p = &self.parameters;
        match self.phase {
            Phase::InputRegistration if self.is_blame_round() => {
                Some(p.blame_input_registration_timeout)
            }
            Phase::InputRegistration => Some(p.input_registration_timeout),
            Phase::ConnectionConfirmation => Some(p.connection_confirmation_timeout),
            Phase::OutputRegistration if self.fast_output_registration => {
                Some(p.fail_fast_output_registration_timeout)
            }
            Phase::OutputRegistration => Some(p.output_registration_timeout),
            Phase::TransactionSigning if self.fast_signing => {
                Some(p.fail_fast_transaction_signing_timeout)
            }
            Phase::TransactionSigning => Some(p.transaction_signing_timeout),
            Phase::Ended => None,
        }
    }

    pub fn phase_deadline(&self) -> Option<DateTime<Utc>> {
        self.phase_timeout()
            .map(|timeout| deadline(self.phase_started_at, timeout))
    }

    pub fn has_phase_expired(&self, now: DateTime<Utc>) -> bool {
        self.phase_timeout()
            .is_some_and(|timeout| has_expired(self.phase_started_at, timeout, now))
    }

    fn require_phase(&self, expected: Phase, name: &'static str) -> Result<()> {
        if self.phase != expected {
            return Err(CoordinatorError::wrong_phase(self.id, name, self.phase));
        }
        Ok(())
    }

    fn construction(&self) -> Result<&ConstructionState> {
        self.coinjoin.as_construction().ok_or_else(|| {
            CoordinatorError::Transaction("coinjoin is already locked for signing".into())
        })
    }

    fn construction_mut(&mut self) -> Result<&mut ConstructionState> {
        match &mut self.coinjoin {
            CoinjoinState::Construction(state) => Ok(state),
            CoinjoinState::Signing(_) => Err(CoordinatorError::Transaction(
                "coinjoin is already locked for signing".into(),
            )),
        }
    }

    /// Every check on a candidate input that does not need the ownership
    /// proof. Run before and again after verification.
    pub fn validate_input(&self, coin: &Coin, prison: &Prison, now: DateTime<Utc>) -> Result<()> {
        self.require_phase(Phase::InputRegistration, "input_registration")?;

        if let Some(blame) = &self.blame {
            if !blame.whitelist.contains(&coin.outpoint) {
                return Err(CoordinatorError::NotWhitelisted(coin.outpoint));
            }
        }

        if self.alices.iter().any(|a| a.outpoint() == coin.outpoint) {
            return Err(CoordinatorError::AlreadyRegistered(coin.outpoint));
        }

        if let Some(inmate) = prison.get(&coin.outpoint) {
            if inmate.is_banned(now) {
                return Err(CoordinatorError::Banned {
                    outpoint: coin.outpoint,
                    until: inmate.banned_until,
                });
            }
        }

        if self.is_full() {
            return Err(CoordinatorError::RoundFull(self.id));
        }

        let value = coin.value();
        if value < self.parameters.min_registrable_amount {
            return Err(CoordinatorError::AmountOutOfRange {
                amount: value,
                reason: format!("below minimum {}", self.parameters.min_registrable_amount),
            });
        }
        if value > self.parameters.max_suggested_input_amount {
            return Err(CoordinatorError::AmountOutOfRange {
                amount: value,
                reason: format!("above maximum {}", self.parameters.max_suggested_input_amount),
            });
        }

        let fee = self.construction()?.input_fee(coin.script_pubkey())?;
        if value <= fee {
            return Err(CoordinatorError::AmountOutOfRange {
                amount: value,
                reason: format!("does not cover its own fee {fee}"),
            });
        }
        Ok(())
    }

    pub(crate) fn add_alice(&mut self, alice: Alice) -> Result<AliceId> {
        self.construction_mut()?.add_input(alice.coin().clone())?;
        let id = alice.id();
        self.alices.push(alice);
        Ok(id)
    }

    pub(crate) fn remove_alice(&mut self, alice_id: &AliceId) -> Result<Alice> {
        self.require_phase(Phase::InputRegistration, "input_registration")?;
        let position = self
            .alices
            .iter()
            .position(|a| &a.id() == alice_id)
            .ok_or_else(|| CoordinatorError::AliceNotFound(alice_id.to_string()))?;

        let outpoint = self.alices[position].outpoint();
        self.construction_mut()?.remove_input(&outpoint)?;
        Ok(self.alices.remove(position))
    }

    pub(crate) fn confirmation_step(&self, alice_id: &AliceId) -> Result<ConfirmationStep> {
        self.require_phase(Phase::ConnectionConfirmation, "connection_confirmation")?;
        let alice = self.alice(alice_id)?;

        if let Some(credentials) = alice.credentials() {
            return Ok(ConfirmationStep::AlreadyConfirmed(credentials.clone()));
        }

        let script = alice.coin().script_pubkey();
        let fee = self.construction()?.input_fee(script)?;
        let vsize = input_vsize(script).unwrap_or(0);
        Ok(ConfirmationStep::Issue {
            amount: alice.coin().value().checked_sub(fee).unwrap_or(Amount::ZERO),
            vsize: self
                .parameters
                .max_vsize_allocation_per_alice
                .saturating_sub(vsize),
        })
    }

    /// Record issued credentials. A concurrent confirmation that committed
    /// first wins and its credentials are returned instead.
    pub(crate) fn commit_confirmation(
        &mut self,
        alice_id: &AliceId,
        credentials: IssuedCredentials,
    ) -> Result<IssuedCredentials> {
        self.require_phase(Phase::ConnectionConfirmation, "connection_confirmation")?;
        let alice = self.alice_mut(alice_id)?;
        if let Some(existing) = alice.credentials() {
            return Ok(existing.clone());
        }
        alice.confirm(credentials.clone());
        Ok(credentials)
    }

    /// Validate an output request and derive the output it would add.
    pub(crate) fn prepare_output(&self, request: &OutputRequest) -> Result<TxOut> {
        self.require_phase(Phase::OutputRegistration, "output_registration")?;
        let construction = self.construction()?;

        let fee = construction.output_fee(&request.script_pubkey)?;
        let value = request
            .amount
            .checked_sub(fee)
            .ok_or_else(|| CoordinatorError::AmountOutOfRange {
                amount: request.amount,
                reason: format!("does not cover output fee {fee}"),
            })?;
        if value < self.parameters.min_registrable_amount {
            return Err(CoordinatorError::AmountOutOfRange {
                amount: value,
                reason: format!("below minimum {}", self.parameters.min_registrable_amount),
            });
        }

        let output = TxOut {
            value,
            script_pubkey: request.script_pubkey.clone(),
        };
        construction.clone().add_output(output.clone())?;
        Ok(output)
    }

    pub(crate) fn commit_output(&mut self, output: TxOut) -> Result<()> {
        self.require_phase(Phase::OutputRegistration, "output_registration")?;
        self.construction_mut()?.add_output(output)
    }

    pub(crate) fn ready_to_sign(&mut self, alice_id: &AliceId) -> Result<()> {
        if !matches!(
            self.phase,
            Phase::OutputRegistration | Phase::TransactionSigning
        ) {
            return Err(CoordinatorError::wrong_phase(
                self.id,
                "output_registration or transaction_signing",
                self.phase,
            ));
        }
        self.alice_mut(alice_id)?.set_ready_to_sign();
        Ok(())
    }

    pub fn signing_request(&self) -> Result<SigningRequest> {
        self.require_phase(Phase::TransactionSigning, "transaction_signing")?;
        let signing = self
            .coinjoin
            .as_signing()
            .ok_or_else(|| CoordinatorError::Transaction("coinjoin is not locked".into()))?;
        Ok(SigningRequest {
            round_id: self.id,
            transaction: signing.unsigned_transaction().clone(),
            prevouts: signing.prevouts().to_vec(),
        })
    }

    pub(crate) fn sign(&mut self, alice_id: &AliceId, witness: Witness) -> Result<()> {
        self.require_phase(Phase::TransactionSigning, "transaction_signing")?;
        let outpoint = self.alice(alice_id)?.outpoint();

        let CoinjoinState::Signing(signing) = &mut self.coinjoin else {
            return Err(CoordinatorError::Transaction("coinjoin is not locked".into()));
        };
        let index = signing.input_index(&outpoint).ok_or_else(|| {
            CoordinatorError::Transaction(format!("input {outpoint} missing from skeleton"))
        })?;
        signing.add_witness(index, witness)
    }

    /// Move to the immediate successor phase. Skipping, moving backwards or
    /// leaving `Ended` is refused.
    pub(crate) fn advance(&mut self, next: Phase, now: DateTime<Utc>) -> Result<()> {
        if self.phase.successor() != Some(next) {
            return Err(CoordinatorError::Transaction(format!(
                "illegal phase transition {} -> {}",
                self.phase, next
            )));
        }
        self.phase = next;
        self.phase_started_at = now;
        Ok(())
    }

    /// Terminal. Ending an ended round keeps the first outcome.
    pub(crate) fn end(&mut self, state: EndRoundState, now: DateTime<Utc>) -> bool {
        if self.phase == Phase::Ended {
            return false;
        }
        self.phase = Phase::Ended;
        self.end_round_state = Some(state);
        self.phase_started_at = now;
        true
    }

    /// Drop every Alice that did not confirm, along with her input.
    pub(crate) fn drop_unconfirmed(&mut self) -> Result<Vec<OutPoint>> {
        let dropped: Vec<OutPoint> = self
            .alices
            .iter()
            .filter(|a| !a.confirmed_connection())
            .map(Alice::outpoint)
            .collect();

        let construction = self.construction_mut()?;
        let mut candidate = construction.clone();
        for outpoint in &dropped {
            candidate.remove_input(outpoint)?;
        }
        *construction = candidate;

        self.alices.retain(Alice::confirmed_connection);
        if !dropped.is_empty() {
            self.fast_output_registration = true;
        }
        Ok(dropped)
    }

    pub(crate) fn use_fast_signing(&mut self) {
        self.fast_signing = true;
    }

    pub(crate) fn lock_transaction(&mut self) -> Result<()> {
        let signing = self.construction()?.finalize()?;
        self.coinjoin = CoinjoinState::Signing(signing);
        Ok(())
    }

    pub fn state(&self) -> RoundState {
        RoundState {
            round_id: self.id,
            phase: self.phase,
            end_round_state: self.end_round_state,
            parameters: self.parameters.clone(),
            blame_of: self.blame.as_ref().map(|b| b.blame_of),
            blame_whitelist: self
                .blame
                .as_ref()
                .map(|b| b.whitelist.iter().copied().collect())
                .unwrap_or_default(),
            input_count: self.alices.len(),
            confirmed_count: self.confirmed_count(),
            ready_count: self.ready_count(),
            signed_count: self.signed_count(),
            created_at: self.created_at,
            phase_started_at: self.phase_started_at,
            phase_deadline: self.phase_deadline(),
        }
    }
}
