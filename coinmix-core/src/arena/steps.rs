// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

//! One scheduling pass over every active round.

use std::sync::Arc;

use bitcoin::{OutPoint, Transaction};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

use super::{ArenaInner, RoundEvent, SharedRound};
use crate::blame::derive_blame_round;
use crate::clock::deadline;
use crate::prison::BanReason;
use crate::round::{EndRoundState, Phase, Round, RoundParameters};

impl ArenaInner {
    /// Passes never overlap. Each round moves at most one phase per pass;
    /// blame rounds created here are first stepped on the next pass.
    pub(super) async fn step(&self) {
        let _pass = self.step_lock.lock().await;

        let rounds: Vec<SharedRound> = self.rounds.read().clone();
        join_all(rounds.iter().map(|round| self.step_round(round))).await;

        self.retire_ended();
        self.ensure_input_registration_round();
    }

    async fn step_round(&self, shared: &SharedRound) {
        let now = self.clock.now();
        let phase = shared.read().phase();

        match phase {
            Phase::InputRegistration => self.step_input_registration(&mut shared.write(), now),
            Phase::ConnectionConfirmation => {
                self.step_connection_confirmation(&mut shared.write(), now)
            }
            Phase::OutputRegistration => self.step_output_registration(&mut shared.write(), now),
            Phase::TransactionSigning => self.step_transaction_signing(shared, now).await,
            Phase::Ended => {}
        }
    }

    fn step_input_registration(&self, round: &mut Round, now: DateTime<Utc>) {
        let expired = round.has_phase_expired(now);
        if !expired && !round.is_full() && !round.whitelist_complete() {
            return;
        }

        if round.has_enough_alices() {
            self.transition(round, Phase::ConnectionConfirmation, now);
        } else if expired {
            info!(
                round_id = %round.id(),
                inputs = round.alices().len(),
                required = round.parameters().min_input_count,
                "Not enough inputs registered"
            );
            self.end_round(round, EndRoundState::AbortedNotEnoughAlices, now);
        }
    }

    fn step_connection_confirmation(&self, round: &mut Round, now: DateTime<Utc>) {
        if round.confirmed_count() == round.alices().len() {
            self.transition(round, Phase::OutputRegistration, now);
            return;
        }
        if !round.has_phase_expired(now) {
            return;
        }

        match round.drop_unconfirmed() {
            Ok(dropped) => {
                info!(
                    round_id = %round.id(),
                    dropped = dropped.len(),
                    remaining = round.alices().len(),
                    "Dropped unconfirmed inputs"
                );
                if round.has_enough_alices() {
                    self.transition(round, Phase::OutputRegistration, now);
                } else {
                    self.end_round(round, EndRoundState::AbortedNotEnoughAlices, now);
                }
            }
            Err(e) => {
                error!(round_id = %round.id(), error = %e, "Failed to drop unconfirmed inputs");
                self.end_round(round, EndRoundState::AbortedWithError, now);
            }
        }
    }

    fn step_output_registration(&self, round: &mut Round, now: DateTime<Utc>) {
        let all_ready = round.ready_count() == round.alices().len();
        if !all_ready && !round.has_phase_expired(now) {
            return;
        }
        if !all_ready {
            debug!(
                round_id = %round.id(),
                ready = round.ready_count(),
                inputs = round.alices().len(),
                "Output registration timed out"
            );
            round.use_fast_signing();
        }

        match round.lock_transaction() {
            Ok(()) => self.transition(round, Phase::TransactionSigning, now),
            Err(e) => {
                error!(round_id = %round.id(), error = %e, "Failed to lock coinjoin");
                self.end_round(round, EndRoundState::AbortedWithError, now);
            }
        }
    }

    async fn step_transaction_signing(&self, shared: &SharedRound, now: DateTime<Utc>) {
        let transaction = match self.check_signatures(shared, now) {
            SigningCheck::Pending => return,
            // Registered before the next await so a dropped pass cannot lose it.
            SigningCheck::Failed(blame) => {
                if let Some(round) = blame {
                    self.add_round(round);
                }
                return;
            }
            SigningCheck::Complete(transaction) => transaction,
        };

        let txid = transaction.compute_txid();
        let result = tokio::time::timeout(
            self.config.broadcast_timeout,
            self.broadcaster.broadcast(&transaction),
        )
        .await;

        let mut round = shared.write();
        match result {
            Ok(Ok(())) => {
                info!(round_id = %round.id(), txid = %txid, "Coinjoin broadcast");
                self.end_round(&mut round, EndRoundState::Success, now);
            }
            Ok(Err(e)) => {
                warn!(round_id = %round.id(), txid = %txid, error = %e, "Coinjoin broadcast failed");
                self.end_round(&mut round, EndRoundState::TransactionBroadcastFailed, now);
            }
            Err(_) => {
                warn!(
                    round_id = %round.id(),
                    txid = %txid,
                    timeout_ms = self.config.broadcast_timeout.as_millis() as u64,
                    "Coinjoin broadcast timed out"
                );
                self.end_round(&mut round, EndRoundState::TransactionBroadcastFailed, now);
            }
        }
    }

    fn check_signatures(&self, shared: &RwLock<Round>, now: DateTime<Utc>) -> SigningCheck {
        let mut round = shared.write();

        let Some(signing) = round.coinjoin().as_signing() else {
            error!(round_id = %round.id(), "Signing phase without a locked coinjoin");
            self.end_round(&mut round, EndRoundState::AbortedWithError, now);
            return SigningCheck::Failed(None);
        };

        if signing.is_fully_signed() {
            return match signing.create_transaction() {
                Ok(transaction) => SigningCheck::Complete(transaction),
                Err(e) => {
                    error!(round_id = %round.id(), error = %e, "Failed to assemble coinjoin");
                    self.end_round(&mut round, EndRoundState::AbortedWithError, now);
                    SigningCheck::Failed(None)
                }
            };
        }

        if !round.has_phase_expired(now) {
            return SigningCheck::Pending;
        }

        let signed = signing.signed_outpoints();
        let unsigned = signing.unsigned_outpoints();
        warn!(
            round_id = %round.id(),
            signed = signed.len(),
            unsigned = unsigned.len(),
            "Signing deadline passed"
        );

        self.ban_unsigned(&round, &unsigned, now);
        let blame = derive_blame_round(
            &round,
            signed,
            RoundParameters::from_config(&self.config),
            now,
        );
        self.end_round(&mut round, EndRoundState::AbortedNotEnoughAlicesSigned, now);
        SigningCheck::Failed(blame)
    }

    fn ban_unsigned(&self, round: &Round, unsigned: &[OutPoint], now: DateTime<Utc>) {
        let until = deadline(now, self.config.ban_duration);
        for outpoint in unsigned {
            if let Err(e) = self
                .prison
                .ban(*outpoint, BanReason::FailedToSign, round.id(), now, until)
            {
                error!(outpoint = %outpoint, error = %e, "Failed to persist ban");
            }
        }
    }

    fn transition(&self, round: &mut Round, next: Phase, now: DateTime<Utc>) {
        let round_id = round.id();
        if let Err(e) = round.advance(next, now) {
            error!(round_id = %round_id, error = %e, "Rejected phase transition");
            self.end_round(round, EndRoundState::AbortedWithError, now);
            return;
        }
        info!(round_id = %round_id, phase = %next, "Round phase changed");
        let _ = self.event_tx.send(RoundEvent::PhaseChanged {
            round_id,
            phase: next,
        });
    }

    fn end_round(&self, round: &mut Round, state: EndRoundState, now: DateTime<Utc>) {
        if !round.end(state, now) {
            return;
        }
        info!(round_id = %round.id(), outcome = %state, "Round ended");
        let _ = self.event_tx.send(RoundEvent::Ended {
            round_id: round.id(),
            end_round_state: state,
        });
    }

    fn add_round(&self, round: Round) {
        let round_id = round.id();
        let blame_of = round.blame().map(|b| b.blame_of);
        self.rounds.write().push(Arc::new(RwLock::new(round)));

        info!(round_id = %round_id, blame = blame_of.is_some(), "Round created");
        let _ = self
            .event_tx
            .send(RoundEvent::Created { round_id, blame_of });
    }

    fn retire_ended(&self) {
        let mut ended = Vec::new();
        self.rounds.write().retain(|round| {
            let round = round.read();
            if round.is_ended() {
                ended.push(round.state());
                false
            } else {
                true
            }
        });
        if ended.is_empty() {
            return;
        }

        let mut history = self.history.write();
        history.extend(ended);
        while history.len() > self.config.max_completed_history {
            history.pop_front();
        }
    }

    fn ensure_input_registration_round(&self) {
        let accepting = self.rounds.read().iter().any(|round| {
            let round = round.read();
            !round.is_blame_round() && round.phase() == Phase::InputRegistration
        });
        if accepting {
            return;
        }

        let round = Round::new(
            RoundParameters::from_config(&self.config),
            None,
            self.clock.now(),
        );
        self.add_round(round);
    }
}

enum SigningCheck {
    Pending,
    Complete(Transaction),
    /// The round ended; carries the blame round to register, if any.
    Failed(Option<Round>),
}
