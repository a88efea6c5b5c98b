// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Local coinjoin run against in-process collaborators.
//!
//! Time is driven by a [`ManualClock`]: whenever a pass leaves a round in
//! the same phase, the clock jumps past the phase deadline, so even the
//! default hour-long input registration finishes instantly.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bitcoin::hashes::Hash;
use bitcoin::key::TweakedPublicKey;
use bitcoin::secp256k1::{All, Keypair, Message, Secp256k1};
use bitcoin::sighash::{Prevouts, SighashCache, TapSighashType};
use bitcoin::taproot::Signature as TaprootSignature;
use bitcoin::{Amount, OutPoint, ScriptBuf, Transaction, Txid, Witness};
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use coinmix_core::mock::{MockCredentialIssuer, MockOwnershipVerifier, RecordingBroadcaster};
use coinmix_core::{
    AliceId, Arena, ArenaBuilder, Clock, Coin, CoordinatorConfig, CoordinatorError,
    EndRoundState, Inmate, IssuedCredentials, ManualClock, OutputRequest, OwnershipProof, Phase,
    Prison, Result, RoundId, RoundState, SigningRequest, P2TR_INPUT_VSIZE, P2TR_OUTPUT_VSIZE,
};

use crate::config::Config;
use crate::output::Output;

const PASS_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_PASSES_PER_ROUND: usize = 32;
const MIN_SIMULATED_INPUT: u64 = 50_000;

struct SimParticipant {
    keypair: Keypair,
    coin: Coin,
    proof: OwnershipProof,
    output_script: ScriptBuf,
    signs: bool,
    alice_id: Option<AliceId>,
    credentials: Option<IssuedCredentials>,
}

impl SimParticipant {
    fn generate(secp: &Secp256k1<All>, value: Amount, signs: bool) -> Result<Self> {
        let keypair = random_keypair(secp)?;
        let output_keypair = random_keypair(secp)?;
        let outpoint = OutPoint {
            txid: Txid::from_byte_array(rand::random()),
            vout: 0,
        };
        let (xonly, _) = keypair.x_only_public_key();

        Ok(Self {
            coin: Coin::new(outpoint, value, p2tr_script(&keypair)),
            proof: OwnershipProof(xonly.serialize().to_vec()),
            output_script: p2tr_script(&output_keypair),
            keypair,
            signs,
            alice_id: None,
            credentials: None,
        })
    }

    fn reset(&mut self) {
        self.alice_id = None;
        self.credentials = None;
    }

    fn output_request(&self, fee_rate: u64) -> Option<OutputRequest> {
        let credentials = self.credentials.clone()?;
        let input_fee = Amount::from_sat(P2TR_INPUT_VSIZE * fee_rate);
        Some(OutputRequest {
            script_pubkey: self.output_script.clone(),
            amount: self.coin.value().checked_sub(input_fee)?,
            amount_credentials: credentials.amount,
            vsize_credentials: credentials.vsize,
        })
    }

    fn sign(&self, request: &SigningRequest) -> Result<Option<Witness>> {
        let Some(index) = request
            .transaction
            .input
            .iter()
            .position(|txin| txin.previous_output == self.coin.outpoint)
        else {
            return Ok(None);
        };

        let sighash = SighashCache::new(&request.transaction)
            .taproot_key_spend_signature_hash(
                index,
                &Prevouts::All(&request.prevouts),
                TapSighashType::Default,
            )
            .map_err(|e| CoordinatorError::Transaction(format!("sighash failed: {e}")))?;
        let msg = Message::from_digest(sighash.to_byte_array());
        let signature = Secp256k1::new().sign_schnorr_no_aux_rand(&msg, &self.keypair);

        Ok(Some(Witness::p2tr_key_spend(&TaprootSignature {
            signature,
            sighash_type: TapSighashType::Default,
        })))
    }
}

fn random_keypair(secp: &Secp256k1<All>) -> Result<Keypair> {
    Keypair::from_seckey_slice(secp, &rand::random::<[u8; 32]>())
        .map_err(|e| CoordinatorError::Transaction(format!("key generation failed: {e}")))
}

fn p2tr_script(keypair: &Keypair) -> ScriptBuf {
    let (xonly, _) = keypair.x_only_public_key();
    ScriptBuf::new_p2tr_tweaked(TweakedPublicKey::dangerous_assume_tweaked(xonly))
}

/// Input values that clear the registration minimum after paying for one
/// input and one output.
fn input_value_range(config: &CoordinatorConfig) -> Result<(u64, u64)> {
    let fees = (P2TR_INPUT_VSIZE + P2TR_OUTPUT_VSIZE).saturating_mul(config.fee_rate);
    let low = config
        .min_registrable_amount
        .to_sat()
        .max(MIN_SIMULATED_INPUT)
        .saturating_add(fees);
    let max = config.max_suggested_input_amount.to_sat();
    if low > max {
        return Err(CoordinatorError::Config(format!(
            "max_suggested_input_amount {max} leaves no room for a simulated input of {low} sats"
        )));
    }
    Ok((low, low.saturating_mul(20).min(max)))
}

pub struct SimulationReport {
    pub rounds: Vec<RoundState>,
    pub inmates: Vec<Inmate>,
    pub transactions: Vec<Transaction>,
}

struct Driver<'a> {
    arena: &'a Arena,
    clock: &'a ManualClock,
    cancel: CancellationToken,
}

impl Driver<'_> {
    async fn pass(&self) -> Result<()> {
        self.arena.trigger_and_wait(PASS_TIMEOUT).await
    }

    fn state(&self, round_id: &RoundId) -> Result<RoundState> {
        self.arena
            .round_state(round_id)
            .ok_or(CoordinatorError::RoundNotFound(*round_id))
    }

    /// Drive one round to its end, acting once per phase.
    async fn run_round(
        &self,
        round_id: RoundId,
        participants: &mut [SimParticipant],
    ) -> Result<RoundState> {
        let mut acted = None;

        for _ in 0..MAX_PASSES_PER_ROUND {
            let state = self.state(&round_id)?;
            if state.phase == Phase::Ended {
                return Ok(state);
            }
            if acted != Some(state.phase) {
                self.act(&state, participants).await?;
                acted = Some(state.phase);
            }

            self.pass().await?;

            let after = self.state(&round_id)?;
            if after.phase == state.phase {
                if let Some(deadline) = after.phase_deadline {
                    if deadline > self.clock.now() {
                        self.clock.set(deadline);
                    }
                    self.clock.advance(Duration::from_secs(1));
                }
            }
        }

        Err(CoordinatorError::Timeout(format!(
            "round {round_id} did not finish"
        )))
    }

    async fn act(&self, state: &RoundState, participants: &mut [SimParticipant]) -> Result<()> {
        let round_id = state.round_id;
        let fee_rate = state.parameters.fee_rate;

        match state.phase {
            Phase::InputRegistration => {
                for p in participants.iter_mut() {
                    if state.is_blame_round() && !state.blame_whitelist.contains(&p.coin.outpoint)
                    {
                        continue;
                    }
                    match self
                        .arena
                        .register_input(round_id, p.coin.clone(), p.proof.clone(), &self.cancel)
                        .await
                    {
                        Ok(alice_id) => p.alice_id = Some(alice_id),
                        Err(e) => warn!(outpoint = %p.coin.outpoint, error = %e, "Input refused"),
                    }
                }
            }
            Phase::ConnectionConfirmation => {
                for p in participants.iter_mut() {
                    let Some(alice_id) = p.alice_id else {
                        continue;
                    };
                    let credentials = self
                        .arena
                        .confirm_connection(round_id, alice_id, &self.cancel)
                        .await?;
                    p.credentials = Some(credentials);
                }
            }
            Phase::OutputRegistration => {
                for p in participants.iter() {
                    let (Some(alice_id), Some(request)) = (p.alice_id, p.output_request(fee_rate))
                    else {
                        continue;
                    };
                    self.arena
                        .register_output(round_id, request, &self.cancel)
                        .await?;
                    self.arena.ready_to_sign(round_id, alice_id)?;
                }
            }
            Phase::TransactionSigning => {
                let request = self.arena.signing_request(round_id)?;
                for p in participants.iter().filter(|p| p.signs) {
                    let Some(alice_id) = p.alice_id else {
                        continue;
                    };
                    if let Some(witness) = p.sign(&request)? {
                        self.arena.sign_transaction(round_id, alice_id, witness)?;
                    }
                }
            }
            Phase::Ended => {}
        }
        Ok(())
    }
}

/// Run a standard round with `participants` generated inputs, the first
/// `no_show` of which never sign, then follow the blame chain to its end.
pub async fn run_simulation(
    config: CoordinatorConfig,
    participants: usize,
    no_show: usize,
    prison: Arc<Prison>,
) -> Result<SimulationReport> {
    if participants == 0 {
        return Err(CoordinatorError::Config(
            "at least one participant is required".into(),
        ));
    }
    if no_show > participants {
        return Err(CoordinatorError::Config(format!(
            "no-show count {no_show} exceeds participant count {participants}"
        )));
    }
    let (low, high) = input_value_range(&config)?;

    let clock = ManualClock::default();
    let broadcaster = Arc::new(RecordingBroadcaster::new());
    let arena = ArenaBuilder::new(
        config,
        Arc::new(MockCredentialIssuer::new()),
        broadcaster.clone(),
        Arc::new(MockOwnershipVerifier::new()),
    )
    .with_clock(Arc::new(clock.clone()))
    .with_prison(prison.clone())
    .build()?;

    let mut sims = {
        let secp = Secp256k1::new();
        let mut rng = rand::rng();
        (0..participants)
            .map(|i| {
                let value = Amount::from_sat(rng.random_range(low..=high));
                SimParticipant::generate(&secp, value, i >= no_show)
            })
            .collect::<Result<Vec<_>>>()?
    };

    let driver = Driver {
        arena: &arena,
        clock: &clock,
        cancel: CancellationToken::new(),
    };
    driver.pass().await?;

    let mut round_id = arena
        .active_rounds()
        .into_iter()
        .find(|r| r.phase == Phase::InputRegistration && !r.is_blame_round())
        .map(|r| r.round_id)
        .ok_or_else(|| CoordinatorError::Transaction("no round accepting inputs".into()))?;
    info!(round_id = %round_id, participants, no_show, "Simulation started");

    let mut rounds = Vec::new();
    loop {
        let state = driver.run_round(round_id, &mut sims).await?;
        rounds.push(state);

        let Some(blame) = arena
            .rounds()
            .into_iter()
            .find(|r| r.blame_of == Some(round_id))
        else {
            break;
        };
        sims.iter_mut().for_each(SimParticipant::reset);
        round_id = blame.round_id;
    }

    Ok(SimulationReport {
        rounds,
        inmates: prison.inmates(),
        transactions: broadcaster.transactions(),
    })
}

pub fn cmd_simulate(
    out: &Output,
    cfg: &Config,
    participants: usize,
    no_show: usize,
    prison_path: Option<&Path>,
) -> Result<()> {
    let prison = match prison_path {
        Some(path) => Prison::open(path)?,
        None => Prison::new(),
    };

    let rt = tokio::runtime::Runtime::new()
        .map_err(|e| CoordinatorError::Transaction(format!("Runtime error: {}", e)))?;
    let report = rt.block_on(run_simulation(
        cfg.coordinator.clone(),
        participants,
        no_show,
        Arc::new(prison),
    ))?;

    print_report(out, &report);
    Ok(())
}

fn print_report(out: &Output, report: &SimulationReport) {
    out.table_header(&[
        ("ROUND", 18),
        ("KIND", 8),
        ("INPUTS", 8),
        ("SIGNED", 8),
        ("OUTCOME", 30),
    ]);
    for round in &report.rounds {
        let id = round.round_id.to_hex();
        let kind = if round.is_blame_round() { "blame" } else { "standard" };
        let inputs = round.input_count.to_string();
        let signed = round.signed_count.to_string();
        let outcome = round
            .end_round_state
            .map(|s| s.to_string())
            .unwrap_or_else(|| round.phase.to_string());
        let success = round.end_round_state == Some(EndRoundState::Success);
        out.table_row(&[
            (&id[..16], 18, false),
            (kind, 8, false),
            (&inputs, 8, false),
            (&signed, 8, false),
            (&outcome, 30, success),
        ]);
    }

    if !report.transactions.is_empty() {
        out.header("Broadcast");
        for tx in &report.transactions {
            out.key_field("Txid", &tx.compute_txid().to_string());
            out.field(
                "Shape",
                &format!("{} inputs, {} outputs", tx.input.len(), tx.output.len()),
            );
        }
    }

    out.header("Prison");
    if report.inmates.is_empty() {
        out.info("  No inputs banned");
    }
    for inmate in &report.inmates {
        out.field(
            &inmate.outpoint.to_string(),
            &format!("banned until {}", inmate.banned_until.to_rfc3339()),
        );
    }

    if report.transactions.is_empty() {
        out.warn("No coinjoin was broadcast");
    } else {
        out.success("Coinjoin broadcast");
    }
}
