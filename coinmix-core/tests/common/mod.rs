// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use bitcoin::hashes::Hash;
use bitcoin::key::TweakedPublicKey;
use bitcoin::secp256k1::{Keypair, Message, Secp256k1};
use bitcoin::sighash::{Prevouts, SighashCache, TapSighashType};
use bitcoin::taproot::Signature as TaprootSignature;
use bitcoin::{Amount, OutPoint, ScriptBuf, Txid, Witness};
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use coinmix_core::mock::{MockCredentialIssuer, MockOwnershipVerifier, RecordingBroadcaster};
use coinmix_core::{
    AliceId, Arena, ArenaBuilder, Clock, Coin, CoordinatorConfig, IssuedCredentials, ManualClock,
    OutputRequest, OwnershipProof, Phase, Prison, RoundId, RoundState, SigningRequest,
    P2TR_INPUT_VSIZE,
};

pub const COIN_VALUE: u64 = 100_000;

pub fn config(max_inputs: usize, multiplier: f64) -> CoordinatorConfig {
    CoordinatorConfig {
        max_input_count_per_round: max_inputs,
        min_input_count_multiplier: multiplier,
        ..Default::default()
    }
}

pub struct Participant {
    pub keypair: Keypair,
    pub coin: Coin,
    pub proof: OwnershipProof,
    pub alice_id: Option<AliceId>,
    pub credentials: Option<IssuedCredentials>,
}

impl Participant {
    pub fn new(seed: u8) -> Self {
        Self::with_value(seed, COIN_VALUE)
    }

    pub fn with_value(seed: u8, sats: u64) -> Self {
        let secp = Secp256k1::new();
        let keypair = Keypair::from_seckey_slice(&secp, &[seed; 32]).unwrap();
        let (xonly, _) = keypair.x_only_public_key();
        let script = ScriptBuf::new_p2tr_tweaked(TweakedPublicKey::dangerous_assume_tweaked(xonly));
        let coin = Coin::new(
            OutPoint {
                txid: Txid::from_byte_array([seed; 32]),
                vout: u32::from(seed),
            },
            Amount::from_sat(sats),
            script,
        );
        Self {
            keypair,
            coin,
            proof: OwnershipProof(vec![seed]),
            alice_id: None,
            credentials: None,
        }
    }

    pub fn outpoint(&self) -> OutPoint {
        self.coin.outpoint
    }

    pub fn alice_id(&self) -> AliceId {
        self.alice_id.expect("participant not registered")
    }

    /// Output request spending every credential this participant holds.
    pub fn output_request(&self, fee_rate: u64) -> OutputRequest {
        let credentials = self.credentials.clone().expect("participant not confirmed");
        OutputRequest {
            script_pubkey: self.coin.script_pubkey().clone(),
            amount: self.coin.value() - Amount::from_sat(P2TR_INPUT_VSIZE * fee_rate),
            amount_credentials: credentials.amount,
            vsize_credentials: credentials.vsize,
        }
    }

    pub fn sign(&self, request: &SigningRequest) -> Witness {
        let index = request
            .transaction
            .input
            .iter()
            .position(|txin| txin.previous_output == self.coin.outpoint)
            .expect("input missing from skeleton");
        let sighash = SighashCache::new(&request.transaction)
            .taproot_key_spend_signature_hash(
                index,
                &Prevouts::All(&request.prevouts),
                TapSighashType::Default,
            )
            .unwrap();
        let msg = Message::from_digest(sighash.to_byte_array());
        let signature = Secp256k1::new().sign_schnorr_no_aux_rand(&msg, &self.keypair);
        Witness::p2tr_key_spend(&TaprootSignature {
            signature,
            sighash_type: TapSighashType::Default,
        })
    }
}

pub struct Harness {
    pub arena: Arena,
    pub clock: ManualClock,
    pub broadcaster: Arc<RecordingBroadcaster>,
    pub ownership: Arc<MockOwnershipVerifier>,
    pub cancel: CancellationToken,
}

impl Harness {
    pub fn new(config: CoordinatorConfig) -> Self {
        Self::build(config, RecordingBroadcaster::new(), Arc::new(Prison::new()))
    }

    pub fn rejecting_broadcasts(config: CoordinatorConfig) -> Self {
        Self::build(
            config,
            RecordingBroadcaster::rejecting("txn-mempool-conflict"),
            Arc::new(Prison::new()),
        )
    }

    pub fn with_broadcaster(config: CoordinatorConfig, broadcaster: RecordingBroadcaster) -> Self {
        Self::build(config, broadcaster, Arc::new(Prison::new()))
    }

    pub fn with_prison(config: CoordinatorConfig, prison: Arc<Prison>) -> Self {
        Self::build(config, RecordingBroadcaster::new(), prison)
    }

    fn build(config: CoordinatorConfig, broadcaster: RecordingBroadcaster, prison: Arc<Prison>) -> Self {
        let clock = ManualClock::default();
        let broadcaster = Arc::new(broadcaster);
        let ownership = Arc::new(MockOwnershipVerifier::new());
        let arena = ArenaBuilder::new(
            config,
            Arc::new(MockCredentialIssuer::new()),
            broadcaster.clone(),
            ownership.clone(),
        )
        .with_clock(Arc::new(clock.clone()))
        .with_prison(prison)
        .build()
        .unwrap();

        Self {
            arena,
            clock,
            broadcaster,
            ownership,
            cancel: CancellationToken::new(),
        }
    }

    pub async fn tick(&self) {
        self.arena
            .trigger_and_wait(Duration::from_secs(5))
            .await
            .unwrap();
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn advance(&self, secs: u64) {
        self.clock.advance(Duration::from_secs(secs));
    }

    pub fn fee_rate(&self) -> u64 {
        self.arena.config().fee_rate
    }

    /// The standard round currently accepting inputs.
    pub fn input_round(&self) -> RoundState {
        self.arena
            .active_rounds()
            .into_iter()
            .find(|r| r.phase == Phase::InputRegistration && !r.is_blame_round())
            .expect("no round accepting inputs")
    }

    pub fn state(&self, round_id: &RoundId) -> RoundState {
        self.arena.round_state(round_id).expect("unknown round")
    }

    pub fn blame_rounds_of(&self, round_id: &RoundId) -> Vec<RoundState> {
        self.arena
            .rounds()
            .into_iter()
            .filter(|r| r.blame_of.as_ref() == Some(round_id))
            .collect()
    }

    pub async fn register(&self, round_id: RoundId, participant: &mut Participant) {
        let alice_id = self
            .arena
            .register_input(
                round_id,
                participant.coin.clone(),
                participant.proof.clone(),
                &self.cancel,
            )
            .await
            .unwrap();
        participant.alice_id = Some(alice_id);
    }

    pub async fn confirm(&self, round_id: RoundId, participant: &mut Participant) {
        let credentials = self
            .arena
            .confirm_connection(round_id, participant.alice_id(), &self.cancel)
            .await
            .unwrap();
        participant.credentials = Some(credentials);
    }

    pub async fn register_output(&self, round_id: RoundId, participant: &Participant) {
        self.arena
            .register_output(round_id, participant.output_request(self.fee_rate()), &self.cancel)
            .await
            .unwrap();
    }

    /// Register every participant in a fresh round and take it to signing.
    pub async fn round_in_signing(&self, participants: &mut [Participant]) -> RoundId {
        self.tick().await;
        let round_id = self.input_round().round_id;

        for p in participants.iter_mut() {
            self.register(round_id, p).await;
        }
        self.tick().await;
        assert_eq!(self.state(&round_id).phase, Phase::ConnectionConfirmation);

        for p in participants.iter_mut() {
            self.confirm(round_id, p).await;
        }
        self.tick().await;
        assert_eq!(self.state(&round_id).phase, Phase::OutputRegistration);

        for p in participants.iter() {
            self.register_output(round_id, p).await;
            self.arena.ready_to_sign(round_id, p.alice_id()).unwrap();
        }
        self.tick().await;
        assert_eq!(self.state(&round_id).phase, Phase::TransactionSigning);

        round_id
    }

    pub fn sign(&self, round_id: RoundId, participant: &Participant) {
        let request = self.arena.signing_request(round_id).unwrap();
        self.arena
            .sign_transaction(round_id, participant.alice_id(), participant.sign(&request))
            .unwrap();
    }
}

pub fn participants(seeds: std::ops::RangeInclusive<u8>) -> Vec<Participant> {
    seeds.map(Participant::new).collect()
}
