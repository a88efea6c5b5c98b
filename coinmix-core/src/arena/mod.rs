// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later
mod steps;

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bitcoin::Witness;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc, Mutex as TokioMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::alice::{Alice, AliceId, Coin, OwnershipProof};
use crate::clock::{Clock, SystemClock};
use crate::config::CoordinatorConfig;
use crate::error::{CoordinatorError, Result};
use crate::external::{
    BalanceRequest, Broadcaster, CredentialIssuer, CredentialPresentation, IssuedCredentials,
    OwnershipVerifier,
};
use crate::idempotency::IdempotencyCache;
use crate::multiparty::output_vsize;
use crate::prison::Prison;
use crate::round::{
    ConfirmationStep, EndRoundState, OutputRequest, Phase, Round, RoundId, RoundState,
    SigningRequest,
};

pub type SharedRound = Arc<RwLock<Round>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundEvent {
    Created {
        round_id: RoundId,
        blame_of: Option<RoundId>,
    },
    PhaseChanged {
        round_id: RoundId,
        phase: Phase,
    },
    Ended {
        round_id: RoundId,
        end_round_state: EndRoundState,
    },
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct InputKey {
    round_id: RoundId,
    coin: Coin,
    proof: OwnershipProof,
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct OutputKey {
    round_id: RoundId,
    request: OutputRequest,
}

struct Runner {
    shutdown_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

pub struct ArenaBuilder {
    config: CoordinatorConfig,
    issuer: Arc<dyn CredentialIssuer>,
    broadcaster: Arc<dyn Broadcaster>,
    ownership: Arc<dyn OwnershipVerifier>,
    clock: Arc<dyn Clock>,
    prison: Arc<Prison>,
}

impl ArenaBuilder {
    pub fn new(
        config: CoordinatorConfig,
        issuer: Arc<dyn CredentialIssuer>,
        broadcaster: Arc<dyn Broadcaster>,
        ownership: Arc<dyn OwnershipVerifier>,
    ) -> Self {
        Self {
            config,
            issuer,
            broadcaster,
            ownership,
            clock: Arc::new(SystemClock),
            prison: Arc::new(Prison::new()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_prison(mut self, prison: Arc<Prison>) -> Self {
        self.prison = prison;
        self
    }

    pub fn build(self) -> Result<Arena> {
        self.config.validate()?;
        let (event_tx, _) = broadcast::channel(1000);

        Ok(Arena {
            inner: Arc::new(ArenaInner {
                config: self.config,
                rounds: RwLock::new(Vec::new()),
                history: RwLock::new(VecDeque::new()),
                prison: self.prison,
                clock: self.clock,
                issuer: self.issuer,
                broadcaster: self.broadcaster,
                ownership: self.ownership,
                event_tx,
                step_lock: TokioMutex::new(()),
                input_cache: IdempotencyCache::new(),
                output_cache: IdempotencyCache::new(),
                runner: Mutex::new(None),
            }),
        })
    }
}

pub(crate) struct ArenaInner {
    pub(crate) config: CoordinatorConfig,
    pub(crate) rounds: RwLock<Vec<SharedRound>>,
    pub(crate) history: RwLock<VecDeque<RoundState>>,
    pub(crate) prison: Arc<Prison>,
    pub(crate) clock: Arc<dyn Clock>,
    issuer: Arc<dyn CredentialIssuer>,
    pub(crate) broadcaster: Arc<dyn Broadcaster>,
    ownership: Arc<dyn OwnershipVerifier>,
    pub(crate) event_tx: broadcast::Sender<RoundEvent>,
    pub(crate) step_lock: TokioMutex<()>,
    input_cache: IdempotencyCache<InputKey, AliceId>,
    output_cache: IdempotencyCache<OutputKey, ()>,
    runner: Mutex<Option<Runner>>,
}

/// Owns every active round and drives their phases.
///
/// Cloning is cheap and every clone refers to the same arena.
#[derive(Clone)]
pub struct Arena {
    inner: Arc<ArenaInner>,
}

async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(CoordinatorError::Cancelled),
        result = fut => result,
    }
}

impl Arena {
    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    pub fn prison(&self) -> &Arc<Prison> {
        &self.inner.prison
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RoundEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Spawn the scheduler. Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<()> {
        let mut runner = self.inner.runner.lock();
        if runner.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            return Err(CoordinatorError::AlreadyStarted);
        }

        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let handle = tokio::spawn(self.inner.clone().run(shutdown_rx));
        *runner = Some(Runner {
            shutdown_tx,
            handle,
        });
        info!(
            interval_ms = self.inner.config.round_step_interval.as_millis() as u64,
            "Arena started"
        );
        Ok(())
    }

    /// Stop the scheduler and wait for the current pass to finish.
    pub async fn stop(&self) {
        let Some(runner) = self.inner.runner.lock().take() else {
            return;
        };
        let _ = runner.shutdown_tx.send(()).await;
        if let Err(e) = runner.handle.await {
            warn!(error = %e, "Arena task did not shut down cleanly");
        }
        info!("Arena stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner
            .runner
            .lock()
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }

    /// Run one scheduling pass now and wait for it to complete.
    pub async fn trigger_and_wait(&self, timeout: Duration) -> Result<()> {
        tokio::time::timeout(timeout, self.inner.step())
            .await
            .map_err(|_| CoordinatorError::Timeout("scheduling pass did not finish".into()))
    }

    pub fn active_rounds(&self) -> Vec<RoundState> {
        self.inner
            .rounds
            .read()
            .iter()
            .map(|round| round.read().state())
            .filter(|state| state.phase != Phase::Ended)
            .collect()
    }

    /// Active rounds followed by retained history, oldest first.
    pub fn rounds(&self) -> Vec<RoundState> {
        let mut states: Vec<RoundState> = self.inner.history.read().iter().cloned().collect();
        states.extend(
            self.inner
                .rounds
                .read()
                .iter()
                .map(|round| round.read().state()),
        );
        states
    }

    pub fn round_state(&self, round_id: &RoundId) -> Option<RoundState> {
        if let Ok(round) = self.inner.round(round_id) {
            return Some(round.read().state());
        }
        self.inner
            .history
            .read()
            .iter()
            .find(|state| &state.round_id == round_id)
            .cloned()
    }

    pub async fn register_input(
        &self,
        round_id: RoundId,
        coin: Coin,
        ownership_proof: OwnershipProof,
        cancel: &CancellationToken,
    ) -> Result<AliceId> {
        let key = InputKey {
            round_id,
            coin: coin.clone(),
            proof: ownership_proof.clone(),
        };
        self.inner
            .input_cache
            .get_or_compute(key, || {
                self.inner
                    .register_input(round_id, coin, ownership_proof, cancel)
            })
            .await
    }

    pub fn remove_input(&self, round_id: RoundId, alice_id: AliceId) -> Result<()> {
        let round = self.inner.round(&round_id)?;
        let alice = round.write().remove_alice(&alice_id)?;

        self.inner.input_cache.remove(&InputKey {
            round_id,
            coin: alice.coin().clone(),
            proof: alice.ownership_proof().clone(),
        });
        info!(round_id = %round_id, alice_id = %alice_id, "Input removed");
        Ok(())
    }

    pub async fn confirm_connection(
        &self,
        round_id: RoundId,
        alice_id: AliceId,
        cancel: &CancellationToken,
    ) -> Result<IssuedCredentials> {
        let round = self.inner.round(&round_id)?;
        let step = round.read().confirmation_step(&alice_id)?;

        let (amount, vsize) = match step {
            ConfirmationStep::AlreadyConfirmed(credentials) => return Ok(credentials),
            ConfirmationStep::Issue { amount, vsize } => (amount, vsize),
        };

        let issued = cancellable(cancel, self.inner.issuer.issue(amount, vsize)).await?;
        let credentials = round.write().commit_confirmation(&alice_id, issued)?;
        debug!(round_id = %round_id, alice_id = %alice_id, "Connection confirmed");
        Ok(credentials)
    }

    pub async fn register_output(
        &self,
        round_id: RoundId,
        request: OutputRequest,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let key = OutputKey {
            round_id,
            request: request.clone(),
        };
        self.inner
            .output_cache
            .get_or_compute(key, || self.inner.register_output(round_id, request, cancel))
            .await
    }

    pub fn ready_to_sign(&self, round_id: RoundId, alice_id: AliceId) -> Result<()> {
        let round = self.inner.round(&round_id)?;
        round.write().ready_to_sign(&alice_id)?;
        debug!(round_id = %round_id, alice_id = %alice_id, "Ready to sign");
        Ok(())
    }

    pub fn signing_request(&self, round_id: RoundId) -> Result<SigningRequest> {
        let round = self.inner.round(&round_id)?;
        let request = round.read().signing_request()?;
        Ok(request)
    }

    pub fn sign_transaction(
        &self,
        round_id: RoundId,
        alice_id: AliceId,
        witness: Witness,
    ) -> Result<()> {
        let round = self.inner.round(&round_id)?;
        round.write().sign(&alice_id, witness)?;
        debug!(round_id = %round_id, alice_id = %alice_id, "Witness accepted");
        Ok(())
    }
}

impl ArenaInner {
    pub(crate) fn round(&self, round_id: &RoundId) -> Result<SharedRound> {
        self.rounds
            .read()
            .iter()
            .find(|round| &round.read().id() == round_id)
            .cloned()
            .ok_or(CoordinatorError::RoundNotFound(*round_id))
    }

    async fn run(self: Arc<Self>, mut shutdown_rx: mpsc::Receiver<()>) {
        let mut interval = tokio::time::interval(self.config.round_step_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
                _ = interval.tick() => {
                    self.step().await;
                }
            }
        }
    }

    async fn register_input(
        &self,
        round_id: RoundId,
        coin: Coin,
        ownership_proof: OwnershipProof,
        cancel: &CancellationToken,
    ) -> Result<AliceId> {
        let round = self.round(&round_id)?;
        round
            .read()
            .validate_input(&coin, &self.prison, self.clock.now())?;

        let owned = cancellable(
            cancel,
            self.ownership.verify(&round_id, &coin, &ownership_proof),
        )
        .await?;
        if !owned {
            return Err(CoordinatorError::InvalidOwnershipProof(coin.outpoint));
        }

        let now = self.clock.now();
        let outpoint = coin.outpoint;
        let alice_id = {
            let mut round = round.write();
            round.validate_input(&coin, &self.prison, now)?;
            round.add_alice(Alice::new(coin, ownership_proof, now))?
        };

        info!(
            round_id = %round_id,
            alice_id = %alice_id,
            outpoint = %outpoint,
            "Input registered"
        );
        Ok(alice_id)
    }

    async fn register_output(
        &self,
        round_id: RoundId,
        request: OutputRequest,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let round = self.round(&round_id)?;
        let output = round.read().prepare_output(&request)?;

        let presented = CredentialPresentation {
            amount: request.amount_credentials.clone(),
            vsize: request.vsize_credentials.clone(),
        };
        let requested = BalanceRequest {
            amount: request.amount,
            vsize: output_vsize(&request.script_pubkey).unwrap_or(0),
        };
        let balanced = cancellable(
            cancel,
            self.issuer.verify_conservation(&presented, &requested),
        )
        .await?;
        if !balanced {
            return Err(CoordinatorError::CredentialsRejected(
                "presented credentials do not cover the output".into(),
            ));
        }

        let value = output.value;
        round.write().commit_output(output)?;
        info!(round_id = %round_id, value = %value, "Output registered");
        Ok(())
    }
}
