// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

//! In-process collaborators for local simulation and tests.

use std::collections::HashSet;

use async_trait::async_trait;
use bitcoin::{Amount, OutPoint, Transaction};
use parking_lot::Mutex;
use rand::Rng;

use crate::alice::{Coin, OwnershipProof};
use crate::error::{CoordinatorError, Result};
use crate::external::{
    BalanceRequest, BroadcastError, Broadcaster, Credential, CredentialIssuer,
    CredentialPresentation, IssuedCredentials, OwnershipVerifier,
};
use crate::round::RoundId;

const CREDENTIAL_LEN: usize = 24;

/// Issues plaintext credentials `value || nonce`. Each presented credential
/// can be spent once.
#[derive(Default)]
pub struct MockCredentialIssuer {
    spent: Mutex<HashSet<Credential>>,
}

impl MockCredentialIssuer {
    pub fn new() -> Self {
        Self::default()
    }

    fn mint(value: u64) -> Credential {
        let nonce: [u8; 16] = rand::rng().random();
        let mut bytes = Vec::with_capacity(CREDENTIAL_LEN);
        bytes.extend_from_slice(&value.to_le_bytes());
        bytes.extend_from_slice(&nonce);
        Credential(bytes)
    }

    fn value_of(credential: &Credential) -> Result<u64> {
        if credential.0.len() != CREDENTIAL_LEN {
            return Err(CoordinatorError::Credential("malformed credential".into()));
        }
        let mut value = [0u8; 8];
        value.copy_from_slice(&credential.0[..8]);
        Ok(u64::from_le_bytes(value))
    }

    fn total(credentials: &[Credential]) -> Result<u64> {
        credentials
            .iter()
            .try_fold(0u64, |acc, c| Ok(acc.saturating_add(Self::value_of(c)?)))
    }
}

#[async_trait]
impl CredentialIssuer for MockCredentialIssuer {
    async fn issue(&self, amount: Amount, vsize: u64) -> Result<IssuedCredentials> {
        Ok(IssuedCredentials {
            amount: vec![Self::mint(amount.to_sat())],
            vsize: vec![Self::mint(vsize)],
        })
    }

    async fn verify_conservation(
        &self,
        presented: &CredentialPresentation,
        requested: &BalanceRequest,
    ) -> Result<bool> {
        let amount = Self::total(&presented.amount)?;
        let vsize = Self::total(&presented.vsize)?;
        if amount < requested.amount.to_sat() || vsize < requested.vsize {
            return Ok(false);
        }

        let mut spent = self.spent.lock();
        let all: Vec<&Credential> = presented.amount.iter().chain(&presented.vsize).collect();
        let unique: HashSet<&Credential> = all.iter().copied().collect();
        if unique.len() != all.len() || all.iter().any(|c| spent.contains(*c)) {
            return Ok(false);
        }
        spent.extend(all.into_iter().cloned());
        Ok(true)
    }
}

/// Records every broadcast transaction. A rejecting broadcaster records
/// nothing and fails every call; a stalling one records the attempt and never
/// answers.
#[derive(Default)]
pub struct RecordingBroadcaster {
    reject_with: Option<String>,
    stall: bool,
    transactions: Mutex<Vec<Transaction>>,
}

impl RecordingBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rejecting(reason: impl Into<String>) -> Self {
        Self {
            reject_with: Some(reason.into()),
            ..Self::default()
        }
    }

    pub fn stalling() -> Self {
        Self {
            stall: true,
            ..Self::default()
        }
    }

    pub fn transactions(&self) -> Vec<Transaction> {
        self.transactions.lock().clone()
    }
}

#[async_trait]
impl Broadcaster for RecordingBroadcaster {
    async fn broadcast(&self, transaction: &Transaction) -> std::result::Result<(), BroadcastError> {
        if let Some(reason) = &self.reject_with {
            return Err(BroadcastError(reason.clone()));
        }
        self.transactions.lock().push(transaction.clone());
        if self.stall {
            std::future::pending::<()>().await;
        }
        Ok(())
    }
}

/// Accepts every proof except those for outpoints marked invalid.
#[derive(Default)]
pub struct MockOwnershipVerifier {
    rejected: Mutex<HashSet<OutPoint>>,
}

impl MockOwnershipVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reject(&self, outpoint: OutPoint) {
        self.rejected.lock().insert(outpoint);
    }
}

#[async_trait]
impl OwnershipVerifier for MockOwnershipVerifier {
    async fn verify(&self, _round_id: &RoundId, coin: &Coin, _proof: &OwnershipProof) -> Result<bool> {
        Ok(!self.rejected.lock().contains(&coin.outpoint))
    }
}
