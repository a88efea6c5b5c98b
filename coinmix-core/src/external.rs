// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Collaborators the coordinator consumes but does not implement.

use async_trait::async_trait;
use bitcoin::{Amount, Transaction};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::alice::{Coin, OwnershipProof};
use crate::error::Result;
use crate::round::RoundId;

/// An opaque serialized credential. Only the issuer can interpret it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Credential(pub Vec<u8>);

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IssuedCredentials {
    pub amount: Vec<Credential>,
    pub vsize: Vec<Credential>,
}

/// What a participant asks to spend from previously issued credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BalanceRequest {
    pub amount: Amount,
    pub vsize: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CredentialPresentation {
    pub amount: Vec<Credential>,
    pub vsize: Vec<Credential>,
}

/// Value/vsize balance oracle backed by the anonymous credential scheme.
#[async_trait]
pub trait CredentialIssuer: Send + Sync {
    async fn issue(&self, amount: Amount, vsize: u64) -> Result<IssuedCredentials>;

    /// Whether `presented` covers `requested`. Implementations are expected to
    /// consume the presented credentials on success.
    async fn verify_conservation(
        &self,
        presented: &CredentialPresentation,
        requested: &BalanceRequest,
    ) -> Result<bool>;
}

#[derive(Error, Debug, Clone)]
#[error("Broadcast rejected: {0}")]
pub struct BroadcastError(pub String);

#[async_trait]
pub trait Broadcaster: Send + Sync {
    async fn broadcast(&self, transaction: &Transaction) -> std::result::Result<(), BroadcastError>;
}

/// Checks that the registrant controls `coin` and that the coin is unspent.
#[async_trait]
pub trait OwnershipVerifier: Send + Sync {
    async fn verify(&self, round_id: &RoundId, coin: &Coin, proof: &OwnershipProof) -> Result<bool>;
}
