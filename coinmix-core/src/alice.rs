// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::fmt;

use bitcoin::{Amount, OutPoint, ScriptBuf, TxOut};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::external::IssuedCredentials;

/// A spendable output offered as a coinjoin input.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Coin {
    pub outpoint: OutPoint,
    pub txout: TxOut,
}

impl Coin {
    pub fn new(outpoint: OutPoint, value: Amount, script_pubkey: ScriptBuf) -> Self {
        Self {
            outpoint,
            txout: TxOut {
                value,
                script_pubkey,
            },
        }
    }

    pub fn value(&self) -> Amount {
        self.txout.value
    }

    pub fn script_pubkey(&self) -> &ScriptBuf {
        &self.txout.script_pubkey
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnershipProof(pub Vec<u8>);

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AliceId(pub [u8; 32]);

impl AliceId {
    pub fn random() -> Self {
        Self(rand::rng().random())
    }
}

impl fmt::Display for AliceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for AliceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AliceId({})", hex::encode(&self.0[..8]))
    }
}

/// A registered input participant. Owned by exactly one round.
#[derive(Debug, Clone)]
pub struct Alice {
    id: AliceId,
    coin: Coin,
    ownership_proof: OwnershipProof,
    registered_at: DateTime<Utc>,
    confirmed_connection: bool,
    ready_to_sign: bool,
    credentials: Option<IssuedCredentials>,
}

impl Alice {
    pub fn new(coin: Coin, ownership_proof: OwnershipProof, registered_at: DateTime<Utc>) -> Self {
        Self {
            id: AliceId::random(),
            coin,
            ownership_proof,
            registered_at,
            confirmed_connection: false,
            ready_to_sign: false,
            credentials: None,
        }
    }

    pub fn id(&self) -> AliceId {
        self.id
    }

    pub fn coin(&self) -> &Coin {
        &self.coin
    }

    pub fn outpoint(&self) -> OutPoint {
        self.coin.outpoint
    }

    pub fn ownership_proof(&self) -> &OwnershipProof {
        &self.ownership_proof
    }

    pub fn registered_at(&self) -> DateTime<Utc> {
        self.registered_at
    }

    pub fn confirmed_connection(&self) -> bool {
        self.confirmed_connection
    }

    pub fn ready_to_sign(&self) -> bool {
        self.ready_to_sign
    }

    pub fn credentials(&self) -> Option<&IssuedCredentials> {
        self.credentials.as_ref()
    }

    pub(crate) fn confirm(&mut self, credentials: IssuedCredentials) {
        self.confirmed_connection = true;
        self.credentials = Some(credentials);
    }

    pub(crate) fn set_ready_to_sign(&mut self) {
        self.ready_to_sign = true;
    }
}
