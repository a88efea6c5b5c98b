// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later
#![forbid(unsafe_code)]

mod alice;
mod arena;
mod blame;
mod clock;
mod config;
mod error;
mod external;
mod idempotency;
pub mod mock;
mod multiparty;
mod prison;
mod round;
mod witness;

pub use alice::{Alice, AliceId, Coin, OwnershipProof};
pub use arena::{Arena, ArenaBuilder, RoundEvent};
pub use blame::{derive_blame_round, BlameMetadata};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{read_config_file, CoordinatorConfig, MAX_AMOUNT_PER_ALICE};
pub use error::{CoordinatorError, Result};
pub use external::{
    BalanceRequest, BroadcastError, Broadcaster, Credential, CredentialIssuer,
    CredentialPresentation, IssuedCredentials, OwnershipVerifier,
};
pub use idempotency::IdempotencyCache;
pub use multiparty::{
    input_vsize, output_vsize, CoinjoinState, ConstructionState, SigningState,
    P2TR_INPUT_VSIZE, P2TR_OUTPUT_VSIZE, P2WPKH_INPUT_VSIZE, P2WPKH_OUTPUT_VSIZE,
};
pub use prison::{BanReason, Inmate, Prison};
pub use round::{
    EndRoundState, OutputRequest, Phase, Round, RoundId, RoundParameters, RoundState,
    SigningRequest,
};
