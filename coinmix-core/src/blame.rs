// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::collections::BTreeSet;

use bitcoin::OutPoint;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::round::{Round, RoundId, RoundParameters};

/// Marks a round as the successor of a round that failed at signing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlameMetadata {
    pub blame_of: RoundId,
    /// Only these outpoints may register.
    pub whitelist: BTreeSet<OutPoint>,
}

/// Successor of `failed` restricted to the inputs that signed in time.
///
/// Returns `None` when `failed` is itself a blame round or when too few
/// inputs signed for the successor to ever reach its minimum.
pub fn derive_blame_round(
    failed: &Round,
    signers: impl IntoIterator<Item = OutPoint>,
    parameters: RoundParameters,
    now: DateTime<Utc>,
) -> Option<Round> {
    if failed.is_blame_round() {
        return None;
    }

    let whitelist: BTreeSet<OutPoint> = signers.into_iter().collect();
    if whitelist.len() < failed.parameters().min_input_count {
        return None;
    }

    let round = Round::new(
        parameters,
        Some(BlameMetadata {
            blame_of: failed.id(),
            whitelist,
        }),
        now,
    );

    info!(
        round_id = %round.id(),
        blame_of = %failed.id(),
        whitelist = round.blame().map(|b| b.whitelist.len()).unwrap_or(0),
        "Created blame round"
    );
    Some(round)
}
