// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use bitcoin::OutPoint;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::round::RoundId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BanReason {
    /// Registered and confirmed, then did not sign before the deadline.
    FailedToSign,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inmate {
    pub outpoint: OutPoint,
    pub reason: BanReason,
    pub round_id: RoundId,
    pub banned_at: DateTime<Utc>,
    pub banned_until: DateTime<Utc>,
}

impl Inmate {
    pub fn is_banned(&self, now: DateTime<Utc>) -> bool {
        now < self.banned_until
    }
}

/// UTXOs excluded from registration for a while.
///
/// Records are never evicted; expiry is decided on lookup. When opened with a
/// path, every ban is appended to the file as one JSON line.
pub struct Prison {
    inmates: RwLock<HashMap<OutPoint, Inmate>>,
    path: Option<PathBuf>,
}

impl Prison {
    pub fn new() -> Self {
        Self {
            inmates: RwLock::new(HashMap::new()),
            path: None,
        }
    }

    pub fn open(path: &Path) -> Result<Self> {
        let mut inmates = HashMap::new();

        if path.exists() {
            let file = File::open(path)?;
            file.lock_shared()?;

            for line in BufReader::new(&file).lines() {
                let line = line?;
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<Inmate>(line) {
                    Ok(inmate) => {
                        inmates.insert(inmate.outpoint, inmate);
                    }
                    Err(e) => warn!(error = %e, "Skipping invalid prison record"),
                }
            }

            FileExt::unlock(&file)?;
            debug!(count = inmates.len(), path = ?path, "Loaded prison");
        }

        Ok(Self {
            inmates: RwLock::new(inmates),
            path: Some(path.to_path_buf()),
        })
    }

    /// Ban `outpoint` until `until`. An existing ban is only ever extended.
    pub fn ban(
        &self,
        outpoint: OutPoint,
        reason: BanReason,
        round_id: RoundId,
        banned_at: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<()> {
        let inmate = {
            let mut inmates = self.inmates.write();
            let banned_until = inmates
                .get(&outpoint)
                .map(|existing| existing.banned_until.max(until))
                .unwrap_or(until);
            let inmate = Inmate {
                outpoint,
                reason,
                round_id,
                banned_at,
                banned_until,
            };
            inmates.insert(outpoint, inmate.clone());
            inmate
        };

        info!(
            outpoint = %outpoint,
            reason = ?reason,
            until = %inmate.banned_until,
            "Banned input"
        );

        if let Some(path) = &self.path {
            Self::append(path, &inmate)?;
        }
        Ok(())
    }

    fn append(path: &Path, inmate: &Inmate) -> Result<()> {
        let line = serde_json::to_string(inmate)?;
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;

        file.lock_exclusive()?;
        let write_result = writeln!(file, "{line}").and_then(|_| file.sync_all());
        FileExt::unlock(&file)?;

        write_result.map_err(Into::into)
    }

    pub fn is_banned(&self, outpoint: &OutPoint, now: DateTime<Utc>) -> bool {
        self.inmates
            .read()
            .get(outpoint)
            .is_some_and(|inmate| inmate.is_banned(now))
    }

    pub fn get(&self, outpoint: &OutPoint) -> Option<Inmate> {
        self.inmates.read().get(outpoint).cloned()
    }

    /// Every ban record ever made, expired or not.
    pub fn inmates(&self) -> Vec<Inmate> {
        let mut inmates: Vec<Inmate> = self.inmates.read().values().cloned().collect();
        inmates.sort_by_key(|inmate| inmate.outpoint);
        inmates
    }

    pub fn count_banned(&self, now: DateTime<Utc>) -> usize {
        self.inmates
            .read()
            .values()
            .filter(|inmate| inmate.is_banned(now))
            .count()
    }
}

impl Default for Prison {
    fn default() -> Self {
        Self::new()
    }
}
