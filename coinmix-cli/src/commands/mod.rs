// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

pub mod check_config;
pub mod simulate;

use std::time::Duration;

fn format_secs(duration: Duration) -> String {
    format!("{}s", duration.as_secs())
}
