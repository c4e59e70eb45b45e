// Copyright (C) 2025 The Stratus Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Timestamps.

use chrono::{DateTime, SubsecRound, Utc};

/// The current time, truncated to microseconds.
///
/// PostgreSQL stores timestamps with microsecond precision; truncating here
/// keeps in-memory records equal to what a subsequent read returns.
pub fn current_timestamp() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}
