// Copyright (C) 2025 The Stratus Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Resource identifiers.

use uuid::Uuid;

/// Prefix for runner IDs.
pub const RUNNER_PREFIX: &str = "runner";
/// Prefix for state version IDs.
pub const STATE_VERSION_PREFIX: &str = "sv";
/// Prefix for state version output IDs.
pub const STATE_VERSION_OUTPUT_PREFIX: &str = "wsout";

/// Mint a new opaque ID of the form `<prefix>-<32 hex chars>`.
///
/// IDs are random (UUID v4) and never reused.
pub fn new_id(prefix: &str) -> String {
    format!("{}-{}", prefix, Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_id_has_prefix_and_is_unique() {
        let a = new_id(RUNNER_PREFIX);
        let b = new_id(RUNNER_PREFIX);
        assert!(a.starts_with("runner-"));
        assert_eq!(a.len(), "runner-".len() + 32);
        assert_ne!(a, b);
    }
}
