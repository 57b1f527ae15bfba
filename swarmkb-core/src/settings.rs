// SPDX-License-Identifier: AGPL-3.0-or-later
// SwarmKB - Distributed Shared-Variable Middleware
// Copyright (C) 2026 Sushanth Reddy Vanagala (https://github.com/sushanthpy)

//! Settings bundles threaded through context operations.
//!
//! Two aggregates, mirroring the two kinds of operation:
//!
//! - [`KnowledgeReferenceSettings`] — how a variable *name* is resolved
//!   (whether `{...}` expansion runs before lookup);
//! - [`KnowledgeUpdateSettings`] — how a *write* is applied (locality
//!   override, modified-set tracking, clock stamping, dissemination,
//!   signalling).
//!
//! Both are plain data carried by value; every context operation accepts a
//! settings argument, and `Default` gives the common case.

use serde::{Deserialize, Serialize};

/// Where a written variable is tracked, regardless of its name prefix.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LocalityOverride {
    /// Classify by name: a leading `.` means local.
    #[default]
    NoOverride,
    /// Track in the local modified-set even without a `.` prefix.
    AlwaysLocal,
    /// Track in the global modified-set even with a `.` prefix.
    AlwaysGlobal,
}

/// Settings for referring to variables by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnowledgeReferenceSettings {
    /// Expand `{...}` substitutions in the name before lookup.
    pub expand_variables: bool,
}

impl Default for KnowledgeReferenceSettings {
    fn default() -> Self {
        Self { expand_variables: true }
    }
}

impl KnowledgeReferenceSettings {
    /// Treat the name literally, skipping expansion. Used on hot paths where
    /// the caller already holds a resolved name.
    pub fn no_expansion() -> Self {
        Self { expand_variables: false }
    }
}

/// Settings for applying an update to a variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnowledgeUpdateSettings {
    /// Override the local/global classification otherwise derived from the
    /// name's `.` prefix.
    pub treat_as_local_override: LocalityOverride,

    /// Track writes to local variables in the local modified-set (feeds
    /// checkpointing). Disable for scratch variables that should never be
    /// checkpointed.
    pub track_local_changes: bool,

    /// Clock policy: `0` advances the record's own clock by one; `n > 0`
    /// advances the context clock by `n` before stamping the record with it.
    pub clock_increment: u64,

    /// Enter the global modified-set even when the write did not change the
    /// record's value (and re-broadcast externally received updates).
    pub always_disseminate: bool,

    /// Wake `wait_for_change` callers after the write.
    pub signal_changes: bool,
}

impl Default for KnowledgeUpdateSettings {
    fn default() -> Self {
        Self {
            treat_as_local_override: LocalityOverride::NoOverride,
            track_local_changes: true,
            clock_increment: 1,
            always_disseminate: false,
            signal_changes: true,
        }
    }
}

impl KnowledgeUpdateSettings {
    /// Preset for applying inbound transport updates: accepted records are
    /// not re-broadcast and carry their own clocks.
    pub fn from_external() -> Self {
        Self { clock_increment: 0, ..Self::default() }
    }

    /// Preset for forcing dissemination of unchanged values (full-state
    /// resends).
    pub fn always_disseminate() -> Self {
        Self { always_disseminate: true, ..Self::default() }
    }
}
