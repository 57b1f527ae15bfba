// SPDX-License-Identifier: AGPL-3.0-or-later
// SwarmKB - Distributed Shared-Variable Middleware
// Copyright (C) 2026 Sushanth Reddy Vanagala (https://github.com/sushanthpy)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! # SwarmKB Core — Knowledge Record Value Model
//!
//! The value layer of the SwarmKB shared-variable middleware. A
//! [`KnowledgeRecord`] is the dynamically typed unit every agent reads and
//! writes: a tagged payload (integer, double, their arrays, string, text,
//! XML, JPEG, opaque binary) stamped with a Lamport clock and a quality
//! (priority) used for conflict resolution between processes.
//!
//! Heavy payloads (arrays, strings, binaries) are shared by reference with
//! copy-on-write on mutation, so records can be fanned out to transports and
//! container views without copying megabytes of sensor data.
//!
//! The concurrent store that coordinates records across threads lives in the
//! `swarmkb-context` crate; this crate carries only the value model, the
//! update/reference settings bundles, and the crate-wide error type.

pub mod record;
pub mod settings;

pub use record::{Integer, KnowledgeRecord, KnowledgeValue, RecordStatus, RecordType};
pub use settings::{KnowledgeReferenceSettings, KnowledgeUpdateSettings, LocalityOverride};

/// Errors surfaced across the SwarmKB core boundary.
///
/// The core never panics on caller input: readers fall back to uninitialized
/// records, and writers report malformed input through these variants.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SwarmKbError {
    /// A writer or reference lookup was handed an empty variable name.
    #[error("variable name is empty")]
    EmptyVariableName,

    /// A `VariableReference` from another context, or one whose entry has
    /// been deleted since the reference was taken.
    #[error("variable reference is no longer valid: {0}")]
    StaleReference(String),

    /// A checkpoint file could not be opened or created.
    #[error("checkpoint open failed for {path}: {reason}")]
    CheckpointOpen { path: String, reason: String },

    /// A checkpoint read or write failed partway through.
    #[error("checkpoint I/O failed for {path}: {reason}")]
    CheckpointIo { path: String, reason: String },

    /// A checkpoint file exists but does not carry the expected header or
    /// entry layout (bad magic, unsupported version, truncated entry).
    #[error("checkpoint format error: {0}")]
    CheckpointFormat(String),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, SwarmKbError>;
