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

//! # SwarmKB Context — Thread-Safe Knowledge Store
//!
//! The concurrent heart of the middleware: a keyed store of
//! [`KnowledgeRecord`]s shared by every thread of a process, coordinating
//! local reads and writes with replication over an external transport.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                 KnowledgeContext                      │
//! │                                                       │
//! │  Mutex<ContextState> ──────────── Condvar (changed)   │
//! │    │                                                  │
//! │    ├── KnowledgeMap                                   │
//! │    │     slot arena (generation-stamped)              │
//! │    │     BTreeMap name index (ordered scans)          │
//! │    ├── global_modified   (latest-wins, → transport)   │
//! │    ├── local_modified    (latest-wins, → checkpoint)  │
//! │    ├── clock             (Lamport, monotone)          │
//! │    └── change_generation (coalesced wait/signal)      │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! Every public operation takes the context mutex once; internal helpers
//! receive the locked state explicitly, so the lock is never re-entered.
//! Writers stamp records with the Lamport clock, route the name into the
//! appropriate modified-set, and wake [`KnowledgeContext::wait_for_change`]
//! callers. A transport drains [`KnowledgeContext::get_modifieds`], sends,
//! and calls [`KnowledgeContext::reset_modified`]; inbound records go
//! through [`KnowledgeContext::update_record_from_external`], where the
//! per-record (clock, quality) merge rule decides visibility.
//!
//! ## Modules
//!
//! - [`map`] — the record arena, ordered name index, and
//!   [`VariableReference`] stable handles
//! - [`context`] — the thread-safe façade and all primitive operations
//! - [`checkpoint`] — binary checkpoint and textual dump persistence

pub mod checkpoint;
pub mod context;
pub mod map;

pub use context::{KnowledgeContext, MergeOutcome, ToMapResult, UpdateOutcome};
pub use map::{KnowledgeMap, VariableReference};

// Re-export the value layer so embedders depend on one crate.
pub use swarmkb_core::{
    Integer, KnowledgeRecord, KnowledgeReferenceSettings, KnowledgeUpdateSettings, KnowledgeValue,
    LocalityOverride, RecordStatus, RecordType, Result, SwarmKbError,
};
