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

//! # Knowledge Context — The Thread-Safe Façade
//!
//! Every operation here is linearisable with respect to every other: one
//! mutex guards the map, both modified-sets, the Lamport clock, and the
//! change generation. Internal helpers take the locked state explicitly
//! (the "already locked" token), so no operation ever re-enters the lock.
//!
//! ## Write Protocol
//!
//! Each setter, under the lock:
//!
//! 1. resolves (or creates) the entry;
//! 2. classifies it local or global (a `.` name prefix means local, unless
//!    the settings override);
//! 3. writes payload + type;
//! 4. stamps the record's clock (context clock advanced by
//!    `clock_increment`, or the record's own clock by one when the
//!    increment is zero);
//! 5. routes the name into the matching modified-set — a write that left
//!    the global value equal enters it only under `always_disseminate`;
//! 6. wakes `wait_for_change` callers.
//!
//! ## External Merge
//!
//! Inbound transport records go through
//! [`KnowledgeContext::update_record_from_external`]:
//!
//! ```text
//! if local is UNCREATED:                  accept
//! elif incoming.clock >  local.clock:     accept
//! elif incoming.clock <  local.clock:     reject
//! elif incoming.quality >= local.quality: accept
//! else:                                   reject
//! ```
//!
//! Acceptance order of concurrent external updates is lock-acquisition
//! order; the rule then decides visibility. An accept advances the context
//! clock to at least the incoming clock, so subsequent local writes are
//! causally later than anything observed.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use swarmkb_core::{
    Integer, KnowledgeRecord, KnowledgeReferenceSettings, KnowledgeUpdateSettings, KnowledgeValue,
    LocalityOverride, RecordStatus, RecordType, Result, SwarmKbError,
};

use crate::map::{KnowledgeMap, SlotId, VariableReference};

// =============================================================================
// Outcomes
// =============================================================================

/// Result of a conditional write ([`KnowledgeContext::set_if_unequal`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The write was applied.
    Changed,
    /// The write was suppressed: equal value and not admitted by the merge
    /// rule.
    Unchanged,
}

/// Result of applying an external record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Accepted,
    Rejected,
}

/// Result of a hierarchical map scan ([`KnowledgeContext::to_map`]).
#[derive(Debug, Clone, Default)]
pub struct ToMapResult {
    /// Distinct first segments appearing strictly after the prefix in each
    /// matching key, in order.
    pub next_keys: Vec<String>,
    /// Matching entries; empty when the scan ran in `just_keys` mode.
    pub records: BTreeMap<String, KnowledgeRecord>,
}

// =============================================================================
// Context State
// =============================================================================

pub(crate) struct ContextState {
    pub(crate) map: KnowledgeMap,
    /// The context-wide Lamport clock. Monotone; copied into records on
    /// write and pushed forward by accepted external updates.
    pub(crate) clock: u64,
    /// Bumped on every registered change; `wait_for_change` blocks until it
    /// moves, so signals between two waits coalesce into one wake.
    pub(crate) change_generation: u64,
    /// Latest-wins set of changed global names, drained by transports.
    pub(crate) global_modified: BTreeMap<String, SlotId>,
    /// Latest-wins set of changed local (`.`-prefixed) names, drained by
    /// checkpointing.
    pub(crate) local_modified: BTreeMap<String, SlotId>,
}

/// The thread-safe knowledge store shared by every thread of a process.
pub struct KnowledgeContext {
    pub(crate) state: Mutex<ContextState>,
    pub(crate) changed: Condvar,
}

impl Default for KnowledgeContext {
    fn default() -> Self {
        Self::new()
    }
}

impl KnowledgeContext {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ContextState {
                map: KnowledgeMap::new(),
                clock: 0,
                change_generation: 0,
                global_modified: BTreeMap::new(),
                local_modified: BTreeMap::new(),
            }),
            changed: Condvar::new(),
        }
    }

    // =========================================================================
    // Internal helpers (called with the state already locked)
    // =========================================================================

    fn resolve_or_create(state: &mut ContextState, name: &str) -> Result<SlotId> {
        if name.is_empty() {
            return Err(SwarmKbError::EmptyVariableName);
        }
        Ok(state.map.get_or_create(name))
    }

    /// Validate that a reference was minted by this context and still points
    /// at a live entry.
    fn live_slot(state: &ContextState, vref: &VariableReference) -> Option<SlotId> {
        let slot = vref.slot();
        match state.map.name_of(slot) {
            Some(name) if name.as_ref() == vref.name() => Some(slot),
            _ => None,
        }
    }

    /// Expand `{...}` substitutions in a name if the settings ask for it.
    fn expanded<'a>(
        state: &ContextState,
        name: &'a str,
        settings: KnowledgeReferenceSettings,
    ) -> std::borrow::Cow<'a, str> {
        if settings.expand_variables && name.contains('{') {
            std::borrow::Cow::Owned(Self::expand_inner(state, name))
        } else {
            std::borrow::Cow::Borrowed(name)
        }
    }

    /// Stamp a just-written record per the settings' clock policy.
    fn stamp(state: &mut ContextState, slot: SlotId, settings: KnowledgeUpdateSettings) {
        if settings.clock_increment == 0 {
            if let Some(rec) = state.map.record_mut(slot) {
                let clock = rec.clock();
                rec.set_clock(clock + 1);
            }
        } else {
            state.clock += settings.clock_increment;
            let clock = state.clock;
            if let Some(rec) = state.map.record_mut(slot) {
                rec.set_clock(clock);
            }
        }
    }

    /// Route a written entry into the matching modified-set and wake
    /// waiters. `changed` reports whether the write altered the stored
    /// value; it is false for equal-value rewrites, external accepts, and
    /// explicit marks, where dissemination is opt-in via
    /// `always_disseminate`.
    fn mark_and_signal(
        &self,
        state: &mut ContextState,
        slot: SlotId,
        changed: bool,
        settings: KnowledgeUpdateSettings,
    ) {
        let name = match state.map.name_of(slot) {
            Some(name) => Arc::clone(name),
            None => return,
        };
        let local = match settings.treat_as_local_override {
            LocalityOverride::AlwaysLocal => true,
            LocalityOverride::AlwaysGlobal => false,
            LocalityOverride::NoOverride => name.starts_with('.'),
        };
        if local {
            if settings.track_local_changes {
                state.local_modified.insert(name.to_string(), slot);
            }
        } else if changed || settings.always_disseminate {
            state.global_modified.insert(name.to_string(), slot);
        }
        if settings.signal_changes {
            state.change_generation += 1;
            self.changed.notify_all();
        }
    }

    /// The full write protocol for a resolved entry. A write that leaves
    /// the stored value equal is stamped and signalled like any other, but
    /// enters the global modified-set only under `always_disseminate`.
    fn write_value(
        &self,
        state: &mut ContextState,
        slot: SlotId,
        value: KnowledgeValue,
        settings: KnowledgeUpdateSettings,
    ) {
        let changed = match state.map.record_mut(slot) {
            Some(rec) => {
                let changed = *rec.value() != value;
                rec.set_value(value);
                changed
            }
            None => return,
        };
        Self::stamp(state, slot, settings);
        self.mark_and_signal(state, slot, changed, settings);
    }

    /// The external-update merge rule: does `(clock, quality)` admit a write
    /// over `local`?
    fn admits(local: &KnowledgeRecord, clock: u64, quality: u32) -> bool {
        if local.status() == RecordStatus::Uncreated {
            return true;
        }
        if clock > local.clock() {
            return true;
        }
        if clock < local.clock() {
            return false;
        }
        quality >= local.quality()
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// The record stored under `name` — a copy, payload sharing preserved.
    /// Unknown names yield an uninitialized record.
    pub fn get(&self, name: &str, settings: KnowledgeReferenceSettings) -> KnowledgeRecord {
        let state = self.state.lock();
        let name = Self::expanded(&state, name, settings);
        state.map.get(&name).cloned().unwrap_or_default()
    }

    /// O(1) read through a stable reference. A stale reference reads as an
    /// uncreated entry.
    pub fn get_by_ref(&self, vref: &VariableReference) -> KnowledgeRecord {
        let state = self.state.lock();
        Self::live_slot(&state, vref)
            .and_then(|slot| state.map.record(slot))
            .cloned()
            .unwrap_or_default()
    }

    /// A stable reference for `name`, inserting an uncreated placeholder if
    /// absent so that future operations are O(1).
    pub fn get_ref(
        &self,
        name: &str,
        settings: KnowledgeReferenceSettings,
    ) -> Result<VariableReference> {
        let mut state = self.state.lock();
        let name = Self::expanded(&state, name, settings).into_owned();
        if name.is_empty() {
            return Err(SwarmKbError::EmptyVariableName);
        }
        Ok(state.map.get_ref(&name))
    }

    /// True iff the variable has been written (status ≠ uncreated).
    pub fn exists(&self, name: &str, settings: KnowledgeReferenceSettings) -> bool {
        let state = self.state.lock();
        let name = Self::expanded(&state, name, settings);
        state.map.get(&name).map(|rec| rec.exists()).unwrap_or(false)
    }

    pub fn exists_ref(&self, vref: &VariableReference) -> bool {
        let state = self.state.lock();
        Self::live_slot(&state, vref)
            .and_then(|slot| state.map.record(slot))
            .map(|rec| rec.exists())
            .unwrap_or(false)
    }

    /// Array element read; out of range or non-array yields uninitialized.
    pub fn retrieve_index(
        &self,
        name: &str,
        index: usize,
        settings: KnowledgeReferenceSettings,
    ) -> KnowledgeRecord {
        let state = self.state.lock();
        let name = Self::expanded(&state, name, settings);
        state
            .map
            .get(&name)
            .map(|rec| rec.retrieve_index(index))
            .unwrap_or_default()
    }

    pub fn retrieve_index_ref(&self, vref: &VariableReference, index: usize) -> KnowledgeRecord {
        let state = self.state.lock();
        Self::live_slot(&state, vref)
            .and_then(|slot| state.map.record(slot))
            .map(|rec| rec.retrieve_index(index))
            .unwrap_or_default()
    }

    /// Number of entries, including uncreated placeholders.
    pub fn size(&self) -> usize {
        self.state.lock().map.len()
    }

    /// Snapshot of every variable name, in order.
    pub fn keys(&self) -> Vec<String> {
        let state = self.state.lock();
        state.map.iter().map(|(name, _)| name.to_string()).collect()
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Set a variable to any supported value kind.
    pub fn set(
        &self,
        name: &str,
        value: impl Into<KnowledgeValue>,
        settings: KnowledgeUpdateSettings,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let slot = Self::resolve_or_create(&mut state, name)?;
        self.write_value(&mut state, slot, value.into(), settings);
        Ok(())
    }

    /// Set through a stable reference.
    pub fn set_ref(
        &self,
        vref: &VariableReference,
        value: impl Into<KnowledgeValue>,
        settings: KnowledgeUpdateSettings,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let slot = Self::live_slot(&state, vref)
            .ok_or_else(|| SwarmKbError::StaleReference(vref.name().to_string()))?;
        self.write_value(&mut state, slot, value.into(), settings);
        Ok(())
    }

    /// Set a variable to a text payload.
    pub fn set_text(
        &self,
        name: &str,
        value: impl Into<String>,
        settings: KnowledgeUpdateSettings,
    ) -> Result<()> {
        self.set(name, KnowledgeValue::Text(Arc::new(value.into())), settings)
    }

    /// Set a variable to an XML payload.
    pub fn set_xml(
        &self,
        name: &str,
        value: impl Into<String>,
        settings: KnowledgeUpdateSettings,
    ) -> Result<()> {
        self.set(name, KnowledgeValue::Xml(Arc::new(value.into())), settings)
    }

    /// Set a variable to a JPEG payload.
    pub fn set_jpeg(
        &self,
        name: &str,
        value: Vec<u8>,
        settings: KnowledgeUpdateSettings,
    ) -> Result<()> {
        self.set(name, KnowledgeValue::Jpeg(Arc::new(value)), settings)
    }

    /// Set a variable to an opaque binary payload.
    pub fn set_file(
        &self,
        name: &str,
        value: Vec<u8>,
        settings: KnowledgeUpdateSettings,
    ) -> Result<()> {
        self.set(name, KnowledgeValue::UnknownFile(Arc::new(value)), settings)
    }

    /// Set a variable from a full record. Only the payload is copied — the
    /// record's own clock and quality are not; stamping follows the
    /// settings like any other setter.
    pub fn set_record(
        &self,
        name: &str,
        record: &KnowledgeRecord,
        settings: KnowledgeUpdateSettings,
    ) -> Result<()> {
        self.set(name, record.value().clone(), settings)
    }

    /// Install a shared string payload without copying the caller's buffer.
    pub fn set_shared_string(
        &self,
        name: &str,
        value: Arc<String>,
        settings: KnowledgeUpdateSettings,
    ) -> Result<()> {
        self.set(name, KnowledgeValue::String(value), settings)
    }

    /// Install a shared integer array payload.
    pub fn set_shared_integers(
        &self,
        name: &str,
        value: Arc<Vec<Integer>>,
        settings: KnowledgeUpdateSettings,
    ) -> Result<()> {
        self.set(name, KnowledgeValue::IntegerArray(value), settings)
    }

    /// Install a shared double array payload.
    pub fn set_shared_doubles(
        &self,
        name: &str,
        value: Arc<Vec<f64>>,
        settings: KnowledgeUpdateSettings,
    ) -> Result<()> {
        self.set(name, KnowledgeValue::DoubleArray(value), settings)
    }

    /// Borrow a variable's shared string payload.
    pub fn share_string(&self, name: &str) -> Option<Arc<String>> {
        let state = self.state.lock();
        state.map.get(name).and_then(|rec| rec.share_string())
    }

    /// Borrow a variable's shared integer array payload.
    pub fn share_integers(&self, name: &str) -> Option<Arc<Vec<Integer>>> {
        let state = self.state.lock();
        state.map.get(name).and_then(|rec| rec.share_integers())
    }

    /// Borrow a variable's shared double array payload.
    pub fn share_doubles(&self, name: &str) -> Option<Arc<Vec<f64>>> {
        let state = self.state.lock();
        state.map.get(name).and_then(|rec| rec.share_doubles())
    }

    /// Transfer a variable's string payload out, leaving it uninitialized.
    pub fn take_string(&self, name: &str) -> Option<Arc<String>> {
        let mut state = self.state.lock();
        state.map.get_mut(name).and_then(|rec| rec.take_string())
    }

    /// Transfer a variable's integer array payload out.
    pub fn take_integers(&self, name: &str) -> Option<Arc<Vec<Integer>>> {
        let mut state = self.state.lock();
        state.map.get_mut(name).and_then(|rec| rec.take_integers())
    }

    // =========================================================================
    // Conditional and indexed writes
    // =========================================================================

    /// Write only when the value differs from the stored one, or the
    /// caller's `(quality, clock)` would be admitted by the merge rule.
    pub fn set_if_unequal(
        &self,
        name: &str,
        value: impl Into<KnowledgeValue>,
        quality: u32,
        clock: u64,
        settings: KnowledgeUpdateSettings,
    ) -> Result<UpdateOutcome> {
        let value = value.into();
        let mut state = self.state.lock();
        let slot = Self::resolve_or_create(&mut state, name)?;

        let (differs, admitted) = {
            let rec = state.map.record(slot).expect("slot just resolved");
            (*rec.value() != value, Self::admits(rec, clock, quality))
        };
        if !differs && !admitted {
            return Ok(UpdateOutcome::Unchanged);
        }

        if let Some(rec) = state.map.record_mut(slot) {
            rec.set_value(value);
            rec.set_quality(quality);
            rec.set_clock(clock);
        }
        self.mark_and_signal(&mut state, slot, differs, settings);
        Ok(UpdateOutcome::Changed)
    }

    /// Set an integer array element. Copy-on-write on shared payloads,
    /// scalar promotion, zero-fill growth; stamping and tracking as for any
    /// setter.
    pub fn set_index_integer(
        &self,
        name: &str,
        index: usize,
        value: Integer,
        settings: KnowledgeUpdateSettings,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let slot = Self::resolve_or_create(&mut state, name)?;
        let changed = match state.map.record_mut(slot) {
            Some(rec) => {
                let changed = match rec.value() {
                    KnowledgeValue::IntegerArray(a) => a.get(index) != Some(&value),
                    KnowledgeValue::DoubleArray(a) => a.get(index) != Some(&(value as f64)),
                    _ => true,
                };
                rec.set_index_integer(index, value);
                changed
            }
            None => return Ok(()),
        };
        Self::stamp(&mut state, slot, settings);
        self.mark_and_signal(&mut state, slot, changed, settings);
        Ok(())
    }

    /// Set a double array element.
    pub fn set_index_double(
        &self,
        name: &str,
        index: usize,
        value: f64,
        settings: KnowledgeUpdateSettings,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let slot = Self::resolve_or_create(&mut state, name)?;
        let changed = match state.map.record_mut(slot) {
            Some(rec) => {
                let changed = match rec.value() {
                    KnowledgeValue::DoubleArray(a) => a.get(index) != Some(&value),
                    _ => true,
                };
                rec.set_index_double(index, value);
                changed
            }
            None => return Ok(()),
        };
        Self::stamp(&mut state, slot, settings);
        self.mark_and_signal(&mut state, slot, changed, settings);
        Ok(())
    }

    /// Set an integer array element through a stable reference.
    pub fn set_index_integer_ref(
        &self,
        vref: &VariableReference,
        index: usize,
        value: Integer,
        settings: KnowledgeUpdateSettings,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let slot = Self::live_slot(&state, vref)
            .ok_or_else(|| SwarmKbError::StaleReference(vref.name().to_string()))?;
        let changed = match state.map.record_mut(slot) {
            Some(rec) => {
                let changed = match rec.value() {
                    KnowledgeValue::IntegerArray(a) => a.get(index) != Some(&value),
                    KnowledgeValue::DoubleArray(a) => a.get(index) != Some(&(value as f64)),
                    _ => true,
                };
                rec.set_index_integer(index, value);
                changed
            }
            None => return Ok(()),
        };
        Self::stamp(&mut state, slot, settings);
        self.mark_and_signal(&mut state, slot, changed, settings);
        Ok(())
    }

    /// Atomically increment a variable, returning the new record. A
    /// non-numeric variable becomes integer 1.
    pub fn inc(&self, name: &str, settings: KnowledgeUpdateSettings) -> Result<KnowledgeRecord> {
        let mut state = self.state.lock();
        let slot = Self::resolve_or_create(&mut state, name)?;
        let new_value = match state.map.record(slot).map(|rec| rec.value()) {
            Some(KnowledgeValue::Integer(v)) => KnowledgeValue::Integer(v + 1),
            Some(KnowledgeValue::Double(v)) => KnowledgeValue::Double(v + 1.0),
            _ => KnowledgeValue::Integer(1),
        };
        self.write_value(&mut state, slot, new_value, settings);
        Ok(state.map.record(slot).cloned().unwrap_or_default())
    }

    /// Atomically decrement a variable, returning the new record. A
    /// non-numeric variable becomes integer -1.
    pub fn dec(&self, name: &str, settings: KnowledgeUpdateSettings) -> Result<KnowledgeRecord> {
        let mut state = self.state.lock();
        let slot = Self::resolve_or_create(&mut state, name)?;
        let new_value = match state.map.record(slot).map(|rec| rec.value()) {
            Some(KnowledgeValue::Integer(v)) => KnowledgeValue::Integer(v - 1),
            Some(KnowledgeValue::Double(v)) => KnowledgeValue::Double(v - 1.0),
            _ => KnowledgeValue::Integer(-1),
        };
        self.write_value(&mut state, slot, new_value, settings);
        Ok(state.map.record(slot).cloned().unwrap_or_default())
    }

    /// Remove a variable from the store and both modified-sets. Outstanding
    /// references to it become invalid. Returns whether it existed.
    pub fn delete_variable(&self, name: &str, settings: KnowledgeReferenceSettings) -> bool {
        let mut state = self.state.lock();
        let name = Self::expanded(&state, name, settings).into_owned();
        let removed = state.map.remove(&name).is_some();
        if removed {
            state.global_modified.remove(&name);
            state.local_modified.remove(&name);
            tracing::trace!(variable = %name, "deleted variable");
        }
        removed
    }

    /// Clear the context. With `erase`, keys are removed entirely and every
    /// reference is invalidated; otherwise values reset to uninitialized in
    /// place and references survive. Both flavours clear the modified-sets
    /// and wake waiters.
    pub fn clear(&self, erase: bool) {
        let mut state = self.state.lock();
        if erase {
            state.map.clear();
        } else {
            state.map.reset_values();
        }
        state.global_modified.clear();
        state.local_modified.clear();
        state.change_generation += 1;
        tracing::debug!(erase, "cleared context");
        self.changed.notify_all();
    }

    // =========================================================================
    // Quality
    // =========================================================================

    /// The quality stamped on a variable; 0 when unknown.
    pub fn get_quality(&self, name: &str, settings: KnowledgeReferenceSettings) -> u32 {
        let state = self.state.lock();
        let name = Self::expanded(&state, name, settings);
        state.map.get(&name).map(|rec| rec.quality()).unwrap_or(0)
    }

    /// The write quality this process holds for a variable; 0 when unknown.
    pub fn get_write_quality(&self, name: &str, settings: KnowledgeReferenceSettings) -> u32 {
        let state = self.state.lock();
        let name = Self::expanded(&state, name, settings);
        state.map.get(&name).map(|rec| rec.write_quality()).unwrap_or(0)
    }

    /// Set a variable's quality. Without `force_update`, only upgrades are
    /// applied. Returns the resulting quality.
    pub fn set_quality(&self, name: &str, quality: u32, force_update: bool) -> Result<u32> {
        let mut state = self.state.lock();
        let slot = Self::resolve_or_create(&mut state, name)?;
        let rec = state.map.record_mut(slot).expect("slot just resolved");
        if force_update || quality > rec.quality() {
            rec.set_quality(quality);
        }
        Ok(rec.quality())
    }

    /// Set the write quality this process holds for a variable.
    pub fn set_write_quality(&self, name: &str, quality: u32) -> Result<()> {
        let mut state = self.state.lock();
        let slot = Self::resolve_or_create(&mut state, name)?;
        if let Some(rec) = state.map.record_mut(slot) {
            rec.set_write_quality(quality);
        }
        Ok(())
    }

    // =========================================================================
    // Lamport clock
    // =========================================================================

    /// The current context clock.
    pub fn get_clock(&self) -> u64 {
        self.state.lock().clock
    }

    /// Advance the context clock and return the new value. The settings'
    /// `clock_increment` scales the step; zero still advances by one.
    pub fn inc_clock(&self, settings: KnowledgeUpdateSettings) -> u64 {
        let mut state = self.state.lock();
        state.clock += settings.clock_increment.max(1);
        state.clock
    }

    /// Move the context clock forward to `clock`; the clock never goes
    /// backwards. Returns the resulting clock.
    pub fn set_clock(&self, clock: u64) -> u64 {
        let mut state = self.state.lock();
        state.clock = state.clock.max(clock);
        state.clock
    }

    /// A variable's own clock; 0 when unknown.
    pub fn get_record_clock(&self, name: &str) -> u64 {
        let state = self.state.lock();
        state.map.get(name).map(|rec| rec.clock()).unwrap_or(0)
    }

    /// Advance a variable's own clock, returning the new value.
    pub fn inc_record_clock(&self, name: &str, settings: KnowledgeUpdateSettings) -> Result<u64> {
        let mut state = self.state.lock();
        let slot = Self::resolve_or_create(&mut state, name)?;
        let rec = state.map.record_mut(slot).expect("slot just resolved");
        rec.set_clock(rec.clock() + settings.clock_increment.max(1));
        Ok(rec.clock())
    }

    /// Set a variable's own clock.
    pub fn set_record_clock(&self, name: &str, clock: u64) -> Result<u64> {
        let mut state = self.state.lock();
        let slot = Self::resolve_or_create(&mut state, name)?;
        let rec = state.map.record_mut(slot).expect("slot just resolved");
        rec.set_clock(clock);
        Ok(rec.clock())
    }

    // =========================================================================
    // Modification tracking
    // =========================================================================

    /// Read-only snapshot of the global modified-set, for transports
    /// building a dissemination batch.
    pub fn get_modifieds(&self) -> BTreeMap<String, KnowledgeRecord> {
        let state = self.state.lock();
        state
            .global_modified
            .iter()
            .filter_map(|(name, slot)| {
                state.map.record(*slot).map(|rec| (name.clone(), rec.clone()))
            })
            .collect()
    }

    /// Read-only snapshot of the local modified-set, for checkpointing.
    pub fn get_local_modifieds(&self) -> BTreeMap<String, KnowledgeRecord> {
        let state = self.state.lock();
        state
            .local_modified
            .iter()
            .filter_map(|(name, slot)| {
                state.map.record(*slot).map(|rec| (name.clone(), rec.clone()))
            })
            .collect()
    }

    /// Deterministic dump of the global modified-set, one line per entry.
    pub fn debug_modifieds(&self) -> String {
        let state = self.state.lock();
        let mut out = String::new();
        for (name, slot) in &state.global_modified {
            if let Some(rec) = state.map.record(*slot) {
                out.push_str(&format!(
                    "{} [clock={} quality={}] = {}\n",
                    name,
                    rec.clock(),
                    rec.quality(),
                    rec.to_karl_literal()
                ));
            }
        }
        out
    }

    /// Clear the global modified-set. The store is unchanged. Used by
    /// transports after a successful send.
    pub fn reset_modified(&self) {
        let mut state = self.state.lock();
        state.global_modified.clear();
    }

    /// Clear a single entry from the global modified-set.
    pub fn reset_modified_name(&self, name: &str) {
        let mut state = self.state.lock();
        state.global_modified.remove(name);
    }

    /// Re-insert every existing record into its modified-set, stamping each
    /// with the current context clock — forces a full-state dissemination
    /// on the next transport drain.
    pub fn apply_modified(&self) {
        let mut state = self.state.lock();
        let clock = state.clock;
        let entries: Vec<(String, SlotId)> = state
            .map
            .iter_slots()
            .filter(|(_, _, rec)| rec.exists())
            .map(|(name, slot, _)| (name.to_string(), slot))
            .collect();
        for (name, slot) in entries {
            if let Some(rec) = state.map.record_mut(slot) {
                rec.set_status(RecordStatus::Modified);
                rec.set_clock(clock);
            }
            if name.starts_with('.') {
                state.local_modified.insert(name, slot);
            } else {
                state.global_modified.insert(name, slot);
            }
        }
        state.change_generation += 1;
        tracing::debug!(count = state.global_modified.len(), "applied modified to all records");
        self.changed.notify_all();
    }

    /// Explicitly insert a referenced entry into its modified-set without
    /// writing the payload.
    pub fn mark_modified(&self, vref: &VariableReference) {
        let mut state = self.state.lock();
        if let Some(slot) = Self::live_slot(&state, vref) {
            if let Some(rec) = state.map.record_mut(slot) {
                rec.set_status(RecordStatus::Modified);
            }
            self.mark_and_signal(
                &mut state,
                slot,
                false,
                KnowledgeUpdateSettings::always_disseminate(),
            );
        }
    }

    /// Explicitly insert a named entry into its modified-set without
    /// writing the payload. Creates the entry if absent.
    pub fn mark_modified_name(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        let slot = Self::resolve_or_create(&mut state, name)?;
        if let Some(rec) = state.map.record_mut(slot) {
            rec.set_status(RecordStatus::Modified);
        }
        self.mark_and_signal(
            &mut state,
            slot,
            false,
            KnowledgeUpdateSettings::always_disseminate(),
        );
        Ok(())
    }

    /// Force a named entry into the local modified-set regardless of its
    /// name prefix.
    pub fn mark_local_modified(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        let slot = Self::resolve_or_create(&mut state, name)?;
        if let Some(rec) = state.map.record_mut(slot) {
            rec.set_status(RecordStatus::Modified);
        }
        let settings = KnowledgeUpdateSettings {
            treat_as_local_override: LocalityOverride::AlwaysLocal,
            ..Default::default()
        };
        self.mark_and_signal(&mut state, slot, false, settings);
        Ok(())
    }

    // =========================================================================
    // External-update merge
    // =========================================================================

    /// Apply an inbound record under the deterministic merge rule. On
    /// accept, payload, type, clock, and quality are copied from the
    /// incoming record and the context clock is pushed to at least the
    /// incoming clock; the entry enters the global modified-set only when
    /// the settings ask for re-dissemination.
    pub fn update_record_from_external(
        &self,
        name: &str,
        incoming: &KnowledgeRecord,
        settings: KnowledgeUpdateSettings,
    ) -> Result<MergeOutcome> {
        let mut state = self.state.lock();
        self.merge_external_inner(&mut state, name, incoming, settings)
    }

    pub(crate) fn merge_external_inner(
        &self,
        state: &mut ContextState,
        name: &str,
        incoming: &KnowledgeRecord,
        settings: KnowledgeUpdateSettings,
    ) -> Result<MergeOutcome> {
        let slot = Self::resolve_or_create(state, name)?;
        let accepted = {
            let local = state.map.record(slot).expect("slot just resolved");
            Self::admits(local, incoming.clock(), incoming.quality())
        };
        if !accepted {
            tracing::trace!(
                variable = name,
                incoming_clock = incoming.clock(),
                incoming_quality = incoming.quality(),
                "rejected external update"
            );
            return Ok(MergeOutcome::Rejected);
        }

        if let Some(rec) = state.map.record_mut(slot) {
            rec.set_value(incoming.value().clone());
            rec.set_clock(incoming.clock());
            rec.set_quality(incoming.quality());
        }
        state.clock = state.clock.max(incoming.clock());
        self.mark_and_signal(state, slot, false, settings);
        Ok(MergeOutcome::Accepted)
    }

    // =========================================================================
    // Wait / signal
    // =========================================================================

    /// Block until any record changes or [`Self::set_changed`] runs.
    /// Signals coalesce: any number of modifications between two waits wake
    /// a waiter once. Spurious wakes are absorbed internally; callers still
    /// re-check their own predicate, since the change that woke them may
    /// not be the one they care about.
    pub fn wait_for_change(&self) {
        let mut state = self.state.lock();
        let seen = state.change_generation;
        while state.change_generation == seen {
            self.changed.wait(&mut state);
        }
    }

    /// Register a change with no associated write, waking every waiter.
    /// This is the cooperative cancellation hook: a deadline thread calls it
    /// to release `wait_for_change` callers.
    pub fn set_changed(&self) {
        let mut state = self.state.lock();
        state.change_generation += 1;
        drop(state);
        self.changed.notify_all();
    }

    // =========================================================================
    // Scans
    // =========================================================================

    /// Collect `subject0 ..= subjectN` style records for `i ∈ [start, end]`,
    /// appending each existing `subject + i` entry in index order.
    pub fn to_vector(&self, subject: &str, start: u32, end: u32) -> Vec<KnowledgeRecord> {
        let state = self.state.lock();
        let mut out = Vec::new();
        for i in start..=end {
            let name = format!("{}{}", subject, i);
            if let Some(rec) = state.map.get(&name) {
                if rec.exists() {
                    out.push(rec.clone());
                }
            }
        }
        out
    }

    /// Range scan for a `prefix*` pattern (the `*` suffix is optional);
    /// returns every existing entry whose name starts with the prefix.
    pub fn to_map_prefix(&self, pattern: &str) -> BTreeMap<String, KnowledgeRecord> {
        let prefix = pattern.strip_suffix('*').unwrap_or(pattern);
        let state = self.state.lock();
        state
            .map
            .range_prefix(prefix)
            .filter(|(_, rec)| rec.exists())
            .map(|(name, rec)| (name.to_string(), rec.clone()))
            .collect()
    }

    /// Hierarchical scan: entries matching `prefix` (and `suffix`, when
    /// non-empty), plus the distinct first `delimiter`-separated segments
    /// appearing strictly after the prefix. With `just_keys`, only the
    /// segments are collected.
    pub fn to_map(
        &self,
        prefix: &str,
        delimiter: &str,
        suffix: &str,
        just_keys: bool,
    ) -> ToMapResult {
        let state = self.state.lock();
        let mut next_keys = BTreeSet::new();
        let mut records = BTreeMap::new();

        for (name, rec) in state.map.range_prefix(prefix) {
            if !rec.exists() {
                continue;
            }
            if !suffix.is_empty() && !name.ends_with(suffix) {
                continue;
            }
            if !delimiter.is_empty() {
                let remainder = &name[prefix.len()..];
                let remainder = remainder.strip_prefix(delimiter).unwrap_or(remainder);
                if !remainder.is_empty() {
                    let segment = match remainder.find(delimiter) {
                        Some(pos) => &remainder[..pos],
                        None => remainder,
                    };
                    next_keys.insert(segment.to_string());
                }
            }
            if !just_keys {
                records.insert(name.to_string(), rec.clone());
            }
        }

        ToMapResult { next_keys: next_keys.into_iter().collect(), records }
    }

    // =========================================================================
    // String expansion
    // =========================================================================

    /// Substitute `{EXPR}` pairs recursively: the innermost pair is resolved
    /// by name lookup and its textual value substituted. Braces nest
    /// arbitrarily; unmatched braces are preserved literally.
    pub fn expand_statement(&self, statement: &str) -> String {
        let state = self.state.lock();
        Self::expand_inner(&state, statement)
    }

    fn expand_inner(state: &ContextState, statement: &str) -> String {
        // One builder per open brace; closing a pair resolves the innermost
        // builder as a variable name against the (already expanded) text.
        let mut builders: Vec<String> = vec![String::new()];
        for c in statement.chars() {
            match c {
                '{' => builders.push(String::new()),
                '}' => {
                    if builders.len() > 1 {
                        let name = builders.pop().expect("builder stack underflow");
                        let value = state
                            .map
                            .get(&name)
                            .map(|rec| rec.to_string())
                            .unwrap_or_default();
                        builders.last_mut().expect("root builder").push_str(&value);
                    } else {
                        builders.last_mut().expect("root builder").push('}');
                    }
                }
                c => builders.last_mut().expect("root builder").push(c),
            }
        }
        // Unmatched opening braces stay literal.
        let mut parts = builders.into_iter();
        let mut out = parts.next().expect("root builder");
        for part in parts {
            out.push('{');
            out.push_str(&part);
        }
        out
    }

    // =========================================================================
    // Copying and dumping
    // =========================================================================

    /// Deep-copy variables from another context. An empty `copy_set` copies
    /// everything; `clean_copy` erases this context first. Copies are deep
    /// so the two contexts never share payload buffers across their own
    /// locks.
    pub fn copy_from(&self, source: &KnowledgeContext, copy_set: &[String], clean_copy: bool) {
        let snapshot: Vec<(String, KnowledgeRecord)> = {
            let src = source.state.lock();
            if copy_set.is_empty() {
                src.map
                    .iter()
                    .filter(|(_, rec)| rec.exists())
                    .map(|(name, rec)| (name.to_string(), rec.deep_copy()))
                    .collect()
            } else {
                copy_set
                    .iter()
                    .filter_map(|name| {
                        src.map
                            .get(name)
                            .filter(|rec| rec.exists())
                            .map(|rec| (name.clone(), rec.deep_copy()))
                    })
                    .collect()
            }
        };

        let mut state = self.state.lock();
        if clean_copy {
            state.map.clear();
            state.global_modified.clear();
            state.local_modified.clear();
        }
        for (name, rec) in snapshot {
            let slot = state.map.get_or_create(&name);
            if let Some(dest) = state.map.record_mut(slot) {
                *dest = rec;
            }
        }
        state.change_generation += 1;
        self.changed.notify_all();
    }

    /// Dump every existing entry with configurable delimiters, in index
    /// order. Strings are single-quoted; arrays bracketed with
    /// `array_delimiter` between elements. Binary payloads dump as their
    /// byte size — this format does not carry binary data.
    pub fn to_string_dump(
        &self,
        array_delimiter: &str,
        record_delimiter: &str,
        key_val_delimiter: &str,
    ) -> String {
        let state = self.state.lock();
        let mut out = String::new();
        for (name, rec) in state.map.iter() {
            if !rec.exists() {
                continue;
            }
            out.push_str(name);
            out.push_str(key_val_delimiter);
            match rec.record_type() {
                RecordType::IntegerArray => {
                    let items: Vec<String> =
                        rec.to_integers().iter().map(|v| v.to_string()).collect();
                    out.push('[');
                    out.push_str(&items.join(array_delimiter));
                    out.push(']');
                }
                RecordType::DoubleArray => {
                    let items: Vec<String> =
                        rec.to_doubles().iter().map(|v| v.to_string()).collect();
                    out.push('[');
                    out.push_str(&items.join(array_delimiter));
                    out.push(']');
                }
                ty if ty.is_string() => {
                    out.push('\'');
                    out.push_str(&rec.to_string());
                    out.push('\'');
                }
                ty if ty.is_binary_file() => {
                    out.push_str(&rec.size().to_string());
                }
                _ => out.push_str(&rec.to_string()),
            }
            out.push_str(record_delimiter);
        }
        out
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc as StdArc;
    use std::thread;
    use std::time::Duration;

    fn upd() -> KnowledgeUpdateSettings {
        KnowledgeUpdateSettings::default()
    }

    fn refs() -> KnowledgeReferenceSettings {
        KnowledgeReferenceSettings::default()
    }

    #[test]
    fn test_set_get_round_trip() {
        let ctx = KnowledgeContext::new();
        ctx.set("answer", 42i64, upd()).unwrap();
        assert_eq!(ctx.get("answer", refs()).to_integer(), 42);
        assert!(ctx.exists("answer", refs()));
        assert!(!ctx.exists("unset", refs()));
    }

    #[test]
    fn test_empty_name_rejected() {
        let ctx = KnowledgeContext::new();
        assert!(matches!(
            ctx.set("", 1i64, upd()),
            Err(SwarmKbError::EmptyVariableName)
        ));
        assert!(ctx.get_ref("", refs()).is_err());
    }

    #[test]
    fn test_reference_short_circuits_lookup() {
        let ctx = KnowledgeContext::new();
        let vref = ctx.get_ref("agent.0.pos", refs()).unwrap();
        assert!(!ctx.exists_ref(&vref));

        ctx.set_ref(&vref, 7i64, upd()).unwrap();
        assert_eq!(ctx.get_by_ref(&vref).to_integer(), 7);
        assert_eq!(ctx.get("agent.0.pos", refs()).to_integer(), 7);
    }

    #[test]
    fn test_deleted_reference_reads_as_uncreated() {
        let ctx = KnowledgeContext::new();
        let vref = ctx.get_ref("doomed", refs()).unwrap();
        ctx.set_ref(&vref, 1i64, upd()).unwrap();

        assert!(ctx.delete_variable("doomed", refs()));
        assert!(!ctx.exists_ref(&vref));
        assert!(!ctx.get_by_ref(&vref).exists());
        assert!(matches!(
            ctx.set_ref(&vref, 2i64, upd()),
            Err(SwarmKbError::StaleReference(_))
        ));
        assert!(!ctx.delete_variable("doomed", refs()));
    }

    #[test]
    fn test_global_and_local_modified_routing() {
        let ctx = KnowledgeContext::new();
        ctx.set("global.x", 1i64, upd()).unwrap();
        ctx.set(".local.x", 2i64, upd()).unwrap();

        let globals = ctx.get_modifieds();
        assert!(globals.contains_key("global.x"));
        assert!(!globals.contains_key(".local.x"));

        let locals = ctx.get_local_modifieds();
        assert!(locals.contains_key(".local.x"));
        assert_eq!(locals.len(), 1);
    }

    #[test]
    fn test_locality_override() {
        let ctx = KnowledgeContext::new();
        let as_local = KnowledgeUpdateSettings {
            treat_as_local_override: LocalityOverride::AlwaysLocal,
            ..Default::default()
        };
        let as_global = KnowledgeUpdateSettings {
            treat_as_local_override: LocalityOverride::AlwaysGlobal,
            ..Default::default()
        };
        ctx.set("looks_global", 1i64, as_local).unwrap();
        ctx.set(".looks_local", 2i64, as_global).unwrap();

        assert!(ctx.get_local_modifieds().contains_key("looks_global"));
        assert!(ctx.get_modifieds().contains_key(".looks_local"));
    }

    #[test]
    fn test_track_local_changes_off() {
        let ctx = KnowledgeContext::new();
        let settings = KnowledgeUpdateSettings { track_local_changes: false, ..Default::default() };
        ctx.set(".scratch", 1i64, settings).unwrap();
        assert!(ctx.get_local_modifieds().is_empty());
    }

    #[test]
    fn test_reset_modified_leaves_store_unchanged() {
        let ctx = KnowledgeContext::new();
        ctx.set("a", 1i64, upd()).unwrap();
        ctx.set("b", 2i64, upd()).unwrap();

        ctx.reset_modified();
        assert!(ctx.get_modifieds().is_empty());
        assert_eq!(ctx.get("a", refs()).to_integer(), 1);
        assert_eq!(ctx.get("b", refs()).to_integer(), 2);

        ctx.reset_modified_name("never_tracked");
        assert!(ctx.get_modifieds().is_empty());
    }

    #[test]
    fn test_unchanged_value_not_redisseminated() {
        let ctx = KnowledgeContext::new();
        ctx.set("x", 1i64, upd()).unwrap();
        ctx.reset_modified();

        // Rewriting the same value adds nothing to disseminate.
        ctx.set("x", 1i64, upd()).unwrap();
        assert!(ctx.get_modifieds().is_empty());

        // always_disseminate forces the entry in regardless.
        ctx.set("x", 1i64, KnowledgeUpdateSettings::always_disseminate()).unwrap();
        assert!(ctx.get_modifieds().contains_key("x"));

        // A genuine change tracks as usual.
        ctx.reset_modified();
        ctx.set("x", 2i64, upd()).unwrap();
        assert!(ctx.get_modifieds().contains_key("x"));
    }

    #[test]
    fn test_unchanged_index_write_not_redisseminated() {
        let ctx = KnowledgeContext::new();
        ctx.set("arr", vec![5i64, 6], upd()).unwrap();
        ctx.reset_modified();

        ctx.set_index_integer("arr", 1, 6, upd()).unwrap();
        assert!(ctx.get_modifieds().is_empty());

        ctx.set_index_integer("arr", 1, 7, upd()).unwrap();
        assert!(ctx.get_modifieds().contains_key("arr"));
    }

    #[test]
    fn test_latest_wins_one_entry_per_name() {
        let ctx = KnowledgeContext::new();
        for i in 0..10 {
            ctx.set("hot", i as Integer, upd()).unwrap();
        }
        let mods = ctx.get_modifieds();
        assert_eq!(mods.len(), 1);
        assert_eq!(mods["hot"].to_integer(), 9);
    }

    #[test]
    fn test_apply_modified_restamps_with_context_clock() {
        let ctx = KnowledgeContext::new();
        ctx.set("a", 1i64, upd()).unwrap();
        ctx.set("b", 2i64, upd()).unwrap();
        ctx.reset_modified();

        let clock = ctx.get_clock();
        ctx.apply_modified();
        let mods = ctx.get_modifieds();
        assert_eq!(mods.len(), 2);
        for rec in mods.values() {
            assert_eq!(rec.clock(), clock);
        }
    }

    #[test]
    fn test_mark_modified_without_payload_write() {
        let ctx = KnowledgeContext::new();
        ctx.set("x", 5i64, upd()).unwrap();
        ctx.reset_modified();

        let vref = ctx.get_ref("x", refs()).unwrap();
        ctx.mark_modified(&vref);
        let mods = ctx.get_modifieds();
        assert_eq!(mods["x"].to_integer(), 5);
    }

    #[test]
    fn test_clock_stamping() {
        let ctx = KnowledgeContext::new();
        ctx.set("a", 1i64, upd()).unwrap();
        assert_eq!(ctx.get_clock(), 1);
        assert_eq!(ctx.get_record_clock("a"), 1);

        let big_step = KnowledgeUpdateSettings { clock_increment: 10, ..Default::default() };
        ctx.set("b", 2i64, big_step).unwrap();
        assert_eq!(ctx.get_clock(), 11);
        assert_eq!(ctx.get_record_clock("b"), 11);

        // Zero increment advances only the record's own clock.
        let own = KnowledgeUpdateSettings { clock_increment: 0, ..Default::default() };
        ctx.set("a", 3i64, own).unwrap();
        assert_eq!(ctx.get_clock(), 11);
        assert_eq!(ctx.get_record_clock("a"), 2);
    }

    #[test]
    fn test_inc_clock_and_set_clock_forward_only() {
        let ctx = KnowledgeContext::new();
        assert_eq!(ctx.inc_clock(upd()), 1);
        assert_eq!(ctx.set_clock(100), 100);
        assert_eq!(ctx.set_clock(50), 100);
    }

    #[test]
    fn test_external_merge_rule() {
        let ctx = KnowledgeContext::new();

        // Seed local (clock=5, quality=2, value=10).
        let mut local = KnowledgeRecord::new(10i64);
        local.set_clock(5);
        local.set_quality(2);
        assert_eq!(
            ctx.update_record_from_external("x", &local, upd()).unwrap(),
            MergeOutcome::Accepted
        );

        // Same clock, higher quality: accept.
        let mut update = KnowledgeRecord::new(20i64);
        update.set_clock(5);
        update.set_quality(3);
        assert_eq!(
            ctx.update_record_from_external("x", &update, upd()).unwrap(),
            MergeOutcome::Accepted
        );
        assert_eq!(ctx.get("x", refs()).to_integer(), 20);
        assert_eq!(ctx.get_quality("x", refs()), 3);

        // Older clock, any quality: reject.
        let mut stale = KnowledgeRecord::new(30i64);
        stale.set_clock(4);
        stale.set_quality(9);
        assert_eq!(
            ctx.update_record_from_external("x", &stale, upd()).unwrap(),
            MergeOutcome::Rejected
        );
        assert_eq!(ctx.get("x", refs()).to_integer(), 20);

        // Same clock, lower quality: reject.
        let mut worse = KnowledgeRecord::new(40i64);
        worse.set_clock(5);
        worse.set_quality(2);
        assert_eq!(
            ctx.update_record_from_external("x", &worse, upd()).unwrap(),
            MergeOutcome::Rejected
        );

        // Newer clock always wins.
        let mut newer = KnowledgeRecord::new(50i64);
        newer.set_clock(6);
        newer.set_quality(0);
        assert_eq!(
            ctx.update_record_from_external("x", &newer, upd()).unwrap(),
            MergeOutcome::Accepted
        );
        assert_eq!(ctx.get("x", refs()).to_integer(), 50);
    }

    #[test]
    fn test_external_accept_advances_context_clock() {
        let ctx = KnowledgeContext::new();
        let mut incoming = KnowledgeRecord::new(1i64);
        incoming.set_clock(99);
        ctx.update_record_from_external("x", &incoming, upd()).unwrap();
        assert_eq!(ctx.get_clock(), 99);

        // Record clocks never decrease through the merge rule.
        assert_eq!(ctx.get_record_clock("x"), 99);
    }

    #[test]
    fn test_external_accept_not_rebroadcast_by_default() {
        let ctx = KnowledgeContext::new();
        let mut incoming = KnowledgeRecord::new(1i64);
        incoming.set_clock(1);
        ctx.update_record_from_external("x", &incoming, upd()).unwrap();
        assert!(ctx.get_modifieds().is_empty());

        let mut again = KnowledgeRecord::new(2i64);
        again.set_clock(2);
        ctx.update_record_from_external("x", &again, KnowledgeUpdateSettings::always_disseminate())
            .unwrap();
        assert!(ctx.get_modifieds().contains_key("x"));
    }

    #[test]
    fn test_set_if_unequal() {
        let ctx = KnowledgeContext::new();
        assert_eq!(
            ctx.set_if_unequal("x", 1i64, 1, 1, upd()).unwrap(),
            UpdateOutcome::Changed
        );
        // Same value, older clock: suppressed.
        assert_eq!(
            ctx.set_if_unequal("x", 1i64, 9, 0, upd()).unwrap(),
            UpdateOutcome::Unchanged
        );
        // Different value, newer clock: applied.
        assert_eq!(
            ctx.set_if_unequal("x", 2i64, 1, 2, upd()).unwrap(),
            UpdateOutcome::Changed
        );
        assert_eq!(ctx.get("x", refs()).to_integer(), 2);

        // Admitted but equal-valued: metadata is written, yet nothing new
        // enters the dissemination set.
        ctx.reset_modified();
        assert_eq!(
            ctx.set_if_unequal("x", 2i64, 5, 10, upd()).unwrap(),
            UpdateOutcome::Changed
        );
        assert_eq!(ctx.get_quality("x", refs()), 5);
        assert_eq!(ctx.get_record_clock("x"), 10);
        assert!(ctx.get_modifieds().is_empty());

        assert!(matches!(
            ctx.set_if_unequal("", 1i64, 1, 1, upd()),
            Err(SwarmKbError::EmptyVariableName)
        ));
    }

    #[test]
    fn test_set_index_and_retrieve_index() {
        let ctx = KnowledgeContext::new();
        ctx.set_index_integer("arr", 2, 9, upd()).unwrap();
        assert_eq!(ctx.get("arr", refs()).to_integers(), vec![0, 0, 9]);
        assert_eq!(ctx.retrieve_index("arr", 2, refs()).to_integer(), 9);
        assert!(!ctx.retrieve_index("arr", 10, refs()).exists());
    }

    #[test]
    fn test_shared_payload_copy_on_write_through_context() {
        let ctx = KnowledgeContext::new();

        let big = StdArc::new(String::from(
            "This is a string that might be much longer and be expensive to copy.",
        ));
        ctx.set_shared_string(".my_string", StdArc::clone(&big), upd()).unwrap();
        let out = ctx.share_string(".my_string").unwrap();
        assert!(StdArc::ptr_eq(&big, &out));

        let ints = StdArc::new(vec![42 as Integer; 4000]);
        ctx.set_shared_integers(".my_array", StdArc::clone(&ints), upd()).unwrap();
        let held = ctx.share_integers(".my_array").unwrap();
        assert!(StdArc::ptr_eq(&ints, &held));
        assert_eq!(ctx.get(".my_array", refs()).retrieve_index(0).to_integer(), 42);

        // Writing through the context copies; the held handle keeps the old
        // payload.
        ctx.set_index_integer(".my_array", 0, 47, upd()).unwrap();
        assert_eq!(ctx.get(".my_array", refs()).retrieve_index(0).to_integer(), 47);
        assert_eq!(held[0], 42);

        // take_ leaves the variable empty while handing the buffer out.
        let taken = ctx.take_string(".my_string").unwrap();
        assert!(StdArc::ptr_eq(&big, &taken));
        assert!(!ctx.exists(".my_string", refs()));
    }

    #[test]
    fn test_take_uncreates_variable() {
        let ctx = KnowledgeContext::new();
        let vref = ctx.get_ref("buffer", refs()).unwrap();
        ctx.set_ref(&vref, vec![1i64, 2, 3], upd()).unwrap();
        assert!(ctx.exists_ref(&vref));

        let taken = ctx.take_integers("buffer").unwrap();
        assert_eq!(taken.as_ref(), &vec![1, 2, 3]);

        // The variable reads as never written, by name and by reference.
        assert!(!ctx.exists("buffer", refs()));
        assert!(!ctx.exists_ref(&vref));
        assert!(!ctx.get("buffer", refs()).exists());
        assert!(ctx.take_integers("buffer").is_none());
    }

    #[test]
    fn test_inc_dec() {
        let ctx = KnowledgeContext::new();
        assert_eq!(ctx.inc("counter", upd()).unwrap().to_integer(), 1);
        assert_eq!(ctx.inc("counter", upd()).unwrap().to_integer(), 2);
        assert_eq!(ctx.dec("counter", upd()).unwrap().to_integer(), 1);

        ctx.set("text", "hello", upd()).unwrap();
        assert_eq!(ctx.inc("text", upd()).unwrap().to_integer(), 1);
        assert_eq!(ctx.dec("other", upd()).unwrap().to_integer(), -1);

        ctx.set("pi", 3.0f64, upd()).unwrap();
        assert_eq!(ctx.inc("pi", upd()).unwrap().to_double(), 4.0);
    }

    #[test]
    fn test_wait_for_change_wakes_on_set() {
        let ctx = StdArc::new(KnowledgeContext::new());
        let waiter = {
            let ctx = StdArc::clone(&ctx);
            thread::spawn(move || {
                ctx.wait_for_change();
                ctx.get("x", KnowledgeReferenceSettings::default()).to_integer()
            })
        };

        // Keep writing until the waiter observes a change; each write is a
        // fresh change generation, so the waiter cannot miss all of them.
        while !waiter.is_finished() {
            ctx.set("x", 1i64, upd()).unwrap();
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(waiter.join().unwrap(), 1);
    }

    #[test]
    fn test_set_changed_releases_waiter() {
        let ctx = StdArc::new(KnowledgeContext::new());
        let waiter = {
            let ctx = StdArc::clone(&ctx);
            thread::spawn(move || ctx.wait_for_change())
        };
        while !waiter.is_finished() {
            ctx.set_changed();
            thread::sleep(Duration::from_millis(5));
        }
        waiter.join().unwrap();
    }

    #[test]
    fn test_signal_suppression() {
        let ctx = StdArc::new(KnowledgeContext::new());
        let quiet = KnowledgeUpdateSettings { signal_changes: false, ..Default::default() };
        ctx.set("x", 1i64, quiet).unwrap();

        // The quiet write still tracked the modification but registered no
        // change: a waiter starting now blocks until a signalling write.
        assert!(ctx.get_modifieds().contains_key("x"));

        let waiter = {
            let ctx = StdArc::clone(&ctx);
            thread::spawn(move || ctx.wait_for_change())
        };
        while !waiter.is_finished() {
            ctx.set("x", 2i64, upd()).unwrap();
            thread::sleep(Duration::from_millis(5));
        }
        waiter.join().unwrap();
    }

    #[test]
    fn test_to_vector() {
        let ctx = KnowledgeContext::new();
        for i in 0..5 {
            ctx.set(&format!("sensor{}", i), i as Integer, upd()).unwrap();
        }
        let recs = ctx.to_vector("sensor", 1, 3);
        assert_eq!(recs.len(), 3);
        assert_eq!(recs[0].to_integer(), 1);
        assert_eq!(recs[2].to_integer(), 3);

        // Gaps are skipped.
        assert_eq!(ctx.to_vector("sensor", 3, 9).len(), 2);
    }

    #[test]
    fn test_to_map_prefix() {
        let ctx = KnowledgeContext::new();
        ctx.set("agent.0.pos", 1i64, upd()).unwrap();
        ctx.set("agent.1.pos", 2i64, upd()).unwrap();
        ctx.set("other", 3i64, upd()).unwrap();

        let map = ctx.to_map_prefix("agent.*");
        assert_eq!(map.len(), 2);
        assert!(map.contains_key("agent.0.pos"));
        assert!(map.contains_key("agent.1.pos"));
    }

    #[test]
    fn test_to_map_hierarchy() {
        let ctx = KnowledgeContext::new();
        ctx.set("swarm.0.pos", 1i64, upd()).unwrap();
        ctx.set("swarm.0.vel", 2i64, upd()).unwrap();
        ctx.set("swarm.1.pos", 3i64, upd()).unwrap();
        ctx.set("swarm.leader", 4i64, upd()).unwrap();
        ctx.set("unrelated", 5i64, upd()).unwrap();

        let result = ctx.to_map("swarm", ".", "", false);
        assert_eq!(result.next_keys, vec!["0", "1", "leader"]);
        assert_eq!(result.records.len(), 4);

        // Suffix filter.
        let result = ctx.to_map("swarm", ".", "pos", false);
        assert_eq!(result.records.len(), 2);
        assert_eq!(result.next_keys, vec!["0", "1"]);

        // just_keys leaves the records empty.
        let result = ctx.to_map("swarm", ".", "", true);
        assert!(result.records.is_empty());
        assert_eq!(result.next_keys.len(), 3);
    }

    #[test]
    fn test_expand_statement() {
        let ctx = KnowledgeContext::new();
        ctx.set(".id", 5i64, upd()).unwrap();
        ctx.set("MyVar5", 13i64, upd()).unwrap();

        assert_eq!(ctx.expand_statement("MyVar{.id}"), "MyVar5");
        // Nested: the inner pair resolves first.
        assert_eq!(ctx.expand_statement("{MyVar{.id}}"), "13");
        assert_eq!(ctx.expand_statement("{.id} * 30"), "5 * 30");
        // Unknown names expand to empty.
        assert_eq!(ctx.expand_statement("x{nope}y"), "xy");
        // Unmatched braces stay literal.
        assert_eq!(ctx.expand_statement("a } b"), "a } b");
        assert_eq!(ctx.expand_statement("a { b"), "a { b");
        assert_eq!(ctx.expand_statement("no braces"), "no braces");
    }

    #[test]
    fn test_expanded_names_in_get() {
        let ctx = KnowledgeContext::new();
        ctx.set(".id", 7i64, upd()).unwrap();
        ctx.set("agent7", 99i64, upd()).unwrap();

        assert_eq!(ctx.get("agent{.id}", refs()).to_integer(), 99);
        // Expansion off: the literal name does not exist.
        assert!(!ctx.exists("agent{.id}", KnowledgeReferenceSettings::no_expansion()));
    }

    #[test]
    fn test_quality_operations() {
        let ctx = KnowledgeContext::new();
        ctx.set("x", 1i64, upd()).unwrap();

        assert_eq!(ctx.set_quality("x", 5, false).unwrap(), 5);
        // Downgrades need force.
        assert_eq!(ctx.set_quality("x", 3, false).unwrap(), 5);
        assert_eq!(ctx.set_quality("x", 3, true).unwrap(), 3);
        assert_eq!(ctx.get_quality("x", refs()), 3);

        ctx.set_write_quality("x", 8).unwrap();
        assert_eq!(ctx.get_write_quality("x", refs()), 8);
    }

    #[test]
    fn test_clear_semantics() {
        let ctx = KnowledgeContext::new();
        let vref = ctx.get_ref("x", refs()).unwrap();
        ctx.set_ref(&vref, 1i64, upd()).unwrap();

        ctx.clear(false);
        assert!(!ctx.exists("x", refs()));
        assert_eq!(ctx.size(), 1);
        // References survive a value reset.
        ctx.set_ref(&vref, 2i64, upd()).unwrap();
        assert_eq!(ctx.get_by_ref(&vref).to_integer(), 2);

        ctx.clear(true);
        assert_eq!(ctx.size(), 0);
        assert!(ctx.set_ref(&vref, 3i64, upd()).is_err());
    }

    #[test]
    fn test_copy_from() {
        let src = KnowledgeContext::new();
        src.set("a", 1i64, upd()).unwrap();
        src.set("b", vec![1i64, 2, 3], upd()).unwrap();
        src.set("c", 3i64, upd()).unwrap();

        let dst = KnowledgeContext::new();
        dst.set("old", 9i64, upd()).unwrap();
        dst.copy_from(&src, &["a".to_string(), "b".to_string()], false);
        assert_eq!(dst.get("a", refs()).to_integer(), 1);
        assert_eq!(dst.get("b", refs()).to_integers(), vec![1, 2, 3]);
        assert!(!dst.exists("c", refs()));
        assert!(dst.exists("old", refs()));

        // Deep copy: mutating the source does not leak into the copy.
        src.set_index_integer("b", 0, 42, upd()).unwrap();
        assert_eq!(dst.get("b", refs()).to_integers(), vec![1, 2, 3]);

        dst.copy_from(&src, &[], true);
        assert!(!dst.exists("old", refs()));
        assert!(dst.exists("c", refs()));
    }

    #[test]
    fn test_to_string_dump() {
        let ctx = KnowledgeContext::new();
        ctx.set("num", 42i64, upd()).unwrap();
        ctx.set("name", "alice", upd()).unwrap();
        ctx.set("arr", vec![1i64, 2], upd()).unwrap();

        let dump = ctx.to_string_dump(",", ";\n", "=");
        assert!(dump.contains("num=42;\n"));
        assert!(dump.contains("name='alice';\n"));
        assert!(dump.contains("arr=[1,2];\n"));
    }

    #[test]
    fn test_monotonic_writes_last_wins() {
        let ctx = KnowledgeContext::new();
        for (value, quality, clock) in [(1i64, 1u32, 1u64), (2, 2, 2), (3, 3, 3)] {
            let mut rec = KnowledgeRecord::new(value);
            rec.set_quality(quality);
            rec.set_clock(clock);
            ctx.update_record_from_external("x", &rec, upd()).unwrap();
        }
        let rec = ctx.get("x", refs());
        assert_eq!(rec.to_integer(), 3);
        assert_eq!(rec.quality(), 3);
        assert_eq!(rec.clock(), 3);
    }
}
