// SPDX-License-Identifier: AGPL-3.0-or-later
// SwarmKB - Distributed Shared-Variable Middleware
// Copyright (C) 2026 Sushanth Reddy Vanagala (https://github.com/sushanthpy)

//! # Knowledge Map — Record Arena with Stable References
//!
//! An ordered mapping from variable name to [`KnowledgeRecord`], built as a
//! generation-stamped slot arena plus a `BTreeMap` name index:
//!
//! - the **arena** gives [`VariableReference`] handles O(1) access that
//!   survives any amount of map churn;
//! - the **index** keeps names ordered for prefix and range scans;
//! - the **generation stamp** invalidates references on deletion — a slot
//!   reused for a new variable carries a new generation, so a stale
//!   reference can never observe an unrelated record.
//!
//! The map itself is not synchronized; it lives inside the context's mutex.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use swarmkb_core::KnowledgeRecord;

/// Index + generation pair addressing one arena slot.
///
/// The generation must match the slot's current generation for the id to
/// resolve; a mismatch means the entry was deleted after the id was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId {
    index: u32,
    generation: u32,
}

/// A stable handle to one variable: the name plus a direct slot id.
///
/// Obtained from the context's `get_ref`; valid until the entry is deleted.
/// Operations through a stale reference behave as against an uncreated
/// entry — they never observe a reused slot.
#[derive(Debug, Clone)]
pub struct VariableReference {
    name: Arc<str>,
    slot: SlotId,
}

impl VariableReference {
    pub(crate) fn new(name: Arc<str>, slot: SlotId) -> Self {
        Self { name, slot }
    }

    /// The variable name this reference was resolved from.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn slot(&self) -> SlotId {
        self.slot
    }
}

#[derive(Debug)]
struct Slot {
    name: Arc<str>,
    record: KnowledgeRecord,
    generation: u32,
    occupied: bool,
}

/// Ordered name → record mapping over a slot arena.
#[derive(Debug, Default)]
pub struct KnowledgeMap {
    slots: Vec<Slot>,
    free: Vec<u32>,
    index: BTreeMap<Arc<str>, SlotId>,
}

impl KnowledgeMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries (including uncreated placeholders).
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Resolve a name to its slot id, if present.
    pub fn resolve(&self, name: &str) -> Option<SlotId> {
        self.index.get(name).copied()
    }

    /// Look up a record by name. O(log n).
    pub fn get(&self, name: &str) -> Option<&KnowledgeRecord> {
        self.resolve(name).and_then(|id| self.record(id))
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut KnowledgeRecord> {
        self.resolve(name).and_then(|id| self.record_mut(id))
    }

    /// Record behind a slot id, if the id is still live. O(1).
    pub fn record(&self, id: SlotId) -> Option<&KnowledgeRecord> {
        self.slots.get(id.index as usize).and_then(|slot| {
            (slot.occupied && slot.generation == id.generation).then_some(&slot.record)
        })
    }

    pub fn record_mut(&mut self, id: SlotId) -> Option<&mut KnowledgeRecord> {
        self.slots.get_mut(id.index as usize).and_then(|slot| {
            (slot.occupied && slot.generation == id.generation).then_some(&mut slot.record)
        })
    }

    /// Name behind a slot id, if the id is still live.
    pub fn name_of(&self, id: SlotId) -> Option<&Arc<str>> {
        self.slots.get(id.index as usize).and_then(|slot| {
            (slot.occupied && slot.generation == id.generation).then_some(&slot.name)
        })
    }

    /// Resolve a name, inserting an uncreated placeholder if absent, so that
    /// later operations through the returned id are O(1).
    pub fn get_or_create(&mut self, name: &str) -> SlotId {
        if let Some(id) = self.resolve(name) {
            return id;
        }
        let name: Arc<str> = Arc::from(name);
        let id = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.name = Arc::clone(&name);
                slot.record = KnowledgeRecord::default();
                slot.occupied = true;
                SlotId { index, generation: slot.generation }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    name: Arc::clone(&name),
                    record: KnowledgeRecord::default(),
                    generation: 0,
                    occupied: true,
                });
                SlotId { index, generation: 0 }
            }
        };
        self.index.insert(name, id);
        id
    }

    /// A stable reference for the name, creating a placeholder if needed.
    pub fn get_ref(&mut self, name: &str) -> VariableReference {
        let id = self.get_or_create(name);
        let name = Arc::clone(&self.slots[id.index as usize].name);
        VariableReference::new(name, id)
    }

    /// Remove an entry, invalidating every outstanding reference to it.
    /// The freed slot is recycled under a new generation.
    pub fn remove(&mut self, name: &str) -> Option<KnowledgeRecord> {
        let id = self.index.remove(name)?;
        let slot = &mut self.slots[id.index as usize];
        slot.occupied = false;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        Some(std::mem::take(&mut slot.record))
    }

    /// Ordered iteration over (name, record).
    pub fn iter(&self) -> impl Iterator<Item = (&str, &KnowledgeRecord)> {
        self.index
            .iter()
            .filter_map(|(name, id)| self.record(*id).map(|rec| (name.as_ref(), rec)))
    }

    /// Ordered iteration including slot ids, for callers that also maintain
    /// the modified-sets.
    pub fn iter_slots(&self) -> impl Iterator<Item = (&Arc<str>, SlotId, &KnowledgeRecord)> {
        self.index
            .iter()
            .filter_map(|(name, id)| self.record(*id).map(|rec| (name, *id, rec)))
    }

    /// Ordered iteration over every entry whose name starts with `prefix` —
    /// the inclusive range scan from `prefix` to its lexicographic successor.
    pub fn range_prefix<'a>(
        &'a self,
        prefix: &'a str,
    ) -> impl Iterator<Item = (&'a str, &'a KnowledgeRecord)> + 'a {
        self.index
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(move |(name, _)| name.starts_with(prefix))
            .filter_map(|(name, id)| self.record(*id).map(|rec| (name.as_ref(), rec)))
    }

    /// Erase every entry. All outstanding references are invalidated; slots
    /// are recycled under new generations.
    pub fn clear(&mut self) {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.occupied {
                slot.occupied = false;
                slot.generation = slot.generation.wrapping_add(1);
                slot.record = KnowledgeRecord::default();
                self.free.push(index as u32);
            }
        }
        self.index.clear();
    }

    /// Reset every record to uninitialized in place. Names and references
    /// survive; values and statuses do not.
    pub fn reset_values(&mut self) {
        for slot in &mut self.slots {
            if slot.occupied {
                slot.record.reset_value();
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
