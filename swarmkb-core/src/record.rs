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

//! # Knowledge Record — Tagged, Reference-Shareable Value
//!
//! A [`KnowledgeRecord`] carries one of the supported payload kinds together
//! with the metadata the replication layer needs:
//!
//! - **clock** — a Lamport stamp copied in from the owning context on write,
//!   monotone non-decreasing per record under the external-merge rule;
//! - **quality** — a priority tiebreaker; on equal clocks, ties lose to
//!   same-or-higher quality updates;
//! - **write quality** — the write authority of this process for the record;
//! - **status** — uncreated / modified / unmodified, driving both `exists`
//!   checks and modified-set bookkeeping.
//!
//! ## Payload Sharing
//!
//! Array, string, and binary payloads live behind `Arc`. Handing a payload to
//! a transport or container view is a ref-count bump, never a copy. Any
//! mutation goes through [`Arc::make_mut`]: whichever writer finds the buffer
//! shared materialises a private copy first, so a handle obtained before the
//! write keeps observing the pre-mutation bytes.
//!
//! ## Conversions
//!
//! Readers never fail. Case analysis over the tag is the only lawful way to
//! read a payload, and every conversion has a total fallback: parsing a
//! non-numeric string yields 0, binary kinds convert to 0, an out-of-range
//! array index yields an uninitialized record.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Integer element type used throughout the knowledge layer.
pub type Integer = i64;

// =============================================================================
// Type Tags
// =============================================================================

/// Discriminant of a knowledge record payload.
///
/// The on-disk tag values retain the original middleware's bit-mask layout so
/// checkpoints remain diffable against captures from the reference deployment:
///
/// | variant | tag |
/// |---|---|
/// | Uninitialized | 0 |
/// | Integer | 1 |
/// | String | 2 |
/// | Double | 4 |
/// | UnknownFile | 8 |
/// | Xml | 16 |
/// | Text | 32 |
/// | IntegerArray | 64 |
/// | DoubleArray | 128 |
/// | Jpeg | 256 |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordType {
    Uninitialized,
    Integer,
    String,
    Double,
    UnknownFile,
    Xml,
    Text,
    IntegerArray,
    DoubleArray,
    Jpeg,
}

impl RecordType {
    /// Wire/file tag for this type.
    pub fn tag(&self) -> u32 {
        match self {
            RecordType::Uninitialized => 0,
            RecordType::Integer => 1,
            RecordType::String => 2,
            RecordType::Double => 4,
            RecordType::UnknownFile => 8,
            RecordType::Xml => 16,
            RecordType::Text => 32,
            RecordType::IntegerArray => 64,
            RecordType::DoubleArray => 128,
            RecordType::Jpeg => 256,
        }
    }

    /// Construct from a wire/file tag.
    pub fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            0 => Some(RecordType::Uninitialized),
            1 => Some(RecordType::Integer),
            2 => Some(RecordType::String),
            4 => Some(RecordType::Double),
            8 => Some(RecordType::UnknownFile),
            16 => Some(RecordType::Xml),
            32 => Some(RecordType::Text),
            64 => Some(RecordType::IntegerArray),
            128 => Some(RecordType::DoubleArray),
            256 => Some(RecordType::Jpeg),
            _ => None,
        }
    }

    /// True for integer and double arrays.
    pub fn is_array(&self) -> bool {
        matches!(self, RecordType::IntegerArray | RecordType::DoubleArray)
    }

    /// True for string-backed kinds (string, text, XML).
    pub fn is_string(&self) -> bool {
        matches!(self, RecordType::String | RecordType::Text | RecordType::Xml)
    }

    /// True for opaque binary kinds (JPEG, unknown file).
    pub fn is_binary_file(&self) -> bool {
        matches!(self, RecordType::Jpeg | RecordType::UnknownFile)
    }
}

// =============================================================================
// Status
// =============================================================================

/// Lifecycle status of a record within a context.
///
/// `Uncreated` entries are placeholders inserted by reference resolution;
/// they do not `exist` and are skipped by scans and checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordStatus {
    Uncreated,
    Modified,
    Unmodified,
}

// =============================================================================
// Payload
// =============================================================================

/// The tagged payload of a knowledge record.
///
/// Heavy variants hold their buffer behind `Arc`; cloning a value is O(1).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum KnowledgeValue {
    Uninitialized,
    Integer(Integer),
    IntegerArray(Arc<Vec<Integer>>),
    Double(f64),
    DoubleArray(Arc<Vec<f64>>),
    String(Arc<String>),
    Text(Arc<String>),
    Xml(Arc<String>),
    Jpeg(Arc<Vec<u8>>),
    UnknownFile(Arc<Vec<u8>>),
}

impl KnowledgeValue {
    /// The type tag this payload carries.
    pub fn record_type(&self) -> RecordType {
        match self {
            KnowledgeValue::Uninitialized => RecordType::Uninitialized,
            KnowledgeValue::Integer(_) => RecordType::Integer,
            KnowledgeValue::IntegerArray(_) => RecordType::IntegerArray,
            KnowledgeValue::Double(_) => RecordType::Double,
            KnowledgeValue::DoubleArray(_) => RecordType::DoubleArray,
            KnowledgeValue::String(_) => RecordType::String,
            KnowledgeValue::Text(_) => RecordType::Text,
            KnowledgeValue::Xml(_) => RecordType::Xml,
            KnowledgeValue::Jpeg(_) => RecordType::Jpeg,
            KnowledgeValue::UnknownFile(_) => RecordType::UnknownFile,
        }
    }
}

impl From<Integer> for KnowledgeValue {
    fn from(v: Integer) -> Self {
        KnowledgeValue::Integer(v)
    }
}

impl From<i32> for KnowledgeValue {
    fn from(v: i32) -> Self {
        KnowledgeValue::Integer(v as Integer)
    }
}

impl From<f64> for KnowledgeValue {
    fn from(v: f64) -> Self {
        KnowledgeValue::Double(v)
    }
}

impl From<String> for KnowledgeValue {
    fn from(v: String) -> Self {
        KnowledgeValue::String(Arc::new(v))
    }
}

impl From<&str> for KnowledgeValue {
    fn from(v: &str) -> Self {
        KnowledgeValue::String(Arc::new(v.to_string()))
    }
}

impl From<Vec<Integer>> for KnowledgeValue {
    fn from(v: Vec<Integer>) -> Self {
        KnowledgeValue::IntegerArray(Arc::new(v))
    }
}

impl From<Vec<f64>> for KnowledgeValue {
    fn from(v: Vec<f64>) -> Self {
        KnowledgeValue::DoubleArray(Arc::new(v))
    }
}

// =============================================================================
// Knowledge Record
// =============================================================================

/// The dynamically typed value unit with replication metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeRecord {
    value: KnowledgeValue,
    clock: u64,
    quality: u32,
    write_quality: u32,
    status: RecordStatus,
}

impl Default for KnowledgeRecord {
    fn default() -> Self {
        Self {
            value: KnowledgeValue::Uninitialized,
            clock: 0,
            quality: 0,
            write_quality: 0,
            status: RecordStatus::Uncreated,
        }
    }
}

impl KnowledgeRecord {
    /// A record carrying the given value, marked modified.
    pub fn new(value: impl Into<KnowledgeValue>) -> Self {
        Self {
            value: value.into(),
            clock: 0,
            quality: 0,
            write_quality: 0,
            status: RecordStatus::Modified,
        }
    }

    /// A shared integer array of `count` copies of `fill`, built without
    /// intermediate copies.
    pub fn filled_integers(count: usize, fill: Integer) -> Self {
        Self::new(KnowledgeValue::IntegerArray(Arc::new(vec![fill; count])))
    }

    /// A shared double array of `count` copies of `fill`.
    pub fn filled_doubles(count: usize, fill: f64) -> Self {
        Self::new(KnowledgeValue::DoubleArray(Arc::new(vec![fill; count])))
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn value(&self) -> &KnowledgeValue {
        &self.value
    }

    pub fn record_type(&self) -> RecordType {
        self.value.record_type()
    }

    pub fn clock(&self) -> u64 {
        self.clock
    }

    pub fn set_clock(&mut self, clock: u64) {
        self.clock = clock;
    }

    pub fn quality(&self) -> u32 {
        self.quality
    }

    pub fn set_quality(&mut self, quality: u32) {
        self.quality = quality;
    }

    pub fn write_quality(&self) -> u32 {
        self.write_quality
    }

    pub fn set_write_quality(&mut self, quality: u32) {
        self.write_quality = quality;
    }

    pub fn status(&self) -> RecordStatus {
        self.status
    }

    pub fn set_status(&mut self, status: RecordStatus) {
        self.status = status;
    }

    /// A record exists once it has been written and not since reset or
    /// taken: the single condition is status ≠ uncreated.
    pub fn exists(&self) -> bool {
        self.status != RecordStatus::Uncreated
    }

    /// Element count for arrays, byte length for strings and binaries,
    /// 1 for scalars, 0 when uninitialized. O(1) for every kind.
    pub fn size(&self) -> usize {
        match &self.value {
            KnowledgeValue::Uninitialized => 0,
            KnowledgeValue::Integer(_) | KnowledgeValue::Double(_) => 1,
            KnowledgeValue::IntegerArray(a) => a.len(),
            KnowledgeValue::DoubleArray(a) => a.len(),
            KnowledgeValue::String(s) | KnowledgeValue::Text(s) | KnowledgeValue::Xml(s) => s.len(),
            KnowledgeValue::Jpeg(b) | KnowledgeValue::UnknownFile(b) => b.len(),
        }
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Replace the payload. The new payload is uniquely owned; any prior
    /// shared handle keeps the old buffer.
    pub fn set_value(&mut self, value: impl Into<KnowledgeValue>) {
        self.value = value.into();
        self.status = RecordStatus::Modified;
    }

    /// Clear the payload, leaving the record uncreated. Clock and quality
    /// survive so a later write resumes the record's causal history.
    pub fn reset_value(&mut self) {
        self.value = KnowledgeValue::Uninitialized;
        self.status = RecordStatus::Uncreated;
    }

    // =========================================================================
    // Shared Payloads
    // =========================================================================

    /// Install a shared string payload without copying the caller's buffer.
    pub fn emplace_shared_string(&mut self, value: Arc<String>) {
        self.value = KnowledgeValue::String(value);
        self.status = RecordStatus::Modified;
    }

    /// Install a shared integer array payload.
    pub fn emplace_shared_integers(&mut self, value: Arc<Vec<Integer>>) {
        self.value = KnowledgeValue::IntegerArray(value);
        self.status = RecordStatus::Modified;
    }

    /// Install a shared double array payload.
    pub fn emplace_shared_doubles(&mut self, value: Arc<Vec<f64>>) {
        self.value = KnowledgeValue::DoubleArray(value);
        self.status = RecordStatus::Modified;
    }

    /// Install a shared binary payload under the given binary kind.
    /// Non-binary kinds fall back to `UnknownFile`.
    pub fn emplace_shared_binary(&mut self, kind: RecordType, value: Arc<Vec<u8>>) {
        self.value = match kind {
            RecordType::Jpeg => KnowledgeValue::Jpeg(value),
            _ => KnowledgeValue::UnknownFile(value),
        };
        self.status = RecordStatus::Modified;
    }

    /// Borrow the shared string payload. `None` on type mismatch.
    pub fn share_string(&self) -> Option<Arc<String>> {
        match &self.value {
            KnowledgeValue::String(s) | KnowledgeValue::Text(s) | KnowledgeValue::Xml(s) => {
                Some(Arc::clone(s))
            }
            _ => None,
        }
    }

    /// Borrow the shared integer array payload.
    pub fn share_integers(&self) -> Option<Arc<Vec<Integer>>> {
        match &self.value {
            KnowledgeValue::IntegerArray(a) => Some(Arc::clone(a)),
            _ => None,
        }
    }

    /// Borrow the shared double array payload.
    pub fn share_doubles(&self) -> Option<Arc<Vec<f64>>> {
        match &self.value {
            KnowledgeValue::DoubleArray(a) => Some(Arc::clone(a)),
            _ => None,
        }
    }

    /// Borrow the shared binary payload.
    pub fn share_binary(&self) -> Option<Arc<Vec<u8>>> {
        match &self.value {
            KnowledgeValue::Jpeg(b) | KnowledgeValue::UnknownFile(b) => Some(Arc::clone(b)),
            _ => None,
        }
    }

    /// Transfer the string payload out, leaving the record uncreated as
    /// [`Self::reset_value`] does: a taken variable no longer exists.
    pub fn take_string(&mut self) -> Option<Arc<String>> {
        match std::mem::replace(&mut self.value, KnowledgeValue::Uninitialized) {
            KnowledgeValue::String(s) | KnowledgeValue::Text(s) | KnowledgeValue::Xml(s) => {
                self.status = RecordStatus::Uncreated;
                Some(s)
            }
            other => {
                self.value = other;
                None
            }
        }
    }

    /// Transfer the integer array payload out, leaving the record
    /// uncreated.
    pub fn take_integers(&mut self) -> Option<Arc<Vec<Integer>>> {
        match std::mem::replace(&mut self.value, KnowledgeValue::Uninitialized) {
            KnowledgeValue::IntegerArray(a) => {
                self.status = RecordStatus::Uncreated;
                Some(a)
            }
            other => {
                self.value = other;
                None
            }
        }
    }

    /// Transfer the double array payload out, leaving the record uncreated.
    pub fn take_doubles(&mut self) -> Option<Arc<Vec<f64>>> {
        match std::mem::replace(&mut self.value, KnowledgeValue::Uninitialized) {
            KnowledgeValue::DoubleArray(a) => {
                self.status = RecordStatus::Uncreated;
                Some(a)
            }
            other => {
                self.value = other;
                None
            }
        }
    }

    /// Transfer the binary payload out, leaving the record uncreated.
    pub fn take_binary(&mut self) -> Option<Arc<Vec<u8>>> {
        match std::mem::replace(&mut self.value, KnowledgeValue::Uninitialized) {
            KnowledgeValue::Jpeg(b) | KnowledgeValue::UnknownFile(b) => {
                self.status = RecordStatus::Uncreated;
                Some(b)
            }
            other => {
                self.value = other;
                None
            }
        }
    }

    // =========================================================================
    // Conversions
    // =========================================================================

    /// Best-effort integer view. Strings parse as decimal, failing to 0;
    /// binary kinds are 0; arrays use element 0.
    pub fn to_integer(&self) -> Integer {
        match &self.value {
            KnowledgeValue::Uninitialized => 0,
            KnowledgeValue::Integer(v) => *v,
            KnowledgeValue::Double(v) => *v as Integer,
            KnowledgeValue::IntegerArray(a) => a.first().copied().unwrap_or(0),
            KnowledgeValue::DoubleArray(a) => a.first().copied().unwrap_or(0.0) as Integer,
            KnowledgeValue::String(s) | KnowledgeValue::Text(s) | KnowledgeValue::Xml(s) => {
                s.trim().parse().unwrap_or(0)
            }
            KnowledgeValue::Jpeg(_) | KnowledgeValue::UnknownFile(_) => 0,
        }
    }

    /// Best-effort double view, mirroring [`Self::to_integer`].
    pub fn to_double(&self) -> f64 {
        match &self.value {
            KnowledgeValue::Uninitialized => 0.0,
            KnowledgeValue::Integer(v) => *v as f64,
            KnowledgeValue::Double(v) => *v,
            KnowledgeValue::IntegerArray(a) => a.first().copied().unwrap_or(0) as f64,
            KnowledgeValue::DoubleArray(a) => a.first().copied().unwrap_or(0.0),
            KnowledgeValue::String(s) | KnowledgeValue::Text(s) | KnowledgeValue::Xml(s) => {
                s.trim().parse().unwrap_or(0.0)
            }
            KnowledgeValue::Jpeg(_) | KnowledgeValue::UnknownFile(_) => 0.0,
        }
    }

    /// Integer array view: arrays convert element-wise, a scalar becomes a
    /// length-1 array, uninitialized becomes empty.
    pub fn to_integers(&self) -> Vec<Integer> {
        match &self.value {
            KnowledgeValue::Uninitialized => Vec::new(),
            KnowledgeValue::IntegerArray(a) => a.as_ref().clone(),
            KnowledgeValue::DoubleArray(a) => a.iter().map(|v| *v as Integer).collect(),
            _ => vec![self.to_integer()],
        }
    }

    /// Double array view, mirroring [`Self::to_integers`].
    pub fn to_doubles(&self) -> Vec<f64> {
        match &self.value {
            KnowledgeValue::Uninitialized => Vec::new(),
            KnowledgeValue::IntegerArray(a) => a.iter().map(|v| *v as f64).collect(),
            KnowledgeValue::DoubleArray(a) => a.as_ref().clone(),
            _ => vec![self.to_double()],
        }
    }

    /// Truth value: non-zero scalars, non-empty strings and binaries, and
    /// arrays that are non-empty with every element non-zero.
    pub fn is_true(&self) -> bool {
        match &self.value {
            KnowledgeValue::Uninitialized => false,
            KnowledgeValue::Integer(v) => *v != 0,
            KnowledgeValue::Double(v) => *v != 0.0,
            KnowledgeValue::IntegerArray(a) => !a.is_empty() && a.iter().all(|v| *v != 0),
            KnowledgeValue::DoubleArray(a) => !a.is_empty() && a.iter().all(|v| *v != 0.0),
            KnowledgeValue::String(s) | KnowledgeValue::Text(s) | KnowledgeValue::Xml(s) => {
                !s.is_empty()
            }
            KnowledgeValue::Jpeg(b) | KnowledgeValue::UnknownFile(b) => !b.is_empty(),
        }
    }

    pub fn is_false(&self) -> bool {
        !self.is_true()
    }

    // =========================================================================
    // Array Index Access
    // =========================================================================

    /// The element at `index` as a scalar record carrying this record's
    /// clock and quality. Out of range, or a non-array payload, yields an
    /// uninitialized record — never a fault.
    pub fn retrieve_index(&self, index: usize) -> KnowledgeRecord {
        let value = match &self.value {
            KnowledgeValue::IntegerArray(a) => {
                a.get(index).map(|v| KnowledgeValue::Integer(*v))
            }
            KnowledgeValue::DoubleArray(a) => a.get(index).map(|v| KnowledgeValue::Double(*v)),
            _ => None,
        };
        match value {
            Some(value) => KnowledgeRecord {
                value,
                clock: self.clock,
                quality: self.quality,
                write_quality: self.write_quality,
                status: RecordStatus::Unmodified,
            },
            None => KnowledgeRecord::default(),
        }
    }

    /// Set an integer element. A shared array is copied first; a non-array
    /// record is promoted to an integer array; growing zero-fills. Writing
    /// into a double array stores the value as a double.
    pub fn set_index_integer(&mut self, index: usize, value: Integer) {
        match &mut self.value {
            KnowledgeValue::IntegerArray(arr) => {
                let arr = Arc::make_mut(arr);
                if index >= arr.len() {
                    arr.resize(index + 1, 0);
                }
                arr[index] = value;
            }
            KnowledgeValue::DoubleArray(arr) => {
                let arr = Arc::make_mut(arr);
                if index >= arr.len() {
                    arr.resize(index + 1, 0.0);
                }
                arr[index] = value as f64;
            }
            _ => {
                let mut arr = self.to_integers();
                if index >= arr.len() {
                    arr.resize(index + 1, 0);
                }
                arr[index] = value;
                self.value = KnowledgeValue::IntegerArray(Arc::new(arr));
            }
        }
        self.status = RecordStatus::Modified;
    }

    /// Set a double element. An integer array is promoted to doubles first,
    /// matching the original middleware's widening rule.
    pub fn set_index_double(&mut self, index: usize, value: f64) {
        match &mut self.value {
            KnowledgeValue::DoubleArray(arr) => {
                let arr = Arc::make_mut(arr);
                if index >= arr.len() {
                    arr.resize(index + 1, 0.0);
                }
                arr[index] = value;
            }
            _ => {
                let mut arr = self.to_doubles();
                if index >= arr.len() {
                    arr.resize(index + 1, 0.0);
                }
                arr[index] = value;
                self.value = KnowledgeValue::DoubleArray(Arc::new(arr));
            }
        }
        self.status = RecordStatus::Modified;
    }

    // =========================================================================
    // Copying
    // =========================================================================

    /// An owned clone whose payload shares nothing with this record.
    pub fn deep_copy(&self) -> KnowledgeRecord {
        let value = match &self.value {
            KnowledgeValue::IntegerArray(a) => {
                KnowledgeValue::IntegerArray(Arc::new(a.as_ref().clone()))
            }
            KnowledgeValue::DoubleArray(a) => {
                KnowledgeValue::DoubleArray(Arc::new(a.as_ref().clone()))
            }
            KnowledgeValue::String(s) => KnowledgeValue::String(Arc::new(s.as_ref().clone())),
            KnowledgeValue::Text(s) => KnowledgeValue::Text(Arc::new(s.as_ref().clone())),
            KnowledgeValue::Xml(s) => KnowledgeValue::Xml(Arc::new(s.as_ref().clone())),
            KnowledgeValue::Jpeg(b) => KnowledgeValue::Jpeg(Arc::new(b.as_ref().clone())),
            KnowledgeValue::UnknownFile(b) => {
                KnowledgeValue::UnknownFile(Arc::new(b.as_ref().clone()))
            }
            scalar => scalar.clone(),
        };
        KnowledgeRecord { value, ..self.clone() }
    }

    // =========================================================================
    // Formatting
    // =========================================================================

    /// The record as a parseable assignment literal: numeric literals,
    /// double-quoted strings, bracketed arrays. Binary payloads dump as
    /// their byte size — the textual format does not carry binary data.
    pub fn to_karl_literal(&self) -> String {
        match &self.value {
            KnowledgeValue::Uninitialized => "0".to_string(),
            KnowledgeValue::Integer(v) => v.to_string(),
            KnowledgeValue::Double(v) => format_double(*v),
            KnowledgeValue::IntegerArray(a) => {
                let items: Vec<String> = a.iter().map(|v| v.to_string()).collect();
                format!("[{}]", items.join(", "))
            }
            KnowledgeValue::DoubleArray(a) => {
                let items: Vec<String> = a.iter().map(|v| format_double(*v)).collect();
                format!("[{}]", items.join(", "))
            }
            KnowledgeValue::String(s) | KnowledgeValue::Text(s) | KnowledgeValue::Xml(s) => {
                quote_string(s)
            }
            KnowledgeValue::Jpeg(b) | KnowledgeValue::UnknownFile(b) => b.len().to_string(),
        }
    }
}

impl fmt::Display for KnowledgeRecord {
    /// The textual value of the record, as substituted by statement
    /// expansion: raw string contents, comma-joined arrays, empty when
    /// uninitialized.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            KnowledgeValue::Uninitialized => Ok(()),
            KnowledgeValue::Integer(v) => write!(f, "{}", v),
            KnowledgeValue::Double(v) => write!(f, "{}", v),
            KnowledgeValue::IntegerArray(a) => {
                for (i, v) in a.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                Ok(())
            }
            KnowledgeValue::DoubleArray(a) => {
                for (i, v) in a.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                Ok(())
            }
            KnowledgeValue::String(s) | KnowledgeValue::Text(s) | KnowledgeValue::Xml(s) => {
                write!(f, "{}", s)
            }
            KnowledgeValue::Jpeg(b) => write!(f, "<jpeg:{}>", b.len()),
            KnowledgeValue::UnknownFile(b) => write!(f, "<binary:{}>", b.len()),
        }
    }
}

/// Format a double so the literal parses back as a double.
fn format_double(v: f64) -> String {
    let s = v.to_string();
    if s.contains('.') || s.contains('e') || s.contains("inf") || s.contains("NaN") {
        s
    } else {
        format!("{}.0", s)
    }
}

/// Double-quote a string with backslash escapes.
fn quote_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_uncreated() {
        let rec = KnowledgeRecord::default();
        assert!(!rec.exists());
        assert_eq!(rec.record_type(), RecordType::Uninitialized);
        assert_eq!(rec.size(), 0);
        assert_eq!(rec.to_integer(), 0);
    }

    #[test]
    fn test_set_value_marks_modified() {
        let mut rec = KnowledgeRecord::default();
        rec.set_value(42i64);
        assert!(rec.exists());
        assert_eq!(rec.status(), RecordStatus::Modified);
        assert_eq!(rec.to_integer(), 42);
    }

    #[test]
    fn test_conversion_table() {
        assert_eq!(KnowledgeRecord::new(3.9).to_integer(), 3);
        assert_eq!(KnowledgeRecord::new(7i64).to_double(), 7.0);
        assert_eq!(KnowledgeRecord::new("19").to_integer(), 19);
        assert_eq!(KnowledgeRecord::new("1.5").to_double(), 1.5);
        assert_eq!(KnowledgeRecord::new("not a number").to_integer(), 0);
        assert_eq!(KnowledgeRecord::new(vec![9i64, 8, 7]).to_integer(), 9);
        assert_eq!(KnowledgeRecord::new(vec![2.5f64]).to_double(), 2.5);

        let mut bin = KnowledgeRecord::default();
        bin.emplace_shared_binary(RecordType::Jpeg, Arc::new(vec![0xff, 0xd8]));
        assert_eq!(bin.to_integer(), 0);
    }

    #[test]
    fn test_scalar_to_array_of_one() {
        let rec = KnowledgeRecord::new(5i64);
        assert_eq!(rec.to_integers(), vec![5]);
        assert_eq!(rec.to_doubles(), vec![5.0]);
    }

    #[test]
    fn test_unshared_string_round_trip() {
        // Moving a string into a record wraps it in a fresh Arc; the record
        // owns its payload uniquely.
        let s = String::from("Hello World");
        let mut rec = KnowledgeRecord::default();
        rec.set_value(s);

        let handle = rec.share_string().unwrap();
        assert_eq!(handle.as_str(), "Hello World");
        // The only other holder is the record itself.
        assert_eq!(Arc::strong_count(&handle), 2);
    }

    #[test]
    fn test_shared_string_round_trip() {
        let original = Arc::new(String::from("Hello World"));
        let mut rec = KnowledgeRecord::default();
        rec.emplace_shared_string(Arc::clone(&original));

        let out = rec.share_string().unwrap();
        assert!(Arc::ptr_eq(&original, &out));
    }

    #[test]
    fn test_shared_integer_array_copy_on_write() {
        let mut rec = KnowledgeRecord::filled_integers(4000, 42);
        let held = rec.share_integers().unwrap();

        rec.set_index_integer(0, 47);

        // The stored record sees the write; the held handle observes the
        // pre-mutation payload.
        assert_eq!(rec.retrieve_index(0).to_integer(), 47);
        assert_eq!(held[0], 42);
        assert_eq!(held.len(), 4000);
        assert!(!Arc::ptr_eq(&held, &rec.share_integers().unwrap()));
    }

    #[test]
    fn test_take_leaves_uninitialized() {
        let payload = Arc::new(String::from("expensive to copy"));
        let mut rec = KnowledgeRecord::default();
        rec.emplace_shared_string(Arc::clone(&payload));

        let taken = rec.take_string().unwrap();
        assert!(Arc::ptr_eq(&payload, &taken));
        assert_eq!(rec.record_type(), RecordType::Uninitialized);
        assert_eq!(rec.status(), RecordStatus::Uncreated);
        assert!(!rec.exists());
        assert!(rec.take_string().is_none());
    }

    #[test]
    fn test_take_integers_uncreates_record() {
        let mut rec = KnowledgeRecord::new(vec![1i64, 2, 3]);
        assert!(rec.exists());
        assert!(rec.take_integers().is_some());
        assert!(!rec.exists());
        assert_eq!(rec.status(), RecordStatus::Uncreated);
    }

    #[test]
    fn test_take_wrong_kind_preserves_payload() {
        let mut rec = KnowledgeRecord::new(vec![1i64, 2, 3]);
        assert!(rec.take_string().is_none());
        assert_eq!(rec.record_type(), RecordType::IntegerArray);
        assert_eq!(rec.to_integers(), vec![1, 2, 3]);
        // A failed take does not uncreate the record.
        assert!(rec.exists());
    }

    #[test]
    fn test_share_type_mismatch_is_none() {
        let rec = KnowledgeRecord::new(42i64);
        assert!(rec.share_string().is_none());
        assert!(rec.share_integers().is_none());
        assert!(rec.share_doubles().is_none());
        assert!(rec.share_binary().is_none());
    }

    #[test]
    fn test_retrieve_index_out_of_range() {
        let rec = KnowledgeRecord::new(vec![1i64, 2]);
        let out = rec.retrieve_index(5);
        assert!(!out.exists());
        assert_eq!(out.to_integer(), 0);
    }

    #[test]
    fn test_retrieve_index_carries_metadata() {
        let mut rec = KnowledgeRecord::new(vec![10i64, 20]);
        rec.set_clock(9);
        rec.set_quality(3);
        let out = rec.retrieve_index(1);
        assert_eq!(out.to_integer(), 20);
        assert_eq!(out.clock(), 9);
        assert_eq!(out.quality(), 3);
    }

    #[test]
    fn test_set_index_promotes_scalar() {
        let mut rec = KnowledgeRecord::new(7i64);
        rec.set_index_integer(3, 99);
        assert_eq!(rec.record_type(), RecordType::IntegerArray);
        assert_eq!(rec.to_integers(), vec![7, 0, 0, 99]);
    }

    #[test]
    fn test_set_index_grows_with_zero_fill() {
        let mut rec = KnowledgeRecord::new(vec![1.0f64]);
        rec.set_index_double(2, 2.5);
        assert_eq!(rec.to_doubles(), vec![1.0, 0.0, 2.5]);
    }

    #[test]
    fn test_set_index_double_widens_integer_array() {
        let mut rec = KnowledgeRecord::new(vec![1i64, 2]);
        rec.set_index_double(1, 2.5);
        assert_eq!(rec.record_type(), RecordType::DoubleArray);
        assert_eq!(rec.to_doubles(), vec![1.0, 2.5]);
    }

    #[test]
    fn test_deep_copy_never_aliases() {
        let mut rec = KnowledgeRecord::filled_integers(10, 5);
        let copy = rec.deep_copy();

        rec.set_index_integer(0, 1);
        assert_eq!(copy.retrieve_index(0).to_integer(), 5);

        let a = rec.share_integers().unwrap();
        let b = copy.share_integers().unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_is_true() {
        assert!(KnowledgeRecord::new(1i64).is_true());
        assert!(KnowledgeRecord::new("x").is_true());
        assert!(KnowledgeRecord::default().is_false());
        assert!(KnowledgeRecord::new(0i64).is_false());
        assert!(KnowledgeRecord::new("").is_false());
        assert!(KnowledgeRecord::new(vec![1i64, 1]).is_true());
        assert!(KnowledgeRecord::new(vec![1i64, 0]).is_false());
    }

    #[test]
    fn test_type_tags_round_trip() {
        for ty in [
            RecordType::Uninitialized,
            RecordType::Integer,
            RecordType::String,
            RecordType::Double,
            RecordType::UnknownFile,
            RecordType::Xml,
            RecordType::Text,
            RecordType::IntegerArray,
            RecordType::DoubleArray,
            RecordType::Jpeg,
        ] {
            assert_eq!(RecordType::from_tag(ty.tag()), Some(ty));
        }
        assert_eq!(RecordType::from_tag(3), None);
    }

    #[test]
    fn test_karl_literal() {
        assert_eq!(KnowledgeRecord::new(42i64).to_karl_literal(), "42");
        assert_eq!(KnowledgeRecord::new(2.0).to_karl_literal(), "2.0");
        assert_eq!(
            KnowledgeRecord::new(vec![1i64, 2, 3]).to_karl_literal(),
            "[1, 2, 3]"
        );
        assert_eq!(
            KnowledgeRecord::new("say \"hi\"").to_karl_literal(),
            "\"say \\\"hi\\\"\""
        );
    }

    #[test]
    fn test_display_for_expansion() {
        assert_eq!(KnowledgeRecord::new(5i64).to_string(), "5");
        assert_eq!(KnowledgeRecord::new("agent7").to_string(), "agent7");
        assert_eq!(KnowledgeRecord::default().to_string(), "");
    }
}
