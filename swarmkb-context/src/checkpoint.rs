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

//! # Checkpoint Persistence
//!
//! Binary checkpoint plus textual dump formats for the knowledge context.
//!
//! ## Binary Layout (little-endian)
//!
//! ```text
//! header (88 bytes):
//!   magic    u64   "SWARMKB\0"
//!   version  u32   1
//!   id       64B   context holder id, zero-padded
//!   count    u32   number of entries
//!   clock    u64   context Lamport clock at save
//! entry:
//!   name_len u32 | name bytes | type_tag u32 | payload_len u32 |
//!   clock u64 | quality u32 | payload bytes
//! payload:
//!   integer/double        8 bytes
//!   arrays                element count u32, then 8-byte elements
//!   string/text/xml       UTF-8 bytes
//!   jpeg/unknown file     raw bytes
//! ```
//!
//! `save_checkpoint` appends only the current global modified-set to an
//! existing checkpoint file and rewrites the header's count and clock in
//! place, so repeated checkpoints accumulate deltas; on load, later entries
//! win through the external-merge rule exactly as live transport updates
//! would. Files are not endianness-portable; the version field gates
//! compatibility.
//!
//! Persistence runs entirely under the context lock — the saved image is a
//! consistent snapshot, and a load applies as one atomic batch.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use swarmkb_core::{
    KnowledgeRecord, KnowledgeUpdateSettings, KnowledgeValue, RecordType, Result, SwarmKbError,
};

use crate::context::KnowledgeContext;

/// File magic: `SWARMKB\0` as a little-endian u64.
const CHECKPOINT_MAGIC: u64 = u64::from_le_bytes(*b"SWARMKB\0");

/// Current checkpoint format version.
const CHECKPOINT_VERSION: u32 = 1;

/// Fixed width of the id field in the header.
const ID_FIELD_LEN: usize = 64;

/// Total header length: magic + version + id + count + clock.
const HEADER_LEN: usize = 8 + 4 + ID_FIELD_LEN + 4 + 8;

/// Offset of the (count, clock) pair rewritten by incremental checkpoints.
const COUNT_OFFSET: u64 = 8 + 4 + ID_FIELD_LEN as u64;

// =============================================================================
// Encoding
// =============================================================================

fn encode_header(buf: &mut Vec<u8>, id: &str, count: u32, clock: u64) {
    buf.extend_from_slice(&CHECKPOINT_MAGIC.to_le_bytes());
    buf.extend_from_slice(&CHECKPOINT_VERSION.to_le_bytes());
    let mut id_bytes = [0u8; ID_FIELD_LEN];
    let id_src = id.as_bytes();
    let len = id_src.len().min(ID_FIELD_LEN);
    id_bytes[..len].copy_from_slice(&id_src[..len]);
    buf.extend_from_slice(&id_bytes);
    buf.extend_from_slice(&count.to_le_bytes());
    buf.extend_from_slice(&clock.to_le_bytes());
}

fn encode_payload(rec: &KnowledgeRecord) -> Vec<u8> {
    match rec.value() {
        KnowledgeValue::Uninitialized => Vec::new(),
        KnowledgeValue::Integer(v) => v.to_le_bytes().to_vec(),
        KnowledgeValue::Double(v) => v.to_le_bytes().to_vec(),
        KnowledgeValue::IntegerArray(a) => {
            let mut buf = Vec::with_capacity(4 + a.len() * 8);
            buf.extend_from_slice(&(a.len() as u32).to_le_bytes());
            for v in a.iter() {
                buf.extend_from_slice(&v.to_le_bytes());
            }
            buf
        }
        KnowledgeValue::DoubleArray(a) => {
            let mut buf = Vec::with_capacity(4 + a.len() * 8);
            buf.extend_from_slice(&(a.len() as u32).to_le_bytes());
            for v in a.iter() {
                buf.extend_from_slice(&v.to_le_bytes());
            }
            buf
        }
        KnowledgeValue::String(s) | KnowledgeValue::Text(s) | KnowledgeValue::Xml(s) => {
            s.as_bytes().to_vec()
        }
        KnowledgeValue::Jpeg(b) | KnowledgeValue::UnknownFile(b) => b.as_ref().clone(),
    }
}

fn encode_entry(buf: &mut Vec<u8>, name: &str, rec: &KnowledgeRecord) {
    let payload = encode_payload(rec);
    buf.extend_from_slice(&(name.len() as u32).to_le_bytes());
    buf.extend_from_slice(name.as_bytes());
    buf.extend_from_slice(&rec.record_type().tag().to_le_bytes());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&rec.clock().to_le_bytes());
    buf.extend_from_slice(&rec.quality().to_le_bytes());
    buf.extend_from_slice(&payload);
}

// =============================================================================
// Decoding
// =============================================================================

/// Bounds-checked cursor over a loaded checkpoint image.
struct EntryReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> EntryReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(len).filter(|end| *end <= self.buf.len());
        match end {
            Some(end) => {
                let slice = &self.buf[self.pos..end];
                self.pos = end;
                Ok(slice)
            }
            None => Err(SwarmKbError::CheckpointFormat(format!(
                "truncated checkpoint: needed {} bytes at offset {}",
                len, self.pos
            ))),
        }
    }

    fn read_u32(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes(bytes.try_into().expect("4-byte slice")))
    }

    fn read_u64(&mut self) -> Result<u64> {
        let bytes = self.take(8)?;
        Ok(u64::from_le_bytes(bytes.try_into().expect("8-byte slice")))
    }
}

fn decode_header(reader: &mut EntryReader<'_>) -> Result<(String, u32, u64)> {
    let magic = reader.read_u64()?;
    if magic != CHECKPOINT_MAGIC {
        return Err(SwarmKbError::CheckpointFormat(format!(
            "bad magic {:#018x}",
            magic
        )));
    }
    let version = reader.read_u32()?;
    if version != CHECKPOINT_VERSION {
        return Err(SwarmKbError::CheckpointFormat(format!(
            "unsupported checkpoint version {}",
            version
        )));
    }
    let id_bytes = reader.take(ID_FIELD_LEN)?;
    let id_end = id_bytes.iter().position(|b| *b == 0).unwrap_or(ID_FIELD_LEN);
    let id = String::from_utf8_lossy(&id_bytes[..id_end]).into_owned();
    let count = reader.read_u32()?;
    let clock = reader.read_u64()?;
    Ok((id, count, clock))
}

fn decode_payload(ty: RecordType, payload: &[u8]) -> Result<KnowledgeValue> {
    let value = match ty {
        RecordType::Uninitialized => KnowledgeValue::Uninitialized,
        RecordType::Integer => {
            let bytes: [u8; 8] = payload
                .try_into()
                .map_err(|_| SwarmKbError::CheckpointFormat("integer payload size".into()))?;
            KnowledgeValue::Integer(i64::from_le_bytes(bytes))
        }
        RecordType::Double => {
            let bytes: [u8; 8] = payload
                .try_into()
                .map_err(|_| SwarmKbError::CheckpointFormat("double payload size".into()))?;
            KnowledgeValue::Double(f64::from_le_bytes(bytes))
        }
        RecordType::IntegerArray | RecordType::DoubleArray => {
            let mut reader = EntryReader::new(payload);
            let count = reader.read_u32()? as usize;
            if payload.len() != 4 + count * 8 {
                return Err(SwarmKbError::CheckpointFormat(format!(
                    "array payload size {} does not match element count {}",
                    payload.len(),
                    count
                )));
            }
            if ty == RecordType::IntegerArray {
                let mut elements = Vec::with_capacity(count);
                for _ in 0..count {
                    elements.push(reader.read_u64()? as i64);
                }
                KnowledgeValue::IntegerArray(elements.into())
            } else {
                let mut elements = Vec::with_capacity(count);
                for _ in 0..count {
                    elements.push(f64::from_le_bytes(
                        reader.take(8)?.try_into().expect("8-byte slice"),
                    ));
                }
                KnowledgeValue::DoubleArray(elements.into())
            }
        }
        RecordType::String | RecordType::Text | RecordType::Xml => {
            let text = std::str::from_utf8(payload)
                .map_err(|_| SwarmKbError::CheckpointFormat("string payload not UTF-8".into()))?
                .to_string();
            match ty {
                RecordType::Text => KnowledgeValue::Text(text.into()),
                RecordType::Xml => KnowledgeValue::Xml(text.into()),
                _ => KnowledgeValue::String(text.into()),
            }
        }
        RecordType::Jpeg => KnowledgeValue::Jpeg(payload.to_vec().into()),
        RecordType::UnknownFile => KnowledgeValue::UnknownFile(payload.to_vec().into()),
    };
    Ok(value)
}

fn decode_entry(reader: &mut EntryReader<'_>) -> Result<(String, KnowledgeRecord)> {
    let name_len = reader.read_u32()? as usize;
    let name = std::str::from_utf8(reader.take(name_len)?)
        .map_err(|_| SwarmKbError::CheckpointFormat("variable name not UTF-8".into()))?
        .to_string();
    let tag = reader.read_u32()?;
    let ty = RecordType::from_tag(tag)
        .ok_or_else(|| SwarmKbError::CheckpointFormat(format!("unknown type tag {}", tag)))?;
    let payload_len = reader.read_u32()? as usize;
    let clock = reader.read_u64()?;
    let quality = reader.read_u32()?;
    let payload = reader.take(payload_len)?;

    let mut rec = KnowledgeRecord::new(decode_payload(ty, payload)?);
    rec.set_clock(clock);
    rec.set_quality(quality);
    Ok((name, rec))
}

// =============================================================================
// Context Persistence
// =============================================================================

impl KnowledgeContext {
    /// Save a full binary snapshot of every existing variable. Returns the
    /// number of bytes written.
    pub fn save_context(&self, path: impl AsRef<Path>, id: &str) -> Result<u64> {
        let path = path.as_ref();
        let state = self.state.lock();

        let mut buf = Vec::with_capacity(HEADER_LEN + state.map.len() * 64);
        let entries: Vec<(&str, &KnowledgeRecord)> =
            state.map.iter().filter(|(_, rec)| rec.exists()).collect();
        encode_header(&mut buf, id, entries.len() as u32, state.clock);
        for (name, rec) in &entries {
            encode_entry(&mut buf, name, rec);
        }

        let mut file = File::create(path).map_err(|e| SwarmKbError::CheckpointOpen {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        file.write_all(&buf).map_err(|e| SwarmKbError::CheckpointIo {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        tracing::debug!(
            path = %path.display(),
            entries = entries.len(),
            bytes = buf.len(),
            "saved context"
        );
        Ok(buf.len() as u64)
    }

    /// Append the current global modified-set to a checkpoint file,
    /// rewriting the header's entry count and clock in place. A missing or
    /// empty file is created with a fresh header. Returns the number of
    /// bytes written by this call.
    pub fn save_checkpoint(&self, path: impl AsRef<Path>, id: &str) -> Result<u64> {
        let path = path.as_ref();
        let state = self.state.lock();

        let entries: Vec<(String, KnowledgeRecord)> = state
            .global_modified
            .iter()
            .filter_map(|(name, slot)| {
                state.map.record(*slot).map(|rec| (name.clone(), rec.clone()))
            })
            .collect();

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(|e| SwarmKbError::CheckpointOpen {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
        let io_err = |e: std::io::Error| SwarmKbError::CheckpointIo {
            path: path.display().to_string(),
            reason: e.to_string(),
        };

        let existing_len = file.metadata().map_err(io_err)?.len();
        let mut written: u64 = 0;
        let prior_count = if existing_len == 0 {
            let mut header = Vec::with_capacity(HEADER_LEN);
            encode_header(&mut header, id, 0, state.clock);
            file.write_all(&header).map_err(io_err)?;
            written += header.len() as u64;
            0
        } else {
            let mut header_bytes = vec![0u8; HEADER_LEN];
            file.read_exact(&mut header_bytes).map_err(io_err)?;
            let (_, count, _) = decode_header(&mut EntryReader::new(&header_bytes))?;
            count
        };

        let mut buf = Vec::new();
        for (name, rec) in &entries {
            encode_entry(&mut buf, name, rec);
        }
        file.seek(SeekFrom::End(0)).map_err(io_err)?;
        file.write_all(&buf).map_err(io_err)?;
        written += buf.len() as u64;

        // Patch count and clock so the file stays self-describing.
        let new_count = prior_count + entries.len() as u32;
        file.seek(SeekFrom::Start(COUNT_OFFSET)).map_err(io_err)?;
        file.write_all(&new_count.to_le_bytes()).map_err(io_err)?;
        file.write_all(&state.clock.to_le_bytes()).map_err(io_err)?;

        tracing::debug!(
            path = %path.display(),
            appended = entries.len(),
            total = new_count,
            "saved checkpoint"
        );
        Ok(written)
    }

    /// Load a checkpoint, inserting each entry through the external-merge
    /// rule so conflicts with pre-existing state resolve on (clock,
    /// quality). The context clock moves forward to the saved clock.
    /// Returns the saved context id and the number of bytes consumed.
    pub fn load_context(
        &self,
        path: impl AsRef<Path>,
        settings: KnowledgeUpdateSettings,
    ) -> Result<(String, u64)> {
        let path = path.as_ref();
        let mut file = File::open(path).map_err(|e| SwarmKbError::CheckpointOpen {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let mut image = Vec::new();
        file.read_to_end(&mut image).map_err(|e| SwarmKbError::CheckpointIo {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        let mut reader = EntryReader::new(&image);
        let (id, count, file_clock) = decode_header(&mut reader)?;

        // One lock for the whole load: the batch applies atomically.
        let mut state = self.state.lock();
        for _ in 0..count {
            let (name, rec) = decode_entry(&mut reader)?;
            self.merge_external_inner(&mut state, &name, &rec, settings)?;
        }
        state.clock = state.clock.max(file_clock);

        tracing::debug!(
            path = %path.display(),
            entries = count,
            id = %id,
            "loaded context"
        );
        Ok((id, reader.pos as u64))
    }

    /// Save a textual dump, one `name = literal;` assignment per existing
    /// entry. Returns the number of bytes written.
    pub fn save_as_karl(&self, path: impl AsRef<Path>) -> Result<u64> {
        let path = path.as_ref();
        let state = self.state.lock();

        let mut out = String::new();
        for (name, rec) in state.map.iter() {
            if !rec.exists() {
                continue;
            }
            out.push_str(name);
            out.push_str(" = ");
            out.push_str(&rec.to_karl_literal());
            out.push_str(";\n");
        }

        let mut file = File::create(path).map_err(|e| SwarmKbError::CheckpointOpen {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        file.write_all(out.as_bytes()).map_err(|e| SwarmKbError::CheckpointIo {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Ok(out.len() as u64)
    }
}

// =============================================================================
// Tests
// =============================================================================
