//! Mutation event types and the byte-delta algebra.
//!
//! [`FastPathEvent`] is the minimal record built inside the fault handler;
//! [`EnrichedEvent`] is what the enrichment stage hands to sinks. The JSON
//! wire format keeps addresses as `"0x..."` hex strings and byte payloads
//! as base64 so events survive any text transport.

use serde::{Deserialize, Serialize};
use std::fmt;

// ═══════════════════════════════════════════════════════════════════════
//  Wire-format helpers
// ═══════════════════════════════════════════════════════════════════════

/// Base64 (standard alphabet) for byte payloads.
pub(crate) mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(de)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}

/// Addresses as `"0x..."` hex strings.
mod hex_addr {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(addr: &usize, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&format!("{addr:#x}"))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<usize, D::Error> {
        let text = String::deserialize(de)?;
        let digits = text.strip_prefix("0x").unwrap_or(&text);
        usize::from_str_radix(digits, 16).map_err(serde::de::Error::custom)
    }
}

/// Event ids as `"evt-<n>"` strings.
mod evt_id {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(id: &u64, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&format!("evt-{id}"))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<u64, D::Error> {
        let text = String::deserialize(de)?;
        let digits = text.strip_prefix("evt-").unwrap_or(&text);
        digits.parse().map_err(serde::de::Error::custom)
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Fast-path event
// ═══════════════════════════════════════════════════════════════════════

/// Minimal record built at fault time, before the faulting writer is
/// unblocked. Everything expensive is deferred to enrichment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FastPathEvent {
    /// Monotonic per-process event id.
    #[serde(with = "evt_id")]
    pub event_id: u64,
    /// Wall-clock fault time, nanoseconds since the Unix epoch. Read once
    /// per fault.
    pub timestamp_ns: u64,
    /// Base of the faulting page (fault address masked to page size).
    #[serde(with = "hex_addr")]
    pub page_base: usize,
    /// Exact faulting address.
    #[serde(with = "hex_addr")]
    pub fault_addr: usize,
    /// Kernel thread id of the faulting task.
    pub tid: u32,
    /// Instruction pointer of the faulting instruction, 0 if unrecoverable.
    pub ip: u64,
}

impl fmt::Display for FastPathEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "evt-{} tid={} addr={:#x} ip={:#x}",
            self.event_id, self.tid, self.fault_addr, self.ip
        )
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Deltas
// ═══════════════════════════════════════════════════════════════════════

/// One maximal run of differing bytes between pre- and post-image.
///
/// `old` and `new` are always the same non-zero length; runs are disjoint
/// and sorted by offset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delta {
    pub offset: usize,
    #[serde(with = "b64")]
    pub old: Vec<u8>,
    #[serde(with = "b64")]
    pub new: Vec<u8>,
}

/// Compute the differing runs between `pre` and `post`, considering only
/// the first `depth` bytes. Consecutive differing bytes coalesce into one
/// maximal run.
pub fn compute_deltas(pre: &[u8], post: &[u8], depth: usize) -> Vec<Delta> {
    let limit = depth.min(pre.len()).min(post.len());
    let mut deltas = Vec::new();
    let mut i = 0;
    while i < limit {
        if pre[i] == post[i] {
            i += 1;
            continue;
        }
        let start = i;
        while i < limit && pre[i] != post[i] {
            i += 1;
        }
        deltas.push(Delta {
            offset: start,
            old: pre[start..i].to_vec(),
            new: post[start..i].to_vec(),
        });
    }
    deltas
}

/// Apply `deltas` to a copy of `pre`, reconstructing the post-image within
/// the depth the deltas were computed over.
pub fn apply_deltas(pre: &[u8], deltas: &[Delta]) -> Vec<u8> {
    let mut out = pre.to_vec();
    for delta in deltas {
        let end = (delta.offset + delta.new.len()).min(out.len());
        out[delta.offset..end].copy_from_slice(&delta.new[..end - delta.offset]);
    }
    out
}

// ═══════════════════════════════════════════════════════════════════════
//  Enriched event
// ═══════════════════════════════════════════════════════════════════════

/// A fast-path event after the enrichment stage: post-image captured,
/// deltas computed, instruction pointer symbolized, covering variables
/// resolved.
///
/// When the covering variable was unregistered between fault and
/// enrichment, `variable_ids`, snapshots, and `deltas` are empty — the
/// consumer can still correlate by `fault_addr`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedEvent {
    #[serde(flatten)]
    pub fast: FastPathEvent,
    /// Resolved symbol name, `"??"` when unresolved.
    pub symbol: String,
    /// Source file path, empty when unknown.
    pub file: String,
    /// Source line, 0 when unknown.
    pub line: u32,
    /// Range bytes before the observed mutation.
    #[serde(with = "b64")]
    pub pre_snapshot: Vec<u8>,
    /// Range bytes captured during enrichment.
    #[serde(with = "b64")]
    pub post_snapshot: Vec<u8>,
    /// Differing runs within the variable's mutation depth.
    pub deltas: Vec<Delta>,
    /// Every registered variable whose range covers the fault address, in
    /// registration order.
    pub variable_ids: Vec<String>,
    /// Host-supplied SQL context id, when the variable tracks SQL.
    pub sql_context_id: Option<String>,
    /// Resolver-provided source-local names, when the variable tracks them.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub locals: Vec<String>,
}

impl fmt::Display for EnrichedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} deltas={} vars={}",
            self.fast,
            self.symbol,
            if self.file.is_empty() { "?" } else { self.file.as_str() },
            self.deltas.len(),
            self.variable_ids.len()
        )
    }
}
