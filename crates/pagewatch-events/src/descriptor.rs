//! Page registration metadata: tracking flags, mutation depth, descriptors.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

// ═══════════════════════════════════════════════════════════════════════
//  Tracking flags
// ═══════════════════════════════════════════════════════════════════════

/// Per-variable tracking options, encoded as a flag word.
///
/// `THREADS` is effectively always on — the faulting thread id is part of
/// every event. `SQL` attaches the host-supplied SQL context id, `LOCALS`
/// attaches resolver-provided source-local names, and `ALL` enables every
/// optional enrichment.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TrackFlags(u32);

impl TrackFlags {
    pub const THREADS: TrackFlags = TrackFlags(1 << 0);
    pub const SQL: TrackFlags = TrackFlags(1 << 1);
    pub const ALL: TrackFlags = TrackFlags(1 << 2);
    pub const LOCALS: TrackFlags = TrackFlags(1 << 3);

    pub const fn empty() -> Self {
        TrackFlags(0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: TrackFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether events for this variable should carry the SQL context id.
    pub const fn tracks_sql(self) -> bool {
        self.contains(Self::SQL) || self.contains(Self::ALL)
    }

    /// Whether events for this variable should carry source-local names.
    pub const fn tracks_locals(self) -> bool {
        self.contains(Self::LOCALS) || self.contains(Self::ALL)
    }
}

impl std::ops::BitOr for TrackFlags {
    type Output = TrackFlags;

    fn bitor(self, rhs: TrackFlags) -> TrackFlags {
        TrackFlags(self.0 | rhs.0)
    }
}

impl fmt::Display for TrackFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.contains(Self::THREADS) {
            names.push("threads");
        }
        if self.contains(Self::SQL) {
            names.push("sql");
        }
        if self.contains(Self::ALL) {
            names.push("all");
        }
        if self.contains(Self::LOCALS) {
            names.push("locals");
        }
        write!(f, "{}", names.join("|"))
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Mutation depth
// ═══════════════════════════════════════════════════════════════════════

/// How many bytes from the start of a watched range participate in delta
/// computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "bytes", rename_all = "snake_case")]
pub enum MutationDepth {
    /// Diff the entire watched range.
    WholePage,
    /// Diff only the first N bytes; mutations beyond are ignored.
    FirstBytes(usize),
}

impl MutationDepth {
    /// Number of bytes to diff for a range of `len` bytes.
    pub fn effective_len(self, len: usize) -> usize {
        match self {
            MutationDepth::WholePage => len,
            MutationDepth::FirstBytes(n) => n.min(len),
        }
    }
}

impl Default for MutationDepth {
    fn default() -> Self {
        MutationDepth::WholePage
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Page descriptor
// ═══════════════════════════════════════════════════════════════════════

/// Registration record for one watched page range.
///
/// The pre-image snapshot is the range's bytes as of arming time; the
/// enrichment stage advances it to the latest post-image after every
/// observed mutation so successive events diff against the most recent
/// known state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageDescriptor {
    /// Opaque process-local id, unique for the process lifetime.
    pub variable_id: String,
    /// Base address, aligned to the system page size.
    pub base: usize,
    /// Range length in bytes, a positive multiple of the page size.
    pub len: usize,
    /// Human-readable variable name supplied at registration.
    pub name: String,
    /// Tracking options.
    pub flags: TrackFlags,
    /// Delta computation bound.
    pub depth: MutationDepth,
    /// Range bytes at arming time; always exactly `len` bytes.
    #[serde(with = "crate::event::b64")]
    pub pre_image: Vec<u8>,
    /// Wall-clock registration time, nanoseconds since the Unix epoch.
    pub registered_at_ns: u64,
}

impl PageDescriptor {
    /// Whether `addr` falls inside this descriptor's range.
    pub fn covers(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.base + self.len
    }
}

/// Generate a fresh variable id.
///
/// Format is `var-<epoch-nanos>-<counter>`; the counter makes ids unique
/// even when two registrations land on the same clock reading.
pub fn next_variable_id() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    format!("var-{}-{}", nanos, COUNTER.fetch_add(1, Ordering::Relaxed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_contain_and_union() {
        let flags = TrackFlags::THREADS | TrackFlags::SQL;
        assert!(flags.contains(TrackFlags::THREADS));
        assert!(flags.contains(TrackFlags::SQL));
        assert!(!flags.contains(TrackFlags::LOCALS));
        assert!(flags.tracks_sql());
        assert!(!flags.tracks_locals());
    }

    #[test]
    fn all_enables_optional_enrichment() {
        let flags = TrackFlags::ALL;
        assert!(flags.tracks_sql());
        assert!(flags.tracks_locals());
    }

    #[test]
    fn depth_effective_len() {
        assert_eq!(MutationDepth::WholePage.effective_len(4096), 4096);
        assert_eq!(MutationDepth::FirstBytes(64).effective_len(4096), 64);
        assert_eq!(MutationDepth::FirstBytes(9999).effective_len(4096), 4096);
    }

    #[test]
    fn variable_ids_are_unique() {
        let a = next_variable_id();
        let b = next_variable_id();
        assert_ne!(a, b);
        assert!(a.starts_with("var-"));
    }

    #[test]
    fn descriptor_covers() {
        let desc = PageDescriptor {
            variable_id: next_variable_id(),
            base: 0x1000,
            len: 0x2000,
            name: "buf".to_string(),
            flags: TrackFlags::THREADS,
            depth: MutationDepth::WholePage,
            pre_image: vec![0; 0x2000],
            registered_at_ns: 0,
        };
        assert!(desc.covers(0x1000));
        assert!(desc.covers(0x2fff));
        assert!(!desc.covers(0x3000));
        assert!(!desc.covers(0xfff));
    }

    #[test]
    fn descriptor_json_round_trip() {
        let desc = PageDescriptor {
            variable_id: "var-1-0".to_string(),
            base: 0x7000,
            len: 4096,
            name: "counter".to_string(),
            flags: TrackFlags::SQL,
            depth: MutationDepth::FirstBytes(16),
            pre_image: vec![0xab; 4096],
            registered_at_ns: 123,
        };
        let json = serde_json::to_string(&desc).unwrap();
        let back: PageDescriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(back.variable_id, desc.variable_id);
        assert_eq!(back.pre_image, desc.pre_image);
        assert_eq!(back.depth, desc.depth);
    }
}
