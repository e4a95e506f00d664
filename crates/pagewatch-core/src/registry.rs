//! Authoritative mapping from variable id to watched-page metadata.
//!
//! The registry validates registrations, snapshots page bytes for
//! pre-images, and answers covering-range lookups for the enrichment
//! worker. Its mutex is never held across fault-channel calls: arming is
//! the caller's job, split into [`prepare`](VariableRegistry::prepare)
//! (validate + snapshot, no insertion) and
//! [`insert`](VariableRegistry::insert) (commit after arming succeeded),
//! so a failed arm simply drops the prepared descriptor.

use log::debug;
use pagewatch_events::{next_variable_id, MutationDepth, PageDescriptor, TrackFlags};
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("base address {base:#x} is not page-aligned")]
    Misaligned { base: usize },

    #[error("length {len} is zero or not a multiple of the page size")]
    BadLength { len: usize },

    #[error("snapshot length {got} does not match descriptor length {want}")]
    SnapshotLength { got: usize, want: usize },

    #[error("unknown variable id {0}")]
    UnknownId(String),
}

struct Entry {
    /// Registration order, for covering-lookup tie-breaks.
    seq: u64,
    desc: PageDescriptor,
}

struct Inner {
    entries: HashMap<String, Entry>,
    next_seq: u64,
}

/// Page bytes captured for one enrichment step: the stored pre-image and
/// the freshly read post-image, taken under a single lock hold so the
/// pre-image advance is atomic with the read.
pub struct CapturedImages {
    pub pre: Vec<u8>,
    pub post: Vec<u8>,
    pub flags: TrackFlags,
    pub depth: MutationDepth,
}

pub struct VariableRegistry {
    inner: Mutex<Inner>,
    page_size: usize,
}

impl VariableRegistry {
    pub fn new(page_size: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                next_seq: 0,
            }),
            page_size,
        }
    }

    /// Validate a registration and build its descriptor, reading the
    /// pre-image from the (caller-guaranteed mapped and readable) range.
    /// Nothing is inserted; commit with [`insert`] once the range is armed.
    pub fn prepare(
        &self,
        base: usize,
        len: usize,
        name: &str,
        flags: TrackFlags,
        depth: MutationDepth,
    ) -> Result<PageDescriptor, RegistryError> {
        if base == 0 || base % self.page_size != 0 {
            return Err(RegistryError::Misaligned { base });
        }
        if len == 0 || len % self.page_size != 0 {
            return Err(RegistryError::BadLength { len });
        }

        // SAFETY: the host guarantees the range stays mapped and readable
        // until unregistration returns.
        let pre_image = unsafe { std::slice::from_raw_parts(base as *const u8, len) }.to_vec();

        let registered_at_ns = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);

        Ok(PageDescriptor {
            variable_id: next_variable_id(),
            base,
            len,
            name: name.to_string(),
            flags,
            depth,
            pre_image,
            registered_at_ns,
        })
    }

    /// Commit a prepared descriptor, returning its variable id.
    pub fn insert(&self, desc: PageDescriptor) -> String {
        let id = desc.variable_id.clone();
        let mut inner = self.inner.lock().unwrap();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        debug!("registered {id} ({:#x}+{:#x})", desc.base, desc.len);
        inner.entries.insert(id.clone(), Entry { seq, desc });
        id
    }

    /// Remove a descriptor, returning it so the caller can disarm its
    /// range. `None` when the id is unknown.
    pub fn remove(&self, id: &str) -> Option<PageDescriptor> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.entries.remove(id)?;
        debug!("unregistered {id}");
        Some(entry.desc)
    }

    /// Copy of the stored pre-image, `None` when the id is unknown.
    pub fn read_snapshot(&self, id: &str) -> Option<Vec<u8>> {
        let inner = self.inner.lock().unwrap();
        inner.entries.get(id).map(|e| e.desc.pre_image.clone())
    }

    /// Replace the stored pre-image; the length must match the descriptor.
    pub fn write_snapshot(&self, id: &str, bytes: &[u8]) -> Result<(), RegistryError> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner
            .entries
            .get_mut(id)
            .ok_or_else(|| RegistryError::UnknownId(id.to_string()))?;
        if bytes.len() != entry.desc.len {
            return Err(RegistryError::SnapshotLength {
                got: bytes.len(),
                want: entry.desc.len,
            });
        }
        entry.desc.pre_image.clear();
        entry.desc.pre_image.extend_from_slice(bytes);
        Ok(())
    }

    /// Wholesale metadata replacement, preserving the variable id, the
    /// registration timestamp, and the registration order.
    pub fn update_metadata(&self, id: &str, mut desc: PageDescriptor) -> Result<(), RegistryError> {
        if desc.base == 0 || desc.base % self.page_size != 0 {
            return Err(RegistryError::Misaligned { base: desc.base });
        }
        if desc.len == 0 || desc.len % self.page_size != 0 {
            return Err(RegistryError::BadLength { len: desc.len });
        }
        if desc.pre_image.len() != desc.len {
            return Err(RegistryError::SnapshotLength {
                got: desc.pre_image.len(),
                want: desc.len,
            });
        }
        let mut inner = self.inner.lock().unwrap();
        let entry = inner
            .entries
            .get_mut(id)
            .ok_or_else(|| RegistryError::UnknownId(id.to_string()))?;
        desc.variable_id = entry.desc.variable_id.clone();
        desc.registered_at_ns = entry.desc.registered_at_ns;
        entry.desc = desc;
        Ok(())
    }

    /// Every variable id whose range contains `addr`, in registration
    /// order.
    pub fn lookup_covering(&self, addr: usize) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        let mut hits: Vec<(u64, String)> = inner
            .entries
            .values()
            .filter(|e| e.desc.covers(addr))
            .map(|e| (e.seq, e.desc.variable_id.clone()))
            .collect();
        hits.sort_by_key(|(seq, _)| *seq);
        hits.into_iter().map(|(_, id)| id).collect()
    }

    /// Read the current range bytes and advance the stored pre-image to
    /// them in one atomic step, returning both images for delta
    /// computation. `None` when the id is unknown.
    pub fn capture_and_advance(&self, id: &str) -> Option<CapturedImages> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.entries.get_mut(id)?;
        let desc = &mut entry.desc;
        // SAFETY: host contract — the range is mapped and readable for the
        // watch lifetime, and this entry is still registered.
        let post =
            unsafe { std::slice::from_raw_parts(desc.base as *const u8, desc.len) }.to_vec();
        let pre = std::mem::replace(&mut desc.pre_image, post.clone());
        Some(CapturedImages {
            pre,
            post,
            flags: desc.flags,
            depth: desc.depth,
        })
    }

    /// Armed-range view for lifecycle transitions: (base, len) per
    /// registered descriptor.
    pub fn ranges(&self) -> Vec<(usize, usize)> {
        let inner = self.inner.lock().unwrap();
        inner
            .entries
            .values()
            .map(|e| (e.desc.base, e.desc.len))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
